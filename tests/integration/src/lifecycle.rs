//! Start-up and shutdown paths.

use std::time::Duration;

use crate::helpers::{find_free_port, ServerOptions, TestServer};

#[test]
fn empty_config_with_two_workers_exits_zero_on_sigterm() {
    let mut server = TestServer::start_with(ServerOptions {
        config: r#"{
            "admin": {"address": "tcp://127.0.0.1:0"},
            "stats_flush_interval_ms": 200
        }"#
        .to_owned(),
        concurrency: 2,
        ..Default::default()
    });

    let health = server.admin_get("/healthcheck");
    assert!(health.contains("200"), "unexpected health: {health}");

    // the concurrency gauge confirms both workers were constructed, and
    // total_connections settles at zero after the first flush
    let stats = server.admin_get_until("/stats", |s| s.contains("server.total_connections: 0"));
    assert!(stats.contains("server.concurrency: 2"), "stats:\n{stats}");

    server.sigterm();
    let status = server.wait_exit(Duration::from_secs(5));
    assert_eq!(status.code(), Some(0));
}

#[test]
fn quitquitquit_is_a_clean_exit() {
    let mut server = TestServer::start();

    // mutating endpoint demands POST
    let response = server.admin_get("/quitquitquit");
    assert!(response.contains("400"), "GET should be rejected: {response}");

    let response = server.admin_post("/quitquitquit");
    assert!(response.contains("200"), "POST failed: {response}");

    let status = server.wait_exit(Duration::from_secs(5));
    assert_eq!(status.code(), Some(0));
}

#[test]
fn unparseable_config_exits_one() {
    let status = TestServer::run_to_exit("this is not json");
    assert_eq!(status.code(), Some(1));
}

#[test]
fn invalid_listener_address_exits_one() {
    let status = TestServer::run_to_exit(
        r#"{
            "admin": {"address": "tcp://127.0.0.1:0"},
            "listeners": [{"address": "unix:///tmp/nope.sock"}]
        }"#,
    );
    assert_eq!(status.code(), Some(1));
}

#[test]
fn held_port_fails_bind_and_exits_one() {
    // a third process (this test) holds the port with a live listener
    let holder = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = holder.local_addr().unwrap().port();

    let status = TestServer::run_to_exit(&format!(
        r#"{{
            "admin": {{"address": "tcp://127.0.0.1:0"}},
            "listeners": [{{"address": "tcp://127.0.0.1:{port}"}}]
        }}"#,
    ));
    assert_eq!(status.code(), Some(1));
}

#[test]
fn workers_serve_the_echo_listener() {
    let port = find_free_port();
    let mut server = TestServer::start_with(ServerOptions {
        config: format!(
            r#"{{
                "admin": {{"address": "tcp://127.0.0.1:0"}},
                "listeners": [{{"address": "tcp://127.0.0.1:{port}", "filter": "echo"}}]
            }}"#,
        ),
        concurrency: 2,
        ..Default::default()
    });

    crate::helpers::echo_round_trip(port);

    server.sigterm();
    assert_eq!(server.wait_exit(Duration::from_secs(5)).code(), Some(0));
}

#[test]
fn drain_flag_file_starts_with_failing_health() {
    let dir = tempfile::tempdir().unwrap();
    let flags = dir.path().join("flags");
    std::fs::create_dir_all(&flags).unwrap();
    std::fs::write(flags.join("drain"), "").unwrap();

    let server = TestServer::start_with(ServerOptions {
        config: format!(
            r#"{{
                "admin": {{"address": "tcp://127.0.0.1:0"}},
                "flags_path": "{}"
            }}"#,
            flags.display()
        ),
        ..Default::default()
    });

    let health = server.admin_get("/healthcheck");
    assert!(health.contains("503"), "expected drain mode: {health}");

    // operator can bring it back
    server.admin_post("/healthcheck/ok");
    let health = server.admin_get("/healthcheck");
    assert!(health.contains("200"), "expected recovery: {health}");
}
