//! The hot-restart handoff: a child inherits the parent's listen socket,
//! the parent drains and terminates, service never drops.

use std::io::Read;
use std::net::TcpStream;
use std::time::{Duration, Instant};

use crate::helpers::{echo_round_trip, find_free_port, ServerOptions, TestServer};

fn handoff_config(port: u16) -> String {
    format!(
        r#"{{
            "admin": {{"address": "tcp://127.0.0.1:0"}},
            "listeners": [{{"address": "tcp://127.0.0.1:{port}", "filter": "echo"}}],
            "stats_flush_interval_ms": 200,
            "drain_time_s": 1,
            "parent_shutdown_time_s": 2
        }}"#,
    )
}

#[test]
fn child_takes_over_and_parent_drains_out() {
    let shared = tempfile::tempdir().unwrap();
    let port = find_free_port();
    let config = handoff_config(port);

    let mut parent = TestServer::start_with(ServerOptions {
        config: config.clone(),
        restart_epoch: 0,
        base_dir: Some(shared.path().to_path_buf()),
        ..Default::default()
    });
    echo_round_trip(port);
    let parent_admin = parent.admin;

    // a connection held open across the restart; the parent's drain ramp
    // should close it shortly after the child takes over
    let mut held = TcpStream::connect(("127.0.0.1", port)).unwrap();
    held.set_read_timeout(Some(Duration::from_secs(10))).unwrap();

    let started_parent = Instant::now();
    // let the parent age: the child's inherited original_start_time is
    // only distinguishable from its own start time if they differ
    std::thread::sleep(Duration::from_secs(3));

    let child = TestServer::start_with(ServerOptions {
        config,
        restart_epoch: 1,
        base_dir: Some(shared.path().to_path_buf()),
        ..Default::default()
    });

    // service continues on the same port, now through the inherited
    // descriptor
    echo_round_trip(port);

    // the parent terminates once the child's parent-shutdown timer fires
    let status = parent.wait_exit(Duration::from_secs(10));
    assert_eq!(status.code(), Some(0), "parent exit status");

    // the parent's admin is gone (closed before the child opened its own)
    let response = crate::helpers::http_request(parent_admin, "GET", "/healthcheck");
    assert!(
        response.contains("connect error") || response.is_empty(),
        "parent admin still answering: {response}"
    );

    // the held connection was drained: EOF, not an error
    let mut buf = [0u8; 1];
    match held.read(&mut buf) {
        Ok(0) => {}
        other => panic!("expected drain to close the held connection, got {other:?}"),
    }

    // the child keeps serving and inherited the parent's start time, so
    // its uptime covers the parent's whole lifetime, not just its own
    echo_round_trip(port);
    let elapsed = started_parent.elapsed().as_secs();
    let info = child.admin_get("/server_info");
    let uptime = uptime_from(&info);
    assert!(
        uptime + 1 >= elapsed,
        "child uptime {uptime}s does not cover the parent's lifetime ({elapsed}s): {info}"
    );
    assert!(info.contains("\"restart_epoch\": 1"), "{info}");
}

#[test]
fn child_without_a_parent_starts_fresh() {
    // epoch 3 with no epoch-2 process: every parent call degrades to a
    // fresh start
    let port = find_free_port();
    let mut server = TestServer::start_with(ServerOptions {
        config: handoff_config(port),
        restart_epoch: 3,
        ..Default::default()
    });

    echo_round_trip(port);
    let info = server.admin_get("/server_info");
    assert!(info.contains("\"restart_epoch\": 3"), "{info}");

    server.sigterm();
    assert_eq!(server.wait_exit(Duration::from_secs(5)).code(), Some(0));
}

fn uptime_from(server_info: &str) -> u64 {
    let body_start = server_info.find("{").unwrap_or(0);
    let parsed: serde_json::Value =
        serde_json::from_str(server_info[body_start..].trim()).unwrap_or_default();
    parsed["uptime_seconds"].as_u64().unwrap_or(0)
}
