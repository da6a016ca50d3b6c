//! Admin endpoint surface.

use crate::helpers::TestServer;

#[test]
fn server_info_reports_liveness_and_epoch() {
    let server = TestServer::start();

    let info = server.admin_get("/server_info");
    assert!(info.contains("200"), "bad response: {info}");
    assert!(info.contains("\"state\": \"LIVE\""));
    assert!(info.contains("\"restart_epoch\": 0"));
    assert!(info.contains("\"healthy\": true"));
}

#[test]
fn hot_restart_version_is_stable() {
    let server = TestServer::start();
    let response = server.admin_get("/hot_restart_version");
    assert!(response.contains("gantry.restart.v1"), "{response}");
}

#[test]
fn health_toggles_through_fail_and_ok() {
    let server = TestServer::start();

    assert!(server.admin_get("/healthcheck").contains("200"));

    server.admin_post("/healthcheck/fail");
    assert!(server.admin_get("/healthcheck").contains("503"));
    let info = server.admin_get("/server_info");
    assert!(info.contains("\"healthy\": false"), "{info}");

    server.admin_post("/healthcheck/ok");
    assert!(server.admin_get("/healthcheck").contains("200"));
}

#[test]
fn stats_lists_used_server_gauges() {
    let server = TestServer::start();
    let stats = server.admin_get("/stats");
    assert!(stats.contains("server.live: 1"), "{stats}");
    assert!(stats.contains("server.version: "), "{stats}");
    assert!(stats.contains("server.concurrency: 1"), "{stats}");
}

#[test]
fn unknown_paths_are_not_found() {
    let server = TestServer::start();
    let response = server.admin_get("/clusters/teapot");
    assert!(response.contains("404"), "{response}");
}
