//! Admin HTTP endpoint.
//!
//! The admin surface is just another listener on the main loop whose
//! filter chain is a hyper HTTP/1 service, so it shares the accept,
//! accounting, and drain plumbing with every data listener. Handlers are
//! synchronous reads of main-thread state — the admin can answer even
//! while workers are saturated.
//!
//! Mutating endpoints require POST; `/quitquitquit` funnels into the same
//! SIGTERM-to-self path as every other shutdown trigger.

use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Response, StatusCode};
use hyper_util::rt::TokioIo;
use tokio::net::TcpStream;
use tracing::debug;

use crate::access_log::AccessLogFile;
use crate::filter::{ConnectionFuture, FilterChainFactory};

/// The slice of server state the admin endpoint is allowed to touch.
pub trait AdminApi {
    /// All used stats as `name: value` lines.
    fn stats_text(&self) -> String;
    /// Orderly process shutdown.
    fn shutdown(&self);
    /// Force the health check to fail (or recover).
    fn fail_healthcheck(&self, fail: bool);
    fn health_check_failed(&self) -> bool;
    fn hot_restart_version(&self) -> String;
    fn server_info(&self) -> serde_json::Value;
}

/// Filter-chain factory serving the admin API on each accepted
/// connection.
pub struct AdminFactory {
    api: Rc<dyn AdminApi>,
    access_log: Option<Arc<AccessLogFile>>,
}

impl AdminFactory {
    pub fn new(api: Rc<dyn AdminApi>, access_log: Option<Arc<AccessLogFile>>) -> Self {
        Self { api, access_log }
    }
}

impl FilterChainFactory for AdminFactory {
    fn name(&self) -> &str {
        "admin"
    }

    fn create(&self, stream: TcpStream, peer: SocketAddr) -> ConnectionFuture {
        let api = Rc::clone(&self.api);
        let access_log = self.access_log.clone();
        Box::pin(async move {
            let service = service_fn(move |request| {
                let api = Rc::clone(&api);
                let access_log = access_log.clone();
                async move {
                    let method = request.method().as_str().to_owned();
                    let path = request.uri().path().to_owned();
                    let (status, content_type, body) = route(api.as_ref(), &method, &path);
                    if let Some(log) = &access_log {
                        log.write_line(&format!("{method} {path} {}", status.as_u16()));
                    }
                    let response = Response::builder()
                        .status(status)
                        .header("content-type", content_type)
                        .body(Full::new(Bytes::from(body)))
                        .expect("static response builder never fails");
                    Ok::<_, std::convert::Infallible>(response)
                }
            });

            debug!(%peer, "admin connection");
            http1::Builder::new()
                .serve_connection(TokioIo::new(stream), service)
                .await
                .map_err(std::io::Error::other)
        })
    }
}

const TEXT: &str = "text/plain; charset=utf-8";
const JSON: &str = "application/json";

fn route(api: &dyn AdminApi, method: &str, path: &str) -> (StatusCode, &'static str, String) {
    match (method, path) {
        ("GET", "/stats") => (StatusCode::OK, TEXT, api.stats_text()),

        ("POST", "/quitquitquit") => {
            api.shutdown();
            (StatusCode::OK, TEXT, "OK\n".to_owned())
        }

        ("POST", "/healthcheck/fail") => {
            api.fail_healthcheck(true);
            (StatusCode::OK, TEXT, "OK\n".to_owned())
        }

        ("POST", "/healthcheck/ok") => {
            api.fail_healthcheck(false);
            (StatusCode::OK, TEXT, "OK\n".to_owned())
        }

        ("GET", "/healthcheck") => {
            if api.health_check_failed() {
                (StatusCode::SERVICE_UNAVAILABLE, TEXT, "FAIL\n".to_owned())
            } else {
                (StatusCode::OK, TEXT, "LIVE\n".to_owned())
            }
        }

        ("GET", "/hot_restart_version") => {
            (StatusCode::OK, TEXT, format!("{}\n", api.hot_restart_version()))
        }

        ("GET", "/server_info") => (
            StatusCode::OK,
            JSON,
            format!("{:#}\n", api.server_info()),
        ),

        (_, "/quitquitquit" | "/healthcheck/fail" | "/healthcheck/ok") => (
            StatusCode::BAD_REQUEST,
            TEXT,
            "method not allowed, use POST\n".to_owned(),
        ),

        _ => (StatusCode::NOT_FOUND, TEXT, "not found\n".to_owned()),
    }
}
