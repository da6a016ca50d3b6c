//! Test helpers for spawning a gantry-server and talking to its admin
//! endpoint.

#![allow(dead_code)]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::path::PathBuf;
use std::process::{Child, Command, ExitStatus, Stdio};
use std::time::{Duration, Instant};

/// A gantry-server subprocess managed by the test harness.
pub struct TestServer {
    child: Child,
    pub admin: SocketAddr,
    /// Scratch directory; dropped (and deleted) with the server unless
    /// shared through [`ServerOptions::base_dir`].
    _dir: Option<tempfile::TempDir>,
}

/// Options for starting a test server.
pub struct ServerOptions {
    /// JSON configuration contents.
    pub config: String,
    pub concurrency: usize,
    pub restart_epoch: u32,
    /// Shared directory for config + hot-restart sockets. Hot-restart
    /// pairs must point at the same one; `None` gets a private tempdir.
    pub base_dir: Option<PathBuf>,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            config: r#"{"admin": {"address": "tcp://127.0.0.1:0"}}"#.to_owned(),
            concurrency: 1,
            restart_epoch: 0,
            base_dir: None,
        }
    }
}

impl TestServer {
    /// Starts a server with an empty listener set on a random admin port.
    pub fn start() -> Self {
        Self::start_with(ServerOptions::default())
    }

    /// Starts a server and blocks until its admin endpoint answers
    /// (up to 10 seconds).
    pub fn start_with(opts: ServerOptions) -> Self {
        let (dir, root) = match &opts.base_dir {
            Some(path) => {
                std::fs::create_dir_all(path).unwrap();
                (None, path.clone())
            }
            None => {
                let dir = tempfile::tempdir().unwrap();
                let root = dir.path().to_path_buf();
                (Some(dir), root)
            }
        };

        let config_path = root.join(format!("server_{}.json", opts.restart_epoch));
        std::fs::write(&config_path, &opts.config).unwrap();
        let admin_address_path = root.join(format!("admin_{}.addr", opts.restart_epoch));

        let mut cmd = Command::new(server_binary());
        cmd.arg("--config-path").arg(&config_path);
        cmd.arg("--concurrency").arg(opts.concurrency.to_string());
        cmd.arg("--restart-epoch").arg(opts.restart_epoch.to_string());
        cmd.arg("--base-dir").arg(root.join("restart"));
        cmd.arg("--admin-address-path").arg(&admin_address_path);
        cmd.arg("--file-flush-interval-ms").arg("100");
        // suppress tracing output in tests
        cmd.env("RUST_LOG", "error");

        let child = cmd
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap_or_else(|e| panic!("failed to spawn gantry-server: {e}"));

        let admin = await_admin(&admin_address_path);
        Self {
            child,
            admin,
            _dir: dir,
        }
    }

    /// Spawns with the given config and waits for the process to exit,
    /// returning its status. For configurations expected to fail fast.
    pub fn run_to_exit(config: &str) -> ExitStatus {
        let dir = tempfile::tempdir().unwrap();
        let config_path = dir.path().join("server.json");
        std::fs::write(&config_path, config).unwrap();

        let mut child = Command::new(server_binary())
            .arg("--config-path")
            .arg(&config_path)
            .arg("--base-dir")
            .arg(dir.path().join("restart"))
            .env("RUST_LOG", "error")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .unwrap();

        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            if let Some(status) = child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() > deadline {
                let _ = child.kill();
                panic!("server did not exit within 10 seconds");
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    /// Sends SIGTERM to the server process.
    pub fn sigterm(&self) {
        unsafe {
            libc::kill(self.child.id() as libc::pid_t, libc::SIGTERM);
        }
    }

    /// Waits for the process to exit, up to `timeout`.
    pub fn wait_exit(&mut self, timeout: Duration) -> ExitStatus {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(status) = self.child.try_wait().unwrap() {
                return status;
            }
            if Instant::now() > deadline {
                let _ = self.child.kill();
                panic!("server did not exit within {timeout:?}");
            }
            std::thread::sleep(Duration::from_millis(25));
        }
    }

    /// Raw HTTP GET against the admin endpoint; returns the full
    /// response (status line included).
    pub fn admin_get(&self, path: &str) -> String {
        http_request(self.admin, "GET", path)
    }

    /// Raw HTTP POST against the admin endpoint.
    pub fn admin_post(&self, path: &str) -> String {
        http_request(self.admin, "POST", path)
    }

    /// Polls the admin endpoint until `predicate` passes (10 s cap).
    pub fn admin_get_until(&self, path: &str, predicate: impl Fn(&str) -> bool) -> String {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let response = self.admin_get(path);
            if predicate(&response) {
                return response;
            }
            if Instant::now() > deadline {
                panic!("admin {path} never matched; last response:\n{response}");
            }
            std::thread::sleep(Duration::from_millis(50));
        }
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        let _ = self.child.kill();
        let _ = self.child.wait();
    }
}

fn await_admin(address_path: &std::path::Path) -> SocketAddr {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if Instant::now() > deadline {
            panic!("gantry-server failed to publish its admin address");
        }
        if let Ok(contents) = std::fs::read_to_string(address_path) {
            if let Ok(address) = contents.trim().parse::<SocketAddr>() {
                if TcpStream::connect(address).is_ok() {
                    return address;
                }
            }
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

pub fn http_request(address: SocketAddr, method: &str, path: &str) -> String {
    let mut stream = match TcpStream::connect(address) {
        Ok(stream) => stream,
        Err(error) => return format!("<connect error: {error}>"),
    };
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    write!(
        stream,
        "{method} {path} HTTP/1.1\r\nHost: admin\r\nConnection: close\r\n\r\n"
    )
    .unwrap();
    let mut response = String::new();
    let _ = stream.read_to_string(&mut response);
    response
}

/// Grabs a port that was free a moment ago. Racy by nature; fine for
/// tests that need a fixed data-listener port in a config file.
pub fn find_free_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

/// One echo round trip against a data listener, with retries while the
/// workers come up.
pub fn echo_round_trip(port: u16) {
    let deadline = Instant::now() + Duration::from_secs(10);
    loop {
        if let Ok(mut stream) = TcpStream::connect(("127.0.0.1", port)) {
            stream
                .set_read_timeout(Some(Duration::from_millis(300)))
                .unwrap();
            if stream.write_all(b"ping").is_ok() {
                let mut buf = [0u8; 4];
                if stream.read_exact(&mut buf).is_ok() {
                    assert_eq!(&buf, b"ping");
                    return;
                }
            }
        }
        if Instant::now() > deadline {
            panic!("echo listener on port {port} never answered");
        }
        std::thread::sleep(Duration::from_millis(50));
    }
}

/// Locates the gantry-server binary in the cargo target directory.
fn server_binary() -> PathBuf {
    let mut path = std::env::current_exe().unwrap();
    // test binary lives in target/debug/deps/ — go up to target/debug/
    path.pop();
    if path.ends_with("deps") {
        path.pop();
    }
    path.push("gantry-server");
    if !path.exists() {
        panic!(
            "gantry-server binary not found. run `cargo build` first.\nlooked at: {}",
            path.display()
        );
    }
    path
}
