//! Server configuration: CLI options and the JSON configuration file.
//!
//! Listener and admin addresses use the `tcp://ip:port` URL form so the
//! same strings travel through hot-restart socket duplication unchanged.
//! Data listeners must be IP listeners — the socket map that hot restart
//! hands between processes is keyed on them, and Unix-domain listeners
//! don't participate.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use gantry_core::watchdog::GuardDogConfig;
use serde::Deserialize;

use crate::error::ServerError;

/// Command-line surface consumed by the core.
#[derive(Debug, Clone)]
pub struct Options {
    pub config_path: PathBuf,
    /// Hot-restart generation. Epoch N inherits from epoch N−1.
    pub restart_epoch: u32,
    /// Directory for hot-restart domain sockets.
    pub base_dir: PathBuf,
    /// Worker thread count; clamped to at least 1.
    pub concurrency: usize,
    /// When set, the resolved admin address is written here at start-up.
    pub admin_address_path: Option<PathBuf>,
    /// How often buffered access logs are flushed to disk.
    pub file_flush_interval: Duration,
}

/// Stable identity handle for a configured listener. Sockets are keyed by
/// this, never by address — two listeners on one address stay distinct.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(pub u64);

/// Immutable per-address listener description.
#[derive(Debug)]
pub struct ListenerConfig {
    pub id: ListenerId,
    pub address: SocketAddr,
    pub bind_to_port: bool,
    pub use_original_dst: bool,
    /// Name of the filter chain each worker instantiates for this
    /// listener.
    pub filter: String,
}

impl ListenerConfig {
    /// The `tcp://` URL used as the hot-restart duplication key.
    pub fn url(&self) -> String {
        format!("tcp://{}", self.address)
    }
}

/// Admin listener settings.
#[derive(Debug, Clone)]
pub struct AdminConfig {
    pub address: SocketAddr,
    pub access_log_path: Option<PathBuf>,
}

/// Upstream cluster flavors the server hosts init targets for.
#[derive(Debug, Clone)]
pub enum ClusterKind {
    /// A fixed endpoint; initialization completes synchronously.
    Static { address: SocketAddr },
    /// Resolved once via DNS before workers start.
    StrictDns { hostname: String, port: u16 },
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub name: String,
    pub kind: ClusterKind,
}

/// Guard-dog margins, parsed from milliseconds; zero disables a stage.
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub miss_margin: Duration,
    pub megamiss_margin: Duration,
    pub kill_timeout: Option<Duration>,
    pub multikill_timeout: Option<Duration>,
}

impl WatchdogConfig {
    pub fn to_guard_config(&self) -> GuardDogConfig {
        GuardDogConfig {
            miss_margin: self.miss_margin,
            megamiss_margin: self.megamiss_margin,
            kill_timeout: self.kill_timeout,
            multikill_timeout: self.multikill_timeout,
        }
    }

    /// Interval at which guarded loops touch their watchdog.
    pub fn touch_interval(&self) -> Duration {
        (self.miss_margin / 2).max(Duration::from_millis(10))
    }
}

/// Fully validated server configuration.
#[derive(Debug)]
pub struct ServerConfig {
    pub listeners: Vec<Arc<ListenerConfig>>,
    pub admin: AdminConfig,
    pub flags_path: Option<PathBuf>,
    pub stats_flush_interval: Duration,
    pub drain_time: Duration,
    pub parent_shutdown_time: Duration,
    pub statsd_udp_address: Option<SocketAddr>,
    pub watchdog: WatchdogConfig,
    pub clusters: Vec<ClusterConfig>,
    pub runtime_path: Option<PathBuf>,
}

// Raw serde shapes; validation happens in the conversion below.

fn default_true() -> bool {
    true
}

fn default_filter() -> String {
    "echo".to_owned()
}

fn default_stats_flush_interval_ms() -> u64 {
    5_000
}

fn default_drain_time_s() -> u64 {
    600
}

fn default_parent_shutdown_time_s() -> u64 {
    900
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    #[serde(default)]
    listeners: Vec<RawListener>,
    admin: RawAdmin,
    #[serde(default)]
    flags_path: Option<PathBuf>,
    #[serde(default = "default_stats_flush_interval_ms")]
    stats_flush_interval_ms: u64,
    #[serde(default = "default_drain_time_s")]
    drain_time_s: u64,
    #[serde(default = "default_parent_shutdown_time_s")]
    parent_shutdown_time_s: u64,
    #[serde(default)]
    statsd_udp_ip_address: Option<String>,
    #[serde(default)]
    watchdog: RawWatchdog,
    #[serde(default)]
    clusters: Vec<RawCluster>,
    #[serde(default)]
    runtime_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawListener {
    address: String,
    #[serde(default = "default_true")]
    bind_to_port: bool,
    #[serde(default)]
    use_original_dst: bool,
    #[serde(default = "default_filter")]
    filter: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAdmin {
    address: String,
    #[serde(default)]
    access_log_path: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawWatchdog {
    miss_ms: u64,
    megamiss_ms: u64,
    kill_timeout_ms: u64,
    multikill_timeout_ms: u64,
}

impl Default for RawWatchdog {
    fn default() -> Self {
        Self {
            miss_ms: 200,
            megamiss_ms: 1_000,
            kill_timeout_ms: 0,
            multikill_timeout_ms: 0,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum RawClusterKind {
    Static { address: String },
    StrictDns { hostname: String, port: u16 },
}

#[derive(Debug, Deserialize)]
struct RawCluster {
    name: String,
    #[serde(flatten)]
    kind: RawClusterKind,
}

/// Parses a `tcp://ip:port` URL into a socket address. Unix-domain URLs
/// are called out explicitly since they are valid elsewhere in the
/// ecosystem but not for managed listeners.
fn parse_tcp_url(url: &str) -> Result<SocketAddr, ServerError> {
    if let Some(path) = url.strip_prefix("unix://") {
        return Err(ServerError::ConfigInvalid(format!(
            "unix-domain listener '{path}' is not supported: listen sockets \
             are shared across workers and hot restart by IP address"
        )));
    }
    let rest = url.strip_prefix("tcp://").ok_or_else(|| {
        ServerError::ConfigInvalid(format!("address '{url}' must start with tcp://"))
    })?;
    rest.parse()
        .map_err(|_| ServerError::ConfigInvalid(format!("cannot parse address '{url}'")))
}

fn millis(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

impl ServerConfig {
    /// Loads and validates the configuration file.
    pub fn load(path: &Path) -> Result<Self, ServerError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        let raw: RawConfig =
            serde_json::from_str(&contents).map_err(|source| ServerError::ConfigParse {
                path: path.to_owned(),
                source,
            })?;
        Self::from_raw(raw)
    }

    /// Parses a configuration from a JSON string (tests, embedding).
    pub fn from_json_str(json: &str) -> Result<Self, ServerError> {
        let raw: RawConfig = serde_json::from_str(json).map_err(|source| {
            ServerError::ConfigParse {
                path: PathBuf::from("<inline>"),
                source,
            }
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ServerError> {
        let listeners = raw
            .listeners
            .into_iter()
            .enumerate()
            .map(|(index, listener)| {
                Ok(Arc::new(ListenerConfig {
                    id: ListenerId(index as u64),
                    address: parse_tcp_url(&listener.address)?,
                    bind_to_port: listener.bind_to_port,
                    use_original_dst: listener.use_original_dst,
                    filter: listener.filter,
                }))
            })
            .collect::<Result<Vec<_>, ServerError>>()?;

        let admin = AdminConfig {
            address: parse_tcp_url(&raw.admin.address)?,
            access_log_path: raw.admin.access_log_path,
        };

        let statsd_udp_address = raw
            .statsd_udp_ip_address
            .map(|address| {
                address.parse().map_err(|_| {
                    ServerError::ConfigInvalid(format!(
                        "cannot parse statsd address '{address}'"
                    ))
                })
            })
            .transpose()?;

        let mut names = HashMap::new();
        let clusters = raw
            .clusters
            .into_iter()
            .map(|cluster| {
                if names.insert(cluster.name.clone(), ()).is_some() {
                    return Err(ServerError::ConfigInvalid(format!(
                        "duplicate cluster name '{}'",
                        cluster.name
                    )));
                }
                let kind = match cluster.kind {
                    RawClusterKind::Static { address } => ClusterKind::Static {
                        address: parse_tcp_url(&address)?,
                    },
                    RawClusterKind::StrictDns { hostname, port } => {
                        ClusterKind::StrictDns { hostname, port }
                    }
                };
                Ok(ClusterConfig {
                    name: cluster.name,
                    kind,
                })
            })
            .collect::<Result<Vec<_>, ServerError>>()?;

        Ok(Self {
            listeners,
            admin,
            flags_path: raw.flags_path,
            stats_flush_interval: Duration::from_millis(raw.stats_flush_interval_ms.max(100)),
            drain_time: Duration::from_secs(raw.drain_time_s),
            parent_shutdown_time: Duration::from_secs(raw.parent_shutdown_time_s),
            statsd_udp_address,
            watchdog: WatchdogConfig {
                miss_margin: Duration::from_millis(raw.watchdog.miss_ms.max(1)),
                megamiss_margin: Duration::from_millis(raw.watchdog.megamiss_ms.max(1)),
                kill_timeout: millis(raw.watchdog.kill_timeout_ms),
                multikill_timeout: millis(raw.watchdog.multikill_timeout_ms),
            },
            clusters,
            runtime_path: raw.runtime_path,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn minimal_config_parses_with_defaults() {
        let config = ServerConfig::from_json_str(
            r#"{"admin": {"address": "tcp://127.0.0.1:9901"}}"#,
        )
        .unwrap();

        assert!(config.listeners.is_empty());
        assert_eq!(config.admin.address, "127.0.0.1:9901".parse().unwrap());
        assert_eq!(config.stats_flush_interval, Duration::from_secs(5));
        assert_eq!(config.drain_time, Duration::from_secs(600));
        assert_eq!(config.parent_shutdown_time, Duration::from_secs(900));
        assert_eq!(config.watchdog.miss_margin, Duration::from_millis(200));
        assert!(config.watchdog.kill_timeout.is_none());
    }

    #[test]
    fn listeners_get_distinct_ids_and_urls() {
        let config = ServerConfig::from_json_str(
            r#"{
                "admin": {"address": "tcp://127.0.0.1:9901"},
                "listeners": [
                    {"address": "tcp://0.0.0.0:10000"},
                    {"address": "tcp://0.0.0.0:10001", "filter": "blackhole"}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.listeners.len(), 2);
        assert_ne!(config.listeners[0].id, config.listeners[1].id);
        assert_eq!(config.listeners[0].url(), "tcp://0.0.0.0:10000");
        assert_eq!(config.listeners[0].filter, "echo");
        assert_eq!(config.listeners[1].filter, "blackhole");
        assert!(config.listeners[0].bind_to_port);
    }

    #[test]
    fn unix_domain_listeners_are_rejected() {
        let err = ServerConfig::from_json_str(
            r#"{
                "admin": {"address": "tcp://127.0.0.1:9901"},
                "listeners": [{"address": "unix:///tmp/l.sock"}]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::ConfigInvalid(_)));
    }

    #[test]
    fn bad_addresses_are_rejected() {
        for address in ["127.0.0.1:9901", "tcp://nonsense", "tcp://127.0.0.1"] {
            let json = format!(r#"{{"admin": {{"address": "{address}"}}}}"#);
            assert!(
                ServerConfig::from_json_str(&json).is_err(),
                "expected '{address}' to be rejected"
            );
        }
    }

    #[test]
    fn watchdog_zero_timeouts_disable_stages() {
        let config = ServerConfig::from_json_str(
            r#"{
                "admin": {"address": "tcp://127.0.0.1:9901"},
                "watchdog": {"miss_ms": 100, "megamiss_ms": 500,
                             "kill_timeout_ms": 2000, "multikill_timeout_ms": 0}
            }"#,
        )
        .unwrap();

        let guard = config.watchdog.to_guard_config();
        assert_eq!(guard.miss_margin, Duration::from_millis(100));
        assert_eq!(guard.kill_timeout, Some(Duration::from_secs(2)));
        assert!(guard.multikill_timeout.is_none());
        assert_eq!(config.watchdog.touch_interval(), Duration::from_millis(50));
    }

    #[test]
    fn clusters_parse_both_kinds() {
        let config = ServerConfig::from_json_str(
            r#"{
                "admin": {"address": "tcp://127.0.0.1:9901"},
                "clusters": [
                    {"name": "local", "type": "static", "address": "tcp://127.0.0.1:8500"},
                    {"name": "backend", "type": "strict_dns", "hostname": "localhost", "port": 443}
                ]
            }"#,
        )
        .unwrap();

        assert_eq!(config.clusters.len(), 2);
        assert!(matches!(config.clusters[0].kind, ClusterKind::Static { .. }));
        assert!(matches!(
            config.clusters[1].kind,
            ClusterKind::StrictDns { ref hostname, port: 443 } if hostname == "localhost"
        ));
    }

    #[test]
    fn duplicate_cluster_names_are_rejected() {
        let err = ServerConfig::from_json_str(
            r#"{
                "admin": {"address": "tcp://127.0.0.1:9901"},
                "clusters": [
                    {"name": "a", "type": "static", "address": "tcp://127.0.0.1:1"},
                    {"name": "a", "type": "static", "address": "tcp://127.0.0.1:2"}
                ]
            }"#,
        )
        .unwrap_err();
        assert!(matches!(err, ServerError::ConfigInvalid(_)));
    }

    #[test]
    fn statsd_address_parses() {
        let config = ServerConfig::from_json_str(
            r#"{
                "admin": {"address": "tcp://127.0.0.1:9901"},
                "statsd_udp_ip_address": "127.0.0.1:8125"
            }"#,
        )
        .unwrap();
        assert_eq!(
            config.statsd_udp_address,
            Some("127.0.0.1:8125".parse().unwrap())
        );
    }

    #[test]
    fn unknown_fields_are_rejected() {
        assert!(ServerConfig::from_json_str(
            r#"{"admin": {"address": "tcp://127.0.0.1:9901"}, "surprise": 1}"#,
        )
        .is_err());
    }
}
