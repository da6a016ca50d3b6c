//! Cluster manager hosting.
//!
//! The server does not know how clusters balance or health-check — it
//! only hosts their first initialization. Each configured cluster is an
//! [`InitTarget`]: static clusters complete on the spot, strict-DNS
//! clusters after their first resolution on the main loop. When every
//! cluster has completed once, the callback handed to
//! [`ClusterManager::set_initialized_cb`] fires — possibly synchronously,
//! when nothing was asynchronous.

use std::cell::RefCell;
use std::net::SocketAddr;
use std::rc::Rc;
use std::sync::Arc;

use gantry_core::dispatcher::AbortOnDrop;
use gantry_core::init::{InitManager, InitTarget};
use gantry_core::stats::{Gauge, Scope};
use tracing::{info, warn};

use crate::config::{ClusterConfig, ClusterKind};

/// One hosted upstream cluster.
pub struct Cluster {
    name: String,
    kind: ClusterKind,
    endpoints: Rc<RefCell<Vec<SocketAddr>>>,
    membership: Arc<Gauge>,
    resolve_task: RefCell<Option<AbortOnDrop>>,
}

impl Cluster {
    fn new(config: &ClusterConfig, scope: &Scope) -> Rc<Self> {
        Rc::new(Self {
            name: config.name.clone(),
            kind: config.kind.clone(),
            endpoints: Rc::new(RefCell::new(Vec::new())),
            membership: scope.gauge(&format!("{}.membership_total", config.name)),
            resolve_task: RefCell::new(None),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Endpoints known after first initialization.
    pub fn endpoints(&self) -> Vec<SocketAddr> {
        self.endpoints.borrow().clone()
    }
}

impl InitTarget for Cluster {
    fn initialize(&self, done: Box<dyn FnOnce()>) {
        match &self.kind {
            ClusterKind::Static { address } => {
                self.endpoints.borrow_mut().push(*address);
                self.membership.set(1);
                done();
            }
            ClusterKind::StrictDns { hostname, port } => {
                let query = (hostname.clone(), *port);
                let name = self.name.clone();
                let endpoints = Rc::clone(&self.endpoints);
                let membership = Arc::clone(&self.membership);
                let task = tokio::task::spawn_local(async move {
                    match tokio::net::lookup_host(query).await {
                        Ok(resolved) => {
                            let mut endpoints = endpoints.borrow_mut();
                            endpoints.extend(resolved);
                            membership.set(endpoints.len() as u64);
                            info!(cluster = %name, endpoints = endpoints.len(), "cluster resolved");
                        }
                        Err(error) => {
                            // first-round failure still completes the
                            // barrier; the cluster starts empty
                            warn!(cluster = %name, %error, "initial DNS resolution failed");
                        }
                    }
                    done();
                });
                *self.resolve_task.borrow_mut() = Some(task.into());
            }
        }
    }
}

/// Owns the hosted clusters and their shared init barrier.
pub struct ClusterManager {
    clusters: Vec<Rc<Cluster>>,
    init: InitManager,
}

impl ClusterManager {
    pub fn new(configs: &[ClusterConfig], scope: &Scope) -> Self {
        let init = InitManager::new();
        let clusters: Vec<Rc<Cluster>> = configs
            .iter()
            .map(|config| Cluster::new(config, scope))
            .collect();
        for cluster in &clusters {
            init.register_target(Rc::clone(cluster) as Rc<dyn InitTarget>);
        }
        Self { clusters, init }
    }

    /// Begins every cluster's first initialization and arranges for `cb`
    /// once all complete. Fires synchronously when nothing is async.
    /// Must run on the main loop (DNS clusters spawn local tasks).
    pub fn set_initialized_cb(&self, cb: impl FnOnce() + 'static) {
        self.init.initialize(cb);
    }

    pub fn cluster(&self, name: &str) -> Option<Rc<Cluster>> {
        self.clusters
            .iter()
            .find(|cluster| cluster.name() == name)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.clusters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clusters.is_empty()
    }

    /// Drops in-flight resolution tasks.
    pub fn shutdown(&self) {
        for cluster in &self.clusters {
            cluster.resolve_task.borrow_mut().take();
        }
    }
}
