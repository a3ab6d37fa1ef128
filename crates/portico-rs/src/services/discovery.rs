//! Service discovery adapter interface.
//!
//! Concrete adapters (Consul, etcd, DNS, Kubernetes) live outside the
//! core; the core consumes a stream of backend sets per watched service
//! and swaps each emission into the named pool atomically. Health bits on
//! individual backends are flipped out-of-band through the pool's
//! `set_health`.

use crate::models::upstream::{BackendConfig, UpstreamPool};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use log::{info, warn};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One emission from a discovery watch: the full replacement backend set.
#[derive(Debug, Clone)]
pub struct BackendSet {
    pub backends: Vec<BackendConfig>,
}

/// Pluggable discovery source.
pub trait DiscoveryAdapter: Send + Sync {
    /// Watches a service; each emission replaces the backend set of the
    /// upstream bound to it.
    fn watch(&self, service: &str, tags: &[String]) -> BoxStream<'static, BackendSet>;
}

/// Binds a discovery watch to a pool: every emission atomically replaces
/// the pool's backends until the shutdown token fires. Spawned once per
/// configured binding at startup.
pub fn bind_discovery(
    adapter: Arc<dyn DiscoveryAdapter>,
    service: String,
    tags: Vec<String>,
    pool: Arc<UpstreamPool>,
    shutdown: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut stream = adapter.watch(&service, &tags);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                emission = stream.next() => match emission {
                    Some(set) => {
                        if set.backends.is_empty() {
                            warn!(
                                "Discovery for {} emitted an empty backend set; keeping previous",
                                service
                            );
                            continue;
                        }
                        info!(
                            "Discovery update for {}: {} backends",
                            service,
                            set.backends.len()
                        );
                        pool.replace_backends(&set.backends);
                    }
                    None => break,
                },
            }
        }
    })
}

/// Fixed-set adapter for tests and static deployments: emits one set and
/// then stays silent.
pub struct StaticDiscovery {
    pub backends: Vec<BackendConfig>,
}

impl DiscoveryAdapter for StaticDiscovery {
    fn watch(&self, _service: &str, _tags: &[String]) -> BoxStream<'static, BackendSet> {
        let set = BackendSet {
            backends: self.backends.clone(),
        };
        futures::stream::once(async move { set }).chain(futures::stream::pending()).boxed()
    }
}
