use std::collections::{HashMap, VecDeque};
use std::net::TcpListener;

use bollard::models::PortBinding;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::warn;
use uuid::Uuid;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortMapping {
    pub host: u16,
    pub container: u16,
}

/// Process-wide pool arbitrating exclusive access to host ports. Two
/// policies satisfy the same contract, selected once at configuration time:
/// a fixed-range pool with a FIFO reuse queue, and an OS-assigned ephemeral
/// policy that asks the kernel for free ports on every registration.
pub enum PortAllocator {
    Range(RangePool),
    Ephemeral(EphemeralPool),
}

impl PortAllocator {
    pub fn range(start: u16, end: u16) -> Result<Self> {
        if start >= end {
            return Err(Error::Internal(format!(
                "invalid port range [{start}, {end})"
            )));
        }
        Ok(PortAllocator::Range(RangePool::new(start, end)))
    }

    pub fn ephemeral() -> Self {
        PortAllocator::Ephemeral(EphemeralPool::new())
    }

    /// Reserves `count` app ports plus one host port per explicit container
    /// port, atomically: either the whole request is satisfied or nothing is
    /// reserved. Returns the registration ID holding the lease.
    pub async fn register(&self, count: usize, container_ports: &[u16]) -> Result<String> {
        match self {
            PortAllocator::Range(pool) => pool.register(count, container_ports).await,
            PortAllocator::Ephemeral(pool) => pool.register(count, container_ports).await,
        }
    }

    /// Returns every port held by the registration to the pool. The free
    /// queue is FIFO, so reuse order is deterministic.
    pub async fn unregister(&self, id: &str) {
        match self {
            PortAllocator::Range(pool) => pool.unregister(id).await,
            PortAllocator::Ephemeral(pool) => pool.unregister(id).await,
        }
    }

    pub async fn ports(&self, id: &str) -> Vec<PortMapping> {
        match self {
            PortAllocator::Range(pool) => pool.ports(id).await,
            PortAllocator::Ephemeral(pool) => pool.ports(id).await,
        }
    }

    /// The registration's ports in the shape of a container exposed-port
    /// set, keyed `"<container>/tcp"`.
    pub async fn exposed_ports(&self, id: &str) -> HashMap<String, HashMap<(), ()>> {
        self.ports(id)
            .await
            .into_iter()
            .map(|m| (format!("{}/tcp", m.container), HashMap::new()))
            .collect()
    }

    /// The registration's ports as a host-bind map consumable by the
    /// container runtime without re-deriving allocation logic.
    pub async fn port_bindings(&self, id: &str) -> HashMap<String, Option<Vec<PortBinding>>> {
        self.ports(id)
            .await
            .into_iter()
            .map(|m| {
                (
                    format!("{}/tcp", m.container),
                    Some(vec![PortBinding {
                        host_ip: Some("0.0.0.0".to_string()),
                        host_port: Some(m.host.to_string()),
                    }]),
                )
            })
            .collect()
    }
}

struct RangeInner {
    free: VecDeque<u16>,
    assigned: HashMap<String, Vec<PortMapping>>,
}

pub struct RangePool {
    inner: Mutex<RangeInner>,
}

impl RangePool {
    fn new(start: u16, end: u16) -> Self {
        RangePool {
            inner: Mutex::new(RangeInner {
                free: (start..end).collect(),
                assigned: HashMap::new(),
            }),
        }
    }

    async fn register(&self, count: usize, container_ports: &[u16]) -> Result<String> {
        let mut inner = self.inner.lock().await;
        let needed = count + container_ports.len();
        if inner.free.len() < needed {
            return Err(Error::ZeroFreePort);
        }

        let mut mappings = Vec::with_capacity(needed);
        for _ in 0..count {
            // App ports are leased as-is: the workload binds the same number
            // the host exposes.
            let port = inner.free.pop_front().expect("length checked above");
            mappings.push(PortMapping {
                host: port,
                container: port,
            });
        }
        for container in container_ports {
            let host = inner.free.pop_front().expect("length checked above");
            mappings.push(PortMapping {
                host,
                container: *container,
            });
        }

        let id = Uuid::new_v4().to_string();
        inner.assigned.insert(id.clone(), mappings);
        Ok(id)
    }

    async fn unregister(&self, id: &str) {
        let mut inner = self.inner.lock().await;
        match inner.assigned.remove(id) {
            Some(mappings) => {
                for mapping in mappings {
                    inner.free.push_back(mapping.host);
                }
            }
            None => warn!(registration = %id, "unregister for unknown port registration"),
        }
    }

    async fn ports(&self, id: &str) -> Vec<PortMapping> {
        self.inner
            .lock()
            .await
            .assigned
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

pub struct EphemeralPool {
    assigned: Mutex<HashMap<String, Vec<PortMapping>>>,
}

impl EphemeralPool {
    fn new() -> Self {
        EphemeralPool {
            assigned: Mutex::new(HashMap::new()),
        }
    }

    async fn register(&self, count: usize, container_ports: &[u16]) -> Result<String> {
        // Hold every probe listener until all ports are picked so one
        // registration cannot hand out the same port twice.
        let needed = count + container_ports.len();
        let mut listeners = Vec::with_capacity(needed);
        for _ in 0..needed {
            let listener =
                TcpListener::bind(("127.0.0.1", 0)).map_err(|_| Error::ZeroFreePort)?;
            listeners.push(listener);
        }

        let mut picked = Vec::with_capacity(needed);
        for listener in &listeners {
            picked.push(listener.local_addr()?.port());
        }
        drop(listeners);

        let mut mappings = Vec::with_capacity(needed);
        for port in picked.drain(..count) {
            mappings.push(PortMapping {
                host: port,
                container: port,
            });
        }
        for (host, container) in picked.into_iter().zip(container_ports) {
            mappings.push(PortMapping {
                host,
                container: *container,
            });
        }

        let id = Uuid::new_v4().to_string();
        self.assigned.lock().await.insert(id.clone(), mappings);
        Ok(id)
    }

    async fn unregister(&self, id: &str) {
        if self.assigned.lock().await.remove(id).is_none() {
            warn!(registration = %id, "unregister for unknown port registration");
        }
    }

    async fn ports(&self, id: &str) -> Vec<PortMapping> {
        self.assigned
            .lock()
            .await
            .get(id)
            .cloned()
            .unwrap_or_default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn explicit_ports_consume_pool_ports() {
        // Pool [20, 23).
        let pool = PortAllocator::range(20, 23).unwrap();

        let t1 = pool.register(0, &[80]).await.unwrap();
        assert_eq!(
            pool.ports(&t1).await,
            vec![PortMapping {
                host: 20,
                container: 80
            }]
        );

        // Two host ports left, three requested.
        let err = pool.register(0, &[80, 81, 82]).await.unwrap_err();
        assert!(matches!(err, Error::ZeroFreePort));

        pool.unregister(&t1).await;
        let t2 = pool.register(0, &[81, 82]).await.unwrap();
        assert_eq!(pool.ports(&t2).await.len(), 2);
    }

    #[tokio::test]
    async fn failed_register_reserves_nothing() {
        let pool = PortAllocator::range(20, 22).unwrap();
        assert!(pool.register(3, &[]).await.is_err());
        // Both ports still available.
        let t1 = pool.register(2, &[]).await.unwrap();
        assert_eq!(pool.ports(&t1).await.len(), 2);
    }

    #[tokio::test]
    async fn freed_ports_are_reused_fifo() {
        let pool = PortAllocator::range(20, 24).unwrap();
        let t1 = pool.register(2, &[]).await.unwrap();
        let t2 = pool.register(2, &[]).await.unwrap();
        assert_eq!(
            pool.ports(&t1)
                .await
                .iter()
                .map(|m| m.host)
                .collect::<Vec<_>>(),
            vec![20, 21]
        );

        pool.unregister(&t2).await;
        pool.unregister(&t1).await;

        // Oldest-freed first: t2's ports come back before t1's.
        let t3 = pool.register(4, &[]).await.unwrap();
        assert_eq!(
            pool.ports(&t3)
                .await
                .iter()
                .map(|m| m.host)
                .collect::<Vec<_>>(),
            vec![22, 23, 20, 21]
        );
    }

    #[tokio::test]
    async fn live_registrations_never_share_a_port() {
        let pool = PortAllocator::range(20, 30).unwrap();
        let mut seen = std::collections::HashSet::new();
        for _ in 0..5 {
            let id = pool.register(2, &[]).await.unwrap();
            for mapping in pool.ports(&id).await {
                assert!(seen.insert(mapping.host), "port {} leased twice", mapping.host);
            }
        }
    }

    #[tokio::test]
    async fn bind_views_match_allocation() {
        let pool = PortAllocator::range(20, 23).unwrap();
        let id = pool.register(1, &[8080]).await.unwrap();

        let exposed = pool.exposed_ports(&id).await;
        assert!(exposed.contains_key("20/tcp"));
        assert!(exposed.contains_key("8080/tcp"));

        let bindings = pool.port_bindings(&id).await;
        let bound = bindings.get("8080/tcp").unwrap().as_ref().unwrap();
        assert_eq!(bound[0].host_port.as_deref(), Some("21"));
    }

    #[tokio::test]
    async fn ephemeral_policy_hands_out_distinct_ports() {
        let pool = PortAllocator::ephemeral();
        let id = pool.register(2, &[80]).await.unwrap();
        let ports = pool.ports(&id).await;
        assert_eq!(ports.len(), 3);
        let hosts: std::collections::HashSet<u16> = ports.iter().map(|m| m.host).collect();
        assert_eq!(hosts.len(), 3);
        assert_eq!(ports[2].container, 80);
        pool.unregister(&id).await;
        assert!(pool.ports(&id).await.is_empty());
    }
}
