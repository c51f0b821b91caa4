use std::{
    collections::{BTreeMap, HashMap},
    net::IpAddr,
    path::Path,
    sync::{Arc, Mutex, MutexGuard},
};

use async_trait::async_trait;
use cni_args::PodIdentity;
use thiserror::Error;
use tracing::debug;

use crate::{Backend, Lease, Storage};

/// leases for one network, kept in memory
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Mutex<MemoryInner>>,
}

#[derive(Debug, Default)]
struct MemoryInner {
    leases: BTreeMap<IpAddr, Lease>,
    last_reserved: HashMap<usize, IpAddr>,
}

#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("memory store lock poisoned")]
    Poisoned,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryInner>, MemoryError> {
        self.inner.lock().map_err(|_| MemoryError::Poisoned)
    }
}

fn owned_by(lease: &Lease, container_id: &str, if_name: &str) -> bool {
    lease.container_id == container_id && lease.if_name == if_name
}

#[async_trait]
impl Storage for MemoryStore {
    type Error = MemoryError;

    async fn reserve(&self, lease: &Lease) -> Result<bool, Self::Error> {
        let mut inner = self.lock()?;
        let taken = inner.leases.contains_key(&lease.ip)
            || inner.leases.values().any(|cur| {
                cur.range_id == lease.range_id && owned_by(cur, &lease.container_id, &lease.if_name)
            });
        if taken {
            debug!(ip = ?lease.ip, "address or owner already present");
            return Ok(false);
        }
        inner.leases.insert(lease.ip, lease.clone());
        inner.last_reserved.insert(lease.range_id, lease.ip);
        Ok(true)
    }

    async fn last_reserved_ip(&self, range_id: usize) -> Result<Option<IpAddr>, Self::Error> {
        Ok(self.lock()?.last_reserved.get(&range_id).copied())
    }

    async fn get_by_id(
        &self,
        container_id: &str,
        if_name: &str,
        range_id: usize,
    ) -> Result<Option<Lease>, Self::Error> {
        Ok(self
            .lock()?
            .leases
            .values()
            .find(|l| l.range_id == range_id && owned_by(l, container_id, if_name))
            .cloned())
    }

    async fn find_by_id(&self, container_id: &str, if_name: &str) -> Result<bool, Self::Error> {
        Ok(self
            .lock()?
            .leases
            .values()
            .any(|l| owned_by(l, container_id, if_name)))
    }

    async fn find_by_pod(
        &self,
        pod: &PodIdentity,
        if_name: &str,
        range_id: usize,
    ) -> Result<Option<Lease>, Self::Error> {
        Ok(self
            .lock()?
            .leases
            .values()
            .find(|l| l.range_id == range_id && l.if_name == if_name && l.pod == *pod)
            .cloned())
    }

    async fn rebind(
        &self,
        ip: IpAddr,
        range_id: usize,
        container_id: &str,
        if_name: &str,
    ) -> Result<bool, Self::Error> {
        let mut inner = self.lock()?;
        match inner.leases.get_mut(&ip) {
            Some(lease) if lease.range_id == range_id => {
                lease.container_id = container_id.to_owned();
                lease.if_name = if_name.to_owned();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn release_by_id(
        &self,
        container_id: &str,
        if_name: &str,
        range_id: usize,
    ) -> Result<u64, Self::Error> {
        let mut inner = self.lock()?;
        let before = inner.leases.len();
        inner
            .leases
            .retain(|_, l| !(l.range_id == range_id && owned_by(l, container_id, if_name)));
        Ok((before - inner.leases.len()) as u64)
    }

    async fn close(&self) {}
}

/// Hands out one [`MemoryStore`] per network name. Stores outlive `close`,
/// so leases survive across opens like they would on disk.
#[derive(Debug, Clone, Default)]
pub struct MemoryBackend {
    stores: Arc<Mutex<HashMap<String, MemoryStore>>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Backend for MemoryBackend {
    type Store = MemoryStore;

    async fn open(&self, network: &str, _data_dir: &Path) -> Result<MemoryStore, MemoryError> {
        let mut stores = self.stores.lock().map_err(|_| MemoryError::Poisoned)?;
        Ok(stores.entry(network.to_owned()).or_default().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease(ip: &str, container_id: &str, range_id: usize) -> Lease {
        Lease {
            ip: ip.parse().unwrap(),
            range_id,
            container_id: container_id.to_owned(),
            if_name: "eth0".to_owned(),
            pod: PodIdentity::default(),
        }
    }

    #[tokio::test]
    async fn test_reserve_conflicts() {
        let store = MemoryStore::new();
        assert!(store.reserve(&lease("10.0.0.2", "a", 0)).await.unwrap());
        // address taken
        assert!(!store.reserve(&lease("10.0.0.2", "b", 0)).await.unwrap());
        // owner already has one in this range
        assert!(!store.reserve(&lease("10.0.0.3", "a", 0)).await.unwrap());
        // but not in another
        assert!(store.reserve(&lease("10.1.0.3", "a", 1)).await.unwrap());
        assert_eq!(
            store.last_reserved_ip(0).await.unwrap(),
            Some("10.0.0.2".parse().unwrap())
        );
        assert_eq!(store.release_by_id("a", "eth0", 0).await.unwrap(), 1);
        assert_eq!(store.release_by_id("a", "eth0", 0).await.unwrap(), 0);
        assert!(store.find_by_id("a", "eth0").await.unwrap());
    }

    #[tokio::test]
    async fn test_backend_shares_network() {
        let backend = MemoryBackend::new();
        let dir = Path::new("/unused");
        let a = backend.open("net", dir).await.unwrap();
        a.reserve(&lease("10.0.0.2", "a", 0)).await.unwrap();
        a.close().await;

        let again = backend.open("net", dir).await.unwrap();
        assert!(again.find_by_id("a", "eth0").await.unwrap());
        let other = backend.open("other", dir).await.unwrap();
        assert!(!other.find_by_id("a", "eth0").await.unwrap());
    }
}
