//! # ip-manager
//!
//! `ip-manager` defines a trait `Storage` that provides methods for getting &
//! updating leases in storage, and a `Backend` that opens a store for one
//! network.
//!
//! Plugins don't use the store directly. It's wrapped in an `IpAllocator`
//! bound to one range set, which uses those methods to hand out & release
//! addresses while keeping a nicer interface for the plugin.
//!
//! [`Storage`]: crate::Storage
//! [`IpAllocator`]: crate::IpAllocator
use std::{net::IpAddr, path::Path};

use async_trait::async_trait;
use cni_args::PodIdentity;
use cni_core::IpConfig;
use config::{Range, RangeSet};
use thiserror::Error;
use tracing::{debug, trace};

pub mod iter;
pub mod memory;
pub mod sqlite;

pub use iter::RangeIter;

/// an address held by a container interface
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub ip: IpAddr,
    /// position of the range set in the config
    pub range_id: usize,
    pub container_id: String,
    pub if_name: String,
    pub pod: PodIdentity,
}

#[async_trait]
pub trait Storage: Send + Sync + 'static {
    // send/sync/static required for async trait bounds
    type Error: std::error::Error + Send + Sync + 'static;
    /// claim `lease.ip`. Returns false if the address is taken or the
    /// container interface already holds an address in the range.
    async fn reserve(&self, lease: &Lease) -> Result<bool, Self::Error>;
    /// the last address successfully reserved for a range
    async fn last_reserved_ip(&self, range_id: usize) -> Result<Option<IpAddr>, Self::Error>;
    async fn get_by_id(
        &self,
        container_id: &str,
        if_name: &str,
        range_id: usize,
    ) -> Result<Option<Lease>, Self::Error>;
    /// does the container interface hold an address in any range
    async fn find_by_id(&self, container_id: &str, if_name: &str) -> Result<bool, Self::Error>;
    async fn find_by_pod(
        &self,
        pod: &PodIdentity,
        if_name: &str,
        range_id: usize,
    ) -> Result<Option<Lease>, Self::Error>;
    /// hand an existing lease to another container
    async fn rebind(
        &self,
        ip: IpAddr,
        range_id: usize,
        container_id: &str,
        if_name: &str,
    ) -> Result<bool, Self::Error>;
    /// delete the container interface's leases in a range, returning how many
    async fn release_by_id(
        &self,
        container_id: &str,
        if_name: &str,
        range_id: usize,
    ) -> Result<u64, Self::Error>;
    async fn close(&self);
}

/// opens the store holding a network's leases
#[async_trait]
pub trait Backend: Send + Sync + 'static {
    type Store: Storage;
    async fn open(
        &self,
        network: &str,
        data_dir: &Path,
    ) -> Result<Self::Store, <Self::Store as Storage>::Error>;
}

/// Allocates from one range set. `range_id` partitions the store so each
/// set keeps its own leases & round-robin position.
#[derive(Debug)]
pub struct IpAllocator<'a, S> {
    set: &'a RangeSet,
    store: &'a S,
    range_id: usize,
}

impl<'a, S> IpAllocator<'a, S>
where
    S: Storage,
{
    pub fn new(set: &'a RangeSet, store: &'a S, range_id: usize) -> Self {
        Self {
            set,
            store,
            range_id,
        }
    }

    /// Allocate an address for the container interface, `requested` if given.
    /// Returns
    ///     the address the interface already holds in this range, if any
    ///     the address the same pod held, rebound to this container
    ///     `requested`, if it's in the set, not a gateway & free
    ///     otherwise the next free address after the last one handed out
    /// along with how it was obtained, so the caller can [`revert`] it.
    ///
    /// [`revert`]: IpAllocator::revert
    pub async fn allocate(
        &self,
        container_id: &str,
        if_name: &str,
        requested: Option<IpAddr>,
        pod: &PodIdentity,
    ) -> Result<Allocated, AllocError<S::Error>> {
        let requested = requested.map(|ip| ip.to_canonical());

        if let Some(lease) = self
            .store
            .get_by_id(container_id, if_name, self.range_id)
            .await?
        {
            if requested.is_some_and(|ip| ip != lease.ip) {
                return Err(AllocError::Duplicate {
                    ip: lease.ip,
                    id: container_id.to_owned(),
                });
            }
            debug!(ip = ?lease.ip, container_id, "we have an IP for this id");
            return self.existing(lease.ip, Claim::Existing);
        }

        if pod.is_known() {
            if let Some(lease) = self.store.find_by_pod(pod, if_name, self.range_id).await? {
                if requested.is_none_or(|ip| ip == lease.ip)
                    && self
                        .store
                        .rebind(lease.ip, self.range_id, container_id, if_name)
                        .await?
                {
                    debug!(
                        ip = ?lease.ip,
                        from = %lease.container_id,
                        to = container_id,
                        "rebound pod's lease to new container"
                    );
                    return self.existing(
                        lease.ip,
                        Claim::Rebound {
                            from: lease.container_id,
                        },
                    );
                }
            }
        }

        let lease = |ip| Lease {
            ip,
            range_id: self.range_id,
            container_id: container_id.to_owned(),
            if_name: if_name.to_owned(),
            pod: pod.clone(),
        };

        if let Some(ip) = requested {
            let range = self.set.range_for(&ip).ok_or_else(|| AllocError::NotInRange {
                ip,
                set: self.set.to_string(),
            })?;
            if ip == range.gateway() {
                return Err(AllocError::Gateway(ip));
            }
            if !self.store.reserve(&lease(ip)).await? {
                return Err(AllocError::Unavailable {
                    ip,
                    set: self.set.to_string(),
                });
            }
            debug!(?ip, container_id, "reserved requested IP");
            return Ok(Allocated::reserved(range, ip));
        }

        let last = self.store.last_reserved_ip(self.range_id).await?;
        trace!(?last, "starting round-robin after last reserved");
        for (range, ip) in RangeIter::new(self.set, last) {
            if self.store.reserve(&lease(ip)).await? {
                debug!(?ip, container_id, "reserved IP");
                return Ok(Allocated::reserved(range, ip));
            }
            trace!(?ip, "IP taken, trying next");
        }
        Err(AllocError::Exhausted(self.set.to_string()))
    }

    /// release whatever the container interface holds in this range. Having
    /// nothing to release is not an error.
    pub async fn release(
        &self,
        container_id: &str,
        if_name: &str,
    ) -> Result<(), AllocError<S::Error>> {
        let count = self
            .store
            .release_by_id(container_id, if_name, self.range_id)
            .await?;
        debug!(count, container_id, range_id = self.range_id, "released");
        Ok(())
    }

    /// Undo one [`allocate`]: a fresh reservation is released, a rebound
    /// lease goes back to the container it came from & a lease the
    /// interface already held is left alone.
    ///
    /// [`allocate`]: IpAllocator::allocate
    pub async fn revert(
        &self,
        container_id: &str,
        if_name: &str,
        allocated: &Allocated,
    ) -> Result<(), AllocError<S::Error>> {
        match &allocated.claim {
            Claim::Existing => Ok(()),
            Claim::Rebound { from } => {
                let ip = allocated.config.address.addr();
                self.store.rebind(ip, self.range_id, from, if_name).await?;
                debug!(?ip, to = %from, "handed lease back");
                Ok(())
            }
            Claim::Reserved => self.release(container_id, if_name).await,
        }
    }

    fn existing(&self, ip: IpAddr, claim: Claim) -> Result<Allocated, AllocError<S::Error>> {
        // a lease outside the set means the config changed under it
        let range = self.set.range_for(&ip).ok_or_else(|| AllocError::NotInRange {
            ip,
            set: self.set.to_string(),
        })?;
        Ok(Allocated {
            config: to_ip_config(range, ip),
            claim,
        })
    }
}

/// how an address came to be held by the caller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// the interface held it before this call
    Existing,
    /// taken over from another container of the same pod
    Rebound { from: String },
    /// newly reserved
    Reserved,
}

/// result of [`IpAllocator::allocate`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Allocated {
    pub config: IpConfig,
    pub claim: Claim,
}

impl Allocated {
    fn reserved(range: &Range, ip: IpAddr) -> Self {
        Self {
            config: to_ip_config(range, ip),
            claim: Claim::Reserved,
        }
    }
}

fn to_ip_config(range: &Range, ip: IpAddr) -> IpConfig {
    IpConfig {
        address: range.with_prefix(ip),
        gateway: Some(range.gateway()),
    }
}

#[derive(Error, Debug)]
pub enum AllocError<E> {
    #[error("database error")]
    DbError(#[from] E),
    #[error("{ip} not in range set {set}")]
    NotInRange { ip: IpAddr, set: String },
    #[error("requested ip {0} is subnet's gateway")]
    Gateway(IpAddr),
    #[error("requested IP address {ip} is not available in range set {set}")]
    Unavailable { ip: IpAddr, set: String },
    #[error("no IP addresses available in range set: {0}")]
    Exhausted(String),
    #[error("{ip} has been allocated to {id}, duplicate allocation is not allowed")]
    Duplicate { ip: IpAddr, id: String },
}
