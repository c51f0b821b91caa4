#![warn(
    missing_debug_implementations,
    // missing_docs, // we shall remove thee, someday!
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![deny(rustdoc::broken_intra_doc_links)]
#![allow(clippy::cognitive_complexity)]

//! # host-local
//!
//! Hands out addresses from locally configured ranges, keeping leases in a
//! store on the host. All ranges succeed or none do: a failure part way
//! through undoes whatever this call changed, leaving leases the container
//! held beforehand in place.
use std::{collections::BTreeMap, net::IpAddr};

use cni_args::PodIdentity;
use cni_core::prelude::*;
use config::IpamConfig;
use ip_manager::{Allocated, Backend, IpAllocator, Storage};

pub mod dns;

#[derive(Debug, Clone, Default)]
pub struct HostLocal<B> {
    backend: B,
}

impl<B> HostLocal<B>
where
    B: Backend,
{
    pub fn new(backend: B) -> Self {
        Self { backend }
    }

    async fn open(&self, cfg: &IpamConfig) -> Result<B::Store> {
        self.backend
            .open(cfg.name(), cfg.data_dir())
            .await
            .with_context(|| {
                format!(
                    "failed to open lease store for network {:?} in {}",
                    cfg.name(),
                    cfg.data_dir().display()
                )
            })
    }
}

fn load(args: &CmdArgs) -> Result<IpamConfig> {
    let (cfg, _) = IpamConfig::load(&args.stdin_data, &args.args).map_err(PluginError::from)?;
    Ok(cfg)
}

#[async_trait]
impl<B> Plugin for HostLocal<B>
where
    B: Backend,
{
    #[instrument(skip_all, fields(container_id = %args.container_id, if_name = %args.if_name))]
    async fn add(&self, args: &CmdArgs) -> Result<CniResult> {
        let cfg = load(args)?;
        let pod = cni_args::resolve_pod_identity(&args.args)
            .context("failed to get pod ns/name from env args")?;
        let store = self.open(&cfg).await?;
        // store is closed on every path out
        let res = allocate_all(&cfg, &store, args, &pod).await;
        store.close().await;
        let result = res?;
        info!(ips = ?result.ips, "allocated");
        Ok(result)
    }

    #[instrument(skip_all, fields(container_id = %args.container_id, if_name = %args.if_name))]
    async fn check(&self, args: &CmdArgs) -> Result<()> {
        let cfg = load(args)?;
        let store = self.open(&cfg).await?;
        let found = store.find_by_id(&args.container_id, &args.if_name).await;
        store.close().await;
        if !found? {
            bail!(
                "host-local: Failed to find address added by container {}",
                args.container_id
            );
        }
        Ok(())
    }

    #[instrument(skip_all, fields(container_id = %args.container_id, if_name = %args.if_name))]
    async fn del(&self, args: &CmdArgs) -> Result<()> {
        let cfg = load(args)?;
        let store = self.open(&cfg).await?;
        let errors = release_all(&cfg, &store, args).await;
        store.close().await;
        if !errors.is_empty() {
            bail!("{}", errors.join(";"));
        }
        debug!("released");
        Ok(())
    }
}

/// one successful allocation, kept so it can be undone
struct Allocation<'a, S> {
    index: usize,
    allocator: IpAllocator<'a, S>,
    allocated: Allocated,
}

async fn allocate_all<S: Storage>(
    cfg: &IpamConfig,
    store: &S,
    args: &CmdArgs,
    pod: &PodIdentity,
) -> Result<CniResult> {
    // keyed by text form so each request is claimed by one range set only
    let mut requested = cfg
        .ip_args()
        .iter()
        .map(|ip| (ip.to_string(), *ip))
        .collect::<BTreeMap<String, IpAddr>>();
    let mut allocs: Vec<Allocation<'_, S>> = Vec::with_capacity(cfg.ranges().len());

    for (index, set) in cfg.ranges().iter().enumerate() {
        let allocator = IpAllocator::new(set, store, index);
        let claimed = requested
            .iter()
            .find(|(_, ip)| set.contains(ip))
            .map(|(key, ip)| (key.clone(), *ip));
        let req_ip = claimed.map(|(key, ip)| {
            requested.remove(&key);
            ip
        });

        match allocator
            .allocate(&args.container_id, &args.if_name, req_ip, pod)
            .await
        {
            Ok(allocated) => allocs.push(Allocation {
                index,
                allocator,
                allocated,
            }),
            Err(err) => {
                rollback(&allocs, args).await;
                return Err(
                    anyhow::Error::new(err).context(format!("failed to allocate for range {index}"))
                );
            }
        }
    }

    if !requested.is_empty() {
        rollback(&allocs, args).await;
        bail!(
            "failed to allocate all requested IPs: {}",
            requested
                .values()
                .map(IpAddr::to_string)
                .collect::<Vec<_>>()
                .join(" ")
        );
    }

    let dns = match cfg.resolv_conf() {
        Some(path) => match dns::parse(path).await {
            Ok(dns) => Some(dns),
            Err(err) => {
                rollback(&allocs, args).await;
                return Err(err);
            }
        },
        None => None,
    };

    Ok(CniResult {
        ips: allocs
            .into_iter()
            .map(|alloc| alloc.allocated.config)
            .collect(),
        routes: cfg.routes().to_vec(),
        dns,
        ..CniResult::default()
    })
}

/// Best effort, failures are only logged. Leases held before this ADD are
/// kept & rebound ones go back to their previous container.
async fn rollback<S: Storage>(allocs: &[Allocation<'_, S>], args: &CmdArgs) {
    for alloc in allocs {
        if let Err(err) = alloc
            .allocator
            .revert(&args.container_id, &args.if_name, &alloc.allocated)
            .await
        {
            warn!(
                ?err,
                range = alloc.index,
                ip = %alloc.allocated.config.address,
                claim = ?alloc.allocated.claim,
                "failed to revert during rollback"
            );
        }
    }
}

/// release from every range, even after a failure. Returns the error messages.
async fn release_all<S: Storage>(cfg: &IpamConfig, store: &S, args: &CmdArgs) -> Vec<String> {
    let mut errors = Vec::new();
    for (index, set) in cfg.ranges().iter().enumerate() {
        if let Err(err) = IpAllocator::new(set, store, index)
            .release(&args.container_id, &args.if_name)
            .await
        {
            error!(?err, range = index, "failed to release");
            errors.push(format!("{:#}", anyhow::Error::new(err)));
        }
    }
    errors
}
