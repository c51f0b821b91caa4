#![allow(clippy::cognitive_complexity)]
use anyhow::Result;

use cni_core::{
    config::{
        cli::{self, Parser},
        trace,
    },
    skel,
    tokio::runtime::Builder,
    tracing::*,
};
use host_local::HostLocal;
use ip_manager::sqlite::SqliteBackend;

fn main() -> Result<()> {
    // parses from cli or environment var
    let config = cli::Config::parse();
    // stdout belongs to the runtime, so a broken logger must not stop us
    match trace::Config::parse(&config.log, &config.log_format) {
        Ok(trace_config) => debug!(?config, ?trace_config),
        Err(err) => eprintln!("failed to initialize logging: {err:#}"),
    }

    // one invocation is one sequential flow
    let rt = Builder::new_current_thread().enable_all().build()?;
    let code = rt.block_on(async move { skel::run(&HostLocal::new(SqliteBackend), &config).await });
    drop(rt);

    std::process::exit(code)
}
