//! Turns one process invocation into a call on a [`Plugin`], then writes the
//! outcome back to the runtime.
use std::{io::Write, path::PathBuf, str::FromStr};

use anyhow::Result;
use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tracing::{debug, error};

use crate::{
    config::cli,
    error::{
        PluginError, ERR_INCOMPATIBLE_VERSION, ERR_INVALID_ENV, ERR_INVALID_NETWORK_CONFIG,
        ERR_IO_FAILURE,
    },
    types::{CniResult, IMPLEMENTED_SPEC_VERSION},
    version::{self, VersionInfo},
};

/// max length of an interface name on linux
const MAX_IF_NAME_LEN: usize = 15;

/// the operation selected by `CNI_COMMAND`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Command {
    /// allocate
    Add,
    /// release
    Del,
    /// verify a previous ADD
    Check,
    /// report supported versions
    Version,
}

impl FromStr for Command {
    type Err = PluginError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ADD" => Ok(Command::Add),
            "DEL" => Ok(Command::Del),
            "CHECK" => Ok(Command::Check),
            "VERSION" => Ok(Command::Version),
            other => Err(PluginError::new(
                ERR_INVALID_ENV,
                format!("unknown CNI_COMMAND: {other}"),
            )),
        }
    }
}

/// arguments for a single ADD/DEL/CHECK
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CmdArgs {
    /// `CNI_CONTAINERID`
    pub container_id: String,
    /// `CNI_NETNS`, not required for DEL
    pub netns: Option<PathBuf>,
    /// `CNI_IFNAME`
    pub if_name: String,
    /// `CNI_ARGS`
    pub args: String,
    /// `CNI_PATH`
    pub path: String,
    /// the network config
    pub stdin_data: Vec<u8>,
}

impl CmdArgs {
    /// collect & validate the env vars `command` needs
    pub fn from_config(
        config: &cli::Config,
        command: Command,
        stdin_data: Vec<u8>,
    ) -> Result<Self, PluginError> {
        // treat empty vars the same as unset
        let present = |v: &Option<String>| v.as_deref().filter(|v| !v.is_empty()).map(str::to_owned);
        let container_id = present(&config.container_id);
        let if_name = present(&config.if_name);
        let path = present(&config.path);
        let netns = config
            .netns
            .clone()
            .filter(|p| !p.as_os_str().is_empty());

        let mut missing = Vec::new();
        if container_id.is_none() {
            missing.push("CNI_CONTAINERID");
        }
        if netns.is_none() && command != Command::Del {
            missing.push("CNI_NETNS");
        }
        if if_name.is_none() {
            missing.push("CNI_IFNAME");
        }
        if path.is_none() {
            missing.push("CNI_PATH");
        }
        if !missing.is_empty() {
            return Err(PluginError::new(
                ERR_INVALID_ENV,
                format!("required env variables [{}] missing", missing.join(",")),
            ));
        }
        let container_id = container_id.unwrap_or_default();
        let if_name = if_name.unwrap_or_default();
        validate_container_id(&container_id)?;
        validate_interface_name(&if_name)?;

        Ok(Self {
            container_id,
            netns,
            if_name,
            args: config.args.clone(),
            path: path.unwrap_or_default(),
            stdin_data,
        })
    }
}

/// must match `^[a-zA-Z0-9][a-zA-Z0-9_.\-]*$`
pub fn validate_container_id(id: &str) -> Result<(), PluginError> {
    let mut chars = id.chars();
    let valid = matches!(chars.next(), Some(c) if c.is_ascii_alphanumeric())
        && chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'));
    if valid {
        Ok(())
    } else {
        Err(PluginError::new(ERR_INVALID_NETWORK_CONFIG, "invalid characters in containerID")
            .with_details(id.to_owned()))
    }
}

/// linux interface name rules
pub fn validate_interface_name(name: &str) -> Result<(), PluginError> {
    let invalid = |msg: &str| {
        Err(PluginError::new(ERR_INVALID_NETWORK_CONFIG, msg).with_details(name.to_owned()))
    };
    if name.is_empty() {
        return invalid("interface name is empty");
    }
    if name.len() > MAX_IF_NAME_LEN {
        return invalid("interface name is too long");
    }
    if name == "." || name == ".." {
        return invalid("interface name is . or ..");
    }
    if name
        .chars()
        .any(|c| c == '/' || c == ':' || c.is_whitespace())
    {
        return invalid("interface name contains / or : or whitespace characters");
    }
    Ok(())
}

/// The three lifecycle operations. Errors may carry a [`PluginError`] to pick
/// the reported code.
#[async_trait]
pub trait Plugin: Send + Sync + 'static {
    /// allocate, returning the result to print
    async fn add(&self, args: &CmdArgs) -> Result<CniResult>;
    /// verify a previous ADD still holds
    async fn check(&self, args: &CmdArgs) -> Result<()>;
    /// release everything held for the container/interface
    async fn del(&self, args: &CmdArgs) -> Result<()>;
}

/// read stdin, run the command & write the outcome to stdout. Returns the
/// process exit code.
pub async fn run<P: Plugin>(plugin: &P, config: &cli::Config) -> i32 {
    let mut stdin_data = Vec::new();
    // VERSION is often run with nothing attached to stdin
    if config.command.as_deref() != Some("VERSION") {
        if let Err(err) = tokio::io::stdin().read_to_end(&mut stdin_data).await {
            let err = PluginError::new(ERR_IO_FAILURE, format!("error reading from stdin: {err}"));
            return write_error(std::io::stdout(), IMPLEMENTED_SPEC_VERSION, &err);
        }
    }
    run_with(plugin, config, stdin_data, std::io::stdout()).await
}

/// like [`run`] with the stdin contents & output given explicitly
pub async fn run_with<P, W>(plugin: &P, config: &cli::Config, stdin_data: Vec<u8>, out: W) -> i32
where
    P: Plugin,
    W: Write,
{
    // version of the config, once we know it errors are reported in it
    let mut conf_version = IMPLEMENTED_SPEC_VERSION.to_owned();
    match dispatch(plugin, config, stdin_data, &mut conf_version).await {
        Ok(Some(doc)) => match write_doc(out, &doc) {
            Ok(()) => 0,
            Err(err) => {
                error!(?err, "failed to write result");
                1
            }
        },
        Ok(None) => 0,
        Err(err) => write_error(out, &conf_version, &err),
    }
}

async fn dispatch<P: Plugin>(
    plugin: &P,
    config: &cli::Config,
    stdin_data: Vec<u8>,
    conf_version: &mut String,
) -> Result<Option<serde_json::Value>, PluginError> {
    let command = config
        .command
        .as_deref()
        .filter(|c| !c.is_empty())
        .ok_or_else(|| {
            PluginError::new(ERR_INVALID_ENV, "required env variables [CNI_COMMAND] missing")
        })?
        .parse::<Command>()?;
    debug!(?command, "dispatching");

    if command == Command::Version {
        return Ok(Some(serde_json::to_value(VersionInfo::default())?));
    }

    let args = CmdArgs::from_config(config, command, stdin_data)?;
    let version = version::config_version(&args.stdin_data)?;
    if !version::is_supported(&version) {
        return Err(PluginError::new(
            ERR_INCOMPATIBLE_VERSION,
            "incompatible CNI versions",
        )
        .with_details(format!(
            "config is {version:?}, plugin supports {:?}",
            version::SUPPORTED_VERSIONS
        )));
    }
    *conf_version = version.clone();

    match command {
        Command::Add => {
            let result = plugin
                .add(&args)
                .await
                .map_err(|err| PluginError::from_anyhow(&err))?;
            Ok(Some(result.encode(&version)?))
        }
        Command::Check => {
            if !version::greater_than_or_equal(&version, "0.4.0")? {
                return Err(PluginError::new(
                    ERR_INCOMPATIBLE_VERSION,
                    "config version does not allow CHECK",
                ));
            }
            plugin
                .check(&args)
                .await
                .map_err(|err| PluginError::from_anyhow(&err))?;
            Ok(None)
        }
        Command::Del => {
            plugin
                .del(&args)
                .await
                .map_err(|err| PluginError::from_anyhow(&err))?;
            Ok(None)
        }
        Command::Version => unreachable!("handled above"),
    }
}

fn write_doc<W: Write>(mut out: W, doc: &serde_json::Value) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut out, doc)?;
    out.write_all(b"\n")?;
    out.flush()
}

fn write_error<W: Write>(out: W, conf_version: &str, err: &PluginError) -> i32 {
    error!(code = err.code, msg = %err.msg, details = %err.details, "plugin failed");
    let mut doc = match serde_json::to_value(err) {
        Ok(doc) => doc,
        Err(err) => {
            error!(?err, "failed to encode error");
            return 1;
        }
    };
    doc["cniVersion"] = conf_version.into();
    if let Err(err) = write_doc(out, &doc) {
        error!(?err, "failed to write error");
    }
    1
}
