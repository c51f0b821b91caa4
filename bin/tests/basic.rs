use std::{
    collections::HashSet,
    io::Write,
    path::Path,
    process::{Child, Command, Stdio},
};

use anyhow::{Context, Result};
use cni_core::tracing;
use serde_json::Value;
use tracing_test::traced_test;

fn conf(data_dir: &Path) -> String {
    serde_json::json!({
        "cniVersion": "1.0.0",
        "name": "testnet",
        "ipam": {
            "type": "host-local",
            "dataDir": data_dir,
            "ranges": [
                [{"subnet": "10.10.0.0/24", "rangeStart": "10.10.0.10", "rangeEnd": "10.10.0.50"}],
                [{"subnet": "2001:db8:10::/64"}]
            ],
            "routes": [{"dst": "0.0.0.0/0"}]
        }
    })
    .to_string()
}

fn spawn(command: &str, container_id: &str, stdin: &str) -> Result<Child> {
    let mut child = Command::new(env!("CARGO_BIN_EXE_host-local"))
        .env("CNI_COMMAND", command)
        .env("CNI_CONTAINERID", container_id)
        .env("CNI_NETNS", format!("/var/run/netns/{container_id}"))
        .env("CNI_IFNAME", "eth0")
        .env("CNI_PATH", "/opt/cni/bin")
        .env("CNI_LOG", "debug")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()?;
    child
        .stdin
        .take()
        .context("stdin is piped")?
        .write_all(stdin.as_bytes())?;
    Ok(child)
}

/// returns the exit code & the parsed stdout, `Null` when nothing was written
fn wait(child: Child) -> Result<(i32, Value)> {
    let out = child.wait_with_output()?;
    let doc = if out.stdout.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&out.stdout)?
    };
    Ok((out.status.code().context("killed by signal")?, doc))
}

fn invoke(command: &str, container_id: &str, stdin: &str) -> Result<(i32, Value)> {
    wait(spawn(command, container_id, stdin)?)
}

#[test]
#[traced_test]
/// runs a container through ADD, CHECK & DEL, then checks the lease is gone
fn test_lifecycle() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let conf = conf(dir.path());

    let (code, doc) = invoke("ADD", "c1", &conf)?;
    assert_eq!(code, 0, "{doc}");
    assert_eq!(doc["cniVersion"], "1.0.0");
    assert_eq!(doc["ips"][0]["address"], "10.10.0.10/24");
    assert_eq!(doc["ips"][0]["gateway"], "10.10.0.1");
    assert_eq!(doc["ips"][1]["address"], "2001:db8:10::2/64");
    assert_eq!(doc["routes"][0]["dst"], "0.0.0.0/0");
    assert!(dir.path().join("testnet").join("leases.db").exists());

    let (code, doc) = invoke("CHECK", "c1", &conf)?;
    assert_eq!(code, 0, "{doc}");
    assert_eq!(doc, Value::Null);

    let (code, _) = invoke("DEL", "c1", &conf)?;
    assert_eq!(code, 0);
    // twice is fine
    let (code, _) = invoke("DEL", "c1", &conf)?;
    assert_eq!(code, 0);

    let (code, doc) = invoke("CHECK", "c1", &conf)?;
    assert_eq!(code, 1);
    assert_eq!(doc["code"], 999);
    assert_eq!(
        doc["msg"],
        "host-local: Failed to find address added by container c1"
    );
    Ok(())
}

#[test]
#[traced_test]
fn test_concurrent_adds_get_distinct_addresses() -> Result<()> {
    let dir = tempfile::tempdir()?;
    let conf = conf(dir.path());
    // create the store up front
    let (code, _) = invoke("ADD", "first", &conf)?;
    assert_eq!(code, 0);

    let children = (0..6)
        .map(|i| spawn("ADD", &format!("c{i}"), &conf))
        .collect::<Result<Vec<_>>>()?;
    let mut seen = HashSet::new();
    for child in children {
        let (code, doc) = wait(child)?;
        assert_eq!(code, 0, "{doc}");
        let addr = doc["ips"][0]["address"]
            .as_str()
            .context("address is a string")?
            .to_owned();
        assert!(seen.insert(addr), "address handed out twice");
    }
    assert!(!seen.contains("10.10.0.10/24"));
    Ok(())
}

#[test]
fn test_version() -> Result<()> {
    let (code, doc) = invoke("VERSION", "", "")?;
    assert_eq!(code, 0);
    assert_eq!(doc["cniVersion"], "1.0.0");
    let versions = doc["supportedVersions"]
        .as_array()
        .context("supportedVersions is an array")?;
    assert!(versions.contains(&Value::from("0.4.0")));
    Ok(())
}

#[test]
fn test_errors() -> Result<()> {
    let dir = tempfile::tempdir()?;

    // missing CNI_CONTAINERID
    let (code, doc) = invoke("ADD", "", &conf(dir.path()))?;
    assert_eq!(code, 1);
    assert_eq!(doc["code"], 4);

    let (code, doc) = invoke("ADD", "c1", r#"{"cniVersion": "1.0.0", "name": "testnet"}"#)?;
    assert_eq!(code, 1);
    assert_eq!(doc["code"], 7);
    assert_eq!(doc["msg"], "IPAM config missing 'ipam' key");

    let (code, doc) = invoke("ADD", "c1", r#"{"cniVersion": "9.9.9", "name": "testnet"}"#)?;
    assert_eq!(code, 1);
    assert_eq!(doc["code"], 1);
    Ok(())
}
