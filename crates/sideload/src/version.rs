//! Component version parsing and minimum-version gating.

use anyhow::{anyhow, bail, Context, Result};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::Deserialize;

use crate::config::TidbConfig;

pub fn required_tidb_version() -> Version {
    Version::new(2, 1, 0)
}

pub fn required_pd_version() -> Version {
    Version::new(2, 1, 0)
}

pub fn required_tikv_version() -> Version {
    Version::new(2, 1, 0)
}

/// Extract the server semver from a TiDB version string.
///
/// The string is generated by `git describe --tags`, e.g.
/// `5.7.10-TiDB-v2.1.0-rc.1-7-g38c939f`, `5.7.10-TiDB-v2.0.4-1-g06a0bf5` or
/// `5.7.10-TiDB-v2.0.7`; a trailing `-<n>-g<hash>` commit suffix is dropped.
pub fn extract_tidb_version(version: &str) -> Result<Version> {
    let segments: Vec<&str> = version.split('-').collect();
    let end = match segments.len() {
        3 | 4 => segments.len(),
        5 | 6 => segments.len() - 2,
        _ => bail!("not a valid TiDB version: {version}"),
    };
    let raw = segments[2..end].join("-");
    let raw = raw.strip_prefix('v').unwrap_or(&raw);
    Version::parse(raw).map_err(|_| anyhow!("not a valid TiDB version: {version}"))
}

pub fn check_version(component: &str, expected: &Version, actual: &Version) -> Result<()> {
    if actual >= expected {
        return Ok(());
    }
    bail!("{component} version too old, expected '>={expected}', found '{actual}'")
}

#[derive(Deserialize)]
struct TidbStatus {
    #[serde(alias = "Version")]
    version: String,
}

#[derive(Deserialize)]
struct StoresPayload {
    #[serde(alias = "Stores")]
    stores: Vec<StoreEntry>,
}

#[derive(Deserialize)]
struct StoreEntry {
    #[serde(alias = "Store")]
    store: StoreInfo,
}

#[derive(Deserialize)]
struct StoreInfo {
    #[serde(alias = "Address")]
    address: String,
    #[serde(alias = "Version")]
    version: String,
}

async fn get_json<T: DeserializeOwned>(client: &reqwest::Client, url: &str) -> Result<T> {
    client
        .get(url)
        .send()
        .await
        .with_context(|| format!("probe {url}"))?
        .error_for_status()
        .with_context(|| format!("probe {url}"))?
        .json()
        .await
        .with_context(|| format!("decode response of {url}"))
}

/// Probe the server's status port and gate on the embedded semver.
pub async fn check_tidb_version(client: &reqwest::Client, tidb: &TidbConfig) -> Result<()> {
    let url = format!("http://{}:{}/status", tidb.host, tidb.status_port);
    let status: TidbStatus = get_json(client, &url).await?;
    let version = extract_tidb_version(&status.version)?;
    check_version("TiDB", &required_tidb_version(), &version)
}

/// Gate on the cluster version PD reports.
pub async fn check_pd_version(client: &reqwest::Client, pd_addr: &str) -> Result<()> {
    let url = format!("http://{pd_addr}/pd/api/v1/config/cluster-version");
    let raw: String = get_json(client, &url).await?;
    let raw = raw.trim().trim_start_matches('v').to_string();
    let version =
        Version::parse(&raw).with_context(|| format!("invalid cluster version {raw}"))?;
    check_version("PD", &required_pd_version(), &version)
}

/// Gate on the version of every store PD knows about.
pub async fn check_tikv_version(client: &reqwest::Client, pd_addr: &str) -> Result<()> {
    let url = format!("http://{pd_addr}/pd/api/v1/stores");
    let payload: StoresPayload = get_json(client, &url).await?;

    for entry in &payload.stores {
        let raw = entry.store.version.trim_start_matches('v');
        let version = Version::parse(raw).with_context(|| entry.store.address.clone())?;
        let component = format!("TiKV (at {})", entry.store.address);
        check_version(&component, &required_tikv_version(), &version)?;
    }
    Ok(())
}
