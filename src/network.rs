//! Network and proxy settings inferred from a cluster, fed to addon rendering.

use std::fmt;
use std::net::IpAddr;

use anyhow::{Context, Result, bail};
use k8s_openapi::api::core::v1::ConfigMap;
use kube::api::DynamicObject;
use serde_json::Value;
use tracing::debug;

use crate::k8s::{ObjectStore, ResourceKind};

/// ConfigMap holding the addon manager's proxy settings.
pub const PROXY_CONFIG_MAP: &str = "kapp-controller-config";
pub const PROXY_CONFIG_NAMESPACE: &str = "tkg-system";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpFamily {
    V4,
    V6,
}

impl IpFamily {
    /// Classify a CIDR block by its address part.
    fn of(cidr: &str) -> Result<Self> {
        let (addr, prefix) = cidr.trim().split_once('/').unwrap_or((cidr.trim(), ""));
        let family = match addr.parse::<IpAddr>() {
            Ok(IpAddr::V4(_)) => Self::V4,
            Ok(IpAddr::V6(_)) => Self::V6,
            Err(_) => bail!("could not parse CIDR '{cidr}'"),
        };
        let max_prefix = match family {
            Self::V4 => 32,
            Self::V6 => 128,
        };
        if !prefix.is_empty() && !prefix.parse::<u8>().is_ok_and(|p| p <= max_prefix) {
            bail!("could not parse CIDR '{cidr}'");
        }
        Ok(family)
    }
}

impl fmt::Display for IpFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4 => write!(f, "ipv4"),
            Self::V6 => write!(f, "ipv6"),
        }
    }
}

/// IP family label plus comma-joined CIDR strings.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    /// `ipv4`, `ipv6`, `ipv4,ipv6` or `ipv6,ipv4`.
    pub ip_family: String,
    pub cluster_cidr: String,
    pub service_cidr: String,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            ip_family: IpFamily::V4.to_string(),
            cluster_cidr: String::new(),
            service_cidr: String::new(),
        }
    }
}

impl NetworkConfig {
    /// Infer the IP family from service CIDRs first, then pod CIDRs.
    ///
    /// Families are listed in the order their first CIDR appears. A block
    /// that does not parse as a CIDR is an error.
    pub fn from_cidrs(services: &[String], pods: &[String]) -> Result<Self> {
        let mut families: Vec<IpFamily> = Vec::with_capacity(2);
        let blocks = services
            .iter()
            .map(|c| ("services", c))
            .chain(pods.iter().map(|c| ("pods", c)));
        for (range, cidr) in blocks {
            let family = IpFamily::of(cidr).with_context(|| format!("Invalid {range} CIDR"))?;
            if !families.contains(&family) {
                families.push(family);
            }
        }

        let ip_family = if families.is_empty() {
            IpFamily::V4.to_string()
        } else {
            families
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join(",")
        };

        Ok(Self {
            ip_family,
            cluster_cidr: pods.join(","),
            service_cidr: services.join(","),
        })
    }

    /// Read `spec.clusterNetwork` from a Cluster object.
    pub fn from_cluster(cluster: &DynamicObject) -> Result<Self> {
        let network = &cluster.data["spec"]["clusterNetwork"];
        Self::from_cidrs(
            &cidr_blocks(&network["services"]),
            &cidr_blocks(&network["pods"]),
        )
    }
}

fn cidr_blocks(range: &Value) -> Vec<String> {
    range["cidrBlocks"]
        .as_array()
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// HTTP proxy settings of a cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProxyConfig {
    pub http_proxy: String,
    pub https_proxy: String,
    pub no_proxy: String,
}

impl ProxyConfig {
    pub fn enabled(&self) -> bool {
        !self.http_proxy.is_empty()
    }

    /// Read proxy settings from the target cluster; a missing ConfigMap yields empty values.
    pub async fn read(store: &dyn ObjectStore) -> Result<Self> {
        let Some(obj) = store
            .get(ResourceKind::ConfigMap, PROXY_CONFIG_NAMESPACE, PROXY_CONFIG_MAP)
            .await
            .with_context(|| {
                format!("Failed to get ConfigMap {PROXY_CONFIG_NAMESPACE}/{PROXY_CONFIG_MAP}")
            })?
        else {
            debug!(
                "ConfigMap {}/{} not found, assuming no proxy",
                PROXY_CONFIG_NAMESPACE, PROXY_CONFIG_MAP
            );
            return Ok(Self::default());
        };

        let config_map: ConfigMap = obj.try_parse().with_context(|| {
            format!("{PROXY_CONFIG_NAMESPACE}/{PROXY_CONFIG_MAP} is not a valid ConfigMap")
        })?;
        let mut data = config_map.data.unwrap_or_default();
        let mut take = |key: &str| data.remove(key).unwrap_or_default();
        Ok(Self {
            http_proxy: take("httpProxy"),
            https_proxy: take("httpsProxy"),
            no_proxy: take("noProxy"),
        })
    }
}
