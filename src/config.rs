//! Command-line arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};

use crate::{BUILD_DATE, COMMIT, VERSION};

/// Cluster Upgrade Orchestrator
///
/// Upgrades the Kubernetes version, infrastructure templates, providers and
/// addons of a Cluster API managed cluster, one stage at a time.
#[derive(Parser, Debug, Clone)]
#[command(name = "cuo")]
#[command(about = "Cluster API cluster upgrade orchestrator")]
#[command(version = const_format::formatcp!(
    "{} (commit: {}, build date: {})",
    VERSION, COMMIT, BUILD_DATE
))]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,

    /// Override the addon manifest directory named in the request file
    #[arg(long, env = "CUO_MANIFEST_DIR", global = true)]
    pub manifest_dir: Option<PathBuf>,
}

#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Upgrade the Kubernetes version of a cluster
    Cluster {
        /// Path to the request YAML file
        request: PathBuf,
    },

    /// Upgrade a list of addons on a cluster
    Addons {
        /// Path to the request YAML file
        request: PathBuf,
    },

    /// Upgrade the management cluster's providers
    Providers {
        /// Path to the request YAML file
        request: PathBuf,
    },
}

impl Command {
    pub const fn request_path(&self) -> &PathBuf {
        match self {
            Self::Cluster { request } | Self::Addons { request } | Self::Providers { request } => {
                request
            }
        }
    }

    pub const fn name(&self) -> &'static str {
        match self {
            Self::Cluster { .. } => "cluster",
            Self::Addons { .. } => "addons",
            Self::Providers { .. } => "providers",
        }
    }
}
