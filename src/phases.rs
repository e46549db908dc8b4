//! Upgrade stage implementations.
//!
//! Each stage runs to completion before the next one starts. The only
//! suspension point is the bounded convergence poll in [`wait_until`].

pub mod addons;
pub mod autoscaler;
pub mod control_plane;
pub mod nodegroups;
pub mod preflight;
pub mod providers;
pub mod readiness;
pub mod rollout;
pub mod templates;

use std::fmt;
use std::future::Future;
use std::time::Duration;

use anyhow::Result;
use tokio::time::{Instant, sleep};
use tracing::{debug, warn};

/// Poll interval and overall deadline of a convergence wait.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WaitOptions {
    pub interval: Duration,
    pub timeout: Duration,
}

impl WaitOptions {
    pub const fn new(interval: Duration, timeout: Duration) -> Self {
        Self { interval, timeout }
    }
}

/// Stages of a cluster upgrade, named in top-level errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpgradeStage {
    Preflight,
    PreNodeAddons,
    Templates,
    ControlPlane,
    Workers,
    Providers,
    PostNodeAddons,
    Autoscaler,
    AddonReadiness,
    Addons,
}

impl fmt::Display for UpgradeStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Preflight => write!(f, "Preflight"),
            Self::PreNodeAddons => write!(f, "PreNodeAddons"),
            Self::Templates => write!(f, "Templates"),
            Self::ControlPlane => write!(f, "ControlPlane"),
            Self::Workers => write!(f, "Workers"),
            Self::Providers => write!(f, "Providers"),
            Self::PostNodeAddons => write!(f, "PostNodeAddons"),
            Self::Autoscaler => write!(f, "Autoscaler"),
            Self::AddonReadiness => write!(f, "AddonReadiness"),
            Self::Addons => write!(f, "Addons"),
        }
    }
}

/// Poll `check` until it returns `true` or the timeout elapses.
///
/// Returns `Ok(false)` on timeout. Errors from `check` are logged and the
/// poll continues, so a transient read failure does not end the wait. A
/// timeout too large to represent as a deadline never expires.
pub async fn wait_until<F, Fut>(options: WaitOptions, mut check: F) -> Result<bool>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<bool>>,
{
    let deadline = Instant::now().checked_add(options.timeout);
    let mut attempt = 0u32;
    loop {
        attempt = attempt.saturating_add(1);
        match check().await {
            Ok(true) => return Ok(true),
            Ok(false) => debug!("Condition not met after attempt {}", attempt),
            Err(e) => warn!("Poll attempt {} failed: {:#}", attempt, e),
        }

        let pause = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(false);
                }
                options.interval.min(deadline - now)
            }
            None => options.interval,
        };
        sleep(pause).await;
    }
}
