//! Process role and environment configuration.
//!
//! # Environment Variables
//!
//! - `MOLT_IS_CHILD`: set to `true` by the parent on re-exec. Read once at startup.
//! - `MOLT_MULTI`: run in multi-process mode. Default: `false`
//! - `MOLT_MAX_WAIT_SECS`: hook wait budget in seconds. Default: `15`

use std::fmt;
use std::time::Duration;

use tracing::warn;

use crate::handoff::ENV_IS_CHILD;

/// Environment variable selecting multi-process mode.
pub const ENV_MULTI: &str = "MOLT_MULTI";

/// Environment variable overriding the hook wait budget.
pub const ENV_MAX_WAIT_SECS: &str = "MOLT_MAX_WAIT_SECS";

/// Default wait budget for lifecycle hooks.
pub const DEFAULT_MAX_WAIT: Duration = Duration::from_secs(15);

/// Wait budget forced by SIGINT, SIGTERM, SIGABRT and SIGKILL.
pub const SEVERE_MAX_WAIT: Duration = Duration::from_secs(1);

/// Which side of the handoff this process is on.
///
/// Decided once at startup and fixed for the life of the process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Single-process mode, started cold.
    SingleMaster,
    /// Single-process mode, re-executed by a reloading parent.
    SingleChild,
    /// Multi-process mode, owns the listeners.
    MultiMaster,
    /// Multi-process mode, serves on listeners owned by a master.
    MultiWorker,
}

impl Role {
    pub fn from_flags(is_child: bool, multi: bool) -> Self {
        match (multi, is_child) {
            (false, false) => Role::SingleMaster,
            (false, true) => Role::SingleChild,
            (true, false) => Role::MultiMaster,
            (true, true) => Role::MultiWorker,
        }
    }

    /// Detect the role from `MOLT_IS_CHILD` and the configured mode.
    pub fn detect(multi: bool) -> Self {
        let is_child = std::env::var(ENV_IS_CHILD)
            .map(|v| truthy(&v))
            .unwrap_or(false);
        Self::from_flags(is_child, multi)
    }

    pub fn is_multi(&self) -> bool {
        matches!(self, Role::MultiMaster | Role::MultiWorker)
    }

    pub fn is_child(&self) -> bool {
        matches!(self, Role::SingleChild | Role::MultiWorker)
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::SingleMaster => write!(f, "single-master"),
            Role::SingleChild => write!(f, "single-child"),
            Role::MultiMaster => write!(f, "multi-master"),
            Role::MultiWorker => write!(f, "multi-worker"),
        }
    }
}

/// Orchestrator configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraceConfig {
    /// Wait budget for lifecycle hooks.
    pub max_wait: Duration,
    /// Multi-process mode.
    pub multi: bool,
}

impl Default for GraceConfig {
    fn default() -> Self {
        Self {
            max_wait: DEFAULT_MAX_WAIT,
            multi: false,
        }
    }
}

impl GraceConfig {
    /// Load configuration from `MOLT_MAX_WAIT_SECS` and `MOLT_MULTI`.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let max_wait = match lookup(ENV_MAX_WAIT_SECS) {
            Some(raw) => match raw.trim().parse::<u64>() {
                Ok(secs) => Duration::from_secs(secs),
                Err(_) => {
                    warn!(value = %raw, "Ignoring invalid {}", ENV_MAX_WAIT_SECS);
                    DEFAULT_MAX_WAIT
                }
            },
            None => DEFAULT_MAX_WAIT,
        };

        let multi = lookup(ENV_MULTI).map(|v| truthy(&v)).unwrap_or(false);

        Self { max_wait, multi }
    }

    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = max_wait;
        self
    }

    pub fn with_multi(mut self, multi: bool) -> Self {
        self.multi = multi;
        self
    }
}

/// Boolean reading of an environment value.
///
/// Empty, `0`, `false`, `off` and `no` (any case) are false; anything else is true.
pub fn truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "" | "0" | "false" | "off" | "no"
    )
}
