use std::time::Duration;

use serde::Deserialize;

use bwlimit_core::error::{BwError, Result};
use bwlimit_core::BandwidthLimit;

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewayConfig {
    pub version: u32,

    #[serde(default)]
    pub gateway: GatewaySection,

    #[serde(default)]
    pub shaping: ShapingSection,

    #[serde(default)]
    pub admin: AdminSection,
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        if self.version != 1 {
            return Err(BwError::UnsupportedVersion);
        }
        self.gateway.validate()?;
        self.shaping.validate()?;
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GatewaySection {
    #[serde(default = "default_listen")]
    pub listen: String,

    #[serde(default = "default_ping_interval_ms")]
    pub ping_interval_ms: u64,

    #[serde(default = "default_idle_timeout_ms")]
    pub idle_timeout_ms: u64,

    /// `EnvFilter` directive used when `RUST_LOG` is unset.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

impl Default for GatewaySection {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            ping_interval_ms: default_ping_interval_ms(),
            idle_timeout_ms: default_idle_timeout_ms(),
            log_filter: default_log_filter(),
        }
    }
}

impl GatewaySection {
    pub fn validate(&self) -> Result<()> {
        if !(5000..=120000).contains(&self.ping_interval_ms) {
            return Err(BwError::BadConfig(
                "gateway.ping_interval_ms must be between 5000 and 120000".into(),
            ));
        }
        if !(10000..=600000).contains(&self.idle_timeout_ms) {
            return Err(BwError::BadConfig(
                "gateway.idle_timeout_ms must be between 10000 and 600000".into(),
            ));
        }
        if self.idle_timeout_ms <= self.ping_interval_ms {
            return Err(BwError::BadConfig(
                "gateway.idle_timeout_ms must be greater than ping_interval_ms".into(),
            ));
        }
        Ok(())
    }
}

fn default_listen() -> String {
    "0.0.0.0:8080".into()
}
fn default_ping_interval_ms() -> u64 {
    20000
}
fn default_idle_timeout_ms() -> u64 {
    60000
}
fn default_log_filter() -> String {
    "info".into()
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ShapingSection {
    /// Window length of every shaping stage.
    #[serde(default = "default_check_interval_ms")]
    pub check_interval_ms: u64,

    #[serde(default = "default_policy_path")]
    pub policy_path: String,

    /// Default limit used until the policy file exists.
    #[serde(default = "default_initial_limit")]
    pub initial_default_limit: BandwidthLimit,

    /// Aliases whose connections are never shaped.
    #[serde(default)]
    pub bypass_users: Vec<String>,
}

impl Default for ShapingSection {
    fn default() -> Self {
        Self {
            check_interval_ms: default_check_interval_ms(),
            policy_path: default_policy_path(),
            initial_default_limit: default_initial_limit(),
            bypass_users: Vec::new(),
        }
    }
}

impl ShapingSection {
    pub fn validate(&self) -> Result<()> {
        if !(100..=60000).contains(&self.check_interval_ms) {
            return Err(BwError::BadConfig(
                "shaping.check_interval_ms must be between 100 and 60000".into(),
            ));
        }
        if self.policy_path.trim().is_empty() {
            return Err(BwError::BadConfig("shaping.policy_path must not be empty".into()));
        }
        Ok(())
    }

    pub fn check_interval(&self) -> Duration {
        Duration::from_millis(self.check_interval_ms)
    }
}

fn default_check_interval_ms() -> u64 {
    1000
}
fn default_policy_path() -> String {
    "bwlimit-policy.yaml".into()
}
fn default_initial_limit() -> BandwidthLimit {
    BandwidthLimit::DEFAULT
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AdminSection {
    #[serde(default = "default_admin_enabled")]
    pub enabled: bool,
}

impl Default for AdminSection {
    fn default() -> Self {
        Self {
            enabled: default_admin_enabled(),
        }
    }
}

fn default_admin_enabled() -> bool {
    true
}
