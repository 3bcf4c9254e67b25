//! Environment-driven configuration.
//!
//! Everything is read once at startup. Empty values count as unset, so a
//! deployment can blank a variable without removing it.

use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::notify::{Endpoint, Notifier};
use crate::reconcile::ReconcileSettings;
use crate::server::AccessLogConfig;
use crate::switch::RetryConfig;
use crate::switch::cli::{CliDialect, DeviceType, UnsupportedDeviceType};
use crate::switch::ssh::SshTarget;
use crate::types::{InvalidVlanId, VlanId};
use crate::webhooks::SignatureVerifier;

const DEFAULT_HTTP_PORT: u16 = 8080;
const DEFAULT_SSH_PORT: u16 = 22;
const DEFAULT_SWITCH_TIMEOUT_SECS: u64 = 30;
const DEFAULT_RECONCILE_BUDGET_SECS: u64 = 120;
const DEFAULT_LOCK_WAIT_SECS: u64 = 180;
const DEFAULT_ENDPOINT_TIMEOUT_SECS: u64 = 30;
const DEFAULT_VLAN_NAME_PREFIX: &str = "reservation";
const MAX_TIMEOUT_SECS: u64 = 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("required environment variable {0} is not set")]
    Missing(&'static str),

    #[error("{key}={value:?} is not a valid {expected}")]
    Invalid {
        key: &'static str,
        value: String,
        expected: &'static str,
    },

    #[error("DEFAULT_VLAN_ID: {0}")]
    DefaultVlan(#[from] InvalidVlanId),

    #[error("SWITCH_DEVICE_TYPE: {0}")]
    DeviceType(#[from] UnsupportedDeviceType),
}

/// Connection details for the managed switch.
#[derive(Debug, Clone)]
pub struct SwitchConfig {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: Option<String>,
    pub identity_file: Option<PathBuf>,
    pub device_type: DeviceType,
    pub timeout: Duration,
    pub save_config: bool,
}

/// Retry tunables for device operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub jitter_percent: u8,
}

#[derive(Debug, Clone)]
pub struct Config {
    pub http_port: u16,
    pub switch: SwitchConfig,
    pub default_vlan: VlanId,
    pub vlan_name_prefix: String,
    pub webhook_secret: Option<String>,
    pub reconcile_budget: Duration,
    pub lock_wait: Duration,
    pub retry: RetrySettings,
    pub notification: Option<Endpoint>,
    pub webhook_log: Option<Endpoint>,
    pub disable_healthz_logs: bool,
}

impl Config {
    /// Reads the configuration from the process environment.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Reads the configuration through `lookup`, which maps a variable name to
    /// its value.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let switch = SwitchConfig {
            host: env.required("SWITCH_HOST")?,
            port: env.parse("SWITCH_PORT", DEFAULT_SSH_PORT, "port number")?,
            username: env.required("SWITCH_USERNAME")?,
            password: env.get("SWITCH_PASSWORD"),
            identity_file: env.get("SWITCH_IDENTITY_FILE").map(PathBuf::from),
            device_type: match env.get("SWITCH_DEVICE_TYPE") {
                Some(s) => DeviceType::from_str(&s)?,
                None => DeviceType::default(),
            },
            timeout: env.seconds("SWITCH_TIMEOUT", DEFAULT_SWITCH_TIMEOUT_SECS)?,
            save_config: env.flag("SWITCH_SAVE_CONFIG", true)?,
        };

        let default_vlan = match env.get("DEFAULT_VLAN_ID") {
            Some(s) => VlanId::from_str(&s)?,
            None => VlanId::DEFAULT,
        };

        let retry = RetrySettings {
            max_attempts: env.parse(
                "RETRY_MAX_ATTEMPTS",
                RetryConfig::DEFAULT.max_attempts,
                "attempt count",
            )?,
            base_delay: env.millis("RETRY_BASE_DELAY_MS", RetryConfig::DEFAULT.initial_delay)?,
            max_delay: env.millis("RETRY_MAX_DELAY_MS", RetryConfig::DEFAULT.max_delay)?,
            jitter_percent: env.parse(
                "RETRY_JITTER_PERCENT",
                RetryConfig::DEFAULT.jitter_percent,
                "percentage",
            )?,
        };
        if retry.jitter_percent > 100 {
            return Err(ConfigError::Invalid {
                key: "RETRY_JITTER_PERCENT",
                value: retry.jitter_percent.to_string(),
                expected: "percentage between 0 and 100",
            });
        }

        let notification = match env.get("NOTIFICATION_ENDPOINT") {
            Some(url) => Some(Endpoint::new(
                url,
                env.seconds("NOTIFICATION_TIMEOUT", DEFAULT_ENDPOINT_TIMEOUT_SECS)?,
            )),
            None => None,
        };
        let webhook_log = match env.get("WEBHOOK_LOG_ENDPOINT") {
            Some(url) => Some(Endpoint::new(
                url,
                env.seconds("WEBHOOK_LOG_TIMEOUT", DEFAULT_ENDPOINT_TIMEOUT_SECS)?,
            )),
            None => None,
        };

        Ok(Config {
            http_port: env.parse("PORT", DEFAULT_HTTP_PORT, "port number")?,
            switch,
            default_vlan,
            vlan_name_prefix: env
                .get("VLAN_NAME_PREFIX")
                .unwrap_or_else(|| DEFAULT_VLAN_NAME_PREFIX.to_string()),
            webhook_secret: env.get("WEBHOOK_SECRET"),
            reconcile_budget: env.seconds("RECONCILE_BUDGET", DEFAULT_RECONCILE_BUDGET_SECS)?,
            lock_wait: env.seconds("LOCK_WAIT_TIMEOUT", DEFAULT_LOCK_WAIT_SECS)?,
            retry,
            notification,
            webhook_log,
            disable_healthz_logs: env.flag("DISABLE_HEALTHZ_LOGS", true)?,
        })
    }

    pub fn ssh_target(&self) -> SshTarget {
        SshTarget {
            host: self.switch.host.clone(),
            port: self.switch.port,
            username: self.switch.username.clone(),
            password: self.switch.password.clone(),
            identity_file: self.switch.identity_file.clone(),
            connect_timeout: self.switch.timeout,
        }
    }

    pub fn cli_dialect(&self) -> CliDialect {
        CliDialect::new(self.switch.device_type, self.switch.save_config)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::new(
            self.retry.max_attempts,
            self.retry.base_delay,
            self.retry.max_delay,
            RetryConfig::DEFAULT.backoff_multiplier,
            self.retry.jitter_percent,
        )
    }

    pub fn reconcile_settings(&self) -> ReconcileSettings {
        ReconcileSettings {
            default_vlan: self.default_vlan,
            vlan_name_prefix: self.vlan_name_prefix.clone(),
            retry: self.retry_config(),
            operation_timeout: self.switch.timeout,
            run_budget: self.reconcile_budget,
            lock_wait: self.lock_wait,
        }
    }

    pub fn signature_verifier(&self) -> SignatureVerifier {
        SignatureVerifier::new(self.webhook_secret.clone())
    }

    pub fn notifier(&self) -> Notifier {
        Notifier::new(
            self.notification.clone(),
            self.webhook_log.clone(),
            self.webhook_secret.as_deref().map(str::as_bytes),
        )
    }

    pub fn access_log(&self) -> AccessLogConfig {
        AccessLogConfig {
            suppress_healthz: self.disable_healthz_logs,
        }
    }
}

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    fn get(&self, key: &str) -> Option<String> {
        (self.lookup)(key)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, key: &'static str) -> Result<String, ConfigError> {
        self.get(key).ok_or(ConfigError::Missing(key))
    }

    fn parse<T: FromStr>(
        &self,
        key: &'static str,
        default: T,
        expected: &'static str,
    ) -> Result<T, ConfigError> {
        match self.get(key) {
            Some(value) => value.parse().map_err(|_| ConfigError::Invalid {
                key,
                value,
                expected,
            }),
            None => Ok(default),
        }
    }

    fn seconds(&self, key: &'static str, default: u64) -> Result<Duration, ConfigError> {
        const EXPECTED: &str = "number of seconds, at most 86400";
        let secs = self.parse(key, default, EXPECTED)?;
        if secs > MAX_TIMEOUT_SECS {
            return Err(ConfigError::Invalid {
                key,
                value: secs.to_string(),
                expected: EXPECTED,
            });
        }
        Ok(Duration::from_secs(secs))
    }

    fn millis(&self, key: &'static str, default: Duration) -> Result<Duration, ConfigError> {
        let default = u64::try_from(default.as_millis()).unwrap_or(u64::MAX);
        self.parse(key, default, "number of milliseconds")
            .map(Duration::from_millis)
    }

    fn flag(&self, key: &'static str, default: bool) -> Result<bool, ConfigError> {
        match self.get(key) {
            None => Ok(default),
            Some(value) => match value.to_ascii_lowercase().as_str() {
                "true" | "1" | "yes" | "on" => Ok(true),
                "false" | "0" | "no" | "off" => Ok(false),
                _ => Err(ConfigError::Invalid {
                    key,
                    value,
                    expected: "boolean",
                }),
            },
        }
    }
}
