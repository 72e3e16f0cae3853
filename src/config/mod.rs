//! Configuration module

use std::time::Duration;

use serde::Deserialize;

use crate::error::{GateError, GateResult};
use crate::models::RefreshPolicy;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub credentials: CredentialsConfig,
    pub device: DeviceConfig,
    #[serde(default)]
    pub polling: PollingConfig,
    #[serde(default)]
    pub api: ApiConfig,
}

/// OAuth client and resource-owner credentials, immutable per session
#[derive(Clone, Deserialize)]
pub struct CredentialsConfig {
    pub client_id: String,
    pub client_secret: String,
    pub username: String,
    pub password: String,
    #[serde(default = "default_redirect_uri")]
    pub redirect_uri: String,
}

// Keep secrets out of debug logs
impl std::fmt::Debug for CredentialsConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CredentialsConfig")
            .field("client_id", &self.client_id)
            .field("username", &self.username)
            .field("redirect_uri", &self.redirect_uri)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeviceConfig {
    pub device_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PollingConfig {
    #[serde(default = "default_poll_interval")]
    pub poll_interval_secs: u64,
    #[serde(default = "default_moving_poll_interval")]
    pub moving_poll_interval_secs: u64,
    #[serde(default = "default_motion_timeout")]
    pub motion_timeout_secs: u64,
    #[serde(default)]
    pub refresh_policy: RefreshPolicy,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: default_poll_interval(),
            moving_poll_interval_secs: default_moving_poll_interval(),
            motion_timeout_secs: default_motion_timeout(),
            refresh_policy: RefreshPolicy::default(),
        }
    }
}

impl PollingConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn moving_poll_interval(&self) -> Duration {
        Duration::from_secs(self.moving_poll_interval_secs)
    }

    pub fn motion_timeout(&self) -> Duration {
        Duration::from_secs(self.motion_timeout_secs)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    #[serde(default = "default_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_origin")]
    pub origin: String,
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            ws_url: default_ws_url(),
            origin: default_origin(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_redirect_uri() -> String {
    "https://beta.cameconnect.net/role".to_string()
}

fn default_poll_interval() -> u64 {
    300
}

fn default_moving_poll_interval() -> u64 {
    2
}

fn default_motion_timeout() -> u64 {
    120
}

fn default_base_url() -> String {
    "https://app.cameconnect.net/api".to_string()
}

fn default_ws_url() -> String {
    "wss://app.cameconnect.net/api/events-real-time".to_string()
}

fn default_origin() -> String {
    "https://www.cameconnect.net".to_string()
}

fn default_request_timeout() -> u64 {
    20
}

impl Config {
    pub fn load() -> anyhow::Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::with_name("config/default").required(false))
            .add_source(config::Environment::with_prefix("CAMECONNECT").separator("__"))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        config.validate()?;

        Ok(config)
    }

    pub fn validate(&self) -> GateResult<()> {
        let creds = &self.credentials;
        let required = [
            ("client_id", &creds.client_id),
            ("client_secret", &creds.client_secret),
            ("username", &creds.username),
            ("password", &creds.password),
            ("redirect_uri", &creds.redirect_uri),
            ("device_id", &self.device.device_id),
        ];
        for (name, value) in required {
            if value.trim().is_empty() {
                return Err(GateError::Config(format!("{} must not be empty", name)));
            }
        }

        if self.polling.poll_interval_secs == 0
            || self.polling.moving_poll_interval_secs == 0
            || self.polling.motion_timeout_secs == 0
        {
            return Err(GateError::Config(
                "polling intervals must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn from_json(value: serde_json::Value) -> Config {
        serde_json::from_value(value).unwrap()
    }

    fn minimal() -> serde_json::Value {
        serde_json::json!({
            "credentials": {
                "client_id": "cid",
                "client_secret": "secret",
                "username": "user@example.com",
                "password": "hunter2"
            },
            "device": { "device_id": "4242" }
        })
    }

    #[test]
    fn test_defaults_applied() {
        let config = from_json(minimal());
        assert_eq!(config.credentials.redirect_uri, "https://beta.cameconnect.net/role");
        assert_eq!(config.polling.poll_interval(), Duration::from_secs(300));
        assert_eq!(config.polling.moving_poll_interval(), Duration::from_secs(2));
        assert_eq!(config.polling.motion_timeout(), Duration::from_secs(120));
        assert_eq!(config.polling.refresh_policy, RefreshPolicy::Hybrid);
        assert_eq!(config.api.base_url, "https://app.cameconnect.net/api");
        assert_eq!(config.api.origin, "https://www.cameconnect.net");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_refresh_policy_parsing() {
        let mut value = minimal();
        value["polling"] = serde_json::json!({ "refresh_policy": "push" });
        assert_eq!(from_json(value).polling.refresh_policy, RefreshPolicy::PushOnly);
    }

    #[test]
    fn test_validate_rejects_empty_fields() {
        let mut value = minimal();
        value["device"]["device_id"] = serde_json::json!("  ");
        let err = from_json(value).validate().unwrap_err();
        assert!(matches!(err, GateError::Config(msg) if msg.contains("device_id")));
    }

    #[test]
    fn test_validate_rejects_zero_interval() {
        let mut value = minimal();
        value["polling"] = serde_json::json!({ "moving_poll_interval_secs": 0 });
        assert!(from_json(value).validate().is_err());
    }

    #[test]
    fn test_debug_hides_secrets() {
        let config = from_json(minimal());
        let rendered = format!("{:?}", config.credentials);
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("secret"));
    }
}
