//! Provider configuration
//!
//! Loaded from TOML or from the `HW_*` environment variables the Huawei
//! Cloud tooling uses.

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

pub const DEFAULT_CLOUD: &str = "myhuaweicloud.com";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required setting: {0}")]
    Missing(&'static str),

    #[error("Invalid value for {key}: {value}")]
    Invalid { key: &'static str, value: String },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub region: String,
    pub project_id: String,
    /// IAM token sent as `X-Auth-Token`
    pub auth_token: Option<String>,
    /// Domain suffix of the public endpoints
    pub cloud: String,
    /// Per-service endpoint overrides (service name -> base URL)
    pub endpoints: HashMap<String, String>,
    /// Skip TLS certificate verification
    pub insecure: bool,
    /// Attempts for submissions rejected while a parent resource is locked
    pub max_retries: u32,
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Multiplier applied to every poll delay and interval
    pub poll_scale: f64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            region: String::new(),
            project_id: String::new(),
            auth_token: None,
            cloud: DEFAULT_CLOUD.to_string(),
            endpoints: HashMap::new(),
            insecure: false,
            max_retries: 5,
            request_timeout: Duration::from_secs(60),
            poll_scale: 1.0,
        }
    }
}

impl Config {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: Config = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    /// Build configuration from the process environment
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary variable lookup
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let mut config = Config {
            region: lookup("HW_REGION_NAME").ok_or(ConfigError::Missing("HW_REGION_NAME"))?,
            project_id: lookup("HW_PROJECT_ID").unwrap_or_default(),
            auth_token: lookup("HW_AUTH_TOKEN"),
            ..Config::default()
        };

        if let Some(cloud) = lookup("HW_CLOUD") {
            config.cloud = cloud;
        }
        if let Some(insecure) = lookup("HW_INSECURE") {
            config.insecure = matches!(insecure.as_str(), "1" | "true");
        }
        if let Some(retries) = lookup("HW_MAX_RETRIES") {
            config.max_retries = retries.parse().map_err(|_| ConfigError::Invalid {
                key: "HW_MAX_RETRIES",
                value: retries.clone(),
            })?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.region.is_empty() {
            return Err(ConfigError::Missing("region"));
        }
        if self.project_id.is_empty() {
            return Err(ConfigError::Missing("project_id"));
        }
        if !self.poll_scale.is_finite() || self.poll_scale <= 0.0 {
            return Err(ConfigError::Invalid {
                key: "poll_scale",
                value: self.poll_scale.to_string(),
            });
        }
        Ok(())
    }

    /// Base URL of a service, always ending with '/'
    pub fn endpoint(&self, service: &str) -> String {
        let url = match self.endpoints.get(service) {
            Some(url) => url.clone(),
            None => format!("https://{}.{}.{}/", service, self.region, self.cloud),
        };
        if url.ends_with('/') {
            url
        } else {
            format!("{}/", url)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn endpoint_defaults_to_regional_domain() {
        let config = Config {
            region: "cn-north-4".to_string(),
            project_id: "p1".to_string(),
            ..Config::default()
        };
        assert_eq!(
            config.endpoint("ecs"),
            "https://ecs.cn-north-4.myhuaweicloud.com/"
        );
    }

    #[test]
    fn endpoint_override_gets_trailing_slash() {
        let config = Config::from_toml_str(
            r#"
            region = "ap-southeast-1"
            project_id = "0123"
            request_timeout = "30s"

            [endpoints]
            cce = "http://127.0.0.1:8080"
            "#,
        )
        .unwrap();

        assert_eq!(config.endpoint("cce"), "http://127.0.0.1:8080/");
        assert_eq!(config.request_timeout, Duration::from_secs(30));
        assert_eq!(config.max_retries, 5);
    }

    #[test]
    fn from_lookup_reads_hw_variables() {
        let vars: HashMap<&str, &str> = [
            ("HW_REGION_NAME", "cn-south-1"),
            ("HW_PROJECT_ID", "proj"),
            ("HW_AUTH_TOKEN", "token"),
            ("HW_MAX_RETRIES", "3"),
        ]
        .into_iter()
        .collect();

        let config = Config::from_lookup(|k| vars.get(k).map(|v| v.to_string())).unwrap();
        assert_eq!(config.region, "cn-south-1");
        assert_eq!(config.auth_token.as_deref(), Some("token"));
        assert_eq!(config.max_retries, 3);
        assert_eq!(config.cloud, DEFAULT_CLOUD);
    }

    #[test]
    fn missing_region_is_reported() {
        let err = Config::from_lookup(|_| None).unwrap_err();
        assert_eq!(err.to_string(), "Missing required setting: HW_REGION_NAME");
    }

    #[test]
    fn non_finite_poll_scale_is_rejected() {
        let err = Config::from_toml_str(
            r#"
            region = "cn-north-4"
            project_id = "p"
            poll_scale = inf
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "poll_scale", .. }));
    }

    #[test]
    fn invalid_retry_count_is_reported() {
        let err = Config::from_lookup(|k| match k {
            "HW_REGION_NAME" => Some("cn-north-4".to_string()),
            "HW_PROJECT_ID" => Some("p".to_string()),
            "HW_MAX_RETRIES" => Some("many".to_string()),
            _ => None,
        })
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "HW_MAX_RETRIES", .. }));
    }
}
