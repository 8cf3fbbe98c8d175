use std::net::SocketAddr;
use std::time::Duration;

use gateway_sdk::{JobTemplate, ResourceEnvelope};
use serde::Deserialize;

use crate::backoff::{BackoffConfig, BackoffError, BackoffPolicy, Jitter};
use crate::orchestrator::OrchestratorSettings;

/// Gateway settings, read from `GATEWAY_*` environment variables
/// (`GATEWAY_WORKER_RESOURCES__CPU_LIMIT=4` for nested fields).
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    pub instance_id: String,
    pub redis_url: Option<String>,
    pub job_api_url: String,
    pub job_api_token: Option<String>,
    pub worker_image: String,
    pub worker_port: u16,
    pub worker_resources: ResourceEnvelope,
    pub worker_idle_timeout_minutes: u32,
    pub mount_prefix: String,
    pub user_id_header: String,
    pub request_id_header: String,
    pub session_timeout_secs: u64,
    pub lock_lease_secs: u64,
    pub backoff_initial_ms: u64,
    pub backoff_max_ms: u64,
    pub backoff_multiplier: f64,
    pub backoff_jitter: String,
    pub probe_timeout_ms: u64,
    pub proxy_timeout_secs: u64,
    pub shutdown_grace_secs: u64,
    pub progress_log_interval_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8090)),
            log_filter: "info,beach_gateway=debug".into(),
            instance_id: "gateway-1".into(),
            redis_url: None,
            job_api_url: "http://127.0.0.1:8700".into(),
            job_api_token: None,
            worker_image: "beach-worker:latest".into(),
            worker_port: 8080,
            worker_resources: ResourceEnvelope::default(),
            worker_idle_timeout_minutes: 30,
            mount_prefix: "/session".into(),
            user_id_header: "x-user-id".into(),
            request_id_header: "x-request-id".into(),
            session_timeout_secs: 30,
            lock_lease_secs: 60,
            backoff_initial_ms: 250,
            backoff_max_ms: 2_000,
            backoff_multiplier: 2.0,
            backoff_jitter: "full".into(),
            probe_timeout_ms: 1_000,
            proxy_timeout_secs: 600,
            shutdown_grace_secs: 10,
            progress_log_interval_secs: 5,
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, config::ConfigError> {
        Self::from_source(
            config::Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true),
        )
    }

    fn from_source<S>(source: S) -> Result<Self, config::ConfigError>
    where
        S: config::Source + Send + Sync + 'static,
    {
        config::Config::builder()
            .add_source(source)
            .build()?
            .try_deserialize::<AppConfig>()
            .map(AppConfig::normalize)
    }

    fn normalize(mut self) -> Self {
        self.redis_url = Self::normalize_opt(self.redis_url.take());
        self.job_api_token = Self::normalize_opt(self.job_api_token.take());
        self.user_id_header = self.user_id_header.trim().to_ascii_lowercase();
        self.request_id_header = self.request_id_header.trim().to_ascii_lowercase();
        self
    }

    fn normalize_opt(value: Option<String>) -> Option<String> {
        value.and_then(|s| {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                None
            } else {
                Some(trimmed.to_string())
            }
        })
    }

    pub fn backoff_policy(&self) -> Result<BackoffPolicy, BackoffError> {
        BackoffPolicy::new(BackoffConfig {
            initial_delay: Duration::from_millis(self.backoff_initial_ms),
            max_delay: Duration::from_millis(self.backoff_max_ms),
            multiplier: self.backoff_multiplier,
            max_total_duration: Duration::from_secs(self.session_timeout_secs),
            jitter: self.backoff_jitter.parse::<Jitter>()?,
        })
    }

    pub fn orchestrator_settings(&self) -> Result<OrchestratorSettings, BackoffError> {
        Ok(OrchestratorSettings {
            ensure_timeout: Duration::from_secs(self.session_timeout_secs),
            lock_lease: Duration::from_secs(self.lock_lease_secs),
            backoff: self.backoff_policy()?,
            progress_interval: Duration::from_secs(self.progress_log_interval_secs),
        })
    }

    pub fn job_template(&self) -> JobTemplate {
        JobTemplate {
            image: self.worker_image.clone(),
            port: self.worker_port,
            resources: self.worker_resources.clone(),
            idle_timeout_minutes: self.worker_idle_timeout_minutes,
        }
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn proxy_timeout(&self) -> Duration {
        Duration::from_secs(self.proxy_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn from_vars(vars: &[(&str, &str)]) -> Result<AppConfig, config::ConfigError> {
        let source: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        AppConfig::from_source(
            config::Environment::with_prefix("GATEWAY")
                .prefix_separator("_")
                .separator("__")
                .try_parsing(true)
                .source(Some(source)),
        )
    }

    #[test]
    fn defaults_without_environment() {
        let cfg = from_vars(&[]).unwrap();
        assert_eq!(cfg.mount_prefix, "/session");
        assert_eq!(cfg.session_timeout_secs, 30);
        assert_eq!(cfg.proxy_timeout(), Duration::from_secs(600));
        assert!(cfg.redis_url.is_none());
        assert_eq!(cfg.worker_resources, ResourceEnvelope::default());
        assert!(cfg.orchestrator_settings().is_ok());
    }

    #[test]
    fn reads_prefixed_and_nested_values() {
        let cfg = from_vars(&[
            ("GATEWAY_REDIS_URL", "redis://cache:6379"),
            ("GATEWAY_SESSION_TIMEOUT_SECS", "45"),
            ("GATEWAY_BACKOFF_JITTER", "additive:100"),
            ("GATEWAY_USER_ID_HEADER", " X-Beach-User "),
            ("GATEWAY_WORKER_RESOURCES__CPU_LIMIT", "4"),
        ])
        .unwrap();
        assert_eq!(cfg.redis_url.as_deref(), Some("redis://cache:6379"));
        assert_eq!(cfg.session_timeout_secs, 45);
        assert_eq!(cfg.user_id_header, "x-beach-user");
        assert_eq!(cfg.worker_resources.cpu_limit, "4");
        assert_eq!(cfg.worker_resources.memory_limit, "4Gi");
        let policy = cfg.backoff_policy().unwrap();
        assert_eq!(
            policy.config().jitter,
            Jitter::Additive(Duration::from_millis(100))
        );
        assert_eq!(policy.config().max_total_duration, Duration::from_secs(45));
    }

    #[test]
    fn blank_redis_url_means_in_memory() {
        let cfg = from_vars(&[("GATEWAY_REDIS_URL", "  ")]).unwrap();
        assert!(cfg.redis_url.is_none());
    }

    #[test]
    fn invalid_backoff_is_rejected() {
        let cfg = from_vars(&[("GATEWAY_BACKOFF_MULTIPLIER", "0.5")]).unwrap();
        assert!(matches!(
            cfg.backoff_policy(),
            Err(BackoffError::InvalidMultiplier(_))
        ));
        let cfg = from_vars(&[("GATEWAY_BACKOFF_JITTER", "sometimes")]).unwrap();
        assert!(cfg.backoff_policy().is_err());
    }
}
