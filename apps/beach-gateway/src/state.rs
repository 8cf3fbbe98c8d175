use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::http::HeaderName;
use gateway_sdk::coordination::{AbortBus, Coordination};
use gateway_sdk::JobLifecycle;

use crate::abort::AbortRegistry;
use crate::background::BackgroundTasks;
use crate::config::AppConfig;
use crate::lock::DistributedLock;
use crate::orchestrator::SessionOrchestrator;
use crate::proxy::ReverseProxy;

#[derive(Clone)]
pub struct AppState {
    start: Instant,
    instance_id: String,
    orchestrator: SessionOrchestrator,
    proxy: ReverseProxy,
    aborts: AbortRegistry,
    abort_bus: Arc<dyn AbortBus>,
    tasks: BackgroundTasks,
    user_id_header: HeaderName,
    request_id_header: HeaderName,
}

impl AppState {
    pub fn new(
        cfg: &AppConfig,
        coordination: &Coordination,
        jobs: Arc<dyn JobLifecycle>,
        tasks: BackgroundTasks,
    ) -> anyhow::Result<Self> {
        let settings = cfg
            .orchestrator_settings()
            .context("invalid backoff configuration")?;
        let lock = DistributedLock::new(coordination.leases.clone(), tasks.clone());
        let orchestrator =
            SessionOrchestrator::new(jobs, coordination.directory.clone(), lock, settings);
        let proxy = ReverseProxy::new(&cfg.mount_prefix, cfg.proxy_timeout(), tasks.clone())
            .context("build proxy client")?;
        let user_id_header = HeaderName::from_bytes(cfg.user_id_header.as_bytes())
            .with_context(|| format!("invalid user id header `{}`", cfg.user_id_header))?;
        let request_id_header = HeaderName::from_bytes(cfg.request_id_header.as_bytes())
            .with_context(|| format!("invalid request id header `{}`", cfg.request_id_header))?;
        Ok(Self {
            start: Instant::now(),
            instance_id: cfg.instance_id.clone(),
            orchestrator,
            proxy,
            aborts: AbortRegistry::new(),
            abort_bus: coordination.aborts.clone(),
            tasks,
            user_id_header,
            request_id_header,
        })
    }

    pub fn uptime_secs(&self) -> u64 {
        self.start.elapsed().as_secs()
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn orchestrator(&self) -> &SessionOrchestrator {
        &self.orchestrator
    }

    pub fn proxy(&self) -> &ReverseProxy {
        &self.proxy
    }

    pub fn aborts(&self) -> &AbortRegistry {
        &self.aborts
    }

    pub fn abort_bus(&self) -> Arc<dyn AbortBus> {
        Arc::clone(&self.abort_bus)
    }

    pub fn tasks(&self) -> &BackgroundTasks {
        &self.tasks
    }

    pub fn user_id_header(&self) -> &HeaderName {
        &self.user_id_header
    }

    pub fn request_id_header(&self) -> &HeaderName {
        &self.request_id_header
    }
}
