//! Front tier that gives every user a dedicated worker and proxies their
//! requests to it.

pub mod abort;
pub mod background;
pub mod backoff;
pub mod config;
pub mod coordination_redis;
pub mod deadline;
pub mod lock;
pub mod metrics;
pub mod orchestrator;
pub mod proxy;
pub mod routes;
pub mod state;
pub mod telemetry;
