pub mod alerts;
pub mod cache;
pub mod config;
pub mod critical_path;
pub mod errors;
pub mod event;
pub mod ingest;
pub mod logger;
pub mod metrics;
pub mod probes;
pub mod resource;
pub mod tracer;
pub mod validation;

pub use config::Config;
pub use event::TraceEvent;
pub use metrics::Metrics;
pub use tracer::{ProbeSet, Tracer};
