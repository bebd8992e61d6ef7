//! Logging setup: env_logger as the backing logger, wrapped by a forwarder
//! that turns warn/error records into alerts via the global pipeline handle.
//!
//! The dependency is strictly one-way. Records whose target sits under the
//! alert subsystem are never forwarded, so the pipeline's own diagnostics
//! stay plain log lines and cannot loop back into it.

use log::{Level, Log, Metadata, Record};

use crate::alerts::{self, Alert, Severity};

const ALERT_MODULE_PREFIX: &str = "podtraced::alerts";

pub struct AlertForwarder {
    inner: env_logger::Logger,
}

impl AlertForwarder {
    pub fn new(inner: env_logger::Logger) -> AlertForwarder {
        AlertForwarder { inner }
    }
}

/// Warn and error records feed the pipeline; everything below is noise, and
/// the alert subsystem's own targets are exempt.
fn should_forward(level: Level, target: &str) -> bool {
    level <= Level::Warn && !target.starts_with(ALERT_MODULE_PREFIX)
}

fn severity_for(level: Level) -> Severity {
    match level {
        Level::Error => Severity::Error,
        _ => Severity::Warning,
    }
}

impl Log for AlertForwarder {
    fn enabled(&self, metadata: &Metadata) -> bool {
        self.inner.enabled(metadata)
    }

    fn log(&self, record: &Record) {
        self.inner.log(record);

        if !should_forward(record.level(), record.target()) {
            return;
        }
        let Some(pipeline) = alerts::global() else {
            return;
        };
        let alert = Alert::new(
            severity_for(record.level()),
            format!("log: {}", record.target()),
            record.args().to_string(),
            "logger",
        );
        pipeline.submit(alert);
    }

    fn flush(&self) {
        self.inner.flush();
    }
}

/// Install the forwarding logger. Respects `RUST_LOG` like a plain
/// env_logger; defaults to info.
pub fn init() -> anyhow::Result<()> {
    let inner = env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or("info"),
    )
    .build();
    let level = inner.filter();
    log::set_boxed_logger(Box::new(AlertForwarder::new(inner)))
        .map_err(|err| anyhow::anyhow!("logger already installed: {err}"))?;
    log::set_max_level(level);
    Ok(())
}
