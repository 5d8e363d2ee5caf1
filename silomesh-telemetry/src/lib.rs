//! `tracing` subscriber bootstrap, grounded on `knhk-cli::tracing::init_tracing`
//! (env-driven level selection) simplified to a pure `tracing-subscriber`
//! pipeline — the teacher's OTLP exporter wiring is a concrete collaborator
//! this workspace doesn't carry (see DESIGN.md).

use tracing_subscriber::{fmt, EnvFilter};

/// Field names used consistently across every subsystem's spans/events, so
/// a single `tracing-subscriber` filter expression (e.g.
/// `silomesh_router=debug`) works the same way everywhere.
pub mod fields {
    pub const SILO: &str = "silo";
    pub const GRAIN: &str = "grain";
    pub const ACTIVATION: &str = "activation";
    pub const CORRELATION_ID: &str = "correlation_id";
    pub const FROM_STATUS: &str = "from_status";
    pub const TO_STATUS: &str = "to_status";
}

/// Initialize the global `tracing` subscriber for a silo process.
///
/// Level is taken from `SILOMESH_LOG` (`error`|`warn`|`info`|`debug`|`trace`),
/// defaulting to `info`, mirroring `knhk-cli`'s `KNHK_TRACE` convention.
/// `json` selects structured output suitable for log aggregation instead of
/// the human-readable default.
pub fn init(json: bool) {
    let level = std::env::var("SILOMESH_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = EnvFilter::try_new(&level).unwrap_or_else(|_| EnvFilter::new("info"));

    let subscriber = fmt().with_env_filter(filter).with_target(true);
    if json {
        let _ = subscriber.json().try_init();
    } else {
        let _ = subscriber.try_init();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_does_not_panic_when_called_repeatedly() {
        init(false);
        init(false);
    }
}
