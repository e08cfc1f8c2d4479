//! Shared utilities: the crate-wide error type and logging setup.

pub mod error;
pub mod logging;

pub use error::{BrokerError, Result};

#[cfg(test)]
mod tests {
    use super::logging;
    use serial_test::serial;
    use temp_env::{with_var, with_var_unset};

    #[test]
    #[serial]
    fn logging_init_accepts_levels() {
        // Should not panic
        logging::init("info");
        logging::init("debug");
        logging::init("warn");
    }

    #[test]
    #[serial]
    fn logging_filter_uses_cli_level_without_rust_log() {
        with_var_unset("RUST_LOG", || {
            assert_eq!(logging::filter_for("debug").to_string(), "debug");
            assert_eq!(logging::filter_for("nonsense").to_string(), "info");
        });
    }

    #[test]
    #[serial]
    fn logging_filter_prefers_rust_log() {
        with_var("RUST_LOG", Some("mqtt_core_broker=trace"), || {
            let filter = logging::filter_for("warn").to_string();
            assert!(filter.contains("mqtt_core_broker=trace"), "{filter}");
        });
    }
}
