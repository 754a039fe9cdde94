//! Subscriber installation. Lives in its own test binary because it sets the
//! global default.

use pm100x_panel::tracing_setup::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn test_init_is_idempotent() {
    assert!(tracing_setup::init(TracingConfig::from_verbosity(true)).is_ok());
    assert!(tracing_setup::init(TracingConfig::new(Level::DEBUG).with_format(OutputFormat::Json)).is_ok());

    let mut config = pm100x_panel::PanelConfig::default();
    config.application.log_level = "debug".into();
    assert!(tracing_setup::init_from_config(&config).is_ok());

    config.application.log_level = "critical".into();
    assert!(tracing_setup::init_from_config(&config).is_err());
}
