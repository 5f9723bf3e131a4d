use std::path::PathBuf;
use std::sync::Once;
use std::time::{SystemTime, UNIX_EPOCH};

use tracing_subscriber::{fmt, prelude::*, EnvFilter};

static INIT: Once = Once::new();

/// Initialize tracing once for integration tests.
pub fn init_tracing() {
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
        tracing_subscriber::registry()
            .with(fmt::layer())
            .with(filter)
            .init();
    });
}

/// Generate a unique temporary data directory for a test.
pub fn temp_data_dir(test_name: &str) -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    std::env::temp_dir().join(format!("mp_{test_name}_{nanos}"))
}

/// Build a default config with a test-scoped data directory.
pub fn temp_config(test_name: &str) -> mp_config::MpConfig {
    let mut config = mp_config::MpConfig::default();
    config.global.data_dir = temp_data_dir(test_name);
    config
}
