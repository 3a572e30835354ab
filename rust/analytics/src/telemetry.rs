use once_cell::sync::OnceCell;
use tracing_subscriber::{fmt, EnvFilter};

const LOG_ENV: &str = "ANALYTICS_LOG";
const DEFAULT_DIRECTIVES: &str = "info,tower_http=info";

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the global subscriber. `ANALYTICS_LOG` wins over `RUST_LOG`.
pub fn init_tracing() {
    let _ = INIT.get_or_init(|| {
        let filter = EnvFilter::try_from_env(LOG_ENV)
            .or_else(|_| EnvFilter::try_from_default_env())
            .unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));
        fmt().with_env_filter(filter).with_target(false).init();
    });
}
