//! 日志初始化：`RUST_LOG` 优先，否则使用本 crate 的默认级别。

use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

const DEFAULT_FILTER: &str = "info,chunk_drive=info,tower_http=warn";

/// 初始化 tracing 日志订阅；`verbose` 时把本 crate 提到 debug。
pub fn init_logging(verbose: bool) {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("info,chunk_drive=debug,tower_http=debug")
        } else {
            EnvFilter::new(DEFAULT_FILTER)
        }
    });
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer().with_target(verbose))
        .init();
}
