pub mod categories;
pub mod error;
pub mod ml;
pub mod model;
pub mod server;
pub mod synth;

pub use categories::{CategoryRegistry, CATEGORIES, NUM_CLASSES};
pub use error::{ClassifierError, Result};

use tracing_subscriber::EnvFilter;

/// `RUST_LOG` 未設定時のログ出力対象
pub const DEFAULT_LOG_DIRECTIVE: &str =
    "issue_classifier=info,issue_classifier_lib=info,generate_data=info";

/// ログ出力を初期化（バイナリ毎に1回）
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_DIRECTIVE));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
