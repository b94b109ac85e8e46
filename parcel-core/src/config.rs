//! Message manager configuration.

use std::path::PathBuf;
use std::time::Duration;

/// Default age after which a half-received transfer is evicted.
pub const DEFAULT_PENDING_TTL: Duration = Duration::from_secs(5 * 60);

/// Default thread name of the serial callback queue.
pub const DEFAULT_CALLBACK_LABEL: &str = "parcel-callbacks";

#[derive(Debug, Clone)]
pub struct Config {
    /// Directory receiving resources; `None` rejects inbound resources.
    pub resource_container: Option<PathBuf>,
    /// Eviction age for pending halves; `None` keeps them forever.
    pub pending_ttl: Option<Duration>,
    pub callback_label: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            resource_container: None,
            pending_ttl: Some(DEFAULT_PENDING_TTL),
            callback_label: DEFAULT_CALLBACK_LABEL.to_string(),
        }
    }
}
