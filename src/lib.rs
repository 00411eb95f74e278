use std::time::Duration;

pub mod commands;
pub mod cryptography;
pub mod passwords;
pub mod peer;
pub mod signal;
pub mod transfer;

/// Error type shared by the async paths; `Send + Sync` so results can cross
/// task boundaries.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub const FILE_IO_URL: &str = "https://file.io";

/// Minimum spacing between two outbound FILE.io requests.
pub const REQUEST_SPACING: Duration = Duration::from_millis(2500);
/// Sleep before retrying a request rejected with 429.
pub const RATE_LIMIT_BACKOFF: Duration = Duration::from_millis(7500);
/// Cadence of the signaling poll loop.
pub const POLL_INTERVAL: Duration = Duration::from_millis(5000);

pub const ICE_DISCONNECTED_TIMEOUT: Duration = Duration::from_secs(15 * 60);
pub const ICE_FAILED_TIMEOUT: Duration = Duration::from_secs(25);
pub const ICE_KEEPALIVE_INTERVAL: Duration = Duration::from_secs(2);

pub const DEFAULT_STUN_SERVER: &str = "stun.l.google.com:19302";
