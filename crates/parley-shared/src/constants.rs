/// Protocol version reported by the health endpoint
pub const PROTOCOL_VERSION: &str = "/parley/1.0.0";

/// Default HTTP port (REST + live connections)
pub const DEFAULT_HTTP_PORT: u16 = 5000;

/// Header carrying the caller's user id on REST calls
pub const USER_ID_HEADER: &str = "x-user-id";

/// Query parameter carrying the user id on the live-connection handshake
pub const USER_ID_QUERY: &str = "userId";

/// Interval between client heartbeats in seconds
pub const HEARTBEAT_INTERVAL_SECS: u64 = 20;

/// Silence after which a live connection is considered dead, in seconds
pub const LIVENESS_TIMEOUT_SECS: u64 = 60;

/// Period of the server's liveness sweep in seconds
pub const SWEEP_INTERVAL_SECS: u64 = 15;

/// Outbound live-event queue depth per connection
pub const EVENT_BUFFER: usize = 64;

/// Maximum text length of a single message in characters
pub const MAX_TEXT_LEN: usize = 4096;

/// Maximum media payload accepted by the object store (5 MiB)
pub const MAX_MEDIA_SIZE: usize = 5 * 1024 * 1024;
