use std::time::Duration;

// Fundamental configuration constants
pub const DEFAULT_HOST: &str = "0.0.0.0";
pub const DEFAULT_PORT: u16 = 3030;
pub const WS_PATH: &str = "ws";
pub const HEALTH_PATH: &str = "health";

// Connection delivery constants
pub const DEFAULT_SEND_BUFFER: usize = 128;
pub const DEFAULT_WRITE_WAIT: Duration = Duration::from_secs(10);
pub const DEFAULT_PING_PERIOD: Duration = Duration::from_secs(30);

// Read side limits enforced by the websocket handler
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(60);
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1 << 20;

// Close codes written in close control frames
pub const CLOSE_NORMAL: u16 = 1000;
pub const CLOSE_GOING_AWAY: u16 = 1001;
pub const CLOSE_INTERNAL_ERROR: u16 = 1011;
pub const CLOSE_SESSION_REPLACED: u16 = 4001;

// Close reasons paired with the codes above
pub const REASON_SESSION_CLOSED: &str = "session closed";
pub const REASON_SEND_BUFFER_FULL: &str = "send buffer full";
pub const REASON_SESSION_REPLACED: &str = "session replaced";
pub const REASON_ROUTER_SHUTDOWN: &str = "router shutdown";
pub const REASON_WRITE_FAILED: &str = "write failed";
