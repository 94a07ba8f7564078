/// Application name, also the kernel table name prefix.
pub const APP_NAME: &str = "lobby";

/// Local configuration file path, tried first.
pub const DEFAULT_CONFIG_PATH: &str = "./lobby.conf";

/// System configuration file path, the fallback.
pub const SYSTEM_CONFIG_PATH: &str = "/etc/lobby/lobby.conf";

/// DNS recheck period in seconds when neither the user nor the response
/// provides a usable TTL.
pub const DEFAULT_DNS_TTL_SECS: u32 = 25;

/// Upper bound of the random initial health-check delay, milliseconds.
/// Staggers probe startup so co-configured upstreams don't stampede.
pub const MAX_HC_TIMER_INIT_MS: u64 = 500;

/// Number of SIGINTs after which shutdown stops being graceful.
pub const SIGINT_FORCE_EXIT_COUNT: u8 = 3;

/// Exit code after a forced shutdown.
pub const FORCED_EXIT_CODE: i32 = 130;

pub const SUPPORT_MSG: &str = "in case you're in need of support make sure to check";
pub const SUPPORT_CHANNEL: &str = "https://github.com/ipbuff/lobby";

/// Final log line of a graceful shutdown.
pub const OUTRO: &str = "Stopped load balancing traffic";
