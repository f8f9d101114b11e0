/// Default number of hierarchy levels (H). Levels run from 0 to H-1.
pub const DEFAULT_HIERARCHY_HEIGHT: u8 = 3;

/// Upper bound accepted for the configured hierarchy height.
pub const MAX_HIERARCHY_HEIGHT: u8 = 16;

/// Cluster-graph hops a superior cluster reaches from its head cluster.
pub const DEFAULT_EXPANSION_RADIUS: u32 = 1;

/// How long an electing node waits for REPLY messages after broadcasting ELECT.
/// Also the window in which a second ELECT broadcast is suppressed.
pub const REPLY_TIMEOUT_MS: u64 = 1_000;

/// How long a losing node waits for the winner's ANNOUNCE before polling.
pub const ANNOUNCE_TIMEOUT_MS: u64 = 5_000;

/// Interval between REQUEST_COORDINATOR polls sent by a node that has not
/// learned its coordinator.
pub const COORDINATOR_POLL_TIMEOUT_MS: u64 = 10_000;

/// Number of unanswered coordinator polls before laggard re-election.
pub const MAX_COORDINATOR_POLLS: u32 = 3;

/// Ceiling on election restarts for a single cluster.
pub const MAX_ELECTION_RESTARTS: u32 = 8;

/// Delay between winning the top-level election and distributing addresses.
pub const ADDRESS_DISTRIBUTION_SETTLE_MS: u64 = 5_000;

/// Interval at which a coordinator broadcasts ALIVE when liveness is enabled.
pub const ALIVE_INTERVAL_MS: u64 = 2_000;

/// Silence after which a coordinator is considered stale when liveness is enabled.
pub const ALIVE_TIMEOUT_MS: u64 = 6_000;

/// Dispatches slower than this are logged by the event processor.
pub const SLOW_DISPATCH_WARN_MS: u64 = 100;

/// Cluster-update requests per level beyond this count collapse into one.
pub const MAX_PENDING_CLUSTER_UPDATES: u32 = 4;

/// Base priority of a node when the administrator configured none.
pub const DEFAULT_NODE_PRIORITY: u64 = 1;

/// Highest administrator-assigned base priority.
pub const MAX_NODE_PRIORITY: u64 = 99;

/// Priority offset contributed by every physical neighbor of a node.
pub const CONNECTIVITY_PRIORITY_OFFSET: u64 = 100;

/// Environment variable prefix for configuration overrides.
pub const ENV_PREFIX: &str = "HRM_";
