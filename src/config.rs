use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

use crate::identity::PublicKey;

/// Assignment rules used by the dispatcher.
#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Jobs an agent may hold (`assigned` + `running`) before it stops receiving new ones.
    pub max_concurrent_jobs_per_agent: usize,
    /// Requeues allowed before a job is expired instead.
    pub max_attempts: u32,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            max_concurrent_jobs_per_agent: 1,
            max_attempts: 3,
        }
    }
}

/// Intervals and thresholds for the background tasks.
#[derive(Debug, Clone)]
pub struct SweepConfig {
    /// How often a dispatch pass runs when nothing wakes it earlier.
    pub dispatch_interval_ms: u64,
    /// How often heartbeat ages are checked.
    pub liveness_interval_ms: u64,
    /// Heartbeat age after which an active agent is marked unreachable.
    pub heartbeat_timeout_ms: u64,
    /// How often queued-job expiry and agent purging run.
    pub expiry_interval_ms: u64,
    /// Time a job may sit in `queued` before it expires. `None` keeps it queued indefinitely.
    pub job_ttl_ms: Option<u64>,
    /// Time an agent may stay unreachable before its record is removed. `None` keeps it.
    pub agent_expiry_ms: Option<u64>,
    /// How long a finished job's idempotency key keeps deduplicating resubmissions.
    pub idempotency_retention_ms: u64,
}

impl Default for SweepConfig {
    fn default() -> Self {
        Self {
            dispatch_interval_ms: 500,
            liveness_interval_ms: 1_000,
            heartbeat_timeout_ms: 15_000,
            expiry_interval_ms: 5_000,
            job_ttl_ms: None,
            agent_expiry_ms: Some(3_600_000),
            idempotency_retention_ms: 86_400_000,
        }
    }
}

/// Millisecond setting as a chrono duration, saturating instead of wrapping.
fn millis(ms: u64) -> chrono::Duration {
    chrono::Duration::milliseconds(i64::try_from(ms).unwrap_or(i64::MAX))
}

/// Millisecond setting as a timer period. Tokio intervals reject zero.
fn period(ms: u64) -> Duration {
    Duration::from_millis(ms.max(1))
}

impl SweepConfig {
    pub fn dispatch_interval(&self) -> Duration {
        period(self.dispatch_interval_ms)
    }

    pub fn liveness_interval(&self) -> Duration {
        period(self.liveness_interval_ms)
    }

    pub fn expiry_interval(&self) -> Duration {
        period(self.expiry_interval_ms)
    }

    pub fn heartbeat_timeout(&self) -> chrono::Duration {
        millis(self.heartbeat_timeout_ms)
    }

    pub fn job_ttl(&self) -> Option<chrono::Duration> {
        self.job_ttl_ms.map(millis)
    }

    pub fn agent_expiry(&self) -> Option<chrono::Duration> {
        self.agent_expiry_ms.map(millis)
    }

    pub fn idempotency_retention(&self) -> chrono::Duration {
        millis(self.idempotency_retention_ms)
    }
}

/// Request authentication settings for the gateway.
///
/// Agents authenticate with the key they registered. Clients (submitters,
/// operators) authenticate with a key listed in `authorized_clients`.
#[derive(Debug, Clone)]
pub struct AuthConfig {
    /// Public keys allowed to submit, query and administer jobs.
    pub authorized_clients: Vec<PublicKey>,
    /// Accept any self-identified client key. Development only.
    pub allow_any_client: bool,
    /// Maximum distance between an envelope's `issued_at` and the server clock.
    pub max_clock_skew_secs: u64,
    /// Upper bound on a single signature verification.
    pub verify_timeout_ms: u64,
    /// Signatures remembered for replay rejection. Requests beyond this while
    /// every entry is still inside the skew window are refused as retryable.
    pub replay_cache_capacity: usize,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authorized_clients: Vec::new(),
            allow_any_client: false,
            max_clock_skew_secs: 300,
            verify_timeout_ms: 2_000,
            replay_cache_capacity: 100_000,
        }
    }
}

impl AuthConfig {
    pub fn is_client_authorized(&self, key: &PublicKey) -> bool {
        self.allow_any_client || self.authorized_clients.contains(key)
    }

    pub fn verify_timeout(&self) -> Duration {
        Duration::from_millis(self.verify_timeout_ms)
    }
}

#[derive(Debug, Clone)]
pub struct ControllerConfig {
    pub listen_addr: SocketAddr,
    /// Controller signing key (hex secret key file, created if missing).
    pub key_path: PathBuf,
    /// Snapshot file for agents and jobs. `None` keeps state in memory only.
    pub state_path: Option<PathBuf>,
    pub lock_timeout_ms: u64,
    pub max_jobs: usize,
    pub dispatch: DispatchConfig,
    pub sweep: SweepConfig,
    pub auth: AuthConfig,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 8040)),
            key_path: PathBuf::from("controller.key"),
            state_path: None,
            lock_timeout_ms: 5_000,
            max_jobs: crate::ledger::DEFAULT_MAX_JOBS,
            dispatch: DispatchConfig::default(),
            sweep: SweepConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl ControllerConfig {
    pub fn new(listen_addr: SocketAddr) -> Self {
        Self {
            listen_addr,
            ..Default::default()
        }
    }

    pub fn with_state_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.state_path = Some(path.into());
        self
    }

    pub fn with_authorized_client(mut self, key: PublicKey) -> Self {
        self.auth.authorized_clients.push(key);
        self
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::generate_keypair;

    #[test]
    fn dispatch_config_default() {
        let cfg = DispatchConfig::default();
        assert_eq!(cfg.max_concurrent_jobs_per_agent, 1);
        assert_eq!(cfg.max_attempts, 3);
    }

    #[test]
    fn sweep_config_default() {
        let cfg = SweepConfig::default();
        assert_eq!(cfg.dispatch_interval_ms, 500);
        assert_eq!(cfg.heartbeat_timeout_ms, 15_000);
        assert!(cfg.job_ttl_ms.is_none());
        assert!(cfg.job_ttl().is_none());
        assert_eq!(cfg.heartbeat_timeout(), chrono::Duration::seconds(15));
        assert_eq!(cfg.agent_expiry(), Some(chrono::Duration::hours(1)));
        assert_eq!(cfg.idempotency_retention(), chrono::Duration::hours(24));
    }

    #[test]
    fn test_sweep_config_extreme_values_do_not_wrap_or_panic() {
        let cfg = SweepConfig {
            dispatch_interval_ms: 0,
            liveness_interval_ms: 0,
            expiry_interval_ms: 0,
            heartbeat_timeout_ms: u64::MAX,
            job_ttl_ms: Some(u64::MAX),
            agent_expiry_ms: Some(u64::MAX),
            idempotency_retention_ms: u64::MAX,
        };
        assert_eq!(cfg.dispatch_interval(), Duration::from_millis(1));
        assert_eq!(cfg.liveness_interval(), Duration::from_millis(1));
        assert_eq!(cfg.expiry_interval(), Duration::from_millis(1));

        // saturated, never negative
        let max = chrono::Duration::milliseconds(i64::MAX);
        assert_eq!(cfg.heartbeat_timeout(), max);
        assert_eq!(cfg.job_ttl(), Some(max));
        assert_eq!(cfg.agent_expiry(), Some(max));
        assert!(cfg.idempotency_retention() > chrono::Duration::zero());
    }

    #[test]
    fn auth_config_default_rejects_unknown_clients() {
        let cfg = AuthConfig::default();
        let key = generate_keypair().public();
        assert!(cfg.authorized_clients.is_empty());
        assert!(!cfg.allow_any_client);
        assert!(!cfg.is_client_authorized(&key));
        assert_eq!(cfg.max_clock_skew_secs, 300);
    }

    #[test]
    fn auth_config_authorizes_listed_clients() {
        let listed = generate_keypair().public();
        let other = generate_keypair().public();
        let cfg = AuthConfig {
            authorized_clients: vec![listed],
            ..Default::default()
        };
        assert!(cfg.is_client_authorized(&listed));
        assert!(!cfg.is_client_authorized(&other));
    }

    #[test]
    fn auth_config_open_mode_accepts_anyone() {
        let cfg = AuthConfig {
            allow_any_client: true,
            ..Default::default()
        };
        assert!(cfg.is_client_authorized(&generate_keypair().public()));
    }

    #[test]
    fn controller_config_default() {
        let cfg = ControllerConfig::default();
        assert_eq!(cfg.listen_addr.to_string(), "127.0.0.1:8040");
        assert_eq!(cfg.key_path, PathBuf::from("controller.key"));
        assert!(cfg.state_path.is_none());
        assert_eq!(cfg.lock_timeout(), Duration::from_secs(5));
        assert_eq!(cfg.max_jobs, 10_000);
    }

    #[test]
    fn controller_config_builders() {
        let addr: SocketAddr = "10.0.0.1:9000".parse().unwrap();
        let key = generate_keypair().public();
        let cfg = ControllerConfig::new(addr)
            .with_state_path("/var/lib/controller/state.json")
            .with_authorized_client(key);
        assert_eq!(cfg.listen_addr, addr);
        assert_eq!(
            cfg.state_path.as_deref(),
            Some(std::path::Path::new("/var/lib/controller/state.json"))
        );
        assert_eq!(cfg.auth.authorized_clients, vec![key]);
    }
}
