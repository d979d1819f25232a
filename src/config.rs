use std::net::SocketAddr;
use std::path::PathBuf;
use std::time::Duration;

/// Which resource controller isolates job processes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationBackend {
    /// cgroup v2 groups under [`IsolationConfig::cgroup_root`].
    #[default]
    Cgroup,
    /// No isolation. Jobs that request limits are rejected.
    Noop,
}

/// Configuration for per-job resource isolation.
#[derive(Debug, Clone)]
pub struct IsolationConfig {
    pub backend: IsolationBackend,
    /// Parent group that every job group is created under. Must live on a
    /// cgroup2 mount and must not contain the worker process itself.
    pub cgroup_root: PathBuf,
}

impl Default for IsolationConfig {
    fn default() -> Self {
        Self {
            backend: IsolationBackend::Cgroup,
            cgroup_root: PathBuf::from("/sys/fs/cgroup/job-worker"),
        }
    }
}

/// TLS configuration for the client-facing gRPC API.
///
/// When enabled, the server runs mutual TLS (mTLS):
/// - The server presents its certificate to clients
/// - Clients must present a certificate signed by the configured CA
/// - The client certificate carries the caller's role
#[derive(Debug, Clone, Default)]
pub struct TlsConfig {
    /// Enable TLS. If false, all other TLS settings are ignored.
    pub enabled: bool,

    /// Path to the CA certificate (PEM format).
    /// Used to verify client certificates.
    pub ca_cert_path: Option<PathBuf>,

    /// Path to the server certificate (PEM format).
    pub cert_path: Option<PathBuf>,

    /// Path to the server private key (PEM format).
    /// Must match the certificate.
    pub key_path: Option<PathBuf>,

    /// Allow plaintext for development/testing. Without TLS no caller can
    /// present a role, so every call is rejected as unauthenticated.
    pub allow_insecure: bool,
}

impl TlsConfig {
    /// Check if TLS is properly configured with all required files.
    pub fn is_complete(&self) -> bool {
        self.enabled
            && self.ca_cert_path.is_some()
            && self.cert_path.is_some()
            && self.key_path.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub listen_addr: SocketAddr,
    /// Directory holding one `<job_id>.log` file per job.
    pub log_dir: PathBuf,
    /// Wait after SIGTERM before escalating to SIGKILL.
    pub grace_period_ms: u64,
    /// Wait after SIGKILL before giving up on a stop.
    pub kill_timeout_ms: u64,
    /// How long the exit monitor waits for the output pipe to drain once the
    /// process has exited. Bounds the wait when a descendant keeps it open.
    pub drain_timeout_ms: u64,
    /// Live chunks buffered per stream subscriber before it is dropped.
    pub subscriber_queue_capacity: usize,
    /// Upper bound on the size of one captured output chunk.
    pub read_buffer_size: usize,
    pub isolation: IsolationConfig,
    pub tls: TlsConfig,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([127, 0, 0, 1], 50051)),
            log_dir: PathBuf::from("/var/lib/job-worker/logs"),
            grace_period_ms: 5_000,
            kill_timeout_ms: 2_000,
            drain_timeout_ms: 1_000,
            subscriber_queue_capacity: 256,
            read_buffer_size: 32 * 1024,
            isolation: IsolationConfig::default(),
            tls: TlsConfig::default(),
        }
    }
}

impl WorkerConfig {
    pub fn new(listen_addr: SocketAddr, log_dir: PathBuf) -> Self {
        Self {
            listen_addr,
            log_dir,
            ..Default::default()
        }
    }

    pub fn with_isolation(mut self, isolation: IsolationConfig) -> Self {
        self.isolation = isolation;
        self
    }

    pub fn with_grace_period_ms(mut self, grace_period_ms: u64) -> Self {
        self.grace_period_ms = grace_period_ms;
        self
    }

    pub fn with_subscriber_queue_capacity(mut self, capacity: usize) -> Self {
        self.subscriber_queue_capacity = capacity;
        self
    }

    pub fn grace_period(&self) -> Duration {
        Duration::from_millis(self.grace_period_ms)
    }

    pub fn kill_timeout(&self) -> Duration {
        Duration::from_millis(self.kill_timeout_ms)
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }
}
