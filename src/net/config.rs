use std::time::Duration;

/// Configuration for a [`ConnPool`](crate::net::ConnPool).
///
/// All knobs are fixed at pool construction; there is no dynamic
/// reconfiguration. Use [`PoolConfig::builder`] for ergonomic construction.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Listen backlog passed to the OS for the listening socket.
    pub backlog: i32,
    /// Base delay between outbound connect attempts. The actual delay is
    /// uniformly jittered in `(0, try_conn_delay]` so many peers reconnecting
    /// at once do not synchronize.
    pub try_conn_delay: Duration,
    /// How long an accepted connection may sit in the handshake phase before
    /// it is force-closed.
    pub conn_server_timeout: Duration,
    /// Default size of one read chunk (overridable per connection).
    pub seg_buff_size: usize,
    /// Additional connect attempts after the first failure. `None` retries
    /// forever; `Some(n)` surfaces failure through the teardown hook after
    /// `n` retries.
    pub max_conn_retries: Option<u32>,
    /// Enable TCP_NODELAY on accepted and originated connections.
    pub nodelay: bool,
}

impl PoolConfig {
    pub fn builder() -> PoolConfigBuilder {
        PoolConfigBuilder::default()
    }
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            backlog: 10,
            try_conn_delay: Duration::from_secs(2),
            conn_server_timeout: Duration::from_secs(2),
            seg_buff_size: 4096,
            max_conn_retries: Some(3),
            nodelay: true,
        }
    }
}

/// Builder for [`PoolConfig`]; unset fields fall back to the defaults.
#[derive(Debug, Default)]
pub struct PoolConfigBuilder {
    backlog: Option<i32>,
    try_conn_delay: Option<Duration>,
    conn_server_timeout: Option<Duration>,
    seg_buff_size: Option<usize>,
    max_conn_retries: Option<Option<u32>>,
    nodelay: Option<bool>,
}

impl PoolConfigBuilder {
    pub fn backlog(mut self, backlog: i32) -> Self {
        self.backlog = Some(backlog);
        self
    }

    pub fn try_conn_delay(mut self, delay: Duration) -> Self {
        self.try_conn_delay = Some(delay);
        self
    }

    pub fn conn_server_timeout(mut self, timeout: Duration) -> Self {
        self.conn_server_timeout = Some(timeout);
        self
    }

    pub fn seg_buff_size(mut self, size: usize) -> Self {
        self.seg_buff_size = Some(size);
        self
    }

    pub fn max_conn_retries(mut self, retries: Option<u32>) -> Self {
        self.max_conn_retries = Some(retries);
        self
    }

    pub fn nodelay(mut self, enabled: bool) -> Self {
        self.nodelay = Some(enabled);
        self
    }

    pub fn build(self) -> PoolConfig {
        let default = PoolConfig::default();
        PoolConfig {
            backlog: self.backlog.unwrap_or(default.backlog),
            try_conn_delay: self.try_conn_delay.unwrap_or(default.try_conn_delay),
            conn_server_timeout: self
                .conn_server_timeout
                .unwrap_or(default.conn_server_timeout),
            seg_buff_size: self.seg_buff_size.unwrap_or(default.seg_buff_size),
            max_conn_retries: self.max_conn_retries.unwrap_or(default.max_conn_retries),
            nodelay: self.nodelay.unwrap_or(default.nodelay),
        }
    }
}
