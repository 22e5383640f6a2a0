use std::time::Duration;

use crate::Error;

/// Session layer configuration
#[derive(Debug, Clone)]
pub struct Config {
    max_sessions: usize,
    handshake_timeout: Duration,
    sync_start_rto: Duration,
    sync_retries: usize,
    desync_threshold: u32,
    pase_failure_limit: u32,
    pase_cooldown: Duration,
    counter_epoch_step: u32,
    resumption_ttl: Duration,
    resumption_cache_size: usize,
    rng_seed: Option<u64>,
}

impl Config {
    /// Create a new configuration builder.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder {
            max_sessions: 16,
            handshake_timeout: Duration::from_secs(30),
            sync_start_rto: Duration::from_millis(500),
            sync_retries: 3,
            desync_threshold: 3,
            pase_failure_limit: 3,
            pase_cooldown: Duration::from_secs(60),
            counter_epoch_step: 1000,
            resumption_ttl: Duration::from_secs(24 * 60 * 60),
            resumption_cache_size: 4,
            rng_seed: None,
        }
    }

    /// Max number of live sessions (committed or reserved).
    #[inline(always)]
    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Deadline for an entire handshake attempt, regardless of round trips.
    #[inline(always)]
    pub fn handshake_timeout(&self) -> Duration {
        self.handshake_timeout
    }

    /// Time of first counter sync retry.
    ///
    /// Doubled for every retry with a ±25% jitter.
    #[inline(always)]
    pub fn sync_start_rto(&self) -> Duration {
        self.sync_start_rto
    }

    /// Max number of counter sync retries before giving up.
    ///
    /// Giving up leaves counter state as-is; it does not tear down the
    /// session.
    #[inline(always)]
    pub fn sync_retries(&self) -> usize {
        self.sync_retries
    }

    /// Number of consecutive too-old rejections on a session before a
    /// counter sync request is sent.
    #[inline(always)]
    pub fn desync_threshold(&self) -> u32 {
        self.desync_threshold
    }

    /// Number of failed password-authenticated attempts before the
    /// responder goes into cooldown.
    #[inline(always)]
    pub fn pase_failure_limit(&self) -> u32 {
        self.pase_failure_limit
    }

    /// How long the responder refuses new password-authenticated attempts
    /// after the failure limit is reached.
    #[inline(always)]
    pub fn pase_cooldown(&self) -> Duration {
        self.pase_cooldown
    }

    /// How far ahead of the send counter the persisted epoch ceiling is
    /// advanced. Larger values persist less often but waste more counter
    /// space on restart.
    #[inline(always)]
    pub fn counter_epoch_step(&self) -> u32 {
        self.counter_epoch_step
    }

    /// How long an issued resumption record stays valid.
    #[inline(always)]
    pub fn resumption_ttl(&self) -> Duration {
        self.resumption_ttl
    }

    /// Max number of resumption records retained.
    #[inline(always)]
    pub fn resumption_cache_size(&self) -> usize {
        self.resumption_cache_size
    }

    /// Optional seed for deterministic non-cryptographic randomness.
    #[inline(always)]
    pub fn rng_seed(&self) -> Option<u64> {
        self.rng_seed
    }
}

/// Builder for session layer configuration.
pub struct ConfigBuilder {
    max_sessions: usize,
    handshake_timeout: Duration,
    sync_start_rto: Duration,
    sync_retries: usize,
    desync_threshold: u32,
    pase_failure_limit: u32,
    pase_cooldown: Duration,
    counter_epoch_step: u32,
    resumption_ttl: Duration,
    resumption_cache_size: usize,
    rng_seed: Option<u64>,
}

impl ConfigBuilder {
    /// Set the max number of live sessions.
    ///
    /// Defaults to 16.
    pub fn max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions;
        self
    }

    /// Set the deadline for an entire handshake attempt.
    ///
    /// Defaults to 30 seconds.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the time of first counter sync retry.
    ///
    /// Defaults to 500 milliseconds.
    pub fn sync_start_rto(mut self, rto: Duration) -> Self {
        self.sync_start_rto = rto;
        self
    }

    /// Set the max number of counter sync retries.
    ///
    /// Defaults to 3.
    pub fn sync_retries(mut self, retries: usize) -> Self {
        self.sync_retries = retries;
        self
    }

    /// Set the number of consecutive too-old rejections that trigger a
    /// counter sync request.
    ///
    /// Defaults to 3.
    pub fn desync_threshold(mut self, threshold: u32) -> Self {
        self.desync_threshold = threshold;
        self
    }

    /// Set the number of failed password-authenticated attempts before
    /// cooldown.
    ///
    /// Defaults to 3.
    pub fn pase_failure_limit(mut self, limit: u32) -> Self {
        self.pase_failure_limit = limit;
        self
    }

    /// Set the password-authentication cooldown duration.
    ///
    /// Defaults to 60 seconds.
    pub fn pase_cooldown(mut self, cooldown: Duration) -> Self {
        self.pase_cooldown = cooldown;
        self
    }

    /// Set the counter epoch persistence step.
    ///
    /// Defaults to 1000.
    pub fn counter_epoch_step(mut self, step: u32) -> Self {
        self.counter_epoch_step = step;
        self
    }

    /// Set how long issued resumption records stay valid.
    ///
    /// Defaults to 24 hours.
    pub fn resumption_ttl(mut self, ttl: Duration) -> Self {
        self.resumption_ttl = ttl;
        self
    }

    /// Set the max number of resumption records retained.
    ///
    /// Defaults to 4.
    pub fn resumption_cache_size(mut self, size: usize) -> Self {
        self.resumption_cache_size = size;
        self
    }

    /// Seed all non-cryptographic randomness for deterministic behavior.
    ///
    /// Defaults to unseeded.
    pub fn rng_seed(mut self, seed: u64) -> Self {
        self.rng_seed = Some(seed);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> Result<Config, Error> {
        if self.max_sessions == 0 {
            return Err(Error::Config("max_sessions must be at least 1"));
        }
        if self.counter_epoch_step == 0 {
            return Err(Error::Config("counter_epoch_step must be at least 1"));
        }

        Ok(Config {
            max_sessions: self.max_sessions,
            handshake_timeout: self.handshake_timeout,
            sync_start_rto: self.sync_start_rto,
            sync_retries: self.sync_retries,
            desync_threshold: self.desync_threshold,
            pase_failure_limit: self.pase_failure_limit,
            pase_cooldown: self.pase_cooldown,
            counter_epoch_step: self.counter_epoch_step,
            resumption_ttl: self.resumption_ttl,
            resumption_cache_size: self.resumption_cache_size,
            rng_seed: self.rng_seed,
        })
    }
}

impl Default for Config {
    fn default() -> Self {
        Config::builder()
            .build()
            .expect("Default config should always validate")
    }
}
