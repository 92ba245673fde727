use std::sync::{Arc, RwLock};
use std::time::Duration;
use anyhow::bail;
use tracing::info;

#[derive(Debug, Clone)]
pub struct NetworkConfig {
    /// Payloads bigger than this are sent blockwise. This is the payload size, not the size of
    ///  the datagram.
    pub max_message_size: usize,
    /// Block size used for blockwise transfers unless the peer negotiates a different one. Must
    ///  be a power of two between 16 and 1024.
    pub default_block_size: usize,

    /// Initial retransmission timeout (RFC 7252 ACK_TIMEOUT)
    pub ack_timeout: Duration,
    /// The initial timeout is chosen at random between `ack_timeout` and
    ///  `ack_timeout * ack_random_factor`. Must be >= 1.0
    pub ack_random_factor: f64,
    /// Factor by which the timeout grows with every retransmission (2.0 is exponential backoff
    ///  as in RFC 7252)
    pub ack_timeout_scale: f64,
    pub max_retransmit: u32,

    /// additional time to wait after a notification's max-age expired before re-registering
    pub notification_reregistration_backoff: Duration,
    /// every n-th notification is sent as CON to check the subscriber is still interested
    pub notification_check_interval_count: u32,
    /// a notification is sent as CON if the last check is longer ago than this
    pub notification_check_interval: Duration,

    /// start message ids at a random value to avoid collisions with a previous incarnation
    ///  of the same endpoint
    pub use_random_mid_start: bool,

    /// the time a message id is remembered for duplicate detection
    pub exchange_lifetime: Duration,
    /// interval between sweeps that evict expired entries from the deduplicator
    pub mark_and_sweep_interval: Duration,
    pub max_transmit_wait: Duration,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        NetworkConfig {
            max_message_size: 1024,
            default_block_size: 512,
            ack_timeout: Duration::from_secs(2),
            ack_random_factor: 1.5,
            ack_timeout_scale: 2.0,
            max_retransmit: 4,
            notification_reregistration_backoff: Duration::from_secs(2),
            notification_check_interval_count: 100,
            notification_check_interval: Duration::from_secs(24 * 60 * 60),
            use_random_mid_start: true,
            exchange_lifetime: Duration::from_secs(247),
            mark_and_sweep_interval: Duration::from_secs(10),
            max_transmit_wait: Duration::from_secs(93),
        }
    }
}

impl NetworkConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if !self.default_block_size.is_power_of_two() || self.default_block_size < 16 || self.default_block_size > 1024 {
            bail!("default block size must be a power of two between 16 and 1024, was {}", self.default_block_size);
        }
        if self.max_message_size < 16 {
            bail!("max message size is too small: {}", self.max_message_size);
        }
        if self.ack_timeout.is_zero() {
            bail!("ack timeout must be positive");
        }
        if !(self.ack_random_factor >= 1.0) {
            bail!("ack random factor must be at least 1.0, was {}", self.ack_random_factor);
        }
        if !(self.ack_timeout_scale >= 1.0) {
            bail!("ack timeout scale must be at least 1.0, was {}", self.ack_timeout_scale);
        }
        if self.notification_check_interval_count == 0 {
            bail!("notification check interval count must be positive");
        }
        if self.mark_and_sweep_interval.is_zero() {
            bail!("mark and sweep interval must be positive");
        }
        Ok(())
    }
}

/// Shared, hot-reloadable access to the current [NetworkConfig]. Components call [ConfigHandle::load]
///  per operation, so an update becomes visible without restarting anything.
#[derive(Clone, Debug)]
pub struct ConfigHandle {
    current: Arc<RwLock<Arc<NetworkConfig>>>,
}

impl ConfigHandle {
    pub fn new(config: NetworkConfig) -> anyhow::Result<ConfigHandle> {
        config.validate()?;
        Ok(ConfigHandle {
            current: Arc::new(RwLock::new(Arc::new(config))),
        })
    }

    pub fn load(&self) -> Arc<NetworkConfig> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Applies a change to a copy of the current configuration and swaps it in if it is valid.
    ///  An invalid change leaves the current configuration untouched.
    pub fn update(&self, f: impl FnOnce(&mut NetworkConfig)) -> anyhow::Result<()> {
        let mut guard = match self.current.write() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        let mut changed = guard.as_ref().clone();
        f(&mut changed);
        changed.validate()?;

        info!("network configuration updated: {:?}", changed);
        *guard = Arc::new(changed);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn test_default_is_valid() {
        assert!(NetworkConfig::default().validate().is_ok());
    }

    #[rstest]
    #[case::block_size_not_power_of_two(|c: &mut NetworkConfig| c.default_block_size = 500)]
    #[case::block_size_too_small(|c: &mut NetworkConfig| c.default_block_size = 8)]
    #[case::block_size_too_big(|c: &mut NetworkConfig| c.default_block_size = 2048)]
    #[case::random_factor(|c: &mut NetworkConfig| c.ack_random_factor = 0.5)]
    #[case::random_factor_nan(|c: &mut NetworkConfig| c.ack_random_factor = f64::NAN)]
    #[case::scale(|c: &mut NetworkConfig| c.ack_timeout_scale = 0.9)]
    #[case::ack_timeout(|c: &mut NetworkConfig| c.ack_timeout = Duration::ZERO)]
    #[case::check_count(|c: &mut NetworkConfig| c.notification_check_interval_count = 0)]
    fn test_validate_invalid(#[case] change: fn(&mut NetworkConfig)) {
        let mut config = NetworkConfig::default();
        change(&mut config);
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_update_is_visible_to_other_handles() {
        let handle = ConfigHandle::new(NetworkConfig::default()).unwrap();
        let other = handle.clone();
        let before = other.load();

        handle.update(|c| c.max_message_size = 64).unwrap();

        assert_eq!(before.max_message_size, 1024);
        assert_eq!(other.load().max_message_size, 64);
    }

    #[test]
    fn test_invalid_update_keeps_config() {
        let handle = ConfigHandle::new(NetworkConfig::default()).unwrap();
        assert!(handle.update(|c| c.default_block_size = 17).is_err());
        assert_eq!(handle.load().default_block_size, 512);
    }
}
