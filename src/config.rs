//! Session configuration.
//!
//! [`SessionConfig`] collects every tunable of a rollback session. Fields are
//! public and the struct is plain data; [`SessionConfig::validate`] is called
//! by [`RollbackSession::initialize`](crate::RollbackSession::initialize) and
//! rejects out-of-range values with
//! [`InvalidArgument`](crate::FramelockError::InvalidArgument) before any
//! resource is touched.

use std::net::SocketAddr;

use web_time::Duration;

use crate::{FramelockError, FramelockResult, INPUT_BYTES, MAX_PREDICTION_FRAMES};

/// The smallest number of players a session supports.
pub const MIN_PLAYERS: usize = 2;
/// The largest number of players a session supports.
pub const MAX_PLAYERS: usize = 4;

/// Default size of one snapshot buffer: 8 MiB.
pub const DEFAULT_SNAPSHOT_BUFFER_SIZE: usize = 8 * 1024 * 1024;
/// Default number of resident snapshot buffers.
pub const DEFAULT_SNAPSHOT_POOL_MAX: usize = 4;

/// Configuration for a rollback session.
///
/// # Example
///
/// ```
/// use framelock::SessionConfig;
///
/// let config = SessionConfig::new(1, 2, vec!["127.0.0.1:7001".parse().unwrap()]);
/// assert!(config.validate().is_ok());
///
/// // Tighter input latency at the cost of more rollbacks:
/// let config = SessionConfig {
///     frame_delay: 0,
///     ..config
/// };
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use = "SessionConfig has no effect unless passed to RollbackSession::initialize()"]
pub struct SessionConfig {
    /// The local player number, 1-based, in `1..=player_count`.
    pub local_player: usize,

    /// Total number of players, in `2..=4`. Fixed for the session lifetime.
    pub player_count: usize,

    /// Endpoints of the remote players, one per remote, assigned to player
    /// numbers in ascending order (skipping the local player).
    pub remote_addrs: Vec<SocketAddr>,

    /// Number of frames by which local input is delayed before it reaches
    /// the emulator. Trades a fixed amount of perceived latency for a lower
    /// mis-prediction rate.
    ///
    /// Default: 1
    pub frame_delay: usize,

    /// Number of frames the engine may speculate ahead of the last confirmed
    /// remote input. Past this, frame advance stalls.
    ///
    /// Default: 8
    pub max_prediction: usize,

    /// Size of each snapshot buffer in bytes. Must be large enough for one
    /// uncompressed emulator state plus envelope overhead.
    ///
    /// Default: 8 MiB
    pub snapshot_buffer_size: usize,

    /// Maximum number of snapshot buffers resident at once. When all are in
    /// use, snapshot saves are skipped until a buffer frees up.
    ///
    /// Default: 4
    pub snapshot_pool_max: usize,

    /// DEFLATE compression level for snapshots, `1..=9`. Level 1 is chosen
    /// by default because snapshots are taken every frame and latency
    /// matters more than ratio.
    ///
    /// Default: 1
    pub compression_level: u32,

    /// How long a peer may stay silent before it is declared disconnected
    /// and the session closes.
    ///
    /// Default: 3 s
    pub disconnect_timeout: Duration,

    /// How long a peer may stay silent before a disconnect warning is
    /// logged and the connection is reported as interrupted.
    ///
    /// Default: 1 s
    pub disconnect_notify_start: Duration,

    /// Time between keepalive packets when there is no input to send.
    ///
    /// Default: 200 ms
    pub keepalive_interval: Duration,

    /// Time between quality reports (ping probe plus frame advantage).
    ///
    /// Default: 200 ms
    pub quality_report_interval: Duration,
}

impl SessionConfig {
    /// Creates a configuration with the given player layout and default
    /// tunables.
    pub fn new(local_player: usize, player_count: usize, remote_addrs: Vec<SocketAddr>) -> Self {
        Self {
            local_player,
            player_count,
            remote_addrs,
            frame_delay: 1,
            max_prediction: MAX_PREDICTION_FRAMES,
            snapshot_buffer_size: DEFAULT_SNAPSHOT_BUFFER_SIZE,
            snapshot_pool_max: DEFAULT_SNAPSHOT_POOL_MAX,
            compression_level: 1,
            disconnect_timeout: Duration::from_secs(3),
            disconnect_notify_start: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(200),
            quality_report_interval: Duration::from_millis(200),
        }
    }

    /// Checks every field against its documented range.
    ///
    /// # Errors
    ///
    /// Returns [`FramelockError::InvalidArgument`] naming the offending
    /// field.
    pub fn validate(&self) -> FramelockResult<()> {
        if self.player_count < MIN_PLAYERS || self.player_count > MAX_PLAYERS {
            return Err(FramelockError::InvalidArgument {
                context: format!(
                    "player_count must be between {} and {} (got {})",
                    MIN_PLAYERS, MAX_PLAYERS, self.player_count
                ),
            });
        }
        if self.local_player < 1 || self.local_player > self.player_count {
            return Err(FramelockError::InvalidArgument {
                context: format!(
                    "local_player must be between 1 and {} (got {})",
                    self.player_count, self.local_player
                ),
            });
        }
        if self.remote_addrs.len() != self.player_count - 1 {
            return Err(FramelockError::InvalidArgument {
                context: format!(
                    "expected {} remote endpoints for {} players (got {})",
                    self.player_count - 1,
                    self.player_count,
                    self.remote_addrs.len()
                ),
            });
        }
        if self.max_prediction == 0 {
            return Err(FramelockError::InvalidArgument {
                context: "max_prediction must be at least 1".to_string(),
            });
        }
        if !(1..=9).contains(&self.compression_level) {
            return Err(FramelockError::InvalidArgument {
                context: format!(
                    "compression_level must be between 1 and 9 (got {})",
                    self.compression_level
                ),
            });
        }
        if self.snapshot_pool_max == 0 {
            return Err(FramelockError::InvalidArgument {
                context: "snapshot_pool_max must be at least 1".to_string(),
            });
        }
        if self.snapshot_buffer_size < INPUT_BYTES + crate::snapshot::envelope::HEADER_BYTES {
            return Err(FramelockError::InvalidArgument {
                context: format!(
                    "snapshot_buffer_size of {} bytes is too small to hold an envelope",
                    self.snapshot_buffer_size
                ),
            });
        }
        Ok(())
    }

    /// The zero-based handle of the local player.
    #[must_use]
    pub fn local_player_index(&self) -> usize {
        self.local_player.saturating_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn two_player() -> SessionConfig {
        SessionConfig::new(1, 2, vec!["127.0.0.1:7001".parse().unwrap()])
    }

    #[test]
    fn test_default_tunables() {
        let config = two_player();
        assert_eq!(config.frame_delay, 1);
        assert_eq!(config.max_prediction, 8);
        assert_eq!(config.snapshot_buffer_size, 8 * 1024 * 1024);
        assert_eq!(config.snapshot_pool_max, 4);
        assert_eq!(config.compression_level, 1);
        assert_eq!(config.disconnect_timeout, Duration::from_secs(3));
        assert_eq!(config.disconnect_notify_start, Duration::from_secs(1));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_player_count_out_of_range() {
        let mut config = two_player();
        config.player_count = 1;
        config.remote_addrs.clear();
        assert!(matches!(
            config.validate(),
            Err(FramelockError::InvalidArgument { .. })
        ));

        let mut config = two_player();
        config.player_count = 5;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_player_out_of_range() {
        let mut config = two_player();
        config.local_player = 0;
        assert!(config.validate().is_err());
        config.local_player = 3;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_remote_addr_count_must_match() {
        let mut config = two_player();
        config.remote_addrs.push("127.0.0.1:7002".parse().unwrap());
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_compression_level_bounds() {
        let mut config = two_player();
        config.compression_level = 0;
        assert!(config.validate().is_err());
        config.compression_level = 9;
        assert!(config.validate().is_ok());
        config.compression_level = 10;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_pool_of_one_is_allowed() {
        let mut config = two_player();
        config.snapshot_pool_max = 1;
        assert!(config.validate().is_ok());
        config.snapshot_pool_max = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_player_index_is_zero_based() {
        assert_eq!(two_player().local_player_index(), 0);
        let config = SessionConfig::new(2, 2, vec!["127.0.0.1:7001".parse().unwrap()]);
        assert_eq!(config.local_player_index(), 1);
    }
}
