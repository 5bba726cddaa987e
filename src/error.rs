//! The error taxonomy of the crate.
//!
//! Every fallible operation returns [`FramelockError`]. Only two variants are
//! recoverable: [`PoolExhausted`](FramelockError::PoolExhausted) (skip this
//! save and retry next frame) and
//! [`WouldOverflow`](FramelockError::WouldOverflow) (stall one frame and
//! retry). Everything else is fatal to the session, never to the process.

use std::error::Error;
use std::fmt;
use std::fmt::Display;

use crate::{Frame, PlayerHandle};

/// All errors this library can return.
///
/// # Forward Compatibility
///
/// This enum is marked `#[non_exhaustive]` because new error variants may be
/// added in future versions. Always include a wildcard arm when matching.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum FramelockError {
    /// A lifecycle or control-surface call was made with parameters out of
    /// range, or in a state where the call is not allowed.
    InvalidArgument {
        /// Further specifies what was invalid.
        context: String,
    },
    /// A second session was constructed while one is still active. Exactly
    /// one session may exist at a time per process.
    AlreadyActive,
    /// Binding or configuring the network socket failed.
    NetworkInit {
        /// The underlying socket error, rendered as text.
        context: String,
    },
    /// All snapshot buffers are currently in use. Transient: skip this save
    /// and retry on a later frame.
    PoolExhausted,
    /// The DEFLATE encoder rejected the snapshot payload.
    CompressionFailed {
        /// A description of what went wrong.
        context: String,
    },
    /// The DEFLATE decoder rejected the snapshot payload.
    DecompressionFailed {
        /// A description of what went wrong.
        context: String,
    },
    /// A snapshot envelope did not start with the expected magic number.
    BadMagic {
        /// The magic value that was actually found.
        found: u32,
    },
    /// A snapshot envelope carried a version this build does not understand.
    UnsupportedVersion {
        /// The version that was actually found.
        found: u32,
    },
    /// A snapshot envelope was shorter than its header claims.
    Truncated {
        /// The number of bytes the envelope requires.
        needed: usize,
        /// The number of bytes that were actually available.
        available: usize,
    },
    /// An emulator callback reported failure.
    EmulatorRejected {
        /// The callback that failed.
        operation: &'static str,
    },
    /// A peer timed out, or an operation was attempted on a closed session.
    Disconnected {
        /// The peer that went silent.
        player: PlayerHandle,
    },
    /// A rollback target lies beyond the snapshot ring; the peers have
    /// diverged beyond repair.
    Desynchronized {
        /// The frame the engine needed to rewind to.
        frame: Frame,
    },
    /// The unconfirmed input window is full. Transient: stall one frame
    /// until remote confirmations catch up.
    WouldOverflow {
        /// The frame for which input could not be accepted.
        frame: Frame,
    },
}

impl FramelockError {
    /// Returns `true` if the session can continue after this error.
    ///
    /// Recoverable errors are [`PoolExhausted`](Self::PoolExhausted) and
    /// [`WouldOverflow`](Self::WouldOverflow); any other error closes the
    /// session.
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        matches!(self, Self::PoolExhausted | Self::WouldOverflow { .. })
    }
}

impl Display for FramelockError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidArgument { context } => {
                write!(f, "Invalid argument: {}", context)
            },
            Self::AlreadyActive => {
                write!(f, "Another rollback session is already active.")
            },
            Self::NetworkInit { context } => {
                write!(f, "Network initialization failed: {}", context)
            },
            Self::PoolExhausted => {
                write!(f, "All snapshot buffers are in use.")
            },
            Self::CompressionFailed { context } => {
                write!(f, "Snapshot compression failed: {}", context)
            },
            Self::DecompressionFailed { context } => {
                write!(f, "Snapshot decompression failed: {}", context)
            },
            Self::BadMagic { found } => {
                write!(f, "Invalid snapshot format (wrong magic number {:#010x})", found)
            },
            Self::UnsupportedVersion { found } => {
                write!(f, "Unsupported snapshot version {}", found)
            },
            Self::Truncated { needed, available } => {
                write!(
                    f,
                    "Snapshot is smaller than expected (needed {} bytes, got {})",
                    needed, available
                )
            },
            Self::EmulatorRejected { operation } => {
                write!(f, "Emulator callback rejected operation: {}", operation)
            },
            Self::Disconnected { player } => {
                write!(f, "Connection to {} was lost.", player)
            },
            Self::Desynchronized { frame } => {
                write!(
                    f,
                    "No snapshot available to roll back to frame {}; session is desynchronized.",
                    frame
                )
            },
            Self::WouldOverflow { frame } => {
                write!(
                    f,
                    "Prediction window is full, cannot accept input for frame {}.",
                    frame
                )
            },
        }
    }
}

impl Error for FramelockError {
    /// Error context is stored as structured fields or strings rather than
    /// wrapped error types. This keeps the type `Clone` and `Eq`, which a
    /// `dyn Error` source could not be.
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_argument_display() {
        let err = FramelockError::InvalidArgument {
            context: "player_count must be between 2 and 4".to_string(),
        };
        let display = format!("{}", err);
        assert!(display.contains("Invalid argument"));
        assert!(display.contains("player_count"));
    }

    #[test]
    fn test_bad_magic_display() {
        let err = FramelockError::BadMagic { found: 0 };
        let display = format!("{}", err);
        assert!(display.contains("magic"));
        assert!(display.contains("0x00000000"));
    }

    #[test]
    fn test_truncated_display() {
        let err = FramelockError::Truncated {
            needed: 100,
            available: 36,
        };
        let display = format!("{}", err);
        assert!(display.contains("100"));
        assert!(display.contains("36"));
    }

    #[test]
    fn test_disconnected_display() {
        let err = FramelockError::Disconnected {
            player: PlayerHandle::new(1),
        };
        let display = format!("{}", err);
        assert!(display.contains("player 1"));
    }

    #[test]
    fn test_desynchronized_display() {
        let err = FramelockError::Desynchronized {
            frame: Frame::new(42),
        };
        let display = format!("{}", err);
        assert!(display.contains("42"));
        assert!(display.contains("desynchronized"));
    }

    #[test]
    fn test_recoverable_classification() {
        assert!(FramelockError::PoolExhausted.is_recoverable());
        assert!(FramelockError::WouldOverflow {
            frame: Frame::new(0)
        }
        .is_recoverable());
        assert!(!FramelockError::AlreadyActive.is_recoverable());
        assert!(!FramelockError::Desynchronized {
            frame: Frame::new(0)
        }
        .is_recoverable());
        assert!(!FramelockError::EmulatorRejected {
            operation: "save_state"
        }
        .is_recoverable());
    }

    #[test]
    fn test_error_implements_std_error() {
        let err: Box<dyn Error> = Box::new(FramelockError::AlreadyActive);
        assert!(err.source().is_none());
    }

    #[test]
    fn test_error_clone_and_eq() {
        let err = FramelockError::UnsupportedVersion { found: 2 };
        assert_eq!(err.clone(), err);
    }
}
