//! # Framelock
//!
//! Framelock is a rollback netplay coordinator for frame-stepped game
//! emulators, written in 100% safe Rust. It keeps two to four players
//! synchronized over a lossy UDP-style link while hiding input latency:
//! remote inputs are predicted ahead of time, and when a prediction turns out
//! to be wrong the emulator is rewound to an earlier snapshot and driven
//! forward again with the corrected inputs.
//!
//! The emulator itself is a black box. Framelock reaches it through the
//! [`EmulatorHost`] trait, which exposes exactly four capabilities: advance
//! one frame, save state, load state, and read/write virtual controllers.
//! Everything else - input queues, prediction, snapshot compression, the peer
//! protocol - lives in this crate.
//!
//! ## Per-frame flow
//!
//! On every emulator frame the host calls, in order:
//!
//! 1. [`RollbackSession::add_local_input`] with the local controller record,
//! 2. [`RollbackSession::synchronize_inputs`] (or
//!    [`apply_inputs`](RollbackSession::apply_inputs)) to obtain one record
//!    per player, predictions included,
//! 3. the emulator executes the frame with those inputs,
//! 4. [`RollbackSession::advance_frame`], which snapshots the executed frame,
//!    drains the network, and rolls back and re-simulates if a remote input
//!    contradicted a prediction.

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![deny(rustdoc::broken_intra_doc_links)]

pub use error::FramelockError;

/// A specialized `Result` type for Framelock operations.
///
/// The second type parameter can override the error type where a function
/// needs to return something other than [`FramelockError`].
///
/// # Naming
///
/// The alias is named `FramelockResult` rather than `Result` so that glob
/// imports never shadow `std::result::Result`.
pub type FramelockResult<T, E = FramelockError> = std::result::Result<T, E>;

pub mod config;
pub mod emulator;
pub mod error;
pub mod input;
pub mod metrics;
pub mod session;

/// Snapshot handling: the wire envelope, the buffer pool and the state store.
pub mod snapshot {
    pub mod envelope;
    pub mod pool;
    pub mod store;
}

/// Peer networking: wire messages, the socket seam and per-peer protocol.
pub mod network {
    pub mod messages;
    pub mod protocol;
    pub mod udp_socket;
}

// Internal building blocks of the sync engine. Public so that integration
// tests can drive them directly, but not part of the stable API.
#[doc(hidden)]
pub mod engine;
#[doc(hidden)]
pub mod input_queue;
#[doc(hidden)]
pub mod time_sync;

pub use config::SessionConfig;
pub use emulator::{EmulatorHost, NativeInput};
pub use engine::SessionPhase;
pub use input::{Buttons, ControllerState, InputRecord};
pub use metrics::RollbackMetrics;
pub use network::messages::Message;
pub use network::udp_socket::{NonBlockingSocket, UdpNonBlockingSocket};
pub use session::RollbackSession;
pub use snapshot::envelope::SnapshotHeader;

// #############
// # CONSTANTS #
// #############

/// Internally, -1 represents no frame / invalid frame.
pub const NULL_FRAME: i32 = -1;

/// The number of frames the engine may speculate ahead of the last confirmed
/// remote input before it stalls.
pub const MAX_PREDICTION_FRAMES: usize = 8;

/// The fixed width of one encoded controller record on the wire, in bytes.
pub const INPUT_BYTES: usize = 32;

/// A frame is a single step of emulator execution.
///
/// Frames are the fundamental unit of time in rollback networking: frame
/// numbers start at 0 and increment by one per executed emulator frame. The
/// special value [`Frame::NULL`] (-1) represents "no frame".
///
/// `Frame` is a newtype around `i32` so frame numbers cannot accidentally be
/// mixed with other integers.
///
/// # Examples
///
/// ```
/// use framelock::Frame;
///
/// let frame = Frame::new(0);
/// assert!(frame.is_valid());
/// assert_eq!((frame + 1).as_i32(), 1);
/// assert!(Frame::NULL.is_null());
/// ```
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct Frame(i32);

impl Frame {
    /// The null frame constant, representing "no frame".
    pub const NULL: Self = Self(NULL_FRAME);

    /// Creates a new `Frame` from an `i32` value.
    ///
    /// This does not validate the frame number; use [`Frame::is_valid`] to
    /// check for a non-negative frame.
    #[inline]
    #[must_use]
    pub const fn new(frame: i32) -> Self {
        Self(frame)
    }

    /// Returns the underlying `i32` value.
    #[inline]
    #[must_use]
    pub const fn as_i32(self) -> i32 {
        self.0
    }

    /// Returns `true` if this frame is the null frame.
    #[inline]
    #[must_use]
    pub const fn is_null(self) -> bool {
        self.0 == NULL_FRAME
    }

    /// Returns `true` if this frame is valid (non-negative).
    #[inline]
    #[must_use]
    pub const fn is_valid(self) -> bool {
        self.0 >= 0
    }

    /// Returns the frame as a `usize`, or `None` if the frame is negative.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> Option<usize> {
        if self.0 >= 0 {
            Some(self.0 as usize)
        } else {
            None
        }
    }

    /// Calculates a ring-buffer slot for this frame using modular arithmetic.
    ///
    /// Returns `None` if the frame is negative or `buffer_size` is zero.
    #[inline]
    #[must_use]
    pub const fn buffer_index(self, buffer_size: usize) -> Option<usize> {
        if self.0 >= 0 && buffer_size > 0 {
            Some(self.0 as usize % buffer_size)
        } else {
            None
        }
    }

    /// Subtracts a value from this frame, saturating at the numeric bounds.
    #[inline]
    #[must_use]
    pub const fn saturating_sub(self, rhs: i32) -> Self {
        Self(self.0.saturating_sub(rhs))
    }
}

impl std::fmt::Display for Frame {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_null() {
            write!(f, "NULL_FRAME")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl std::ops::Add<i32> for Frame {
    type Output = Self;

    #[inline]
    fn add(self, rhs: i32) -> Self::Output {
        Self(self.0 + rhs)
    }
}

impl std::ops::AddAssign<i32> for Frame {
    #[inline]
    fn add_assign(&mut self, rhs: i32) {
        self.0 += rhs;
    }
}

impl std::ops::Sub<i32> for Frame {
    type Output = Self;

    #[inline]
    fn sub(self, rhs: i32) -> Self::Output {
        Self(self.0 - rhs)
    }
}

impl std::ops::Sub<Self> for Frame {
    type Output = i32;

    #[inline]
    fn sub(self, rhs: Self) -> Self::Output {
        self.0 - rhs.0
    }
}

impl From<i32> for Frame {
    #[inline]
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl From<Frame> for i32 {
    #[inline]
    fn from(frame: Frame) -> Self {
        frame.0
    }
}

/// A zero-based identifier for a player within a session.
///
/// Handles `0..player_count` denote players in the fixed ordering agreed at
/// session start; that ordering is never renegotiated.
#[derive(
    Debug,
    Copy,
    Clone,
    PartialEq,
    Eq,
    PartialOrd,
    Ord,
    Hash,
    Default,
    serde::Serialize,
    serde::Deserialize,
)]
pub struct PlayerHandle(usize);

impl PlayerHandle {
    /// Creates a new `PlayerHandle` from a zero-based index.
    ///
    /// This does not validate the handle against a session; use
    /// [`is_valid_for`](Self::is_valid_for) for that.
    #[inline]
    #[must_use]
    pub const fn new(handle: usize) -> Self {
        Self(handle)
    }

    /// Returns the underlying zero-based index.
    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0
    }

    /// Returns `true` if this handle refers to a valid player for a session
    /// with the given number of players.
    #[inline]
    #[must_use]
    pub const fn is_valid_for(self, player_count: usize) -> bool {
        self.0 < player_count
    }
}

impl std::fmt::Display for PlayerHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "player {}", self.0)
    }
}

impl From<usize> for PlayerHandle {
    #[inline]
    fn from(value: usize) -> Self {
        Self(value)
    }
}

/// Describes the provenance of one player's input record as returned by
/// input synchronization.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InputStatus {
    /// The record is an actual, authoritative input for this frame.
    Confirmed,
    /// The record is a prediction (last known input, held constant).
    Predicted,
}

impl std::fmt::Display for InputStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Confirmed => write!(f, "Confirmed"),
            Self::Predicted => write!(f, "Predicted"),
        }
    }
}

/// Stack-allocated vector of per-player input statuses.
///
/// Sessions have at most four players, so this never spills to the heap.
pub type StatusVec = smallvec::SmallVec<[InputStatus; 4]>;

// #########
// # TESTS #
// #########
