//! The seam between the coordinator and the emulator it drives.
//!
//! The emulator is a black box. Framelock only requires the handful of
//! primitives below: frame advance, save state, load state, controller
//! access, and RNG introspection. The host implements [`EmulatorHost`] once
//! and hands a mutable reference into every per-frame call; there is no
//! global callback registry.

use crate::{Frame, PlayerHandle};

/// A controller reading in the emulator's native layout: the raw button
/// bitmap plus the analog stick axes.
///
/// The native bitmap is translated to and from the canonical wire record by
/// [`crate::input`]; bits the mapping table does not know are ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NativeInput {
    /// The emulator's native button bitmap.
    pub buttons: u32,
    /// Analog stick X axis, -128..=127.
    pub stick_x: i8,
    /// Analog stick Y axis, -128..=127.
    pub stick_y: i8,
}

/// The callbacks Framelock requires from its host emulator.
///
/// All methods are invoked on the emulator thread, between frames; they are
/// allowed to block for milliseconds. Save and load operate on raw state
/// bytes - compression and framing are handled by the
/// [state store](crate::snapshot::store::StateStore), not the emulator.
pub trait EmulatorHost {
    /// Serializes the full emulator state for `frame` into `out` and returns
    /// the number of bytes written, or `None` if the emulator cannot save.
    ///
    /// The returned length must be the true size of the state; Framelock
    /// checksums and compresses exactly that many bytes.
    fn save_state(&mut self, frame: Frame, out: &mut [u8]) -> Option<usize>;

    /// Restores emulator state from previously saved bytes. Returns `false`
    /// if the emulator rejects the state.
    fn load_state(&mut self, state: &[u8]) -> bool;

    /// Runs the emulator for exactly one frame using whatever is currently
    /// written to the virtual controllers. Returns `false` on failure.
    fn advance_one_frame(&mut self) -> bool;

    /// Reads the live controller for `player`, or `None` if that controller
    /// is disconnected.
    fn input_read(&mut self, player: PlayerHandle) -> Option<NativeInput>;

    /// Writes a synchronized input to the virtual controller for `player`.
    fn input_write(&mut self, player: PlayerHandle, input: NativeInput);

    /// Returns the emulator's RNG seed, or `None` if the emulator does not
    /// support RNG introspection.
    ///
    /// Framelock refuses to start a session without RNG introspection: a
    /// guessed seed silently defeats desync detection.
    fn rng_state(&mut self) -> Option<u32>;
}
