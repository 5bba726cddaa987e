//! Canonical controller encoding.
//!
//! Controller state crosses the wire as a fixed 32-byte, little-endian
//! record so that every host produces identical bytes for identical logical
//! input. The canonical button bitfield is independent of the emulator's
//! native bitmap; [`ControllerState::from_native`] and
//! [`ControllerState::to_native`] translate between the two using a fixed
//! mapping table. Encoding is pure: no hidden state, no host-dependent
//! ordering.

use crate::emulator::{EmulatorHost, NativeInput};
use crate::{PlayerHandle, INPUT_BYTES};

bitflags::bitflags! {
    /// The canonical button bitfield carried in a controller record.
    ///
    /// Fourteen buttons are defined; bits 14 and 15 are reserved and must be
    /// zero on encode.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Buttons: u16 {
        /// A button.
        const A = 1 << 0;
        /// B button.
        const B = 1 << 1;
        /// Z trigger.
        const Z = 1 << 2;
        /// Start button.
        const START = 1 << 3;
        /// Directional pad up.
        const DPAD_UP = 1 << 4;
        /// Directional pad down.
        const DPAD_DOWN = 1 << 5;
        /// Directional pad left.
        const DPAD_LEFT = 1 << 6;
        /// Directional pad right.
        const DPAD_RIGHT = 1 << 7;
        /// Left shoulder button.
        const SHOULDER_L = 1 << 8;
        /// Right shoulder button.
        const SHOULDER_R = 1 << 9;
        /// C up.
        const C_UP = 1 << 10;
        /// C down.
        const C_DOWN = 1 << 11;
        /// C left.
        const C_LEFT = 1 << 12;
        /// C right.
        const C_RIGHT = 1 << 13;
    }
}

/// One encoded controller record: the fixed 32-byte wire representation of a
/// single player's input for a single frame.
pub type InputRecord = [u8; INPUT_BYTES];

/// An all-zero record, used for disconnected controllers and blank
/// predictions.
pub const BLANK_RECORD: InputRecord = [0; INPUT_BYTES];

/// Mapping between the emulator's native button bitmap and the canonical
/// bitfield. Native bits absent from this table are ignored.
const NATIVE_BUTTON_MAP: [(u32, Buttons); 14] = [
    (0x0001, Buttons::DPAD_RIGHT),
    (0x0002, Buttons::DPAD_LEFT),
    (0x0004, Buttons::DPAD_DOWN),
    (0x0008, Buttons::DPAD_UP),
    (0x0010, Buttons::START),
    (0x0020, Buttons::Z),
    (0x0040, Buttons::B),
    (0x0080, Buttons::A),
    (0x0100, Buttons::SHOULDER_R),
    (0x0200, Buttons::SHOULDER_L),
    (0x0400, Buttons::C_RIGHT),
    (0x0800, Buttons::C_LEFT),
    (0x1000, Buttons::C_DOWN),
    (0x2000, Buttons::C_UP),
];

/// The decoded, canonical state of one controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ControllerState {
    /// Digital buttons.
    pub buttons: Buttons,
    /// Analog stick X axis, -128..=127.
    pub stick_x: i8,
    /// Analog stick Y axis, -128..=127.
    pub stick_y: i8,
    /// Left trigger value, derived from [`Buttons::SHOULDER_L`].
    pub trigger_l: u8,
    /// Right trigger value, derived from [`Buttons::SHOULDER_R`].
    pub trigger_r: u8,
}

impl ControllerState {
    /// Translates a native controller reading into canonical form.
    ///
    /// Trigger values are derived from the shoulder bits: `0xFF` when held,
    /// `0` otherwise. Unknown native bits are ignored.
    #[must_use]
    pub fn from_native(native: NativeInput) -> Self {
        let mut buttons = Buttons::empty();
        for (native_bit, canonical) in NATIVE_BUTTON_MAP {
            if native.buttons & native_bit != 0 {
                buttons |= canonical;
            }
        }
        Self {
            buttons,
            stick_x: native.stick_x,
            stick_y: native.stick_y,
            trigger_l: if buttons.contains(Buttons::SHOULDER_L) { 0xFF } else { 0 },
            trigger_r: if buttons.contains(Buttons::SHOULDER_R) { 0xFF } else { 0 },
        }
    }

    /// Translates canonical state back into the emulator's native layout.
    #[must_use]
    pub fn to_native(self) -> NativeInput {
        let mut native_buttons = 0u32;
        for (native_bit, canonical) in NATIVE_BUTTON_MAP {
            if self.buttons.contains(canonical) {
                native_buttons |= native_bit;
            }
        }
        NativeInput {
            buttons: native_buttons,
            stick_x: self.stick_x,
            stick_y: self.stick_y,
        }
    }

    /// Encodes this state into the fixed 32-byte wire record.
    ///
    /// Layout (little-endian): buttons `u16`, stick X, stick Y, left
    /// trigger, right trigger, then reserved bytes which are always zero.
    #[must_use]
    pub fn encode(self) -> InputRecord {
        let mut record = BLANK_RECORD;
        record[0..2].copy_from_slice(&self.buttons.bits().to_le_bytes());
        record[2] = self.stick_x as u8;
        record[3] = self.stick_y as u8;
        record[4] = self.trigger_l;
        record[5] = self.trigger_r;
        // bytes 6..32 stay zero
        record
    }

    /// Decodes a wire record back into canonical state.
    ///
    /// Reserved button bits and reserved bytes are ignored.
    #[must_use]
    pub fn decode(record: &InputRecord) -> Self {
        let raw = u16::from_le_bytes([record[0], record[1]]);
        Self {
            buttons: Buttons::from_bits_truncate(raw),
            stick_x: record[2] as i8,
            stick_y: record[3] as i8,
            trigger_l: record[4],
            trigger_r: record[5],
        }
    }
}

/// Reads the live controller for the local player and encodes it into the
/// canonical record. A disconnected controller yields an all-zero record.
pub fn read_local<E: EmulatorHost + ?Sized>(emulator: &mut E, player: PlayerHandle) -> InputRecord {
    match emulator.input_read(player) {
        Some(native) => ControllerState::from_native(native).encode(),
        None => BLANK_RECORD,
    }
}

/// Decodes a record and writes it to the virtual controller `player`.
pub fn apply<E: EmulatorHost + ?Sized>(
    emulator: &mut E,
    record: &InputRecord,
    player: PlayerHandle,
) {
    let state = ControllerState::decode(record);
    emulator.input_write(player, state.to_native());
}

// #########
// # TESTS #
// #########
