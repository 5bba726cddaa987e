//! Shared test fixtures: a deterministic mock emulator and a two-engine
//! rig connected by an in-order, delayable message pipe.

#![allow(dead_code)]

use std::collections::VecDeque;

use crossbeam_channel::{unbounded, Sender};
use framelock::emulator::{EmulatorHost, NativeInput};
use framelock::engine::{EngineSettings, SyncEngine};
use framelock::input::BLANK_RECORD;
use framelock::metrics::MetricsCell;
use framelock::network::protocol::PeerEvent;
use framelock::snapshot::store::StateStore;
use framelock::{Frame, FramelockError, InputRecord, PlayerHandle, INPUT_BYTES};

/// A deterministic emulator stand-in. Its state is a frame counter and an
/// accumulator folded over every controller input applied, so two instances
/// fed the same input history are byte-identical.
pub struct MockEmulator {
    pub frame: u64,
    pub accum: u64,
    pub controllers: [NativeInput; 4],
}

impl MockEmulator {
    pub fn new() -> Self {
        Self {
            frame: 0,
            accum: 0x243F_6A88_85A3_08D3,
            controllers: [NativeInput::default(); 4],
        }
    }

    /// A digest of the full logical state.
    pub fn checksum(&self) -> u64 {
        self.accum ^ self.frame.rotate_left(32)
    }
}

impl EmulatorHost for MockEmulator {
    fn save_state(&mut self, _frame: Frame, out: &mut [u8]) -> Option<usize> {
        let mut cursor = 0;
        out[cursor..cursor + 8].copy_from_slice(&self.frame.to_le_bytes());
        cursor += 8;
        out[cursor..cursor + 8].copy_from_slice(&self.accum.to_le_bytes());
        cursor += 8;
        for controller in &self.controllers {
            out[cursor..cursor + 4].copy_from_slice(&controller.buttons.to_le_bytes());
            out[cursor + 4] = controller.stick_x as u8;
            out[cursor + 5] = controller.stick_y as u8;
            cursor += 6;
        }
        Some(cursor)
    }

    fn load_state(&mut self, state: &[u8]) -> bool {
        self.frame = u64::from_le_bytes(state[0..8].try_into().unwrap());
        self.accum = u64::from_le_bytes(state[8..16].try_into().unwrap());
        let mut cursor = 16;
        for controller in &mut self.controllers {
            controller.buttons = u32::from_le_bytes(state[cursor..cursor + 4].try_into().unwrap());
            controller.stick_x = state[cursor + 4] as i8;
            controller.stick_y = state[cursor + 5] as i8;
            cursor += 6;
        }
        true
    }

    fn advance_one_frame(&mut self) -> bool {
        self.frame += 1;
        for controller in &self.controllers {
            self.accum = self
                .accum
                .rotate_left(9)
                .wrapping_mul(0x100_0000_01B3)
                .wrapping_add(controller.buttons as u64)
                .wrapping_add(controller.stick_x as u8 as u64)
                .wrapping_add((controller.stick_y as u8 as u64) << 8);
        }
        true
    }

    fn input_read(&mut self, player: PlayerHandle) -> Option<NativeInput> {
        Some(self.controllers[player.as_usize()])
    }

    fn input_write(&mut self, player: PlayerHandle, input: NativeInput) {
        self.controllers[player.as_usize()] = input;
    }

    fn rng_state(&mut self) -> Option<u32> {
        Some(self.accum as u32)
    }
}

/// Builds a wire record whose first byte is `value`.
pub fn record(value: u8) -> InputRecord {
    let mut record = BLANK_RECORD;
    record[0] = value;
    record
}

/// One peer of the rig: an engine plus its emulator.
pub struct Side {
    pub engine: SyncEngine,
    pub emulator: MockEmulator,
    events: Sender<(PlayerHandle, PeerEvent)>,
    remote: PlayerHandle,
}

impl Side {
    fn new(local: usize, frame_delay: usize) -> Self {
        let (tx, rx) = unbounded();
        let settings = EngineSettings {
            local_player: PlayerHandle::new(local),
            player_count: 2,
            frame_delay,
            max_prediction: 8,
        };
        let store = StateStore::new(16 * 1024, 12, 1);
        let mut engine = SyncEngine::new(settings, store, rx, MetricsCell::new());
        let mut emulator = MockEmulator::new();
        engine
            .capture_initial_snapshot(&mut emulator)
            .expect("initial snapshot");

        let remote = PlayerHandle::new(1 - local);
        tx.send((remote, PeerEvent::Connected)).unwrap();
        engine.pump_events();

        Self {
            engine,
            emulator,
            events: tx,
            remote,
        }
    }

    /// Injects one authoritative remote input into this side's FIFO.
    pub fn receive_remote(&self, frame: Frame, record: InputRecord) {
        self.events
            .send((self.remote, PeerEvent::Input { frame, record }))
            .unwrap();
    }

    /// Runs one full frame with the given local input. Returns the records
    /// that became authoritative and must travel to the peer, or the
    /// engine's refusal.
    pub fn step(&mut self, local: u8) -> Result<Vec<(Frame, InputRecord)>, FramelockError> {
        // a host polls the network before sampling input; mirror that
        self.engine.pump_events();
        let outgoing = self.engine.add_local_input(record(local))?;
        let mut out = [0u8; 2 * INPUT_BYTES];
        self.engine.synchronize_inputs(&mut out)?;
        for player in 0..2 {
            let mut one = BLANK_RECORD;
            one.copy_from_slice(&out[player * INPUT_BYTES..(player + 1) * INPUT_BYTES]);
            framelock::input::apply(&mut self.emulator, &one, PlayerHandle::new(player));
        }
        assert!(self.emulator.advance_one_frame());
        self.engine.advance_frame(&mut self.emulator)?;
        Ok(outgoing)
    }
}

/// Two engines joined by in-order pipes with per-message delivery delays.
///
/// A delayed message also delays everything queued behind it, the way a
/// batched, sequenced input stream behaves on a real link.
pub struct EnginePair {
    pub a: Side,
    pub b: Side,
    to_a: VecDeque<(u64, Frame, InputRecord)>,
    to_b: VecDeque<(u64, Frame, InputRecord)>,
    pub now: u64,
}

impl EnginePair {
    pub fn new(frame_delay: usize) -> Self {
        Self {
            a: Side::new(0, frame_delay),
            b: Side::new(1, frame_delay),
            to_a: VecDeque::new(),
            to_b: VecDeque::new(),
            now: 0,
        }
    }

    /// Runs one frame on both sides. `delay_to_a` / `delay_to_b` are the
    /// delivery delays (in steps) applied to the inputs generated this
    /// frame. Returns which sides actually advanced.
    pub fn step_both(
        &mut self,
        local_a: u8,
        local_b: u8,
        delay_to_b: u64,
        delay_to_a: u64,
    ) -> (bool, bool) {
        self.deliver_due();

        let advanced_a = match self.a.step(local_a) {
            Ok(outgoing) => {
                Self::schedule(&mut self.to_b, self.now + delay_to_b, outgoing);
                true
            },
            Err(FramelockError::WouldOverflow { .. }) => false,
            Err(error) => panic!("side a failed: {error}"),
        };
        let advanced_b = match self.b.step(local_b) {
            Ok(outgoing) => {
                Self::schedule(&mut self.to_a, self.now + delay_to_a, outgoing);
                true
            },
            Err(FramelockError::WouldOverflow { .. }) => false,
            Err(error) => panic!("side b failed: {error}"),
        };

        self.now += 1;
        (advanced_a, advanced_b)
    }

    /// Flushes every pending message immediately and lets both engines
    /// observe them.
    pub fn release_everything(&mut self) {
        while let Some((_, frame, record)) = self.to_a.pop_front() {
            self.a.receive_remote(frame, record);
        }
        while let Some((_, frame, record)) = self.to_b.pop_front() {
            self.b.receive_remote(frame, record);
        }
        self.a.engine.pump_events();
        self.b.engine.pump_events();
    }

    fn schedule(
        queue: &mut VecDeque<(u64, Frame, InputRecord)>,
        release_at: u64,
        outgoing: Vec<(Frame, InputRecord)>,
    ) {
        // keep delivery in order: nothing overtakes an earlier message
        let floor = queue.back().map(|(at, _, _)| *at).unwrap_or(0);
        let release_at = release_at.max(floor);
        for (frame, record) in outgoing {
            queue.push_back((release_at, frame, record));
        }
    }

    fn deliver_due(&mut self) {
        while let Some(&(at, frame, record)) = self.to_a.front() {
            if at > self.now {
                break;
            }
            self.a.receive_remote(frame, record);
            self.to_a.pop_front();
        }
        while let Some(&(at, frame, record)) = self.to_b.front() {
            if at > self.now {
                break;
            }
            self.b.receive_remote(frame, record);
            self.to_b.pop_front();
        }
    }
}
