//! The rollback state machine.
//!
//! `SyncEngine` is single-threaded and cooperative: every operation runs on
//! the emulator thread, driven by the host's per-frame calls. It owns the
//! per-player input queues, the snapshot ring and the state store, and it is
//! the only consumer of the network-event FIFO.
//!
//! A frame proceeds as: local input enters the local queue (delayed by
//! `frame_delay`), synchronized inputs (authoritative or predicted) go out
//! to the emulator, the emulator executes, and
//! [`advance_frame`](SyncEngine::advance_frame) closes the loop - applying
//! network events in frame order, rolling back and re-simulating when an
//! authoritative input contradicts a prediction, snapshotting the executed
//! frame, and advancing the frame counter.

use crossbeam_channel::Receiver;
use tracing::{debug, info, trace, warn};

use crate::emulator::EmulatorHost;
use crate::input::{self, InputRecord};
use crate::input_queue::{FrameInput, InputQueue};
use crate::metrics::MetricsCell;
use crate::network::protocol::PeerEvent;
use crate::snapshot::store::{Snapshot, StateStore};
use crate::time_sync::TimeSync;
use crate::{
    Frame, FramelockError, FramelockResult, InputStatus, PlayerHandle, StatusVec, INPUT_BYTES,
};

/// The lifecycle states of a running engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionPhase {
    /// Waiting for every remote peer to answer the handshake.
    Connecting,
    /// Synchronized and exchanging inputs.
    Running,
    /// A peer has fallen so far behind that another frame would overrun
    /// the prediction window; frame advance is held until its inputs
    /// catch up.
    Stalled,
    /// The session is over; every further operation fails.
    Closed,
}

impl std::fmt::Display for SessionPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connecting => write!(f, "Connecting"),
            Self::Running => write!(f, "Running"),
            Self::Stalled => write!(f, "Stalled"),
            Self::Closed => write!(f, "Closed"),
        }
    }
}

/// Construction parameters for [`SyncEngine`].
#[derive(Debug, Clone, Copy)]
pub struct EngineSettings {
    /// Zero-based handle of the local player.
    pub local_player: PlayerHandle,
    /// Total number of players.
    pub player_count: usize,
    /// Frames of delay applied to local input.
    pub frame_delay: usize,
    /// Speculation bound: how far past the confirmation frontier the engine
    /// may run.
    pub max_prediction: usize,
}

/// Bounded ring of snapshots keyed by frame number.
///
/// Slot assignment is `frame % capacity`; inserting over an older snapshot
/// returns its buffer to the pool.
#[derive(Debug)]
struct SnapshotRing {
    slots: Vec<Option<Snapshot>>,
}

impl SnapshotRing {
    fn new(capacity: usize) -> Self {
        Self {
            slots: (0..capacity).map(|_| None).collect(),
        }
    }

    fn insert(&mut self, snapshot: Snapshot, store: &mut StateStore) {
        let Some(slot) = snapshot.frame().buffer_index(self.slots.len()) else {
            store.release(snapshot);
            return;
        };
        if let Some(evicted) = self.slots[slot].replace(snapshot) {
            store.release(evicted);
        }
    }

    fn newest_at_or_before(&self, frame: Frame) -> Option<&Snapshot> {
        self.slots
            .iter()
            .flatten()
            .filter(|snapshot| snapshot.frame() <= frame)
            .max_by_key(|snapshot| snapshot.frame())
    }

    /// Drops a snapshot previously taken for exactly `frame`. Called before
    /// a frame is re-saved during resimulation: even if the new save is
    /// skipped, a snapshot from the discarded timeline must not linger, and
    /// releasing it first makes its buffer available to the save.
    fn evict_frame(&mut self, frame: Frame, store: &mut StateStore) {
        let Some(slot) = frame.buffer_index(self.slots.len()) else {
            return;
        };
        if self.slots[slot]
            .as_ref()
            .is_some_and(|snapshot| snapshot.frame() == frame)
        {
            if let Some(evicted) = self.slots[slot].take() {
                store.release(evicted);
            }
        }
    }

    fn contains(&self, frame: Frame) -> bool {
        frame
            .buffer_index(self.slots.len())
            .map(|slot| {
                self.slots[slot]
                    .as_ref()
                    .is_some_and(|snapshot| snapshot.frame() == frame)
            })
            .unwrap_or(false)
    }

    /// Releases every snapshot older than the newest one at or before
    /// `frontier`. That newest one is the anchor any future rollback can
    /// still start from.
    fn reclaim_stale(&mut self, frontier: Frame, store: &mut StateStore) {
        let Some(anchor) = self
            .newest_at_or_before(frontier)
            .map(|snapshot| snapshot.frame())
        else {
            return;
        };
        for slot in &mut self.slots {
            if slot
                .as_ref()
                .is_some_and(|snapshot| snapshot.frame() < anchor)
            {
                if let Some(stale) = slot.take() {
                    store.release(stale);
                }
            }
        }
    }

    /// The frame of the oldest retained snapshot, if any.
    fn oldest_frame(&self) -> Frame {
        self.slots
            .iter()
            .flatten()
            .map(Snapshot::frame)
            .min()
            .unwrap_or(Frame::NULL)
    }

    fn clear(&mut self, store: &mut StateStore) {
        for slot in &mut self.slots {
            if let Some(snapshot) = slot.take() {
                store.release(snapshot);
            }
        }
    }
}

/// The rollback state machine. See the module docs for the frame lifecycle.
#[derive(Debug)]
pub struct SyncEngine {
    local_player: PlayerHandle,
    player_count: usize,
    max_prediction: usize,

    phase: SessionPhase,
    close_reason: Option<FramelockError>,

    current_frame: Frame,
    current_input_seq: u32,
    last_saved_input_seq: u32,
    /// Highest local frame already handed to the session for broadcast.
    last_broadcast_frame: Frame,

    queues: Vec<InputQueue>,
    ring: SnapshotRing,
    /// Pre-session snapshot taken before frame 0 ever executed; the rollback
    /// target of last resort.
    initial: Option<Snapshot>,
    store: StateStore,

    connected: Vec<bool>,
    events: Receiver<(PlayerHandle, PeerEvent)>,
    time_sync: TimeSync,
    metrics: MetricsCell,
    rollback_just_occurred: bool,
}

impl SyncEngine {
    /// Creates an engine in the [`Connecting`](SessionPhase::Connecting)
    /// phase.
    #[must_use]
    pub fn new(
        settings: EngineSettings,
        store: StateStore,
        events: Receiver<(PlayerHandle, PeerEvent)>,
        metrics: MetricsCell,
    ) -> Self {
        let mut queues = Vec::with_capacity(settings.player_count);
        for _ in 0..settings.player_count {
            queues.push(InputQueue::new());
        }
        queues[settings.local_player.as_usize()].set_frame_delay(settings.frame_delay);

        let mut connected = vec![false; settings.player_count];
        connected[settings.local_player.as_usize()] = true;

        Self {
            local_player: settings.local_player,
            player_count: settings.player_count,
            max_prediction: settings.max_prediction,
            phase: SessionPhase::Connecting,
            close_reason: None,
            current_frame: Frame::new(0),
            current_input_seq: 0,
            last_saved_input_seq: 0,
            last_broadcast_frame: Frame::NULL,
            queues,
            ring: SnapshotRing::new(settings.max_prediction + 1),
            initial: None,
            store,
            connected,
            events,
            time_sync: TimeSync::new(),
            metrics,
            rollback_just_occurred: false,
        }
    }

    /// Stores the pre-session snapshot captured before frame 0 executed.
    pub fn set_initial_snapshot(&mut self, snapshot: Snapshot) {
        if let Some(previous) = self.initial.replace(snapshot) {
            self.store.release(previous);
        }
    }

    /// Captures the pre-session snapshot through the state store.
    pub fn capture_initial_snapshot<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
    ) -> FramelockResult<()> {
        let snapshot = self.store.save(emulator, Frame::new(0), 0)?;
        self.set_initial_snapshot(snapshot);
        Ok(())
    }

    /// The current lifecycle phase.
    #[must_use]
    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    /// The frame the emulator is about to execute.
    #[must_use]
    pub fn current_frame(&self) -> Frame {
        self.current_frame
    }

    /// The local player's handle.
    #[must_use]
    pub fn local_player(&self) -> PlayerHandle {
        self.local_player
    }

    /// The local input sequence counter.
    #[must_use]
    pub fn current_input_seq(&self) -> u32 {
        self.current_input_seq
    }

    /// The input sequence recorded into the most recent snapshot.
    #[must_use]
    pub fn last_saved_input_seq(&self) -> u32 {
        self.last_saved_input_seq
    }

    /// A copy of the current rollback metrics.
    #[must_use]
    pub fn metrics(&self) -> crate::metrics::RollbackMetrics {
        self.metrics.snapshot()
    }

    /// Returns `true` exactly once after each rollback, for host-side
    /// effects like an on-screen flash.
    pub fn rollback_just_occurred(&mut self) -> bool {
        std::mem::take(&mut self.rollback_just_occurred)
    }

    /// The confirmation frontier: the highest frame for which inputs from
    /// every remote player are authoritative. [`Frame::NULL`] until the
    /// first remote input arrives.
    #[must_use]
    pub fn confirmation_frontier(&self) -> Frame {
        let mut frontier = Frame::new(i32::MAX);
        for (index, queue) in self.queues.iter().enumerate() {
            if index == self.local_player.as_usize() {
                continue;
            }
            frontier = std::cmp::min(frontier, queue.last_confirmed_frame());
        }
        frontier
    }

    /// How many frames the local side runs ahead of the confirmation
    /// frontier. Sent to peers in quality reports.
    #[must_use]
    pub fn local_frame_advantage(&self) -> i16 {
        let gap = self.current_frame - self.confirmation_frontier();
        gap.clamp(i16::MIN as i32, i16::MAX as i32) as i16
    }

    /// Appends the local input for the current frame (shifted by the frame
    /// delay) and returns the records that became authoritative, for
    /// broadcast to every peer.
    ///
    /// # Errors
    ///
    /// - [`FramelockError::WouldOverflow`] when the speculation window is
    ///   full; the engine is stalled until remote inputs catch up.
    /// - [`FramelockError::InvalidArgument`] while still connecting.
    /// - The closing error after the session is closed.
    pub fn add_local_input(
        &mut self,
        record: InputRecord,
    ) -> FramelockResult<Vec<(Frame, InputRecord)>> {
        match self.phase {
            SessionPhase::Closed => return Err(self.closed_error()),
            SessionPhase::Connecting => {
                return Err(FramelockError::InvalidArgument {
                    context: "session is still connecting".to_string(),
                });
            },
            SessionPhase::Running | SessionPhase::Stalled => {},
        }

        // the speculation bound: once this frame executes and the counter
        // advances, current_frame - frontier must still be at most
        // max_prediction, so the frame is only admitted while the gap is
        // strictly below the bound
        let gap = self.current_frame - self.confirmation_frontier();
        if gap >= self.max_prediction as i32 {
            if self.phase != SessionPhase::Stalled {
                debug!(
                    frame = %self.current_frame,
                    frontier = %self.confirmation_frontier(),
                    "prediction window full, stalling"
                );
                self.phase = SessionPhase::Stalled;
            }
            return Err(FramelockError::WouldOverflow {
                frame: self.current_frame,
            });
        }
        if self.phase == SessionPhase::Stalled {
            info!(frame = %self.current_frame, "peer caught up, resuming");
            self.phase = SessionPhase::Running;
        }

        self.current_input_seq += 1;
        let stored = self.queues[self.local_player.as_usize()]
            .add_input(FrameInput::new(self.current_frame, record));
        if stored.is_null() {
            // out-of-sequence local input; nothing new to broadcast
            return Ok(Vec::new());
        }

        // frame delay may have replicated records to fill a gap; broadcast
        // everything that became authoritative since the last call
        let mut outgoing = Vec::new();
        let local_queue = &self.queues[self.local_player.as_usize()];
        let mut frame = self.last_broadcast_frame + 1;
        if frame.is_null() || frame.as_i32() < 0 {
            frame = Frame::new(0);
        }
        while frame <= stored {
            if let Some(record) = local_queue.confirmed_record(frame) {
                outgoing.push((frame, record));
            }
            frame += 1;
        }
        self.last_broadcast_frame = stored;
        Ok(outgoing)
    }

    /// Fills `out` with `player_count` consecutive 32-byte records for the
    /// current frame: authoritative where confirmed, predictions otherwise.
    ///
    /// # Errors
    ///
    /// - [`FramelockError::InvalidArgument`] if `out` is too small or the
    ///   session is still connecting.
    /// - [`FramelockError::WouldOverflow`] while stalled; no input is
    ///   emitted until confirmations arrive.
    /// - The closing error after the session is closed.
    pub fn synchronize_inputs(&mut self, out: &mut [u8]) -> FramelockResult<StatusVec> {
        match self.phase {
            SessionPhase::Closed => return Err(self.closed_error()),
            SessionPhase::Connecting => {
                return Err(FramelockError::InvalidArgument {
                    context: "session is still connecting".to_string(),
                });
            },
            SessionPhase::Stalled => {
                return Err(FramelockError::WouldOverflow {
                    frame: self.current_frame,
                });
            },
            SessionPhase::Running => {},
        }

        let needed = self.player_count * INPUT_BYTES;
        if out.len() < needed {
            return Err(FramelockError::InvalidArgument {
                context: format!(
                    "output buffer holds {} bytes, need {}",
                    out.len(),
                    needed
                ),
            });
        }

        let mut statuses = StatusVec::new();
        for player in 0..self.player_count {
            let (record, status) = self.queues[player].input(self.current_frame);
            out[player * INPUT_BYTES..(player + 1) * INPUT_BYTES].copy_from_slice(&record);
            statuses.push(status);
        }

        let predicted = statuses
            .iter()
            .filter(|status| **status == InputStatus::Predicted)
            .count();
        trace!(frame = %self.current_frame, predicted, "synchronized inputs");
        Ok(statuses)
    }

    /// Applies queued network events. Input events are applied in
    /// frame-ascending order; lifecycle events in arrival order.
    ///
    /// Called from [`advance_frame`](Self::advance_frame) and, through the
    /// session, while stalled - so that the gap can close and the engine can
    /// resume without frames advancing.
    pub fn pump_events(&mut self) {
        let mut inputs: Vec<(PlayerHandle, Frame, InputRecord)> = Vec::new();
        while let Ok((player, event)) = self.events.try_recv() {
            match event {
                PeerEvent::Input { frame, record } => inputs.push((player, frame, record)),
                other => self.apply_lifecycle_event(player, other),
            }
        }

        inputs.sort_by_key(|(_, frame, _)| *frame);
        for (player, frame, record) in inputs {
            if !player.is_valid_for(self.player_count) || player == self.local_player {
                continue;
            }
            self.queues[player.as_usize()].add_input(FrameInput::new(frame, record));
        }

        // resume once the gap has closed far enough to admit a frame again
        if self.phase == SessionPhase::Stalled {
            let gap = self.current_frame - self.confirmation_frontier();
            if gap < self.max_prediction as i32 {
                info!(frame = %self.current_frame, "peer caught up, resuming");
                self.phase = SessionPhase::Running;
            }
        }
    }

    fn apply_lifecycle_event(&mut self, player: PlayerHandle, event: PeerEvent) {
        match event {
            PeerEvent::Connected => {
                if let Some(slot) = self.connected.get_mut(player.as_usize()) {
                    *slot = true;
                }
                if self.phase == SessionPhase::Connecting
                    && self.connected.iter().all(|&connected| connected)
                {
                    info!("all peers connected, session running");
                    self.phase = SessionPhase::Running;
                    self.metrics.update(|metrics| metrics.reset());
                }
            },
            PeerEvent::QualityHint { frame_advantage } => {
                let local = self.local_frame_advantage() as i32;
                self.time_sync
                    .advance_frame(self.current_frame, local, frame_advantage as i32);
                self.metrics.update(|metrics| {
                    metrics.remote_frame_advantage = self.time_sync.average_frame_advantage();
                    // a peer reporting itself ahead is a rollback signal of
                    // that many frames
                    if frame_advantage > 0 {
                        metrics.record_rollback(frame_advantage as u32);
                    }
                });
                if frame_advantage > 0 {
                    self.rollback_just_occurred = true;
                }
            },
            PeerEvent::NetworkInterrupted => {
                warn!(peer = %player, "peer connection interrupted");
            },
            PeerEvent::NetworkResumed => {
                info!(peer = %player, "peer connection resumed");
            },
            PeerEvent::Disconnected => {
                warn!(peer = %player, "peer disconnected, closing session");
                self.metrics.update(|metrics| metrics.reset());
                self.close(FramelockError::Disconnected { player });
            },
            PeerEvent::Input { .. } => unreachable!("input events are applied separately"),
        }
    }

    /// Signals that the emulator has executed the current frame.
    ///
    /// Drains the network, rolls back and re-simulates if any authoritative
    /// input for a frame at or before the current one contradicted its
    /// prediction, snapshots the executed frame, and advances the frame
    /// counter.
    ///
    /// # Errors
    ///
    /// Fatal errors ([`FramelockError::Desynchronized`],
    /// [`FramelockError::EmulatorRejected`], decompression failures) close
    /// the session and are returned; pool exhaustion merely skips this
    /// frame's snapshot.
    pub fn advance_frame<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
    ) -> FramelockResult<()> {
        match self.phase {
            SessionPhase::Closed => return Err(self.closed_error()),
            SessionPhase::Connecting => {
                return Err(FramelockError::InvalidArgument {
                    context: "session is still connecting".to_string(),
                });
            },
            SessionPhase::Running | SessionPhase::Stalled => {},
        }

        self.pump_events();
        if self.phase == SessionPhase::Closed {
            return Err(self.closed_error());
        }
        if self.phase == SessionPhase::Stalled {
            // the frame was never handed out; nothing to advance past
            return Err(FramelockError::WouldOverflow {
                frame: self.current_frame,
            });
        }

        let mut saved_current = false;
        if let Some(first_incorrect) = self.first_incorrect_frame() {
            if first_incorrect <= self.current_frame {
                self.rollback(emulator, first_incorrect)?;
                saved_current = self.ring.contains(self.current_frame);
            }
        }

        // make room before snapshotting: everything older than the newest
        // snapshot at or before the frontier can go back to the pool
        let frontier = self.confirmation_frontier();
        self.ring.reclaim_stale(frontier, &mut self.store);

        if !saved_current {
            self.save_snapshot(emulator, self.current_frame)?;
        }

        // inputs at or before the oldest snapshot can never be replayed again
        let oldest = self.ring.oldest_frame();
        if oldest.is_valid() {
            let discard_to = std::cmp::min(frontier, oldest);
            if discard_to.is_valid() {
                for queue in &mut self.queues {
                    queue.discard_confirmed_frames(discard_to);
                }
            }
        }

        self.metrics.update(|metrics| {
            metrics.predicted_frames =
                (self.current_frame - frontier).clamp(0, self.max_prediction as i32) as u32;
        });

        self.current_frame += 1;
        Ok(())
    }

    /// The earliest frame any queue knows to have been mis-predicted.
    fn first_incorrect_frame(&self) -> Option<Frame> {
        self.queues
            .iter()
            .map(InputQueue::first_incorrect_frame)
            .filter(|frame| !frame.is_null())
            .min()
    }

    /// Rewinds to the newest snapshot strictly before `first_incorrect` and
    /// re-simulates forward with corrected inputs.
    fn rollback<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
        first_incorrect: Frame,
    ) -> FramelockResult<()> {
        let frame_before_rollback = self.current_frame;

        // the snapshot for frame s holds post-execution state, so frame
        // `first_incorrect` is re-executed from a snapshot at or before
        // `first_incorrect - 1`; the pre-session snapshot covers frame 0
        let target = first_incorrect - 1;
        let resume_from = match self.ring.newest_at_or_before(target) {
            Some(snapshot) => snapshot.frame(),
            None if self.initial.is_some() => Frame::NULL,
            None => {
                let error = FramelockError::Desynchronized {
                    frame: first_incorrect,
                };
                self.close(error.clone());
                return Err(error);
            },
        };

        debug!(
            %first_incorrect,
            load_frame = %resume_from,
            resimulate_to = %frame_before_rollback,
            "mis-prediction detected, rolling back"
        );

        // load the snapshot and restore bookkeeping captured with it
        let envelope: &[u8] = if resume_from.is_null() {
            match self.initial.as_ref() {
                Some(snapshot) => snapshot.bytes(),
                None => &[],
            }
        } else {
            match self.ring.newest_at_or_before(target) {
                Some(snapshot) => snapshot.bytes(),
                None => &[],
            }
        };
        let header = match self.store.load(emulator, envelope) {
            Ok(header) => header,
            Err(error) => {
                self.close(error.clone());
                return Err(error);
            },
        };
        self.current_input_seq = header.input_seq;
        self.current_frame = resume_from;

        // repair history: predictions are discarded and rebuilt as the
        // corrected timeline is replayed
        for queue in &mut self.queues {
            queue.reset_prediction();
        }

        while self.current_frame < frame_before_rollback {
            self.current_frame += 1;
            let frame = self.current_frame;

            for player in 0..self.player_count {
                let (record, _status) = self.queues[player].input(frame);
                input::apply(emulator, &record, PlayerHandle::new(player));
            }
            if !emulator.advance_one_frame() {
                let error = FramelockError::EmulatorRejected {
                    operation: "advance_one_frame",
                };
                self.close(error.clone());
                return Err(error);
            }
            self.save_snapshot(emulator, frame)?;
        }

        let depth = (frame_before_rollback - resume_from) as u32;
        self.metrics.update(|metrics| metrics.record_rollback(depth));
        self.rollback_just_occurred = true;
        info!(depth, frame = %frame_before_rollback, "rollback complete");
        Ok(())
    }

    /// Snapshots the post-execution state of `frame` into the ring. Pool
    /// exhaustion is transient and only skips this save; other errors close
    /// the session.
    fn save_snapshot<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
        frame: Frame,
    ) -> FramelockResult<()> {
        self.ring.evict_frame(frame, &mut self.store);
        match self.store.save(emulator, frame, self.current_input_seq) {
            Ok(snapshot) => {
                self.last_saved_input_seq = self.current_input_seq;
                self.ring.insert(snapshot, &mut self.store);
                Ok(())
            },
            Err(FramelockError::PoolExhausted) => {
                trace!(%frame, "snapshot pool exhausted, skipping save");
                Ok(())
            },
            Err(error) => {
                self.close(error.clone());
                Err(error)
            },
        }
    }

    /// Closes the engine; all further operations fail with `reason`.
    pub fn close(&mut self, reason: FramelockError) {
        if self.phase != SessionPhase::Closed {
            self.phase = SessionPhase::Closed;
            self.close_reason = Some(reason);
        }
    }

    /// Releases every snapshot and drains the pool. Idempotent.
    pub fn release_resources(&mut self) {
        self.ring.clear(&mut self.store);
        if let Some(initial) = self.initial.take() {
            self.store.release(initial);
        }
        self.store.flush_pool();
    }

    fn closed_error(&self) -> FramelockError {
        self.close_reason
            .clone()
            .unwrap_or(FramelockError::Disconnected {
                player: self.local_player,
            })
    }
}

// #########
// # TESTS #
// #########
