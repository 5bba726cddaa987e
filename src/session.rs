//! Session lifecycle and the control surface exposed to the host.
//!
//! [`RollbackSession`] wires everything together: it owns the socket, one
//! [`PeerConnection`] per remote player, and the [`SyncEngine`]. The host
//! holds the session as an explicit handle and threads it (plus the
//! emulator) through every per-frame call; there is no global callback
//! registry.
//!
//! Exactly one session may exist at a time per process - a second
//! construction while one is live fails with
//! [`AlreadyActive`](FramelockError::AlreadyActive).

use std::sync::atomic::{AtomicBool, Ordering};

use crossbeam_channel::unbounded;
use tracing::info;
use web_time::Instant;

use crate::config::{SessionConfig, MAX_PLAYERS};
use crate::emulator::EmulatorHost;
use crate::engine::{EngineSettings, SessionPhase, SyncEngine};
use crate::input::{self, InputRecord};
use crate::metrics::{MetricsCell, RollbackMetrics};
use crate::network::protocol::{PeerConnection, PeerTimings};
use crate::network::udp_socket::{NonBlockingSocket, UdpNonBlockingSocket};
use crate::snapshot::store::StateStore;
use crate::{FramelockError, FramelockResult, PlayerHandle, StatusVec, INPUT_BYTES};

/// Set while a session is live anywhere in this process.
static SESSION_ACTIVE: AtomicBool = AtomicBool::new(false);

/// A live rollback netplay session.
///
/// Constructed with [`initialize`](Self::initialize) (or
/// [`initialize_udp`](Self::initialize_udp)), torn down with
/// [`shutdown`](Self::shutdown) or by dropping.
#[derive(Debug)]
pub struct RollbackSession {
    engine: SyncEngine,
    peers: Vec<PeerConnection>,
    socket: Box<dyn NonBlockingSocket>,
    player_count: usize,
    metrics: MetricsCell,
    initialized: bool,
}

impl RollbackSession {
    /// Starts a session over a caller-provided socket.
    ///
    /// Validates the configuration, requires working RNG introspection from
    /// the emulator, claims the process-wide session slot, captures the
    /// pre-session snapshot and begins the handshake with every remote peer.
    ///
    /// # Errors
    ///
    /// - [`FramelockError::InvalidArgument`] for out-of-range configuration
    ///   or an emulator without RNG introspection.
    /// - [`FramelockError::AlreadyActive`] if another session is live.
    /// - Any state-store error from capturing the pre-session snapshot.
    pub fn initialize<E, S>(
        config: SessionConfig,
        socket: S,
        emulator: &mut E,
    ) -> FramelockResult<Self>
    where
        E: EmulatorHost + ?Sized,
        S: NonBlockingSocket + 'static,
    {
        config.validate()?;

        // a guessed RNG seed silently defeats desync detection, so the
        // session refuses to start without real introspection
        if emulator.rng_state().is_none() {
            return Err(FramelockError::InvalidArgument {
                context: "emulator does not support RNG state introspection".to_string(),
            });
        }

        if SESSION_ACTIVE
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return Err(FramelockError::AlreadyActive);
        }

        match Self::build(config, Box::new(socket), emulator) {
            Ok(session) => Ok(session),
            Err(error) => {
                SESSION_ACTIVE.store(false, Ordering::Release);
                Err(error)
            },
        }
    }

    /// Starts a session on a freshly bound UDP socket at `port`.
    ///
    /// # Errors
    ///
    /// [`FramelockError::NetworkInit`] if binding fails, plus everything
    /// [`initialize`](Self::initialize) can return.
    pub fn initialize_udp<E>(
        config: SessionConfig,
        port: u16,
        emulator: &mut E,
    ) -> FramelockResult<Self>
    where
        E: EmulatorHost + ?Sized,
    {
        let socket =
            UdpNonBlockingSocket::bind_to_port(port).map_err(|error| FramelockError::NetworkInit {
                context: error.to_string(),
            })?;
        Self::initialize(config, socket, emulator)
    }

    fn build<E: EmulatorHost + ?Sized>(
        config: SessionConfig,
        socket: Box<dyn NonBlockingSocket>,
        emulator: &mut E,
    ) -> FramelockResult<Self> {
        let local_player = PlayerHandle::new(config.local_player_index());
        let (event_tx, event_rx) = unbounded();
        let now = Instant::now();

        let timings = PeerTimings {
            disconnect_timeout: config.disconnect_timeout,
            disconnect_notify_start: config.disconnect_notify_start,
            keepalive_interval: config.keepalive_interval,
            quality_report_interval: config.quality_report_interval,
        };

        // remote endpoints are assigned to player numbers in ascending
        // order, skipping the local player; this ordering is fixed for the
        // session lifetime
        let mut peers = Vec::with_capacity(config.player_count - 1);
        let mut addrs = config.remote_addrs.iter();
        for player in 0..config.player_count {
            if player == local_player.as_usize() {
                continue;
            }
            let addr = *addrs.next().expect("validated: one address per remote");
            peers.push(PeerConnection::new(
                addr,
                PlayerHandle::new(player),
                local_player,
                timings,
                event_tx.clone(),
                now,
            ));
        }

        let store = StateStore::new(
            config.snapshot_buffer_size,
            config.snapshot_pool_max,
            config.compression_level,
        );
        let metrics = MetricsCell::new();
        let mut engine = SyncEngine::new(
            EngineSettings {
                local_player,
                player_count: config.player_count,
                frame_delay: config.frame_delay,
                max_prediction: config.max_prediction,
            },
            store,
            event_rx,
            metrics.clone(),
        );

        // the rollback target of last resort: state from before frame 0
        engine.capture_initial_snapshot(emulator)?;

        let mut session = Self {
            engine,
            peers,
            socket,
            player_count: config.player_count,
            metrics,
            initialized: true,
        };
        // open the handshake right away
        for peer in &mut session.peers {
            peer.poll(&mut *session.socket, now, 0);
        }
        info!(
            local_player = %local_player,
            players = session.player_count,
            "rollback session initialized"
        );
        Ok(session)
    }

    /// Whether the session is live (initialized and not shut down).
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized
    }

    /// The current lifecycle phase of the sync engine.
    #[must_use]
    pub fn current_state(&self) -> SessionPhase {
        self.engine.phase()
    }

    /// The zero-based index of the local player.
    #[must_use]
    pub fn local_player_index(&self) -> usize {
        self.engine.local_player().as_usize()
    }

    /// A copy of the current rollback metrics.
    #[must_use]
    pub fn metrics(&self) -> RollbackMetrics {
        self.metrics.snapshot()
    }

    /// Returns `true` exactly once after each rollback. Intended for
    /// host-side effects such as an overlay flash.
    pub fn rollback_just_occurred(&mut self) -> bool {
        self.engine.rollback_just_occurred()
    }

    /// Whether any rollback has occurred since the session (re)connected.
    #[must_use]
    pub fn has_rollbacks(&self) -> bool {
        self.metrics.snapshot().total_rollbacks > 0
    }

    /// Reads the live local controller through the emulator and encodes it
    /// as a wire record.
    pub fn read_local_controller<E: EmulatorHost + ?Sized>(
        &self,
        emulator: &mut E,
    ) -> InputRecord {
        input::read_local(emulator, self.engine.local_player())
    }

    /// Submits the local controller record for the current frame and
    /// transmits it (plus anything still unacknowledged) to every peer.
    ///
    /// Also drains the network first, so that a stalled engine can observe
    /// newly arrived confirmations and resume.
    ///
    /// # Errors
    ///
    /// - [`FramelockError::InvalidArgument`] if `record` is not exactly 32
    ///   bytes, or the session is connecting or shut down.
    /// - [`FramelockError::WouldOverflow`] while the prediction window is
    ///   full; retry next frame.
    pub fn add_local_input(&mut self, record: &[u8]) -> FramelockResult<()> {
        self.ensure_initialized()?;
        let record: InputRecord =
            record
                .try_into()
                .map_err(|_| FramelockError::InvalidArgument {
                    context: format!(
                        "input record must be exactly {} bytes (got {})",
                        INPUT_BYTES,
                        record.len()
                    ),
                })?;

        self.receive_network();
        let outgoing = self.engine.add_local_input(record)?;
        for (frame, record) in outgoing {
            for peer in &mut self.peers {
                peer.queue_input(frame, record);
            }
        }
        Ok(())
    }

    /// Fills `out` with one 32-byte record per player for the current
    /// frame: authoritative bytes for confirmed players, predictions for
    /// unconfirmed remotes.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::synchronize_inputs`].
    pub fn synchronize_inputs(&mut self, out: &mut [u8]) -> FramelockResult<StatusVec> {
        self.ensure_initialized()?;
        self.engine.synchronize_inputs(out)
    }

    /// Synchronizes inputs and writes every player's record straight to the
    /// emulator's virtual controllers.
    ///
    /// # Errors
    ///
    /// See [`SyncEngine::synchronize_inputs`].
    pub fn apply_inputs<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
    ) -> FramelockResult<StatusVec> {
        self.ensure_initialized()?;
        let mut buffer = [0u8; MAX_PLAYERS * INPUT_BYTES];
        let statuses = self
            .engine
            .synchronize_inputs(&mut buffer[..self.player_count * INPUT_BYTES])?;
        for player in 0..self.player_count {
            let mut record: InputRecord = [0; INPUT_BYTES];
            record.copy_from_slice(&buffer[player * INPUT_BYTES..(player + 1) * INPUT_BYTES]);
            input::apply(emulator, &record, PlayerHandle::new(player));
        }
        Ok(statuses)
    }

    /// Signals that the emulator has executed the current frame: drains the
    /// network, rolls back and re-simulates if a prediction was
    /// contradicted, snapshots the frame, transmits pending traffic and
    /// advances the frame counter.
    ///
    /// # Errors
    ///
    /// Fatal engine errors close the session and are returned; see
    /// [`SyncEngine::advance_frame`].
    pub fn advance_frame<E: EmulatorHost + ?Sized>(
        &mut self,
        emulator: &mut E,
    ) -> FramelockResult<()> {
        self.ensure_initialized()?;
        self.receive_network();
        let result = self.engine.advance_frame(emulator);
        self.drive_peers();
        result
    }

    /// Services the network without advancing a frame: receives messages,
    /// applies events, retransmits, and runs the silence clocks.
    ///
    /// Call this while the engine is stalled or the emulator is paused so
    /// that keepalives and disconnect detection keep working.
    pub fn poll(&mut self) {
        if !self.initialized {
            return;
        }
        self.receive_network();
        self.drive_peers();
    }

    /// Tears the session down: says goodbye to every peer, releases all
    /// snapshots, drains the buffer pool and frees the process-wide session
    /// slot. Calling it twice is a no-op after the first.
    pub fn shutdown(&mut self) {
        if !self.initialized {
            return;
        }
        for peer in &mut self.peers {
            peer.send_disconnect(&mut *self.socket);
        }
        self.engine.close(FramelockError::Disconnected {
            player: self.engine.local_player(),
        });
        self.engine.release_resources();
        self.initialized = false;
        SESSION_ACTIVE.store(false, Ordering::Release);
        info!("rollback session shut down");
    }

    fn receive_network(&mut self) {
        let now = Instant::now();
        for (addr, message) in self.socket.receive_all_messages() {
            if let Some(peer) = self.peers.iter_mut().find(|peer| peer.addr() == addr) {
                peer.handle_message(&message, &mut *self.socket, now);
            }
        }
        self.engine.pump_events();
    }

    fn drive_peers(&mut self) {
        let now = Instant::now();
        let advantage = self.engine.local_frame_advantage();
        let mut worst_ping = 0;
        for peer in &mut self.peers {
            peer.poll(&mut *self.socket, now, advantage);
            worst_ping = worst_ping.max(peer.ping_ms());
        }
        self.metrics.update(|metrics| metrics.ping_ms = worst_ping);
    }

    fn ensure_initialized(&self) -> FramelockResult<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(FramelockError::InvalidArgument {
                context: "session is shut down".to_string(),
            })
        }
    }
}

impl Drop for RollbackSession {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// #########
// # TESTS #
// #########
