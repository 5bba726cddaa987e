//! Per-peer protocol state.
//!
//! One [`PeerConnection`] exists per remote player. It owns everything about
//! that link: the handshake, retransmission of unacknowledged inputs, ping
//! probes, keepalives, and the silence clocks that drive the disconnect
//! warning (1 s) and the disconnect itself (3 s).
//!
//! The connection never touches the sync engine directly. Everything it
//! learns is pushed into a thread-safe FIFO as [`PeerEvent`]s; the engine
//! drains that FIFO from the emulator thread on frame advance. A transport
//! receiving on its own thread can therefore share the same channel safely.

use std::collections::VecDeque;
use std::net::SocketAddr;

use crossbeam_channel::Sender;
use tracing::{debug, info, warn};
use web_time::{Duration, Instant};

use crate::input::InputRecord;
use crate::network::messages::{InputMessage, Message};
use crate::network::udp_socket::NonBlockingSocket;
use crate::{Frame, PlayerHandle};

/// Cap on how many unacknowledged inputs are batched into one datagram.
const MAX_INPUTS_PER_MESSAGE: usize = 32;

/// What a peer connection learned from the network, in the order it was
/// learned. Input events are re-ordered frame-ascending by the engine before
/// they are applied.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerEvent {
    /// The handshake completed; the peer is reachable.
    Connected,
    /// An authoritative input arrived.
    Input {
        /// The frame the input belongs to.
        frame: Frame,
        /// The encoded controller record.
        record: InputRecord,
    },
    /// The peer reported how many frames ahead it believes it is running.
    QualityHint {
        /// Positive values mean the peer runs ahead of us.
        frame_advantage: i16,
    },
    /// The peer has been silent past the warning threshold.
    NetworkInterrupted,
    /// The peer spoke again after an interruption.
    NetworkResumed,
    /// The peer timed out or said goodbye.
    Disconnected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PeerState {
    Handshaking,
    Running,
    Disconnected,
}

/// Timing knobs for one peer link, copied out of the session config.
#[derive(Debug, Clone, Copy)]
pub struct PeerTimings {
    /// Silence duration after which the peer is declared gone.
    pub disconnect_timeout: Duration,
    /// Silence duration after which an interruption warning is raised.
    pub disconnect_notify_start: Duration,
    /// Idle interval between keepalive packets.
    pub keepalive_interval: Duration,
    /// Interval between quality reports.
    pub quality_report_interval: Duration,
}

/// Protocol state for a single remote player.
#[derive(Debug)]
pub struct PeerConnection {
    addr: SocketAddr,
    player: PlayerHandle,
    local_player: PlayerHandle,
    state: PeerState,
    events: Sender<(PlayerHandle, PeerEvent)>,
    timings: PeerTimings,
    clock_origin: Instant,

    /// Local inputs the peer has not acknowledged yet.
    pending_output: VecDeque<(Frame, InputRecord)>,
    /// Highest remote input frame already handed to the engine.
    last_delivered_frame: Frame,

    last_recv: Instant,
    last_send: Instant,
    last_quality_report: Instant,
    hello_sent: bool,
    interrupted: bool,
    ping_ms: u32,
}

impl PeerConnection {
    /// Creates a connection in the handshaking state.
    #[must_use]
    pub fn new(
        addr: SocketAddr,
        player: PlayerHandle,
        local_player: PlayerHandle,
        timings: PeerTimings,
        events: Sender<(PlayerHandle, PeerEvent)>,
        now: Instant,
    ) -> Self {
        Self {
            addr,
            player,
            local_player,
            state: PeerState::Handshaking,
            events,
            timings,
            clock_origin: now,
            pending_output: VecDeque::new(),
            last_delivered_frame: Frame::NULL,
            last_recv: now,
            last_send: now,
            last_quality_report: now,
            hello_sent: false,
            interrupted: false,
            ping_ms: 0,
        }
    }

    /// The remote player this link belongs to.
    #[must_use]
    pub fn player(&self) -> PlayerHandle {
        self.player
    }

    /// The peer's endpoint.
    #[must_use]
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    /// Last measured round-trip time in milliseconds.
    #[must_use]
    pub fn ping_ms(&self) -> u32 {
        self.ping_ms
    }

    /// Whether the handshake has completed and the peer is alive.
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.state == PeerState::Running
    }

    /// Queues a local input for (re)transmission until acknowledged.
    pub fn queue_input(&mut self, frame: Frame, record: InputRecord) {
        self.pending_output.push_back((frame, record));
    }

    /// Processes one incoming message from this peer's address.
    pub fn handle_message<S: NonBlockingSocket + ?Sized>(
        &mut self,
        msg: &Message,
        socket: &mut S,
        now: Instant,
    ) {
        if self.state == PeerState::Disconnected {
            return;
        }
        self.last_recv = now;
        if self.interrupted {
            self.interrupted = false;
            info!(peer = %self.player, "connection resumed");
            self.emit(PeerEvent::NetworkResumed);
        }

        match msg {
            Message::Hello { .. } => {
                // always answer; the peer may have missed an earlier ack
                socket.send_to(
                    &Message::HelloAck {
                        player: self.local_player,
                    },
                    &self.addr,
                );
                self.last_send = now;
                self.complete_handshake();
            },
            Message::HelloAck { .. } => {
                self.complete_handshake();
            },
            Message::Input(input) => {
                self.acknowledge_sent_inputs(input.ack_frame);
                let mut frame = input.start_frame;
                for record in &input.records {
                    if frame > self.last_delivered_frame {
                        self.last_delivered_frame = frame;
                        self.emit(PeerEvent::Input {
                            frame,
                            record: *record,
                        });
                    }
                    frame += 1;
                }
                socket.send_to(
                    &Message::InputAck {
                        ack_frame: self.last_delivered_frame,
                    },
                    &self.addr,
                );
                self.last_send = now;
            },
            Message::InputAck { ack_frame } => {
                self.acknowledge_sent_inputs(*ack_frame);
            },
            Message::QualityReport {
                frame_advantage,
                millis,
            } => {
                self.emit(PeerEvent::QualityHint {
                    frame_advantage: *frame_advantage,
                });
                socket.send_to(&Message::QualityReply { millis: *millis }, &self.addr);
                self.last_send = now;
            },
            Message::QualityReply { millis } => {
                let now_millis = self.millis_since_origin(now);
                self.ping_ms = now_millis.saturating_sub(*millis) as u32;
            },
            Message::KeepAlive => {},
            Message::Disconnect => {
                debug!(peer = %self.player, "peer said goodbye");
                self.disconnect();
            },
        }
    }

    /// Drives retries, keepalives, quality reports and the silence clocks.
    /// Called once per frame (and while stalled).
    pub fn poll<S: NonBlockingSocket + ?Sized>(
        &mut self,
        socket: &mut S,
        now: Instant,
        local_frame_advantage: i16,
    ) {
        match self.state {
            PeerState::Disconnected => return,
            PeerState::Handshaking => {
                // send the hello immediately, then retry until someone answers
                if !self.hello_sent
                    || now.duration_since(self.last_send) >= self.timings.keepalive_interval
                {
                    socket.send_to(
                        &Message::Hello {
                            player: self.local_player,
                        },
                        &self.addr,
                    );
                    self.hello_sent = true;
                    self.last_send = now;
                }
            },
            PeerState::Running => {
                let mut sent_something = false;

                if !self.pending_output.is_empty() {
                    let records: Vec<InputRecord> = self
                        .pending_output
                        .iter()
                        .take(MAX_INPUTS_PER_MESSAGE)
                        .map(|(_, record)| *record)
                        .collect();
                    let start_frame = self.pending_output[0].0;
                    socket.send_to(
                        &Message::Input(InputMessage {
                            player: self.local_player,
                            start_frame,
                            ack_frame: self.last_delivered_frame,
                            records,
                        }),
                        &self.addr,
                    );
                    sent_something = true;
                }

                if now.duration_since(self.last_quality_report)
                    >= self.timings.quality_report_interval
                {
                    socket.send_to(
                        &Message::QualityReport {
                            frame_advantage: local_frame_advantage,
                            millis: self.millis_since_origin(now),
                        },
                        &self.addr,
                    );
                    self.last_quality_report = now;
                    sent_something = true;
                }

                if !sent_something
                    && now.duration_since(self.last_send) >= self.timings.keepalive_interval
                {
                    socket.send_to(&Message::KeepAlive, &self.addr);
                    sent_something = true;
                }

                if sent_something {
                    self.last_send = now;
                }
            },
        }

        self.check_silence(now);
    }

    /// Sends a goodbye and closes the link locally.
    pub fn send_disconnect<S: NonBlockingSocket + ?Sized>(&mut self, socket: &mut S) {
        if self.state != PeerState::Disconnected {
            socket.send_to(&Message::Disconnect, &self.addr);
            self.state = PeerState::Disconnected;
        }
    }

    fn check_silence(&mut self, now: Instant) {
        if self.state != PeerState::Running {
            return;
        }
        let silence = now.duration_since(self.last_recv);
        if silence >= self.timings.disconnect_timeout {
            warn!(peer = %self.player, ?silence, "peer timed out, disconnecting");
            self.disconnect();
        } else if silence >= self.timings.disconnect_notify_start && !self.interrupted {
            warn!(peer = %self.player, ?silence, "connection interrupted");
            self.interrupted = true;
            self.emit(PeerEvent::NetworkInterrupted);
        }
    }

    fn complete_handshake(&mut self) {
        if self.state == PeerState::Handshaking {
            info!(peer = %self.player, addr = %self.addr, "peer connected");
            self.state = PeerState::Running;
            self.emit(PeerEvent::Connected);
        }
    }

    fn disconnect(&mut self) {
        self.state = PeerState::Disconnected;
        self.emit(PeerEvent::Disconnected);
    }

    fn acknowledge_sent_inputs(&mut self, ack_frame: Frame) {
        while let Some(&(frame, _)) = self.pending_output.front() {
            if frame <= ack_frame {
                self.pending_output.pop_front();
            } else {
                break;
            }
        }
    }

    fn millis_since_origin(&self, now: Instant) -> u64 {
        now.duration_since(self.clock_origin).as_millis() as u64
    }

    fn emit(&self, event: PeerEvent) {
        // the engine owns the receiver; if it is gone the session is closing
        let _ = self.events.send((self.player, event));
    }
}

// #########
// # TESTS #
// #########

#[cfg(test)]
mod tests {
    use super::*;
    use crate::input::BLANK_RECORD;
    use crossbeam_channel::unbounded;

    /// Records outgoing messages instead of touching the network.
    #[derive(Debug, Default)]
    struct RecordingSocket {
        sent: Vec<(SocketAddr, Message)>,
    }

    impl NonBlockingSocket for RecordingSocket {
        fn send_to(&mut self, msg: &Message, addr: &SocketAddr) {
            self.sent.push((*addr, msg.clone()));
        }

        fn receive_all_messages(&mut self) -> Vec<(SocketAddr, Message)> {
            Vec::new()
        }
    }

    fn timings() -> PeerTimings {
        PeerTimings {
            disconnect_timeout: Duration::from_secs(3),
            disconnect_notify_start: Duration::from_secs(1),
            keepalive_interval: Duration::from_millis(200),
            quality_report_interval: Duration::from_millis(200),
        }
    }

    fn connection() -> (
        PeerConnection,
        crossbeam_channel::Receiver<(PlayerHandle, PeerEvent)>,
    ) {
        let (tx, rx) = unbounded();
        let connection = PeerConnection::new(
            "127.0.0.1:7001".parse().unwrap(),
            PlayerHandle::new(1),
            PlayerHandle::new(0),
            timings(),
            tx,
            Instant::now(),
        );
        (connection, rx)
    }

    fn drain(rx: &crossbeam_channel::Receiver<(PlayerHandle, PeerEvent)>) -> Vec<PeerEvent> {
        rx.try_iter().map(|(_, event)| event).collect()
    }

    #[test]
    fn test_handshake_via_hello() {
        let (mut connection, rx) = connection();
        let mut socket = RecordingSocket::default();
        let now = Instant::now();

        connection.handle_message(
            &Message::Hello {
                player: PlayerHandle::new(1),
            },
            &mut socket,
            now,
        );

        assert!(connection.is_running());
        assert_eq!(drain(&rx), vec![PeerEvent::Connected]);
        // a hello is always answered
        assert!(matches!(socket.sent[0].1, Message::HelloAck { .. }));
    }

    #[test]
    fn test_input_batch_is_delivered_in_order_and_deduplicated() {
        let (mut connection, rx) = connection();
        let mut socket = RecordingSocket::default();
        let now = Instant::now();
        connection.complete_handshake();
        let _ = drain(&rx);

        let batch = Message::Input(InputMessage {
            player: PlayerHandle::new(1),
            start_frame: Frame::new(0),
            ack_frame: Frame::NULL,
            records: vec![BLANK_RECORD; 3],
        });
        connection.handle_message(&batch, &mut socket, now);
        assert_eq!(drain(&rx).len(), 3);

        // an overlapping retransmit only delivers the new frame
        let batch = Message::Input(InputMessage {
            player: PlayerHandle::new(1),
            start_frame: Frame::new(1),
            ack_frame: Frame::NULL,
            records: vec![BLANK_RECORD; 3],
        });
        connection.handle_message(&batch, &mut socket, now);
        let events = drain(&rx);
        assert_eq!(
            events,
            vec![PeerEvent::Input {
                frame: Frame::new(3),
                record: BLANK_RECORD
            }]
        );

        // each batch is acknowledged at the highest delivered frame
        assert!(socket
            .sent
            .iter()
            .any(|(_, msg)| *msg == Message::InputAck {
                ack_frame: Frame::new(3)
            }));
    }

    #[test]
    fn test_acked_inputs_leave_the_retransmit_queue() {
        let (mut connection, _rx) = connection();
        let mut socket = RecordingSocket::default();
        let now = Instant::now();
        connection.complete_handshake();

        for i in 0..5 {
            connection.queue_input(Frame::new(i), BLANK_RECORD);
        }
        connection.handle_message(
            &Message::InputAck {
                ack_frame: Frame::new(2),
            },
            &mut socket,
            now,
        );
        assert_eq!(connection.pending_output.len(), 2);

        // the next poll only retransmits what is still unacked
        connection.poll(&mut socket, now, 0);
        let input_msg = socket
            .sent
            .iter()
            .find_map(|(_, msg)| match msg {
                Message::Input(input) => Some(input.clone()),
                _ => None,
            })
            .expect("poll should send pending inputs");
        assert_eq!(input_msg.start_frame, Frame::new(3));
        assert_eq!(input_msg.records.len(), 2);
    }

    #[test]
    fn test_quality_report_emits_hint_and_reply() {
        let (mut connection, rx) = connection();
        let mut socket = RecordingSocket::default();
        let now = Instant::now();
        connection.complete_handshake();
        let _ = drain(&rx);

        connection.handle_message(
            &Message::QualityReport {
                frame_advantage: 3,
                millis: 17,
            },
            &mut socket,
            now,
        );
        assert_eq!(
            drain(&rx),
            vec![PeerEvent::QualityHint { frame_advantage: 3 }]
        );
        assert!(socket
            .sent
            .iter()
            .any(|(_, msg)| *msg == Message::QualityReply { millis: 17 }));
    }

    #[test]
    fn test_silence_warns_then_disconnects() {
        let (mut connection, rx) = connection();
        let mut socket = RecordingSocket::default();
        let start = Instant::now();
        connection.complete_handshake();
        let _ = drain(&rx);

        // quiet past the warning threshold
        connection.poll(&mut socket, start + Duration::from_millis(1500), 0);
        assert_eq!(drain(&rx), vec![PeerEvent::NetworkInterrupted]);
        assert!(connection.is_running());

        // quiet past the timeout
        connection.poll(&mut socket, start + Duration::from_millis(3500), 0);
        assert_eq!(drain(&rx), vec![PeerEvent::Disconnected]);
        assert!(!connection.is_running());
    }

    #[test]
    fn test_resume_after_interruption() {
        let (mut connection, rx) = connection();
        let mut socket = RecordingSocket::default();
        let start = Instant::now();
        connection.complete_handshake();
        let _ = drain(&rx);

        connection.poll(&mut socket, start + Duration::from_millis(1500), 0);
        assert_eq!(drain(&rx), vec![PeerEvent::NetworkInterrupted]);

        connection.handle_message(
            &Message::KeepAlive,
            &mut socket,
            start + Duration::from_millis(1600),
        );
        assert_eq!(drain(&rx), vec![PeerEvent::NetworkResumed]);
    }

    #[test]
    fn test_handshake_retries_hello() {
        let (mut connection, _rx) = connection();
        let mut socket = RecordingSocket::default();
        let start = Instant::now();

        connection.poll(&mut socket, start + Duration::from_millis(250), 0);
        connection.poll(&mut socket, start + Duration::from_millis(500), 0);
        let hellos = socket
            .sent
            .iter()
            .filter(|(_, msg)| matches!(msg, Message::Hello { .. }))
            .count();
        assert_eq!(hellos, 2);
    }
}
