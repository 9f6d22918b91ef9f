//! Per-circuit connection state: sequence assignment, the unacked set, inbound
//!  duplicate detection, ack bookkeeping, ping liveness and retransmission.
//!
//! A circuit's mutable state lives behind one lock. The engine is the only caller
//!  and takes care to never hold the lock across a dispatch into user callbacks.

use std::collections::{BTreeMap, VecDeque};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;
use tokio::sync::{Notify, RwLock};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use crate::circuit::config::EngineConfig;
use crate::circuit::socket::SendSocket;
use crate::circuit::throttle::ThrottleRates;
use crate::dispatch::CircuitId;
use crate::error::Result;
use crate::messages::{Message, PacketType, StartPingCheck, StartPingCheckPingId};
use crate::wire::header::{append_acks, split_appended_acks, FrameHeader, FLAG_APPENDED_ACKS, FLAG_RESENT};
use crate::wire::zerocode::{is_worth_encoding, zero_decode, zero_encode};
use crate::wire::MTU;

/// bytes kept free below the MTU when splitting message bodies, so a fragment can
///  still carry a handful of piggybacked acks
pub(crate) const APPENDED_ACK_HEADROOM: usize = 1 + 4 * 8;

const MIN_RTO: Duration = Duration::from_millis(100);
const MAX_RTO: Duration = Duration::from_secs(60);

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum CircuitState {
    Disconnected,
    Handshaking,
    Connected,
    Draining,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub enum DisconnectReason {
    /// `disconnect` was called locally
    ClientRequest,
    /// the simulator kicked us or closed the circuit
    ServerRequest,
    /// retransmits or pings ran out
    Timeout,
    /// the current simulator told us to drop a neighbour
    SimShutdown,
}

#[derive(Copy, Clone, Default, Debug)]
pub struct CircuitStats {
    pub packets_sent: u64,
    pub packets_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub packets_resent: u64,
    pub duplicates_received: u64,
}

/// a reliable packet awaiting acknowledgement
struct PendingPacket {
    datagram: Vec<u8>,
    sent_at: Instant,
    attempts: u32,
    packet_type: PacketType,
}

/// Bounded set of recently seen inbound sequence numbers, FIFO eviction.
struct DedupSet {
    seen: FxHashSet<u32>,
    order: VecDeque<u32>,
    capacity: usize,
}

impl DedupSet {
    fn new(capacity: usize) -> DedupSet {
        DedupSet {
            seen: FxHashSet::default(),
            order: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// `false` if the sequence was already present
    fn insert(&mut self, sequence: u32) -> bool {
        if !self.seen.insert(sequence) {
            return false;
        }
        self.order.push_back(sequence);
        while self.order.len() > self.capacity {
            if let Some(oldest) = self.order.pop_front() {
                self.seen.remove(&oldest);
            }
        }
        true
    }

    fn clear(&mut self) {
        self.seen.clear();
        self.order.clear();
    }
}

struct PingTracker {
    next_id: u8,
    awaiting: Option<(u8, Instant)>,
    lag: Option<Duration>,
    missed_windows: u32,
    last_sent: Instant,
}

struct CircuitInner {
    state: CircuitState,
    sequence: u32,
    unacked: BTreeMap<u32, PendingPacket>,
    dedup: DedupSet,
    pending_acks: Vec<u32>,
    last_ack_flush: Instant,
    ping: PingTracker,
    throttle: ThrottleRates,
    throttle_gen: u32,
    handshake_started: Instant,
    last_agent_update: Instant,
    resend_window_start: Instant,
    resend_window_bytes: usize,
    stats: CircuitStats,
}

impl CircuitInner {
    fn next_sequence(&mut self) -> u32 {
        self.sequence += 1;
        self.sequence
    }

    fn oldest_unacked(&self) -> u32 {
        self.unacked.keys().next().copied().unwrap_or(0)
    }

    /// Drain as many pending acks as fit next to a payload of `used_len` bytes
    ///  without pushing the datagram over the MTU.
    fn take_acks_that_fit(&mut self, used_len: usize) -> Vec<u32> {
        let room = MTU.saturating_sub(used_len).saturating_sub(1);
        let count = self.pending_acks.len().min(room / 4).min(u8::MAX as usize);
        if count == 0 {
            return Vec::new();
        }
        self.pending_acks.drain(..count).collect()
    }
}

/// What a maintenance tick decided; the engine turns this into actual sends.
#[derive(Default)]
pub(crate) struct TickOutcome {
    /// raw datagrams to retransmit, resent flag already set
    pub resends: Vec<Vec<u8>>,
    /// a ping probe is due
    pub ping_due: bool,
    /// acks drained for an explicit ack packet
    pub explicit_acks: Vec<u32>,
    /// a periodic AgentUpdate is due
    pub agent_update_due: bool,
    pub fate: Option<CircuitFate>,
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub(crate) enum CircuitFate {
    HandshakeTimeout,
    RetransmitExhausted { sequence: u32 },
    PingTimeout,
}

/// everything the engine needs from one parsed datagram
pub(crate) struct InboundDatagram {
    pub header: FrameHeader,
    pub packet_type: PacketType,
    pub payload: Vec<u8>,
    pub acks: Vec<u32>,
}

/// Split the ack tail, decode the header and message id, and zero-expand the
///  payload region.
pub(crate) fn parse_datagram(bytes: &[u8]) -> Result<InboundDatagram> {
    let has_acks = bytes
        .first()
        .map(|flags| flags & FLAG_APPENDED_ACKS != 0)
        .unwrap_or(false);
    let (without_tail, acks) = if has_acks {
        split_appended_acks(bytes)?
    } else {
        (bytes, Vec::new())
    };

    let mut buf = without_tail;
    let header = FrameHeader::deser(&mut buf)?;
    let packet_type = PacketType::read_id(&mut buf)?;
    let payload = if header.zerocoded {
        zero_decode(buf)?
    } else {
        buf.to_vec()
    };

    Ok(InboundDatagram {
        header,
        packet_type,
        payload,
        acks,
    })
}

pub struct Circuit {
    pub(crate) id: CircuitId,
    pub(crate) endpoint: SocketAddr,
    pub(crate) circuit_code: u32,
    pub(crate) seed_caps: Option<String>,
    socket: Arc<dyn SendSocket>,
    config: Arc<EngineConfig>,
    inner: RwLock<CircuitInner>,
    /// signalled when LogoutReply arrives, releasing a pending `disconnect`
    pub(crate) logout_reply: Notify,
    tasks: std::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl Circuit {
    pub(crate) fn new(
        id: CircuitId,
        endpoint: SocketAddr,
        circuit_code: u32,
        seed_caps: Option<String>,
        socket: Arc<dyn SendSocket>,
        config: Arc<EngineConfig>,
    ) -> Circuit {
        let now = Instant::now();
        Circuit {
            id,
            endpoint,
            circuit_code,
            seed_caps,
            socket,
            config: config.clone(),
            inner: RwLock::new(CircuitInner {
                state: CircuitState::Handshaking,
                sequence: 0,
                unacked: BTreeMap::new(),
                dedup: DedupSet::new(config.dedup_capacity),
                pending_acks: Vec::new(),
                last_ack_flush: now,
                ping: PingTracker {
                    next_id: 0,
                    awaiting: None,
                    lag: None,
                    missed_windows: 0,
                    last_sent: now,
                },
                throttle: ThrottleRates::from_total(config.throttle_total),
                throttle_gen: 0,
                handshake_started: now,
                last_agent_update: now,
                resend_window_start: now,
                resend_window_bytes: 0,
                stats: CircuitStats::default(),
            }),
            logout_reply: Notify::new(),
            tasks: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn adopt_task(&self, task: JoinHandle<()>) {
        self.tasks.lock().expect("task list poisoned").push(task);
    }

    pub async fn state(&self) -> CircuitState {
        self.inner.read().await.state
    }

    /// seed capability URL handed over by the login collaborator, if any
    pub fn seed_caps(&self) -> Option<&str> {
        self.seed_caps.as_deref()
    }

    pub(crate) async fn set_state(&self, state: CircuitState) {
        self.inner.write().await.state = state;
    }

    pub async fn stats(&self) -> CircuitStats {
        self.inner.read().await.stats
    }

    pub async fn ping_lag(&self) -> Option<Duration> {
        self.inner.read().await.ping.lag
    }

    pub(crate) async fn throttle(&self) -> (ThrottleRates, u32) {
        let mut inner = self.inner.write().await;
        inner.throttle_gen += 1;
        (inner.throttle, inner.throttle_gen)
    }

    /// body budget for MTU splitting: MTU minus header, message id and ack headroom
    pub(crate) fn body_budget(&self, packet_type: PacketType) -> usize {
        MTU - 6 - packet_type.frequency().id_bytes() - APPENDED_ACK_HEADROOM
    }

    /// Serialize and send a message, splitting into several datagrams where a
    ///  variable block overflows the MTU. Pending acks are piggybacked onto the
    ///  first fragment only. Returns the sequence numbers used.
    pub(crate) async fn send_message(&self, message: &Message, reliable: bool) -> Result<Vec<u32>> {
        let packet_type = message.packet_type();
        let bodies = message.to_bytes_multiple(self.body_budget(packet_type))?;

        let mut sequences = Vec::with_capacity(bodies.len());
        for (index, body) in bodies.iter().enumerate() {
            let sequence = self
                .send_body(packet_type, body, reliable, index == 0)
                .await;
            sequences.push(sequence);
        }
        Ok(sequences)
    }

    async fn send_body(
        &self,
        packet_type: PacketType,
        body: &[u8],
        reliable: bool,
        piggyback: bool,
    ) -> u32 {
        let (zerocoded, payload) = if packet_type.zerocoded() && is_worth_encoding(body) {
            (true, zero_encode(body))
        } else {
            (false, body.to_vec())
        };

        let datagram;
        let sequence;
        {
            let mut inner = self.inner.write().await;
            sequence = inner.next_sequence();

            let used_len = 6 + packet_type.frequency().id_bytes() + payload.len();
            let acks = if piggyback {
                inner.take_acks_that_fit(used_len)
            } else {
                Vec::new()
            };

            let mut header = FrameHeader::new(sequence);
            header.zerocoded = zerocoded;
            header.reliable = reliable;
            header.appended_acks = !acks.is_empty();

            let mut bytes = Vec::with_capacity(used_len + 1 + 4 * acks.len());
            header.ser(&mut bytes);
            packet_type.write_id(&mut bytes);
            bytes.extend_from_slice(&payload);
            append_acks(&mut bytes, &acks, acks.len());

            inner.stats.packets_sent += 1;
            inner.stats.bytes_sent += bytes.len() as u64;
            if reliable {
                inner.unacked.insert(
                    sequence,
                    PendingPacket {
                        datagram: bytes.clone(),
                        sent_at: Instant::now(),
                        attempts: 0,
                        packet_type,
                    },
                );
            }
            datagram = bytes;
        }

        trace!(
            "sending {:?} seq {} to {:?} ({} bytes)",
            packet_type, sequence, self.endpoint, datagram.len()
        );
        self.socket.send_packet(self.endpoint, &datagram).await;
        sequence
    }

    /// ship pre-built bytes as-is; the caller has done all framing
    pub(crate) async fn send_raw(&self, datagram: &[u8]) {
        {
            let mut inner = self.inner.write().await;
            inner.stats.packets_sent += 1;
            inner.stats.bytes_sent += datagram.len() as u64;
        }
        self.socket.send_packet(self.endpoint, datagram).await;
    }

    /// Inbound bookkeeping for one parsed datagram: consume its acks, queue an ack
    ///  if it was reliable, and run duplicate detection. Returns `false` for a
    ///  duplicate (acked again but not to be dispatched).
    pub(crate) async fn note_inbound(&self, inbound: &InboundDatagram, wire_len: usize) -> bool {
        let mut inner = self.inner.write().await;
        inner.stats.packets_received += 1;
        inner.stats.bytes_received += wire_len as u64;

        for &ack in &inbound.acks {
            inner.unacked.remove(&ack);
        }

        if inbound.header.reliable {
            inner.pending_acks.push(inbound.header.sequence);
        }

        let fresh = inner.dedup.insert(inbound.header.sequence);
        if !fresh {
            inner.stats.duplicates_received += 1;
            debug!(
                "duplicate sequence {} from {:?} - acking but not dispatching",
                inbound.header.sequence, self.endpoint
            );
        }
        fresh
    }

    /// remove explicitly acked sequences (PacketAck body); idempotent
    pub(crate) async fn note_acks(&self, sequences: impl Iterator<Item = u32>) {
        let mut inner = self.inner.write().await;
        for sequence in sequences {
            inner.unacked.remove(&sequence);
        }
    }

    /// build the next ping probe and start its window
    pub(crate) async fn next_ping(&self) -> StartPingCheck {
        let mut inner = self.inner.write().await;
        let ping_id = inner.ping.next_id;
        inner.ping.next_id = inner.ping.next_id.wrapping_add(1);
        let now = Instant::now();
        inner.ping.awaiting = Some((ping_id, now));
        inner.ping.last_sent = now;

        StartPingCheck {
            ping_id: StartPingCheckPingId {
                ping_id,
                oldest_unacked: inner.oldest_unacked(),
            },
        }
    }

    pub(crate) async fn note_pong(&self, ping_id: u8) {
        let mut inner = self.inner.write().await;
        if let Some((awaited, sent_at)) = inner.ping.awaiting {
            if awaited == ping_id {
                inner.ping.lag = Some(sent_at.elapsed());
                inner.ping.awaiting = None;
                inner.ping.missed_windows = 0;
            }
        }
    }

    pub(crate) async fn note_logout_reply(&self) {
        // notify_one leaves a permit behind, closing the race with a reply that
        //  lands before disconnect() starts waiting
        self.logout_reply.notify_one();
    }

    /// One maintenance pass: retransmission timers, ping windows, ack flushing
    ///  and the periodic agent update, evaluated under a single lock.
    pub(crate) async fn tick(&self) -> TickOutcome {
        let mut inner = self.inner.write().await;
        let now = Instant::now();
        let mut outcome = TickOutcome::default();

        if inner.state == CircuitState::Handshaking
            && now.duration_since(inner.handshake_started) > self.config.handshake_timeout
        {
            outcome.fate = Some(CircuitFate::HandshakeTimeout);
            return outcome;
        }

        // retransmission, capped at the advertised resend bandwidth
        if now.duration_since(inner.resend_window_start) >= Duration::from_secs(1) {
            inner.resend_window_start = now;
            inner.resend_window_bytes = 0;
        }
        let resend_budget = inner.throttle.resend as usize;
        let max_attempts = self.config.max_resend_attempts;

        let mut exhausted = None;
        let mut resent_bytes = inner.resend_window_bytes;
        let lag = inner.ping.lag;
        for (&sequence, pending) in inner.unacked.iter_mut() {
            let base = lag.unwrap_or(self.config.resend_timeout);
            let rto = base
                .saturating_mul(1u32 << pending.attempts.min(16))
                .clamp(MIN_RTO, MAX_RTO);
            if now.duration_since(pending.sent_at) < rto {
                continue;
            }

            if pending.attempts >= max_attempts {
                warn!(
                    "reliable {:?} seq {} unacked after {} attempts - giving up on {:?}",
                    pending.packet_type, sequence, pending.attempts, self.endpoint
                );
                exhausted = Some(sequence);
                break;
            }
            if resent_bytes + pending.datagram.len() > resend_budget {
                // over the resend channel for this window, try again next tick
                continue;
            }

            pending.datagram[0] |= FLAG_RESENT;
            pending.attempts += 1;
            pending.sent_at = now;
            resent_bytes += pending.datagram.len();
            outcome.resends.push(pending.datagram.clone());
        }
        inner.resend_window_bytes = resent_bytes;
        inner.stats.packets_resent += outcome.resends.len() as u64;

        if let Some(sequence) = exhausted {
            outcome.fate = Some(CircuitFate::RetransmitExhausted { sequence });
            return outcome;
        }

        // ping liveness: a window ends when the next probe is due
        if inner.state == CircuitState::Connected
            && now.duration_since(inner.ping.last_sent) >= self.config.ping_interval
        {
            if inner.ping.awaiting.is_some() {
                inner.ping.missed_windows += 1;
                match inner.ping.missed_windows {
                    0 | 1 => {}
                    2 => warn!("{:?} missed two ping windows - disconnect candidate", self.endpoint),
                    _ => {
                        outcome.fate = Some(CircuitFate::PingTimeout);
                        return outcome;
                    }
                }
            }
            outcome.ping_due = true;
        }
        if let Some((_, sent_at)) = inner.ping.awaiting {
            if now.duration_since(sent_at) > self.config.simulator_timeout {
                outcome.fate = Some(CircuitFate::PingTimeout);
                return outcome;
            }
        }

        // explicit ack flush: early when the batch threshold is crossed,
        //  periodically otherwise; piggybacking has had its chance by now
        let flush_due = inner.pending_acks.len() > self.config.ack_batch_threshold
            || (!inner.pending_acks.is_empty()
                && now.duration_since(inner.last_ack_flush) >= self.config.ack_flush_interval);
        if flush_due {
            outcome.explicit_acks = std::mem::take(&mut inner.pending_acks);
            inner.last_ack_flush = now;
        }

        if inner.state == CircuitState::Connected
            && self.config.send_agent_updates
            && now.duration_since(inner.last_agent_update) >= self.config.agent_update_interval
        {
            inner.last_agent_update = now;
            outcome.agent_update_due = true;
        }

        outcome
    }

    /// Abandon all pending state and stop the circuit's tasks. The aborts come
    ///  last and nothing awaits after them: release may run on the maintenance
    ///  task itself, which dies at its next yield point once aborted.
    pub(crate) async fn release(&self) {
        {
            let mut inner = self.inner.write().await;
            inner.state = CircuitState::Disconnected;
            inner.unacked.clear();
            inner.pending_acks.clear();
            inner.dedup.clear();
        }

        for task in self.tasks.lock().expect("task list poisoned").drain(..) {
            task.abort();
        }
    }

    #[cfg(test)]
    pub(crate) async fn pending_ack_count(&self) -> usize {
        self.inner.read().await.pending_acks.len()
    }

    #[cfg(test)]
    pub(crate) async fn unacked_sequences(&self) -> Vec<u32> {
        self.inner.read().await.unacked.keys().copied().collect()
    }
}
