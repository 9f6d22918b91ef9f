//! The circuit engine: owns the circuit table, pumps inbound datagrams into the
//!  dispatcher, and drives the timer side (retransmits, pings, ack flushes) of
//!  every circuit.
//!
//! Circuits never hold a reference back to the engine; inbound and timer tasks
//!  carry the circuit's opaque id and re-enter through the engine's surface.

use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::sync::RwLock;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::circuit::circuit::{parse_datagram, Circuit, CircuitFate, CircuitState, DisconnectReason};
use crate::circuit::config::EngineConfig;
use crate::circuit::socket::SendSocket;
use crate::circuit::CircuitStats;
use crate::dispatch::{CircuitId, Dispatcher, PacketEvent};
use crate::error::{GridError, Result};
use crate::messages::{
    AgentUpdate, CloseCircuit, CompleteAgentMovement, CompleteAgentMovementAgentData,
    CompletePingCheck, CompletePingCheckPingId, LogoutRequest, LogoutRequestAgentData, Message,
    PacketAck, RegionHandshakeReply, RegionHandshakeReplyAgentData,
    RegionHandshakeReplyRegionInfo, UseCircuitCode, UseCircuitCodeCircuitCode,
};
use crate::messages::{AgentThrottle, AgentThrottleAgentData, AgentThrottleThrottle};

/// Engine-level lifecycle notifications, separate from per-packet dispatch.
#[derive(Debug, Clone)]
pub enum EngineEvent {
    SimConnected {
        circuit: CircuitId,
    },
    SimDisconnected {
        circuit: CircuitId,
        reason: DisconnectReason,
    },
    /// the default circuit is gone; the session is over
    Disconnected {
        reason: DisconnectReason,
    },
}

#[derive(Copy, Clone, Eq, PartialEq, Debug)]
pub struct EventHandle(u64);

type EventListener = Arc<dyn Fn(&EngineEvent) + Send + Sync>;

pub struct CircuitEngine {
    config: Arc<EngineConfig>,
    dispatcher: Arc<Dispatcher>,
    agent_id: Uuid,
    session_id: Uuid,
    circuits: RwLock<FxHashMap<CircuitId, Arc<Circuit>>>,
    default_circuit: std::sync::Mutex<Option<CircuitId>>,
    next_circuit_id: AtomicU64,
    next_listener_id: AtomicU64,
    event_listeners: std::sync::RwLock<Vec<(EventHandle, EventListener)>>,
}

impl CircuitEngine {
    pub fn new(
        agent_id: Uuid,
        session_id: Uuid,
        config: EngineConfig,
        dispatcher: Arc<Dispatcher>,
    ) -> anyhow::Result<Arc<CircuitEngine>> {
        config.validate()?;
        Ok(Arc::new(CircuitEngine {
            config: Arc::new(config),
            dispatcher,
            agent_id,
            session_id,
            circuits: RwLock::new(FxHashMap::default()),
            default_circuit: std::sync::Mutex::new(None),
            next_circuit_id: AtomicU64::new(0),
            next_listener_id: AtomicU64::new(0),
            event_listeners: std::sync::RwLock::new(Vec::new()),
        }))
    }

    pub fn agent_id(&self) -> Uuid {
        self.agent_id
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn default_circuit(&self) -> Option<CircuitId> {
        *self.default_circuit.lock().expect("default circuit lock poisoned")
    }

    /// Open a circuit to a simulator: bind a socket, start the receive and
    ///  maintenance tasks, and begin the handshake with a reliable
    ///  `UseCircuitCode`. The circuit reports `SimConnected` once the simulator's
    ///  `RegionHandshake` has been answered.
    pub async fn connect(
        self: &Arc<Self>,
        endpoint: SocketAddr,
        circuit_code: u32,
        seed_caps: Option<String>,
        set_default: bool,
    ) -> Result<CircuitId> {
        let bind_addr: SocketAddr = if endpoint.is_ipv4() {
            (Ipv4Addr::UNSPECIFIED, 0).into()
        } else {
            (Ipv6Addr::UNSPECIFIED, 0).into()
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!("circuit to {:?} bound on {:?}", endpoint, SendSocket::local_addr(&socket));

        let id = self
            .attach_circuit(
                endpoint,
                circuit_code,
                seed_caps,
                set_default,
                Arc::new(socket.clone()) as Arc<dyn SendSocket>,
            )
            .await;
        self.spawn_circuit_tasks(id, socket).await;
        self.start_handshake(id).await?;
        Ok(id)
    }

    /// Insert a circuit over an arbitrary send socket without starting any tasks
    ///  or traffic. The caller drives `handle_datagram` and `poll` - this is the
    ///  seam tests and custom transports use.
    pub(crate) async fn attach_circuit(
        &self,
        endpoint: SocketAddr,
        circuit_code: u32,
        seed_caps: Option<String>,
        set_default: bool,
        socket: Arc<dyn SendSocket>,
    ) -> CircuitId {
        let id = CircuitId(self.next_circuit_id.fetch_add(1, Ordering::Relaxed) + 1);
        let circuit = Arc::new(Circuit::new(
            id,
            endpoint,
            circuit_code,
            seed_caps,
            socket,
            self.config.clone(),
        ));

        self.circuits.write().await.insert(id, circuit);
        if set_default {
            *self.default_circuit.lock().expect("default circuit lock poisoned") = Some(id);
        }
        id
    }

    async fn spawn_circuit_tasks(self: &Arc<Self>, id: CircuitId, socket: Arc<UdpSocket>) {
        let Some(circuit) = self.circuit(id).await else {
            return;
        };

        let recv_engine = self.clone();
        let endpoint = circuit.endpoint;
        let poll_interval = self.config.poll_interval;
        let recv_socket = socket;
        circuit.adopt_task(tokio::spawn(async move {
            let mut buf = vec![0u8; 65536];
            loop {
                // the timeout bounds how long a read may block, nothing more
                match timeout(poll_interval, recv_socket.recv_from(&mut buf)).await {
                    Err(_) => continue,
                    Ok(Err(e)) => {
                        error!("socket error on circuit {:?}: {}", id, e);
                        continue;
                    }
                    Ok(Ok((len, from))) => {
                        if from != endpoint {
                            debug!("dropping datagram from stray peer {:?}", from);
                            continue;
                        }
                        recv_engine.handle_datagram(id, &buf[..len]).await;
                    }
                }
            }
        }));

        let tick_engine = self.clone();
        circuit.adopt_task(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                tick_engine.poll(id).await;
            }
        }));
    }

    /// first packets on a fresh circuit: `UseCircuitCode`, then the throttle vector
    pub(crate) async fn start_handshake(&self, id: CircuitId) -> Result<()> {
        let circuit = self.circuit(id).await.ok_or(GridError::NotConnected)?;

        let use_circuit = UseCircuitCode {
            circuit_code: UseCircuitCodeCircuitCode {
                code: circuit.circuit_code,
                session_id: self.session_id,
                id: self.agent_id,
            },
        };
        circuit
            .send_message(&Message::UseCircuitCode(use_circuit), true)
            .await?;

        if self.config.send_agent_throttle {
            self.send_throttle(&circuit).await?;
        }
        Ok(())
    }

    async fn send_throttle(&self, circuit: &Arc<Circuit>) -> Result<()> {
        let (rates, gen_counter) = circuit.throttle().await;
        let message = AgentThrottle {
            agent_data: AgentThrottleAgentData {
                agent_id: self.agent_id,
                session_id: self.session_id,
                circuit_code: circuit.circuit_code,
            },
            throttle: AgentThrottleThrottle {
                gen_counter,
                throttles: rates.to_bytes().to_vec(),
            },
        };
        circuit
            .send_message(&Message::AgentThrottle(message), true)
            .await?;
        Ok(())
    }

    pub async fn circuit_state(&self, id: CircuitId) -> Option<CircuitState> {
        match self.circuit(id).await {
            Some(circuit) => Some(circuit.state().await),
            None => None,
        }
    }

    pub async fn circuit_stats(&self, id: CircuitId) -> Option<CircuitStats> {
        match self.circuit(id).await {
            Some(circuit) => Some(circuit.stats().await),
            None => None,
        }
    }

    /// seed capability URL for the circuit, for the capability HTTP collaborator
    pub async fn seed_caps(&self, id: CircuitId) -> Option<String> {
        self.circuit(id)
            .await
            .and_then(|circuit| circuit.seed_caps().map(str::to_string))
    }

    /// Send a typed message on a connected circuit. With `reliable` the engine
    ///  retains the packet until the simulator acknowledges it.
    pub async fn send(&self, id: CircuitId, message: &Message, reliable: bool) -> Result<()> {
        let circuit = self.circuit(id).await.ok_or(GridError::NotConnected)?;
        if circuit.state().await != CircuitState::Connected {
            return Err(GridError::NotConnected);
        }
        circuit.send_message(message, reliable).await?;
        Ok(())
    }

    /// Ship pre-framed bytes on a connected circuit, bypassing serialization,
    ///  sequencing and reliability entirely.
    pub async fn send_raw(&self, id: CircuitId, datagram: &[u8]) -> Result<()> {
        let circuit = self.circuit(id).await.ok_or(GridError::NotConnected)?;
        if circuit.state().await != CircuitState::Connected {
            return Err(GridError::NotConnected);
        }
        circuit.send_raw(datagram).await;
        Ok(())
    }

    /// The inbound pump for one datagram. Parse errors are logged and the
    ///  datagram dropped; the circuit itself survives. Callbacks run on the
    ///  calling task, after every circuit lock has been released.
    pub async fn handle_datagram(self: &Arc<Self>, id: CircuitId, bytes: &[u8]) {
        let Some(circuit) = self.circuit(id).await else {
            debug!("datagram for unknown circuit {:?}", id);
            return;
        };

        let inbound = match parse_datagram(bytes) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("dropping malformed datagram from {:?}: {}", circuit.endpoint, e);
                return;
            }
        };

        let fresh = circuit.note_inbound(&inbound, bytes.len()).await;
        if !fresh {
            return;
        }

        let message = match Message::read(inbound.packet_type, &inbound.payload) {
            Ok(message) => message,
            Err(e) => {
                warn!(
                    "dropping undecodable {:?} from {:?}: {}",
                    inbound.packet_type, circuit.endpoint, e
                );
                return;
            }
        };

        self.handle_internally(&circuit, &message).await;

        self.dispatcher.dispatch(&PacketEvent {
            circuit: id,
            sequence: inbound.header.sequence,
            message,
        });
    }

    /// protocol machinery the engine answers on its own, before dispatch
    async fn handle_internally(self: &Arc<Self>, circuit: &Arc<Circuit>, message: &Message) {
        match message {
            Message::StartPingCheck(ping) => {
                let pong = CompletePingCheck {
                    ping_id: CompletePingCheckPingId {
                        ping_id: ping.ping_id.ping_id,
                    },
                };
                if let Err(e) = circuit
                    .send_message(&Message::CompletePingCheck(pong), false)
                    .await
                {
                    warn!("failed to answer ping on {:?}: {}", circuit.endpoint, e);
                }
            }
            Message::CompletePingCheck(pong) => {
                circuit.note_pong(pong.ping_id.ping_id).await;
            }
            Message::PacketAck(acks) => {
                circuit.note_acks(acks.sequences()).await;
            }
            Message::RegionHandshake(_) => {
                if circuit.state().await != CircuitState::Handshaking {
                    return;
                }
                let reply = RegionHandshakeReply {
                    agent_data: RegionHandshakeReplyAgentData {
                        agent_id: self.agent_id,
                        session_id: self.session_id,
                    },
                    region_info: RegionHandshakeReplyRegionInfo { flags: 0 },
                };
                if let Err(e) = circuit
                    .send_message(&Message::RegionHandshakeReply(reply), true)
                    .await
                {
                    warn!("failed to answer region handshake: {}", e);
                    return;
                }
                circuit.set_state(CircuitState::Connected).await;
                info!("circuit {:?} to {:?} connected", circuit.id, circuit.endpoint);
                self.emit(&EngineEvent::SimConnected { circuit: circuit.id });

                if self.default_circuit() == Some(circuit.id) {
                    let movement = CompleteAgentMovement {
                        agent_data: CompleteAgentMovementAgentData {
                            agent_id: self.agent_id,
                            session_id: self.session_id,
                            circuit_code: circuit.circuit_code,
                        },
                    };
                    if let Err(e) = circuit
                        .send_message(&Message::CompleteAgentMovement(movement), true)
                        .await
                    {
                        warn!("failed to complete agent movement: {}", e);
                    }
                }
            }
            Message::EnableSimulator(enable) => {
                if !self.config.multiple_sims {
                    return;
                }
                let endpoint = SocketAddr::from((
                    Ipv4Addr::from(enable.simulator_info.ip),
                    enable.simulator_info.port,
                ));
                if self.circuit_to(endpoint).await.is_some() {
                    debug!("already holding a circuit to {:?}", endpoint);
                    return;
                }
                info!("simulator announced neighbour {:?}, opening circuit", endpoint);
                if let Err(e) = self.open_neighbor(endpoint, circuit.circuit_code).await {
                    warn!("failed to open neighbour circuit to {:?}: {}", endpoint, e);
                }
            }
            Message::DisableSimulator(_) => {
                self.teardown(circuit.id, DisconnectReason::SimShutdown).await;
            }
            Message::CloseCircuit(_) => {
                self.teardown(circuit.id, DisconnectReason::ServerRequest).await;
            }
            Message::KickUser(kick) => {
                warn!(
                    "kicked by the simulator: {}",
                    String::from_utf8_lossy(&kick.user_info.reason)
                );
                self.shutdown_all(DisconnectReason::ServerRequest).await;
            }
            Message::LogoutReply(_) => {
                circuit.note_logout_reply().await;
            }
            _ => {}
        }
    }

    /// a new circuit in `Handshaking` to an announced neighbour; `UseCircuitCode`
    ///  is not sent until the collaborator connects it properly
    ///
    ///  Returns a boxed future rather than being declared `async fn`: this is called
    ///  (indirectly, via message dispatch) from within the receive task spawned by
    ///  `spawn_circuit_tasks`, and that recursive call graph defeats the compiler's
    ///  auto-trait inference for `Send` unless the boundary is made explicit here.
    fn open_neighbor<'a>(
        self: &'a Arc<Self>,
        endpoint: SocketAddr,
        circuit_code: u32,
    ) -> std::pin::Pin<Box<dyn std::future::Future<Output = Result<CircuitId>> + Send + 'a>> {
        Box::pin(async move {
            let bind_addr: SocketAddr = if endpoint.is_ipv4() {
                (Ipv4Addr::UNSPECIFIED, 0).into()
            } else {
                (Ipv6Addr::UNSPECIFIED, 0).into()
            };
            let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
            let id = self
                .attach_circuit(
                    endpoint,
                    circuit_code,
                    None,
                    false,
                    Arc::new(socket.clone()) as Arc<dyn SendSocket>,
                )
                .await;
            self.spawn_circuit_tasks(id, socket).await;
            Ok(id)
        })
    }

    /// One pass of the timer side of a circuit: retransmits, ping probes,
    ///  explicit ack flushes and the periodic agent update.
    pub async fn poll(self: &Arc<Self>, id: CircuitId) {
        let Some(circuit) = self.circuit(id).await else {
            return;
        };

        let outcome = circuit.tick().await;

        for datagram in &outcome.resends {
            circuit.send_raw(datagram).await;
        }

        if outcome.ping_due {
            let ping = circuit.next_ping().await;
            if let Err(e) = circuit.send_message(&Message::StartPingCheck(ping), false).await {
                warn!("failed to send ping on {:?}: {}", circuit.endpoint, e);
            }
        }

        if !outcome.explicit_acks.is_empty() {
            let ack = PacketAck::for_sequences(outcome.explicit_acks.iter().copied());
            if let Err(e) = circuit.send_message(&Message::PacketAck(ack), false).await {
                warn!("failed to flush acks on {:?}: {}", circuit.endpoint, e);
            }
        }

        if outcome.agent_update_due {
            let mut update = AgentUpdate::default();
            update.agent_data.agent_id = self.agent_id;
            update.agent_data.session_id = self.session_id;
            if let Err(e) = circuit.send_message(&Message::AgentUpdate(update), false).await {
                warn!("failed to send agent update on {:?}: {}", circuit.endpoint, e);
            }
        }

        match outcome.fate {
            None => {}
            Some(CircuitFate::HandshakeTimeout) => {
                warn!("handshake with {:?} timed out", circuit.endpoint);
                self.teardown(id, DisconnectReason::Timeout).await;
            }
            Some(CircuitFate::PingTimeout) => {
                warn!("simulator {:?} stopped answering pings", circuit.endpoint);
                self.teardown(id, DisconnectReason::Timeout).await;
            }
            Some(CircuitFate::RetransmitExhausted { sequence }) => {
                warn!(
                    "retransmits exhausted for seq {} on {:?}: {}",
                    sequence,
                    circuit.endpoint,
                    GridError::Timeout("ack")
                );
                self.teardown(id, DisconnectReason::Timeout).await;
            }
        }
    }

    /// Cooperative shutdown. For a client-requested disconnect the engine sends
    ///  `LogoutRequest` on the default circuit and waits up to `logout_timeout`
    ///  for the `LogoutReply` before forcing the circuit closed.
    pub async fn disconnect(self: &Arc<Self>, reason: DisconnectReason) {
        if reason == DisconnectReason::ClientRequest {
            if let Some(id) = self.default_circuit() {
                if let Some(circuit) = self.circuit(id).await {
                    if circuit.state().await == CircuitState::Connected {
                        circuit.set_state(CircuitState::Draining).await;

                        let logout = LogoutRequest {
                            agent_data: LogoutRequestAgentData {
                                agent_id: self.agent_id,
                                session_id: self.session_id,
                            },
                        };
                        let _ = circuit.send_message(&Message::LogoutRequest(logout), true).await;

                        let notified = circuit.logout_reply.notified();
                        if timeout(self.config.logout_timeout, notified).await.is_err() {
                            debug!("no LogoutReply within {:?}, demanding close", self.config.logout_timeout);
                            let _ = circuit
                                .send_message(&Message::CloseCircuit(CloseCircuit), false)
                                .await;
                        }
                    }
                }
            }
        }

        self.shutdown_all(reason).await;
    }

    async fn shutdown_all(self: &Arc<Self>, reason: DisconnectReason) {
        let ids: Vec<CircuitId> = self.circuits.read().await.keys().copied().collect();
        let default = self.default_circuit();

        for id in ids.iter().filter(|id| Some(**id) != default) {
            self.teardown(*id, reason).await;
        }
        if let Some(id) = default {
            self.teardown(id, reason).await;
        }
    }

    /// Remove one circuit, releasing its queues and tasks. Emits
    ///  `SimDisconnected`, and `Disconnected` when it was the default circuit.
    async fn teardown(self: &Arc<Self>, id: CircuitId, reason: DisconnectReason) {
        let removed = self.circuits.write().await.remove(&id);
        let Some(circuit) = removed else {
            return;
        };

        circuit.release().await;
        info!("circuit {:?} to {:?} released ({:?})", id, circuit.endpoint, reason);
        self.emit(&EngineEvent::SimDisconnected { circuit: id, reason });

        let mut default = self.default_circuit.lock().expect("default circuit lock poisoned");
        if *default == Some(id) {
            *default = None;
            drop(default);
            self.emit(&EngineEvent::Disconnected { reason });
        }
    }

    pub fn on_event(&self, listener: impl Fn(&EngineEvent) + Send + Sync + 'static) -> EventHandle {
        let handle = EventHandle(self.next_listener_id.fetch_add(1, Ordering::Relaxed));
        self.event_listeners
            .write()
            .expect("event listener lock poisoned")
            .push((handle, Arc::new(listener)));
        handle
    }

    pub fn remove_event_listener(&self, handle: EventHandle) -> bool {
        let mut listeners = self
            .event_listeners
            .write()
            .expect("event listener lock poisoned");
        let before = listeners.len();
        listeners.retain(|(h, _)| *h != handle);
        before != listeners.len()
    }

    fn emit(&self, event: &EngineEvent) {
        let listeners: Vec<(EventHandle, EventListener)> = self
            .event_listeners
            .read()
            .expect("event listener lock poisoned")
            .clone();
        for (handle, listener) in listeners.iter() {
            if catch_unwind(AssertUnwindSafe(|| listener(event))).is_err() {
                error!("engine event listener {:?} panicked on {:?}", handle, event);
            }
        }
    }

    async fn circuit(&self, id: CircuitId) -> Option<Arc<Circuit>> {
        self.circuits.read().await.get(&id).cloned()
    }

    async fn circuit_to(&self, endpoint: SocketAddr) -> Option<CircuitId> {
        self.circuits
            .read()
            .await
            .values()
            .find(|c| c.endpoint == endpoint)
            .map(|c| c.id)
    }

    #[cfg(test)]
    pub(crate) async fn circuit_count(&self) -> usize {
        self.circuits.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::circuit::socket::RecordingSocket;
    use crate::messages::{
        ChatFromSimulator, EnableSimulator, EnableSimulatorSimulatorInfo, KickUser, LogoutReply,
        PacketType, RegionHandshake, StartPingCheck, TestMessage,
    };
    use crate::wire::header::FrameHeader;

    use super::*;

    const SIM: &str = "10.1.2.3:13000";

    fn test_engine() -> Arc<CircuitEngine> {
        CircuitEngine::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            EngineConfig::default(),
            Arc::new(Dispatcher::new()),
        )
        .unwrap()
    }

    async fn attach(engine: &Arc<CircuitEngine>, socket: Arc<RecordingSocket>) -> CircuitId {
        engine
            .attach_circuit(SIM.parse().unwrap(), 42, None, true, socket)
            .await
    }

    /// frame a message the way the simulator would
    fn sim_datagram(sequence: u32, reliable: bool, message: &Message) -> Vec<u8> {
        let mut header = FrameHeader::new(sequence);
        header.reliable = reliable;
        let mut bytes = Vec::new();
        header.ser(&mut bytes);
        message.packet_type().write_id(&mut bytes);
        bytes.extend_from_slice(&message.to_bytes().unwrap());
        bytes
    }

    fn sent_messages(socket: &RecordingSocket) -> Vec<(FrameHeader, Message)> {
        socket
            .take()
            .into_iter()
            .map(|(_, bytes)| {
                let inbound = parse_datagram(&bytes).unwrap();
                let message = Message::read(inbound.packet_type, &inbound.payload).unwrap();
                (inbound.header, message)
            })
            .collect()
    }

    async fn connected_circuit(
        engine: &Arc<CircuitEngine>,
        socket: &Arc<RecordingSocket>,
    ) -> CircuitId {
        let id = attach(engine, socket.clone()).await;
        engine.start_handshake(id).await.unwrap();
        engine
            .handle_datagram(id, &sim_datagram(1, true, &Message::RegionHandshake(RegionHandshake::default())))
            .await;
        assert_eq!(engine.circuit_state(id).await, Some(CircuitState::Connected));
        socket.take();
        id
    }

    #[tokio::test]
    async fn test_handshake_reaches_connected() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        engine.on_event(move |event| events_clone.lock().unwrap().push(event.clone()));

        let id = attach(&engine, socket.clone()).await;
        engine.start_handshake(id).await.unwrap();
        assert_eq!(engine.circuit_state(id).await, Some(CircuitState::Handshaking));

        let sent = sent_messages(&socket);
        assert_eq!(sent[0].1.packet_type(), PacketType::UseCircuitCode);
        assert!(sent[0].0.reliable);
        assert_eq!(sent[1].1.packet_type(), PacketType::AgentThrottle);

        engine
            .handle_datagram(id, &sim_datagram(1, true, &Message::RegionHandshake(RegionHandshake::default())))
            .await;

        assert_eq!(engine.circuit_state(id).await, Some(CircuitState::Connected));
        let sent = sent_messages(&socket);
        let types: Vec<PacketType> = sent.iter().map(|(_, m)| m.packet_type()).collect();
        assert_eq!(
            types,
            vec![PacketType::RegionHandshakeReply, PacketType::CompleteAgentMovement]
        );
        // the handshake ack rode along on the reply
        assert!(sent[0].0.appended_acks || sent[1].0.appended_acks);

        let events = events.lock().unwrap();
        assert!(matches!(events.as_slice(), [EngineEvent::SimConnected { .. }]));
    }

    #[tokio::test]
    async fn test_ping_is_answered_immediately() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        let mut ping = StartPingCheck::default();
        ping.ping_id.ping_id = 211;
        engine
            .handle_datagram(id, &sim_datagram(2, false, &Message::StartPingCheck(ping)))
            .await;

        let sent = sent_messages(&socket);
        assert_eq!(sent.len(), 1);
        assert!(!sent[0].0.reliable);
        match &sent[0].1 {
            Message::CompletePingCheck(pong) => assert_eq!(pong.ping_id.ping_id, 211),
            other => panic!("expected a pong, got {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_replayed_packet_dispatches_once_but_acks_twice() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        let dispatched = Arc::new(AtomicUsize::new(0));
        let dispatched_clone = dispatched.clone();
        engine
            .dispatcher()
            .register(PacketType::ChatFromSimulator, move |_| {
                dispatched_clone.fetch_add(1, Ordering::SeqCst);
            });

        let chat = sim_datagram(
            7,
            true,
            &Message::ChatFromSimulator(ChatFromSimulator::default()),
        );
        engine.handle_datagram(id, &chat).await;
        engine.handle_datagram(id, &chat).await;

        assert_eq!(dispatched.load(Ordering::SeqCst), 1);

        tokio::time::advance(Duration::from_millis(600)).await;
        engine.poll(id).await;

        let acks: Vec<Vec<u32>> = sent_messages(&socket)
            .into_iter()
            .filter_map(|(_, m)| match m {
                Message::PacketAck(ack) => Some(ack.sequences().collect()),
                _ => None,
            })
            .collect();
        assert_eq!(acks, vec![vec![7, 7]]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_reliable_send_is_retransmitted_with_resent_flag() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        engine
            .send(id, &Message::TestMessage(TestMessage::default()), true)
            .await
            .unwrap();
        let sent = sent_messages(&socket);
        let original_sequence = sent[0].0.sequence;
        assert!(!sent[0].0.resent);

        tokio::time::advance(Duration::from_millis(4100)).await;
        engine.poll(id).await;

        let resent: Vec<(FrameHeader, Message)> = sent_messages(&socket)
            .into_iter()
            .filter(|(_, m)| m.packet_type() == PacketType::TestMessage)
            .collect();
        assert_eq!(resent.len(), 1);
        assert!(resent[0].0.resent);
        assert!(resent[0].0.reliable);
        assert_eq!(resent[0].0.sequence, original_sequence);
    }

    #[tokio::test]
    async fn test_send_on_handshaking_circuit_is_rejected() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = attach(&engine, socket.clone()).await;

        let result = engine
            .send(id, &Message::TestMessage(TestMessage::default()), true)
            .await;
        assert!(matches!(result, Err(GridError::NotConnected)));

        let unknown = CircuitId(999);
        let result = engine
            .send(unknown, &Message::TestMessage(TestMessage::default()), true)
            .await;
        assert!(matches!(result, Err(GridError::NotConnected)));
    }

    #[tokio::test]
    async fn test_malformed_datagram_does_not_kill_the_circuit() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        engine.handle_datagram(id, &[0xFF, 0x01]).await;
        engine.handle_datagram(id, &[]).await;
        assert_eq!(engine.circuit_state(id).await, Some(CircuitState::Connected));

        // and a healthy datagram still gets through
        let mut ping = StartPingCheck::default();
        ping.ping_id.ping_id = 3;
        engine
            .handle_datagram(id, &sim_datagram(9, false, &Message::StartPingCheck(ping)))
            .await;
        assert_eq!(sent_messages(&socket).len(), 1);
    }

    #[tokio::test]
    async fn test_logout_completes_on_reply() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        engine.on_event(move |event| events_clone.lock().unwrap().push(event.clone()));

        // the reply lands while disconnect is still setting up; the stored permit
        //  must keep this from hanging on the logout timeout
        engine
            .handle_datagram(id, &sim_datagram(8, true, &Message::LogoutReply(LogoutReply::default())))
            .await;
        engine.disconnect(DisconnectReason::ClientRequest).await;

        let types: Vec<PacketType> = sent_messages(&socket)
            .iter()
            .map(|(_, m)| m.packet_type())
            .collect();
        assert!(types.contains(&PacketType::LogoutRequest));
        assert!(!types.contains(&PacketType::CloseCircuit));

        assert_eq!(engine.circuit_count().await, 0);
        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Disconnected { reason: DisconnectReason::ClientRequest })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_logout_times_out_into_forced_close() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;
        let _ = id;

        engine.disconnect(DisconnectReason::ClientRequest).await;

        let types: Vec<PacketType> = sent_messages(&socket)
            .iter()
            .map(|(_, m)| m.packet_type())
            .collect();
        assert!(types.contains(&PacketType::LogoutRequest));
        assert!(types.contains(&PacketType::CloseCircuit));
        assert_eq!(engine.circuit_count().await, 0);
    }

    #[tokio::test]
    async fn test_kick_user_tears_everything_down() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let events_clone = events.clone();
        engine.on_event(move |event| events_clone.lock().unwrap().push(event.clone()));

        engine
            .handle_datagram(id, &sim_datagram(5, true, &Message::KickUser(KickUser::default())))
            .await;

        assert_eq!(engine.circuit_count().await, 0);
        let events = events.lock().unwrap();
        assert!(matches!(
            events.last(),
            Some(EngineEvent::Disconnected { reason: DisconnectReason::ServerRequest })
        ));
    }

    #[tokio::test]
    async fn test_enable_simulator_opens_neighbour_circuit() {
        let engine = test_engine();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        let enable = EnableSimulator {
            simulator_info: EnableSimulatorSimulatorInfo {
                handle: 9,
                ip: [127, 0, 0, 1],
                port: 45813,
            },
        };
        engine
            .handle_datagram(id, &sim_datagram(6, false, &Message::EnableSimulator(enable.clone())))
            .await;
        assert_eq!(engine.circuit_count().await, 2);

        // a second announcement for the same endpoint is a no-op
        engine
            .handle_datagram(id, &sim_datagram(7, false, &Message::EnableSimulator(enable)))
            .await;
        assert_eq!(engine.circuit_count().await, 2);
    }

    #[tokio::test]
    async fn test_enable_simulator_disabled_by_config() {
        let config = EngineConfig {
            multiple_sims: false,
            ..Default::default()
        };
        let engine = CircuitEngine::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            config,
            Arc::new(Dispatcher::new()),
        )
        .unwrap();
        let socket = Arc::new(RecordingSocket::default());
        let id = connected_circuit(&engine, &socket).await;

        let enable = EnableSimulator::default();
        engine
            .handle_datagram(id, &sim_datagram(6, false, &Message::EnableSimulator(enable)))
            .await;
        assert_eq!(engine.circuit_count().await, 1);
    }
}
