use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::net::UdpSocket;
use tokio::select;
use tokio::sync::mpsc;
use tokio::time::{interval, Instant, MissedTickBehavior};
use tracing::{debug, error, info, span, trace, Instrument, Level};
use uuid::Uuid;

use crate::config::RakConfig;
use crate::protocol::offline::OfflineMessage;
use crate::protocol::reliability::Reliability;
use crate::send_socket::SendSocket;
use crate::session::session::Session;
use crate::session::{CloseReason, HandshakeState, LoginPhase, SessionEvent, SessionId};
use crate::session_listener::SessionListener;

/// Big enough for any UDP datagram
const RECEIVE_BUFFER_SIZE: usize = 64 * 1024;

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SendOptions {
    pub order_channel: u8,
    /// send with the next datagram rather than waiting for the session's next tick
    pub immediate: bool,
}

#[derive(Debug)]
enum Command {
    Send {
        session_id: SessionId,
        payload: Bytes,
        reliability: Reliability,
        options: SendOptions,
    },
    Disconnect {
        session_id: SessionId,
    },
    Shutdown,
}

/// The application's way of talking to a running [RakServer]. Cloning is cheap, and all
///  methods return immediately: commands are queued and processed by the server's event loop
///  in the order they were issued.
///
/// The command queue is unbounded since [SessionListener] callbacks run on the event loop and
///  may themselves send messages.
#[derive(Clone)]
pub struct ServerHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl ServerHandle {
    pub fn send_message(&self, session_id: SessionId, payload: Bytes, reliability: Reliability) -> anyhow::Result<()> {
        self.send_message_with(session_id, payload, reliability, SendOptions::default())
    }

    pub fn send_message_with(&self, session_id: SessionId, payload: Bytes, reliability: Reliability, options: SendOptions) -> anyhow::Result<()> {
        self.enqueue(Command::Send { session_id, payload, reliability, options })
    }

    /// Sends a disconnect notification and closes the session. This triggers
    ///  [SessionListener::on_session_closed] with [CloseReason::LocalDisconnect].
    pub fn disconnect(&self, session_id: SessionId) -> anyhow::Result<()> {
        self.enqueue(Command::Disconnect { session_id })
    }

    /// Disconnects all sessions and terminates the server's event loop
    pub fn shutdown(&self) -> anyhow::Result<()> {
        self.enqueue(Command::Shutdown)
    }

    fn enqueue(&self, command: Command) -> anyhow::Result<()> {
        self.commands.send(command)
            .map_err(|_| anyhow!("server is not running"))
    }
}

/// A RakNet server: listens on a UDP socket, performs the offline handshake and runs a
///  [Session] per connected peer.
///
/// All protocol state is owned by a single event loop ([RakServer::run]) that multiplexes
///  incoming datagrams, the periodic tick and commands from [ServerHandle]s, so there is no
///  locking around sessions.
pub struct RakServer {
    config: Arc<RakConfig>,
    socket: Arc<UdpSocket>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
}

impl RakServer {
    pub async fn bind(config: RakConfig) -> anyhow::Result<RakServer> {
        config.validate()?;

        let socket = Arc::new(UdpSocket::bind(config.bind_addr).await?);
        info!("bound RakNet server socket to {:?} with guid {}", socket.local_addr()?, config.guid);

        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        Ok(RakServer {
            config: Arc::new(config),
            socket,
            commands_tx,
            commands_rx,
        })
    }

    pub fn local_addr(&self) -> anyhow::Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub fn guid(&self) -> u64 {
        self.config.guid
    }

    pub fn handle(&self) -> ServerHandle {
        ServerHandle {
            commands: self.commands_tx.clone(),
        }
    }

    /// The server's event loop. This returns after [ServerHandle::shutdown] was called.
    pub async fn run(self, listener: Arc<dyn SessionListener>) {
        info!("starting RakNet server loop for guid {}", self.guid());

        let RakServer { config, socket, commands_tx, mut commands_rx } = self;
        // handles keep the command channel open, the server itself does not
        drop(commands_tx);

        let mut end_point = EndPoint::new(config.clone(), Arc::new(socket.clone()), listener, Instant::now());

        let mut ticks = interval(config.tick_interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut commands_open = true;
        let mut buf = vec![0u8; RECEIVE_BUFFER_SIZE];
        loop {
            select! {
                received = socket.recv_from(&mut buf) => {
                    let (num_read, from) = match received {
                        Ok(x) => x,
                        Err(e) => {
                            error!("socket error: {}", e);
                            continue;
                        }
                    };
                    let now = Instant::now();

                    let correlation_id = Uuid::new_v4();
                    let span = span!(Level::TRACE, "datagram_received", ?correlation_id, ?from);
                    end_point.on_datagram(from, &buf[..num_read], now)
                        .instrument(span)
                        .await;
                }
                _ = ticks.tick() => {
                    end_point.on_tick(Instant::now()).await;
                }
                command = commands_rx.recv(), if commands_open => {
                    match command {
                        Some(command) => {
                            if !end_point.on_command(command, Instant::now()).await {
                                break;
                            }
                        }
                        None => {
                            debug!("all server handles were dropped");
                            commands_open = false;
                        }
                    }
                }
            }
        }

        info!("RakNet server loop terminated");
    }
}

/// An address that sent OpenConnectionRequest1 and was not yet promoted to a session
struct PendingHandshake {
    started: Instant,
    /// the MTU confirmed in OpenConnectionReply1, an upper bound for the session's MTU
    mtu: u16,
}

/// The state behind the event loop: pending handshakes and sessions, keyed by peer address.
///
/// This is separate from [RakServer] so it can be driven without a real socket.
struct EndPoint {
    config: Arc<RakConfig>,
    send_socket: Arc<dyn SendSocket>,
    listener: Arc<dyn SessionListener>,
    epoch: Instant,

    pending_handshakes: FxHashMap<SocketAddr, PendingHandshake>,
    sessions: FxHashMap<SocketAddr, Session>,
    session_addrs: FxHashMap<SessionId, SocketAddr>,
    next_session_id: u64,
}

impl EndPoint {
    fn new(config: Arc<RakConfig>, send_socket: Arc<dyn SendSocket>, listener: Arc<dyn SessionListener>, epoch: Instant) -> EndPoint {
        EndPoint {
            config,
            send_socket,
            listener,
            epoch,
            pending_handshakes: FxHashMap::default(),
            sessions: FxHashMap::default(),
            session_addrs: FxHashMap::default(),
            next_session_id: 1,
        }
    }

    fn handshake_state(&self, addr: &SocketAddr) -> HandshakeState {
        if let Some(session) = self.sessions.get(addr) {
            session.handshake_state()
        }
        else if self.pending_handshakes.contains_key(addr) {
            HandshakeState::AwaitingOpenRequest2
        }
        else {
            HandshakeState::AwaitingOpenRequest1
        }
    }

    async fn on_datagram(&mut self, from: SocketAddr, datagram: &[u8], now: Instant) {
        trace!("received datagram from {:?} ({:?}): {:?}", from, self.handshake_state(&from), datagram);

        let Some(&id) = datagram.first() else {
            debug!("empty datagram from {:?} - dropping", from);
            return;
        };

        if OfflineMessage::is_offline_id(id) {
            let mut parse_buf = datagram;
            match OfflineMessage::deser(&mut parse_buf) {
                Ok(msg) => self.on_offline_message(from, msg, now).await,
                Err(e) => debug!("dropping offline datagram from {:?}: {}", from, e),
            }
            return;
        }

        let Some(session) = self.sessions.get_mut(&from) else {
            debug!("datagram {:#04x} from {:?}, which has no session - dropping", id, from);
            return;
        };
        if let Err(e) = session.on_datagram(datagram, now) {
            debug!("dropping datagram from {:?}: {}", from, e);
        }
        self.drain_session(from).await;
    }

    async fn on_offline_message(&mut self, from: SocketAddr, msg: OfflineMessage, now: Instant) {
        trace!("received {:?} from {:?}", msg, from);

        match msg {
            OfflineMessage::UnconnectedPing { time, open_connections_only, .. } => {
                if open_connections_only && self.sessions.len() >= self.config.max_sessions {
                    return;
                }
                self.send_offline(from, &OfflineMessage::UnconnectedPong {
                    time,
                    server_guid: self.config.guid,
                    motd: self.config.motd.clone(),
                }).await;
            }
            OfflineMessage::OpenConnectionRequest1 { protocol_version, mtu } => {
                if protocol_version != self.config.protocol_version {
                    debug!("{:?} uses protocol version {}, expected {}", from, protocol_version, self.config.protocol_version);
                    self.send_offline(from, &OfflineMessage::IncompatibleProtocolVersion {
                        protocol_version: self.config.protocol_version,
                        server_guid: self.config.guid,
                    }).await;
                    return;
                }
                if !self.has_capacity_for(&from) {
                    debug!("session limit reached - ignoring handshake from {:?}", from);
                    return;
                }
                if mtu < self.config.min_mtu {
                    debug!("{:?} probed an MTU of {}, which is below the minimum of {} - ignoring", from, mtu, self.config.min_mtu);
                    return;
                }

                let mtu = mtu.min(self.config.max_mtu);
                self.pending_handshakes.insert(from, PendingHandshake { started: now, mtu });
                self.send_offline(from, &OfflineMessage::OpenConnectionReply1 {
                    server_guid: self.config.guid,
                    mtu,
                }).await;
            }
            OfflineMessage::OpenConnectionRequest2 { mtu, client_guid, .. } => {
                if let Some(session) = self.sessions.get(&from) {
                    debug!("repeated OpenConnectionRequest2 from {:?} - resending reply", from);
                    let reply = OfflineMessage::OpenConnectionReply2 {
                        server_guid: self.config.guid,
                        client_addr: from,
                        mtu: session.mtu(),
                    };
                    self.send_offline(from, &reply).await;
                    return;
                }
                let Some(pending) = self.pending_handshakes.remove(&from) else {
                    debug!("OpenConnectionRequest2 from {:?} without a preceding OpenConnectionRequest1 - ignoring", from);
                    return;
                };
                if self.sessions.len() >= self.config.max_sessions {
                    debug!("session limit reached - ignoring handshake from {:?}", from);
                    return;
                }
                if mtu < self.config.min_mtu {
                    debug!("{:?} requested an MTU of {}, which is below the minimum of {} - ignoring", from, mtu, self.config.min_mtu);
                    return;
                }
                let mtu = mtu.min(pending.mtu);

                let session_id = SessionId(self.next_session_id);
                self.next_session_id += 1;
                info!("new session {} for {:?} with guid {} and MTU {}", session_id, from, client_guid, mtu);

                self.sessions.insert(from, Session::new(self.config.clone(), session_id, from, client_guid, mtu, self.epoch, now));
                self.session_addrs.insert(session_id, from);

                self.send_offline(from, &OfflineMessage::OpenConnectionReply2 {
                    server_guid: self.config.guid,
                    client_addr: from,
                    mtu,
                }).await;
            }
            OfflineMessage::UnconnectedPong { .. }
            | OfflineMessage::OpenConnectionReply1 { .. }
            | OfflineMessage::OpenConnectionReply2 { .. }
            | OfflineMessage::IncompatibleProtocolVersion { .. } => {
                debug!("unexpected client-side offline message from {:?} - ignoring", from);
            }
        }
    }

    fn has_capacity_for(&self, addr: &SocketAddr) -> bool {
        if self.sessions.contains_key(addr) || self.pending_handshakes.contains_key(addr) {
            return true;
        }
        self.sessions.len() + self.pending_handshakes.len() < self.config.max_sessions
    }

    async fn send_offline(&self, to: SocketAddr, msg: &OfflineMessage) {
        trace!("sending {:?} to {:?}", msg, to);
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        self.send_socket.send_datagram(to, &buf).await;
    }

    /// Sends a session's pending datagrams, reports its events to the listener, and removes it
    ///  if it is closed
    async fn drain_session(&mut self, addr: SocketAddr) {
        let Some(session) = self.sessions.get_mut(&addr) else {
            return;
        };
        let session_id = session.id();
        let outbox = session.take_outbox();
        let events = session.take_events();
        let was_established = session.phase() == LoginPhase::Established;
        let is_closed = session.is_closed();

        for datagram in outbox {
            self.send_socket.send_datagram(addr, &datagram).await;
        }

        for event in events {
            match event {
                SessionEvent::Opened => {
                    self.listener.on_session_opened(session_id, addr).await;
                }
                SessionEvent::Message(payload) => {
                    self.listener.on_message(session_id, &payload).await;
                }
                SessionEvent::Closed(reason) => {
                    // the application never heard of sessions that did not complete the login
                    if was_established {
                        self.listener.on_session_closed(session_id, reason).await;
                    }
                }
            }
        }

        if is_closed {
            debug!("removing session {} for {:?}", session_id, addr);
            self.sessions.remove(&addr);
            self.session_addrs.remove(&session_id);
        }
    }

    async fn on_tick(&mut self, now: Instant) {
        let handshake_timeout = self.config.session_timeout;
        self.pending_handshakes.retain(|addr, pending| {
            let keep = now.saturating_duration_since(pending.started) < handshake_timeout;
            if !keep {
                debug!("handshake with {:?} timed out", addr);
            }
            keep
        });

        let addrs = self.sessions.keys().cloned().collect::<Vec<_>>();
        for addr in addrs {
            if let Some(session) = self.sessions.get_mut(&addr) {
                session.tick(now);
            }
            self.drain_session(addr).await;
        }
    }

    /// returns `false` if the event loop should terminate
    async fn on_command(&mut self, command: Command, now: Instant) -> bool {
        match command {
            Command::Send { session_id, payload, reliability, options } => {
                let Some(addr) = self.session_addrs.get(&session_id).cloned() else {
                    debug!("sending to session {}, which does not exist (anymore) - dropping", session_id);
                    return true;
                };
                if let Some(session) = self.sessions.get_mut(&addr) {
                    if let Err(e) = session.send(payload, reliability, options.order_channel, options.immediate, now) {
                        debug!("could not send to session {}: {}", session_id, e);
                    }
                }
                self.drain_session(addr).await;
                true
            }
            Command::Disconnect { session_id } => {
                let Some(addr) = self.session_addrs.get(&session_id).cloned() else {
                    debug!("disconnecting session {}, which does not exist (anymore)", session_id);
                    return true;
                };
                if let Some(session) = self.sessions.get_mut(&addr) {
                    session.disconnect(CloseReason::LocalDisconnect, now);
                }
                self.drain_session(addr).await;
                true
            }
            Command::Shutdown => {
                info!("shutting down, disconnecting {} sessions", self.sessions.len());
                self.pending_handshakes.clear();
                let addrs = self.sessions.keys().cloned().collect::<Vec<_>>();
                for addr in addrs {
                    if let Some(session) = self.sessions.get_mut(&addr) {
                        session.disconnect(CloseReason::Shutdown, now);
                    }
                    self.drain_session(addr).await;
                }
                false
            }
        }
    }
}
