use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::config::RakConfig;
use crate::error::ProtocolError;
use crate::protocol::connected::ConnectedMessage;
use crate::protocol::frame::{FragmentHeader, Frame, OrderInfo};
use crate::protocol::frame_set::FrameSet;
use crate::protocol::record::{AckKind, AckPacket};
use crate::protocol::reliability::Reliability;
use crate::protocol::{ids, FRAME_SET_HEADER_SIZE, UDP_HEADER_SIZE};
use crate::session::ack_tracker::{AckTracker, ReliableWindow};
use crate::session::fragments::FragmentAssembler;
use crate::session::ordering::OrderingChannels;
use crate::session::{CloseReason, HandshakeState, LoginPhase, SessionEvent, SessionId};
use crate::util::buf_ext::expect_fully_consumed;
use crate::util::rolling_data::RollingData;
use crate::util::u24::U24;

/// The reliable frames of a frame set that was sent but not acknowledged yet
struct Backup {
    frames: Vec<Frame>,
    sent_at: Instant,
}

/// The protocol state for one peer, created when the offline handshake completes.
///
/// A session does no I/O itself: incoming datagrams are fed in through [Session::on_datagram],
///  time advances through [Session::tick], and the results are collected by the owner through
///  [Session::take_outbox] (datagrams to send to the peer) and [Session::take_events] (things
///  to report to the application).
///
/// Outgoing frames are buffered until the next tick unless they are sent 'immediately'. Frame
///  sets containing reliable frames are kept in a backup map until they are acknowledged. When
///  a frame set is NACK'ed or stays unacknowledged for `resend_timeout`, its reliable frames are
///  sent again - unchanged, i.e. with their original reliable / order / fragment indices - in a
///  new frame set with a fresh sequence number. The receiver's reliable window and ordering
///  logic take care of duplicates.
pub struct Session {
    config: Arc<RakConfig>,
    id: SessionId,
    peer_addr: SocketAddr,
    client_guid: u64,
    mtu: u16,

    /// reference point for the millisecond timestamps in pings and connection messages
    epoch: Instant,
    last_receive: Instant,
    last_ping: Instant,

    phase: LoginPhase,
    closed: Option<CloseReason>,

    ack_tracker: AckTracker,
    reliable_window: ReliableWindow,
    ordering: OrderingChannels,
    fragments: FragmentAssembler,

    next_sequence_number: U24,
    next_reliable_index: U24,
    next_order_index: Vec<U24>,
    next_sequence_index: Vec<U24>,
    next_fragment_id: u16,

    send_queue: Vec<Frame>,
    backup: FxHashMap<U24, Backup>,

    /// round trip times in milliseconds
    latency: RollingData<5>,

    outbox: Vec<Bytes>,
    events: Vec<SessionEvent>,
}

impl Session {
    pub fn new(
        config: Arc<RakConfig>,
        id: SessionId,
        peer_addr: SocketAddr,
        client_guid: u64,
        mtu: u16,
        epoch: Instant,
        now: Instant,
    ) -> Session {
        let num_channels = config.order_channels;
        let fragments = FragmentAssembler::new(config.max_fragment_count, config.max_open_fragment_sets);
        Session {
            config,
            id,
            peer_addr,
            client_guid,
            mtu,
            epoch,
            last_receive: now,
            last_ping: now,
            phase: LoginPhase::AwaitingConnectionRequest,
            closed: None,
            ack_tracker: AckTracker::default(),
            reliable_window: ReliableWindow::default(),
            ordering: OrderingChannels::new(num_channels),
            fragments,
            next_sequence_number: U24::ZERO,
            next_reliable_index: U24::ZERO,
            next_order_index: vec![U24::ZERO; num_channels as usize],
            next_sequence_index: vec![U24::ZERO; num_channels as usize],
            next_fragment_id: 0,
            send_queue: Vec::new(),
            backup: FxHashMap::default(),
            latency: RollingData::new(),
            outbox: Vec::new(),
            events: Vec::new(),
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn client_guid(&self) -> u64 {
        self.client_guid
    }

    pub fn mtu(&self) -> u16 {
        self.mtu
    }

    pub fn phase(&self) -> LoginPhase {
        self.phase
    }

    pub fn handshake_state(&self) -> HandshakeState {
        if self.closed.is_some() {
            HandshakeState::Closed
        }
        else {
            HandshakeState::Connected
        }
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_some()
    }

    pub fn close_reason(&self) -> Option<CloseReason> {
        self.closed
    }

    /// mean round trip time over the most recent pings
    pub fn latency(&self) -> Option<Duration> {
        self.latency.mean()
            .map(|millis| Duration::from_micros((millis * 1000.0) as u64))
    }

    pub fn take_outbox(&mut self) -> Vec<Bytes> {
        std::mem::take(&mut self.outbox)
    }

    pub fn take_events(&mut self) -> Vec<SessionEvent> {
        std::mem::take(&mut self.events)
    }

    fn timestamp(&self, at: Instant) -> u64 {
        at.saturating_duration_since(self.epoch).as_millis() as u64
    }

    /// The biggest frame (header plus payload) that fits into a single datagram
    fn max_frame_size(&self) -> usize {
        self.max_datagram_size() - FRAME_SET_HEADER_SIZE
    }

    fn max_datagram_size(&self) -> usize {
        self.mtu.saturating_sub(UDP_HEADER_SIZE) as usize
    }

    /// Queues a payload for sending, fragmenting it if it does not fit into a single datagram.
    ///
    /// Fragments of an unreliable payload are sent reliably since the message could never be
    ///  reassembled otherwise.
    pub fn send(&mut self, payload: Bytes, reliability: Reliability, channel: u8, immediate: bool, now: Instant) -> anyhow::Result<()> {
        if self.closed.is_some() {
            return Err(ProtocolError::SessionClosed.into());
        }
        if channel >= self.config.order_channels {
            bail!("order channel {} out of range, there are {} channels", channel, self.config.order_channels);
        }
        if payload.is_empty() {
            bail!("empty payloads can not be sent");
        }

        let max_frame_size = self.max_frame_size();
        if Frame::header_len_for(reliability, false) + payload.len() <= max_frame_size {
            let (sequence_index, order) = self.assign_channel_indices(reliability, channel);
            let reliable_index = self.assign_reliable_index(reliability);
            self.send_queue.push(Frame {
                reliability,
                reliable_index,
                sequence_index,
                order,
                fragment: None,
                payload,
            });
        }
        else {
            let reliability = reliability.for_fragments();
            let chunk_size = max_frame_size - Frame::header_len_for(reliability, true);
            let count = payload.len().div_ceil(chunk_size);
            if count > self.config.max_fragment_count as usize {
                return Err(ProtocolError::PayloadTooLarge {
                    len: payload.len(),
                    limit: chunk_size * self.config.max_fragment_count as usize,
                }.into());
            }

            let id = self.next_fragment_id;
            self.next_fragment_id = self.next_fragment_id.wrapping_add(1);
            trace!("splitting {} bytes into {} fragments with id {}", payload.len(), count, id);

            let (sequence_index, order) = self.assign_channel_indices(reliability, channel);
            for index in 0..count {
                let start = index * chunk_size;
                let end = (start + chunk_size).min(payload.len());
                let reliable_index = self.assign_reliable_index(reliability);
                self.send_queue.push(Frame {
                    reliability,
                    reliable_index,
                    sequence_index,
                    order,
                    fragment: Some(FragmentHeader {
                        count: count as u32,
                        id,
                        index: index as u32,
                    }),
                    payload: payload.slice(start..end),
                });
            }
        }

        if immediate {
            self.flush(now);
        }
        Ok(())
    }

    fn assign_reliable_index(&mut self, reliability: Reliability) -> Option<U24> {
        if reliability.is_reliable() {
            Some(self.next_reliable_index.advance())
        }
        else {
            None
        }
    }

    /// Sequenced frames get a new sequence index and share the channel's current order index,
    ///  ordered frames get a new order index
    fn assign_channel_indices(&mut self, reliability: Reliability, channel: u8) -> (Option<U24>, Option<OrderInfo>) {
        let ch = channel as usize;
        if reliability.is_sequenced() {
            let sequence_index = self.next_sequence_index[ch].advance();
            (Some(sequence_index), Some(OrderInfo { index: self.next_order_index[ch], channel }))
        }
        else if reliability.is_ordered() {
            (None, Some(OrderInfo { index: self.next_order_index[ch].advance(), channel }))
        }
        else {
            (None, None)
        }
    }

    /// Sends all buffered frames
    pub fn flush(&mut self, now: Instant) {
        if self.send_queue.is_empty() {
            return;
        }
        let frames = std::mem::take(&mut self.send_queue);
        self.send_frames(frames, now);
    }

    /// Packs frames into as few frame sets as the MTU allows, preserving their order
    fn send_frames(&mut self, frames: Vec<Frame>, now: Instant) {
        let max_datagram_size = self.max_datagram_size();

        let mut current = Vec::new();
        let mut current_size = FRAME_SET_HEADER_SIZE;
        for frame in frames {
            let frame_size = frame.byte_size();
            if !current.is_empty() && current_size + frame_size > max_datagram_size {
                self.send_frame_set(std::mem::take(&mut current), now);
                current_size = FRAME_SET_HEADER_SIZE;
            }
            current_size += frame_size;
            current.push(frame);
        }
        if !current.is_empty() {
            self.send_frame_set(current, now);
        }
    }

    fn send_frame_set(&mut self, frames: Vec<Frame>, now: Instant) {
        let frame_set = FrameSet {
            sequence_number: self.next_sequence_number.advance(),
            frames,
        };

        let mut buf = BytesMut::with_capacity(frame_set.byte_size());
        frame_set.ser(&mut buf);
        trace!("sending frame set #{} with {} frames to {:?}", frame_set.sequence_number, frame_set.frames.len(), self.peer_addr);
        self.outbox.push(buf.freeze());

        let reliable = frame_set.frames.into_iter()
            .filter(|f| f.reliability.is_reliable())
            .collect::<Vec<_>>();
        if !reliable.is_empty() {
            self.backup.insert(frame_set.sequence_number, Backup { frames: reliable, sent_at: now });
        }
    }

    fn send_ack_packet(&mut self, packet: &AckPacket) {
        let mut buf = BytesMut::new();
        packet.ser(&mut buf);
        self.outbox.push(buf.freeze());
    }

    fn send_control(&mut self, msg: ConnectedMessage, reliability: Reliability, now: Instant) {
        trace!("sending {:?} to {:?}", msg, self.peer_addr);
        let mut buf = BytesMut::new();
        msg.ser(&mut buf);
        if let Err(e) = self.send(buf.freeze(), reliability, 0, true, now) {
            debug!("could not send control message to {:?}: {}", self.peer_addr, e);
        }
    }

    /// Handles a datagram from the peer. `now` is the time of arrival - it is the reference for
    ///  latency measurements, so the time it takes to decode the datagram is not counted.
    ///
    /// Errors mean that the datagram was dropped, the session is unaffected.
    pub fn on_datagram(&mut self, datagram: &[u8], now: Instant) -> anyhow::Result<()> {
        if self.closed.is_some() {
            return Err(ProtocolError::SessionClosed.into());
        }
        let Some(&id) = datagram.first() else {
            return Err(ProtocolError::malformed("empty datagram"));
        };

        let mut parse_buf = datagram;
        match id {
            ids::ACK | ids::NACK => {
                let packet = AckPacket::deser(&mut parse_buf)?;
                expect_fully_consumed(&parse_buf, "ACK / NACK")?;
                self.last_receive = now;
                match packet.kind {
                    AckKind::Ack => self.on_ack(&packet),
                    AckKind::Nack => self.on_nack(&packet, now),
                }
            }
            id if ids::is_frame_set(id) => {
                let frame_set = FrameSet::deser(&mut parse_buf)?;
                self.last_receive = now;
                self.on_frame_set(frame_set, now);
            }
            id => {
                return Err(ProtocolError::malformed(format!("unexpected datagram id {:#04x} in a session", id)));
            }
        }
        Ok(())
    }

    fn on_ack(&mut self, packet: &AckPacket) {
        self.backup.retain(|sequence_number, _| !packet.contains(*sequence_number));
    }

    fn on_nack(&mut self, packet: &AckPacket, now: Instant) {
        let mut nacked = self.backup.keys()
            .filter(|sequence_number| packet.contains(**sequence_number))
            .cloned()
            .collect::<Vec<_>>();
        if nacked.is_empty() {
            debug!("NACK from {:?} for frame sets that are not in the backup - ignoring", self.peer_addr);
            return;
        }
        self.sort_oldest_first(&mut nacked);

        debug!("NACK from {:?}: resending frame sets {:?}", self.peer_addr, nacked);
        self.resend(nacked, now);
    }

    fn sort_oldest_first(&self, sequence_numbers: &mut [U24]) {
        let next = self.next_sequence_number;
        sequence_numbers.sort_by_key(|n| n.distance_from(next));
    }

    fn resend(&mut self, sequence_numbers: Vec<U24>, now: Instant) {
        let frames = sequence_numbers.into_iter()
            .filter_map(|n| self.backup.remove(&n))
            .flat_map(|backup| backup.frames)
            .collect::<Vec<_>>();
        self.send_frames(frames, now);
    }

    fn on_frame_set(&mut self, frame_set: FrameSet, now: Instant) {
        if !self.ack_tracker.on_frame_set(frame_set.sequence_number) {
            return;
        }
        trace!("received frame set #{} with {} frames from {:?}", frame_set.sequence_number, frame_set.frames.len(), self.peer_addr);

        for frame in frame_set.frames {
            if self.closed.is_some() {
                break;
            }
            if let Err(e) = self.on_frame(frame, now) {
                warn!("dropping frame from {:?}: {}", self.peer_addr, e);
            }
        }
    }

    fn on_frame(&mut self, frame: Frame, now: Instant) -> anyhow::Result<()> {
        if let Some(reliable_index) = frame.reliable_index {
            if !self.reliable_window.is_new(reliable_index) {
                trace!("duplicate reliable frame #{} - dropping", reliable_index);
                return Ok(());
            }
        }

        // a rejected frame must not consume its reliable index, the peer retransmits it
        if let Some(order) = frame.order {
            self.ordering.check(order, frame.sequence_index.is_some())?;
        }
        self.fragments.check(&frame)?;
        if let Some(reliable_index) = frame.reliable_index {
            self.reliable_window.insert(reliable_index);
        }

        let Some(frame) = self.fragments.add(frame)? else {
            return Ok(());
        };

        match (frame.order, frame.sequence_index) {
            (Some(order), Some(sequence_index)) => {
                if let Some(payload) = self.ordering.on_sequenced(sequence_index, order, frame.payload)? {
                    self.on_payload(payload, now);
                }
            }
            (Some(order), None) => {
                for payload in self.ordering.on_ordered(order, frame.payload)? {
                    self.on_payload(payload, now);
                }
            }
            _ => self.on_payload(frame.payload, now),
        }
        Ok(())
    }

    fn on_payload(&mut self, payload: Bytes, now: Instant) {
        if self.closed.is_some() {
            return;
        }
        let Some(&id) = payload.first() else {
            return;
        };

        if ConnectedMessage::is_control_id(id) {
            match ConnectedMessage::deser(&mut payload.as_ref()) {
                Ok(msg) => self.on_control_message(msg, now),
                Err(e) => debug!("dropping control message from {:?}: {}", self.peer_addr, e),
            }
        }
        else if self.phase == LoginPhase::Established {
            self.events.push(SessionEvent::Message(payload));
        }
        else {
            debug!("dropping application message from {:?} before the login completed", self.peer_addr);
        }
    }

    fn on_control_message(&mut self, msg: ConnectedMessage, now: Instant) {
        trace!("received {:?} from {:?}", msg, self.peer_addr);

        match msg {
            ConnectedMessage::ConnectedPing { time } => {
                let pong = ConnectedMessage::ConnectedPong {
                    ping_time: time,
                    pong_time: self.timestamp(now),
                };
                self.send_control(pong, Reliability::Unreliable, now);
            }
            ConnectedMessage::ConnectedPong { ping_time, .. } => {
                let round_trip = self.timestamp(now).saturating_sub(ping_time);
                self.latency.add_value(round_trip as f64);
            }
            ConnectedMessage::ConnectionRequest { client_guid, time } => {
                if client_guid != self.client_guid {
                    debug!("connection request from {:?} with guid {}, but the handshake used {}", self.peer_addr, client_guid, self.client_guid);
                }
                if self.phase == LoginPhase::Established {
                    debug!("connection request from {:?} after login - ignoring", self.peer_addr);
                    return;
                }
                let accepted = ConnectedMessage::accepted(self.peer_addr, time, self.timestamp(now));
                self.send_control(accepted, Reliability::ReliableOrdered, now);
                self.phase = LoginPhase::AwaitingNewIncomingConnection;
            }
            ConnectedMessage::NewIncomingConnection { .. } => {
                if self.phase != LoginPhase::AwaitingNewIncomingConnection {
                    debug!("unexpected new incoming connection from {:?} in phase {:?} - ignoring", self.peer_addr, self.phase);
                    return;
                }
                info!("session {} with {:?} established", self.id, self.peer_addr);
                self.phase = LoginPhase::Established;
                self.last_ping = now;
                self.events.push(SessionEvent::Opened);
            }
            ConnectedMessage::DisconnectNotification => {
                info!("session {} with {:?}: peer disconnected", self.id, self.peer_addr);
                self.close(CloseReason::PeerDisconnected);
            }
            ConnectedMessage::ConnectionRequestAccepted { .. } => {
                debug!("unexpected connection request accepted from {:?} - ignoring", self.peer_addr);
            }
        }
    }

    /// Periodic housekeeping: timeout check, ACK / NACK, flushing buffered frames, resending
    ///  unacknowledged frame sets and pinging
    pub fn tick(&mut self, now: Instant) {
        if self.closed.is_some() {
            return;
        }

        if now.saturating_duration_since(self.last_receive) >= self.config.session_timeout {
            info!("session {} with {:?} timed out", self.id, self.peer_addr);
            self.close(CloseReason::Timeout);
            return;
        }

        if self.ack_tracker.has_pending() {
            let packets = self.ack_tracker.take_acks().into_iter()
                .chain(self.ack_tracker.take_nacks())
                .collect::<Vec<_>>();
            for packet in &packets {
                self.send_ack_packet(packet);
            }
        }

        self.flush(now);

        let resend_timeout = self.config.resend_timeout;
        let mut expired = self.backup.iter()
            .filter(|(_, backup)| now.saturating_duration_since(backup.sent_at) >= resend_timeout)
            .map(|(sequence_number, _)| *sequence_number)
            .collect::<Vec<_>>();
        if !expired.is_empty() {
            self.sort_oldest_first(&mut expired);
            debug!("resending unacknowledged frame sets {:?} to {:?}", expired, self.peer_addr);
            self.resend(expired, now);
        }

        if self.phase == LoginPhase::Established && now.saturating_duration_since(self.last_ping) >= self.config.ping_interval {
            self.last_ping = now;
            let ping = ConnectedMessage::ConnectedPing { time: self.timestamp(now) };
            self.send_control(ping, Reliability::Unreliable, now);
        }
    }

    /// Notifies the peer and closes the session
    pub fn disconnect(&mut self, reason: CloseReason, now: Instant) {
        if self.closed.is_some() {
            return;
        }
        info!("closing session {} with {:?}: {:?}", self.id, self.peer_addr, reason);
        self.send_control(ConnectedMessage::DisconnectNotification, Reliability::ReliableOrdered, now);
        self.close(reason);
    }

    fn close(&mut self, reason: CloseReason) {
        if self.closed.is_some() {
            return;
        }
        self.closed = Some(reason);
        self.send_queue.clear();
        self.backup.clear();
        self.events.push(SessionEvent::Closed(reason));
    }
}
