//! In-process pump for link tests. Real framing, real pump-side authorization, canned
//! status cargos and a history log served the way a pump streams it.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};

use pump_core::peripheral::PumpResponder;
use pump_core::protocol::{auth as auth_ops, history::HISTORY_LOG_STREAM, response_opcode, status};
use pump_core::{
    decode_message, encode, AuthMessage, Channel, HistoryLogRecord, Message, PacketAssembler,
    PairingCode, PushResult, DEFAULT_CHUNK_SIZE,
};
use tokio::sync::mpsc;
use tokio::time::Instant;

use crate::transport::{Transport, TransportError, TransportEvent};

const RECORDS_PER_PACKET: usize = 9;

#[derive(Clone)]
pub struct FakePump {
    state: Arc<Mutex<FakeState>>,
}

struct FakeState {
    address: String,
    pairing_code: PairingCode,
    reachable: bool,
    responder: Option<PumpResponder>,
    events: Option<mpsc::UnboundedSender<TransportEvent>>,
    assemblers: HashMap<Channel, PacketAssembler>,
    status: HashMap<u8, Vec<u8>>,
    /// Keyed by log index, which is independent of the records' own sequence numbers.
    history: BTreeMap<u32, HistoryLogRecord>,
    next_index: u32,
    prune_below_on_request: Option<u32>,
    history_ack_status: u8,
    stream_before_ack: bool,
    stale_replies: bool,
    connect_failures: VecDeque<TransportError>,
    find_times: Vec<Instant>,
    connects: usize,
    stream_id: u8,
    requests: Vec<u8>,
}

impl FakePump {
    pub fn new(address: &str, pairing_code: &str) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                address: address.to_owned(),
                pairing_code: PairingCode::parse(pairing_code).unwrap(),
                reachable: true,
                responder: None,
                events: None,
                assemblers: HashMap::new(),
                status: HashMap::new(),
                history: BTreeMap::new(),
                next_index: 0,
                prune_below_on_request: None,
                history_ack_status: 0,
                stream_before_ack: false,
                stale_replies: false,
                connect_failures: VecDeque::new(),
                find_times: Vec::new(),
                connects: 0,
                stream_id: 1,
                requests: Vec::new(),
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, FakeState> {
        self.state.lock().unwrap()
    }

    /// Answer request `opcode` with `cargo`. Opcodes without a cargo go unanswered.
    pub fn set_status(&self, opcode: u8, cargo: Vec<u8>) {
        self.lock().status.insert(opcode, cargo);
    }

    pub fn set_pairing_code(&self, code: &str) {
        self.lock().pairing_code = PairingCode::parse(code).unwrap();
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.lock().reachable = reachable;
    }

    pub fn fail_next_connect(&self, error: TransportError) {
        self.lock().connect_failures.push_back(error);
    }

    /// Append to the log at the next free index.
    pub fn add_history(&self, records: impl IntoIterator<Item = HistoryLogRecord>) {
        let mut s = self.lock();
        for r in records {
            let index = s.next_index;
            s.history.insert(index, r);
            s.next_index += 1;
        }
    }

    /// Where the next appended record lands; for a log whose older entries are long gone.
    pub fn set_next_history_index(&self, index: u32) {
        self.lock().next_index = index;
    }

    /// Drop indices below `index` when the next history request arrives, the way a rolling
    /// log prunes between a status read and the stream.
    pub fn prune_history_on_request(&self, index: u32) {
        self.lock().prune_below_on_request = Some(index);
    }

    pub fn set_history_ack_status(&self, status: u8) {
        self.lock().history_ack_status = status;
    }

    pub fn stream_before_ack(&self, on: bool) {
        self.lock().stream_before_ack = on;
    }

    /// Precede every status reply with a reply carrying another txId.
    pub fn send_stale_replies(&self, on: bool) {
        self.lock().stale_replies = on;
    }

    /// The pump walks away: link loss is reported and the link is gone.
    pub fn drop_link(&self) {
        let events = self.lock().events.take();
        if let Some(events) = events {
            let _ = events.send(TransportEvent::Disconnected);
        }
    }

    /// Successful connections so far.
    pub fn connect_count(&self) -> usize {
        self.lock().connects
    }

    pub fn find_times(&self) -> Vec<Instant> {
        self.lock().find_times.clone()
    }

    /// Status-channel request opcodes in arrival order.
    pub fn requests(&self) -> Vec<u8> {
        self.lock().requests.clone()
    }
}

impl FakeState {
    fn connect(
        &mut self,
        address: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> Result<(), TransportError> {
        if let Some(e) = self.connect_failures.pop_front() {
            return Err(e);
        }
        if !self.reachable || self.address != address {
            return Err(TransportError::NotFound(address.to_owned()));
        }
        self.responder = Some(PumpResponder::for_code(self.pairing_code.clone()).unwrap());
        self.events = Some(events);
        self.assemblers.clear();
        self.connects += 1;
        Ok(())
    }

    fn receive(&mut self, channel: Channel, chunk: &[u8]) -> Result<(), TransportError> {
        if self.events.is_none() {
            return Err(TransportError::NotConnected);
        }
        if let Ok(PushResult::Complete(raw)) = self.assemblers.entry(channel).or_default().push(chunk) {
            if let Ok(message) = decode_message(&raw) {
                match channel {
                    Channel::Authorization => self.authorize(message),
                    Channel::CurrentStatus => self.answer_status(message),
                    Channel::HistoryLog => {}
                }
            }
        }
        Ok(())
    }

    fn send(&self, channel: Channel, opcode: u8, tx_id: u8, cargo: &[u8]) {
        let Some(events) = &self.events else { return };
        for data in encode(opcode, tx_id, cargo, DEFAULT_CHUNK_SIZE).unwrap() {
            let _ = events.send(TransportEvent::Notification { channel, data });
        }
    }

    fn authorize(&mut self, message: Message) {
        let Some(responder) = self.responder.as_mut() else { return };
        let tx_id = message.tx_id;
        let request = AuthMessage {
            opcode: message.opcode,
            cargo: message.cargo,
        };
        match responder.respond(&request) {
            Ok(reply) => self.send(Channel::Authorization, reply.opcode, tx_id, &reply.cargo),
            Err(_) if request.opcode == auth_ops::JPAKE_KEY_CONFIRMATION_REQUEST => {
                // Different secret on the pump side: its HMAC cannot verify.
                let mut cargo = request.cargo[..2].to_vec();
                cargo.resize(50, 0);
                self.send(Channel::Authorization, response_opcode(request.opcode), tx_id, &cargo);
            }
            Err(_) => {}
        }
    }

    fn answer_status(&mut self, message: Message) {
        self.requests.push(message.opcode);
        let reply = response_opcode(message.opcode);
        match message.opcode {
            status::HISTORY_LOG_STATUS => {
                let first = self.history.keys().next().copied().unwrap_or(0);
                let last = self.history.keys().next_back().copied().unwrap_or(0);
                let mut cargo = (self.history.len() as u32).to_le_bytes().to_vec();
                cargo.extend_from_slice(&first.to_le_bytes());
                cargo.extend_from_slice(&last.to_le_bytes());
                self.send(Channel::CurrentStatus, reply, message.tx_id, &cargo);
            }
            status::HISTORY_LOG_REQUEST => self.stream_history(message),
            opcode => {
                let Some(cargo) = self.status.get(&opcode).cloned() else { return };
                if self.stale_replies {
                    self.send(Channel::CurrentStatus, reply, message.tx_id.wrapping_add(7), &[0xEE; 4]);
                }
                self.send(Channel::CurrentStatus, reply, message.tx_id, &cargo);
            }
        }
    }

    fn stream_history(&mut self, message: Message) {
        let cargo = &message.cargo;
        if cargo.len() != 5 {
            return;
        }
        let start = u32::from_le_bytes([cargo[0], cargo[1], cargo[2], cargo[3]]);
        let end = start.saturating_add(cargo[4] as u32);
        if let Some(below) = self.prune_below_on_request.take() {
            self.history = self.history.split_off(&below);
        }
        let stream_id = self.stream_id;
        self.stream_id = self.stream_id.wrapping_add(1);
        let ack = [self.history_ack_status, stream_id];
        let reply = response_opcode(message.opcode);
        if self.history_ack_status != 0 {
            self.send(Channel::CurrentStatus, reply, message.tx_id, &ack);
            return;
        }
        let records: Vec<_> = self.history.range(start..end).map(|(_, r)| r.to_bytes()).collect();
        let packets: Vec<Vec<u8>> = records
            .chunks(RECORDS_PER_PACKET)
            .map(|group| {
                let mut p = vec![group.len() as u8, stream_id];
                for r in group {
                    p.extend_from_slice(r);
                }
                p
            })
            .collect();
        if !self.stream_before_ack {
            self.send(Channel::CurrentStatus, reply, message.tx_id, &ack);
        }
        for p in &packets {
            self.send(Channel::HistoryLog, HISTORY_LOG_STREAM, message.tx_id, p);
        }
        if self.stream_before_ack {
            self.send(Channel::CurrentStatus, reply, message.tx_id, &ack);
        }
    }
}

impl Transport for FakePump {
    fn find(&self, address: &str) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = {
            let mut s = self.lock();
            s.find_times.push(Instant::now());
            if s.reachable && s.address == address {
                Ok(())
            } else {
                Err(TransportError::NotFound(address.to_owned()))
            }
        };
        async move { result }
    }

    fn connect(
        &self,
        address: &str,
        events: mpsc::UnboundedSender<TransportEvent>,
    ) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = self.lock().connect(address, events);
        async move { result }
    }

    fn write(&self, channel: Channel, chunk: &[u8]) -> impl Future<Output = Result<(), TransportError>> + Send {
        let result = self.lock().receive(channel, chunk);
        async move { result }
    }

    fn disconnect(&self) -> impl Future<Output = ()> + Send {
        let mut s = self.lock();
        s.events = None;
        s.responder = None;
        async {}
    }
}
