//! Connection lifecycle: scan, connect, authenticate, correlate requests with responses,
//! reconnect with backoff, detect bond loss, and fetch history in bounded batches.
//!
//! One `Session` exists per live link and owns everything protocol-stateful about it
//! (inbox, reassembly buffers, stream backlog). It sits behind an async mutex, which is
//! what keeps at most one exchange in flight. A watcher task per link forwards transport
//! notifications into the session inbox and reports link loss.

use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use pump_core::decoder::{decode_history_log_ack, decode_history_log_status, decode_history_stream};
use pump_core::protocol::{history::HISTORY_LOG_STREAM, response_opcode, status};
use pump_core::scheduler::{
    history_fetch_start, plan_history_batches, reconnect_delay, HISTORY_LOOKBACK_INDICES,
    MAX_HISTORY_BATCH,
};
use pump_core::{
    decode_message, encode, Authenticator, BondLossTracker, BondSignal, Channel, ConnectionState,
    DecodeError, HistoryLogRecord, HistoryRange, Message, PacketAssembler, PairingCode, PushResult,
    DEFAULT_CHUNK_SIZE,
};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;

use crate::cursor::CursorStore;
use crate::error::LinkError;
use crate::link_state::StateHolder;
use crate::transport::{Transport, TransportError, TransportEvent};

/// Stream packets buffered while no history request is waiting for them.
const MAX_STREAM_BACKLOG: usize = 64;

const HISTORY_REQUEST_LEN: usize = 5;

#[derive(Debug, Clone)]
pub struct HistoryConfig {
    pub lookback_indices: u32,
    pub batch_size: u8,
    /// Pause between batches.
    pub stagger: Duration,
    /// Most records one fetch call reads.
    pub max_records: u32,
    /// Wall-clock budget of one fetch call.
    pub deadline: Duration,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            lookback_indices: HISTORY_LOOKBACK_INDICES,
            batch_size: MAX_HISTORY_BATCH,
            stagger: Duration::from_millis(250),
            max_records: 200,
            deadline: Duration::from_secs(20),
        }
    }
}

#[derive(Debug, Clone)]
pub struct LinkConfig {
    pub pairing_code: PairingCode,
    pub app_instance_id: u16,
    pub chunk_size: usize,
    pub request_timeout: Duration,
    /// Budget for the whole authentication handshake.
    pub auth_timeout: Duration,
    pub history: HistoryConfig,
    pub bond_threshold: u32,
    /// Links that drop sooner than this count towards bond loss.
    pub rapid_disconnect: Duration,
}

impl LinkConfig {
    pub fn new(pairing_code: PairingCode) -> Self {
        Self {
            pairing_code,
            app_instance_id: 0,
            chunk_size: DEFAULT_CHUNK_SIZE,
            request_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(10),
            history: HistoryConfig::default(),
            bond_threshold: pump_core::integrity::DEFAULT_BOND_LOSS_THRESHOLD,
            rapid_disconnect: Duration::from_secs(15),
        }
    }
}

/// Handle to the link with one paired pump. Cheap to clone; all clones drive the same link.
pub struct ConnectionManager<T: Transport> {
    inner: Arc<Inner<T>>,
}

impl<T: Transport> Clone for ConnectionManager<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T: Transport> ConnectionManager<T> {
    /// A saved history cursor in `cursor_store` is picked up immediately.
    pub fn new(transport: T, config: LinkConfig, cursor_store: Option<CursorStore>) -> Self {
        let cursor = cursor_store.as_ref().and_then(CursorStore::load);
        Self {
            inner: Arc::new(Inner {
                transport,
                bond: Mutex::new(BondLossTracker::new(config.bond_threshold)),
                config,
                state: StateHolder::new(),
                session: Mutex::new(None),
                address: Mutex::new(None),
                tx_id: AtomicU8::new(0),
                link_seq: AtomicU64::new(0),
                cursor: Mutex::new(cursor),
                cursor_store,
            }),
        }
    }

    pub fn config(&self) -> &LinkConfig {
        &self.inner.config
    }

    pub fn transport(&self) -> &T {
        &self.inner.transport
    }

    pub fn observe_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.current()
    }

    /// Index the next history fetch resumes from.
    pub async fn history_cursor(&self) -> Option<u32> {
        *self.inner.cursor.lock().await
    }

    /// Connect and authenticate. Clears bond-loss counters and leaves `AUTH_FAILED`, so this
    /// is also how a re-paired pump is picked up again.
    pub async fn connect(&self, address: &str) -> Result<(), LinkError> {
        self.inner.connect(address).await
    }

    /// Cancel whatever is in flight (requests, attempts, backoff) and drop the link.
    pub async fn disconnect(&self) {
        self.inner.disconnect().await
    }

    /// One status request/response exchange on the current-status channel.
    pub async fn send_status_request(
        &self,
        opcode: u8,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        self.inner.send_status_request(opcode, cargo, timeout).await
    }

    /// Ask for a range of history records; returns the raw stream packets that answered it.
    /// `cargo` is the history-log request cargo, `start(u32) count(u8)`.
    pub async fn request_history_log_stream(
        &self,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, LinkError> {
        self.inner.request_history_log_stream(cargo, timeout).await
    }

    /// Read new history records, resuming from the saved cursor. Bounded by the configured
    /// record count and deadline; the cursor is saved however far the fetch got.
    pub async fn fetch_history(&self) -> Result<Vec<HistoryLogRecord>, LinkError> {
        self.inner.fetch_history().await
    }
}

struct Inner<T: Transport> {
    transport: T,
    config: LinkConfig,
    state: StateHolder,
    session: Mutex<Option<Session>>,
    bond: Mutex<BondLossTracker>,
    address: Mutex<Option<String>>,
    tx_id: AtomicU8,
    link_seq: AtomicU64,
    cursor: Mutex<Option<u32>>,
    cursor_store: Option<CursorStore>,
}

/// Per-link bookkeeping shared between the session and its watcher.
struct LinkShared {
    id: u64,
    connected_at: Instant,
    requests: AtomicU32,
    responses: AtomicU32,
    registration: Mutex<Registration>,
}

#[derive(Default)]
struct Registration {
    registered: bool,
    lost: bool,
}

impl LinkShared {
    fn new(id: u64) -> Self {
        Self {
            id,
            connected_at: Instant::now(),
            requests: AtomicU32::new(0),
            responses: AtomicU32::new(0),
            registration: Mutex::new(Registration::default()),
        }
    }

    /// Mark the link as the manager's live link. False if it already dropped.
    async fn register(&self) -> bool {
        let mut r = self.registration.lock().await;
        if r.lost {
            return false;
        }
        r.registered = true;
        true
    }

    /// Returns whether the loss is the manager's to handle.
    async fn mark_lost(&self) -> bool {
        let mut r = self.registration.lock().await;
        r.lost = true;
        r.registered
    }
}

struct Session {
    epoch: u64,
    inbox: mpsc::UnboundedReceiver<(Channel, Vec<u8>)>,
    assemblers: HashMap<Channel, PacketAssembler>,
    backlog: VecDeque<Message>,
    link: Arc<LinkShared>,
}

impl Session {
    fn new(epoch: u64, inbox: mpsc::UnboundedReceiver<(Channel, Vec<u8>)>, link: Arc<LinkShared>) -> Self {
        Self {
            epoch,
            inbox,
            assemblers: HashMap::new(),
            backlog: VecDeque::new(),
            link,
        }
    }

    /// Next complete message on any channel. Unusable chunks are dropped (the request they
    /// belonged to times out); a CRC failure is surfaced.
    async fn next_message(&mut self) -> Result<(Channel, Message), LinkError> {
        loop {
            let (channel, chunk) = self.inbox.recv().await.ok_or(LinkError::LinkLost)?;
            match self.assemblers.entry(channel).or_default().push(&chunk) {
                Ok(PushResult::InProgress) => {}
                Ok(PushResult::Complete(raw)) => {
                    let message = decode_message(&raw).map_err(|e| {
                        tracing::warn!(?channel, error = %e, "corrupt message");
                        LinkError::from(e)
                    })?;
                    tracing::debug!(
                        ?channel,
                        opcode = message.opcode,
                        tx_id = message.tx_id,
                        len = message.cargo.len(),
                        "message received"
                    );
                    return Ok((channel, message));
                }
                Err(e) => tracing::warn!(?channel, error = %e, "dropping unusable chunk"),
            }
        }
    }

    fn stash_stream(&mut self, message: Message) {
        if self.backlog.len() == MAX_STREAM_BACKLOG {
            self.backlog.pop_front();
        }
        self.backlog.push_back(message);
    }
}

impl<T: Transport> Inner<T> {
    async fn connect(self: &Arc<Self>, address: &str) -> Result<(), LinkError> {
        if self.state.current() == ConnectionState::Connected
            && self.address.lock().await.as_deref() == Some(address)
        {
            return Ok(());
        }
        let epoch = self.state.cancel();
        if self.session.lock().await.take().is_some() {
            self.transport.disconnect().await;
        }
        *self.address.lock().await = Some(address.to_owned());
        self.bond.lock().await.reset();
        tracing::info!(address, "connecting");
        match self.attempt(epoch).await {
            Ok(()) => Ok(()),
            Err(e) => Err(self.attempt_failed(epoch, e, ConnectionState::Disconnected).await),
        }
    }

    async fn disconnect(&self) {
        let epoch = self.state.cancel();
        tracing::info!(epoch, "disconnect requested");
        drop(self.session.lock().await.take());
        self.transport.disconnect().await;
    }

    /// One full connection attempt under `epoch`: scan, connect, authenticate, register.
    async fn attempt(self: &Arc<Self>, epoch: u64) -> Result<(), LinkError> {
        let address = self
            .address
            .lock()
            .await
            .clone()
            .ok_or(LinkError::NotConnected)?;

        self.enter(epoch, ConnectionState::Scanning)?;
        let find = self.transport.find(&address);
        self.guarded(epoch, async { find.await.map_err(LinkError::from) })
            .await?;

        self.enter(epoch, ConnectionState::Connecting)?;
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let connect = self.transport.connect(&address, events_tx);
        self.guarded(epoch, async { connect.await.map_err(LinkError::from) })
            .await?;

        let link = Arc::new(LinkShared::new(
            self.link_seq.fetch_add(1, Ordering::Relaxed) + 1,
        ));
        let (inbox_tx, inbox_rx) = mpsc::unbounded_channel();
        tokio::spawn(self.clone().watch_link(epoch, link.clone(), events_rx, inbox_tx));
        let mut session = Session::new(epoch, inbox_rx, link.clone());

        self.enter(epoch, ConnectionState::Authenticating)?;
        let deadline = Instant::now() + self.config.auth_timeout;
        self.guarded(epoch, async {
            tokio::time::timeout_at(deadline, self.authenticate(&mut session))
                .await
                .map_err(|_| LinkError::Timeout)?
        })
        .await?;
        self.bond.lock().await.clear(BondSignal::EncryptionFailure);

        // Holding the slot keeps the watcher from handling a loss until the state says
        // CONNECTED, so the loss then always lands on a live link.
        let mut slot = self.session.lock().await;
        if !link.register().await {
            return Err(LinkError::LinkLost);
        }
        *slot = Some(session);
        if let Err(e) = self.enter(epoch, ConnectionState::Connected) {
            slot.take();
            return Err(e);
        }
        Ok(())
    }

    async fn authenticate(&self, session: &mut Session) -> Result<(), LinkError> {
        let mut auth = Authenticator::new(self.config.app_instance_id, self.config.pairing_code.clone())?;
        tracing::debug!(mode = ?auth.mode(), "authenticating");
        let mut request = auth.start()?;
        loop {
            let cargo = self
                .exchange(session, Channel::Authorization, request.opcode, &request.cargo)
                .await?;
            match auth.process(response_opcode(request.opcode), &cargo)? {
                Some(next) => request = next,
                None => return Ok(()),
            }
        }
    }

    /// Classify a failed attempt, feed bond-loss counters and settle the state.
    async fn attempt_failed(
        &self,
        epoch: u64,
        error: LinkError,
        fallback: ConnectionState,
    ) -> LinkError {
        self.transport.disconnect().await;
        if self.state.is_cancelled(epoch) {
            return LinkError::Cancelled;
        }
        let signal = match &error {
            LinkError::Auth(e) if e.is_rejection() => {
                tracing::error!(error = %e, "pump refused the pairing; re-pair required");
                self.state.transition(epoch, ConnectionState::AuthFailed);
                return error;
            }
            LinkError::Transport(TransportError::Encryption(_)) | LinkError::Timeout => {
                Some(BondSignal::EncryptionFailure)
            }
            LinkError::LinkLost => Some(BondSignal::RapidDisconnect),
            _ => None,
        };
        tracing::warn!(error = %error, "connection attempt failed");
        if let Some(signal) = signal {
            if self.bond.lock().await.record(signal) {
                tracing::error!(?signal, "bond lost; re-pair required");
                self.state.transition(epoch, ConnectionState::AuthFailed);
                return LinkError::BondLost;
            }
        }
        self.state.transition(epoch, fallback);
        error
    }

    /// Forward notifications into the session inbox until the link drops.
    async fn watch_link(
        self: Arc<Self>,
        epoch: u64,
        link: Arc<LinkShared>,
        mut events: mpsc::UnboundedReceiver<TransportEvent>,
        inbox: mpsc::UnboundedSender<(Channel, Vec<u8>)>,
    ) {
        while let Some(event) = events.recv().await {
            match event {
                TransportEvent::Notification { channel, data } => {
                    if inbox.send((channel, data)).is_err() {
                        // Session torn down on our side.
                        return;
                    }
                }
                TransportEvent::Disconnected => break,
            }
        }
        drop(inbox);
        if link.mark_lost().await {
            self.on_link_lost(epoch, link).await;
        }
    }

    async fn on_link_lost(self: Arc<Self>, epoch: u64, link: Arc<LinkShared>) {
        if self.state.is_cancelled(epoch) {
            return;
        }
        {
            let mut slot = self.session.lock().await;
            if slot.as_ref().is_some_and(|s| s.link.id == link.id) {
                slot.take();
            }
        }
        self.transport.disconnect().await;

        let lifetime = link.connected_at.elapsed();
        let sent = link.requests.load(Ordering::Relaxed);
        let answered = link.responses.load(Ordering::Relaxed);
        let bond_lost = {
            let mut bond = self.bond.lock().await;
            if lifetime < self.config.rapid_disconnect {
                bond.record(BondSignal::RapidDisconnect);
            } else {
                bond.clear(BondSignal::RapidDisconnect);
            }
            if sent > 0 && answered == 0 {
                bond.record(BondSignal::ZeroResponseConnection);
            }
            bond.is_bond_lost()
        };
        if bond_lost {
            tracing::error!(lifetime_ms = lifetime.as_millis() as u64, "bond lost; re-pair required");
            self.state.transition(epoch, ConnectionState::AuthFailed);
            return;
        }
        tracing::warn!(lifetime_ms = lifetime.as_millis() as u64, sent, answered, "link lost");
        if self.state.transition(epoch, ConnectionState::Reconnecting) {
            tokio::spawn(self.reconnect_loop(epoch));
        }
    }

    /// Fast exponential phase, then a fixed slow period, until connected, cancelled or
    /// bond loss stops it.
    fn reconnect_loop(self: Arc<Self>, epoch: u64) -> Pin<Box<dyn Future<Output = ()> + Send>> {
        Box::pin(async move {
            let mut attempt = 0u32;
            loop {
                attempt = attempt.saturating_add(1);
                let delay = reconnect_delay(attempt);
                tracing::info!(attempt, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
                tokio::select! {
                    _ = self.state.cancelled(epoch) => return,
                    _ = tokio::time::sleep(delay) => {}
                }
                match self.attempt(epoch).await {
                    Ok(()) => {
                        tracing::info!(attempt, "reconnected");
                        return;
                    }
                    Err(e) => {
                        let e = self.attempt_failed(epoch, e, ConnectionState::Reconnecting).await;
                        if self.state.is_cancelled(epoch)
                            || self.state.current() != ConnectionState::Reconnecting
                        {
                            tracing::debug!(error = %e, "reconnect loop stopped");
                            return;
                        }
                    }
                }
            }
        })
    }

    fn enter(&self, epoch: u64, next: ConnectionState) -> Result<(), LinkError> {
        self.state.transition(epoch, next);
        if self.state.is_cancelled(epoch) {
            return Err(LinkError::Cancelled);
        }
        Ok(())
    }

    /// Race `fut` against a caller disconnect.
    async fn guarded<R>(
        &self,
        epoch: u64,
        fut: impl Future<Output = Result<R, LinkError>>,
    ) -> Result<R, LinkError> {
        tokio::select! {
            biased;
            _ = self.state.cancelled(epoch) => Err(LinkError::Cancelled),
            r = fut => r,
        }
    }

    /// Write one request on `channel` and wait for the response with the matching opcode and
    /// txId. Anything else is discarded; history stream packets go to the backlog.
    async fn exchange(
        &self,
        session: &mut Session,
        channel: Channel,
        opcode: u8,
        cargo: &[u8],
    ) -> Result<Vec<u8>, LinkError> {
        let tx_id = self.tx_id.fetch_add(1, Ordering::Relaxed);
        let chunks = encode(opcode, tx_id, cargo, self.config.chunk_size)?;
        tracing::debug!(?channel, opcode, tx_id, chunks = chunks.len(), "request");
        for chunk in &chunks {
            self.transport.write(channel, chunk).await?;
        }
        let expected = response_opcode(opcode);
        loop {
            let (from, message) = session.next_message().await?;
            if from == Channel::HistoryLog && message.opcode == HISTORY_LOG_STREAM {
                session.stash_stream(message);
                continue;
            }
            if from != channel || message.opcode != expected || message.tx_id != tx_id {
                tracing::debug!(
                    ?from,
                    opcode = message.opcode,
                    tx_id = message.tx_id,
                    expected_opcode = expected,
                    expected_tx_id = tx_id,
                    "discarding uncorrelated response"
                );
                continue;
            }
            return Ok(message.cargo);
        }
    }

    /// The live session for `epoch`, or `NotConnected`.
    fn live<'a>(slot: &'a mut Option<Session>, epoch: u64) -> Result<&'a mut Session, LinkError> {
        slot.as_mut()
            .filter(|s| s.epoch == epoch)
            .ok_or(LinkError::NotConnected)
    }

    async fn note_response(&self, session: &Session) {
        session.link.responses.fetch_add(1, Ordering::Relaxed);
        self.bond.lock().await.clear(BondSignal::ZeroResponseConnection);
    }

    async fn send_status_request(
        &self,
        opcode: u8,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<Vec<u8>, LinkError> {
        if self.state.current() != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let epoch = self.state.epoch();
        let deadline = Instant::now() + timeout;
        let result = self
            .guarded(epoch, async {
                tokio::time::timeout_at(deadline, async {
                    let mut slot = self.session.lock().await;
                    let session = Self::live(&mut slot, epoch)?;
                    session.link.requests.fetch_add(1, Ordering::Relaxed);
                    let response = self
                        .exchange(session, Channel::CurrentStatus, opcode, cargo)
                        .await?;
                    self.note_response(session).await;
                    Ok::<_, LinkError>(response)
                })
                .await
                .map_err(|_| LinkError::Timeout)?
            })
            .await;
        if let Err(e) = &result {
            tracing::warn!(opcode, error = %e, "status request failed");
        }
        result
    }

    async fn request_history_log_stream(
        &self,
        cargo: &[u8],
        timeout: Duration,
    ) -> Result<Vec<Vec<u8>>, LinkError> {
        if cargo.len() != HISTORY_REQUEST_LEN {
            return Err(DecodeError::Length {
                message: "history log request",
                expected: HISTORY_REQUEST_LEN,
                actual: cargo.len(),
            }
            .into());
        }
        let expected = cargo[HISTORY_REQUEST_LEN - 1] as usize;
        if self.state.current() != ConnectionState::Connected {
            return Err(LinkError::NotConnected);
        }
        let epoch = self.state.epoch();
        let deadline = Instant::now() + timeout;
        self.guarded(epoch, async {
            let mut slot = tokio::time::timeout_at(deadline, self.session.lock())
                .await
                .map_err(|_| LinkError::Timeout)?;
            let session = Self::live(&mut slot, epoch)?;
            session.link.requests.fetch_add(1, Ordering::Relaxed);
            let ack = tokio::time::timeout_at(
                deadline,
                self.exchange(session, Channel::CurrentStatus, status::HISTORY_LOG_REQUEST, cargo),
            )
            .await
            .map_err(|_| LinkError::Timeout)??;
            self.note_response(session).await;
            let ack = decode_history_log_ack(&ack)?;
            if ack.status != 0 {
                return Err(LinkError::Rejected { status: ack.status });
            }

            let mut packets = Vec::new();
            let mut received = 0usize;
            for message in std::mem::take(&mut session.backlog) {
                received += take_stream_packet(message, ack.stream_id, &mut packets);
            }
            while received < expected {
                match tokio::time::timeout_at(deadline, session.next_message()).await {
                    Ok(Ok((Channel::HistoryLog, message))) if message.opcode == HISTORY_LOG_STREAM => {
                        received += take_stream_packet(message, ack.stream_id, &mut packets);
                    }
                    Ok(Ok((channel, message))) => tracing::debug!(
                        ?channel,
                        opcode = message.opcode,
                        "discarding message while streaming history"
                    ),
                    Ok(Err(e)) => return Err(e),
                    Err(_) if packets.is_empty() => return Err(LinkError::Timeout),
                    Err(_) => {
                        tracing::warn!(received, expected, "history stream incomplete at deadline");
                        break;
                    }
                }
            }
            Ok(packets)
        })
        .await
    }

    async fn fetch_history(&self) -> Result<Vec<HistoryLogRecord>, LinkError> {
        let cfg = &self.config.history;
        let deadline = Instant::now() + cfg.deadline;
        let request_timeout = self.config.request_timeout;

        let range = self.history_range(request_timeout).await?;
        let saved = *self.cursor.lock().await;
        let Some(start) = history_fetch_start(range, saved, cfg.lookback_indices) else {
            tracing::debug!(?range, ?saved, "history up to date");
            return Ok(Vec::new());
        };
        let batches = plan_history_batches(start, range.last, cfg.batch_size, cfg.max_records);
        let epoch = self.state.epoch();

        let mut next = start;
        let mut records = Vec::new();
        let mut failure = None;
        for (i, batch) in batches.iter().enumerate() {
            if i > 0 {
                if Instant::now() + cfg.stagger >= deadline {
                    tracing::debug!(next, "history deadline reached");
                    break;
                }
                let stagger = self
                    .guarded(epoch, async {
                        tokio::time::sleep(cfg.stagger).await;
                        Ok(())
                    })
                    .await;
                if let Err(e) = stagger {
                    failure = Some(e);
                    break;
                }
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let packets = match self
                .request_history_log_stream(&batch.cargo(), remaining.min(request_timeout))
                .await
            {
                Ok(p) => p,
                Err(e) => {
                    failure = Some(e);
                    break;
                }
            };
            // Records arrive in log order; their position in the stream is their index.
            let batch_records: Vec<HistoryLogRecord> = packets
                .iter()
                .filter_map(|p| decode_history_stream(p).ok())
                .flat_map(|packet| packet.records)
                .take(batch.count as usize)
                .collect();
            let got = batch_records.len() as u32;
            records.extend(batch_records);
            let mut first_index = batch.start;
            if got < batch.count as u32 {
                // A rolling log may have pruned the head of the batch since the range was read;
                // the pump then streams from its new first index.
                if let Ok(fresh) = self.history_range(request_timeout).await {
                    if fresh.first > batch.start {
                        tracing::debug!(start = batch.start, first = fresh.first, "history pruned under fetch");
                        first_index = fresh.first.min(batch.end());
                    }
                }
            }
            next = first_index.saturating_add(got).min(batch.end());
            if next < batch.end() {
                tracing::warn!(start = batch.start, got, wanted = batch.count, "partial history batch");
                break;
            }
        }

        self.save_cursor(next).await;
        tracing::info!(start, next, fetched = records.len(), "history fetch");
        match failure {
            Some(e) if records.is_empty() => Err(e),
            Some(e) => {
                tracing::warn!(error = %e, "history fetch stopped early");
                Ok(records)
            }
            None => Ok(records),
        }
    }

    async fn history_range(&self, timeout: Duration) -> Result<HistoryRange, LinkError> {
        let raw = self.send_status_request(status::HISTORY_LOG_STATUS, &[], timeout).await?;
        Ok(decode_history_log_status(&raw)?)
    }

    async fn save_cursor(&self, next: u32) {
        *self.cursor.lock().await = Some(next);
        if let Some(store) = &self.cursor_store {
            store.save(next);
        }
    }
}

/// Keep a stream packet if it belongs to `stream_id`. Returns how many records it carried.
fn take_stream_packet(message: Message, stream_id: u8, packets: &mut Vec<Vec<u8>>) -> usize {
    match decode_history_stream(&message.cargo) {
        Ok(packet) if packet.stream_id == stream_id => {
            let n = packet.records.len();
            packets.push(message.cargo);
            n
        }
        Ok(packet) => {
            tracing::debug!(stream_id = packet.stream_id, expected = stream_id, "stale history stream packet");
            0
        }
        Err(e) => {
            tracing::warn!(error = %e, "malformed history stream packet");
            0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fake::FakePump;
    use pump_core::history::event_id;

    const ADDRESS: &str = "C4:7F:51:00:11:22";
    const JPAKE_CODE: &str = "123456";
    const LEGACY_CODE: &str = "ABCDEFGHIJKLMNOP";

    fn manager(pump: &FakePump, code: &str) -> ConnectionManager<FakePump> {
        let mut config = LinkConfig::new(PairingCode::parse(code).unwrap());
        config.history.stagger = Duration::from_millis(100);
        ConnectionManager::new(pump.clone(), config, None)
    }

    fn record(sequence: u32) -> HistoryLogRecord {
        HistoryLogRecord {
            event_type_id: event_id::CGM_READING,
            pump_time: 500_000_000 + sequence,
            sequence,
            data: [0; 16],
        }
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(10)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_jpake_code() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.set_status(status::CURRENT_BATTERY_V1, vec![1, 80]);
        let m = manager(&pump, JPAKE_CODE);
        let mut states = m.observe_connection_state();
        m.connect(ADDRESS).await.unwrap();
        assert_eq!(m.state(), ConnectionState::Connected);
        assert!(states.has_changed().unwrap());
        assert_eq!(*states.borrow_and_update(), ConnectionState::Connected);
        let cargo = m
            .send_status_request(status::CURRENT_BATTERY_V1, &[], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cargo, vec![1, 80]);
    }

    #[tokio::test(start_paused = true)]
    async fn connects_with_legacy_code() {
        let pump = FakePump::new(ADDRESS, LEGACY_CODE);
        let m = manager(&pump, LEGACY_CODE);
        m.connect(ADDRESS).await.unwrap();
        assert_eq!(m.state(), ConnectionState::Connected);
        // Connecting again to the same pump is a no-op.
        m.connect(ADDRESS).await.unwrap();
        assert_eq!(pump.connect_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_legacy_code_is_terminal() {
        let pump = FakePump::new(ADDRESS, LEGACY_CODE);
        let m = manager(&pump, "ZZZZZZZZZZZZZZZZ");
        let err = m.connect(ADDRESS).await.unwrap_err();
        assert_eq!(err, LinkError::Auth(pump_core::AuthError::Rejected));
        assert_eq!(m.state(), ConnectionState::AuthFailed);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(pump.connect_count(), 1);
        assert_eq!(m.state(), ConnectionState::AuthFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn wrong_jpake_code_is_terminal() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, "654321");
        let err = m.connect(ADDRESS).await.unwrap_err();
        assert_eq!(err, LinkError::Auth(pump_core::AuthError::ConfirmationMismatch));
        assert_eq!(m.state(), ConnectionState::AuthFailed);
    }

    #[tokio::test(start_paused = true)]
    async fn connect_leaves_auth_failed() {
        let pump = FakePump::new(ADDRESS, LEGACY_CODE);
        let bad = manager(&pump, "ZZZZZZZZZZZZZZZZ");
        bad.connect(ADDRESS).await.unwrap_err();
        assert_eq!(bad.state(), ConnectionState::AuthFailed);
        pump.set_pairing_code("ZZZZZZZZZZZZZZZZ");
        bad.connect(ADDRESS).await.unwrap();
        assert_eq!(bad.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn unknown_pump_is_not_found() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        let err = m.connect("00:00:00:00:00:00").await.unwrap_err();
        assert!(matches!(err, LinkError::Transport(TransportError::NotFound(_))));
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn requests_need_a_connection() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        let err = m
            .send_status_request(status::CURRENT_BATTERY_V1, &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::NotConnected);
        let err = m
            .request_history_log_stream(&[0, 0, 0, 0, 1], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::NotConnected);
    }

    #[tokio::test(start_paused = true)]
    async fn response_with_wrong_tx_id_is_ignored() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.set_status(status::INSULIN_STATUS, vec![120, 0, 0, 10]);
        pump.send_stale_replies(true);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        let cargo = m
            .send_status_request(status::INSULIN_STATUS, &[], Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(cargo, vec![120, 0, 0, 10]);
    }

    #[tokio::test(start_paused = true)]
    async fn unanswered_request_times_out() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        let started = Instant::now();
        let err = m
            .send_status_request(status::PUMP_FEATURES_V1, &[], Duration::from_secs(2))
            .await
            .unwrap_err();
        assert!(err.is_timeout());
        assert!(started.elapsed() >= Duration::from_secs(2));
        assert_eq!(m.state(), ConnectionState::Connected);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_cancels_pending_request() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        let pending = {
            let m = m.clone();
            tokio::spawn(async move {
                m.send_status_request(status::PUMP_FEATURES_V1, &[], Duration::from_secs(60))
                    .await
            })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        let started = Instant::now();
        m.disconnect().await;
        let err = pending.await.unwrap().unwrap_err();
        assert_eq!(err, LinkError::Cancelled);
        assert!(started.elapsed() < Duration::from_secs(1));
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnects_with_backoff() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;

        pump.set_reachable(false);
        pump.drop_link();
        settle().await;
        assert_eq!(m.state(), ConnectionState::Reconnecting);

        // Attempts at +2s, +6s, +14s after the loss.
        tokio::time::sleep(Duration::from_secs(15)).await;
        let finds = pump.find_times();
        assert_eq!(finds.len(), 4);
        let gaps: Vec<Duration> = finds.windows(2).skip(1).map(|w| w[1] - w[0]).collect();
        assert_eq!(gaps.len(), 2);
        assert!(gaps[0] >= Duration::from_secs(4) && gaps[0] < Duration::from_millis(4100));
        assert!(gaps[1] >= Duration::from_secs(8) && gaps[1] < Duration::from_millis(8100));

        pump.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(17)).await;
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(pump.connect_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn disconnect_stops_backoff() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        pump.set_reachable(false);
        pump.drop_link();
        settle().await;
        assert_eq!(m.state(), ConnectionState::Reconnecting);

        m.disconnect().await;
        assert_eq!(m.state(), ConnectionState::Disconnected);
        let finds = pump.find_times().len();
        pump.set_reachable(true);
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(pump.find_times().len(), finds);
        assert_eq!(m.state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn repeated_encryption_failures_mean_bond_loss() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        tokio::time::sleep(Duration::from_secs(60)).await;
        for _ in 0..3 {
            pump.fail_next_connect(TransportError::Encryption("insufficient encryption".into()));
        }
        pump.drop_link();
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(m.state(), ConnectionState::AuthFailed);
        assert_eq!(pump.connect_count(), 1);

        let finds = pump.find_times().len();
        tokio::time::sleep(Duration::from_secs(600)).await;
        assert_eq!(pump.find_times().len(), finds);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_disconnects_mean_bond_loss() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        let mut states = m.observe_connection_state();
        for _ in 0..3 {
            pump.drop_link();
            settle().await;
            states
                .wait_for(|s| *s == ConnectionState::Connected || *s == ConnectionState::AuthFailed)
                .await
                .unwrap();
        }
        assert_eq!(m.state(), ConnectionState::AuthFailed);
        assert_eq!(pump.connect_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn long_lived_links_do_not_count_as_rapid() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        let mut states = m.observe_connection_state();
        for _ in 0..4 {
            tokio::time::sleep(Duration::from_secs(60)).await;
            pump.drop_link();
            settle().await;
            states
                .wait_for(|s| *s == ConnectionState::Connected)
                .await
                .unwrap();
        }
        assert_eq!(m.state(), ConnectionState::Connected);
        assert_eq!(pump.connect_count(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn history_fetch_resumes_from_cursor() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        // Event sequences are sparse and far from the log indices 0..50.
        pump.add_history((0..50).map(|i| record(1000 + 3 * i)));
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();

        let first = m.fetch_history().await.unwrap();
        let seqs: Vec<u32> = first.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, (0..50).map(|i| 1000 + 3 * i).collect::<Vec<_>>());
        assert_eq!(m.history_cursor().await, Some(50));

        assert!(m.fetch_history().await.unwrap().is_empty());

        pump.add_history((50..60).map(|i| record(1000 + 3 * i)));
        let second = m.fetch_history().await.unwrap();
        assert_eq!(second.len(), 10);
        assert_eq!(second[0].sequence, 1150);
        assert_eq!(m.history_cursor().await, Some(60));
    }

    #[tokio::test(start_paused = true)]
    async fn history_index_is_independent_of_sequence() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.add_history((0..30).map(|i| record(i + 1_000_000)));
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();

        let records = m.fetch_history().await.unwrap();
        assert_eq!(records.len(), 30);
        assert_eq!(records[29].sequence, 1_000_029);
        assert_eq!(m.history_cursor().await, Some(30));
        assert!(m.fetch_history().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_fetch_is_bounded() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.set_next_history_index(10_000);
        pump.add_history((0..2000).map(|i| record(70_000 + 2 * i)));
        let mut config = LinkConfig::new(PairingCode::parse(JPAKE_CODE).unwrap());
        config.history.max_records = 30;
        let m = ConnectionManager::new(pump.clone(), config, None);
        m.connect(ADDRESS).await.unwrap();

        let records = m.fetch_history().await.unwrap();
        // Window is the last 500 indices: 11_500..12_000.
        assert_eq!(records.len(), 30);
        assert_eq!(records[0].sequence, 73_000);
        assert_eq!(m.history_cursor().await, Some(11_530));
        let next = m.fetch_history().await.unwrap();
        assert_eq!(next[0].sequence, 73_060);
        assert_eq!(m.history_cursor().await, Some(11_560));
    }

    #[tokio::test(start_paused = true)]
    async fn history_pruned_under_fetch_moves_on() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.add_history((0..40).map(|i| record(500 + i)));
        pump.prune_history_on_request(10);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();

        let records = m.fetch_history().await.unwrap();
        assert_eq!(records.len(), 30);
        assert_eq!(records[0].sequence, 510);
        assert_eq!(m.history_cursor().await, Some(40));
        assert!(m.fetch_history().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn history_deadline_keeps_progress() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.add_history((0..100).map(record));
        let mut config = LinkConfig::new(PairingCode::parse(JPAKE_CODE).unwrap());
        config.history.stagger = Duration::from_secs(1);
        config.history.deadline = Duration::from_millis(1500);
        let m = ConnectionManager::new(pump.clone(), config, None);
        m.connect(ADDRESS).await.unwrap();

        let records = m.fetch_history().await.unwrap();
        assert_eq!(records.len(), 40);
        assert_eq!(m.history_cursor().await, Some(40));
    }

    #[tokio::test(start_paused = true)]
    async fn stream_before_ack_is_kept() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.add_history((10..25).map(record));
        pump.stream_before_ack(true);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        let packets = m
            .request_history_log_stream(&[0, 0, 0, 0, 15], Duration::from_secs(2))
            .await
            .unwrap();
        let total: usize = packets
            .iter()
            .map(|p| decode_history_stream(p).unwrap().records.len())
            .sum();
        assert_eq!(total, 15);
    }

    #[tokio::test(start_paused = true)]
    async fn refused_history_request() {
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.add_history((0..5).map(record));
        pump.set_history_ack_status(3);
        let m = manager(&pump, JPAKE_CODE);
        m.connect(ADDRESS).await.unwrap();
        let err = m
            .request_history_log_stream(&[0, 0, 0, 0, 5], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert_eq!(err, LinkError::Rejected { status: 3 });
        let err = m
            .request_history_log_stream(&[0, 0, 0], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, LinkError::Decode(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn cursor_survives_restart() {
        let path = std::env::temp_dir().join(format!(
            "pumplink-manager-{}/cursor.bin",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
        let pump = FakePump::new(ADDRESS, JPAKE_CODE);
        pump.add_history((0..30).map(|i| record(200 + 7 * i)));
        let config = LinkConfig::new(PairingCode::parse(JPAKE_CODE).unwrap());

        let m = ConnectionManager::new(pump.clone(), config.clone(), Some(CursorStore::new(&path)));
        m.connect(ADDRESS).await.unwrap();
        assert_eq!(m.fetch_history().await.unwrap().len(), 30);
        m.disconnect().await;

        pump.add_history((30..35).map(|i| record(200 + 7 * i)));
        let restarted = ConnectionManager::new(pump.clone(), config, Some(CursorStore::new(&path)));
        assert_eq!(restarted.history_cursor().await, Some(30));
        restarted.connect(ADDRESS).await.unwrap();
        let records = restarted.fetch_history().await.unwrap();
        let seqs: Vec<u32> = records.iter().map(|r| r.sequence).collect();
        assert_eq!(seqs, vec![410, 417, 424, 431, 438]);
        let _ = std::fs::remove_dir_all(path.parent().unwrap());
    }
}
