//! Clipboard bridge session
//!
//! Couples the local selection protocol with the remote clipboard channel.
//!
//! # Threads
//!
//! ```text
//! Channel callbacks                          Event thread (std::thread)
//! ━━━━━━━━━━━━━━━━━                          ━━━━━━━━━━━━━━━━━━━━━━━━━━
//!
//! on_format_list ──┐                         wait_any(term, wake, X fd)
//! on_data_response ├──> Mutex<BridgeCore> <──── drain_events()
//! on_data_request ─┘          │                   ├─ SelectionRequest
//!        │                    │                   ├─ SelectionClear
//!        └── wake.signal() ───┘                   └─ SelectionNotify
//! ```
//!
//! Every mutation of session state and every request on the local connection
//! happens with the core lock held. The event thread only blocks in its
//! top-level wait, which runs without the lock on a duplicated descriptor.

use crate::clipboard::error::{ClipboardError, ClipboardResult};
use crate::clipboard::formats::{
    builtin_mappings, format_name, FormatConverter, ANNOUNCED_FORMATS, CF_TEXT, CF_UNICODETEXT,
};
use crate::clipboard::pdu::{
    decode_capabilities, decode_data_request, decode_format_list, encode_capabilities,
    encode_data_request, encode_format_list, msg_flags, MessageType,
};
use crate::clipboard::selection::{Atom, LocalEvent, SelectionBackend, SelectionRequest, SelectionResponse};
use crate::clipboard::signal::{wait_any, EventSignal};
use crate::clipboard::state::{BridgeState, CachedPayload, PendingResponse, RequestDecision};
use crate::clipboard::x11::X11Selection;
use crate::config::BridgeConfig;
use parking_lot::Mutex;
use std::os::fd::{AsFd, OwnedFd};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, trace, warn};

/// Outbound side of the clipboard channel
pub trait PacketSender: Send + Sync {
    /// Queue one clipboard message for the remote side
    fn send_packet(&self, msg_type: MessageType, msg_flags: u16, payload: &[u8]) -> ClipboardResult<()>;
}

/// A remote data request waiting for the local owner's conversion
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalFetch {
    /// Remote format to answer with
    pub format_id: u32,
    /// When the conversion was requested
    pub started: Instant,
}

/// Point-in-time copy of the session state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BridgeSnapshot {
    /// Formats the remote side currently offers
    pub advertised: Vec<u32>,
    /// Cached remote payload
    pub cache: Option<CachedPayload>,
    /// Local request waiting for remote data
    pub pending: Option<PendingResponse>,
    /// Remote request waiting for local data
    pub local_fetch: Option<LocalFetch>,
    /// Whether the bridge currently owns the local selection
    pub owns_selection: bool,
    /// No local connection; local operations are no-ops
    pub degraded: bool,
}

/// Session state plus the local connection, guarded by a single lock
pub struct BridgeCore {
    state: BridgeState,
    backend: Option<Box<dyn SelectionBackend>>,
    converter: FormatConverter,
    local_fetch: Option<LocalFetch>,
    fetch_timeout: Duration,
    owns_selection: bool,
}

impl std::fmt::Debug for BridgeCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BridgeCore")
            .field("state", &self.state)
            .field("degraded", &self.backend.is_none())
            .field("local_fetch", &self.local_fetch)
            .field("owns_selection", &self.owns_selection)
            .finish()
    }
}

/// Write `data` into the requestor's property (if accepted) and notify it.
///
/// A failed property write turns the response into a refusal.
fn deliver(backend: &mut dyn SelectionBackend, response: SelectionResponse, data: &[u8]) {
    let response = match response.property {
        Some(property) => {
            match backend.write_property(response.requestor, property, response.target, data) {
                Ok(()) => response,
                Err(e) => {
                    warn!("Failed to write selection property for 0x{:x}: {}", response.requestor, e);
                    response.into_refusal()
                }
            }
        }
        None => response,
    };
    notify(backend, &response);
}

fn notify(backend: &mut dyn SelectionBackend, response: &SelectionResponse) {
    if let Err(e) = backend.send_response(response) {
        warn!("Failed to notify requestor 0x{:x}: {}", response.requestor, e);
    }
}

/// How long a local owner gets to answer a conversion by default
pub const DEFAULT_FETCH_TIMEOUT: Duration = Duration::from_secs(5);

fn send_data_failure(sender: &dyn PacketSender) {
    if let Err(e) = sender.send_packet(MessageType::FormatDataResponse, msg_flags::CB_RESPONSE_FAIL, &[]) {
        warn!("Failed to send data failure response: {}", e);
    }
}

impl BridgeCore {
    /// Build the core around an optional local backend.
    ///
    /// Without a backend the mapping table is empty (degraded mode).
    pub fn new(backend: Option<Box<dyn SelectionBackend>>, converter: FormatConverter) -> Self {
        let mappings = backend
            .as_ref()
            .map(|b| builtin_mappings(b.utf8_target()))
            .unwrap_or_default();
        Self {
            state: BridgeState::new(mappings),
            backend,
            converter,
            local_fetch: None,
            fetch_timeout: DEFAULT_FETCH_TIMEOUT,
            owns_selection: false,
        }
    }

    /// Let a new remote data request replace a local fetch older than `timeout`
    pub fn with_fetch_timeout(mut self, timeout: Duration) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    /// Session state
    pub fn state(&self) -> &BridgeState {
        &self.state
    }

    /// True when no local connection is available
    pub fn is_degraded(&self) -> bool {
        self.backend.is_none()
    }

    /// Copy of the observable state
    pub fn snapshot(&self) -> BridgeSnapshot {
        BridgeSnapshot {
            advertised: self.state.advertised().to_vec(),
            cache: self.state.cache().cloned(),
            pending: self.state.pending().copied(),
            local_fetch: self.local_fetch,
            owns_selection: self.owns_selection,
            degraded: self.is_degraded(),
        }
    }

    fn flush(&mut self) {
        if let Some(backend) = self.backend.as_mut() {
            if let Err(e) = backend.flush() {
                warn!("Failed to flush local connection: {}", e);
            }
        }
    }

    /// Process every event the backend has available without blocking.
    ///
    /// A read error means the local connection is gone: the core drops the
    /// backend and keeps running degraded. Returns `false` once that happened.
    pub fn drain_events(&mut self, sender: &dyn PacketSender) -> bool {
        loop {
            let event = match self.backend.as_mut().map(|b| b.next_event()) {
                None => return false,
                Some(Ok(None)) => break,
                Some(Ok(Some(event))) => event,
                Some(Err(e)) => {
                    error!("Local connection lost, clipboard bridge running degraded: {}", e);
                    self.disconnect(sender);
                    return false;
                }
            };
            self.handle_event(event, sender);
        }
        self.flush();
        true
    }

    fn disconnect(&mut self, sender: &dyn PacketSender) {
        self.backend = None;
        self.owns_selection = false;
        if self.state.take_pending().is_some() {
            debug!("Dropping local request, its requestor is unreachable");
        }
        if self.local_fetch.take().is_some() {
            send_data_failure(sender);
        }
    }

    /// Run one local event through the state machines
    pub fn handle_event(&mut self, event: LocalEvent, sender: &dyn PacketSender) {
        match event {
            LocalEvent::SelectionRequest(request) => self.handle_selection_request(&request, sender),
            LocalEvent::SelectionClear => {
                debug!("Local selection taken by another client");
                self.owns_selection = false;
            }
            LocalEvent::SelectionNotify { property } => self.complete_local_fetch(property, sender),
        }
    }

    fn handle_selection_request(&mut self, request: &SelectionRequest, sender: &dyn PacketSender) {
        let Some(backend) = self.backend.as_deref_mut() else {
            return;
        };

        match self.state.begin_request(request) {
            RequestDecision::NoMapping => {
                debug!(
                    "No advertised format for target {} from 0x{:x}, refusing",
                    request.target, request.requestor
                );
                notify(backend, &request.refuse());
            }
            RequestDecision::Cached { format_id } => {
                let data = self.state.cache().map(|c| c.data.as_slice()).unwrap_or_default();
                trace!(
                    "Serving {} bytes of cached {} to 0x{:x}",
                    data.len(),
                    format_name(format_id),
                    request.requestor
                );
                deliver(backend, request.accept(), data);
            }
            RequestDecision::Duplicate => {
                warn!(
                    "Remote data request already in flight, refusing request from 0x{:x}",
                    request.requestor
                );
                notify(backend, &request.refuse());
            }
            RequestDecision::Forward { format_id } => {
                debug!(
                    "Requesting {} from remote for 0x{:x}",
                    format_name(format_id),
                    request.requestor
                );
                let payload = encode_data_request(format_id);
                if let Err(e) = sender.send_packet(MessageType::FormatDataRequest, 0, &payload) {
                    error!("Failed to send data request: {}", e);
                    if let Some(pending) = self.state.take_pending() {
                        notify(backend, &pending.response.into_refusal());
                    }
                }
            }
        }
    }

    fn complete_local_fetch(&mut self, property: Option<Atom>, sender: &dyn PacketSender) {
        let Some(fetch) = self.local_fetch.take() else {
            debug!("SelectionNotify with no local fetch in flight");
            return;
        };
        let Some(backend) = self.backend.as_deref_mut() else {
            send_data_failure(sender);
            return;
        };

        let Some(property) = property else {
            info!("Local selection owner refused conversion");
            send_data_failure(sender);
            return;
        };

        let converted = backend
            .take_property(property)
            .and_then(|data| self.converter.local_to_remote(fetch.format_id, &data));

        match converted {
            Ok(payload) => {
                debug!(
                    "Sending {} bytes of {} to remote",
                    payload.len(),
                    format_name(fetch.format_id)
                );
                if let Err(e) =
                    sender.send_packet(MessageType::FormatDataResponse, msg_flags::CB_RESPONSE_OK, &payload)
                {
                    error!("Failed to send data response: {}", e);
                }
            }
            Err(e) => {
                warn!("Local selection conversion failed: {}", e);
                send_data_failure(sender);
            }
        }
    }

    /// Announce the fixed format list
    pub fn sync(&mut self, sender: &dyn PacketSender) -> ClipboardResult<()> {
        sender.send_packet(MessageType::FormatList, 0, &encode_format_list(&ANNOUNCED_FORMATS))
    }

    /// Replace the advertised format list and take local selection ownership
    pub fn on_format_list(&mut self, flags: u16, payload: &[u8], sender: &dyn PacketSender) -> ClipboardResult<()> {
        let entries = decode_format_list(flags, payload).inspect_err(|e| {
            warn!("Rejecting format list: {}", e);
        })?;

        for entry in &entries {
            debug!(
                "Remote offers format {} ({}) {:?}",
                entry.format_id,
                format_name(entry.format_id),
                entry.name
            );
        }
        self.state
            .replace_advertised(entries.into_iter().map(|e| e.format_id).collect());

        if self.local_fetch.take().is_some() {
            debug!("Abandoning local fetch, remote now owns the clipboard");
            send_data_failure(sender);
        }

        let Some(backend) = self.backend.as_mut() else {
            return Ok(());
        };
        // The list is adopted either way; only local pastes are lost
        match backend.claim_selection() {
            Ok(()) => self.owns_selection = true,
            Err(e) => {
                warn!("Failed to claim local selection: {}", e);
                self.owns_selection = false;
            }
        }
        Ok(())
    }

    /// Complete the pending local request with remote data (or a failure)
    pub fn on_data_response(&mut self, flags: u16, payload: &[u8]) -> ClipboardResult<()> {
        let Some(pending) = self.state.take_pending() else {
            warn!("Data response with no pending local request");
            return Err(ClipboardError::UnexpectedDataResponse);
        };

        let converted = if flags & msg_flags::CB_RESPONSE_FAIL != 0 {
            info!("Remote failed data request for {}", format_name(pending.format_id));
            Ok(None)
        } else {
            self.converter
                .remote_to_local(pending.format_id, payload)
                .map(Some)
        };

        let result = match converted {
            Ok(Some(data)) => {
                let cached = self.state.store_cache(pending.format_id, data);
                if let Some(backend) = self.backend.as_deref_mut() {
                    deliver(backend, pending.response, &cached.data);
                }
                Ok(())
            }
            Ok(None) => {
                self.refuse(&pending);
                Ok(())
            }
            Err(e) => {
                warn!(
                    "Failed to convert {} payload: {}",
                    format_name(pending.format_id),
                    e
                );
                self.refuse(&pending);
                Err(e)
            }
        };

        self.flush();
        result
    }

    fn refuse(&mut self, pending: &PendingResponse) {
        if let Some(backend) = self.backend.as_deref_mut() {
            notify(backend, &pending.response.into_refusal());
        }
    }

    /// Log the remote capabilities and answer with the fixed capability block
    pub fn on_capabilities(&mut self, flags: u16, payload: &[u8], sender: &dyn PacketSender) -> ClipboardResult<()> {
        match decode_capabilities(payload) {
            Ok(sets) => {
                for set in sets {
                    debug!(
                        "Remote capability set type={} version={:?} flags={:?}",
                        set.capability_type, set.version, set.general_flags
                    );
                }
            }
            Err(e) => debug!("Unparseable capabilities (flags 0x{:x}): {}", flags, e),
        }
        sender.send_packet(MessageType::ClipCaps, 0, &encode_capabilities())
    }

    /// Start fetching the local selection for a remote data request
    pub fn on_data_request(&mut self, payload: &[u8], sender: &dyn PacketSender) -> ClipboardResult<()> {
        if let Some(fetch) = self.local_fetch {
            if fetch.started.elapsed() >= self.fetch_timeout {
                warn!(
                    "Local owner never answered conversion for {}, giving up",
                    format_name(fetch.format_id)
                );
                self.local_fetch = None;
                send_data_failure(sender);
            }
        }
        let result = self.begin_local_fetch(payload);
        if result.is_err() {
            send_data_failure(sender);
        }
        result
    }

    fn begin_local_fetch(&mut self, payload: &[u8]) -> ClipboardResult<()> {
        let format_id = decode_data_request(payload)?;
        if !matches!(format_id, CF_UNICODETEXT | CF_TEXT) {
            return Err(ClipboardError::UnsupportedFormat(format_id));
        }
        if self.owns_selection {
            return Err(ClipboardError::InvalidState(
                "local selection is owned by the bridge".into(),
            ));
        }
        if let Some(fetch) = self.local_fetch {
            return Err(ClipboardError::RequestInFlight(fetch.format_id));
        }

        let backend = self
            .backend
            .as_deref_mut()
            .ok_or(ClipboardError::BackendUnavailable)?;
        let target = backend.utf8_target();
        backend.request_conversion(target)?;

        debug!("Converting local selection for remote {}", format_name(format_id));
        self.local_fetch = Some(LocalFetch {
            format_id,
            started: Instant::now(),
        });
        Ok(())
    }

    /// Drop the local connection and all session data
    pub fn release(&mut self) {
        self.backend = None;
        self.local_fetch = None;
        self.owns_selection = false;
        self.state = BridgeState::default();
    }
}

struct Shared {
    core: Mutex<BridgeCore>,
    sender: Arc<dyn PacketSender>,
    term: EventSignal,
    wake: EventSignal,
}

/// The clipboard bridge session.
///
/// Owns the event thread. Dropping the bridge (or calling
/// [`destroy`](Self::destroy)) signals the thread and waits a bounded time
/// for it to exit.
pub struct ClipboardBridge {
    shared: Arc<Shared>,
    thread: Option<JoinHandle<()>>,
    shutdown_poll_attempts: u32,
    shutdown_poll_interval: Duration,
}

impl std::fmt::Debug for ClipboardBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClipboardBridge")
            .field("core", &*self.shared.core.lock())
            .field("thread_running", &self.thread.is_some())
            .finish()
    }
}

impl ClipboardBridge {
    /// Connect to the local display and start the event thread.
    ///
    /// A display that cannot be reached is not fatal: the bridge starts in
    /// degraded mode.
    pub fn create(config: &BridgeConfig, sender: Arc<dyn PacketSender>) -> ClipboardResult<Self> {
        let backend = match X11Selection::connect(config.display.as_deref(), &config.selection) {
            Ok(selection) => Some(Box::new(selection) as Box<dyn SelectionBackend>),
            Err(e) => {
                warn!("X11 clipboard unavailable, running degraded: {}", e);
                None
            }
        };
        Self::with_backend(config, backend, sender)
    }

    /// Start a bridge around an already constructed backend
    pub fn with_backend(
        config: &BridgeConfig,
        backend: Option<Box<dyn SelectionBackend>>,
        sender: Arc<dyn PacketSender>,
    ) -> ClipboardResult<Self> {
        let fd = backend.as_ref().map(|b| b.readiness_fd()).transpose()?;
        let converter = FormatConverter::with_max_size(config.max_data_size);

        let shared = Arc::new(Shared {
            core: Mutex::new(
                BridgeCore::new(backend, converter)
                    .with_fetch_timeout(Duration::from_millis(config.local_fetch_timeout_ms)),
            ),
            sender,
            term: EventSignal::new("term")?,
            wake: EventSignal::new("wake")?,
        });

        let thread_shared = Arc::clone(&shared);
        let thread = thread::Builder::new()
            .name("cliprdr-x11".to_string())
            .spawn(move || run_event_loop(thread_shared, fd))
            .map_err(|e| ClipboardError::ThreadSpawn(e.to_string()))?;

        info!("Clipboard bridge started");

        Ok(Self {
            shared,
            thread: Some(thread),
            shutdown_poll_attempts: config.shutdown_poll_attempts,
            shutdown_poll_interval: Duration::from_millis(config.shutdown_poll_interval_ms),
        })
    }

    /// Stop the event thread and release the session.
    ///
    /// Returns `true` if the thread exited within the poll budget.
    pub fn destroy(mut self) -> bool {
        self.shutdown()
    }

    fn shutdown(&mut self) -> bool {
        let Some(handle) = self.thread.take() else {
            return true;
        };

        self.shared.term.signal();
        for _ in 0..self.shutdown_poll_attempts {
            if handle.is_finished() {
                break;
            }
            thread::sleep(self.shutdown_poll_interval);
        }

        let exited = handle.is_finished();
        if exited {
            if handle.join().is_err() {
                error!("Clipboard event thread panicked");
            }
            info!("Clipboard bridge stopped");
        } else {
            warn!(
                "Clipboard event thread still running after {} polls, detaching",
                self.shutdown_poll_attempts
            );
        }

        match self.shared.core.try_lock_for(self.shutdown_poll_interval) {
            Some(mut core) => core.release(),
            None => warn!("Clipboard state still locked, leaving release to the event thread"),
        }
        exited
    }

    fn with_core<T>(&self, f: impl FnOnce(&mut BridgeCore, &dyn PacketSender) -> T) -> T {
        let result = {
            let mut core = self.shared.core.lock();
            f(&mut core, &*self.shared.sender)
        };
        // Requests may have pulled events into the connection's buffer
        self.shared.wake.signal();
        result
    }

    /// Announce the local format list to the remote side
    pub fn sync(&self) -> ClipboardResult<()> {
        self.with_core(|core, sender| core.sync(sender))
    }

    /// Handle an inbound format list
    pub fn on_format_list(&self, flags: u16, payload: &[u8]) -> ClipboardResult<()> {
        self.with_core(|core, sender| core.on_format_list(flags, payload, sender))
    }

    /// Handle an inbound data response
    pub fn on_data_response(&self, flags: u16, payload: &[u8]) -> ClipboardResult<()> {
        self.with_core(|core, _| core.on_data_response(flags, payload))
    }

    /// Handle inbound capabilities
    pub fn on_capabilities(&self, flags: u16, payload: &[u8]) -> ClipboardResult<()> {
        self.with_core(|core, sender| core.on_capabilities(flags, payload, sender))
    }

    /// Handle an inbound data request
    pub fn on_data_request(&self, _flags: u16, payload: &[u8]) -> ClipboardResult<()> {
        self.with_core(|core, sender| core.on_data_request(payload, sender))
    }

    /// Copy of the current session state
    pub fn snapshot(&self) -> BridgeSnapshot {
        self.shared.core.lock().snapshot()
    }
}

impl Drop for ClipboardBridge {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn run_event_loop(shared: Arc<Shared>, mut fd: Option<OwnedFd>) {
    debug!("Clipboard event thread running");

    loop {
        let signals = [&shared.term, &shared.wake];
        if let Err(e) = wait_any(&signals, fd.as_ref().map(|fd| fd.as_fd()), None) {
            error!("Clipboard event wait failed: {}", e);
            break;
        }
        if shared.term.is_signaled() {
            debug!("Clipboard event thread woken by {} signal", shared.term.name());
            break;
        }
        shared.wake.reset();

        let mut core = shared.core.lock();
        if !core.drain_events(&*shared.sender) && fd.take().is_some() {
            debug!("Stopped polling local connection");
        }
    }

    debug!("Clipboard event thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::selection::WindowId;
    use std::collections::{HashMap, VecDeque};

    const UTF8_STRING: Atom = 300;
    const TRANSFER: Atom = 400;

    #[derive(Default)]
    struct FakeSelection {
        events: VecDeque<LocalEvent>,
        written: Vec<(WindowId, Atom, Atom, Vec<u8>)>,
        responses: Vec<SelectionResponse>,
        claims: usize,
        conversions: Vec<Atom>,
        properties: HashMap<Atom, Vec<u8>>,
        reads: usize,
        fail_writes: bool,
        fail_reads: bool,
        fail_claims: bool,
    }

    #[derive(Clone, Default)]
    struct FakeHandle(Arc<Mutex<FakeSelection>>);

    impl SelectionBackend for FakeHandle {
        fn utf8_target(&self) -> Atom {
            UTF8_STRING
        }
        fn readiness_fd(&self) -> ClipboardResult<OwnedFd> {
            let (a, _b) = std::os::unix::net::UnixStream::pair()?;
            Ok(OwnedFd::from(a))
        }
        fn next_event(&mut self) -> ClipboardResult<Option<LocalEvent>> {
            let mut inner = self.0.lock();
            inner.reads += 1;
            if inner.fail_reads {
                return Err(ClipboardError::Backend("connection reset".into()));
            }
            Ok(inner.events.pop_front())
        }
        fn claim_selection(&mut self) -> ClipboardResult<()> {
            let mut inner = self.0.lock();
            if inner.fail_claims {
                return Err(ClipboardError::Backend("claim failed".into()));
            }
            inner.claims += 1;
            Ok(())
        }
        fn write_property(&mut self, requestor: WindowId, property: Atom, target: Atom, data: &[u8]) -> ClipboardResult<()> {
            let mut inner = self.0.lock();
            if inner.fail_writes {
                return Err(ClipboardError::Backend("write failed".into()));
            }
            inner.written.push((requestor, property, target, data.to_vec()));
            Ok(())
        }
        fn send_response(&mut self, response: &SelectionResponse) -> ClipboardResult<()> {
            self.0.lock().responses.push(*response);
            Ok(())
        }
        fn request_conversion(&mut self, target: Atom) -> ClipboardResult<()> {
            self.0.lock().conversions.push(target);
            Ok(())
        }
        fn take_property(&mut self, property: Atom) -> ClipboardResult<Vec<u8>> {
            self.0
                .lock()
                .properties
                .remove(&property)
                .ok_or_else(|| ClipboardError::Backend("no such property".into()))
        }
        fn flush(&mut self) -> ClipboardResult<()> {
            Ok(())
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<(MessageType, u16, Vec<u8>)>>);

    impl PacketSender for Recorder {
        fn send_packet(&self, msg_type: MessageType, msg_flags: u16, payload: &[u8]) -> ClipboardResult<()> {
            self.0.lock().push((msg_type, msg_flags, payload.to_vec()));
            Ok(())
        }
    }

    impl Recorder {
        fn take(&self) -> Vec<(MessageType, u16, Vec<u8>)> {
            std::mem::take(&mut *self.0.lock())
        }
    }

    fn setup() -> (BridgeCore, FakeHandle, Recorder) {
        let fake = FakeHandle::default();
        let core = BridgeCore::new(Some(Box::new(fake.clone())), FormatConverter::new());
        (core, fake, Recorder::default())
    }

    fn request(requestor: WindowId, target: Atom) -> LocalEvent {
        LocalEvent::SelectionRequest(SelectionRequest {
            requestor,
            selection: 1,
            target,
            property: 77,
            time: 5,
        })
    }

    fn advertise(core: &mut BridgeCore, sender: &Recorder, formats: &[u32]) {
        core.on_format_list(0, &encode_format_list(formats), sender).unwrap();
    }

    #[test]
    fn test_sync_is_idempotent() {
        let (mut core, _fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_TEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);
        core.state.store_cache(CF_TEXT, b"kept".to_vec());
        sender.take();
        let before = core.snapshot();
        assert!(before.pending.is_some());

        core.sync(&sender).unwrap();
        core.sync(&sender).unwrap();
        let sent = sender.take();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0], sent[1]);
        assert_eq!(sent[0].0, MessageType::FormatList);
        assert_eq!(sent[0].2.len(), 72);
        assert_eq!(core.snapshot(), before);
        assert_eq!(core.state().cache().map(|c| c.data.as_slice()), Some(&b"kept"[..]));
    }

    #[test]
    fn test_format_list_claims_selection() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_UNICODETEXT, CF_TEXT]);
        assert_eq!(core.state().advertised(), &[CF_UNICODETEXT, CF_TEXT]);
        assert_eq!(fake.0.lock().claims, 1);
        assert!(core.snapshot().owns_selection);
    }

    #[test]
    fn test_claim_failure_still_adopts_list() {
        let (mut core, fake, sender) = setup();
        fake.0.lock().fail_claims = true;
        assert!(core.on_format_list(0, &encode_format_list(&[CF_TEXT]), &sender).is_ok());
        assert_eq!(core.state().advertised(), &[CF_TEXT]);
        assert!(!core.snapshot().owns_selection);

        fake.0.lock().fail_claims = false;
        advertise(&mut core, &sender, &[CF_UNICODETEXT]);
        assert!(core.snapshot().owns_selection);
    }

    #[test]
    fn test_malformed_format_list_keeps_previous() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_TEXT]);
        assert!(core.on_format_list(0, &[0u8; 37], &sender).is_err());
        assert_eq!(core.state().advertised(), &[CF_TEXT]);
        assert_eq!(fake.0.lock().claims, 1);
    }

    #[test]
    fn test_request_without_mapping_is_refused() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_UNICODETEXT]);
        core.handle_event(request(9, 31), &sender);

        assert!(sender.take().is_empty());
        let responses = fake.0.lock().responses.clone();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].is_accepted());
        assert!(core.state().pending().is_none());
    }

    #[test]
    fn test_round_trip_then_cache_hit() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_TEXT]);

        core.handle_event(request(9, UTF8_STRING), &sender);
        let sent = sender.take();
        assert_eq!(sent, vec![(MessageType::FormatDataRequest, 0, vec![1, 0, 0, 0])]);
        assert!(core.state().pending().is_some());

        core.on_data_response(msg_flags::CB_RESPONSE_OK, b"hello").unwrap();
        {
            let inner = fake.0.lock();
            assert_eq!(inner.written, vec![(9, 77, UTF8_STRING, b"hello".to_vec())]);
            assert_eq!(inner.responses.len(), 1);
            assert!(inner.responses[0].is_accepted());
        }
        assert_eq!(
            core.state().cache(),
            Some(&CachedPayload {
                format_id: CF_TEXT,
                data: b"hello".to_vec()
            })
        );

        core.handle_event(request(10, UTF8_STRING), &sender);
        assert!(sender.take().is_empty());
        let inner = fake.0.lock();
        assert_eq!(inner.written.len(), 2);
        assert_eq!(inner.written[1].0, 10);
        assert_eq!(inner.written[1].3, b"hello");
    }

    #[test]
    fn test_duplicate_request_refused() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_UNICODETEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);
        core.handle_event(request(10, UTF8_STRING), &sender);

        assert_eq!(sender.take().len(), 1);
        let responses = fake.0.lock().responses.clone();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].requestor, 10);
        assert!(!responses[0].is_accepted());
        assert_eq!(core.state().pending().unwrap().response.requestor, 9);
    }

    #[test]
    fn test_failed_response_refuses_pending() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_TEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);

        core.on_data_response(msg_flags::CB_RESPONSE_FAIL, &[]).unwrap();
        let responses = fake.0.lock().responses.clone();
        assert_eq!(responses.len(), 1);
        assert!(!responses[0].is_accepted());
        assert!(core.state().pending().is_none());
        assert!(core.state().cache().is_none());
    }

    #[test]
    fn test_unicode_conversion_failure_refuses() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_UNICODETEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);

        let err = core
            .on_data_response(msg_flags::CB_RESPONSE_OK, &[0x00, 0xD8])
            .unwrap_err();
        assert!(err.is_format_error());
        assert!(!fake.0.lock().responses[0].is_accepted());
        assert!(core.state().pending().is_none());
    }

    #[test]
    fn test_unicode_response_converted() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_UNICODETEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);
        core.on_data_response(msg_flags::CB_RESPONSE_OK, &[0x48, 0, 0x69, 0, 0, 0])
            .unwrap();
        assert_eq!(fake.0.lock().written[0].3, b"Hi");
    }

    #[test]
    fn test_write_failure_turns_into_refusal() {
        let (mut core, fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_TEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);
        fake.0.lock().fail_writes = true;

        core.on_data_response(msg_flags::CB_RESPONSE_OK, b"x").unwrap();
        assert!(!fake.0.lock().responses[0].is_accepted());
        assert!(core.state().pending().is_none());
    }

    #[test]
    fn test_unexpected_data_response() {
        let (mut core, _fake, _sender) = setup();
        let err = core.on_data_response(msg_flags::CB_RESPONSE_OK, b"x").unwrap_err();
        assert!(matches!(err, ClipboardError::UnexpectedDataResponse));
        assert!(core.state().cache().is_none());
    }

    #[test]
    fn test_capabilities_answered() {
        let (mut core, _fake, sender) = setup();
        core.on_capabilities(0, &encode_capabilities(), &sender).unwrap();
        let sent = sender.take();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, MessageType::ClipCaps);
        assert_eq!(sent[0].2, vec![1, 0, 0, 0, 1, 0, 12, 0, 2, 0, 0, 0, 0, 0, 0, 0]);
    }

    #[test]
    fn test_local_fetch_round_trip() {
        let (mut core, fake, sender) = setup();
        core.on_data_request(&encode_data_request(CF_UNICODETEXT), &sender)
            .unwrap();
        assert_eq!(fake.0.lock().conversions, vec![UTF8_STRING]);
        assert!(sender.take().is_empty());

        fake.0.lock().properties.insert(TRANSFER, b"hi".to_vec());
        core.handle_event(LocalEvent::SelectionNotify { property: Some(TRANSFER) }, &sender);

        assert_eq!(
            sender.take(),
            vec![(
                MessageType::FormatDataResponse,
                msg_flags::CB_RESPONSE_OK,
                vec![0x68, 0, 0x69, 0, 0, 0]
            )]
        );
        assert!(core.snapshot().local_fetch.is_none());
    }

    #[test]
    fn test_local_fetch_refused_by_owner() {
        let (mut core, _fake, sender) = setup();
        core.on_data_request(&encode_data_request(CF_TEXT), &sender).unwrap();
        core.handle_event(LocalEvent::SelectionNotify { property: None }, &sender);
        assert_eq!(
            sender.take(),
            vec![(MessageType::FormatDataResponse, msg_flags::CB_RESPONSE_FAIL, vec![])]
        );
    }

    #[test]
    fn test_second_data_request_fails() {
        let (mut core, fake, sender) = setup();
        core.on_data_request(&encode_data_request(CF_TEXT), &sender).unwrap();
        let err = core
            .on_data_request(&encode_data_request(CF_TEXT), &sender)
            .unwrap_err();
        assert!(matches!(err, ClipboardError::RequestInFlight(CF_TEXT)));
        assert_eq!(fake.0.lock().conversions.len(), 1);
        assert_eq!(sender.take()[0].1, msg_flags::CB_RESPONSE_FAIL);
    }

    #[test]
    fn test_unanswered_local_fetch_expires() {
        let (core, fake, sender) = setup();
        let mut core = core.with_fetch_timeout(Duration::from_millis(10));
        core.on_data_request(&encode_data_request(CF_TEXT), &sender).unwrap();
        std::thread::sleep(Duration::from_millis(30));

        core.on_data_request(&encode_data_request(CF_UNICODETEXT), &sender)
            .unwrap();
        assert_eq!(fake.0.lock().conversions.len(), 2);
        assert_eq!(
            sender.take(),
            vec![(MessageType::FormatDataResponse, msg_flags::CB_RESPONSE_FAIL, vec![])]
        );
        assert_eq!(core.snapshot().local_fetch.map(|f| f.format_id), Some(CF_UNICODETEXT));
    }

    #[test]
    fn test_read_error_degrades_core() {
        let (mut core, fake, sender) = setup();
        core.on_data_request(&encode_data_request(CF_TEXT), &sender).unwrap();
        core.state.replace_advertised(vec![CF_TEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);
        assert!(core.state().pending().is_some());
        sender.take();

        fake.0.lock().fail_reads = true;
        assert!(!core.drain_events(&sender));
        let snapshot = core.snapshot();
        assert!(snapshot.degraded);
        assert!(!snapshot.owns_selection);
        assert!(snapshot.pending.is_none());
        assert!(snapshot.local_fetch.is_none());
        assert_eq!(
            sender.take(),
            vec![(MessageType::FormatDataResponse, msg_flags::CB_RESPONSE_FAIL, vec![])]
        );

        assert!(!core.drain_events(&sender));
        assert_eq!(fake.0.lock().reads, 1);
    }

    #[test]
    fn test_data_request_rejected_cases() {
        let (mut core, _fake, sender) = setup();
        assert!(matches!(
            core.on_data_request(&encode_data_request(8), &sender),
            Err(ClipboardError::UnsupportedFormat(8))
        ));
        assert!(core.on_data_request(&[1, 0], &sender).is_err());

        advertise(&mut core, &sender, &[CF_TEXT]);
        sender.take();
        assert!(matches!(
            core.on_data_request(&encode_data_request(CF_TEXT), &sender),
            Err(ClipboardError::InvalidState(_))
        ));

        core.handle_event(LocalEvent::SelectionClear, &sender);
        assert!(!core.snapshot().owns_selection);
        assert!(core.on_data_request(&encode_data_request(CF_TEXT), &sender).is_ok());

        let failures = sender
            .take()
            .iter()
            .filter(|(_, flags, _)| *flags == msg_flags::CB_RESPONSE_FAIL)
            .count();
        assert_eq!(failures, 1);
    }

    #[test]
    fn test_degraded_core_is_inert() {
        let mut core = BridgeCore::new(None, FormatConverter::new());
        let sender = Recorder::default();
        assert!(core.is_degraded());
        assert!(core.state().mappings().is_empty());

        core.on_format_list(0, &encode_format_list(&[CF_TEXT]), &sender).unwrap();
        assert!(!core.snapshot().owns_selection);
        core.handle_event(request(9, UTF8_STRING), &sender);
        assert!(sender.take().is_empty());

        assert!(matches!(
            core.on_data_request(&encode_data_request(CF_TEXT), &sender),
            Err(ClipboardError::BackendUnavailable)
        ));
    }

    #[test]
    fn test_release_clears_everything() {
        let (mut core, _fake, sender) = setup();
        advertise(&mut core, &sender, &[CF_TEXT]);
        core.handle_event(request(9, UTF8_STRING), &sender);
        core.release();
        let snapshot = core.snapshot();
        assert!(snapshot.degraded);
        assert!(snapshot.advertised.is_empty());
        assert!(snapshot.pending.is_none());
    }
}
