//! Bridge session state and the selection request state machine.
//!
//! Pure bookkeeping: no I/O happens here. [`BridgeState`] decides what a
//! local selection request should turn into; the caller performs the
//! resulting X11 and channel operations.
//!
//! ```text
//!            no mapping / cache hit
//!              ┌──────────┐
//!              ▼          │
//!           ┌──────┐ request (forward) ┌────────────────────┐
//!  ────────>│ Idle │──────────────────>│ AwaitingRemoteData │──┐ duplicate request
//!           └──────┘<──────────────────└────────────────────┘<─┘ (refused)
//!                     data response
//! ```

use crate::clipboard::formats::FormatMapping;
use crate::clipboard::selection::{Atom, SelectionRequest, SelectionResponse};
use tracing::debug;

/// Most recently received remote data, tagged with the format it was requested as
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedPayload {
    /// Remote format the data was requested as
    pub format_id: u32,
    /// Converted bytes, ready to hand to local clients
    pub data: Vec<u8>,
}

/// A local selection request waiting for a remote round trip
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PendingResponse {
    /// Completion to send once data (or failure) arrives
    pub response: SelectionResponse,
    /// Remote format requested on behalf of this request
    pub format_id: u32,
}

/// Outcome of resolving a local selection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestDecision {
    /// No mapping for the target among advertised formats: refuse now
    NoMapping,
    /// Cached data matches: answer now from the cache
    Cached {
        /// Format of the cached data
        format_id: u32,
    },
    /// A remote request is already in flight: refuse this one
    Duplicate,
    /// Request recorded as pending: send a remote data request
    Forward {
        /// Format to request from the remote side
        format_id: u32,
    },
}

/// Coarse state of the request/response machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestState {
    /// No local request waiting
    Idle,
    /// A remote data request is in flight
    AwaitingRemoteData,
}

/// Mutable session state shared by the event thread and channel callbacks
#[derive(Debug, Clone, Default)]
pub struct BridgeState {
    mappings: Vec<FormatMapping>,
    advertised: Vec<u32>,
    cache: Option<CachedPayload>,
    pending: Option<PendingResponse>,
}

impl BridgeState {
    /// Create a session state with a fixed mapping table
    pub fn new(mappings: Vec<FormatMapping>) -> Self {
        Self {
            mappings,
            ..Self::default()
        }
    }

    /// Format mapping table (immutable after creation)
    pub fn mappings(&self) -> &[FormatMapping] {
        &self.mappings
    }

    /// Formats the remote side currently offers
    pub fn advertised(&self) -> &[u32] {
        &self.advertised
    }

    /// Cached remote payload, if any
    pub fn cache(&self) -> Option<&CachedPayload> {
        self.cache.as_ref()
    }

    /// Pending local request, if any
    pub fn pending(&self) -> Option<&PendingResponse> {
        self.pending.as_ref()
    }

    /// Current request state
    pub fn request_state(&self) -> RequestState {
        if self.pending.is_some() {
            RequestState::AwaitingRemoteData
        } else {
            RequestState::Idle
        }
    }

    /// First mapping (in table order) for `target` whose format is advertised
    pub fn resolve(&self, target: Atom) -> Option<&FormatMapping> {
        self.mappings
            .iter()
            .filter(|m| m.local_target == target)
            .find(|m| self.advertised.contains(&m.remote_format_id))
    }

    /// Replace the advertised list wholesale. Invalidates the cache.
    pub fn replace_advertised(&mut self, format_ids: Vec<u32>) {
        self.cache = None;
        self.advertised = format_ids;
    }

    /// Run the state machine for one local selection request.
    ///
    /// On [`RequestDecision::Forward`] the request is already recorded as
    /// pending and any stale cache has been dropped.
    pub fn begin_request(&mut self, request: &SelectionRequest) -> RequestDecision {
        let Some(format_id) = self.resolve(request.target).map(|m| m.remote_format_id) else {
            return RequestDecision::NoMapping;
        };

        if self.cache.as_ref().is_some_and(|c| c.format_id == format_id) {
            return RequestDecision::Cached { format_id };
        }

        if self.pending.is_some() {
            return RequestDecision::Duplicate;
        }

        if self.cache.take().is_some() {
            debug!("Dropping stale cached payload before remote request");
        }
        self.pending = Some(PendingResponse {
            response: request.accept(),
            format_id,
        });
        RequestDecision::Forward { format_id }
    }

    /// Take the pending request, returning the machine to Idle
    pub fn take_pending(&mut self) -> Option<PendingResponse> {
        self.pending.take()
    }

    /// Store converted data for `format_id`, replacing any previous payload
    pub fn store_cache(&mut self, format_id: u32, data: Vec<u8>) -> &CachedPayload {
        self.cache.insert(CachedPayload { format_id, data })
    }
}
