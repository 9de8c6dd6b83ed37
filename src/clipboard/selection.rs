//! Local selection protocol abstraction.
//!
//! The bridge drives the local windowing clipboard through [`SelectionBackend`].
//! The production implementation is [`X11Selection`](crate::clipboard::x11::X11Selection);
//! tests plug in an in-memory backend.

use crate::clipboard::error::ClipboardResult;
use std::os::fd::OwnedFd;

/// Windowing-system identifier for a target, property or selection name
pub type Atom = u32;

/// Windowing-system window identifier
pub type WindowId = u32;

/// Timestamp carried through selection exchanges
pub type Timestamp = u32;

/// A request from a local client for the selection contents
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionRequest {
    /// Window asking for the data
    pub requestor: WindowId,
    /// Selection being asked for (e.g. `CLIPBOARD`)
    pub selection: Atom,
    /// Requested representation
    pub target: Atom,
    /// Property on `requestor` that should receive the data
    pub property: Atom,
    /// Request timestamp
    pub time: Timestamp,
}

impl SelectionRequest {
    /// Response that hands the data over in the requested property
    pub fn accept(&self) -> SelectionResponse {
        SelectionResponse {
            requestor: self.requestor,
            selection: self.selection,
            target: self.target,
            property: Some(self.property),
            time: self.time,
        }
    }

    /// Response that declines the request
    pub fn refuse(&self) -> SelectionResponse {
        SelectionResponse {
            property: None,
            ..self.accept()
        }
    }
}

/// The notification that completes a local selection request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SelectionResponse {
    /// Window that asked for the data
    pub requestor: WindowId,
    /// Selection that was asked for
    pub selection: Atom,
    /// Requested representation
    pub target: Atom,
    /// Property holding the data, `None` when refused
    pub property: Option<Atom>,
    /// Timestamp copied from the request
    pub time: Timestamp,
}

impl SelectionResponse {
    /// Turn an accepted response into a refusal
    pub fn into_refusal(self) -> Self {
        Self {
            property: None,
            ..self
        }
    }

    /// True if the response carries data
    pub fn is_accepted(&self) -> bool {
        self.property.is_some()
    }
}

/// Events the bridge cares about, already filtered to its own proxy window
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LocalEvent {
    /// A local client wants the selection we own
    SelectionRequest(SelectionRequest),
    /// Another client took the selection from us
    SelectionClear,
    /// The selection owner answered our conversion request
    SelectionNotify {
        /// Property on the proxy window holding the data, `None` on failure
        property: Option<Atom>,
    },
}

/// Operations the bridge needs from the local windowing clipboard.
///
/// All calls happen with the session lock held, so implementations do not
/// need interior synchronisation.
pub trait SelectionBackend: Send {
    /// Target atom for UTF-8 text (`UTF8_STRING`)
    fn utf8_target(&self) -> Atom;

    /// A descriptor that becomes readable when events may be pending.
    ///
    /// The event thread waits on it without holding the session lock, so this
    /// returns an independently owned duplicate.
    fn readiness_fd(&self) -> ClipboardResult<OwnedFd>;

    /// Next relevant event without blocking
    fn next_event(&mut self) -> ClipboardResult<Option<LocalEvent>>;

    /// Become the owner of the bridged selection
    fn claim_selection(&mut self) -> ClipboardResult<()>;

    /// Store `data` in `property` on the requestor's window
    fn write_property(
        &mut self,
        requestor: WindowId,
        property: Atom,
        target: Atom,
        data: &[u8],
    ) -> ClipboardResult<()>;

    /// Deliver the completion notification to the requestor
    fn send_response(&mut self, response: &SelectionResponse) -> ClipboardResult<()>;

    /// Ask the current owner to convert the selection to `target` into our property
    fn request_conversion(&mut self, target: Atom) -> ClipboardResult<()>;

    /// Read and delete a property on the proxy window
    fn take_property(&mut self, property: Atom) -> ClipboardResult<Vec<u8>>;

    /// Push buffered requests to the server
    fn flush(&mut self) -> ClipboardResult<()>;
}
