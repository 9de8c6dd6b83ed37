//! Clipboard Bridge Module
//!
//! Bridges the local X11 clipboard selection with the remote session's
//! clipboard virtual channel (CLIPRDR), in both directions.
//!
//! # Architecture
//!
//! - [`ClipboardBridge`] - Session lifecycle and the event thread
//! - [`BridgeState`] - Advertised formats, cache and pending request
//! - [`FormatConverter`] - Remote text formats to and from UTF-8
//! - [`pdu`] - Clipboard channel message encoding and decoding
//! - [`SelectionBackend`] - Local selection protocol, implemented by [`X11Selection`]
//!
//! # Data Flow
//!
//! ```text
//! Local app              X server            Event thread            Remote
//! ━━━━━━━━━              ━━━━━━━━            ━━━━━━━━━━━━            ━━━━━━
//!
//!                                                             <── Format List
//!                        SetSelectionOwner <── on_format_list
//! Paste (Ctrl+V)
//!   └─> ConvertSelection ──> SelectionRequest ──> resolve
//!                                                   ├─ cache hit ──> property
//!                                                   └─ Data Request ──────>
//!                                                             <── Data Response
//!   <── SelectionNotify <── ChangeProperty <── on_data_response
//! ```

pub mod bridge;
pub mod error;
pub mod formats;
pub mod pdu;
pub mod selection;
pub mod signal;
pub mod state;
pub mod x11;

pub use bridge::{BridgeSnapshot, ClipboardBridge, LocalFetch, PacketSender};
pub use error::{ClipboardError, ClipboardResult};
pub use formats::{FormatConverter, FormatMapping, CF_TEXT, CF_UNICODETEXT};
pub use pdu::{ClipboardPdu, MessageType};
pub use selection::{LocalEvent, SelectionBackend, SelectionRequest, SelectionResponse};
pub use signal::{wait_any, EventSignal};
pub use state::{BridgeState, CachedPayload, PendingResponse, RequestDecision, RequestState};
pub use x11::X11Selection;
