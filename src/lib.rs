//! # cliprdr-x11-bridge
//!
//! Bridges the X11 clipboard selection with the RDP clipboard virtual
//! channel (CLIPRDR).
//!
//! # Architecture
//!
//! ```text
//! cliprdr-x11-bridge
//!   ├─> Clipboard Bridge (session state, event thread, format conversion)
//!   ├─> X11 Selection (proxy window owning CLIPBOARD via x11rb)
//!   └─> CLIPRDR Channel (PDU framing over stdin/stdout)
//! ```
//!
//! # Data Flow
//!
//! **Remote copy, local paste:** Format List → claim CLIPBOARD → SelectionRequest
//! → Data Request → Data Response → property + SelectionNotify
//!
//! **Local copy, remote paste:** Data Request → ConvertSelection →
//! SelectionNotify → Data Response

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Clipboard bridge core
pub mod clipboard;

/// Bridge configuration
pub mod config;

/// CLIPRDR channel adapter
pub mod rdp;
