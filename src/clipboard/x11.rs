//! X11 selection backend
//!
//! Owns the X connection and an unmapped proxy window that acts as selection
//! owner on behalf of the remote session.

use crate::clipboard::error::{ClipboardError, ClipboardResult};
use crate::clipboard::selection::{
    Atom, LocalEvent, SelectionBackend, SelectionRequest, SelectionResponse, WindowId,
};
use std::os::fd::{AsFd, OwnedFd};
use tracing::{debug, info, trace, warn};
use x11rb::connection::{Connection, RequestConnection};
use x11rb::protocol::xproto::{
    AtomEnum, ConnectionExt as _, CreateWindowAux, EventMask, PropMode, SelectionNotifyEvent,
    WindowClass, SELECTION_NOTIFY_EVENT,
};
use x11rb::protocol::Event;
use x11rb::rust_connection::RustConnection;
use x11rb::wrapper::ConnectionExt as _;
use x11rb::{COPY_DEPTH_FROM_PARENT, COPY_FROM_PARENT, CURRENT_TIME, NONE};

/// Property on the proxy window that receives converted local selections
const TRANSFER_PROPERTY: &str = "CLIPRDR_X11_BRIDGE";

/// Space reserved for the ChangeProperty request header
const CHANGE_PROPERTY_OVERHEAD: usize = 24;

fn none_to_option(atom: Atom) -> Option<Atom> {
    (atom != NONE).then_some(atom)
}

/// X11 implementation of [`SelectionBackend`]
pub struct X11Selection {
    conn: RustConnection,
    window: WindowId,
    selection: Atom,
    utf8_string: Atom,
    incr: Atom,
    transfer_property: Atom,
}

impl std::fmt::Debug for X11Selection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("X11Selection")
            .field("window", &self.window)
            .field("selection", &self.selection)
            .field("utf8_string", &self.utf8_string)
            .finish()
    }
}

impl X11Selection {
    /// Connect to `display` (or `$DISPLAY`) and create the proxy window
    pub fn connect(display: Option<&str>, selection_name: &str) -> ClipboardResult<Self> {
        let (conn, screen_num) = x11rb::connect(display).map_err(ClipboardError::backend)?;

        let root = conn
            .setup()
            .roots
            .get(screen_num)
            .map(|screen| screen.root)
            .ok_or_else(|| ClipboardError::Backend(format!("screen {} not found", screen_num)))?;

        let selection = intern(&conn, selection_name)?;
        let utf8_string = intern(&conn, "UTF8_STRING")?;
        let incr = intern(&conn, "INCR")?;
        let transfer_property = intern(&conn, TRANSFER_PROPERTY)?;

        let window = conn.generate_id().map_err(ClipboardError::backend)?;
        conn.create_window(
            COPY_DEPTH_FROM_PARENT,
            window,
            root,
            0,
            0,
            100,
            100,
            0,
            WindowClass::INPUT_OUTPUT,
            COPY_FROM_PARENT,
            &CreateWindowAux::new(),
        )
        .map_err(ClipboardError::backend)?
        .check()
        .map_err(ClipboardError::backend)?;

        info!(
            "X11 selection proxy window 0x{:x} created for {} (screen {})",
            window, selection_name, screen_num
        );

        Ok(Self {
            conn,
            window,
            selection,
            utf8_string,
            incr,
            transfer_property,
        })
    }

    fn translate(&self, event: Event) -> Option<LocalEvent> {
        match event {
            Event::SelectionRequest(ev) if ev.owner == self.window => {
                trace!(
                    "SelectionRequest from 0x{:x}: target={} property={}",
                    ev.requestor,
                    ev.target,
                    ev.property
                );
                Some(LocalEvent::SelectionRequest(SelectionRequest {
                    requestor: ev.requestor,
                    selection: ev.selection,
                    target: ev.target,
                    property: ev.property,
                    time: ev.time,
                }))
            }
            Event::SelectionClear(ev) if ev.owner == self.window && ev.selection == self.selection => {
                Some(LocalEvent::SelectionClear)
            }
            Event::SelectionNotify(ev) if ev.requestor == self.window => Some(LocalEvent::SelectionNotify {
                property: none_to_option(ev.property),
            }),
            Event::Error(err) => {
                warn!("X11 error: {:?}", err);
                None
            }
            other => {
                trace!("Ignoring X11 event: {:?}", other);
                None
            }
        }
    }
}

fn intern(conn: &RustConnection, name: &str) -> ClipboardResult<Atom> {
    let atom = conn
        .intern_atom(false, name.as_bytes())
        .map_err(ClipboardError::backend)?
        .reply()
        .map_err(ClipboardError::backend)?
        .atom;
    if atom == NONE {
        return Err(ClipboardError::Backend(format!("unable to intern atom {}", name)));
    }
    Ok(atom)
}

impl SelectionBackend for X11Selection {
    fn utf8_target(&self) -> Atom {
        self.utf8_string
    }

    fn readiness_fd(&self) -> ClipboardResult<OwnedFd> {
        Ok(self.conn.stream().as_fd().try_clone_to_owned()?)
    }

    fn next_event(&mut self) -> ClipboardResult<Option<LocalEvent>> {
        while let Some(event) = self.conn.poll_for_event().map_err(ClipboardError::backend)? {
            if let Some(local) = self.translate(event) {
                return Ok(Some(local));
            }
        }
        Ok(None)
    }

    fn claim_selection(&mut self) -> ClipboardResult<()> {
        self.conn
            .set_selection_owner(self.window, self.selection, CURRENT_TIME)
            .map_err(ClipboardError::backend)?;
        self.conn.flush().map_err(ClipboardError::backend)?;
        debug!("Claimed selection {} for window 0x{:x}", self.selection, self.window);
        Ok(())
    }

    fn write_property(
        &mut self,
        requestor: WindowId,
        property: Atom,
        target: Atom,
        data: &[u8],
    ) -> ClipboardResult<()> {
        let max = self
            .conn
            .maximum_request_bytes()
            .saturating_sub(CHANGE_PROPERTY_OVERHEAD);
        if data.len() > max {
            return Err(ClipboardError::DataSizeExceeded {
                actual: data.len(),
                max,
            });
        }

        self.conn
            .change_property8(PropMode::REPLACE, requestor, property, target, data)
            .map_err(ClipboardError::backend)?;
        Ok(())
    }

    fn send_response(&mut self, response: &SelectionResponse) -> ClipboardResult<()> {
        let event = SelectionNotifyEvent {
            response_type: SELECTION_NOTIFY_EVENT,
            sequence: 0,
            time: response.time,
            requestor: response.requestor,
            selection: response.selection,
            target: response.target,
            property: response.property.unwrap_or(NONE),
        };
        self.conn
            .send_event(false, response.requestor, EventMask::NO_EVENT, event)
            .map_err(ClipboardError::backend)?;
        Ok(())
    }

    fn request_conversion(&mut self, target: Atom) -> ClipboardResult<()> {
        self.conn
            .convert_selection(
                self.window,
                self.selection,
                target,
                self.transfer_property,
                CURRENT_TIME,
            )
            .map_err(ClipboardError::backend)?;
        self.conn.flush().map_err(ClipboardError::backend)?;
        Ok(())
    }

    fn take_property(&mut self, property: Atom) -> ClipboardResult<Vec<u8>> {
        let reply = self
            .conn
            .get_property(true, self.window, property, AtomEnum::ANY, 0, u32::MAX / 4)
            .map_err(ClipboardError::backend)?
            .reply()
            .map_err(ClipboardError::backend)?;

        if reply.type_ == self.incr {
            return Err(ClipboardError::FormatConversion(
                "incremental selection transfers are not supported".into(),
            ));
        }
        Ok(reply.value)
    }

    fn flush(&mut self) -> ClipboardResult<()> {
        self.conn.flush().map_err(ClipboardError::backend)
    }
}

impl Drop for X11Selection {
    fn drop(&mut self) {
        debug!("Destroying X11 proxy window 0x{:x}", self.window);
        if let Err(e) = self.conn.destroy_window(self.window) {
            warn!("Failed to destroy proxy window: {}", e);
        }
        let _ = self.conn.flush();
    }
}
