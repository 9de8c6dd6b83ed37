//! Cross-thread signal and multiplexed wait.
//!
//! [`EventSignal`] is a level-triggered flag backed by a socket pair, so it
//! can be waited on together with the X11 connection in a single `poll(2)`.

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use std::io::{self, Read, Write};
use std::os::fd::{AsFd, BorrowedFd};
use std::os::unix::net::UnixStream;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

/// A named, pollable signal
#[derive(Debug)]
pub struct EventSignal {
    name: &'static str,
    set: AtomicBool,
    reader: UnixStream,
    writer: UnixStream,
}

impl EventSignal {
    /// Create a new unsignalled signal
    pub fn new(name: &'static str) -> io::Result<Self> {
        let (reader, writer) = UnixStream::pair()?;
        reader.set_nonblocking(true)?;
        writer.set_nonblocking(true)?;
        Ok(Self {
            name,
            set: AtomicBool::new(false),
            reader,
            writer,
        })
    }

    /// Signal name, for logging
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Set the signal and wake any waiter
    pub fn signal(&self) {
        self.set.store(true, Ordering::SeqCst);
        // A full socket buffer is already readable, so WouldBlock is fine
        let _ = (&self.writer).write(&[1]);
    }

    /// True once [`signal`](Self::signal) has been called and not reset
    pub fn is_signaled(&self) -> bool {
        self.set.load(Ordering::SeqCst)
    }

    /// Clear the signal.
    ///
    /// Pending wake-ups are drained before the flag is cleared; a `signal()`
    /// racing with this call leaves the descriptor readable.
    pub fn reset(&self) {
        let mut buf = [0u8; 64];
        loop {
            match (&self.reader).read(&mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(_) => break,
            }
        }
        self.set.store(false, Ordering::SeqCst);
    }

    fn poll_fd(&self) -> BorrowedFd<'_> {
        self.reader.as_fd()
    }
}

/// Block until any signal is set or `fd` becomes readable.
///
/// `timeout` of `None` waits indefinitely. Returns `Ok(false)` on timeout.
pub fn wait_any(
    signals: &[&EventSignal],
    fd: Option<BorrowedFd<'_>>,
    timeout: Option<Duration>,
) -> io::Result<bool> {
    if signals.iter().any(|s| s.is_signaled()) {
        return Ok(true);
    }

    let mut fds: Vec<PollFd<'_>> = signals
        .iter()
        .map(|s| PollFd::new(s.poll_fd(), PollFlags::POLLIN))
        .collect();
    if let Some(fd) = fd {
        fds.push(PollFd::new(fd, PollFlags::POLLIN));
    }

    let timeout = match timeout {
        None => PollTimeout::NONE,
        Some(d) => PollTimeout::from(u16::try_from(d.as_millis()).unwrap_or(u16::MAX)),
    };

    loop {
        match poll(&mut fds, timeout) {
            Ok(ready) => return Ok(ready > 0),
            Err(Errno::EINTR) => continue,
            Err(e) => return Err(io::Error::from(e)),
        }
    }
}
