//! CLIPRDR channel adapter
//!
//! Routes inbound clipboard PDUs into the [`ClipboardBridge`] callbacks and
//! carries the bridge's outbound PDUs back onto the channel.

use crate::clipboard::bridge::{ClipboardBridge, PacketSender};
use crate::clipboard::error::{ClipboardError, ClipboardResult};
use crate::clipboard::pdu::{msg_flags, ClipboardPdu, MessageType};
use crate::config::Config;
use crate::rdp::codec::CliprdrCodec;
use anyhow::{Context, Result};
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use std::future::Future;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, error, info, warn};

/// [`PacketSender`] feeding the channel writer task
#[derive(Debug, Clone)]
pub struct ChannelSender {
    tx: mpsc::UnboundedSender<ClipboardPdu>,
}

impl ChannelSender {
    /// Create a sender and the receiver the writer drains
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<ClipboardPdu>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }
}

impl PacketSender for ChannelSender {
    fn send_packet(&self, msg_type: MessageType, msg_flags: u16, payload: &[u8]) -> ClipboardResult<()> {
        self.tx
            .send(ClipboardPdu::new(msg_type, msg_flags, Bytes::copy_from_slice(payload)))
            .map_err(|_| ClipboardError::ChannelSend)
    }
}

/// A clipboard channel bound to a bridge session
pub struct CliprdrChannel {
    bridge: ClipboardBridge,
    sender: Arc<dyn PacketSender>,
}

impl std::fmt::Debug for CliprdrChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CliprdrChannel")
            .field("bridge", &self.bridge)
            .finish_non_exhaustive()
    }
}

impl CliprdrChannel {
    /// Bind `bridge` to the channel; `sender` must be the bridge's sender
    pub fn new(bridge: ClipboardBridge, sender: Arc<dyn PacketSender>) -> Self {
        Self { bridge, sender }
    }

    /// Bridge session
    pub fn bridge(&self) -> &ClipboardBridge {
        &self.bridge
    }

    /// Route one inbound PDU
    pub fn dispatch(&self, pdu: &ClipboardPdu) -> ClipboardResult<()> {
        debug!(
            "Clipboard PDU {:?} flags=0x{:x} len={}",
            pdu.msg_type,
            pdu.msg_flags,
            pdu.data.len()
        );

        match pdu.msg_type {
            MessageType::MonitorReady => self.bridge.sync(),
            MessageType::FormatList => {
                let result = self.bridge.on_format_list(pdu.msg_flags, &pdu.data);
                let flags = if result.is_ok() {
                    msg_flags::CB_RESPONSE_OK
                } else {
                    msg_flags::CB_RESPONSE_FAIL
                };
                self.sender
                    .send_packet(MessageType::FormatListResponse, flags, &[])?;
                result
            }
            MessageType::FormatListResponse => {
                if pdu.is_fail() {
                    warn!("Remote rejected our format list");
                }
                Ok(())
            }
            MessageType::FormatDataRequest => self.bridge.on_data_request(pdu.msg_flags, &pdu.data),
            MessageType::FormatDataResponse => self.bridge.on_data_response(pdu.msg_flags, &pdu.data),
            MessageType::ClipCaps => self.bridge.on_capabilities(pdu.msg_flags, &pdu.data),
            other => {
                debug!("Unsupported clipboard PDU {:?}", other);
                Ok(())
            }
        }
    }

    /// Stop the bridge session. Returns `true` if its thread exited in time.
    pub fn close(self) -> bool {
        self.bridge.destroy()
    }
}

/// Pump `reader` into the channel and outbound PDUs onto `writer`.
///
/// Inbound PDUs are dispatched on the blocking pool, one at a time, since
/// they contend for the bridge lock with the event thread. Returns when the
/// reader hits EOF or fails, or `shutdown` completes. The channel is closed
/// before returning.
pub async fn run_channel<R, W, S>(
    channel: CliprdrChannel,
    mut outbound: mpsc::UnboundedReceiver<ClipboardPdu>,
    reader: R,
    writer: W,
    max_pdu_size: usize,
    shutdown: S,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    S: Future<Output = ()>,
{
    let channel = Arc::new(channel);
    let mut frames = FramedRead::new(reader, CliprdrCodec::new(max_pdu_size));
    let mut sink = FramedWrite::new(writer, CliprdrCodec::new(max_pdu_size));
    tokio::pin!(shutdown);

    let result = loop {
        tokio::select! {
            frame = frames.next() => match frame {
                Some(Ok(pdu)) => {
                    let msg_type = pdu.msg_type;
                    let target = Arc::clone(&channel);
                    match tokio::task::spawn_blocking(move || target.dispatch(&pdu)).await {
                        Ok(Ok(())) => {}
                        Ok(Err(e)) if e.is_recoverable() => {
                            debug!("Clipboard PDU {:?} not handled: {}", msg_type, e);
                        }
                        Ok(Err(e)) => warn!("Clipboard PDU {:?} failed: {}", msg_type, e),
                        Err(e) => {
                            break Err(anyhow::Error::new(e).context("Clipboard dispatch panicked"));
                        }
                    }
                }
                Some(Err(e)) => {
                    error!("Clipboard channel read failed: {}", e);
                    break Err(anyhow::Error::new(e).context("Clipboard channel read failed"));
                }
                None => {
                    info!("Clipboard channel closed");
                    break Ok(());
                }
            },
            Some(pdu) = outbound.recv() => {
                if let Err(e) = sink.send(pdu).await {
                    break Err(anyhow::Error::new(e).context("Clipboard channel write failed"));
                }
            }
            () = &mut shutdown => {
                info!("Shutdown requested");
                break Ok(());
            }
        }
    };

    while let Ok(pdu) = outbound.try_recv() {
        if let Err(e) = sink.send(pdu).await {
            debug!("Dropping outbound clipboard PDU: {}", e);
            break;
        }
    }

    let exited = tokio::task::spawn_blocking(move || match Arc::try_unwrap(channel) {
        Ok(channel) => channel.close(),
        // The last reference shuts the bridge down on drop
        Err(_) => false,
    })
    .await
    .context("Clipboard bridge teardown panicked")?;
    if !exited {
        warn!("Clipboard bridge detached from a running event thread");
    }

    result
}

/// Run the bridge over stdin/stdout until EOF or Ctrl-C
pub async fn run_stdio(config: &Config) -> Result<()> {
    let (sender, outbound) = ChannelSender::channel();
    let sender: Arc<dyn PacketSender> = Arc::new(sender);

    let bridge = ClipboardBridge::create(&config.bridge, Arc::clone(&sender))
        .context("Failed to start clipboard bridge")?;
    let channel = CliprdrChannel::new(bridge, sender);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    run_channel(
        channel,
        outbound,
        tokio::io::stdin(),
        tokio::io::stdout(),
        config.channel.max_pdu_size,
        shutdown,
    )
    .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clipboard::pdu::{encode_capabilities, encode_data_request, encode_format_list};
    use crate::clipboard::{CF_TEXT, CF_UNICODETEXT};
    use crate::config::BridgeConfig;
    use bytes::BytesMut;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Condvar, Mutex};
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio_util::codec::Decoder;

    fn degraded_channel() -> (CliprdrChannel, mpsc::UnboundedReceiver<ClipboardPdu>) {
        let config = BridgeConfig {
            shutdown_poll_interval_ms: 10,
            ..BridgeConfig::default()
        };
        let (sender, outbound) = ChannelSender::channel();
        let sender: Arc<dyn PacketSender> = Arc::new(sender);
        let bridge = ClipboardBridge::with_backend(&config, None, Arc::clone(&sender)).unwrap();
        (CliprdrChannel::new(bridge, sender), outbound)
    }

    /// Sender that blocks until the test opens its gate
    struct GatedSender {
        inner: ChannelSender,
        gate: Arc<(Mutex<bool>, Condvar)>,
        timed_out: AtomicBool,
    }

    impl PacketSender for GatedSender {
        fn send_packet(&self, msg_type: MessageType, msg_flags: u16, payload: &[u8]) -> ClipboardResult<()> {
            let (open, cvar) = &*self.gate;
            let guard = open.lock().unwrap();
            let (_guard, wait) = cvar
                .wait_timeout_while(guard, Duration::from_secs(2), |open| !*open)
                .unwrap();
            if wait.timed_out() {
                self.timed_out.store(true, Ordering::SeqCst);
            }
            self.inner.send_packet(msg_type, msg_flags, payload)
        }
    }

    #[tokio::test]
    async fn test_monitor_ready_announces_formats() {
        let (channel, mut outbound) = degraded_channel();
        channel
            .dispatch(&ClipboardPdu::new(MessageType::MonitorReady, 0, Bytes::new()))
            .unwrap();

        let pdu = outbound.recv().await.unwrap();
        assert_eq!(pdu.msg_type, MessageType::FormatList);
        assert_eq!(pdu.data, encode_format_list(&[CF_UNICODETEXT, CF_TEXT]));
        assert!(channel.close());
    }

    #[tokio::test]
    async fn test_format_list_acknowledged() {
        let (channel, mut outbound) = degraded_channel();
        channel
            .dispatch(&ClipboardPdu::new(MessageType::FormatList, 0, encode_format_list(&[CF_TEXT])))
            .unwrap();
        let ack = outbound.recv().await.unwrap();
        assert_eq!(ack.msg_type, MessageType::FormatListResponse);
        assert_eq!(ack.msg_flags, msg_flags::CB_RESPONSE_OK);
        assert_eq!(channel.bridge().snapshot().advertised, vec![CF_TEXT]);

        assert!(channel
            .dispatch(&ClipboardPdu::new(MessageType::FormatList, 0, vec![0u8; 37]))
            .is_err());
        let nack = outbound.recv().await.unwrap();
        assert!(nack.is_fail());
        assert_eq!(channel.bridge().snapshot().advertised, vec![CF_TEXT]);
        channel.close();
    }

    #[tokio::test]
    async fn test_degraded_data_request_fails() {
        let (channel, mut outbound) = degraded_channel();
        assert!(channel
            .dispatch(&ClipboardPdu::new(
                MessageType::FormatDataRequest,
                0,
                encode_data_request(CF_UNICODETEXT)
            ))
            .is_err());
        let pdu = outbound.recv().await.unwrap();
        assert_eq!(pdu.msg_type, MessageType::FormatDataResponse);
        assert!(pdu.is_fail());
        channel.close();
    }

    #[tokio::test]
    async fn test_run_channel_over_stream() {
        let (channel, outbound) = degraded_channel();
        let (mut client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);

        let task = tokio::spawn(run_channel(
            channel,
            outbound,
            server_read,
            server_write,
            1024,
            std::future::pending::<()>(),
        ));

        let mut codec = CliprdrCodec::new(1024);
        let mut buf = BytesMut::new();
        for pdu in [
            ClipboardPdu::new(MessageType::ClipCaps, 0, encode_capabilities()),
            ClipboardPdu::new(MessageType::MonitorReady, 0, Bytes::new()),
        ] {
            pdu.encode(&mut buf).unwrap();
        }
        client.write_all(&buf).await.unwrap();

        let mut received = Vec::new();
        let mut inbound = BytesMut::new();
        while received.len() < 2 {
            let mut chunk = [0u8; 256];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            inbound.extend_from_slice(&chunk[..n]);
            while let Some(pdu) = codec.decode(&mut inbound).unwrap() {
                received.push(pdu.msg_type);
            }
        }
        assert_eq!(received, vec![MessageType::ClipCaps, MessageType::FormatList]);

        client.shutdown().await.unwrap();
        drop(client);
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_blocked_dispatch_leaves_runtime_running() {
        let (inner, outbound) = ChannelSender::channel();
        let gate = Arc::new((Mutex::new(false), Condvar::new()));
        let sender = Arc::new(GatedSender {
            inner,
            gate: Arc::clone(&gate),
            timed_out: AtomicBool::new(false),
        });
        let config = BridgeConfig {
            shutdown_poll_interval_ms: 10,
            ..BridgeConfig::default()
        };
        let bridge =
            ClipboardBridge::with_backend(&config, None, Arc::clone(&sender) as Arc<dyn PacketSender>).unwrap();
        let channel = CliprdrChannel::new(bridge, Arc::clone(&sender) as Arc<dyn PacketSender>);

        let (mut client, server) = tokio::io::duplex(4096);
        let (server_read, server_write) = tokio::io::split(server);
        let task = tokio::spawn(run_channel(
            channel,
            outbound,
            server_read,
            server_write,
            1024,
            std::future::pending::<()>(),
        ));
        let opener = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            let (open, cvar) = &*gate;
            *open.lock().unwrap() = true;
            cvar.notify_all();
        });

        let mut buf = BytesMut::new();
        ClipboardPdu::new(MessageType::MonitorReady, 0, Bytes::new())
            .encode(&mut buf)
            .unwrap();
        client.write_all(&buf).await.unwrap();

        let mut codec = CliprdrCodec::new(1024);
        let mut inbound = BytesMut::new();
        let pdu = loop {
            if let Some(pdu) = codec.decode(&mut inbound).unwrap() {
                break pdu;
            }
            let mut chunk = [0u8; 256];
            let n = client.read(&mut chunk).await.unwrap();
            assert!(n > 0);
            inbound.extend_from_slice(&chunk[..n]);
        };
        assert_eq!(pdu.msg_type, MessageType::FormatList);
        opener.await.unwrap();
        assert!(!sender.timed_out.load(Ordering::SeqCst));

        client.shutdown().await.unwrap();
        drop(client);
        task.await.unwrap().unwrap();
    }
}
