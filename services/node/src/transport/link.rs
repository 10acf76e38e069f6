//! Connection plumbing: framing, identity exchange, reader and writer tasks.
//!
//! Every connection carries length-delimited frames. The first frame each
//! side sends is its own identity; after that every frame is one encoded
//! [`shoal_wire::InternalPacket`].
//!
//! Each link owns one reader task and one writer task. The writer drains a
//! bounded queue, so a peer that stops reading only ever stalls its own
//! writer.

use std::time::Duration;

use bytes::{Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use shoal_id::NodeIdentity;
use shoal_wire::InternalPacket;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

use super::TransportError;

/// Largest accepted frame.
pub const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

pub(crate) type FrameReader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub(crate) type FrameWriter = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

/// Events reader tasks report to the IO loop.
#[derive(Debug)]
pub(crate) enum LinkEvent {
    Frame {
        link_id: u64,
        peer: NodeIdentity,
        frame: BytesMut,
    },
    Closed {
        link_id: u64,
        peer: NodeIdentity,
    },
    WriteFailed {
        link_id: u64,
        peer: NodeIdentity,
        packet: InternalPacket,
        error: TransportError,
    },
}

/// An encoded frame waiting in a link's send queue. The packet is kept for
/// failure reports.
#[derive(Debug)]
pub(crate) struct Outgoing {
    pub(crate) frame: Bytes,
    pub(crate) packet: InternalPacket,
}

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Splits `address` (`tcp://host:port`) into a socket address string.
pub fn parse_address(address: &str) -> Result<String, TransportError> {
    let rest = address
        .strip_prefix("tcp://")
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;

    let (host, port) = rest
        .rsplit_once(':')
        .ok_or_else(|| TransportError::InvalidAddress(address.to_string()))?;

    if host.is_empty() || port.parse::<u16>().is_err() {
        return Err(TransportError::InvalidAddress(address.to_string()));
    }

    Ok(rest.to_string())
}

/// Sends our identity and reads the peer's.
pub(crate) async fn exchange_identity(
    stream: TcpStream,
    local: &NodeIdentity,
    address: &str,
    timeout: Duration,
) -> Result<(NodeIdentity, FrameReader, FrameWriter), TransportError> {
    let _ = stream.set_nodelay(true);
    let (read_half, write_half) = stream.into_split();
    let mut reader = FramedRead::new(read_half, codec());
    let mut writer = FramedWrite::new(write_half, codec());

    let failed = |reason: String| TransportError::IdentityExchange {
        address: address.to_string(),
        reason,
    };

    writer.send(local.to_bytes()).await.map_err(|e| failed(e.to_string()))?;

    let frame = tokio::time::timeout(timeout, reader.next())
        .await
        .map_err(|_| failed(format!("no identity within {timeout:?}")))?;

    match frame {
        Some(Ok(bytes)) if !bytes.is_empty() => {
            Ok((NodeIdentity::from_bytes(bytes.freeze()), reader, writer))
        }
        Some(Ok(_)) => Err(failed("empty identity".to_string())),
        Some(Err(e)) => Err(failed(e.to_string())),
        None => Err(failed("connection closed".to_string())),
    }
}

/// Forwards every frame of one link to the IO loop until the link closes.
pub(crate) fn spawn_reader(
    link_id: u64,
    peer: NodeIdentity,
    mut reader: FrameReader,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(next) = reader.next().await {
            match next {
                Ok(frame) => {
                    let event = LinkEvent::Frame {
                        link_id,
                        peer: peer.clone(),
                        frame,
                    };
                    if events.send(event).is_err() {
                        return;
                    }
                }
                Err(e) => {
                    debug!(peer = %peer, link_id, error = %e, "Link read failed");
                    break;
                }
            }
        }

        let _ = events.send(LinkEvent::Closed { link_id, peer });
    })
}

/// Writes queued frames to one link until the queue closes.
///
/// A write that fails or stalls past `write_timeout` ends the task. The
/// failed packet and everything still queued are reported back as
/// [`LinkEvent::WriteFailed`].
pub(crate) fn spawn_writer(
    link_id: u64,
    peer: NodeIdentity,
    mut writer: FrameWriter,
    mut queue: mpsc::Receiver<Outgoing>,
    write_timeout: Duration,
    events: mpsc::UnboundedSender<LinkEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(Outgoing { frame, packet }) = queue.recv().await {
            let error = match tokio::time::timeout(write_timeout, writer.send(frame)).await {
                Ok(Ok(())) => continue,
                Ok(Err(e)) => TransportError::from(e),
                Err(_) => TransportError::WriteTimeout {
                    peer: peer.clone(),
                    timeout: write_timeout,
                },
            };

            warn!(peer = %peer, link_id, error = %error, "Link write failed");
            let reason = error.to_string();
            let _ = events.send(LinkEvent::WriteFailed {
                link_id,
                peer: peer.clone(),
                packet,
                error,
            });

            queue.close();
            while let Some(rest) = queue.recv().await {
                let _ = events.send(LinkEvent::WriteFailed {
                    link_id,
                    peer: peer.clone(),
                    packet: rest.packet,
                    error: TransportError::LinkFailed {
                        peer: peer.clone(),
                        reason: reason.clone(),
                    },
                });
            }
            return;
        }
    })
}
