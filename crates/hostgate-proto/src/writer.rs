//! Writer task shared by both ends of a tunnel
//!
//! Every task that wants to send on a connection queues a `Packet`; a single
//! writer owns the write half so frames are never interleaved.

use crate::codec::PacketCodec;
use crate::messages::Packet;
use futures::SinkExt;
use tokio::io::AsyncWrite;
use tokio::sync::mpsc;
use tokio_util::codec::FramedWrite;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace};

/// Drain `outbound` into `writer` until the queue closes, a write fails, or
/// `shutdown` is cancelled. A write failure cancels `shutdown` so the rest of
/// the connection tears down with it.
pub async fn run_packet_writer<W>(
    writer: W,
    mut outbound: mpsc::Receiver<Packet>,
    codec: PacketCodec,
    shutdown: CancellationToken,
    label: String,
) where
    W: AsyncWrite + Unpin,
{
    let mut sink = FramedWrite::new(writer, codec);

    loop {
        tokio::select! {
            _ = shutdown.cancelled() => break,
            packet = outbound.recv() => {
                let Some(packet) = packet else { break };
                let kind = packet.kind();
                if let Err(e) = sink.send(packet).await {
                    error!("[{}] Failed to write {} packet: {}", label, kind, e);
                    break;
                }
                trace!("[{}] Wrote {} packet", label, kind);
            }
        }
    }

    shutdown.cancel();
    debug!("[{}] Writer task ended", label);
}
