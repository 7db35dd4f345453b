use super::codec::{CodecError, FrameCipher};
use super::Inbound;
use crate::message::Message;
use crate::types::NodeId;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use thiserror::Error;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};
use tracing::{debug, warn};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(5);

static NEXT_CONN_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) type Reader = FramedRead<OwnedReadHalf, LengthDelimitedCodec>;
pub(crate) type Writer = FramedWrite<OwnedWriteHalf, LengthDelimitedCodec>;

#[derive(Debug, Error)]
pub enum LinkError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),

    #[error("codec: {0}")]
    Codec(#[from] CodecError),

    #[error("handshake rejected: {0}")]
    Handshake(String),

    #[error("handshake timed out")]
    Timeout,

    #[error("connection closed during handshake")]
    Closed,
}

/// Everything a link task needs from its node.
#[derive(Debug, Clone)]
pub(crate) struct LinkContext {
    pub id: NodeId,
    pub cluster_size: usize,
    pub cipher: FrameCipher,
    pub max_frame_len: usize,
    pub inbound: mpsc::Sender<Inbound>,
    pub shutdown: watch::Receiver<bool>,
}

fn framed(stream: TcpStream, max_frame_len: usize) -> (Reader, Writer) {
    let (r, w) = stream.into_split();
    let codec = || {
        LengthDelimitedCodec::builder()
            .max_frame_length(max_frame_len)
            .new_codec()
    };
    (FramedRead::new(r, codec()), FramedWrite::new(w, codec()))
}

/// Exchanges `Hello` frames and returns the peer's id together with the
/// framed halves of the connection.
pub(crate) async fn establish(
    stream: TcpStream,
    ctx: &LinkContext,
) -> Result<(NodeId, Reader, Writer), LinkError> {
    stream.set_nodelay(true)?;
    let (mut reader, mut writer) = framed(stream, ctx.max_frame_len);

    let hello = Message::Hello {
        id: ctx.id,
        cluster_size: ctx.cluster_size as u64,
    };
    writer.send(ctx.cipher.seal(&hello)?).await?;

    let frame = match tokio::time::timeout(HANDSHAKE_TIMEOUT, reader.next()).await {
        Err(_) => return Err(LinkError::Timeout),
        Ok(None) => return Err(LinkError::Closed),
        Ok(Some(frame)) => frame?,
    };

    match ctx.cipher.open(&frame)? {
        Message::Hello { id, cluster_size } => {
            if id == 0 || id == ctx.id {
                return Err(LinkError::Handshake(format!("peer claims id {}", id)));
            }
            if cluster_size != ctx.cluster_size as u64 {
                return Err(LinkError::Handshake(format!(
                    "peer {} runs a cluster of {}, expected {}",
                    id, cluster_size, ctx.cluster_size
                )));
            }
            Ok((id, reader, writer))
        }
        other => Err(LinkError::Handshake(format!(
            "expected hello, got {}",
            other.kind()
        ))),
    }
}

/// Registers an established link with the processing loop and pumps frames
/// until either side closes. Always reports the disconnect.
pub(crate) async fn serve(
    peer: NodeId,
    dialed_by: NodeId,
    reader: Reader,
    writer: Writer,
    mut ctx: LinkContext,
) -> Result<(), LinkError> {
    let conn_id = NEXT_CONN_ID.fetch_add(1, Ordering::Relaxed);
    let (tx, rx) = mpsc::unbounded_channel();

    let connected = Inbound::Connected {
        peer,
        conn_id,
        dialed_by,
        sender: tx,
    };
    if ctx.inbound.send(connected).await.is_err() {
        return Ok(());
    }
    debug!("node {} linked to peer {} (conn {})", ctx.id, peer, conn_id);

    let result = pump(peer, reader, writer, rx, &mut ctx).await;
    if let Err(e) = &result {
        warn!("node {} link to peer {} failed: {}", ctx.id, peer, e);
    }

    let _ = ctx.inbound.send(Inbound::Disconnected { peer, conn_id }).await;
    result
}

async fn pump(
    peer: NodeId,
    mut reader: Reader,
    mut writer: Writer,
    mut outbound: mpsc::UnboundedReceiver<Message>,
    ctx: &mut LinkContext,
) -> Result<(), LinkError> {
    if *ctx.shutdown.borrow() {
        return Ok(());
    }

    loop {
        tokio::select! {
            _ = ctx.shutdown.changed() => return Ok(()),
            out = outbound.recv() => match out {
                Some(message) => writer.send(ctx.cipher.seal(&message)?).await?,
                None => return Ok(()),
            },
            frame = reader.next() => match frame {
                Some(frame) => {
                    let message = ctx.cipher.open(&frame?)?;
                    if let Message::Hello { .. } = message {
                        continue;
                    }
                    let inbound = Inbound::Message { peer, message };
                    if ctx.inbound.send(inbound).await.is_err() {
                        return Ok(());
                    }
                }
                None => return Ok(()),
            },
        }
    }
}
