//! One instrument connection.

use crate::codec::{MessageCodec, ACK, NACK};
use crate::config::ListenerConfig;
use futures::{SinkExt, StreamExt};
use lis_core::{IngestError, IngestionService, StoredResult};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio_util::codec::Framed;

#[derive(Debug, thiserror::Error)]
enum MessageError {
    #[error(transparent)]
    Ingest(#[from] IngestError),
    #[error("ingestion task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

/// Serve one connection until the instrument disconnects, the connection idles out, or a
/// read/write fails.
///
/// Messages are handled strictly in order: the acknowledgment for one message is written
/// before the next is read. A failed message is answered with NACK and the connection stays
/// open so the instrument can retry.
pub(crate) async fn handle_connection(
    stream: TcpStream,
    peer: SocketAddr,
    service: IngestionService,
    cfg: Arc<ListenerConfig>,
) {
    let mut framed = Framed::new(
        stream,
        MessageCodec::new(cfg.framing, cfg.max_message_bytes),
    );

    loop {
        let message = match tokio::time::timeout(cfg.idle_timeout, framed.next()).await {
            Err(_) => {
                tracing::info!("closing idle connection from {}", peer);
                break;
            }
            Ok(None) => {
                tracing::info!("instrument {} disconnected", peer);
                break;
            }
            Ok(Some(Err(e))) => {
                tracing::warn!("read from {} failed: {}", peer, e);
                break;
            }
            Ok(Some(Ok(message))) => message,
        };

        let text = cfg.encoding.decode(&message);
        let reply = match ingest(&service, text).await {
            Ok(Some(saved)) => {
                tracing::info!("message from {} stored as {}", peer, saved.id);
                ACK
            }
            Ok(None) => ACK,
            Err(e) => {
                tracing::error!("message from {} rejected: {}", peer, e);
                NACK
            }
        };

        if let Err(e) = framed.send(reply).await {
            tracing::warn!("acknowledgment to {} failed: {}", peer, e);
            break;
        }
    }
}

async fn ingest(
    service: &IngestionService,
    text: String,
) -> Result<Option<StoredResult>, MessageError> {
    let service = service.clone();
    let saved = tokio::task::spawn_blocking(move || service.ingest_single(&text)).await??;
    Ok(saved)
}
