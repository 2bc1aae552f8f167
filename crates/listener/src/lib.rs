//! # LIS Listener
//!
//! TCP server for single-result analyzers.
//!
//! Each accepted connection gets its own task. Every inbound message runs through format
//! detection, mapping and the upsert gateway from `lis-core`, and is answered with a single
//! byte: `0x06` (ACK) on success, `0x15` (NACK) on failure. Instruments are expected to retry
//! on NACK; the connection is kept open.
//!
//! By default one socket read is one message. Set `LIS_FRAMING=mllp` for instruments that wrap
//! messages in MLLP blocks, which are then reassembled across reads.

pub mod codec;
pub mod config;
mod session;

pub use codec::{MessageCodec, ACK, NACK};
pub use config::{Framing, ListenerConfig, TextEncoding};

use lis_core::IngestionService;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("invalid listener configuration: {0}")]
    InvalidConfig(String),
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

pub type ListenerResult<T> = std::result::Result<T, ListenerError>;

/// Bind the configured address and serve until `shutdown` resolves.
pub async fn run(
    cfg: ListenerConfig,
    service: IngestionService,
    shutdown: impl Future<Output = ()>,
) -> ListenerResult<()> {
    let listener = TcpListener::bind(cfg.addr)
        .await
        .map_err(|source| ListenerError::Bind {
            addr: cfg.addr,
            source,
        })?;
    tracing::info!("++ Listening for instruments on {}", cfg.addr);
    serve(listener, service, Arc::new(cfg), shutdown).await;
    Ok(())
}

/// Accept connections on `listener` until `shutdown` resolves.
///
/// Shutdown stops accepting; sessions already running are left to finish on their own.
pub async fn serve(
    listener: TcpListener,
    service: IngestionService,
    cfg: Arc<ListenerConfig>,
    shutdown: impl Future<Output = ()>,
) {
    tokio::pin!(shutdown);

    loop {
        tokio::select! {
            _ = &mut shutdown => {
                tracing::info!("listener shutting down");
                break;
            }
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    tracing::info!("instrument connected from {}", peer);
                    tokio::spawn(session::handle_connection(
                        stream,
                        peer,
                        service.clone(),
                        cfg.clone(),
                    ));
                }
                Err(e) => tracing::warn!("accept failed: {}", e),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lis_core::{
        CoreConfig, MemoryStore, RecordKey, ResultBody, ResultKind, ResultStore, StoreBackend,
    };
    use std::net::SocketAddr;
    use std::path::PathBuf;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpStream;
    use tokio::sync::oneshot;

    struct Harness {
        addr: SocketAddr,
        store: Arc<MemoryStore>,
        _shutdown: oneshot::Sender<()>,
    }

    async fn start(framing: Framing, idle_timeout: Duration) -> Harness {
        let core_cfg = Arc::new(
            CoreConfig::new(PathBuf::from("unused"), StoreBackend::Memory, "UNKNOWN".into())
                .expect("CoreConfig::new should succeed"),
        );
        let store = Arc::new(MemoryStore::new());
        let service = IngestionService::new(core_cfg, store.clone());

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let cfg = Arc::new(ListenerConfig {
            addr,
            idle_timeout,
            framing,
            ..ListenerConfig::default()
        });

        let (tx, rx) = oneshot::channel::<()>();
        tokio::spawn(serve(listener, service, cfg, async move {
            let _ = rx.await;
        }));

        Harness {
            addr,
            store,
            _shutdown: tx,
        }
    }

    async fn send_and_read_reply(stream: &mut TcpStream, payload: &[u8]) -> u8 {
        stream.write_all(payload).await.expect("write");
        let mut reply = [0u8; 1];
        stream.read_exact(&mut reply).await.expect("read reply");
        reply[0]
    }

    const CRP: &str = "MSH|^~\\&|FIA|ICHROMA-01\rPID|1||P-1||Nguyen^An||34|F\rOBR|1||BC-1\rOBX|1|NM|CRP^CRP||12,4|mg/L|0-10|H\r";

    #[tokio::test]
    async fn test_ack_then_nack_then_ack_on_one_connection() {
        let harness = start(Framing::PerRead, Duration::from_secs(5)).await;
        let mut stream = TcpStream::connect(harness.addr).await.expect("connect");

        assert_eq!(send_and_read_reply(&mut stream, CRP.as_bytes()).await, ACK);
        assert_eq!(
            send_and_read_reply(&mut stream, br#"{"result": {"bad": 1}}"#).await,
            NACK
        );
        assert_eq!(
            send_and_read_reply(&mut stream, br#"{"barcode":"BC-2","result":"4.2"}"#).await,
            ACK
        );

        let stored = harness
            .store
            .find_by_key(&RecordKey::new(ResultKind::Analyzer, "BC-1"))
            .expect("find")
            .expect("BC-1 stored");
        match stored.body {
            ResultBody::Analyzer(result) => {
                assert_eq!(result.result, "12.4");
                assert_eq!(result.device_id, "ICHROMA-01");
                assert_eq!(result.raw_message, CRP);
            }
            other => panic!("unexpected body {other:?}"),
        }
        assert!(harness
            .store
            .find_by_key(&RecordKey::new(ResultKind::Analyzer, "BC-2"))
            .expect("find")
            .is_some());
    }

    #[tokio::test]
    async fn test_message_without_value_is_acknowledged() {
        let harness = start(Framing::PerRead, Duration::from_secs(5)).await;
        let mut stream = TcpStream::connect(harness.addr).await.expect("connect");
        assert_eq!(
            send_and_read_reply(&mut stream, b"MSH|^~\\&|FIA|DEV\rOBR|1||BC-9\r").await,
            ACK
        );
        assert!(harness
            .store
            .find_by_key(&RecordKey::new(ResultKind::Analyzer, "BC-9"))
            .expect("find")
            .is_none());
    }

    #[tokio::test]
    async fn test_mllp_reassembles_split_and_batched_messages() {
        let harness = start(Framing::Mllp, Duration::from_secs(5)).await;
        let mut stream = TcpStream::connect(harness.addr).await.expect("connect");

        // One message split across two writes.
        stream
            .write_all(b"\x0bMSH|^~\\&|FIA|DEV\rOBR|1||BC-10\r")
            .await
            .expect("write first half");
        stream.flush().await.expect("flush");
        tokio::time::sleep(Duration::from_millis(50)).await;
        stream
            .write_all(b"OBX|1|NM|CRP^CRP||3,3|mg/L\r\x1c\x0d")
            .await
            .expect("write second half");
        let mut reply = [0u8; 1];
        stream.read_exact(&mut reply).await.expect("read reply");
        assert_eq!(reply[0], ACK);

        // Two messages in one write.
        stream
            .write_all(
                b"\x0b{\"barcode\":\"BC-11\",\"result\":\"1\"}\x1c\x0d\x0b{\"barcode\":\"BC-12\",\"result\":\"2\"}\x1c\x0d",
            )
            .await
            .expect("write batch");
        let mut replies = [0u8; 2];
        stream.read_exact(&mut replies).await.expect("read replies");
        assert_eq!(replies, [ACK, ACK]);

        for barcode in ["BC-10", "BC-11", "BC-12"] {
            assert!(
                harness
                    .store
                    .find_by_key(&RecordKey::new(ResultKind::Analyzer, barcode))
                    .expect("find")
                    .is_some(),
                "{barcode} should be stored"
            );
        }
    }

    #[tokio::test]
    async fn test_idle_connection_is_closed() {
        let harness = start(Framing::PerRead, Duration::from_millis(100)).await;
        let mut stream = TcpStream::connect(harness.addr).await.expect("connect");

        let mut buf = [0u8; 1];
        let read = tokio::time::timeout(Duration::from_secs(5), stream.read(&mut buf))
            .await
            .expect("server should close before the test timeout")
            .expect("read");
        assert_eq!(read, 0);
    }

    #[tokio::test]
    async fn test_shutdown_stops_accepting() {
        let core_cfg = Arc::new(
            CoreConfig::new(PathBuf::from("unused"), StoreBackend::Memory, "UNKNOWN".into())
                .expect("CoreConfig::new should succeed"),
        );
        let service = IngestionService::new(core_cfg, Arc::new(MemoryStore::new()));
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let cfg = Arc::new(ListenerConfig::default());

        let (tx, rx) = oneshot::channel::<()>();
        let server = tokio::spawn(serve(listener, service, cfg, async move {
            let _ = rx.await;
        }));
        tx.send(()).expect("signal shutdown");

        tokio::time::timeout(Duration::from_secs(5), server)
            .await
            .expect("listener should stop")
            .expect("listener task");
    }
}
