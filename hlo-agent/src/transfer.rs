//! Node-to-node range transfers.
//!
//! Transfers ride the main service port, which in this subsystem carries
//! nothing else. The pushing side copies the range out of its store,
//! streams one batch frame, and waits for a confirmation byte:
//!
//! ```text
//! +------------+----------------------------------------------+
//! | count 4B BE| count times: klen 4B | key | vlen 4B | value |
//! +------------+----------------------------------------------+
//! ```
//!
//! A push to an unreachable peer is not an error for the command that
//! asked for it: the pusher reports the peer to the coordinator's
//! failure port and confirms the command as executed. The local copy is
//! only dropped after the peer acknowledged the batch.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use hlo_core::{HaloError, KeyRange, NodeAddr, Result};
use hlo_net::{send_report, AdminMessage, ChannelConfig, Confirmation};

use crate::store::RangeStore;

/// Upper bound on one key in a transfer batch.
pub const MAX_KEY_LEN: usize = 64 * 1024;

/// Upper bound on one value in a transfer batch.
pub const MAX_VALUE_LEN: usize = 16 * 1024 * 1024;

/// Upper bound on the entry count field.
pub const MAX_BATCH_ENTRIES: usize = 1024 * 1024;

pub(crate) fn encode_batch(pairs: &[(String, String)]) -> Bytes {
    let body: usize = pairs.iter().map(|(k, v)| 8 + k.len() + v.len()).sum();
    let mut buf = BytesMut::with_capacity(4 + body);
    buf.put_u32(pairs.len() as u32);
    for (key, value) in pairs {
        buf.put_u32(key.len() as u32);
        buf.put_slice(key.as_bytes());
        buf.put_u32(value.len() as u32);
        buf.put_slice(value.as_bytes());
    }
    buf.freeze()
}

async fn read_batch(stream: &mut TcpStream, config: &ChannelConfig) -> Result<Vec<(String, String)>> {
    match tokio::time::timeout(config.confirm_timeout, read_batch_inner(stream)).await {
        Ok(result) => result,
        Err(_) => Err(HaloError::Timeout("batch read")),
    }
}

async fn read_batch_inner(stream: &mut TcpStream) -> Result<Vec<(String, String)>> {
    let count = read_u32(stream).await? as usize;
    if count > MAX_BATCH_ENTRIES {
        return Err(HaloError::Protocol(format!(
            "batch count {count} exceeds limit {MAX_BATCH_ENTRIES}"
        )));
    }
    let mut pairs = Vec::with_capacity(count);
    for _ in 0..count {
        let key = read_string(stream, MAX_KEY_LEN, "key").await?;
        let value = read_string(stream, MAX_VALUE_LEN, "value").await?;
        pairs.push((key, value));
    }
    Ok(pairs)
}

async fn read_u32(stream: &mut TcpStream) -> Result<u32> {
    let mut raw = [0u8; 4];
    stream.read_exact(&mut raw).await?;
    Ok(u32::from_be_bytes(raw))
}

async fn read_string(stream: &mut TcpStream, limit: usize, what: &str) -> Result<String> {
    let len = read_u32(stream).await? as usize;
    if len > limit {
        return Err(HaloError::Protocol(format!(
            "{what} length {len} exceeds limit {limit}"
        )));
    }
    let mut raw = vec![0u8; len];
    stream.read_exact(&mut raw).await?;
    String::from_utf8(raw)
        .map_err(|_| HaloError::Protocol(format!("{what} is not valid UTF-8")))
}

/// Push one batch to a peer's main port and await its acknowledgement.
///
/// # Errors
///
/// Connect, transport and protocol failures; also `Rejected` if the
/// peer refused the batch.
pub async fn push_batch(
    addr: SocketAddr,
    pairs: &[(String, String)],
    config: &ChannelConfig,
) -> Result<()> {
    let frame = encode_batch(pairs);
    let mut stream = match tokio::time::timeout(config.connect_timeout, TcpStream::connect(addr))
        .await
    {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(HaloError::Timeout("transfer connect")),
    };
    stream.set_nodelay(true)?;

    match tokio::time::timeout(config.confirm_timeout, stream.write_all(&frame)).await {
        Ok(Ok(())) => {},
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(HaloError::Timeout("batch write")),
    }

    let raw = match tokio::time::timeout(config.confirm_timeout, async {
        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.map(|_| byte[0])
    })
    .await
    {
        Ok(Ok(raw)) => raw,
        Ok(Err(e)) => return Err(e.into()),
        Err(_) => return Err(HaloError::Timeout("batch acknowledgement")),
    };

    match Confirmation::from_u8(raw) {
        Some(Confirmation::Executed) => Ok(()),
        Some(Confirmation::Rejected) => Err(HaloError::Rejected("batch refused by peer")),
        None => Err(HaloError::Protocol(format!(
            "invalid batch acknowledgement 0x{raw:02X}"
        ))),
    }
}

/// Copy `range` out of the store and push it to `target`.
///
/// On success with `drop_source` set, the local copy is removed. On an
/// unreachable target the failure is reported to `report_addr` and the
/// command still counts as executed; the local copy stays.
pub(crate) async fn execute_push(
    store: &Arc<dyn RangeStore>,
    config: &ChannelConfig,
    report_addr: SocketAddr,
    target: NodeAddr,
    range: KeyRange,
    drop_source: bool,
) -> Confirmation {
    let pairs = store.copy_range(&range);
    let count = pairs.len();
    match push_batch(target.main_addr(), &pairs, config).await {
        Ok(()) => {
            if drop_source {
                let removed = store.remove_range(&range);
                debug!(
                    target: "halo::transfer",
                    range = %range,
                    removed,
                    "Dropped source copy after move"
                );
            }
            info!(
                target: "halo::transfer",
                to = %target,
                range = %range,
                entries = count,
                moved = drop_source,
                "Range pushed"
            );
            Confirmation::Executed
        },
        Err(e) => {
            warn!(
                target: "halo::transfer",
                to = %target,
                range = %range,
                error = %e,
                "Transfer target unreachable, reporting it down"
            );
            let report = AdminMessage::ServerDown(target);
            if let Err(e) = send_report(report_addr, &report, config).await {
                warn!(
                    target: "halo::transfer",
                    report_addr = %report_addr,
                    error = %e,
                    "Failed to deliver failure report"
                );
            }
            Confirmation::Executed
        },
    }
}

/// Accept loop for incoming batches on the main service port.
pub(crate) async fn run_transfer_listener(
    listener: TcpListener,
    store: Arc<dyn RangeStore>,
    config: ChannelConfig,
    mut shutdown_rx: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        let store = Arc::clone(&store);
                        let config = config.clone();
                        tokio::spawn(async move {
                            handle_incoming_batch(stream, peer, store, config).await;
                        });
                    },
                    Err(e) => {
                        warn!(target: "halo::transfer", error = %e, "Transfer accept failed");
                    },
                }
            }
            _ = shutdown_rx.recv() => {
                debug!(target: "halo::transfer", "Transfer listener stopping");
                break;
            }
        }
    }
}

async fn handle_incoming_batch(
    mut stream: TcpStream,
    peer: SocketAddr,
    store: Arc<dyn RangeStore>,
    config: ChannelConfig,
) {
    match read_batch(&mut stream, &config).await {
        Ok(pairs) => {
            let count = pairs.len();
            store.insert_many(pairs);
            debug!(
                target: "halo::transfer",
                from = %peer,
                entries = count,
                "Batch received"
            );
            if let Err(e) = stream.write_all(&[Confirmation::Executed as u8]).await {
                warn!(target: "halo::transfer", from = %peer, error = %e, "Failed to acknowledge batch");
            }
        },
        Err(e) => {
            warn!(target: "halo::transfer", from = %peer, error = %e, "Bad transfer batch");
            let _ = stream.write_all(&[Confirmation::Rejected as u8]).await;
        },
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;
    use std::time::Duration;

    use crate::store::MemoryStore;
    use hlo_core::Position;
    use hlo_net::CommandChannel;

    fn quick() -> ChannelConfig {
        ChannelConfig {
            connect_timeout: Duration::from_millis(500),
            io_timeout: Duration::from_millis(500),
            confirm_timeout: Duration::from_millis(500),
        }
    }

    fn full_circle() -> KeyRange {
        KeyRange::full_circle_at(Position::new(0))
    }

    async fn spawn_receiver() -> (SocketAddr, Arc<dyn RangeStore>, broadcast::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let store: Arc<dyn RangeStore> = Arc::new(MemoryStore::new());
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        tokio::spawn(run_transfer_listener(
            listener,
            Arc::clone(&store),
            quick(),
            shutdown_rx,
        ));
        (addr, store, shutdown_tx)
    }

    #[tokio::test]
    async fn test_batch_round_trip() {
        let (addr, store, _shutdown) = spawn_receiver().await;

        let pairs = vec![
            ("alpha".to_string(), "1".to_string()),
            ("beta".to_string(), "2".to_string()),
        ];
        push_batch(addr, &pairs, &quick()).await.unwrap();

        assert_eq!(store.get("alpha").as_deref(), Some("1"));
        assert_eq!(store.get("beta").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_empty_batch_is_acknowledged() {
        let (addr, store, _shutdown) = spawn_receiver().await;
        push_batch(addr, &[], &quick()).await.unwrap();
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_oversized_key_length_rejected() {
        let (addr, store, _shutdown) = spawn_receiver().await;

        let mut stream = TcpStream::connect(addr).await.unwrap();
        let mut frame = BytesMut::new();
        frame.put_u32(1);
        frame.put_u32((MAX_KEY_LEN + 1) as u32);
        stream.write_all(&frame).await.unwrap();

        let mut byte = [0u8; 1];
        stream.read_exact(&mut byte).await.unwrap();
        assert_eq!(Confirmation::from_u8(byte[0]), Some(Confirmation::Rejected));
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_move_drops_source_after_acknowledgement() {
        let (addr, target_store, _shutdown) = spawn_receiver().await;
        let target = NodeAddr::new(Ipv4Addr::LOCALHOST, addr.port());

        let source: Arc<dyn RangeStore> = Arc::new(MemoryStore::new());
        source.insert("x".into(), "1".into());
        source.insert("y".into(), "2".into());

        // Report address is never contacted on the success path.
        let report_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let confirmation = execute_push(
            &source,
            &quick(),
            report_addr,
            target,
            full_circle(),
            true,
        )
        .await;

        assert!(confirmation.is_executed());
        assert!(source.is_empty());
        assert_eq!(target_store.get("x").as_deref(), Some("1"));
        assert_eq!(target_store.get("y").as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn test_replicate_keeps_source() {
        let (addr, target_store, _shutdown) = spawn_receiver().await;
        let target = NodeAddr::new(Ipv4Addr::LOCALHOST, addr.port());

        let source: Arc<dyn RangeStore> = Arc::new(MemoryStore::new());
        source.insert("x".into(), "1".into());

        let report_addr: SocketAddr = "127.0.0.1:1".parse().unwrap();
        let confirmation = execute_push(
            &source,
            &quick(),
            report_addr,
            target,
            full_circle(),
            false,
        )
        .await;

        assert!(confirmation.is_executed());
        assert_eq!(source.len(), 1);
        assert_eq!(target_store.get("x").as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_unreachable_target_reports_and_confirms() {
        // Reserve a port, then free it so the push gets refused.
        let parked = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let dead_port = parked.local_addr().unwrap().port();
        drop(parked);
        let target = NodeAddr::new(Ipv4Addr::LOCALHOST, dead_port);

        let report_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let report_addr = report_listener.local_addr().unwrap();
        let report_task = tokio::spawn(async move {
            let (stream, _) = report_listener.accept().await.unwrap();
            let mut channel = CommandChannel::from_stream(stream, quick());
            channel.read_message().await.unwrap()
        });

        let source: Arc<dyn RangeStore> = Arc::new(MemoryStore::new());
        source.insert("survives".into(), "1".into());

        let confirmation = execute_push(
            &source,
            &quick(),
            report_addr,
            target,
            full_circle(),
            true,
        )
        .await;

        // Executed despite the failed push, and nothing was dropped.
        assert!(confirmation.is_executed());
        assert_eq!(source.len(), 1);

        let report = report_task.await.unwrap();
        assert_eq!(report, AdminMessage::ServerDown(target));
    }
}
