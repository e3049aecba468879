//! C6: a listener socket per stream offering a zero-copy ingest path
//! straight into the reading buffer, bypassing the south-ingest queue.
//!
//! Ground: `libs/pipeline/src/endpoint.rs::spawn_source`'s accept-loop /
//! per-connection-task split, re-expressed as a dedicated OS thread
//! carrying its own single-threaded runtime per §4.6 and §5's "epoll
//! thread" resource row — a `LocalSet` over one task per connection plays
//! the role the source's single thread owning every connection's state
//! machine played, without hand-rolling raw epoll.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt as _};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use edge_api::reading::{DatapointValue, Reading};
use edge_api::storage::{ManagementCollaborator, ReadingBuffer};

pub const RDS_CONNECTION_MAGIC: u32 = 0x52445331; // "RDS1"
pub const RDS_BLOCK_MAGIC: u32 = 0x424C4B31; // "BLK1"
pub const RDS_READING_MAGIC: u32 = 0x5244_5231; // "RDR1"

#[derive(Debug, thiserror::Error)]
pub enum StreamHandlerError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed frame: {0}")]
    Format(String),
}

#[derive(Debug, Clone, Copy)]
pub struct StreamListener {
    pub port: u16,
    pub token: u32,
}

/// Binds an ephemeral-port listener and hands a dedicated OS thread (its
/// own single-threaded tokio runtime, `LocalSet`-scoped) the rest of the
/// connection's lifetime. Returns as soon as the socket is bound and the
/// thread is spawned — the handshake token generation (`rand`) happens
/// before the thread starts so the caller can publish it immediately.
pub fn create_stream(
    storage: Arc<dyn ReadingBuffer>,
    management: Arc<dyn ManagementCollaborator>,
    cancel: CancellationToken,
) -> std::io::Result<StreamListener> {
    let std_listener = std::net::TcpListener::bind(("0.0.0.0", 0))?;
    std_listener.set_nonblocking(true)?;
    let port = std_listener.local_addr()?.port();
    let token: u32 = rand::random();

    std::thread::Builder::new()
        .name(format!("stream-handler-{port}"))
        .spawn(move || {
            let rt = match tokio::runtime::Builder::new_current_thread().enable_all().build() {
                Ok(rt) => rt,
                Err(e) => {
                    tracing::error!(error = %e, "failed to build stream-handler runtime");
                    return;
                }
            };
            let local = tokio::task::LocalSet::new();
            local.block_on(&rt, accept_loop(std_listener, token, storage, management, cancel));
        })
        .map_err(|e| std::io::Error::other(format!("spawn stream-handler thread: {e}")))?;

    Ok(StreamListener { port, token })
}

async fn accept_loop(
    std_listener: std::net::TcpListener,
    token: u32,
    storage: Arc<dyn ReadingBuffer>,
    management: Arc<dyn ManagementCollaborator>,
    cancel: CancellationToken,
) {
    let listener = match tokio::net::TcpListener::from_std(std_listener) {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(error = %e, "stream-handler listener conversion failed");
            return;
        }
    };

    let mut tasks = tokio::task::JoinSet::new();
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        tracing::info!(%peer, "stream connection accepted");
                        let storage = storage.clone();
                        let management = management.clone();
                        let conn_cancel = cancel.clone();
                        tasks.spawn_local(async move {
                            handle_connection(stream, token, storage, management, conn_cancel).await;
                        });
                    }
                    Err(e) => tracing::warn!(error = %e, "stream-handler accept error"),
                }
            }
            Some(_) = tasks.join_next() => {}
        }
    }
    tasks.shutdown().await;
}

/// `Listen -> AwaitingToken -> Connected{BlkHdr|RdHdr|RdBody}`: expressed
/// as straight-line `async`/`await` rather than a hand-written enum, since
/// the compiler lowers the former into exactly the latter — the idiomatic
/// Rust rendition of a state machine, not a deviation from one.
async fn handle_connection(
    mut stream: TcpStream,
    expected_token: u32,
    storage: Arc<dyn ReadingBuffer>,
    management: Arc<dyn ManagementCollaborator>,
    cancel: CancellationToken,
) {
    if let Err(e) = await_handshake(&mut stream, expected_token).await {
        tracing::warn!(error = %e, "stream handshake rejected");
        return;
    }

    let mut pool = BlockPool::new();
    let mut prev_asset: Option<String> = None;

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            block = read_block(&mut stream, &mut pool, &mut prev_asset) => {
                match block {
                    Ok(Some(batch)) => {
                        let count = batch.len();
                        match storage.stream_append(batch, true).await {
                            Ok(n) => {
                                let _ = management.increment_statistic("READINGS", n as u64).await;
                            }
                            Err(e) => {
                                tracing::error!(error = %e, "stream batch rejected by storage");
                                let _ = management.increment_statistic("DISCARDED", count as u64).await;
                            }
                        }
                    }
                    Ok(None) => break,
                    Err(e) => {
                        tracing::warn!(error = %e, "malformed stream frame, closing connection");
                        break;
                    }
                }
            }
        }
    }
}

async fn await_handshake(stream: &mut TcpStream, expected_token: u32) -> Result<(), StreamHandlerError> {
    let mut hdr = [0u8; 8];
    stream.read_exact(&mut hdr).await?;
    let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    let client_token = u32::from_le_bytes(hdr[4..8].try_into().unwrap());
    if magic != RDS_CONNECTION_MAGIC {
        return Err(StreamHandlerError::Format(format!("bad connection magic {magic:#x}")));
    }
    if client_token != expected_token {
        return Err(StreamHandlerError::Format("token mismatch".into()));
    }
    let mut ack = Vec::with_capacity(4);
    ack.extend_from_slice(&RDS_CONNECTION_MAGIC.to_le_bytes());
    let _ = stream.write_all(&ack).await;
    Ok(())
}

/// Reads one block (`{magic, block_no, count}` + `count` readings) and
/// returns the accumulated batch, or `None` on a clean EOF at a block
/// boundary. `commit` is always true at block end in this design — there
/// is no array spanning multiple blocks, so the `commit = block_end`
/// parameter from §4.6 collapses to a constant here.
async fn read_block(
    stream: &mut TcpStream,
    pool: &mut BlockPool,
    prev_asset: &mut Option<String>,
) -> Result<Option<Vec<Reading>>, StreamHandlerError> {
    let mut hdr = [0u8; 4];
    match stream.read_exact(&mut hdr).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let magic = u32::from_le_bytes(hdr);
    if magic != RDS_BLOCK_MAGIC {
        return Err(StreamHandlerError::Format(format!("bad block magic {magic:#x}")));
    }

    let mut rest = [0u8; 8];
    stream.read_exact(&mut rest).await?;
    let _block_no = u32::from_le_bytes(rest[0..4].try_into().unwrap());
    let count = u32::from_le_bytes(rest[4..8].try_into().unwrap());

    let mut batch = pool.acquire(count as usize);
    for _ in 0..count {
        let reading = read_reading(stream, prev_asset).await?;
        batch.push(reading);
    }
    Ok(Some(batch))
}

async fn read_reading(stream: &mut TcpStream, prev_asset: &mut Option<String>) -> Result<Reading, StreamHandlerError> {
    let mut hdr = [0u8; 12];
    stream.read_exact(&mut hdr).await?;
    let magic = u32::from_le_bytes(hdr[0..4].try_into().unwrap());
    let asset_len = u32::from_le_bytes(hdr[4..8].try_into().unwrap()) as usize;
    let payload_len = u32::from_le_bytes(hdr[8..12].try_into().unwrap()) as usize;
    if magic != RDS_READING_MAGIC {
        return Err(StreamHandlerError::Format(format!("bad reading magic {magic:#x}")));
    }

    let mut ts_bytes = [0u8; 8];
    stream.read_exact(&mut ts_bytes).await?;
    let user_ts_micros = i64::from_le_bytes(ts_bytes);

    let asset = if asset_len == 0 {
        prev_asset.clone().ok_or_else(|| StreamHandlerError::Format("asset_len=0 with no prior asset".into()))?
    } else {
        let mut asset_bytes = vec![0u8; asset_len];
        stream.read_exact(&mut asset_bytes).await?;
        String::from_utf8(asset_bytes).map_err(|e| StreamHandlerError::Format(format!("asset not UTF-8: {e}")))?
    };
    *prev_asset = Some(asset.clone());

    let mut payload = vec![0u8; payload_len];
    stream.read_exact(&mut payload).await?;
    let datapoints: Vec<(String, DatapointValue)> =
        serde_json::from_slice(&payload).map_err(|e| StreamHandlerError::Format(format!("bad payload JSON: {e}")))?;

    let user_ts = chrono::DateTime::from_timestamp_micros(user_ts_micros).unwrap_or_else(chrono::Utc::now);

    Ok(Reading { asset, user_ts, system_ts: chrono::Utc::now(), id: None, uuid: None, datapoints })
}

/// Size-segregated free lists keyed by the next power-of-two bucket, per
/// §4.6's block-pool requirement. Single-threaded (owned by one
/// connection's task), so no lock.
struct BlockPool {
    buckets: HashMap<usize, Vec<Vec<Reading>>>,
}

impl BlockPool {
    fn new() -> Self {
        Self { buckets: HashMap::new() }
    }

    fn acquire(&mut self, min_capacity: usize) -> Vec<Reading> {
        let bucket = bucket_for(min_capacity);
        match self.buckets.get_mut(&bucket).and_then(|free| free.pop()) {
            Some(v) => v,
            None => Vec::with_capacity(bucket),
        }
    }

    // Batches are consumed by `storage.stream_append`, so the ingest path
    // never calls this; kept for a sink that hands the Vec back (e.g. a
    // future ack-frame response) and exercised directly by tests.
    #[allow(dead_code)]
    fn release(&mut self, mut batch: Vec<Reading>) {
        batch.clear();
        let bucket = bucket_for(batch.capacity());
        self.buckets.entry(bucket).or_default().push(batch);
    }
}

fn bucket_for(n: usize) -> usize {
    n.max(1).next_power_of_two()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_rounds_up_to_power_of_two() {
        assert_eq!(bucket_for(0), 1);
        assert_eq!(bucket_for(1), 1);
        assert_eq!(bucket_for(5), 8);
        assert_eq!(bucket_for(100), 128);
    }

    #[test]
    fn pool_reuses_released_vecs() {
        let mut pool = BlockPool::new();
        let v = pool.acquire(10);
        assert!(v.capacity() >= 10);
        pool.release(v);
        let v2 = pool.acquire(9);
        assert!(v2.capacity() >= 9);
    }

    #[tokio::test]
    async fn handshake_rejects_wrong_token() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            await_handshake(&mut stream, 42).await
        });
        let mut client = TcpStream::connect(addr).await.unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&RDS_CONNECTION_MAGIC.to_le_bytes());
        frame.extend_from_slice(&99u32.to_le_bytes());
        client.write_all(&frame).await.unwrap();
        let result = server.await.unwrap();
        assert!(result.is_err());
    }
}
