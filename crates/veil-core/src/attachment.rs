//! Block-wise attachment transfer over an established sync session.
//!
//! The sender announces a block count, then ships blocks one at a time and
//! waits for `BlockOK` after each. The receiver answers `BlobOK` once the
//! whole blob is stored. A failed receive leaves no partial blob behind.

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, warn};

use veil_net::FramedConnection;
use veil_shared::constants::BLOCK_SIZE;
use veil_shared::{BlobId, StatusCode};
use veil_store::BlobStore;

use crate::error::AttachmentError;

type Result<T> = std::result::Result<T, AttachmentError>;

/// Blocks needed for a blob of `size` bytes.
pub fn block_count(size: u64) -> u64 {
    size.div_ceil(BLOCK_SIZE as u64)
}

/// Push blob `id` to the peer. Returns the number of blocks sent.
pub async fn send_attachment<S>(
    conn: &mut FramedConnection<S>,
    store: &dyn BlobStore,
    id: &BlobId,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let size = store.stat(id).await?;
    let blocks = block_count(size);
    conn.write_int(blocks as i64)?;
    conn.flush().await?;

    for index in 0..blocks {
        let data = store
            .read_block(id, index * BLOCK_SIZE as u64, BLOCK_SIZE)
            .await?;
        conn.write_bytes(&data)?;
        conn.flush().await?;
        conn.expect_status(StatusCode::BlockOk).await?;
    }
    conn.expect_status(StatusCode::BlobOk).await?;

    debug!(peer = %conn.label(), blob = %id, blocks, size, "Attachment sent");
    Ok(blocks)
}

/// Receive a blob announced by the peer.
///
/// With `target == None` the blocks are acknowledged and discarded; used
/// when the message is already known and its blob already stored. A target
/// the store already holds is never overwritten: its blocks are discarded
/// too, and a failed transfer only removes blobs it created.
pub async fn receive_attachment<S>(
    conn: &mut FramedConnection<S>,
    store: &dyn BlobStore,
    target: Option<&BlobId>,
    max_size: u64,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let announced = conn.read_int().await?;
    let blocks = u64::try_from(announced).map_err(|_| AttachmentError::InvalidBlockCount(announced))?;
    let max_blocks = block_count(max_size);
    if blocks > max_blocks {
        return Err(AttachmentError::TooManyBlocks {
            blocks,
            max: max_blocks,
        });
    }

    let target = match target {
        Some(id) if store.contains(id).await => {
            debug!(peer = %conn.label(), blob = %id, "Blob already stored, discarding blocks");
            None
        }
        other => other,
    };
    if let Some(id) = target {
        store.create(id).await?;
    }

    let result = receive_blocks(conn, store, target, blocks).await;
    if let (Err(e), Some(id)) = (&result, target) {
        warn!(peer = %conn.label(), blob = %id, error = %e, "Attachment receive failed, discarding");
        if let Err(cleanup) = store.delete(id).await {
            debug!(blob = %id, error = %cleanup, "Partial blob cleanup failed");
        }
    }
    result
}

async fn receive_blocks<S>(
    conn: &mut FramedConnection<S>,
    store: &dyn BlobStore,
    target: Option<&BlobId>,
    blocks: u64,
) -> Result<u64>
where
    S: AsyncRead + AsyncWrite + Send + Unpin,
{
    let mut total = 0u64;
    for _ in 0..blocks {
        let data = conn.read_bytes().await?;
        if data.len() > BLOCK_SIZE {
            return Err(AttachmentError::OversizedBlock {
                size: data.len(),
                max: BLOCK_SIZE,
            });
        }
        if let Some(id) = target {
            store.append(id, &data).await?;
        }
        total += data.len() as u64;
        conn.send_status(StatusCode::BlockOk).await?;
    }
    conn.send_status(StatusCode::BlobOk).await?;
    debug!(peer = %conn.label(), blocks, bytes = total, stored = target.is_some(), "Attachment received");
    Ok(total)
}
