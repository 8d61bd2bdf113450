//! Block-range replay.
//!
//! Every new block triggers a replay of the range between the last block
//! the supervisor fully applied and the new head. After a reconnect that
//! range covers whatever was missed while the connection was down.

use std::sync::Arc;

use serde_json::{json, Value};
use tracing::debug;

use chainsync_core::request::{parse_quantity, to_quantity};
use chainsync_core::ChainTransport;

use crate::error::WorkerError;
use crate::watcher::DomainWatcher;

/// An inclusive block range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockRange {
    pub from: u64,
    pub to: u64,
}

impl BlockRange {
    /// Range to replay when block `head` arrives.
    ///
    /// Starts right after `last_known`. The first block ever seen, or a head
    /// at or below `last_known` (a reorg or a lagging node), replays only
    /// `head` itself.
    pub fn replay(last_known: Option<u64>, head: u64) -> Self {
        match last_known {
            Some(last) if head > last => Self { from: last + 1, to: head },
            _ => Self { from: head, to: head },
        }
    }

    /// Split into consecutive chunks of at most `size` blocks.
    pub fn chunks(self, size: u64) -> impl Iterator<Item = BlockRange> {
        let size = size.max(1);
        let mut next = Some(self.from);
        std::iter::from_fn(move || {
            let from = next?;
            let to = from.saturating_add(size - 1).min(self.to);
            next = (to < self.to).then(|| to + 1);
            Some(BlockRange { from, to })
        })
    }

    /// Number of blocks in the range.
    pub fn block_count(&self) -> u64 {
        self.to - self.from + 1
    }
}

/// Block number of a `newHeads` push.
pub fn header_number(header: &Value) -> Option<u64> {
    header.get("number")?.as_str().and_then(parse_quantity)
}

/// Fetch logs for `range` in chunks and hand each chunk to the watcher.
/// Returns the number of logs applied.
pub async fn replay(
    transport: &Arc<dyn ChainTransport>,
    watcher: &dyn DomainWatcher,
    range: BlockRange,
    batch_size: u64,
) -> Result<usize, WorkerError> {
    let addresses = watcher.watched_addresses();
    if addresses.is_empty() {
        debug!(from = range.from, to = range.to, "no watched addresses, skipping replay");
        return Ok(0);
    }

    let mut applied = 0;
    for chunk in range.chunks(batch_size) {
        let filter = json!({
            "fromBlock": to_quantity(chunk.from),
            "toBlock": to_quantity(chunk.to),
            "address": addresses,
        });
        let logs: Vec<Value> = transport.call("eth_getLogs", vec![filter]).await?;
        applied += logs.len();
        watcher.apply_logs(chunk.from, chunk.to, logs).await?;
    }
    Ok(applied)
}
