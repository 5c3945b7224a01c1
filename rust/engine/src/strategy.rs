//! The strategy seam.
//!
//! A strategy turns a position in the tree into the next candidate, or
//! reports that no further work is reachable from there. The driver
//! assembles a [`SpawnContext`] under the tree lock and calls
//! [`Strategy::next`] outside it; the strategy locks the source task's
//! mutex only while constructing candidate data.

use std::sync::Arc;

use async_trait::async_trait;

use crate::error::EngineResult;
use crate::task::{ChunkParams, Task};

/// Everything a strategy needs to produce the next candidate.
///
/// `params`, `size`, and `succeeded` describe the *context node*: the
/// parent of the position the new candidate will occupy. `source` is the
/// nearest success ancestor of that position — the blob the candidate's
/// data is derived from.
pub struct SpawnContext {
    /// Parameter block of the context node.
    pub params: ChunkParams,
    /// Candidate size of the context node.
    pub size: u64,
    /// Whether the context node's result was a success at walk time.
    pub succeeded: bool,
    /// Nearest success ancestor (the root qualifies).
    pub source: Arc<Task>,
    /// Parameter blocks of all success ancestors, nearest first, excluding
    /// the root. Used by redundancy scans.
    pub success_params: Vec<ChunkParams>,
}

/// A reduction policy: produces candidates from tree positions.
#[async_trait]
pub trait Strategy: Send + Sync {
    /// Short name used in logs and events.
    fn name(&self) -> &'static str;

    /// Produce the next candidate for the given context, or `None` when no
    /// further work is reachable from this position.
    ///
    /// # Errors
    ///
    /// IO errors while materializing candidate data are fatal to the run.
    async fn next(&self, ctx: &SpawnContext) -> EngineResult<Option<Task>>;
}

/// The shared successor rule for `(offset, chunksize)` schedules.
///
/// When the current block would run past the end of the data, a new cycle
/// starts at offset 0 with the chunk size halved. Otherwise the offset
/// advances by one chunk — except that a strategy which *removes* data
/// keeps the offset in place after a success, because the next chunk now
/// sits where the removed one was. Returns `None` once the chunk size
/// reaches zero: the schedule is exhausted.
#[must_use]
pub fn next_params(
    params: ChunkParams,
    size: u64,
    succeeded: bool,
    advance_on_success: bool,
) -> Option<ChunkParams> {
    let next = if params.offset + params.chunksize > size {
        ChunkParams {
            offset: 0,
            chunksize: params.chunksize / 2,
        }
    } else if succeeded && !advance_on_success {
        params
    } else {
        ChunkParams {
            offset: params.offset + params.chunksize,
            chunksize: params.chunksize,
        }
    };
    (next.chunksize > 0).then_some(next)
}
