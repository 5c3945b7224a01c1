//! Chunk-deletion strategy.

use std::fs::File;
use std::io;

use async_trait::async_trait;

use crate::blob;
use crate::error::{EngineError, EngineResult};
use crate::strategy::{SpawnContext, Strategy, next_params};
use crate::task::Task;

/// Delta debugging by bisection: each candidate is the source with one
/// chunk deleted. The first candidate of a run deletes everything; every
/// time the chunk size halves the granularity doubles.
pub struct Bisect;

#[async_trait]
impl Strategy for Bisect {
    fn name(&self) -> &'static str {
        "bisect"
    }

    async fn next(&self, ctx: &SpawnContext) -> EngineResult<Option<Task>> {
        if ctx.source.size() == 0 {
            // Nothing left to remove.
            return Ok(None);
        }
        let Some(params) = next_params(ctx.params, ctx.size, ctx.succeeded, false) else {
            return Ok(None);
        };

        let guard = ctx.source.lock().await;
        let Some(source_blob) = guard.blob() else {
            // The source was reclaimed by a late sweep; this position is
            // stale and the next walk will not come back here.
            return Ok(None);
        };
        let source_size = ctx.source.size();
        if blob::len(source_blob)? != source_size {
            return Err(EngineError::Invariant {
                reason: format!(
                    "source blob length disagrees with recorded size {source_size}"
                ),
            });
        }

        let src = source_blob.try_clone()?;
        // Hold the source mutex for the duration of the copy so the blob
        // cannot be reclaimed underneath it.
        let built = tokio::task::spawn_blocking(move || -> io::Result<(File, u64)> {
            let head = params.offset.min(source_size);
            let tail_start = (params.offset + params.chunksize).min(source_size);
            let dst = blob::create()?;
            blob::copy_range(&src, 0, &dst, 0, head)?;
            blob::copy_range(&src, tail_start, &dst, head, source_size - tail_start)?;
            Ok((dst, head + (source_size - tail_start)))
        })
        .await
        .map_err(|e| EngineError::Io {
            message: format!("candidate construction failed: {e}"),
        })??;
        drop(guard);

        let (candidate, size) = built;
        Ok(Some(Task::new(candidate, size, params)))
    }
}
