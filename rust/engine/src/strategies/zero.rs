//! Chunk-overwrite strategy.

use std::fs::File;
use std::io;

use async_trait::async_trait;

use crate::blob;
use crate::error::{EngineError, EngineResult};
use crate::strategy::{SpawnContext, Strategy, next_params};
use crate::task::{ChunkParams, Task};

/// Overwrite chunks with a fixed byte instead of deleting them.
///
/// Zeroing never shrinks the candidate, but it simplifies content that a
/// follow-up bisection pass can then remove, and it preserves offsets for
/// predicates that are position sensitive.
pub struct Zero {
    zero_char: u8,
}

impl Zero {
    #[must_use]
    pub fn new(zero_char: u8) -> Self {
        Self { zero_char }
    }
}

#[async_trait]
impl Strategy for Zero {
    fn name(&self) -> &'static str {
        "zero"
    }

    async fn next(&self, ctx: &SpawnContext) -> EngineResult<Option<Task>> {
        let Some(proposal) = next_params(ctx.params, ctx.size, ctx.succeeded, true) else {
            return Ok(None);
        };

        let guard = ctx.source.lock().await;
        let Some(source_blob) = guard.blob() else {
            // Reclaimed by a late sweep; the walk will not return here.
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
        let zero_char = self.zero_char;
        let ancestors = ctx.success_params.clone();

        // The skip scan reads source bytes, so the whole propose/skip loop
        // and the final copy run on a blocking thread while the source
        // mutex is held.
        let built = tokio::task::spawn_blocking(move || -> io::Result<Option<(File, ChunkParams)>> {
            let Some(params) = skip_redundant(&src, source_size, proposal, &ancestors, zero_char)?
            else {
                return Ok(None);
            };

            let span = params.chunksize.min(source_size - params.offset);
            let tail_start = (params.offset + params.chunksize).min(source_size);
            let dst = blob::create()?;
            blob::copy_range(&src, 0, &dst, 0, params.offset)?;
            blob::write_fill(&dst, params.offset, span, zero_char)?;
            blob::copy_range(
                &src,
                tail_start,
                &dst,
                params.offset + span,
                source_size - tail_start,
            )?;
            Ok(Some((dst, params)))
        })
        .await
        .map_err(|e| EngineError::Io {
            message: format!("candidate construction failed: {e}"),
        })??;
        drop(guard);

        Ok(built.map(|(candidate, params)| Task::new(candidate, source_size, params)))
    }
}

/// Advance past proposals that cannot change the source: blocks that fall
/// entirely inside a region an ancestor already zeroed, and blocks whose
/// bytes already equal the fill byte. Each skip advances the schedule with
/// the usual cycle rollover, so the scan is bounded by depth times cycles.
fn skip_redundant(
    src: &File,
    source_size: u64,
    mut params: ChunkParams,
    ancestors: &[ChunkParams],
    zero_char: u8,
) -> io::Result<Option<ChunkParams>> {
    loop {
        let span = params.chunksize.min(source_size.saturating_sub(params.offset));
        let redundant = if span == 0 {
            true
        } else if ancestors.iter().any(|a| {
            a.offset <= params.offset && params.offset + span <= a.offset + a.chunksize
        }) {
            true
        } else {
            blob::read_range(src, params.offset, span)?
                .iter()
                .all(|&b| b == zero_char)
        };

        if !redundant {
            return Ok(Some(params));
        }
        match next_params(params, source_size, false, true) {
            Some(next) => params = next,
            None => return Ok(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::FileExt;

    fn blob_with(content: &[u8]) -> File {
        let file = blob::create().expect("create");
        file.write_all_at(content, 0).expect("write");
        file
    }

    #[test]
    fn skips_blocks_inside_zeroed_ancestors() {
        let src = blob_with(b"abcdefgh");
        let ancestors = [ChunkParams {
            offset: 0,
            chunksize: 4,
        }];
        // [2, 4) is inside the ancestor's region; the scan should land on
        // the next block of the schedule instead.
        let picked = skip_redundant(
            &src,
            8,
            ChunkParams {
                offset: 2,
                chunksize: 2,
            },
            &ancestors,
            0,
        )
        .expect("io")
        .expect("some");
        assert_eq!(picked.offset, 4);
    }

    #[test]
    fn skips_blocks_that_are_already_filled() {
        let src = blob_with(b"\0\0cd");
        let picked = skip_redundant(
            &src,
            4,
            ChunkParams {
                offset: 0,
                chunksize: 2,
            },
            &[],
            0,
        )
        .expect("io")
        .expect("some");
        assert_eq!(picked.offset, 2);
    }

    #[test]
    fn exhausted_schedule_yields_nothing() {
        let src = blob_with(b"\0\0\0\0");
        let picked = skip_redundant(
            &src,
            4,
            ChunkParams {
                offset: 0,
                chunksize: 4,
            },
            &[],
            0,
        )
        .expect("io");
        assert!(picked.is_none());
    }
}
