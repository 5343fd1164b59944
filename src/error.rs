use std::cell::Cell;
use std::io;

use thiserror::Error;

/// Failure reported by the backing store. These are the only errors a user of
/// the filesystem client ever sees; cache-internal failures fall back to the
/// uncached path instead.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("backing store I/O error: {0}")]
    Io(#[from] io::Error),
    #[error("backing store returned error code {code}")]
    Remote { code: i32 },
    #[error("short transfer at offset {offset}: expected {expected} bytes, got {actual}")]
    ShortTransfer {
        offset: u64,
        expected: usize,
        actual: usize,
    },
}

#[derive(Debug, Error)]
pub enum UCacheError {
    /// No free block, table slot or entry remained after eviction.
    #[error("cache exhausted")]
    Exhausted,
    /// A guard lock was held by another operation; try again later.
    #[error("block {slot} is busy")]
    Busy { slot: u32 },
    /// A `FileRef` or `BlockRef` outlived the slot it pointed at.
    #[error("stale cache reference")]
    Stale,
    #[error("range {start}..{end} outside a block of {block_size} bytes")]
    Range {
        start: usize,
        end: usize,
        block_size: usize,
    },
    #[error("double free of {what} {index}")]
    DoubleFree { what: &'static str, index: u32 },
    #[error("shared cache structure corrupt: {0}")]
    Corrupt(String),
    #[error("invalid cache configuration: {0}")]
    Config(String),
    #[error("segment layout mismatch: {0}")]
    Layout(String),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("segment I/O error: {0}")]
    Io(#[from] io::Error),
}

impl UCacheError {
    /// True for conditions eviction can relieve.
    pub fn is_exhausted(&self) -> bool {
        matches!(self, UCacheError::Exhausted)
    }

    pub(crate) fn corrupt(msg: impl Into<String>) -> Self {
        let msg = msg.into();
        if corruption_is_logged() {
            tracing::error!(%msg, "ucache invariant violated");
        }
        UCacheError::Corrupt(msg)
    }
}

thread_local! {
    static QUIET: Cell<bool> = const { Cell::new(false) };
}

fn corruption_is_logged() -> bool {
    !QUIET.with(Cell::get)
}

/// Run `f` without logging corruption. Optimistic readers walk structures a
/// writer may be halfway through changing; what they see is only trusted
/// after the seqlock validates it.
pub(crate) fn quietly<T>(f: impl FnOnce() -> T) -> T {
    let prev = QUIET.with(|q| q.replace(true));
    let out = f();
    QUIET.with(|q| q.set(prev));
    out
}

pub type Result<T> = std::result::Result<T, UCacheError>;
