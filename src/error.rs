use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// An item is larger than one data page and can never be stored.
    #[error("item of {len} bytes exceeds data page size of {page_size} bytes")]
    ItemTooLarge { len: u64, page_size: u64 },

    /// An item is larger than the configured dequeue batch byte cap and the
    /// configuration forbids enqueuing such items.
    #[error("item of {len} bytes exceeds max dequeue batch size of {max_bytes} bytes")]
    ItemExceedsBatchLimit { len: u64, max_bytes: u64 },

    /// A read returned fewer bytes than the index record promised.
    #[error("data inconsistency: {0}")]
    DataInconsistency(String),

    /// Operation on a page, factory, or cache after teardown.
    #[error("storage closed")]
    Closed,

    /// A dequeue wait was cancelled. Distinct from an empty result.
    #[error("dequeue cancelled")]
    Cancelled,

    #[error("byte range at {offset} len {len} out of bounds for page of {page_size} bytes")]
    RangeOutOfBounds {
        offset: u64,
        len: u64,
        page_size: u64,
    },
}

pub type Result<T> = std::result::Result<T, Error>;
