//! Fixed-size binary records persisted in meta and index pages.
//!
//! All integers are little-endian 64-bit. `MetaData` occupies the single
//! 16-byte meta page; one 24-byte `IndexItem` is written per enqueued item
//! at a slot derived from its item number.

use crate::{Error, Result};

/// Size of one serialized [`IndexItem`].
pub const INDEX_ITEM_SIZE: u64 = 24;

/// Size of the serialized [`MetaData`] record.
pub const META_DATA_SIZE: u64 = 16;

/// Locates one item payload within the data pages.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IndexItem {
    pub data_page_index: u64,
    pub item_offset: u64,
    pub item_length: u64,
}

impl IndexItem {
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < INDEX_ITEM_SIZE as usize {
            return Err(Error::DataInconsistency(format!(
                "index record needs {INDEX_ITEM_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            data_page_index: u64::from_le_bytes(buf[0..8].try_into().expect("slice length")),
            item_offset: u64::from_le_bytes(buf[8..16].try_into().expect("slice length")),
            item_length: u64::from_le_bytes(buf[16..24].try_into().expect("slice length")),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.data_page_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.item_offset.to_le_bytes());
        buf[16..24].copy_from_slice(&self.item_length.to_le_bytes());
    }
}

/// Head and tail counters, persisted after every enqueue and commit.
///
/// `head_index` is the next item to deliver, `tail_index` the next slot to
/// write; the difference is the current queue length.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MetaData {
    pub head_index: u64,
    pub tail_index: u64,
}

impl MetaData {
    pub fn read_from(buf: &[u8]) -> Result<Self> {
        if buf.len() < META_DATA_SIZE as usize {
            return Err(Error::DataInconsistency(format!(
                "metadata record needs {META_DATA_SIZE} bytes, got {}",
                buf.len()
            )));
        }
        Ok(Self {
            head_index: u64::from_le_bytes(buf[0..8].try_into().expect("slice length")),
            tail_index: u64::from_le_bytes(buf[8..16].try_into().expect("slice length")),
        })
    }

    pub fn write_to(&self, buf: &mut [u8]) {
        buf[0..8].copy_from_slice(&self.head_index.to_le_bytes());
        buf[8..16].copy_from_slice(&self.tail_index.to_le_bytes());
    }
}

/// Index page holding the record for `item_index`.
pub fn index_page_index(item_index: u64, items_per_page: u64) -> u64 {
    item_index / items_per_page
}

/// Byte offset of `item_index`'s record within its index page.
pub fn index_item_offset(item_index: u64, items_per_page: u64) -> u64 {
    item_index % items_per_page * INDEX_ITEM_SIZE
}

/// Index of the item preceding `index`, clamped at zero.
pub fn previous_index(index: u64) -> u64 {
    index.saturating_sub(1)
}

/// Estimates the bytes held between the head item and the tail item.
///
/// Whole pages between the two are counted at `data_page_size`; the head and
/// tail pages contribute their partial spans. Returns 0 when the positions
/// are inconsistent (head located after tail).
pub fn estimate_queue_data_size(head: IndexItem, tail: IndexItem, data_page_size: u64) -> u64 {
    if tail.data_page_index < head.data_page_index {
        return 0;
    }
    let filled_pages = tail.data_page_index - head.data_page_index;

    if filled_pages == 0 {
        if tail.item_offset < head.item_offset {
            return 0;
        }
        return tail.item_offset - head.item_offset + tail.item_length;
    }

    // rest of the head page, whole pages in between, top of the tail page
    data_page_size - head.item_offset
        + (filled_pages - 1) * data_page_size
        + tail.item_offset
        + tail.item_length
}
