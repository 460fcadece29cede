//! The persistent queue engine.
//!
//! Orchestrates three page factories (meta, index, data) into a
//! crash-durable FIFO queue. Enqueue appends the payload to the tail data
//! page, records a 24-byte index entry for it, persists the head/tail
//! metadata and publishes the new tail through the state monitor. Dequeue
//! waits on the monitor until enough items are visible, then reads payloads
//! by walking index records; nothing is removed until the returned batch is
//! committed, at which point fully consumed pages are deleted.

use std::time::Duration;

use log::debug;
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::config::QueueConfiguration;
use crate::factory::PageFactory;
use crate::records::{self, IndexItem, MetaData, INDEX_ITEM_SIZE, META_DATA_SIZE};
use crate::state::QueueStateMonitor;
use crate::{Error, Result};

// The meta page is touched on every enqueue and commit; keep its handle
// around far longer than the data/index pages.
const META_PAGE_TTL: Duration = Duration::from_secs(60 * 60);

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatistics {
    /// Items currently waiting between head and tail.
    pub queue_length: u64,
    /// Estimated bytes held by the queued items, counting whole pages
    /// between the head and tail items.
    pub queue_data_size_estimate: u64,
    /// Items ever enqueued (the tail index).
    pub total_enqueued_items: u64,
}

/// The logical items covered by one dequeued batch.
#[derive(Debug, Clone, Copy)]
struct ItemRange {
    head_index: u64,
    item_count: u64,
}

pub struct PersistentQueue {
    config: QueueConfiguration,
    meta_pages: PageFactory,
    index_pages: PageFactory,
    data_pages: PageFactory,
    monitor: QueueStateMonitor,
    // Serializes enqueue, commit and metadata persistence. The sole
    // correctness lock; page-handle lifecycle is the caches' concern.
    inner: Mutex<QueueInner>,
}

struct QueueInner {
    meta: MetaData,
    tail_data_page_index: u64,
    tail_data_offset: u64,
}

/// One dequeued batch. Items stay in storage until [`commit`] runs; an
/// uncommitted or rejected batch is redelivered verbatim by the next
/// dequeue.
///
/// [`commit`]: DequeueResult::commit
pub struct DequeueResult<'q> {
    queue: &'q PersistentQueue,
    range: ItemRange,
    items: Vec<Vec<u8>>,
}

impl DequeueResult<'_> {
    pub fn items(&self) -> &[Vec<u8>] {
        &self.items
    }

    /// Acknowledges consumption: advances the head past this batch,
    /// persists metadata and deletes pages that fell fully behind the head.
    pub fn commit(self) -> Result<()> {
        self.queue.commit(self.range)
    }

    /// Declines the batch. Nothing is removed, so the same items come back
    /// on the next dequeue. Hook for future requeue semantics.
    pub fn reject(self) {}
}

impl PersistentQueue {
    /// Opens the queue at `config.queue_path`, creating the page directories
    /// on first use and recovering head/tail state from disk.
    pub fn open(config: QueueConfiguration) -> Result<Self> {
        let index_page_size = INDEX_ITEM_SIZE * config.index_items_per_page;

        // Meta page size equals the record size, so page 0 holds exactly one
        // record.
        let meta_pages = PageFactory::new(META_DATA_SIZE, config.meta_path(), Some(META_PAGE_TTL))?;
        let index_pages =
            PageFactory::new(index_page_size, config.index_path(), Some(config.cache_ttl))?;
        let data_pages =
            PageFactory::new(config.data_page_size, config.data_path(), Some(config.cache_ttl))?;

        let meta = read_meta(&meta_pages)?;

        // Rebuild the tail cursors from the record of the last written item,
        // so appends continue where the previous process stopped. On a fresh
        // queue this reads the zeroed slot 0: page 0, offset 0.
        let prev_tail = records::previous_index(meta.tail_index);
        let prev_item = read_index_item(&index_pages, prev_tail, config.index_items_per_page)?;

        debug!(
            "opened queue at {} (head {}, tail {})",
            config.queue_path.display(),
            meta.head_index,
            meta.tail_index
        );

        Ok(Self {
            monitor: QueueStateMonitor::new(meta.tail_index),
            inner: Mutex::new(QueueInner {
                meta,
                tail_data_page_index: prev_item.data_page_index,
                tail_data_offset: prev_item.item_offset + prev_item.item_length,
            }),
            config,
            meta_pages,
            index_pages,
            data_pages,
        })
    }

    pub fn configuration(&self) -> &QueueConfiguration {
        &self.config
    }

    /// Whether any uncommitted items are waiting.
    pub fn has_items(&self) -> bool {
        let meta = self.inner.lock().meta;
        meta.tail_index > meta.head_index
    }

    /// Appends one item to the tail of the queue.
    ///
    /// The payload lands in the current data page (rolling to a fresh page
    /// if it would not fit), its index record is written, metadata is
    /// persisted and the new tail is published to waiting dequeuers.
    pub fn enqueue(&self, item: &[u8]) -> Result<()> {
        let len = item.len() as u64;
        if len > self.config.data_page_size {
            return Err(Error::ItemTooLarge {
                len,
                page_size: self.config.data_page_size,
            });
        }
        if self.config.reject_oversized_items {
            if let Some(max_bytes) = self.config.max_dequeue_batch_bytes {
                if len > max_bytes {
                    return Err(Error::ItemExceedsBatchLimit { len, max_bytes });
                }
            }
        }

        let mut inner = self.inner.lock();

        // no item ever spans a page boundary
        if inner.tail_data_offset + len > self.config.data_page_size {
            inner.tail_data_page_index += 1;
            inner.tail_data_offset = 0;
        }

        let data_page = self.data_pages.get_page(inner.tail_data_page_index)?;
        data_page
            .write_view(inner.tail_data_offset, len)?
            .copy_from_slice(item);
        self.data_pages.release_page(inner.tail_data_page_index)?;

        let record = IndexItem {
            data_page_index: inner.tail_data_page_index,
            item_offset: inner.tail_data_offset,
            item_length: len,
        };
        write_index_item(
            &self.index_pages,
            inner.meta.tail_index,
            self.config.index_items_per_page,
            record,
        )?;

        inner.tail_data_offset += len;
        inner.meta.tail_index += 1;

        // Persist before publishing, so no dequeuer can observe a tail that
        // is not yet durably recorded.
        persist_meta(&self.meta_pages, &inner.meta)?;
        self.monitor.update(inner.meta.tail_index);
        Ok(())
    }

    /// Dequeues with the configured min/max batch sizes.
    pub async fn dequeue(&self, cancel: CancellationToken) -> Result<DequeueResult<'_>> {
        self.dequeue_batch(
            self.config.min_dequeue_batch_size,
            self.config.max_dequeue_batch_size,
            cancel,
        )
        .await
    }

    /// Waits until at least `min_items` are available, then returns up to
    /// `max_items` of them in FIFO order.
    ///
    /// Cancelling the token while waiting fails with [`Error::Cancelled`];
    /// it never yields a partial batch. Repeated calls without an
    /// intervening commit return the same items.
    pub async fn dequeue_batch(
        &self,
        min_items: usize,
        max_items: usize,
        cancel: CancellationToken,
    ) -> Result<DequeueResult<'_>> {
        let min_items = min_items.max(1) as u64;
        let max_items = (max_items as u64).max(min_items);

        let mut state = self.monitor.current();
        let head_index = self.inner.lock().meta.head_index;

        while state.tail_index().saturating_sub(head_index) < min_items {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Err(Error::Cancelled),
                next = state.next_update() => next,
            };
            state = next;
        }

        let available = state.tail_index() - head_index;
        let count = available.min(max_items);

        let items = match self.config.max_dequeue_batch_bytes {
            Some(max_bytes) => self.read_items_with_size_limit(head_index, count, max_bytes)?,
            None => self.read_items(head_index, count)?,
        };

        let range = ItemRange {
            head_index,
            item_count: items.len() as u64,
        };
        Ok(DequeueResult {
            queue: self,
            range,
            items,
        })
    }

    pub fn statistics(&self) -> Result<QueueStatistics> {
        let meta = self.inner.lock().meta;
        Ok(QueueStatistics {
            queue_length: meta.tail_index - meta.head_index,
            queue_data_size_estimate: self.data_size(meta.head_index, meta.tail_index)?,
            total_enqueued_items: meta.tail_index,
        })
    }

    /// Releases all three page factories. Idempotent; also runs on drop.
    pub fn close(&self) {
        self.meta_pages.close();
        self.index_pages.close();
        self.data_pages.close();
    }

    fn commit(&self, range: ItemRange) -> Result<()> {
        let new_head_index = range.head_index + range.item_count;
        let old_head_index;
        {
            let mut inner = self.inner.lock();
            old_head_index = inner.meta.head_index;
            // the head only ever moves forward; stale or duplicate commits
            // are no-ops
            if new_head_index > old_head_index {
                inner.meta.head_index = new_head_index;
                persist_meta(&self.meta_pages, &inner.meta)?;
            }
        }

        if new_head_index > old_head_index {
            self.reclaim_pages(old_head_index, new_head_index)?;
        }
        Ok(())
    }

    /// Deletes data and index pages that fell fully behind the new head.
    ///
    /// Both loops stop before the page of the last committed item, which the
    /// new head may still occupy.
    fn reclaim_pages(&self, old_head_index: u64, new_head_index: u64) -> Result<()> {
        let last_head = records::previous_index(old_head_index);
        let last_committed = records::previous_index(new_head_index);
        let old_item = self.index_item(last_head)?;
        let new_item = self.index_item(last_committed)?;

        for page_index in old_item.data_page_index..new_item.data_page_index {
            self.data_pages.delete_page(page_index)?;
        }

        let per_page = self.config.index_items_per_page;
        let old_index_page = records::index_page_index(last_head, per_page);
        let new_index_page = records::index_page_index(last_committed, per_page);
        for page_index in old_index_page..new_index_page {
            self.index_pages.delete_page(page_index)?;
        }
        Ok(())
    }

    fn read_items(&self, head_index: u64, count: u64) -> Result<Vec<Vec<u8>>> {
        let mut items = Vec::with_capacity(count as usize);
        for item_index in head_index..head_index + count {
            items.push(self.read_item(item_index)?);
        }
        Ok(items)
    }

    /// Reads up to `count` items while keeping the batch under `max_bytes`.
    ///
    /// The first item is always included, so a single item larger than the
    /// budget still makes progress. Later items are taken in order until one
    /// does not fit; that item ends the batch and is redelivered alone next
    /// time.
    fn read_items_with_size_limit(
        &self,
        head_index: u64,
        count: u64,
        max_bytes: u64,
    ) -> Result<Vec<Vec<u8>>> {
        let mut items = Vec::with_capacity(count as usize);

        let first = self.read_item(head_index)?;
        let mut batch_bytes = first.len() as u64;
        items.push(first);

        let mut offset = 1;
        while offset < count && batch_bytes < max_bytes {
            let record = self.index_item(head_index + offset)?;
            if record.item_length > max_bytes - batch_bytes {
                break;
            }
            batch_bytes += record.item_length;
            items.push(self.read_payload(record)?);
            offset += 1;
        }
        Ok(items)
    }

    fn read_item(&self, item_index: u64) -> Result<Vec<u8>> {
        let record = self.index_item(item_index)?;
        self.read_payload(record)
    }

    fn read_payload(&self, record: IndexItem) -> Result<Vec<u8>> {
        let page = self.data_pages.get_page(record.data_page_index)?;
        let result = page
            .read_view(record.item_offset, record.item_length)
            .map(|view| view.to_vec())
            .map_err(|err| match err {
                Error::RangeOutOfBounds { .. } => Error::DataInconsistency(format!(
                    "index promises {} bytes at offset {} of data page {}, beyond its {} bytes",
                    record.item_length,
                    record.item_offset,
                    record.data_page_index,
                    self.config.data_page_size
                )),
                other => other,
            });
        self.data_pages.release_page(record.data_page_index)?;
        result
    }

    fn index_item(&self, item_index: u64) -> Result<IndexItem> {
        read_index_item(&self.index_pages, item_index, self.config.index_items_per_page)
    }

    fn data_size(&self, head_index: u64, tail_index: u64) -> Result<u64> {
        if head_index == tail_index {
            return Ok(0);
        }
        let head_item = self.index_item(head_index)?;
        let tail_item = self.index_item(tail_index - 1)?;
        Ok(records::estimate_queue_data_size(
            head_item,
            tail_item,
            self.config.data_page_size,
        ))
    }
}

fn read_meta(meta_pages: &PageFactory) -> Result<MetaData> {
    let page = meta_pages.get_page(0)?;
    let meta = {
        let view = page.read_view(0, META_DATA_SIZE)?;
        MetaData::read_from(&view)?
    };
    meta_pages.release_page(0)?;
    Ok(meta)
}

fn persist_meta(meta_pages: &PageFactory, meta: &MetaData) -> Result<()> {
    let page = meta_pages.get_page(0)?;
    {
        let mut view = page.write_view(0, META_DATA_SIZE)?;
        meta.write_to(&mut view);
    }
    meta_pages.release_page(0)?;
    Ok(())
}

fn read_index_item(
    index_pages: &PageFactory,
    item_index: u64,
    items_per_page: u64,
) -> Result<IndexItem> {
    let page_index = records::index_page_index(item_index, items_per_page);
    let page = index_pages.get_page(page_index)?;
    let item = {
        let view = page.read_view(
            records::index_item_offset(item_index, items_per_page),
            INDEX_ITEM_SIZE,
        )?;
        IndexItem::read_from(&view)?
    };
    index_pages.release_page(page_index)?;
    Ok(item)
}

fn write_index_item(
    index_pages: &PageFactory,
    item_index: u64,
    items_per_page: u64,
    record: IndexItem,
) -> Result<()> {
    let page_index = records::index_page_index(item_index, items_per_page);
    let page = index_pages.get_page(page_index)?;
    {
        let mut view = page.write_view(
            records::index_item_offset(item_index, items_per_page),
            INDEX_ITEM_SIZE,
        )?;
        record.write_to(&mut view);
    }
    index_pages.release_page(page_index)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn small_config(path: &std::path::Path) -> QueueConfiguration {
        QueueConfiguration {
            data_page_size: 64,
            index_items_per_page: 4,
            ..QueueConfiguration::new(path)
        }
    }

    #[test]
    fn oversized_item_is_rejected_without_side_effects() {
        let dir = tempdir().expect("tempdir");
        let queue = small_config(dir.path()).open().expect("open");

        let result = queue.enqueue(&[0u8; 65]);
        assert!(matches!(result, Err(Error::ItemTooLarge { len: 65, .. })));
        assert!(!queue.has_items());
        assert_eq!(queue.statistics().unwrap().total_enqueued_items, 0);
    }

    #[test]
    fn item_above_batch_budget_is_rejected_when_configured() {
        let dir = tempdir().expect("tempdir");
        let config = QueueConfiguration {
            max_dequeue_batch_bytes: Some(16),
            ..small_config(dir.path())
        };
        let queue = config.open().expect("open");

        assert!(matches!(
            queue.enqueue(&[0u8; 17]),
            Err(Error::ItemExceedsBatchLimit {
                len: 17,
                max_bytes: 16
            })
        ));

        // with the policy relaxed the same item is accepted
        queue.close();
        let config = QueueConfiguration {
            max_dequeue_batch_bytes: Some(16),
            reject_oversized_items: false,
            ..small_config(dir.path())
        };
        let queue = config.open().expect("reopen");
        queue.enqueue(&[0u8; 17]).expect("enqueue oversized");
        assert!(queue.has_items());
    }

    #[test]
    fn statistics_on_fresh_queue_are_zero() {
        let dir = tempdir().expect("tempdir");
        let queue = small_config(dir.path()).open().expect("open");

        let stats = queue.statistics().expect("statistics");
        assert_eq!(stats, QueueStatistics::default());
    }

    #[tokio::test]
    async fn reject_leaves_items_in_place() {
        let dir = tempdir().expect("tempdir");
        let queue = small_config(dir.path()).open().expect("open");
        queue.enqueue(b"keep me").expect("enqueue");

        let result = queue
            .dequeue_batch(1, 10, CancellationToken::new())
            .await
            .expect("dequeue");
        assert_eq!(result.items().len(), 1);
        result.reject();

        assert!(queue.has_items());
        let again = queue
            .dequeue_batch(1, 10, CancellationToken::new())
            .await
            .expect("dequeue again");
        assert_eq!(again.items()[0], b"keep me");
    }
}
