//! Page lifecycle management for one page kind.
//!
//! A `PageFactory` owns the directory for a single page kind (meta, index or
//! data) and hands out cached, reference-counted [`Page`] handles by logical
//! page index. Deletion routes through the cache when the page is open and
//! falls back to removing the file directly when it is not (a page may never
//! have been opened in this process, e.g. after a restart).

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use log::trace;

use crate::cache::Cache;
use crate::page::{self, Page};
use crate::{Error, Result};

const PAGE_FILE_PREFIX: &str = "page-";
const PAGE_FILE_SUFFIX: &str = ".dat";

/// Default idle TTL for cached page handles.
pub const DEFAULT_PAGE_TTL: Duration = Duration::from_secs(10);

pub struct PageFactory {
    dir: PathBuf,
    page_size: u64,
    cache: Cache<u64, Page>,
    closed: AtomicBool,
}

impl PageFactory {
    /// Creates a factory for `page_size`-byte pages under `dir`, creating
    /// the directory if needed.
    pub fn new(page_size: u64, dir: impl Into<PathBuf>, ttl: Option<Duration>) -> Result<Self> {
        let dir = dir.into();
        std::fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            page_size,
            cache: Cache::new(ttl.unwrap_or(DEFAULT_PAGE_TTL)),
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the open page for `index`, mapping its file on first access.
    /// Pair every call with a [`release_page`](Self::release_page).
    pub fn get_page(&self, index: u64) -> Result<Arc<Page>> {
        self.check_open()?;
        let path = self.page_path(index);
        self.cache
            .get_or_create(index, || Page::open(&path, self.page_size, index))
    }

    /// Releases one reference taken by [`get_page`](Self::get_page).
    pub fn release_page(&self, index: u64) -> Result<()> {
        self.check_open()?;
        self.cache.release(&index);
        Ok(())
    }

    /// Deletes the page file for `index`, evicting the open handle first if
    /// one is cached. Missing files are tolerated on both paths.
    pub fn delete_page(&self, index: u64) -> Result<()> {
        self.check_open()?;
        trace!("deleting page {} under {}", index, self.dir.display());
        match self.cache.try_remove(&index) {
            Some(page) => page.delete(),
            None => page::delete_file(&self.page_path(index)),
        }
    }

    /// Path of the backing file for `index`.
    pub fn page_path(&self, index: u64) -> PathBuf {
        self.dir
            .join(format!("{PAGE_FILE_PREFIX}{index}{PAGE_FILE_SUFFIX}"))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Tears down the page cache. Idempotent; later calls on this factory
    /// fail with [`Error::Closed`].
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.cache.close();
    }

    fn check_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::Closed);
        }
        Ok(())
    }
}

impl Drop for PageFactory {
    fn drop(&mut self) {
        self.close();
    }
}
