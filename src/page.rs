//! A fixed-size memory-mapped page file.
//!
//! One `Page` backs one logical page index of a single kind (meta, index or
//! data). Views are bounded byte ranges handed out under a read-write lock;
//! writes through a view are immediately visible to subsequent reads. A page
//! keeps its mapping until it is deleted or its owning cache drops it.

use std::fs::OpenOptions;
use std::io;
use std::path::{Path, PathBuf};

use memmap2::{MmapMut, MmapOptions};
use parking_lot::{
    MappedRwLockReadGuard, MappedRwLockWriteGuard, RwLock, RwLockReadGuard, RwLockWriteGuard,
};

use crate::{Error, Result};

pub struct Page {
    index: u64,
    path: PathBuf,
    len: u64,
    // None once the page has been deleted
    map: RwLock<Option<MmapMut>>,
}

/// Read-only view of a byte range within a page.
pub type PageReadView<'a> = MappedRwLockReadGuard<'a, [u8]>;

/// Writable view of a byte range within a page.
pub type PageWriteView<'a> = MappedRwLockWriteGuard<'a, [u8]>;

impl Page {
    /// Opens the backing file at `path`, creating and sizing it if absent,
    /// and maps it read-write.
    pub fn open(path: &Path, len: u64, index: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "page length must be non-zero",
            )));
        }
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .open(path)?;
        if file.metadata()?.len() != len {
            file.set_len(len)?;
        }
        let map = unsafe { MmapOptions::new().len(len as usize).map_mut(&file)? };
        Ok(Self {
            index,
            path: path.to_path_buf(),
            len,
            map: RwLock::new(Some(map)),
        })
    }

    pub fn index(&self) -> u64 {
        self.index
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Returns a read view of `len` bytes starting at `offset`.
    pub fn read_view(&self, offset: u64, len: u64) -> Result<PageReadView<'_>> {
        let (start, end) = self.check_range(offset, len)?;
        let guard = self.map.read();
        RwLockReadGuard::try_map(guard, |map| {
            map.as_ref().map(|map| &map[start..end])
        })
        .map_err(|_| Error::Closed)
    }

    /// Returns a writable view of `len` bytes starting at `offset`.
    pub fn write_view(&self, offset: u64, len: u64) -> Result<PageWriteView<'_>> {
        let (start, end) = self.check_range(offset, len)?;
        let guard = self.map.write();
        RwLockWriteGuard::try_map(guard, |map| {
            map.as_mut().map(|map| &mut map[start..end])
        })
        .map_err(|_| Error::Closed)
    }

    /// Unmaps the page and removes its backing file.
    ///
    /// Subsequent view requests fail with [`Error::Closed`]. Safe to call if
    /// the file is already gone.
    pub fn delete(&self) -> Result<()> {
        let mut guard = self.map.write();
        *guard = None;
        drop(guard);
        delete_file(&self.path)
    }

    fn check_range(&self, offset: u64, len: u64) -> Result<(usize, usize)> {
        let end = offset.checked_add(len).filter(|&end| end <= self.len);
        match end {
            Some(end) => Ok((offset as usize, end as usize)),
            None => Err(Error::RangeOutOfBounds {
                offset,
                len,
                page_size: self.len,
            }),
        }
    }
}

/// Removes a page file, tolerating its absence.
pub fn delete_file(path: &Path) -> Result<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}
