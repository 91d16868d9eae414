//! Fixed-size page I/O over a backing file.
//!
//! The page array is the lowest layer: it reads and writes whole pages
//! by id with positioned I/O and knows nothing about headers, free
//! lists, or trees. Striping and encryption wrap this trait as
//! decorators and are out of scope here.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use keel_common::error::{KeelError, KeelResult};
use keel_common::types::PageId;

/// Fixed-size page read/write/sync over a backing store.
pub trait PageArray: Send + Sync {
    /// Returns the page size in bytes.
    fn page_size(&self) -> usize;

    /// Returns the number of pages the backing store currently holds.
    fn page_count(&self) -> KeelResult<u64>;

    /// Truncates or extends the backing store to `count` pages.
    fn set_page_count(&self, count: u64) -> KeelResult<()>;

    /// Returns true if the backing store holds no pages at all.
    fn is_empty(&self) -> KeelResult<bool> {
        Ok(self.page_count()? == 0)
    }

    /// Reads a full page into `buf`.
    fn read_page(&self, id: PageId, buf: &mut [u8]) -> KeelResult<()>;

    /// Reads `buf.len()` bytes starting `start` bytes into the page.
    fn read_partial(&self, id: PageId, start: usize, buf: &mut [u8]) -> KeelResult<()>;

    /// Writes a full page from `buf`.
    fn write_page(&self, id: PageId, buf: &[u8]) -> KeelResult<()>;

    /// Writes a full page and syncs it durably before returning.
    fn write_page_durably(&self, id: PageId, buf: &[u8]) -> KeelResult<()>;

    /// Flushes all written pages. With `metadata`, file metadata (length)
    /// is flushed too.
    fn sync(&self, metadata: bool) -> KeelResult<()>;

    /// Closes the array. Every call after this fails.
    fn close(&self) -> KeelResult<()>;
}

/// A page array over a single file.
pub struct FilePageArray {
    file: File,
    path: PathBuf,
    page_size: usize,
    closed: AtomicBool,
}

impl FilePageArray {
    /// Opens (creating as needed) a page array over one file.
    pub fn open(path: impl AsRef<Path>, page_size: usize) -> KeelResult<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(&path)?;
        Ok(Self {
            file,
            path,
            page_size,
            closed: AtomicBool::new(false),
        })
    }

    /// Returns the backing file path.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn check_open(&self) -> KeelResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(KeelError::Closed);
        }
        Ok(())
    }

    fn offset_of(&self, id: PageId, start: usize) -> u64 {
        id.as_u64() * self.page_size as u64 + start as u64
    }
}

impl PageArray for FilePageArray {
    fn page_size(&self) -> usize {
        self.page_size
    }

    fn page_count(&self) -> KeelResult<u64> {
        self.check_open()?;
        let len = self.file.metadata()?.len();
        Ok(len / self.page_size as u64)
    }

    fn set_page_count(&self, count: u64) -> KeelResult<()> {
        self.check_open()?;
        self.file.set_len(count * self.page_size as u64)?;
        Ok(())
    }

    fn read_page(&self, id: PageId, buf: &mut [u8]) -> KeelResult<()> {
        self.read_partial(id, 0, buf)
    }

    fn read_partial(&self, id: PageId, start: usize, buf: &mut [u8]) -> KeelResult<()> {
        self.check_open()?;
        debug_assert!(start + buf.len() <= self.page_size);
        self.file.read_exact_at(buf, self.offset_of(id, start))?;
        Ok(())
    }

    fn write_page(&self, id: PageId, buf: &[u8]) -> KeelResult<()> {
        self.check_open()?;
        debug_assert_eq!(buf.len(), self.page_size);
        self.file.write_all_at(buf, self.offset_of(id, 0))?;
        Ok(())
    }

    fn write_page_durably(&self, id: PageId, buf: &[u8]) -> KeelResult<()> {
        self.write_page(id, buf)?;
        self.file.sync_all()?;
        Ok(())
    }

    fn sync(&self, metadata: bool) -> KeelResult<()> {
        self.check_open()?;
        if metadata {
            self.file.sync_all()?;
        } else {
            self.file.sync_data()?;
        }
        Ok(())
    }

    fn close(&self) -> KeelResult<()> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_round_trip() {
        let dir = tempdir().unwrap();
        let array = FilePageArray::open(dir.path().join("pages.db"), 512).unwrap();
        assert!(array.is_empty().unwrap());

        let page = vec![0xabu8; 512];
        array.write_page(PageId::new(3), &page).unwrap();
        assert_eq!(array.page_count().unwrap(), 4);

        let mut buf = vec![0u8; 512];
        array.read_page(PageId::new(3), &mut buf).unwrap();
        assert_eq!(buf, page);
    }

    #[test]
    fn test_read_partial() {
        let dir = tempdir().unwrap();
        let array = FilePageArray::open(dir.path().join("pages.db"), 512).unwrap();

        let mut page = vec![0u8; 512];
        page[100..104].copy_from_slice(b"keel");
        array.write_page(PageId::new(0), &page).unwrap();

        let mut buf = [0u8; 4];
        array.read_partial(PageId::new(0), 100, &mut buf).unwrap();
        assert_eq!(&buf, b"keel");
    }

    #[test]
    fn test_closed_array_fails() {
        let dir = tempdir().unwrap();
        let array = FilePageArray::open(dir.path().join("pages.db"), 512).unwrap();
        array.close().unwrap();
        let mut buf = vec![0u8; 512];
        assert!(array.read_page(PageId::new(0), &mut buf).is_err());
        assert!(array.write_page(PageId::new(0), &buf).is_err());
    }

    #[test]
    fn test_set_page_count() {
        let dir = tempdir().unwrap();
        let array = FilePageArray::open(dir.path().join("pages.db"), 512).unwrap();
        array.set_page_count(8).unwrap();
        assert_eq!(array.page_count().unwrap(), 8);
        array.set_page_count(2).unwrap();
        assert_eq!(array.page_count().unwrap(), 2);
    }
}
