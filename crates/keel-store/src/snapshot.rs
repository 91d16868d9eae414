//! Full-database snapshot streams and restore.
//!
//! A snapshot is the committed image streamed as raw pages in ascending
//! id order, beginning with page 0. Restore is the inverse: it sniffs
//! the page size from the first 512 bytes and writes pages into an
//! empty destination.

use std::io::{Read, Write};
use std::path::Path;

use tracing::debug;

use keel_common::config::DbConfig;
use keel_common::constants::HEADER_SIZE;
use keel_common::error::{KeelError, KeelResult};
use keel_common::types::PageId;

use crate::array::{FilePageArray, PageArray};
use crate::db::{PageDb, DB_MAGIC};

impl PageDb {
    /// Streams a coherent snapshot of the last commit into `out`.
    ///
    /// The commit lock is held shared for the duration, so page
    /// mutations proceed but no commit can land mid-stream; combined
    /// with copy-on-write, every page the committed header references
    /// is streamed exactly as committed.
    pub fn write_snapshot(&self, out: &mut dyn Write) -> KeelResult<u64> {
        let _guard = self.commit_lock_shared();

        // The committed header bounds the visible pages.
        let mut header = [0u8; HEADER_SIZE];
        let header_page = PageId::new(u64::from(self.commit_number() & 1));
        self.read_partial(header_page, 0, &mut header)?;
        let total_pages = u64::from_le_bytes(header[36..44].try_into().unwrap());

        let mut page = vec![0u8; self.page_size()];
        for id in 0..total_pages {
            self.read_page(PageId::new(id), &mut page)?;
            out.write_all(&page)?;
        }
        debug!(total_pages, "snapshot written");
        Ok(total_pages)
    }
}

/// Restores a snapshot stream into an empty destination file and opens
/// the restored database.
///
/// The page size is detected from the stream's first 512 bytes; the
/// provided configuration is used for everything else.
pub fn restore_from_snapshot(
    input: &mut dyn Read,
    path: impl AsRef<Path>,
    config: &DbConfig,
) -> KeelResult<PageDb> {
    let path = path.as_ref();
    if path.exists() && std::fs::metadata(path)?.len() > 0 {
        return Err(KeelError::invalid_argument(
            "snapshot restore requires an empty destination",
        ));
    }

    let mut first = [0u8; HEADER_SIZE];
    input.read_exact(&mut first)?;

    let magic = u64::from_le_bytes(first[0..8].try_into().unwrap());
    if magic != DB_MAGIC {
        return Err(KeelError::corruption("snapshot does not begin with a header"));
    }
    let page_size = u32::from_le_bytes(first[24..28].try_into().unwrap()) as usize;
    if !(512..=65536).contains(&page_size) || !page_size.is_power_of_two() {
        return Err(KeelError::corruption(format!(
            "snapshot header claims page size {}",
            page_size
        )));
    }

    let array = FilePageArray::open(path, page_size)?;
    let mut page = vec![0u8; page_size];
    page[..HEADER_SIZE].copy_from_slice(&first);
    input.read_exact(&mut page[HEADER_SIZE..])?;
    array.write_page(PageId::new(0), &page)?;

    let mut id = 1u64;
    loop {
        match read_full_page(input, &mut page)? {
            false => break,
            true => {
                array.write_page(PageId::new(id), &page)?;
                id += 1;
            }
        }
    }
    array.sync(true)?;
    array.close()?;
    debug!(pages = id, "snapshot restored");

    let mut config = config.clone();
    config.page_size = page_size;
    PageDb::open(path, &config, false)
}

/// Reads one full page, returning false at a clean end of stream.
fn read_full_page(input: &mut dyn Read, page: &mut [u8]) -> KeelResult<bool> {
    let mut filled = 0;
    while filled < page.len() {
        let n = input.read(&mut page[filled..])?;
        if n == 0 {
            if filled == 0 {
                return Ok(false);
            }
            return Err(KeelError::corruption("snapshot ends mid-page"));
        }
        filled += n;
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn config(page_size: usize) -> DbConfig {
        DbConfig {
            page_size,
            ..DbConfig::default()
        }
    }

    #[test]
    fn test_snapshot_restore_round_trip() {
        let dir = tempdir().unwrap();
        let db = PageDb::open(dir.path().join("src.db"), &config(4096), false).unwrap();

        let page_id = db.alloc_page().unwrap();
        let mut data = vec![0u8; 4096];
        data[..5].copy_from_slice(b"hello");
        db.write_page(page_id, &data).unwrap();
        db.commit(None, None).unwrap();

        let mut stream = Vec::new();
        db.write_snapshot(&mut stream).unwrap();

        let restored = restore_from_snapshot(
            &mut stream.as_slice(),
            dir.path().join("dst.db"),
            &config(4096),
        )
        .unwrap();

        assert_eq!(restored.database_id(), db.database_id());
        assert_eq!(restored.commit_number(), db.commit_number());

        let mut buf = vec![0u8; 4096];
        restored.read_page(page_id, &mut buf).unwrap();
        assert_eq!(&buf[..5], b"hello");
    }

    #[test]
    fn test_restore_rejects_non_empty_destination() {
        let dir = tempdir().unwrap();
        let dst = dir.path().join("dst.db");
        std::fs::write(&dst, b"occupied").unwrap();

        let err =
            restore_from_snapshot(&mut [0u8; 512].as_slice(), &dst, &config(4096)).unwrap_err();
        assert!(matches!(err, KeelError::InvalidArgument { .. }));
    }

    #[test]
    fn test_restore_detects_page_size() {
        let dir = tempdir().unwrap();
        let db = PageDb::open(dir.path().join("src.db"), &config(8192), false).unwrap();
        db.commit(None, None).unwrap();

        let mut stream = Vec::new();
        db.write_snapshot(&mut stream).unwrap();

        // Configured page size differs; the stream decides.
        let restored = restore_from_snapshot(
            &mut stream.as_slice(),
            dir.path().join("dst.db"),
            &config(4096),
        )
        .unwrap();
        assert_eq!(restored.page_size(), 8192);
    }
}
