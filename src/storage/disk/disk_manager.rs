use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;
use parking_lot::Mutex;
use thiserror::Error;

use crate::common::types::{Page, PageId, INVALID_PAGE_ID, PAGE_SIZE};

#[derive(Error, Debug)]
pub enum DiskManagerError {
    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),
}

/// DiskManager is responsible for the actual disk I/O: a block-addressable
/// persistent array of fixed-size pages backed by one file.
pub struct DiskManager {
    db_file: Mutex<File>,
}

impl DiskManager {
    /// Create a new DiskManager over the specified database file
    pub fn new(db_path: impl AsRef<Path>) -> Result<Self, DiskManagerError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .open(db_path)?;

        Ok(Self {
            db_file: Mutex::new(file),
        })
    }

    /// Read a page from disk. Reading a page the file does not yet cover
    /// yields a zeroed page: allocation is lazy and pages are materialized
    /// on first write-back.
    pub fn read_page(&self, page_id: PageId, page: &mut Page) -> Result<(), DiskManagerError> {
        if page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page_id));
        }

        let offset = Self::page_offset(page_id);
        let mut buffer = [0u8; PAGE_SIZE];

        {
            let mut file = self.db_file.lock();
            let file_size = file.metadata()?.len();

            if offset + PAGE_SIZE as u64 <= file_size {
                file.seek(SeekFrom::Start(offset))?;
                file.read_exact(&mut buffer)?;
            }
        }

        page.data.copy_from_slice(&buffer);
        page.page_id = page_id;
        Ok(())
    }

    /// Write a page to disk at its page-id offset
    pub fn write_page(&self, page: &Page) -> Result<(), DiskManagerError> {
        if page.page_id < 0 {
            return Err(DiskManagerError::InvalidPageId(page.page_id));
        }

        let offset = Self::page_offset(page.page_id);

        let mut file = self.db_file.lock();
        // Pad the file when writing past the current end so intermediate
        // pages read back as zeros.
        let file_size = file.metadata()?.len();
        if offset > file_size {
            file.seek(SeekFrom::End(0))?;
            let zeros = vec![0u8; (offset - file_size) as usize];
            file.write_all(&zeros)?;
        }
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(&page.data)?;
        file.flush()?;
        Ok(())
    }

    /// Release a page on disk. Space is not reclaimed; this is the hook the
    /// buffer pool calls when a page is deleted.
    pub fn deallocate_page(&self, page_id: PageId) {
        debug_assert!(page_id != INVALID_PAGE_ID);
        log::debug!("deallocated page {}", page_id);
    }

    /// Number of whole pages the backing file currently covers.
    pub fn num_pages(&self) -> Result<PageId, DiskManagerError> {
        let file = self.db_file.lock();
        let file_size = file.metadata()?.len();
        Ok((file_size / PAGE_SIZE as u64) as PageId)
    }

    fn page_offset(page_id: PageId) -> u64 {
        page_id as u64 * PAGE_SIZE as u64
    }
}
