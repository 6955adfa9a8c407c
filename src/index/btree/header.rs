use byteorder::{ByteOrder, LittleEndian};

use crate::common::types::{Page, PageId, PAGE_SIZE};

const RECORD_COUNT_OFFSET: usize = 0;
const RECORDS_OFFSET: usize = 4;
const NAME_SIZE: usize = 32;
const RECORD_SIZE: usize = NAME_SIZE + 4;
const MAX_RECORDS: usize = (PAGE_SIZE - RECORDS_OFFSET) / RECORD_SIZE;

/// View over the reserved header page (page 0): a registry mapping index
/// names to their root page ids. Names longer than 32 bytes are rejected.
pub struct RootRegistry;

impl RootRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn record_count(&self, page: &Page) -> usize {
        LittleEndian::read_u32(&page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4]) as usize
    }

    fn set_record_count(&self, page: &mut Page, count: usize) {
        LittleEndian::write_u32(
            &mut page.data[RECORD_COUNT_OFFSET..RECORD_COUNT_OFFSET + 4],
            count as u32,
        );
    }

    fn record_offset(index: usize) -> usize {
        RECORDS_OFFSET + index * RECORD_SIZE
    }

    fn find_index(&self, page: &Page, name: &str) -> Option<usize> {
        let mut padded = [0u8; NAME_SIZE];
        if name.len() > NAME_SIZE {
            return None;
        }
        padded[..name.len()].copy_from_slice(name.as_bytes());
        (0..self.record_count(page)).find(|&i| {
            let offset = Self::record_offset(i);
            page.data[offset..offset + NAME_SIZE] == padded
        })
    }

    /// Register a new index. Fails if the name is taken, too long, or the
    /// page is full.
    pub fn insert_record(&self, page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        if name.is_empty() || name.len() > NAME_SIZE {
            return false;
        }
        let count = self.record_count(page);
        if count >= MAX_RECORDS || self.find_index(page, name).is_some() {
            return false;
        }
        let offset = Self::record_offset(count);
        page.data[offset..offset + NAME_SIZE].fill(0);
        page.data[offset..offset + name.len()].copy_from_slice(name.as_bytes());
        LittleEndian::write_i32(
            &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
            root_page_id,
        );
        self.set_record_count(page, count + 1);
        true
    }

    /// Point an existing record at a new root page.
    pub fn update_record(&self, page: &mut Page, name: &str, root_page_id: PageId) -> bool {
        match self.find_index(page, name) {
            Some(i) => {
                let offset = Self::record_offset(i);
                LittleEndian::write_i32(
                    &mut page.data[offset + NAME_SIZE..offset + RECORD_SIZE],
                    root_page_id,
                );
                true
            }
            None => false,
        }
    }

    /// Drop a record, compacting the ones after it.
    pub fn delete_record(&self, page: &mut Page, name: &str) -> bool {
        let Some(index) = self.find_index(page, name) else {
            return false;
        };
        let count = self.record_count(page);
        let start = Self::record_offset(index);
        let end = Self::record_offset(count);
        page.data.copy_within(start + RECORD_SIZE..end, start);
        page.data[end - RECORD_SIZE..end].fill(0);
        self.set_record_count(page, count - 1);
        true
    }

    pub fn find_record(&self, page: &Page, name: &str) -> Option<PageId> {
        self.find_index(page, name).map(|i| {
            let offset = Self::record_offset(i);
            LittleEndian::read_i32(&page.data[offset + NAME_SIZE..offset + RECORD_SIZE])
        })
    }
}

impl Default for RootRegistry {
    fn default() -> Self {
        Self::new()
    }
}
