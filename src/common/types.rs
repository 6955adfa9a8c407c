use std::sync::Arc;
use parking_lot::lock_api::{ArcRwLockReadGuard, ArcRwLockWriteGuard};
use parking_lot::{RawRwLock, RwLock};
use serde::{Deserialize, Serialize};

/// Page size in bytes (4KB)
pub const PAGE_SIZE: usize = 4096;

/// Page ID type
pub type PageId = i32;

/// Reserved id for a frame that holds no page
pub const INVALID_PAGE_ID: PageId = -1;

/// Page 0 holds the index-name -> root-page-id registry
pub const HEADER_PAGE_ID: PageId = 0;

/// Transaction ID type
pub type TxnId = u32;

/// Table object ID type
pub type TableOid = u32;

/// Buffer pool frame ID type
pub type FrameId = usize;

/// LSN (Log Sequence Number) type
pub type Lsn = u64;

/// Record ID: the location of a tuple inside a table heap. Used as the
/// value type of the B+-tree index and as the row identifier of the lock
/// manager.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Rid {
    pub page_id: PageId,
    pub slot: u32,
}

impl Rid {
    pub fn new(page_id: PageId, slot: u32) -> Self {
        Self { page_id, slot }
    }
}

/// Page structure. The `RwLock` wrapping a page is its latch; `lsn` is a
/// hook for an external log manager and is never interpreted here.
#[derive(Debug, Clone)]
pub struct Page {
    pub data: [u8; PAGE_SIZE],
    pub page_id: PageId,
    pub lsn: Lsn,
}

impl Page {
    pub fn new(page_id: PageId) -> Self {
        Self {
            data: [0; PAGE_SIZE],
            page_id,
            lsn: 0,
        }
    }

    /// Zero the contents and reset metadata, keeping the allocation.
    pub fn reset(&mut self) {
        self.data.fill(0);
        self.page_id = INVALID_PAGE_ID;
        self.lsn = 0;
    }
}

/// Smart pointer to a page
pub type PagePtr = Arc<RwLock<Page>>;

/// Owned read latch on a page, storable beyond the scope that acquired it
pub type PageReadGuard = ArcRwLockReadGuard<RawRwLock, Page>;

/// Owned write latch on a page; the transaction page set holds these across
/// the whole descent of a structurally-modifying B+-tree operation
pub type PageWriteGuard = ArcRwLockWriteGuard<RawRwLock, Page>;

/// Buffer pool frame structure
#[derive(Debug)]
pub struct Frame {
    pub page: PagePtr,
    pub frame_id: FrameId,
    pub is_dirty: bool,
    pub pin_count: u32,
}

impl Frame {
    pub fn new(frame_id: FrameId, page: PagePtr) -> Self {
        Self {
            page,
            frame_id,
            is_dirty: false,
            pin_count: 0,
        }
    }
}

/// Smart pointer to a frame
pub type FramePtr = Arc<RwLock<Frame>>;
