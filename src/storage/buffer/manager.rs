use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use parking_lot::Mutex;

use crate::common::types::{Frame, FrameId, FramePtr, Page, PageId, PagePtr, INVALID_PAGE_ID};
use crate::container::ExtendibleHashTable;
use crate::storage::buffer::error::BufferPoolError;
use crate::storage::buffer::replacer::LruKReplacer;
use crate::storage::disk::DiskManager;

const DIRECTORY_BUCKET_SIZE: usize = 8;

/// State guarded by the single pool latch. Every public operation holds
/// this latch for its whole duration; disk I/O happens under it.
struct PoolInner {
    free_list: VecDeque<FrameId>,
    next_page_id: PageId,
}

/// Fixed-size page-frame buffer pool. Pages are looked up through an
/// extendible-hash directory, victims are chosen by an LRU-K replacer, and
/// a frame is reused only after a dirty occupant has been written back.
pub struct BufferPoolManager {
    pool_size: usize,
    frames: Vec<FramePtr>,
    page_table: ExtendibleHashTable<PageId, FrameId>,
    replacer: Mutex<LruKReplacer>,
    disk_manager: Arc<DiskManager>,
    latch: Mutex<PoolInner>,
}

impl BufferPoolManager {
    pub fn new(
        pool_size: usize,
        replacer_k: usize,
        db_path: impl AsRef<Path>,
    ) -> Result<Self, BufferPoolError> {
        let disk_manager = Arc::new(DiskManager::new(&db_path)?);
        let mut frames = Vec::with_capacity(pool_size);
        let mut free_list = VecDeque::with_capacity(pool_size);

        for frame_id in 0..pool_size {
            let page = Arc::new(parking_lot::RwLock::new(Page::new(INVALID_PAGE_ID)));
            frames.push(Arc::new(parking_lot::RwLock::new(Frame::new(frame_id, page))));
            free_list.push_back(frame_id);
        }

        // Resume the page-id counter past whatever the file already holds;
        // page 0 stays reserved for the root registry.
        let next_page_id = disk_manager.num_pages()?.max(1);

        Ok(Self {
            pool_size,
            frames,
            page_table: ExtendibleHashTable::new(DIRECTORY_BUCKET_SIZE),
            replacer: Mutex::new(LruKReplacer::new(pool_size, replacer_k)),
            disk_manager,
            latch: Mutex::new(PoolInner {
                free_list,
                next_page_id,
            }),
        })
    }

    pub fn pool_size(&self) -> usize {
        self.pool_size
    }

    /// Allocate a fresh page id, place it in a frame, and return it pinned.
    pub fn new_page(&self) -> Result<(PagePtr, PageId), BufferPoolError> {
        let mut inner = self.latch.lock();
        let frame_id = self.acquire_frame(&mut inner)?;
        let page_id = inner.next_page_id;
        inner.next_page_id += 1;

        {
            let mut frame_guard = self.frames[frame_id].write();
            {
                let mut page_guard = frame_guard.page.write();
                page_guard.reset();
                page_guard.page_id = page_id;
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
        }

        self.page_table.insert(page_id, frame_id);
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }

        let page = self.frames[frame_id].read().page.clone();
        Ok((page, page_id))
    }

    /// Return a pinned pointer to the requested page, reading it from disk
    /// if it is not resident. Fails with `NoFreeFrames` when every frame is
    /// pinned, and with `InvalidPageId` for ids never allocated.
    pub fn fetch_page(&self, page_id: PageId) -> Result<PagePtr, BufferPoolError> {
        let mut inner = self.latch.lock();
        if page_id < 0 || page_id >= inner.next_page_id {
            return Err(BufferPoolError::InvalidPageId(page_id));
        }

        if let Some(frame_id) = self.page_table.find(&page_id) {
            let page = {
                let mut frame_guard = self.frames[frame_id].write();
                frame_guard.pin_count += 1;
                frame_guard.page.clone()
            };
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
            return Ok(page);
        }

        let frame_id = self.acquire_frame(&mut inner)?;
        {
            let mut frame_guard = self.frames[frame_id].write();
            {
                let mut page_guard = frame_guard.page.write();
                self.disk_manager.read_page(page_id, &mut page_guard)?;
            }
            frame_guard.pin_count = 1;
            frame_guard.is_dirty = false;
        }

        self.page_table.insert(page_id, frame_id);
        {
            let mut replacer = self.replacer.lock();
            replacer.record_access(frame_id);
            replacer.set_evictable(frame_id, false);
        }

        let page = self.frames[frame_id].read().page.clone();
        Ok(page)
    }

    /// Drop one pin on a page. Returns `true` as a no-op when the page is
    /// not resident and `false` when its pin count is already zero. The
    /// dirty flag sticks once set.
    pub fn unpin_page(&self, page_id: PageId, is_dirty: bool) -> bool {
        let _inner = self.latch.lock();
        let frame_id = match self.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return true,
        };

        let mut frame_guard = self.frames[frame_id].write();
        if frame_guard.pin_count == 0 {
            return false;
        }
        frame_guard.pin_count -= 1;
        if is_dirty {
            frame_guard.is_dirty = true;
        }
        if frame_guard.pin_count == 0 {
            self.replacer.lock().set_evictable(frame_id, true);
        }
        true
    }

    /// Write a resident page to disk and clear its dirty flag. Callers must
    /// not hold the page's write latch (checkpoint discipline).
    pub fn flush_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let _inner = self.latch.lock();
        if page_id == INVALID_PAGE_ID {
            return Ok(false);
        }
        let frame_id = match self.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return Ok(false),
        };

        let mut frame_guard = self.frames[frame_id].write();
        {
            let page_guard = frame_guard.page.read();
            self.disk_manager.write_page(&page_guard)?;
        }
        frame_guard.is_dirty = false;
        Ok(true)
    }

    /// Flush every resident page to disk.
    pub fn flush_all(&self) -> Result<(), BufferPoolError> {
        let _inner = self.latch.lock();
        for frame in &self.frames {
            let mut frame_guard = frame.write();
            let page_id = frame_guard.page.read().page_id;
            if page_id == INVALID_PAGE_ID {
                continue;
            }
            {
                let page_guard = frame_guard.page.read();
                self.disk_manager.write_page(&page_guard)?;
            }
            frame_guard.is_dirty = false;
        }
        Ok(())
    }

    /// Drop a page from the pool and deallocate it on disk. Returns
    /// `Ok(true)` when the page is gone (or was never resident) and
    /// `Ok(false)` when it is pinned and cannot be deleted.
    pub fn delete_page(&self, page_id: PageId) -> Result<bool, BufferPoolError> {
        let mut inner = self.latch.lock();
        let frame_id = match self.page_table.find(&page_id) {
            Some(frame_id) => frame_id,
            None => return Ok(true),
        };

        let mut frame_guard = self.frames[frame_id].write();
        if frame_guard.pin_count > 0 {
            return Ok(false);
        }

        self.page_table.remove(&page_id);
        self.replacer.lock().remove(frame_id);
        frame_guard.page.write().reset();
        frame_guard.is_dirty = false;
        inner.free_list.push_back(frame_id);
        drop(frame_guard);

        self.disk_manager.deallocate_page(page_id);
        Ok(true)
    }

    /// Current pin count of a resident page, for tests and invariants.
    pub fn pin_count(&self, page_id: PageId) -> Option<u32> {
        let _inner = self.latch.lock();
        let frame_id = self.page_table.find(&page_id)?;
        Some(self.frames[frame_id].read().pin_count)
    }

    /// Number of frames currently on the free list.
    pub fn free_frame_count(&self) -> usize {
        self.latch.lock().free_list.len()
    }

    /// Pick a reusable frame: free list first, then the replacer. A dirty
    /// victim is written back before its frame is handed out, and its
    /// directory entry is removed.
    fn acquire_frame(&self, inner: &mut PoolInner) -> Result<FrameId, BufferPoolError> {
        if let Some(frame_id) = inner.free_list.pop_front() {
            return Ok(frame_id);
        }

        let frame_id = self
            .replacer
            .lock()
            .evict()
            .ok_or(BufferPoolError::NoFreeFrames)?;

        let mut frame_guard = self.frames[frame_id].write();
        let old_page_id = {
            let page_guard = frame_guard.page.read();
            if frame_guard.is_dirty {
                self.disk_manager.write_page(&page_guard)?;
            }
            page_guard.page_id
        };
        frame_guard.is_dirty = false;
        if old_page_id != INVALID_PAGE_ID {
            self.page_table.remove(&old_page_id);
            log::debug!("evicted page {} from frame {}", old_page_id, frame_id);
        }
        Ok(frame_id)
    }

    /// The disk manager backing this pool.
    pub fn disk_manager(&self) -> &Arc<DiskManager> {
        &self.disk_manager
    }
}
