use thiserror::Error;
use crate::common::types::PageId;
use crate::storage::disk::DiskManagerError;

#[derive(Error, Debug)]
pub enum BufferPoolError {
    #[error("Invalid page ID: {0}")]
    InvalidPageId(PageId),

    #[error("No free frames available: every frame is pinned")]
    NoFreeFrames,

    #[error("Disk manager error: {0}")]
    DiskManagerError(#[from] DiskManagerError),
}
