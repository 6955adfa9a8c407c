use std::sync::Arc;

use anyhow::Result;
use tempfile::NamedTempFile;

use stratadb::storage::buffer::BufferPoolManager;

// Capture log output when a test runs with RUST_LOG set
#[allow(dead_code)]
pub fn init_test_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// Create a temporary database file for testing
#[allow(dead_code)]
pub fn create_temp_db_file() -> Result<(NamedTempFile, String)> {
    let file = NamedTempFile::new()?;
    let path = file.path().to_str().unwrap().to_string();
    Ok((file, path))
}

// Create a buffer pool manager over a temporary database. The temp file is
// returned so it outlives the pool.
#[allow(dead_code)]
pub fn create_test_buffer_pool(
    pool_size: usize,
    replacer_k: usize,
) -> Result<(Arc<BufferPoolManager>, NamedTempFile)> {
    let (file, path) = create_temp_db_file()?;
    let buffer_pool = Arc::new(BufferPoolManager::new(pool_size, replacer_k, path)?);
    Ok((buffer_pool, file))
}
