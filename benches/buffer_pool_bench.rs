use criterion::{criterion_group, criterion_main, Criterion};
use tempfile::NamedTempFile;

use stratadb::storage::buffer::BufferPoolManager;

fn bench_new_and_unpin(c: &mut Criterion) {
    let file = NamedTempFile::new().unwrap();
    let pool = BufferPoolManager::new(64, 2, file.path()).unwrap();

    c.bench_function("new_page_unpin", |b| {
        b.iter(|| {
            let (_page, page_id) = pool.new_page().unwrap();
            pool.unpin_page(page_id, false);
        })
    });
}

fn bench_fetch_resident(c: &mut Criterion) {
    let file = NamedTempFile::new().unwrap();
    let pool = BufferPoolManager::new(64, 2, file.path()).unwrap();
    let (_page, page_id) = pool.new_page().unwrap();
    pool.unpin_page(page_id, true);

    c.bench_function("fetch_resident_page", |b| {
        b.iter(|| {
            let _page = pool.fetch_page(page_id).unwrap();
            pool.unpin_page(page_id, false);
        })
    });
}

criterion_group!(benches, bench_new_and_unpin, bench_fetch_resident);
criterion_main!(benches);
