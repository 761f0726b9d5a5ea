//! Buffer pool behavior.

use nbconn::{MemoryManager, SharedMemoryManager, UnsyncMemoryManager};
use std::sync::Arc;
use std::thread;

#[test]
fn acquire_uses_preallocation_size() {
    let memory = UnsyncMemoryManager::new(128, 16);
    let buffer = memory.acquire(1);
    assert_eq!(buffer.len(), 128);
    assert!(buffer.iter().all(|&b| b == 0));

    let big = memory.acquire(500);
    assert_eq!(big.len(), 500);
}

#[test]
fn remainder_is_reused_after_extract() {
    let memory = UnsyncMemoryManager::new(128, 16);

    let mut buffer = memory.acquire(1);
    buffer[..10].copy_from_slice(b"0123456789");
    let data = memory.extract_and_recycle(buffer, 10);

    assert_eq!(&data[..], b"0123456789");
    assert_eq!(memory.pooled_size(), 118);

    // The next read continues right behind the extracted bytes
    let next = memory.acquire(1);
    assert_eq!(next.len(), 118);
    assert_eq!(next.as_ptr(), data.as_ptr().wrapping_add(10));
    assert_eq!(memory.pooled_size(), 0);
}

#[test]
fn small_remainders_are_dropped() {
    let memory = UnsyncMemoryManager::new(128, 64);

    let buffer = memory.acquire(1);
    let data = memory.extract_and_recycle(buffer, 100);
    assert_eq!(data.len(), 100);
    assert_eq!(memory.pooled_size(), 0);

    // A pooled buffer smaller than requested is replaced
    let buffer = memory.acquire(1);
    memory.recycle(buffer);
    let larger = memory.acquire(256);
    assert_eq!(larger.len(), 256);
}

#[test]
fn shared_pool_is_bounded() {
    let memory = SharedMemoryManager::with_limit(64, 8, 2);

    let buffers: Vec<_> = (0..3).map(|_| memory.acquire(1)).collect();
    for buffer in buffers {
        memory.recycle(buffer);
    }
    assert_eq!(memory.pooled_size(), 128);
    assert_eq!(memory.preallocation_size(), 64);
}

#[test]
fn shared_pool_across_threads() {
    let memory = Arc::new(SharedMemoryManager::new(1024, 64));

    let threads: Vec<_> = (0..4u8)
        .map(|n| {
            let memory = memory.clone();
            thread::spawn(move || {
                for _ in 0..100 {
                    let mut buffer = memory.acquire(32);
                    buffer[..32].fill(n);
                    let data = memory.extract_and_recycle(buffer, 32);
                    assert!(data.iter().all(|&b| b == n));
                }
            })
        })
        .collect();

    for thread in threads {
        thread.join().unwrap();
    }
    assert!(memory.pooled_size() <= 32 * 1024);
}
