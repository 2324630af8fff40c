use crossbeam_queue::ArrayQueue;
use once_cell::sync::Lazy;

const POOL_CAP: usize = 64;
const INITIAL_BUF: usize = 64 * 1024;

static POOL: Lazy<ArrayQueue<Vec<u8>>> = Lazy::new(|| ArrayQueue::new(POOL_CAP));

/// Borrow a buffer from the process-wide pool.
pub fn get() -> Vec<u8> {
    POOL.pop()
        .unwrap_or_else(|| Vec::with_capacity(INITIAL_BUF))
}

/// Return a buffer to the pool. The buffer is cleared before it becomes
/// available to other borrowers; if the pool is full it is dropped.
pub fn release(mut buf: Vec<u8>) {
    buf.clear();
    let _ = POOL.push(buf);
}
