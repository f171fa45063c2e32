// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::ops::{Deref, DerefMut};
use std::sync::{Arc, Mutex};

/// A pool of reusable byte buffers, all of one fixed capacity.
///
/// Borrowed buffers return their storage to the pool when dropped, on every
/// exit path, so a forwarding loop can borrow once per session without
/// allocating per copy. Handles are cheap clones over shared state and may be
/// used from any number of concurrent sessions.
///
/// Returned buffers are not zeroed; callers must only read bytes they have
/// themselves written in the current borrow.
#[derive(Debug, Clone)]
pub struct BufferPool {
  inner: Arc<PoolInner>,
}

#[derive(Debug)]
struct PoolInner {
  capacity: usize,
  free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
  /// Creates a pool whose buffers each hold exactly `capacity` bytes.
  pub fn new(capacity: usize) -> Self {
    Self {
      inner: Arc::new(PoolInner {
        capacity,
        free: Mutex::new(Vec::new()),
      }),
    }
  }

  /// The fixed length of every buffer this pool hands out.
  pub fn buffer_capacity(&self) -> usize {
    self.inner.capacity
  }

  /// Borrows a buffer, reusing returned storage when any is available.
  pub fn get(&self) -> PooledBuffer {
    let recycled = self
      .inner
      .free
      .lock()
      .ok()
      .and_then(|mut free| free.pop());
    let storage = recycled.unwrap_or_else(|| vec![0u8; self.inner.capacity]);
    PooledBuffer {
      pool: Arc::clone(&self.inner),
      storage: Some(storage),
    }
  }
}

/// A buffer borrowed from a [`BufferPool`]; dereferences to its full
/// fixed-capacity byte slice and returns the storage on drop.
#[derive(Debug)]
pub struct PooledBuffer {
  pool: Arc<PoolInner>,
  storage: Option<Vec<u8>>,
}

impl Deref for PooledBuffer {
  type Target = [u8];

  fn deref(&self) -> &Self::Target {
    self.storage.as_deref().unwrap_or(&[])
  }
}

impl DerefMut for PooledBuffer {
  fn deref_mut(&mut self) -> &mut Self::Target {
    self.storage.as_deref_mut().unwrap_or(&mut [])
  }
}

impl Drop for PooledBuffer {
  fn drop(&mut self) {
    if let Some(storage) = self.storage.take() {
      if let Ok(mut free) = self.pool.free.lock() {
        free.push(storage);
      }
      // A poisoned free-list only costs us the recycling; the next borrow
      // allocates fresh storage instead.
    }
  }
}

#[cfg(test)]
mod tests {
  use super::BufferPool;

  #[test]
  fn borrowed_buffers_have_pool_capacity() {
    let pool = BufferPool::new(128);
    let buffer = pool.get();
    assert_eq!(buffer.len(), 128);
    assert_eq!(pool.buffer_capacity(), 128);
  }

  #[test]
  fn returned_storage_is_reused() {
    let pool = BufferPool::new(16);
    let first_ptr = {
      let buffer = pool.get();
      buffer.as_ptr()
    };
    let buffer = pool.get();
    assert_eq!(
      first_ptr,
      buffer.as_ptr(),
      "A returned buffer must be handed out again by the next borrow"
    );
  }

  #[test]
  fn reused_buffers_keep_their_full_length() {
    let pool = BufferPool::new(8);
    {
      let mut buffer = pool.get();
      buffer[..5].copy_from_slice(b"hello");
    }
    let mut buffer = pool.get();
    assert_eq!(buffer.len(), 8);
    // Contents from the prior borrow may remain; writing our own prefix and
    // reading only that much must observe exactly what we wrote.
    buffer[..3].copy_from_slice(b"abc");
    assert_eq!(&buffer[..3], b"abc");
  }

  #[tokio::test]
  async fn concurrent_borrows_are_independent() {
    let pool = BufferPool::new(32);
    let mut tasks = Vec::new();
    for fill in 0u8..8 {
      let pool = pool.clone();
      tasks.push(tokio::spawn(async move {
        let mut buffer = pool.get();
        for slot in buffer.iter_mut() {
          *slot = fill;
        }
        tokio::task::yield_now().await;
        assert!(buffer.iter().all(|b| *b == fill));
      }));
    }
    for task in tasks {
      task.await.expect("Pool borrower must not panic");
    }
  }
}
