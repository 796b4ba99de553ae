// Copyright (c) 2024 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use std::collections::HashSet;
use std::sync::Mutex;

use tokio::sync::Notify;

use crate::types::PacketId;

/// Number of usable packet identifiers, `[1, 65535]`.
const ID_SPACE: usize = 65_535;

/// Per-session allocator for 16-bit packet identifiers.
///
/// A rotating cursor scans for the next free slot so recently released ids
/// are not reused immediately. When the whole space is in flight,
/// `allocate` parks until `release` frees a slot.
#[derive(Debug)]
pub struct PacketIdAllocator {
    inner: Mutex<AllocatorInner>,
    notify: Notify,
}

#[derive(Debug)]
struct AllocatorInner {
    cursor: PacketId,
    in_use: HashSet<PacketId>,
}

impl Default for PacketIdAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl PacketIdAllocator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(AllocatorInner {
                cursor: 0,
                in_use: HashSet::new(),
            }),
            notify: Notify::new(),
        }
    }

    /// Claim a fresh identifier, waiting if all 65 535 are in flight.
    pub async fn allocate(&self) -> PacketId {
        loop {
            if let Some(id) = self.try_allocate() {
                return id;
            }
            self.notify.notified().await;
        }
    }

    fn try_allocate(&self) -> Option<PacketId> {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use.len() >= ID_SPACE {
            return None;
        }
        loop {
            inner.cursor = if inner.cursor == PacketId::MAX {
                1
            } else {
                inner.cursor + 1
            };
            if !inner.in_use.contains(&inner.cursor) {
                let id = inner.cursor;
                inner.in_use.insert(id);
                return Some(id);
            }
        }
    }

    /// Mark an identifier as in flight without scanning, used when restoring
    /// a persistent session whose in-flight map survived a reconnect.
    pub fn reserve(&self, id: PacketId) {
        let mut inner = self.inner.lock().unwrap();
        inner.in_use.insert(id);
    }

    /// Return an identifier to the pool once its in-flight state reached a
    /// terminal transition, waking one parked submitter.
    pub fn release(&self, id: PacketId) {
        let mut inner = self.inner.lock().unwrap();
        if inner.in_use.remove(&id) {
            drop(inner);
            self.notify.notify_one();
        }
    }

    #[must_use]
    pub fn in_flight(&self) -> usize {
        self.inner.lock().unwrap().in_use.len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_allocate_rotates() {
        let allocator = PacketIdAllocator::new();
        assert_eq!(allocator.allocate().await, 1);
        assert_eq!(allocator.allocate().await, 2);
        allocator.release(1);
        // The cursor keeps moving forward instead of reusing 1 right away.
        assert_eq!(allocator.allocate().await, 3);
        assert_eq!(allocator.in_flight(), 3);
    }

    #[tokio::test]
    async fn test_release_then_reuse() {
        let allocator = PacketIdAllocator::new();
        for _ in 0..ID_SPACE {
            allocator.allocate().await;
        }
        assert_eq!(allocator.in_flight(), ID_SPACE);
        allocator.release(7);
        assert_eq!(allocator.allocate().await, 7);
    }

    #[tokio::test]
    async fn test_exhaustion_parks_until_release() {
        let allocator = Arc::new(PacketIdAllocator::new());
        for _ in 0..ID_SPACE {
            allocator.allocate().await;
        }

        let waiter = Arc::clone(&allocator);
        let handle = tokio::spawn(async move { waiter.allocate().await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!handle.is_finished());

        allocator.release(42);
        let id = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(id, 42);
    }

    #[tokio::test]
    async fn test_reserve_skips_restored_ids() {
        let allocator = PacketIdAllocator::new();
        allocator.reserve(1);
        allocator.reserve(2);
        assert_eq!(allocator.allocate().await, 3);
        assert_eq!(allocator.in_flight(), 3);
    }
}
