//! Session identifier allocation

use crate::wire::SessionId;
use tokio::sync::Mutex;

/// Hands out and recycles 64-bit session identifiers.
///
/// Freed ids go onto a LIFO free list and are preferred over fresh
/// allocation. `get` fails only once the free list is empty and the counter
/// has wrapped the entire id space.
pub struct UidAllocator {
    inner: Mutex<Inner>,
}

struct Inner {
    free: Vec<SessionId>,
    // 0 is the exhaustion sentinel; ids start at 1.
    next: SessionId,
}

impl UidAllocator {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                free: Vec::new(),
                next: 1,
            }),
        }
    }

    /// Allocate an id, recycled ids first
    pub async fn get(&self) -> Option<SessionId> {
        let mut inner = self.inner.lock().await;
        if let Some(id) = inner.free.pop() {
            return Some(id);
        }
        if inner.next == 0 {
            return None;
        }
        let id = inner.next;
        inner.next = inner.next.wrapping_add(1);
        Some(id)
    }

    /// Return an id to the free list
    pub async fn release(&self, id: SessionId) {
        self.inner.lock().await.free.push(id);
    }
}

impl Default for UidAllocator {
    fn default() -> Self {
        Self::new()
    }
}
