//! Message id allocation.

use muxwire_proto::{MessageId, RESERVED_ID};

/// Hands out message ids for locally initiated exchanges.
///
/// Ids increase monotonically and wrap. The reserved id and any id the caller
/// reports as still in use are skipped, so an id is never shared by two live
/// exchanges on one connection.
#[derive(Debug, Clone)]
pub struct IdAllocator {
    next: MessageId,
}

impl IdAllocator {
    /// Allocator whose first candidate is `first`.
    pub fn starting_at(first: MessageId) -> Self {
        Self { next: first }
    }

    /// Next free id, or `None` if every id is taken.
    pub fn allocate(&mut self, in_use: impl Fn(MessageId) -> bool) -> Option<MessageId> {
        for _ in 0..=u32::MAX {
            let candidate = self.next;
            self.next = self.next.wrapping_add(1);
            if candidate != RESERVED_ID && !in_use(candidate) {
                return Some(candidate);
            }
        }
        None
    }
}

impl Default for IdAllocator {
    fn default() -> Self {
        Self::starting_at(1)
    }
}
