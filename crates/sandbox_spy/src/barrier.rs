//! Self-call barrier: per-thread reentrancy tracking for the dispatch path.
//!
//! # Responsibility
//! - Record which threads are currently inside dispatch.
//! - Answer "is this thread already inside?" without a global lock.
//!
//! # Invariants
//! - `is_entered(t)` is true iff some `enter(t)` has no matching `exit` yet.
//! - A thread may enter repeatedly; each entry is its own node.
//! - Threads are partitioned into `BUCKET_COUNT` buckets by identity hash and
//!   a bucket lock is only ever held for one list operation.
//!
//! Each bucket is a doubly linked list threaded through a slot arena, so
//! insert and delete are O(1) and freed slots are reused instead of
//! allocating per entry.

use parking_lot::Mutex;
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::thread::{self, ThreadId};

/// Number of independently locked buckets.
pub const BUCKET_COUNT: usize = 1024;

struct Node {
    thread: Option<ThreadId>,
    prev: Option<u32>,
    next: Option<u32>,
    generation: u32,
}

#[derive(Default)]
struct Bucket {
    head: Option<u32>,
    nodes: Vec<Node>,
    free: Vec<u32>,
}

impl Bucket {
    fn insert(&mut self, thread: ThreadId) -> (u32, u32) {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                self.nodes.push(Node {
                    thread: None,
                    prev: None,
                    next: None,
                    generation: 0,
                });
                (self.nodes.len() - 1) as u32
            }
        };

        let old_head = self.head;
        if let Some(head) = old_head {
            self.nodes[head as usize].prev = Some(slot);
        }
        let node = &mut self.nodes[slot as usize];
        node.thread = Some(thread);
        node.prev = None;
        node.next = old_head;
        self.head = Some(slot);
        (slot, node.generation)
    }

    fn delete(&mut self, slot: u32, generation: u32) -> bool {
        let Some(node) = self.nodes.get(slot as usize) else {
            return false;
        };
        if node.thread.is_none() || node.generation != generation {
            return false;
        }
        let (prev, next) = (node.prev, node.next);

        match prev {
            Some(prev) => self.nodes[prev as usize].next = next,
            None => self.head = next,
        }
        if let Some(next) = next {
            self.nodes[next as usize].prev = prev;
        }

        let node = &mut self.nodes[slot as usize];
        node.thread = None;
        node.prev = None;
        node.next = None;
        node.generation = node.generation.wrapping_add(1);
        self.free.push(slot);
        true
    }

    fn contains(&self, thread: ThreadId) -> bool {
        let mut cursor = self.head;
        while let Some(slot) = cursor {
            let node = &self.nodes[slot as usize];
            if node.thread == Some(thread) {
                return true;
            }
            cursor = node.next;
        }
        false
    }

    fn len(&self) -> usize {
        self.nodes.len() - self.free.len()
    }
}

/// Proof of one outstanding `enter`. Consumed by `exit`.
#[must_use = "an unexited barrier token keeps the thread marked as entered"]
#[derive(Debug, PartialEq, Eq)]
pub struct BarrierToken {
    bucket: u32,
    slot: u32,
    generation: u32,
}

/// Hashed-bucket reentrancy barrier keyed by thread identity.
pub struct SelfCallBarrier {
    buckets: Box<[Mutex<Bucket>]>,
}

impl SelfCallBarrier {
    pub fn new() -> Self {
        let buckets = (0..BUCKET_COUNT)
            .map(|_| Mutex::new(Bucket::default()))
            .collect::<Vec<_>>()
            .into_boxed_slice();
        Self { buckets }
    }

    /// Whether `thread` has an outstanding entry.
    pub fn is_entered(&self, thread: ThreadId) -> bool {
        self.buckets[bucket_of(thread)].lock().contains(thread)
    }

    /// Marks `thread` as inside dispatch. Nested entries are allowed.
    pub fn enter(&self, thread: ThreadId) -> BarrierToken {
        let bucket = bucket_of(thread);
        let (slot, generation) = self.buckets[bucket].lock().insert(thread);
        BarrierToken {
            bucket: bucket as u32,
            slot,
            generation,
        }
    }

    /// Removes the entry identified by `token`.
    ///
    /// A token that does not belong to `thread`'s bucket, or that was already
    /// exited, is ignored.
    pub fn exit(&self, thread: ThreadId, token: BarrierToken) {
        let bucket = bucket_of(thread);
        debug_assert_eq!(bucket as u32, token.bucket, "token exited by a foreign thread");
        if bucket as u32 != token.bucket {
            return;
        }
        let removed = self.buckets[bucket]
            .lock()
            .delete(token.slot, token.generation);
        debug_assert!(removed, "barrier token exited twice");
    }

    /// Enters for the calling thread and exits when the guard drops, on every
    /// path including unwinding.
    pub fn guard(&self) -> BarrierGuard<'_> {
        let thread = thread::current().id();
        let token = self.enter(thread);
        BarrierGuard {
            barrier: self,
            thread,
            token: Some(token),
        }
    }

    /// Number of outstanding entries across all buckets.
    pub fn entered_count(&self) -> usize {
        self.buckets.iter().map(|bucket| bucket.lock().len()).sum()
    }
}

impl Default for SelfCallBarrier {
    fn default() -> Self {
        Self::new()
    }
}

/// Scoped barrier entry for the calling thread.
pub struct BarrierGuard<'a> {
    barrier: &'a SelfCallBarrier,
    thread: ThreadId,
    token: Option<BarrierToken>,
}

impl Drop for BarrierGuard<'_> {
    fn drop(&mut self) {
        if let Some(token) = self.token.take() {
            self.barrier.exit(self.thread, token);
        }
    }
}

fn bucket_of(thread: ThreadId) -> usize {
    // DefaultHasher::new() uses fixed keys, so the bucket of a thread never
    // changes for the life of the process.
    let mut hasher = DefaultHasher::new();
    thread.hash(&mut hasher);
    (hasher.finish() % BUCKET_COUNT as u64) as usize
}

#[cfg(test)]
mod tests {
    use super::{bucket_of, Bucket, SelfCallBarrier};
    use std::thread;

    #[test]
    fn enter_and_exit_toggle_membership() {
        let barrier = SelfCallBarrier::new();
        let me = thread::current().id();

        assert!(!barrier.is_entered(me));
        let token = barrier.enter(me);
        assert!(barrier.is_entered(me));
        barrier.exit(me, token);
        assert!(!barrier.is_entered(me));
    }

    #[test]
    fn nested_entries_keep_thread_entered_until_last_exit() {
        let barrier = SelfCallBarrier::new();
        let me = thread::current().id();

        let outer = barrier.enter(me);
        let inner = barrier.enter(me);
        assert_eq!(barrier.entered_count(), 2);

        barrier.exit(me, inner);
        assert!(barrier.is_entered(me));
        barrier.exit(me, outer);
        assert!(!barrier.is_entered(me));
        assert_eq!(barrier.entered_count(), 0);
    }

    #[test]
    fn guard_releases_on_drop() {
        let barrier = SelfCallBarrier::new();
        let me = thread::current().id();
        {
            let _guard = barrier.guard();
            assert!(barrier.is_entered(me));
        }
        assert!(!barrier.is_entered(me));
    }

    #[test]
    fn guard_releases_on_unwind() {
        let barrier = SelfCallBarrier::new();
        let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
            let _guard = barrier.guard();
            panic!("listener blew up");
        }));
        assert!(result.is_err());
        assert!(!barrier.is_entered(thread::current().id()));
    }

    #[test]
    fn bucket_unlinks_middle_nodes_and_reuses_slots() {
        let mut bucket = Bucket::default();
        let a = thread::current().id();
        let b = thread::spawn(|| thread::current().id())
            .join()
            .expect("thread id");

        let first = bucket.insert(a);
        let middle = bucket.insert(b);
        let last = bucket.insert(a);

        assert!(bucket.delete(middle.0, middle.1));
        assert!(!bucket.contains(b));
        assert!(bucket.contains(a));
        assert!(!bucket.delete(middle.0, middle.1));

        let reused = bucket.insert(b);
        assert_eq!(reused.0, middle.0);
        assert_ne!(reused.1, middle.1);

        assert!(bucket.delete(first.0, first.1));
        assert!(bucket.delete(last.0, last.1));
        assert!(bucket.delete(reused.0, reused.1));
        assert_eq!(bucket.len(), 0);
        assert!(bucket.head.is_none());
    }

    #[test]
    fn bucket_assignment_is_stable() {
        let me = thread::current().id();
        assert_eq!(bucket_of(me), bucket_of(me));
    }
}
