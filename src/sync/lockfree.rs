// SPDX-License-Identifier: PMPL-1.0-or-later

//! Bounded lock-free FIFO queue and LIFO stack over an index arena.
//!
//! Nodes are pre-allocated and addressed by `u32` index, so a node is never
//! returned to the allocator while another thread may still read it. Every
//! CAS word packs a 32-bit generation tag above the index; the tag is bumped
//! on each successful swap, which closes the ABA window a plain index CAS
//! would leave open (modulo tag wrap-around after 2^32 swaps of one word).
//!
//! `len()` is maintained around the CAS loops and is only approximate under
//! contention. Use it for pressure estimation, not accounting.

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;
use std::sync::atomic::{AtomicIsize, AtomicU32, AtomicU64, AtomicU8, Ordering};

const NIL: u32 = u32::MAX;

#[inline]
fn pack(tag: u32, index: u32) -> u64 {
    (u64::from(tag) << 32) | u64::from(index)
}

#[inline]
fn index_of(word: u64) -> u32 {
    word as u32
}

#[inline]
fn tag_of(word: u64) -> u32 {
    (word >> 32) as u32
}

struct Node<T> {
    value: UnsafeCell<MaybeUninit<T>>,
    /// Tagged link used by the owning container.
    next: AtomicU64,
    /// Free-list link, only meaningful while the node is free.
    free_next: AtomicU32,
    /// Outstanding claims before the node may be recycled (queue only).
    holds: AtomicU8,
}

impl<T> Node<T> {
    fn new(free_next: u32) -> Self {
        Self {
            value: UnsafeCell::new(MaybeUninit::uninit()),
            next: AtomicU64::new(pack(0, NIL)),
            free_next: AtomicU32::new(free_next),
            holds: AtomicU8::new(0),
        }
    }
}

/// Fixed pool of nodes plus a tagged Treiber free list.
struct Arena<T> {
    nodes: Box<[Node<T>]>,
    free_head: AtomicU64,
}

impl<T> Arena<T> {
    /// Builds `len` nodes; indices below `reserved` stay off the free list.
    fn new(len: usize, reserved: usize) -> Self {
        assert!(len < NIL as usize, "arena too large for u32 indices");
        let nodes: Box<[Node<T>]> = (0..len)
            .map(|i| {
                let next = if i + 1 < len { (i + 1) as u32 } else { NIL };
                Node::new(next)
            })
            .collect();
        let first_free = if reserved < len { reserved as u32 } else { NIL };
        Self {
            nodes,
            free_head: AtomicU64::new(pack(0, first_free)),
        }
    }

    #[inline]
    fn node(&self, index: u32) -> &Node<T> {
        &self.nodes[index as usize]
    }

    /// Takes a free node and moves `value` into it.
    fn alloc(&self, value: T) -> Result<u32, T> {
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            let index = index_of(head);
            if index == NIL {
                return Err(value);
            }
            let next = self.node(index).free_next.load(Ordering::Acquire);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag_of(head).wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: the node was just unlinked from the free list, so
                    // this thread is its only owner until it is published.
                    unsafe { (*self.node(index).value.get()).write(value) };
                    return Ok(index);
                }
                Err(actual) => head = actual,
            }
        }
    }

    /// Moves the value out of a node.
    ///
    /// # Safety
    /// The caller must hold the exclusive claim on this node's value and the
    /// value must have been initialised by `alloc`.
    unsafe fn take(&self, index: u32) -> T {
        (*self.node(index).value.get()).assume_init_read()
    }

    fn free(&self, index: u32) {
        let node = self.node(index);
        let mut head = self.free_head.load(Ordering::Acquire);
        loop {
            node.free_next.store(index_of(head), Ordering::Release);
            match self.free_head.compare_exchange_weak(
                head,
                pack(tag_of(head).wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(actual) => head = actual,
            }
        }
    }

    fn capacity(&self) -> usize {
        self.nodes.len()
    }
}

#[derive(Default)]
struct ApproxLen(AtomicIsize);

impl ApproxLen {
    fn inc(&self) {
        self.0.fetch_add(1, Ordering::Relaxed);
    }

    fn dec(&self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }

    fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0) as usize
    }
}

/// Michael-Scott FIFO queue. `push` fails with the value handed back when
/// every node is in use.
pub struct LockFreeQueue<T> {
    arena: Arena<T>,
    head: AtomicU64,
    tail: AtomicU64,
    len: ApproxLen,
}

// SAFETY: values move between threads only through the CAS protocol below;
// each value is read by exactly one thread (the one whose CAS claimed it).
unsafe impl<T: Send> Send for LockFreeQueue<T> {}
unsafe impl<T: Send> Sync for LockFreeQueue<T> {}

impl<T> LockFreeQueue<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        // Node 0 is the initial sentinel; it carries no value, so one hold.
        let arena = Arena::new(capacity + 1, 1);
        arena.node(0).holds.store(1, Ordering::Relaxed);
        Self {
            arena,
            head: AtomicU64::new(pack(0, 0)),
            tail: AtomicU64::new(pack(0, 0)),
            len: ApproxLen::default(),
        }
    }

    pub fn push(&self, value: T) -> Result<(), T> {
        let index = self.arena.alloc(value)?;
        let node = self.arena.node(index);
        let stale = node.next.load(Ordering::Acquire);
        node.next
            .store(pack(tag_of(stale).wrapping_add(1), NIL), Ordering::Release);
        // One hold for the value, one for the node's later turn as sentinel.
        node.holds.store(2, Ordering::Release);

        loop {
            let tail = self.tail.load(Ordering::Acquire);
            let tail_node = self.arena.node(index_of(tail));
            let next = tail_node.next.load(Ordering::Acquire);
            if tail != self.tail.load(Ordering::Acquire) {
                continue;
            }
            if index_of(next) == NIL {
                if tail_node
                    .next
                    .compare_exchange(
                        next,
                        pack(tag_of(next).wrapping_add(1), index),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    )
                    .is_ok()
                {
                    let _ = self.tail.compare_exchange(
                        tail,
                        pack(tag_of(tail).wrapping_add(1), index),
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    self.len.inc();
                    return Ok(());
                }
            } else {
                // Tail is lagging; help it forward.
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(tag_of(tail).wrapping_add(1), index_of(next)),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
            }
            std::hint::spin_loop();
        }
    }

    pub fn pop(&self) -> Option<T> {
        loop {
            let head = self.head.load(Ordering::Acquire);
            let tail = self.tail.load(Ordering::Acquire);
            let next = self.arena.node(index_of(head)).next.load(Ordering::Acquire);
            if head != self.head.load(Ordering::Acquire) {
                continue;
            }
            let next_index = index_of(next);
            if index_of(head) == index_of(tail) {
                if next_index == NIL {
                    return None;
                }
                let _ = self.tail.compare_exchange(
                    tail,
                    pack(tag_of(tail).wrapping_add(1), next_index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                );
                continue;
            }
            if next_index == NIL {
                continue;
            }
            if self
                .head
                .compare_exchange(
                    head,
                    pack(tag_of(head).wrapping_add(1), next_index),
                    Ordering::AcqRel,
                    Ordering::Acquire,
                )
                .is_ok()
            {
                // SAFETY: winning the head CAS grants the value claim on the
                // new sentinel; its value hold keeps it out of the free list.
                let value = unsafe { self.arena.take(next_index) };
                self.release(next_index);
                self.release(index_of(head));
                self.len.dec();
                return Some(value);
            }
            std::hint::spin_loop();
        }
    }

    fn release(&self, index: u32) {
        if self.arena.node(index).holds.fetch_sub(1, Ordering::AcqRel) == 1 {
            self.arena.free(index);
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        let head = self.head.load(Ordering::Acquire);
        index_of(self.arena.node(index_of(head)).next.load(Ordering::Acquire)) == NIL
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity() - 1
    }
}

impl<T> Drop for LockFreeQueue<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}

/// Treiber LIFO stack.
pub struct LockFreeStack<T> {
    arena: Arena<T>,
    head: AtomicU64,
    len: ApproxLen,
}

// SAFETY: as for `LockFreeQueue`; a popped node is owned by the popper.
unsafe impl<T: Send> Send for LockFreeStack<T> {}
unsafe impl<T: Send> Sync for LockFreeStack<T> {}

impl<T> LockFreeStack<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            arena: Arena::new(capacity.max(1), 0),
            head: AtomicU64::new(pack(0, NIL)),
            len: ApproxLen::default(),
        }
    }

    pub fn push(&self, value: T) -> Result<(), T> {
        let index = self.arena.alloc(value)?;
        let node = self.arena.node(index);
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            node.next.store(pack(0, index_of(head)), Ordering::Release);
            match self.head.compare_exchange_weak(
                head,
                pack(tag_of(head).wrapping_add(1), index),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    self.len.inc();
                    return Ok(());
                }
                Err(actual) => head = actual,
            }
        }
    }

    pub fn pop(&self) -> Option<T> {
        let mut head = self.head.load(Ordering::Acquire);
        loop {
            let index = index_of(head);
            if index == NIL {
                return None;
            }
            let next = index_of(self.arena.node(index).next.load(Ordering::Acquire));
            match self.head.compare_exchange_weak(
                head,
                pack(tag_of(head).wrapping_add(1), next),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    // SAFETY: the node is off the stack and not yet freed.
                    let value = unsafe { self.arena.take(index) };
                    self.arena.free(index);
                    self.len.dec();
                    return Some(value);
                }
                Err(actual) => head = actual,
            }
        }
    }

    pub fn len(&self) -> usize {
        self.len.get()
    }

    pub fn is_empty(&self) -> bool {
        index_of(self.head.load(Ordering::Acquire)) == NIL
    }

    pub fn capacity(&self) -> usize {
        self.arena.capacity()
    }
}

impl<T> Drop for LockFreeStack<T> {
    fn drop(&mut self) {
        while self.pop().is_some() {}
    }
}
