//! Reference-counted object arena.
//!
//! Addresses are slot indices. Slot 0 is the null slot and is never handed
//! out. Releasing an object to zero cascades into everything it owns through
//! an explicit work-stack, so arbitrarily deep structures free without
//! recursion. Reference cycles are never reclaimed.

use crate::value::{HeapObject, Traceable};

pub struct Heap {
    slots: Vec<Option<HeapObject>>,
    rc: Vec<usize>,
    free: Vec<usize>,
    pending: Vec<usize>,
}

impl Heap {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut slots = Vec::with_capacity(capacity);
        let mut rc = Vec::with_capacity(capacity);
        slots.push(None);
        rc.push(0);
        Heap { slots, rc, free: Vec::new(), pending: Vec::new() }
    }

    /// Stores `obj` with a refcount of 1, reusing the most recently freed
    /// slot if there is one.
    pub fn alloc(&mut self, obj: HeapObject) -> usize {
        if let Some(addr) = self.free.pop() {
            self.slots[addr] = Some(obj);
            self.rc[addr] = 1;
            return addr;
        }
        if self.slots.len() == self.slots.capacity() {
            let grow = self.slots.len();
            self.slots.reserve_exact(grow);
            self.rc.reserve_exact(grow);
            tracing::trace!(capacity = self.slots.capacity(), "heap grown");
        }
        self.slots.push(Some(obj));
        self.rc.push(1);
        self.slots.len() - 1
    }

    pub fn get(&self, addr: usize) -> Option<&HeapObject> {
        self.slots.get(addr)?.as_ref()
    }

    pub fn get_mut(&mut self, addr: usize) -> Option<&mut HeapObject> {
        self.slots.get_mut(addr)?.as_mut()
    }

    pub fn retain(&mut self, addr: usize) {
        if addr == 0 {
            return;
        }
        if let Some(rc) = self.rc.get_mut(addr)
            && *rc > 0
        {
            *rc += 1;
        }
    }

    pub fn release(&mut self, addr: usize) {
        let mut pending = std::mem::take(&mut self.pending);
        pending.push(addr);
        while let Some(addr) = pending.pop() {
            if addr == 0 {
                continue;
            }
            let Some(rc) = self.rc.get_mut(addr) else { continue };
            if *rc == 0 {
                continue;
            }
            *rc -= 1;
            if *rc > 0 {
                continue;
            }
            if let Some(obj) = self.slots[addr].take() {
                obj.trace(&mut pending);
            }
            self.free.push(addr);
        }
        self.pending = pending;
    }

    pub fn refcount(&self, addr: usize) -> usize {
        self.rc.get(addr).copied().unwrap_or(0)
    }

    /// Whether `addr` sits on the free list awaiting reuse.
    pub fn is_free(&self, addr: usize) -> bool {
        self.free.contains(&addr)
    }

    /// Number of live objects.
    pub fn len(&self) -> usize {
        self.slots.len() - 1 - self.free.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for Heap {
    fn default() -> Self {
        Heap::new(64)
    }
}
