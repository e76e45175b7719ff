use crate::library::{
    network::connection::ConnectionHandle, server_internals::GENERATION_MASK, utils::lock,
};
use std::{collections::HashMap, os::fd::RawFd, sync::Mutex};

#[derive(Debug)]
struct Slot<T> {
    generation: u32,
    value: Option<T>,
}

/// Fd-indexed arena with a generation per slot.
///
/// Fds are small dense integers, so a plain vector indexed by fd beats a map.
/// Each time a slot is refilled its generation moves on; anything still
/// holding the old `(fd, generation)` pair finds nothing.
#[derive(Debug)]
pub struct FdArena<T> {
    slots: Vec<Slot<T>>,
    live: usize,
}

impl<T> Default for FdArena<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> FdArena<T> {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            live: 0,
        }
    }

    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Generation the next occupant of `fd` will carry.
    pub fn next_generation(&self, fd: RawFd) -> u32 {
        match self.slots.get(fd as usize) {
            Some(slot) => slot.generation.wrapping_add(1) & GENERATION_MASK,
            None => 1,
        }
    }

    /// Fills the slot of `fd` under `generation`, handing back whatever was
    /// still sitting there.
    pub fn insert(&mut self, fd: RawFd, generation: u32, value: T) -> Option<T> {
        let index = fd as usize;
        if index >= self.slots.len() {
            self.slots.resize_with(index + 1, || Slot {
                generation: 0,
                value: None,
            });
        }
        let slot = &mut self.slots[index];
        slot.generation = generation & GENERATION_MASK;
        let previous = slot.value.replace(value);
        if previous.is_none() {
            self.live += 1;
        }
        previous
    }

    pub fn get(&self, fd: RawFd, generation: u32) -> Option<&T> {
        let slot = self.slots.get(fd as usize)?;
        if slot.generation != generation & GENERATION_MASK {
            return None;
        }
        slot.value.as_ref()
    }

    pub fn get_mut(&mut self, fd: RawFd, generation: u32) -> Option<&mut T> {
        let slot = self.slots.get_mut(fd as usize)?;
        if slot.generation != generation & GENERATION_MASK {
            return None;
        }
        slot.value.as_mut()
    }

    pub fn remove(&mut self, fd: RawFd, generation: u32) -> Option<T> {
        let slot = self.slots.get_mut(fd as usize)?;
        if slot.generation != generation & GENERATION_MASK {
            return None;
        }
        let value = slot.value.take();
        if value.is_some() {
            self.live -= 1;
        }
        value
    }

    /// Live entries as `(fd, generation, value)`.
    pub fn iter(&self) -> impl Iterator<Item = (RawFd, u32, &T)> + '_ {
        self.slots.iter().enumerate().filter_map(|(fd, slot)| {
            slot.value
                .as_ref()
                .map(|value| (fd as RawFd, slot.generation, value))
        })
    }

    pub fn keys(&self) -> Vec<(RawFd, u32)> {
        self.iter().map(|(fd, generation, _)| (fd, generation)).collect()
    }
}

/// Server-wide view of every live connection, shared by all loops.
///
/// Lock, mutate, unlock: nothing blocking ever happens under this mutex.
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    inner: Mutex<HashMap<RawFd, ConnectionHandle>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, handle: ConnectionHandle) {
        lock(&self.inner).insert(handle.fd(), handle);
    }

    /// Removes the entry only if it still belongs to `generation`, so a late
    /// removal can never evict the connection that reused the fd.
    pub fn remove(&self, fd: RawFd, generation: u32) -> Option<ConnectionHandle> {
        let mut map = lock(&self.inner);
        match map.get(&fd) {
            Some(handle) if handle.generation() == generation & GENERATION_MASK => map.remove(&fd),
            _ => None,
        }
    }

    pub fn get(&self, fd: RawFd) -> Option<ConnectionHandle> {
        lock(&self.inner).get(&fd).cloned()
    }

    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::library::reactor::event_loop::LoopHandle;

    #[test]
    fn stale_generation_finds_nothing() {
        let mut arena: FdArena<&str> = FdArena::new();
        let first = arena.next_generation(7);
        arena.insert(7, first, "first");
        assert_eq!(arena.get(7, first), Some(&"first"));

        assert_eq!(arena.remove(7, first), Some("first"));
        let second = arena.next_generation(7);
        assert_ne!(first, second);
        arena.insert(7, second, "second");

        // An event queued for the first occupant must not reach the second
        assert!(arena.get_mut(7, first).is_none());
        assert!(arena.remove(7, first).is_none());
        assert_eq!(arena.get(7, second), Some(&"second"));
        assert_eq!(arena.len(), 1);
    }

    #[test]
    fn sparse_fds_and_iteration() {
        let mut arena: FdArena<u32> = FdArena::new();
        arena.insert(3, 1, 30);
        arena.insert(40, 1, 400);
        assert_eq!(arena.len(), 2);
        assert_eq!(arena.keys(), vec![(3, 1), (40, 1)]);
        assert!(arena.get(10, 0).is_none());
        assert!(arena.remove(99, 1).is_none());
    }

    #[test]
    fn registry_removal_checks_generation() {
        let owner = LoopHandle::new("registry-test").unwrap();
        let registry = ConnectionRegistry::new();
        registry.insert(ConnectionHandle::new(9, 2, None, owner.clone()));
        assert_eq!(registry.len(), 1);

        assert!(registry.remove(9, 1).is_none());
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get(9).map(|handle| handle.generation()), Some(2));

        let removed = registry.remove(9, 2).unwrap();
        assert_eq!(removed.fd(), 9);
        assert!(registry.is_empty());
    }
}
