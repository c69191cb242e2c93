use bytes::BytesMut;
use tracing::warn;

/// Handle to an acquired slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SlotId(usize);

/// Fixed pool of reassembly buffers.
///
/// A slot is exclusively owned by whoever acquired it until released. Release
/// clears the buffer so a reacquired slot always starts empty.
#[derive(Debug)]
pub struct BufferPool {
    slots: Vec<BytesMut>,
    in_use: Vec<bool>,
    free: Vec<usize>,
    capacity: usize,
}

impl BufferPool {
    pub fn new(slot_count: usize, capacity: usize) -> Self {
        Self {
            slots: (0..slot_count).map(|_| BytesMut::new()).collect(),
            in_use: vec![false; slot_count],
            free: (0..slot_count).rev().collect(),
            capacity,
        }
    }

    /// Capacity every slot is allowed to grow to.
    pub fn slot_capacity(&self) -> usize {
        self.capacity
    }

    pub fn acquire(&mut self) -> Option<SlotId> {
        let index = self.free.pop()?;
        self.in_use[index] = true;
        let slot = &mut self.slots[index];
        slot.clear();
        slot.reserve(self.capacity);
        Some(SlotId(index))
    }

    pub fn buffer(&self, slot: SlotId) -> &[u8] {
        &self.slots[slot.0]
    }

    pub fn buffer_mut(&mut self, slot: SlotId) -> &mut BytesMut {
        &mut self.slots[slot.0]
    }

    /// Return a slot to the pool. Releasing twice is a no-op.
    pub fn release(&mut self, slot: SlotId) {
        match self.in_use.get_mut(slot.0) {
            Some(in_use) if *in_use => {
                *in_use = false;
                self.slots[slot.0].clear();
                self.free.push(slot.0);
            }
            _ => warn!(slot = slot.0, "buffer slot released twice"),
        }
    }

    pub fn acquired(&self) -> usize {
        self.in_use.iter().filter(|used| **used).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_until_exhausted() {
        let mut pool = BufferPool::new(2, 64);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a, b);
        assert!(pool.acquire().is_none());
        pool.release(a);
        assert_eq!(pool.acquire(), Some(a));
    }

    #[test]
    fn release_is_idempotent_and_clears() {
        let mut pool = BufferPool::new(1, 64);
        let slot = pool.acquire().unwrap();
        pool.buffer_mut(slot).extend_from_slice(b"partial");
        pool.release(slot);
        pool.release(slot);
        assert_eq!(pool.acquired(), 0);
        let again = pool.acquire().unwrap();
        assert!(pool.buffer(again).is_empty());
        assert!(pool.acquire().is_none());
    }
}
