use crate::packet_header::PacketFlags;
use crate::safe_converter::SafeCast;
use bytes::Bytes;

/// A single received command packet, waiting to be reassembled
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Fragment {
    pub packet_id: u16,
    pub generation: u16,
    pub flags: PacketFlags,
    pub payload: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertError {
    /// the id lies before the ring's window, i.e. it was processed already
    Underflow,
    /// the id lies beyond the ring's window
    Overflow,
    /// the slot is taken already
    Duplicate,
}

/// A fixed size window of fragment slots, indexed by full packet id. The window starts at the
///  id of the next fragment that is expected in sequence and moves forward as fragments are
///  popped from its front.
pub struct FragmentRing {
    slots: Vec<Option<Fragment>>,
    /// physical index of the slot for `base_id`
    head: usize,
    base_id: u32,
}

impl FragmentRing {
    pub fn new(capacity: usize) -> FragmentRing {
        FragmentRing {
            slots: vec![None; capacity],
            head: 0,
            base_id: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// full id of the front slot
    pub fn current_index(&self) -> u32 {
        self.base_id
    }

    pub fn reset(&mut self) {
        self.set_full_index_to(0);
    }

    /// clears all slots and moves the window to start at `full_id`
    pub fn set_full_index_to(&mut self, full_id: u32) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.head = 0;
        self.base_id = full_id;
    }

    fn physical(&self, offset: usize) -> usize {
        (self.head + offset) % self.slots.len()
    }

    pub fn insert(&mut self, full_id: u32, fragment: Fragment) -> Result<(), InsertError> {
        if full_id < self.base_id {
            return Err(InsertError::Underflow);
        }
        let offset: usize = (full_id - self.base_id).safe_cast();
        if offset >= self.capacity() {
            return Err(InsertError::Overflow);
        }

        let idx = self.physical(offset);
        let slot = &mut self.slots[idx];
        if slot.is_some() {
            return Err(InsertError::Duplicate);
        }
        *slot = Some(fragment);
        Ok(())
    }

    pub fn slot(&self, offset: usize) -> Option<&Fragment> {
        if offset >= self.capacity() {
            return None;
        }
        self.slots[self.physical(offset)].as_ref()
    }

    pub fn front_set(&self) -> bool {
        self.slot(0).is_some()
    }

    /// Takes the front slot's fragment (if any) and advances the window by one
    pub fn pop_front(&mut self) -> Option<Fragment> {
        let result = self.slots[self.head].take();
        self.head = self.physical(1);
        self.base_id = self.base_id.wrapping_add(1);
        result
    }
}
