//! The fixed-slot ring buffer backing the message queue.
//!
//! Every slot is one pointer wide. The buffer does not own the pointees;
//! messages are opaque to the kernel.
use crate::klock::{CpuLockCell, CpuLockTokenRefMut};
use crate::utils::Init;

/// An opaque pointer-sized message payload.
pub struct RawMessage(pub(crate) *mut ());

impl RawMessage {
    pub(crate) const NULL: Self = Self(core::ptr::null_mut());
}

impl Clone for RawMessage {
    fn clone(&self) -> Self {
        *self
    }
}
impl Copy for RawMessage {}

impl Init for RawMessage {
    const INIT: Self = Self::NULL;
}

// Safety: the kernel never dereferences a message payload
unsafe impl Send for RawMessage {}
unsafe impl Sync for RawMessage {}

/// One pointer-wide message slot.
pub struct MsgSlot<Traits: 'static>(CpuLockCell<Traits, RawMessage>);

impl<Traits> Init for MsgSlot<Traits> {
    const INIT: Self = Self(CpuLockCell::new(RawMessage::NULL));
}

/// A bounded FIFO of pointer-sized messages over externally provided slots.
pub(crate) struct RingBuf<Traits: 'static> {
    slots: CpuLockCell<Traits, Option<&'static [MsgSlot<Traits>]>>,
    read: CpuLockCell<Traits, usize>,
    len: CpuLockCell<Traits, usize>,
}

impl<Traits> Init for RingBuf<Traits> {
    const INIT: Self = Self {
        slots: Init::INIT,
        read: Init::INIT,
        len: Init::INIT,
    };
}

impl<Traits: 'static> RingBuf<Traits> {
    /// Bind the ring to its backing slots and empty it.
    pub(crate) fn attach(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        slots: &'static [MsgSlot<Traits>],
    ) {
        self.slots.replace(&mut *lock, Some(slots));
        self.read.replace(&mut *lock, 0);
        self.len.replace(&mut *lock, 0);
    }

    pub(crate) fn capacity(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.slots.get(&*lock).map_or(0, |s| s.len())
    }

    pub(crate) fn len(&self, lock: CpuLockTokenRefMut<'_, Traits>) -> usize {
        self.len.get(&*lock)
    }

    /// Append a message. Returns `false` if the ring is full.
    pub(crate) fn push(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
        msg: RawMessage,
    ) -> bool {
        let Some(slots) = self.slots.get(&*lock) else { return false };
        let len = self.len.get(&*lock);
        if len >= slots.len() {
            return false;
        }

        let write = (self.read.get(&*lock) + len) % slots.len();
        slots[write].0.replace(&mut *lock, msg);
        self.len.replace(&mut *lock, len + 1);
        true
    }

    /// Remove and return the oldest message.
    pub(crate) fn pop(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) -> Option<RawMessage> {
        let slots = self.slots.get(&*lock)?;
        let len = self.len.get(&*lock);
        if len == 0 {
            return None;
        }

        let read = self.read.get(&*lock);
        let msg = slots[read].0.get(&*lock);
        self.read.replace(&mut *lock, (read + 1) % slots.len());
        self.len.replace(&mut *lock, len - 1);
        Some(msg)
    }

    /// Discard all buffered messages.
    pub(crate) fn reset(&self, mut lock: CpuLockTokenRefMut<'_, Traits>) {
        self.read.replace(&mut *lock, 0);
        self.len.replace(&mut *lock, 0);
    }

    /// Unbind the ring from its backing slots, returning them.
    pub(crate) fn detach(
        &self,
        mut lock: CpuLockTokenRefMut<'_, Traits>,
    ) -> Option<&'static [MsgSlot<Traits>]> {
        self.read.replace(&mut *lock, 0);
        self.len.replace(&mut *lock, 0);
        self.slots.replace(&mut *lock, None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::klock::CpuLockToken;
    use quickcheck_macros::quickcheck;
    use std::collections::VecDeque;

    #[quickcheck]
    fn matches_deque_model(capacity: usize, bytecode: Vec<u8>) {
        let capacity = capacity % 9;
        let slots: &'static [MsgSlot<()>] = Box::leak(
            (0..capacity)
                .map(|_| MsgSlot::INIT)
                .collect::<Vec<_>>()
                .into_boxed_slice(),
        );

        // Safety: tests never instantiate a real CPU lock for `Traits = ()`
        let mut token = unsafe { CpuLockToken::<()>::new_unchecked() };
        let ring = RingBuf::<()>::INIT;
        ring.attach(token.borrow_mut(), slots);

        let mut model: VecDeque<usize> = VecDeque::new();
        let mut ctr = 1usize;

        for op in bytecode {
            match op % 3 {
                0 => {
                    let pushed = ring.push(token.borrow_mut(), RawMessage(ctr as *mut ()));
                    if model.len() < capacity {
                        assert!(pushed);
                        model.push_back(ctr);
                    } else {
                        assert!(!pushed);
                    }
                    ctr += 1;
                }
                1 => {
                    let got = ring.pop(token.borrow_mut()).map(|m| m.0 as usize);
                    assert_eq!(got, model.pop_front());
                }
                _ => {
                    ring.reset(token.borrow_mut());
                    model.clear();
                }
            }
            assert_eq!(ring.len(token.borrow_mut()), model.len());
        }
    }
}
