use std::any::Any;
use std::collections::BTreeMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU32, Ordering};

static NEXT_SLOT: AtomicU32 = AtomicU32::new(0);

/// Typed key into [`AnchorSlots`]. Each call to [`anchor_slot`] yields a distinct key.
pub struct AnchorSlot<T> {
    id: u32,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Clone for AnchorSlot<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for AnchorSlot<T> {}

impl<T> fmt::Debug for AnchorSlot<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AnchorSlot({})", self.id)
    }
}

pub fn anchor_slot<T: 'static>() -> AnchorSlot<T> {
    AnchorSlot {
        id: NEXT_SLOT.fetch_add(1, Ordering::Relaxed),
        _marker: PhantomData,
    }
}

/// Side table attached to an anchor node. The anchor set never inspects the values.
#[derive(Default)]
pub struct AnchorSlots {
    entries: BTreeMap<u32, Box<dyn Any>>,
}

impl fmt::Debug for AnchorSlots {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.entries.keys()).finish()
    }
}

impl AnchorSlots {
    pub fn get<T: 'static>(&self, slot: AnchorSlot<T>) -> Option<&T> {
        self.entries.get(&slot.id)?.downcast_ref()
    }

    pub fn get_mut<T: 'static>(&mut self, slot: AnchorSlot<T>) -> Option<&mut T> {
        self.entries.get_mut(&slot.id)?.downcast_mut()
    }

    /// Stores `value`, returning the previous one.
    pub fn set<T: 'static>(&mut self, slot: AnchorSlot<T>, value: T) -> Option<T> {
        let old = self.entries.insert(slot.id, Box::new(value))?;
        old.downcast().ok().map(|boxed| *boxed)
    }

    pub fn remove<T: 'static>(&mut self, slot: AnchorSlot<T>) -> Option<T> {
        let old = self.entries.remove(&slot.id)?;
        old.downcast().ok().map(|boxed| *boxed)
    }

    pub fn has<T: 'static>(&self, slot: AnchorSlot<T>) -> bool {
        self.entries.contains_key(&slot.id)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
