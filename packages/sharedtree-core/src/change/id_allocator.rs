use crate::ids::ChangeAtomId;

/// Hands out untagged atom ids above everything already used by the inputs.
#[derive(Clone, Debug, Default)]
pub struct IdAllocator {
    next: u32,
}

impl IdAllocator {
    pub fn new(next: u32) -> Self {
        Self { next }
    }

    /// Allocator whose first id follows `max`.
    pub fn above(max: Option<u32>) -> Self {
        Self {
            next: max.map_or(0, |max| max + 1),
        }
    }

    /// Reserves `count` consecutive ids and returns the first.
    pub fn allocate(&mut self, count: u32) -> ChangeAtomId {
        let id = ChangeAtomId::new(None, self.next);
        self.next += count.max(1);
        id
    }

    pub fn gen_id(&mut self) -> ChangeAtomId {
        self.allocate(1)
    }

    /// Highest id handed out so far.
    pub fn max(&self) -> Option<u32> {
        self.next.checked_sub(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocates_above_seed() {
        let mut ids = IdAllocator::above(Some(4));
        assert_eq!(ids.allocate(3), ChangeAtomId::new(None, 5));
        assert_eq!(ids.gen_id(), ChangeAtomId::new(None, 8));
        assert_eq!(ids.max(), Some(8));
        assert_eq!(IdAllocator::above(None).max(), None);
    }
}
