//! Generation-checked fiber handles.
//!
//! A `FiberHandle` names a slot in the fiber arena plus the generation the
//! slot had when the fiber was inserted. Handles stay `Copy` and cheap to
//! pass around; once the slot is recycled the generation no longer matches
//! and every arena operation on the stale handle fails closed.

use std::fmt;

/// Arena address of a fiber: slot index + slot generation.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct FiberHandle {
    index: u32,
    generation: u32,
}

impl FiberHandle {
    /// Sentinel for "no fiber" (e.g. a thread's main fiber, which never
    /// lives in the arena).
    pub const NONE: FiberHandle = FiberHandle {
        index: u32::MAX,
        generation: 0,
    };

    #[inline]
    pub const fn new(index: u32, generation: u32) -> Self {
        FiberHandle { index, generation }
    }

    #[inline]
    pub const fn index(&self) -> u32 {
        self.index
    }

    #[inline]
    pub const fn generation(&self) -> u32 {
        self.generation
    }

    #[inline]
    pub const fn is_none(&self) -> bool {
        self.index == u32::MAX
    }

    #[inline]
    pub const fn is_some(&self) -> bool {
        !self.is_none()
    }
}

impl Default for FiberHandle {
    fn default() -> Self {
        FiberHandle::NONE
    }
}

impl fmt::Display for FiberHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_none() {
            write!(f, "fiber(none)")
        } else {
            write!(f, "fiber({}.{})", self.index, self.generation)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn none_sentinel() {
        assert!(FiberHandle::NONE.is_none());
        assert!(!FiberHandle::NONE.is_some());
        assert!(FiberHandle::default().is_none());
    }

    #[test]
    fn generation_distinguishes_reuse() {
        let a = FiberHandle::new(3, 1);
        let b = FiberHandle::new(3, 2);
        assert_ne!(a, b);
        assert_eq!(a.index(), b.index());
    }

    #[test]
    fn display() {
        assert_eq!(FiberHandle::new(7, 2).to_string(), "fiber(7.2)");
        assert_eq!(FiberHandle::NONE.to_string(), "fiber(none)");
    }
}
