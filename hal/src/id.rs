use core::num::NonZeroU8;

/// A small integer handle into one of the kernel's fixed-size object pools
/// (tasks, semaphores, queues, timers). Ids are one-based; `0` is never a
/// valid id and is used internally to mean "self" in a handful of calls
/// (see [`Id::SELF`]).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Id(NonZeroU8);

impl Id {
    /// The reserved id meaning "the calling task", accepted by
    /// `t_getreg`/`t_setreg`/`t_ident` in place of a real task id.
    pub const SELF: u8 = 0;

    #[inline]
    pub const fn new(raw: u8) -> Option<Self> {
        match NonZeroU8::new(raw) {
            Some(n) => Some(Self(n)),
            None => None,
        }
    }

    /// Construct an `Id` from a zero-based pool index.
    #[inline]
    pub fn from_index(index: usize) -> Self {
        debug_assert!(index < u8::MAX as usize);
        Self(NonZeroU8::new(index as u8 + 1).expect("index + 1 is never zero"))
    }

    /// The zero-based pool index this id refers to.
    #[inline]
    pub const fn index(self) -> usize {
        (self.0.get() - 1) as usize
    }

    #[inline]
    pub const fn get(self) -> u8 {
        self.0.get()
    }
}

impl core::fmt::Display for Id {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "#{}", self.0.get())
    }
}
