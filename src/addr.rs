//! Address encodings.
//!
//! A [VAddr] is a raw virtual address as found in scanned memory. A linear
//! address packs the heap's arenas densely by [ArenaId], so that addresses sort
//! by arena and then by offset using nothing but integer shifts:
//!
//! ```text
//! LAddr   = arena_id * ARENA_BYTES + byte offset in arena
//! LAddr64 = LAddr / WORD_BYTES
//! LAddr32 = low 32 bits of LAddr64, relative to a window start held by its buffer
//! ```
//!
//! A 32-bit linear address covers a 32 GiB window of the linear space, which is
//! plenty for every buffer below the top of the concentrator network.
use std::fmt;

use crate::globals::{ARENA_BYTES, ARENA_WORDS, PAGE_BYTES, WORD_BYTES};

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VAddr(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LAddr(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LAddr64(pub u64);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct LAddr32(pub u32);

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct ArenaId(pub u32);

/// Byte span of the linear space addressable by an [LAddr32] window.
pub const LADDR32_WINDOW_BYTES: u64 = (1u64 << 32) * WORD_BYTES as u64;

impl VAddr {
    #[inline]
    pub const fn plus(self, bytes: usize) -> Self {
        Self(self.0 + bytes as u64)
    }
    #[inline]
    pub const fn minus(self, base: VAddr) -> usize {
        (self.0 - base.0) as usize
    }
    /// Index of the arena-sized frame of the address space containing this address.
    #[inline]
    pub const fn arena_index(self) -> usize {
        (self.0 / ARENA_BYTES as u64) as usize
    }
    #[inline]
    pub const fn arena_offset(self) -> usize {
        (self.0 % ARENA_BYTES as u64) as usize
    }
    #[inline]
    pub const fn page_in_arena(self) -> usize {
        self.arena_offset() / PAGE_BYTES
    }
}

impl LAddr {
    pub const NONE: LAddr = LAddr(u64::MAX);

    #[inline]
    pub const fn new(arena: ArenaId, offset: usize) -> Self {
        Self(arena.0 as u64 * ARENA_BYTES as u64 + offset as u64)
    }
    /// Returns the arena and byte offset within it.
    #[inline]
    pub const fn arena(self) -> (ArenaId, usize) {
        (
            ArenaId((self.0 / ARENA_BYTES as u64) as u32),
            (self.0 % ARENA_BYTES as u64) as usize,
        )
    }
    #[inline]
    pub const fn plus(self, bytes: u64) -> Self {
        Self(self.0 + bytes)
    }
    #[inline]
    pub const fn to_laddr64(self) -> LAddr64 {
        LAddr64(self.0 / WORD_BYTES as u64)
    }
}

impl LAddr64 {
    #[inline]
    pub const fn to_laddr(self) -> LAddr {
        LAddr(self.0 * WORD_BYTES as u64)
    }
    #[inline]
    pub const fn arena(self) -> ArenaId {
        ArenaId((self.0 / ARENA_WORDS as u64) as u32)
    }
    #[inline]
    pub const fn arena_word(self) -> usize {
        (self.0 % ARENA_WORDS as u64) as usize
    }
    /// Truncates to the 32-bit window form. The dropped high bits are implied
    /// by the window start of the destination buffer.
    #[inline]
    pub const fn narrow(self) -> LAddr32 {
        LAddr32(self.0 as u32)
    }
}

impl LAddr32 {
    /// Widens back to a full linear address using the window start `start`.
    #[inline]
    pub const fn widen(self, start: LAddr) -> LAddr64 {
        let high = (start.0 / WORD_BYTES as u64) & !(u32::MAX as u64);
        LAddr64(high | self.0 as u64)
    }
    #[inline]
    pub const fn to_laddr(self, start: LAddr) -> LAddr {
        self.widen(start).to_laddr()
    }
}

impl fmt::Debug for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VAddr({:#x})", self.0)
    }
}

impl fmt::Display for VAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl fmt::Debug for LAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == LAddr::NONE {
            return write!(f, "LAddr(none)");
        }
        let (arena, offset) = self.arena();
        write!(f, "LAddr({}+{:#x})", arena.0, offset)
    }
}

impl fmt::Display for LAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl fmt::Debug for LAddr64 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LAddr64({}+{:#x}w)", self.arena().0, self.arena_word())
    }
}

impl fmt::Debug for LAddr32 {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LAddr32({:#010x})", self.0)
    }
}

impl fmt::Display for ArenaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ArenaId({})", self.0)
    }
}
