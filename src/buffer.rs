use std::fmt;

use crate::addr::{LAddr, LAddr32, LAddr64, VAddr};

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BufferKind {
    VAddr,
    LAddr64,
    LAddr32,
}

impl BufferKind {
    #[inline]
    pub const fn addr_bytes(self) -> usize {
        match self {
            BufferKind::VAddr | BufferKind::LAddr64 => 8,
            BufferKind::LAddr32 => 4,
        }
    }
}

impl fmt::Display for BufferKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BufferKind::VAddr => "VAddr",
            BufferKind::LAddr64 => "LAddr64",
            BufferKind::LAddr32 => "LAddr32",
        };
        f.write_str(name)
    }
}

/// A fixed capacity array of addresses of one [BufferKind].
///
/// The storage is one contiguous block of words; the kind only decides how it
/// is viewed. Accessing a buffer as the wrong kind is a bug and panics.
pub struct Buffer {
    len: usize,
    kind: BufferKind,
    /// First linear address of the heap range routed to this buffer. For
    /// `LAddr32` buffers this also supplies the high bits of every address.
    start: LAddr,
    data: Box<[u64]>,
}

impl Buffer {
    pub fn new(bytes: usize, kind: BufferKind, start: LAddr) -> Self {
        assert!(
            bytes >= 8 && bytes % 8 == 0,
            "buffer size {} must be a non-zero multiple of 8 bytes",
            bytes
        );
        Self {
            len: 0,
            kind,
            start,
            data: vec![0u64; bytes / 8].into_boxed_slice(),
        }
    }

    #[inline]
    pub fn kind(&self) -> BufferKind {
        self.kind
    }

    /// Reinterprets the buffer as another kind. Only valid while the contents
    /// are about to be overwritten or have just been rewritten in place.
    #[inline]
    pub fn set_kind(&mut self, kind: BufferKind) {
        self.kind = kind;
    }

    #[inline]
    pub fn start(&self) -> LAddr {
        self.start
    }

    #[inline]
    pub fn set_start(&mut self, start: LAddr) {
        self.start = start;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "buffer length {} past capacity", len);
        self.len = len;
    }

    #[inline]
    pub fn clear(&mut self) {
        self.len = 0;
    }

    #[inline]
    pub fn bytes(&self) -> usize {
        self.data.len() * 8
    }

    /// Capacity in addresses of the current kind.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.bytes() / self.kind.addr_bytes()
    }

    #[inline]
    pub fn remaining(&self) -> usize {
        self.capacity() - self.len
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    #[cold]
    fn wrong_kind(&self, want: BufferKind) -> ! {
        panic!("buffer is {}, not {}", self.kind, want)
    }

    #[inline]
    fn check(&self, want: BufferKind) {
        if self.kind != want {
            self.wrong_kind(want);
        }
    }

    pub fn as_vaddr(&self) -> &[VAddr] {
        self.check(BufferKind::VAddr);
        // VAddr is a transparent u64.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast(), self.data.len()) }
    }

    pub fn as_vaddr_mut(&mut self) -> &mut [VAddr] {
        self.check(BufferKind::VAddr);
        unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr().cast(), self.data.len()) }
    }

    pub fn as_laddr64(&self) -> &[LAddr64] {
        self.check(BufferKind::LAddr64);
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast(), self.data.len()) }
    }

    pub fn as_laddr64_mut(&mut self) -> &mut [LAddr64] {
        self.check(BufferKind::LAddr64);
        unsafe { std::slice::from_raw_parts_mut(self.data.as_mut_ptr().cast(), self.data.len()) }
    }

    pub fn as_laddr32(&self) -> &[LAddr32] {
        self.check(BufferKind::LAddr32);
        // LAddr32 is a transparent u32, and u64 alignment is stricter.
        unsafe { std::slice::from_raw_parts(self.data.as_ptr().cast(), self.data.len() * 2) }
    }

    pub fn as_laddr32_mut(&mut self) -> &mut [LAddr32] {
        self.check(BufferKind::LAddr32);
        unsafe {
            std::slice::from_raw_parts_mut(self.data.as_mut_ptr().cast(), self.data.len() * 2)
        }
    }

    /// The filled prefix, viewed as `VAddr`s.
    #[inline]
    pub fn vaddrs(&self) -> &[VAddr] {
        &self.as_vaddr()[..self.len]
    }

    #[inline]
    pub fn laddr64s(&self) -> &[LAddr64] {
        &self.as_laddr64()[..self.len]
    }

    #[inline]
    pub fn laddr32s(&self) -> &[LAddr32] {
        &self.as_laddr32()[..self.len]
    }

    /// Appends a virtual address. The caller flushes full buffers first.
    #[inline]
    pub fn push_vaddr(&mut self, addr: VAddr) {
        let len = self.len;
        self.as_vaddr_mut()[len] = addr;
        self.len = len + 1;
    }

    /// Moves the contents of `self` into the empty buffer `into`, leaving
    /// `self` empty with `into`'s old storage.
    pub fn take_into(&mut self, into: &mut Buffer) {
        assert!(into.is_empty(), "taking into a non-empty buffer");
        assert_eq!(self.bytes(), into.bytes(), "buffer sizes differ");
        std::mem::swap(&mut self.data, &mut into.data);
        into.kind = self.kind;
        into.start = self.start;
        into.len = self.len;
        self.len = 0;
    }

    /// Sorts the filled prefix and removes duplicates. Returns how many
    /// addresses were removed.
    pub fn sort_dedup(&mut self) -> usize {
        let before = self.len;
        self.len = match self.kind {
            BufferKind::LAddr32 => {
                let n = self.len;
                nub(&mut self.as_laddr32_mut()[..n])
            }
            BufferKind::LAddr64 => {
                let n = self.len;
                nub(&mut self.as_laddr64_mut()[..n])
            }
            BufferKind::VAddr => {
                let n = self.len;
                nub(&mut self.as_vaddr_mut()[..n])
            }
        };
        before - self.len
    }
}

fn nub<T: Ord + Copy>(s: &mut [T]) -> usize {
    s.sort_unstable();
    if s.is_empty() {
        return 0;
    }
    let mut o = 0;
    for i in 1..s.len() {
        if s[i] != s[o] {
            o += 1;
            s[o] = s[i];
        }
    }
    o + 1
}

impl fmt::Debug for Buffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "Buffer({} {}/{} start {:?})",
            self.kind,
            self.len,
            self.capacity(),
            self.start
        )
    }
}
