//! Host heap model.
//!
//! The scanner does not allocate; it only needs to resolve addresses against a
//! heap laid out as arenas of pages, with pages grouped into spans of one size
//! class. This model keeps the layout and the object memory, which is all the
//! scanner and the reference marker consume.
use std::collections::HashMap;

use memmap2::MmapMut;

use crate::{
    addr::{ArenaId, LAddr, VAddr},
    globals::*,
    util::{bits, ceil_div},
};

pub type ObjectId = u64;
pub type TypeId = u64;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum HeapBitsKind {
    /// No pointers.
    None,
    /// One bit per word of the span.
    Packed,
    /// Each object starts with a header word naming its type.
    Header,
    /// The type is held by the span (one object per span).
    Oob,
}

#[derive(Clone, Debug)]
pub struct SizeClass {
    pub id: usize,
    pub object_bytes: usize,
    pub span_pages: usize,
    pub heap_bits: HeapBitsKind,
}

impl SizeClass {
    pub fn objects_per_span(&self) -> usize {
        (self.span_pages * PAGE_BYTES) / self.object_bytes
    }

    /// The default size class table, each class using the fewest
    /// pages that waste at most 1/8 of its span.
    pub fn default_table() -> Vec<SizeClass> {
        let mut classes = Vec::with_capacity(NUM_SIZE_CLASSES);
        classes.push(SizeClass {
            id: 0,
            object_bytes: 0,
            span_pages: 0,
            heap_bits: HeapBitsKind::Oob,
        });
        for (id, &size) in CLASS_TO_SIZE.iter().enumerate().skip(1) {
            let size = size as usize;
            let mut best = (usize::MAX, MAX_PAGES_PER_SPAN);
            let mut span_pages = None;
            for pages in 1..=MAX_PAGES_PER_SPAN {
                let span = pages * PAGE_BYTES;
                if span < size {
                    continue;
                }
                let waste = span % size;
                if waste * 8 <= span {
                    span_pages = Some(pages);
                    break;
                }
                if waste * best.1 < best.0 * pages {
                    best = (waste, pages);
                }
            }
            classes.push(SizeClass {
                id,
                object_bytes: size,
                span_pages: span_pages.unwrap_or(best.1),
                heap_bits: if size <= MAX_PACKED_OBJECT_BYTES {
                    HeapBitsKind::Packed
                } else {
                    HeapBitsKind::Header
                },
            });
        }
        classes
    }
}

#[derive(Clone, Debug)]
pub enum HeapBits {
    None,
    Packed(Vec<u64>),
    Header(Vec<Option<TypeId>>),
    Oob(Option<TypeId>),
}

impl HeapBits {
    pub fn kind(&self) -> HeapBitsKind {
        match self {
            HeapBits::None => HeapBitsKind::None,
            HeapBits::Packed(_) => HeapBitsKind::Packed,
            HeapBits::Header(_) => HeapBitsKind::Header,
            HeapBits::Oob(_) => HeapBitsKind::Oob,
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub struct SpanId(pub u32);

#[derive(Debug)]
pub struct Span {
    pub start: VAddr,
    /// Byte just past last object in the span.
    pub end: VAddr,
    pub pages: usize,
    /// `None` for large object spans.
    pub size_class: Option<usize>,
    pub heap_bits: HeapBits,
    pub first_object: ObjectId,
    object_bytes: usize,
}

impl Span {
    /// Byte just past the last page of the span.
    #[inline]
    pub fn limit(&self) -> VAddr {
        self.start.plus(self.pages * PAGE_BYTES)
    }
    #[inline]
    pub fn object_bytes(&self) -> usize {
        self.object_bytes
    }
    #[inline]
    pub fn object_count(&self) -> usize {
        if self.size_class.is_some() {
            (self.pages * PAGE_BYTES) / self.object_bytes
        } else {
            1
        }
    }
    #[inline]
    pub fn is_noscan(&self) -> bool {
        matches!(self.heap_bits, HeapBits::None)
    }
    pub fn object_base(&self, index: usize) -> VAddr {
        assert!(
            index < self.object_count(),
            "object {} out of range [0,{})",
            index,
            self.object_count()
        );
        self.start.plus(index * self.object_bytes)
    }
}

#[derive(Clone, Debug)]
pub struct Type {
    pub id: TypeId,
    pub size: usize,
    pub ptr_words: usize,
    pub ptr_mask: Vec<u64>,
}

pub struct Arena {
    pub id: ArenaId,
    pub start: VAddr,
    /// Page index -> span index + 1.
    span_map: Vec<u32>,
    mem: MmapMut,
}

impl Arena {
    #[inline]
    pub fn contains(&self, addr: VAddr) -> bool {
        addr >= self.start && addr < self.start.plus(ARENA_BYTES)
    }
}

pub struct Heap {
    size_classes: Vec<SizeClass>,
    types: HashMap<TypeId, Type>,
    /// `VAddr::arena_index` -> `ArenaId` + 1, zero meaning no arena.
    arena_map: Vec<u32>,
    arenas: Vec<Arena>,
    spans: Vec<Span>,
    next_object: ObjectId,
}

impl Heap {
    pub fn new(size_classes: Vec<SizeClass>) -> Self {
        assert_eq!(
            size_classes.len(),
            NUM_SIZE_CLASSES,
            "expected {} size classes",
            NUM_SIZE_CLASSES
        );
        for (i, class) in size_classes.iter().enumerate() {
            assert_eq!(class.id, i, "bad size class ID");
            if i == 0 {
                continue;
            }
            assert!(
                class.span_pages <= MAX_PAGES_PER_SPAN,
                "too many pages in size class {:?}",
                class
            );
            assert!(
                class.objects_per_span() <= MAX_OBJS_PER_SPAN,
                "too many objects in size class {:?}",
                class
            );
        }
        Self {
            size_classes,
            types: HashMap::new(),
            arena_map: Vec::new(),
            arenas: Vec::new(),
            spans: Vec::new(),
            next_object: OBJECT_COUNT_ALIGN,
        }
    }

    pub fn with_default_classes() -> Self {
        Self::new(SizeClass::default_table())
    }

    pub fn size_classes(&self) -> &[SizeClass] {
        &self.size_classes
    }

    pub fn arenas(&self) -> &[Arena] {
        &self.arenas
    }

    pub fn arena(&self, id: ArenaId) -> &Arena {
        &self.arenas[id.0 as usize]
    }

    /// Bytes of linear address space, one arena per `ArenaId`.
    pub fn linear_bytes(&self) -> usize {
        self.arenas.len() * ARENA_BYTES
    }

    pub fn span(&self, id: SpanId) -> &Span {
        &self.spans[id.0 as usize]
    }

    pub fn spans(&self) -> impl Iterator<Item = &Span> {
        self.spans.iter()
    }

    /// One past the largest object ID handed out.
    pub fn object_ids(&self) -> ObjectId {
        self.next_object
    }

    pub fn types(&self) -> &HashMap<TypeId, Type> {
        &self.types
    }

    fn arena_index_to_id(&self, idx: usize) -> Option<ArenaId> {
        match self.arena_map.get(idx) {
            Some(&id) if id != 0 => Some(ArenaId(id - 1)),
            _ => None,
        }
    }

    fn ensure_arena(&mut self, addr: VAddr) -> ArenaId {
        let idx = addr.arena_index();
        if idx >= self.arena_map.len() {
            self.arena_map.resize(idx + 1, 0);
        }
        if let Some(id) = self.arena_index_to_id(idx) {
            return id;
        }
        let id = ArenaId(self.arenas.len() as u32);
        let mem = MmapMut::map_anon(ARENA_BYTES)
            .unwrap_or_else(|err| panic!("failed to map arena memory: {}", err));
        self.arenas.push(Arena {
            id,
            start: VAddr((idx * ARENA_BYTES) as u64),
            span_map: vec![0; ARENA_PAGES],
            mem,
        });
        self.arena_map[idx] = id.0 + 1;
        log::trace!("new arena {} at {}", id, VAddr((idx * ARENA_BYTES) as u64));
        id
    }

    pub fn find_arena(&self, addr: VAddr) -> Option<&Arena> {
        self.arena_index_to_id(addr.arena_index())
            .map(|id| &self.arenas[id.0 as usize])
    }

    fn install_span(&mut self, mut span: Span) -> SpanId {
        assert!(
            span.start.0 % PAGE_BYTES as u64 == 0,
            "unaligned span base {}",
            span.start
        );
        let id = SpanId(self.spans.len() as u32);
        for page in 0..span.pages {
            let addr = span.start.plus(page * PAGE_BYTES);
            let arena = self.ensure_arena(addr);
            let slot = &mut self.arenas[arena.0 as usize].span_map[addr.page_in_arena()];
            if *slot != 0 {
                panic!(
                    "span overlap: new span at {} collides with {:?}",
                    span.start,
                    self.spans[*slot as usize - 1].start
                );
            }
            *slot = id.0 + 1;
        }
        let objects = span.object_count() as u64;
        span.first_object = self.next_object;
        self.next_object += objects;
        self.next_object = (self.next_object + OBJECT_COUNT_ALIGN - 1) & !(OBJECT_COUNT_ALIGN - 1);
        self.spans.push(span);
        id
    }

    pub fn new_span(&mut self, base: VAddr, class: usize, noscan: bool) -> SpanId {
        let sc = self.size_classes[class].clone();
        assert!(class != 0, "size class 0 is reserved for large spans");
        let objects = sc.objects_per_span();
        let heap_bits = match (noscan, sc.heap_bits) {
            (true, _) | (_, HeapBitsKind::None) => HeapBits::None,
            (false, HeapBitsKind::Packed) => {
                HeapBits::Packed(vec![0; ceil_div(sc.span_pages * PAGE_WORDS, 64)])
            }
            (false, HeapBitsKind::Header) => HeapBits::Header(vec![None; objects]),
            (false, HeapBitsKind::Oob) => HeapBits::Oob(None),
        };
        self.install_span(Span {
            start: base,
            end: base.plus(objects * sc.object_bytes),
            pages: sc.span_pages,
            size_class: Some(class),
            heap_bits,
            first_object: 0,
            object_bytes: sc.object_bytes,
        })
    }

    pub fn new_span_large(&mut self, base: VAddr, pages: usize, noscan: bool) -> SpanId {
        assert!(pages > 0, "empty large span");
        self.install_span(Span {
            start: base,
            end: base.plus(pages * PAGE_BYTES),
            pages,
            size_class: None,
            heap_bits: if noscan {
                HeapBits::None
            } else {
                HeapBits::Oob(None)
            },
            first_object: 0,
            object_bytes: pages * PAGE_BYTES,
        })
    }

    pub fn new_type(&mut self, id: TypeId, size: usize, ptr_words: usize, ptr_mask: Vec<u64>) {
        assert!(
            !self.types.contains_key(&id),
            "duplicate type ID {}",
            id
        );
        assert!(size % WORD_BYTES == 0 && size > 0, "bad type size {}", size);
        assert!(ptr_words <= ptr_mask.len() * 64, "pointer mask too short");
        self.types.insert(
            id,
            Type {
                id,
                size,
                ptr_words,
                ptr_mask,
            },
        );
    }

    /// Records the type of object `index` of a header or out-of-band span.
    pub fn set_object_type(&mut self, span: SpanId, index: usize, ty: TypeId) {
        assert!(self.types.contains_key(&ty), "unknown type ID {}", ty);
        match &mut self.spans[span.0 as usize].heap_bits {
            HeapBits::Header(types) => types[index] = Some(ty),
            HeapBits::Oob(slot) => {
                assert_eq!(index, 0, "out-of-band spans hold one object");
                *slot = Some(ty)
            }
            other => panic!("span has {:?} heap bits, not typed objects", other.kind()),
        }
    }

    /// Marks the word at `addr` as a pointer slot in a packed span.
    pub fn set_pointer_word(&mut self, addr: VAddr) {
        let id = self
            .find_span_id(addr)
            .unwrap_or_else(|| panic!("{} is not in a span", addr));
        let span = &mut self.spans[id.0 as usize];
        let word = addr.minus(span.start) / WORD_BYTES;
        match &mut span.heap_bits {
            HeapBits::Packed(mask) => bits::set_bit(mask, word),
            other => panic!("span has {:?} heap bits, not packed", other.kind()),
        }
    }

    pub fn write_word(&mut self, addr: VAddr, value: u64) {
        assert!(addr.0 % WORD_BYTES as u64 == 0, "unaligned word {}", addr);
        let id = self
            .arena_index_to_id(addr.arena_index())
            .unwrap_or_else(|| panic!("{} is not in an arena", addr));
        let off = addr.arena_offset();
        self.arenas[id.0 as usize].mem[off..off + WORD_BYTES].copy_from_slice(&value.to_ne_bytes());
    }

    /// The `count` words of memory starting at `base`, which must lie in one arena.
    pub fn words(&self, base: VAddr, count: usize) -> &[u64] {
        let arena = self
            .find_arena(base)
            .unwrap_or_else(|| panic!("{} is not in an arena", base));
        let off = base.arena_offset();
        assert!(
            off % WORD_BYTES == 0 && off + count * WORD_BYTES <= ARENA_BYTES,
            "bad memory range {} + {} words",
            base,
            count
        );
        // The mapping is page aligned and every bit pattern is a valid u64.
        unsafe {
            std::slice::from_raw_parts(arena.mem.as_ptr().add(off).cast::<u64>(), count)
        }
    }

    fn find_span_id(&self, addr: VAddr) -> Option<SpanId> {
        let arena = self.find_arena(addr)?;
        match arena.span_map[addr.page_in_arena()] {
            0 => None,
            idx => Some(SpanId(idx - 1)),
        }
    }

    pub fn find_span(&self, addr: VAddr) -> Option<&Span> {
        self.find_span_id(addr).map(|id| &self.spans[id.0 as usize])
    }

    /// Resolves an address to the object containing it. Addresses past the
    /// last whole object of a span do not name an object.
    pub fn find_object(&self, addr: VAddr) -> Option<(VAddr, &Span, ObjectId)> {
        let span = self.find_span(addr)?;
        if addr >= span.end {
            return None;
        }
        let index = addr.minus(span.start) / span.object_bytes;
        Some((
            span.start.plus(index * span.object_bytes),
            span,
            span.first_object + index as u64,
        ))
    }

    pub fn vaddr_to_laddr(&self, addr: VAddr) -> LAddr {
        match self.arena_index_to_id(addr.arena_index()) {
            Some(id) => LAddr::new(id, addr.arena_offset()),
            None => LAddr::NONE,
        }
    }

    pub fn laddr_to_vaddr(&self, addr: LAddr) -> VAddr {
        let (id, off) = addr.arena();
        self.arenas[id.0 as usize].start.plus(off)
    }

    /// All objects in address order within each arena, with their IDs.
    pub fn objects(&self) -> impl Iterator<Item = (VAddr, ObjectId)> + '_ {
        self.spans.iter().flat_map(|span| {
            (0..span.object_count()).map(move |i| (span.object_base(i), span.first_object + i as u64))
        })
    }

    /// The type of object `index` of `span`, for header and out-of-band spans.
    pub fn object_type(&self, span: &Span, index: usize) -> Option<&Type> {
        let id = match &span.heap_bits {
            HeapBits::Header(types) => types[index],
            HeapBits::Oob(ty) => *ty,
            _ => None,
        }?;
        self.types.get(&id)
    }

    pub fn pointers(&self, span: &Span, index: usize) -> Vec<VAddr> {
        let mut out = vec![];
        self.for_each_pointer(span, index, |p| out.push(p));
        out
    }

    /// Calls `f` with every pointer-typed word of object `index` of `span`
    /// whose value could be a heap pointer.
    pub fn for_each_pointer(&self, span: &Span, index: usize, mut f: impl FnMut(VAddr)) {
        let base = span.object_base(index);
        let mem = self.words(base, span.object_bytes / WORD_BYTES);
        match &span.heap_bits {
            HeapBits::None => {}
            HeapBits::Packed(mask) => {
                let first = base.minus(span.start) / WORD_BYTES;
                for (i, &val) in mem.iter().enumerate() {
                    if bits::test_bit(mask, first + i) && val >= MIN_POINTER {
                        f(VAddr(val));
                    }
                }
            }
            HeapBits::Header(_) | HeapBits::Oob(_) => {
                let ty = match self.object_type(span, index) {
                    Some(ty) => ty,
                    None => return,
                };
                let mem = if span.heap_bits.kind() == HeapBitsKind::Header {
                    &mem[1..]
                } else {
                    mem
                };
                let stride = ty.size / WORD_BYTES;
                for (i, &val) in mem.iter().enumerate() {
                    let bit = i % stride;
                    if bit < ty.ptr_words && bits::test_bit(&ty.ptr_mask, bit) && val >= MIN_POINTER {
                        f(VAddr(val));
                    }
                }
            }
        }
    }
}
