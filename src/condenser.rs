//! Folding per-word dartboard bits into per-object bits.
//!
//! A [Condenser] is built once per size class. It holds one step per 64-bit
//! word of a span's dartboard, so condensing replays a fixed program and never
//! has to locate object boundaries at run time.
use crate::{
    globals::{MAX_PAGES_PER_SPAN, PAGE_BYTES, PAGE_WORDS, WORD_BYTES},
    heap::Heap,
    util::{bits::low_mask, ceil_div},
};

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
struct Step {
    /// Low bits of this word that belong to a field begun in an earlier word.
    carry_mask: u64,
    /// Output bit of that field.
    carry_bit: u16,
    /// Output bit of the first field starting in this word.
    first: u16,
    /// Bit offset of the first field starting in this word.
    shift: u8,
    /// Number of fields starting in this word.
    fields: u8,
}

#[derive(Clone, Debug)]
pub struct Condenser {
    width: usize,
    objects: usize,
    /// Word offset within the span of the first step.
    start: usize,
    steps: Vec<Step>,
}

#[inline(always)]
fn or_bit(dst: &mut [u64], bit: usize, v: u64) {
    dst[bit / 64] |= ((v != 0) as u64) << (bit % 64);
}

impl Condenser {
    /// Builds a condenser that folds each `width`-bit field of a `limit`-bit
    /// input into one output bit. Only whole fields produce output bits.
    pub fn build(width: usize, limit: usize) -> Self {
        assert!(width > 0, "zero condenser width");
        assert!(limit % 64 == 0, "condenser limit {} not word aligned", limit);
        let objects = limit / width;
        assert!(objects <= u16::MAX as usize, "too many objects to condense");
        let fields_end = objects * width;

        let mut steps = Vec::with_capacity(limit / 64);
        for word in 0..limit / 64 {
            let lo = word * 64;
            let hi = lo + 64;
            let mut step = Step::default();

            // The field straddling into this word.
            let open = lo / width;
            if open * width < lo && open < objects {
                let end = (open + 1) * width;
                step.carry_mask = low_mask((end.min(hi) - lo) as u32);
                step.carry_bit = open as u16;
            }

            // Fields starting in this word.
            let first = ceil_div(lo, width);
            let last = ceil_div(hi.min(fields_end), width).max(first);
            if first < objects && first * width < hi {
                step.first = first as u16;
                step.shift = (first * width - lo) as u8;
                step.fields = (last - first) as u8;
            }
            steps.push(step);
        }

        Self {
            width,
            objects,
            start: 0,
            steps,
        }
    }

    /// Number of objects this condenser produces bits for.
    #[inline]
    pub fn objects(&self) -> usize {
        self.objects
    }

    #[inline]
    pub fn width(&self) -> usize {
        self.width
    }

    /// Number of input words consumed.
    #[inline]
    pub fn words(&self) -> usize {
        self.steps.len()
    }

    /// Restricts the condenser to input bits `[start, end)`, both multiples of
    /// 64 and relative to the full input. `end` is clamped to the input
    /// length. Output bits keep their positions.
    pub fn slice(&self, start: usize, end: usize) -> Condenser {
        assert!(
            start % 64 == 0 && (end % 64 == 0 || end == usize::MAX),
            "condenser slice [{:#x},{:#x}) not word aligned",
            start,
            end
        );
        let lo = start / 64 - self.start / 64;
        let hi = (end / 64).saturating_sub(self.start / 64).min(self.steps.len());
        assert!(lo <= hi, "empty condenser slice");
        Condenser {
            width: self.width,
            objects: self.objects,
            start,
            steps: self.steps[lo..hi].to_vec(),
        }
    }

    /// ORs one bit per object into `dst` for every object with a set bit in
    /// `src`. `src` covers exactly the words of this condenser.
    pub fn condense(&self, src: &[u64], dst: &mut [u64]) {
        assert_eq!(
            src.len(),
            self.steps.len(),
            "condenser input has {} words, want {}",
            src.len(),
            self.steps.len()
        );
        let field = low_mask(self.width.min(64) as u32);
        let width = self.width as u32;
        for (step, &word) in self.steps.iter().zip(src) {
            or_bit(dst, step.carry_bit as usize, word & step.carry_mask);
            let mut w = word >> step.shift;
            let mut out = step.first as usize;
            for _ in 0..step.fields {
                or_bit(dst, out, w & field);
                w = w.checked_shr(width).unwrap_or(0);
                out += 1;
            }
        }
    }
}

/// Condensers for every size class, including the clipped variants used for
/// spans that only partly overlap a region.
pub struct CondenserTable {
    full: Vec<Option<Condenser>>,
    /// `tail[class][page - 1]` condenses the span from `page` to its end.
    tail: Vec<Vec<Condenser>>,
    /// `head[class][page - 1]` condenses the first `page` pages of the span.
    head: Vec<Vec<Condenser>>,
}

impl CondenserTable {
    pub fn new(heap: &Heap) -> Self {
        let classes = heap.size_classes();
        let mut full = Vec::with_capacity(classes.len());
        let mut tail = Vec::with_capacity(classes.len());
        let mut head = Vec::with_capacity(classes.len());
        for class in classes {
            if class.id == 0 {
                full.push(None);
                tail.push(vec![]);
                head.push(vec![]);
                continue;
            }
            debug_assert!(class.span_pages <= MAX_PAGES_PER_SPAN);
            let cd = Condenser::build(
                class.object_bytes / WORD_BYTES,
                class.span_pages * PAGE_BYTES / WORD_BYTES,
            );
            let mut t = Vec::with_capacity(class.span_pages.saturating_sub(1));
            let mut h = Vec::with_capacity(class.span_pages.saturating_sub(1));
            for page in 1..class.span_pages {
                t.push(cd.slice(page * PAGE_WORDS, usize::MAX));
                h.push(cd.slice(0, page * PAGE_WORDS));
            }
            full.push(Some(cd));
            tail.push(t);
            head.push(h);
        }
        Self { full, tail, head }
    }

    pub fn full(&self, class: usize) -> &Condenser {
        match &self.full[class] {
            Some(cd) => cd,
            None => panic!("no condenser for size class {}", class),
        }
    }

    pub fn tail(&self, class: usize, start_page: usize) -> &Condenser {
        &self.tail[class][start_page - 1]
    }

    pub fn head(&self, class: usize, pages: usize) -> &Condenser {
        &self.head[class][pages - 1]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::globals::OBJ_MASK_WORDS;
    use proptest::prelude::*;

    fn reference(width: usize, objects: usize, first_bit: usize, src: &[u64]) -> Vec<u64> {
        let mut out = vec![0u64; OBJ_MASK_WORDS];
        for (i, &w) in src.iter().enumerate() {
            for b in 0..64 {
                let bit = first_bit + i * 64 + b;
                if w & (1 << b) != 0 && bit / width < objects {
                    out[bit / width / 64] |= 1 << (bit / width % 64);
                }
            }
        }
        out
    }

    #[test]
    fn single_bit() {
        for width in 1..=200 {
            let limit = PAGE_WORDS;
            let cd = Condenser::build(width, limit);
            for p in 0..limit {
                let mut src = vec![0u64; limit / 64];
                src[p / 64] = 1 << (p % 64);
                let mut dst = vec![0u64; OBJ_MASK_WORDS];
                cd.condense(&src, &mut dst);
                let set: Vec<usize> = crate::util::bits::set_bits(&dst).collect();
                if p / width < cd.objects() {
                    assert_eq!(set, vec![p / width], "width {} bit {}", width, p);
                } else {
                    assert!(set.is_empty(), "width {} waste bit {} produced {:?}", width, p, set);
                }
            }
        }
    }

    #[test]
    fn wide_objects() {
        // 1152 byte objects straddle three words.
        let cd = Condenser::build(144, PAGE_WORDS);
        assert_eq!(cd.objects(), 7);
        let mut src = vec![0u64; PAGE_WORDS / 64];
        src[3] = 1 << 63;
        let mut dst = [0u64; OBJ_MASK_WORDS];
        cd.condense(&src, &mut dst);
        assert_eq!(dst[0], 1 << 1);
    }

    #[test]
    fn slices_keep_object_indexes() {
        let cd = Condenser::build(6, 4 * PAGE_WORDS);
        let tail = cd.slice(2 * PAGE_WORDS, usize::MAX);
        let head = cd.slice(0, PAGE_WORDS);
        assert_eq!(tail.words(), 2 * PAGE_WORDS / 64);
        assert_eq!(head.words(), PAGE_WORDS / 64);

        let mut src = vec![0u64; tail.words()];
        src[0] = 1;
        let mut dst = vec![0u64; OBJ_MASK_WORDS];
        tail.condense(&src, &mut dst);
        let set: Vec<usize> = crate::util::bits::set_bits(&dst).collect();
        assert_eq!(set, vec![2 * PAGE_WORDS / 6]);
    }

    proptest! {
        #[test]
        fn matches_reference(
            class in 1usize..68,
            seed in proptest::collection::vec(any::<u64>(), 10 * PAGE_WORDS / 64),
            sparsity in 0u32..4,
        ) {
            let table = crate::heap::SizeClass::default_table();
            let sc = &table[class];
            let width = sc.object_bytes / WORD_BYTES;
            let limit = sc.span_pages * PAGE_WORDS;
            let cd = Condenser::build(width, limit);
            let src: Vec<u64> = seed[..limit / 64]
                .iter()
                .map(|&w| match sparsity {
                    0 => w,
                    s => w & w.rotate_left(s * 13) & w.rotate_left(s * 29),
                })
                .collect();

            let mut dst = vec![0u64; OBJ_MASK_WORDS];
            cd.condense(&src, &mut dst);
            prop_assert_eq!(&dst, &reference(width, cd.objects(), 0, &src));

            for page in 1..sc.span_pages {
                let tail = cd.slice(page * PAGE_WORDS, usize::MAX);
                let part = &src[page * PAGE_WORDS / 64..];
                let mut dst = vec![0u64; OBJ_MASK_WORDS];
                tail.condense(part, &mut dst);
                prop_assert_eq!(&dst, &reference(width, cd.objects(), page * PAGE_WORDS, part));

                let head = cd.slice(0, page * PAGE_WORDS);
                let part = &src[..page * PAGE_WORDS / 64];
                let mut dst = vec![0u64; OBJ_MASK_WORDS];
                head.condense(part, &mut dst);
                prop_assert_eq!(&dst, &reference(width, cd.objects(), 0, part));
            }
        }
    }
}
