//! Inputs from the collection driver and mark validation.
use crate::{
    addr::VAddr,
    globals::MIN_POINTER,
    heap::{Heap, ObjectId},
    mark_bitmap::MarkBitmap,
};

/// What the collection driver hands to a scan.
#[derive(Clone, Debug)]
pub struct GcInfo {
    /// Number of scanning workers, one top-layer buffer each.
    pub workers: usize,
    pub roots: Vec<VAddr>,
    /// Pointers greyed by the write barrier.
    pub wb_roots: Vec<VAddr>,
    /// Objects allocated during the cycle. They are marked but never scanned.
    pub alloc_black: Vec<VAddr>,
}

impl Default for GcInfo {
    fn default() -> Self {
        Self {
            workers: 1,
            roots: vec![],
            wb_roots: vec![],
            alloc_black: vec![],
        }
    }
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct MarkComparison {
    /// Reachable objects the scan did not mark.
    pub missing: Vec<ObjectId>,
    /// Objects the scan marked that are not reachable.
    pub extra: Vec<ObjectId>,
}

impl MarkComparison {
    pub fn is_match(&self) -> bool {
        self.missing.is_empty() && self.extra.is_empty()
    }
}

/// A plain worklist marker over the same heap model, used as the ground truth
/// for scans.
pub struct ReferenceMarker<'a> {
    heap: &'a Heap,
    marks: MarkBitmap,
    worklist: Vec<(VAddr, ObjectId)>,
}

impl<'a> ReferenceMarker<'a> {
    pub fn new(heap: &'a Heap) -> Self {
        Self {
            heap,
            marks: MarkBitmap::new(heap.object_ids()),
            worklist: vec![],
        }
    }

    fn visit(&mut self, addr: VAddr) {
        if addr.0 < MIN_POINTER {
            return;
        }
        if let Some((base, _, id)) = self.heap.find_object(addr) {
            if !self.marks.mark(id) {
                self.worklist.push((base, id));
            }
        }
    }

    pub fn run(mut self, info: &GcInfo) -> MarkBitmap {
        for &addr in &info.alloc_black {
            if let Some((_, _, id)) = self.heap.find_object(addr) {
                self.marks.mark(id);
            }
        }
        for &root in info.roots.iter().chain(&info.wb_roots) {
            self.visit(root);
        }
        while let Some((base, id)) = self.worklist.pop() {
            let span = match self.heap.find_span(base) {
                Some(span) => span,
                None => unreachable!("marked object {} has no span", id),
            };
            let index = (id - span.first_object) as usize;
            for ptr in self.heap.pointers(span, index) {
                self.visit(ptr);
            }
        }
        self.marks
    }
}

impl GcInfo {
    /// Checks `marks` against the reference marker and logs every difference.
    pub fn compare_marks(&self, heap: &Heap, marks: &MarkBitmap) -> MarkComparison {
        let want = ReferenceMarker::new(heap).run(self);
        let mut cmp = MarkComparison::default();
        for (addr, id) in heap.objects() {
            match (want.is_marked(id), marks.is_marked(id)) {
                (true, false) => {
                    log::warn!("object {} at {} reachable but not marked", id, addr);
                    cmp.missing.push(id);
                }
                (false, true) => {
                    log::warn!("object {} at {} marked but not reachable", id, addr);
                    cmp.extra.push(id);
                }
                _ => {}
            }
        }
        if cmp.is_match() {
            log::debug!("marks match reference ({} objects)", want.count());
        }
        cmp
    }
}
