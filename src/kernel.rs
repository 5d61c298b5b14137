//! Hot loops that have hardware specific implementations.
//!
//! The network and scanner only ever talk to a `&dyn Kernel`, picked once per
//! process by [detect] or forced with [portable].
use once_cell::sync::OnceCell;

use crate::{
    addr::{LAddr32, LAddr64, VAddr},
    globals::{MIN_POINTER, RADIX_BASE},
    util::bits,
};

pub type Counts = [u32; RADIX_BASE];

pub trait Kernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// Adds the histogram of digit `(addr >> shift) % RADIX_BASE` to `counts`.
    fn count32(&self, src: &[LAddr32], shift: u32, counts: &mut Counts);
    fn count64(&self, src: &[LAddr64], shift: u32, counts: &mut Counts);

    /// Collects the candidate pointers of every object of a packed span whose
    /// bit is set in `grey`.
    ///
    /// `mem` is the span's memory, `ptr_mask` has one bit per span word and
    /// objects are `obj_words` long. Values below [MIN_POINTER] are skipped.
    /// `out` must have room for one more entry than the words scanned. Returns
    /// the number of pointers written.
    fn scan_packed(
        &self,
        mem: &[u64],
        ptr_mask: &[u64],
        obj_words: usize,
        grey: &[u64],
        out: &mut [VAddr],
    ) -> usize;
}

const DIGIT: u64 = RADIX_BASE as u64 - 1;

pub struct Portable;

impl Kernel for Portable {
    fn name(&self) -> &'static str {
        "portable"
    }

    fn count32(&self, src: &[LAddr32], shift: u32, counts: &mut Counts) {
        for val in src {
            counts[((val.0 >> shift) as u64 & DIGIT) as usize] += 1;
        }
    }

    fn count64(&self, src: &[LAddr64], shift: u32, counts: &mut Counts) {
        for val in src {
            counts[((val.0 >> shift) & DIGIT) as usize] += 1;
        }
    }

    fn scan_packed(
        &self,
        mem: &[u64],
        ptr_mask: &[u64],
        obj_words: usize,
        grey: &[u64],
        out: &mut [VAddr],
    ) -> usize {
        scan_packed_generic(mem, ptr_mask, obj_words, grey, out)
    }
}

#[inline(always)]
fn scan_packed_generic(
    mem: &[u64],
    ptr_mask: &[u64],
    obj_words: usize,
    grey: &[u64],
    out: &mut [VAddr],
) -> usize {
    let mut n = 0;
    for obj in bits::set_bits(grey) {
        let start = obj * obj_words;
        for (word, &val) in mem[start..start + obj_words].iter().enumerate() {
            let word = start + word;
            // Loads every word and writes it speculatively; only kept entries
            // advance the cursor.
            let keep = bits::test_bit(ptr_mask, word) & (val >= MIN_POINTER);
            out[n] = VAddr(val);
            n += keep as usize;
        }
    }
    n
}

/// Scalar loops compiled with AVX2 enabled. Counting splits the histogram in
/// two so back to back increments of one digit do not serialize; any
/// vectorization is left to the compiler.
#[cfg(target_arch = "x86_64")]
pub struct Interleaved;

#[cfg(target_arch = "x86_64")]
mod interleaved {
    use super::*;

    #[target_feature(enable = "avx2")]
    pub unsafe fn count32(src: &[LAddr32], shift: u32, counts: &mut Counts) {
        let mut c0 = [0u32; RADIX_BASE];
        let mut c1 = [0u32; RADIX_BASE];
        let mut pairs = src.chunks_exact(2);
        for pair in &mut pairs {
            c0[((pair[0].0 >> shift) as u64 & DIGIT) as usize] += 1;
            c1[((pair[1].0 >> shift) as u64 & DIGIT) as usize] += 1;
        }
        for val in pairs.remainder() {
            c0[((val.0 >> shift) as u64 & DIGIT) as usize] += 1;
        }
        for i in 0..RADIX_BASE {
            counts[i] += c0[i] + c1[i];
        }
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn count64(src: &[LAddr64], shift: u32, counts: &mut Counts) {
        let mut c0 = [0u32; RADIX_BASE];
        let mut c1 = [0u32; RADIX_BASE];
        let mut pairs = src.chunks_exact(2);
        for pair in &mut pairs {
            c0[((pair[0].0 >> shift) & DIGIT) as usize] += 1;
            c1[((pair[1].0 >> shift) & DIGIT) as usize] += 1;
        }
        for val in pairs.remainder() {
            c0[((val.0 >> shift) & DIGIT) as usize] += 1;
        }
        for i in 0..RADIX_BASE {
            counts[i] += c0[i] + c1[i];
        }
    }

    #[target_feature(enable = "avx2")]
    pub unsafe fn scan_packed(
        mem: &[u64],
        ptr_mask: &[u64],
        obj_words: usize,
        grey: &[u64],
        out: &mut [VAddr],
    ) -> usize {
        scan_packed_generic(mem, ptr_mask, obj_words, grey, out)
    }
}

#[cfg(target_arch = "x86_64")]
impl Kernel for Interleaved {
    fn name(&self) -> &'static str {
        "interleaved"
    }

    fn count32(&self, src: &[LAddr32], shift: u32, counts: &mut Counts) {
        // Only constructed once AVX2 support has been detected.
        unsafe { interleaved::count32(src, shift, counts) }
    }

    fn count64(&self, src: &[LAddr64], shift: u32, counts: &mut Counts) {
        unsafe { interleaved::count64(src, shift, counts) }
    }

    fn scan_packed(
        &self,
        mem: &[u64],
        ptr_mask: &[u64],
        obj_words: usize,
        grey: &[u64],
        out: &mut [VAddr],
    ) -> usize {
        unsafe { interleaved::scan_packed(mem, ptr_mask, obj_words, grey, out) }
    }
}

static DETECTED: OnceCell<&'static dyn Kernel> = OnceCell::new();

/// The best kernel for this CPU. Detection runs once per process.
pub fn detect() -> &'static dyn Kernel {
    *DETECTED.get_or_init(|| {
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") {
                log::debug!("using interleaved kernel");
                return &Interleaved;
            }
        }
        log::debug!("using portable kernel");
        &Portable
    })
}

pub fn portable() -> &'static dyn Kernel {
    &Portable
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn kernels_agree(
            addrs in proptest::collection::vec(any::<u64>(), 0..300),
            shift in 0u32..28,
        ) {
            let l64: Vec<LAddr64> = addrs.iter().map(|&a| LAddr64(a)).collect();
            let l32: Vec<LAddr32> = addrs.iter().map(|&a| LAddr32(a as u32)).collect();
            let mut reference64 = [0u32; RADIX_BASE];
            let mut reference32 = [0u32; RADIX_BASE];
            for &a in &addrs {
                reference64[((a >> shift) & DIGIT) as usize] += 1;
                reference32[(((a as u32) >> shift) as u64 & DIGIT) as usize] += 1;
            }
            for kernel in [portable(), detect()] {
                let mut c = [0u32; RADIX_BASE];
                kernel.count64(&l64, shift, &mut c);
                prop_assert_eq!(c, reference64);
                let mut c = [0u32; RADIX_BASE];
                kernel.count32(&l32, shift, &mut c);
                prop_assert_eq!(c, reference32);
            }
        }
    }

    #[test]
    fn kernel_names() {
        assert_eq!(portable().name(), "portable");
        #[cfg(target_arch = "x86_64")]
        {
            let want = if is_x86_feature_detected!("avx2") { "interleaved" } else { "portable" };
            assert_eq!(detect().name(), want);
        }
    }

    #[test]
    fn scan_packed_filters() {
        // Two 4-word objects; pointer slots at words 1 and 6.
        let mem = [0, 0x10000, 7, 0x20000, 0, 0x30000, 0x40000, 0];
        let mask = [1 << 1 | 1 << 6];
        let mut out = [VAddr(0); 9];
        for kernel in [portable(), detect()] {
            let n = kernel.scan_packed(&mem, &mask, 4, &[0b11], &mut out);
            assert_eq!(&out[..n], &[VAddr(0x10000), VAddr(0x40000)], "{}", kernel.name());
            let n = kernel.scan_packed(&mem, &mask, 4, &[0b10], &mut out);
            assert_eq!(&out[..n], &[VAddr(0x40000)]);
        }
    }
}
