/// Iterates over the indexes of all set bits in a slice of words, lowest first.
pub struct SetBits<'a> {
    words: &'a [u64],
    index: usize,
    current: u64,
}

impl<'a> SetBits<'a> {
    pub fn new(words: &'a [u64]) -> Self {
        Self {
            words,
            index: 0,
            current: words.first().copied().unwrap_or(0),
        }
    }
}

impl<'a> Iterator for SetBits<'a> {
    type Item = usize;

    #[inline]
    fn next(&mut self) -> Option<usize> {
        while self.current == 0 {
            self.index += 1;
            if self.index >= self.words.len() {
                return None;
            }
            self.current = self.words[self.index];
        }
        let bit = self.current.trailing_zeros() as usize;
        self.current &= self.current - 1;
        Some(self.index * 64 + bit)
    }
}

#[inline]
pub fn set_bits(words: &[u64]) -> SetBits<'_> {
    SetBits::new(words)
}

#[inline]
pub fn count_ones(words: &[u64]) -> usize {
    words.iter().map(|w| w.count_ones() as usize).sum()
}

#[inline(always)]
pub fn test_bit(words: &[u64], bit: usize) -> bool {
    words[bit / 64] & (1 << (bit % 64)) != 0
}

#[inline(always)]
pub fn set_bit(words: &mut [u64], bit: usize) {
    words[bit / 64] |= 1 << (bit % 64);
}

/// Mask of the low `n` bits, `n <= 64`.
#[inline(always)]
pub const fn low_mask(n: u32) -> u64 {
    if n >= 64 {
        !0
    } else {
        (1u64 << n) - 1
    }
}
