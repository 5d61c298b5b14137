pub mod bits;

/// Returns log2 of `value` if it is a power of two.
#[inline]
pub fn which_power_of_two(value: u64) -> Option<u32> {
    if value == 0 || value & (value - 1) != 0 {
        return None;
    }
    Some(value.trailing_zeros())
}

#[inline(always)]
pub const fn ceil_div(x: usize, y: usize) -> usize {
    (x + y - 1) / y
}

pub struct FormattedSize {
    pub size: usize,
}

impl std::fmt::Display for FormattedSize {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let ksize = (self.size as f64) / 1024f64;

        if ksize < 1f64 {
            return write!(f, "{}B", self.size);
        }

        let msize = ksize / 1024f64;

        if msize < 1f64 {
            return write!(f, "{:.1}K", ksize);
        }

        let gsize = msize / 1024f64;

        if gsize < 1f64 {
            write!(f, "{:.1}M", msize)
        } else {
            write!(f, "{:.1}G", gsize)
        }
    }
}

pub fn formatted_size(size: usize) -> FormattedSize {
    FormattedSize { size }
}
