pub const WORD_BYTES: usize = 8;
pub const PAGE_BYTES: usize = 8 * 1024;
pub const ARENA_BYTES: usize = 64 * 1024 * 1024;

pub const PAGE_WORDS: usize = PAGE_BYTES / WORD_BYTES;
pub const ARENA_WORDS: usize = ARENA_BYTES / WORD_BYTES;
pub const ARENA_PAGES: usize = ARENA_BYTES / PAGE_BYTES;

pub const MAX_OBJS_PER_SPAN: usize = 1024;
/// Excluding large object spans.
pub const MAX_PAGES_PER_SPAN: usize = 10;
/// The first object ID of every span is aligned to this so span mark bits start on a word.
pub const OBJECT_COUNT_ALIGN: u64 = 64;

pub const NUM_SIZE_CLASSES: usize = 68;

/// Anything below this is never treated as a heap pointer.
pub const MIN_POINTER: u64 = 4096;

/// Bytes of heap covered by one dartboard region, the unit of queued scan work.
pub const BYTES_PER_REGION: usize = 256 * 1024;
pub const DARTBOARD_BITS_PER_REGION: usize = BYTES_PER_REGION / WORD_BYTES;
pub const DARTBOARD_WORDS_PER_REGION: usize = DARTBOARD_BITS_PER_REGION / 64;
pub const REGIONS_PER_ARENA: usize = ARENA_BYTES / BYTES_PER_REGION;

/// log2 of [RADIX_BASE].
pub const RADIX_BITS: u32 = 4;
/// Radix of the routing sort. Every layer routes by one digit of this base.
pub const RADIX_BASE: usize = 1 << RADIX_BITS;

/// Number of `u64` words needed for one bit per object in the largest span.
pub const OBJ_MASK_WORDS: usize = (MAX_OBJS_PER_SPAN + 63) / 64;

/// Object sizes, indexed by size class.
pub const CLASS_TO_SIZE: [u16; NUM_SIZE_CLASSES] = [
    0, 8, 16, 24, 32, 48, 64, 80, 96, 112, 128, 144, 160, 176, 192, 208, 224, 240, 256, 288, 320,
    352, 384, 416, 448, 480, 512, 576, 640, 704, 768, 896, 1024, 1152, 1280, 1408, 1536, 1792,
    2048, 2304, 2688, 3072, 3200, 3456, 4096, 4864, 5376, 6144, 6528, 6784, 6912, 8192, 9472,
    9728, 10240, 10880, 12288, 13568, 14336, 16384, 18432, 19072, 20480, 21760, 24576, 27264,
    28672, 32768,
];

/// Largest object size whose pointer bits are packed at the end of the span.
pub const MAX_PACKED_OBJECT_BYTES: usize = 512;
