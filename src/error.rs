use thiserror::Error;

/// Invalid concentrator network configuration.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("fan out {0} must be a power of two")]
    FanOutNotPowerOfTwo(usize),

    #[error("queue region size {0} must be a power of two")]
    QueueRegionNotPowerOfTwo(usize),

    #[error("fan out {fan_out} must equal the radix base {radix}")]
    RadixMismatch { fan_out: usize, radix: usize },

    #[error("queue region size {size} is smaller than a dartboard region ({min} bytes)")]
    QueueRegionTooSmall { size: usize, min: usize },

    #[error("queue region size {size} is larger than an arena ({max} bytes)")]
    QueueRegionTooLarge { size: usize, max: usize },

    #[error("fan in {0} must be at least 2")]
    FanInTooSmall(usize),

    #[error("dartboard inverse density must be at least 1")]
    ZeroDensity,

    #[error("at least one worker is required")]
    ZeroWorkers,

    #[error("heap has no arenas")]
    EmptyHeap,

    #[error("buffer size of {0} bytes cannot hold an address")]
    BufferTooSmall(usize),
}

pub type ConfigResult<T> = Result<T, ConfigError>;
