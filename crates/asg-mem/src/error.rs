use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HostMemoryError {
    #[error("host region size must be non-zero")]
    ZeroSize,

    #[error("host region size {len:#x} does not fit in usize")]
    SizeTooLarge { len: u64 },

    #[error("invalid layout for host region (len={len:#x}, align={align:#x})")]
    InvalidLayout { len: u64, align: u64 },

    #[error("out of memory allocating {len:#x} bytes")]
    OutOfMemory { len: u64 },

    #[error("host memory access out of range: offset={offset:#x} len={len:#x} size={size:#x}")]
    OutOfRange { offset: u64, len: u64, size: u64 },

    #[error("host memory offset {offset:#x} is not 4-byte aligned")]
    Misaligned { offset: u64 },
}
