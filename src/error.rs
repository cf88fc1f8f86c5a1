use std::io;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("guest address {pc:#010x} has no physical mapping")]
    Unmapped { pc: u32 },

    #[error("decoding block at {pc:#010x} failed: {cause:#}")]
    Frontend { pc: u32, cause: anyhow::Error },

    #[error("compiling block at {pc:#010x} failed: {cause:#}")]
    Backend { pc: u32, cause: anyhow::Error },

    #[error("block at {pc:#010x} emitted {len} bytes, but a code chunk holds {cap}")]
    CodeTooLarge { pc: u32, len: usize, cap: usize },

    #[error("generating pixel routine for lane {lane} failed: {cause:#}")]
    Raster { lane: usize, cause: anyhow::Error },

    #[error("executable memory: {0}")]
    CodeMemory(#[from] io::Error),

    #[error("invalid cache configuration: {0}")]
    Config(String),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;
