pub mod arena;
pub mod backend;
pub mod block;
pub mod cache;
pub mod code_mem;
pub mod config;
pub mod dirty;
pub mod error;
pub mod metrics;
pub mod page;
pub mod raster;
pub mod runner;
pub mod translate;
pub mod tuning;
pub mod um;

pub use block::{Block, BlockFlags, BlockHandle, BlockState};
pub use cache::CodeCache;
pub use config::CacheConfig;
pub use error::{CacheError, Result};
pub use metrics::CacheMetrics;
pub use translate::{Backend, Decoded, Emitted, Frontend, GuestMemory};
pub use tuning::{TuningEligibility, TuningState};
