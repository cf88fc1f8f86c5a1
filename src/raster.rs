//! Code cache for the fixed-function pixel pipeline.
//!
//! Each of the four render lanes owns eight ways keyed by the rendering
//! state that shaped the generated span routine. There is no invalidation:
//! a state change just misses, and the miss overwrites the next way in
//! round-robin order.

use crate::code_mem::{self, CodeAllocator, CodeChunk, CodeRegion};
use crate::error::{CacheError, Result};

pub const LANES: usize = 4;
pub const WAYS: usize = 8;
pub const BLOCK_SIZE: usize = 8192;

const LOD_TMIRROR_S: u32 = 1 << 28;
const LOD_TMIRROR_T: u32 = 1 << 29;
const LOD_MASK: u32 = LOD_TMIRROR_S | LOD_TMIRROR_T;
const TREX_INIT1_MASK: u32 = 1 << 18;

/// Raw pipeline registers a span routine is generated from.
#[derive(Debug, Clone, Copy, Default)]
pub struct RenderParams {
    pub alpha_mode: u32,
    pub fbz_mode: u32,
    pub fog_mode: u32,
    pub fbz_color_path: u32,
    pub texture_mode: [u32; 2],
    pub t_lod: [u32; 2],
    pub trex_init1: u32,
    pub col_tiled: bool,
    pub aux_tiled: bool,
    pub xdir: i32,
}

/// The part of [`RenderParams`] that changes generated code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RenderState {
    pub alpha_mode: u32,
    pub fbz_mode: u32,
    pub fog_mode: u32,
    pub fbz_color_path: u32,
    pub texture_mode: [u32; 2],
    pub t_lod: [u32; 2],
    pub trex_init1: u32,
    pub is_tiled: bool,
    pub xdir: i32,
}

impl From<&RenderParams> for RenderState {
    fn from(p: &RenderParams) -> Self {
        Self {
            alpha_mode: p.alpha_mode,
            fbz_mode: p.fbz_mode,
            fog_mode: p.fog_mode,
            fbz_color_path: p.fbz_color_path,
            texture_mode: p.texture_mode,
            t_lod: [p.t_lod[0] & LOD_MASK, p.t_lod[1] & LOD_MASK],
            trex_init1: p.trex_init1 & TREX_INIT1_MASK,
            is_tiled: p.col_tiled || p.aux_tiled,
            xdir: p.xdir,
        }
    }
}

impl RenderState {
    /// Depth comparison selected by `fbz_mode`.
    pub fn depth_op(&self) -> u32 {
        (self.fbz_mode >> 5) & 7
    }
}

#[derive(Debug, Clone, Copy)]
struct Way {
    state: Option<RenderState>,
    chunk: CodeChunk,
}

pub struct PixelCodeCache {
    code: CodeAllocator,
    ways: [[Way; WAYS]; LANES],
    last_hit: [usize; LANES],
    next_write: [usize; LANES],
    hits: u64,
    recompiles: u64,
}

impl Drop for PixelCodeCache {
    fn drop(&mut self) {
        if log::log_enabled!(log::Level::Info) && self.hits + self.recompiles > 0 {
            log::info!(
                "*** Pixel code cache: {} hits, {} recompiles",
                self.hits,
                self.recompiles
            );
        }
    }
}

impl PixelCodeCache {
    pub fn new(region: Box<dyn CodeRegion>) -> Result<Self> {
        let mut code = CodeAllocator::new(region, BLOCK_SIZE)?;
        if code.chunk_count() < LANES * WAYS {
            return Err(CacheError::Config(format!(
                "pixel code cache needs {} chunks of {BLOCK_SIZE} bytes, region holds {}",
                LANES * WAYS,
                code.chunk_count()
            )));
        }

        let mut ways = [[None; WAYS]; LANES];
        for way in ways.iter_mut().flatten() {
            *way = code.allocate();
        }
        let ways = ways.map(|lane| {
            lane.map(|chunk| Way {
                state: None,
                chunk: chunk.unwrap_or_else(|| unreachable!("chunk count checked above")),
            })
        });

        Ok(Self {
            code,
            ways,
            last_hit: [0; LANES],
            next_write: [0; LANES],
            hits: 0,
            recompiles: 0,
        })
    }

    pub fn with_host_memory() -> Result<Self> {
        Self::new(code_mem::host_region(LANES * WAYS * BLOCK_SIZE)?)
    }

    /// Returns the span routine for `state` on `lane`, calling `generate` to
    /// write a new one into the next way on a miss.
    pub fn get_block<G>(&mut self, lane: usize, state: &RenderState, generate: G) -> Result<&[u8]>
    where
        G: FnOnce(&RenderState, &mut [u8]) -> anyhow::Result<()>,
    {
        assert!(lane < LANES, "render lane {lane} out of range");

        let start = self.last_hit[lane];
        for step in 0..WAYS {
            let way = (start + step) % WAYS;
            if self.ways[lane][way].state.as_ref() == Some(state) {
                self.last_hit[lane] = way;
                self.hits += 1;
                return Ok(self.code.chunk(self.ways[lane][way].chunk));
            }
        }

        let way = self.next_write[lane];
        let chunk = self.ways[lane][way].chunk;
        // the way is unusable until the new routine is complete
        self.ways[lane][way].state = None;
        {
            let mut window = self.code.write_window()?;
            generate(state, window.chunk_mut(chunk))
                .map_err(|cause| CacheError::Raster { lane, cause })?;
        }

        log::debug!("pixel lane {lane} way {way}: new routine, depth op {}", state.depth_op());
        self.ways[lane][way].state = Some(*state);
        self.last_hit[lane] = way;
        self.next_write[lane] = (way + 1) % WAYS;
        self.recompiles += 1;
        Ok(self.code.chunk(chunk))
    }

    pub fn hits(&self) -> u64 {
        self.hits
    }

    pub fn recompiles(&self) -> u64 {
        self.recompiles
    }

    pub fn code(&self) -> &CodeAllocator {
        &self.code
    }
}
