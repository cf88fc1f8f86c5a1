use jitcache::code_mem::{HeapRegion, Protection};
use jitcache::page::{page_number, region_mask};
use jitcache::tuning::{BLOCK_SIZE_DEFAULT, PRESSURE_HIGH};
use jitcache::*;
use proptest::prelude::*;

struct Flat;

impl GuestMemory for Flat {
    fn physical_lookup(&self, addr: u32) -> Option<u32> {
        Some(addr)
    }
}

/// Only the listed pages are mapped, identity.
struct Pages(Vec<u32>);

impl GuestMemory for Pages {
    fn physical_lookup(&self, addr: u32) -> Option<u32> {
        self.0.contains(&page_number(addr)).then_some(addr)
    }
}

/// Decodes `len` guest bytes at any pc.
struct Span(u32);

impl Frontend for Span {
    type Ir = u32;

    fn decode(&mut self, pc: u32, _budget: usize) -> anyhow::Result<Decoded<u32>> {
        Ok(Decoded {
            ir: pc,
            end_pc: pc + self.0 - 1,
            ins: self.0 / 4,
            spans: Vec::new(),
            has_fpu: false,
        })
    }
}

struct BrokenFrontend;

impl Frontend for BrokenFrontend {
    type Ir = u32;

    fn decode(&mut self, pc: u32, _budget: usize) -> anyhow::Result<Decoded<u32>> {
        anyhow::bail!("undefined opcode at {pc:#x}")
    }
}

/// Emits `pc` as little-endian bytes.
struct Stamp;

impl Backend<u32> for Stamp {
    fn compile(&mut self, ir: &u32, code: &mut [u8]) -> anyhow::Result<Emitted> {
        code[..4].copy_from_slice(&ir.to_le_bytes());
        Ok(Emitted { len: 4, cycles: 2 })
    }
}

struct BrokenBackend;

impl Backend<u32> for BrokenBackend {
    fn compile(&mut self, _ir: &u32, _code: &mut [u8]) -> anyhow::Result<Emitted> {
        anyhow::bail!("register allocation failed")
    }
}

struct Oversized;

impl Backend<u32> for Oversized {
    fn compile(&mut self, _ir: &u32, code: &mut [u8]) -> anyhow::Result<Emitted> {
        Ok(Emitted {
            len: code.len() + 1,
            cycles: 0,
        })
    }
}

fn config(arena_size: usize, dirty_capacity: usize) -> CacheConfig {
    CacheConfig {
        arena_size,
        dirty_capacity,
        chunk_size: 64,
        tuning: Some(TuningEligibility::Ineligible),
        ..Default::default()
    }
}

fn cache(config: CacheConfig) -> CodeCache {
    let region = Box::new(HeapRegion::new(config.code_size()));
    CodeCache::new(&config, region).unwrap()
}

fn compile(cache: &mut CodeCache, pc: u32) -> BlockHandle {
    cache.get_or_compile(pc, 0, &Flat, &mut Span(16), &mut Stamp).unwrap()
}

fn code_of(cache: &CodeCache, handle: BlockHandle) -> [u8; 4] {
    let ptr = cache.code_ptr(handle).unwrap();
    unsafe { std::ptr::read(ptr as *const [u8; 4]) }
}

#[test]
fn hit_returns_the_same_block() {
    let mut cache = cache(config(8, 4));
    let a = compile(&mut cache, 0x1000);
    let b = compile(&mut cache, 0x1000);
    assert_eq!(a, b);
    assert_eq!(code_of(&cache, a), 0x1000u32.to_le_bytes());

    let metrics = cache.metrics();
    assert_eq!((metrics.hits, metrics.misses), (1, 1));
    assert_eq!(metrics.blocks_compiled, 1);
    assert_eq!(metrics.bytes_emitted, 4);
    assert_eq!(cache.lookup(0x1000, 0), Some(a));
    cache.check_invariants().unwrap();
}

#[test]
fn code_segment_is_part_of_the_key() {
    let mut cache = cache(config(8, 4));
    let a = compile(&mut cache, 0x1000);
    let b = cache
        .get_or_compile(0x1000, 0x10, &Flat, &mut Span(16), &mut Stamp)
        .unwrap();
    assert_ne!(a.index(), b.index());
    assert_eq!(cache.block(a).unwrap().cs(), 0);
    assert_eq!(cache.block(b).unwrap().cs(), 0x10);
    assert_eq!(cache.lookup(0x1000, 0), Some(a));
    assert_eq!(cache.lookup(0x1000, 0x10), Some(b));
    assert_eq!(cache.metrics().recompiles, 0);
    cache.check_invariants().unwrap();
}

#[test]
fn alternating_code_segments_share_a_page() {
    let mut cache = cache(config(8, 4));
    let mut seen = Vec::new();
    for _ in 0..3 {
        for cs in [0, 0x10] {
            let handle = cache
                .get_or_compile(0x1000, cs, &Flat, &mut Span(16), &mut Stamp)
                .unwrap();
            seen.push(handle);
            cache.check_invariants().unwrap();
        }
    }

    let metrics = cache.metrics();
    assert_eq!((metrics.misses, metrics.hits), (2, 4));
    assert_eq!(metrics.blocks_compiled, 2);
    assert_eq!(cache.free_len(), 6);
    assert_ne!(seen[0], seen[1]);
    assert!(seen.chunks(2).all(|pair| pair == &seen[..2]));

    // overwriting the code drops both translations, each recompiles in place
    cache.notify_write(0x1000, 4);
    assert_eq!(cache.metrics().flushes, 2);
    for cs in [0, 0x10] {
        cache
            .get_or_compile(0x1000, cs, &Flat, &mut Span(16), &mut Stamp)
            .unwrap();
    }
    assert_eq!(cache.metrics().recompiles, 2);
    assert_eq!(cache.free_len(), 6);
    cache.check_invariants().unwrap();
}

#[test]
fn new_pc_at_a_registered_address_takes_over_the_slot() {
    let mut cache = cache(config(8, 4));
    let old = compile(&mut cache, 0x1000);

    // a different virtual pc backed by the same physical bytes
    struct Alias;

    impl GuestMemory for Alias {
        fn physical_lookup(&self, addr: u32) -> Option<u32> {
            Some(addr - 0x7000)
        }
    }

    let aliased = cache
        .get_or_compile(0x8000, 0, &Alias, &mut Span(16), &mut Stamp)
        .unwrap();
    assert_eq!(aliased.index(), old.index());
    assert!(cache.block(old).is_none());
    assert_eq!(cache.block(aliased).unwrap().pc(), 0x8000);
    assert_eq!(cache.metrics().recompiles, 1);
    assert_eq!(cache.free_len(), 7);
    cache.check_invariants().unwrap();
}

#[test]
fn full_arena_reclaims_a_purged_page_before_evicting() {
    let mut cache = cache(config(8, 1));
    let handles: Vec<_> = (0..8).map(|i| compile(&mut cache, i * 0x1000)).collect();
    assert_eq!(cache.free_len(), 0);

    cache.mark_dirty(0x0004, 4);
    assert_eq!(cache.metrics().flushes, 0);

    let ninth = compile(&mut cache, 0x8000);
    let metrics = cache.metrics();
    assert_eq!(metrics.flushes, 1);
    assert_eq!(metrics.purges, 1);
    assert_eq!(metrics.forced_evictions, 0);
    assert_eq!(ninth.index(), handles[0].index());
    assert!(cache.block(handles[0]).is_none());
    assert!(handles[1..].iter().all(|&h| cache.block(h).is_some()));
    assert_eq!(cache.lookup(0, 0), None);
    cache.check_invariants().unwrap();
}

#[test]
fn full_clean_arena_falls_back_to_random_eviction() {
    let mut cache = cache(config(4, 4));
    let handles: Vec<_> = (0..4).map(|i| compile(&mut cache, i * 0x1000)).collect();

    let fifth = compile(&mut cache, 0x4000);
    let metrics = cache.metrics();
    assert_eq!(metrics.forced_evictions, 1);
    assert_eq!(metrics.flushes, 0);
    assert!(cache.block(handles[3]).is_some());
    assert_eq!(handles.iter().filter(|&&h| cache.block(h).is_none()).count(), 1);
    assert!(cache.block(fifth).is_some());
    cache.check_invariants().unwrap();
}

#[test]
fn forced_eviction_spares_the_block_last_handed_out() {
    let mut cache = cache(CacheConfig {
        seed: 7,
        ..config(2, 1)
    });

    let mut previous = compile(&mut cache, 0);
    for i in 1..32 {
        let handle = compile(&mut cache, i * 0x40);
        assert!(cache.block(previous).is_some(), "block {} was evicted", i - 1);
        previous = handle;
        cache.check_invariants().unwrap();
    }
    assert_eq!(cache.metrics().forced_evictions, 30);
}

#[test]
fn unmapped_second_page_keeps_block_on_the_first() {
    let mut cache = cache(config(8, 4));
    let mem = Pages(vec![1]);
    let handle = cache
        .get_or_compile(0x1ff0, 0, &mem, &mut Span(0x20), &mut Stamp)
        .unwrap();

    let block = cache.block(handle).unwrap();
    assert_eq!(block.page_mask(), region_mask(63, 63));
    assert_eq!(block.page_mask2(), 0);
    assert_eq!(block.phys_2(), None);
    assert!(!block.flags().contains(BlockFlags::HAS_PAGE2));
    cache.check_invariants().unwrap();
}

#[test]
fn block_crossing_into_a_mapped_page_tracks_both() {
    let mut cache = cache(config(8, 4));
    let mem = Pages(vec![1, 2]);
    let handle = cache
        .get_or_compile(0x1ff0, 0, &mem, &mut Span(0x20), &mut Stamp)
        .unwrap();

    let block = cache.block(handle).unwrap();
    assert_eq!(block.page_mask2(), 1);
    assert_eq!(block.phys_2(), Some(0x200f));
    assert!(block.flags().contains(BlockFlags::HAS_PAGE2));

    // a store to the tail on the second page invalidates it
    cache.notify_write(0x2008, 4);
    assert_eq!(cache.block(handle).unwrap().state(), BlockState::Dirty);
    assert_eq!(cache.metrics().flushes, 1);
    cache.check_invariants().unwrap();
}

#[test]
fn unmapped_pc_is_an_error() {
    let mut cache = cache(config(8, 4));
    let err = cache.get_or_compile(0x5000, 0, &Pages(vec![1]), &mut Span(16), &mut Stamp);
    assert!(matches!(err, Err(CacheError::Unmapped { pc: 0x5000 })));
    assert_eq!(cache.metrics().misses, 0);
}

#[test]
fn overwritten_block_is_recompiled() {
    let mut cache = cache(config(8, 4));
    let old = compile(&mut cache, 0x3000);
    cache.notify_write(0x3000, 16);

    let block = cache.block(old).unwrap();
    assert_eq!(block.state(), BlockState::Dirty);
    assert_eq!(block.page_mask(), 0);
    assert_eq!(cache.code_ptr(old), None);
    assert_eq!(cache.dirty_len(), 1);
    cache.check_invariants().unwrap();

    let before = cache.metrics();
    let new = compile(&mut cache, 0x3000);
    let after = cache.metrics();
    assert_eq!(after.misses, before.misses + 1);
    assert_eq!(after.recompiles, before.recompiles + 1);
    assert_eq!(after.blocks_compiled, before.blocks_compiled + 1);
    assert_eq!(after.hits, before.hits);

    assert_eq!(new.index(), old.index());
    assert_ne!(new, old);
    assert!(cache.block(old).is_none());
    let block = cache.block(new).unwrap();
    assert!(block.flags().contains(BlockFlags::WAS_RECOMPILED));
    assert_eq!(block.state(), BlockState::Active);
    assert_eq!(cache.dirty_len(), 0);
    cache.check_invariants().unwrap();
}

#[test]
fn writes_beside_code_leave_blocks_alone() {
    let mut cache = cache(config(8, 4));
    let handle = compile(&mut cache, 0x3000);
    cache.notify_write(0x3400, 64);
    cache.notify_write(0x4000, 4);
    assert_eq!(cache.block(handle).unwrap().state(), BlockState::Active);
    assert_eq!(compile(&mut cache, 0x3000), handle);
    assert_eq!(cache.metrics().flushes, 0);
}

#[test]
fn marked_writes_flush_on_next_lookup() {
    let mut cache = cache(config(8, 4));
    let old = compile(&mut cache, 0x3000);
    cache.mark_dirty(0x3008, 1);
    assert_eq!(cache.block(old).unwrap().state(), BlockState::Active);

    let new = compile(&mut cache, 0x3000);
    assert_ne!(new, old);
    let metrics = cache.metrics();
    assert_eq!((metrics.hits, metrics.flushes, metrics.recompiles), (0, 1, 1));
    cache.check_invariants().unwrap();
}

#[test]
fn dirty_list_is_bounded() {
    let mut cache = cache(config(8, 2));
    let handles: Vec<_> = (0..4).map(|i| compile(&mut cache, 0x1000 + i * 0x40)).collect();

    cache.notify_write(0x1000, 0x100);
    assert_eq!(cache.metrics().flushes, 4);
    assert_eq!(cache.dirty_len(), 2);
    assert_eq!(cache.free_len(), 6);
    // the two oldest entries went straight back to the free list
    assert_eq!(
        handles
            .iter()
            .filter(|&&h| cache.block(h).is_some_and(|b| b.state() == BlockState::Dirty))
            .count(),
        2
    );
    cache.check_invariants().unwrap();
}

#[test]
fn stale_handles_resolve_to_nothing() {
    let mut cache = cache(config(8, 4));
    let handle = compile(&mut cache, 0x1000);
    cache.delete(handle);
    assert!(cache.block(handle).is_none());
    assert_eq!(cache.code_ptr(handle), None);
    assert_eq!(cache.free_len(), 8);

    // deleting again is ignored even after the slot is reused
    let other = compile(&mut cache, 0x2000);
    assert_eq!(other.index(), handle.index());
    cache.delete(handle);
    assert!(cache.block(other).is_some());
    cache.check_invariants().unwrap();
}

#[test]
fn failed_translation_releases_everything() {
    let mut cache = cache(config(4, 4));
    compile(&mut cache, 0x1000);

    let err = cache.get_or_compile(0x2000, 0, &Flat, &mut BrokenFrontend, &mut Stamp);
    assert!(matches!(err, Err(CacheError::Frontend { pc: 0x2000, .. })));

    let err = cache.get_or_compile(0x2000, 0, &Flat, &mut Span(16), &mut BrokenBackend);
    assert!(matches!(err, Err(CacheError::Backend { pc: 0x2000, .. })));

    let err = cache.get_or_compile(0x2000, 0, &Flat, &mut Span(16), &mut Oversized);
    assert!(matches!(
        err,
        Err(CacheError::CodeTooLarge { len: 65, cap: 64, .. })
    ));

    assert_eq!(cache.code().protection(), Protection::ReadExec);
    assert_eq!(cache.free_len(), 3);
    assert_eq!(cache.code().free_chunks(), 3);
    assert_eq!(cache.lookup(0x2000, 0), None);
    assert_eq!(cache.metrics().blocks_compiled, 1);
    cache.check_invariants().unwrap();
}

#[test]
fn failed_recompilation_drops_the_old_block() {
    let mut cache = cache(config(4, 4));
    let old = compile(&mut cache, 0x1000);
    cache.notify_write(0x1000, 4);

    let err = cache.get_or_compile(0x1000, 0, &Flat, &mut Span(16), &mut BrokenBackend);
    assert!(err.is_err());
    assert!(cache.block(old).is_none());
    assert_eq!(cache.lookup(0x1000, 0), None);
    assert_eq!(cache.dirty_len(), 0);
    assert_eq!(cache.free_len(), 4);
    cache.check_invariants().unwrap();
}

#[test]
fn reset_frees_every_slot() {
    let mut cache = cache(config(8, 4));
    let handles: Vec<_> = (0..6).map(|i| compile(&mut cache, i * 0x100)).collect();
    cache.notify_write(0, 4);
    assert!(cache.dirty_len() > 0);

    cache.reset();
    assert_eq!(cache.free_len(), 8);
    assert_eq!(cache.dirty_len(), 0);
    assert_eq!(cache.metrics(), CacheMetrics::default());
    assert_eq!(cache.pages().iter().count(), 0);
    assert!(handles.iter().all(|&h| cache.block(h).is_none()));
    assert_eq!(cache.code().free_chunks(), 8);
    cache.check_invariants().unwrap();
}

#[test]
fn disabled_tuning_keeps_defaults() {
    let mut cache = cache(config(4, 2));
    for i in 0..3000 {
        let handle = compile(&mut cache, (i % 16) * 0x1000);
        if i % 3 == 0 {
            let phys = cache.block(handle).unwrap().phys();
            cache.notify_write(phys, 1);
        }
    }
    assert_eq!(cache.tuning_summary(), "Adaptive cache tuning: disabled");
    assert!(!cache.tuning().enabled());
    assert_eq!(cache.tuning().block_size_limit(), BLOCK_SIZE_DEFAULT);
    cache.check_invariants().unwrap();
}

fn tuned(arena_size: usize) -> CodeCache {
    cache(CacheConfig {
        tuning: Some(TuningEligibility::AppleArm64),
        ..config(arena_size, 4)
    })
}

/// Overwrites and recompiles the block at `pc` until the tuning window has
/// closed on nothing but misses and flushes.
fn churn(cache: &mut CodeCache, pc: u32) -> BlockHandle {
    for _ in 0..520 {
        compile(cache, pc);
        cache.notify_write(pc, 4);
    }
    let handle = compile(cache, pc);
    assert!(cache.tuning().pressure() >= PRESSURE_HIGH);
    handle
}

#[test]
fn high_pressure_eviction_spares_recent_blocks() {
    let mut cache = tuned(3);
    let old = compile(&mut cache, 0x1000);
    let current = compile(&mut cache, 0x3000);
    let recent = churn(&mut cache, 0x2000);
    assert_eq!(compile(&mut cache, 0x3000), current);

    compile(&mut cache, 0x5000);
    assert_eq!(cache.metrics().forced_evictions, 1);
    assert!(cache.block(old).is_none());
    assert!(cache.block(recent).is_some());
    assert!(cache.block(current).is_some());
    assert_eq!(cache.tuning().total_evictions(), 1);
    assert!(cache.tuning().reuse_saved() <= 1);
    cache.check_invariants().unwrap();
}

#[test]
fn eviction_still_happens_when_every_block_is_recent() {
    let mut cache = tuned(3);
    let stale = compile(&mut cache, 0x1000);
    let churned = churn(&mut cache, 0x2000);
    cache.delete(stale);
    let fresh = compile(&mut cache, 0x3000);
    let current = compile(&mut cache, 0x4000);

    compile(&mut cache, 0x5000);
    assert_eq!(cache.metrics().forced_evictions, 1);
    assert_eq!(cache.tuning().reuse_saved(), 2);
    assert_eq!(cache.tuning().total_evictions(), 0);
    assert!(cache.block(current).is_some());
    assert_eq!(
        [churned, fresh]
            .iter()
            .filter(|&&h| cache.block(h).is_none())
            .count(),
        1
    );
    cache.check_invariants().unwrap();
}

#[test]
fn summary_reports_counters() {
    let mut cache = cache(config(4, 2));
    compile(&mut cache, 0);
    compile(&mut cache, 0);
    let summary = cache.metrics().to_string();
    assert!(summary.starts_with("=== Cache Metrics Summary ==="));
    assert!(summary.contains("Hit Ratio:        50.00%"));
    assert!(summary.contains("Max Block Bytes:  4"));
}

#[derive(Debug, Clone)]
enum Op {
    Compile { page: u32, row: u32, len: u32 },
    Write { page: u32, offset: u32, len: u32 },
    Mark { page: u32, offset: u32, len: u32 },
    Delete { page: u32, row: u32 },
    Reset,
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        6 => (0u32..6, 0u32..64, 1u32..200).prop_map(|(page, row, len)| Op::Compile { page, row, len }),
        3 => (0u32..6, 0u32..4096, 1u32..300).prop_map(|(page, offset, len)| Op::Write { page, offset, len }),
        2 => (0u32..6, 0u32..4096, 1u32..300).prop_map(|(page, offset, len)| Op::Mark { page, offset, len }),
        1 => (0u32..6, 0u32..64).prop_map(|(page, row)| Op::Delete { page, row }),
        1 => Just(Op::Reset),
    ]
}

proptest! {
    #[test]
    fn invariants_hold_under_random_traffic(
        ops in prop::collection::vec(op(), 1..200),
        threshold in prop::option::of(1u32..4),
    ) {
        let mut cache = cache(CacheConfig {
            byte_mask_threshold: threshold,
            ..config(6, 2)
        });

        for op in ops {
            match op {
                Op::Compile { page, row, len } => {
                    let pc = page * 0x1000 + row * 0x40;
                    let handle = cache
                        .get_or_compile(pc, 0, &Flat, &mut Span(len), &mut Stamp)
                        .unwrap();
                    let block = cache.block(handle).unwrap();
                    prop_assert_eq!(block.state(), BlockState::Active);
                    prop_assert_eq!(code_of(&cache, handle), pc.to_le_bytes());
                }
                Op::Write { page, offset, len } => cache.notify_write(page * 0x1000 + offset, len),
                Op::Mark { page, offset, len } => cache.mark_dirty(page * 0x1000 + offset, len),
                Op::Delete { page, row } => {
                    if let Some(handle) = cache.lookup(page * 0x1000 + row * 0x40, 0) {
                        cache.delete(handle);
                    }
                }
                Op::Reset => cache.reset(),
            }
            cache.check_invariants().map_err(|e| TestCaseError::fail(format!("{e:#}")))?;
        }
    }
}
