use std::io;
use std::ops::{Deref, DerefMut};

use crate::error::{CacheError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Protection {
    ReadWrite,
    ReadExec,
}

/// Host memory that generated code is written into and executed from.
pub trait CodeRegion {
    fn len(&self) -> usize;
    fn as_ptr(&self) -> *const u8;
    fn bytes_mut(&mut self) -> &mut [u8];
    fn protect(&mut self, protection: Protection) -> io::Result<()>;
    fn invalidate_icache(&mut self, offset: usize, len: usize);
}

/// Plain heap memory. Nothing in it can be executed; it backs caches whose
/// blocks are only inspected.
pub struct HeapRegion {
    bytes: Vec<u8>,
    protection: Protection,
}

impl HeapRegion {
    pub fn new(len: usize) -> Self {
        Self {
            bytes: vec![0; len],
            protection: Protection::ReadExec,
        }
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }
}

impl CodeRegion for HeapRegion {
    fn len(&self) -> usize {
        self.bytes.len()
    }

    fn as_ptr(&self) -> *const u8 {
        self.bytes.as_ptr()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        assert_eq!(
            self.protection,
            Protection::ReadWrite,
            "code written outside a write window"
        );
        &mut self.bytes
    }

    fn protect(&mut self, protection: Protection) -> io::Result<()> {
        self.protection = protection;
        Ok(())
    }

    fn invalidate_icache(&mut self, _offset: usize, _len: usize) {}
}

#[cfg(unix)]
pub struct ExecRegion {
    ptr: std::ptr::NonNull<u8>,
    len: usize,
}

#[cfg(unix)]
impl ExecRegion {
    pub fn new(len: usize) -> io::Result<Self> {
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as usize;
        let len = len.max(1).div_ceil(page_size) * page_size;

        let ptr = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if ptr == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }

        let ptr = std::ptr::NonNull::new(ptr.cast::<u8>())
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "mmap returned null"))?;
        Ok(Self { ptr, len })
    }
}

#[cfg(unix)]
impl CodeRegion for ExecRegion {
    fn len(&self) -> usize {
        self.len
    }

    fn as_ptr(&self) -> *const u8 {
        self.ptr.as_ptr()
    }

    fn bytes_mut(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.len) }
    }

    fn protect(&mut self, protection: Protection) -> io::Result<()> {
        let prot = match protection {
            Protection::ReadWrite => libc::PROT_READ | libc::PROT_WRITE,
            Protection::ReadExec => libc::PROT_READ | libc::PROT_EXEC,
        };
        let ret = unsafe { libc::mprotect(self.ptr.as_ptr().cast(), self.len, prot) };
        if ret != 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }

    #[allow(unused_variables)]
    fn invalidate_icache(&mut self, offset: usize, len: usize) {
        // x86 keeps instruction fetch coherent with stores
        #[cfg(target_arch = "aarch64")]
        unsafe {
            use std::arch::asm;

            let ctr: u64;
            asm!("mrs {}, ctr_el0", out(reg) ctr, options(nomem, nostack));
            let dline = 4usize << ((ctr >> 16) & 0xf);
            let iline = 4usize << (ctr & 0xf);

            let start = self.ptr.as_ptr() as usize + offset;
            let end = start + len;

            let mut addr = start & !(dline - 1);
            while addr < end {
                asm!("dc cvau, {}", in(reg) addr, options(nostack));
                addr += dline;
            }
            asm!("dsb ish", options(nostack));

            let mut addr = start & !(iline - 1);
            while addr < end {
                asm!("ic ivau, {}", in(reg) addr, options(nostack));
                addr += iline;
            }
            asm!("dsb ish", options(nostack));
            asm!("isb", options(nostack));
        }
    }
}

#[cfg(unix)]
impl Drop for ExecRegion {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.ptr.as_ptr().cast(), self.len);
        }
    }
}

/// Executable memory of at least `len` bytes for this host.
pub fn host_region(len: usize) -> io::Result<Box<dyn CodeRegion>> {
    #[cfg(unix)]
    {
        Ok(Box::new(ExecRegion::new(len)?))
    }
    #[cfg(not(unix))]
    {
        let _ = len;
        Err(io::Error::new(
            io::ErrorKind::Unsupported,
            "no executable memory on this host",
        ))
    }
}

/// A fixed-size slice of the code region owned by one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CodeChunk(u16);

impl CodeChunk {
    pub fn index(self) -> usize {
        self.0 as usize
    }
}

/// Carves a code region into equal chunks and hands them out.
pub struct CodeAllocator {
    region: Box<dyn CodeRegion>,
    chunk_size: usize,
    chunk_count: usize,
    free: Vec<u16>,
    protection: Protection,
    icache_flushes: u64,
}

impl CodeAllocator {
    pub fn new(mut region: Box<dyn CodeRegion>, chunk_size: usize) -> Result<Self> {
        if chunk_size == 0 {
            return Err(CacheError::Config("code chunk size must be nonzero".into()));
        }
        let chunk_count = region.len() / chunk_size;
        if chunk_count == 0 || chunk_count > u16::MAX as usize + 1 {
            return Err(CacheError::Config(format!(
                "code region of {} bytes cannot hold chunks of {chunk_size}",
                region.len()
            )));
        }

        region.protect(Protection::ReadExec)?;

        Ok(Self {
            region,
            chunk_size,
            chunk_count,
            free: (0..chunk_count).rev().map(|i| i as u16).collect(),
            protection: Protection::ReadExec,
            icache_flushes: 0,
        })
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_count(&self) -> usize {
        self.chunk_count
    }

    pub fn free_chunks(&self) -> usize {
        self.free.len()
    }

    pub fn protection(&self) -> Protection {
        self.protection
    }

    pub fn icache_flushes(&self) -> u64 {
        self.icache_flushes
    }

    pub fn allocate(&mut self) -> Option<CodeChunk> {
        self.free.pop().map(CodeChunk)
    }

    pub fn release(&mut self, chunk: CodeChunk) {
        debug_assert!(
            !self.free.contains(&chunk.0),
            "code chunk {} released twice",
            chunk.0
        );
        self.free.push(chunk.0);
    }

    pub fn chunk_ptr(&self, chunk: CodeChunk) -> *const u8 {
        self.region
            .as_ptr()
            .wrapping_add(chunk.index() * self.chunk_size)
    }

    pub fn chunk(&self, chunk: CodeChunk) -> &[u8] {
        debug_assert!(chunk.index() < self.chunk_count);
        // SAFETY: the chunk lies inside the region, which stays mapped and
        // readable for as long as `self` is borrowed.
        unsafe { std::slice::from_raw_parts(self.chunk_ptr(chunk), self.chunk_size) }
    }

    /// Makes the region writable until the returned window is dropped.
    pub fn write_window(&mut self) -> Result<WriteWindow<'_>> {
        self.region.protect(Protection::ReadWrite)?;
        self.protection = Protection::ReadWrite;
        Ok(WriteWindow {
            code: self,
            written: Vec::new(),
        })
    }
}

/// Writable view of the code region. Dropping it restores execute permission
/// and invalidates the instruction cache over every chunk handed out.
pub struct WriteWindow<'a> {
    code: &'a mut CodeAllocator,
    written: Vec<CodeChunk>,
}

impl WriteWindow<'_> {
    pub fn chunk_mut(&mut self, chunk: CodeChunk) -> &mut [u8] {
        if !self.written.contains(&chunk) {
            self.written.push(chunk);
        }
        let size = self.code.chunk_size;
        let start = chunk.index() * size;
        &mut self.code.region.bytes_mut()[start..start + size]
    }
}

impl Deref for WriteWindow<'_> {
    type Target = CodeAllocator;

    fn deref(&self) -> &CodeAllocator {
        &*self.code
    }
}

impl DerefMut for WriteWindow<'_> {
    fn deref_mut(&mut self) -> &mut CodeAllocator {
        &mut *self.code
    }
}

impl Drop for WriteWindow<'_> {
    fn drop(&mut self) {
        match self.code.region.protect(Protection::ReadExec) {
            Ok(()) => self.code.protection = Protection::ReadExec,
            Err(e) => log::error!("failed to make code region executable: {e}"),
        }

        let size = self.code.chunk_size;
        for chunk in self.written.drain(..) {
            self.code.region.invalidate_icache(chunk.index() * size, size);
            self.code.icache_flushes += 1;
        }
    }
}
