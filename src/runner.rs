use std::io::{self, Read, Stdin, Stdout, Write};

use anyhow::Context as _;
use log::{log_enabled, Level};

use crate::backend::{BlockFn, CraneliftBackend};
use crate::cache::CodeCache;
use crate::config::CacheConfig;
use crate::um::{self, Instr, ProgramMemory, UmFrontend};

const CACHE_SIZE: usize = 64;

/// Universal Machine that runs array 0 through the code cache.
pub struct Machine<R: Read = Stdin, W: Write = Stdout> {
    pc: u32,
    regs: [u32; 8],
    mems: Vec<Box<[u32]>>,
    free: Vec<usize>,
    recycled: [Vec<Box<[u32]>>; CACHE_SIZE],

    cache: CodeCache,
    backend: CraneliftBackend,
    input: R,
    output: W,

    block_count: u64,
    exit_count: u64,
}

impl<R: Read, W: Write> Drop for Machine<R, W> {
    fn drop(&mut self) {
        if log_enabled!(Level::Info) {
            log::info!("Blocks executed: {}", self.block_count);
            log::info!("Exits handled:   {}", self.exit_count);
            for line in self.cache.metrics().to_string().lines() {
                log::info!("{line}");
            }
            for line in self.cache.tuning_summary().lines() {
                log::info!("{line}");
            }
        }
    }
}

impl Machine {
    pub fn from_bin(bin: &[u8], config: &CacheConfig) -> anyhow::Result<Self> {
        Self::with_io(bin, config, io::stdin(), io::stdout())
    }
}

impl<R: Read, W: Write> Machine<R, W> {
    pub fn with_io(bin: &[u8], config: &CacheConfig, input: R, output: W) -> anyhow::Result<Self> {
        let program = um::decode(bin)?;
        anyhow::ensure!(!program.is_empty(), "empty program");
        anyhow::ensure!(
            program.len() <= (u32::MAX / 4) as usize,
            "program of {} words does not fit the guest address space",
            program.len()
        );

        let mut mems = Vec::with_capacity(1 << 16);
        mems.push(program.into_boxed_slice());

        Ok(Self {
            pc: 0,
            regs: [0; 8],
            mems,
            free: Vec::with_capacity(1 << 16),
            recycled: [(); CACHE_SIZE].map(|_| Vec::new()),
            cache: CodeCache::with_host_memory(config)?,
            backend: CraneliftBackend::new()?,
            input,
            output,
            block_count: 0,
            exit_count: 0,
        })
    }

    pub fn cache(&self) -> &CodeCache {
        &self.cache
    }

    pub fn run(&mut self) -> anyhow::Result<()> {
        loop {
            let handle = {
                let program = &self.mems[0];
                self.cache.get_or_compile(
                    self.pc * 4,
                    0,
                    &ProgramMemory(program),
                    &mut UmFrontend::new(program),
                    &mut self.backend,
                )?
            };
            let entry = self
                .cache
                .code_ptr(handle)
                .context("compiled block has no code")?;

            let f: BlockFn = unsafe { std::mem::transmute(entry) };
            self.pc = unsafe { f(self.regs.as_mut_ptr()) };
            self.block_count += 1;

            if !self.step()? {
                return Ok(());
            }
        }
    }

    /// Interprets the instruction at `pc`. Returns `false` on halt.
    fn step(&mut self) -> anyhow::Result<bool> {
        let opc = *self.mems[0]
            .get(self.pc as usize)
            .with_context(|| format!("pc {:#x} outside the program", self.pc))?;
        self.pc += 1;
        self.exit_count += 1;

        match Instr::decode(opc) {
            Instr::CondMove { a, b, c } => {
                if self.regs[c] != 0 {
                    self.regs[a] = self.regs[b];
                }
            }
            Instr::Index { a, b, c } => {
                self.regs[a] = self.mems[self.regs[b] as usize][self.regs[c] as usize];
            }
            Instr::Amend { a, b, c } => {
                let (array, offset) = (self.regs[a] as usize, self.regs[b]);
                self.mems[array][offset as usize] = self.regs[c];
                if array == 0 {
                    self.cache.notify_write(offset * 4, 4);
                }
            }
            Instr::Add { a, b, c } => self.regs[a] = self.regs[b].wrapping_add(self.regs[c]),
            Instr::Mul { a, b, c } => self.regs[a] = self.regs[b].wrapping_mul(self.regs[c]),
            Instr::Div { a, b, c } => {
                anyhow::ensure!(self.regs[c] != 0, "division by zero at {:#x}", self.pc - 1);
                self.regs[a] = self.regs[b] / self.regs[c];
            }
            Instr::Nand { a, b, c } => self.regs[a] = !(self.regs[b] & self.regs[c]),
            Instr::Halt => return Ok(false),
            Instr::Alloc { b, c } => {
                let size = self.regs[c] as usize;
                let buf = match self.recycled.get_mut(size).and_then(Vec::pop) {
                    Some(mut buf) => {
                        buf.fill(0);
                        buf
                    }
                    None => vec![0; size].into_boxed_slice(),
                };

                if let Some(idx) = self.free.pop() {
                    self.mems[idx] = buf;
                    self.regs[b] = idx as u32;
                } else {
                    self.regs[b] = self.mems.len() as u32;
                    self.mems.push(buf);
                }
            }
            Instr::Free { c } => {
                let idx = self.regs[c] as usize;
                let buf = std::mem::take(&mut self.mems[idx]);
                if let Some(cache) = self.recycled.get_mut(buf.len()) {
                    cache.push(buf);
                }
                self.free.push(idx);
            }
            Instr::Output { c } => {
                let ch = self.regs[c];
                anyhow::ensure!(ch < 256, "output of non-byte {ch:#x}");
                self.output.write_all(&[ch as u8])?;
                self.output.flush()?;
            }
            Instr::Input { c } => {
                let mut buf = [0; 1];
                self.regs[c] = self.input.read_exact(&mut buf).map_or(!0, |_| buf[0] as u32);
            }
            Instr::LoadProgram { b, c } => {
                let idx = self.regs[b] as usize;
                if idx != 0 {
                    log::debug!("*** LONGJMP to array {}:{:#x}", idx, self.regs[c]);
                    let old_len = self.mems[0].len() as u32;
                    self.mems[0] = self.mems[idx].clone();
                    self.cache.notify_write(0, old_len.saturating_mul(4));
                }
                self.pc = self.regs[c];
            }
            Instr::Orthography { a, value } => self.regs[a] = value,
            Instr::Invalid(opc) => anyhow::bail!("invalid opcode {opc:#010x} at {:#x}", self.pc - 1),
        }

        Ok(true)
    }
}
