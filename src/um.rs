//! Universal Machine guest: decoding, disassembly and the block frontend.
//!
//! Guest addresses are byte addresses into array 0, four per instruction
//! word. A block is a run of register-only instructions followed by one exit
//! instruction that the dispatcher interprets.

use std::fmt;

use crate::page::PAGE_SIZE;
use crate::translate::{Decoded, Frontend, GuestMemory};

/// Host bytes one register instruction is expected to lower to.
pub const EST_OP_BYTES: usize = 16;

/// Guest bytes a block may cover, so that it never spans more than two pages.
const MAX_BLOCK_WORDS: usize = (PAGE_SIZE / 4) as usize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Instr {
    CondMove { a: usize, b: usize, c: usize },
    Index { a: usize, b: usize, c: usize },
    Amend { a: usize, b: usize, c: usize },
    Add { a: usize, b: usize, c: usize },
    Mul { a: usize, b: usize, c: usize },
    Div { a: usize, b: usize, c: usize },
    Nand { a: usize, b: usize, c: usize },
    Halt,
    Alloc { b: usize, c: usize },
    Free { c: usize },
    Output { c: usize },
    Input { c: usize },
    LoadProgram { b: usize, c: usize },
    Orthography { a: usize, value: u32 },
    Invalid(u32),
}

impl Instr {
    pub fn decode(opc: u32) -> Self {
        let a = ((opc >> 6) & 7) as usize;
        let b = ((opc >> 3) & 7) as usize;
        let c = (opc & 7) as usize;

        match opc >> 28 {
            0 => Self::CondMove { a, b, c },
            1 => Self::Index { a, b, c },
            2 => Self::Amend { a, b, c },
            3 => Self::Add { a, b, c },
            4 => Self::Mul { a, b, c },
            5 => Self::Div { a, b, c },
            6 => Self::Nand { a, b, c },
            7 => Self::Halt,
            8 => Self::Alloc { b, c },
            9 => Self::Free { c },
            10 => Self::Output { c },
            11 => Self::Input { c },
            12 => Self::LoadProgram { b, c },
            13 => Self::Orthography {
                a: ((opc >> 25) & 7) as usize,
                value: opc & 0x1ff_ffff,
            },
            _ => Self::Invalid(opc),
        }
    }

    /// Touches nothing but the eight registers.
    pub fn is_register_op(&self) -> bool {
        matches!(
            self,
            Self::CondMove { .. }
                | Self::Add { .. }
                | Self::Mul { .. }
                | Self::Div { .. }
                | Self::Nand { .. }
                | Self::Orthography { .. }
        )
    }
}

impl fmt::Display for Instr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::CondMove { a: 0, b: 0, c: 0 } => write!(f, "nop"),
            Self::CondMove { a, b, c } => write!(f, "if r{c} != 0 then r{a} = r{b}"),
            Self::Index { a, b, c } => write!(f, "r{a} = MEM[r{b}:r{c}]"),
            Self::Amend { a, b, c } => write!(f, "MEM[r{a}:r{b}] = r{c}"),
            Self::Add { a, b, c } => write!(f, "r{a} = r{b} + r{c}"),
            Self::Mul { a, b, c } => write!(f, "r{a} = r{b} * r{c}"),
            Self::Div { a, b, c } => write!(f, "r{a} = r{b} / r{c}"),
            Self::Nand { a, b, c } if b == c => write!(f, "r{a} = !r{b}"),
            Self::Nand { a, b, c } => write!(f, "r{a} = !(r{b} & r{c})"),
            Self::Halt => write!(f, "halt"),
            Self::Alloc { b, c } => write!(f, "r{b} = alloc(r{c})"),
            Self::Free { c } => write!(f, "free(r{c})"),
            Self::Output { c } => write!(f, "putc(r{c})"),
            Self::Input { c } => write!(f, "r{c} = getc()"),
            Self::LoadProgram { b: 6, c } => write!(f, "jmp (r6:)r{c}"),
            Self::LoadProgram { b, c } => write!(f, "longjmp r{b}:r{c}"),
            Self::Orthography { a, value } => write!(f, "r{a} = {value:#x}"),
            Self::Invalid(_) => write!(f, "invalid"),
        }
    }
}

pub fn decode(bin: &[u8]) -> anyhow::Result<Vec<u32>> {
    let chunks = bin.chunks_exact(4);
    if !chunks.remainder().is_empty() {
        anyhow::bail!("invalid binary");
    }
    Ok(chunks
        .into_iter()
        .map(|w| w.try_into().map(u32::from_be_bytes))
        .collect::<Result<_, _>>()?)
}

pub fn disasm(pc_base: usize, progn: &[u32]) -> Vec<String> {
    progn
        .iter()
        .enumerate()
        .map(|(ofs, &opc)| {
            let pc = pc_base + ofs;
            let malformed = match opc >> 28 {
                0..=6 => opc & 0x0fff_fe00 != 0,
                8 | 12 => opc & 0x0fff_ffc0 != 0,
                9..=11 => opc & 0x0fff_fff8 != 0,
                7 => opc & 0x0fff_ffff != 0,
                13 => false,
                _ => true,
            };
            format!(
                "{pc:#010x}: {opc:08x} {} {}",
                if malformed { "!" } else { " " },
                Instr::decode(opc)
            )
        })
        .collect()
}

/// Register instructions of a block plus the word the dispatcher resumes at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UmBlock {
    pub pc: u32,
    pub ops: Vec<Instr>,
    pub exit: u32,
}

/// Array 0 seen as guest memory. Physical addresses equal guest addresses.
pub struct ProgramMemory<'a>(pub &'a [u32]);

impl GuestMemory for ProgramMemory<'_> {
    fn physical_lookup(&self, addr: u32) -> Option<u32> {
        ((addr / 4) < self.0.len() as u32).then_some(addr)
    }
}

pub struct UmFrontend<'a> {
    program: &'a [u32],
}

impl<'a> UmFrontend<'a> {
    pub fn new(program: &'a [u32]) -> Self {
        Self { program }
    }
}

impl Frontend for UmFrontend<'_> {
    type Ir = UmBlock;

    fn decode(&mut self, pc: u32, budget: usize) -> anyhow::Result<Decoded<UmBlock>> {
        anyhow::ensure!(pc % 4 == 0, "unaligned pc {pc:#x}");
        let start = (pc / 4) as usize;
        anyhow::ensure!(
            start < self.program.len(),
            "pc {pc:#x} outside a program of {} words",
            self.program.len()
        );

        let max_ops = (budget / EST_OP_BYTES).min(MAX_BLOCK_WORDS - 1);
        let mut ops: Vec<Instr> = self.program[start..]
            .iter()
            .take(max_ops)
            .map(|&opc| Instr::decode(opc))
            .take_while(Instr::is_register_op)
            .collect();
        // the last word of the program is always left to the dispatcher
        if start + ops.len() == self.program.len() {
            ops.pop();
        }

        let exit = (start + ops.len()) as u32;
        Ok(Decoded {
            ins: ops.len() as u32 + 1,
            end_pc: exit * 4 + 3,
            ir: UmBlock {
                pc: start as u32,
                ops,
                exit,
            },
            spans: Vec::new(),
            has_fpu: false,
        })
    }
}
