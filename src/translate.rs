//! Seams between the cache and the translator around it.

/// Guest memory model, as far as the cache needs it.
pub trait GuestMemory {
    /// Physical address backing guest address `addr`, if it is mapped.
    fn physical_lookup(&self, addr: u32) -> Option<u32>;
}

/// Result of decoding one block of guest code.
#[derive(Debug, Clone)]
pub struct Decoded<Ir> {
    pub ir: Ir,
    /// Address of the last guest byte covered by the block.
    pub end_pc: u32,
    pub ins: u32,
    /// Guest bytes of each decoded instruction as `(address, length)`. When
    /// present, the block's masks cover exactly these bytes instead of the
    /// whole `pc..=end_pc` range.
    pub spans: Vec<(u32, u32)>,
    pub has_fpu: bool,
}

/// Instruction decoder producing backend IR.
pub trait Frontend {
    type Ir;

    /// Decodes a block starting at `pc`. `budget` is the host code size the
    /// block should stay under.
    fn decode(&mut self, pc: u32, budget: usize) -> anyhow::Result<Decoded<Self::Ir>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Emitted {
    pub len: usize,
    pub cycles: i32,
}

/// Native encoder.
pub trait Backend<Ir> {
    /// Writes host code for `ir` to the start of `code`.
    fn compile(&mut self, ir: &Ir, code: &mut [u8]) -> anyhow::Result<Emitted>;
}
