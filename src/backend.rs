use std::collections::{BTreeMap, HashMap};

use cranelift::codegen::control::ControlPlane;
use cranelift::codegen::isa::OwnedTargetIsa;
use cranelift::prelude::*;
use log::{log_enabled, Level};

use crate::translate::{Backend, Emitted};
use crate::um::{Instr, UmBlock};

/// Signature of a compiled block: takes the register file, returns the word
/// index of the exit instruction.
pub type BlockFn = unsafe extern "C" fn(regs: *mut u32) -> u32;

/// Lowers [`UmBlock`]s to host code with cranelift.
///
/// Blocks only touch the register file, so the emitted code needs no
/// relocations and can be copied anywhere in the code region.
pub struct CraneliftBackend {
    isa: OwnedTargetIsa,
    ctx: codegen::Context,
    builder_ctx: FunctionBuilderContext,
    sizes: HashMap<usize, usize>,
}

impl Drop for CraneliftBackend {
    fn drop(&mut self) {
        if log_enabled!(Level::Info) && !self.sizes.is_empty() {
            log::info!("*** JIT code sizes:");
            for (ops, count) in self.sizes.iter().collect::<BTreeMap<_, _>>() {
                log::info!("    {} ops: {}", ops, count);
            }
        }
    }
}

#[derive(Clone, Copy)]
enum Reg {
    Value(Value),
    Const(u32),
}

impl Reg {
    fn value(&self, builder: &mut FunctionBuilder, cache: &mut HashMap<u32, Value>) -> Value {
        match self {
            Reg::Value(v) => *v,
            Reg::Const(val) => *cache
                .entry(*val)
                .or_insert_with(|| builder.ins().iconst(types::I32, *val as i64)),
        }
    }
}

impl CraneliftBackend {
    pub fn new() -> anyhow::Result<Self> {
        let mut flags = settings::builder();
        flags.set("opt_level", "speed")?;
        flags.set("is_pic", "true")?;

        let isa = cranelift_native::builder()
            .map_err(|e| anyhow::anyhow!("host ISA unsupported: {e}"))?
            .finish(settings::Flags::new(flags))
            .map_err(|e| anyhow::anyhow!("cranelift: {e}"))?;
        log::info!("*** JIT target ISA: {}", isa.triple());

        Ok(Self {
            isa,
            ctx: codegen::Context::new(),
            builder_ctx: FunctionBuilderContext::new(),
            sizes: HashMap::new(),
        })
    }

    fn lower(&mut self, block: &UmBlock) {
        let pt = self.isa.pointer_type();

        let mut sig = Signature::new(self.isa.default_call_conv());
        sig.params.push(AbiParam::new(pt));
        sig.returns.push(AbiParam::new(types::I32));
        self.ctx.func.signature = sig;

        let mut builder = FunctionBuilder::new(&mut self.ctx.func, &mut self.builder_ctx);
        let entry = builder.create_block();
        builder.append_block_params_for_function_params(entry);
        builder.switch_to_block(entry);
        builder.seal_block(entry);
        let param_regs = builder.block_params(entry)[0];

        let mut regs = [None::<Reg>; 8];
        let mut written = [false; 8];
        let mut const_cache = HashMap::<u32, Value>::new();

        // registers are loaded on first use
        macro_rules! reg {
            ($i:expr) => {{
                let i = $i;
                *regs[i].get_or_insert_with(|| {
                    Reg::Value(builder.ins().load(
                        types::I32,
                        MemFlags::trusted(),
                        param_regs,
                        i as i32 * 4,
                    ))
                })
            }};
        }

        for &op in &block.ops {
            let (a, v) = match op {
                Instr::CondMove { a, b, c } => {
                    let v = match reg!(c) {
                        Reg::Const(0) => reg!(a),
                        Reg::Const(_) => reg!(b),
                        Reg::Value(vc) => {
                            let va = reg!(a).value(&mut builder, &mut const_cache);
                            let vb = reg!(b).value(&mut builder, &mut const_cache);
                            Reg::Value(builder.ins().select(vc, vb, va))
                        }
                    };
                    (a, v)
                }
                Instr::Add { a, b, c } => {
                    let v = match (reg!(b), reg!(c)) {
                        (Reg::Const(cb), Reg::Const(cc)) => Reg::Const(cb.wrapping_add(cc)),
                        (Reg::Value(vb), Reg::Const(cc)) | (Reg::Const(cc), Reg::Value(vb)) => {
                            Reg::Value(builder.ins().iadd_imm(vb, cc as i64))
                        }
                        (Reg::Value(vb), Reg::Value(vc)) => Reg::Value(builder.ins().iadd(vb, vc)),
                    };
                    (a, v)
                }
                Instr::Mul { a, b, c } => {
                    let v = match (reg!(b), reg!(c)) {
                        (Reg::Const(cb), Reg::Const(cc)) => Reg::Const(cb.wrapping_mul(cc)),
                        (Reg::Value(vb), Reg::Const(cc)) | (Reg::Const(cc), Reg::Value(vb)) => {
                            Reg::Value(builder.ins().imul_imm(vb, cc as i64))
                        }
                        (Reg::Value(vb), Reg::Value(vc)) => Reg::Value(builder.ins().imul(vb, vc)),
                    };
                    (a, v)
                }
                Instr::Div { a, b, c } => {
                    let v = match (reg!(b), reg!(c)) {
                        (Reg::Const(cb), Reg::Const(cc)) if cc != 0 => Reg::Const(cb / cc),
                        (rb, rc) => {
                            let vb = rb.value(&mut builder, &mut const_cache);
                            let vc = rc.value(&mut builder, &mut const_cache);
                            Reg::Value(builder.ins().udiv(vb, vc))
                        }
                    };
                    (a, v)
                }
                Instr::Nand { a, b, c } => {
                    let and = if b == c {
                        reg!(b)
                    } else {
                        match (reg!(b), reg!(c)) {
                            (Reg::Const(cb), Reg::Const(cc)) => Reg::Const(cb & cc),
                            (Reg::Value(vb), Reg::Const(cc))
                            | (Reg::Const(cc), Reg::Value(vb)) => {
                                Reg::Value(builder.ins().band_imm(vb, cc as i64))
                            }
                            (Reg::Value(vb), Reg::Value(vc)) => {
                                Reg::Value(builder.ins().band(vb, vc))
                            }
                        }
                    };
                    let v = match and {
                        Reg::Const(val) => Reg::Const(!val),
                        Reg::Value(v) => Reg::Value(builder.ins().bnot(v)),
                    };
                    (a, v)
                }
                Instr::Orthography { a, value } => (a, Reg::Const(value)),
                other => unreachable!("{other} in a register block"),
            };

            regs[a] = Some(v);
            written[a] = true;
        }

        for i in 0..8 {
            if let (true, Some(r)) = (written[i], regs[i]) {
                let v = r.value(&mut builder, &mut const_cache);
                builder
                    .ins()
                    .store(MemFlags::trusted(), v, param_regs, i as i32 * 4);
            }
        }

        let exit = builder.ins().iconst(types::I32, block.exit as i64);
        builder.ins().return_(&[exit]);
        builder.finalize();
    }
}

impl Backend<UmBlock> for CraneliftBackend {
    fn compile(&mut self, block: &UmBlock, code: &mut [u8]) -> anyhow::Result<Emitted> {
        self.lower(block);

        if log_enabled!(Level::Trace) {
            log::trace!("*** IR for block at word {:#x}:\n{}", block.pc, self.ctx.func);
        }

        let compiled = self
            .ctx
            .compile(&*self.isa, &mut ControlPlane::default())
            .map_err(|e| anyhow::anyhow!("cranelift: {:?}", e.inner))?;

        anyhow::ensure!(
            compiled.buffer.relocs().is_empty(),
            "block at word {:#x} needs relocations",
            block.pc
        );

        let bytes = compiled.code_buffer();
        let len = bytes.len();
        if len <= code.len() {
            code[..len].copy_from_slice(bytes);
        }
        self.ctx.clear();

        if log_enabled!(Level::Info) {
            *self.sizes.entry(block.ops.len()).or_default() += 1;
        }

        Ok(Emitted {
            len,
            cycles: block.ops.len() as i32 + 1,
        })
    }
}
