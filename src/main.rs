use std::io::Write;
use std::path::PathBuf;

use jitcache::*;

#[argopt::subcmd]
fn run(
    #[opt(long, default_value = "1024")]
    arena: usize,
    #[opt(long, default_value = "64")]
    dirty: usize,
    #[opt(long, default_value = "auto")]
    tuning: String,
    bin: PathBuf,
) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;

    let tuning = match tuning.as_ref() {
        "auto" => None,
        "on" => Some(TuningEligibility::AppleArm64),
        "off" => Some(TuningEligibility::Ineligible),
        _ => anyhow::bail!("unknown tuning mode: {}", tuning),
    };
    let config = CacheConfig {
        arena_size: arena,
        dirty_capacity: dirty,
        tuning,
        ..Default::default()
    };

    let mut machine = runner::Machine::from_bin(&bin, &config)?;
    machine.run()
}

#[argopt::subcmd]
fn disasm(bin: PathBuf) -> anyhow::Result<()> {
    let bin = std::fs::read(bin)?;
    let asm = um::disasm(0, &um::decode(&bin)?);

    for instr in asm {
        println!("{}", instr);
    }

    Ok(())
}

#[argopt::cmd_group(commands = [run, disasm])]
fn main() -> anyhow::Result<()> {
    env_logger::builder()
        .format(|buf, record| writeln!(buf, "{}", record.args()))
        .init();
}
