use std::{fs, path::PathBuf};

use anyhow::{Context, Result};
use clap::Parser;
use comfy_table::{Row, Table};
use log::{error, info, LevelFilter};
use tiny8086::{
    regs::Flag, BootConfig, Cpu, EmuError, Exit, Machine, OpcodeTables, TableSource,
};

#[derive(Debug, Parser)]
#[command(about = "Table-driven 8086 PC emulator")]
struct Args {
    /// BIOS image, loaded at F000:0100.
    #[arg(required_unless_present = "export_tables")]
    bios: Option<PathBuf>,

    /// Floppy disk image (disk slot 1).
    floppy: Option<PathBuf>,

    /// Hard disk image (disk slot 0).
    #[arg(long)]
    hd: Option<PathBuf>,

    /// Boot from the hard disk (DL=0x80) instead of the floppy.
    #[arg(long, requires = "hd")]
    boot_hd: bool,

    /// Flat 20x256 opcode table file, used instead of the BIOS directory.
    #[arg(long, conflicts_with = "builtin_tables")]
    tables: Option<PathBuf>,

    /// Use the built-in opcode tables.
    #[arg(long)]
    builtin_tables: bool,

    /// Write the built-in opcode tables as a flat file and exit.
    #[arg(long)]
    export_tables: Option<PathBuf>,

    /// Stop after this many steps; steps parked in HLT count too.
    #[arg(long)]
    max_instructions: Option<u64>,

    /// Print registers and flags when the machine stops.
    #[arg(long)]
    dump_regs: bool,

    /// Log level; RUST_LOG takes precedence.
    #[arg(long, default_value = "warn")]
    log_level: LevelFilter,
}

impl Args {
    fn boot_config(&self, bios: PathBuf) -> BootConfig {
        let tables = match (&self.tables, self.builtin_tables) {
            (Some(path), _) => TableSource::Flat(path.clone()),
            (None, true) => TableSource::Builtin,
            (None, false) => TableSource::Bios,
        };
        BootConfig {
            bios,
            floppy: self.floppy.clone(),
            hard_disk: self.hd.clone(),
            boot_from_hd: self.boot_hd,
            tables,
            ..BootConfig::default()
        }
    }
}

fn dump_regs(cpu: &Cpu) {
    let mut regtable = Table::new();
    regtable.set_header(Row::from(&["Register", "Value"])).add_rows(vec![
        ["AX".to_string(), format!("{:04X}", cpu.get_ax())],
        ["BX".to_string(), format!("{:04X}", cpu.get_bx())],
        ["CX".to_string(), format!("{:04X}", cpu.get_cx())],
        ["DX".to_string(), format!("{:04X}", cpu.get_dx())],
        ["SI".to_string(), format!("{:04X}", cpu.get_si())],
        ["DI".to_string(), format!("{:04X}", cpu.get_di())],
        ["SP".to_string(), format!("{:04X}", cpu.get_sp())],
        ["BP".to_string(), format!("{:04X}", cpu.get_bp())],
        ["CS".to_string(), format!("{:04X}", cpu.get_cs())],
        ["DS".to_string(), format!("{:04X}", cpu.get_ds())],
        ["ES".to_string(), format!("{:04X}", cpu.get_es())],
        ["SS".to_string(), format!("{:04X}", cpu.get_ss())],
        ["IP".to_string(), format!("{:04X}", cpu.get_ip())],
    ]);
    println!("{}", regtable);

    let names = [
        ("Carry", Flag::Cf),
        ("Parity", Flag::Pf),
        ("Aux", Flag::Af),
        ("Zero", Flag::Zf),
        ("Sign", Flag::Sf),
        ("Trap", Flag::Tf),
        ("Interrupt", Flag::If),
        ("Direction", Flag::Df),
        ("Overflow", Flag::Of),
    ];
    let mut flagstable = Table::new();
    flagstable.set_header(&["Flag", "Value"]);
    flagstable.add_rows(
        names
            .iter()
            .map(|(name, f)| [name.to_string(), cpu.flag(*f).to_string()]),
    );
    println!("{}", flagstable);
    println!("instructions: {}", cpu.inst_counter);
}

fn main() -> Result<()> {
    let args = Args::parse();
    env_logger::Builder::new()
        .filter_level(args.log_level)
        .parse_default_env()
        .init();

    if let Some(path) = &args.export_tables {
        fs::write(path, OpcodeTables::standard().to_flat())
            .with_context(|| format!("writing opcode tables to {}", path.display()))?;
        info!("opcode tables written to {}", path.display());
        return Ok(());
    }

    // clap guarantees a BIOS path unless exporting
    let Some(bios) = args.bios.clone() else {
        return Ok(());
    };
    let config = args.boot_config(bios);
    let mut machine = Machine::boot(&config)
        .with_context(|| format!("booting from {}", config.bios.display()))?;

    let outcome = machine.run(args.max_instructions);
    if args.dump_regs {
        dump_regs(&machine.cpu);
    }
    match outcome {
        Ok(Exit::Stopped) => info!("CS:IP reached 0000:0000"),
        Ok(Exit::Halted) => info!("halted with interrupts disabled"),
        Ok(Exit::InstructionLimit) => info!("instruction limit reached"),
        Err(e @ EmuError::IllegalOpcode { .. }) => {
            error!("{e}");
            return Err(e.into());
        }
        Err(e) => return Err(e).context("machine stopped"),
    }
    Ok(())
}
