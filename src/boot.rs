//! Machine bring-up: images, tables, boot registers, and the run loop that
//! interleaves the engine with peripheral polling.

use std::{
    fs,
    path::{Path, PathBuf},
};

use log::debug;

use crate::{
    cpu::{Cpu, StepOutcome},
    error::{EmuError, Result},
    host::{DiskSet, StdHost, SECTOR_SIZE, SLOT_BIOS, SLOT_FLOPPY, SLOT_HARD_DISK},
    mem::linear,
    regs::Flag,
    tables::{OpcodeTables, BIOS_LOAD_OFFSET},
    timing::{Pacer, PacingConfig, Peripheral, TimerTick},
};

pub const BIOS_SEGMENT: u16 = 0xF000;
/// Most BIOS bytes that fit between the load offset and the segment end.
pub const BIOS_MAX_LEN: usize = 0xFF00;

pub const BOOT_DRIVE_FLOPPY: u8 = 0x00;
pub const BOOT_DRIVE_HARD_DISK: u8 = 0x80;

/// Where the opcode classification tables come from.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum TableSource {
    /// The directory inside the BIOS image.
    #[default]
    Bios,
    /// A flat 20x256 matrix file.
    Flat(PathBuf),
    /// [`OpcodeTables::standard`].
    Builtin,
}

#[derive(Debug, Clone, Default)]
pub struct BootConfig {
    pub bios: PathBuf,
    pub floppy: Option<PathBuf>,
    pub hard_disk: Option<PathBuf>,
    pub boot_from_hd: bool,
    pub tables: TableSource,
    pub pacing: PacingConfig,
}

/// Why [`Machine::run`] returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exit {
    /// CS:IP reached 0000:0000.
    Stopped,
    /// HLT with interrupts disabled.
    Halted,
    InstructionLimit,
}

pub struct Machine {
    pub cpu: Cpu,
    pacer: Pacer,
    peripherals: Vec<Box<dyn Peripheral>>,
}

fn read_image(what: &'static str, path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|source| EmuError::ImageLoad {
        what,
        path: path.to_path_buf(),
        source,
    })
}

impl Machine {
    pub fn boot(config: &BootConfig) -> Result<Self> {
        let bios = read_image("BIOS", &config.bios)?;
        let tables = match &config.tables {
            TableSource::Bios => OpcodeTables::from_bios_image(&bios)?,
            TableSource::Flat(path) => OpcodeTables::from_flat(&read_image("table", path)?)?,
            TableSource::Builtin => OpcodeTables::standard(),
        };
        debug!("opcode tables from {:?}", config.tables);

        let mut disks = DiskSet::new();
        if let Some(hd) = &config.hard_disk {
            disks.attach(SLOT_HARD_DISK, hd)?;
        }
        if let Some(fd) = &config.floppy {
            disks.attach(SLOT_FLOPPY, fd)?;
        }
        disks.attach(SLOT_BIOS, &config.bios)?;

        let mut cpu = Cpu::new(tables);
        cpu.set_cs(BIOS_SEGMENT);
        cpu.set_ip(BIOS_LOAD_OFFSET);
        cpu.set_flag(Flag::Tf, false);

        let boot_drive = if config.boot_from_hd {
            BOOT_DRIVE_HARD_DISK
        } else {
            BOOT_DRIVE_FLOPPY
        };
        cpu.set_dl(boot_drive);

        let sectors = disks.len(SLOT_HARD_DISK).map_or(0, |len| len / SECTOR_SIZE) as u32;
        cpu.set_ax(sectors as u16);
        cpu.set_cx((sectors >> 16) as u16);
        debug!("boot drive {boot_drive:#04x}, hard disk sectors {sectors}");

        let len = bios.len().min(BIOS_MAX_LEN);
        cpu.mem.load(linear(BIOS_SEGMENT, BIOS_LOAD_OFFSET), &bios[..len]);
        debug!("BIOS {}: {len} bytes", config.bios.display());

        cpu.set_host(Box::new(StdHost::new(disks)));

        let mut machine = Self::from_cpu(cpu, &config.pacing);
        machine.add_peripheral(Box::new(TimerTick::new(config.pacing.tick_interval)));
        Ok(machine)
    }

    /// A machine around an already prepared engine, with no peripherals.
    pub fn from_cpu(cpu: Cpu, pacing: &PacingConfig) -> Self {
        Self {
            cpu,
            pacer: Pacer::new(pacing),
            peripherals: Vec::new(),
        }
    }

    pub fn add_peripheral(&mut self, p: Box<dyn Peripheral>) {
        self.peripherals.push(p);
    }

    /// Steps the engine, polling peripherals at the pacing interval, until it
    /// stops, halts for good, or `max_steps` steps have run. A step parked in
    /// HLT counts against the budget like an executed instruction.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<Exit> {
        let mut steps = 0u64;
        loop {
            if max_steps.is_some_and(|max| steps >= max) {
                return Ok(Exit::InstructionLimit);
            }
            steps += 1;
            match self.cpu.step()? {
                StepOutcome::Stopped => return Ok(Exit::Stopped),
                StepOutcome::Halted if !self.cpu.flag(Flag::If) => return Ok(Exit::Halted),
                _ => {}
            }
            if self.pacer.tick() {
                for p in self.peripherals.iter_mut() {
                    p.service(&mut self.cpu);
                }
            }
        }
    }
}
