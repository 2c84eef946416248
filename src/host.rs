//! Services the guest reaches through the `0F xx` host-call opcodes: console
//! output, the wall clock and the three disk slots.

use std::{
    fs::{File, OpenOptions},
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use chrono::{Datelike, Local, NaiveDateTime, Timelike};
use log::debug;

use crate::error::{EmuError, Result};

pub const SLOT_HARD_DISK: u8 = 0;
pub const SLOT_FLOPPY: u8 = 1;
pub const SLOT_BIOS: u8 = 2;
pub const SLOT_COUNT: usize = 3;

pub const SECTOR_SIZE: u64 = 512;

/// Size of the calendar record written by the RTC host call.
pub const RTC_RECORD_LEN: usize = 38;

pub trait Host {
    fn putchar(&mut self, byte: u8);

    fn now(&mut self) -> NaiveDateTime;

    /// Reads up to `buf.len()` bytes from disk `slot` at byte `offset`.
    fn disk_read(&mut self, slot: u8, offset: u64, buf: &mut [u8]) -> io::Result<usize>;

    fn disk_write(&mut self, slot: u8, offset: u64, data: &[u8]) -> io::Result<usize>;
}

/// Disk images indexed by slot. Files are closed when the set is dropped.
#[derive(Debug, Default)]
pub struct DiskSet {
    slots: [Option<File>; SLOT_COUNT],
}

impl DiskSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Opens `path` for reading and writing, or read-only when the file is
    /// not writable.
    pub fn attach(&mut self, slot: u8, path: &Path) -> Result<()> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|e| match e.kind() {
                io::ErrorKind::PermissionDenied => File::open(path),
                _ => Err(e),
            })
            .map_err(|source| EmuError::DiskSetup {
                path: path.to_path_buf(),
                source,
            })?;
        debug!("disk slot {slot}: {}", path.display());
        self.slots[slot as usize] = Some(file);
        Ok(())
    }

    pub fn is_attached(&self, slot: u8) -> bool {
        self.slots.get(slot as usize).is_some_and(Option::is_some)
    }

    /// Image length in bytes, if the slot is attached.
    pub fn len(&self, slot: u8) -> Option<u64> {
        let file = self.slots.get(slot as usize)?.as_ref()?;
        file.metadata().ok().map(|m| m.len())
    }

    fn file(&mut self, slot: u8) -> io::Result<&mut File> {
        self.slots
            .get_mut(slot as usize)
            .and_then(Option::as_mut)
            .ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, format!("no disk in slot {slot}"))
            })
    }

    pub fn read_at(&mut self, slot: u8, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let file = self.file(slot)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut filled = 0;
        while filled < buf.len() {
            match file.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }

    pub fn write_at(&mut self, slot: u8, offset: u64, data: &[u8]) -> io::Result<usize> {
        let file = self.file(slot)?;
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(data.len())
    }
}

/// Console on a writer (stdout by default), local wall clock, real disk
/// files.
pub struct StdHost {
    pub disks: DiskSet,
    out: Box<dyn Write>,
}

impl StdHost {
    pub fn new(disks: DiskSet) -> Self {
        Self::with_output(disks, Box::new(io::stdout()))
    }

    pub fn with_output(disks: DiskSet, out: Box<dyn Write>) -> Self {
        Self { disks, out }
    }
}

impl Default for StdHost {
    fn default() -> Self {
        Self::new(DiskSet::new())
    }
}

impl Host for StdHost {
    fn putchar(&mut self, byte: u8) {
        // console output is best effort; the guest has no way to see a failure
        let _ = self.out.write_all(&[byte]).and_then(|_| self.out.flush());
    }

    fn now(&mut self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn disk_read(&mut self, slot: u8, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        self.disks.read_at(slot, offset, buf)
    }

    fn disk_write(&mut self, slot: u8, offset: u64, data: &[u8]) -> io::Result<usize> {
        self.disks.write_at(slot, offset, data)
    }
}

/// Calendar record in the layout of a C `struct tm` (nine little-endian
/// `i32`s: sec, min, hour, mday, mon, year-1900, wday, yday, isdst)
/// followed by the milliseconds as a `u16`.
pub fn rtc_record(t: &NaiveDateTime) -> [u8; RTC_RECORD_LEN] {
    let fields = [
        t.second() as i32,
        t.minute() as i32,
        t.hour() as i32,
        t.day() as i32,
        t.month0() as i32,
        t.year() - 1900,
        t.weekday().num_days_from_sunday() as i32,
        t.ordinal0() as i32,
        0,
    ];
    let mut out = [0u8; RTC_RECORD_LEN];
    for (chunk, field) in out.chunks_exact_mut(4).zip(fields) {
        chunk.copy_from_slice(&field.to_le_bytes());
    }
    let millis = (t.nanosecond() / 1_000_000).min(999) as u16;
    out[36..].copy_from_slice(&millis.to_le_bytes());
    out
}
