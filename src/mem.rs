use crate::{
    error::{EmuError, Result},
    regs::REGS_WINDOW,
};

/// Bytes of addressable RAM: enough for `FFFF:FFFF` plus one byte of a word access.
pub const RAM_SIZE: usize = 0x10FFF0;
/// Physical address of the register/flag overlay (`F000:0000`).
pub const REGS_BASE: u32 = 0xF0000;
pub const IO_PORT_COUNT: usize = 0x10000;

/// Physical address of `seg:off`.
#[inline(always)]
pub fn linear(seg: u16, off: u16) -> u32 {
    ((seg as u32) << 4) + off as u32
}

/// First byte of an instruction: width and direction bits.
#[derive(Clone, Copy)]
pub struct OpcodeByte {
    bp: u8,
}

impl OpcodeByte {
    pub fn new(bp: u8) -> Self {
        Self { bp }
    }

    pub fn word(&self) -> bool {
        self.bp & 0b1 > 0
    }

    pub fn reg_is_dest(&self) -> bool {
        self.bp & 0b10 > 0
    }

    /// Register encoded in the low three bits (`PUSH r16`, `MOV r, imm`, ...).
    pub fn reg4bit(&self) -> u8 {
        self.bp & 0b111
    }
}

#[derive(Clone, Copy)]
pub struct ModRm {
    bp: u8,
}

impl ModRm {
    pub fn new(bp: u8) -> Self {
        Self { bp }
    }

    pub fn modd(&self) -> u8 {
        self.bp >> 6
    }

    pub fn rm(&self) -> u8 {
        self.bp & 0b111
    }

    pub fn reg(&self) -> u8 {
        (self.bp >> 3) & 0b111
    }

    /// Displacement bytes that follow this ModRM byte.
    pub fn disp_len(&self) -> u8 {
        match self.modd() {
            0 if self.rm() == 6 => 2,
            1 => 1,
            2 => 2,
            _ => 0,
        }
    }
}

/// Flat RAM. Every physical address wraps modulo the memory size.
pub struct Mem {
    bytes: Box<[u8]>,
}

impl Mem {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; RAM_SIZE].into_boxed_slice(),
        }
    }

    /// Memory of a custom size; it must still contain the register overlay.
    pub fn with_size(size: usize) -> Result<Self> {
        if size < REGS_BASE as usize + REGS_WINDOW {
            return Err(EmuError::InvalidMemorySize { size });
        }
        Ok(Self {
            bytes: vec![0u8; size].into_boxed_slice(),
        })
    }

    pub fn size(&self) -> usize {
        self.bytes.len()
    }

    #[inline(always)]
    fn wrap(&self, addr: u32) -> usize {
        addr as usize % self.bytes.len()
    }

    pub fn read_u8(&self, addr: u32) -> u8 {
        self.bytes[self.wrap(addr)]
    }

    pub fn write_u8(&mut self, addr: u32, val: u8) {
        let i = self.wrap(addr);
        self.bytes[i] = val;
    }

    pub fn read_u16(&self, addr: u32) -> u16 {
        u16::from_le_bytes([self.read_u8(addr), self.read_u8(addr.wrapping_add(1))])
    }

    pub fn write_u16(&mut self, addr: u32, val: u16) {
        let [lo, hi] = val.to_le_bytes();
        self.write_u8(addr, lo);
        self.write_u8(addr.wrapping_add(1), hi);
    }

    /// Byte or word operand, zero-extended.
    pub fn read(&self, addr: u32, word: bool) -> u32 {
        if word {
            self.read_u16(addr) as u32
        } else {
            self.read_u8(addr) as u32
        }
    }

    pub fn write(&mut self, addr: u32, word: bool, val: u32) {
        if word {
            self.write_u16(addr, val as u16)
        } else {
            self.write_u8(addr, val as u8)
        }
    }

    pub fn load(&mut self, addr: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.write_u8(addr.wrapping_add(i as u32), *b);
        }
    }

    pub fn slice(&self, addr: u32, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| self.read_u8(addr.wrapping_add(i as u32)))
            .collect()
    }

    pub(crate) fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn bytes_mut(&mut self) -> &mut [u8] {
        &mut self.bytes
    }
}

impl Default for Mem {
    fn default() -> Self {
        Self::new()
    }
}

/// The 64K I/O port space. Peripheral meaning lives outside the core.
pub struct Ports {
    bytes: Box<[u8]>,
}

impl Ports {
    pub fn new() -> Self {
        Self {
            bytes: vec![0u8; IO_PORT_COUNT].into_boxed_slice(),
        }
    }

    pub fn read_u8(&self, port: u16) -> u8 {
        self.bytes[port as usize]
    }

    pub fn write_u8(&mut self, port: u16, val: u8) {
        self.bytes[port as usize] = val;
    }

    pub fn read(&self, port: u16, word: bool) -> u32 {
        let lo = self.read_u8(port) as u32;
        if word {
            lo | (self.read_u8(port.wrapping_add(1)) as u32) << 8
        } else {
            lo
        }
    }

    pub fn write(&mut self, port: u16, word: bool, val: u32) {
        self.write_u8(port, val as u8);
        if word {
            self.write_u8(port.wrapping_add(1), (val >> 8) as u8);
        }
    }
}

impl Default for Ports {
    fn default() -> Self {
        Self::new()
    }
}
