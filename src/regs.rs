//! Register/flag overlay.
//!
//! Registers are not fields: they are bytes of RAM starting at
//! [`REGS_BASE`](crate::mem::REGS_BASE). [`Regs8`] and [`Regs16`] are two views
//! over that window, so `AL`/`AH` are the low/high bytes of `AX` by
//! construction and every flag has its own byte cell.

use paste::paste;

use crate::{cpu::Cpu, mem::Mem};

/// Bytes reserved for the overlay at the start of the `F000` segment.
pub const REGS_WINDOW: usize = 0x100;

// 16-bit register indices
pub const AX: usize = 0;
pub const CX: usize = 1;
pub const DX: usize = 2;
pub const BX: usize = 3;
pub const SP: usize = 4;
pub const BP: usize = 5;
pub const SI: usize = 6;
pub const DI: usize = 7;
pub const ES: usize = 8;
pub const CS: usize = 9;
pub const SS: usize = 10;
pub const DS: usize = 11;
/// Always reads zero; used by addressing forms without a second register.
pub const ZERO: usize = 12;
/// Holds the current instruction's immediate operand.
pub const SCRATCH: usize = 13;

// 8-bit register indices
pub const AL: usize = 0;
pub const AH: usize = 1;
pub const CL: usize = 2;
pub const CH: usize = 3;
pub const DL: usize = 4;
pub const DH: usize = 5;
pub const BL: usize = 6;
pub const BH: usize = 7;

/// 8-bit index of the byte that is always zero (low byte of `ZERO`).
pub const ZERO_CELL: u8 = 2 * ZERO as u8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Flag {
    Cf = 40,
    Pf = 41,
    Af = 42,
    Zf = 43,
    Sf = 44,
    Tf = 45,
    If = 46,
    Df = 47,
    Of = 48,
}

impl Flag {
    /// Cell order used by the flags bitfield table.
    pub const ALL: [Flag; 9] = [
        Flag::Cf,
        Flag::Pf,
        Flag::Af,
        Flag::Zf,
        Flag::Sf,
        Flag::Tf,
        Flag::If,
        Flag::Df,
        Flag::Of,
    ];

    /// Index in the 8-bit overlay view.
    pub fn index(self) -> usize {
        self as usize
    }

    /// Position in [`Flag::ALL`].
    pub fn ordinal(self) -> usize {
        self as usize - Flag::Cf as usize
    }

    pub fn from_ordinal(n: usize) -> Option<Flag> {
        Flag::ALL.get(n).copied()
    }
}

/// Byte view of the overlay.
#[derive(Debug, Clone, Copy)]
pub struct Regs8 {
    base: usize,
}

impl Regs8 {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline(always)]
    fn slot(&self, index: usize) -> usize {
        assert!(index < REGS_WINDOW, "8-bit register index {index} out of range");
        self.base + index
    }

    #[inline(always)]
    pub fn get(&self, mem: &Mem, index: usize) -> u8 {
        mem.bytes()[self.slot(index)]
    }

    #[inline(always)]
    pub fn set(&self, mem: &mut Mem, index: usize, val: u8) {
        let i = self.slot(index);
        mem.bytes_mut()[i] = val;
    }
}

/// Little-endian word view of the overlay.
#[derive(Debug, Clone, Copy)]
pub struct Regs16 {
    base: usize,
}

impl Regs16 {
    pub const fn new(base: usize) -> Self {
        Self { base }
    }

    #[inline(always)]
    fn slot(&self, index: usize) -> usize {
        assert!(
            2 * index + 1 < REGS_WINDOW,
            "16-bit register index {index} out of range"
        );
        self.base + 2 * index
    }

    #[inline(always)]
    pub fn get(&self, mem: &Mem, index: usize) -> u16 {
        let i = self.slot(index);
        let b = mem.bytes();
        u16::from_le_bytes([b[i], b[i + 1]])
    }

    #[inline(always)]
    pub fn set(&self, mem: &mut Mem, index: usize, val: u16) {
        let i = self.slot(index);
        let [lo, hi] = val.to_le_bytes();
        let b = mem.bytes_mut();
        b[i] = lo;
        b[i + 1] = hi;
    }
}

/// Byte offset, inside the overlay, of register `reg` as encoded in an
/// instruction: `AL CL DL BL AH CH DH BH` for bytes, `AX..DI` (or the segment
/// registers when `reg >= 8`) for words.
#[inline(always)]
pub fn reg_offset(reg: u8, word: bool) -> u32 {
    let reg = reg as u32;
    if word {
        2 * reg
    } else {
        2 * (reg & 3) + (reg >> 2)
    }
}

macro_rules! getsetreg {
    ($full:ident, $low:ident, $high:ident) => {
        paste! {
        #[inline(always)]
        pub fn [<set_ $full>](&mut self, val: u16) {
            self.set_reg16([<$full:upper>], val);
        }
        #[inline(always)]
        pub fn [<get_ $full>](&self) -> u16 {
            self.reg16([<$full:upper>])
        }
        #[inline(always)]
        pub fn [<get_ $low>](&self) -> u8 {
            self.reg8([<$low:upper>])
        }
        #[inline(always)]
        pub fn [<set_ $low>](&mut self, val: u8) {
            self.set_reg8([<$low:upper>], val);
        }
        #[inline(always)]
        pub fn [<get_ $high>](&self) -> u8 {
            self.reg8([<$high:upper>])
        }
        #[inline(always)]
        pub fn [<set_ $high>](&mut self, val: u8) {
            self.set_reg8([<$high:upper>], val);
        }
        }
    };
    ($full:ident) => {
        paste! {
        #[inline(always)]
        pub fn [<set_ $full>](&mut self, val: u16) {
            self.set_reg16([<$full:upper>], val);
        }
        #[inline(always)]
        pub fn [<get_ $full>](&self) -> u16 {
            self.reg16([<$full:upper>])
        }
        }
    };
}

impl Cpu {
    getsetreg!(ax, al, ah);
    getsetreg!(bx, bl, bh);
    getsetreg!(cx, cl, ch);
    getsetreg!(dx, dl, dh);
    getsetreg!(si);
    getsetreg!(di);
    getsetreg!(bp);
    getsetreg!(sp);
    getsetreg!(es);
    getsetreg!(cs);
    getsetreg!(ss);
    getsetreg!(ds);

    #[inline(always)]
    pub fn reg16(&self, index: usize) -> u16 {
        self.regs16.get(&self.mem, index)
    }

    #[inline(always)]
    pub fn set_reg16(&mut self, index: usize, val: u16) {
        self.regs16.set(&mut self.mem, index, val)
    }

    #[inline(always)]
    pub fn reg8(&self, index: usize) -> u8 {
        self.regs8.get(&self.mem, index)
    }

    #[inline(always)]
    pub fn set_reg8(&mut self, index: usize, val: u8) {
        self.regs8.set(&mut self.mem, index, val)
    }

    #[inline(always)]
    pub fn flag(&self, f: Flag) -> bool {
        self.reg8(f.index()) != 0
    }

    #[inline(always)]
    pub fn set_flag(&mut self, f: Flag, on: bool) {
        self.set_reg8(f.index(), on as u8)
    }

    /// Raw flag cell (0/1), as stored in the overlay.
    #[inline(always)]
    pub(crate) fn cell(&self, index: u8) -> u8 {
        self.reg8(index as usize)
    }

    /// Copy of the whole overlay window, for before/after comparisons.
    pub fn overlay_snapshot(&self) -> Vec<u8> {
        self.mem.slice(crate::mem::REGS_BASE, REGS_WINDOW)
    }
}
