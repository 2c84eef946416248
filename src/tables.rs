//! Opcode classification tables.
//!
//! Twenty 256-entry byte tables drive decoding: ModRM addressing, opcode to
//! canonical instruction id, sub-function, flags-update policy, parity,
//! instruction length and conditional jump decoding. They are data, not
//! code, so a BIOS image can ship its own copy.

use crate::{
    error::{EmuError, Result},
    regs::{Flag, BP, BX, CS, DI, DS, ES, SI, SS, ZERO, ZERO_CELL},
};

pub const TABLE_COUNT: usize = 20;
pub const TABLE_LEN: usize = 256;
pub const FLAT_IMAGE_LEN: usize = TABLE_COUNT * TABLE_LEN;

/// First of the four ModRM tables used when `mod != 0`.
pub const TABLE_RM_MOD_NONZERO: usize = 0;
/// First of the four ModRM tables used when `mod == 0`.
pub const TABLE_RM_MOD_ZERO: usize = 4;
pub const TABLE_XLAT_OPCODE: usize = 8;
pub const TABLE_XLAT_SUBFUNCTION: usize = 9;
pub const TABLE_STD_FLAGS: usize = 10;
pub const TABLE_PARITY_FLAG: usize = 11;
pub const TABLE_BASE_INST_SIZE: usize = 12;
pub const TABLE_I_W_SIZE: usize = 13;
pub const TABLE_I_MOD_SIZE: usize = 14;
pub const TABLE_COND_JUMP_DECODE_A: usize = 15;
pub const TABLE_COND_JUMP_DECODE_B: usize = 16;
pub const TABLE_COND_JUMP_DECODE_C: usize = 17;
pub const TABLE_COND_JUMP_DECODE_D: usize = 18;
pub const TABLE_FLAGS_BITFIELDS: usize = 19;

// Bits of a TABLE_STD_FLAGS entry
pub const FLAGS_UPDATE_SZP: u8 = 1;
pub const FLAGS_UPDATE_AO_ARITH: u8 = 2;
pub const FLAGS_UPDATE_OC_LOGIC: u8 = 4;

/// Canonical id the built-in table gives opcodes without 8086 semantics.
pub const ILLEGAL_ID: u8 = 0xFF;

/// Offset of the table directory inside a BIOS image.
const BIOS_TABLE_DIRECTORY: usize = 2;
/// In-segment offset the BIOS image is loaded at.
pub const BIOS_LOAD_OFFSET: u16 = 0x100;

/// Canonical instruction ids. Many raw opcodes collapse onto one id; the
/// execute stage switches on these.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Instr {
    CondJump = 0,
    MovRegImm = 1,
    IncDecReg16 = 2,
    PushReg16 = 3,
    PopReg16 = 4,
    GroupIncDec = 5,
    GroupUnary = 6,
    AluAccImm = 7,
    AluRmImm = 8,
    AluRmReg = 9,
    MovSregLeaPop = 10,
    MovAccMoffs = 11,
    ShiftRotate = 12,
    LoopJcxz = 13,
    JmpCall = 14,
    TestRmReg = 15,
    XchgAccReg = 16,
    MovsStosLods = 17,
    CmpsScas = 18,
    Ret = 19,
    MovRmImm = 20,
    In = 21,
    Out = 22,
    Rep = 23,
    XchgRmReg = 24,
    PushSreg = 25,
    PopSreg = 26,
    SegOverride = 27,
    DaaDas = 28,
    AaaAas = 29,
    Cbw = 30,
    Cwd = 31,
    CallFar = 32,
    Pushf = 33,
    Popf = 34,
    Sahf = 35,
    Lahf = 36,
    LesLds = 37,
    Int3 = 38,
    Int = 39,
    Into = 40,
    Aam = 41,
    Aad = 42,
    Salc = 43,
    Xlat = 44,
    Cmc = 45,
    FlagOp = 46,
    TestAccImm = 47,
    HostCall = 48,
    Hlt = 49,
    Nop = 50,
}

impl TryFrom<u8> for Instr {
    type Error = u8;

    fn try_from(id: u8) -> std::result::Result<Self, u8> {
        use Instr::*;
        Ok(match id {
            0 => CondJump,
            1 => MovRegImm,
            2 => IncDecReg16,
            3 => PushReg16,
            4 => PopReg16,
            5 => GroupIncDec,
            6 => GroupUnary,
            7 => AluAccImm,
            8 => AluRmImm,
            9 => AluRmReg,
            10 => MovSregLeaPop,
            11 => MovAccMoffs,
            12 => ShiftRotate,
            13 => LoopJcxz,
            14 => JmpCall,
            15 => TestRmReg,
            16 => XchgAccReg,
            17 => MovsStosLods,
            18 => CmpsScas,
            19 => Ret,
            20 => MovRmImm,
            21 => In,
            22 => Out,
            23 => Rep,
            24 => XchgRmReg,
            25 => PushSreg,
            26 => PopSreg,
            27 => SegOverride,
            28 => DaaDas,
            29 => AaaAas,
            30 => Cbw,
            31 => Cwd,
            32 => CallFar,
            33 => Pushf,
            34 => Popf,
            35 => Sahf,
            36 => Lahf,
            37 => LesLds,
            38 => Int3,
            39 => Int,
            40 => Into,
            41 => Aam,
            42 => Aad,
            43 => Salc,
            44 => Xlat,
            45 => Cmc,
            46 => FlagOp,
            47 => TestAccImm,
            48 => HostCall,
            49 => Hlt,
            50 => Nop,
            other => return Err(other),
        })
    }
}

/// ALU function numbers, as found in the ModRM reg field of `80..83` and in
/// bits 3..5 of the `00..3F` opcodes. `MOV` shares the r/m,reg path.
pub const ALU_ADD: u8 = 0;
pub const ALU_OR: u8 = 1;
pub const ALU_ADC: u8 = 2;
pub const ALU_SBB: u8 = 3;
pub const ALU_AND: u8 = 4;
pub const ALU_SUB: u8 = 5;
pub const ALU_XOR: u8 = 6;
pub const ALU_CMP: u8 = 7;
pub const ALU_MOV: u8 = 8;

/// One row of a ModRM addressing table pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RmForm {
    pub base: u8,
    pub index: u8,
    pub disp_mult: u8,
    pub seg: u8,
}

#[derive(Clone, PartialEq, Eq)]
pub struct OpcodeTables {
    t: Box<[[u8; TABLE_LEN]; TABLE_COUNT]>,
}

impl std::fmt::Debug for OpcodeTables {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpcodeTables").finish_non_exhaustive()
    }
}

impl OpcodeTables {
    fn zeroed() -> Self {
        Self {
            t: Box::new([[0u8; TABLE_LEN]; TABLE_COUNT]),
        }
    }

    /// Tables stored back to back, table `n` at offset `256 * n`.
    pub fn from_flat(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < FLAT_IMAGE_LEN {
            return Err(EmuError::ImageTruncated {
                what: "opcode table",
                needed: FLAT_IMAGE_LEN,
                found: bytes.len(),
            });
        }
        let mut tables = Self::zeroed();
        for (n, table) in tables.t.iter_mut().enumerate() {
            table.copy_from_slice(&bytes[n * TABLE_LEN..(n + 1) * TABLE_LEN]);
        }
        Ok(tables)
    }

    /// Tables referenced by the directory of a BIOS image. Word `n` of the
    /// directory is the `F000` offset of table `n`; the image itself is
    /// loaded at [`BIOS_LOAD_OFFSET`].
    pub fn from_bios_image(bios: &[u8]) -> Result<Self> {
        let dir_end = BIOS_TABLE_DIRECTORY + 2 * TABLE_COUNT;
        if bios.len() < dir_end {
            return Err(EmuError::ImageTruncated {
                what: "BIOS",
                needed: dir_end,
                found: bios.len(),
            });
        }
        let mut tables = Self::zeroed();
        for (n, table) in tables.t.iter_mut().enumerate() {
            let at = BIOS_TABLE_DIRECTORY + 2 * n;
            let ptr = u16::from_le_bytes([bios[at], bios[at + 1]]) as usize;
            let start = ptr.wrapping_sub(BIOS_LOAD_OFFSET as usize);
            let end = start.saturating_add(TABLE_LEN);
            if ptr < BIOS_LOAD_OFFSET as usize || end > bios.len() {
                return Err(EmuError::ImageTruncated {
                    what: "BIOS",
                    needed: ptr.saturating_sub(BIOS_LOAD_OFFSET as usize) + TABLE_LEN,
                    found: bios.len(),
                });
            }
            table.copy_from_slice(&bios[start..end]);
        }
        Ok(tables)
    }

    pub fn to_flat(&self) -> Vec<u8> {
        self.t.iter().flatten().copied().collect()
    }

    #[inline(always)]
    pub fn lookup(&self, table: usize, index: u8) -> u8 {
        self.t[table][index as usize]
    }

    #[inline(always)]
    pub fn xlat_opcode(&self, raw: u8) -> u8 {
        self.lookup(TABLE_XLAT_OPCODE, raw)
    }

    #[inline(always)]
    pub fn subfunction(&self, raw: u8) -> u8 {
        self.lookup(TABLE_XLAT_SUBFUNCTION, raw)
    }

    #[inline(always)]
    pub fn std_flags(&self, raw: u8) -> u8 {
        self.lookup(TABLE_STD_FLAGS, raw)
    }

    #[inline(always)]
    pub fn parity(&self, byte: u8) -> u8 {
        self.lookup(TABLE_PARITY_FLAG, byte)
    }

    #[inline(always)]
    pub fn base_size(&self, raw: u8) -> u8 {
        self.lookup(TABLE_BASE_INST_SIZE, raw)
    }

    #[inline(always)]
    pub fn w_size(&self, raw: u8) -> u8 {
        self.lookup(TABLE_I_W_SIZE, raw)
    }

    #[inline(always)]
    pub fn mod_size(&self, raw: u8) -> u8 {
        self.lookup(TABLE_I_MOD_SIZE, raw)
    }

    /// The four overlay cells a `Jcc` condition reads: taken when
    /// `a || b || (c ^ d)`, inverted by the opcode's low bit.
    #[inline(always)]
    pub fn cond_jump(&self, index: u8) -> [u8; 4] {
        [
            self.lookup(TABLE_COND_JUMP_DECODE_A, index),
            self.lookup(TABLE_COND_JUMP_DECODE_B, index),
            self.lookup(TABLE_COND_JUMP_DECODE_C, index),
            self.lookup(TABLE_COND_JUMP_DECODE_D, index),
        ]
    }

    /// Bit position of flag cell `ordinal` inside the FLAGS word.
    #[inline(always)]
    pub fn flag_bit(&self, ordinal: usize) -> u8 {
        self.t[TABLE_FLAGS_BITFIELDS][ordinal]
    }

    pub fn rm_form(&self, mod_zero: bool, rm: u8) -> RmForm {
        let first = if mod_zero {
            TABLE_RM_MOD_ZERO
        } else {
            TABLE_RM_MOD_NONZERO
        };
        RmForm {
            base: self.lookup(first, rm),
            index: self.lookup(first + 1, rm),
            disp_mult: self.lookup(first + 2, rm),
            seg: self.lookup(first + 3, rm),
        }
    }

    /// The table set the canonical ids of [`Instr`] are defined against.
    pub fn standard() -> Self {
        let mut b = Builder {
            t: Self::zeroed(),
        };
        b.addressing();
        b.opcodes();
        b.parity();
        b.cond_jumps();
        b.flag_bits();
        b.t
    }
}

struct Builder {
    t: OpcodeTables,
}

impl Builder {
    fn set(&mut self, table: usize, index: usize, val: u8) {
        self.t.t[table][index] = val;
    }

    fn addressing(&mut self) {
        let (bx, bp, si, di, zero) = (BX as u8, BP as u8, SI as u8, DI as u8, ZERO as u8);
        let (ds, ss) = (DS as u8, SS as u8);
        let base = [bx, bx, bp, bp, si, di, bp, bx];
        let index = [si, di, si, di, zero, zero, zero, zero];
        let seg = [ds, ds, ss, ss, ds, ds, ss, ds];
        for rm in 0..8 {
            self.set(TABLE_RM_MOD_NONZERO, rm, base[rm]);
            self.set(TABLE_RM_MOD_NONZERO + 1, rm, index[rm]);
            self.set(TABLE_RM_MOD_NONZERO + 2, rm, 1);
            self.set(TABLE_RM_MOD_NONZERO + 3, rm, seg[rm]);

            // mod 0, rm 6 is a bare 16-bit displacement off DS
            let direct = rm == 6;
            self.set(TABLE_RM_MOD_ZERO, rm, if direct { zero } else { base[rm] });
            self.set(TABLE_RM_MOD_ZERO + 1, rm, index[rm]);
            self.set(TABLE_RM_MOD_ZERO + 2, rm, direct as u8);
            self.set(TABLE_RM_MOD_ZERO + 3, rm, if direct { ds } else { seg[rm] });
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn op(&mut self, raw: u8, id: Instr, extra: u8, flags: u8, base: u8, wsize: u8, modrm: bool) {
        let raw = raw as usize;
        self.set(TABLE_XLAT_OPCODE, raw, id as u8);
        self.set(TABLE_XLAT_SUBFUNCTION, raw, extra);
        self.set(TABLE_STD_FLAGS, raw, flags);
        self.set(TABLE_BASE_INST_SIZE, raw, base);
        self.set(TABLE_I_W_SIZE, raw, wsize);
        self.set(TABLE_I_MOD_SIZE, raw, modrm as u8);
    }

    fn simple(&mut self, raw: u8, id: Instr, extra: u8, base: u8) {
        self.op(raw, id, extra, 0, base, 0, false);
    }

    fn opcodes(&mut self) {
        use Instr::*;
        const SZP: u8 = FLAGS_UPDATE_SZP;
        const ARITH: u8 = FLAGS_UPDATE_SZP | FLAGS_UPDATE_AO_ARITH;
        const LOGIC: u8 = FLAGS_UPDATE_SZP | FLAGS_UPDATE_OC_LOGIC;

        for raw in 0..=255u8 {
            self.simple(raw, Nop, 0, 1);
            self.set(TABLE_XLAT_OPCODE, raw as usize, ILLEGAL_ID);
        }

        // ADD OR ADC SBB AND SUB XOR CMP. ADC/SBB fold AF/OF in themselves.
        let alu_flags = [ARITH, LOGIC, SZP, SZP, LOGIC, ARITH, LOGIC, ARITH];
        for f in 0..8u8 {
            let row = f * 8;
            for k in 0..4 {
                self.op(row + k, AluRmReg, f, alu_flags[f as usize], 2, 0, true);
            }
            self.op(row + 4, AluAccImm, f, alu_flags[f as usize], 1, 1, false);
            self.op(row + 5, AluAccImm, f, alu_flags[f as usize], 1, 1, false);
        }

        let (es, cs, ss, ds) = (ES as u8, CS as u8, SS as u8, DS as u8);
        self.simple(0x06, PushSreg, es, 1);
        self.simple(0x07, PopSreg, es, 1);
        self.simple(0x0E, PushSreg, cs, 1);
        self.simple(0x0F, HostCall, 0, 2);
        self.simple(0x16, PushSreg, ss, 1);
        self.simple(0x17, PopSreg, ss, 1);
        self.simple(0x1E, PushSreg, ds, 1);
        self.simple(0x1F, PopSreg, ds, 1);
        self.simple(0x26, SegOverride, es, 1);
        self.op(0x27, DaaDas, 0, SZP, 1, 0, false);
        self.simple(0x2E, SegOverride, cs, 1);
        self.op(0x2F, DaaDas, 1, SZP, 1, 0, false);
        self.simple(0x36, SegOverride, ss, 1);
        self.simple(0x37, AaaAas, 0, 1);
        self.simple(0x3E, SegOverride, ds, 1);
        self.simple(0x3F, AaaAas, 1, 1);

        for r in 0..8u8 {
            self.op(0x40 + r, IncDecReg16, 0, SZP, 1, 0, false);
            self.op(0x48 + r, IncDecReg16, 1, SZP, 1, 0, false);
            self.simple(0x50 + r, PushReg16, 0, 1);
            self.simple(0x58 + r, PopReg16, 0, 1);
            self.simple(0x90 + r, XchgAccReg, 0, 1);
            self.simple(0xB0 + r, MovRegImm, 0, 2);
            self.simple(0xB8 + r, MovRegImm, 0, 3);
            self.op(0xD8 + r, Nop, 0, 0, 2, 0, true);
        }
        for cc in 0x70..=0x7Fu8 {
            self.simple(cc, CondJump, 0, 2);
        }

        // 80 and 82 carry imm8, 81 imm16, 83 a sign-extended imm8
        self.op(0x80, AluRmImm, 0, 0, 2, 1, true);
        self.op(0x81, AluRmImm, 0, 0, 2, 1, true);
        self.op(0x82, AluRmImm, 0, 0, 2, 1, true);
        self.op(0x83, AluRmImm, 0, 0, 3, 0, true);
        self.op(0x84, TestRmReg, 0, LOGIC, 2, 0, true);
        self.op(0x85, TestRmReg, 0, LOGIC, 2, 0, true);
        self.op(0x86, XchgRmReg, 0, 0, 2, 0, true);
        self.op(0x87, XchgRmReg, 0, 0, 2, 0, true);
        for raw in 0x88..=0x8Bu8 {
            self.op(raw, AluRmReg, ALU_MOV, 0, 2, 0, true);
        }
        for raw in 0x8C..=0x8Fu8 {
            self.op(raw, MovSregLeaPop, 0, 0, 2, 0, true);
        }

        self.simple(0x98, Cbw, 0, 1);
        self.simple(0x99, Cwd, 0, 1);
        self.simple(0x9A, CallFar, 0, 5);
        self.simple(0x9B, Nop, 0, 1);
        self.simple(0x9C, Pushf, 0, 1);
        self.simple(0x9D, Popf, 0, 1);
        self.simple(0x9E, Sahf, 0, 1);
        self.simple(0x9F, Lahf, 0, 1);

        for raw in 0xA0..=0xA3u8 {
            self.simple(raw, MovAccMoffs, 0, 3);
        }
        self.simple(0xA4, MovsStosLods, 0, 1);
        self.simple(0xA5, MovsStosLods, 0, 1);
        self.simple(0xA6, CmpsScas, 0, 1);
        self.simple(0xA7, CmpsScas, 0, 1);
        self.op(0xA8, TestAccImm, 0, LOGIC, 1, 1, false);
        self.op(0xA9, TestAccImm, 0, LOGIC, 1, 1, false);
        self.simple(0xAA, MovsStosLods, 1, 1);
        self.simple(0xAB, MovsStosLods, 1, 1);
        self.simple(0xAC, MovsStosLods, 2, 1);
        self.simple(0xAD, MovsStosLods, 2, 1);
        self.simple(0xAE, CmpsScas, 1, 1);
        self.simple(0xAF, CmpsScas, 1, 1);

        // C0/C1: shift by imm8 (80186 encoding BIOS code relies on)
        self.op(0xC0, ShiftRotate, 1, 0, 3, 0, true);
        self.op(0xC1, ShiftRotate, 1, 0, 3, 0, true);
        self.simple(0xC2, Ret, 0, 3);
        self.simple(0xC3, Ret, 0, 1);
        self.op(0xC4, LesLds, es, 0, 2, 0, true);
        self.op(0xC5, LesLds, ds, 0, 2, 0, true);
        self.op(0xC6, MovRmImm, 0, 0, 2, 1, true);
        self.op(0xC7, MovRmImm, 0, 0, 2, 1, true);
        self.set(TABLE_XLAT_OPCODE, 0xC8, ILLEGAL_ID);
        self.set(TABLE_XLAT_OPCODE, 0xC9, ILLEGAL_ID);
        self.simple(0xCA, Ret, 1, 3);
        self.simple(0xCB, Ret, 1, 1);
        self.simple(0xCC, Int3, 0, 1);
        self.simple(0xCD, Int, 0, 2);
        self.simple(0xCE, Into, 0, 1);
        self.simple(0xCF, Ret, 2, 1);

        for raw in 0xD0..=0xD3u8 {
            self.op(raw, ShiftRotate, 0, 0, 2, 0, true);
        }
        self.op(0xD4, Aam, 0, SZP, 2, 0, false);
        self.op(0xD5, Aad, 0, SZP, 2, 0, false);
        self.simple(0xD6, Salc, 0, 1);
        self.simple(0xD7, Xlat, 0, 1);

        for raw in 0xE0..=0xE3u8 {
            self.simple(raw, LoopJcxz, 0, 2);
        }
        self.simple(0xE4, In, 0, 2);
        self.simple(0xE5, In, 0, 2);
        self.simple(0xE6, Out, 0, 2);
        self.simple(0xE7, Out, 0, 2);
        self.simple(0xE8, JmpCall, 0, 3);
        self.simple(0xE9, JmpCall, 1, 3);
        self.simple(0xEA, JmpCall, 2, 5);
        self.simple(0xEB, JmpCall, 3, 2);
        self.simple(0xEC, In, 1, 1);
        self.simple(0xED, In, 1, 1);
        self.simple(0xEE, Out, 1, 1);
        self.simple(0xEF, Out, 1, 1);

        self.simple(0xF0, Nop, 0, 1);
        self.set(TABLE_XLAT_OPCODE, 0xF1, ILLEGAL_ID);
        self.simple(0xF2, Rep, 0, 1);
        self.simple(0xF3, Rep, 1, 1);
        self.simple(0xF4, Hlt, 0, 1);
        self.simple(0xF5, Cmc, 0, 1);
        self.op(0xF6, GroupUnary, 0, 0, 2, 0, true);
        self.op(0xF7, GroupUnary, 0, 0, 2, 0, true);
        let set_clear = [Flag::Cf, Flag::If, Flag::Df];
        for (k, flag) in set_clear.iter().enumerate() {
            let raw = 0xF8 + 2 * k as u8;
            let cell = (flag.ordinal() as u8) << 1;
            self.simple(raw, FlagOp, cell, 1);
            self.simple(raw + 1, FlagOp, cell | 1, 1);
        }
        self.op(0xFE, GroupIncDec, 0, 0, 2, 0, true);
        self.op(0xFF, GroupIncDec, 0, 0, 2, 0, true);
    }

    fn parity(&mut self) {
        for b in 0..=255u8 {
            self.set(TABLE_PARITY_FLAG, b as usize, (b.count_ones() % 2 == 0) as u8);
        }
    }

    fn cond_jumps(&mut self) {
        let z = ZERO_CELL;
        let (of, cf, zf, sf, pf) = (
            Flag::Of as u8,
            Flag::Cf as u8,
            Flag::Zf as u8,
            Flag::Sf as u8,
            Flag::Pf as u8,
        );
        // JO JB JZ JBE JS JP JL JLE
        let rows: [[u8; 4]; 8] = [
            [of, z, z, z],
            [cf, z, z, z],
            [zf, z, z, z],
            [cf, zf, z, z],
            [sf, z, z, z],
            [pf, z, z, z],
            [z, z, sf, of],
            [zf, z, sf, of],
        ];
        for (i, row) in rows.iter().enumerate() {
            for (k, cell) in row.iter().enumerate() {
                self.set(TABLE_COND_JUMP_DECODE_A + k, i, *cell);
            }
        }
    }

    fn flag_bits(&mut self) {
        // CF PF AF ZF SF TF IF DF OF
        let bits = [0, 2, 4, 6, 7, 8, 9, 10, 11];
        for (i, bit) in bits.iter().enumerate() {
            self.set(TABLE_FLAGS_BITFIELDS, i, *bit);
        }
    }
}
