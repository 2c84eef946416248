//! FLAGS word packing and the carry/aux/overflow arithmetic.
//!
//! Flags live unpacked, one byte cell each, in the register overlay. They are
//! folded into a FLAGS word only for PUSHF/POPF, SAHF/LAHF and interrupt
//! entry.

use crate::{
    cpu::Cpu,
    regs::Flag,
    tables::{FLAGS_UPDATE_AO_ARITH, FLAGS_UPDATE_OC_LOGIC, FLAGS_UPDATE_SZP},
};

/// Reserved FLAGS bits as an 8086 reports them.
pub const FLAGS_RESERVED: u16 = 0xF002;

impl Cpu {
    /// Operand width in bits, taken from the decoded `w` bit.
    #[inline(always)]
    pub fn top_bit(&self) -> u32 {
        8 * (self.ctx.w as u32 + 1)
    }

    /// Sign bit of `val` at the current operand width, as 0/1.
    #[inline(always)]
    pub(crate) fn sign_of(&self, val: u32) -> u32 {
        (val >> (self.top_bit() - 1)) & 1
    }

    pub fn set_cf(&mut self, cond: bool) -> bool {
        self.set_flag(Flag::Cf, cond);
        cond
    }

    pub fn set_af(&mut self, cond: bool) -> bool {
        self.set_flag(Flag::Af, cond);
        cond
    }

    pub fn set_of(&mut self, cond: bool) -> bool {
        self.set_flag(Flag::Of, cond);
        cond
    }

    /// AF and OF from the working operands. `op_source` is left holding the
    /// xor fold of source, destination and result.
    pub fn set_af_of_arith(&mut self) {
        let ctx = &mut self.ctx;
        ctx.op_source ^= ctx.op_dest ^ ctx.op_result;
        let folded = ctx.op_source;
        let unchanged = ctx.op_result == ctx.op_dest;
        self.set_af(folded & 0x10 != 0);
        if unchanged {
            self.set_of(false);
        } else {
            let cf = self.cell(Flag::Cf as u8) as u32;
            let top = (folded >> (self.top_bit() - 1)) & 1;
            self.set_of(cf ^ top == 1);
        }
    }

    pub fn pack_flags(&self) -> u16 {
        let mut word = FLAGS_RESERVED;
        for (i, flag) in Flag::ALL.iter().enumerate().rev() {
            word |= (self.cell(*flag as u8) as u16 & 1) << self.tables.flag_bit(i);
        }
        word
    }

    pub fn unpack_flags(&mut self, word: u16) {
        for (i, flag) in Flag::ALL.iter().enumerate().rev() {
            let bit = (word >> self.tables.flag_bit(i)) & 1;
            self.set_flag(*flag, bit != 0);
        }
    }

    /// Applies the decoded flags-update policy to `op_result`.
    pub fn update_flags(&mut self) {
        let policy = self.ctx.flags_policy;
        if policy & FLAGS_UPDATE_SZP == 0 {
            return;
        }
        let result = self.ctx.op_result;
        let sf = self.sign_of(result) != 0;
        let pf = self.tables.parity(result as u8) != 0;
        self.set_flag(Flag::Sf, sf);
        self.set_flag(Flag::Zf, result == 0);
        self.set_flag(Flag::Pf, pf);
        if policy & FLAGS_UPDATE_AO_ARITH != 0 {
            self.set_af_of_arith();
        }
        if policy & FLAGS_UPDATE_OC_LOGIC != 0 {
            self.set_cf(false);
            self.set_of(false);
        }
    }
}
