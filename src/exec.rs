//! Instruction semantics, one handler per canonical instruction id.
//!
//! Operands are physical addresses (`to_addr`/`from_addr`); a register
//! operand is simply an address inside the overlay, so most handlers never
//! care whether they are working on memory or on a register.

use log::warn;

use crate::{
    cpu::Cpu,
    error::Result,
    host::{rtc_record, Host},
    mem::REGS_BASE,
    regs::{Flag, CX, DI, ES, SI},
    tables::{
        Instr, ALU_ADC, ALU_ADD, ALU_AND, ALU_CMP, ALU_OR, ALU_SBB, ALU_SUB, ALU_XOR,
        FLAGS_UPDATE_AO_ARITH, FLAGS_UPDATE_SZP,
    },
};

/// Host call numbers for opcode `0F xx`.
pub const HOST_PUTCHAR: u8 = 0;
pub const HOST_RTC: u8 = 1;
pub const HOST_DISK_READ: u8 = 2;
pub const HOST_DISK_WRITE: u8 = 3;

/// Vectors raised by the core itself.
pub const INT_DIVIDE_ERROR: u8 = 0;
pub const INT_SINGLE_STEP: u8 = 1;
pub const INT_BREAKPOINT: u8 = 3;
pub const INT_OVERFLOW: u8 = 4;

#[inline(always)]
fn sext8(v: u16) -> u16 {
    v as u8 as i8 as u16
}

impl Cpu {
    #[inline(always)]
    fn mask(&self) -> u32 {
        if self.ctx.w {
            0xFFFF
        } else {
            0xFF
        }
    }

    #[inline(always)]
    fn rd(&self, addr: u32) -> u32 {
        self.mem.read(addr, self.ctx.w)
    }

    #[inline(always)]
    fn wr(&mut self, addr: u32, val: u32) {
        self.mem.write(addr, self.ctx.w, val)
    }

    fn rel_jump(&mut self, disp: u16) {
        self.ip = self.ip.wrapping_add(disp);
    }

    /// Rejects group encodings that have no 8086 meaning, before anything is
    /// written.
    pub(crate) fn check_subfunction(&self, instr: Instr) -> Result<()> {
        let ctx = &self.ctx;
        let legal = match instr {
            Instr::GroupIncDec => ctx.reg < 2 || (ctx.w && ctx.reg != 7),
            Instr::HostCall => ctx.data0 as u8 <= HOST_DISK_WRITE,
            _ => true,
        };
        if legal {
            Ok(())
        } else {
            Err(self.illegal(ctx.raw_opcode))
        }
    }

    pub(crate) fn execute(&mut self, instr: Instr) {
        use Instr::*;
        match instr {
            CondJump => self.cond_jump(),
            MovRegImm => {
                self.ctx.w = self.ctx.raw_opcode & 8 != 0;
                let addr = self.reg_addr(self.ctx.reg4bit);
                self.wr(addr, self.ctx.data0 as u32);
            }
            IncDecReg16 => {
                self.ctx.w = true;
                self.ctx.from_addr = self.reg_addr(self.ctx.reg4bit);
                self.inc_dec(self.ctx.extra == 1);
            }
            PushReg16 => self.push_reg16(self.ctx.reg4bit as usize),
            PopReg16 => {
                let v = self.pop();
                self.set_reg16(self.ctx.reg4bit as usize, v);
            }
            GroupIncDec => self.group_inc_dec(),
            GroupUnary => self.group_unary(),
            AluAccImm => {
                self.ctx.to_addr = REGS_BASE;
                self.ctx.from_addr = self.scratch_operand(self.ctx.data0);
                self.alu(self.ctx.extra);
            }
            AluRmImm => {
                let ctx = &self.ctx;
                let imm = if ctx.d || !ctx.w {
                    sext8(ctx.data2)
                } else {
                    ctx.data2
                };
                self.ctx.to_addr = self.ctx.rm_addr;
                self.ctx.from_addr = self.scratch_operand(imm);
                let func = self.ctx.reg;
                self.redecode_as(8 * func);
                self.alu(func);
            }
            AluRmReg => self.alu(self.ctx.extra),
            MovSregLeaPop => self.mov_sreg_lea_pop(),
            MovAccMoffs => {
                let addr = self.seg_addr(self.data_seg(), self.ctx.data0);
                if self.ctx.d {
                    let v = self.rd(REGS_BASE);
                    self.wr(addr, v);
                } else {
                    let v = self.rd(addr);
                    self.wr(REGS_BASE, v);
                }
            }
            ShiftRotate => self.shift_rotate(),
            LoopJcxz => self.loop_jcxz(),
            JmpCall => self.jmp_call(),
            TestRmReg => {
                let dest = self.rd(self.ctx.to_addr);
                let src = self.rd(self.ctx.from_addr);
                self.ctx.op_result = dest & src;
            }
            XchgAccReg => {
                self.ctx.w = true;
                self.ctx.to_addr = REGS_BASE;
                self.ctx.from_addr = self.reg_addr(self.ctx.reg4bit);
                self.exchange();
            }
            MovsStosLods => self.string_move(),
            CmpsScas => self.string_compare(),
            Ret => self.ret(),
            MovRmImm => {
                let addr = self.ctx.from_addr;
                self.wr(addr, self.ctx.data2 as u32);
            }
            In => {
                let port = self.io_port();
                let v = self.ports.read(port, self.ctx.w);
                self.wr(REGS_BASE, v);
            }
            Out => {
                let port = self.io_port();
                let v = self.rd(REGS_BASE);
                self.ports.write(port, self.ctx.w, v);
            }
            XchgRmReg => self.exchange(),
            PushSreg => self.push(self.reg16(self.ctx.extra as usize)),
            PopSreg => {
                let v = self.pop();
                self.set_reg16(self.ctx.extra as usize, v);
            }
            // consumed by the prefix scan
            Rep | SegOverride => {}
            DaaDas => self.daa_das(self.ctx.extra == 1),
            AaaAas => self.aaa_aas(self.ctx.extra == 1),
            Cbw => {
                let ah = if self.get_al() & 0x80 != 0 { 0xFF } else { 0 };
                self.set_ah(ah);
            }
            Cwd => {
                let dx = if self.get_ax() & 0x8000 != 0 { 0xFFFF } else { 0 };
                self.set_dx(dx);
            }
            CallFar => {
                self.push(self.get_cs());
                self.push(self.ip);
                self.set_cs(self.ctx.data2);
                self.ip = self.ctx.data0;
            }
            Pushf => self.push(self.pack_flags()),
            Popf => {
                let f = self.pop();
                self.unpack_flags(f);
            }
            Sahf => {
                let f = (self.pack_flags() & 0xFF00) | self.get_ah() as u16;
                self.unpack_flags(f);
            }
            Lahf => self.set_ah(self.pack_flags() as u8),
            LesLds => {
                let addr = self.ctx.rm_addr;
                let off = self.mem.read_u16(addr);
                let seg = self.mem.read_u16(addr.wrapping_add(2));
                self.set_reg16(self.ctx.reg as usize, off);
                self.set_reg16(self.ctx.extra as usize, seg);
            }
            Int3 => self.interrupt(INT_BREAKPOINT),
            Int => self.interrupt(self.ctx.data0 as u8),
            Into => {
                if self.flag(Flag::Of) {
                    self.interrupt(INT_OVERFLOW);
                }
            }
            Aam => {
                self.ctx.w = false;
                let base = self.ctx.data0 as u8;
                if base == 0 {
                    self.interrupt(INT_DIVIDE_ERROR);
                } else {
                    let al = self.get_al();
                    self.set_ah(al / base);
                    self.set_al(al % base);
                    self.ctx.op_result = (al % base) as u32;
                }
            }
            Aad => {
                self.ctx.w = false;
                let base = self.ctx.data0 as u8;
                let al = self.get_al().wrapping_add(self.get_ah().wrapping_mul(base));
                self.set_ax(al as u16);
                self.ctx.op_result = al as u32;
            }
            Salc => self.set_al(if self.flag(Flag::Cf) { 0xFF } else { 0 }),
            Xlat => {
                let off = self.get_bx().wrapping_add(self.get_al() as u16);
                let v = self.mem.read_u8(self.seg_addr(self.data_seg(), off));
                self.set_al(v);
            }
            Cmc => self.set_flag(Flag::Cf, !self.flag(Flag::Cf)),
            FlagOp => {
                let extra = self.ctx.extra;
                if let Some(flag) = Flag::from_ordinal(extra as usize >> 1) {
                    self.set_flag(flag, extra & 1 == 1);
                }
            }
            TestAccImm => {
                let acc = self.rd(REGS_BASE);
                self.ctx.op_result = acc & self.ctx.data0 as u32 & self.mask();
            }
            HostCall => self.host_call(),
            Hlt => self.halted = true,
            Nop => {}
        }
    }

    fn cond_jump(&mut self) {
        let raw = self.ctx.raw_opcode;
        let [a, b, c, d] = self.tables.cond_jump((raw >> 1) & 7);
        let cond = self.cell(a) != 0 || self.cell(b) != 0 || (self.cell(c) ^ self.cell(d)) != 0;
        if cond != (raw & 1 == 1) {
            self.rel_jump(sext8(self.ctx.data0));
        }
    }

    fn push_reg16(&mut self, reg: usize) {
        // 8086 pushes the already decremented SP for PUSH SP
        let sp = self.get_sp().wrapping_sub(2);
        self.set_sp(sp);
        let v = self.reg16(reg);
        self.mem.write_u16(self.stack_addr(sp), v);
    }

    /// ADD OR ADC SBB AND SUB XOR CMP MOV on `to_addr`, `from_addr`.
    fn alu(&mut self, func: u8) {
        let to = self.ctx.to_addr;
        let dest = self.rd(to);
        let src = self.rd(self.ctx.from_addr);
        let cf = self.flag(Flag::Cf) as u32;
        let result = match func {
            ALU_ADD => dest + src,
            ALU_OR => dest | src,
            ALU_ADC => dest + src + cf,
            ALU_SBB => dest.wrapping_sub(src).wrapping_sub(cf),
            ALU_AND => dest & src,
            ALU_SUB | ALU_CMP => dest.wrapping_sub(src),
            ALU_XOR => dest ^ src,
            _ => src,
        } & self.mask();
        self.ctx.op_dest = dest;
        self.ctx.op_source = src;
        self.ctx.op_result = result;

        match func {
            ALU_ADD => {
                self.set_cf(result < dest);
            }
            ALU_ADC => {
                self.set_cf((cf == 1 && result == dest) || result < dest);
                self.set_af_of_arith();
            }
            ALU_SBB => {
                self.set_cf((cf == 1 && result == dest) || result > dest);
                self.set_af_of_arith();
            }
            ALU_SUB | ALU_CMP => {
                self.set_cf(result > dest);
            }
            _ => {}
        }
        if func != ALU_CMP {
            self.wr(to, result);
        }
    }

    fn exchange(&mut self) {
        let (to, from) = (self.ctx.to_addr, self.ctx.from_addr);
        if to != from {
            let a = self.rd(to);
            let b = self.rd(from);
            self.wr(to, b);
            self.wr(from, a);
        }
    }

    /// INC/DEC on `from_addr`. CF is left alone.
    fn inc_dec(&mut self, dec: bool) {
        let addr = self.ctx.from_addr;
        let dest = self.rd(addr);
        let result = if dec {
            dest.wrapping_sub(1)
        } else {
            dest + 1
        } & self.mask();
        self.wr(addr, result);
        self.ctx.op_dest = dest;
        self.ctx.op_source = 1;
        self.ctx.op_result = result;
        self.set_af_of_arith();
        let top = 1 << (self.top_bit() - 1);
        self.set_of(if dec { dest == top } else { result == top });
        self.redecode_as(0x10);
    }

    /// FE/FF: INC, DEC, CALL, CALL far, JMP, JMP far, PUSH.
    fn group_inc_dec(&mut self) {
        let reg = self.ctx.reg;
        let addr = self.ctx.from_addr;
        match reg {
            0 | 1 => self.inc_dec(reg == 1),
            2..=5 => {
                let far = reg & 1 == 1;
                let target = self.mem.read_u16(addr);
                let seg = self.mem.read_u16(addr.wrapping_add(2));
                if reg < 4 {
                    if far {
                        self.push(self.get_cs());
                    }
                    self.push(self.ip);
                }
                if far {
                    self.set_cs(seg);
                }
                self.ip = target;
            }
            _ => {
                let v = self.mem.read_u16(addr);
                self.push(v);
            }
        }
    }

    /// F6/F7: TEST, NOT, NEG, MUL, IMUL, DIV, IDIV.
    fn group_unary(&mut self) {
        let addr = self.ctx.from_addr;
        self.ctx.to_addr = addr;
        match self.ctx.reg {
            0 | 1 => {
                self.redecode_as(0x20);
                self.ip = self.ip.wrapping_add(self.ctx.w as u16 + 1);
                self.ctx.op_result = self.rd(addr) & self.ctx.data2 as u32 & self.mask();
            }
            2 => {
                let v = !self.rd(addr) & self.mask();
                self.wr(addr, v);
            }
            3 => {
                let v = self.rd(addr);
                let result = 0u32.wrapping_sub(v) & self.mask();
                self.wr(addr, result);
                self.ctx.op_source = v;
                self.ctx.op_dest = 0;
                self.ctx.op_result = result;
                self.redecode_as(0x28);
                self.set_cf(result != 0);
            }
            4 => self.multiply(false),
            5 => self.multiply(true),
            6 => self.divide(false),
            _ => self.divide(true),
        }
    }

    fn multiply(&mut self, signed: bool) {
        self.redecode_as(0x10);
        let src = self.rd(self.ctx.rm_addr);
        let (product, wide) = if self.ctx.w {
            let acc = self.get_ax();
            if signed {
                let p = (acc as i16 as i32) * (src as u16 as i16 as i32);
                (p as u32, p != p as i16 as i32)
            } else {
                let p = acc as u32 * src;
                (p, p >> 16 != 0)
            }
        } else {
            let acc = self.get_al();
            if signed {
                let p = (acc as i8 as i32) * (src as u8 as i8 as i32);
                (p as u32 & 0xFFFF, p != p as i8 as i32)
            } else {
                let p = acc as u32 * src;
                (p, p >> 8 != 0)
            }
        };
        if self.ctx.w {
            self.set_dx((product >> 16) as u16);
        }
        self.set_ax(product as u16);
        self.ctx.op_result = product;
        self.set_cf(wide);
        self.set_of(wide);
    }

    /// DIV/IDIV. A zero divisor or a quotient that does not fit raises INT 0
    /// with the next instruction as return address.
    fn divide(&mut self, signed: bool) {
        let divisor = self.rd(self.ctx.rm_addr);
        let word = self.ctx.w;
        let dividend = if word {
            (self.get_dx() as u32) << 16 | self.get_ax() as u32
        } else {
            self.get_ax() as u32
        };
        let quot_rem = if divisor == 0 {
            None
        } else if signed {
            let (n, d) = if word {
                (dividend as i32 as i64, divisor as u16 as i16 as i64)
            } else {
                (dividend as u16 as i16 as i64, divisor as u8 as i8 as i64)
            };
            let (q, r) = (n / d, n % d);
            // the most negative quotient faults on the 8086
            let fits = if word {
                (-0x7FFF..=0x7FFF).contains(&q)
            } else {
                (-0x7F..=0x7F).contains(&q)
            };
            fits.then_some((q as u32, r as u32))
        } else {
            let (q, r) = (dividend / divisor, dividend % divisor);
            (q <= self.mask()).then_some((q, r))
        };

        match quot_rem {
            Some((q, r)) if word => {
                self.set_ax(q as u16);
                self.set_dx(r as u16);
            }
            Some((q, r)) => {
                self.set_al(q as u8);
                self.set_ah(r as u8);
            }
            None => self.interrupt(INT_DIVIDE_ERROR),
        }
    }

    /// ROL ROR RCL RCR SHL SHR SAL SAR, by 1, CL or an immediate byte.
    fn shift_rotate(&mut self) {
        let addr = self.ctx.rm_addr;
        let count = if self.ctx.extra == 1 {
            self.ctx.data2 as u8
        } else if self.ctx.d {
            self.get_cl()
        } else {
            1
        };
        let original = self.rd(addr);
        if count == 0 {
            return;
        }

        let op = self.ctx.reg;
        let mask = self.mask();
        let top = 1u32 << (self.top_bit() - 1);
        let mut val = original;
        let mut cf = self.flag(Flag::Cf);
        for _ in 0..count {
            let (out_low, out_high) = (val & 1 != 0, val & top != 0);
            val = match op {
                0 => ((val << 1) | out_high as u32) & mask,
                1 => (val >> 1) | if out_low { top } else { 0 },
                2 => ((val << 1) | cf as u32) & mask,
                3 => (val >> 1) | if cf { top } else { 0 },
                5 => val >> 1,
                7 => (val >> 1) | (val & top),
                _ => (val << 1) & mask,
            };
            cf = if op & 1 == 1 { out_low } else { out_high };
        }
        self.wr(addr, val);
        self.ctx.op_dest = original;
        self.ctx.op_result = val;
        self.set_cf(cf);

        let sign = val & top != 0;
        let next = val & (top >> 1) != 0;
        let of = match op {
            0 | 2 | 4 | 6 => sign != cf,
            1 | 3 => sign != next,
            5 => original & top != 0,
            _ => false,
        };
        self.set_of(of);
        if op > 3 {
            self.redecode_as(0x10);
        }
    }

    fn loop_jcxz(&mut self) {
        let jump = if self.ctx.reg4bit == 3 {
            self.get_cx() == 0
        } else {
            let cx = self.get_cx().wrapping_sub(1);
            self.set_cx(cx);
            cx != 0
                && match self.ctx.reg4bit {
                    0 => !self.flag(Flag::Zf),
                    1 => self.flag(Flag::Zf),
                    _ => true,
                }
        };
        if jump {
            self.rel_jump(sext8(self.ctx.data0));
        }
    }

    /// CALL rel16, JMP rel16, JMP ptr16:16, JMP rel8.
    fn jmp_call(&mut self) {
        let data0 = self.ctx.data0;
        match self.ctx.extra {
            0 => {
                self.push(self.ip);
                self.rel_jump(data0);
            }
            1 => self.rel_jump(data0),
            2 => {
                self.set_cs(self.ctx.data2);
                self.ip = data0;
            }
            _ => self.rel_jump(sext8(data0)),
        }
    }

    /// RET [imm16], RETF [imm16], IRET.
    fn ret(&mut self) {
        self.ip = self.pop();
        if self.ctx.extra >= 1 {
            let cs = self.pop();
            self.set_cs(cs);
        }
        if self.ctx.extra == 2 {
            let f = self.pop();
            self.unpack_flags(f);
        } else if !self.ctx.w {
            let sp = self.get_sp().wrapping_add(self.ctx.data0);
            self.set_sp(sp);
        }
    }

    fn mov_sreg_lea_pop(&mut self) {
        match (self.ctx.w, self.ctx.d) {
            (false, _) => {
                // MOV r/m16, sreg / MOV sreg, r/m16
                self.ctx.w = true;
                self.ctx.reg = 8 + (self.ctx.reg & 3);
                self.decode_rm_reg();
                let v = self.rd(self.ctx.from_addr);
                self.wr(self.ctx.to_addr, v);
            }
            (true, false) => {
                let off = self.ctx.ea_offset;
                self.set_reg16(self.ctx.reg as usize, off);
            }
            (true, true) => {
                let addr = self.ctx.rm_addr;
                let v = self.pop();
                self.wr(addr, v as u32);
            }
        }
    }

    fn io_port(&self) -> u16 {
        if self.ctx.extra == 1 {
            self.get_dx()
        } else {
            self.ctx.data0 & 0xFF
        }
    }

    #[inline(always)]
    fn string_step(&self) -> u16 {
        let size = self.ctx.w as u16 + 1;
        if self.flag(Flag::Df) {
            size.wrapping_neg()
        } else {
            size
        }
    }

    fn advance(&mut self, reg: usize) {
        let v = self.reg16(reg).wrapping_add(self.string_step());
        self.set_reg16(reg, v);
    }

    /// MOVS (extra 0), STOS (1), LODS (2), repeated CX times under REP.
    fn string_move(&mut self) {
        let extra = self.ctx.extra;
        let src_seg = self.data_seg();
        let rep = self.ctx.rep.is_some();
        let mut remaining = if rep { self.get_cx() } else { 1 };
        while remaining > 0 {
            let to = if extra < 2 {
                self.seg_addr(ES, self.get_di())
            } else {
                REGS_BASE
            };
            let from = if extra & 1 == 1 {
                REGS_BASE
            } else {
                self.seg_addr(src_seg, self.get_si())
            };
            let v = self.rd(from);
            self.wr(to, v);
            if extra & 1 == 0 {
                self.advance(SI);
            }
            if extra & 2 == 0 {
                self.advance(DI);
            }
            remaining -= 1;
            if rep {
                self.set_cx(remaining);
            }
        }
    }

    /// CMPS (extra 0), SCAS (1). Under REPE/REPNE runs while CX is nonzero
    /// and ZF matches the prefix.
    fn string_compare(&mut self) {
        let scas = self.ctx.extra == 1;
        let src_seg = self.data_seg();
        let rep = self.ctx.rep;
        if rep.is_some() && self.get_cx() == 0 {
            return;
        }
        loop {
            let dest_addr = if scas {
                REGS_BASE
            } else {
                self.seg_addr(src_seg, self.get_si())
            };
            let dest = self.rd(dest_addr);
            let src = self.rd(self.seg_addr(ES, self.get_di()));
            let result = dest.wrapping_sub(src) & self.mask();
            self.ctx.op_dest = dest;
            self.ctx.op_source = src;
            self.ctx.op_result = result;
            if !scas {
                self.advance(SI);
            }
            self.advance(DI);

            let Some(repe) = rep else { break };
            let cx = self.reg16(CX).wrapping_sub(1);
            self.set_reg16(CX, cx);
            if cx == 0 || (result == 0) != repe {
                break;
            }
        }
        self.ctx.flags_policy = FLAGS_UPDATE_SZP | FLAGS_UPDATE_AO_ARITH;
        let (dest, result) = (self.ctx.op_dest, self.ctx.op_result);
        self.set_cf(result > dest);
    }

    fn daa_das(&mut self, das: bool) {
        self.ctx.w = false;
        let old_al = self.get_al();
        let old_cf = self.flag(Flag::Cf);
        let mut al = old_al;
        let mut cf = false;
        if old_al & 0x0F > 9 || self.flag(Flag::Af) {
            let (v, carry) = if das {
                al.overflowing_sub(6)
            } else {
                al.overflowing_add(6)
            };
            al = v;
            cf = old_cf || carry;
            self.set_af(true);
        } else {
            self.set_af(false);
        }
        if old_al > 0x99 || old_cf {
            al = if das {
                al.wrapping_sub(0x60)
            } else {
                al.wrapping_add(0x60)
            };
            cf = true;
        }
        self.set_cf(cf);
        self.set_al(al);
        self.ctx.op_result = al as u32;
    }

    fn aaa_aas(&mut self, aas: bool) {
        let adjust = self.get_al() & 0x0F > 9 || self.flag(Flag::Af);
        if adjust {
            let ax = if aas {
                self.get_ax().wrapping_sub(0x106)
            } else {
                self.get_ax().wrapping_add(0x106)
            };
            self.set_ax(ax);
        }
        self.set_af(adjust);
        self.set_cf(adjust);
        let al = self.get_al() & 0x0F;
        self.set_al(al);
        self.ctx.op_result = al as u32;
    }

    fn host_call(&mut self) {
        let es_bx = self.seg_addr(ES, self.get_bx());
        match self.ctx.data0 as u8 {
            HOST_PUTCHAR => {
                let al = self.get_al();
                self.host.putchar(al);
            }
            HOST_RTC => {
                let now = self.host.now();
                self.mem.load(es_bx, &rtc_record(&now));
            }
            op => {
                let slot = self.get_dl();
                let offset = (self.get_bp() as u64) << 9;
                let len = self.get_ax() as usize;
                let transferred = if op == HOST_DISK_READ {
                    let mut buf = vec![0u8; len];
                    self.host.disk_read(slot, offset, &mut buf).map(|n| {
                        self.mem.load(es_bx, &buf[..n]);
                        n
                    })
                } else {
                    let data = self.mem.slice(es_bx, len);
                    self.host.disk_write(slot, offset, &data)
                };
                let al = match transferred {
                    Ok(n) => n as u8,
                    Err(e) => {
                        warn!("disk {op:#x} on slot {slot} at {offset:#x} failed: {e}");
                        0
                    }
                };
                self.set_al(al);
            }
        }
    }
}
