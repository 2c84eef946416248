use log::trace;

use crate::{
    error::{EmuError, Result},
    exec::INT_SINGLE_STEP,
    host::{Host, StdHost},
    mem::{linear, Mem, ModRm, OpcodeByte, Ports, REGS_BASE},
    regs::{reg_offset, Flag, Regs16, Regs8, DS, SCRATCH},
    tables::{Instr, OpcodeTables},
};

/// Working state of the instruction being executed. Rebuilt from scratch
/// on every fetch.
#[derive(Debug, Default, Clone)]
pub struct Decoded {
    pub raw_opcode: u8,
    pub opcode_id: u8,
    pub extra: u8,
    pub flags_policy: u8,
    pub w: bool,
    pub d: bool,
    pub reg4bit: u8,
    pub has_modrm: bool,
    pub modd: u8,
    pub reg: u8,
    pub rm: u8,
    pub data0: u16,
    pub data1: u16,
    pub data2: u16,
    /// Physical address of the r/m operand (overlay address for `mod == 3`).
    pub rm_addr: u32,
    /// Segment offset of a memory r/m operand, before the segment is applied.
    pub ea_offset: u16,
    pub to_addr: u32,
    pub from_addr: u32,
    pub op_source: u32,
    pub op_dest: u32,
    pub op_result: u32,
    pub seg_override: Option<u8>,
    /// `Some(true)` for REPE/REPZ, `Some(false)` for REPNE/REPNZ.
    pub rep: Option<bool>,
    pub next_ip: u16,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    Executed,
    /// Parked by HLT, waiting for an interrupt.
    Halted,
    /// CS:IP reached 0000:0000.
    Stopped,
}

pub struct Cpu {
    pub mem: Mem,
    pub ports: Ports,
    pub tables: OpcodeTables,
    pub regs8: Regs8,
    pub regs16: Regs16,
    pub ip: u16,
    pub ctx: Decoded,
    pub inst_counter: u64,
    pub halted: bool,
    pub(crate) host: Box<dyn Host>,
    pending_irq: Option<u8>,
    prog_end: Option<u16>,
}

impl Cpu {
    pub fn new(tables: OpcodeTables) -> Self {
        Self::with_mem(tables, Mem::new())
    }

    pub fn with_memory_size(tables: OpcodeTables, size: usize) -> Result<Self> {
        Ok(Self::with_mem(tables, Mem::with_size(size)?))
    }

    fn with_mem(tables: OpcodeTables, mem: Mem) -> Self {
        let base = REGS_BASE as usize;
        Self {
            mem,
            ports: Ports::new(),
            tables,
            regs8: Regs8::new(base),
            regs16: Regs16::new(base),
            ip: 0,
            ctx: Decoded::default(),
            inst_counter: 0,
            halted: false,
            host: Box::new(StdHost::default()),
            pending_irq: None,
            prog_end: None,
        }
    }

    pub fn set_host(&mut self, host: Box<dyn Host>) {
        self.host = host;
    }

    /// Bare-program layout: code at 1000:0000, data and extra at 2000,
    /// stack at 3000:FFFE.
    pub fn test_mode(&mut self) {
        self.set_cs(0x1000);
        self.set_ds(0x2000);
        self.set_es(0x2000);
        self.set_ss(0x3000);
        self.set_sp(0xFFFE);
        self.ip = 0;
    }

    /// Loads `code` at CS:IP; [`Cpu::fire`] runs until IP walks past it.
    pub fn load_code_vec(&mut self, code: &[u8]) {
        let at = self.code_addr(self.ip);
        self.mem.load(at, code);
        self.prog_end = Some(self.ip.wrapping_add(code.len() as u16));
    }

    /// Runs until the loaded program ends, the engine stops, or it halts with
    /// nothing left to wake it.
    pub fn fire(&mut self) -> Result<()> {
        let code_seg = self.get_cs();
        loop {
            if let Some(end) = self.prog_end {
                if self.get_cs() == code_seg && self.ip >= end {
                    return Ok(());
                }
            }
            match self.step()? {
                StepOutcome::Executed => {}
                StepOutcome::Stopped => return Ok(()),
                StepOutcome::Halted => {
                    if self.pending_irq.is_none() || !self.flag(Flag::If) {
                        return Ok(());
                    }
                }
            }
        }
    }

    pub fn get_ip(&self) -> u16 {
        self.ip
    }

    pub fn set_ip(&mut self, ip: u16) {
        self.ip = ip;
    }

    pub fn code_addr(&self, offset: u16) -> u32 {
        linear(self.get_cs(), offset)
    }

    pub fn stack_addr(&self, offset: u16) -> u32 {
        linear(self.get_ss(), offset)
    }

    /// Physical address of `offset` in segment register `seg`.
    pub fn seg_addr(&self, seg: usize, offset: u16) -> u32 {
        linear(self.reg16(seg), offset)
    }

    /// Segment for DS-relative operands, honouring an override prefix.
    pub(crate) fn data_seg(&self) -> usize {
        self.ctx.seg_override.map_or(DS, |s| s as usize)
    }

    pub(crate) fn push(&mut self, val: u16) {
        let sp = self.get_sp().wrapping_sub(2);
        self.set_sp(sp);
        self.mem.write_u16(self.stack_addr(sp), val);
    }

    pub(crate) fn pop(&mut self) -> u16 {
        let sp = self.get_sp();
        let v = self.mem.read_u16(self.stack_addr(sp));
        self.set_sp(sp.wrapping_add(2));
        v
    }

    /// Queues a hardware interrupt, delivered at the next instruction
    /// boundary where IF is set and TF is clear.
    pub fn request_interrupt(&mut self, vector: u8) {
        self.pending_irq = Some(vector);
    }

    pub fn pending_interrupt(&self) -> Option<u8> {
        self.pending_irq
    }

    /// Enters interrupt `vector`: pushes FLAGS, CS and IP, clears IF and TF
    /// and jumps through the vector table. Any interrupt entry ends a HLT.
    pub fn interrupt(&mut self, vector: u8) {
        trace!("interrupt {vector:#04x} from {:04x}:{:04x}", self.get_cs(), self.ip);
        self.ctx.flags_policy = 0;
        let flags = self.pack_flags();
        self.push(flags);
        self.push(self.get_cs());
        self.push(self.ip);
        let at = 4 * vector as u32;
        self.set_cs(self.mem.read_u16(at + 2));
        self.ip = self.mem.read_u16(at);
        self.set_flag(Flag::Tf, false);
        self.set_flag(Flag::If, false);
        self.halted = false;
    }

    fn deliver_pending(&mut self) -> bool {
        match self.pending_irq {
            Some(vector) if self.flag(Flag::If) && !self.flag(Flag::Tf) => {
                self.pending_irq = None;
                self.interrupt(vector);
                true
            }
            _ => false,
        }
    }

    /// Executes one instruction, prefixes included.
    pub fn step(&mut self) -> Result<StepOutcome> {
        if self.get_cs() == 0 && self.ip == 0 {
            return Ok(StepOutcome::Stopped);
        }
        if self.halted {
            if !self.deliver_pending() {
                return Ok(StepOutcome::Halted);
            }
            return Ok(StepOutcome::Executed);
        }

        let trap = self.flag(Flag::Tf);
        let instr = self.decode()?;
        trace!(
            "{:04x}:{:04x} {:02x} {:?}",
            self.get_cs(),
            self.ip,
            self.ctx.raw_opcode,
            instr
        );
        self.check_subfunction(instr)?;

        self.ip = self.ctx.next_ip;
        self.execute(instr);
        self.update_flags();
        self.inst_counter += 1;

        if trap {
            self.interrupt(INT_SINGLE_STEP);
        }
        self.deliver_pending();

        Ok(if self.halted {
            StepOutcome::Halted
        } else {
            StepOutcome::Executed
        })
    }

    /// Prefix scan, opcode translation and operand decode. Touches nothing
    /// but the decode context, so an illegal opcode leaves the machine as it
    /// was.
    fn decode(&mut self) -> Result<Instr> {
        let mut ctx = Decoded::default();
        let mut cursor = self.ip;
        let (raw, instr) = loop {
            let raw = self.mem.read_u8(self.code_addr(cursor));
            let id = self.tables.xlat_opcode(raw);
            let instr = Instr::try_from(id).map_err(|_| self.illegal(raw))?;
            match instr {
                Instr::SegOverride => ctx.seg_override = Some(self.tables.subfunction(raw)),
                Instr::Rep => ctx.rep = Some(self.tables.subfunction(raw) == 1),
                _ => break (raw, instr),
            }
            cursor = cursor.wrapping_add(1);
            if cursor == self.ip {
                // a whole segment of prefixes
                return Err(self.illegal(raw));
            }
        };

        let ob = OpcodeByte::new(raw);
        ctx.raw_opcode = raw;
        ctx.opcode_id = instr as u8;
        ctx.extra = self.tables.subfunction(raw);
        ctx.flags_policy = self.tables.std_flags(raw);
        ctx.reg4bit = ob.reg4bit();
        ctx.w = ob.word();
        ctx.d = ob.reg_is_dest();

        let word_at = |n: u16| self.mem.read_u16(self.code_addr(cursor.wrapping_add(n)));
        ctx.data0 = word_at(1);
        ctx.data1 = word_at(2);
        ctx.data2 = word_at(3);

        let mut disp_len = 0;
        if self.tables.mod_size(raw) != 0 {
            let modrm = ModRm::new(ctx.data0 as u8);
            ctx.has_modrm = true;
            ctx.modd = modrm.modd();
            ctx.reg = modrm.reg();
            ctx.rm = modrm.rm();
            disp_len = modrm.disp_len();
            match (ctx.modd, disp_len) {
                (1, _) => ctx.data1 = ctx.data1 as u8 as i8 as u16,
                (_, 2) => ctx.data2 = word_at(4),
                _ => ctx.data2 = ctx.data1,
            }
        }

        let len = self.tables.base_size(raw) as u16
            + self.tables.w_size(raw) as u16 * (ctx.w as u16 + 1)
            + self.tables.mod_size(raw) as u16 * disp_len as u16;
        ctx.next_ip = cursor.wrapping_add(len);

        self.ctx = ctx;
        if self.ctx.has_modrm {
            self.decode_rm_reg();
        }
        Ok(instr)
    }

    pub(crate) fn illegal(&self, opcode: u8) -> EmuError {
        EmuError::IllegalOpcode {
            cs: self.get_cs(),
            ip: self.ip,
            opcode,
        }
    }

    /// Overlay address of a register as encoded in an instruction, at the
    /// current operand width.
    #[inline(always)]
    pub(crate) fn reg_addr(&self, reg: u8) -> u32 {
        REGS_BASE + reg_offset(reg, self.ctx.w)
    }

    /// Resolves the r/m and reg operands into `to_addr`/`from_addr`, swapped
    /// when the direction bit is set.
    pub(crate) fn decode_rm_reg(&mut self) {
        let Decoded {
            modd,
            rm,
            reg,
            data1,
            seg_override,
            d,
            ..
        } = self.ctx;
        self.ctx.rm_addr = if modd < 3 {
            let form = self.tables.rm_form(modd == 0, rm);
            let seg = seg_override.unwrap_or(form.seg) as usize;
            let offset = self
                .reg16(form.base as usize)
                .wrapping_add(self.reg16(form.index as usize))
                .wrapping_add((form.disp_mult as u16).wrapping_mul(data1));
            self.ctx.ea_offset = offset;
            self.seg_addr(seg, offset)
        } else {
            self.reg_addr(rm)
        };
        self.ctx.to_addr = self.ctx.rm_addr;
        self.ctx.from_addr = self.reg_addr(reg);
        if d {
            std::mem::swap(&mut self.ctx.to_addr, &mut self.ctx.from_addr);
        }
    }

    /// Re-reads the flags policy and sub-function from another raw opcode,
    /// so one handler can borrow the flag behaviour of a sibling encoding.
    pub(crate) fn redecode_as(&mut self, raw: u8) {
        self.ctx.flags_policy = self.tables.std_flags(raw);
        self.ctx.extra = self.tables.subfunction(raw);
    }

    /// Stores an immediate in the SCRATCH register and returns its address,
    /// so it can be used like any register source operand.
    pub(crate) fn scratch_operand(&mut self, val: u16) -> u32 {
        self.set_reg16(SCRATCH, val);
        REGS_BASE + 2 * SCRATCH as u32
    }
}
