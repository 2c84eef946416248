use std::{cell::RefCell, io, io::Write, rc::Rc};

use chrono::{NaiveDate, NaiveDateTime};

use crate::{
    cpu::{Cpu, StepOutcome},
    error::EmuError,
    host::{DiskSet, Host, StdHost, SLOT_FLOPPY},
    mem::linear,
    regs::Flag,
    tables::OpcodeTables,
};

fn cpu() -> Cpu {
    let mut cpu = Cpu::new(OpcodeTables::standard());
    cpu.test_mode();
    cpu
}

/// Points interrupt `vector` at `seg:off` and loads `handler` there.
fn install_handler(cpu: &mut Cpu, vector: u8, seg: u16, off: u16, handler: &[u8]) {
    let at = 4 * vector as u32;
    cpu.mem.write_u16(at, off);
    cpu.mem.write_u16(at + 2, seg);
    cpu.mem.load(linear(seg, off), handler);
}

#[test]
fn flow1() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        184, 0, 0, 185, 1, 0, 57, 200, 119, 2, 235, 3, 184, 69, 0,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 0);
}

#[test]
fn loopy() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        185, 20, 0, 49, 192, 137, 4, 64, 255, 4, 226, 251, 3, 4,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 40);
    assert_eq!(cpu.get_cx(), 0);
}

#[test]
fn flow0() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        184, 1, 0, 185, 0, 0, 57, 200, 119, 2, 235, 3, 184, 69, 0,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 69);
}

#[test]
fn stack() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        184, 70, 0, 185, 45, 0, 186, 89, 0, 187, 132, 3, 83, 82, 81, 80, 91, 90, 89, 88,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 900);
    assert_eq!(cpu.get_cx(), 89);
    assert_eq!(cpu.get_dx(), 45);
    assert_eq!(cpu.get_bx(), 70);
    assert_eq!(cpu.get_sp(), 0xFFFE);
}

#[test]
fn memstuff() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[198, 4, 0, 198, 68, 1, 1, 139, 4]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 256);
}

#[test]
fn addmem16() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[199, 4, 0, 0, 131, 192, 70, 1, 4, 139, 4]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 70);
}

#[test]
fn subreg8() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        128, 236, 67, 40, 224, 40, 197, 40, 233, 40, 207, 40, 251, 40, 222, 40, 242,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_dl(), 67);
}

#[test]
fn addreg8() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        128, 196, 67, 0, 224, 0, 197, 0, 233, 0, 207, 0, 251, 0, 222, 0, 242,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_dl(), 67);
}

#[test]
fn addreg16() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[131, 192, 67, 1, 200, 1, 195, 1, 218]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_dx(), 67);
}

#[test]
fn addregimm16() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        131, 192, 67, 129, 193, 207, 7, 131, 195, 120, 129, 194, 0, 3,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 67);
    assert_eq!(cpu.get_cx(), 1999);
    assert_eq!(cpu.get_bx(), 120);
    assert_eq!(cpu.get_dx(), 768);
}

#[test]
fn addregimm8() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        4, 1, 128, 196, 1, 128, 193, 1, 128, 197, 1, 128, 195, 1, 128, 199, 1, 128, 194, 1, 128,
        198, 1,
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 0x101);
    assert_eq!(cpu.get_bx(), 0x101);
    assert_eq!(cpu.get_cx(), 0x101);
    assert_eq!(cpu.get_dx(), 0x101);
}

#[test]
fn test_mode() {
    let mut cpu = cpu();
    // mov cx, ss ; mov ax, sp
    cpu.load_code_vec(&[140, 209, 137, 224]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_cx(), 0x3000);
    assert_eq!(cpu.get_ax(), 0xFFFE);
    assert_eq!(cpu.inst_counter, 2);
}

#[test]
fn signed_and_unsigned_jumps() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        0xB8, 0xFB, 0xFF, // mov ax, -5
        0x3D, 0x03, 0x00, // cmp ax, 3
        0x7C, 0x03, // jl +3
        0xBB, 0x01, 0x00, // mov bx, 1
        0x76, 0x03, // jbe +3
        0xB9, 0x02, 0x00, // mov cx, 2
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_bx(), 0);
    // 0xFFFB is above 3 unsigned
    assert_eq!(cpu.get_cx(), 2);
}

#[test]
fn segment_override() {
    let mut cpu = cpu();
    cpu.set_es(0x4000);
    cpu.set_bx(8);
    cpu.mem.write_u16(linear(0x4000, 8), 0x1234);
    cpu.mem.write_u16(linear(0x2000, 8), 0x5678);
    // mov ax, es:[bx] ; mov dx, [bx] ; mov cx, cs:[0]
    cpu.load_code_vec(&[0x26, 0x8B, 0x07, 0x8B, 0x17, 0x2E, 0x8B, 0x0E, 0x00, 0x00]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 0x1234);
    assert_eq!(cpu.get_dx(), 0x5678);
    assert_eq!(cpu.get_cx(), 0x8B26);
}

#[test]
fn accumulator_moffs() {
    let mut cpu = cpu();
    cpu.mem.write_u16(linear(0x2000, 0x1234), 0xCAFE);
    // mov ax, [0x1234] ; mov [0x10], ax
    cpu.load_code_vec(&[0xA1, 0x34, 0x12, 0xA3, 0x10, 0x00]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 0xCAFE);
    assert_eq!(cpu.mem.read_u16(linear(0x2000, 0x10)), 0xCAFE);
}

#[test]
fn repe_cmpsb() {
    let mut cpu = cpu();
    cpu.mem.load(linear(0x2000, 0x100), b"abcd");
    cpu.mem.load(linear(0x2000, 0x200), b"abxd");
    cpu.set_si(0x100);
    cpu.set_di(0x200);
    cpu.set_cx(10);
    cpu.load_code_vec(&[0xF3, 0xA6]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_cx(), 7);
    assert_eq!(cpu.get_si(), 0x103);
    assert_eq!(cpu.get_di(), 0x203);
    assert!(!cpu.flag(Flag::Zf));
    // 'c' < 'x'
    assert!(cpu.flag(Flag::Cf));

    let mut cpu = self::cpu();
    cpu.mem.load(linear(0x2000, 0x100), b"abc");
    cpu.mem.load(linear(0x2000, 0x200), b"abc");
    cpu.set_si(0x100);
    cpu.set_di(0x200);
    cpu.set_cx(3);
    cpu.load_code_vec(&[0xF3, 0xA6]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_cx(), 0);
    assert_eq!(cpu.get_si(), 0x103);
    assert!(cpu.flag(Flag::Zf));
    assert_eq!(cpu.inst_counter, 1);
}

#[test]
fn repne_scasb_finds_byte() {
    let mut cpu = cpu();
    cpu.mem.load(linear(0x2000, 0x40), b"hello\0");
    cpu.set_di(0x40);
    cpu.set_cx(0xFFFF);
    // repne scasb with al = 0
    cpu.load_code_vec(&[0xF2, 0xAE]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_di(), 0x46);
    assert_eq!(cpu.get_cx(), 0xFFFF - 6);
    assert!(cpu.flag(Flag::Zf));
}

#[test]
fn rep_movsb_and_stosw() {
    let mut cpu = cpu();
    cpu.mem.load(linear(0x2000, 0x100), b"hello");
    cpu.set_si(0x100);
    cpu.set_di(0x300);
    cpu.set_cx(5);
    cpu.load_code_vec(&[0xF3, 0xA4]);
    cpu.fire().unwrap();
    assert_eq!(cpu.mem.slice(linear(0x2000, 0x300), 5), b"hello");
    assert_eq!(cpu.get_cx(), 0);
    assert_eq!((cpu.get_si(), cpu.get_di()), (0x105, 0x305));

    let mut cpu = self::cpu();
    cpu.set_ax(0xABCD);
    cpu.set_di(0x400);
    cpu.set_cx(3);
    cpu.load_code_vec(&[0xF3, 0xAB]);
    cpu.fire().unwrap();
    for k in 0..3 {
        assert_eq!(cpu.mem.read_u16(linear(0x2000, 0x400 + 2 * k)), 0xABCD);
    }
    assert_eq!(cpu.get_di(), 0x406);
}

#[test]
fn rep_with_zero_count_does_nothing() {
    let mut cpu = cpu();
    cpu.mem.load(linear(0x2000, 0x100), b"x");
    cpu.set_si(0x100);
    cpu.set_di(0x300);
    cpu.load_code_vec(&[0xF3, 0xA4]);
    cpu.fire().unwrap();
    assert_eq!(cpu.mem.read_u8(linear(0x2000, 0x300)), 0);
    assert_eq!(cpu.get_si(), 0x100);
}

#[test]
fn lodsb_backwards() {
    let mut cpu = cpu();
    cpu.mem.load(linear(0x2000, 0x10), &[1, 2, 3]);
    cpu.set_si(0x12);
    // std ; lodsb ; lodsb
    cpu.load_code_vec(&[0xFD, 0xAC, 0xAC]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_al(), 2);
    assert_eq!(cpu.get_si(), 0x10);
}

#[test]
fn illegal_opcode_leaves_state_untouched() {
    let mut cpu = cpu();
    // mov ax, 0x1234 ; (0x60)
    cpu.load_code_vec(&[0xB8, 0x34, 0x12, 0x60]);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Executed);
    let regs = cpu.overlay_snapshot();
    let counter = cpu.inst_counter;
    match cpu.step() {
        Err(EmuError::IllegalOpcode { cs, ip, opcode }) => {
            assert_eq!((cs, ip, opcode), (0x1000, 3, 0x60));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert_eq!(cpu.overlay_snapshot(), regs);
    assert_eq!(cpu.get_ip(), 3);
    assert_eq!(cpu.inst_counter, counter);
    assert!(cpu.fire().is_err());
}

#[test]
fn illegal_group_encoding() {
    let mut cpu = cpu();
    // FE /7 has no meaning
    cpu.load_code_vec(&[0xFE, 0xF8]);
    assert!(matches!(
        cpu.fire(),
        Err(EmuError::IllegalOpcode { opcode: 0xFE, .. })
    ));
    assert_eq!(cpu.get_ip(), 0);
}

#[test]
fn divide_error_vectors_and_resumes() {
    let mut cpu = cpu();
    // mov bx, 0x77 ; iret
    install_handler(&mut cpu, 0, 0x5000, 0, &[0xBB, 0x77, 0x00, 0xCF]);
    cpu.load_code_vec(&[
        0xB8, 0x0A, 0x00, // mov ax, 10
        0xB1, 0x00, // mov cl, 0
        0xF6, 0xF1, // div cl
        0xBA, 0x01, 0x00, // mov dx, 1
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_bx(), 0x77);
    assert_eq!(cpu.get_dx(), 1);
    assert_eq!(cpu.get_ax(), 10);
    assert_eq!(cpu.get_sp(), 0xFFFE);
    assert_eq!(cpu.get_cs(), 0x1000);
}

#[test]
fn int_and_iret() {
    let mut cpu = cpu();
    cpu.set_flag(Flag::If, true);
    // mov al, 0x42 ; pushf ; pop cx ; iret
    install_handler(&mut cpu, 0x21, 0x5000, 0x10, &[0xB0, 0x42, 0x9C, 0x59, 0xCF]);
    // int 0x21 ; inc ax
    cpu.load_code_vec(&[0xCD, 0x21, 0x40]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_al(), 0x43);
    // IF was clear inside the handler and is back afterwards
    assert_eq!(cpu.get_cx() & 0x200, 0);
    assert!(cpu.flag(Flag::If));
    assert_eq!(cpu.get_sp(), 0xFFFE);
}

#[test]
fn trap_flag_single_steps() {
    let mut cpu = cpu();
    // inc dx ; iret
    install_handler(&mut cpu, 1, 0x5000, 0, &[0x42, 0xCF]);
    cpu.set_flag(Flag::Tf, true);
    cpu.load_code_vec(&[0x90, 0x90, 0x90]);
    cpu.fire().unwrap();
    // one trap per instruction; the handler itself runs with TF clear
    assert_eq!(cpu.get_dx(), 3);
    assert!(cpu.flag(Flag::Tf));
}

#[test]
fn trap_after_hlt_runs_handler() {
    let mut cpu = cpu();
    // inc dx ; iret
    install_handler(&mut cpu, 1, 0x5000, 0, &[0x42, 0xCF]);
    cpu.set_flag(Flag::Tf, true);
    cpu.set_flag(Flag::If, true);
    cpu.load_code_vec(&[0xF4, 0x90]);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Executed);
    assert!(!cpu.halted);
    assert_eq!((cpu.get_cs(), cpu.get_ip()), (0x5000, 0));
    cpu.step().unwrap();
    cpu.step().unwrap();
    assert_eq!(cpu.get_dx(), 1);
    assert_eq!((cpu.get_cs(), cpu.get_ip()), (0x1000, 1));
    assert!(cpu.flag(Flag::Tf));
    assert!(cpu.flag(Flag::If));
}

#[test]
fn hlt_waits_for_interrupt() {
    let mut cpu = cpu();
    // mov bx, 0x99 ; iret
    install_handler(&mut cpu, 8, 0x5000, 0, &[0xBB, 0x99, 0x00, 0xCF]);
    // sti ; hlt ; mov cx, 5
    cpu.load_code_vec(&[0xFB, 0xF4, 0xB9, 0x05, 0x00]);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Executed);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Halted);
    assert_eq!(cpu.step().unwrap(), StepOutcome::Halted);
    assert_eq!(cpu.get_ip(), 2);

    cpu.request_interrupt(8);
    cpu.fire().unwrap();
    assert!(!cpu.halted);
    assert_eq!(cpu.pending_interrupt(), None);
    assert_eq!(cpu.get_bx(), 0x99);
    assert_eq!(cpu.get_cx(), 5);
}

#[test]
fn hlt_with_interrupts_off_parks() {
    let mut cpu = cpu();
    cpu.request_interrupt(8);
    // cli ; hlt ; mov cx, 5
    cpu.load_code_vec(&[0xFA, 0xF4, 0xB9, 0x05, 0x00]);
    cpu.fire().unwrap();
    assert!(cpu.halted);
    assert_eq!(cpu.get_cx(), 0);
    assert_eq!(cpu.pending_interrupt(), Some(8));
}

#[test]
fn call_and_ret() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[
        0xE8, 0x05, 0x00, // call +5
        0xBB, 0x01, 0x00, // mov bx, 1
        0xEB, 0x04, // jmp +4
        0xB8, 0x07, 0x00, // mov ax, 7
        0xC3, // ret
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 7);
    assert_eq!(cpu.get_bx(), 1);
    assert_eq!(cpu.get_sp(), 0xFFFE);
}

#[test]
fn far_call_and_retf_with_pop() {
    let mut cpu = cpu();
    // mov ax, 9 ; retf 2
    cpu.mem.load(linear(0x5000, 0), &[0xB8, 0x09, 0x00, 0xCA, 0x02, 0x00]);
    cpu.load_code_vec(&[
        0x52, // push dx
        0x9A, 0x00, 0x00, 0x00, 0x50, // call 5000:0000
        0xBA, 0x03, 0x00, // mov dx, 3
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 9);
    assert_eq!(cpu.get_dx(), 3);
    assert_eq!(cpu.get_cs(), 0x1000);
    assert_eq!(cpu.get_sp(), 0xFFFE);
}

#[test]
fn pushf_popf() {
    let mut cpu = cpu();
    cpu.set_flag(Flag::Cf, true);
    cpu.load_code_vec(&[
        0x9C, // pushf
        0x58, // pop ax
        0x0D, 0x00, 0x04, // or ax, 0x400
        0x50, // push ax
        0x9D, // popf
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_ax(), 0xF403);
    assert!(cpu.flag(Flag::Df));
    assert!(cpu.flag(Flag::Cf));
}

#[derive(Clone, Default)]
struct Shared(Rc<RefCell<Vec<u8>>>);

impl Write for Shared {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.borrow_mut().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

#[test]
fn host_putchar() {
    let mut cpu = cpu();
    let out = Shared::default();
    cpu.set_host(Box::new(StdHost::with_output(
        DiskSet::new(),
        Box::new(out.clone()),
    )));
    cpu.load_code_vec(&[0xB0, b'H', 0x0F, 0x00, 0xB0, b'i', 0x0F, 0x00]);
    cpu.fire().unwrap();
    assert_eq!(out.0.borrow().as_slice(), b"Hi");
}

#[test]
fn host_call_out_of_range() {
    let mut cpu = cpu();
    cpu.load_code_vec(&[0x0F, 0x04]);
    assert!(matches!(
        cpu.fire(),
        Err(EmuError::IllegalOpcode { opcode: 0x0F, .. })
    ));
}

#[test]
fn host_disk_read_and_write() {
    let mut image = tempfile::NamedTempFile::new().unwrap();
    let mut bytes = vec![0u8; 1024];
    bytes[512..].fill(0x5A);
    image.write_all(&bytes).unwrap();

    let mut disks = DiskSet::new();
    disks.attach(SLOT_FLOPPY, image.path()).unwrap();
    let mut cpu = cpu();
    cpu.set_host(Box::new(StdHost::new(disks)));
    cpu.set_dl(SLOT_FLOPPY);
    cpu.set_bp(1);
    cpu.set_ax(16);
    cpu.set_bx(0x100);
    cpu.mem.load(linear(0x2000, 0x800), b"BOOT");
    cpu.load_code_vec(&[
        0x0F, 0x02, // read 16 bytes of sector 1 to ES:BX
        0x89, 0xC1, // mov cx, ax
        0xB8, 0x04, 0x00, // mov ax, 4
        0x31, 0xED, // xor bp, bp
        0xBB, 0x00, 0x08, // mov bx, 0x800
        0x0F, 0x03, // write 4 bytes to sector 0
    ]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_cl(), 16);
    assert_eq!(cpu.mem.slice(linear(0x2000, 0x100), 16), vec![0x5A; 16]);
    assert_eq!(cpu.get_al(), 4);
    drop(cpu);
    let written = std::fs::read(image.path()).unwrap();
    assert_eq!(&written[..4], b"BOOT");
    assert_eq!(written[512], 0x5A);
}

#[test]
fn host_disk_read_without_image() {
    let mut cpu = cpu();
    cpu.set_host(Box::new(StdHost::new(DiskSet::new())));
    cpu.set_ax(0x10);
    cpu.set_dl(SLOT_FLOPPY);
    cpu.load_code_vec(&[0x0F, 0x02]);
    cpu.fire().unwrap();
    assert_eq!(cpu.get_al(), 0);
}

struct FixedClock(NaiveDateTime);

impl Host for FixedClock {
    fn putchar(&mut self, _byte: u8) {}

    fn now(&mut self) -> NaiveDateTime {
        self.0
    }

    fn disk_read(&mut self, _slot: u8, _offset: u64, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }

    fn disk_write(&mut self, _slot: u8, _offset: u64, data: &[u8]) -> io::Result<usize> {
        Ok(data.len())
    }
}

#[test]
fn host_rtc() {
    let t = NaiveDate::from_ymd_opt(2001, 9, 9)
        .unwrap()
        .and_hms_milli_opt(1, 46, 40, 250)
        .unwrap();
    let mut cpu = cpu();
    cpu.set_host(Box::new(FixedClock(t)));
    cpu.set_bx(0x600);
    cpu.load_code_vec(&[0x0F, 0x01]);
    cpu.fire().unwrap();
    let rec = cpu.mem.slice(linear(0x2000, 0x600), 38);
    let field = |n: usize| i32::from_le_bytes(rec[4 * n..4 * n + 4].try_into().unwrap());
    assert_eq!((field(0), field(1), field(2)), (40, 46, 1));
    assert_eq!((field(3), field(4), field(5)), (9, 8, 101));
    // a Sunday
    assert_eq!(field(6), 0);
    assert_eq!(u16::from_le_bytes([rec[36], rec[37]]), 250);
}
