//! String instructions with their REP/REPZ/REPNZ forms.
//!
//! A REP loop runs at most a bounded number of iterations per dispatch; if
//! the count register is still non-zero the handler asks for a refetch
//! without advancing EIP, so the same instruction resumes. That is also
//! what makes long REPs interruptible and faultable with correct partial
//! state.

use crate::decoder::{i_seg, DecodedInsn, I_ADDR16, I_PREFIX_MASK, I_PREFIX_REPZ};
use crate::flags::{LAUX_SUB16, LAUX_SUB32, LAUX_SUB8};
use crate::ops::{HandlerResult, Next};
use crate::state::*;
use crate::Cpu;

const MAX_ITERATIONS: u32 = 65536;

// Count/index helpers honouring the address-size attribute.

#[inline]
fn get_count(cpu: &Cpu, a16: bool) -> u32 {
    if a16 {
        cpu.read_reg16(ECX) as u32
    } else {
        cpu.reg32[ECX]
    }
}

#[inline]
fn dec_count(cpu: &mut Cpu, a16: bool) {
    if a16 {
        let v = cpu.read_reg16(ECX).wrapping_sub(1);
        cpu.write_reg16(ECX, v);
    } else {
        cpu.reg32[ECX] = cpu.reg32[ECX].wrapping_sub(1);
    }
}

#[inline]
fn get_index(cpu: &Cpu, a16: bool, r: usize) -> u32 {
    if a16 {
        cpu.read_reg16(r) as u32
    } else {
        cpu.reg32[r]
    }
}

#[inline]
fn bump_index(cpu: &mut Cpu, a16: bool, r: usize, delta: i32) {
    if a16 {
        let v = cpu.read_reg16(r).wrapping_add(delta as u16);
        cpu.write_reg16(r, v);
    } else {
        cpu.reg32[r] = cpu.reg32[r].wrapping_add(delta as u32);
    }
}

#[inline]
fn delta(cpu: &Cpu, size: i32) -> i32 {
    if cpu.eflags & EFLAGS_DF != 0 {
        -size
    } else {
        size
    }
}

/// Shared REP driver: `body` performs one iteration (reads/writes memory and
/// bumps the index registers); returns `Some(flow)` to stop a REPZ/REPNZ
/// scan early.
macro_rules! rep_loop {
    ($cpu:expr, $i:expr, $a16:expr, $body:block) => {{
        let rep = $i.flags & I_PREFIX_MASK;
        if rep == 0 {
            $body
            return Ok(Next);
        }
        let mut count = get_count($cpu, $a16);
        if count > MAX_ITERATIONS {
            count = MAX_ITERATIONS;
        }
        for _ in 0..count {
            $body
            dec_count($cpu, $a16);
        }
        if get_count($cpu, $a16) != 0 {
            return Err(Abort); // resume this instruction next dispatch
        }
        return Ok(Next);
    }};
}

macro_rules! rep_loop_cond {
    ($cpu:expr, $i:expr, $a16:expr, $body:block) => {{
        let rep = $i.flags & I_PREFIX_MASK;
        if rep == 0 {
            $body
            return Ok(Next);
        }
        let want_zf = rep == I_PREFIX_REPZ;
        let mut count = get_count($cpu, $a16);
        if count > MAX_ITERATIONS {
            count = MAX_ITERATIONS;
        }
        for _ in 0..count {
            $body
            dec_count($cpu, $a16);
            if $cpu.get_zf() != want_zf {
                return Ok(Next);
            }
        }
        if get_count($cpu, $a16) != 0 {
            return Err(Abort);
        }
        return Ok(Next);
    }};
}

macro_rules! movs {
    ($name:ident, $read:ident, $write:ident, $ty:ty, $size:expr) => {
        pub(crate) fn $name(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
            let a16 = i.flags & I_ADDR16 != 0;
            let add = delta(cpu, $size);
            let src_base = cpu.seg_base[i_seg(i.flags)];
            rep_loop!(cpu, i, a16, {
                let v: $ty = cpu.$read(
                    src_base.wrapping_add(get_index(cpu, a16, ESI)),
                    cpu.tlb_shift_read,
                )?;
                cpu.$write(
                    cpu.seg_base[ES].wrapping_add(get_index(cpu, a16, EDI)),
                    v,
                    cpu.tlb_shift_write,
                )?;
                bump_index(cpu, a16, ESI, add);
                bump_index(cpu, a16, EDI, add);
            });
        }
    };
}

movs!(op_movsb, read8, write8, u8, 1);
movs!(op_movsw, read16, write16, u16, 2);
movs!(op_movsd, read32, write32, u32, 4);

macro_rules! stos {
    ($name:ident, $write:ident, $rd:expr, $size:expr) => {
        pub(crate) fn $name(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
            let a16 = i.flags & I_ADDR16 != 0;
            let add = delta(cpu, $size);
            rep_loop!(cpu, i, a16, {
                let v = $rd(cpu);
                cpu.$write(
                    cpu.seg_base[ES].wrapping_add(get_index(cpu, a16, EDI)),
                    v,
                    cpu.tlb_shift_write,
                )?;
                bump_index(cpu, a16, EDI, add);
            });
        }
    };
}

stos!(op_stosb, write8, |c: &Cpu| c.read_reg8(EAX), 1);
stos!(op_stosw, write16, |c: &Cpu| c.read_reg16(EAX), 2);
stos!(op_stosd, write32, |c: &Cpu| c.reg32[EAX], 4);

macro_rules! lods {
    ($name:ident, $read:ident, $wr:expr, $size:expr) => {
        pub(crate) fn $name(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
            let a16 = i.flags & I_ADDR16 != 0;
            let add = delta(cpu, $size);
            let src_base = cpu.seg_base[i_seg(i.flags)];
            rep_loop!(cpu, i, a16, {
                let v = cpu.$read(
                    src_base.wrapping_add(get_index(cpu, a16, ESI)),
                    cpu.tlb_shift_read,
                )?;
                $wr(cpu, v);
                bump_index(cpu, a16, ESI, add);
            });
        }
    };
}

lods!(op_lodsb, read8, |c: &mut Cpu, v| c.write_reg8(EAX, v), 1);
lods!(op_lodsw, read16, |c: &mut Cpu, v| c.write_reg16(EAX, v), 2);
lods!(op_lodsd, read32, |c: &mut Cpu, v| c.reg32[EAX] = v, 4);

macro_rules! scas {
    ($name:ident, $read:ident, $acc:expr, $laux:expr, $sx:ty, $size:expr) => {
        pub(crate) fn $name(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
            let a16 = i.flags & I_ADDR16 != 0;
            let add = delta(cpu, $size);
            rep_loop_cond!(cpu, i, a16, {
                let src = cpu.$read(
                    cpu.seg_base[ES].wrapping_add(get_index(cpu, a16, EDI)),
                    cpu.tlb_shift_read,
                )?;
                bump_index(cpu, a16, EDI, add);
                let dest = $acc(cpu);
                cpu.lr = (dest.wrapping_sub(src) as $sx) as i32 as u32;
                cpu.lop2 = src as u32;
                cpu.laux = $laux;
            });
        }
    };
}

scas!(op_scasb, read8, |c: &Cpu| c.read_reg8(EAX), LAUX_SUB8, i8, 1);
scas!(op_scasw, read16, |c: &Cpu| c.read_reg16(EAX), LAUX_SUB16, i16, 2);
scas!(op_scasd, read32, |c: &Cpu| c.reg32[EAX], LAUX_SUB32, i32, 4);

macro_rules! cmps {
    ($name:ident, $read:ident, $laux:expr, $sx:ty, $size:expr) => {
        pub(crate) fn $name(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
            let a16 = i.flags & I_ADDR16 != 0;
            let add = delta(cpu, $size);
            let src_base = cpu.seg_base[i_seg(i.flags)];
            rep_loop_cond!(cpu, i, a16, {
                let a = cpu.$read(
                    src_base.wrapping_add(get_index(cpu, a16, ESI)),
                    cpu.tlb_shift_read,
                )?;
                let b = cpu.$read(
                    cpu.seg_base[ES].wrapping_add(get_index(cpu, a16, EDI)),
                    cpu.tlb_shift_read,
                )?;
                bump_index(cpu, a16, ESI, add);
                bump_index(cpu, a16, EDI, add);
                cpu.lr = (a.wrapping_sub(b) as $sx) as i32 as u32;
                cpu.lop2 = b as u32;
                cpu.laux = $laux;
            });
        }
    };
}

cmps!(op_cmpsb, read8, LAUX_SUB8, i8, 1);
cmps!(op_cmpsw, read16, LAUX_SUB16, i16, 2);
cmps!(op_cmpsd, read32, LAUX_SUB32, i32, 4);

macro_rules! ins {
    ($name:ident, $write:ident, $ioread:ident, $size:expr) => {
        pub(crate) fn $name(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
            let a16 = i.flags & I_ADDR16 != 0;
            let add = delta(cpu, $size);
            let port = cpu.read_reg16(EDX) as u32;
            cpu.io_check_access(port, $size)?;
            rep_loop!(cpu, i, a16, {
                let v = cpu.devices.$ioread(port);
                cpu.$write(
                    cpu.seg_base[ES].wrapping_add(get_index(cpu, a16, EDI)),
                    v,
                    cpu.tlb_shift_write,
                )?;
                bump_index(cpu, a16, EDI, add);
            });
        }
    };
}

ins!(op_insb, write8, io_read8, 1);
ins!(op_insw, write16, io_read16, 2);
ins!(op_insd, write32, io_read32, 4);

macro_rules! outs {
    ($name:ident, $read:ident, $iowrite:ident, $size:expr) => {
        pub(crate) fn $name(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
            let a16 = i.flags & I_ADDR16 != 0;
            let add = delta(cpu, $size);
            let port = cpu.read_reg16(EDX) as u32;
            cpu.io_check_access(port, $size)?;
            let src_base = cpu.seg_base[i_seg(i.flags)];
            rep_loop!(cpu, i, a16, {
                let v = cpu.$read(
                    src_base.wrapping_add(get_index(cpu, a16, ESI)),
                    cpu.tlb_shift_read,
                )?;
                cpu.devices.$iowrite(port, v);
                bump_index(cpu, a16, ESI, add);
            });
        }
    };
}

outs!(op_outsb, read8, io_write8, 1);
outs!(op_outsw, read16, io_write16, 2);
outs!(op_outsd, read32, io_write32, 4);
