//! ALU: arithmetic, shifts and rotates, multiply/divide, bit scans and bit
//! tests, exchange-and-op, and the BCD adjusts. Every primitive leaves the
//! lazy-flag scratch describing exactly the flags the instruction defines.

use crate::decoder::{i_op, i_op3, i_reg, i_rm, DecodedInsn};
use crate::flags::*;
use crate::ops::{ea, HandlerResult, Next};
use crate::state::*;
use crate::Cpu;

// --- value primitives ---------------------------------------------------

pub(crate) fn arith8(cpu: &mut Cpu, op: u32, dst: u8, src: u8) -> u8 {
    match op & 7 {
        0 => {
            cpu.lop2 = src as u32;
            let r = dst.wrapping_add(src);
            cpu.lr = r as i8 as i32 as u32;
            cpu.laux = LAUX_ADD8;
            r
        }
        1 => {
            let r = dst | src;
            cpu.lr = r as i8 as i32 as u32;
            cpu.laux = LAUX_BIT;
            r
        }
        2 => {
            let cf = cpu.get_cf() as u8;
            cpu.lop1 = dst as u32;
            cpu.lop2 = src as u32;
            let r = dst.wrapping_add(src).wrapping_add(cf);
            cpu.lr = r as i8 as i32 as u32;
            cpu.laux = LAUX_ADC8;
            r
        }
        3 => {
            let cf = cpu.get_cf() as u8;
            cpu.lop1 = dst as u32;
            cpu.lop2 = src as u32;
            let r = dst.wrapping_sub(src).wrapping_sub(cf);
            cpu.lr = r as i8 as i32 as u32;
            cpu.laux = LAUX_SBB8;
            r
        }
        4 => {
            let r = dst & src;
            cpu.lr = r as i8 as i32 as u32;
            cpu.laux = LAUX_BIT;
            r
        }
        5 => {
            cpu.lop2 = src as u32;
            let r = dst.wrapping_sub(src);
            cpu.lr = r as i8 as i32 as u32;
            cpu.laux = LAUX_SUB8;
            r
        }
        _ => {
            let r = dst ^ src;
            cpu.lr = r as i8 as i32 as u32;
            cpu.laux = LAUX_BIT;
            r
        }
    }
}

pub(crate) fn arith16(cpu: &mut Cpu, op: u32, dst: u16, src: u16) -> u16 {
    match op & 7 {
        0 => {
            cpu.lop2 = src as u32;
            let r = dst.wrapping_add(src);
            cpu.lr = r as i16 as i32 as u32;
            cpu.laux = LAUX_ADD16;
            r
        }
        1 => {
            let r = dst | src;
            cpu.lr = r as i16 as i32 as u32;
            cpu.laux = LAUX_BIT;
            r
        }
        2 => {
            let cf = cpu.get_cf() as u16;
            cpu.lop1 = dst as u32;
            cpu.lop2 = src as u32;
            let r = dst.wrapping_add(src).wrapping_add(cf);
            cpu.lr = r as i16 as i32 as u32;
            cpu.laux = LAUX_ADC16;
            r
        }
        3 => {
            let cf = cpu.get_cf() as u16;
            cpu.lop1 = dst as u32;
            cpu.lop2 = src as u32;
            let r = dst.wrapping_sub(src).wrapping_sub(cf);
            cpu.lr = r as i16 as i32 as u32;
            cpu.laux = LAUX_SBB16;
            r
        }
        4 => {
            let r = dst & src;
            cpu.lr = r as i16 as i32 as u32;
            cpu.laux = LAUX_BIT;
            r
        }
        5 => {
            cpu.lop2 = src as u32;
            let r = dst.wrapping_sub(src);
            cpu.lr = r as i16 as i32 as u32;
            cpu.laux = LAUX_SUB16;
            r
        }
        _ => {
            let r = dst ^ src;
            cpu.lr = r as i16 as i32 as u32;
            cpu.laux = LAUX_BIT;
            r
        }
    }
}

pub(crate) fn arith32(cpu: &mut Cpu, op: u32, dst: u32, src: u32) -> u32 {
    match op & 7 {
        0 => {
            cpu.lop2 = src;
            let r = dst.wrapping_add(src);
            cpu.lr = r;
            cpu.laux = LAUX_ADD32;
            r
        }
        1 => {
            let r = dst | src;
            cpu.lr = r;
            cpu.laux = LAUX_BIT;
            r
        }
        2 => {
            let cf = cpu.get_cf() as u32;
            cpu.lop1 = dst;
            cpu.lop2 = src;
            let r = dst.wrapping_add(src).wrapping_add(cf);
            cpu.lr = r;
            cpu.laux = LAUX_ADC32;
            r
        }
        3 => {
            let cf = cpu.get_cf() as u32;
            cpu.lop1 = dst;
            cpu.lop2 = src;
            let r = dst.wrapping_sub(src).wrapping_sub(cf);
            cpu.lr = r;
            cpu.laux = LAUX_SBB32;
            r
        }
        4 => {
            let r = dst & src;
            cpu.lr = r;
            cpu.laux = LAUX_BIT;
            r
        }
        5 => {
            cpu.lop2 = src;
            let r = dst.wrapping_sub(src);
            cpu.lr = r;
            cpu.laux = LAUX_SUB32;
            r
        }
        _ => {
            let r = dst ^ src;
            cpu.lr = r;
            cpu.laux = LAUX_BIT;
            r
        }
    }
}

#[inline]
pub(crate) fn cmp8(cpu: &mut Cpu, dst: u8, src: u8) {
    cpu.lop2 = src as u32;
    cpu.lr = dst.wrapping_sub(src) as i8 as i32 as u32;
    cpu.laux = LAUX_SUB8;
}

#[inline]
pub(crate) fn cmp16(cpu: &mut Cpu, dst: u16, src: u16) {
    cpu.lop2 = src as u32;
    cpu.lr = dst.wrapping_sub(src) as i16 as i32 as u32;
    cpu.laux = LAUX_SUB16;
}

#[inline]
pub(crate) fn cmp32(cpu: &mut Cpu, dst: u32, src: u32) {
    cpu.lop2 = src;
    cpu.lr = dst.wrapping_sub(src);
    cpu.laux = LAUX_SUB32;
}

#[inline]
pub(crate) fn test8(cpu: &mut Cpu, a: u8, b: u8) {
    cpu.lr = (a & b) as i8 as i32 as u32;
    cpu.laux = LAUX_BIT;
}

#[inline]
pub(crate) fn test16(cpu: &mut Cpu, a: u16, b: u16) {
    cpu.lr = (a & b) as i16 as i32 as u32;
    cpu.laux = LAUX_BIT;
}

#[inline]
pub(crate) fn test32(cpu: &mut Cpu, a: u32, b: u32) {
    cpu.lr = a & b;
    cpu.laux = LAUX_BIT;
}

/// INC/DEC preserve CF, so the current CF is parked in `eflags` bit 0
/// where the INC/DEC flag classes expect to find it.
fn park_cf(cpu: &mut Cpu) {
    let cf = cpu.get_cf() as u32;
    cpu.eflags = (cpu.eflags & !EFLAGS_CF) | cf;
}

pub(crate) fn inc8(cpu: &mut Cpu, v: u8) -> u8 {
    park_cf(cpu);
    let r = v.wrapping_add(1);
    cpu.lr = r as i8 as i32 as u32;
    cpu.laux = LAUX_INC8;
    r
}

pub(crate) fn inc16(cpu: &mut Cpu, v: u16) -> u16 {
    park_cf(cpu);
    let r = v.wrapping_add(1);
    cpu.lr = r as i16 as i32 as u32;
    cpu.laux = LAUX_INC16;
    r
}

pub(crate) fn inc32(cpu: &mut Cpu, v: u32) -> u32 {
    park_cf(cpu);
    let r = v.wrapping_add(1);
    cpu.lr = r;
    cpu.laux = LAUX_INC32;
    r
}

pub(crate) fn dec8(cpu: &mut Cpu, v: u8) -> u8 {
    park_cf(cpu);
    let r = v.wrapping_sub(1);
    cpu.lr = r as i8 as i32 as u32;
    cpu.laux = LAUX_DEC8;
    r
}

pub(crate) fn dec16(cpu: &mut Cpu, v: u16) -> u16 {
    park_cf(cpu);
    let r = v.wrapping_sub(1);
    cpu.lr = r as i16 as i32 as u32;
    cpu.laux = LAUX_DEC16;
    r
}

pub(crate) fn dec32(cpu: &mut Cpu, v: u32) -> u32 {
    park_cf(cpu);
    let r = v.wrapping_sub(1);
    cpu.lr = r;
    cpu.laux = LAUX_DEC32;
    r
}

pub(crate) fn neg8(cpu: &mut Cpu, v: u8) -> u8 {
    cpu.lop2 = v as u32;
    let r = (v as i8).wrapping_neg() as u8;
    cpu.lr = r as i8 as i32 as u32;
    cpu.laux = LAUX_SUB8;
    r
}

pub(crate) fn neg16(cpu: &mut Cpu, v: u16) -> u16 {
    cpu.lop2 = v as u32;
    let r = (v as i16).wrapping_neg() as u16;
    cpu.lr = r as i16 as i32 as u32;
    cpu.laux = LAUX_SUB16;
    r
}

pub(crate) fn neg32(cpu: &mut Cpu, v: u32) -> u32 {
    cpu.lop2 = v;
    let r = v.wrapping_neg();
    cpu.lr = r;
    cpu.laux = LAUX_SUB32;
    r
}

pub(crate) fn shift8(cpu: &mut Cpu, op: u32, dst: u8, count: u8) -> u8 {
    if count == 0 {
        return dst;
    }
    let mut res = dst;
    match op & 7 {
        0 => {
            // ROL
            let c = (count & 7) as u32;
            if c != 0 {
                res = dst.rotate_left(c);
            }
            if count & 31 != 0 {
                cpu.set_cf(res & 1 != 0);
                cpu.set_of((res ^ (res >> 7)) & 1 != 0);
            }
        }
        1 => {
            // ROR
            let c = (count & 7) as u32;
            if c != 0 {
                res = dst.rotate_right(c);
            }
            if count & 31 != 0 {
                cpu.set_cf(res >> 7 & 1 != 0);
                cpu.set_of((res ^ (res << 1)) >> 7 & 1 != 0);
            }
        }
        2 => {
            // RCL: 9-bit rotate through CF.
            let c = ((count & 31) % 9) as u32;
            if c != 0 {
                let cf = cpu.get_cf() as u16;
                let wide = dst as u16 | (cf << 8);
                let r = ((wide << c) | (wide >> (9 - c))) as u8;
                let new_cf = (dst as u16 >> (8 - c)) & 1;
                cpu.set_cf(new_cf != 0);
                cpu.set_of((new_cf as u8 ^ (r >> 7)) & 1 != 0);
                res = r;
            }
        }
        3 => {
            // RCR
            let c = ((count & 31) % 9) as u32;
            if c != 0 {
                let cf = cpu.get_cf() as u16;
                let wide = dst as u16 | (cf << 8);
                let r = ((wide >> c) | (wide << (9 - c))) as u8;
                cpu.set_cf((dst >> (c - 1)) & 1 != 0);
                cpu.set_of((r ^ (r << 1)) >> 7 & 1 != 0);
                res = r;
            }
        }
        4 | 6 => {
            let c = (count & 31) as u32;
            cpu.lop1 = dst as u32;
            cpu.lop2 = c;
            res = if c < 8 { dst << c } else { 0 };
            cpu.lr = res as i8 as i32 as u32;
            cpu.laux = LAUX_SHL8;
        }
        5 => {
            let c = (count & 31) as u32;
            cpu.lop1 = dst as u32;
            cpu.lop2 = c;
            res = if c < 8 { dst >> c } else { 0 };
            cpu.lr = res as i8 as i32 as u32;
            cpu.laux = LAUX_SHR8;
        }
        _ => {
            let c = (count & 31) as u32;
            cpu.lop1 = dst as i8 as i32 as u32;
            cpu.lop2 = c;
            res = ((dst as i8) >> c.min(7)) as u8;
            cpu.lr = res as i8 as i32 as u32;
            cpu.laux = LAUX_SAR8;
        }
    }
    res
}

pub(crate) fn shift16(cpu: &mut Cpu, op: u32, dst: u16, count: u8) -> u16 {
    if count == 0 {
        return dst;
    }
    let mut res = dst;
    match op & 7 {
        0 => {
            let c = (count & 15) as u32;
            if c != 0 {
                res = dst.rotate_left(c);
            }
            if count & 31 != 0 {
                cpu.set_cf(res & 1 != 0);
                cpu.set_of((res ^ (res >> 15)) & 1 != 0);
            }
        }
        1 => {
            let c = (count & 15) as u32;
            if c != 0 {
                res = dst.rotate_right(c);
            }
            if count & 31 != 0 {
                cpu.set_cf(res >> 15 & 1 != 0);
                cpu.set_of((res ^ (res << 1)) >> 15 & 1 != 0);
            }
        }
        2 => {
            let c = ((count & 31) % 17) as u32;
            if c != 0 {
                let cf = cpu.get_cf() as u32;
                let wide = dst as u32 | (cf << 16);
                let r = ((wide << c) | (wide >> (17 - c))) as u16;
                let new_cf = (dst as u32 >> (16 - c)) & 1;
                cpu.set_cf(new_cf != 0);
                cpu.set_of((new_cf ^ (r as u32 >> 15)) & 1 != 0);
                res = r;
            }
        }
        3 => {
            let c = ((count & 31) % 17) as u32;
            if c != 0 {
                let cf = cpu.get_cf() as u32;
                let wide = dst as u32 | (cf << 16);
                let r = ((wide >> c) | (wide << (17 - c))) as u16;
                cpu.set_cf((dst >> (c - 1)) & 1 != 0);
                cpu.set_of((r ^ (r << 1)) >> 15 & 1 != 0);
                res = r;
            }
        }
        4 | 6 => {
            let c = (count & 31) as u32;
            cpu.lop1 = dst as u32;
            cpu.lop2 = c;
            res = if c < 16 { dst << c } else { 0 };
            cpu.lr = res as i16 as i32 as u32;
            cpu.laux = LAUX_SHL16;
        }
        5 => {
            let c = (count & 31) as u32;
            cpu.lop1 = dst as u32;
            cpu.lop2 = c;
            res = if c < 16 { dst >> c } else { 0 };
            cpu.lr = res as i16 as i32 as u32;
            cpu.laux = LAUX_SHR16;
        }
        _ => {
            let c = (count & 31) as u32;
            cpu.lop1 = dst as i16 as i32 as u32;
            cpu.lop2 = c;
            res = ((dst as i16) >> c.min(15)) as u16;
            cpu.lr = res as i16 as i32 as u32;
            cpu.laux = LAUX_SAR16;
        }
    }
    res
}

pub(crate) fn shift32(cpu: &mut Cpu, op: u32, dst: u32, count: u8) -> u32 {
    let count = count & 31;
    if count == 0 {
        return dst;
    }
    let c = count as u32;
    let mut res = dst;
    match op & 7 {
        0 => {
            res = dst.rotate_left(c);
            cpu.set_cf(res & 1 != 0);
            cpu.set_of((res ^ (res >> 31)) & 1 != 0);
        }
        1 => {
            res = dst.rotate_right(c);
            cpu.set_cf(res >> 31 & 1 != 0);
            cpu.set_of((res ^ (res << 1)) >> 31 & 1 != 0);
        }
        2 => {
            // RCL: 33-bit rotate through CF.
            let cf = cpu.get_cf() as u64;
            let wide = dst as u64 | (cf << 32);
            let r = (((wide << c) | (wide >> (33 - c))) & 0xFFFF_FFFF) as u32;
            let new_cf = (wide >> (32 - c)) & 1;
            cpu.set_cf(new_cf != 0);
            cpu.set_of((new_cf as u32 ^ (r >> 31)) & 1 != 0);
            res = r;
        }
        3 => {
            let cf = cpu.get_cf() as u64;
            let wide = dst as u64 | (cf << 32);
            let r = (((wide >> c) | (wide << (33 - c))) & 0xFFFF_FFFF) as u32;
            cpu.set_cf((dst >> (c - 1)) & 1 != 0);
            cpu.set_of((r ^ (r << 1)) >> 31 & 1 != 0);
            res = r;
        }
        4 | 6 => {
            cpu.lop1 = dst;
            cpu.lop2 = c;
            res = dst << c;
            cpu.lr = res;
            cpu.laux = LAUX_SHL32;
        }
        5 => {
            cpu.lop1 = dst;
            cpu.lop2 = c;
            res = dst >> c;
            cpu.lr = res;
            cpu.laux = LAUX_SHR32;
        }
        _ => {
            cpu.lop1 = dst;
            cpu.lop2 = c;
            res = ((dst as i32) >> c) as u32;
            cpu.lr = res;
            cpu.laux = LAUX_SAR32;
        }
    }
    res
}

pub(crate) fn shrd16(cpu: &mut Cpu, dst: u16, src: u16, count: u8) -> u16 {
    let count = (count & 31) as u32;
    if count == 0 {
        return dst;
    }
    let (d, result, c) = if count < 16 {
        (dst, (dst >> count) | (src << (16 - count)), count)
    } else {
        (
            src,
            (src >> (count - 16)) | (dst << (32 - count)),
            count - 16,
        )
    };
    cpu.lr = result as i16 as i32 as u32;
    cpu.lop1 = d as u32;
    cpu.lop2 = if c == 0 { 16 } else { c };
    cpu.laux = LAUX_SHRD16;
    result
}

pub(crate) fn shrd32(cpu: &mut Cpu, dst: u32, src: u32, count: u8) -> u32 {
    let count = (count & 31) as u32;
    if count == 0 {
        return dst;
    }
    let result = (dst >> count) | (src << (32 - count));
    cpu.lr = result;
    cpu.lop1 = dst;
    cpu.lop2 = count;
    cpu.laux = LAUX_SHRD32;
    result
}

pub(crate) fn shld16(cpu: &mut Cpu, dst: u16, src: u16, count: u8) -> u16 {
    let count = (count & 31) as u32;
    if count == 0 {
        return dst;
    }
    let result = if count < 16 {
        (dst << count) | (src >> (16 - count))
    } else {
        (src << (count - 16)) | (dst >> (32 - count))
    };
    cpu.lop1 = if count > 16 { src as u32 } else { dst as u32 };
    cpu.lop2 = count;
    cpu.lr = result as i16 as i32 as u32;
    cpu.laux = LAUX_SHLD16;
    result
}

pub(crate) fn shld32(cpu: &mut Cpu, dst: u32, src: u32, count: u8) -> u32 {
    let count = (count & 31) as u32;
    if count == 0 {
        return dst;
    }
    let result = (dst << count) | (src >> (32 - count));
    cpu.lop1 = dst;
    cpu.lop2 = count;
    cpu.lr = result;
    cpu.laux = LAUX_SHLD32;
    result
}

/// F6 /4..7: widening multiply and divide on AL/AX.
pub(crate) fn muldiv8(cpu: &mut Cpu, op: u32, src: u8) -> OpResult {
    let result: u16;
    match op & 7 {
        4 => {
            result = src as u16 * cpu.read_reg8(EAX) as u16;
            cpu.lop1 = 0;
            cpu.lop2 = result as u32 >> 8;
        }
        5 => {
            result = ((src as i8 as i16) * (cpu.read_reg8(EAX) as i8 as i16)) as u16;
            let low = result as i8;
            let high = (result >> 8) as i8;
            cpu.lop1 = (low >> 7) as u32;
            cpu.lop2 = high as u32;
        }
        6 => {
            if src == 0 {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let ax = cpu.read_reg16(EAX);
            let q = ax / src as u16;
            if q > 0xFF {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let r = ax % src as u16;
            cpu.write_reg8(EAX, q as u8);
            cpu.write_reg8(EAX + 4, r as u8); // AH
            return Ok(());
        }
        _ => {
            if src == 0 {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let ax = cpu.read_reg16(EAX) as i16;
            let q = ax / src as i8 as i16;
            if !(-0x80..=0x7F).contains(&q) {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let r = ax % src as i8 as i16;
            cpu.write_reg8(EAX, q as u8);
            cpu.write_reg8(EAX + 4, r as u8);
            return Ok(());
        }
    }
    cpu.lr = result as i8 as i32 as u32;
    cpu.laux = LAUX_MUL;
    cpu.write_reg16(EAX, result);
    Ok(())
}

pub(crate) fn muldiv16(cpu: &mut Cpu, op: u32, src: u16) -> OpResult {
    let result: u32;
    match op & 7 {
        4 => {
            result = src as u32 * cpu.read_reg16(EAX) as u32;
            cpu.lop1 = 0;
            cpu.lop2 = result >> 16;
        }
        5 => {
            result = ((src as i16 as i32) * (cpu.read_reg16(EAX) as i16 as i32)) as u32;
            let low = result as i16;
            let high = (result >> 16) as i16;
            cpu.lop1 = (low >> 15) as u32;
            cpu.lop2 = high as u32;
        }
        6 => {
            if src == 0 {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let original = (cpu.read_reg16(EDX) as u32) << 16 | cpu.read_reg16(EAX) as u32;
            let q = original / src as u32;
            if q > 0xFFFF {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            cpu.write_reg16(EAX, q as u16);
            cpu.write_reg16(EDX, (original % src as u32) as u16);
            return Ok(());
        }
        _ => {
            if src == 0 {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let original = ((cpu.read_reg16(EDX) as u32) << 16 | cpu.read_reg16(EAX) as u32) as i32;
            let q = original / src as i16 as i32;
            if !(-0x8000..=0x7FFF).contains(&q) {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            cpu.write_reg16(EAX, q as u16);
            cpu.write_reg16(EDX, (original % src as i16 as i32) as u16);
            return Ok(());
        }
    }
    cpu.lr = result as i16 as i32 as u32;
    cpu.laux = LAUX_MUL;
    cpu.write_reg16(EAX, result as u16);
    cpu.write_reg16(EDX, (result >> 16) as u16);
    Ok(())
}

pub(crate) fn muldiv32(cpu: &mut Cpu, op: u32, src: u32) -> OpResult {
    let result: u64;
    match op & 7 {
        4 => {
            result = src as u64 * cpu.reg32[EAX] as u64;
            cpu.lop1 = 0;
            cpu.lop2 = (result >> 32) as u32;
        }
        5 => {
            result = ((src as i32 as i64) * (cpu.reg32[EAX] as i32 as i64)) as u64;
            let low = result as i32;
            let high = (result >> 32) as i32;
            cpu.lop1 = (low >> 31) as u32;
            cpu.lop2 = high as u32;
        }
        6 => {
            if src == 0 {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let original = (cpu.reg32[EDX] as u64) << 32 | cpu.reg32[EAX] as u64;
            let q = original / src as u64;
            if q > 0xFFFF_FFFF {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            cpu.reg32[EAX] = q as u32;
            cpu.reg32[EDX] = (original % src as u64) as u32;
            return Ok(());
        }
        _ => {
            if src == 0 {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            let original = ((cpu.reg32[EDX] as u64) << 32 | cpu.reg32[EAX] as u64) as i64;
            let q = original / src as i32 as i64;
            if !(-0x8000_0000..=0x7FFF_FFFF).contains(&q) {
                cpu.exception(Exception::De);
                return Err(Abort);
            }
            cpu.reg32[EAX] = q as u32;
            cpu.reg32[EDX] = (original % src as i32 as i64) as u32;
            return Ok(());
        }
    }
    cpu.lr = result as u32;
    cpu.laux = LAUX_MUL;
    cpu.reg32[EAX] = result as u32;
    cpu.reg32[EDX] = (result >> 32) as u32;
    Ok(())
}

pub(crate) fn imul16(cpu: &mut Cpu, a: u16, b: u16) -> u16 {
    let result = (a as i16 as i32 as u32).wrapping_mul(b as i16 as i32 as u32);
    cpu.laux = LAUX_MUL;
    let low = result as i16;
    let high = (result >> 16) as i16;
    cpu.lop1 = (low >> 15) as u32;
    cpu.lop2 = high as u32;
    cpu.lr = low as i32 as u32;
    result as u16
}

pub(crate) fn imul32(cpu: &mut Cpu, a: u32, b: u32) -> u32 {
    let result = ((a as i32 as i64) * (b as i32 as i64)) as u64;
    cpu.laux = LAUX_MUL;
    let low = result as i32;
    let high = (result >> 32) as i32;
    cpu.lop1 = (low >> 31) as u32;
    cpu.lop2 = high as u32;
    cpu.lr = low as u32;
    result as u32
}

// --- bit scans / tests --------------------------------------------------

pub(crate) fn bsf16(cpu: &mut Cpu, src: u16, old: u16) -> u16 {
    if src != 0 {
        cpu.set_zf(false);
        src.trailing_zeros() as u16
    } else {
        cpu.set_zf(true);
        old
    }
}

pub(crate) fn bsf32(cpu: &mut Cpu, src: u32, old: u32) -> u32 {
    if src != 0 {
        cpu.set_zf(false);
        src.trailing_zeros()
    } else {
        cpu.set_zf(true);
        old
    }
}

pub(crate) fn bsr16(cpu: &mut Cpu, src: u16, old: u16) -> u16 {
    if src != 0 {
        cpu.set_zf(false);
        15 - src.leading_zeros() as u16
    } else {
        cpu.set_zf(true);
        old
    }
}

pub(crate) fn bsr32(cpu: &mut Cpu, src: u32, old: u32) -> u32 {
    if src != 0 {
        cpu.set_zf(false);
        31 - src.leading_zeros()
    } else {
        cpu.set_zf(true);
        old
    }
}

/// BT/BTS/BTR/BTC on a value; sub-op 4..7.
#[inline]
fn bit_op(cpu: &mut Cpu, sub: u32, v: u32, shift: u32) -> u32 {
    cpu.set_cf(v >> shift & 1 != 0);
    match sub & 3 {
        1 => v | 1 << shift,
        2 => v & !(1 << shift),
        3 => v ^ 1 << shift,
        _ => v,
    }
}

// --- handlers -----------------------------------------------------------

macro_rules! rmw8 {
    ($cpu:expr, $i:expr, |$v:ident| $body:expr) => {{
        let a = ea($cpu, $i);
        let shift = $cpu.tlb_shift_write;
        let $v = $cpu.read8(a, shift)?;
        let r = $body;
        $cpu.write8(a, r, shift)?;
    }};
}
macro_rules! rmw16 {
    ($cpu:expr, $i:expr, |$v:ident| $body:expr) => {{
        let a = ea($cpu, $i);
        let shift = $cpu.tlb_shift_write;
        let $v = $cpu.read16(a, shift)?;
        let r = $body;
        $cpu.write16(a, r, shift)?;
    }};
}
macro_rules! rmw32 {
    ($cpu:expr, $i:expr, |$v:ident| $body:expr) => {{
        let a = ea($cpu, $i);
        let shift = $cpu.tlb_shift_write;
        let $v = $cpu.read32(a, shift)?;
        let r = $body;
        $cpu.write32(a, r, shift)?;
    }};
}

pub(crate) fn op_arith_r8r8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg8(i_reg(i.flags));
    let dst = cpu.read_reg8(i_rm(i.flags));
    let r = arith8(cpu, i_op(i.flags), dst, src);
    cpu.write_reg8(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_arith_r8i8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read_reg8(i_rm(i.flags));
    let r = arith8(cpu, i_op(i.flags), dst, i.imm as u8);
    cpu.write_reg8(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_arith_r8e8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
    let dst = cpu.read_reg8(i_reg(i.flags));
    let r = arith8(cpu, i_op(i.flags), dst, src);
    cpu.write_reg8(i_reg(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_arith_e8r8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg8(i_reg(i.flags));
    rmw8!(cpu, i, |v| arith8(cpu, i_op(i.flags), v, src));
    Ok(Next)
}

pub(crate) fn op_arith_e8i8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    rmw8!(cpu, i, |v| arith8(cpu, i_op(i.flags), v, i.imm as u8));
    Ok(Next)
}

pub(crate) fn op_arith_r16r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg16(i_reg(i.flags));
    let dst = cpu.read_reg16(i_rm(i.flags));
    let r = arith16(cpu, i_op(i.flags), dst, src);
    cpu.write_reg16(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_arith_r16i16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read_reg16(i_rm(i.flags));
    let r = arith16(cpu, i_op(i.flags), dst, i.imm as u16);
    cpu.write_reg16(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_arith_r16e16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
    let dst = cpu.read_reg16(i_reg(i.flags));
    let r = arith16(cpu, i_op(i.flags), dst, src);
    cpu.write_reg16(i_reg(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_arith_e16r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg16(i_reg(i.flags));
    rmw16!(cpu, i, |v| arith16(cpu, i_op(i.flags), v, src));
    Ok(Next)
}

pub(crate) fn op_arith_e16i16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    rmw16!(cpu, i, |v| arith16(cpu, i_op(i.flags), v, i.imm as u16));
    Ok(Next)
}

pub(crate) fn op_arith_r32r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.reg32[i_reg(i.flags)];
    let dst = cpu.reg32[i_rm(i.flags)];
    let r = arith32(cpu, i_op(i.flags), dst, src);
    cpu.reg32[i_rm(i.flags)] = r;
    Ok(Next)
}

pub(crate) fn op_arith_r32i32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.reg32[i_rm(i.flags)];
    let r = arith32(cpu, i_op(i.flags), dst, i.imm);
    cpu.reg32[i_rm(i.flags)] = r;
    Ok(Next)
}

pub(crate) fn op_arith_r32e32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    let dst = cpu.reg32[i_reg(i.flags)];
    let r = arith32(cpu, i_op(i.flags), dst, src);
    cpu.reg32[i_reg(i.flags)] = r;
    Ok(Next)
}

pub(crate) fn op_arith_e32r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.reg32[i_reg(i.flags)];
    rmw32!(cpu, i, |v| arith32(cpu, i_op(i.flags), v, src));
    Ok(Next)
}

pub(crate) fn op_arith_e32i32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    rmw32!(cpu, i, |v| arith32(cpu, i_op(i.flags), v, i.imm));
    Ok(Next)
}

// CMP / TEST: same sources, no write-back.

pub(crate) fn op_cmp_r8r8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg8(i_reg(i.flags));
    let dst = cpu.read_reg8(i_rm(i.flags));
    cmp8(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_r8i8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read_reg8(i_rm(i.flags));
    cmp8(cpu, dst, i.imm as u8);
    Ok(Next)
}

pub(crate) fn op_cmp_r8e8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
    let dst = cpu.read_reg8(i_reg(i.flags));
    cmp8(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_e8r8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
    let src = cpu.read_reg8(i_reg(i.flags));
    cmp8(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_e8i8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
    cmp8(cpu, dst, i.imm as u8);
    Ok(Next)
}

pub(crate) fn op_cmp_r16r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg16(i_reg(i.flags));
    let dst = cpu.read_reg16(i_rm(i.flags));
    cmp16(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_r16i16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read_reg16(i_rm(i.flags));
    cmp16(cpu, dst, i.imm as u16);
    Ok(Next)
}

pub(crate) fn op_cmp_r16e16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
    let dst = cpu.read_reg16(i_reg(i.flags));
    cmp16(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_e16r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
    let src = cpu.read_reg16(i_reg(i.flags));
    cmp16(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_e16i16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
    cmp16(cpu, dst, i.imm as u16);
    Ok(Next)
}

pub(crate) fn op_cmp_r32r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.reg32[i_reg(i.flags)];
    let dst = cpu.reg32[i_rm(i.flags)];
    cmp32(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_r32i32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.reg32[i_rm(i.flags)];
    cmp32(cpu, dst, i.imm);
    Ok(Next)
}

pub(crate) fn op_cmp_r32e32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    let dst = cpu.reg32[i_reg(i.flags)];
    cmp32(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_e32r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    let src = cpu.reg32[i_reg(i.flags)];
    cmp32(cpu, dst, src);
    Ok(Next)
}

pub(crate) fn op_cmp_e32i32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let dst = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    cmp32(cpu, dst, i.imm);
    Ok(Next)
}

pub(crate) fn op_test_r8r8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = cpu.read_reg8(i_rm(i.flags));
    let b = cpu.read_reg8(i_reg(i.flags));
    test8(cpu, a, b);
    Ok(Next)
}

pub(crate) fn op_test_r8i8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = cpu.read_reg8(i_rm(i.flags));
    test8(cpu, a, i.imm as u8);
    Ok(Next)
}

pub(crate) fn op_test_e8(cpu: &mut Cpu, i: &DecodedInsn, src: u8) -> HandlerResult {
    let a = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
    test8(cpu, a, src);
    Ok(Next)
}

pub(crate) fn op_test_r16r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = cpu.read_reg16(i_rm(i.flags));
    let b = cpu.read_reg16(i_reg(i.flags));
    test16(cpu, a, b);
    Ok(Next)
}

pub(crate) fn op_test_r16i16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = cpu.read_reg16(i_rm(i.flags));
    test16(cpu, a, i.imm as u16);
    Ok(Next)
}

pub(crate) fn op_test_e16(cpu: &mut Cpu, i: &DecodedInsn, src: u16) -> HandlerResult {
    let a = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
    test16(cpu, a, src);
    Ok(Next)
}

pub(crate) fn op_test_r32r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = cpu.reg32[i_rm(i.flags)];
    let b = cpu.reg32[i_reg(i.flags)];
    test32(cpu, a, b);
    Ok(Next)
}

pub(crate) fn op_test_r32i32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = cpu.reg32[i_rm(i.flags)];
    test32(cpu, a, i.imm);
    Ok(Next)
}

pub(crate) fn op_test_e32(cpu: &mut Cpu, i: &DecodedInsn, src: u32) -> HandlerResult {
    let a = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    test32(cpu, a, src);
    Ok(Next)
}

// INC/DEC/NOT/NEG.

pub(crate) fn op_incdec_r8(cpu: &mut Cpu, i: &DecodedInsn, dec: bool) -> HandlerResult {
    let v = cpu.read_reg8(i_rm(i.flags));
    let r = if dec { dec8(cpu, v) } else { inc8(cpu, v) };
    cpu.write_reg8(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_incdec_e8(cpu: &mut Cpu, i: &DecodedInsn, dec: bool) -> HandlerResult {
    rmw8!(cpu, i, |v| if dec { dec8(cpu, v) } else { inc8(cpu, v) });
    Ok(Next)
}

pub(crate) fn op_incdec_r16(cpu: &mut Cpu, i: &DecodedInsn, dec: bool) -> HandlerResult {
    let v = cpu.read_reg16(i_rm(i.flags));
    let r = if dec { dec16(cpu, v) } else { inc16(cpu, v) };
    cpu.write_reg16(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_incdec_e16(cpu: &mut Cpu, i: &DecodedInsn, dec: bool) -> HandlerResult {
    rmw16!(cpu, i, |v| if dec { dec16(cpu, v) } else { inc16(cpu, v) });
    Ok(Next)
}

pub(crate) fn op_incdec_r32(cpu: &mut Cpu, i: &DecodedInsn, dec: bool) -> HandlerResult {
    let v = cpu.reg32[i_rm(i.flags)];
    let r = if dec { dec32(cpu, v) } else { inc32(cpu, v) };
    cpu.reg32[i_rm(i.flags)] = r;
    Ok(Next)
}

pub(crate) fn op_incdec_e32(cpu: &mut Cpu, i: &DecodedInsn, dec: bool) -> HandlerResult {
    rmw32!(cpu, i, |v| if dec { dec32(cpu, v) } else { inc32(cpu, v) });
    Ok(Next)
}

pub(crate) fn op_notneg_r8(cpu: &mut Cpu, i: &DecodedInsn, neg: bool) -> HandlerResult {
    let v = cpu.read_reg8(i_rm(i.flags));
    let r = if neg { neg8(cpu, v) } else { !v };
    cpu.write_reg8(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_notneg_e8(cpu: &mut Cpu, i: &DecodedInsn, neg: bool) -> HandlerResult {
    rmw8!(cpu, i, |v| if neg { neg8(cpu, v) } else { !v });
    Ok(Next)
}

pub(crate) fn op_notneg_r16(cpu: &mut Cpu, i: &DecodedInsn, neg: bool) -> HandlerResult {
    let v = cpu.read_reg16(i_rm(i.flags));
    let r = if neg { neg16(cpu, v) } else { !v };
    cpu.write_reg16(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_notneg_e16(cpu: &mut Cpu, i: &DecodedInsn, neg: bool) -> HandlerResult {
    rmw16!(cpu, i, |v| if neg { neg16(cpu, v) } else { !v });
    Ok(Next)
}

pub(crate) fn op_notneg_r32(cpu: &mut Cpu, i: &DecodedInsn, neg: bool) -> HandlerResult {
    let v = cpu.reg32[i_rm(i.flags)];
    let r = if neg { neg32(cpu, v) } else { !v };
    cpu.reg32[i_rm(i.flags)] = r;
    Ok(Next)
}

pub(crate) fn op_notneg_e32(cpu: &mut Cpu, i: &DecodedInsn, neg: bool) -> HandlerResult {
    rmw32!(cpu, i, |v| if neg { neg32(cpu, v) } else { !v });
    Ok(Next)
}

// Shifts.

pub(crate) fn op_shift_r8(cpu: &mut Cpu, i: &DecodedInsn, count: u8) -> HandlerResult {
    let v = cpu.read_reg8(i_rm(i.flags));
    let r = shift8(cpu, i_op(i.flags), v, count);
    cpu.write_reg8(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_shift_e8(cpu: &mut Cpu, i: &DecodedInsn, count: u8) -> HandlerResult {
    rmw8!(cpu, i, |v| shift8(cpu, i_op(i.flags), v, count));
    Ok(Next)
}

pub(crate) fn op_shift_r16(cpu: &mut Cpu, i: &DecodedInsn, count: u8) -> HandlerResult {
    let v = cpu.read_reg16(i_rm(i.flags));
    let r = shift16(cpu, i_op(i.flags), v, count);
    cpu.write_reg16(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_shift_e16(cpu: &mut Cpu, i: &DecodedInsn, count: u8) -> HandlerResult {
    rmw16!(cpu, i, |v| shift16(cpu, i_op(i.flags), v, count));
    Ok(Next)
}

pub(crate) fn op_shift_r32(cpu: &mut Cpu, i: &DecodedInsn, count: u8) -> HandlerResult {
    let v = cpu.reg32[i_rm(i.flags)];
    let r = shift32(cpu, i_op(i.flags), v, count);
    cpu.reg32[i_rm(i.flags)] = r;
    Ok(Next)
}

pub(crate) fn op_shift_e32(cpu: &mut Cpu, i: &DecodedInsn, count: u8) -> HandlerResult {
    rmw32!(cpu, i, |v| shift32(cpu, i_op(i.flags), v, count));
    Ok(Next)
}

// Double shifts: `which` true = SHLD.

pub(crate) fn op_dshift_r16(
    cpu: &mut Cpu,
    i: &DecodedInsn,
    count: u8,
    left: bool,
) -> HandlerResult {
    let dst = cpu.read_reg16(i_rm(i.flags));
    let src = cpu.read_reg16(i_reg(i.flags));
    let r = if left {
        shld16(cpu, dst, src, count)
    } else {
        shrd16(cpu, dst, src, count)
    };
    cpu.write_reg16(i_rm(i.flags), r);
    Ok(Next)
}

pub(crate) fn op_dshift_e16(
    cpu: &mut Cpu,
    i: &DecodedInsn,
    count: u8,
    left: bool,
) -> HandlerResult {
    let src = cpu.read_reg16(i_reg(i.flags));
    rmw16!(cpu, i, |v| if left {
        shld16(cpu, v, src, count)
    } else {
        shrd16(cpu, v, src, count)
    });
    Ok(Next)
}

pub(crate) fn op_dshift_r32(
    cpu: &mut Cpu,
    i: &DecodedInsn,
    count: u8,
    left: bool,
) -> HandlerResult {
    let dst = cpu.reg32[i_rm(i.flags)];
    let src = cpu.reg32[i_reg(i.flags)];
    let r = if left {
        shld32(cpu, dst, src, count)
    } else {
        shrd32(cpu, dst, src, count)
    };
    cpu.reg32[i_rm(i.flags)] = r;
    Ok(Next)
}

pub(crate) fn op_dshift_e32(
    cpu: &mut Cpu,
    i: &DecodedInsn,
    count: u8,
    left: bool,
) -> HandlerResult {
    let src = cpu.reg32[i_reg(i.flags)];
    rmw32!(cpu, i, |v| if left {
        shld32(cpu, v, src, count)
    } else {
        shrd32(cpu, v, src, count)
    });
    Ok(Next)
}

// Multiply / divide.

pub(crate) fn op_muldiv_r8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg8(i_rm(i.flags));
    muldiv8(cpu, i_op(i.flags), src)?;
    Ok(Next)
}

pub(crate) fn op_muldiv_e8(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
    muldiv8(cpu, i_op(i.flags), src)?;
    Ok(Next)
}

pub(crate) fn op_muldiv_r16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read_reg16(i_rm(i.flags));
    muldiv16(cpu, i_op(i.flags), src)?;
    Ok(Next)
}

pub(crate) fn op_muldiv_e16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
    muldiv16(cpu, i_op(i.flags), src)?;
    Ok(Next)
}

pub(crate) fn op_muldiv_r32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.reg32[i_rm(i.flags)];
    muldiv32(cpu, i_op(i.flags), src)?;
    Ok(Next)
}

pub(crate) fn op_muldiv_e32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let src = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    muldiv32(cpu, i_op(i.flags), src)?;
    Ok(Next)
}

// Bit tests. Memory forms use the bit offset to address past the operand.

pub(crate) fn op_bt_rr16(cpu: &mut Cpu, i: &DecodedInsn, sub: u32) -> HandlerResult {
    let shift = cpu.read_reg16(i_reg(i.flags)) as u32 & 15;
    let v = cpu.read_reg16(i_rm(i.flags)) as u32;
    let r = bit_op(cpu, sub, v, shift);
    if sub & 3 != 0 {
        cpu.write_reg16(i_rm(i.flags), r as u16);
    }
    Ok(Next)
}

pub(crate) fn op_bt_rr32(cpu: &mut Cpu, i: &DecodedInsn, sub: u32) -> HandlerResult {
    let shift = cpu.reg32[i_reg(i.flags)] & 31;
    let v = cpu.reg32[i_rm(i.flags)];
    let r = bit_op(cpu, sub, v, shift);
    if sub & 3 != 0 {
        cpu.reg32[i_rm(i.flags)] = r;
    }
    Ok(Next)
}

pub(crate) fn op_bt_re16(cpu: &mut Cpu, i: &DecodedInsn, sub: u32) -> HandlerResult {
    let off = cpu.read_reg16(i_reg(i.flags)) as i16 as i32;
    let a = ea(cpu, i).wrapping_add(((off >> 4) as u32).wrapping_mul(2));
    let shift = (off & 15) as u32;
    if sub & 3 == 0 {
        let v = cpu.read16(a, cpu.tlb_shift_read)? as u32;
        cpu.set_cf(v >> shift & 1 != 0);
    } else {
        let s = cpu.tlb_shift_write;
        let v = cpu.read16(a, s)? as u32;
        let r = bit_op(cpu, sub, v, shift);
        cpu.write16(a, r as u16, s)?;
    }
    Ok(Next)
}

pub(crate) fn op_bt_re32(cpu: &mut Cpu, i: &DecodedInsn, sub: u32) -> HandlerResult {
    let off = cpu.reg32[i_reg(i.flags)] as i32;
    let a = ea(cpu, i).wrapping_add(((off >> 5) as u32).wrapping_mul(4));
    let shift = (off & 31) as u32;
    if sub & 3 == 0 {
        let v = cpu.read32(a, cpu.tlb_shift_read)?;
        cpu.set_cf(v >> shift & 1 != 0);
    } else {
        let s = cpu.tlb_shift_write;
        let v = cpu.read32(a, s)?;
        let r = bit_op(cpu, sub, v, shift);
        cpu.write32(a, r, s)?;
    }
    Ok(Next)
}

/// 0F BA group: bit ops with an immediate offset (no EA adjustment).
pub(crate) fn op_btgrp16(cpu: &mut Cpu, i: &DecodedInsn, is_mem: bool) -> HandlerResult {
    let sub = i_op3(i.flags);
    let shift = i.imm & 15;
    if is_mem {
        let a = ea(cpu, i);
        if sub & 3 == 0 {
            let v = cpu.read16(a, cpu.tlb_shift_read)? as u32;
            cpu.set_cf(v >> shift & 1 != 0);
        } else {
            let s = cpu.tlb_shift_write;
            let v = cpu.read16(a, s)? as u32;
            let r = bit_op(cpu, sub, v, shift);
            cpu.write16(a, r as u16, s)?;
        }
    } else {
        let v = cpu.read_reg16(i_rm(i.flags)) as u32;
        let r = bit_op(cpu, sub, v, shift);
        if sub & 3 != 0 {
            cpu.write_reg16(i_rm(i.flags), r as u16);
        }
    }
    Ok(Next)
}

pub(crate) fn op_btgrp32(cpu: &mut Cpu, i: &DecodedInsn, is_mem: bool) -> HandlerResult {
    let sub = i_op3(i.flags);
    let shift = i.imm & 31;
    if is_mem {
        let a = ea(cpu, i);
        if sub & 3 == 0 {
            let v = cpu.read32(a, cpu.tlb_shift_read)?;
            cpu.set_cf(v >> shift & 1 != 0);
        } else {
            let s = cpu.tlb_shift_write;
            let v = cpu.read32(a, s)?;
            let r = bit_op(cpu, sub, v, shift);
            cpu.write32(a, r, s)?;
        }
    } else {
        let v = cpu.reg32[i_rm(i.flags)];
        let r = bit_op(cpu, sub, v, shift);
        if sub & 3 != 0 {
            cpu.reg32[i_rm(i.flags)] = r;
        }
    }
    Ok(Next)
}

// CMPXCHG / XADD / BSWAP.

pub(crate) fn cmpxchg8(cpu: &mut Cpu, dst: u8, src: u8) -> (u8, bool) {
    cpu.lop2 = dst as u32;
    let al = cpu.read_reg8(EAX);
    cpu.lr = al.wrapping_sub(dst) as i8 as i32 as u32;
    cpu.laux = LAUX_SUB8;
    if cpu.lr == 0 {
        (src, true)
    } else {
        cpu.write_reg8(EAX, dst);
        (dst, false)
    }
}

pub(crate) fn cmpxchg16(cpu: &mut Cpu, dst: u16, src: u16) -> (u16, bool) {
    cpu.lop2 = dst as u32;
    let ax = cpu.read_reg16(EAX);
    cpu.lr = ax.wrapping_sub(dst) as i16 as i32 as u32;
    cpu.laux = LAUX_SUB16;
    if cpu.lr == 0 {
        (src, true)
    } else {
        cpu.write_reg16(EAX, dst);
        (dst, false)
    }
}

pub(crate) fn cmpxchg32(cpu: &mut Cpu, dst: u32, src: u32) -> (u32, bool) {
    cpu.lop2 = dst;
    let eax = cpu.reg32[EAX];
    cpu.lr = eax.wrapping_sub(dst);
    cpu.laux = LAUX_SUB32;
    if cpu.lr == 0 {
        (src, true)
    } else {
        cpu.reg32[EAX] = dst;
        (dst, false)
    }
}

pub(crate) fn op_cmpxchg8b(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let a = ea(cpu, i);
    let s = cpu.tlb_shift_write;
    let lo = cpu.read32(a, s)?;
    let hi = cpu.read32(a.wrapping_add(4), s)?;
    let old = (hi as u64) << 32 | lo as u64;
    let edx_eax = (cpu.reg32[EDX] as u64) << 32 | cpu.reg32[EAX] as u64;
    if old == edx_eax {
        cpu.write32(a, cpu.reg32[EBX], s)?;
        cpu.write32(a.wrapping_add(4), cpu.reg32[ECX], s)?;
        cpu.set_zf(true);
    } else {
        cpu.reg32[EAX] = lo;
        cpu.reg32[EDX] = hi;
        cpu.set_zf(false);
    }
    Ok(Next)
}

pub(crate) fn op_bswap16(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    // BSWAP of a 16-bit register is architecturally undefined; this core
    // yields zero.
    cpu.write_reg16(i_rm(i.flags), 0);
    Ok(Next)
}

pub(crate) fn op_bswap32(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    cpu.reg32[i_rm(i.flags)] = cpu.reg32[i_rm(i.flags)].swap_bytes();
    Ok(Next)
}

// BCD adjusts.

pub(crate) fn op_daa(cpu: &mut Cpu) -> HandlerResult {
    let mut al = cpu.read_reg8(EAX);
    let old_al = al;
    let old_cf = cpu.get_cf();
    let mut cf = false;
    let af = al & 0x0F > 9 || cpu.get_af();
    if af {
        al = al.wrapping_add(6);
        cf = old_cf || old_al > 0xF9;
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_add(0x60);
        cf = true;
    }
    cpu.write_reg8(EAX, al);
    set_znp8(cpu, al);
    cpu.set_af(af);
    cpu.set_cf(cf);
    Ok(Next)
}

pub(crate) fn op_das(cpu: &mut Cpu) -> HandlerResult {
    let mut al = cpu.read_reg8(EAX);
    let old_al = al;
    let old_cf = cpu.get_cf();
    let mut cf = false;
    let af = al & 0x0F > 9 || cpu.get_af();
    if af {
        al = al.wrapping_sub(6);
        cf = old_cf || old_al < 6;
    }
    if old_al > 0x99 || old_cf {
        al = al.wrapping_sub(0x60);
        cf = true;
    }
    cpu.write_reg8(EAX, al);
    set_znp8(cpu, al);
    cpu.set_af(af);
    cpu.set_cf(cf);
    Ok(Next)
}

pub(crate) fn op_aaa(cpu: &mut Cpu) -> HandlerResult {
    let mut ax = cpu.read_reg16(EAX);
    let set = ax & 0x0F > 9 || cpu.get_af();
    if set {
        ax = ax.wrapping_add(0x106);
    }
    ax &= 0xFF0F;
    cpu.write_reg16(EAX, ax);
    set_znp8(cpu, ax as u8);
    cpu.set_af(set);
    cpu.set_cf(set);
    Ok(Next)
}

pub(crate) fn op_aas(cpu: &mut Cpu) -> HandlerResult {
    let mut ax = cpu.read_reg16(EAX);
    let set = ax & 0x0F > 9 || cpu.get_af();
    if set {
        ax = ax.wrapping_sub(6);
        ax = ax.wrapping_sub(0x100);
    }
    ax &= 0xFF0F;
    cpu.write_reg16(EAX, ax);
    set_znp8(cpu, ax as u8);
    cpu.set_af(set);
    cpu.set_cf(set);
    Ok(Next)
}

pub(crate) fn op_aam(cpu: &mut Cpu, base: u8) -> HandlerResult {
    if base == 0 {
        cpu.exception(Exception::De);
        return Err(Abort);
    }
    let al = cpu.read_reg8(EAX);
    cpu.write_reg8(EAX + 4, al / base);
    let new_al = al % base;
    cpu.write_reg8(EAX, new_al);
    set_znp8(cpu, new_al);
    Ok(Next)
}

pub(crate) fn op_aad(cpu: &mut Cpu, base: u8) -> HandlerResult {
    let ax = cpu.read_reg16(EAX);
    let al = (ax as u8).wrapping_add(((ax >> 8) as u8).wrapping_mul(base));
    cpu.write_reg16(EAX, al as u16);
    set_znp8(cpu, al);
    Ok(Next)
}

/// SF/ZF/PF from an 8-bit result, the BCD instructions' flag posture.
fn set_znp8(cpu: &mut Cpu, v: u8) {
    cpu.lr = v as i8 as i32 as u32;
    cpu.laux = LAUX_BIT;
}

// Sign extensions.

pub(crate) fn op_cbw(cpu: &mut Cpu) -> HandlerResult {
    let al = cpu.read_reg8(EAX) as i8;
    cpu.write_reg16(EAX, al as i16 as u16);
    Ok(Next)
}

pub(crate) fn op_cwde(cpu: &mut Cpu) -> HandlerResult {
    cpu.reg32[EAX] = cpu.read_reg16(EAX) as i16 as i32 as u32;
    Ok(Next)
}

pub(crate) fn op_cwd(cpu: &mut Cpu) -> HandlerResult {
    let v = if cpu.read_reg16(EAX) & 0x8000 != 0 {
        0xFFFF
    } else {
        0
    };
    cpu.write_reg16(EDX, v);
    Ok(Next)
}

pub(crate) fn op_cdq(cpu: &mut Cpu) -> HandlerResult {
    cpu.reg32[EDX] = ((cpu.reg32[EAX] as i32) >> 31) as u32;
    Ok(Next)
}
