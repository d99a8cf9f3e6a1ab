//! SSE and MMX execution. The decoder hands every vector instruction to one
//! of three entry points with the second opcode byte and prefix class in
//! `imm`; dispatch happens here on that pair, the way the FPU sorts out
//! D8..DF. MMX registers alias the x87 mantissas; XMM state lives in
//! `xmm32`/`mxcsr`.

use crate::decoder::{
    i_reg, i_rm, DecodedInsn, SSE_PREFIX_66, SSE_PREFIX_F2, SSE_PREFIX_F3, SSE_PREFIX_NONE,
};
use crate::fpu::TAG_VALID;
use crate::ops::{ea, HandlerResult, Next};
use crate::state::*;
use crate::Cpu;

const MXCSR_MASK: u32 = 0xFFFF;

// MXCSR exception flag bits (match the x87 layout).
const MXCSR_IE: u32 = 1 << 0;
const MXCSR_ZE: u32 = 1 << 2;
const MXCSR_OE: u32 = 1 << 3;
const MXCSR_UE: u32 = 1 << 4;
const MXCSR_PE: u32 = 1 << 5;

impl Cpu {
    /// Gate for SSE instructions: CR4.OSFXSR and !CR0.EM or #UD, CR0.TS
    /// gives #NM.
    fn sse_check(&mut self) -> OpResult {
        if self.cr[4] & CR4_OSFXSR == 0 || self.cr[0] & CR0_EM != 0 {
            self.exception(Exception::Ud);
            return Err(Abort);
        }
        if self.cr[0] & CR0_TS != 0 {
            self.exception(Exception::Nm);
            return Err(Abort);
        }
        Ok(())
    }

    /// Gate for MMX instructions; also claims the x87 state.
    fn mmx_check(&mut self) -> OpResult {
        if self.cr[0] & CR0_EM != 0 {
            self.exception(Exception::Ud);
            return Err(Abort);
        }
        if self.cr[0] & CR0_TS != 0 {
            self.exception(Exception::Nm);
            return Err(Abort);
        }
        if self.fpu.status_word & 0x80 != 0 {
            // Pending x87 exception surfaces first.
            if self.cr[0] & CR0_NE != 0 {
                self.exception(Exception::Mf);
            } else {
                self.devices.pic_raise_irq(13);
                self.request_loop_exit();
            }
            return Err(Abort);
        }
        // Any MMX touch makes the whole stack valid with TOS 0.
        self.fpu.ftop = 0;
        self.fpu.tag_word = {
            let mut t = 0;
            for i in 0..8 {
                t |= TAG_VALID << (i * 2);
            }
            t
        };
        Ok(())
    }

    #[inline]
    fn read_xmm(&self, n: usize) -> [u32; 4] {
        let b = n * 4;
        [
            self.xmm32[b],
            self.xmm32[b + 1],
            self.xmm32[b + 2],
            self.xmm32[b + 3],
        ]
    }

    #[inline]
    fn write_xmm(&mut self, n: usize, v: [u32; 4]) {
        let b = n * 4;
        self.xmm32[b..b + 4].copy_from_slice(&v);
    }

    #[inline]
    fn read_mmx(&self, n: usize) -> u64 {
        self.fpu.st[n & 7].sig
    }

    #[inline]
    fn write_mmx(&mut self, n: usize, v: u64) {
        self.fpu.st[n & 7].sig = v;
        self.fpu.st[n & 7].sign_exp = 0xFFFF;
    }

    /// OR soft-float style flags into MXCSR; unmasked ones raise #XM (or
    /// #UD without OSXMMEXCPT).
    fn sse_commit_flags(&mut self, flags: u32) -> OpResult {
        self.mxcsr |= flags;
        let unmasked = flags & !(self.mxcsr >> 7) & 0x3F;
        if unmasked != 0 {
            if self.cr[4] & CR4_OSXMMEXCPT != 0 {
                self.exception(Exception::Xm);
            } else {
                self.exception(Exception::Ud);
            }
            return Err(Abort);
        }
        Ok(())
    }
}

// --- lane helpers --------------------------------------------------------

#[inline]
fn to_u64x2(v: [u32; 4]) -> [u64; 2] {
    [
        v[0] as u64 | (v[1] as u64) << 32,
        v[2] as u64 | (v[3] as u64) << 32,
    ]
}

#[inline]
fn from_u64x2(v: [u64; 2]) -> [u32; 4] {
    [
        v[0] as u32,
        (v[0] >> 32) as u32,
        v[1] as u32,
        (v[1] >> 32) as u32,
    ]
}

/// Per-16-bit-lane map over a 64-bit value.
fn map16(v: u64, f: impl Fn(u16) -> u16) -> u64 {
    let mut out = 0u64;
    for lane in 0..4 {
        out |= (f((v >> (lane * 16)) as u16) as u64) << (lane * 16);
    }
    out
}

fn zip8(a: u64, b: u64, f: impl Fn(u8, u8) -> u8) -> u64 {
    let mut out = 0u64;
    for lane in 0..8 {
        let x = (a >> (lane * 8)) as u8;
        let y = (b >> (lane * 8)) as u8;
        out |= (f(x, y) as u64) << (lane * 8);
    }
    out
}

fn zip16(a: u64, b: u64, f: impl Fn(u16, u16) -> u16) -> u64 {
    let mut out = 0u64;
    for lane in 0..4 {
        let x = (a >> (lane * 16)) as u16;
        let y = (b >> (lane * 16)) as u16;
        out |= (f(x, y) as u64) << (lane * 16);
    }
    out
}

fn zip32(a: u64, b: u64, f: impl Fn(u32, u32) -> u32) -> u64 {
    let lo = f(a as u32, b as u32) as u64;
    let hi = f((a >> 32) as u32, (b >> 32) as u32) as u64;
    lo | hi << 32
}

/// The packed-shift trick: a lane shift with a precomputed mask word that
/// is all-ones in range and zero once the count saturates.
#[inline]
fn shift_mask(count: u64, limit: u32) -> u64 {
    if count < limit as u64 {
        !0
    } else {
        0
    }
}

fn psrlw(v: u64, count: u64) -> u64 {
    let m = shift_mask(count, 16);
    map16(v, |x| ((x as u64 >> (count & 15)) as u16) & m as u16)
}

fn psraw(v: u64, count: u64) -> u64 {
    let c = count.min(15) as u32;
    map16(v, |x| ((x as i16) >> c) as u16)
}

fn psllw(v: u64, count: u64) -> u64 {
    let m = shift_mask(count, 16);
    map16(v, |x| ((x as u64) << (count & 15)) as u16 & m as u16)
}

fn psrld(v: u64, count: u64) -> u64 {
    let m = shift_mask(count, 32);
    zip32(v, 0, |x, _| (x as u64 >> (count & 31)) as u32 & m as u32)
}

fn psrad(v: u64, count: u64) -> u64 {
    let c = count.min(31) as u32;
    zip32(v, 0, |x, _| ((x as i32) >> c) as u32)
}

fn pslld(v: u64, count: u64) -> u64 {
    let m = shift_mask(count, 32);
    zip32(v, 0, |x, _| ((x as u64) << (count & 31)) as u32 & m as u32)
}

fn psrlq(v: u64, count: u64) -> u64 {
    if count > 63 {
        0
    } else {
        v >> count
    }
}

fn psllq(v: u64, count: u64) -> u64 {
    if count > 63 {
        0
    } else {
        v << count
    }
}

// Scalar float helpers: host arithmetic with flag detection good enough
// for the guests this core targets.

fn f32_op(op: u8, a: f32, b: f32, flags: &mut u32) -> f32 {
    let r = match op {
        0x58 => a + b,
        0x59 => a * b,
        0x5C => a - b,
        0x5D => {
            if b < a {
                b
            } else {
                a
            }
        }
        0x5E => {
            if b == 0.0 && a != 0.0 && !a.is_nan() {
                *flags |= MXCSR_ZE;
            }
            a / b
        }
        _ => {
            if a < b {
                b
            } else {
                a
            }
        }
    };
    note_f32_flags(a, b, r, flags);
    r
}

fn note_f32_flags(a: f32, b: f32, r: f32, flags: &mut u32) {
    if r.is_nan() && !a.is_nan() && !b.is_nan() {
        *flags |= MXCSR_IE;
    }
    if r.is_infinite() && a.is_finite() && b.is_finite() {
        *flags |= MXCSR_OE | MXCSR_PE;
    }
    if r != 0.0 && r.is_finite() && r.abs() < f32::MIN_POSITIVE {
        *flags |= MXCSR_UE | MXCSR_PE;
    }
}

fn f64_op(op: u8, a: f64, b: f64, flags: &mut u32) -> f64 {
    let r = match op {
        0x58 => a + b,
        0x59 => a * b,
        0x5C => a - b,
        0x5D => {
            if b < a {
                b
            } else {
                a
            }
        }
        0x5E => {
            if b == 0.0 && a != 0.0 && !a.is_nan() {
                *flags |= MXCSR_ZE;
            }
            a / b
        }
        _ => {
            if a < b {
                b
            } else {
                a
            }
        }
    };
    if r.is_nan() && !a.is_nan() && !b.is_nan() {
        *flags |= MXCSR_IE;
    }
    r
}

// --- operand plumbing ----------------------------------------------------

/// Source of a 64-bit (MMX-width) operand.
fn mmx_src(cpu: &mut Cpu, i: &DecodedInsn, is_reg: bool) -> OpResult<u64> {
    if is_reg {
        Ok(cpu.read_mmx(i_rm(i.flags)))
    } else {
        cpu.read64(ea(cpu, i), cpu.tlb_shift_read)
    }
}

/// Source of a 128-bit operand; `aligned` faults #GP on a misaligned EA.
fn xmm_src(cpu: &mut Cpu, i: &DecodedInsn, is_reg: bool, aligned: bool) -> OpResult<[u32; 4]> {
    if is_reg {
        Ok(cpu.read_xmm(i_rm(i.flags)))
    } else {
        let a = ea(cpu, i);
        if aligned && a & 15 != 0 {
            cpu.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        cpu.read128(a, cpu.tlb_shift_read)
    }
}

fn xmm_store(cpu: &mut Cpu, i: &DecodedInsn, is_reg: bool, aligned: bool, v: [u32; 4]) -> OpResult {
    if is_reg {
        cpu.write_xmm(i_rm(i.flags), v);
        return Ok(());
    }
    let a = ea(cpu, i);
    if aligned && a & 15 != 0 {
        cpu.exception_with_code(Exception::Gp, 0);
        return Err(Abort);
    }
    cpu.write128(a, v, cpu.tlb_shift_write)
}

pub(crate) fn op_ldmxcsr(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    cpu.sse_check()?;
    let v = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
    if v & !MXCSR_MASK != 0 {
        cpu.exception_with_code(Exception::Gp, 0);
        return Err(Abort);
    }
    cpu.mxcsr = v;
    Ok(Next)
}

pub(crate) fn op_stmxcsr(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    cpu.sse_check()?;
    cpu.write32(ea(cpu, i), cpu.mxcsr, cpu.tlb_shift_write)?;
    Ok(Next)
}

/// 0F 71/72/73: shifts by immediate. The target is an MMX or XMM register
/// in the R/M field; the group sub-op rides in REG.
pub(crate) fn op_simd_shift_imm(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    let opcode = (i.imm & 0xFF) as u8;
    let prefix = i.imm >> 8 & 3;
    let count = (i.imm >> 16 & 0xFF) as u64;
    let sub = i_reg(i.flags);
    let reg = i_rm(i.flags);

    let shift64 = |v: u64| -> Option<u64> {
        Some(match (opcode, sub) {
            (0x71, 2) => psrlw(v, count),
            (0x71, 4) => psraw(v, count),
            (0x71, 6) => psllw(v, count),
            (0x72, 2) => psrld(v, count),
            (0x72, 4) => psrad(v, count),
            (0x72, 6) => pslld(v, count),
            (0x73, 2) => psrlq(v, count),
            (0x73, 6) => psllq(v, count),
            _ => return None,
        })
    };

    if prefix == SSE_PREFIX_66 {
        cpu.sse_check()?;
        let v = to_u64x2(cpu.read_xmm(reg));
        let r = match (opcode, sub) {
            // PSRLDQ/PSLLDQ shift the whole register by bytes.
            (0x73, 3) | (0x73, 7) => {
                let n = (count * 8).min(128) as u32;
                let wide = (v[1] as u128) << 64 | v[0] as u128;
                let w = if sub == 3 {
                    wide.checked_shr(n).unwrap_or(0)
                } else {
                    wide.checked_shl(n).unwrap_or(0)
                };
                [w as u64, (w >> 64) as u64]
            }
            _ => match (shift64(v[0]), shift64(v[1])) {
                (Some(lo), Some(hi)) => [lo, hi],
                _ => {
                    cpu.exception(Exception::Ud);
                    return Err(Abort);
                }
            },
        };
        cpu.write_xmm(reg, from_u64x2(r));
    } else {
        cpu.mmx_check()?;
        let v = cpu.read_mmx(reg);
        match shift64(v) {
            Some(r) => cpu.write_mmx(reg, r),
            None => {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
        }
    }
    Ok(Next)
}

/// Everything else in the vector space: `is_reg` says whether R/M named a
/// register operand.
pub(crate) fn op_simd(cpu: &mut Cpu, i: &DecodedInsn, is_reg: bool) -> HandlerResult {
    let opcode = (i.imm & 0xFF) as u8;
    let prefix = i.imm >> 8 & 3;
    let imm8 = (i.imm >> 16 & 0xFF) as u8;
    let reg = i_reg(i.flags);

    match opcode {
        0x77 => {
            // EMMS.
            cpu.mmx_check()?;
            cpu.fpu.tag_word = 0xFFFF;
            return Ok(Next);
        }

        // --- moves ---
        0x10 | 0x11 | 0x28 | 0x29 => {
            cpu.sse_check()?;
            let aligned = opcode & 0x28 == 0x28;
            let store = opcode & 1 != 0;
            match prefix {
                SSE_PREFIX_F3 if opcode < 0x12 => {
                    // MOVSS.
                    if store {
                        if is_reg {
                            let v = cpu.read_xmm(reg);
                            let mut d = cpu.read_xmm(i_rm(i.flags));
                            d[0] = v[0];
                            cpu.write_xmm(i_rm(i.flags), d);
                        } else {
                            let v = cpu.read_xmm(reg);
                            cpu.write32(ea(cpu, i), v[0], cpu.tlb_shift_write)?;
                        }
                    } else if is_reg {
                        let s = cpu.read_xmm(i_rm(i.flags));
                        let mut d = cpu.read_xmm(reg);
                        d[0] = s[0];
                        cpu.write_xmm(reg, d);
                    } else {
                        let v = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
                        cpu.write_xmm(reg, [v, 0, 0, 0]);
                    }
                }
                SSE_PREFIX_F2 if opcode < 0x12 => {
                    // MOVSD.
                    if store {
                        if is_reg {
                            let v = to_u64x2(cpu.read_xmm(reg));
                            let mut d = to_u64x2(cpu.read_xmm(i_rm(i.flags)));
                            d[0] = v[0];
                            cpu.write_xmm(i_rm(i.flags), from_u64x2(d));
                        } else {
                            let v = to_u64x2(cpu.read_xmm(reg));
                            cpu.write64(ea(cpu, i), v[0], cpu.tlb_shift_write)?;
                        }
                    } else if is_reg {
                        let s = to_u64x2(cpu.read_xmm(i_rm(i.flags)));
                        let mut d = to_u64x2(cpu.read_xmm(reg));
                        d[0] = s[0];
                        cpu.write_xmm(reg, from_u64x2(d));
                    } else {
                        let v = cpu.read64(ea(cpu, i), cpu.tlb_shift_read)?;
                        cpu.write_xmm(reg, from_u64x2([v, 0]));
                    }
                }
                _ => {
                    // MOVUPS/MOVAPS/MOVUPD/MOVAPD.
                    if store {
                        let v = cpu.read_xmm(reg);
                        xmm_store(cpu, i, is_reg, aligned, v)?;
                    } else {
                        let v = xmm_src(cpu, i, is_reg, aligned)?;
                        cpu.write_xmm(reg, v);
                    }
                }
            }
        }
        0x12 | 0x13 | 0x16 | 0x17 => {
            // MOVLPS/MOVHPS families (including the reg-reg MOVHLPS/MOVLHPS).
            cpu.sse_check()?;
            let high = opcode & 4 != 0;
            let store = opcode & 1 != 0;
            let mut d = to_u64x2(cpu.read_xmm(reg));
            if store {
                let v = if high { d[1] } else { d[0] };
                cpu.write64(ea(cpu, i), v, cpu.tlb_shift_write)?;
            } else {
                let v = if is_reg {
                    let s = to_u64x2(cpu.read_xmm(i_rm(i.flags)));
                    // MOVHLPS takes the high half, MOVLHPS the low.
                    if high {
                        s[0]
                    } else {
                        s[1]
                    }
                } else {
                    cpu.read64(ea(cpu, i), cpu.tlb_shift_read)?
                };
                if high {
                    d[1] = v;
                } else {
                    d[0] = v;
                }
                cpu.write_xmm(reg, from_u64x2(d));
            }
        }
        0x14 | 0x15 => {
            // UNPCKLPS/UNPCKHPS (+66: PD).
            cpu.sse_check()?;
            let s = xmm_src(cpu, i, is_reg, true)?;
            let d = cpu.read_xmm(reg);
            let r = if prefix == SSE_PREFIX_66 {
                let sd = to_u64x2(s);
                let dd = to_u64x2(d);
                if opcode == 0x14 {
                    from_u64x2([dd[0], sd[0]])
                } else {
                    from_u64x2([dd[1], sd[1]])
                }
            } else if opcode == 0x14 {
                [d[0], s[0], d[1], s[1]]
            } else {
                [d[2], s[2], d[3], s[3]]
            };
            cpu.write_xmm(reg, r);
        }
        0x2A => {
            // CVTSI2SS/CVTSI2SD from r/m32.
            cpu.sse_check()?;
            let v = if is_reg {
                cpu.reg32[i_rm(i.flags)]
            } else {
                cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?
            } as i32;
            match prefix {
                SSE_PREFIX_F3 => {
                    let mut d = cpu.read_xmm(reg);
                    d[0] = (v as f32).to_bits();
                    cpu.write_xmm(reg, d);
                }
                SSE_PREFIX_F2 => {
                    let mut d = to_u64x2(cpu.read_xmm(reg));
                    d[0] = (v as f64).to_bits();
                    cpu.write_xmm(reg, from_u64x2(d));
                }
                _ => {
                    cpu.exception(Exception::Ud);
                    return Err(Abort);
                }
            }
        }
        0x2C | 0x2D => {
            // CVT(T)SS2SI / CVT(T)SD2SI.
            cpu.sse_check()?;
            let truncate = opcode == 0x2C;
            let val: f64 = match prefix {
                SSE_PREFIX_F3 => {
                    let s = if is_reg {
                        cpu.read_xmm(i_rm(i.flags))[0]
                    } else {
                        cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?
                    };
                    f32::from_bits(s) as f64
                }
                SSE_PREFIX_F2 => {
                    let s = if is_reg {
                        to_u64x2(cpu.read_xmm(i_rm(i.flags)))[0]
                    } else {
                        cpu.read64(ea(cpu, i), cpu.tlb_shift_read)?
                    };
                    f64::from_bits(s)
                }
                _ => {
                    cpu.exception(Exception::Ud);
                    return Err(Abort);
                }
            };
            let out = if val.is_nan() || val >= 2147483648.0 || val < -2147483648.0 {
                cpu.sse_commit_flags(MXCSR_IE)?;
                i32::MIN
            } else if truncate {
                val.trunc() as i32
            } else {
                val.round_ties_even() as i32
            };
            cpu.reg32[reg] = out as u32;
        }
        0x2E | 0x2F => {
            // UCOMISS/COMISS (+66: SD).
            cpu.sse_check()?;
            let (a, b) = if prefix == SSE_PREFIX_66 {
                let s = if is_reg {
                    to_u64x2(cpu.read_xmm(i_rm(i.flags)))[0]
                } else {
                    cpu.read64(ea(cpu, i), cpu.tlb_shift_read)?
                };
                (
                    f64::from_bits(to_u64x2(cpu.read_xmm(reg))[0]),
                    f64::from_bits(s),
                )
            } else {
                let s = if is_reg {
                    cpu.read_xmm(i_rm(i.flags))[0]
                } else {
                    cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?
                };
                (
                    f32::from_bits(cpu.read_xmm(reg)[0]) as f64,
                    f32::from_bits(s) as f64,
                )
            };
            let (cf, pf, zf) = if a.is_nan() || b.is_nan() {
                if opcode == 0x2F {
                    cpu.sse_commit_flags(MXCSR_IE)?;
                }
                (true, true, true)
            } else if a < b {
                (true, false, false)
            } else if a > b {
                (false, false, false)
            } else {
                (false, false, true)
            };
            cpu.set_cf(cf);
            cpu.set_pf(pf);
            cpu.set_zf(zf);
            cpu.set_of(false);
            cpu.set_sf(false);
        }
        0x50 => {
            // MOVMSKPS.
            cpu.sse_check()?;
            if !is_reg {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
            let s = cpu.read_xmm(i_rm(i.flags));
            let mut mask = 0u32;
            for (n, w) in s.iter().enumerate() {
                mask |= (w >> 31) << n;
            }
            cpu.reg32[reg] = mask;
        }
        0x51 => {
            // SQRTPS/SS/SD.
            cpu.sse_check()?;
            match prefix {
                SSE_PREFIX_F3 => {
                    let s = if is_reg {
                        cpu.read_xmm(i_rm(i.flags))[0]
                    } else {
                        cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?
                    };
                    let x = f32::from_bits(s);
                    let mut flags = 0;
                    if x < 0.0 {
                        flags |= MXCSR_IE;
                    }
                    let mut d = cpu.read_xmm(reg);
                    d[0] = x.sqrt().to_bits();
                    cpu.sse_commit_flags(flags)?;
                    cpu.write_xmm(reg, d);
                }
                SSE_PREFIX_F2 => {
                    let s = if is_reg {
                        to_u64x2(cpu.read_xmm(i_rm(i.flags)))[0]
                    } else {
                        cpu.read64(ea(cpu, i), cpu.tlb_shift_read)?
                    };
                    let x = f64::from_bits(s);
                    let mut flags = 0;
                    if x < 0.0 {
                        flags |= MXCSR_IE;
                    }
                    let mut d = to_u64x2(cpu.read_xmm(reg));
                    d[0] = x.sqrt().to_bits();
                    cpu.sse_commit_flags(flags)?;
                    cpu.write_xmm(reg, from_u64x2(d));
                }
                _ => {
                    let s = xmm_src(cpu, i, is_reg, true)?;
                    let mut flags = 0;
                    let mut r = [0u32; 4];
                    for (n, w) in s.iter().enumerate() {
                        let x = f32::from_bits(*w);
                        if x < 0.0 {
                            flags |= MXCSR_IE;
                        }
                        r[n] = x.sqrt().to_bits();
                    }
                    cpu.sse_commit_flags(flags)?;
                    cpu.write_xmm(reg, r);
                }
            }
        }
        0x54..=0x57 => {
            // ANDPS/ANDNPS/ORPS/XORPS (identical for PD).
            cpu.sse_check()?;
            let s = to_u64x2(xmm_src(cpu, i, is_reg, true)?);
            let d = to_u64x2(cpu.read_xmm(reg));
            let f = |x: u64, y: u64| match opcode {
                0x54 => x & y,
                0x55 => !x & y,
                0x56 => x | y,
                _ => x ^ y,
            };
            cpu.write_xmm(reg, from_u64x2([f(d[0], s[0]), f(d[1], s[1])]));
        }
        0x58 | 0x59 | 0x5C | 0x5D | 0x5E | 0x5F => {
            // Packed/scalar float arithmetic.
            cpu.sse_check()?;
            let mut flags = 0u32;
            match prefix {
                SSE_PREFIX_NONE => {
                    let s = xmm_src(cpu, i, is_reg, true)?;
                    let d = cpu.read_xmm(reg);
                    let mut r = [0u32; 4];
                    for n in 0..4 {
                        r[n] = f32_op(
                            opcode,
                            f32::from_bits(d[n]),
                            f32::from_bits(s[n]),
                            &mut flags,
                        )
                        .to_bits();
                    }
                    cpu.sse_commit_flags(flags)?;
                    cpu.write_xmm(reg, r);
                }
                SSE_PREFIX_66 => {
                    let s = to_u64x2(xmm_src(cpu, i, is_reg, true)?);
                    let d = to_u64x2(cpu.read_xmm(reg));
                    let mut r = [0u64; 2];
                    for n in 0..2 {
                        r[n] = f64_op(
                            opcode,
                            f64::from_bits(d[n]),
                            f64::from_bits(s[n]),
                            &mut flags,
                        )
                        .to_bits();
                    }
                    cpu.sse_commit_flags(flags)?;
                    cpu.write_xmm(reg, from_u64x2(r));
                }
                SSE_PREFIX_F3 => {
                    let s = if is_reg {
                        cpu.read_xmm(i_rm(i.flags))[0]
                    } else {
                        cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?
                    };
                    let mut d = cpu.read_xmm(reg);
                    d[0] = f32_op(
                        opcode,
                        f32::from_bits(d[0]),
                        f32::from_bits(s),
                        &mut flags,
                    )
                    .to_bits();
                    cpu.sse_commit_flags(flags)?;
                    cpu.write_xmm(reg, d);
                }
                _ => {
                    let s = if is_reg {
                        to_u64x2(cpu.read_xmm(i_rm(i.flags)))[0]
                    } else {
                        cpu.read64(ea(cpu, i), cpu.tlb_shift_read)?
                    };
                    let mut d = to_u64x2(cpu.read_xmm(reg));
                    d[0] = f64_op(
                        opcode,
                        f64::from_bits(d[0]),
                        f64::from_bits(s),
                        &mut flags,
                    )
                    .to_bits();
                    cpu.sse_commit_flags(flags)?;
                    cpu.write_xmm(reg, from_u64x2(d));
                }
            }
        }

        // --- MMX/SSE2 integer ---
        0x60..=0x6B | 0x74..=0x76 | 0xD1..=0xDF | 0xE0..=0xE5 | 0xE7..=0xEF | 0xF1..=0xF6
        | 0xF8..=0xFE | 0x6E | 0x6F | 0x70 | 0x7E | 0x7F | 0xC4 | 0xC5 | 0xC6 => {
            return simd_int(cpu, i, is_reg, opcode, prefix, imm8);
        }

        _ => {
            cpu.exception(Exception::Ud);
            return Err(Abort);
        }
    }
    Ok(Next)
}

/// Integer lanes shared by the MMX and SSE2 (66-prefixed) forms.
fn simd_int(
    cpu: &mut Cpu,
    i: &DecodedInsn,
    is_reg: bool,
    opcode: u8,
    prefix: u32,
    imm8: u8,
) -> HandlerResult {
    let wide = prefix == SSE_PREFIX_66;
    let reg = i_reg(i.flags);

    // Special-cased forms first.
    match (opcode, prefix) {
        (0x6E, _) => {
            // MOVD from r/m32.
            let v = if is_reg {
                cpu.reg32[i_rm(i.flags)]
            } else {
                cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?
            };
            if wide {
                cpu.sse_check()?;
                cpu.write_xmm(reg, [v, 0, 0, 0]);
            } else {
                cpu.mmx_check()?;
                cpu.write_mmx(reg, v as u64);
            }
            return Ok(Next);
        }
        (0x7E, SSE_PREFIX_F3) => {
            // MOVQ xmm load.
            cpu.sse_check()?;
            let v = if is_reg {
                to_u64x2(cpu.read_xmm(i_rm(i.flags)))[0]
            } else {
                cpu.read64(ea(cpu, i), cpu.tlb_shift_read)?
            };
            cpu.write_xmm(reg, from_u64x2([v, 0]));
            return Ok(Next);
        }
        (0x7E, _) => {
            // MOVD to r/m32.
            let v = if wide {
                cpu.sse_check()?;
                cpu.read_xmm(reg)[0]
            } else {
                cpu.mmx_check()?;
                cpu.read_mmx(reg) as u32
            };
            if is_reg {
                cpu.reg32[i_rm(i.flags)] = v;
            } else {
                cpu.write32(ea(cpu, i), v, cpu.tlb_shift_write)?;
            }
            return Ok(Next);
        }
        (0x6F, _) | (0x7F, _) => {
            let store = opcode == 0x7F;
            if wide || prefix == SSE_PREFIX_F3 {
                // MOVDQA (66) / MOVDQU (F3).
                cpu.sse_check()?;
                let aligned = wide;
                if store {
                    let v = cpu.read_xmm(reg);
                    xmm_store(cpu, i, is_reg, aligned, v)?;
                } else {
                    let v = xmm_src(cpu, i, is_reg, aligned)?;
                    cpu.write_xmm(reg, v);
                }
            } else {
                cpu.mmx_check()?;
                if store {
                    let v = cpu.read_mmx(reg);
                    if is_reg {
                        cpu.write_mmx(i_rm(i.flags), v);
                    } else {
                        cpu.write64(ea(cpu, i), v, cpu.tlb_shift_write)?;
                    }
                } else {
                    let v = mmx_src(cpu, i, is_reg)?;
                    cpu.write_mmx(reg, v);
                }
            }
            return Ok(Next);
        }
        (0xD6, SSE_PREFIX_66) => {
            // MOVQ r/m64, xmm.
            cpu.sse_check()?;
            let v = to_u64x2(cpu.read_xmm(reg))[0];
            if is_reg {
                cpu.write_xmm(i_rm(i.flags), from_u64x2([v, 0]));
            } else {
                cpu.write64(ea(cpu, i), v, cpu.tlb_shift_write)?;
            }
            return Ok(Next);
        }
        (0xE7, _) => {
            // MOVNTQ/MOVNTDQ: plain stores here (no write combining).
            if is_reg {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
            if wide {
                cpu.sse_check()?;
                let v = cpu.read_xmm(reg);
                xmm_store(cpu, i, is_reg, true, v)?;
            } else {
                cpu.mmx_check()?;
                let v = cpu.read_mmx(reg);
                cpu.write64(ea(cpu, i), v, cpu.tlb_shift_write)?;
            }
            return Ok(Next);
        }
        (0x70, _) => {
            // PSHUFW / PSHUFD / PSHUFLW / PSHUFHW.
            let sel = imm8 as u32;
            match prefix {
                SSE_PREFIX_NONE => {
                    cpu.mmx_check()?;
                    let s = mmx_src(cpu, i, is_reg)?;
                    let mut r = 0u64;
                    for lane in 0..4 {
                        let pick = (sel >> (lane * 2) & 3) as u64;
                        r |= ((s >> (pick * 16)) & 0xFFFF) << (lane * 16);
                    }
                    cpu.write_mmx(reg, r);
                }
                SSE_PREFIX_66 => {
                    cpu.sse_check()?;
                    let s = xmm_src(cpu, i, is_reg, true)?;
                    let mut r = [0u32; 4];
                    for lane in 0..4 {
                        r[lane] = s[(sel >> (lane * 2) & 3) as usize];
                    }
                    cpu.write_xmm(reg, r);
                }
                _ => {
                    cpu.sse_check()?;
                    let s = xmm_src(cpu, i, is_reg, true)?;
                    let half = to_u64x2(s);
                    let (target, keep) = if prefix == SSE_PREFIX_F2 {
                        (half[0], half[1]) // PSHUFLW
                    } else {
                        (half[1], half[0]) // PSHUFHW
                    };
                    let mut shuffled = 0u64;
                    for lane in 0..4 {
                        let pick = (sel >> (lane * 2) & 3) as u64;
                        shuffled |= ((target >> (pick * 16)) & 0xFFFF) << (lane * 16);
                    }
                    let r = if prefix == SSE_PREFIX_F2 {
                        [shuffled, keep]
                    } else {
                        [keep, shuffled]
                    };
                    cpu.write_xmm(reg, from_u64x2(r));
                }
            }
            return Ok(Next);
        }
        (0xC4, _) => {
            // PINSRW.
            let v = if is_reg {
                cpu.reg32[i_rm(i.flags)] as u16
            } else {
                cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?
            };
            if wide {
                cpu.sse_check()?;
                let mut d = to_u64x2(cpu.read_xmm(reg));
                let lane = (imm8 & 7) as u64;
                let word = &mut d[(lane >> 2) as usize];
                let sh = (lane & 3) * 16;
                *word = (*word & !(0xFFFF << sh)) | (v as u64) << sh;
                cpu.write_xmm(reg, from_u64x2(d));
            } else {
                cpu.mmx_check()?;
                let mut d = cpu.read_mmx(reg);
                let sh = ((imm8 & 3) as u64) * 16;
                d = (d & !(0xFFFF << sh)) | (v as u64) << sh;
                cpu.write_mmx(reg, d);
            }
            return Ok(Next);
        }
        (0xC5, _) => {
            // PEXTRW (register source only).
            if !is_reg {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
            let v = if wide {
                cpu.sse_check()?;
                let s = to_u64x2(cpu.read_xmm(i_rm(i.flags)));
                let lane = (imm8 & 7) as u64;
                (s[(lane >> 2) as usize] >> ((lane & 3) * 16)) as u16
            } else {
                cpu.mmx_check()?;
                (cpu.read_mmx(i_rm(i.flags)) >> (((imm8 & 3) as u64) * 16)) as u16
            };
            cpu.reg32[reg] = v as u32;
            return Ok(Next);
        }
        (0xC6, _) => {
            // SHUFPS/SHUFPD.
            cpu.sse_check()?;
            let s = xmm_src(cpu, i, is_reg, true)?;
            let d = cpu.read_xmm(reg);
            let r = if wide {
                let sd = to_u64x2(s);
                let dd = to_u64x2(d);
                from_u64x2([dd[(imm8 & 1) as usize], sd[(imm8 >> 1 & 1) as usize]])
            } else {
                [
                    d[(imm8 & 3) as usize],
                    d[(imm8 >> 2 & 3) as usize],
                    s[(imm8 >> 4 & 3) as usize],
                    s[(imm8 >> 6 & 3) as usize],
                ]
            };
            cpu.write_xmm(reg, r);
            return Ok(Next);
        }
        (0xD7, _) => {
            // PMOVMSKB.
            if !is_reg {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
            let mask = if wide {
                cpu.sse_check()?;
                let s = to_u64x2(cpu.read_xmm(i_rm(i.flags)));
                let mut m = 0u32;
                for b in 0..8 {
                    m |= (((s[0] >> (b * 8 + 7)) & 1) as u32) << b;
                    m |= (((s[1] >> (b * 8 + 7)) & 1) as u32) << (b + 8);
                }
                m
            } else {
                cpu.mmx_check()?;
                let s = cpu.read_mmx(i_rm(i.flags));
                let mut m = 0u32;
                for b in 0..8 {
                    m |= (((s >> (b * 8 + 7)) & 1) as u32) << b;
                }
                m
            };
            cpu.reg32[reg] = mask;
            return Ok(Next);
        }
        _ => {}
    }

    // Uniform lane arithmetic: compute on 64-bit halves.
    let lane_op = |d: u64, s: u64| -> Option<u64> {
        Some(match opcode {
            0x60 => {
                // PUNPCKLBW.
                let mut r = 0u64;
                for n in 0..4 {
                    r |= ((d >> (n * 8)) & 0xFF) << (n * 16);
                    r |= ((s >> (n * 8)) & 0xFF) << (n * 16 + 8);
                }
                r
            }
            0x61 => {
                let mut r = 0u64;
                for n in 0..2 {
                    r |= ((d >> (n * 16)) & 0xFFFF) << (n * 32);
                    r |= ((s >> (n * 16)) & 0xFFFF) << (n * 32 + 16);
                }
                r
            }
            0x62 => (d & 0xFFFF_FFFF) | (s << 32),
            0x63 => {
                // PACKSSWB (one half worth).
                let mut r = 0u64;
                for n in 0..4 {
                    let x = (d >> (n * 16)) as i16;
                    r |= ((x.clamp(-128, 127) as i8 as u8) as u64) << (n * 8);
                }
                for n in 0..4 {
                    let x = (s >> (n * 16)) as i16;
                    r |= ((x.clamp(-128, 127) as i8 as u8) as u64) << (n * 8 + 32);
                }
                r
            }
            0x64 => zip8(d, s, |x, y| ((x as i8 > y as i8) as u8).wrapping_neg()),
            0x65 => zip16(d, s, |x, y| ((x as i16 > y as i16) as u16).wrapping_neg()),
            0x66 => zip32(d, s, |x, y| ((x as i32 > y as i32) as u32).wrapping_neg()),
            0x67 => {
                // PACKUSWB.
                let mut r = 0u64;
                for n in 0..4 {
                    let x = (d >> (n * 16)) as i16;
                    r |= (x.clamp(0, 255) as u64) << (n * 8);
                }
                for n in 0..4 {
                    let x = (s >> (n * 16)) as i16;
                    r |= (x.clamp(0, 255) as u64) << (n * 8 + 32);
                }
                r
            }
            0x68 => {
                let mut r = 0u64;
                for n in 0..4 {
                    r |= ((d >> (n * 8 + 32)) & 0xFF) << (n * 16);
                    r |= ((s >> (n * 8 + 32)) & 0xFF) << (n * 16 + 8);
                }
                r
            }
            0x69 => {
                let mut r = 0u64;
                for n in 0..2 {
                    r |= ((d >> (n * 16 + 32)) & 0xFFFF) << (n * 32);
                    r |= ((s >> (n * 16 + 32)) & 0xFFFF) << (n * 32 + 16);
                }
                r
            }
            0x6A => (d >> 32) | (s & 0xFFFF_FFFF_0000_0000),
            0x6B => {
                // PACKSSDW.
                let clamp = |x: i32| x.clamp(-32768, 32767) as u16 as u64;
                clamp(d as i32)
                    | clamp((d >> 32) as i32) << 16
                    | clamp(s as i32) << 32
                    | clamp((s >> 32) as i32) << 48
            }
            0x74 => zip8(d, s, |x, y| ((x == y) as u8).wrapping_neg()),
            0x75 => zip16(d, s, |x, y| ((x == y) as u16).wrapping_neg()),
            0x76 => zip32(d, s, |x, y| ((x == y) as u32).wrapping_neg()),
            0xD1 => psrlw(d, s & 0xFFFF_FFFF_FFFF_FFFF),
            0xD2 => psrld(d, s),
            0xD3 => psrlq(d, s),
            0xD4 => d.wrapping_add(s),
            0xD5 => zip16(d, s, |x, y| (x as i16 as i32).wrapping_mul(y as i16 as i32) as u16),
            0xD8 => zip8(d, s, |x, y| x.saturating_sub(y)),
            0xD9 => zip16(d, s, |x, y| x.saturating_sub(y)),
            0xDA => zip8(d, s, |x, y| x.min(y)),
            0xDB => d & s,
            0xDC => zip8(d, s, |x, y| x.saturating_add(y)),
            0xDD => zip16(d, s, |x, y| x.saturating_add(y)),
            0xDE => zip8(d, s, |x, y| x.max(y)),
            0xDF => !d & s,
            0xE0 => zip8(d, s, |x, y| ((x as u16 + y as u16 + 1) >> 1) as u8),
            0xE1 => psraw(d, s),
            0xE2 => psrad(d, s),
            0xE3 => zip16(d, s, |x, y| ((x as u32 + y as u32 + 1) >> 1) as u16),
            0xE4 => zip16(d, s, |x, y| ((x as u32 * y as u32) >> 16) as u16),
            0xE5 => {
                zip16(d, s, |x, y| {
                    (((x as i16 as i32) * (y as i16 as i32)) >> 16) as u16
                })
            }
            0xE8 => zip8(d, s, |x, y| (x as i8).saturating_sub(y as i8) as u8),
            0xE9 => zip16(d, s, |x, y| (x as i16).saturating_sub(y as i16) as u16),
            0xEA => zip16(d, s, |x, y| (x as i16).min(y as i16) as u16),
            0xEB => d | s,
            0xEC => zip8(d, s, |x, y| (x as i8).saturating_add(y as i8) as u8),
            0xED => zip16(d, s, |x, y| (x as i16).saturating_add(y as i16) as u16),
            0xEE => zip16(d, s, |x, y| (x as i16).max(y as i16) as u16),
            0xEF => d ^ s,
            0xF1 => psllw(d, s),
            0xF2 => pslld(d, s),
            0xF3 => psllq(d, s),
            0xF4 => (d as u32 as u64).wrapping_mul(s as u32 as u64),
            0xF5 => {
                // PMADDWD.
                let mut r = 0u64;
                for n in 0..2 {
                    let a0 = (d >> (n * 32)) as i16 as i32;
                    let a1 = (d >> (n * 32 + 16)) as i16 as i32;
                    let b0 = (s >> (n * 32)) as i16 as i32;
                    let b1 = (s >> (n * 32 + 16)) as i16 as i32;
                    let sum = a0.wrapping_mul(b0).wrapping_add(a1.wrapping_mul(b1));
                    r |= (sum as u32 as u64) << (n * 32);
                }
                r
            }
            0xF6 => {
                // PSADBW.
                let mut sum = 0u64;
                for n in 0..8 {
                    let x = (d >> (n * 8)) as u8;
                    let y = (s >> (n * 8)) as u8;
                    sum += x.abs_diff(y) as u64;
                }
                sum
            }
            0xF8 => zip8(d, s, |x, y| x.wrapping_sub(y)),
            0xF9 => zip16(d, s, |x, y| x.wrapping_sub(y)),
            0xFA => zip32(d, s, |x, y| x.wrapping_sub(y)),
            0xFB => d.wrapping_sub(s),
            0xFC => zip8(d, s, |x, y| x.wrapping_add(y)),
            0xFD => zip16(d, s, |x, y| x.wrapping_add(y)),
            0xFE => zip32(d, s, |x, y| x.wrapping_add(y)),
            _ => return None,
        })
    };

    // The by-register shifts take the full 64-bit count from the source,
    // applied to both halves; everything else zips halves independently.
    let shift_by_reg = matches!(opcode, 0xD1..=0xD3 | 0xE1 | 0xE2 | 0xF1..=0xF3);

    if wide {
        cpu.sse_check()?;
        let s = to_u64x2(xmm_src(cpu, i, is_reg, true)?);
        let d = to_u64x2(cpu.read_xmm(reg));
        let r = if shift_by_reg {
            match (lane_op(d[0], s[0]), lane_op(d[1], s[0])) {
                (Some(lo), Some(hi)) => [lo, hi],
                _ => {
                    cpu.exception(Exception::Ud);
                    return Err(Abort);
                }
            }
        } else {
            match (lane_op(d[0], s[0]), lane_op(d[1], s[1])) {
                (Some(lo), Some(hi)) => [lo, hi],
                _ => {
                    cpu.exception(Exception::Ud);
                    return Err(Abort);
                }
            }
        };
        cpu.write_xmm(reg, from_u64x2(r));
    } else {
        cpu.mmx_check()?;
        let s = mmx_src(cpu, i, is_reg)?;
        let d = cpu.read_mmx(reg);
        match lane_op(d, s) {
            Some(r) => cpu.write_mmx(reg, r),
            None => {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
        }
    }
    Ok(Next)
}
