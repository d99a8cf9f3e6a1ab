//! Instruction dispatch: one `match` over [`Op`], the data-movement
//! handlers that don't warrant their own module, and the outer execute
//! loop with its cycle budget and interrupt window.

use crate::decoder::{i_length, i_op, i_op3, i_reg, i_rm, DecodedInsn, Op};
use crate::ops::arith::*;
use crate::ops::ctrlflow::*;
use crate::ops::io::*;
use crate::ops::misc::*;
use crate::ops::simd;
use crate::ops::stack::*;
use crate::ops::string::*;
use crate::ops::{ea, ea_virt, Branch, HandlerResult, Next};
use crate::state::*;
use crate::Cpu;

impl Cpu {
    /// Look up the current trace, absorbing fetch faults (each one charges
    /// a cycle so a fault storm cannot pin the loop).
    fn fetch_with_budget(&mut self) -> Option<usize> {
        loop {
            match self.get_trace() {
                Ok(i) => return Some(i),
                Err(Abort) => {
                    self.cycles_to_run -= 1;
                    if self.cycles_to_run <= 0 {
                        return None;
                    }
                }
            }
        }
    }

    /// Run decoded instructions until the cycle budget drains or something
    /// forces an early return.
    pub(crate) fn execute(&mut self) {
        let Some(mut idx) = self.fetch_with_budget() else {
            return;
        };
        loop {
            let insn = self.trace_cache[idx];
            match step(self, &insn) {
                Ok(Next) => {
                    self.phys_eip = self.phys_eip.wrapping_add(i_length(insn.flags));
                    idx += 1;
                }
                Ok(Branch) => {
                    self.cycles_to_run -= 1;
                    if self.cycles_to_run <= 0 {
                        return;
                    }
                    match self.fetch_with_budget() {
                        Some(j) => idx = j,
                        None => return,
                    }
                    continue;
                }
                Err(Abort) => {
                    // An exception was delivered (EIP rewritten) or the
                    // instruction wants to resume; no cycle charged.
                    match self.fetch_with_budget() {
                        Some(j) => idx = j,
                        None => return,
                    }
                    continue;
                }
            }
            self.cycles_to_run -= 1;
            if self.cycles_to_run <= 0 {
                return;
            }
        }
    }
}

/// Execute one decoded instruction.
pub(crate) fn step(cpu: &mut Cpu, i: &DecodedInsn) -> HandlerResult {
    match i.op {
        Op::TraceEnd => Err(Abort),
        Op::Fatal => {
            log::error!("decoder produced an unfillable record");
            panic!("internal decode error at eip={:08x}", cpu.virt_eip());
        }
        Op::Ud => {
            cpu.exception(Exception::Ud);
            Err(Abort)
        }
        Op::Nop => Ok(Next),

        // Data movement.
        Op::MovR8R8 => {
            let v = cpu.read_reg8(i_reg(i.flags));
            cpu.write_reg8(i_rm(i.flags), v);
            Ok(Next)
        }
        Op::MovR8E8 => {
            let v = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
            cpu.write_reg8(i_reg(i.flags), v);
            Ok(Next)
        }
        Op::MovE8R8 => {
            let v = cpu.read_reg8(i_reg(i.flags));
            cpu.write8(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::MovR8I8 => {
            cpu.write_reg8(i_rm(i.flags), i.imm as u8);
            Ok(Next)
        }
        Op::MovE8I8 => {
            cpu.write8(ea(cpu, i), i.imm as u8, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::MovR16R16 => {
            let v = cpu.read_reg16(i_reg(i.flags));
            cpu.write_reg16(i_rm(i.flags), v);
            Ok(Next)
        }
        Op::MovR16E16 => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            cpu.write_reg16(i_reg(i.flags), v);
            Ok(Next)
        }
        Op::MovE16R16 => {
            let v = cpu.read_reg16(i_reg(i.flags));
            cpu.write16(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::MovR16I16 => {
            cpu.write_reg16(i_rm(i.flags), i.imm as u16);
            Ok(Next)
        }
        Op::MovE16I16 => {
            cpu.write16(ea(cpu, i), i.imm as u16, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::MovR32R32 => {
            cpu.reg32[i_rm(i.flags)] = cpu.reg32[i_reg(i.flags)];
            Ok(Next)
        }
        Op::MovR32E32 => {
            let v = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
            cpu.reg32[i_reg(i.flags)] = v;
            Ok(Next)
        }
        Op::MovE32R32 => {
            let v = cpu.reg32[i_reg(i.flags)];
            cpu.write32(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::MovR32I32 => {
            cpu.reg32[i_rm(i.flags)] = i.imm;
            Ok(Next)
        }
        Op::MovE32I32 => {
            cpu.write32(ea(cpu, i), i.imm, cpu.tlb_shift_write)?;
            Ok(Next)
        }

        Op::MovSR16 => {
            let v = cpu.read_reg16(i_rm(i.flags));
            mov_sreg(cpu, i_reg(i.flags), v)
        }
        Op::MovSE16 => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            mov_sreg(cpu, i_reg(i.flags), v)
        }
        Op::MovR16S => {
            let v = cpu.seg[i_reg(i.flags)];
            cpu.write_reg16(i_rm(i.flags), v);
            Ok(Next)
        }
        Op::MovR32S => {
            cpu.reg32[i_rm(i.flags)] = cpu.seg[i_reg(i.flags)] as u32;
            Ok(Next)
        }
        Op::MovE16S => {
            let v = cpu.seg[i_reg(i.flags)];
            cpu.write16(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }

        Op::XchgR8R8 => {
            let a = cpu.read_reg8(i_rm(i.flags));
            let b = cpu.read_reg8(i_reg(i.flags));
            cpu.write_reg8(i_rm(i.flags), b);
            cpu.write_reg8(i_reg(i.flags), a);
            Ok(Next)
        }
        Op::XchgR8E8 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let m = cpu.read8(a, s)?;
            let r = cpu.read_reg8(i_reg(i.flags));
            cpu.write8(a, r, s)?;
            cpu.write_reg8(i_reg(i.flags), m);
            Ok(Next)
        }
        Op::XchgR16R16 => {
            let a = cpu.read_reg16(i_rm(i.flags));
            let b = cpu.read_reg16(i_reg(i.flags));
            cpu.write_reg16(i_rm(i.flags), b);
            cpu.write_reg16(i_reg(i.flags), a);
            Ok(Next)
        }
        Op::XchgR16E16 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let m = cpu.read16(a, s)?;
            let r = cpu.read_reg16(i_reg(i.flags));
            cpu.write16(a, r, s)?;
            cpu.write_reg16(i_reg(i.flags), m);
            Ok(Next)
        }
        Op::XchgR32R32 => {
            cpu.reg32.swap(i_rm(i.flags), i_reg(i.flags));
            Ok(Next)
        }
        Op::XchgR32E32 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let m = cpu.read32(a, s)?;
            let r = cpu.reg32[i_reg(i.flags)];
            cpu.write32(a, r, s)?;
            cpu.reg32[i_reg(i.flags)] = m;
            Ok(Next)
        }

        Op::LeaR16 => {
            let v = ea_virt(cpu, i) as u16;
            cpu.write_reg16(i_reg(i.flags), v);
            Ok(Next)
        }
        Op::LeaR32 => {
            cpu.reg32[i_reg(i.flags)] = ea_virt(cpu, i);
            Ok(Next)
        }
        Op::Lfp16 => {
            let a = ea(cpu, i);
            let off = cpu.read16(a, cpu.tlb_shift_read)? as u32;
            let sel = cpu.read16(a.wrapping_add(2), cpu.tlb_shift_read)?;
            cpu.load_seg_value_mov(i_op(i.flags) as usize, sel)?;
            cpu.write_reg16(i_reg(i.flags), off as u16);
            Ok(Next)
        }
        Op::Lfp32 => {
            let a = ea(cpu, i);
            let off = cpu.read32(a, cpu.tlb_shift_read)?;
            let sel = cpu.read16(a.wrapping_add(4), cpu.tlb_shift_read)?;
            cpu.load_seg_value_mov(i_op(i.flags) as usize, sel)?;
            cpu.reg32[i_reg(i.flags)] = off;
            Ok(Next)
        }

        Op::MovzxR16R8 => {
            let v = cpu.read_reg8(i_rm(i.flags));
            cpu.write_reg16(i_reg(i.flags), v as u16);
            Ok(Next)
        }
        Op::MovzxR16E8 => {
            let v = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
            cpu.write_reg16(i_reg(i.flags), v as u16);
            Ok(Next)
        }
        Op::MovzxR32R8 => {
            cpu.reg32[i_reg(i.flags)] = cpu.read_reg8(i_rm(i.flags)) as u32;
            Ok(Next)
        }
        Op::MovzxR32E8 => {
            let v = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)?;
            cpu.reg32[i_reg(i.flags)] = v as u32;
            Ok(Next)
        }
        Op::MovzxR32R16 => {
            cpu.reg32[i_reg(i.flags)] = cpu.read_reg16(i_rm(i.flags)) as u32;
            Ok(Next)
        }
        Op::MovzxR32E16 => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            cpu.reg32[i_reg(i.flags)] = v as u32;
            Ok(Next)
        }
        Op::MovsxR16R8 => {
            let v = cpu.read_reg8(i_rm(i.flags)) as i8;
            cpu.write_reg16(i_reg(i.flags), v as i16 as u16);
            Ok(Next)
        }
        Op::MovsxR16E8 => {
            let v = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)? as i8;
            cpu.write_reg16(i_reg(i.flags), v as i16 as u16);
            Ok(Next)
        }
        Op::MovsxR32R8 => {
            cpu.reg32[i_reg(i.flags)] = cpu.read_reg8(i_rm(i.flags)) as i8 as i32 as u32;
            Ok(Next)
        }
        Op::MovsxR32E8 => {
            let v = cpu.read8(ea(cpu, i), cpu.tlb_shift_read)? as i8;
            cpu.reg32[i_reg(i.flags)] = v as i32 as u32;
            Ok(Next)
        }
        Op::MovsxR32R16 => {
            cpu.reg32[i_reg(i.flags)] = cpu.read_reg16(i_rm(i.flags)) as i16 as i32 as u32;
            Ok(Next)
        }
        Op::MovsxR32E16 => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as i16;
            cpu.reg32[i_reg(i.flags)] = v as i32 as u32;
            Ok(Next)
        }

        // Stack.
        Op::PushR16 => op_push_r16(cpu, i),
        Op::PushR32 => op_push_r32(cpu, i),
        Op::PushI16 => op_push_i16(cpu, i),
        Op::PushI32 => op_push_i32(cpu, i),
        Op::PushE16 => op_push_e16(cpu, i),
        Op::PushE32 => op_push_e32(cpu, i),
        Op::PopR16 => op_pop_r16(cpu, i),
        Op::PopR32 => op_pop_r32(cpu, i),
        Op::PopE16 => op_pop_e16(cpu, i),
        Op::PopE32 => op_pop_e32(cpu, i),
        Op::PushS16 => op_push_s16(cpu, i),
        Op::PushS32 => op_push_s32(cpu, i),
        Op::PopS16 => op_pop_s16(cpu, i),
        Op::PopS32 => op_pop_s32(cpu, i),
        Op::Pusha => op_pusha(cpu),
        Op::Pushad => op_pushad(cpu),
        Op::Popa => op_popa(cpu),
        Op::Popad => op_popad(cpu),
        Op::Enter16 => op_enter(cpu, i, false),
        Op::Enter32 => op_enter(cpu, i, true),
        Op::Leave16 => op_leave(cpu, false),
        Op::Leave32 => op_leave(cpu, true),

        // ALU.
        Op::ArithR8R8 => op_arith_r8r8(cpu, i),
        Op::ArithR8I8 => op_arith_r8i8(cpu, i),
        Op::ArithR8E8 => op_arith_r8e8(cpu, i),
        Op::ArithE8R8 => op_arith_e8r8(cpu, i),
        Op::ArithE8I8 => op_arith_e8i8(cpu, i),
        Op::ArithR16R16 => op_arith_r16r16(cpu, i),
        Op::ArithR16I16 => op_arith_r16i16(cpu, i),
        Op::ArithR16E16 => op_arith_r16e16(cpu, i),
        Op::ArithE16R16 => op_arith_e16r16(cpu, i),
        Op::ArithE16I16 => op_arith_e16i16(cpu, i),
        Op::ArithR32R32 => op_arith_r32r32(cpu, i),
        Op::ArithR32I32 => op_arith_r32i32(cpu, i),
        Op::ArithR32E32 => op_arith_r32e32(cpu, i),
        Op::ArithE32R32 => op_arith_e32r32(cpu, i),
        Op::ArithE32I32 => op_arith_e32i32(cpu, i),
        Op::CmpR8R8 => op_cmp_r8r8(cpu, i),
        Op::CmpR8I8 => op_cmp_r8i8(cpu, i),
        Op::CmpR8E8 => op_cmp_r8e8(cpu, i),
        Op::CmpE8R8 => op_cmp_e8r8(cpu, i),
        Op::CmpE8I8 => op_cmp_e8i8(cpu, i),
        Op::CmpR16R16 => op_cmp_r16r16(cpu, i),
        Op::CmpR16I16 => op_cmp_r16i16(cpu, i),
        Op::CmpR16E16 => op_cmp_r16e16(cpu, i),
        Op::CmpE16R16 => op_cmp_e16r16(cpu, i),
        Op::CmpE16I16 => op_cmp_e16i16(cpu, i),
        Op::CmpR32R32 => op_cmp_r32r32(cpu, i),
        Op::CmpR32I32 => op_cmp_r32i32(cpu, i),
        Op::CmpR32E32 => op_cmp_r32e32(cpu, i),
        Op::CmpE32R32 => op_cmp_e32r32(cpu, i),
        Op::CmpE32I32 => op_cmp_e32i32(cpu, i),
        Op::TestR8R8 => op_test_r8r8(cpu, i),
        Op::TestR8I8 => op_test_r8i8(cpu, i),
        Op::TestE8R8 => {
            let src = cpu.read_reg8(i_reg(i.flags));
            op_test_e8(cpu, i, src)
        }
        Op::TestE8I8 => {
            let src = i.imm as u8;
            op_test_e8(cpu, i, src)
        }
        Op::TestR16R16 => op_test_r16r16(cpu, i),
        Op::TestR16I16 => op_test_r16i16(cpu, i),
        Op::TestE16R16 => {
            let src = cpu.read_reg16(i_reg(i.flags));
            op_test_e16(cpu, i, src)
        }
        Op::TestE16I16 => {
            let src = i.imm as u16;
            op_test_e16(cpu, i, src)
        }
        Op::TestR32R32 => op_test_r32r32(cpu, i),
        Op::TestR32I32 => op_test_r32i32(cpu, i),
        Op::TestE32R32 => {
            let src = cpu.reg32[i_reg(i.flags)];
            op_test_e32(cpu, i, src)
        }
        Op::TestE32I32 => op_test_e32(cpu, i, i.imm),
        Op::IncR8 => op_incdec_r8(cpu, i, false),
        Op::IncE8 => op_incdec_e8(cpu, i, false),
        Op::IncR16 => op_incdec_r16(cpu, i, false),
        Op::IncE16 => op_incdec_e16(cpu, i, false),
        Op::IncR32 => op_incdec_r32(cpu, i, false),
        Op::IncE32 => op_incdec_e32(cpu, i, false),
        Op::DecR8 => op_incdec_r8(cpu, i, true),
        Op::DecE8 => op_incdec_e8(cpu, i, true),
        Op::DecR16 => op_incdec_r16(cpu, i, true),
        Op::DecE16 => op_incdec_e16(cpu, i, true),
        Op::DecR32 => op_incdec_r32(cpu, i, true),
        Op::DecE32 => op_incdec_e32(cpu, i, true),
        Op::NotR8 => op_notneg_r8(cpu, i, false),
        Op::NotE8 => op_notneg_e8(cpu, i, false),
        Op::NotR16 => op_notneg_r16(cpu, i, false),
        Op::NotE16 => op_notneg_e16(cpu, i, false),
        Op::NotR32 => op_notneg_r32(cpu, i, false),
        Op::NotE32 => op_notneg_e32(cpu, i, false),
        Op::NegR8 => op_notneg_r8(cpu, i, true),
        Op::NegE8 => op_notneg_e8(cpu, i, true),
        Op::NegR16 => op_notneg_r16(cpu, i, true),
        Op::NegE16 => op_notneg_e16(cpu, i, true),
        Op::NegR32 => op_notneg_r32(cpu, i, true),
        Op::NegE32 => op_notneg_e32(cpu, i, true),
        Op::MuldivR8 => op_muldiv_r8(cpu, i),
        Op::MuldivE8 => op_muldiv_e8(cpu, i),
        Op::MuldivR16 => op_muldiv_r16(cpu, i),
        Op::MuldivE16 => op_muldiv_e16(cpu, i),
        Op::MuldivR32 => op_muldiv_r32(cpu, i),
        Op::MuldivE32 => op_muldiv_e32(cpu, i),
        Op::ImulR16R16I16 => {
            let a = cpu.read_reg16(i_rm(i.flags));
            let r = imul16(cpu, a, i.imm as u16);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::ImulR16E16I16 => {
            let a = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            let r = imul16(cpu, a, i.imm as u16);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::ImulR32R32I32 => {
            let a = cpu.reg32[i_rm(i.flags)];
            let r = imul32(cpu, a, i.imm);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::ImulR32E32I32 => {
            let a = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
            let r = imul32(cpu, a, i.imm);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::ImulR16R16 => {
            let a = cpu.read_reg16(i_reg(i.flags));
            let b = cpu.read_reg16(i_rm(i.flags));
            let r = imul16(cpu, a, b);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::ImulR16E16 => {
            let a = cpu.read_reg16(i_reg(i.flags));
            let b = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            let r = imul16(cpu, a, b);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::ImulR32R32 => {
            let a = cpu.reg32[i_reg(i.flags)];
            let b = cpu.reg32[i_rm(i.flags)];
            let r = imul32(cpu, a, b);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::ImulR32E32 => {
            let a = cpu.reg32[i_reg(i.flags)];
            let b = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
            let r = imul32(cpu, a, b);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::ShiftR8Cl => {
            let c = cpu.read_reg8(ECX);
            op_shift_r8(cpu, i, c)
        }
        Op::ShiftR8I8 => op_shift_r8(cpu, i, i.imm as u8),
        Op::ShiftE8Cl => {
            let c = cpu.read_reg8(ECX);
            op_shift_e8(cpu, i, c)
        }
        Op::ShiftE8I8 => op_shift_e8(cpu, i, i.imm as u8),
        Op::ShiftR16Cl => {
            let c = cpu.read_reg8(ECX);
            op_shift_r16(cpu, i, c)
        }
        Op::ShiftR16I16 => op_shift_r16(cpu, i, i.imm as u8),
        Op::ShiftE16Cl => {
            let c = cpu.read_reg8(ECX);
            op_shift_e16(cpu, i, c)
        }
        Op::ShiftE16I16 => op_shift_e16(cpu, i, i.imm as u8),
        Op::ShiftR32Cl => {
            let c = cpu.read_reg8(ECX);
            op_shift_r32(cpu, i, c)
        }
        Op::ShiftR32I32 => op_shift_r32(cpu, i, i.imm as u8),
        Op::ShiftE32Cl => {
            let c = cpu.read_reg8(ECX);
            op_shift_e32(cpu, i, c)
        }
        Op::ShiftE32I32 => op_shift_e32(cpu, i, i.imm as u8),
        Op::ShrdR16R16I8 => op_dshift_r16(cpu, i, i.imm as u8, false),
        Op::ShrdR32R32I8 => op_dshift_r32(cpu, i, i.imm as u8, false),
        Op::ShrdR16R16Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_r16(cpu, i, c, false)
        }
        Op::ShrdR32R32Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_r32(cpu, i, c, false)
        }
        Op::ShrdE16R16I8 => op_dshift_e16(cpu, i, i.imm as u8, false),
        Op::ShrdE32R32I8 => op_dshift_e32(cpu, i, i.imm as u8, false),
        Op::ShrdE16R16Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_e16(cpu, i, c, false)
        }
        Op::ShrdE32R32Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_e32(cpu, i, c, false)
        }
        Op::ShldR16R16I8 => op_dshift_r16(cpu, i, i.imm as u8, true),
        Op::ShldR32R32I8 => op_dshift_r32(cpu, i, i.imm as u8, true),
        Op::ShldR16R16Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_r16(cpu, i, c, true)
        }
        Op::ShldR32R32Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_r32(cpu, i, c, true)
        }
        Op::ShldE16R16I8 => op_dshift_e16(cpu, i, i.imm as u8, true),
        Op::ShldE32R32I8 => op_dshift_e32(cpu, i, i.imm as u8, true),
        Op::ShldE16R16Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_e16(cpu, i, c, true)
        }
        Op::ShldE32R32Cl => {
            let c = cpu.read_reg8(ECX);
            op_dshift_e32(cpu, i, c, true)
        }
        Op::Cbw => op_cbw(cpu),
        Op::Cwde => op_cwde(cpu),
        Op::Cwd => op_cwd(cpu),
        Op::Cdq => op_cdq(cpu),
        Op::Daa => op_daa(cpu),
        Op::Das => op_das(cpu),
        Op::Aaa => op_aaa(cpu),
        Op::Aas => op_aas(cpu),
        Op::Aam => op_aam(cpu, i.imm as u8),
        Op::Aad => op_aad(cpu, i.imm as u8),

        // Bit ops.
        Op::Bt16RR => op_bt_rr16(cpu, i, 4),
        Op::Bt16RE => op_bt_re16(cpu, i, 4),
        Op::Bt32RR => op_bt_rr32(cpu, i, 4),
        Op::Bt32RE => op_bt_re32(cpu, i, 4),
        Op::Bts16RR => op_bt_rr16(cpu, i, 5),
        Op::Bts16RE => op_bt_re16(cpu, i, 5),
        Op::Bts32RR => op_bt_rr32(cpu, i, 5),
        Op::Bts32RE => op_bt_re32(cpu, i, 5),
        Op::Btr16RR => op_bt_rr16(cpu, i, 6),
        Op::Btr16RE => op_bt_re16(cpu, i, 6),
        Op::Btr32RR => op_bt_rr32(cpu, i, 6),
        Op::Btr32RE => op_bt_re32(cpu, i, 6),
        Op::Btc16RR => op_bt_rr16(cpu, i, 7),
        Op::Btc16RE => op_bt_re16(cpu, i, 7),
        Op::Btc32RR => op_bt_rr32(cpu, i, 7),
        Op::Btc32RE => op_bt_re32(cpu, i, 7),
        Op::BtGrp16R => op_btgrp16(cpu, i, false),
        Op::BtGrp16E => op_btgrp16(cpu, i, true),
        Op::BtGrp32R => op_btgrp32(cpu, i, false),
        Op::BtGrp32E => op_btgrp32(cpu, i, true),
        Op::Bsf16RR => {
            let src = cpu.read_reg16(i_rm(i.flags));
            let old = cpu.read_reg16(i_reg(i.flags));
            let r = bsf16(cpu, src, old);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::Bsf16RE => {
            let src = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            let old = cpu.read_reg16(i_reg(i.flags));
            let r = bsf16(cpu, src, old);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::Bsf32RR => {
            let src = cpu.reg32[i_rm(i.flags)];
            let old = cpu.reg32[i_reg(i.flags)];
            let r = bsf32(cpu, src, old);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::Bsf32RE => {
            let src = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
            let old = cpu.reg32[i_reg(i.flags)];
            let r = bsf32(cpu, src, old);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::Bsr16RR => {
            let src = cpu.read_reg16(i_rm(i.flags));
            let old = cpu.read_reg16(i_reg(i.flags));
            let r = bsr16(cpu, src, old);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::Bsr16RE => {
            let src = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            let old = cpu.read_reg16(i_reg(i.flags));
            let r = bsr16(cpu, src, old);
            cpu.write_reg16(i_reg(i.flags), r);
            Ok(Next)
        }
        Op::Bsr32RR => {
            let src = cpu.reg32[i_rm(i.flags)];
            let old = cpu.reg32[i_reg(i.flags)];
            let r = bsr32(cpu, src, old);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::Bsr32RE => {
            let src = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
            let old = cpu.reg32[i_reg(i.flags)];
            let r = bsr32(cpu, src, old);
            cpu.reg32[i_reg(i.flags)] = r;
            Ok(Next)
        }
        Op::Bswap16 => op_bswap16(cpu, i),
        Op::Bswap32 => op_bswap32(cpu, i),

        Op::CmpxchgR8R8 => {
            let src = cpu.read_reg8(i_reg(i.flags));
            let dst = cpu.read_reg8(i_rm(i.flags));
            let (r, _) = cmpxchg8(cpu, dst, src);
            cpu.write_reg8(i_rm(i.flags), r);
            Ok(Next)
        }
        Op::CmpxchgE8R8 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let src = cpu.read_reg8(i_reg(i.flags));
            let dst = cpu.read8(a, s)?;
            let (r, _) = cmpxchg8(cpu, dst, src);
            cpu.write8(a, r, s)?;
            Ok(Next)
        }
        Op::CmpxchgR16R16 => {
            let src = cpu.read_reg16(i_reg(i.flags));
            let dst = cpu.read_reg16(i_rm(i.flags));
            let (r, _) = cmpxchg16(cpu, dst, src);
            cpu.write_reg16(i_rm(i.flags), r);
            Ok(Next)
        }
        Op::CmpxchgE16R16 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let src = cpu.read_reg16(i_reg(i.flags));
            let dst = cpu.read16(a, s)?;
            let (r, _) = cmpxchg16(cpu, dst, src);
            cpu.write16(a, r, s)?;
            Ok(Next)
        }
        Op::CmpxchgR32R32 => {
            let src = cpu.reg32[i_reg(i.flags)];
            let dst = cpu.reg32[i_rm(i.flags)];
            let (r, _) = cmpxchg32(cpu, dst, src);
            cpu.reg32[i_rm(i.flags)] = r;
            Ok(Next)
        }
        Op::CmpxchgE32R32 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let src = cpu.reg32[i_reg(i.flags)];
            let dst = cpu.read32(a, s)?;
            let (r, _) = cmpxchg32(cpu, dst, src);
            cpu.write32(a, r, s)?;
            Ok(Next)
        }
        Op::Cmpxchg8bE64 => op_cmpxchg8b(cpu, i),
        Op::XaddR8R8 => {
            let src = cpu.read_reg8(i_reg(i.flags));
            let dst = cpu.read_reg8(i_rm(i.flags));
            let r = arith8(cpu, 0, dst, src);
            cpu.write_reg8(i_reg(i.flags), dst);
            cpu.write_reg8(i_rm(i.flags), r);
            Ok(Next)
        }
        Op::XaddE8R8 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let src = cpu.read_reg8(i_reg(i.flags));
            let dst = cpu.read8(a, s)?;
            let r = arith8(cpu, 0, dst, src);
            cpu.write8(a, r, s)?;
            cpu.write_reg8(i_reg(i.flags), dst);
            Ok(Next)
        }
        Op::XaddR16R16 => {
            let src = cpu.read_reg16(i_reg(i.flags));
            let dst = cpu.read_reg16(i_rm(i.flags));
            let r = arith16(cpu, 0, dst, src);
            cpu.write_reg16(i_reg(i.flags), dst);
            cpu.write_reg16(i_rm(i.flags), r);
            Ok(Next)
        }
        Op::XaddE16R16 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let src = cpu.read_reg16(i_reg(i.flags));
            let dst = cpu.read16(a, s)?;
            let r = arith16(cpu, 0, dst, src);
            cpu.write16(a, r, s)?;
            cpu.write_reg16(i_reg(i.flags), dst);
            Ok(Next)
        }
        Op::XaddR32R32 => {
            let src = cpu.reg32[i_reg(i.flags)];
            let dst = cpu.reg32[i_rm(i.flags)];
            let r = arith32(cpu, 0, dst, src);
            cpu.reg32[i_reg(i.flags)] = dst;
            cpu.reg32[i_rm(i.flags)] = r;
            Ok(Next)
        }
        Op::XaddE32R32 => {
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let src = cpu.reg32[i_reg(i.flags)];
            let dst = cpu.read32(a, s)?;
            let r = arith32(cpu, 0, dst, src);
            cpu.write32(a, r, s)?;
            cpu.reg32[i_reg(i.flags)] = dst;
            Ok(Next)
        }

        // Control flow.
        Op::JmpRel16 => op_jmp_rel16(cpu, i),
        Op::JmpRel32 => op_jmp_rel32(cpu, i),
        Op::JmpR16 => op_jmp_r16(cpu, i),
        Op::JmpR32 => op_jmp_r32(cpu, i),
        Op::JmpE16 => op_jmp_e16(cpu, i),
        Op::JmpE32 => op_jmp_e32(cpu, i),
        Op::Jmpf => {
            let eip_after = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.jmpf(i.imm, i.disp, eip_after)?;
            Ok(Branch)
        }
        Op::JmpfE16 => {
            let a = ea(cpu, i);
            let eip = cpu.read16(a, cpu.tlb_shift_read)? as u32;
            let cs = cpu.read16(a.wrapping_add(2), cpu.tlb_shift_read)? as u32;
            let eip_after = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.jmpf(eip, cs, eip_after)?;
            Ok(Branch)
        }
        Op::JmpfE32 => {
            let a = ea(cpu, i);
            let eip = cpu.read32(a, cpu.tlb_shift_read)?;
            let cs = cpu.read16(a.wrapping_add(4), cpu.tlb_shift_read)? as u32;
            let eip_after = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.jmpf(eip, cs, eip_after)?;
            Ok(Branch)
        }
        Op::CallJ16 => op_call_j16(cpu, i),
        Op::CallJ32 => op_call_j32(cpu, i),
        Op::CallR16 => op_call_r16(cpu, i),
        Op::CallR32 => op_call_r32(cpu, i),
        Op::CallE16 => op_call_e16(cpu, i),
        Op::CallE32 => op_call_e32(cpu, i),
        Op::CallfAp16 => {
            let oldeip = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.callf(i.imm & 0xFFFF, i.disp, oldeip, false)?;
            Ok(Branch)
        }
        Op::CallfAp32 => {
            let oldeip = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.callf(i.imm, i.disp, oldeip, true)?;
            Ok(Branch)
        }
        Op::CallfE16 => {
            let a = ea(cpu, i);
            let eip = cpu.read16(a, cpu.tlb_shift_read)? as u32;
            let cs = cpu.read16(a.wrapping_add(2), cpu.tlb_shift_read)? as u32;
            let oldeip = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.callf(eip, cs, oldeip, false)?;
            Ok(Branch)
        }
        Op::CallfE32 => {
            let a = ea(cpu, i);
            let eip = cpu.read32(a, cpu.tlb_shift_read)?;
            let cs = cpu.read16(a.wrapping_add(4), cpu.tlb_shift_read)? as u32;
            let oldeip = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.callf(eip, cs, oldeip, true)?;
            Ok(Branch)
        }
        Op::Ret16 => op_ret16(cpu, 0),
        Op::Ret32 => op_ret32(cpu, 0),
        Op::Ret16Iw => op_ret16(cpu, i.imm),
        Op::Ret32Iw => op_ret32(cpu, i.imm),
        Op::Retf16 => {
            let adjust = if i_op(i.flags) != 0 { i.imm } else { 0 };
            cpu.retf(adjust, false)?;
            Ok(Branch)
        }
        Op::Retf32 => {
            let adjust = if i_op(i.flags) != 0 { i.imm } else { 0 };
            cpu.retf(adjust, true)?;
            Ok(Branch)
        }
        Op::Iret16 => {
            let eip_after = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.iret(eip_after, false)?;
            Ok(Branch)
        }
        Op::Iret32 => {
            let eip_after = cpu.virt_eip().wrapping_add(i_length(i.flags));
            cpu.iret(eip_after, true)?;
            Ok(Branch)
        }
        Op::Jcc16 => op_jcc16(cpu, i),
        Op::Jcc32 => op_jcc32(cpu, i),
        Op::Jecxz16 => op_loop16(cpu, i, 3),
        Op::Jecxz32 => op_loop32(cpu, i, 3),
        Op::Loop16 => op_loop16(cpu, i, 2),
        Op::Loop32 => op_loop32(cpu, i, 2),
        Op::Loopz16 => op_loop16(cpu, i, 1),
        Op::Loopz32 => op_loop32(cpu, i, 1),
        Op::Loopnz16 => op_loop16(cpu, i, 0),
        Op::Loopnz32 => op_loop32(cpu, i, 0),
        Op::Int => op_int(cpu, i, i.imm as u8),
        Op::Int3 => op_int(cpu, i, 3),
        Op::Icebp => op_int(cpu, i, 1),
        Op::Into => op_into(cpu, i),
        Op::Bound16 => op_bound(cpu, i, false),
        Op::Bound32 => op_bound(cpu, i, true),
        Op::SetccR8 => {
            let v = cpu.cond(i_op3(i.flags)) as u8;
            cpu.write_reg8(i_rm(i.flags), v);
            Ok(Next)
        }
        Op::SetccE8 => {
            let v = cpu.cond(i_op3(i.flags)) as u8;
            cpu.write8(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::CmovR16R16 => {
            if cpu.cond(i_op3(i.flags)) {
                let v = cpu.read_reg16(i_rm(i.flags));
                cpu.write_reg16(i_reg(i.flags), v);
            }
            Ok(Next)
        }
        Op::CmovR16E16 => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            if cpu.cond(i_op3(i.flags)) {
                cpu.write_reg16(i_reg(i.flags), v);
            }
            Ok(Next)
        }
        Op::CmovR32R32 => {
            if cpu.cond(i_op3(i.flags)) {
                cpu.reg32[i_reg(i.flags)] = cpu.reg32[i_rm(i.flags)];
            }
            Ok(Next)
        }
        Op::CmovR32E32 => {
            let v = cpu.read32(ea(cpu, i), cpu.tlb_shift_read)?;
            if cpu.cond(i_op3(i.flags)) {
                cpu.reg32[i_reg(i.flags)] = v;
            }
            Ok(Next)
        }

        // Flags and misc.
        Op::Pushf16 => op_pushf(cpu, false),
        Op::Pushf32 => op_pushf(cpu, true),
        Op::Popf16 => op_popf(cpu, false),
        Op::Popf32 => op_popf(cpu, true),
        Op::Sahf => op_sahf(cpu),
        Op::Lahf => op_lahf(cpu),
        Op::Cmc => {
            let c = cpu.get_cf();
            cpu.set_cf(!c);
            Ok(Next)
        }
        Op::Clc => {
            cpu.set_cf(false);
            Ok(Next)
        }
        Op::Stc => {
            cpu.set_cf(true);
            Ok(Next)
        }
        Op::Cli => {
            if cpu.cr[0] & CR0_PE != 0
                && (cpu.eflags & EFLAGS_VM != 0 || cpu.cpl > cpu.iopl())
            {
                // CLI under VME clears VIF instead; without VME it faults.
                if cpu.eflags & EFLAGS_VM != 0 && cpu.cr[4] & CR4_VME != 0 {
                    cpu.eflags &= !EFLAGS_VIF;
                    return Ok(Next);
                }
                cpu.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            cpu.eflags &= !EFLAGS_IF;
            Ok(Next)
        }
        Op::Sti => {
            if cpu.cr[0] & CR0_PE != 0
                && (cpu.eflags & EFLAGS_VM != 0 || cpu.cpl > cpu.iopl())
            {
                if cpu.eflags & EFLAGS_VM != 0 && cpu.cr[4] & CR4_VME != 0 {
                    if cpu.eflags & EFLAGS_VIP != 0 {
                        cpu.exception_with_code(Exception::Gp, 0);
                        return Err(Abort);
                    }
                    cpu.eflags |= EFLAGS_VIF;
                    return Ok(Next);
                }
                cpu.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            if cpu.eflags & EFLAGS_IF == 0 {
                cpu.interrupt_guard();
            }
            cpu.eflags |= EFLAGS_IF;
            Ok(Next)
        }
        Op::Cld => {
            cpu.eflags &= !EFLAGS_DF;
            Ok(Next)
        }
        Op::Std => {
            cpu.eflags |= EFLAGS_DF;
            Ok(Next)
        }
        Op::Xlat => op_xlat(cpu, i),
        Op::Hlt => op_hlt(cpu, i),
        Op::Cpuid => op_cpuid(cpu),
        Op::Rdmsr => {
            if cpu.cpl != 0 && cpu.cr[0] & CR0_PE != 0 {
                cpu.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            op_rdmsr(cpu)
        }
        Op::Wrmsr => {
            if cpu.cpl != 0 && cpu.cr[0] & CR0_PE != 0 {
                cpu.exception_with_code(Exception::Gp, 0);
                return Err(Abort);
            }
            op_wrmsr(cpu)
        }
        Op::Rdtsc => op_rdtsc(cpu),
        Op::Sysenter => {
            cpu.sysenter()?;
            Ok(Branch)
        }
        Op::Sysexit => {
            cpu.sysexit()?;
            Ok(Branch)
        }

        // System tables.
        Op::Lgdt => op_lgdt(cpu, i),
        Op::Lidt => op_lidt(cpu, i),
        Op::Sgdt => op_sgdt(cpu, i),
        Op::Sidt => op_sidt(cpu, i),
        Op::LldtR => {
            let v = cpu.read_reg16(i_rm(i.flags));
            lldt(cpu, v)
        }
        Op::LldtE => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            lldt(cpu, v)
        }
        Op::SldtR => {
            let v = cpu.seg[SEG_LDTR];
            cpu.write_reg16(i_rm(i.flags), v);
            Ok(Next)
        }
        Op::SldtE => {
            let v = cpu.seg[SEG_LDTR];
            cpu.write16(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::LtrR => {
            let v = cpu.read_reg16(i_rm(i.flags));
            ltr(cpu, v)
        }
        Op::LtrE => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            ltr(cpu, v)
        }
        Op::StrR => {
            let v = cpu.seg[SEG_TR];
            cpu.write_reg16(i_rm(i.flags), v);
            Ok(Next)
        }
        Op::StrE => {
            let v = cpu.seg[SEG_TR];
            cpu.write16(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::SmswR16 => {
            let v = smsw(cpu) as u16;
            cpu.write_reg16(i_rm(i.flags), v);
            Ok(Next)
        }
        Op::SmswR32 => {
            cpu.reg32[i_rm(i.flags)] = smsw(cpu);
            Ok(Next)
        }
        Op::SmswE16 => {
            let v = smsw(cpu) as u16;
            cpu.write16(ea(cpu, i), v, cpu.tlb_shift_write)?;
            Ok(Next)
        }
        Op::LmswR => {
            let v = cpu.read_reg16(i_rm(i.flags));
            lmsw(cpu, v)
        }
        Op::LmswE => {
            let v = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)?;
            lmsw(cpu, v)
        }
        Op::Invlpg => op_invlpg(cpu, i),
        Op::Clts => op_clts(cpu),
        Op::InvdNop => Ok(Next),
        Op::Lar16R => {
            let sel = cpu.read_reg16(i_rm(i.flags)) as u32;
            if let Some(v) = lar(cpu, sel)? {
                cpu.write_reg16(i_reg(i.flags), v as u16);
            }
            Ok(Next)
        }
        Op::Lar16E => {
            let sel = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
            if let Some(v) = lar(cpu, sel)? {
                cpu.write_reg16(i_reg(i.flags), v as u16);
            }
            Ok(Next)
        }
        Op::Lar32R => {
            let sel = cpu.read_reg16(i_rm(i.flags)) as u32;
            if let Some(v) = lar(cpu, sel)? {
                cpu.reg32[i_reg(i.flags)] = v;
            }
            Ok(Next)
        }
        Op::Lar32E => {
            let sel = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
            if let Some(v) = lar(cpu, sel)? {
                cpu.reg32[i_reg(i.flags)] = v;
            }
            Ok(Next)
        }
        Op::Lsl16R => {
            let sel = cpu.read_reg16(i_rm(i.flags)) as u32;
            if let Some(v) = lsl(cpu, sel)? {
                cpu.write_reg16(i_reg(i.flags), v as u16);
            }
            Ok(Next)
        }
        Op::Lsl16E => {
            let sel = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
            if let Some(v) = lsl(cpu, sel)? {
                cpu.write_reg16(i_reg(i.flags), v as u16);
            }
            Ok(Next)
        }
        Op::Lsl32R => {
            let sel = cpu.read_reg16(i_rm(i.flags)) as u32;
            if let Some(v) = lsl(cpu, sel)? {
                cpu.reg32[i_reg(i.flags)] = v;
            }
            Ok(Next)
        }
        Op::Lsl32E => {
            let sel = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
            if let Some(v) = lsl(cpu, sel)? {
                cpu.reg32[i_reg(i.flags)] = v;
            }
            Ok(Next)
        }
        Op::VerrR => {
            let sel = cpu.read_reg16(i_rm(i.flags)) as u32;
            verify_segment_access(cpu, sel, false)?;
            Ok(Next)
        }
        Op::VerrE => {
            let sel = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
            verify_segment_access(cpu, sel, false)?;
            Ok(Next)
        }
        Op::VerwR => {
            let sel = cpu.read_reg16(i_rm(i.flags)) as u32;
            verify_segment_access(cpu, sel, true)?;
            Ok(Next)
        }
        Op::VerwE => {
            let sel = cpu.read16(ea(cpu, i), cpu.tlb_shift_read)? as u32;
            verify_segment_access(cpu, sel, true)?;
            Ok(Next)
        }
        Op::ArplR => {
            if !cpu.in_protected_mode() {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
            let dst = cpu.read_reg16(i_rm(i.flags));
            let src = cpu.read_reg16(i_reg(i.flags));
            let (r, changed) = arpl(cpu, dst, src);
            cpu.write_reg16(i_rm(i.flags), r);
            cpu.set_zf(changed);
            Ok(Next)
        }
        Op::ArplE => {
            if !cpu.in_protected_mode() {
                cpu.exception(Exception::Ud);
                return Err(Abort);
            }
            let a = ea(cpu, i);
            let s = cpu.tlb_shift_write;
            let dst = cpu.read16(a, s)?;
            let src = cpu.read_reg16(i_reg(i.flags));
            let (r, changed) = arpl(cpu, dst, src);
            cpu.write16(a, r, s)?;
            cpu.set_zf(changed);
            Ok(Next)
        }
        Op::MovCrR => op_mov_cr_r(cpu, i),
        Op::MovRCr => op_mov_r_cr(cpu, i),
        Op::MovDrR => op_mov_dr_r(cpu, i),
        Op::MovRDr => op_mov_r_dr(cpu, i),

        // Strings.
        Op::Movsb => op_movsb(cpu, i),
        Op::Movsw => op_movsw(cpu, i),
        Op::Movsd => op_movsd(cpu, i),
        Op::Cmpsb => op_cmpsb(cpu, i),
        Op::Cmpsw => op_cmpsw(cpu, i),
        Op::Cmpsd => op_cmpsd(cpu, i),
        Op::Stosb => op_stosb(cpu, i),
        Op::Stosw => op_stosw(cpu, i),
        Op::Stosd => op_stosd(cpu, i),
        Op::Lodsb => op_lodsb(cpu, i),
        Op::Lodsw => op_lodsw(cpu, i),
        Op::Lodsd => op_lodsd(cpu, i),
        Op::Scasb => op_scasb(cpu, i),
        Op::Scasw => op_scasw(cpu, i),
        Op::Scasd => op_scasd(cpu, i),
        Op::Insb => op_insb(cpu, i),
        Op::Insw => op_insw(cpu, i),
        Op::Insd => op_insd(cpu, i),
        Op::Outsb => op_outsb(cpu, i),
        Op::Outsw => op_outsw(cpu, i),
        Op::Outsd => op_outsd(cpu, i),

        // Port I/O.
        Op::In8I => op_in8(cpu, i.imm),
        Op::In16I => op_in16(cpu, i.imm),
        Op::In32I => op_in32(cpu, i.imm),
        Op::In8Dx => {
            let port = cpu.read_reg16(EDX) as u32;
            op_in8(cpu, port)
        }
        Op::In16Dx => {
            let port = cpu.read_reg16(EDX) as u32;
            op_in16(cpu, port)
        }
        Op::In32Dx => {
            let port = cpu.read_reg16(EDX) as u32;
            op_in32(cpu, port)
        }
        Op::Out8I => op_out8(cpu, i.imm),
        Op::Out16I => op_out16(cpu, i.imm),
        Op::Out32I => op_out32(cpu, i.imm),
        Op::Out8Dx => {
            let port = cpu.read_reg16(EDX) as u32;
            op_out8(cpu, port)
        }
        Op::Out16Dx => {
            let port = cpu.read_reg16(EDX) as u32;
            op_out16(cpu, port)
        }
        Op::Out32Dx => {
            let port = cpu.read_reg16(EDX) as u32;
            op_out32(cpu, port)
        }

        // FPU.
        Op::FpuMem => crate::fpu::op_fpu_mem(cpu, i),
        Op::FpuReg => crate::fpu::op_fpu_reg(cpu, i),
        Op::Fwait => crate::fpu::op_fwait(cpu),

        // SSE/MMX.
        Op::SimdE => simd::op_simd(cpu, i, false),
        Op::SimdR => simd::op_simd(cpu, i, true),
        Op::SimdShiftImm => simd::op_simd_shift_imm(cpu, i),
        Op::LdMxcsr => simd::op_ldmxcsr(cpu, i),
        Op::StMxcsr => simd::op_stmxcsr(cpu, i),
        Op::Fxsave => crate::fpu::op_fxsave(cpu, i),
        Op::Fxrstor => crate::fpu::op_fxrstor(cpu, i),
    }
}

/// MOV to a segment register; loading SS opens the one-instruction
/// interrupt window.
fn mov_sreg(cpu: &mut Cpu, seg: usize, val: u16) -> HandlerResult {
    cpu.load_seg_value_mov(seg, val)?;
    if seg == SS {
        cpu.interrupt_guard();
    }
    Ok(Next)
}

impl Cpu {
    /// Execute up to `cycles` instructions; returns the number actually
    /// retired. Mirrors the classic slice protocol: early exits leave the
    /// remainder in `refill_counter` and re-enter here.
    pub fn run(&mut self, cycles: i32) -> u64 {
        self.cycle_offset = cycles;
        self.cycles_to_run = cycles;
        self.refill_counter = 0;
        self.hlt_counter = 0;

        let begin = self.get_cycles();
        loop {
            if self.intr_line_state
                && self.eflags & EFLAGS_IF != 0
                && !self.interrupts_blocked
            {
                let vector = self.devices.pic_get_interrupt();
                let eip = self.virt_eip();
                let _ = self.interrupt(vector, None, IntKind::Hardware, eip);
                self.exit_reason = ExitReason::Normal;
            }

            if self.exit_reason == ExitReason::Hlt {
                return 0;
            }

            if self.interrupts_blocked {
                self.refill_counter = cycles;
                self.cycles = self.get_cycles();
                self.cycles_to_run = 1;
                self.cycle_offset = 1;
                self.interrupts_blocked = false;
            }

            self.execute();

            self.cycles = self.get_cycles();
            self.cycles_to_run = self.refill_counter;
            self.refill_counter = 0;
            self.cycle_offset = self.cycles_to_run;

            if self.cycles_to_run == 0 {
                break;
            }
        }
        let ran = self.get_cycles().wrapping_sub(begin);
        self.cycle_offset = 0;
        ran
    }

    /// Latch the INTR line (device side).
    pub fn raise_intr_line(&mut self) {
        self.intr_line_state = true;
    }

    pub fn lower_intr_line(&mut self) {
        self.intr_line_state = false;
    }

    /// Device request to stop executing as soon as possible, carrying an
    /// explicit exit reason.
    pub fn cancel_execution_cycle(&mut self, reason: ExitReason) {
        self.exit_reason = reason;
        self.cycles = self.get_cycles();
        self.cycles_to_run = 1;
        self.cycle_offset = 1;
        self.refill_counter = 0;
    }
}

