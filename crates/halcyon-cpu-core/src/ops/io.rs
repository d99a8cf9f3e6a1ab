//! Port I/O, including the I/O-permission-bitmap check for unprivileged and
//! V8086 callers.

use crate::ops::{Flow, HandlerResult, Next};
use crate::state::*;
use crate::Cpu;

impl Cpu {
    /// #GP unless the current privilege (or the TSS I/O bitmap) allows
    /// touching `size` ports starting at `port`.
    pub(crate) fn io_check_access(&mut self, port: u32, size: u32) -> OpResult {
        let needs_bitmap = self.cr[0] & CR0_PE != 0
            && (self.eflags & EFLAGS_VM != 0 || self.cpl > self.iopl());
        if !needs_bitmap {
            return Ok(());
        }
        let access = self.seg_access[SEG_TR];
        let ty = access_type(access);
        if ty != DESC_AVAILABLE_TSS_386 && ty != DESC_BUSY_TSS_386 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let base = self.seg_base[SEG_TR];
        let limit = self.seg_limit[SEG_TR];
        if limit < 0x67 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let io_offset = self.read16(base.wrapping_add(0x66), TLB_SYSTEM_READ)? as u32;
        if limit < io_offset + ((port + size) >> 3) {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        let mask = ((size << 1) - 1) << (port & 7);
        let bitmap =
            self.read16(base.wrapping_add(io_offset).wrapping_add(port >> 3), TLB_SYSTEM_READ)?
                as u32;
        if bitmap & mask != 0 {
            self.exception_with_code(Exception::Gp, 0);
            return Err(Abort);
        }
        Ok(())
    }

    /// Devices may shorten the slice after any outward-visible I/O; the
    /// current instruction still completes, the budget just collapses.
    pub(crate) fn poll_fast_return(&mut self) -> Flow {
        if self.devices.fast_return_requested() {
            self.request_loop_exit();
        }
        Next
    }
}

pub(crate) fn op_in8(cpu: &mut Cpu, port: u32) -> HandlerResult {
    cpu.io_check_access(port, 1)?;
    let v = cpu.devices.io_read8(port);
    cpu.write_reg8(EAX, v);
    Ok(Next)
}

pub(crate) fn op_in16(cpu: &mut Cpu, port: u32) -> HandlerResult {
    cpu.io_check_access(port, 2)?;
    let v = cpu.devices.io_read16(port);
    cpu.write_reg16(EAX, v);
    Ok(Next)
}

pub(crate) fn op_in32(cpu: &mut Cpu, port: u32) -> HandlerResult {
    cpu.io_check_access(port, 4)?;
    let v = cpu.devices.io_read32(port);
    cpu.reg32[EAX] = v;
    Ok(Next)
}

pub(crate) fn op_out8(cpu: &mut Cpu, port: u32) -> HandlerResult {
    cpu.io_check_access(port, 1)?;
    let v = cpu.read_reg8(EAX);
    cpu.devices.io_write8(port, v);
    Ok(cpu.poll_fast_return())
}

pub(crate) fn op_out16(cpu: &mut Cpu, port: u32) -> HandlerResult {
    cpu.io_check_access(port, 2)?;
    let v = cpu.read_reg16(EAX);
    cpu.devices.io_write16(port, v);
    Ok(cpu.poll_fast_return())
}

pub(crate) fn op_out32(cpu: &mut Cpu, port: u32) -> HandlerResult {
    cpu.io_check_access(port, 4)?;
    let v = cpu.reg32[EAX];
    cpu.devices.io_write32(port, v);
    Ok(cpu.poll_fast_return())
}
