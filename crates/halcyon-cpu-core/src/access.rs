//! Guest memory access: the single-compare fast path and the slow path that
//! walks paging, splits unaligned accesses, and dispatches MMIO.
//!
//! The fast path computes `(addr | (tag >> shift)) & (size-1)`: one test
//! covering misalignment, missing entry, and denied permission. Anything
//! non-zero lands in `access_*`, which re-checks with full fidelity.

use crate::devices::MmioSize;
use crate::state::*;
use crate::Cpu;

impl Cpu {
    // --- fast paths -----------------------------------------------------

    #[inline]
    pub fn read8(&mut self, lin: u32, shift: u32) -> OpResult<u8> {
        let page = (lin >> 12) as usize;
        let tag = self.tlb_tags[page] as u32;
        if tag >> shift & 1 != 0 {
            self.access_read8(lin, shift).map(|v| v as u8)
        } else {
            Ok(self.mem[(self.tlb_bias[page] + lin as i64) as usize])
        }
    }

    #[inline]
    pub fn read16(&mut self, lin: u32, shift: u32) -> OpResult<u16> {
        let page = (lin >> 12) as usize;
        let tag = self.tlb_tags[page] as u32;
        if (lin | tag >> shift) & 1 != 0 {
            self.access_read16(lin, shift).map(|v| v as u16)
        } else {
            let a = (self.tlb_bias[page] + lin as i64) as usize;
            Ok(u16::from_le_bytes(self.mem[a..a + 2].try_into().unwrap()))
        }
    }

    #[inline]
    pub fn read32(&mut self, lin: u32, shift: u32) -> OpResult<u32> {
        let page = (lin >> 12) as usize;
        let tag = self.tlb_tags[page] as u32;
        if (lin | tag >> shift) & 3 != 0 {
            self.access_read32(lin, shift)
        } else {
            let a = (self.tlb_bias[page] + lin as i64) as usize;
            Ok(u32::from_le_bytes(self.mem[a..a + 4].try_into().unwrap()))
        }
    }

    #[inline]
    pub fn write8(&mut self, lin: u32, data: u8, shift: u32) -> OpResult {
        let page = (lin >> 12) as usize;
        let tag = self.tlb_tags[page] as u32;
        if tag >> shift & 1 != 0 {
            self.access_write8(lin, data as u32, shift)
        } else {
            self.mem[(self.tlb_bias[page] + lin as i64) as usize] = data;
            Ok(())
        }
    }

    #[inline]
    pub fn write16(&mut self, lin: u32, data: u16, shift: u32) -> OpResult {
        let page = (lin >> 12) as usize;
        let tag = self.tlb_tags[page] as u32;
        if (lin | tag >> shift) & 1 != 0 {
            self.access_write16(lin, data as u32, shift)
        } else {
            let a = (self.tlb_bias[page] + lin as i64) as usize;
            self.mem[a..a + 2].copy_from_slice(&data.to_le_bytes());
            Ok(())
        }
    }

    #[inline]
    pub fn write32(&mut self, lin: u32, data: u32, shift: u32) -> OpResult {
        let page = (lin >> 12) as usize;
        let tag = self.tlb_tags[page] as u32;
        if (lin | tag >> shift) & 3 != 0 {
            self.access_write32(lin, data, shift)
        } else {
            let a = (self.tlb_bias[page] + lin as i64) as usize;
            self.mem[a..a + 4].copy_from_slice(&data.to_le_bytes());
            Ok(())
        }
    }

    // Wider accesses compose 32-bit halves; SSE/FPU callers enforce their
    // own alignment rules first.

    pub(crate) fn read64(&mut self, lin: u32, shift: u32) -> OpResult<u64> {
        let lo = self.read32(lin, shift)? as u64;
        let hi = self.read32(lin.wrapping_add(4), shift)? as u64;
        Ok(lo | hi << 32)
    }

    pub(crate) fn write64(&mut self, lin: u32, data: u64, shift: u32) -> OpResult {
        self.write32(lin, data as u32, shift)?;
        self.write32(lin.wrapping_add(4), (data >> 32) as u32, shift)
    }

    pub(crate) fn read128(&mut self, lin: u32, shift: u32) -> OpResult<[u32; 4]> {
        Ok([
            self.read32(lin, shift)?,
            self.read32(lin.wrapping_add(4), shift)?,
            self.read32(lin.wrapping_add(8), shift)?,
            self.read32(lin.wrapping_add(12), shift)?,
        ])
    }

    pub(crate) fn write128(&mut self, lin: u32, data: [u32; 4], shift: u32) -> OpResult {
        for (i, d) in data.iter().enumerate() {
            self.write32(lin.wrapping_add(i as u32 * 4), *d, shift)?;
        }
        Ok(())
    }

    // --- slow paths -----------------------------------------------------

    /// Walk paging until the tag allows this access kind (one walk at most:
    /// either it inserts a usable entry or it faults).
    #[inline]
    fn ensure_entry(&mut self, lin: u32, shift: u32) -> OpResult {
        let tag = self.tlb_tags[(lin >> 12) as usize] as u32;
        if tag >> shift & 2 != 0 {
            self.mmu_translate(lin, shift)?;
        }
        Ok(())
    }

    fn read_phys8(&mut self, phys: u32) -> u32 {
        if phys >= self.memory_size || (0xA0000..0xC0000).contains(&phys) {
            self.devices.mmio_read(phys, MmioSize::Byte) & 0xFF
        } else {
            self.mem[phys as usize] as u32
        }
    }

    fn read_phys16(&mut self, phys: u32) -> u32 {
        if phys >= self.memory_size || (0xA0000..0xC0000).contains(&phys) {
            self.devices.mmio_read(phys, MmioSize::Word) & 0xFFFF
        } else {
            let a = phys as usize;
            u16::from_le_bytes(self.mem[a..a + 2].try_into().unwrap()) as u32
        }
    }

    fn write_phys8(&mut self, lin: u32, phys: u32, data: u32) {
        if phys >= self.memory_size || (0xA0000..0xC0000).contains(&phys) {
            self.devices.mmio_write(phys, data & 0xFF, MmioSize::Byte);
        } else {
            if self.smc_has_code(phys) {
                self.smc_invalidate(lin, phys);
            }
            self.mem[phys as usize] = data as u8;
        }
    }

    fn write_phys16(&mut self, lin: u32, phys: u32, data: u32) {
        if phys >= self.memory_size || (0xA0000..0xC0000).contains(&phys) {
            self.devices.mmio_write(phys, data & 0xFFFF, MmioSize::Word);
        } else {
            if self.smc_has_code(phys) {
                self.smc_invalidate(lin, phys);
            }
            let a = phys as usize;
            self.mem[a..a + 2].copy_from_slice(&(data as u16).to_le_bytes());
        }
    }

    fn write_phys32_smc(&mut self, lin: u32, phys: u32, data: u32) {
        if phys >= self.memory_size || (0xA0000..0xC0000).contains(&phys) {
            self.devices.mmio_write(phys, data, MmioSize::Dword);
        } else {
            if self.smc_has_code(phys) {
                self.smc_invalidate(lin, phys);
            }
            let a = phys as usize;
            self.mem[a..a + 4].copy_from_slice(&data.to_le_bytes());
        }
    }

    pub(crate) fn access_read8(&mut self, lin: u32, shift: u32) -> OpResult<u32> {
        self.ensure_entry(lin, shift)?;
        let phys = self.lin_to_phys(lin);
        let v = self.read_phys8(phys);
        self.read_result = v;
        Ok(v)
    }

    pub(crate) fn access_read16(&mut self, lin: u32, shift: u32) -> OpResult<u32> {
        if lin & 0xFFF == 0xFFF {
            // Page-boundary split: each half re-enters the fast path so both
            // pages fault (or not) on their own merits, in program order.
            let lo = self.read8(lin, shift)? as u32;
            let hi = self.read8(lin.wrapping_add(1), shift)? as u32;
            let v = lo | hi << 8;
            self.read_result = v;
            return Ok(v);
        }
        self.ensure_entry(lin, shift)?;
        let phys = self.lin_to_phys(lin);
        let v = self.read_phys16(phys);
        self.read_result = v;
        Ok(v)
    }

    pub(crate) fn access_read32(&mut self, lin: u32, shift: u32) -> OpResult<u32> {
        if lin & 0xFFF > 0xFFC {
            let lo = self.read16(lin, shift)? as u32;
            let hi = self.read16(lin.wrapping_add(2), shift)? as u32;
            let v = lo | hi << 16;
            self.read_result = v;
            return Ok(v);
        }
        self.ensure_entry(lin, shift)?;
        let phys = self.lin_to_phys(lin);
        let v = if phys >= self.memory_size || (0xA0000..0xC0000).contains(&phys) {
            self.devices.mmio_read(phys, MmioSize::Dword)
        } else {
            let a = phys as usize;
            u32::from_le_bytes(self.mem[a..a + 4].try_into().unwrap())
        };
        self.read_result = v;
        Ok(v)
    }

    pub(crate) fn access_write8(&mut self, lin: u32, data: u32, shift: u32) -> OpResult {
        self.ensure_entry(lin, shift)?;
        let phys = self.lin_to_phys(lin);
        self.write_phys8(lin, phys, data);
        Ok(())
    }

    pub(crate) fn access_write16(&mut self, lin: u32, data: u32, shift: u32) -> OpResult {
        // Split at 128-byte lines, not just pages: the SMC bitmap reasons
        // about one line at a time.
        if lin & 127 == 127 {
            self.write8(lin, data as u8, shift)?;
            return self.write8(lin.wrapping_add(1), (data >> 8) as u8, shift);
        }
        self.ensure_entry(lin, shift)?;
        let phys = self.lin_to_phys(lin);
        self.write_phys16(lin, phys, data);
        Ok(())
    }

    pub(crate) fn access_write32(&mut self, lin: u32, data: u32, shift: u32) -> OpResult {
        if lin & 127 > 124 {
            self.write16(lin, data as u16, shift)?;
            return self.write16(lin.wrapping_add(2), (data >> 16) as u16, shift);
        }
        self.ensure_entry(lin, shift)?;
        let phys = self.lin_to_phys(lin);
        self.write_phys32_smc(lin, phys, data);
        Ok(())
    }

    /// Pre-translate a linear range so later accesses cannot fault halfway
    /// (task-switch state write-back relies on this).
    pub(crate) fn access_verify(&mut self, start: u32, end: u32, shift: u32) -> OpResult {
        let mut page = start & !0xFFF;
        loop {
            self.ensure_entry(page, shift)?;
            if page >= end & !0xFFF {
                return Ok(());
            }
            page = page.wrapping_add(0x1000);
        }
    }

    // --- stack ----------------------------------------------------------

    pub(crate) fn push16(&mut self, data: u16) -> OpResult {
        let esp = self.reg32[ESP];
        let mask = self.esp_mask;
        let new_esp = esp.wrapping_sub(2) & mask;
        self.write16(
            new_esp.wrapping_add(self.seg_base[SS]),
            data,
            self.tlb_shift_write,
        )?;
        self.reg32[ESP] = new_esp | (esp & !mask);
        Ok(())
    }

    pub(crate) fn push32(&mut self, data: u32) -> OpResult {
        let esp = self.reg32[ESP];
        let mask = self.esp_mask;
        let new_esp = esp.wrapping_sub(4) & mask;
        self.write32(
            new_esp.wrapping_add(self.seg_base[SS]),
            data,
            self.tlb_shift_write,
        )?;
        self.reg32[ESP] = new_esp | (esp & !mask);
        Ok(())
    }

    pub(crate) fn pop16(&mut self) -> OpResult<u16> {
        let esp = self.reg32[ESP];
        let mask = self.esp_mask;
        let v = self.read16(
            (esp & mask).wrapping_add(self.seg_base[SS]),
            self.tlb_shift_read,
        )?;
        self.reg32[ESP] = (esp.wrapping_add(2) & mask) | (esp & !mask);
        Ok(v)
    }

    pub(crate) fn pop32(&mut self) -> OpResult<u32> {
        let esp = self.reg32[ESP];
        let mask = self.esp_mask;
        let v = self.read32(
            (esp & mask).wrapping_add(self.seg_base[SS]),
            self.tlb_shift_read,
        )?;
        self.reg32[ESP] = (esp.wrapping_add(4) & mask) | (esp & !mask);
        Ok(v)
    }

    // --- DMA ------------------------------------------------------------

    /// Device-side write into guest RAM; keeps the code cache coherent.
    pub fn write_mem_bytes(&mut self, addr: u32, data: &[u8]) {
        let end = (addr as usize + data.len()).min(self.mem.len());
        let len = end.saturating_sub(addr as usize);
        self.mem[addr as usize..end].copy_from_slice(&data[..len]);
        let mut page = addr & !0xFFF;
        while page < addr.wrapping_add(data.len() as u32) {
            if self.smc_page_has_code(page) {
                self.smc_invalidate_page(page);
            }
            page = page.wrapping_add(0x1000);
        }
    }
}
