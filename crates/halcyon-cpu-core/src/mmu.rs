//! Linear-to-physical translation: the tagged TLB and the 32-bit paging
//! walk.
//!
//! Each TLB entry carries a biased offset (`phys - lin`) so that adding the
//! full linear address yields the physical address, plus a tag byte of four
//! 2-bit fields, one per supervisor/user read/write pair. Bit 0 of a field
//! means the
//! access must take the slow path (MMIO, out-of-RAM, or code-tagged page);
//! bit 1 means the entry is absent or protection denies the access kind.

use bitflags::bitflags;

use crate::state::*;
use crate::Cpu;

bitflags! {
    /// PDE/PTE bits consulted by the walker.
    #[derive(Clone, Copy, PartialEq, Eq, Debug)]
    pub struct Pte: u32 {
        const P = 1 << 0;
        const RW = 1 << 1;
        const US = 1 << 2;
        const PS = 1 << 7;
        const G = 1 << 8;
        const A = 1 << 5;
        const D = 1 << 6;
    }
}

impl Cpu {
    /// Drop every live TLB entry, walking only the occupied-index list.
    pub fn mmu_tlb_flush(&mut self) {
        for i in 0..self.tlb_entry_indexes.len() {
            let entry = self.tlb_entry_indexes[i] as usize;
            self.tlb_bias[entry] = 0;
            self.tlb_tags[entry] = 0xFF;
            self.tlb_attrs[entry] = 0xFF;
        }
        self.tlb_entry_indexes.clear();
    }

    /// Drop only entries not marked global (MOV CR3 with CR4.PGE set).
    pub fn mmu_tlb_flush_nonglobal(&mut self) {
        let mut kept = Vec::with_capacity(self.tlb_entry_indexes.len());
        for i in 0..self.tlb_entry_indexes.len() {
            let entry = self.tlb_entry_indexes[i] as usize;
            if self.tlb_attrs[entry] & TLB_ATTR_NON_GLOBAL != 0 {
                self.tlb_bias[entry] = 0;
                self.tlb_tags[entry] = 0xFF;
                self.tlb_attrs[entry] = 0xFF;
            } else {
                kept.push(entry as u32);
            }
        }
        self.tlb_entry_indexes = kept;
    }

    /// INVLPG: drop a single page.
    pub fn mmu_tlb_invalidate(&mut self, lin: u32) {
        let page = (lin >> 12) as usize;
        self.tlb_bias[page] = 0;
        self.tlb_tags[page] = 0xFF;
        self.tlb_attrs[page] = 0xFF;
    }

    fn set_tlb_entry(&mut self, lin: u32, phys: u32, user: bool, write: bool, attrs: u8) {
        // The A20 gate is folded in here so per-access masking is free.
        let mut phys = phys & self.a20_mask;

        // Reset-vector alias: the top of the physical address space shadows
        // the low megabyte, 286-style.
        if phys >= 0xFFF0_0000 {
            phys &= 0xFFFFF;
        }

        let mut tag = 0u32;
        let mut tag_write = 0u32;
        if (0xA0000..0x100000).contains(&phys) {
            // VGA window is MMIO both ways; the ROM shadow above 0xC0000 is
            // directly readable but writes stay on the slow path.
            tag = (phys & 0x40000 == 0) as u32;
            tag_write = 1;
        }
        if phys >= self.memory_size {
            tag = 1;
            tag_write = 1;
        }
        if self.smc_page_has_code(phys) {
            tag_write = 1;
        }

        if self.tlb_entry_indexes.len() >= MAX_TLB_LIST {
            self.mmu_tlb_flush();
        }

        let deny = 3u32;
        let system_read = tag << TLB_SYSTEM_READ;
        let system_write = (tag_write | if !write { deny } else { 0 }) << TLB_SYSTEM_WRITE;
        let user_read = (tag | if !user { deny } else { 0 }) << TLB_USER_READ;
        let user_write =
            (tag_write | if !user || !write { deny } else { 0 }) << TLB_USER_WRITE;

        let entry = (lin >> 12) as usize;
        self.tlb_entry_indexes.push(entry as u32);
        self.tlb_bias[entry] = phys as i64 - lin as i64;
        self.tlb_tags[entry] = (system_read | system_write | user_read | user_write) as u8;
        self.tlb_attrs[entry] = attrs;
    }

    /// Physical address behind a live TLB entry (valid whenever the entry
    /// has been inserted, including MMIO-tagged pages).
    #[inline]
    pub(crate) fn lin_to_phys(&self, lin: u32) -> u32 {
        (self.tlb_bias[(lin >> 12) as usize] + lin as i64) as u32
    }

    pub(crate) fn read_phys32(&mut self, addr: u32) -> u32 {
        if addr >= self.memory_size || (0xA0000..0xC0000).contains(&addr) {
            self.devices.mmio_read(addr, crate::devices::MmioSize::Dword)
        } else {
            let a = addr as usize;
            u32::from_le_bytes(self.mem[a..a + 4].try_into().unwrap())
        }
    }

    pub(crate) fn write_phys32(&mut self, addr: u32, data: u32) {
        if addr >= self.memory_size || (0xA0000..0xC0000).contains(&addr) {
            self.devices
                .mmio_write(addr, data, crate::devices::MmioSize::Dword);
        } else {
            let a = addr as usize;
            self.mem[a..a + 4].copy_from_slice(&data.to_le_bytes());
        }
    }

    /// Translate one linear address for the access kind in `shift` and
    /// insert a TLB entry. `shift` bit 3 marks an instruction fetch (NX
    /// enforcement); the low bits are the usual kind shift.
    pub fn mmu_translate(&mut self, lin: u32, shift: u32) -> OpResult {
        let fetch = shift & 8 != 0;
        let shift = shift & 7;
        if self.cr[0] & CR0_PG == 0 {
            self.set_tlb_entry(lin & !0xFFF, lin & !0xFFF, true, true, 0);
            return Ok(());
        }

        let write = shift >> 1 & 1 != 0;
        let user = shift >> 2 & 1 != 0;

        let pde_addr = self.cr[3].wrapping_add(lin >> 20 & 0xFFC);
        let pde = Pte::from_bits_retain(self.read_phys32(pde_addr));

        let mut error_code = 0u32;
        let fault = |cpu: &mut Cpu, mut code: u32| -> OpResult {
            cpu.cr[2] = lin;
            code |= ((write as u32) << 1) | ((user as u32) << 2) | ((fetch as u32) << 4);
            log::trace!(
                "#PF lin={lin:08x} err={code:x} cr3={:08x} eip={:08x}",
                cpu.cr[3],
                cpu.virt_eip()
            );
            cpu.exception_with_code(Exception::Pf, code as i32);
            Err(Abort)
        };

        if !pde.contains(Pte::P) {
            return fault(self, error_code);
        }

        if pde.contains(Pte::PS) && self.cr[4] & CR4_PSE != 0 {
            // 4 MiB page straight from the PDE.
            if write && !pde.contains(Pte::RW) && (user || self.cr[0] & CR0_WP != 0) {
                error_code = 1;
                return fault(self, error_code);
            }
            if user && !pde.contains(Pte::US) {
                error_code = 1;
                return fault(self, error_code);
            }
            let updated = pde | Pte::A | if write { Pte::D } else { Pte::empty() };
            if updated != pde {
                self.write_phys32(pde_addr, updated.bits());
            }
            let phys = (pde.bits() & 0xFFC0_0000) | (lin & 0x3FF000);
            let global = pde.contains(Pte::G) && self.cr[4] & CR4_PGE != 0;
            let attrs = if global { 0 } else { TLB_ATTR_NON_GLOBAL };
            self.set_tlb_entry(lin & !0xFFF, phys, user, write, attrs);
            return Ok(());
        }

        let pte_addr = (lin >> 10 & 0xFFC).wrapping_add(pde.bits() & !0xFFF);
        let pte = Pte::from_bits_retain(self.read_phys32(pte_addr));
        if !pte.contains(Pte::P) {
            return fault(self, error_code);
        }

        // The PDE and PTE protection bits combine; inverting turns
        // "either lacks the bit" into a simple set test.
        let combined = !pte.bits() | !pde.bits();
        if combined & ((write as u32) << 1) != 0 {
            // Supervisors may write read-only pages unless CR0.WP says no.
            if user || self.cr[0] & CR0_WP != 0 {
                error_code = 1;
                return fault(self, error_code);
            }
        }
        if combined & ((user as u32) << 2) != 0 {
            error_code = 1;
            return fault(self, error_code);
        }

        // Accessed/dirty bits only move on a successful walk.
        if !pde.contains(Pte::A) {
            self.write_phys32(pde_addr, (pde | Pte::A).bits());
        }
        let new_pte = pte | Pte::A | if write { Pte::D } else { Pte::empty() };
        if new_pte != pte {
            self.write_phys32(pte_addr, new_pte.bits());
        }

        // Tag only the access kind that was just proven: a later write (or
        // user access) re-walks and earns its own tag, which is also what
        // keeps dirty-bit updates honest.
        let global = pte.contains(Pte::G) && self.cr[4] & CR4_PGE != 0;
        let attrs = if global { 0 } else { TLB_ATTR_NON_GLOBAL };
        self.set_tlb_entry(lin & !0xFFF, pte.bits() & !0xFFF, user, write, attrs);
        Ok(())
    }

    /// Mark a page non-executable at the TLB level. 32-bit legacy paging has
    /// no NX bit; this is the hook DMA-side supervisors (and tests) use to
    /// taint a mapping.
    pub fn tlb_set_nx(&mut self, lin: u32) {
        let page = (lin >> 12) as usize;
        self.tlb_attrs[page] = (self.tlb_attrs[page] & !0xFF) | TLB_ATTR_NX | TLB_ATTR_NON_GLOBAL;
    }

    /// Flip the A20 gate; a change invalidates every cached translation.
    pub fn set_a20(&mut self, enabled: bool) {
        let old = self.a20_mask;
        self.a20_mask = !((!enabled as u32) << 20);
        if old != self.a20_mask {
            self.mmu_tlb_flush();
        }
    }
}
