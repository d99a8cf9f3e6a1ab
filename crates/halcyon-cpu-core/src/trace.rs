//! The trace cache: decoded-instruction blocks keyed on physical EIP and
//! the current code/address-size defaults.

use crate::state::*;
use crate::Cpu;

/// Observability counters for the decode cache (mirrored by tests).
#[derive(Clone, Copy, Default, Debug)]
pub struct TraceCacheStats {
    pub hits: u64,
    pub misses: u64,
    pub flushes: u64,
}

impl Cpu {
    #[inline]
    fn hash_eip(phys: u32) -> usize {
        (phys & (TRACE_INFO_ENTRIES as u32 - 1)) as usize
    }

    /// Drop every cached trace.
    pub fn trace_flush(&mut self) {
        for e in &mut self.trace_info {
            e.phys = u32::MAX;
            e.state_hash = 0;
            e.index = 0;
            e.flags = 0;
        }
        self.trace_cache_usage = 0;
        self.trace_stats.flushes += 1;
    }

    /// Fetch (or decode) the trace for the current physical EIP. On a fetch
    /// fault the exception has been delivered and `Err(Abort)` unwinds to
    /// the dispatch loop, which retries at the new EIP.
    pub(crate) fn get_trace(&mut self) -> OpResult<usize> {
        // Off the current code page: re-derive the physical EIP through the
        // TLB (and enforce the NX taint on the new page).
        if (self.phys_eip ^ self.last_phys_eip) > 4095 {
            let virt_eip = self.virt_eip();
            let lin_eip = virt_eip.wrapping_add(self.seg_base[CS]);
            let page = (lin_eip >> 12) as usize;
            let tag = self.tlb_tags[page] as u32;
            if tag >> self.tlb_shift_read & 2 != 0 {
                self.mmu_translate(lin_eip, self.tlb_shift_read | 8)?;
            }
            if self.tlb_attrs[(lin_eip >> 12) as usize] & TLB_ATTR_NX != 0 {
                // Present page, fetch forbidden.
                self.cr[2] = lin_eip;
                let code = 1 | ((self.cpl == 3) as i32) << 2 | 1 << 4;
                self.exception_with_code(Exception::Pf, code);
                return Err(Abort);
            }
            self.phys_eip = self.lin_to_phys(lin_eip);
            self.eip_phys_bias = virt_eip.wrapping_sub(self.phys_eip);
            self.last_phys_eip = self.phys_eip & !0xFFF;
        }

        let slot = Self::hash_eip(self.phys_eip);
        let (phys, hash, index) = {
            let e = &self.trace_info[slot];
            (e.phys, e.state_hash, e.index)
        };
        if phys == self.phys_eip && hash == self.state_hash {
            self.trace_stats.hits += 1;
            return Ok(index as usize);
        }
        self.trace_stats.misses += 1;

        if self.trace_cache_usage + MAX_TRACE_SIZE >= TRACE_CACHE_SIZE {
            self.trace_flush();
        }

        let start = self.trace_cache_usage;
        let count = crate::decoder::decode_trace(self, slot, start)?;
        self.trace_cache_usage += count;
        Ok(start)
    }

    /// Decode (or fetch) the trace at the current EIP without executing
    /// it. Debugger/tooling hook; `None` when the fetch faulted.
    pub fn prefetch_trace(&mut self) -> Option<usize> {
        self.get_trace().ok()
    }

    /// Recompute the physical-EIP triplet after CS or paging changed under
    /// the current virtual EIP.
    pub(crate) fn reload_cs_base(&mut self) {
        let virt_eip = self.virt_eip();
        let lin_eip = virt_eip.wrapping_add(self.seg_base[CS]);
        let page = (lin_eip >> 12) as usize;
        let tag = (self.tlb_tags[page] as u32) >> self.tlb_shift_read;
        if tag & 2 != 0 {
            // Not translated yet; poison last_phys_eip so get_trace redoes
            // the derivation (and takes the fault there if one is due).
            self.last_phys_eip = self.phys_eip.wrapping_add(0x1000);
            return;
        }
        self.phys_eip = self.lin_to_phys(lin_eip);
        self.last_phys_eip = self.phys_eip & !0xFFF;
        self.eip_phys_bias = virt_eip.wrapping_sub(self.phys_eip);
    }
}
