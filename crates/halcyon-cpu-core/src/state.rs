//! Architectural state: the [`Cpu`] struct and the constants that index it.
//!
//! The layout follows the hardware programming model rather than any Rust
//! abstraction: registers are plain arrays indexed by the encodings the
//! decoder emits, and EFLAGS is split between the `eflags` word and the lazy
//! condition-code scratch (`lop1`/`lop2`/`lr`/`laux`, see `flags`).

use crate::devices::Devices;
use crate::fpu::FpuState;

// Segment register file indices. The first six match the x86 segment
// register encoding.
pub const ES: usize = 0;
pub const CS: usize = 1;
pub const SS: usize = 2;
pub const DS: usize = 3;
pub const FS: usize = 4;
pub const GS: usize = 5;
pub const SEG_TR: usize = 6;
pub const SEG_GDTR: usize = 7;
pub const SEG_LDTR: usize = 8;
pub const SEG_IDTR: usize = 9;

// General-purpose register indices, plus the two decoder scratch slots: a
// hard-wired zero register and a temporary.
pub const EAX: usize = 0;
pub const ECX: usize = 1;
pub const EDX: usize = 2;
pub const EBX: usize = 3;
pub const ESP: usize = 4;
pub const EBP: usize = 5;
pub const ESI: usize = 6;
pub const EDI: usize = 7;
pub const EZR: usize = 8;
pub const ETMP: usize = 9;

pub const CR0_PE: u32 = 1;
pub const CR0_MP: u32 = 2;
pub const CR0_EM: u32 = 4;
pub const CR0_TS: u32 = 8;
pub const CR0_ET: u32 = 16;
pub const CR0_NE: u32 = 32;
pub const CR0_WP: u32 = 1 << 16;
pub const CR0_NW: u32 = 1 << 29;
pub const CR0_CD: u32 = 1 << 30;
pub const CR0_PG: u32 = 1 << 31;

pub const CR4_VME: u32 = 1 << 0;
pub const CR4_PVI: u32 = 1 << 1;
pub const CR4_TSD: u32 = 1 << 2;
pub const CR4_DE: u32 = 1 << 3;
pub const CR4_PSE: u32 = 1 << 4;
pub const CR4_PAE: u32 = 1 << 5;
pub const CR4_MCE: u32 = 1 << 6;
pub const CR4_PGE: u32 = 1 << 7;
pub const CR4_PCE: u32 = 1 << 8;
pub const CR4_OSFXSR: u32 = 1 << 9;
pub const CR4_OSXMMEXCPT: u32 = 1 << 10;

pub const EFLAGS_CF: u32 = 0x01;
pub const EFLAGS_PF: u32 = 0x04;
pub const EFLAGS_AF: u32 = 0x10;
pub const EFLAGS_ZF: u32 = 0x40;
pub const EFLAGS_SF: u32 = 0x80;
pub const EFLAGS_TF: u32 = 0x100;
pub const EFLAGS_IF: u32 = 0x200;
pub const EFLAGS_DF: u32 = 0x400;
pub const EFLAGS_OF: u32 = 0x800;
pub const EFLAGS_IOPL: u32 = 0x3000;
pub const EFLAGS_NT: u32 = 0x4000;
pub const EFLAGS_RF: u32 = 0x10000;
pub const EFLAGS_VM: u32 = 0x20000;
pub const EFLAGS_AC: u32 = 0x40000;
pub const EFLAGS_VIF: u32 = 0x80000;
pub const EFLAGS_VIP: u32 = 0x100000;
pub const EFLAGS_ID: u32 = 0x200000;

pub const VALID_FLAG_MASK: u32 = EFLAGS_ID
    | EFLAGS_VIP
    | EFLAGS_VIF
    | EFLAGS_AC
    | EFLAGS_VM
    | EFLAGS_RF
    | EFLAGS_NT
    | EFLAGS_IOPL
    | EFLAGS_OF
    | EFLAGS_DF
    | EFLAGS_IF
    | EFLAGS_TF
    | EFLAGS_SF
    | EFLAGS_ZF
    | EFLAGS_AF
    | EFLAGS_PF
    | EFLAGS_CF;
pub const ARITH_FLAG_MASK: u32 =
    EFLAGS_OF | EFLAGS_SF | EFLAGS_ZF | EFLAGS_AF | EFLAGS_PF | EFLAGS_CF;

// state_hash bits: which default widths the current CS selects.
pub const STATE_CODE16: u32 = 0x0001;
pub const STATE_ADDR16: u32 = 0x0002;

// Access-rights byte (descriptor bits 40..47, plus flags from bits 52..55
// folded in at 12..15 the way the descriptor parser packs them).
pub const ACCESS_P: u32 = 0x80;
pub const ACCESS_DPL_MASK: u32 = 0x60;
pub const ACCESS_S: u32 = 0x10;
pub const ACCESS_EX: u32 = 0x08;
pub const ACCESS_DC: u32 = 0x04;
pub const ACCESS_RW: u32 = 0x02;
pub const ACCESS_AC: u32 = 0x01;
pub const ACCESS_G: u32 = 0x8000;
pub const ACCESS_B: u32 = 0x4000;
pub const ACCESS_AVL: u32 = 0x1000;

#[inline]
pub fn access_dpl(access: u32) -> u32 {
    access >> 5 & 3
}

#[inline]
pub fn access_type(access: u32) -> u32 {
    access & (ACCESS_S | ACCESS_EX | ACCESS_DC | ACCESS_RW | ACCESS_AC)
}

// System descriptor types (ACCESS_S clear).
pub const DESC_AVAILABLE_TSS_286: u32 = 1;
pub const DESC_LDT: u32 = 2;
pub const DESC_BUSY_TSS_286: u32 = 3;
pub const DESC_CALL_GATE_286: u32 = 4;
pub const DESC_TASK_GATE: u32 = 5;
pub const DESC_INTERRUPT_GATE_286: u32 = 6;
pub const DESC_TRAP_GATE_286: u32 = 7;
pub const DESC_AVAILABLE_TSS_386: u32 = 9;
pub const DESC_BUSY_TSS_386: u32 = 11;
pub const DESC_CALL_GATE_386: u32 = 12;
pub const DESC_INTERRUPT_GATE_386: u32 = 14;
pub const DESC_TRAP_GATE_386: u32 = 15;

#[inline]
pub fn selector_rpl(sel: u32) -> u32 {
    sel & 3
}

#[inline]
pub fn selector_is_ldt(sel: u32) -> bool {
    sel & 4 != 0
}

// seg_valid bits.
pub const SEG_VALID_READABLE: u32 = 1;
pub const SEG_VALID_WRITABLE: u32 = 2;
pub const SEG_VALID_INVALID: u32 = 4;

// TLB access-kind shifts: four 2-bit tag fields per entry.
pub const TLB_SYSTEM_READ: u32 = 0;
pub const TLB_SYSTEM_WRITE: u32 = 2;
pub const TLB_USER_READ: u32 = 4;
pub const TLB_USER_WRITE: u32 = 6;

pub const TLB_ATTR_NX: u8 = 1;
pub const TLB_ATTR_NON_GLOBAL: u8 = 2;

pub const TLB_ENTRIES: usize = 1 << 20;
pub const MAX_TLB_LIST: usize = 8192;

pub const TRACE_INFO_ENTRIES: usize = 64 * 1024;
pub const TRACE_CACHE_SIZE: usize = TRACE_INFO_ENTRIES * 8;
pub const MAX_TRACE_SIZE: usize = 32;

/// Exception vectors the core raises by name.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Exception {
    De = 0,
    Db = 1,
    Bp = 3,
    Of = 4,
    Br = 5,
    Ud = 6,
    Nm = 7,
    Df = 8,
    Ts = 10,
    Np = 11,
    Ss = 12,
    Gp = 13,
    Pf = 14,
    Mf = 16,
    Ac = 17,
    Xm = 19,
}

/// Marker error: a guest exception has been delivered (or dispatch must
/// restart for another reason); unwind to the dispatch loop.
#[derive(Clone, Copy, Debug)]
pub struct Abort;

pub type OpResult<T = ()> = Result<T, Abort>;

/// Why the last `run` slice stopped.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum ExitReason {
    Normal,
    Hlt,
}

/// Interrupt classes for `Cpu::interrupt`.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum IntKind {
    Exception,
    Software,
    Hardware,
}

pub struct TraceInfoEntry {
    pub phys: u32,
    pub state_hash: u32,
    pub index: u32,
    pub flags: u32,
}

/// The whole CPU. Large tables live in `Vec`s sized once at construction.
pub struct Cpu {
    // Registers: 8 architectural + zero/temp scratch + padding to 16 so the
    // decoder can emit any 4-bit index without bounds concern.
    pub reg32: [u32; 16],

    pub xmm32: [u32; 32],
    pub mxcsr: u32,

    pub esp_mask: u32,

    pub mem: Vec<u8>,
    pub memory_size: u32,

    // EFLAGS and lazy condition codes.
    pub eflags: u32,
    pub laux: u32,
    pub lop1: u32,
    pub lop2: u32,
    pub lr: u32,

    // EIP triplet plus the decode-width hash.
    pub phys_eip: u32,
    pub last_phys_eip: u32,
    pub eip_phys_bias: u32,
    pub state_hash: u32,

    // Cycle bookkeeping.
    pub cycles: u64,
    pub cycle_frame_end: u64,
    pub cycles_to_run: i32,
    pub refill_counter: i32,
    pub hlt_counter: i32,
    pub cycle_offset: i32,

    pub cr: [u32; 8],
    pub dr: [u32; 8],
    pub cpl: u32,

    // Segment caches.
    pub seg: [u16; 16],
    pub seg_base: [u32; 16],
    pub seg_limit: [u32; 16],
    pub seg_access: [u32; 16],
    pub seg_valid: [u32; 16],

    pub trace_cache_usage: usize,

    pub tlb_shift_read: u32,
    pub tlb_shift_write: u32,

    // MTRRs/PAT: stored to satisfy guests that probe them.
    pub mtrr_fixed: [u64; 32],
    pub mtrr_variable: [u64; 16],
    pub mtrr_deftype: u64,
    pub page_attribute_tables: u64,

    pub a20_mask: u32,
    pub apic_base: u64,
    pub tsc_fudge: u64,
    pub read_result: u32,
    pub intr_line_state: bool,
    pub interrupts_blocked: bool,
    pub exit_reason: ExitReason,
    pub ia32_efer: u64,
    pub sysenter: [u32; 3],

    // Self-modifying-code bitmap: one bit per 128-byte line, one u32 per page.
    pub smc_has_code: Vec<u32>,

    // TLB: biased offsets (phys - lin) so `bias + lin` is the physical
    // address, a tag byte per entry, attributes, and the occupied-index list.
    pub tlb_bias: Vec<i64>,
    pub tlb_tags: Vec<u8>,
    pub tlb_attrs: Vec<u8>,
    pub tlb_entry_indexes: Vec<u32>,

    pub trace_cache: Vec<crate::decoder::DecodedInsn>,
    pub trace_info: Vec<TraceInfoEntry>,
    pub trace_stats: crate::trace::TraceCacheStats,

    pub fpu: FpuState,

    // Exception-nesting depth for the #DF / triple-fault ladder.
    pub(crate) current_exception: i32,

    pub devices: Box<dyn Devices>,
}

pub const SYSENTER_CS: usize = 0;
pub const SYSENTER_ESP: usize = 1;
pub const SYSENTER_EIP: usize = 2;

impl Cpu {
    pub fn new(devices: Box<dyn Devices>) -> Cpu {
        let mut cpu = Cpu {
            reg32: [0; 16],
            xmm32: [0; 32],
            mxcsr: 0x1F80,
            esp_mask: 0xFFFF,
            mem: Vec::new(),
            memory_size: 0,
            eflags: 2,
            laux: 0,
            lop1: 0,
            lop2: 0,
            lr: 0,
            phys_eip: 0,
            last_phys_eip: 0,
            eip_phys_bias: 0,
            state_hash: STATE_CODE16 | STATE_ADDR16,
            cycles: 0,
            cycle_frame_end: 0,
            cycles_to_run: 0,
            refill_counter: 0,
            hlt_counter: 0,
            cycle_offset: 0,
            cr: [0; 8],
            dr: [0; 8],
            cpl: 0,
            seg: [0; 16],
            seg_base: [0; 16],
            seg_limit: [0; 16],
            seg_access: [0; 16],
            seg_valid: [0; 16],
            trace_cache_usage: 0,
            tlb_shift_read: TLB_SYSTEM_READ,
            tlb_shift_write: TLB_SYSTEM_WRITE,
            mtrr_fixed: [0; 32],
            mtrr_variable: [0; 16],
            mtrr_deftype: 0,
            page_attribute_tables: 0,
            a20_mask: !0,
            apic_base: 0,
            tsc_fudge: 0,
            read_result: 0,
            intr_line_state: false,
            interrupts_blocked: false,
            exit_reason: ExitReason::Normal,
            ia32_efer: 0,
            sysenter: [0; 3],
            smc_has_code: Vec::new(),
            tlb_bias: vec![0; TLB_ENTRIES],
            tlb_tags: vec![0xFF; TLB_ENTRIES],
            tlb_attrs: vec![0xFF; TLB_ENTRIES],
            tlb_entry_indexes: Vec::with_capacity(MAX_TLB_LIST),
            trace_cache: vec![crate::decoder::DecodedInsn::invalid(); TRACE_CACHE_SIZE],
            trace_info: (0..TRACE_INFO_ENTRIES)
                .map(|_| TraceInfoEntry {
                    phys: u32::MAX,
                    state_hash: 0,
                    index: 0,
                    flags: 0,
                })
                .collect(),
            trace_stats: Default::default(),
            fpu: FpuState::new(),
            current_exception: -1,
            devices,
        };
        cpu.reg32[ETMP] = !0;
        cpu
    }

    /// Allocate guest RAM. Primes the legacy ROM window at `0xC0000` with
    /// all-ones the way unprogrammed flash reads.
    pub fn init_mem(&mut self, size: u32) {
        let size = (size + 0xFFF) & !0xFFF;
        self.mem = vec![0u8; size as usize];
        self.memory_size = size;
        if size >= 0x100000 {
            for b in &mut self.mem[0xC0000..0x100000] {
                *b = 0xFF;
            }
        }
        self.smc_has_code = vec![0u32; ((size + 4095) >> 12) as usize];
    }

    /// Copy a ROM image into guest RAM without SMC side effects (used before
    /// execution starts).
    pub fn load_rom(&mut self, addr: u32, data: &[u8]) -> Result<(), crate::CpuError> {
        let end = addr as usize + data.len();
        if end > self.mem.len() {
            return Err(crate::CpuError::RomOutOfBounds {
                addr,
                len: data.len(),
            });
        }
        self.mem[addr as usize..end].copy_from_slice(data);
        Ok(())
    }

    // --- 8/16/32-bit register views -------------------------------------

    /// 8-bit registers use the x86 encoding: 0..4 are the low bytes of
    /// EAX..EBX, 4..8 the high bytes. Indexes past 7 address the low byte of
    /// the named dword register (the decoder's scratch slots).
    #[inline]
    pub fn read_reg8(&self, r: usize) -> u8 {
        if r < 4 {
            self.reg32[r] as u8
        } else if r < 8 {
            (self.reg32[r - 4] >> 8) as u8
        } else {
            self.reg32[r & 15] as u8
        }
    }

    #[inline]
    pub fn write_reg8(&mut self, r: usize, v: u8) {
        if r < 4 {
            self.reg32[r] = (self.reg32[r] & !0xFF) | v as u32;
        } else if r < 8 {
            self.reg32[r - 4] = (self.reg32[r - 4] & !0xFF00) | ((v as u32) << 8);
        } else {
            let r = r & 15;
            self.reg32[r] = (self.reg32[r] & !0xFF) | v as u32;
        }
    }

    #[inline]
    pub fn read_reg16(&self, r: usize) -> u16 {
        self.reg32[r] as u16
    }

    #[inline]
    pub fn write_reg16(&mut self, r: usize, v: u16) {
        self.reg32[r] = (self.reg32[r] & !0xFFFF) | v as u32;
    }

    // --- EIP views ------------------------------------------------------

    #[inline]
    pub fn virt_eip(&self) -> u32 {
        self.phys_eip.wrapping_add(self.eip_phys_bias)
    }

    #[inline]
    pub fn lin_eip(&self) -> u32 {
        self.virt_eip().wrapping_add(self.seg_base[CS])
    }

    #[inline]
    pub fn set_virt_eip(&mut self, eip: u32) {
        self.phys_eip = self.phys_eip.wrapping_add(eip.wrapping_sub(self.virt_eip()));
    }

    #[inline]
    pub fn is_user_mode(&self) -> bool {
        self.cpl == 3
    }

    #[inline]
    pub fn iopl(&self) -> u32 {
        self.eflags >> 12 & 3
    }

    #[inline]
    pub fn in_protected_mode(&self) -> bool {
        self.cr[0] & CR0_PE != 0 && self.eflags & EFLAGS_VM == 0
    }

    // --- cycle bookkeeping ---------------------------------------------

    #[inline]
    pub fn get_cycles(&self) -> u64 {
        self.cycles
            .wrapping_add((self.cycle_offset - self.cycles_to_run) as i64 as u64)
    }

    /// Finish the current instruction, then fall out of the dispatch loop,
    /// remembering the unspent budget.
    pub fn request_loop_exit(&mut self) {
        self.cycles = self.get_cycles();
        self.refill_counter = self.cycles_to_run - 1;
        self.cycles_to_run = 1;
        self.cycle_offset = 1;
    }

    /// Derived TLB tag shifts for the current privilege level.
    pub fn update_cpl_shifts(&mut self) {
        if self.cpl == 3 {
            self.tlb_shift_read = TLB_USER_READ;
            self.tlb_shift_write = TLB_USER_WRITE;
        } else {
            self.tlb_shift_read = TLB_SYSTEM_READ;
            self.tlb_shift_write = TLB_SYSTEM_WRITE;
        }
    }
}
