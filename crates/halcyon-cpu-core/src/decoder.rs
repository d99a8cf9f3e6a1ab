//! The x86 decoder: turns guest bytes into fixed-size [`DecodedInsn`]
//! records, one per instruction, with the execution routine chosen up
//! front. Traces decode from physical memory and end at control flow, the
//! 32-instruction cap, or a page crossing.

use crate::state::*;
use crate::Cpu;

// `flags` word layout (low to high): length (4 bits), address-size bit,
// unused bit, REP class (2), R/M-or-base (4), REG (4), index (4),
// scale (2), segment (3), op subclass (4).
pub const I_ADDR16: u32 = 1 << 4;
pub const I_PREFIX_SHIFT: u32 = 6;
pub const I_PREFIX_REPZ: u32 = 1 << 6;
pub const I_PREFIX_REPNZ: u32 = 2 << 6;
pub const I_PREFIX_MASK: u32 = 3 << 6;
pub const I_RM_SHIFT: u32 = 8;
pub const I_BASE_SHIFT: u32 = 8;
pub const I_REG_SHIFT: u32 = 12;
pub const I_INDEX_SHIFT: u32 = 16;
pub const I_SCALE_SHIFT: u32 = 20;
pub const I_SEG_SHIFT: u32 = 22;
pub const I_OP_SHIFT: u32 = 25;

#[inline]
pub fn i_length(flags: u32) -> u32 {
    flags & 15
}
#[inline]
pub fn i_rm(flags: u32) -> usize {
    (flags >> I_RM_SHIFT & 15) as usize
}
#[inline]
pub fn i_reg(flags: u32) -> usize {
    (flags >> I_REG_SHIFT & 15) as usize
}
#[inline]
pub fn i_base(flags: u32) -> usize {
    (flags >> I_BASE_SHIFT & 15) as usize
}
#[inline]
pub fn i_index(flags: u32) -> usize {
    (flags >> I_INDEX_SHIFT & 15) as usize
}
#[inline]
pub fn i_scale(flags: u32) -> u32 {
    flags >> I_SCALE_SHIFT & 3
}
#[inline]
pub fn i_seg(flags: u32) -> usize {
    (flags >> I_SEG_SHIFT & 7) as usize
}
#[inline]
pub fn i_op(flags: u32) -> u32 {
    flags >> I_OP_SHIFT & 7
}
#[inline]
pub fn i_op3(flags: u32) -> u32 {
    flags >> I_OP_SHIFT & 15
}

/// One decoded instruction: 16 bytes.
#[derive(Clone, Copy, Debug)]
pub struct DecodedInsn {
    pub flags: u32,
    pub imm: u32,
    pub disp: u32,
    pub op: Op,
}

impl DecodedInsn {
    pub fn invalid() -> DecodedInsn {
        DecodedInsn {
            flags: 0,
            imm: 0,
            disp: 0,
            op: Op::Fatal,
        }
    }
}

/// Execution routine selector. Dense enough that the dispatch `match`
/// compiles to a jump table.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Op {
    TraceEnd,
    Ud,
    Fatal,
    Nop,

    // Data movement.
    MovR8R8,
    MovR8E8,
    MovE8R8,
    MovR8I8,
    MovE8I8,
    MovR16R16,
    MovR16E16,
    MovE16R16,
    MovR16I16,
    MovE16I16,
    MovR32R32,
    MovR32E32,
    MovE32R32,
    MovR32I32,
    MovE32I32,
    MovSR16,
    MovSE16,
    MovR16S,
    MovR32S,
    MovE16S,
    XchgR8R8,
    XchgR8E8,
    XchgR16R16,
    XchgR16E16,
    XchgR32R32,
    XchgR32E32,
    LeaR16,
    LeaR32,
    Lfp16,
    Lfp32,
    MovzxR16R8,
    MovzxR16E8,
    MovzxR32R8,
    MovzxR32E8,
    MovzxR32R16,
    MovzxR32E16,
    MovsxR16R8,
    MovsxR16E8,
    MovsxR32R8,
    MovsxR32E8,
    MovsxR32R16,
    MovsxR32E16,

    // Stack.
    PushR16,
    PushR32,
    PushI16,
    PushI32,
    PushE16,
    PushE32,
    PopR16,
    PopR32,
    PopE16,
    PopE32,
    PushS16,
    PushS32,
    PopS16,
    PopS32,
    Pusha,
    Pushad,
    Popa,
    Popad,
    Enter16,
    Enter32,
    Leave16,
    Leave32,

    // ALU.
    ArithR8R8,
    ArithR8I8,
    ArithR8E8,
    ArithE8R8,
    ArithE8I8,
    ArithR16R16,
    ArithR16I16,
    ArithR16E16,
    ArithE16R16,
    ArithE16I16,
    ArithR32R32,
    ArithR32I32,
    ArithR32E32,
    ArithE32R32,
    ArithE32I32,
    CmpR8R8,
    CmpR8I8,
    CmpR8E8,
    CmpE8R8,
    CmpE8I8,
    CmpR16R16,
    CmpR16I16,
    CmpR16E16,
    CmpE16R16,
    CmpE16I16,
    CmpR32R32,
    CmpR32I32,
    CmpR32E32,
    CmpE32R32,
    CmpE32I32,
    TestR8R8,
    TestR8I8,
    TestE8R8,
    TestE8I8,
    TestR16R16,
    TestR16I16,
    TestE16R16,
    TestE16I16,
    TestR32R32,
    TestR32I32,
    TestE32R32,
    TestE32I32,
    IncR8,
    IncE8,
    IncR16,
    IncE16,
    IncR32,
    IncE32,
    DecR8,
    DecE8,
    DecR16,
    DecE16,
    DecR32,
    DecE32,
    NotR8,
    NotE8,
    NotR16,
    NotE16,
    NotR32,
    NotE32,
    NegR8,
    NegE8,
    NegR16,
    NegE16,
    NegR32,
    NegE32,
    MuldivR8,
    MuldivE8,
    MuldivR16,
    MuldivE16,
    MuldivR32,
    MuldivE32,
    ImulR16R16I16,
    ImulR16E16I16,
    ImulR32R32I32,
    ImulR32E32I32,
    ImulR16R16,
    ImulR16E16,
    ImulR32R32,
    ImulR32E32,
    ShiftR8Cl,
    ShiftR8I8,
    ShiftE8Cl,
    ShiftE8I8,
    ShiftR16Cl,
    ShiftR16I16,
    ShiftE16Cl,
    ShiftE16I16,
    ShiftR32Cl,
    ShiftR32I32,
    ShiftE32Cl,
    ShiftE32I32,
    ShrdR16R16I8,
    ShrdR32R32I8,
    ShrdR16R16Cl,
    ShrdR32R32Cl,
    ShrdE16R16I8,
    ShrdE32R32I8,
    ShrdE16R16Cl,
    ShrdE32R32Cl,
    ShldR16R16I8,
    ShldR32R32I8,
    ShldR16R16Cl,
    ShldR32R32Cl,
    ShldE16R16I8,
    ShldE32R32I8,
    ShldE16R16Cl,
    ShldE32R32Cl,
    Cbw,
    Cwde,
    Cwd,
    Cdq,
    Daa,
    Das,
    Aaa,
    Aas,
    Aam,
    Aad,

    // Bit ops.
    Bt16RR,
    Bt16RE,
    Bt32RR,
    Bt32RE,
    Bts16RR,
    Bts16RE,
    Bts32RR,
    Bts32RE,
    Btr16RR,
    Btr16RE,
    Btr32RR,
    Btr32RE,
    Btc16RR,
    Btc16RE,
    Btc32RR,
    Btc32RE,
    BtGrp16R,
    BtGrp16E,
    BtGrp32R,
    BtGrp32E,
    Bsf16RR,
    Bsf16RE,
    Bsf32RR,
    Bsf32RE,
    Bsr16RR,
    Bsr16RE,
    Bsr32RR,
    Bsr32RE,
    Bswap16,
    Bswap32,

    // Atomics / exchange-and-ops.
    CmpxchgR8R8,
    CmpxchgE8R8,
    CmpxchgR16R16,
    CmpxchgE16R16,
    CmpxchgR32R32,
    CmpxchgE32R32,
    Cmpxchg8bE64,
    XaddR8R8,
    XaddE8R8,
    XaddR16R16,
    XaddE16R16,
    XaddR32R32,
    XaddE32R32,

    // Control flow.
    JmpRel16,
    JmpRel32,
    JmpR16,
    JmpR32,
    JmpE16,
    JmpE32,
    Jmpf,
    JmpfE16,
    JmpfE32,
    CallJ16,
    CallJ32,
    CallR16,
    CallR32,
    CallE16,
    CallE32,
    CallfAp16,
    CallfAp32,
    CallfE16,
    CallfE32,
    Ret16,
    Ret32,
    Ret16Iw,
    Ret32Iw,
    Retf16,
    Retf32,
    Iret16,
    Iret32,
    Jcc16,
    Jcc32,
    Jecxz16,
    Jecxz32,
    Loop16,
    Loop32,
    Loopz16,
    Loopz32,
    Loopnz16,
    Loopnz32,
    Int,
    Int3,
    Icebp,
    Into,
    Bound16,
    Bound32,
    SetccR8,
    SetccE8,
    CmovR16R16,
    CmovR16E16,
    CmovR32R32,
    CmovR32E32,

    // Flags and misc.
    Pushf16,
    Pushf32,
    Popf16,
    Popf32,
    Sahf,
    Lahf,
    Cmc,
    Clc,
    Stc,
    Cli,
    Sti,
    Cld,
    Std,
    Xlat,
    Hlt,
    Cpuid,
    Rdmsr,
    Wrmsr,
    Rdtsc,
    Sysenter,
    Sysexit,

    // System table / protection.
    Lgdt,
    Lidt,
    Sgdt,
    Sidt,
    LldtR,
    LldtE,
    SldtR,
    SldtE,
    LtrR,
    LtrE,
    StrR,
    StrE,
    SmswR16,
    SmswR32,
    SmswE16,
    LmswR,
    LmswE,
    Invlpg,
    Clts,
    InvdNop,
    Lar16R,
    Lar16E,
    Lar32R,
    Lar32E,
    Lsl16R,
    Lsl16E,
    Lsl32R,
    Lsl32E,
    VerrR,
    VerrE,
    VerwR,
    VerwE,
    ArplR,
    ArplE,
    MovCrR,
    MovRCr,
    MovDrR,
    MovRDr,

    // Strings.
    Movsb,
    Movsw,
    Movsd,
    Cmpsb,
    Cmpsw,
    Cmpsd,
    Stosb,
    Stosw,
    Stosd,
    Lodsb,
    Lodsw,
    Lodsd,
    Scasb,
    Scasw,
    Scasd,
    Insb,
    Insw,
    Insd,
    Outsb,
    Outsw,
    Outsd,

    // Port I/O.
    In8I,
    In16I,
    In32I,
    In8Dx,
    In16Dx,
    In32Dx,
    Out8I,
    Out16I,
    Out32I,
    Out8Dx,
    Out16Dx,
    Out32Dx,

    // FPU.
    FpuMem,
    FpuReg,
    Fwait,

    // SSE/MMX: the second opcode byte and the prefix class ride in `imm`
    // (bits 0..8 and 8..10); the handler is a second-level table, the way
    // the FPU dispatches on D8..DF.
    SimdE,
    SimdR,
    SimdShiftImm,
    LdMxcsr,
    StMxcsr,
    Fxsave,
    Fxrstor,
}

// Prefix classes recorded for SIMD sub-dispatch.
pub const SSE_PREFIX_NONE: u32 = 0;
pub const SSE_PREFIX_66: u32 = 1;
pub const SSE_PREFIX_F3: u32 = 2;
pub const SSE_PREFIX_F2: u32 = 3;

struct Dec<'a> {
    bytes: &'a [u8],
    pos: usize,
    start: usize,
    // Effective sizes after prefixes.
    code16: bool,
    opsize16: bool,
    addr16: bool,
    seg_override: Option<usize>,
    rep: u32,
    sse_prefix: u32,
}

impl<'a> Dec<'a> {
    #[inline]
    fn fetch8(&mut self) -> u8 {
        let b = self.bytes.get(self.pos).copied().unwrap_or(0xFF);
        self.pos += 1;
        b
    }

    #[inline]
    fn fetch16(&mut self) -> u16 {
        let lo = self.fetch8() as u16;
        let hi = self.fetch8() as u16;
        lo | hi << 8
    }

    #[inline]
    fn fetch32(&mut self) -> u32 {
        let lo = self.fetch16() as u32;
        let hi = self.fetch16() as u32;
        lo | hi << 16
    }

    #[inline]
    fn fetch_imm_z(&mut self) -> u32 {
        if self.opsize16 {
            self.fetch16() as u32
        } else {
            self.fetch32()
        }
    }

    #[inline]
    fn len(&self) -> u32 {
        (self.pos - self.start) as u32
    }
}

/// Everything about one decoded ModR/M byte.
struct ModRm {
    modrm: u8,
    is_reg: bool,
    flags: u32, // base/index/scale/seg already placed
    disp: u32,
}

impl ModRm {
    #[inline]
    fn reg(&self) -> usize {
        (self.modrm >> 3 & 7) as usize
    }
    #[inline]
    fn rm(&self) -> usize {
        (self.modrm & 7) as usize
    }
}

fn parse_modrm(d: &mut Dec) -> ModRm {
    let modrm = d.fetch8();
    let md = modrm >> 6;
    let rm = modrm & 7;
    if md == 3 {
        return ModRm {
            modrm,
            is_reg: true,
            flags: 0,
            disp: 0,
        };
    }

    let mut base = EZR;
    let mut index = EZR;
    let mut scale = 0u32;
    let mut seg = DS;
    let mut disp = 0u32;

    if d.addr16 {
        // Classic 16-bit addressing pairs.
        match rm {
            0 => {
                base = EBX;
                index = ESI;
            }
            1 => {
                base = EBX;
                index = EDI;
            }
            2 => {
                base = EBP;
                index = ESI;
                seg = SS;
            }
            3 => {
                base = EBP;
                index = EDI;
                seg = SS;
            }
            4 => index = ESI,
            5 => index = EDI,
            6 => {
                if md == 0 {
                    disp = d.fetch16() as u32;
                } else {
                    base = EBP;
                    seg = SS;
                }
            }
            _ => base = EBX,
        }
        match md {
            1 => disp = d.fetch8() as i8 as i32 as u32,
            2 => disp = d.fetch16() as u32,
            _ => {}
        }
    } else {
        if rm == 4 {
            let sib = d.fetch8();
            scale = (sib >> 6) as u32;
            let idx = (sib >> 3 & 7) as usize;
            let b = (sib & 7) as usize;
            index = if idx == 4 { EZR } else { idx };
            if b == 5 && md == 0 {
                disp = d.fetch32();
            } else {
                base = b;
                if b == ESP || b == EBP {
                    seg = SS;
                }
            }
        } else if rm == 5 && md == 0 {
            disp = d.fetch32();
        } else {
            base = rm as usize;
            if base == EBP {
                seg = SS;
            }
        }
        match md {
            1 => disp = d.fetch8() as i8 as i32 as u32,
            2 => disp = d.fetch32(),
            _ => {}
        }
    }

    if let Some(s) = d.seg_override {
        seg = s;
    }

    let flags = ((base as u32) << I_BASE_SHIFT)
        | ((index as u32) << I_INDEX_SHIFT)
        | (scale << I_SCALE_SHIFT)
        | ((seg as u32) << I_SEG_SHIFT);
    ModRm {
        modrm,
        is_reg: false,
        flags,
        disp,
    }
}

/// Pick the memory or register form of an op pair.
#[inline]
fn rm_sel(m: &ModRm, reg_op: Op, mem_op: Op) -> Op {
    if m.is_reg {
        reg_op
    } else {
        mem_op
    }
}

/// Pick by effective operand size.
#[inline]
fn osz(d: &Dec, op16: Op, op32: Op) -> Op {
    if d.opsize16 {
        op16
    } else {
        op32
    }
}

/// Decode a full trace into `cpu.trace_cache[start..]`, stamp the
/// `trace_info` slot, and mark the SMC lines. Returns the record count.
pub(crate) fn decode_trace(cpu: &mut Cpu, slot: usize, start: usize) -> OpResult<usize> {
    let phys_start = cpu.phys_eip;
    let code16 = cpu.state_hash & STATE_CODE16 != 0;
    let mut phys = phys_start;
    let mut count = 0usize;

    loop {
        let (insn, is_flow) = decode_one(cpu, phys, code16);
        let len = i_length(insn.flags);
        cpu.trace_cache[start + count] = insn;
        count += 1;
        phys = phys.wrapping_add(len);
        if is_flow
            || insn.op == Op::Ud
            || insn.op == Op::Fatal
            || count >= MAX_TRACE_SIZE - 1
            || (phys ^ phys_start) > 0xFFF
        {
            break;
        }
    }
    // Every trace is sealed with a terminator: a not-taken branch (or a
    // flow op that falls through, like STI) walks straight into it.
    cpu.trace_cache[start + count] = DecodedInsn {
        flags: 0,
        imm: 0,
        disp: 0,
        op: Op::TraceEnd,
    };
    count += 1;

    // Stamp the lookup slot and the SMC map.
    let byte_len = phys.wrapping_sub(phys_start);
    let info = &mut cpu.trace_info[slot];
    info.phys = phys_start;
    info.state_hash = cpu.state_hash;
    info.index = start as u32;
    info.flags = byte_len & 0x3FF;
    let mut line = phys_start & !127;
    while line < phys {
        cpu.smc_set_code(line);
        line = line.wrapping_add(128);
    }
    Ok(count)
}

/// Decode a single instruction at physical address `phys`. Returns the
/// record and whether it terminates the trace.
fn decode_one(cpu: &Cpu, phys: u32, code16: bool) -> (DecodedInsn, bool) {
    let avail_end = cpu.mem.len();
    let begin = phys as usize;
    let slice: &[u8] = if begin < avail_end {
        &cpu.mem[begin..avail_end.min(begin + 16)]
    } else {
        &[]
    };
    let mut d = Dec {
        bytes: slice,
        pos: 0,
        start: 0,
        code16,
        opsize16: code16,
        addr16: code16,
        seg_override: None,
        rep: 0,
        sse_prefix: SSE_PREFIX_NONE,
    };

    let mut i = DecodedInsn {
        flags: 0,
        imm: 0,
        disp: 0,
        op: Op::Ud,
    };
    let mut flow = true;

    // Prefix loop.
    let opcode = loop {
        if d.pos >= 15 {
            // Over-long instruction.
            i.flags = 15;
            i.op = Op::Ud;
            return (i, true);
        }
        match d.fetch8() {
            0x26 => d.seg_override = Some(ES),
            0x2E => d.seg_override = Some(CS),
            0x36 => d.seg_override = Some(SS),
            0x3E => d.seg_override = Some(DS),
            0x64 => d.seg_override = Some(FS),
            0x65 => d.seg_override = Some(GS),
            0x66 => {
                d.opsize16 = !d.code16;
                if d.sse_prefix == SSE_PREFIX_NONE {
                    d.sse_prefix = SSE_PREFIX_66;
                }
            }
            0x67 => d.addr16 = !d.code16,
            0xF0 => {} // LOCK: accesses are already instruction-atomic here
            0xF2 => {
                d.rep = I_PREFIX_REPNZ;
                d.sse_prefix = SSE_PREFIX_F2;
            }
            0xF3 => {
                d.rep = I_PREFIX_REPZ;
                d.sse_prefix = SSE_PREFIX_F3;
            }
            b => break b,
        }
    };

    decode_opcode(&mut d, &mut i, &mut flow, opcode);

    // Seal in the size bits.
    let mut flags = i.flags;
    flags |= d.len() & 15;
    if d.addr16 {
        flags |= I_ADDR16;
    }
    flags |= d.rep;
    i.flags = flags;
    if d.len() > 15 {
        i.op = Op::Ud;
        flow = true;
    }
    (i, flow)
}

/// Place an EA (or reg) ModR/M plus the REG field into the flags word.
fn put_modrm(i: &mut DecodedInsn, m: &ModRm) {
    if m.is_reg {
        i.flags |= (m.rm() as u32) << I_RM_SHIFT;
    } else {
        i.flags |= m.flags;
        i.disp = m.disp;
    }
    i.flags |= (m.reg() as u32) << I_REG_SHIFT;
}

fn put_op(i: &mut DecodedInsn, op: u32) {
    i.flags |= op << I_OP_SHIFT;
}

fn decode_opcode(d: &mut Dec, i: &mut DecodedInsn, flow: &mut bool, opcode: u8) {
    use Op::*;
    *flow = false;
    match opcode {
        // --- ALU block: 00..3F ------------------------------------------
        0x00..=0x3F if opcode & 7 < 6 => {
            let aluop = (opcode >> 3 & 7) as u32;
            let form = opcode & 7;
            let is_cmp = aluop == 7;
            match form {
                0 | 1 => {
                    // r/m, r
                    let m = parse_modrm(d);
                    put_modrm(i, &m);
                    put_op(i, aluop);
                    i.op = if form == 0 {
                        if is_cmp {
                            rm_sel(&m, CmpR8R8, CmpE8R8)
                        } else {
                            rm_sel(&m, ArithR8R8, ArithE8R8)
                        }
                    } else if d.opsize16 {
                        if is_cmp {
                            rm_sel(&m, CmpR16R16, CmpE16R16)
                        } else {
                            rm_sel(&m, ArithR16R16, ArithE16R16)
                        }
                    } else if is_cmp {
                        rm_sel(&m, CmpR32R32, CmpE32R32)
                    } else {
                        rm_sel(&m, ArithR32R32, ArithE32R32)
                    };
                }
                2 | 3 => {
                    // r, r/m
                    let m = parse_modrm(d);
                    if m.is_reg {
                        // Normalize: destination goes in RM, source in REG.
                        i.flags |= (m.reg() as u32) << I_RM_SHIFT;
                        i.flags |= (m.rm() as u32) << I_REG_SHIFT;
                        put_op(i, aluop);
                        i.op = if form == 2 {
                            if is_cmp {
                                CmpR8R8
                            } else {
                                ArithR8R8
                            }
                        } else if d.opsize16 {
                            if is_cmp {
                                CmpR16R16
                            } else {
                                ArithR16R16
                            }
                        } else if is_cmp {
                            CmpR32R32
                        } else {
                            ArithR32R32
                        };
                    } else {
                        put_modrm(i, &m);
                        put_op(i, aluop);
                        i.op = if form == 2 {
                            if is_cmp {
                                CmpR8E8
                            } else {
                                ArithR8E8
                            }
                        } else if d.opsize16 {
                            if is_cmp {
                                CmpR16E16
                            } else {
                                ArithR16E16
                            }
                        } else if is_cmp {
                            CmpR32E32
                        } else {
                            ArithR32E32
                        };
                    }
                }
                4 => {
                    // AL, imm8
                    i.flags |= (EAX as u32) << I_RM_SHIFT;
                    i.imm = d.fetch8() as u32;
                    put_op(i, aluop);
                    i.op = if is_cmp { CmpR8I8 } else { ArithR8I8 };
                }
                _ => {
                    // eAX, immz
                    i.flags |= (EAX as u32) << I_RM_SHIFT;
                    i.imm = d.fetch_imm_z();
                    put_op(i, aluop);
                    i.op = if d.opsize16 {
                        if is_cmp {
                            CmpR16I16
                        } else {
                            ArithR16I16
                        }
                    } else if is_cmp {
                        CmpR32I32
                    } else {
                        ArithR32I32
                    };
                }
            }
        }
        // PUSH/POP seg in the low map.
        0x06 | 0x0E | 0x16 | 0x1E => {
            let seg = (opcode >> 3 & 3) as u32;
            i.flags |= seg << I_RM_SHIFT;
            i.op = osz(d, PushS16, PushS32);
        }
        0x07 | 0x17 | 0x1F => {
            let seg = (opcode >> 3 & 3) as u32;
            i.flags |= seg << I_RM_SHIFT;
            i.op = osz(d, PopS16, PopS32);
        }
        0x0F => decode_0f(d, i, flow),

        0x27 => i.op = Daa,
        0x2F => i.op = Das,
        0x37 => i.op = Aaa,
        0x3F => i.op = Aas,

        0x40..=0x47 => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.op = osz(d, IncR16, IncR32);
        }
        0x48..=0x4F => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.op = osz(d, DecR16, DecR32);
        }
        0x50..=0x57 => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.op = osz(d, PushR16, PushR32);
        }
        0x58..=0x5F => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.op = osz(d, PopR16, PopR32);
        }
        0x60 => i.op = osz(d, Pusha, Pushad),
        0x61 => i.op = osz(d, Popa, Popad),
        0x62 => {
            let m = parse_modrm(d);
            if m.is_reg {
                i.op = Ud;
                *flow = true;
                return;
            }
            put_modrm(i, &m);
            i.op = osz(d, Bound16, Bound32);
        }
        0x63 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = rm_sel(&m, ArplR, ArplE);
        }
        0x68 => {
            i.imm = d.fetch_imm_z();
            i.op = osz(d, PushI16, PushI32);
        }
        0x69 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = d.fetch_imm_z();
            i.op = if d.opsize16 {
                rm_sel(&m, ImulR16R16I16, ImulR16E16I16)
            } else {
                rm_sel(&m, ImulR32R32I32, ImulR32E32I32)
            };
        }
        0x6A => {
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = osz(d, PushI16, PushI32);
        }
        0x6B => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = if d.opsize16 {
                rm_sel(&m, ImulR16R16I16, ImulR16E16I16)
            } else {
                rm_sel(&m, ImulR32R32I32, ImulR32E32I32)
            };
        }
        0x6C => {
            i.op = Insb;
            string_seg(d, i);
        }
        0x6D => {
            i.op = osz(d, Insw, Insd);
            string_seg(d, i);
        }
        0x6E => {
            i.op = Outsb;
            string_seg(d, i);
        }
        0x6F => {
            i.op = osz(d, Outsw, Outsd);
            string_seg(d, i);
        }
        0x70..=0x7F => {
            put_op3(i, (opcode & 15) as u32);
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = osz(d, Jcc16, Jcc32);
            *flow = true;
        }
        0x80 | 0x82 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = d.fetch8() as u32;
            let sub = m.reg() as u32;
            put_op(i, sub);
            i.op = if sub == 7 {
                rm_sel(&m, CmpR8I8, CmpE8I8)
            } else {
                rm_sel(&m, ArithR8I8, ArithE8I8)
            };
        }
        0x81 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = d.fetch_imm_z();
            let sub = m.reg() as u32;
            put_op(i, sub);
            i.op = if d.opsize16 {
                if sub == 7 {
                    rm_sel(&m, CmpR16I16, CmpE16I16)
                } else {
                    rm_sel(&m, ArithR16I16, ArithE16I16)
                }
            } else if sub == 7 {
                rm_sel(&m, CmpR32I32, CmpE32I32)
            } else {
                rm_sel(&m, ArithR32I32, ArithE32I32)
            };
        }
        0x83 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = d.fetch8() as i8 as i32 as u32;
            let sub = m.reg() as u32;
            put_op(i, sub);
            i.op = if d.opsize16 {
                if sub == 7 {
                    rm_sel(&m, CmpR16I16, CmpE16I16)
                } else {
                    rm_sel(&m, ArithR16I16, ArithE16I16)
                }
            } else if sub == 7 {
                rm_sel(&m, CmpR32I32, CmpE32I32)
            } else {
                rm_sel(&m, ArithR32I32, ArithE32I32)
            };
        }
        0x84 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = rm_sel(&m, TestR8R8, TestE8R8);
        }
        0x85 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, TestR16R16, TestE16R16)
            } else {
                rm_sel(&m, TestR32R32, TestE32R32)
            };
        }
        0x86 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = rm_sel(&m, XchgR8R8, XchgR8E8);
        }
        0x87 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, XchgR16R16, XchgR16E16)
            } else {
                rm_sel(&m, XchgR32R32, XchgR32E32)
            };
        }
        0x88 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = rm_sel(&m, MovR8R8, MovE8R8);
        }
        0x89 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, MovR16R16, MovE16R16)
            } else {
                rm_sel(&m, MovR32R32, MovE32R32)
            };
        }
        0x8A => {
            let m = parse_modrm(d);
            if m.is_reg {
                i.flags |= (m.reg() as u32) << I_RM_SHIFT;
                i.flags |= (m.rm() as u32) << I_REG_SHIFT;
                i.op = MovR8R8;
            } else {
                put_modrm(i, &m);
                i.op = MovR8E8;
            }
        }
        0x8B => {
            let m = parse_modrm(d);
            if m.is_reg {
                i.flags |= (m.reg() as u32) << I_RM_SHIFT;
                i.flags |= (m.rm() as u32) << I_REG_SHIFT;
                i.op = osz(d, MovR16R16, MovR32R32);
            } else {
                put_modrm(i, &m);
                i.op = osz(d, MovR16E16, MovR32E32);
            }
        }
        0x8C => {
            let m = parse_modrm(d);
            if m.reg() > 5 {
                i.op = Ud;
                *flow = true;
                return;
            }
            put_modrm(i, &m);
            i.op = if m.is_reg {
                osz(d, MovR16S, MovR32S)
            } else {
                MovE16S
            };
        }
        0x8D => {
            let m = parse_modrm(d);
            if m.is_reg {
                i.op = Ud;
                *flow = true;
                return;
            }
            put_modrm(i, &m);
            i.op = osz(d, LeaR16, LeaR32);
        }
        0x8E => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            if m.reg() == CS || m.reg() > 5 {
                i.op = Ud;
                *flow = true;
                return;
            }
            i.op = rm_sel(&m, MovSR16, MovSE16);
            // Loading SS blocks interrupts for one instruction and can
            // switch stacks: end the trace.
            *flow = m.reg() == SS;
        }
        0x8F => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, PopR16, PopE16)
            } else {
                rm_sel(&m, PopR32, PopE32)
            };
        }
        0x90 => i.op = Nop,
        0x91..=0x97 => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.flags |= (EAX as u32) << I_REG_SHIFT;
            i.op = osz(d, XchgR16R16, XchgR32R32);
        }
        0x98 => i.op = osz(d, Cbw, Cwde),
        0x99 => i.op = osz(d, Cwd, Cdq),
        0x9A => {
            let eip = d.fetch_imm_z();
            let cs = d.fetch16();
            i.imm = eip;
            i.disp = cs as u32;
            i.op = osz(d, CallfAp16, CallfAp32);
            *flow = true;
        }
        0x9B => {
            i.op = Fwait;
        }
        0x9C => i.op = osz(d, Pushf16, Pushf32),
        0x9D => {
            i.op = osz(d, Popf16, Popf32);
            *flow = true; // may flip IF
        }
        0x9E => i.op = Sahf,
        0x9F => i.op = Lahf,
        0xA0 | 0xA1 | 0xA2 | 0xA3 => {
            // moffs forms ride the EA machinery with a zero base.
            let seg = d.seg_override.unwrap_or(DS);
            i.flags |= ((EZR as u32) << I_BASE_SHIFT)
                | ((EZR as u32) << I_INDEX_SHIFT)
                | ((seg as u32) << I_SEG_SHIFT);
            i.flags |= (EAX as u32) << I_REG_SHIFT;
            i.disp = if d.addr16 {
                d.fetch16() as u32
            } else {
                d.fetch32()
            };
            i.op = match opcode {
                0xA0 => MovR8E8,
                0xA1 => osz(d, MovR16E16, MovR32E32),
                0xA2 => MovE8R8,
                _ => osz(d, MovE16R16, MovE32R32),
            };
        }
        0xA4 => {
            i.op = Movsb;
            string_seg(d, i);
        }
        0xA5 => {
            i.op = osz(d, Movsw, Movsd);
            string_seg(d, i);
        }
        0xA6 => {
            i.op = Cmpsb;
            string_seg(d, i);
        }
        0xA7 => {
            i.op = osz(d, Cmpsw, Cmpsd);
            string_seg(d, i);
        }
        0xA8 => {
            i.flags |= (EAX as u32) << I_RM_SHIFT;
            i.imm = d.fetch8() as u32;
            i.op = TestR8I8;
        }
        0xA9 => {
            i.flags |= (EAX as u32) << I_RM_SHIFT;
            i.imm = d.fetch_imm_z();
            i.op = osz(d, TestR16I16, TestR32I32);
        }
        0xAA => {
            i.op = Stosb;
            string_seg(d, i);
        }
        0xAB => {
            i.op = osz(d, Stosw, Stosd);
            string_seg(d, i);
        }
        0xAC => {
            i.op = Lodsb;
            string_seg(d, i);
        }
        0xAD => {
            i.op = osz(d, Lodsw, Lodsd);
            string_seg(d, i);
        }
        0xAE => {
            i.op = Scasb;
            string_seg(d, i);
        }
        0xAF => {
            i.op = osz(d, Scasw, Scasd);
            string_seg(d, i);
        }
        0xB0..=0xB7 => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.imm = d.fetch8() as u32;
            i.op = MovR8I8;
        }
        0xB8..=0xBF => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.imm = d.fetch_imm_z();
            i.op = osz(d, MovR16I16, MovR32I32);
        }
        0xC0 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            put_op(i, m.reg() as u32);
            i.imm = d.fetch8() as u32;
            i.op = rm_sel(&m, ShiftR8I8, ShiftE8I8);
        }
        0xC1 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            put_op(i, m.reg() as u32);
            i.imm = d.fetch8() as u32;
            i.op = if d.opsize16 {
                rm_sel(&m, ShiftR16I16, ShiftE16I16)
            } else {
                rm_sel(&m, ShiftR32I32, ShiftE32I32)
            };
        }
        0xC2 => {
            i.imm = d.fetch16() as u32;
            i.op = osz(d, Ret16Iw, Ret32Iw);
            *flow = true;
        }
        0xC3 => {
            i.op = osz(d, Ret16, Ret32);
            *flow = true;
        }
        0xC4 | 0xC5 => {
            let m = parse_modrm(d);
            if m.is_reg {
                i.op = Ud;
                *flow = true;
                return;
            }
            put_modrm(i, &m);
            put_op(i, if opcode == 0xC4 { ES as u32 } else { DS as u32 });
            i.op = osz(d, Lfp16, Lfp32);
            *flow = true;
        }
        0xC6 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = d.fetch8() as u32;
            i.op = rm_sel(&m, MovR8I8, MovE8I8);
        }
        0xC7 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = d.fetch_imm_z();
            i.op = if d.opsize16 {
                rm_sel(&m, MovR16I16, MovE16I16)
            } else {
                rm_sel(&m, MovR32I32, MovE32I32)
            };
        }
        0xC8 => {
            let size = d.fetch16();
            let nesting = d.fetch8();
            i.imm = size as u32;
            i.disp = nesting as u32;
            i.op = osz(d, Enter16, Enter32);
        }
        0xC9 => i.op = osz(d, Leave16, Leave32),
        0xCA => {
            i.imm = d.fetch16() as u32;
            i.op = osz(d, Retf16, Retf32);
            put_op(i, 1); // has adjust
            *flow = true;
        }
        0xCB => {
            i.op = osz(d, Retf16, Retf32);
            *flow = true;
        }
        0xCC => {
            i.op = Int3;
            *flow = true;
        }
        0xCD => {
            i.imm = d.fetch8() as u32;
            i.op = Int;
            *flow = true;
        }
        0xCE => {
            i.op = Into;
            *flow = true;
        }
        0xCF => {
            i.op = osz(d, Iret16, Iret32);
            *flow = true;
        }
        0xD0 | 0xD1 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            put_op(i, m.reg() as u32);
            i.imm = 1;
            i.op = if opcode == 0xD0 {
                rm_sel(&m, ShiftR8I8, ShiftE8I8)
            } else if d.opsize16 {
                rm_sel(&m, ShiftR16I16, ShiftE16I16)
            } else {
                rm_sel(&m, ShiftR32I32, ShiftE32I32)
            };
        }
        0xD2 | 0xD3 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            put_op(i, m.reg() as u32);
            i.op = if opcode == 0xD2 {
                rm_sel(&m, ShiftR8Cl, ShiftE8Cl)
            } else if d.opsize16 {
                rm_sel(&m, ShiftR16Cl, ShiftE16Cl)
            } else {
                rm_sel(&m, ShiftR32Cl, ShiftE32Cl)
            };
        }
        0xD4 => {
            i.imm = d.fetch8() as u32;
            i.op = Aam;
        }
        0xD5 => {
            i.imm = d.fetch8() as u32;
            i.op = Aad;
        }
        0xD7 => {
            let seg = d.seg_override.unwrap_or(DS);
            i.flags |= (seg as u32) << I_SEG_SHIFT;
            i.op = Xlat;
        }
        0xD8..=0xDF => {
            let m = parse_modrm(d);
            let opsize = (d.opsize16 as u32) << 15;
            if m.is_reg {
                i.imm = ((opcode as u32 & 7) << 8) | m.modrm as u32 | opsize;
                i.op = FpuReg;
            } else {
                put_modrm(i, &m);
                i.imm = ((opcode as u32 & 7) << 8) | (m.reg() as u32) << 3 | opsize;
                i.op = FpuMem;
            }
        }
        0xE0 => {
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = osz(d, Loopnz16, Loopnz32);
            *flow = true;
        }
        0xE1 => {
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = osz(d, Loopz16, Loopz32);
            *flow = true;
        }
        0xE2 => {
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = osz(d, Loop16, Loop32);
            *flow = true;
        }
        0xE3 => {
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = osz(d, Jecxz16, Jecxz32);
            *flow = true;
        }
        0xE4 => {
            i.imm = d.fetch8() as u32;
            i.op = In8I;
        }
        0xE5 => {
            i.imm = d.fetch8() as u32;
            i.op = osz(d, In16I, In32I);
        }
        0xE6 => {
            i.imm = d.fetch8() as u32;
            i.op = Out8I;
        }
        0xE7 => {
            i.imm = d.fetch8() as u32;
            i.op = osz(d, Out16I, Out32I);
        }
        0xE8 => {
            i.imm = if d.opsize16 {
                d.fetch16() as i16 as i32 as u32
            } else {
                d.fetch32()
            };
            i.op = osz(d, CallJ16, CallJ32);
            *flow = true;
        }
        0xE9 => {
            i.imm = if d.opsize16 {
                d.fetch16() as i16 as i32 as u32
            } else {
                d.fetch32()
            };
            i.op = osz(d, JmpRel16, JmpRel32);
            *flow = true;
        }
        0xEA => {
            let eip = d.fetch_imm_z();
            let cs = d.fetch16();
            i.imm = eip;
            i.disp = cs as u32;
            i.op = Jmpf;
            *flow = true;
        }
        0xEB => {
            i.imm = d.fetch8() as i8 as i32 as u32;
            i.op = osz(d, JmpRel16, JmpRel32);
            *flow = true;
        }
        0xEC => {
            i.op = In8Dx;
        }
        0xED => i.op = osz(d, In16Dx, In32Dx),
        0xEE => i.op = Out8Dx,
        0xEF => i.op = osz(d, Out16Dx, Out32Dx),
        0xF1 => {
            i.op = Icebp;
            *flow = true;
        }
        0xF4 => {
            i.op = Hlt;
            *flow = true;
        }
        0xF5 => i.op = Cmc,
        0xF6 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            match m.reg() {
                0 | 1 => {
                    i.imm = d.fetch8() as u32;
                    i.op = rm_sel(&m, TestR8I8, TestE8I8);
                }
                2 => i.op = rm_sel(&m, NotR8, NotE8),
                3 => i.op = rm_sel(&m, NegR8, NegE8),
                r => {
                    put_op(i, r as u32);
                    i.op = rm_sel(&m, MuldivR8, MuldivE8);
                }
            }
        }
        0xF7 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            match m.reg() {
                0 | 1 => {
                    i.imm = d.fetch_imm_z();
                    i.op = if d.opsize16 {
                        rm_sel(&m, TestR16I16, TestE16I16)
                    } else {
                        rm_sel(&m, TestR32I32, TestE32I32)
                    };
                }
                2 => {
                    i.op = if d.opsize16 {
                        rm_sel(&m, NotR16, NotE16)
                    } else {
                        rm_sel(&m, NotR32, NotE32)
                    }
                }
                3 => {
                    i.op = if d.opsize16 {
                        rm_sel(&m, NegR16, NegE16)
                    } else {
                        rm_sel(&m, NegR32, NegE32)
                    }
                }
                r => {
                    put_op(i, r as u32);
                    i.op = if d.opsize16 {
                        rm_sel(&m, MuldivR16, MuldivE16)
                    } else {
                        rm_sel(&m, MuldivR32, MuldivE32)
                    };
                }
            }
        }
        0xF8 => i.op = Clc,
        0xF9 => i.op = Stc,
        0xFA => i.op = Cli,
        0xFB => {
            i.op = Sti;
            *flow = true; // one-instruction interrupt window
        }
        0xFC => i.op = Cld,
        0xFD => i.op = Std,
        0xFE => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            match m.reg() {
                0 => i.op = rm_sel(&m, IncR8, IncE8),
                1 => i.op = rm_sel(&m, DecR8, DecE8),
                _ => {
                    i.op = Ud;
                    *flow = true;
                }
            }
        }
        0xFF => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            match m.reg() {
                0 => {
                    i.op = if d.opsize16 {
                        rm_sel(&m, IncR16, IncE16)
                    } else {
                        rm_sel(&m, IncR32, IncE32)
                    }
                }
                1 => {
                    i.op = if d.opsize16 {
                        rm_sel(&m, DecR16, DecE16)
                    } else {
                        rm_sel(&m, DecR32, DecE32)
                    }
                }
                2 => {
                    i.op = if d.opsize16 {
                        rm_sel(&m, CallR16, CallE16)
                    } else {
                        rm_sel(&m, CallR32, CallE32)
                    };
                    *flow = true;
                }
                3 => {
                    if m.is_reg {
                        i.op = Ud;
                    } else {
                        i.op = osz(d, CallfE16, CallfE32);
                    }
                    *flow = true;
                }
                4 => {
                    i.op = if d.opsize16 {
                        rm_sel(&m, JmpR16, JmpE16)
                    } else {
                        rm_sel(&m, JmpR32, JmpE32)
                    };
                    *flow = true;
                }
                5 => {
                    if m.is_reg {
                        i.op = Ud;
                    } else {
                        i.op = osz(d, JmpfE16, JmpfE32);
                    }
                    *flow = true;
                }
                6 => {
                    i.op = if d.opsize16 {
                        rm_sel(&m, PushR16, PushE16)
                    } else {
                        rm_sel(&m, PushR32, PushE32)
                    }
                }
                _ => {
                    i.op = Ud;
                    *flow = true;
                }
            }
        }
        _ => {
            i.op = Ud;
            *flow = true;
        }
    }
}

fn put_op3(i: &mut DecodedInsn, op: u32) {
    i.flags |= op << I_OP_SHIFT;
}

/// Record the (overridable) source segment for a string op.
fn string_seg(d: &mut Dec, i: &mut DecodedInsn) {
    let seg = d.seg_override.unwrap_or(DS);
    i.flags |= (seg as u32) << I_SEG_SHIFT;
}

fn decode_0f(d: &mut Dec, i: &mut DecodedInsn, flow: &mut bool) {
    use Op::*;
    let opcode = d.fetch8();
    match opcode {
        0x00 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            match m.reg() {
                0 => i.op = rm_sel(&m, SldtR, SldtE),
                1 => i.op = rm_sel(&m, StrR, StrE),
                2 => {
                    i.op = rm_sel(&m, LldtR, LldtE);
                    *flow = true;
                }
                3 => {
                    i.op = rm_sel(&m, LtrR, LtrE);
                    *flow = true;
                }
                4 => i.op = rm_sel(&m, VerrR, VerrE),
                5 => i.op = rm_sel(&m, VerwR, VerwE),
                _ => {
                    i.op = Ud;
                    *flow = true;
                }
            }
        }
        0x01 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            match m.reg() {
                0 if !m.is_reg => i.op = Sgdt,
                1 if !m.is_reg => i.op = Sidt,
                2 if !m.is_reg => {
                    i.op = Lgdt;
                    put_op(i, !d.opsize16 as u32);
                    *flow = true;
                }
                3 if !m.is_reg => {
                    i.op = Lidt;
                    put_op(i, !d.opsize16 as u32);
                    *flow = true;
                }
                4 => i.op = rm_sel(&m, osz(d, SmswR16, SmswR32), SmswE16),
                6 => {
                    i.op = rm_sel(&m, LmswR, LmswE);
                    *flow = true;
                }
                7 if !m.is_reg => {
                    i.op = Invlpg;
                    *flow = true;
                }
                _ => {
                    i.op = Ud;
                    *flow = true;
                }
            }
        }
        0x02 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Lar16R, Lar16E)
            } else {
                rm_sel(&m, Lar32R, Lar32E)
            };
        }
        0x03 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Lsl16R, Lsl16E)
            } else {
                rm_sel(&m, Lsl32R, Lsl32E)
            };
        }
        0x06 => i.op = Clts,
        0x08 | 0x09 => i.op = InvdNop, // INVD/WBINVD: no data caches to drop
        0x0B => {
            i.op = Ud;
            *flow = true;
        }
        0x0D | 0x18..=0x1F => {
            // Prefetch/hint space.
            let _ = parse_modrm(d);
            i.op = Nop;
        }
        0x20 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = MovRCr;
            *flow = true;
        }
        0x21 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = MovRDr;
            *flow = true;
        }
        0x22 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = MovCrR;
            *flow = true;
        }
        0x23 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = MovDrR;
            *flow = true;
        }
        0x30 => {
            i.op = Wrmsr;
            *flow = true;
        }
        0x31 => i.op = Rdtsc,
        0x32 => {
            i.op = Rdmsr;
            *flow = true;
        }
        0x34 => {
            i.op = Sysenter;
            *flow = true;
        }
        0x35 => {
            i.op = Sysexit;
            *flow = true;
        }
        0x40..=0x4F => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            put_op3(i, (opcode & 15) as u32);
            i.op = if d.opsize16 {
                rm_sel(&m, CmovR16R16, CmovR16E16)
            } else {
                rm_sel(&m, CmovR32R32, CmovR32E32)
            };
        }
        0x80..=0x8F => {
            put_op3(i, (opcode & 15) as u32);
            i.imm = if d.opsize16 {
                d.fetch16() as i16 as i32 as u32
            } else {
                d.fetch32()
            };
            i.op = osz(d, Jcc16, Jcc32);
            *flow = true;
        }
        0x90..=0x9F => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            put_op3(i, (opcode & 15) as u32);
            i.op = rm_sel(&m, SetccR8, SetccE8);
        }
        0xA0 => {
            i.flags |= (FS as u32) << I_RM_SHIFT;
            i.op = osz(d, PushS16, PushS32);
        }
        0xA1 => {
            i.flags |= (FS as u32) << I_RM_SHIFT;
            i.op = osz(d, PopS16, PopS32);
        }
        0xA2 => i.op = Cpuid,
        0xA3 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Bt16RR, Bt16RE)
            } else {
                rm_sel(&m, Bt32RR, Bt32RE)
            };
        }
        0xA4 | 0xA5 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            if opcode == 0xA4 {
                i.imm = d.fetch8() as u32;
            }
            i.op = match (d.opsize16, opcode == 0xA4, m.is_reg) {
                (true, true, true) => ShldR16R16I8,
                (true, true, false) => ShldE16R16I8,
                (true, false, true) => ShldR16R16Cl,
                (true, false, false) => ShldE16R16Cl,
                (false, true, true) => ShldR32R32I8,
                (false, true, false) => ShldE32R32I8,
                (false, false, true) => ShldR32R32Cl,
                (false, false, false) => ShldE32R32Cl,
            };
        }
        0xA8 => {
            i.flags |= (GS as u32) << I_RM_SHIFT;
            i.op = osz(d, PushS16, PushS32);
        }
        0xA9 => {
            i.flags |= (GS as u32) << I_RM_SHIFT;
            i.op = osz(d, PopS16, PopS32);
        }
        0xAB => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Bts16RR, Bts16RE)
            } else {
                rm_sel(&m, Bts32RR, Bts32RE)
            };
        }
        0xAC | 0xAD => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            if opcode == 0xAC {
                i.imm = d.fetch8() as u32;
            }
            i.op = match (d.opsize16, opcode == 0xAC, m.is_reg) {
                (true, true, true) => ShrdR16R16I8,
                (true, true, false) => ShrdE16R16I8,
                (true, false, true) => ShrdR16R16Cl,
                (true, false, false) => ShrdE16R16Cl,
                (false, true, true) => ShrdR32R32I8,
                (false, true, false) => ShrdE32R32I8,
                (false, false, true) => ShrdR32R32Cl,
                (false, false, false) => ShrdE32R32Cl,
            };
        }
        0xAE => {
            let m = parse_modrm(d);
            match m.reg() {
                0 if !m.is_reg => {
                    put_modrm(i, &m);
                    i.op = Fxsave;
                }
                1 if !m.is_reg => {
                    put_modrm(i, &m);
                    i.op = Fxrstor;
                }
                2 if !m.is_reg => {
                    put_modrm(i, &m);
                    i.op = LdMxcsr;
                }
                3 if !m.is_reg => {
                    put_modrm(i, &m);
                    i.op = StMxcsr;
                }
                5 | 6 | 7 => i.op = Nop, // fences (and CLFLUSH mem form)
                _ => {
                    i.op = Ud;
                    *flow = true;
                }
            }
        }
        0xAF => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, ImulR16R16, ImulR16E16)
            } else {
                rm_sel(&m, ImulR32R32, ImulR32E32)
            };
        }
        0xB0 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = rm_sel(&m, CmpxchgR8R8, CmpxchgE8R8);
        }
        0xB1 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, CmpxchgR16R16, CmpxchgE16R16)
            } else {
                rm_sel(&m, CmpxchgR32R32, CmpxchgE32R32)
            };
        }
        0xB2 | 0xB4 | 0xB5 => {
            let m = parse_modrm(d);
            if m.is_reg {
                i.op = Ud;
                *flow = true;
                return;
            }
            put_modrm(i, &m);
            let seg = match opcode {
                0xB2 => SS,
                0xB4 => FS,
                _ => GS,
            };
            put_op(i, seg as u32);
            i.op = osz(d, Lfp16, Lfp32);
            *flow = true;
        }
        0xB3 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Btr16RR, Btr16RE)
            } else {
                rm_sel(&m, Btr32RR, Btr32RE)
            };
        }
        0xB6 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, MovzxR16R8, MovzxR16E8)
            } else {
                rm_sel(&m, MovzxR32R8, MovzxR32E8)
            };
        }
        0xB7 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, MovR16R16, MovR16E16)
            } else {
                rm_sel(&m, MovzxR32R16, MovzxR32E16)
            };
            if d.opsize16 && m.is_reg {
                // movzx r16, r16 degenerates to mov; normalize fields.
                i.flags = (i.flags & !(15 << I_RM_SHIFT) & !(15 << I_REG_SHIFT))
                    | ((m.reg() as u32) << I_RM_SHIFT)
                    | ((m.rm() as u32) << I_REG_SHIFT);
            }
        }
        0xBA => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            let sub = m.reg() as u32;
            if sub < 4 {
                i.op = Ud;
                *flow = true;
                return;
            }
            put_op3(i, sub);
            i.imm = d.fetch8() as u32;
            i.op = if d.opsize16 {
                rm_sel(&m, BtGrp16R, BtGrp16E)
            } else {
                rm_sel(&m, BtGrp32R, BtGrp32E)
            };
        }
        0xBB => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Btc16RR, Btc16RE)
            } else {
                rm_sel(&m, Btc32RR, Btc32RE)
            };
        }
        0xBC => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Bsf16RR, Bsf16RE)
            } else {
                rm_sel(&m, Bsf32RR, Bsf32RE)
            };
        }
        0xBD => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, Bsr16RR, Bsr16RE)
            } else {
                rm_sel(&m, Bsr32RR, Bsr32RE)
            };
        }
        0xBE => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, MovsxR16R8, MovsxR16E8)
            } else {
                rm_sel(&m, MovsxR32R8, MovsxR32E8)
            };
        }
        0xBF => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, MovR16R16, MovR16E16)
            } else {
                rm_sel(&m, MovsxR32R16, MovsxR32E16)
            };
            if d.opsize16 && m.is_reg {
                i.flags = (i.flags & !(15 << I_RM_SHIFT) & !(15 << I_REG_SHIFT))
                    | ((m.reg() as u32) << I_RM_SHIFT)
                    | ((m.rm() as u32) << I_REG_SHIFT);
            }
        }
        0xC0 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = rm_sel(&m, XaddR8R8, XaddE8R8);
        }
        0xC1 => {
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.op = if d.opsize16 {
                rm_sel(&m, XaddR16R16, XaddE16R16)
            } else {
                rm_sel(&m, XaddR32R32, XaddE32R32)
            };
        }
        0xC7 => {
            let m = parse_modrm(d);
            if m.is_reg || m.reg() != 1 {
                i.op = Ud;
                *flow = true;
                return;
            }
            put_modrm(i, &m);
            i.op = Cmpxchg8bE64;
        }
        0xC8..=0xCF => {
            i.flags |= ((opcode & 7) as u32) << I_RM_SHIFT;
            i.op = osz(d, Bswap16, Bswap32);
        }
        // SSE/MMX space: the handler re-dispatches on the opcode byte and
        // prefix class stored in `imm`.
        0x10 | 0x11 | 0x12 | 0x13 | 0x14 | 0x15 | 0x16 | 0x17 | 0x28 | 0x29 | 0x2A | 0x2B
        | 0x2C | 0x2D | 0x2E | 0x2F | 0x50..=0x6F | 0x70 | 0x74..=0x77 | 0x7E | 0x7F | 0xC4
        | 0xC5 | 0xC6 | 0xD1..=0xFE => {
            if opcode == 0x77 {
                // EMMS has no ModR/M.
                i.imm = opcode as u32 | (d.sse_prefix << 8);
                i.op = Op::SimdR;
                return;
            }
            let m = parse_modrm(d);
            put_modrm(i, &m);
            i.imm = opcode as u32 | (d.sse_prefix << 8);
            if matches!(opcode, 0x70 | 0xC4 | 0xC5 | 0xC6) {
                // Shuffle/insert/extract carry an imm8 in `imm` bits 16+.
                i.imm |= (d.fetch8() as u32) << 16;
            }
            i.op = rm_sel(&m, Op::SimdR, Op::SimdE);
        }
        0x71 | 0x72 | 0x73 => {
            let m = parse_modrm(d);
            if !m.is_reg {
                i.op = Op::Ud;
                *flow = true;
                return;
            }
            put_modrm(i, &m);
            i.imm = opcode as u32 | (d.sse_prefix << 8) | ((d.fetch8() as u32) << 16);
            i.op = Op::SimdShiftImm;
        }
        _ => {
            i.op = Op::Ud;
            *flow = true;
        }
    }
}
