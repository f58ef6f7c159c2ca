//! Smashable instructions: control transfers in generated code whose
//! destination can be rewritten while other threads execute them.
//!
//! Every smashable instruction occupies its own 8-byte, 8-aligned cell, so
//! the opcode and displacement always share one naturally aligned machine
//! word. Rewrites go through a compare-and-swap on that word and reads
//! through a single atomic load, so no observer can see half of an old
//! displacement and half of a new one.
//!
//! Encodings are x86-64: `jmp rel32` (`E9 d32`) and `jcc rel32`
//! (`0F 8x d32`).

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use crate::addr::CodeAddr;
use crate::code_cache::{CodeArea, CodeCache};
use crate::error::SrcDbResult;

pub const JMP_LEN: usize = 5;
pub const JCC_LEN: usize = 6;
pub const ADDR_SLOT_LEN: usize = std::mem::size_of::<usize>();

/// Size and alignment of the cell reserved for each smashable instruction.
pub const SMASHABLE_CELL: usize = 8;

const JMP_OPCODE: u8 = 0xE9;
const JCC_PREFIX: u8 = 0x0F;
const JCC_OPCODE_BASE: u8 = 0x80;
const NOP2: [u8; 2] = [0x66, 0x90];
const NOP3: [u8; 3] = [0x0F, 0x1F, 0x00];

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConditionCode {
    O = 0x0,
    NO = 0x1,
    B = 0x2,
    AE = 0x3,
    E = 0x4,
    NE = 0x5,
    BE = 0x6,
    A = 0x7,
    S = 0x8,
    NS = 0x9,
    P = 0xA,
    NP = 0xB,
    L = 0xC,
    GE = 0xD,
    LE = 0xE,
    G = 0xF,
}

impl ConditionCode {
    fn from_bits(bits: u8) -> Self {
        match bits & 0xF {
            0x0 => ConditionCode::O,
            0x1 => ConditionCode::NO,
            0x2 => ConditionCode::B,
            0x3 => ConditionCode::AE,
            0x4 => ConditionCode::E,
            0x5 => ConditionCode::NE,
            0x6 => ConditionCode::BE,
            0x7 => ConditionCode::A,
            0x8 => ConditionCode::S,
            0x9 => ConditionCode::NS,
            0xA => ConditionCode::P,
            0xB => ConditionCode::NP,
            0xC => ConditionCode::L,
            0xD => ConditionCode::GE,
            0xE => ConditionCode::LE,
            _ => ConditionCode::G,
        }
    }
}

/// Emits a smashable `jmp` to `target` into `area` and returns its address.
pub fn emit_smashable_jmp(
    cache: &CodeCache,
    area: CodeArea,
    target: CodeAddr,
) -> SrcDbResult<CodeAddr> {
    let cell = cache.alloc(area, SMASHABLE_CELL, SMASHABLE_CELL)?;
    // SAFETY: the cell was just allocated from the mapping and is unreachable.
    unsafe { place_smashable_jmp(cell.start, target) };
    Ok(cell.start)
}

/// Emits a smashable `jcc` to `target` into `area` and returns its address.
pub fn emit_smashable_jcc(
    cache: &CodeCache,
    area: CodeArea,
    cc: ConditionCode,
    target: CodeAddr,
) -> SrcDbResult<CodeAddr> {
    let cell = cache.alloc(area, SMASHABLE_CELL, SMASHABLE_CELL)?;
    // SAFETY: the cell was just allocated from the mapping and is unreachable.
    unsafe { place_smashable_jcc(cell.start, cc, target) };
    Ok(cell.start)
}

/// Writes a smashable `jmp` cell at `at`, inside code being generated.
///
/// # Safety
/// `at` must be cell-aligned, writable, mapped for the next
/// [`SMASHABLE_CELL`] bytes and not yet reachable by any other thread.
pub unsafe fn place_smashable_jmp(at: CodeAddr, target: CodeAddr) {
    let mut cell = [0u8; SMASHABLE_CELL];
    cell[0] = JMP_OPCODE;
    cell[1..JMP_LEN].copy_from_slice(&rel32(at, JMP_LEN, target).to_le_bytes());
    cell[JMP_LEN..].copy_from_slice(&NOP3);
    unsafe { write_cell(at, cell) };
}

/// Writes a smashable `jcc` cell at `at`, inside code being generated.
///
/// # Safety
/// Same contract as [`place_smashable_jmp`].
pub unsafe fn place_smashable_jcc(at: CodeAddr, cc: ConditionCode, target: CodeAddr) {
    let mut cell = [0u8; SMASHABLE_CELL];
    cell[0] = JCC_PREFIX;
    cell[1] = JCC_OPCODE_BASE | cc as u8;
    cell[2..JCC_LEN].copy_from_slice(&rel32(at, JCC_LEN, target).to_le_bytes());
    cell[JCC_LEN..].copy_from_slice(&NOP2);
    unsafe { write_cell(at, cell) };
}

/// Emits a naturally aligned code-pointer slot holding `target`.
pub fn emit_smashable_addr(
    cache: &CodeCache,
    area: CodeArea,
    target: CodeAddr,
) -> SrcDbResult<CodeAddr> {
    let slot = target.raw().to_ne_bytes();
    Ok(cache.emit_aligned(area, &slot, ADDR_SLOT_LEN)?.start)
}

/// Rewrites the displacement of the `jmp` at `addr`.
///
/// # Safety
/// `addr` must point at a live smashable jmp emitted by `emit_smashable_jmp`
/// (or laid out identically) whose memory stays mapped for the call.
pub unsafe fn smash_jmp(addr: CodeAddr, target: CodeAddr) {
    let disp = rel32(addr, JMP_LEN, target);
    unsafe {
        rewrite_cell(addr, JMP_LEN, |insn| {
            assert_eq!(insn[0], JMP_OPCODE, "no smashable jmp at {addr}");
            insn[1..JMP_LEN].copy_from_slice(&disp.to_le_bytes());
        });
    }
}

/// Rewrites the displacement of the `jcc` at `addr`, keeping its condition.
///
/// # Safety
/// Same contract as [`smash_jmp`], for a jcc.
pub unsafe fn smash_jcc(addr: CodeAddr, target: CodeAddr) {
    let disp = rel32(addr, JCC_LEN, target);
    unsafe {
        rewrite_cell(addr, JCC_LEN, |insn| {
            assert!(is_jcc(insn), "no smashable jcc at {addr}");
            insn[2..JCC_LEN].copy_from_slice(&disp.to_le_bytes());
        });
    }
}

/// Stores `target` into the code-pointer slot at `addr`.
///
/// The slot is overwritten unconditionally, whatever it held before.
///
/// # Safety
/// `addr` must be a live, pointer-aligned slot that no one accesses
/// non-atomically.
pub unsafe fn smash_addr(addr: CodeAddr, target: CodeAddr) {
    assert_atomically_accessible(addr);
    let slot = unsafe { AtomicUsize::from_ptr(addr.as_ptr() as *mut usize) };
    slot.store(target.raw(), Ordering::Release);
}

/// # Safety
/// Same contract as [`smash_jmp`].
pub unsafe fn smashable_jmp_target(addr: CodeAddr) -> CodeAddr {
    let insn = unsafe { read_cell(addr, JMP_LEN) };
    assert_eq!(insn[0], JMP_OPCODE, "no smashable jmp at {addr}");
    decode_rel32(addr, JMP_LEN, &insn[1..JMP_LEN])
}

/// # Safety
/// Same contract as [`smash_jcc`].
pub unsafe fn smashable_jcc_target(addr: CodeAddr) -> CodeAddr {
    let insn = unsafe { read_cell(addr, JCC_LEN) };
    assert!(is_jcc(&insn), "no smashable jcc at {addr}");
    decode_rel32(addr, JCC_LEN, &insn[2..JCC_LEN])
}

/// # Safety
/// Same contract as [`smash_jcc`].
pub unsafe fn smashable_jcc_cond(addr: CodeAddr) -> ConditionCode {
    let insn = unsafe { read_cell(addr, JCC_LEN) };
    assert!(is_jcc(&insn), "no smashable jcc at {addr}");
    ConditionCode::from_bits(insn[1])
}

/// # Safety
/// Same contract as [`smash_addr`].
pub unsafe fn smashable_addr_target(addr: CodeAddr) -> CodeAddr {
    assert_atomically_accessible(addr);
    let slot = unsafe { AtomicUsize::from_ptr(addr.as_ptr() as *mut usize) };
    CodeAddr::new(slot.load(Ordering::Acquire))
}

fn assert_atomically_accessible(addr: CodeAddr) {
    assert!(
        addr.is_aligned(ADDR_SLOT_LEN),
        "address slot {addr} is not naturally aligned"
    );
}

fn is_jcc(insn: &[u8]) -> bool {
    insn[0] == JCC_PREFIX && insn[1] & 0xF0 == JCC_OPCODE_BASE
}

fn rel32(addr: CodeAddr, insn_len: usize, target: CodeAddr) -> i32 {
    let next = addr.raw() as i64 + insn_len as i64;
    let rel = target.raw() as i64 - next;
    i32::try_from(rel)
        .unwrap_or_else(|_| panic!("rel32 displacement from {addr} to {target} overflows"))
}

fn decode_rel32(addr: CodeAddr, insn_len: usize, disp: &[u8]) -> CodeAddr {
    let rel = i32::from_le_bytes([disp[0], disp[1], disp[2], disp[3]]);
    let next = addr.raw() as i64 + insn_len as i64;
    CodeAddr::new((next + rel as i64) as usize)
}

/// Splits `addr` into its containing aligned word and the byte offset of
/// `addr` inside it, checking that `len` bytes fit without straddling.
fn containing_word(addr: CodeAddr, len: usize) -> (usize, usize) {
    let word = addr.raw() & !(SMASHABLE_CELL - 1);
    let lead = addr.raw() - word;
    assert!(
        lead + len <= SMASHABLE_CELL,
        "smashable instruction at {addr} straddles an atomic word"
    );
    (word, lead)
}

unsafe fn rewrite_cell(addr: CodeAddr, len: usize, mut edit: impl FnMut(&mut [u8])) {
    let (word_addr, lead) = containing_word(addr, len);
    let word = unsafe { AtomicU64::from_ptr(word_addr as *mut u64) };
    let mut current = word.load(Ordering::Acquire);
    loop {
        let mut bytes = current.to_ne_bytes();
        edit(&mut bytes[lead..lead + len]);
        let next = u64::from_ne_bytes(bytes);
        match word.compare_exchange_weak(current, next, Ordering::AcqRel, Ordering::Acquire) {
            Ok(_) => return,
            Err(observed) => current = observed,
        }
    }
}

unsafe fn write_cell(at: CodeAddr, cell: [u8; SMASHABLE_CELL]) {
    assert!(
        at.is_aligned(SMASHABLE_CELL),
        "smashable cell at {at} is not {SMASHABLE_CELL}-byte aligned"
    );
    let word = unsafe { AtomicU64::from_ptr(at.as_ptr() as *mut u64) };
    word.store(u64::from_ne_bytes(cell), Ordering::Release);
}

unsafe fn read_cell(addr: CodeAddr, len: usize) -> [u8; SMASHABLE_CELL] {
    let (word_addr, lead) = containing_word(addr, len);
    let word = unsafe { AtomicU64::from_ptr(word_addr as *mut u64) };
    let bytes = word.load(Ordering::Acquire).to_ne_bytes();
    let mut insn = [0u8; SMASHABLE_CELL];
    insn[..len].copy_from_slice(&bytes[lead..lead + len]);
    insn
}
