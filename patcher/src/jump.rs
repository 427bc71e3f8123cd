//! The one instruction rewrite we need: a near `jz rel32` into a near `jmp rel32`.
//!
//! This is deliberately not an assembler.  It knows exactly one encoding pair.

/// `jz rel32`, 6 bytes: 0F 84 + displacement.
pub const JZ_NEAR: [u8; 2] = [0x0F, 0x84];
/// `jmp rel32`, 5 bytes: E9 + displacement.
pub const JMP_NEAR: u8 = 0xE9;
pub const NOP: u8 = 0x90;

/// Rewrite `0F 84 rel32` as `E9 rel32' 90`, with the same branch target.
///
/// Displacements are relative to the end of the instruction.  The jmp is one byte shorter, so
/// its displacement is one larger; the nop keeps the footprint at 6 bytes.  Returns None for any
/// other input, or if the adjusted displacement overflows.
pub fn flip_jz_to_jmp(code: &[u8]) -> Option<[u8; 6]> {
    if code.len() != 6 || code[0..2] != JZ_NEAR {
        return None;
    }
    let rel = i32::from_le_bytes([code[2], code[3], code[4], code[5]]);
    let d = rel.checked_add(1)?.to_le_bytes();
    Some([JMP_NEAR, d[0], d[1], d[2], d[3], NOP])
}
