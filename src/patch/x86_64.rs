//! x86_64 jump encodings and prologue planning.
//!
//! Everything in here is pure: it works on byte slices and addresses and never touches live
//! code, so it builds and is tested on every host architecture. [`super::NativeRedirector`]
//! applies the results to memory.
//!
//! # Patch Layout
//!
//! ```text
//! target:      E9 <rel32 to relay>  CC CC ..        (jump, padded to whole instructions)
//! relay:       FF 25 00000000 <replacement:u64>     (absolute jump, within ±1 GiB of target)
//! trampoline:  <relocated prologue>                 (the callable original entry point)
//!              FF 25 00000000 <target + consumed>
//! ```
//!
//! The relay is allocated close enough for the five-byte form. [`encode_jump`] falls back to
//! the fourteen-byte absolute form for destinations out of `rel32` reach.

use iced_x86::{
    BlockEncoder, BlockEncoderOptions, Decoder, DecoderOptions, FlowControl, Instruction,
    InstructionBlock,
};

use crate::{Error, Result};

/// Length of `jmp rel32`
pub const REL32_JMP_LEN: usize = 5;

/// Length of `jmp qword ptr [rip+0]` followed by the 64-bit destination
pub const ABS_JMP_LEN: usize = 14;

/// Padding byte for the unused tail of the overwritten prologue (`int3`)
pub const PADDING: u8 = 0xCC;

/// Computes the `rel32` operand of a `jmp` located at `from` that lands on `to`.
///
/// Returns `None` if the displacement does not fit into a signed 32-bit value.
pub fn rel32_displacement(from: u64, to: u64) -> Option<i32> {
    let next = i128::from(from) + REL32_JMP_LEN as i128;
    i32::try_from(i128::from(to) - next).ok()
}

/// Encodes `jmp rel32` at `from` to `to`, if `to` is reachable.
pub fn encode_rel32_jmp(from: u64, to: u64) -> Option<[u8; REL32_JMP_LEN]> {
    let rel = rel32_displacement(from, to)?;

    let mut jmp = [0xE9, 0, 0, 0, 0];
    jmp[1..].copy_from_slice(&rel.to_le_bytes());
    Some(jmp)
}

/// Encodes `jmp qword ptr [rip+0]` with the absolute destination stored inline.
pub fn encode_abs_jmp(to: u64) -> [u8; ABS_JMP_LEN] {
    let mut jmp = [0xFF, 0x25, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0];
    jmp[6..].copy_from_slice(&to.to_le_bytes());
    jmp
}

/// Encodes the shortest jump from `from` to `to`.
pub fn encode_jump(from: u64, to: u64) -> Vec<u8> {
    match encode_rel32_jmp(from, to) {
        Some(rel) => rel.to_vec(),
        None => encode_abs_jmp(to).to_vec(),
    }
}

/// The whole instructions at the start of a function that a jump will overwrite.
#[derive(Debug, Clone)]
pub struct ProloguePlan {
    /// Address of the function
    pub address: u64,
    /// The jump that will be written at `address`
    pub jump: Vec<u8>,
    /// Bytes of whole instructions the jump covers, `>= jump.len()`
    pub consumed: usize,
    instructions: Vec<Instruction>,
}

impl ProloguePlan {
    /// Number of instructions that are moved to the trampoline.
    pub fn instruction_count(&self) -> usize {
        self.instructions.len()
    }

    /// The bytes written at the function: the jump, padded with `int3` to `consumed`.
    pub fn patch_bytes(&self) -> Vec<u8> {
        let mut patch = self.jump.clone();
        patch.resize(self.consumed, PADDING);
        patch
    }

    /// Re-encodes the overwritten instructions at `trampoline` and appends the jump back into
    /// the function, right behind the overwritten bytes.
    ///
    /// RIP-relative operands and branch targets are adjusted to the new location.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Relocation`] when an instruction cannot be encoded at `trampoline`, e.g.
    /// because a RIP-relative operand would end up more than 2 GiB away from its data.
    pub fn relocate(&self, trampoline: u64) -> Result<Vec<u8>> {
        let block = InstructionBlock::new(&self.instructions, trampoline);
        let encoded = BlockEncoder::encode(64, block, BlockEncoderOptions::NONE)
            .map_err(|e| Error::Relocation(e.to_string()))?;

        let mut code = encoded.code_buffer;
        let resume = self
            .address
            .checked_add(self.consumed as u64)
            .ok_or_else(|| patch_error!("Resume address overflows at {:#x}", self.address))?;
        code.extend_from_slice(&encode_abs_jmp(resume));
        Ok(code)
    }
}

/// Plans a redirect of the function at `address` to `destination`.
///
/// `code` holds the bytes currently found at `address`; it only needs to cover the prologue.
/// Whole instructions are taken until the jump fits.
///
/// # Errors
///
/// Returns [`Error::PrologueTooShort`] if `code` runs out, holds an undecodable instruction, or
/// the function returns or jumps away before enough bytes are covered.
pub fn plan_redirect(code: &[u8], address: u64, destination: u64) -> Result<ProloguePlan> {
    let jump = encode_jump(address, destination);
    let needed = jump.len();

    let too_short = |available: usize| Error::PrologueTooShort {
        address: address as usize,
        available,
        needed,
    };

    let mut decoder = Decoder::with_ip(64, code, address, DecoderOptions::NONE);
    let mut instructions = Vec::new();
    let mut consumed = 0usize;

    for instr in &mut decoder {
        if instr.is_invalid() {
            return Err(too_short(consumed));
        }

        consumed += instr.len();
        let terminates = matches!(
            instr.flow_control(),
            FlowControl::Return
                | FlowControl::UnconditionalBranch
                | FlowControl::IndirectBranch
                | FlowControl::Interrupt
                | FlowControl::Exception
        );
        instructions.push(instr);

        if consumed >= needed {
            return Ok(ProloguePlan {
                address,
                jump,
                consumed,
                instructions,
            });
        }

        if terminates {
            return Err(too_short(consumed));
        }
    }

    Err(too_short(consumed))
}
