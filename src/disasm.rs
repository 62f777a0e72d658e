//! Decode-only disassembly.
//!
//! Walks the same decoder the engine executes through, over an immutable
//! borrow of the address space — register, flag, and memory state cannot be
//! touched from here by construction. Output is Intel syntax: uppercase
//! mnemonics and bare registers, size-tagged pointer expressions with
//! lowercase registers inside the brackets.

use std::fmt;

use crate::decoder::{Decoder, Instruction, Opcode, Operand, OperandSize};
use crate::engine::MAX_INSTRUCTION_LEN;
use crate::memory::AddressSpace;

/// One listing line. Immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisassembledInstruction {
    pub address: u64,
    pub mnemonic: String,
    pub length: usize,
}

impl fmt::Display for DisassembledInstruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}: {}", self.address, self.mnemonic)
    }
}

/// Disassembles `count` instructions starting at `start`.
///
/// A decode fault becomes a `(bad)` line of length 1 so a listing keeps
/// flowing past garbage bytes; only execution treats the same fault as
/// fatal.
pub fn disassemble(
    memory: &AddressSpace,
    start: u64,
    count: usize,
) -> Vec<DisassembledInstruction> {
    let decoder = Decoder::new();
    let mut out = Vec::with_capacity(count);
    let mut addr = start;
    for _ in 0..count {
        let line = decode_one(&decoder, memory, addr);
        addr = addr.wrapping_add(line.length as u64);
        out.push(line);
    }
    out
}

/// Disassembles from `start` up to (not including) `end`.
pub fn disassemble_range(
    memory: &AddressSpace,
    start: u64,
    end: u64,
) -> Vec<DisassembledInstruction> {
    let decoder = Decoder::new();
    let mut out = Vec::new();
    let mut addr = start;
    while addr < end {
        let line = decode_one(&decoder, memory, addr);
        addr = addr.wrapping_add(line.length as u64);
        out.push(line);
    }
    out
}

fn decode_one(decoder: &Decoder, memory: &AddressSpace, addr: u64) -> DisassembledInstruction {
    let window = memory.read_vec(addr, MAX_INSTRUCTION_LEN);
    match decoder.decode(&window, addr) {
        Ok(inst) => DisassembledInstruction {
            address: addr,
            length: inst.size,
            mnemonic: format_instruction(&inst),
        },
        Err(_) => DisassembledInstruction {
            address: addr,
            length: 1,
            mnemonic: "(bad)".to_string(),
        },
    }
}

fn mnemonic(inst: &Instruction) -> String {
    match inst.opcode {
        Opcode::Mov => "MOV".into(),
        Opcode::Lea => "LEA".into(),
        Opcode::Xchg => "XCHG".into(),
        Opcode::Movzx => "MOVZX".into(),
        Opcode::Movsx => "MOVSX".into(),
        Opcode::Add => "ADD".into(),
        Opcode::Adc => "ADC".into(),
        Opcode::Sub => "SUB".into(),
        Opcode::Sbb => "SBB".into(),
        Opcode::Cmp => "CMP".into(),
        Opcode::And => "AND".into(),
        Opcode::Or => "OR".into(),
        Opcode::Xor => "XOR".into(),
        Opcode::Test => "TEST".into(),
        Opcode::Not => "NOT".into(),
        Opcode::Neg => "NEG".into(),
        Opcode::Inc => "INC".into(),
        Opcode::Dec => "DEC".into(),
        Opcode::Mul => "MUL".into(),
        Opcode::Imul => "IMUL".into(),
        Opcode::Div => "DIV".into(),
        Opcode::Idiv => "IDIV".into(),
        Opcode::Shl => "SHL".into(),
        Opcode::Shr => "SHR".into(),
        Opcode::Sar => "SAR".into(),
        Opcode::Rol => "ROL".into(),
        Opcode::Ror => "ROR".into(),
        Opcode::Rcl => "RCL".into(),
        Opcode::Rcr => "RCR".into(),
        Opcode::Push => "PUSH".into(),
        Opcode::Pop => "POP".into(),
        Opcode::Jmp => "JMP".into(),
        Opcode::Jcc(cond) => format!("J{}", cond.mnemonic()),
        Opcode::Setcc(cond) => format!("SET{}", cond.mnemonic()),
        Opcode::Call => "CALL".into(),
        Opcode::Ret => "RET".into(),
        Opcode::Cwde => match inst.operand_size {
            OperandSize::Word => "CBW".into(),
            OperandSize::QWord => "CDQE".into(),
            _ => "CWDE".into(),
        },
        Opcode::Cdq => match inst.operand_size {
            OperandSize::Word => "CWD".into(),
            OperandSize::QWord => "CQO".into(),
            _ => "CDQ".into(),
        },
        Opcode::Nop => "NOP".into(),
        Opcode::Hlt => "HLT".into(),
    }
}

/// Formats an immediate at the width it occupies, so -1 on a byte operand
/// prints as 0xFF rather than a 64-bit mask.
fn format_immediate(value: i64, size: OperandSize) -> String {
    let masked = match size {
        OperandSize::Byte => value as u8 as u64,
        OperandSize::Word => value as u16 as u64,
        OperandSize::DWord => value as u32 as u64,
        OperandSize::QWord => value as u64,
    };
    format!("0x{:X}", masked)
}

fn format_memory(
    base: Option<crate::cpu::Register>,
    index: Option<crate::cpu::Register>,
    scale: u8,
    displacement: i64,
    size: OperandSize,
) -> String {
    let mut expr = String::new();
    if let Some(b) = base {
        expr.push_str(b.name());
    }
    if let Some(i) = index {
        if !expr.is_empty() {
            expr.push('+');
        }
        expr.push_str(i.name());
        if scale > 1 {
            expr.push_str(&format!("*{}", scale));
        }
    }
    if expr.is_empty() {
        // pure displacement: absolute address form
        expr = format!("0x{:X}", displacement as u64 as u32);
    } else if displacement > 0 {
        expr.push_str(&format!("+0x{:X}", displacement));
    } else if displacement < 0 {
        expr.push_str(&format!("-0x{:X}", -displacement));
    }
    format!("{} [{}]", size.tag(), expr)
}

fn format_operand(inst: &Instruction, operand: &Operand) -> String {
    match operand {
        Operand::Register(r) => r.name().to_uppercase(),
        Operand::Memory {
            base,
            index,
            scale,
            displacement,
            size,
        } => format_memory(*base, *index, *scale, *displacement, *size),
        Operand::Immediate(v) => {
            // immediates print at the destination operand's width
            let size = inst.operands[0].size(inst.operand_size);
            format_immediate(*v, size)
        }
        Operand::Relative(d) => {
            let target = inst
                .address
                .wrapping_add(inst.size as u64)
                .wrapping_add(*d as u64);
            format!("0x{:X}", target)
        }
    }
}

/// Pure formatting over a decoded instruction; no machine state involved.
pub fn format_instruction(inst: &Instruction) -> String {
    let name = mnemonic(inst);
    if inst.operands.is_empty() {
        return name;
    }
    let operands: Vec<String> = inst
        .operands
        .iter()
        .map(|op| format_operand(inst, op))
        .collect();
    format!("{} {}", name, operands.join(","))
}
