//! Instruction decoding: prefixes, opcode dispatch, ModRM/SIB addressing
//! forms, and immediates. Decoding is a pure function from bytes to an
//! [`Instruction`]; it never touches register, flag, or memory state, which
//! is what lets the disassembler and the execution engine share it.

use bitflags::bitflags;

use crate::cpu::Register;
use crate::error::{EmulatorError, Result};

bitflags! {
    /// Prefix bytes accumulated for the current instruction and cleared at
    /// the instruction boundary.
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct PrefixState: u8 {
        /// 0x66 — operand-size override.
        const OPERAND_SIZE = 1 << 0;
        /// 0x67 — address-size override.
        const ADDRESS_SIZE = 1 << 1;
        /// REX.W — promote the operand size to 64 bits.
        const REX_W = 1 << 2;
        /// Any REX byte was seen. The machine model has eight GPRs, so
        /// REX.R/X/B carry no register extension here; the bit is kept so
        /// the encoded length and prefix accounting stay exact.
        const REX = 1 << 3;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandSize {
    Byte,
    Word,
    DWord,
    QWord,
}

impl OperandSize {
    pub fn bytes(&self) -> usize {
        match self {
            OperandSize::Byte => 1,
            OperandSize::Word => 2,
            OperandSize::DWord => 4,
            OperandSize::QWord => 8,
        }
    }

    /// Intel-syntax pointer tag.
    pub fn tag(&self) -> &'static str {
        match self {
            OperandSize::Byte => "BYTE PTR",
            OperandSize::Word => "WORD PTR",
            OperandSize::DWord => "DWORD PTR",
            OperandSize::QWord => "QWORD PTR",
        }
    }
}

/// A decoded operand. Memory operands carry the full effective-address
/// recipe; resolution against live register state happens in the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Register(Register),
    Memory {
        base: Option<Register>,
        index: Option<Register>,
        scale: u8,
        displacement: i64,
        size: OperandSize,
    },
    Immediate(i64),
    /// IP-relative branch displacement (applied to the post-instruction IP).
    Relative(i64),
}

impl Operand {
    /// Width of the value this operand reads or writes.
    pub fn size(&self, default: OperandSize) -> OperandSize {
        match self {
            Operand::Register(r) => match r.size() {
                1 => OperandSize::Byte,
                2 => OperandSize::Word,
                4 => OperandSize::DWord,
                _ => OperandSize::QWord,
            },
            Operand::Memory { size, .. } => *size,
            Operand::Immediate(_) | Operand::Relative(_) => default,
        }
    }
}

/// Condition codes for Jcc/SETcc, evaluated against the live flag state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    O,
    No,
    B,
    Ae,
    E,
    Ne,
    Be,
    A,
    S,
    Ns,
    P,
    Np,
    L,
    Ge,
    Le,
    G,
    /// JRCXZ: register-is-zero test, no flags involved.
    Rcxz,
}

impl Condition {
    /// Low-nibble encoding shared by the 0x70 row and the 0x0F 0x80/0x90 rows.
    fn from_nibble(n: u8) -> Condition {
        use Condition::*;
        match n & 0x0F {
            0x0 => O,
            0x1 => No,
            0x2 => B,
            0x3 => Ae,
            0x4 => E,
            0x5 => Ne,
            0x6 => Be,
            0x7 => A,
            0x8 => S,
            0x9 => Ns,
            0xA => P,
            0xB => Np,
            0xC => L,
            0xD => Ge,
            0xE => Le,
            _ => G,
        }
    }

    pub fn mnemonic(&self) -> &'static str {
        use Condition::*;
        match self {
            O => "O",
            No => "NO",
            B => "B",
            Ae => "AE",
            E => "E",
            Ne => "NE",
            Be => "BE",
            A => "A",
            S => "S",
            Ns => "NS",
            P => "P",
            Np => "NP",
            L => "L",
            Ge => "GE",
            Le => "LE",
            G => "G",
            Rcxz => "RCXZ",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Mov,
    Lea,
    Xchg,
    Movzx,
    Movsx,
    Add,
    Adc,
    Sub,
    Sbb,
    Cmp,
    And,
    Or,
    Xor,
    Test,
    Not,
    Neg,
    Inc,
    Dec,
    Mul,
    Imul,
    Div,
    Idiv,
    Shl,
    Shr,
    Sar,
    Rol,
    Ror,
    Rcl,
    Rcr,
    Push,
    Pop,
    Jmp,
    Jcc(Condition),
    Setcc(Condition),
    Call,
    Ret,
    Cwde,
    Cdq,
    Nop,
    Hlt,
}

/// One decoded instruction: everything the engine needs to execute it and
/// everything the disassembler needs to print it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Instruction {
    pub address: u64,
    pub opcode: Opcode,
    pub operands: Vec<Operand>,
    /// Encoded length in bytes; the IP advances past this before execution.
    pub size: usize,
    pub prefixes: PrefixState,
    pub operand_size: OperandSize,
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
    address: u64,
}

impl<'a> Cursor<'a> {
    fn u8(&mut self) -> Result<u8> {
        let b = self
            .bytes
            .get(self.pos)
            .copied()
            .ok_or(EmulatorError::InvalidOperand { addr: self.address })?;
        self.pos += 1;
        Ok(b)
    }

    fn i8(&mut self) -> Result<i64> {
        Ok(self.u8()? as i8 as i64)
    }

    fn i16(&mut self) -> Result<i64> {
        let lo = self.u8()?;
        let hi = self.u8()?;
        Ok(i16::from_le_bytes([lo, hi]) as i64)
    }

    fn i32(&mut self) -> Result<i64> {
        let mut buf = [0u8; 4];
        for b in buf.iter_mut() {
            *b = self.u8()?;
        }
        Ok(i32::from_le_bytes(buf) as i64)
    }

    fn i64(&mut self) -> Result<i64> {
        let mut buf = [0u8; 8];
        for b in buf.iter_mut() {
            *b = self.u8()?;
        }
        Ok(i64::from_le_bytes(buf))
    }
}

/// The instruction decoder. 64-bit mode only; the escape byte 0x0F selects
/// the two-byte opcode map, and group opcodes re-dispatch on ModRM.reg.
#[derive(Debug, Clone, Copy, Default)]
pub struct Decoder;

impl Decoder {
    pub fn new() -> Self {
        Decoder
    }

    /// Decodes one instruction from `bytes` (the window fetched at
    /// `address`). The returned [`Instruction::size`] is the exact number
    /// of bytes consumed.
    pub fn decode(&self, bytes: &[u8], address: u64) -> Result<Instruction> {
        let mut cur = Cursor {
            bytes,
            pos: 0,
            address,
        };
        let mut prefixes = PrefixState::default();

        let opcode_byte = loop {
            let byte = cur.u8()?;
            match byte {
                0x66 => prefixes |= PrefixState::OPERAND_SIZE,
                0x67 => prefixes |= PrefixState::ADDRESS_SIZE,
                0x40..=0x4F => {
                    prefixes |= PrefixState::REX;
                    if byte & 0x08 != 0 {
                        prefixes |= PrefixState::REX_W;
                    }
                }
                // segment overrides, LOCK and REP are outside this machine
                // model; byte alignment past them cannot be trusted
                0x26 | 0x2E | 0x36 | 0x3E | 0x64 | 0x65 | 0xF0 | 0xF2 | 0xF3 => {
                    return Err(EmulatorError::InvalidPrefix {
                        addr: address,
                        byte,
                    })
                }
                _ => break byte,
            }
        };

        let size = self.operand_size(prefixes);
        let (opcode, operands) = if opcode_byte == 0x0F {
            self.decode_two_byte(&mut cur, prefixes, size)?
        } else {
            self.decode_one_byte(&mut cur, opcode_byte, prefixes, size)?
        };

        Ok(Instruction {
            address,
            opcode,
            operands,
            size: cur.pos,
            prefixes,
            operand_size: size,
        })
    }

    fn operand_size(&self, prefixes: PrefixState) -> OperandSize {
        if prefixes.contains(PrefixState::REX_W) {
            OperandSize::QWord
        } else if prefixes.contains(PrefixState::OPERAND_SIZE) {
            OperandSize::Word
        } else {
            OperandSize::DWord
        }
    }

    fn decode_one_byte(
        &self,
        cur: &mut Cursor,
        byte: u8,
        prefixes: PrefixState,
        size: OperandSize,
    ) -> Result<(Opcode, Vec<Operand>)> {
        // the eight classic ALU rows share one encoding pattern
        if byte < 0x40 && byte & 0x07 < 6 {
            let family = match byte >> 3 {
                0 => Opcode::Add,
                1 => Opcode::Or,
                2 => Opcode::Adc,
                3 => Opcode::Sbb,
                4 => Opcode::And,
                5 => Opcode::Sub,
                6 => Opcode::Xor,
                _ => Opcode::Cmp,
            };
            return self.decode_alu_row(cur, family, byte & 0x07, size);
        }

        match byte {
            0x50..=0x57 => {
                let reg = self.gpr(byte & 0x07, self.stack_size(prefixes));
                Ok((Opcode::Push, vec![Operand::Register(reg)]))
            }
            0x58..=0x5F => {
                let reg = self.gpr(byte & 0x07, self.stack_size(prefixes));
                Ok((Opcode::Pop, vec![Operand::Register(reg)]))
            }
            0x68 => {
                let imm = cur.i32()?;
                Ok((Opcode::Push, vec![Operand::Immediate(imm)]))
            }
            0x6A => {
                let imm = cur.i8()?;
                Ok((Opcode::Push, vec![Operand::Immediate(imm)]))
            }
            0x69 => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                let imm = self.imm(cur, size)?;
                let dst = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Imul, vec![dst, rm, Operand::Immediate(imm)]))
            }
            0x6B => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                let imm = cur.i8()?;
                let dst = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Imul, vec![dst, rm, Operand::Immediate(imm)]))
            }
            0x70..=0x7F => {
                let cond = Condition::from_nibble(byte);
                let rel = cur.i8()?;
                Ok((Opcode::Jcc(cond), vec![Operand::Relative(rel)]))
            }
            0x80 | 0x81 | 0x83 => self.decode_group1(cur, byte, size),
            0x84 => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                let reg = Operand::Register(self.gpr(reg_bits, OperandSize::Byte));
                Ok((Opcode::Test, vec![rm, reg]))
            }
            0x85 => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                let reg = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Test, vec![rm, reg]))
            }
            0x86 => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                let reg = Operand::Register(self.gpr(reg_bits, OperandSize::Byte));
                Ok((Opcode::Xchg, vec![rm, reg]))
            }
            0x87 => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                let reg = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Xchg, vec![rm, reg]))
            }
            0x88 => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                let reg = Operand::Register(self.gpr(reg_bits, OperandSize::Byte));
                Ok((Opcode::Mov, vec![rm, reg]))
            }
            0x89 => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                let reg = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Mov, vec![rm, reg]))
            }
            0x8A => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                let reg = Operand::Register(self.gpr(reg_bits, OperandSize::Byte));
                Ok((Opcode::Mov, vec![reg, rm]))
            }
            0x8B => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                let reg = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Mov, vec![reg, rm]))
            }
            0x8D => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                if !matches!(rm, Operand::Memory { .. }) {
                    return Err(EmulatorError::InvalidOperand { addr: cur.address });
                }
                let reg = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Lea, vec![reg, rm]))
            }
            0x8F => {
                let (rm, reg_bits) = self.modrm(cur, self.stack_size(prefixes))?;
                if reg_bits != 0 {
                    return Err(EmulatorError::InvalidOperand { addr: cur.address });
                }
                Ok((Opcode::Pop, vec![rm]))
            }
            0x90 => Ok((Opcode::Nop, vec![])),
            0x98 => Ok((Opcode::Cwde, vec![])),
            0x99 => Ok((Opcode::Cdq, vec![])),
            0xA8 => {
                let imm = cur.i8()?;
                Ok((
                    Opcode::Test,
                    vec![Operand::Register(Register::AL), Operand::Immediate(imm)],
                ))
            }
            0xA9 => {
                let imm = self.imm(cur, size)?;
                let acc = Operand::Register(self.gpr(0, size));
                Ok((Opcode::Test, vec![acc, Operand::Immediate(imm)]))
            }
            0xB0..=0xB7 => {
                let reg = self.gpr(byte & 0x07, OperandSize::Byte);
                let imm = cur.i8()?;
                Ok((
                    Opcode::Mov,
                    vec![Operand::Register(reg), Operand::Immediate(imm)],
                ))
            }
            0xB8..=0xBF => {
                let reg = self.gpr(byte & 0x07, size);
                // the one x86 form with a full 64-bit immediate
                let imm = match size {
                    OperandSize::QWord => cur.i64()?,
                    OperandSize::Word => cur.i16()?,
                    _ => cur.i32()?,
                };
                Ok((
                    Opcode::Mov,
                    vec![Operand::Register(reg), Operand::Immediate(imm)],
                ))
            }
            0xC0 => self.decode_shift_group(cur, OperandSize::Byte, ShiftCount::Imm8),
            0xC1 => self.decode_shift_group(cur, size, ShiftCount::Imm8),
            0xC2 => {
                let imm = cur.i16()?;
                Ok((Opcode::Ret, vec![Operand::Immediate(imm)]))
            }
            0xC3 => Ok((Opcode::Ret, vec![])),
            0xC6 => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                if reg_bits != 0 {
                    return Err(EmulatorError::InvalidOperand { addr: cur.address });
                }
                let imm = cur.i8()?;
                Ok((Opcode::Mov, vec![rm, Operand::Immediate(imm)]))
            }
            0xC7 => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                if reg_bits != 0 {
                    return Err(EmulatorError::InvalidOperand { addr: cur.address });
                }
                let imm = self.imm(cur, size)?;
                Ok((Opcode::Mov, vec![rm, Operand::Immediate(imm)]))
            }
            0xD0 => self.decode_shift_group(cur, OperandSize::Byte, ShiftCount::One),
            0xD1 => self.decode_shift_group(cur, size, ShiftCount::One),
            0xD2 => self.decode_shift_group(cur, OperandSize::Byte, ShiftCount::Cl),
            0xD3 => self.decode_shift_group(cur, size, ShiftCount::Cl),
            0xE3 => {
                let rel = cur.i8()?;
                Ok((Opcode::Jcc(Condition::Rcxz), vec![Operand::Relative(rel)]))
            }
            0xE8 => {
                let rel = cur.i32()?;
                Ok((Opcode::Call, vec![Operand::Relative(rel)]))
            }
            0xE9 => {
                let rel = cur.i32()?;
                Ok((Opcode::Jmp, vec![Operand::Relative(rel)]))
            }
            0xEB => {
                let rel = cur.i8()?;
                Ok((Opcode::Jmp, vec![Operand::Relative(rel)]))
            }
            0xF4 => Ok((Opcode::Hlt, vec![])),
            0xF6 => self.decode_group3(cur, OperandSize::Byte),
            0xF7 => self.decode_group3(cur, size),
            0xFE => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                match reg_bits {
                    0 => Ok((Opcode::Inc, vec![rm])),
                    1 => Ok((Opcode::Dec, vec![rm])),
                    _ => Err(EmulatorError::InvalidOperand { addr: cur.address }),
                }
            }
            0xFF => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                match reg_bits {
                    0 => Ok((Opcode::Inc, vec![rm])),
                    1 => Ok((Opcode::Dec, vec![rm])),
                    2 => Ok((Opcode::Call, vec![self.force_size(rm, OperandSize::QWord)])),
                    4 => Ok((Opcode::Jmp, vec![self.force_size(rm, OperandSize::QWord)])),
                    6 => Ok((Opcode::Push, vec![self.force_size(rm, self.stack_size(prefixes))])),
                    _ => Err(EmulatorError::InvalidOperand { addr: cur.address }),
                }
            }
            _ => Err(EmulatorError::InvalidOpcode {
                addr: cur.address,
                byte,
            }),
        }
    }

    fn decode_two_byte(
        &self,
        cur: &mut Cursor,
        _prefixes: PrefixState,
        size: OperandSize,
    ) -> Result<(Opcode, Vec<Operand>)> {
        let byte = cur.u8()?;
        match byte {
            0x80..=0x8F => {
                let cond = Condition::from_nibble(byte);
                let rel = cur.i32()?;
                Ok((Opcode::Jcc(cond), vec![Operand::Relative(rel)]))
            }
            0x90..=0x9F => {
                let cond = Condition::from_nibble(byte);
                let (rm, _) = self.modrm(cur, OperandSize::Byte)?;
                Ok((Opcode::Setcc(cond), vec![rm]))
            }
            0xAF => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                let dst = Operand::Register(self.gpr(reg_bits, size));
                Ok((Opcode::Imul, vec![dst, rm]))
            }
            0xB6 | 0xB7 | 0xBE | 0xBF => {
                let src_size = if byte & 1 == 0 {
                    OperandSize::Byte
                } else {
                    OperandSize::Word
                };
                let (rm, reg_bits) = self.modrm(cur, src_size)?;
                let dst = Operand::Register(self.gpr(reg_bits, size));
                let op = if byte < 0xBE {
                    Opcode::Movzx
                } else {
                    Opcode::Movsx
                };
                Ok((op, vec![dst, rm]))
            }
            _ => Err(EmulatorError::InvalidOpcode2 {
                addr: cur.address,
                byte,
            }),
        }
    }

    /// The 0x00–0x3D pattern every classic ALU family shares: variant
    /// selects r/m,r / r,r/m / accumulator,imm at byte or full width.
    fn decode_alu_row(
        &self,
        cur: &mut Cursor,
        family: Opcode,
        variant: u8,
        size: OperandSize,
    ) -> Result<(Opcode, Vec<Operand>)> {
        let operands = match variant {
            0 => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                vec![rm, Operand::Register(self.gpr(reg_bits, OperandSize::Byte))]
            }
            1 => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                vec![rm, Operand::Register(self.gpr(reg_bits, size))]
            }
            2 => {
                let (rm, reg_bits) = self.modrm(cur, OperandSize::Byte)?;
                vec![Operand::Register(self.gpr(reg_bits, OperandSize::Byte)), rm]
            }
            3 => {
                let (rm, reg_bits) = self.modrm(cur, size)?;
                vec![Operand::Register(self.gpr(reg_bits, size)), rm]
            }
            4 => {
                let imm = cur.i8()?;
                vec![Operand::Register(Register::AL), Operand::Immediate(imm)]
            }
            _ => {
                let imm = self.imm(cur, size)?;
                vec![Operand::Register(self.gpr(0, size)), Operand::Immediate(imm)]
            }
        };
        Ok((family, operands))
    }

    /// Group 1: immediate forms of the eight ALU families, selected by
    /// ModRM.reg. 0x83 sign-extends an 8-bit immediate to the operand size.
    fn decode_group1(
        &self,
        cur: &mut Cursor,
        byte: u8,
        size: OperandSize,
    ) -> Result<(Opcode, Vec<Operand>)> {
        let size = if byte == 0x80 { OperandSize::Byte } else { size };
        let (rm, reg_bits) = self.modrm(cur, size)?;
        let family = match reg_bits {
            0 => Opcode::Add,
            1 => Opcode::Or,
            2 => Opcode::Adc,
            3 => Opcode::Sbb,
            4 => Opcode::And,
            5 => Opcode::Sub,
            6 => Opcode::Xor,
            _ => Opcode::Cmp,
        };
        let imm = if byte == 0x81 {
            self.imm(cur, size)?
        } else {
            cur.i8()?
        };
        Ok((family, vec![rm, Operand::Immediate(imm)]))
    }

    /// Group 3 (0xF6/0xF7): TEST/NOT/NEG/MUL/IMUL/DIV/IDIV on one r/m.
    fn decode_group3(&self, cur: &mut Cursor, size: OperandSize) -> Result<(Opcode, Vec<Operand>)> {
        let (rm, reg_bits) = self.modrm(cur, size)?;
        match reg_bits {
            0 | 1 => {
                let imm = if size == OperandSize::Byte {
                    cur.i8()?
                } else {
                    self.imm(cur, size)?
                };
                Ok((Opcode::Test, vec![rm, Operand::Immediate(imm)]))
            }
            2 => Ok((Opcode::Not, vec![rm])),
            3 => Ok((Opcode::Neg, vec![rm])),
            4 => Ok((Opcode::Mul, vec![rm])),
            5 => Ok((Opcode::Imul, vec![rm])),
            6 => Ok((Opcode::Div, vec![rm])),
            _ => Ok((Opcode::Idiv, vec![rm])),
        }
    }

    /// Shift/rotate group (0xC0/0xC1/0xD0–0xD3), selected by ModRM.reg.
    fn decode_shift_group(
        &self,
        cur: &mut Cursor,
        size: OperandSize,
        count: ShiftCount,
    ) -> Result<(Opcode, Vec<Operand>)> {
        let (rm, reg_bits) = self.modrm(cur, size)?;
        let op = match reg_bits {
            0 => Opcode::Rol,
            1 => Opcode::Ror,
            2 => Opcode::Rcl,
            3 => Opcode::Rcr,
            4 | 6 => Opcode::Shl,
            5 => Opcode::Shr,
            _ => Opcode::Sar,
        };
        let count_op = match count {
            ShiftCount::One => Operand::Immediate(1),
            ShiftCount::Imm8 => Operand::Immediate(cur.u8()? as i64),
            ShiftCount::Cl => Operand::Register(Register::CL),
        };
        Ok((op, vec![rm, count_op]))
    }

    /// ModRM byte: returns the r/m operand (with SIB and displacement
    /// consumed) and the raw reg field for the caller to interpret — an
    /// operand register for two-operand opcodes, an opcode extension for
    /// groups.
    fn modrm(&self, cur: &mut Cursor, size: OperandSize) -> Result<(Operand, u8)> {
        let byte = cur.u8()?;
        let mod_bits = byte >> 6;
        let reg_bits = (byte >> 3) & 0x07;
        let rm_bits = byte & 0x07;

        if mod_bits == 0b11 {
            return Ok((Operand::Register(self.gpr(rm_bits, size)), reg_bits));
        }

        let (base, index, scale, disp) = if rm_bits == 0b100 {
            self.sib(cur, mod_bits)?
        } else if rm_bits == 0b101 && mod_bits == 0b00 {
            // RIP-relative disp32
            (Some(Register::RIP), None, 1, cur.i32()?)
        } else {
            let disp = match mod_bits {
                0b01 => cur.i8()?,
                0b10 => cur.i32()?,
                _ => 0,
            };
            (Some(self.gpr(rm_bits, OperandSize::QWord)), None, 1, disp)
        };

        Ok((
            Operand::Memory {
                base,
                index,
                scale,
                displacement: disp,
                size,
            },
            reg_bits,
        ))
    }

    /// SIB byte plus the displacement its mod context calls for.
    fn sib(
        &self,
        cur: &mut Cursor,
        mod_bits: u8,
    ) -> Result<(Option<Register>, Option<Register>, u8, i64)> {
        let byte = cur.u8()?;
        let scale_bits = byte >> 6;
        let index_bits = (byte >> 3) & 0x07;
        let base_bits = byte & 0x07;

        let index = if index_bits == 0b100 {
            // no index — but a nonzero scale field still drags RBP into the
            // sum at scale 1, a quirk of this machine model's SIB handling
            if scale_bits != 0 {
                Some(Register::RBP)
            } else {
                None
            }
        } else {
            Some(self.gpr(index_bits, OperandSize::QWord))
        };
        let scale = if index_bits == 0b100 {
            1
        } else {
            1 << scale_bits
        };

        let (base, disp) = if base_bits == 0b101 && mod_bits == 0b00 {
            (None, cur.i32()?)
        } else {
            let disp = match mod_bits {
                0b01 => cur.i8()?,
                0b10 => cur.i32()?,
                _ => 0,
            };
            (Some(self.gpr(base_bits, OperandSize::QWord)), disp)
        };

        Ok((base, index, scale, disp))
    }

    /// Immediate of the operand size; 64-bit forms take a sign-extended
    /// 32-bit immediate (the B8+r row is the one exception and reads its
    /// own).
    fn imm(&self, cur: &mut Cursor, size: OperandSize) -> Result<i64> {
        match size {
            OperandSize::Byte => cur.i8(),
            OperandSize::Word => cur.i16(),
            OperandSize::DWord | OperandSize::QWord => cur.i32(),
        }
    }

    /// Register-number table. 8-bit codes 4–7 name the high bytes of A/C/D/B
    /// — the encoding-space overload that makes the same code mean AH at
    /// byte width and RSP at quad width.
    fn gpr(&self, code: u8, size: OperandSize) -> Register {
        use Register::*;
        match size {
            OperandSize::Byte => match code {
                0 => AL,
                1 => CL,
                2 => DL,
                3 => BL,
                4 => AH,
                5 => CH,
                6 => DH,
                _ => BH,
            },
            OperandSize::Word => match code {
                0 => AX,
                1 => CX,
                2 => DX,
                3 => BX,
                4 => SP,
                5 => BP,
                6 => SI,
                _ => DI,
            },
            OperandSize::DWord => match code {
                0 => EAX,
                1 => ECX,
                2 => EDX,
                3 => EBX,
                4 => ESP,
                5 => EBP,
                6 => ESI,
                _ => EDI,
            },
            OperandSize::QWord => match code {
                0 => RAX,
                1 => RCX,
                2 => RDX,
                3 => RBX,
                4 => RSP,
                5 => RBP,
                6 => RSI,
                _ => RDI,
            },
        }
    }

    /// PUSH/POP default to 64-bit in long mode; 0x66 narrows them to 16.
    fn stack_size(&self, prefixes: PrefixState) -> OperandSize {
        if prefixes.contains(PrefixState::OPERAND_SIZE) {
            OperandSize::Word
        } else {
            OperandSize::QWord
        }
    }

    fn force_size(&self, operand: Operand, size: OperandSize) -> Operand {
        match operand {
            Operand::Register(r) => {
                // re-select the same slot at the forced width
                let code = match r {
                    Register::RAX | Register::EAX | Register::AX | Register::AL => 0,
                    Register::RCX | Register::ECX | Register::CX | Register::CL => 1,
                    Register::RDX | Register::EDX | Register::DX | Register::DL => 2,
                    Register::RBX | Register::EBX | Register::BX | Register::BL => 3,
                    Register::RSP | Register::ESP | Register::SP | Register::AH => 4,
                    Register::RBP | Register::EBP | Register::BP | Register::CH => 5,
                    Register::RSI | Register::ESI | Register::SI | Register::DH => 6,
                    _ => 7,
                };
                Operand::Register(self.gpr(code, size))
            }
            Operand::Memory {
                base,
                index,
                scale,
                displacement,
                ..
            } => Operand::Memory {
                base,
                index,
                scale,
                displacement,
                size,
            },
            other => other,
        }
    }
}

enum ShiftCount {
    One,
    Imm8,
    Cl,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn decode(bytes: &[u8]) -> Instruction {
        Decoder::new().decode(bytes, 0x1000).unwrap()
    }

    #[test]
    fn mov_eax_imm32() {
        let inst = decode(&[0xB8, 0x0A, 0x00, 0x00, 0x00]);
        assert_eq!(inst.opcode, Opcode::Mov);
        assert_eq!(inst.size, 5);
        assert_eq!(
            inst.operands,
            vec![Operand::Register(Register::EAX), Operand::Immediate(0x0A)]
        );
    }

    #[test]
    fn rex_w_promotes_to_qword() {
        let inst = decode(&[0x48, 0x01, 0xD8]); // add rax, rbx
        assert_eq!(inst.opcode, Opcode::Add);
        assert_eq!(inst.operand_size, OperandSize::QWord);
        assert_eq!(
            inst.operands,
            vec![
                Operand::Register(Register::RAX),
                Operand::Register(Register::RBX)
            ]
        );
    }

    #[test]
    fn modrm_sib_full_form() {
        // mov edx, [rax + rbx*4 + 0x10]
        let inst = decode(&[0x8B, 0x54, 0x98, 0x10]);
        assert_eq!(inst.opcode, Opcode::Mov);
        assert_eq!(
            inst.operands[1],
            Operand::Memory {
                base: Some(Register::RAX),
                index: Some(Register::RBX),
                scale: 4,
                displacement: 0x10,
                size: OperandSize::DWord,
            }
        );
    }

    #[test]
    fn sib_no_index_zero_scale() {
        // mov eax, [rsp] — index code 4 with scale 0 means no index at all
        let inst = decode(&[0x8B, 0x04, 0x24]);
        assert_eq!(
            inst.operands[1],
            Operand::Memory {
                base: Some(Register::RSP),
                index: None,
                scale: 1,
                displacement: 0,
                size: OperandSize::DWord,
            }
        );
    }

    #[test]
    fn sib_no_index_nonzero_scale_drags_rbp() {
        // scale field 2, index code 4: the model adds rbp at scale 1
        let inst = decode(&[0x8B, 0x04, 0xA4]);
        assert_eq!(
            inst.operands[1],
            Operand::Memory {
                base: Some(Register::RSP),
                index: Some(Register::RBP),
                scale: 1,
                displacement: 0,
                size: OperandSize::DWord,
            }
        );
    }

    #[test]
    fn rip_relative_disp32() {
        let inst = decode(&[0x8B, 0x05, 0x10, 0x00, 0x00, 0x00]);
        assert_eq!(
            inst.operands[1],
            Operand::Memory {
                base: Some(Register::RIP),
                index: None,
                scale: 1,
                displacement: 0x10,
                size: OperandSize::DWord,
            }
        );
    }

    #[test]
    fn group1_dispatches_on_reg_field() {
        // 0x83 /5 = sub r/m32, imm8 (sign-extended)
        let inst = decode(&[0x83, 0xE8, 0x05]);
        assert_eq!(inst.opcode, Opcode::Sub);
        assert_eq!(
            inst.operands,
            vec![Operand::Register(Register::EAX), Operand::Immediate(5)]
        );

        // 0xF7 /3 = neg r/m32
        let inst = decode(&[0xF7, 0xDB]);
        assert_eq!(inst.opcode, Opcode::Neg);
        assert_eq!(inst.operands, vec![Operand::Register(Register::EBX)]);
    }

    #[test]
    fn group_ff_call_forces_qword() {
        let inst = decode(&[0xFF, 0xD0]); // call rax
        assert_eq!(inst.opcode, Opcode::Call);
        assert_eq!(inst.operands, vec![Operand::Register(Register::RAX)]);
    }

    #[test]
    fn jcc_rel8_condition() {
        let inst = decode(&[0x74, 0xFE]); // je -2
        assert_eq!(inst.opcode, Opcode::Jcc(Condition::E));
        assert_eq!(inst.operands, vec![Operand::Relative(-2)]);
    }

    #[test]
    fn two_byte_jcc_rel32() {
        let inst = decode(&[0x0F, 0x85, 0x00, 0x01, 0x00, 0x00]); // jne +256
        assert_eq!(inst.opcode, Opcode::Jcc(Condition::Ne));
        assert_eq!(inst.operands, vec![Operand::Relative(0x100)]);
        assert_eq!(inst.size, 6);
    }

    #[test]
    fn byte_regs_4_to_7_are_high_bytes() {
        let inst = decode(&[0x88, 0xE3]); // mov bl, ah
        assert_eq!(
            inst.operands,
            vec![
                Operand::Register(Register::BL),
                Operand::Register(Register::AH)
            ]
        );
    }

    #[test]
    fn imul_by_bl() {
        let inst = decode(&[0xF6, 0xEB]);
        assert_eq!(inst.opcode, Opcode::Imul);
        assert_eq!(inst.operands, vec![Operand::Register(Register::BL)]);
    }

    #[test]
    fn unknown_opcode_is_a_decode_fault() {
        let err = Decoder::new().decode(&[0x0E], 0x2000).unwrap_err();
        assert_eq!(
            err,
            EmulatorError::InvalidOpcode {
                addr: 0x2000,
                byte: 0x0E
            }
        );
    }

    #[test]
    fn rep_prefix_is_rejected() {
        let err = Decoder::new().decode(&[0xF3, 0x90], 0x2000).unwrap_err();
        assert_eq!(
            err,
            EmulatorError::InvalidPrefix {
                addr: 0x2000,
                byte: 0xF3
            }
        );
    }
}
