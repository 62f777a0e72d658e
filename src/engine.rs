//! The control unit: fetch → decode → execute, one instruction per step.
//!
//! An [`Emulator`] owns its register file, flag state, and address space
//! outright — construct one instance per isolated run. Decode and execute
//! are fused per instruction: the decoder consumes exactly the bytes the
//! instruction needs, the IP advances past them, and the handler commits
//! its writeback and flags before the next fetch begins.

use std::collections::{BTreeSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, trace};

use crate::alu;
use crate::cpu::{FlagSet, Register, RegisterFile};
use crate::decoder::{
    Condition, Decoder, Instruction, Opcode, Operand, OperandSize, PrefixState,
};
use crate::error::{EmulatorError, Result};
use crate::memory::{AddressSpace, Segment};

/// Entry point of the code segment.
pub const CODE_BASE: u64 = 0x1000;
/// Base of the heap reservation.
pub const HEAP_BASE: u64 = 0x0010_0000;
pub const HEAP_SIZE: u64 = 0x0010_0000;
/// Low end of the stack reservation; RSP starts at the top.
pub const STACK_BASE: u64 = 0x007F_0000;
pub const STACK_SIZE: u64 = 0x0001_0000;
pub const STACK_TOP: u64 = STACK_BASE + STACK_SIZE;

/// Longest legal x86 encoding; the fetch window per instruction.
pub const MAX_INSTRUCTION_LEN: usize = 15;

/// Default depth of the step-back snapshot ring.
pub const DEFAULT_SNAPSHOT_LIMIT: usize = 64;

/// Result of a single step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepEvent {
    Executed,
    /// The instruction was HLT (or the machine was already halted).
    Halted,
}

/// Why a `run` came to rest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunExit {
    /// RIP landed exactly on a breakpoint address; the instruction there
    /// has not been executed.
    Breakpoint(u64),
    Halted,
    /// The cooperative stop flag was observed at an instruction boundary.
    Stopped,
    Fault(EmulatorError),
}

/// Current machine state, observable by the driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Running,
    Halted,
    Faulted(EmulatorError),
}

/// Deep copy of everything a step can change, for step-back.
#[derive(Debug, Clone)]
pub struct Snapshot {
    pub cpu: RegisterFile,
    pub flags: FlagSet,
    pub memory: AddressSpace,
}

pub struct Emulator {
    pub cpu: RegisterFile,
    pub flags: FlagSet,
    pub memory: AddressSpace,
    decoder: Decoder,
    state: State,
    image: Vec<u8>,
    breakpoints: BTreeSet<u64>,
    snapshots: VecDeque<Snapshot>,
    snapshot_limit: usize,
}

impl Emulator {
    /// Builds an emulator around a raw code image: `.main` is seeded with
    /// the image at [`CODE_BASE`], heap and stack reservations are laid
    /// out, RIP points at the entry and RSP at the stack top.
    pub fn new(code: &[u8]) -> Self {
        let mut emu = Emulator {
            cpu: RegisterFile::new(),
            flags: FlagSet::CLEAR,
            memory: AddressSpace::new(),
            decoder: Decoder::new(),
            state: State::Running,
            image: code.to_vec(),
            breakpoints: BTreeSet::new(),
            snapshots: VecDeque::new(),
            snapshot_limit: DEFAULT_SNAPSHOT_LIMIT,
        };
        emu.reset();
        emu
    }

    /// Rebuilds registers, flags, and the address space from the retained
    /// code image. Breakpoints survive a reset; snapshots do not.
    pub fn reset(&mut self) {
        self.cpu = RegisterFile::new();
        self.flags = FlagSet::CLEAR;
        self.memory = AddressSpace::new();
        self.memory.add_segment(Segment::with_bytes(
            ".main",
            CODE_BASE,
            self.image.len() as u64,
            &self.image,
        ));
        self.memory
            .add_segment(Segment::new("heap", HEAP_BASE, HEAP_SIZE));
        self.memory
            .add_segment(Segment::new("stack", STACK_BASE, STACK_SIZE));
        self.cpu.rip = CODE_BASE;
        self.cpu.write(Register::RSP, STACK_TOP);
        self.snapshots.clear();
        self.state = State::Running;
        debug!(entry = CODE_BASE, image_len = self.image.len(), "machine reset");
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn reg_read(&self, reg: Register) -> u64 {
        self.cpu.read(reg)
    }

    pub fn reg_write(&mut self, reg: Register, value: u64) {
        self.cpu.write(reg, value);
    }

    // ---- breakpoints --------------------------------------------------

    pub fn add_breakpoint(&mut self, addr: u64) {
        self.breakpoints.insert(addr);
    }

    pub fn remove_breakpoint(&mut self, addr: u64) {
        self.breakpoints.remove(&addr);
    }

    pub fn clear_breakpoints(&mut self) {
        self.breakpoints.clear();
    }

    pub fn breakpoints(&self) -> impl Iterator<Item = u64> + '_ {
        self.breakpoints.iter().copied()
    }

    // ---- snapshots ----------------------------------------------------

    /// Caps the step-back ring at `limit` entries; 0 disables snapshots.
    pub fn set_snapshot_limit(&mut self, limit: usize) {
        self.snapshot_limit = limit;
        while self.snapshots.len() > limit {
            self.snapshots.pop_front();
        }
    }

    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    fn push_snapshot(&mut self) {
        if self.snapshot_limit == 0 {
            return;
        }
        if self.snapshots.len() == self.snapshot_limit {
            self.snapshots.pop_front();
        }
        self.snapshots.push_back(Snapshot {
            cpu: self.cpu.clone(),
            flags: self.flags,
            memory: self.memory.clone(),
        });
    }

    /// Restores the most recent snapshot, undoing one step. Also clears a
    /// halt or fault, since the state that produced it is gone.
    pub fn step_back(&mut self) -> bool {
        match self.snapshots.pop_back() {
            Some(snap) => {
                self.cpu = snap.cpu;
                self.flags = snap.flags;
                self.memory = snap.memory;
                self.state = State::Running;
                true
            }
            None => false,
        }
    }

    // ---- stepping -----------------------------------------------------

    /// Executes exactly one instruction.
    ///
    /// Faults move the machine to [`State::Faulted`] and are returned as
    /// values; a divide fault may be acknowledged with [`Emulator::resume`],
    /// a decode fault is terminal for the run.
    pub fn step(&mut self) -> Result<StepEvent> {
        match self.state {
            State::Faulted(e) => return Err(e),
            State::Halted => return Ok(StepEvent::Halted),
            State::Running => {}
        }

        self.push_snapshot();

        let rip = self.cpu.rip;
        let window = self.memory.read_vec(rip, MAX_INSTRUCTION_LEN);
        let inst = match self.decoder.decode(&window, rip) {
            Ok(inst) => inst,
            Err(e) => return Err(self.fault(e)),
        };
        trace!(addr = rip, opcode = ?inst.opcode, len = inst.size, "execute");

        self.cpu.rip = rip + inst.size as u64;
        match self.execute(&inst) {
            Ok(true) => {
                self.state = State::Halted;
                Ok(StepEvent::Halted)
            }
            Ok(false) => Ok(StepEvent::Executed),
            Err(e) => Err(self.fault(e)),
        }
    }

    /// Runs until a breakpoint, HLT, fault, or a cooperative stop request.
    /// The stop flag and breakpoints are checked between instructions only;
    /// an instruction's writeback is never torn.
    pub fn run(&mut self, stop: &AtomicBool) -> RunExit {
        loop {
            if stop.load(Ordering::Relaxed) {
                debug!(rip = self.cpu.rip, "run stopped by request");
                return RunExit::Stopped;
            }
            if self.breakpoints.contains(&self.cpu.rip) {
                debug!(rip = self.cpu.rip, "breakpoint hit");
                return RunExit::Breakpoint(self.cpu.rip);
            }
            match self.step() {
                Ok(StepEvent::Executed) => {}
                Ok(StepEvent::Halted) => return RunExit::Halted,
                Err(e) => return RunExit::Fault(e),
            }
        }
    }

    /// Acknowledges a resumable fault (a divide condition) and returns the
    /// machine to `Running`. Returns false for terminal faults.
    pub fn resume(&mut self) -> bool {
        if let State::Faulted(e) = self.state {
            if e.is_resumable() {
                self.state = State::Running;
                return true;
            }
        }
        false
    }

    fn fault(&mut self, e: EmulatorError) -> EmulatorError {
        debug!(error = %e, "emulation fault");
        self.state = State::Faulted(e);
        e
    }

    // ---- operand plumbing --------------------------------------------

    /// Resolves a memory operand's effective address against live register
    /// state. RIP-relative forms see the post-instruction RIP because the
    /// IP has already advanced by the time handlers run.
    fn effective_address(&self, inst: &Instruction, operand: &Operand) -> u64 {
        let Operand::Memory {
            base,
            index,
            scale,
            displacement,
            ..
        } = operand
        else {
            unreachable!("effective_address on a non-memory operand");
        };
        let mut ea = base.map_or(0, |r| self.cpu.read(r));
        if let Some(idx) = index {
            ea = ea.wrapping_add(self.cpu.read(*idx).wrapping_mul(*scale as u64));
        }
        ea = ea.wrapping_add(*displacement as u64);
        if inst.prefixes.contains(PrefixState::ADDRESS_SIZE) {
            ea &= 0xFFFF_FFFF;
        }
        ea
    }

    /// Reads an operand as little-endian bytes of `size`.
    fn operand_bytes(&self, inst: &Instruction, operand: &Operand, size: OperandSize) -> Vec<u8> {
        match operand {
            Operand::Register(r) => self.cpu.read_bytes(*r),
            Operand::Memory { .. } => {
                let ea = self.effective_address(inst, operand);
                self.memory.read_vec(ea, size.bytes())
            }
            Operand::Immediate(v) => v.to_le_bytes()[..size.bytes()].to_vec(),
            Operand::Relative(_) => unreachable!("branch displacement read as a value"),
        }
    }

    fn write_operand(&mut self, inst: &Instruction, operand: &Operand, bytes: &[u8]) {
        match operand {
            Operand::Register(r) => self.cpu.write_bytes(*r, bytes),
            Operand::Memory { .. } => {
                let ea = self.effective_address(inst, operand);
                self.memory.write(ea, bytes);
            }
            _ => unreachable!("write to an immediate"),
        }
    }

    /// The accumulator view at a given width (AL/AX/EAX/RAX).
    fn accumulator(size: OperandSize) -> Register {
        match size {
            OperandSize::Byte => Register::AL,
            OperandSize::Word => Register::AX,
            OperandSize::DWord => Register::EAX,
            OperandSize::QWord => Register::RAX,
        }
    }

    /// The data register view at a given width (DL/DX/EDX/RDX).
    fn data_reg(size: OperandSize) -> Register {
        match size {
            OperandSize::Byte => Register::DL,
            OperandSize::Word => Register::DX,
            OperandSize::DWord => Register::EDX,
            OperandSize::QWord => Register::RDX,
        }
    }

    fn condition(&self, cond: Condition, inst: &Instruction) -> bool {
        let carry = self.flags.carry.is_on();
        let overflow = self.flags.overflow.is_on();
        let sign = self.flags.sign.is_on();
        let zero = self.flags.zero.is_on();
        let parity = self.flags.parity.is_on();
        match cond {
            Condition::O => overflow,
            Condition::No => !overflow,
            Condition::B => carry,
            Condition::Ae => !carry,
            Condition::E => zero,
            Condition::Ne => !zero,
            Condition::Be => carry || zero,
            Condition::A => !carry && !zero,
            Condition::S => sign,
            Condition::Ns => !sign,
            Condition::P => parity,
            Condition::Np => !parity,
            Condition::L => sign != overflow,
            Condition::Ge => sign == overflow,
            Condition::Le => zero || sign != overflow,
            Condition::G => !zero && sign == overflow,
            Condition::Rcxz => {
                if inst.prefixes.contains(PrefixState::ADDRESS_SIZE) {
                    self.cpu.read(Register::ECX) == 0
                } else {
                    self.cpu.read(Register::RCX) == 0
                }
            }
        }
    }

    // ---- execution ----------------------------------------------------

    /// Dispatches one decoded instruction. Returns true when the machine
    /// should halt (HLT).
    fn execute(&mut self, inst: &Instruction) -> Result<bool> {
        match inst.opcode {
            Opcode::Nop => {}
            Opcode::Hlt => return Ok(true),
            Opcode::Mov => self.exec_mov(inst),
            Opcode::Lea => self.exec_lea(inst),
            Opcode::Xchg => self.exec_xchg(inst),
            Opcode::Movzx => self.exec_movx(inst, false),
            Opcode::Movsx => self.exec_movx(inst, true),
            Opcode::Add
            | Opcode::Adc
            | Opcode::Sub
            | Opcode::Sbb
            | Opcode::Cmp
            | Opcode::And
            | Opcode::Or
            | Opcode::Xor
            | Opcode::Test => self.exec_binary(inst),
            Opcode::Inc | Opcode::Dec => self.exec_incdec(inst),
            Opcode::Not => self.exec_not(inst),
            Opcode::Neg => self.exec_neg(inst),
            Opcode::Mul => self.exec_mul(inst, false),
            Opcode::Imul => match inst.operands.len() {
                1 => self.exec_mul(inst, true),
                _ => self.exec_imul_reg(inst),
            },
            Opcode::Div => self.exec_div(inst, false)?,
            Opcode::Idiv => self.exec_div(inst, true)?,
            Opcode::Shl
            | Opcode::Shr
            | Opcode::Sar
            | Opcode::Rol
            | Opcode::Ror
            | Opcode::Rcl
            | Opcode::Rcr => self.exec_shift(inst),
            Opcode::Push => self.exec_push(inst),
            Opcode::Pop => self.exec_pop(inst),
            Opcode::Jmp => self.exec_jmp(inst),
            Opcode::Jcc(cond) => self.exec_jcc(inst, cond),
            Opcode::Setcc(cond) => self.exec_setcc(inst, cond),
            Opcode::Call => self.exec_call(inst),
            Opcode::Ret => self.exec_ret(inst),
            Opcode::Cwde => self.exec_cwde(inst),
            Opcode::Cdq => self.exec_cdq(inst),
        }
        Ok(false)
    }

    fn exec_mov(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let value = self.operand_bytes(inst, &inst.operands[1], size);
        self.write_operand(inst, &inst.operands[0], &value);
    }

    fn exec_lea(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let ea = self.effective_address(inst, &inst.operands[1]);
        self.write_operand(inst, &inst.operands[0], &ea.to_le_bytes()[..size.bytes()]);
    }

    fn exec_xchg(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let a = self.operand_bytes(inst, &inst.operands[0], size);
        let b = self.operand_bytes(inst, &inst.operands[1], size);
        self.write_operand(inst, &inst.operands[0], &b);
        self.write_operand(inst, &inst.operands[1], &a);
    }

    fn exec_movx(&mut self, inst: &Instruction, sign_extend: bool) {
        let dst_size = inst.operands[0].size(inst.operand_size);
        let src_size = inst.operands[1].size(OperandSize::Byte);
        let narrow = self.operand_bytes(inst, &inst.operands[1], src_size);
        let wide = alu::extend(&narrow, dst_size.bytes(), sign_extend);
        self.write_operand(inst, &inst.operands[0], &wide);
    }

    /// The shared two-operand ALU path: read both sides, run the engine,
    /// commit flags, and write the result back unless the opcode is a pure
    /// comparison.
    fn exec_binary(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let a = self.operand_bytes(inst, &inst.operands[0], size);
        let mut b = self.operand_bytes(inst, &inst.operands[1], size);
        if b.len() < a.len() {
            // sign-extended imm8 forms (0x83 and friends)
            b = alu::extend(&b, a.len(), true);
        }

        let carry = self.flags.carry.is_on();
        let (flags, result) = match inst.opcode {
            Opcode::Add => alu::add(&a, &b, false),
            Opcode::Adc => alu::add(&a, &b, carry),
            Opcode::Sub | Opcode::Cmp => alu::sub(&a, &b, false),
            Opcode::Sbb => alu::sub(&a, &b, carry),
            Opcode::And | Opcode::Test => alu::and(&a, &b),
            Opcode::Or => alu::or(&a, &b),
            Opcode::Xor => alu::xor(&a, &b),
            _ => unreachable!(),
        };

        self.flags = flags;
        if !matches!(inst.opcode, Opcode::Cmp | Opcode::Test) {
            self.write_operand(inst, &inst.operands[0], &result);
        }
    }

    fn exec_incdec(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let value = self.operand_bytes(inst, &inst.operands[0], size);
        let (flags, result) = if inst.opcode == Opcode::Inc {
            alu::inc(&value)
        } else {
            alu::dec(&value)
        };
        // INC/DEC leave the carry flag untouched
        let carry = self.flags.carry;
        self.flags = flags;
        self.flags.carry = carry;
        self.write_operand(inst, &inst.operands[0], &result);
    }

    fn exec_not(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let value = self.operand_bytes(inst, &inst.operands[0], size);
        let (_, result) = alu::not(&value);
        self.write_operand(inst, &inst.operands[0], &result);
    }

    fn exec_neg(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let value = self.operand_bytes(inst, &inst.operands[0], size);
        let (flags, result) = alu::neg(&value);
        self.flags = flags;
        self.write_operand(inst, &inst.operands[0], &result);
    }

    /// One-operand MUL/IMUL: accumulator × r/m, double-width result split
    /// across the accumulator and data registers (AX, or rDX:rAX).
    fn exec_mul(&mut self, inst: &Instruction, signed: bool) {
        let size = inst.operands[0].size(inst.operand_size);
        let a = self.cpu.read_bytes(Self::accumulator(size));
        let b = self.operand_bytes(inst, &inst.operands[0], size);
        let (flags, product) = alu::mul(&a, &b, signed);
        let n = size.bytes();
        if size == OperandSize::Byte {
            // AX takes the whole 16-bit product
            self.cpu.write_bytes(Register::AX, &product);
        } else {
            self.cpu
                .write_bytes(Self::accumulator(size), &product[..n]);
            self.cpu.write_bytes(Self::data_reg(size), &product[n..]);
        }
        self.flags = flags;
    }

    /// Two- and three-operand IMUL: the result truncates to the operand
    /// width; Carry/Overflow still report double-width significance.
    fn exec_imul_reg(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let a = self.operand_bytes(inst, &inst.operands[1], size);
        let b = if inst.operands.len() == 3 {
            self.operand_bytes(inst, &inst.operands[2], size)
        } else {
            self.operand_bytes(inst, &inst.operands[0], size)
        };
        // two-operand form multiplies dst by src; three-operand multiplies
        // src by imm — either way `a` is the r/m side
        let (lhs, rhs) = if inst.operands.len() == 3 {
            (a, b)
        } else {
            (b, a)
        };
        let (flags, product) = alu::mul(&lhs, &rhs, true);
        self.write_operand(inst, &inst.operands[0], &product[..size.bytes()]);
        self.flags = flags;
    }

    /// DIV/IDIV: double-width dividend from the accumulator pair, r/m
    /// divisor, restoring repeated subtraction underneath. Quotients that
    /// do not fit the operand width fault, as the silicon does.
    fn exec_div(&mut self, inst: &Instruction, signed: bool) -> Result<()> {
        let size = inst.operands[0].size(inst.operand_size);
        let n = size.bytes();

        let dividend = if size == OperandSize::Byte {
            self.cpu.read_bytes(Register::AX)
        } else {
            let mut wide = self.cpu.read_bytes(Self::accumulator(size));
            wide.extend_from_slice(&self.cpu.read_bytes(Self::data_reg(size)));
            wide
        };
        let divisor = self.operand_bytes(inst, &inst.operands[0], size);
        let divisor = alu::extend(&divisor, 2 * n, signed);

        let (quotient, remainder) = match alu::div(&dividend, &divisor, signed) {
            Ok(pair) => pair,
            Err(alu::DivideError::DivideByZero) => {
                return Err(EmulatorError::DivideByZero { addr: inst.address })
            }
        };

        // the quotient must survive truncation to the destination width
        if alu::extend(&quotient[..n], 2 * n, signed) != quotient {
            return Err(EmulatorError::DivisionOverflow { addr: inst.address });
        }

        if size == OperandSize::Byte {
            self.cpu.write(Register::AL, quotient[0] as u64);
            self.cpu.write(Register::AH, remainder[0] as u64);
        } else {
            self.cpu
                .write_bytes(Self::accumulator(size), &quotient[..n]);
            self.cpu.write_bytes(Self::data_reg(size), &remainder[..n]);
        }
        self.flags = FlagSet::UNDEFINED;
        Ok(())
    }

    fn exec_shift(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(inst.operand_size);
        let value = self.operand_bytes(inst, &inst.operands[0], size);
        let count = match inst.operands[1] {
            Operand::Immediate(v) => v as u32 & 0xFF,
            Operand::Register(r) => self.cpu.read(r) as u32 & 0xFF,
            _ => unreachable!(),
        };

        let carry = self.flags.carry.is_on();
        let (flags, result) = match inst.opcode {
            Opcode::Shl => alu::shl(&value, count),
            Opcode::Shr => alu::shr(&value, count, false),
            Opcode::Sar => alu::shr(&value, count, true),
            Opcode::Rol => alu::rol(&value, count),
            Opcode::Ror => alu::ror(&value, count),
            Opcode::Rcl => alu::rcl(&value, count, carry),
            Opcode::Rcr => alu::rcr(&value, count, carry),
            _ => unreachable!(),
        };

        self.write_operand(inst, &inst.operands[0], &result);
        // a wrapped-to-zero count leaves the flag state alone
        if flags != FlagSet::UNDEFINED {
            self.flags = flags;
        }
    }

    fn push_bytes(&mut self, bytes: &[u8]) {
        let rsp = self
            .cpu
            .read(Register::RSP)
            .wrapping_sub(bytes.len() as u64);
        self.memory.write(rsp, bytes);
        self.cpu.write(Register::RSP, rsp);
    }

    fn pop_bytes(&mut self, len: usize) -> Vec<u8> {
        let rsp = self.cpu.read(Register::RSP);
        let bytes = self.memory.read_vec(rsp, len);
        self.cpu.write(Register::RSP, rsp.wrapping_add(len as u64));
        bytes
    }

    fn exec_push(&mut self, inst: &Instruction) {
        // immediates push at the full stack width; register and memory
        // operands carry their own (64- or 16-bit) size from decode
        let size = inst.operands[0].size(OperandSize::QWord);
        let value = self.operand_bytes(inst, &inst.operands[0], size);
        self.push_bytes(&value);
    }

    fn exec_pop(&mut self, inst: &Instruction) {
        let size = inst.operands[0].size(OperandSize::QWord);
        let value = self.pop_bytes(size.bytes());
        self.write_operand(inst, &inst.operands[0], &value);
    }

    /// Branch target: relative forms add the displacement to the
    /// post-instruction RIP, absolute forms resolve through the operand.
    fn branch_target(&self, inst: &Instruction, operand: &Operand) -> u64 {
        match operand {
            Operand::Relative(d) => self.cpu.rip.wrapping_add(*d as u64),
            _ => {
                let bytes = self.operand_bytes(inst, operand, OperandSize::QWord);
                u64::from_le_bytes(bytes.try_into().expect("qword branch operand"))
            }
        }
    }

    fn exec_jmp(&mut self, inst: &Instruction) {
        self.cpu.rip = self.branch_target(inst, &inst.operands[0]);
    }

    fn exec_jcc(&mut self, inst: &Instruction, cond: Condition) {
        if self.condition(cond, inst) {
            self.cpu.rip = self.branch_target(inst, &inst.operands[0]);
        }
    }

    fn exec_setcc(&mut self, inst: &Instruction, cond: Condition) {
        let value = self.condition(cond, inst) as u8;
        self.write_operand(inst, &inst.operands[0], &[value]);
    }

    fn exec_call(&mut self, inst: &Instruction) {
        let target = self.branch_target(inst, &inst.operands[0]);
        let ret = self.cpu.rip;
        self.push_bytes(&ret.to_le_bytes());
        self.cpu.rip = target;
    }

    fn exec_ret(&mut self, inst: &Instruction) {
        let ret = self.pop_bytes(8);
        self.cpu.rip = u64::from_le_bytes(ret.try_into().expect("qword return address"));
        if let Some(Operand::Immediate(n)) = inst.operands.first() {
            let rsp = self.cpu.read(Register::RSP);
            self.cpu
                .write(Register::RSP, rsp.wrapping_add(*n as u64));
        }
    }

    /// 0x98 family: widen the accumulator in place (CBW/CWDE/CDQE by
    /// operand size).
    fn exec_cwde(&mut self, inst: &Instruction) {
        match inst.operand_size {
            OperandSize::Word => {
                let v = self.cpu.read(Register::AL) as i8 as i16;
                self.cpu.write(Register::AX, v as u16 as u64);
            }
            OperandSize::QWord => {
                let v = self.cpu.read(Register::EAX) as i32 as i64;
                self.cpu.write(Register::RAX, v as u64);
            }
            _ => {
                let v = self.cpu.read(Register::AX) as i16 as i32;
                self.cpu.write(Register::EAX, v as u32 as u64);
            }
        }
    }

    /// 0x99 family: sign-fill the data register from the accumulator
    /// (CWD/CDQ/CQO by operand size).
    fn exec_cdq(&mut self, inst: &Instruction) {
        let size = inst.operand_size;
        let acc = self.cpu.read_bytes(Self::accumulator(size));
        let fill = if alu::is_negative(&acc) { 0xFFu8 } else { 0x00 };
        let filled = vec![fill; size.bytes()];
        self.cpu.write_bytes(Self::data_reg(size), &filled);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cpu::FlagValue;

    fn stepped(code: &[u8], steps: usize) -> Emulator {
        let mut emu = Emulator::new(code);
        for _ in 0..steps {
            emu.step().unwrap();
        }
        emu
    }

    #[test]
    fn mov_imm_and_add() {
        // mov eax, 10; mov ebx, 5; add eax, ebx
        let emu = stepped(
            &[0xB8, 0x0A, 0, 0, 0, 0xBB, 0x05, 0, 0, 0, 0x01, 0xD8],
            3,
        );
        assert_eq!(emu.reg_read(Register::EAX), 15);
        assert_eq!(emu.flags.zero, FlagValue::Off);
    }

    #[test]
    fn cmp_commits_flags_but_not_result() {
        // mov eax, 7; cmp eax, 7
        let emu = stepped(&[0xB8, 0x07, 0, 0, 0, 0x83, 0xF8, 0x07], 2);
        assert_eq!(emu.reg_read(Register::EAX), 7);
        assert_eq!(emu.flags.zero, FlagValue::On);
        assert_eq!(emu.flags.carry, FlagValue::Off);
    }

    #[test]
    fn push_pop_roundtrip() {
        // mov rax, imm; push rax; pop rbx
        let emu = stepped(
            &[
                0x48, 0xB8, 0xEF, 0xBE, 0xAD, 0xDE, 0, 0, 0, 0, 0x50, 0x5B,
            ],
            3,
        );
        assert_eq!(emu.reg_read(Register::RBX), 0xDEAD_BEEF);
        assert_eq!(emu.reg_read(Register::RSP), STACK_TOP);
    }

    #[test]
    fn divide_by_zero_faults_and_resumes() {
        // xor ebx, ebx; mov eax, 1; div ebx
        let mut emu = Emulator::new(&[0x31, 0xDB, 0xB8, 0x01, 0, 0, 0, 0xF7, 0xF3]);
        emu.step().unwrap();
        emu.step().unwrap();
        let err = emu.step().unwrap_err();
        assert_eq!(err, EmulatorError::DivideByZero { addr: CODE_BASE + 7 });
        assert!(matches!(emu.state(), State::Faulted(_)));
        assert!(emu.resume());
        assert!(matches!(emu.state(), State::Running));
    }

    #[test]
    fn decode_fault_is_terminal() {
        let mut emu = Emulator::new(&[0x0E]);
        let err = emu.step().unwrap_err();
        assert!(matches!(err, EmulatorError::InvalidOpcode { .. }));
        assert!(!emu.resume());
    }

    #[test]
    fn loop_with_jnz() {
        // mov ecx, 5; dec ecx; jnz back to the dec; hlt
        let code = [0xB9, 0x05, 0, 0, 0, 0xFF, 0xC9, 0x75, 0xFC, 0xF4];
        let mut emu = Emulator::new(&code);
        let stop = AtomicBool::new(false);
        assert_eq!(emu.run(&stop), RunExit::Halted);
        assert_eq!(emu.reg_read(Register::ECX), 0);
    }

    #[test]
    fn breakpoint_halts_before_decode() {
        // mov eax, 1; mov ebx, 2; hlt
        let code = [0xB8, 0x01, 0, 0, 0, 0xBB, 0x02, 0, 0, 0, 0xF4];
        let mut emu = Emulator::new(&code);
        emu.add_breakpoint(CODE_BASE + 5);
        let stop = AtomicBool::new(false);
        assert_eq!(emu.run(&stop), RunExit::Breakpoint(CODE_BASE + 5));
        assert_eq!(emu.cpu.rip, CODE_BASE + 5);
        assert_eq!(emu.reg_read(Register::EAX), 1);
        // the instruction under the breakpoint has not run
        assert_eq!(emu.reg_read(Register::EBX), 0);
    }

    #[test]
    fn step_back_restores_state() {
        let code = [0xB8, 0x01, 0, 0, 0, 0xB8, 0x02, 0, 0, 0];
        let mut emu = Emulator::new(&code);
        emu.step().unwrap();
        emu.step().unwrap();
        assert_eq!(emu.reg_read(Register::EAX), 2);
        assert!(emu.step_back());
        assert_eq!(emu.reg_read(Register::EAX), 1);
        assert_eq!(emu.cpu.rip, CODE_BASE + 5);
        assert!(emu.step_back());
        assert_eq!(emu.reg_read(Register::EAX), 0);
        assert!(!emu.step_back());
    }

    #[test]
    fn snapshot_ring_is_bounded() {
        let code = [0x90; 32];
        let mut emu = Emulator::new(&code);
        emu.set_snapshot_limit(4);
        for _ in 0..10 {
            emu.step().unwrap();
        }
        assert_eq!(emu.snapshot_count(), 4);
    }

    #[test]
    fn call_and_ret() {
        // call +5; hlt; (pad); target: mov eax, 9; ret
        let code = [
            0xE8, 0x01, 0, 0, 0, // call +1 -> 0x1006
            0xF4, // hlt
            0xB8, 0x09, 0, 0, 0, // mov eax, 9
            0xC3, // ret -> back to hlt
        ];
        let mut emu = Emulator::new(&code);
        let stop = AtomicBool::new(false);
        assert_eq!(emu.run(&stop), RunExit::Halted);
        assert_eq!(emu.reg_read(Register::EAX), 9);
        assert_eq!(emu.reg_read(Register::RSP), STACK_TOP);
    }

    #[test]
    fn memory_operand_roundtrip() {
        // mov dword [heap], eax then read it back into ebx
        let heap = HEAP_BASE as u32;
        let mut code = vec![0xB8, 0x44, 0x33, 0x22, 0x11]; // mov eax, imm
        code.extend_from_slice(&[0x89, 0x04, 0x25]); // mov [disp32], eax
        code.extend_from_slice(&heap.to_le_bytes());
        code.extend_from_slice(&[0x8B, 0x1C, 0x25]); // mov ebx, [disp32]
        code.extend_from_slice(&heap.to_le_bytes());
        let emu = stepped(&code, 3);
        assert_eq!(emu.reg_read(Register::EBX), 0x1122_3344);
        assert_eq!(emu.memory.read_u32(HEAP_BASE), 0x1122_3344);
    }

    #[test]
    fn rip_relative_sees_post_instruction_ip() {
        // mov eax, [rip + 0] reads the bytes immediately after the
        // instruction — here the hlt encoding plus padding
        let code = [0x8B, 0x05, 0, 0, 0, 0, 0xF4, 0x00, 0x00, 0x00];
        let emu = stepped(&code, 1);
        assert_eq!(emu.reg_read(Register::EAX), 0xF4);
    }
}
