//! demu64 — an x86-64 machine-code emulator and disassembler core.
//!
//! The crate fetches raw machine code from a sparse [`AddressSpace`],
//! decodes it by hand (prefixes, ModRM/SIB, immediates), executes against
//! an explicit register/flag state with byte-exact flag semantics, and can
//! walk the same decode path side-effect-free for listings. Drivers — a
//! debugger shell, a regression harness — sit on top of [`Emulator`]
//! directly or behind the threaded [`runner::Runner`].

pub mod alu;
pub mod cpu;
pub mod decoder;
pub mod disasm;
pub mod engine;
pub mod error;
pub mod memory;
pub mod runner;

pub use cpu::{FlagSet, FlagValue, Register, RegisterFile};
pub use decoder::{Condition, Decoder, Instruction, Opcode, Operand, OperandSize, PrefixState};
pub use disasm::{disassemble, disassemble_range, DisassembledInstruction};
pub use engine::{Emulator, RunExit, Snapshot, State, StepEvent, CODE_BASE, STACK_TOP};
pub use error::{EmulatorError, Result};
pub use memory::{AddressSpace, Segment};
pub use runner::{Event, Request, Runner, StateView};
