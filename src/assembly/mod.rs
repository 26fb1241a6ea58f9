//! CIL instruction model, codec and pattern matching.
//!
//! This module is the instruction layer everything else builds on. Method bodies are decoded
//! into position-independent [`Instruction`] lists, edited by transforms, and encoded back into
//! bytes with freshly computed branch offsets and exception tables.
//!
//! # Architecture
//!
//! - **Opcode table** - [`opcodes`] declares every opcode once, with mnemonic, operand layout
//!   and flow control. Decoder and encoder both read operand widths from it.
//! - **Instruction model** - [`Instruction`], [`Operand`], [`BranchTarget`] and
//!   [`ExceptionBlock`]. Branches name instructions by identity or by [`Label`].
//! - **Codec** - [`decode_stream`] / [`decode_body`] and [`encode`] / [`encode_body`].
//! - **Allocation** - [`CodeGenerator`] hands out identities, labels and locals.
//! - **Matching** - [`CodeMatch`], [`match_sequence`] and [`CodeMatcher`].
//!
//! # Examples
//!
//! ```rust
//! use dotpatch::assembly::{decode_stream, encode, CodeGenerator};
//!
//! // ldarg.0; ldarg.1; add; ret
//! let code = [0x02, 0x03, 0x58, 0x2A];
//! let mut generator = CodeGenerator::new();
//! let instructions = decode_stream(&code, &mut generator)?;
//! let encoded = encode(&instructions, &mut generator)?;
//! assert_eq!(encoded.code, code);
//! # Ok::<(), dotpatch::Error>(())
//! ```

mod decoder;
mod encoder;
mod generator;
mod instruction;
mod matcher;
pub mod opcodes;

pub use decoder::{decode_body, decode_stream, DecodedBody};
pub use encoder::{encode, encode_body, fit_opcode, EncodedCode, InstructionEncoder};
pub use generator::CodeGenerator;
pub use instruction::{
    BranchTarget, ExceptionBlock, FlowType, Instruction, InstructionId, Label, MemberRef, OpCode,
    OpCodeInfo, Operand, OperandKind,
};
pub use matcher::{
    match_sequence, search, CodeMatch, CodeMatcher, Direction, InstructionPredicate, Match,
    Position,
};
