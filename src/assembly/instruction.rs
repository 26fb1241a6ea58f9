//! Instruction representation for decoded and synthesized CIL.
//!
//! An [`Instruction`] is a position-independent record: branch operands name other instructions
//! by identity ([`BranchTarget::Instruction`]) or by [`Label`], never by byte offset. That makes
//! instruction lists freely editable: transforms may reorder, insert or delete entries, and the
//! encoder recomputes every offset.
//!
//! # Key Components
//!
//! - [`OpCode`] - one- or two-byte opcode with table-driven metadata
//! - [`OperandKind`] - the operand layout an opcode expects
//! - [`Operand`] - the operand value carried by an instruction
//! - [`ExceptionBlock`] - markers that describe exception regions on instruction boundaries
//! - [`Instruction`] - opcode, operand, labels and markers with a stable identity
//!
//! # Thread Safety
//!
//! All types in this module are plain data and are [`Send`] and [`Sync`].

use std::fmt;

use strum::{Display, EnumIter};

use crate::{
    assembly::opcodes::{self, opcode_info},
    metadata::token::Token,
};

/// Operand layout of an opcode, as recorded in the opcode table.
///
/// The table entry is the only place where operand width is decided. The decoder reads and the
/// encoder writes exactly the width listed here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum OperandKind {
    /// No operand
    None,
    /// 1-byte immediate
    Int8,
    /// 4-byte immediate
    Int32,
    /// 8-byte immediate
    Int64,
    /// 4-byte IEEE float
    Float32,
    /// 8-byte IEEE float
    Float64,
    /// 1-byte signed branch offset
    ShortBranch,
    /// 4-byte signed branch offset
    Branch,
    /// `u32` count followed by that many 4-byte branch offsets
    Switch,
    /// 1-byte local variable index
    ShortLocal,
    /// 2-byte local variable index
    Local,
    /// 1-byte argument index
    ShortArgument,
    /// 2-byte argument index
    Argument,
    /// Method token
    Method,
    /// Field token
    Field,
    /// Type token
    Type,
    /// Method, field or type token (`ldtoken`)
    Token,
    /// `StandAloneSig` token (`calli`)
    Signature,
    /// User string token (`ldstr`)
    String,
}

impl OperandKind {
    /// Size of the operand in bytes. Switch operands report the size of their count field.
    #[must_use]
    pub const fn size(&self) -> usize {
        match self {
            OperandKind::None => 0,
            OperandKind::Int8
            | OperandKind::ShortBranch
            | OperandKind::ShortLocal
            | OperandKind::ShortArgument => 1,
            OperandKind::Local | OperandKind::Argument => 2,
            OperandKind::Int32
            | OperandKind::Float32
            | OperandKind::Branch
            | OperandKind::Switch
            | OperandKind::Method
            | OperandKind::Field
            | OperandKind::Type
            | OperandKind::Token
            | OperandKind::Signature
            | OperandKind::String => 4,
            OperandKind::Int64 | OperandKind::Float64 => 8,
        }
    }

    /// `true` for metadata token operands
    #[must_use]
    pub const fn is_token(&self) -> bool {
        matches!(
            self,
            OperandKind::Method
                | OperandKind::Field
                | OperandKind::Type
                | OperandKind::Token
                | OperandKind::Signature
        )
    }
}

/// How control leaves an instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, EnumIter)]
pub enum FlowType {
    /// Falls through to the next instruction
    Sequential,
    /// Branches or falls through
    ConditionalBranch,
    /// Always branches
    UnconditionalBranch,
    /// Calls another method, then falls through
    Call,
    /// Returns from the method
    Return,
    /// Multi-way branch
    Switch,
    /// Raises an exception
    Throw,
    /// Ends a finally, fault or filter block
    EndFinally,
    /// Leaves a protected region
    Leave,
    /// Prefix that modifies the following instruction
    Meta,
}

/// Static description of an opcode.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpCodeInfo {
    /// Mnemonic, e.g. `"ldc.i4.s"`
    pub name: &'static str,
    /// Operand layout
    pub operand: OperandKind,
    /// Control flow behaviour
    pub flow: FlowType,
}

impl OpCodeInfo {
    /// Marker for unassigned table slots
    pub const RESERVED: OpCodeInfo = OpCodeInfo {
        name: "",
        operand: OperandKind::None,
        flow: FlowType::Sequential,
    };

    /// Creates a table entry
    #[must_use]
    pub const fn new(name: &'static str, operand: OperandKind, flow: FlowType) -> Self {
        OpCodeInfo {
            name,
            operand,
            flow,
        }
    }

    /// `true` for unassigned table slots
    #[must_use]
    pub const fn is_reserved(&self) -> bool {
        self.name.is_empty()
    }
}

/// A CIL opcode. Single-byte opcodes are stored as-is, two-byte opcodes as `0xFE00 | second`.
///
/// Named constants for every opcode live in [`crate::assembly::opcodes`].
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OpCode(u16);

impl OpCode {
    /// Creates a single-byte opcode
    #[must_use]
    pub const fn single(byte: u8) -> Self {
        OpCode(byte as u16)
    }

    /// Creates a `0xFE`-prefixed opcode from its second byte
    #[must_use]
    pub const fn extended(byte: u8) -> Self {
        OpCode(((opcodes::FE_PREFIX as u16) << 8) | byte as u16)
    }

    /// Raw value, `0xFExx` for extended opcodes
    #[must_use]
    pub const fn value(&self) -> u16 {
        self.0
    }

    /// `true` for `0xFE`-prefixed opcodes
    #[must_use]
    pub const fn is_extended(&self) -> bool {
        self.0 > 0xFF
    }

    /// Encoded size of the opcode in bytes
    #[must_use]
    pub const fn size(&self) -> usize {
        if self.is_extended() {
            2
        } else {
            1
        }
    }

    /// Table entry for this opcode, [`OpCodeInfo::RESERVED`] for unassigned values
    #[must_use]
    pub fn info(&self) -> &'static OpCodeInfo {
        opcode_info(*self)
    }

    /// Mnemonic of the opcode
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.info().name
    }

    /// Operand layout of the opcode
    #[must_use]
    pub fn operand_kind(&self) -> OperandKind {
        self.info().operand
    }

    /// Control flow of the opcode
    #[must_use]
    pub fn flow(&self) -> FlowType {
        self.info().flow
    }

    /// Long-form equivalent of a short branch, the opcode itself otherwise
    #[must_use]
    pub fn long_form(&self) -> OpCode {
        opcodes::SHORT_TO_LONG
            .iter()
            .find(|(short, _)| short == self)
            .map_or(*self, |(_, long)| *long)
    }

    /// Looks up an opcode by mnemonic
    #[must_use]
    pub fn from_name(name: &str) -> Option<OpCode> {
        opcodes::opcode_by_name(name)
    }
}

impl fmt::Debug for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "OpCode(0x{:02x}, {})", self.0, self.name())
    }
}

impl fmt::Display for OpCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Stable identity of an instruction, allocated by [`crate::assembly::CodeGenerator`].
///
/// Identities survive reordering and are used to resolve branches and to reattach labels and
/// exception markers after a transform ran.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstructionId(pub u32);

impl fmt::Display for InstructionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A branch label, allocated by [`crate::assembly::CodeGenerator`] and bound by attaching it to
/// an instruction's label set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Label(pub u32);

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "L_{}", self.0)
    }
}

/// Where a branch goes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BranchTarget {
    /// Directly the instruction with this identity
    Instruction(InstructionId),
    /// Whichever instruction carries this label
    Label(Label),
}

impl BranchTarget {
    /// `true` if this target resolves to `instruction`
    #[must_use]
    pub fn is(&self, instruction: &Instruction) -> bool {
        match self {
            BranchTarget::Instruction(id) => *id == instruction.id,
            BranchTarget::Label(label) => instruction.labels.contains(label),
        }
    }
}

impl fmt::Display for BranchTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BranchTarget::Instruction(id) => write!(f, "{id}"),
            BranchTarget::Label(label) => write!(f, "{label}"),
        }
    }
}

/// A metadata reference carried as an operand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberRef {
    /// Method reference or definition
    Method(Token),
    /// Field reference or definition
    Field(Token),
    /// Type reference, definition or specification
    Type(Token),
    /// Any of the above (`ldtoken`)
    Token(Token),
    /// Stand-alone signature (`calli`)
    Signature(Token),
}

impl MemberRef {
    /// The raw token
    #[must_use]
    pub fn token(&self) -> Token {
        match self {
            MemberRef::Method(token)
            | MemberRef::Field(token)
            | MemberRef::Type(token)
            | MemberRef::Token(token)
            | MemberRef::Signature(token) => *token,
        }
    }
}

/// The operand value of an instruction.
#[derive(Debug, Clone, PartialEq, Default)]
pub enum Operand {
    /// No operand
    #[default]
    None,
    /// 8-bit immediate
    Int8(i8),
    /// 32-bit immediate
    Int32(i32),
    /// 64-bit immediate
    Int64(i64),
    /// 32-bit float immediate
    Float32(f32),
    /// 64-bit float immediate
    Float64(f64),
    /// User string token
    String(Token),
    /// Branch destination
    Target(BranchTarget),
    /// Switch destinations
    Switch(Vec<BranchTarget>),
    /// Field, method, type or signature reference
    Member(MemberRef),
    /// Local variable index
    Local(u16),
    /// Argument index, including `this`
    Argument(u16),
}

impl Operand {
    /// All branch targets carried by this operand
    #[must_use]
    pub fn targets(&self) -> &[BranchTarget] {
        match self {
            Operand::Target(target) => std::slice::from_ref(target),
            Operand::Switch(targets) => targets,
            _ => &[],
        }
    }

    /// Mutable access to all branch targets carried by this operand
    pub fn targets_mut(&mut self) -> &mut [BranchTarget] {
        match self {
            Operand::Target(target) => std::slice::from_mut(target),
            Operand::Switch(targets) => targets,
            _ => &mut [],
        }
    }
}

impl fmt::Display for Operand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operand::None => Ok(()),
            Operand::Int8(value) => write!(f, "{value}"),
            Operand::Int32(value) => write!(f, "{value}"),
            Operand::Int64(value) => write!(f, "{value}"),
            Operand::Float32(value) => write!(f, "{value}"),
            Operand::Float64(value) => write!(f, "{value}"),
            Operand::String(token) => write!(f, "string({token})"),
            Operand::Target(target) => write!(f, "{target}"),
            Operand::Switch(targets) => {
                f.write_str("(")?;
                for (index, target) in targets.iter().enumerate() {
                    if index > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{target}")?;
                }
                f.write_str(")")
            }
            Operand::Member(member) => write!(f, "{}", member.token()),
            Operand::Local(index) => write!(f, "V_{index}"),
            Operand::Argument(index) => write!(f, "A_{index}"),
        }
    }
}

/// Exception region boundary attached to an instruction.
///
/// `Begin*` markers take effect before the instruction they are attached to.
/// [`ExceptionBlock::End`] takes effect after it, so a region whose last handler reaches the
/// end of the code can still be expressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExceptionBlock {
    /// Start of a protected region
    BeginTry,
    /// Start of a typed catch handler, or of the handler following a filter
    BeginCatch(Token),
    /// Start of a filter
    BeginFilter,
    /// Start of a finally handler
    BeginFinally,
    /// Start of a fault handler
    BeginFault,
    /// Closes the innermost open region after this instruction
    End,
}

/// A single decoded or synthesized CIL instruction.
///
/// `offset` is informational: it is the byte offset the instruction was decoded from, or `0`
/// for synthesized instructions. The encoder ignores it and lays out code from the list order.
#[derive(Debug, Clone, PartialEq)]
pub struct Instruction {
    /// Stable identity
    pub id: InstructionId,
    /// Byte offset within the decoded body
    pub offset: u32,
    /// The opcode
    pub opcode: OpCode,
    /// The operand
    pub operand: Operand,
    /// Labels bound to this instruction
    pub labels: Vec<Label>,
    /// Exception region markers, in order
    pub blocks: Vec<ExceptionBlock>,
}

impl Instruction {
    /// Creates an instruction without labels or markers
    #[must_use]
    pub fn new(id: InstructionId, opcode: OpCode, operand: Operand) -> Self {
        Instruction {
            id,
            offset: 0,
            opcode,
            operand,
            labels: Vec::new(),
            blocks: Vec::new(),
        }
    }

    /// Replaces opcode and operand, keeping identity, labels and markers
    pub fn set(&mut self, opcode: OpCode, operand: Operand) {
        self.opcode = opcode;
        self.operand = operand;
    }

    /// Moves labels and markers of `self` onto `other`, ahead of the ones it already has
    pub fn move_attachments_to(&mut self, other: &mut Instruction) {
        let mut labels = std::mem::take(&mut self.labels);
        labels.append(&mut other.labels);
        other.labels = labels;

        let mut blocks = std::mem::take(&mut self.blocks);
        blocks.append(&mut other.blocks);
        other.blocks = blocks;
    }

    /// `true` if control may transfer to a target carried in the operand
    #[must_use]
    pub fn is_branch(&self) -> bool {
        matches!(
            self.opcode.flow(),
            FlowType::ConditionalBranch
                | FlowType::UnconditionalBranch
                | FlowType::Switch
                | FlowType::Leave
        )
    }

    /// `true` if control never falls through to the next instruction
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(
            self.opcode.flow(),
            FlowType::UnconditionalBranch
                | FlowType::Return
                | FlowType::Throw
                | FlowType::EndFinally
                | FlowType::Leave
        )
    }

    /// `true` if this instruction branches to `target`
    #[must_use]
    pub fn branches_to(&self, target: &Instruction) -> bool {
        self.operand.targets().iter().any(|t| t.is(target))
    }

    /// Local variable index accessed by any `ldloc`, `ldloca` or `stloc` form
    #[must_use]
    pub fn local_index(&self) -> Option<u16> {
        let value = self.opcode.value();
        match value {
            0x06..=0x09 => Some(value - 0x06),
            0x0A..=0x0D => Some(value - 0x0A),
            _ => match self.operand {
                Operand::Local(index) => Some(index),
                _ => None,
            },
        }
    }

    /// Argument index accessed by any `ldarg`, `ldarga` or `starg` form
    #[must_use]
    pub fn argument_index(&self) -> Option<u16> {
        let value = self.opcode.value();
        match value {
            0x02..=0x05 => Some(value - 0x02),
            _ => match self.operand {
                Operand::Argument(index) => Some(index),
                _ => None,
            },
        }
    }

    /// Value pushed by any `ldc.i4` or `ldc.i8` form
    #[must_use]
    pub fn constant(&self) -> Option<i64> {
        match (self.opcode, &self.operand) {
            (opcodes::LDC_I4_M1, _) => Some(-1),
            (op, _) if (0x16..=0x1E).contains(&op.value()) => Some(i64::from(op.value()) - 0x16),
            (opcodes::LDC_I4_S, Operand::Int8(value)) => Some(i64::from(*value)),
            (opcodes::LDC_I4 | opcodes::LDC_I4_S, Operand::Int32(value)) => {
                Some(i64::from(*value))
            }
            (opcodes::LDC_I8, Operand::Int64(value)) => Some(*value),
            _ => None,
        }
    }
}

impl fmt::Display for Instruction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for block in &self.blocks {
            writeln!(f, "// {block:?}")?;
        }
        for label in &self.labels {
            write!(f, "{label}: ")?;
        }
        write!(f, "IL_{:04x}: {}", self.offset, self.opcode)?;
        if self.operand != Operand::None {
            write!(f, " {}", self.operand)?;
        }
        Ok(())
    }
}
