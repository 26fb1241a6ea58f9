//! Allocation context shared by everything that creates instructions for one method.

use crate::{
    assembly::{opcodes, Instruction, InstructionId, Label, OpCode, Operand},
    metadata::signatures::SignatureLocalVariable,
};

/// Hands out instruction identities, labels and locals for a single method.
///
/// One generator is threaded through decoding, every transform and the final encoding of a
/// replacement. Identities and labels are unique within a generator; mixing instructions from
/// two generators in one list is a caller error.
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{opcodes, CodeGenerator, Operand};
/// use dotpatch::metadata::signatures::TypeSignature;
///
/// let mut generator = CodeGenerator::new();
/// let local = generator.declare_local(TypeSignature::I4);
/// let store = generator.stloc(local);
/// assert_eq!(store.opcode, opcodes::STLOC_0);
///
/// let label = generator.define_label();
/// let jump = generator.emit(opcodes::BR, Operand::Target(label.into()));
/// assert_ne!(store.id, jump.id);
/// ```
#[derive(Debug, Clone, Default)]
pub struct CodeGenerator {
    next_id: u32,
    next_label: u32,
    locals: Vec<SignatureLocalVariable>,
    reserved_stack: u16,
}

impl CodeGenerator {
    /// Creates a generator without locals
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a generator that starts with the locals of an existing body
    #[must_use]
    pub fn with_locals(locals: Vec<SignatureLocalVariable>) -> Self {
        CodeGenerator {
            locals,
            ..Self::default()
        }
    }

    /// Allocates a fresh instruction identity
    pub fn next_id(&mut self) -> InstructionId {
        let id = InstructionId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Allocates a fresh, unbound label
    pub fn define_label(&mut self) -> Label {
        let label = Label(self.next_label);
        self.next_label += 1;
        label
    }

    /// Appends a local variable and returns its index
    pub fn declare_local(&mut self, local: impl Into<SignatureLocalVariable>) -> u16 {
        self.locals.push(local.into());
        // Local counts are limited to u16 by the CIL encoding
        #[allow(clippy::cast_possible_truncation)]
        let index = (self.locals.len() - 1) as u16;
        index
    }

    /// All locals, the ones of the decoded body first
    #[must_use]
    pub fn locals(&self) -> &[SignatureLocalVariable] {
        &self.locals
    }

    /// Requests additional evaluation stack for code a transform injected
    pub fn reserve_stack(&mut self, depth: u16) {
        self.reserved_stack = self.reserved_stack.max(depth);
    }

    /// Additional stack depth requested through [`CodeGenerator::reserve_stack`]
    #[must_use]
    pub fn reserved_stack(&self) -> u16 {
        self.reserved_stack
    }

    /// Creates an instruction with a fresh identity
    pub fn emit(&mut self, opcode: OpCode, operand: Operand) -> Instruction {
        let id = self.next_id();
        Instruction::new(id, opcode, operand)
    }

    /// `ldarg` in its most compact form
    pub fn ldarg(&mut self, index: u16) -> Instruction {
        match index {
            0 => self.emit(opcodes::LDARG_0, Operand::None),
            1 => self.emit(opcodes::LDARG_1, Operand::None),
            2 => self.emit(opcodes::LDARG_2, Operand::None),
            3 => self.emit(opcodes::LDARG_3, Operand::None),
            4..=255 => self.emit(opcodes::LDARG_S, Operand::Argument(index)),
            _ => self.emit(opcodes::LDARG, Operand::Argument(index)),
        }
    }

    /// `ldarga` in its most compact form
    pub fn ldarga(&mut self, index: u16) -> Instruction {
        let opcode = if index <= 255 {
            opcodes::LDARGA_S
        } else {
            opcodes::LDARGA
        };
        self.emit(opcode, Operand::Argument(index))
    }

    /// `ldloc` in its most compact form
    pub fn ldloc(&mut self, index: u16) -> Instruction {
        match index {
            0 => self.emit(opcodes::LDLOC_0, Operand::None),
            1 => self.emit(opcodes::LDLOC_1, Operand::None),
            2 => self.emit(opcodes::LDLOC_2, Operand::None),
            3 => self.emit(opcodes::LDLOC_3, Operand::None),
            4..=255 => self.emit(opcodes::LDLOC_S, Operand::Local(index)),
            _ => self.emit(opcodes::LDLOC, Operand::Local(index)),
        }
    }

    /// `ldloca` in its most compact form
    pub fn ldloca(&mut self, index: u16) -> Instruction {
        let opcode = if index <= 255 {
            opcodes::LDLOCA_S
        } else {
            opcodes::LDLOCA
        };
        self.emit(opcode, Operand::Local(index))
    }

    /// `stloc` in its most compact form
    pub fn stloc(&mut self, index: u16) -> Instruction {
        match index {
            0 => self.emit(opcodes::STLOC_0, Operand::None),
            1 => self.emit(opcodes::STLOC_1, Operand::None),
            2 => self.emit(opcodes::STLOC_2, Operand::None),
            3 => self.emit(opcodes::STLOC_3, Operand::None),
            4..=255 => self.emit(opcodes::STLOC_S, Operand::Local(index)),
            _ => self.emit(opcodes::STLOC, Operand::Local(index)),
        }
    }

    /// `ldc.i4` in its most compact form
    pub fn ldc_i4(&mut self, value: i32) -> Instruction {
        match value {
            -1 => self.emit(opcodes::LDC_I4_M1, Operand::None),
            0..=8 => {
                // 0..=8 fits the shorthand range
                #[allow(clippy::cast_sign_loss, clippy::cast_possible_truncation)]
                let opcode = OpCode::single(opcodes::LDC_I4_0.value() as u8 + value as u8);
                self.emit(opcode, Operand::None)
            }
            _ => match i8::try_from(value) {
                Ok(short) => self.emit(opcodes::LDC_I4_S, Operand::Int8(short)),
                Err(_) => self.emit(opcodes::LDC_I4, Operand::Int32(value)),
            },
        }
    }
}

impl From<Label> for crate::assembly::BranchTarget {
    fn from(label: Label) -> Self {
        crate::assembly::BranchTarget::Label(label)
    }
}

impl From<InstructionId> for crate::assembly::BranchTarget {
    fn from(id: InstructionId) -> Self {
        crate::assembly::BranchTarget::Instruction(id)
    }
}
