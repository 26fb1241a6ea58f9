//! CIL instruction encoding.
//!
//! The reverse of [`crate::assembly::decode_body`]: lays out a list of [`Instruction`]s as code
//! bytes, resolves branch targets to relative offsets and rebuilds the exception table from the
//! [`ExceptionBlock`] markers.
//!
//! # Architecture
//!
//! [`encode`] runs in two passes. The first pass gives every instruction that is the direct
//! target of a branch a fresh label, so the second pass only ever deals with labels. The second
//! pass feeds the instructions through an [`InstructionEncoder`], which binds labels to byte
//! positions as it goes and records fixups for branch operands; [`InstructionEncoder::finalize`]
//! patches every fixup once all positions are known.
//!
//! Short branch forms are always rewritten to their long form before emission. Instruction
//! lists coming out of transforms can grow arbitrarily, so an 8-bit displacement that was valid
//! in the original body may no longer fit. Short argument, local and `ldc.i4.s` forms are
//! widened in the same way when their operand outgrows them.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotpatch::assembly::{encode, opcodes, CodeGenerator, Operand};
//!
//! let mut generator = CodeGenerator::new();
//! let end = generator.define_label();
//!
//! let branch = generator.emit(opcodes::BR_S, Operand::Target(end.into()));
//! let nop = generator.emit(opcodes::NOP, Operand::None);
//! let mut ret = generator.emit(opcodes::RET, Operand::None);
//! ret.labels.push(end);
//!
//! let encoded = encode(&[branch, nop, ret], &mut generator)?;
//! assert_eq!(encoded.code, vec![0x38, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2A]);
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::collections::{HashMap, HashSet};

use crate::{
    assembly::{
        opcodes, BranchTarget, CodeGenerator, ExceptionBlock, Instruction, InstructionId, Label,
        OpCode, Operand, OperandKind,
    },
    metadata::{
        method::{write_body, ExceptionHandler, ExceptionHandlerFlags},
        token::Token,
    },
    Error, Result,
};

/// Code and exception table produced by [`encode`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedCode {
    /// Encoded instruction stream
    pub code: Vec<u8>,
    /// Exception clauses, innermost first
    pub exception_handlers: Vec<ExceptionHandler>,
}

/// Label fixup information for branch instruction resolution.
#[derive(Debug, Clone)]
struct LabelFixup {
    /// The target label
    label: Label,
    /// Position in bytecode where the 4-byte offset is written
    fixup_position: usize,
}

/// Switch fixup information for multi-way branch resolution.
#[derive(Debug, Clone)]
struct SwitchFixup {
    /// One label per case
    labels: Vec<Label>,
    /// Position of the first case offset, right after the count
    fixup_position: usize,
    /// Position after the switch instruction, which offsets are relative to
    instruction_end_position: usize,
}

/// A protected region whose `End` marker has not been seen yet.
#[derive(Debug)]
struct OpenRegion {
    try_start: u32,
    try_end: Option<u32>,
    current: Option<OpenHandler>,
    handler_count: usize,
}

/// The handler currently being emitted for an [`OpenRegion`].
#[derive(Debug)]
struct OpenHandler {
    flags: ExceptionHandlerFlags,
    class_token: Token,
    filter_offset: u32,
    /// `None` while still inside the filter expression
    start: Option<u32>,
}

/// Core CIL instruction encoder.
///
/// Emits instructions in order, tracks label positions, open exception regions and pending
/// branch fixups. Branch operands must reference labels; [`encode`] takes care of converting
/// direct instruction references beforehand.
///
/// # Examples
///
/// ```rust
/// use dotpatch::assembly::{opcodes, BranchTarget, InstructionEncoder, Label, Operand};
///
/// let mut encoder = InstructionEncoder::new();
/// encoder.emit_instruction(opcodes::BRTRUE, &Operand::Target(BranchTarget::Label(Label(0))))?;
/// encoder.emit_instruction(opcodes::NOP, &Operand::None)?;
/// encoder.define_label(Label(0))?;
/// encoder.emit_instruction(opcodes::RET, &Operand::None)?;
///
/// let (code, handlers) = encoder.finalize()?;
/// assert_eq!(code, vec![0x3A, 0x01, 0x00, 0x00, 0x00, 0x00, 0x2A]);
/// assert!(handlers.is_empty());
/// # Ok::<(), dotpatch::Error>(())
/// ```
#[derive(Debug, Default)]
pub struct InstructionEncoder {
    /// Generated bytecode buffer
    bytecode: Vec<u8>,
    /// Defined label positions
    labels: HashMap<Label, u32>,
    /// Pending branch fixups awaiting label resolution
    fixups: Vec<LabelFixup>,
    /// Pending switch fixups awaiting label resolution
    switch_fixups: Vec<SwitchFixup>,
    /// Exception regions that are still open, innermost last
    regions: Vec<OpenRegion>,
    /// Completed exception clauses
    handlers: Vec<ExceptionHandler>,
}

impl InstructionEncoder {
    /// Create a new, empty encoder
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Current bytecode position, i.e. the offset of the next instruction
    #[must_use]
    pub fn current_position(&self) -> u32 {
        // Bodies are limited to 32-bit code sizes by the header format
        #[allow(clippy::cast_possible_truncation)]
        let position = self.bytecode.len() as u32;
        position
    }

    /// Binds `label` to the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedBody`] if the label is already bound.
    pub fn define_label(&mut self, label: Label) -> Result<()> {
        let position = self.current_position();
        if self.labels.insert(label, position).is_some() {
            return Err(malformed_error!("Label {} is bound twice", label));
        }
        Ok(())
    }

    /// Emits one instruction.
    ///
    /// Short branches are emitted in their long form and short index or constant forms are
    /// widened if the operand does not fit; see [`fit_opcode`].
    ///
    /// # Errors
    /// Returns [`crate::Error::UnresolvedOperand`] if the operand is missing, does not fit the
    /// opcode, or is a branch to an instruction id instead of a label.
    pub fn emit_instruction(&mut self, opcode: OpCode, operand: &Operand) -> Result<()> {
        let opcode = fit_opcode(opcode, operand);
        let [prefix, byte] = opcode.value().to_be_bytes();
        if opcode.is_extended() {
            self.bytecode.push(prefix);
        }
        self.bytecode.push(byte);
        self.emit_operand(opcode, operand)
    }

    /// Opens an exception block at the current position.
    ///
    /// A [`ExceptionBlock::BeginCatch`] that follows a [`ExceptionBlock::BeginFilter`] marks the
    /// start of the filter's handler instead of a new catch clause.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedBody`] for handler markers outside of any try block.
    /// [`ExceptionBlock::End`] is rejected here, use [`InstructionEncoder::end_block`].
    pub fn begin_block(&mut self, block: ExceptionBlock) -> Result<()> {
        let position = self.current_position();
        if block == ExceptionBlock::End {
            return Err(malformed_error!("End markers close blocks after an instruction"));
        }
        if block == ExceptionBlock::BeginTry {
            self.regions.push(OpenRegion {
                try_start: position,
                try_end: None,
                current: None,
                handler_count: 0,
            });
            return Ok(());
        }

        let Some(region) = self.regions.last_mut() else {
            return Err(malformed_error!(
                "{:?} at 0x{:x} outside of a try block",
                block,
                position
            ));
        };

        if let (ExceptionBlock::BeginCatch(_), Some(handler)) = (block, region.current.as_mut()) {
            if handler.start.is_none() {
                handler.start = Some(position);
                return Ok(());
            }
        }

        close_handler(region, position, &mut self.handlers)?;
        region.try_end.get_or_insert(position);
        region.handler_count += 1;

        let (flags, class_token, filter_offset, start) = match block {
            ExceptionBlock::BeginCatch(token) => {
                (ExceptionHandlerFlags::EXCEPTION, token, 0, Some(position))
            }
            ExceptionBlock::BeginFilter => (
                ExceptionHandlerFlags::FILTER,
                Token::default(),
                position,
                None,
            ),
            ExceptionBlock::BeginFinally => (
                ExceptionHandlerFlags::FINALLY,
                Token::default(),
                0,
                Some(position),
            ),
            ExceptionBlock::BeginFault => (
                ExceptionHandlerFlags::FAULT,
                Token::default(),
                0,
                Some(position),
            ),
            ExceptionBlock::BeginTry | ExceptionBlock::End => {
                return Err(malformed_error!("{:?} is not a handler marker", block))
            }
        };
        region.current = Some(OpenHandler {
            flags,
            class_token,
            filter_offset,
            start,
        });
        Ok(())
    }

    /// Closes the innermost open exception region at the current position.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedBody`] if no region is open, the region has no handler,
    /// or a filter was never followed by its handler.
    pub fn end_block(&mut self) -> Result<()> {
        let position = self.current_position();
        let Some(mut region) = self.regions.pop() else {
            return Err(malformed_error!(
                "End of exception block at 0x{:x} without an open block",
                position
            ));
        };
        if region.handler_count == 0 {
            return Err(malformed_error!(
                "Try block at 0x{:x} has no handler",
                region.try_start
            ));
        }
        close_handler(&mut region, position, &mut self.handlers)
    }

    /// Resolves all fixups and returns the code together with the exception clauses.
    ///
    /// # Errors
    /// Returns [`crate::Error::UndefinedLabel`] for branches to labels that were never bound and
    /// [`crate::Error::MalformedBody`] if an exception block is still open.
    pub fn finalize(mut self) -> Result<(Vec<u8>, Vec<ExceptionHandler>)> {
        if let Some(region) = self.regions.last() {
            return Err(malformed_error!(
                "Exception block opened at 0x{:x} is never closed",
                region.try_start
            ));
        }

        let fixups = std::mem::take(&mut self.fixups);
        for fixup in &fixups {
            // Offsets are relative to the end of the branch instruction
            let next_instruction = fixup.fixup_position + 4;
            let offset = self.relative_offset(fixup.label, next_instruction)?;
            self.bytecode[fixup.fixup_position..next_instruction]
                .copy_from_slice(&offset.to_le_bytes());
        }

        let switch_fixups = std::mem::take(&mut self.switch_fixups);
        for fixup in &switch_fixups {
            for (index, label) in fixup.labels.iter().enumerate() {
                let offset = self.relative_offset(*label, fixup.instruction_end_position)?;
                let position = fixup.fixup_position + index * 4;
                self.bytecode[position..position + 4].copy_from_slice(&offset.to_le_bytes());
            }
        }

        Ok((self.bytecode, self.handlers))
    }

    fn relative_offset(&self, label: Label, from: usize) -> Result<i32> {
        let target = self
            .labels
            .get(&label)
            .ok_or(Error::UndefinedLabel(label))?;

        let target = i64::from(*target);
        let Ok(from) = i64::try_from(from) else {
            return Err(malformed_error!("Instruction position exceeds i64 range"));
        };
        i32::try_from(target - from)
            .map_err(|_| malformed_error!("Branch offset to {} exceeds i32 range", label))
    }

    fn branch_label(opcode: OpCode, target: &BranchTarget) -> Result<Label> {
        match target {
            BranchTarget::Label(label) => Ok(*label),
            BranchTarget::Instruction(id) => Err(Error::UnresolvedOperand(format!(
                "{opcode} targets instruction {id} directly, which needs a label"
            ))),
        }
    }

    fn emit_operand(&mut self, opcode: OpCode, operand: &Operand) -> Result<()> {
        let kind = opcode.operand_kind();
        match (kind, operand) {
            (OperandKind::None, Operand::None) => {}
            (OperandKind::Int8, Operand::Int8(value)) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandKind::Int8, Operand::Int32(value)) => match i8::try_from(*value) {
                Ok(value) => self.bytecode.extend_from_slice(&value.to_le_bytes()),
                Err(_) => return Err(mismatch(opcode, operand)),
            },
            (OperandKind::Int32, Operand::Int32(value)) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandKind::Int32, Operand::Int8(value)) => {
                self.bytecode
                    .extend_from_slice(&i32::from(*value).to_le_bytes());
            }
            (OperandKind::Int64, Operand::Int64(value)) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandKind::Int64, Operand::Int32(value)) => {
                self.bytecode
                    .extend_from_slice(&i64::from(*value).to_le_bytes());
            }
            (OperandKind::Float32, Operand::Float32(value)) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandKind::Float64, Operand::Float64(value)) => {
                self.bytecode.extend_from_slice(&value.to_le_bytes());
            }
            (OperandKind::Float64, Operand::Float32(value)) => {
                self.bytecode
                    .extend_from_slice(&f64::from(*value).to_le_bytes());
            }
            (OperandKind::Branch, Operand::Target(target)) => {
                let label = Self::branch_label(opcode, target)?;
                self.fixups.push(LabelFixup {
                    label,
                    fixup_position: self.bytecode.len(),
                });
                self.bytecode.extend_from_slice(&[0; 4]);
            }
            (OperandKind::Switch, Operand::Switch(targets)) => {
                let Ok(count) = u32::try_from(targets.len()) else {
                    return Err(mismatch(opcode, operand));
                };
                let labels = targets
                    .iter()
                    .map(|target| Self::branch_label(opcode, target))
                    .collect::<Result<Vec<_>>>()?;

                self.bytecode.extend_from_slice(&count.to_le_bytes());
                let fixup_position = self.bytecode.len();
                self.bytecode.resize(fixup_position + labels.len() * 4, 0);
                self.switch_fixups.push(SwitchFixup {
                    labels,
                    fixup_position,
                    instruction_end_position: self.bytecode.len(),
                });
            }
            (OperandKind::ShortLocal, Operand::Local(index))
            | (OperandKind::ShortArgument, Operand::Argument(index)) => {
                let Ok(index) = u8::try_from(*index) else {
                    return Err(mismatch(opcode, operand));
                };
                self.bytecode.push(index);
            }
            (OperandKind::Local, Operand::Local(index))
            | (OperandKind::Argument, Operand::Argument(index)) => {
                self.bytecode.extend_from_slice(&index.to_le_bytes());
            }
            (kind, Operand::Member(member)) if kind.is_token() => {
                self.bytecode
                    .extend_from_slice(&member.token().value().to_le_bytes());
            }
            (OperandKind::String, Operand::String(token)) => {
                self.bytecode
                    .extend_from_slice(&token.value().to_le_bytes());
            }
            (_, Operand::None) => {
                return Err(Error::UnresolvedOperand(format!(
                    "{opcode} requires a {kind} operand"
                )))
            }
            _ => return Err(mismatch(opcode, operand)),
        }
        Ok(())
    }
}

fn mismatch(opcode: OpCode, operand: &Operand) -> Error {
    Error::UnresolvedOperand(format!(
        "{} cannot encode operand {:?}, expected {}",
        opcode,
        operand,
        opcode.operand_kind()
    ))
}

fn close_handler(
    region: &mut OpenRegion,
    position: u32,
    handlers: &mut Vec<ExceptionHandler>,
) -> Result<()> {
    let Some(handler) = region.current.take() else {
        return Ok(());
    };
    let Some(start) = handler.start else {
        return Err(malformed_error!(
            "Filter at 0x{:x} is never followed by its handler",
            handler.filter_offset
        ));
    };
    let try_end = region.try_end.unwrap_or(start);

    handlers.push(ExceptionHandler {
        flags: handler.flags,
        try_offset: region.try_start,
        try_length: try_end - region.try_start,
        handler_offset: start,
        handler_length: position - start,
        class_token: handler.class_token,
        filter_offset: handler.filter_offset,
    });
    Ok(())
}

/// Picks the opcode that can actually encode `operand`.
///
/// Short branches always become their long form. `ldc.i4.s` becomes `ldc.i4` for values outside
/// of `i8`, and short argument or local forms become their 16-bit form for indices above 255.
#[must_use]
pub fn fit_opcode(opcode: OpCode, operand: &Operand) -> OpCode {
    let long = opcode.long_form();
    if long != opcode {
        return long;
    }

    match operand {
        Operand::Int32(value) if opcode == opcodes::LDC_I4_S && i8::try_from(*value).is_err() => {
            opcodes::LDC_I4
        }
        Operand::Local(index) | Operand::Argument(index) if *index > 255 => {
            opcodes::SHORT_INDEX_TO_LONG
                .iter()
                .find(|(short, _)| *short == opcode)
                .map_or(opcode, |(_, long)| *long)
        }
        _ => opcode,
    }
}

/// Encodes an instruction list into code bytes and an exception table.
///
/// `generator` supplies the labels for direct instruction targets; it must be the generator the
/// instructions were created with, so the fresh labels cannot collide with labels in use.
///
/// # Errors
///
/// - [`crate::Error::UnresolvedOperand`] if an operand is missing or has the wrong shape, or a
///   branch targets an instruction id that is not part of `instructions`
/// - [`crate::Error::UndefinedLabel`] if a branch names a label no instruction carries
/// - [`crate::Error::MalformedBody`] if the exception markers do not nest properly
pub fn encode(instructions: &[Instruction], generator: &mut CodeGenerator) -> Result<EncodedCode> {
    // Pass 1: every directly targeted instruction receives a label
    let present: HashSet<InstructionId> = instructions.iter().map(|i| i.id).collect();
    let mut direct: HashMap<InstructionId, Label> = HashMap::new();
    for instruction in instructions {
        for target in instruction.operand.targets() {
            if let BranchTarget::Instruction(id) = target {
                if !present.contains(id) {
                    return Err(Error::UnresolvedOperand(format!(
                        "{} at {} targets {}, which is not part of the instruction list",
                        instruction.opcode, instruction.id, id
                    )));
                }
                direct.entry(*id).or_insert_with(|| generator.define_label());
            }
        }
    }

    let as_label = |target: &BranchTarget| -> BranchTarget {
        match target {
            BranchTarget::Instruction(id) => direct
                .get(id)
                .map_or(*target, |label| BranchTarget::Label(*label)),
            BranchTarget::Label(_) => *target,
        }
    };

    // Pass 2: emit
    let mut encoder = InstructionEncoder::new();
    for instruction in instructions {
        for block in &instruction.blocks {
            if *block != ExceptionBlock::End {
                encoder.begin_block(*block)?;
            }
        }
        for label in &instruction.labels {
            encoder.define_label(*label)?;
        }
        if let Some(label) = direct.get(&instruction.id) {
            encoder.define_label(*label)?;
        }

        match &instruction.operand {
            Operand::Target(target) => {
                encoder.emit_instruction(instruction.opcode, &Operand::Target(as_label(target)))?;
            }
            Operand::Switch(targets) => {
                let targets = targets.iter().map(as_label).collect();
                encoder.emit_instruction(instruction.opcode, &Operand::Switch(targets))?;
            }
            operand => encoder.emit_instruction(instruction.opcode, operand)?,
        }

        for block in &instruction.blocks {
            if *block == ExceptionBlock::End {
                encoder.end_block()?;
            }
        }
    }

    let (code, exception_handlers) = encoder.finalize()?;
    Ok(EncodedCode {
        code,
        exception_handlers,
    })
}

/// Encodes an instruction list into a complete method body with header and exception section.
///
/// # Errors
///
/// Everything [`encode`] returns, plus [`crate::Error::MalformedBody`] if the result does not
/// fit the header encodings.
pub fn encode_body(
    instructions: &[Instruction],
    generator: &mut CodeGenerator,
    max_stack: u16,
    local_var_sig_token: u32,
    init_locals: bool,
) -> Result<Vec<u8>> {
    let encoded = encode(instructions, generator)?;
    write_body(
        &encoded.code,
        max_stack,
        local_var_sig_token,
        init_locals,
        &encoded.exception_handlers,
    )
}
