//! Instruction rewriting pipeline.
//!
//! A transform receives the full instruction list of the original and returns the full list to
//! use instead. Transforms compose by running strictly in registration order, each one seeing the
//! output of the previous.
//!
//! Two shapes of transform are supported:
//!
//! - [`NativeTranspiler`] works on [`Instruction`]s, including their labels and exception
//!   markers.
//! - [`SimpleTranspiler`] works on [`SimpleInstruction`]s, which only carry identity, opcode and
//!   operand. Labels and exception markers are kept in a side table keyed by
//!   [`InstructionId`] and reattached to the output instruction with the same id, so a transform
//!   that reorders code does not lose branch targets or exception regions it never looked at.
//!
//! Between stages the list is normalized with [`normalize`]. Short branches are widened and
//! immediate forms that cannot hold their operand are replaced by their wider form.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotpatch::assembly::{opcodes, CodeGenerator, Operand};
//! use dotpatch::patch::{SimpleInstruction, TransformChain, Transpiler};
//! # use dotpatch::metadata::{
//! #     method::{MethodDescriptor, MethodKey},
//! #     signatures::TypeSignature,
//! #     token::Token,
//! # };
//! # let original = MethodDescriptor {
//! #     key: MethodKey::new(uguid::Guid::ZERO, Token::new(0x0600_0001)),
//! #     name: "Answer".into(),
//! #     has_this: false,
//! #     params: Vec::new(),
//! #     return_type: TypeSignature::I4,
//! #     locals: Vec::new(),
//! # };
//!
//! // Every `ldc.i4.1` becomes `ldc.i4.s 42`
//! let answer = Transpiler::simple(|list, _, _| {
//!     Ok(list
//!         .into_iter()
//!         .map(|mut i: SimpleInstruction| {
//!             if i.opcode == opcodes::LDC_I4_1 {
//!                 i.opcode = opcodes::LDC_I4_S;
//!                 i.operand = Operand::Int8(42);
//!             }
//!             i
//!         })
//!         .collect())
//! });
//!
//! let mut generator = CodeGenerator::new();
//! let input = vec![
//!     generator.emit(opcodes::LDC_I4_1, Operand::None),
//!     generator.emit(opcodes::RET, Operand::None),
//! ];
//! let output = TransformChain::from(vec![answer]).apply(input, &mut generator, &original)?;
//! assert_eq!(output[0].operand, Operand::Int8(42));
//! # Ok::<(), dotpatch::Error>(())
//! ```

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::Arc,
};

use tracing::{trace, warn};

use crate::{
    assembly::{
        fit_opcode, CodeGenerator, ExceptionBlock, Instruction, InstructionId, Label, OpCode,
        Operand, OperandKind,
    },
    metadata::method::MethodDescriptor,
    Result,
};

/// A transform over native instructions.
pub trait NativeTranspiler: Send + Sync {
    /// Returns the complete replacement of `instructions`.
    ///
    /// # Errors
    /// Any error aborts the patch the transform is part of.
    fn transform(
        &self,
        instructions: Vec<Instruction>,
        generator: &mut CodeGenerator,
        original: &MethodDescriptor,
    ) -> Result<Vec<Instruction>>;
}

impl<F> NativeTranspiler for F
where
    F: Fn(Vec<Instruction>, &mut CodeGenerator, &MethodDescriptor) -> Result<Vec<Instruction>>
        + Send
        + Sync,
{
    fn transform(
        &self,
        instructions: Vec<Instruction>,
        generator: &mut CodeGenerator,
        original: &MethodDescriptor,
    ) -> Result<Vec<Instruction>> {
        self(instructions, generator, original)
    }
}

/// A transform over [`SimpleInstruction`]s.
pub trait SimpleTranspiler: Send + Sync {
    /// Returns the complete replacement of `instructions`.
    ///
    /// # Errors
    /// Any error aborts the patch the transform is part of.
    fn transform(
        &self,
        instructions: Vec<SimpleInstruction>,
        generator: &mut CodeGenerator,
        original: &MethodDescriptor,
    ) -> Result<Vec<SimpleInstruction>>;
}

impl<F> SimpleTranspiler for F
where
    F: Fn(
            Vec<SimpleInstruction>,
            &mut CodeGenerator,
            &MethodDescriptor,
        ) -> Result<Vec<SimpleInstruction>>
        + Send
        + Sync,
{
    fn transform(
        &self,
        instructions: Vec<SimpleInstruction>,
        generator: &mut CodeGenerator,
        original: &MethodDescriptor,
    ) -> Result<Vec<SimpleInstruction>> {
        self(instructions, generator, original)
    }
}

/// The reduced instruction view handed to a [`SimpleTranspiler`].
#[derive(Debug, Clone, PartialEq)]
pub struct SimpleInstruction {
    /// Identity of the instruction this one was derived from; `None` for new code
    pub id: Option<InstructionId>,
    /// The opcode
    pub opcode: OpCode,
    /// The operand
    pub operand: Operand,
}

impl SimpleInstruction {
    /// A new instruction without identity
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        SimpleInstruction {
            id: None,
            opcode,
            operand,
        }
    }
}

impl From<&Instruction> for SimpleInstruction {
    fn from(instruction: &Instruction) -> Self {
        SimpleInstruction {
            id: Some(instruction.id),
            opcode: instruction.opcode,
            operand: instruction.operand.clone(),
        }
    }
}

/// A registered instruction transform.
#[derive(Clone)]
pub enum Transpiler {
    /// Works on full instructions
    Native(Arc<dyn NativeTranspiler>),
    /// Works on [`SimpleInstruction`]s
    Simple(Arc<dyn SimpleTranspiler>),
}

impl Transpiler {
    /// Wraps a native transform
    pub fn native(
        transform: impl Fn(
                Vec<Instruction>,
                &mut CodeGenerator,
                &MethodDescriptor,
            ) -> Result<Vec<Instruction>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Transpiler::Native(Arc::new(transform))
    }

    /// Wraps a simple transform
    pub fn simple(
        transform: impl Fn(
                Vec<SimpleInstruction>,
                &mut CodeGenerator,
                &MethodDescriptor,
            ) -> Result<Vec<SimpleInstruction>>
            + Send
            + Sync
            + 'static,
    ) -> Self {
        Transpiler::Simple(Arc::new(transform))
    }

    fn run(
        &self,
        instructions: Vec<Instruction>,
        generator: &mut CodeGenerator,
        original: &MethodDescriptor,
    ) -> Result<Vec<Instruction>> {
        match self {
            Transpiler::Native(transform) => transform.transform(instructions, generator, original),
            Transpiler::Simple(transform) => {
                let (simple, mut stash) = project(instructions);
                let output = transform.transform(simple, generator, original)?;
                Ok(reattach(output, &mut stash, generator))
            }
        }
    }
}

impl fmt::Debug for Transpiler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transpiler::Native(_) => f.write_str("Transpiler::Native"),
            Transpiler::Simple(_) => f.write_str("Transpiler::Simple"),
        }
    }
}

/// What a [`SimpleInstruction`] cannot carry.
struct Attachments {
    offset: u32,
    labels: Vec<Label>,
    blocks: Vec<ExceptionBlock>,
}

fn project(
    instructions: Vec<Instruction>,
) -> (Vec<SimpleInstruction>, HashMap<InstructionId, Attachments>) {
    let mut stash = HashMap::with_capacity(instructions.len());
    let simple = instructions
        .into_iter()
        .map(|instruction| {
            stash.insert(
                instruction.id,
                Attachments {
                    offset: instruction.offset,
                    labels: instruction.labels,
                    blocks: instruction.blocks,
                },
            );
            SimpleInstruction {
                id: Some(instruction.id),
                opcode: instruction.opcode,
                operand: instruction.operand,
            }
        })
        .collect();
    (simple, stash)
}

fn reattach(
    output: Vec<SimpleInstruction>,
    stash: &mut HashMap<InstructionId, Attachments>,
    generator: &mut CodeGenerator,
) -> Vec<Instruction> {
    let mut used = HashSet::with_capacity(output.len());
    let result = output
        .into_iter()
        .map(|simple| {
            // A duplicated identity keeps the attachments on its first occurrence only
            let id = match simple.id {
                Some(id) if used.insert(id) => id,
                _ => generator.next_id(),
            };

            let mut instruction = Instruction::new(id, simple.opcode, simple.operand);
            if let Some(attachments) = stash.remove(&id) {
                instruction.offset = attachments.offset;
                instruction.labels = attachments.labels;
                instruction.blocks = attachments.blocks;
            }
            instruction
        })
        .collect();

    for (id, attachments) in stash.drain() {
        if !attachments.labels.is_empty() || !attachments.blocks.is_empty() {
            warn!(
                %id,
                labels = attachments.labels.len(),
                blocks = attachments.blocks.len(),
                "Transform dropped an instruction carrying labels or exception markers"
            );
        }
    }

    result
}

/// Fits every opcode to its operand.
///
/// Short branches become long branches, and short immediate, local and argument forms become
/// their wide forms where the operand does not fit.
pub fn normalize(instructions: &mut [Instruction]) {
    for instruction in instructions {
        let opcode = fit_opcode(instruction.opcode, &instruction.operand);
        if opcode != instruction.opcode {
            trace!(
                id = %instruction.id,
                from = %instruction.opcode,
                to = %opcode,
                "Widened opcode"
            );
            instruction.opcode = opcode;
        }

        if let (OperandKind::Int32, Operand::Int8(value)) =
            (opcode.operand_kind(), &instruction.operand)
        {
            instruction.operand = Operand::Int32(i32::from(*value));
        }
    }
}

/// An ordered list of transforms applied to one method.
#[derive(Debug, Clone, Default)]
pub struct TransformChain {
    transpilers: Vec<Transpiler>,
}

impl TransformChain {
    /// Creates an empty chain
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a transform
    pub fn push(&mut self, transpiler: Transpiler) {
        self.transpilers.push(transpiler);
    }

    /// Number of transforms
    #[must_use]
    pub fn len(&self) -> usize {
        self.transpilers.len()
    }

    /// `true` if the chain has no transforms
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.transpilers.is_empty()
    }

    /// Runs every transform in order over `instructions`.
    ///
    /// The list is normalized before the first transform and after each one. An empty chain
    /// still normalizes.
    ///
    /// # Errors
    /// Propagates the first error returned by a transform.
    pub fn apply(
        &self,
        mut instructions: Vec<Instruction>,
        generator: &mut CodeGenerator,
        original: &MethodDescriptor,
    ) -> Result<Vec<Instruction>> {
        normalize(&mut instructions);
        for (stage, transpiler) in self.transpilers.iter().enumerate() {
            let before = instructions.len();
            instructions = transpiler.run(instructions, generator, original)?;
            normalize(&mut instructions);
            trace!(
                method = %original.key,
                stage,
                before,
                after = instructions.len(),
                "Applied transform"
            );
        }
        Ok(instructions)
    }
}

impl From<Vec<Transpiler>> for TransformChain {
    fn from(transpilers: Vec<Transpiler>) -> Self {
        TransformChain { transpilers }
    }
}

impl FromIterator<Transpiler> for TransformChain {
    fn from_iter<I: IntoIterator<Item = Transpiler>>(iter: I) -> Self {
        TransformChain {
            transpilers: iter.into_iter().collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{encode, opcodes, BranchTarget},
        metadata::{method::MethodKey, signatures::TypeSignature, token::Token},
        Error,
    };
    use uguid::Guid;

    fn original() -> MethodDescriptor {
        MethodDescriptor {
            key: MethodKey::new(Guid::ZERO, Token::new(0x0600_0001)),
            name: "Target".to_string(),
            has_this: false,
            params: Vec::new(),
            return_type: TypeSignature::I4,
            locals: Vec::new(),
        }
    }

    fn body(generator: &mut CodeGenerator) -> Vec<Instruction> {
        let ret = generator.emit(opcodes::RET, Operand::None);
        let mut one = generator.emit(opcodes::LDC_I4_1, Operand::None);
        one.labels.push(Label(90));
        one.blocks.push(ExceptionBlock::BeginTry);
        vec![
            generator.emit(
                opcodes::BR_S,
                Operand::Target(BranchTarget::Instruction(one.id)),
            ),
            one,
            ret,
        ]
    }

    #[test]
    fn normalize_widens() {
        let mut generator = CodeGenerator::new();
        let mut instructions = vec![
            generator.emit(opcodes::LDC_I4_S, Operand::Int32(1000)),
            generator.emit(opcodes::LDC_I4, Operand::Int8(3)),
            generator.emit(opcodes::LDLOC_S, Operand::Local(400)),
        ];
        normalize(&mut instructions);
        assert_eq!(instructions[0].opcode, opcodes::LDC_I4);
        assert_eq!(instructions[1].operand, Operand::Int32(3));
        assert_eq!(instructions[2].opcode, opcodes::LDLOC);
    }

    #[test]
    fn empty_chain_normalizes() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let input = body(&mut generator);
        let output = TransformChain::new().apply(input, &mut generator, &original())?;
        assert_eq!(output[0].opcode, opcodes::BR);
        Ok(())
    }

    #[test]
    fn native_runs_in_order() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let input = body(&mut generator);

        let append_nop = |mut list: Vec<Instruction>,
                          generator: &mut CodeGenerator,
                          _: &MethodDescriptor| {
            let nop = generator.emit(opcodes::NOP, Operand::None);
            list.insert(0, nop);
            Ok(list)
        };
        let replace_first = |mut list: Vec<Instruction>,
                             _: &mut CodeGenerator,
                             _: &MethodDescriptor| {
            list[0].set(opcodes::LDNULL, Operand::None);
            list.insert(1, Instruction::new(InstructionId(999), opcodes::POP, Operand::None));
            Ok(list)
        };

        let chain: TransformChain = [
            Transpiler::native(append_nop),
            Transpiler::native(replace_first),
        ]
        .into_iter()
        .collect();
        let output = chain.apply(input, &mut generator, &original())?;

        let opcodes: Vec<_> = output.iter().map(|i| i.opcode).collect();
        assert_eq!(
            opcodes,
            vec![opcodes::LDNULL, opcodes::POP, opcodes::BR, opcodes::LDC_I4_1, opcodes::RET]
        );
        Ok(())
    }

    #[test]
    fn simple_keeps_attachments_across_reorder() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let input = body(&mut generator);
        let one_id = input[1].id;

        let reverse = Transpiler::simple(
            |mut list: Vec<SimpleInstruction>, _: &mut CodeGenerator, _: &MethodDescriptor| {
                list.swap(0, 1);
                list.insert(0, SimpleInstruction::new(opcodes::NOP, Operand::None));
                Ok(list)
            },
        );
        let output =
            TransformChain::from(vec![reverse]).apply(input, &mut generator, &original())?;

        assert_eq!(output.len(), 4);
        assert_eq!(output[0].opcode, opcodes::NOP);
        assert!(output[0].labels.is_empty());
        assert_eq!(output[1].id, one_id);
        assert_eq!(output[1].labels, vec![Label(90)]);
        assert_eq!(output[1].blocks, vec![ExceptionBlock::BeginTry]);
        Ok(())
    }

    #[test]
    fn simple_duplicate_ids_get_fresh_identity() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let input = body(&mut generator);

        let duplicate = Transpiler::simple(
            |mut list: Vec<SimpleInstruction>, _: &mut CodeGenerator, _: &MethodDescriptor| {
                let copy = list[1].clone();
                list.insert(2, copy);
                Ok(list)
            },
        );
        let output =
            TransformChain::from(vec![duplicate]).apply(input, &mut generator, &original())?;

        assert_ne!(output[1].id, output[2].id);
        assert_eq!(output[1].labels, vec![Label(90)]);
        assert!(output[2].labels.is_empty());
        Ok(())
    }

    #[test]
    fn dropped_target_fails_at_encode() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let input = body(&mut generator);

        let drop_target = Transpiler::simple(
            |mut list: Vec<SimpleInstruction>, _: &mut CodeGenerator, _: &MethodDescriptor| {
                list.remove(1);
                Ok(list)
            },
        );
        let output =
            TransformChain::from(vec![drop_target]).apply(input, &mut generator, &original())?;

        assert!(matches!(
            encode(&output, &mut generator),
            Err(Error::UnresolvedOperand(_))
        ));
        Ok(())
    }

    #[test]
    fn transform_error_propagates() {
        let mut generator = CodeGenerator::new();
        let input = body(&mut generator);

        let failing = Transpiler::native(
            |_: Vec<Instruction>, _: &mut CodeGenerator, _: &MethodDescriptor| {
                Err(Error::SignatureMismatch("refused".to_string()))
            },
        );
        let result = TransformChain::from(vec![failing]).apply(input, &mut generator, &original());
        assert!(matches!(result, Err(Error::SignatureMismatch(_))));
    }
}
