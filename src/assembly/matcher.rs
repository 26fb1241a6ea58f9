//! Pattern search over instruction lists.
//!
//! Transforms rarely want to rewrite a whole body; they look for a short instruction sequence
//! and edit around it. [`CodeMatch`] describes a single instruction by any combination of opcode,
//! operand, labels, exception markers, branch relations and a free predicate. [`match_sequence`]
//! checks a list of them against consecutive instructions, and [`CodeMatcher`] wraps an
//! instruction list with a cursor for search-and-edit workflows.
//!
//! Searches never fail with an error. Running off either end of the list yields
//! [`Position::OutOfBounds`], and every editing operation on that position does nothing, so a
//! failed search can be chained straight into an edit.
//!
//! # Usage Examples
//!
//! ```rust
//! use dotpatch::assembly::{opcodes, CodeGenerator, CodeMatch, CodeMatcher, Operand};
//!
//! let mut generator = CodeGenerator::new();
//! let instructions = vec![
//!     generator.ldarg(0),
//!     generator.ldc_i4(1000),
//!     generator.emit(opcodes::MUL, Operand::None),
//!     generator.emit(opcodes::RET, Operand::None),
//! ];
//!
//! let mut matcher = CodeMatcher::new(instructions);
//! matcher.match_start_forward(&[
//!     CodeMatch::opcode(opcodes::LDC_I4),
//!     CodeMatch::opcode(opcodes::MUL).named("scale"),
//! ]);
//! assert!(matcher.is_valid());
//! assert_eq!(matcher.named("scale").map(|i| i.opcode), Some(opcodes::MUL));
//!
//! matcher.set_operand(Operand::Int32(2));
//! assert_eq!(matcher.instructions()[1].operand, Operand::Int32(2));
//! ```

use std::{collections::HashMap, fmt, sync::Arc};

use crate::{
    assembly::{BranchTarget, ExceptionBlock, Instruction, Label, OpCode, Operand},
    Result,
};

/// Predicate applied to a single instruction.
pub type InstructionPredicate = Arc<dyn Fn(&Instruction) -> bool + Send + Sync>;

/// Cursor position within an instruction list.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Position {
    /// Index of an existing instruction
    At(usize),
    /// Past either end of the list
    OutOfBounds,
}

impl Position {
    /// The index, if the position is valid
    #[must_use]
    pub fn index(&self) -> Option<usize> {
        match self {
            Position::At(index) => Some(*index),
            Position::OutOfBounds => None,
        }
    }

    /// `true` if the position points at an instruction
    #[must_use]
    pub fn is_valid(&self) -> bool {
        matches!(self, Position::At(_))
    }
}

/// Search direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Towards higher indices
    Forward,
    /// Towards lower indices
    Backward,
}

/// Describes one instruction of a pattern.
///
/// A matcher with a predicate accepts exactly what the predicate accepts. Otherwise every
/// populated criterion must hold; lists of alternatives (opcodes, operands, labels and blocks)
/// are satisfied by any one entry. An empty matcher, [`CodeMatch::any`], matches everything.
#[derive(Clone, Default)]
pub struct CodeMatch {
    name: Option<String>,
    opcodes: Vec<OpCode>,
    operands: Vec<Operand>,
    labels: Vec<Label>,
    blocks: Vec<ExceptionBlock>,
    jumps_from: Vec<usize>,
    jumps_to: Vec<usize>,
    predicate: Option<InstructionPredicate>,
}

impl CodeMatch {
    /// Matches any instruction
    #[must_use]
    pub fn any() -> Self {
        Self::default()
    }

    /// Matches an opcode
    #[must_use]
    pub fn opcode(opcode: OpCode) -> Self {
        CodeMatch {
            opcodes: vec![opcode],
            ..Self::default()
        }
    }

    /// Matches an opcode with a specific operand
    #[must_use]
    pub fn new(opcode: OpCode, operand: Operand) -> Self {
        CodeMatch {
            opcodes: vec![opcode],
            operands: vec![operand],
            ..Self::default()
        }
    }

    /// Matches instructions accepted by `predicate`
    #[must_use]
    pub fn predicate(predicate: impl Fn(&Instruction) -> bool + Send + Sync + 'static) -> Self {
        CodeMatch {
            predicate: Some(Arc::new(predicate)),
            ..Self::default()
        }
    }

    /// Captures the matched instruction under `name`
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Adds an alternative opcode
    #[must_use]
    pub fn or_opcode(mut self, opcode: OpCode) -> Self {
        self.opcodes.push(opcode);
        self
    }

    /// Adds an alternative operand
    #[must_use]
    pub fn with_operand(mut self, operand: Operand) -> Self {
        self.operands.push(operand);
        self
    }

    /// Requires one of the given labels to be bound to the instruction
    #[must_use]
    pub fn with_label(mut self, label: Label) -> Self {
        self.labels.push(label);
        self
    }

    /// Requires one of the given exception markers on the instruction
    #[must_use]
    pub fn with_block(mut self, block: ExceptionBlock) -> Self {
        self.blocks.push(block);
        self
    }

    /// Requires the instruction at `index` to branch to the matched instruction
    #[must_use]
    pub fn jumps_from(mut self, index: usize) -> Self {
        self.jumps_from.push(index);
        self
    }

    /// Requires the matched instruction to branch to the instruction at `index`
    #[must_use]
    pub fn jumps_to(mut self, index: usize) -> Self {
        self.jumps_to.push(index);
        self
    }

    /// Checks the instruction at `index`
    #[must_use]
    pub fn matches(&self, instructions: &[Instruction], index: usize) -> bool {
        let Some(instruction) = instructions.get(index) else {
            return false;
        };
        if let Some(predicate) = &self.predicate {
            return predicate(instruction);
        }

        (self.opcodes.is_empty() || self.opcodes.contains(&instruction.opcode))
            && (self.operands.is_empty() || self.operands.contains(&instruction.operand))
            && (self.labels.is_empty()
                || self.labels.iter().any(|l| instruction.labels.contains(l)))
            && (self.blocks.is_empty()
                || self.blocks.iter().any(|b| instruction.blocks.contains(b)))
            && self.jumps_from.iter().all(|source| {
                instructions
                    .get(*source)
                    .is_some_and(|source| source.branches_to(instruction))
            })
            && self.jumps_to.iter().all(|target| {
                instructions
                    .get(*target)
                    .is_some_and(|target| instruction.branches_to(target))
            })
    }
}

impl fmt::Debug for CodeMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeMatch")
            .field("name", &self.name)
            .field("opcodes", &self.opcodes)
            .field("operands", &self.operands)
            .field("labels", &self.labels)
            .field("blocks", &self.blocks)
            .field("jumps_from", &self.jumps_from)
            .field("jumps_to", &self.jumps_to)
            .field("predicate", &self.predicate.is_some())
            .finish()
    }
}

/// A successful [`match_sequence`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Match {
    /// Index of the first matched instruction
    pub start: usize,
    /// Index one past the last matched instruction
    pub end: usize,
    captures: HashMap<String, usize>,
}

impl Match {
    /// Index of the instruction captured under `name`
    #[must_use]
    pub fn capture(&self, name: &str) -> Option<usize> {
        self.captures.get(name).copied()
    }
}

/// Finds the first instruction accepted by `predicate`, starting at `start` inclusive.
///
/// A backward search starting past the end begins at the last instruction.
pub fn search(
    instructions: &[Instruction],
    start: usize,
    direction: Direction,
    predicate: impl Fn(&Instruction) -> bool,
) -> Position {
    let found = match direction {
        Direction::Forward => instructions
            .iter()
            .enumerate()
            .skip(start)
            .find(|(_, instruction)| predicate(instruction)),
        Direction::Backward => {
            let len = instructions.len().min(start.saturating_add(1));
            instructions[..len]
                .iter()
                .enumerate()
                .rev()
                .find(|(_, instruction)| predicate(instruction))
        }
    };
    found.map_or(Position::OutOfBounds, |(index, _)| Position::At(index))
}

/// Matches `patterns` against the instructions starting at `start`.
///
/// Named patterns are captured by index. The match fails if the sequence runs past the end.
#[must_use]
pub fn match_sequence(
    instructions: &[Instruction],
    start: usize,
    patterns: &[CodeMatch],
) -> Option<Match> {
    let end = start.checked_add(patterns.len())?;
    if end > instructions.len() {
        return None;
    }

    let mut captures = HashMap::new();
    for (offset, pattern) in patterns.iter().enumerate() {
        if !pattern.matches(instructions, start + offset) {
            return None;
        }
        if let Some(name) = &pattern.name {
            captures.insert(name.clone(), start + offset);
        }
    }

    Some(Match {
        start,
        end,
        captures,
    })
}

/// An instruction list with a cursor, for search-and-edit transforms.
#[derive(Debug, Clone)]
pub struct CodeMatcher {
    instructions: Vec<Instruction>,
    position: Position,
    last_match: Option<Match>,
}

impl CodeMatcher {
    /// Wraps `instructions`, positioned at the first instruction
    #[must_use]
    pub fn new(instructions: Vec<Instruction>) -> Self {
        let position = if instructions.is_empty() {
            Position::OutOfBounds
        } else {
            Position::At(0)
        };
        CodeMatcher {
            instructions,
            position,
            last_match: None,
        }
    }

    /// Current position
    #[must_use]
    pub fn position(&self) -> Position {
        self.position
    }

    /// `true` if the cursor points at an instruction
    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.position.is_valid()
    }

    /// The instruction list
    #[must_use]
    pub fn instructions(&self) -> &[Instruction] {
        &self.instructions
    }

    /// Unwraps the instruction list
    #[must_use]
    pub fn into_instructions(self) -> Vec<Instruction> {
        self.instructions
    }

    /// Instruction under the cursor
    #[must_use]
    pub fn instruction(&self) -> Option<&Instruction> {
        self.position
            .index()
            .and_then(|index| self.instructions.get(index))
    }

    /// Instruction captured under `name` by the last successful match
    #[must_use]
    pub fn named(&self, name: &str) -> Option<&Instruction> {
        self.last_match
            .as_ref()
            .and_then(|m| m.capture(name))
            .and_then(|index| self.instructions.get(index))
    }

    fn seek(&mut self, index: Option<usize>) -> &mut Self {
        self.position = match index {
            Some(index) if index < self.instructions.len() => Position::At(index),
            _ => Position::OutOfBounds,
        };
        self
    }

    /// Moves to the first instruction
    pub fn start(&mut self) -> &mut Self {
        self.seek(Some(0))
    }

    /// Moves to the last instruction
    pub fn end(&mut self) -> &mut Self {
        let last = self.instructions.len().checked_sub(1);
        self.seek(last)
    }

    /// Moves the cursor by `offset`, going out of bounds past either end
    pub fn advance(&mut self, offset: isize) -> &mut Self {
        let target = self
            .position
            .index()
            .and_then(|index| index.checked_add_signed(offset));
        self.seek(target)
    }

    /// Moves to the next instruction at or after the cursor accepted by `predicate`
    pub fn search_forward(&mut self, predicate: impl Fn(&Instruction) -> bool) -> &mut Self {
        let Some(start) = self.position.index() else {
            return self;
        };
        self.position = search(&self.instructions, start, Direction::Forward, predicate);
        self
    }

    /// Moves to the previous instruction at or before the cursor accepted by `predicate`
    pub fn search_backward(&mut self, predicate: impl Fn(&Instruction) -> bool) -> &mut Self {
        let Some(start) = self.position.index() else {
            return self;
        };
        self.position = search(&self.instructions, start, Direction::Backward, predicate);
        self
    }

    fn match_forward(&mut self, patterns: &[CodeMatch], use_end: bool) -> &mut Self {
        let Some(start) = self.position.index() else {
            return self;
        };

        let found = (start..self.instructions.len())
            .find_map(|index| match_sequence(&self.instructions, index, patterns));
        self.apply_match(found, use_end)
    }

    fn apply_match(&mut self, found: Option<Match>, use_end: bool) -> &mut Self {
        match found {
            Some(found) => {
                let index = if use_end {
                    found.end.checked_sub(1)
                } else {
                    Some(found.start)
                };
                self.last_match = Some(found);
                self.seek(index)
            }
            None => {
                self.last_match = None;
                self.position = Position::OutOfBounds;
                self
            }
        }
    }

    /// Finds the next occurrence of `patterns` at or after the cursor and moves to its start
    pub fn match_start_forward(&mut self, patterns: &[CodeMatch]) -> &mut Self {
        self.match_forward(patterns, false)
    }

    /// Finds the next occurrence of `patterns` at or after the cursor and moves to its last
    /// instruction
    pub fn match_end_forward(&mut self, patterns: &[CodeMatch]) -> &mut Self {
        self.match_forward(patterns, true)
    }

    /// Finds the closest occurrence of `patterns` starting at or before the cursor and moves to
    /// its start
    pub fn match_start_backward(&mut self, patterns: &[CodeMatch]) -> &mut Self {
        let Some(start) = self.position.index() else {
            return self;
        };

        let found = (0..=start)
            .rev()
            .find_map(|index| match_sequence(&self.instructions, index, patterns));
        self.apply_match(found, false)
    }

    /// Replaces opcode and operand of the instruction under the cursor, keeping its identity,
    /// labels and exception markers. Does nothing when the cursor is out of bounds.
    pub fn set_instruction(&mut self, opcode: OpCode, operand: Operand) -> &mut Self {
        if let Some(index) = self.position.index() {
            self.instructions[index].set(opcode, operand);
        }
        self
    }

    /// Replaces the operand of the instruction under the cursor
    pub fn set_operand(&mut self, operand: Operand) -> &mut Self {
        if let Some(index) = self.position.index() {
            self.instructions[index].operand = operand;
        }
        self
    }

    /// Inserts instructions before the cursor, leaving the cursor on the first inserted one.
    ///
    /// Labels stay on the instruction they were bound to, so branches to it skip the inserted
    /// code. Does nothing when the cursor is out of bounds.
    pub fn insert(&mut self, instructions: impl IntoIterator<Item = Instruction>) -> &mut Self {
        if let Some(index) = self.position.index() {
            self.instructions.splice(index..index, instructions);
        }
        self
    }

    /// Inserts instructions before the cursor, leaving the cursor on the instruction it pointed
    /// at before
    pub fn insert_and_advance(
        &mut self,
        instructions: impl IntoIterator<Item = Instruction>,
    ) -> &mut Self {
        let Some(index) = self.position.index() else {
            return self;
        };
        let before = self.instructions.len();
        self.instructions.splice(index..index, instructions);
        let inserted = self.instructions.len() - before;
        self.seek(Some(index + inserted))
    }

    /// Appends instructions to the end of the list, without moving the cursor
    pub fn append(&mut self, instructions: impl IntoIterator<Item = Instruction>) -> &mut Self {
        self.instructions.extend(instructions);
        self
    }

    /// Removes the instruction under the cursor; the cursor then points at its successor.
    ///
    /// Labels, opening exception markers and branches aimed at the removed instruction move to
    /// the next instruction, closing markers to the previous one, so branches and regions stay
    /// intact. Returns `None` when the cursor is out of bounds.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedBody`] if the attachments or incoming branches have
    /// nowhere to go.
    pub fn remove(&mut self) -> Result<Option<Instruction>> {
        let Some(index) = self.position.index() else {
            return Ok(None);
        };
        let current = &self.instructions[index];
        let id = current.id;
        let closes = current.blocks.contains(&ExceptionBlock::End);
        let opens = current.blocks.iter().any(|b| *b != ExceptionBlock::End);
        let targeted = self.instructions.iter().enumerate().any(|(i, instruction)| {
            i != index
                && instruction
                    .operand
                    .targets()
                    .iter()
                    .any(|t| *t == BranchTarget::Instruction(id))
        });
        if closes && index == 0 {
            return Err(malformed_error!(
                "Instruction {} closes a block but has no predecessor",
                id
            ));
        }
        if (opens || targeted || !current.labels.is_empty()) && index + 1 == self.instructions.len()
        {
            return Err(malformed_error!(
                "Instruction {} carries labels, blocks or incoming branches but has no successor",
                id
            ));
        }

        let mut removed = self.instructions.remove(index);
        let (ends, begins): (Vec<_>, Vec<_>) = removed
            .blocks
            .drain(..)
            .partition(|block| *block == ExceptionBlock::End);

        if let Some(previous) = index.checked_sub(1).and_then(|i| self.instructions.get_mut(i)) {
            previous.blocks.extend(ends);
        }
        if let Some(next) = self.instructions.get_mut(index) {
            let mut labels = std::mem::take(&mut removed.labels);
            labels.append(&mut next.labels);
            next.labels = labels;

            let mut blocks = begins;
            blocks.append(&mut next.blocks);
            next.blocks = blocks;
        }

        if let Some(successor) = self.instructions.get(index).map(|next| next.id) {
            for instruction in &mut self.instructions {
                for target in instruction.operand.targets_mut() {
                    if *target == BranchTarget::Instruction(id) {
                        *target = BranchTarget::Instruction(successor);
                    }
                }
            }
        }

        self.seek(Some(index));
        Ok(Some(removed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::{decode_stream, encode, opcodes, BranchTarget, CodeGenerator},
        Error,
    };

    fn sample(generator: &mut CodeGenerator) -> Vec<Instruction> {
        vec![
            generator.ldarg(0),
            generator.ldc_i4(5),
            generator.emit(opcodes::MUL, Operand::None),
            generator.emit(opcodes::RET, Operand::None),
        ]
    }

    #[test]
    fn sequence_with_capture() {
        let mut generator = CodeGenerator::new();
        let instructions = sample(&mut generator);

        let found = match_sequence(
            &instructions,
            0,
            &[
                CodeMatch::opcode(opcodes::LDARG_0),
                CodeMatch::any(),
                CodeMatch::opcode(opcodes::MUL).named("m"),
            ],
        );

        let found = found.expect("sequence should match");
        assert_eq!(found.start, 0);
        assert_eq!(found.end, 3);
        assert_eq!(found.capture("m"), Some(2));
        assert_eq!(found.capture("x"), None);
    }

    #[test]
    fn sequence_from_start_index() {
        let mut generator = CodeGenerator::new();
        let instructions = vec![
            generator.ldc_i4(1),
            generator.emit(opcodes::ADD, Operand::None),
            generator.ldc_i4(2),
            generator.emit(opcodes::MUL, Operand::None),
        ];
        let patterns = [
            CodeMatch::predicate(|i| i.constant().is_some()),
            CodeMatch::opcode(opcodes::MUL).named("m"),
        ];

        let found = match_sequence(&instructions, 2, &patterns);
        assert_eq!(found.and_then(|m| m.capture("m")), Some(3));
        assert!(match_sequence(&instructions, 0, &patterns).is_none());
    }

    #[test]
    fn predicate_overrides_criteria() {
        let mut generator = CodeGenerator::new();
        let instructions = sample(&mut generator);

        // The opcode criterion is ignored once a predicate decides
        let matcher = CodeMatch::predicate(|i| i.opcode == opcodes::RET).or_opcode(opcodes::MUL);
        assert!(matcher.matches(&instructions, 3));
        assert!(!matcher.matches(&instructions, 2));
    }

    #[test]
    fn sequence_past_end() {
        let mut generator = CodeGenerator::new();
        let instructions = sample(&mut generator);

        let patterns = [CodeMatch::opcode(opcodes::RET), CodeMatch::any()];
        assert!(match_sequence(&instructions, 3, &patterns).is_none());
        assert!(match_sequence(&instructions, usize::MAX, &patterns).is_none());
    }

    #[test]
    fn search_directions() {
        let mut generator = CodeGenerator::new();
        let instructions = sample(&mut generator);

        let is_ldarg = |i: &Instruction| i.opcode == opcodes::LDARG_0;
        assert_eq!(
            search(&instructions, 0, Direction::Forward, is_ldarg),
            Position::At(0)
        );
        assert_eq!(
            search(&instructions, 1, Direction::Forward, is_ldarg),
            Position::OutOfBounds
        );
        assert_eq!(
            search(&instructions, 100, Direction::Backward, is_ldarg),
            Position::At(0)
        );
        assert_eq!(
            search(&[], 0, Direction::Backward, is_ldarg),
            Position::OutOfBounds
        );
    }

    #[test]
    fn operand_and_predicate_criteria() {
        let mut generator = CodeGenerator::new();
        let instructions = sample(&mut generator);

        assert!(CodeMatch::new(opcodes::LDC_I4_5, Operand::None).matches(&instructions, 1));
        assert!(!CodeMatch::new(opcodes::LDC_I4_5, Operand::Int32(5)).matches(&instructions, 1));
        assert!(CodeMatch::predicate(|i| i.constant() == Some(5)).matches(&instructions, 1));
        assert!(CodeMatch::opcode(opcodes::ADD)
            .or_opcode(opcodes::MUL)
            .matches(&instructions, 2));
        assert!(!CodeMatch::any().matches(&instructions, 4));
    }

    #[test]
    fn branch_relations() {
        let mut generator = CodeGenerator::new();
        let ret = generator.emit(opcodes::RET, Operand::None);
        let target = Operand::Target(BranchTarget::Instruction(ret.id));
        let branch = generator.emit(opcodes::BR, target);
        let instructions = vec![branch, ret];

        assert!(CodeMatch::any().jumps_from(0).matches(&instructions, 1));
        assert!(CodeMatch::any().jumps_to(1).matches(&instructions, 0));
        assert!(!CodeMatch::any().jumps_to(0).matches(&instructions, 1));
    }

    #[test]
    fn label_block_and_operand_alternatives() {
        let mut generator = CodeGenerator::new();
        let mut instructions = sample(&mut generator);
        let start = generator.define_label();
        let other = generator.define_label();
        instructions[0].labels.push(start);
        instructions[0].blocks.push(ExceptionBlock::BeginTry);
        instructions[3].blocks.push(ExceptionBlock::End);

        assert!(CodeMatch::any().with_label(other).with_label(start).matches(&instructions, 0));
        assert!(!CodeMatch::any().with_label(other).matches(&instructions, 0));
        assert!(!CodeMatch::any().with_label(start).matches(&instructions, 1));

        let handler = CodeMatch::any()
            .with_block(ExceptionBlock::BeginFinally)
            .with_block(ExceptionBlock::End);
        assert!(handler.matches(&instructions, 3));
        assert!(!handler.matches(&instructions, 0));

        // ldc.i4.s 7 or ldc.i4.s 9
        let small =
            CodeMatch::new(opcodes::LDC_I4_S, Operand::Int8(7)).with_operand(Operand::Int8(9));
        let nine = vec![generator.ldc_i4(9)];
        assert!(small.matches(&nine, 0));
        assert!(!small.matches(&[generator.ldc_i4(8)], 0));
    }

    #[test]
    fn matcher_navigation() {
        let mut generator = CodeGenerator::new();
        let mut matcher = CodeMatcher::new(sample(&mut generator));

        matcher.end();
        assert_eq!(matcher.position(), Position::At(3));
        matcher.advance(1);
        assert!(!matcher.is_valid());
        matcher.start().advance(2);
        assert_eq!(matcher.instruction().map(|i| i.opcode), Some(opcodes::MUL));
        matcher.advance(-3);
        assert_eq!(matcher.position(), Position::OutOfBounds);

        matcher.start().search_forward(|i| i.opcode == opcodes::RET);
        assert_eq!(matcher.position(), Position::At(3));
        matcher.search_backward(|i| i.opcode == opcodes::LDARG_0);
        assert_eq!(matcher.position(), Position::At(0));
    }

    #[test]
    fn matcher_end_forward_and_backward() {
        let mut generator = CodeGenerator::new();
        let mut matcher = CodeMatcher::new(sample(&mut generator));
        let patterns = [CodeMatch::any(), CodeMatch::opcode(opcodes::MUL).named("m")];

        matcher.match_end_forward(&patterns);
        assert_eq!(matcher.position(), Position::At(2));
        assert!(matcher.named("m").is_some());

        matcher.end().match_start_backward(&patterns);
        assert_eq!(matcher.position(), Position::At(1));

        matcher.match_start_forward(&[CodeMatch::opcode(opcodes::NOP)]);
        assert!(!matcher.is_valid());
        assert!(matcher.named("m").is_none());
    }

    #[test]
    fn editing_out_of_bounds_is_noop() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let original = sample(&mut generator);
        let mut matcher = CodeMatcher::new(original.clone());

        matcher
            .search_forward(|i| i.opcode == opcodes::NOP)
            .set_operand(Operand::Int32(9))
            .insert([generator.emit(opcodes::POP, Operand::None)]);
        assert_eq!(matcher.instructions(), original.as_slice());
        assert!(matcher.remove()?.is_none());
        Ok(())
    }

    #[test]
    fn remove_rejects_orphaned_label() {
        let mut generator = CodeGenerator::new();
        let mut instructions = sample(&mut generator);
        instructions[3].labels.push(Label(1));
        let mut matcher = CodeMatcher::new(instructions);

        matcher.end();
        assert!(matches!(matcher.remove(), Err(Error::MalformedBody { .. })));
        assert_eq!(matcher.instructions().len(), 4);
    }

    #[test]
    fn insert_and_remove() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let mut instructions = sample(&mut generator);
        instructions[2].labels.push(Label(7));
        let mul_id = instructions[2].id;
        let mut matcher = CodeMatcher::new(instructions);

        let nop = generator.emit(opcodes::NOP, Operand::None);
        matcher.start().advance(2).insert_and_advance([nop]);
        assert_eq!(matcher.instruction().map(|i| i.id), Some(mul_id));

        let removed = matcher.remove()?.expect("cursor on mul");
        assert_eq!(removed.opcode, opcodes::MUL);
        let ret = matcher.instruction().expect("ret follows");
        assert_eq!(ret.opcode, opcodes::RET);
        assert_eq!(ret.labels, vec![Label(7)]);

        matcher.insert([generator.emit(opcodes::POP, Operand::None)]);
        assert_eq!(matcher.instruction().map(|i| i.opcode), Some(opcodes::POP));
        assert_eq!(matcher.instructions().len(), 5);
        Ok(())
    }

    #[test]
    fn remove_retargets_decoded_branches() -> Result<()> {
        let mut generator = CodeGenerator::new();
        // ldarg.0; brtrue.s +0; nop; ret
        let decoded = decode_stream(&[0x02, 0x2D, 0x00, 0x00, 0x2A], &mut generator)?;
        let mut matcher = CodeMatcher::new(decoded);

        matcher.match_start_forward(&[CodeMatch::opcode(opcodes::NOP)]);
        let removed = matcher.remove()?.expect("cursor on nop");
        assert!(matcher.instructions()[1].branches_to(&matcher.instructions()[2]));
        assert!(!matcher.instructions()[1].operand.targets().iter().any(|t| t.is(&removed)));

        let encoded = encode(matcher.instructions(), &mut generator)?;
        assert_eq!(encoded.code, vec![0x02, 0x3A, 0x00, 0x00, 0x00, 0x00, 0x2A]);
        Ok(())
    }

    #[test]
    fn remove_retargets_switch_entries() -> Result<()> {
        let mut generator = CodeGenerator::new();
        // switch (+0, +1); nop; ret
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00,
            0x2A,
        ];
        let mut matcher = CodeMatcher::new(decode_stream(&code, &mut generator)?);

        matcher.start().advance(1).remove()?;
        let ret = matcher.instructions()[1].id;
        assert_eq!(
            matcher.instructions()[0].operand,
            Operand::Switch(vec![BranchTarget::Instruction(ret); 2])
        );

        let encoded = encode(matcher.instructions(), &mut generator)?;
        assert_eq!(
            encoded.code,
            vec![0x45, 0x02, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x2A]
        );
        Ok(())
    }

    #[test]
    fn remove_rejects_targeted_last_instruction() -> Result<()> {
        let mut generator = CodeGenerator::new();
        // br.s +0; ret
        let mut matcher = CodeMatcher::new(decode_stream(&[0x2B, 0x00, 0x2A], &mut generator)?);

        matcher.end();
        assert!(matches!(matcher.remove(), Err(Error::MalformedBody { .. })));
        assert_eq!(matcher.instructions().len(), 2);
        Ok(())
    }

    #[test]
    fn remove_moves_end_marker_back() -> Result<()> {
        let mut generator = CodeGenerator::new();
        let mut instructions = sample(&mut generator);
        instructions[2].blocks.push(ExceptionBlock::End);
        let mut matcher = CodeMatcher::new(instructions);

        matcher.start().advance(2).remove()?;

        assert_eq!(matcher.instructions()[1].blocks, vec![ExceptionBlock::End]);
        Ok(())
    }
}
