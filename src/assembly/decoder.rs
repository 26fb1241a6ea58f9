//! CIL instruction decoding.
//!
//! Turns a raw code stream into a list of position-independent [`Instruction`]s. Decoding
//! happens in two passes: the first pass reads opcodes and operands linearly and records the
//! absolute byte offsets branch operands point to; the second pass resolves every recorded
//! offset to the identity of the instruction starting there. A branch into the middle of an
//! instruction, or past the end of the code, is a [`crate::Error::MalformedBody`].
//!
//! [`decode_body`] additionally parses the method header and turns the exception table into
//! [`ExceptionBlock`] markers on the instructions that open and close each region.
//!
//! # Key Components
//!
//! - [`decode_stream`] - Decodes bare code bytes
//! - [`decode_body`] - Decodes a full method body including header and exception table
//! - [`DecodedBody`] - Header and instructions of a decoded body
//!
//! # Usage Examples
//!
//! ```rust
//! use dotpatch::assembly::{decode_stream, opcodes, BranchTarget, CodeGenerator, Operand};
//!
//! // brtrue.s +1; nop; ret
//! let code = [0x2D, 0x01, 0x00, 0x2A];
//! let instructions = decode_stream(&code, &mut CodeGenerator::new())?;
//!
//! assert_eq!(instructions.len(), 3);
//! assert_eq!(instructions[0].opcode, opcodes::BRTRUE_S);
//! assert_eq!(
//!     instructions[0].operand,
//!     Operand::Target(BranchTarget::Instruction(instructions[2].id))
//! );
//! # Ok::<(), dotpatch::Error>(())
//! ```

use crate::{
    assembly::{
        opcodes::FE_PREFIX, BranchTarget, CodeGenerator, ExceptionBlock, Instruction, MemberRef,
        OpCode, Operand, OperandKind,
    },
    file::parser::Parser,
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags, MethodBody},
        token::Token,
    },
    Error, Result,
};

/// A decoded method body.
#[derive(Debug, Clone)]
pub struct DecodedBody {
    /// Parsed header, including the raw exception table
    pub header: MethodBody,
    /// Instructions with exception markers attached
    pub instructions: Vec<Instruction>,
}

/// Branch destinations of one instruction as absolute code offsets, pending resolution.
struct PendingTargets {
    index: usize,
    offsets: Vec<u32>,
}

/// Decodes a complete code stream into instructions with resolved branch targets.
///
/// Identities are allocated from `generator`, so instructions decoded with the same generator
/// never collide with instructions created later by transforms.
///
/// # Errors
///
/// Returns [`crate::Error::MalformedBody`] for reserved opcodes, for instructions cut off by the
/// end of the code and for branches that do not land on an instruction start.
pub fn decode_stream(code: &[u8], generator: &mut CodeGenerator) -> Result<Vec<Instruction>> {
    let mut parser = Parser::new(code);
    let mut instructions = Vec::new();
    let mut pending = Vec::new();

    while parser.has_more_data() {
        let start = parser.pos();
        let (instruction, offsets) =
            decode_instruction(&mut parser, generator).map_err(|error| match error {
                Error::OutOfBounds { .. } => malformed_error!(
                    "Instruction at IL_{:04x} runs past the end of {} code bytes",
                    start,
                    code.len()
                ),
                other => other,
            })?;
        if let Some(offsets) = offsets {
            pending.push(PendingTargets {
                index: instructions.len(),
                offsets,
            });
        }
        instructions.push(instruction);
    }

    resolve_branches(&mut instructions, pending)?;
    Ok(instructions)
}

/// Decodes a method body: header, code and exception table.
///
/// Each exception clause becomes a set of markers: [`ExceptionBlock::BeginTry`] on the first
/// instruction of the protected range, a handler marker on the first instruction of every
/// handler (a filter contributes [`ExceptionBlock::BeginFilter`] followed later by a
/// [`ExceptionBlock::BeginCatch`] on its handler), and one [`ExceptionBlock::End`] on the last
/// instruction of the last handler. Clauses sharing a protected range form one region.
///
/// # Errors
///
/// Returns [`crate::Error::MalformedBody`] if the header is invalid, the code is malformed, or
/// an exception clause does not start and end on instruction boundaries.
pub fn decode_body(body: &[u8], generator: &mut CodeGenerator) -> Result<DecodedBody> {
    let header = MethodBody::from(body)?;
    let code = header.code(body)?;
    let mut instructions = decode_stream(code, generator)?;
    attach_exception_blocks(&mut instructions, &header.exception_handlers)?;

    Ok(DecodedBody {
        header,
        instructions,
    })
}

/// Decodes one instruction. Branch operands are returned as absolute offsets and left as
/// [`Operand::None`] until [`resolve_branches`] runs.
fn decode_instruction(
    parser: &mut Parser,
    generator: &mut CodeGenerator,
) -> Result<(Instruction, Option<Vec<u32>>)> {
    // Code streams handled here are bounded by the 32-bit code size of the header
    #[allow(clippy::cast_possible_truncation)]
    let offset = parser.pos() as u32;

    let first = parser.read_le::<u8>()?;
    let opcode = if first == FE_PREFIX {
        OpCode::extended(parser.read_le::<u8>()?)
    } else {
        OpCode::single(first)
    };

    let info = opcode.info();
    if info.is_reserved() {
        return Err(malformed_error!(
            "Reserved opcode 0x{:x} at IL_{:04x}",
            opcode.value(),
            offset
        ));
    }

    let mut relative = Vec::new();
    let operand = match info.operand {
        OperandKind::None => Operand::None,
        OperandKind::Int8 => Operand::Int8(parser.read_le::<i8>()?),
        OperandKind::Int32 => Operand::Int32(parser.read_le::<i32>()?),
        OperandKind::Int64 => Operand::Int64(parser.read_le::<i64>()?),
        OperandKind::Float32 => Operand::Float32(parser.read_le::<f32>()?),
        OperandKind::Float64 => Operand::Float64(parser.read_le::<f64>()?),
        OperandKind::ShortBranch => {
            relative.push(i64::from(parser.read_le::<i8>()?));
            Operand::None
        }
        OperandKind::Branch => {
            relative.push(i64::from(parser.read_le::<i32>()?));
            Operand::None
        }
        OperandKind::Switch => {
            let count = parser.read_le::<u32>()? as usize;
            if count.saturating_mul(4) > parser.remaining() {
                return Err(malformed_error!(
                    "Switch at IL_{:04x} declares {} targets, {} bytes remain",
                    offset,
                    count,
                    parser.remaining()
                ));
            }
            for _ in 0..count {
                relative.push(i64::from(parser.read_le::<i32>()?));
            }
            Operand::None
        }
        OperandKind::ShortLocal => Operand::Local(u16::from(parser.read_le::<u8>()?)),
        OperandKind::Local => Operand::Local(parser.read_le::<u16>()?),
        OperandKind::ShortArgument => Operand::Argument(u16::from(parser.read_le::<u8>()?)),
        OperandKind::Argument => Operand::Argument(parser.read_le::<u16>()?),
        OperandKind::Method => Operand::Member(MemberRef::Method(read_token(parser)?)),
        OperandKind::Field => Operand::Member(MemberRef::Field(read_token(parser)?)),
        OperandKind::Type => Operand::Member(MemberRef::Type(read_token(parser)?)),
        OperandKind::Token => Operand::Member(MemberRef::Token(read_token(parser)?)),
        OperandKind::Signature => Operand::Member(MemberRef::Signature(read_token(parser)?)),
        OperandKind::String => Operand::String(read_token(parser)?),
    };

    let mut instruction = Instruction::new(generator.next_id(), opcode, operand);
    instruction.offset = offset;

    if !matches!(
        info.operand,
        OperandKind::ShortBranch | OperandKind::Branch | OperandKind::Switch
    ) {
        return Ok((instruction, None));
    }

    // Offsets are relative to the end of the instruction, switch tables included
    let end = parser.pos() as i64;
    let mut offsets = Vec::with_capacity(relative.len());
    for delta in relative {
        let target = end + delta;
        let Ok(target) = u32::try_from(target) else {
            return Err(malformed_error!(
                "Branch at IL_{:04x} targets negative offset {}",
                offset,
                target
            ));
        };
        offsets.push(target);
    }

    Ok((instruction, Some(offsets)))
}

fn read_token(parser: &mut Parser) -> Result<Token> {
    Ok(Token::new(parser.read_le::<u32>()?))
}

/// Index of the instruction starting exactly at `offset`
fn index_at(instructions: &[Instruction], offset: u32) -> Option<usize> {
    instructions
        .binary_search_by_key(&offset, |instruction| instruction.offset)
        .ok()
}

fn resolve_branches(instructions: &mut [Instruction], pending: Vec<PendingTargets>) -> Result<()> {
    for PendingTargets { index, offsets } in pending {
        let mut targets = Vec::with_capacity(offsets.len());
        for offset in offsets {
            let Some(target) = index_at(instructions, offset) else {
                return Err(malformed_error!(
                    "Branch at IL_{:04x} targets 0x{:x}, which is not an instruction boundary",
                    instructions[index].offset,
                    offset
                ));
            };
            targets.push(BranchTarget::Instruction(instructions[target].id));
        }

        let instruction = &mut instructions[index];
        instruction.operand = if instruction.opcode.operand_kind() == OperandKind::Switch {
            Operand::Switch(targets)
        } else {
            match targets.pop() {
                Some(target) => Operand::Target(target),
                None => Operand::None,
            }
        };
    }

    Ok(())
}

/// Converts exception clauses into markers on instruction boundaries.
///
/// Markers opening a block are ordered handler-first, then try, with enclosing tries before
/// nested ones. `End` markers sit on the last instruction of their region and are ordered
/// innermost first, following the table order ECMA-335 requires for nested clauses.
fn attach_exception_blocks(
    instructions: &mut [Instruction],
    handlers: &[ExceptionHandler],
) -> Result<()> {
    if handlers.is_empty() {
        return Ok(());
    }

    let mut regions: Vec<(u32, u32, Vec<&ExceptionHandler>)> = Vec::new();
    for handler in handlers {
        match regions
            .iter_mut()
            .find(|(offset, length, _)| {
                *offset == handler.try_offset && *length == handler.try_length
            })
        {
            Some((_, _, clauses)) => clauses.push(handler),
            None => regions.push((handler.try_offset, handler.try_length, vec![handler])),
        }
    }

    let mut begins: Vec<(u32, u8, i64, ExceptionBlock)> = Vec::new();
    let mut ends: Vec<(u32, usize)> = Vec::new();
    for (region, (try_offset, try_length, clauses)) in regions.iter().enumerate() {
        begins.push((*try_offset, 1, -i64::from(*try_length), ExceptionBlock::BeginTry));

        let mut end = 0;
        for clause in clauses {
            if clause.flags.contains(ExceptionHandlerFlags::FILTER) {
                begins.push((clause.filter_offset, 0, 0, ExceptionBlock::BeginFilter));
                begins.push((
                    clause.handler_offset,
                    0,
                    0,
                    ExceptionBlock::BeginCatch(Token::default()),
                ));
            } else if clause.flags.contains(ExceptionHandlerFlags::FINALLY) {
                begins.push((clause.handler_offset, 0, 0, ExceptionBlock::BeginFinally));
            } else if clause.flags.contains(ExceptionHandlerFlags::FAULT) {
                begins.push((clause.handler_offset, 0, 0, ExceptionBlock::BeginFault));
            } else {
                begins.push((
                    clause.handler_offset,
                    0,
                    0,
                    ExceptionBlock::BeginCatch(clause.class_token),
                ));
            }
            end = end.max(clause.handler_end());
        }
        ends.push((end, region));
    }

    begins.sort_by_key(|(offset, rank, order, _)| (*offset, *rank, *order));
    ends.sort_by_key(|(offset, region)| (*offset, *region));

    for (offset, _, _, block) in begins {
        let Some(index) = index_at(instructions, offset) else {
            return Err(malformed_error!(
                "Exception block {:?} starts at 0x{:x}, which is not an instruction boundary",
                block,
                offset
            ));
        };
        instructions[index].blocks.push(block);
    }

    let code_end = instructions
        .last()
        .map_or(0, |last| last.offset + encoded_size(last));
    for (offset, _) in ends {
        let next = if offset == code_end {
            Some(instructions.len())
        } else {
            index_at(instructions, offset)
        };
        match next {
            Some(next) if next > 0 => instructions[next - 1].blocks.push(ExceptionBlock::End),
            _ => {
                return Err(malformed_error!(
                    "Exception region ends at 0x{:x}, which is not an instruction boundary",
                    offset
                ))
            }
        }
    }

    Ok(())
}

/// Size the instruction occupied in the stream it was decoded from
fn encoded_size(instruction: &Instruction) -> u32 {
    let operand = match &instruction.operand {
        Operand::Switch(targets) => 4 + 4 * targets.len(),
        _ => instruction.opcode.operand_kind().size(),
    };
    // Instruction sizes are bounded by the stream they were decoded from
    #[allow(clippy::cast_possible_truncation)]
    let size = (instruction.opcode.size() + operand) as u32;
    size
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        assembly::opcodes,
        metadata::method::write_body,
        Error,
    };

    fn decode(code: &[u8]) -> Result<Vec<Instruction>> {
        decode_stream(code, &mut CodeGenerator::new())
    }

    #[test]
    fn decode_simple() -> Result<()> {
        // ldloc.s 10; ldc.i4 1000; ceq; ret
        let code = [0x11, 0x0A, 0x20, 0xE8, 0x03, 0x00, 0x00, 0xFE, 0x01, 0x2A];
        let instructions = decode(&code)?;

        assert_eq!(instructions.len(), 4);
        assert_eq!(instructions[0].opcode, opcodes::LDLOC_S);
        assert_eq!(instructions[0].operand, Operand::Local(10));
        assert_eq!(instructions[1].operand, Operand::Int32(1000));
        assert_eq!(instructions[1].offset, 2);
        assert_eq!(instructions[2].opcode, opcodes::CEQ);
        assert_eq!(instructions[2].offset, 7);
        assert_eq!(instructions[3].offset, 9);
        Ok(())
    }

    #[test]
    fn decode_tokens() -> Result<()> {
        // call 0x0A000001; ldstr 0x70000002; ldtoken 0x02000003
        let code = [
            0x28, 0x01, 0x00, 0x00, 0x0A, 0x72, 0x02, 0x00, 0x00, 0x70, 0xD0, 0x03, 0x00, 0x00,
            0x02,
        ];
        let instructions = decode(&code)?;

        assert_eq!(
            instructions[0].operand,
            Operand::Member(MemberRef::Method(Token::new(0x0A00_0001)))
        );
        assert_eq!(instructions[1].operand, Operand::String(Token::new(0x7000_0002)));
        assert_eq!(
            instructions[2].operand,
            Operand::Member(MemberRef::Token(Token::new(0x0200_0003)))
        );
        Ok(())
    }

    #[test]
    fn decode_branches() -> Result<()> {
        let code = [
            0x00, // nop
            0x2C, 0x03, // brfalse.s +3 -> ret at 6
            0x00, // nop
            0x2B, 0xFA, // br.s -6 -> nop at 0
            0x2A, // ret
        ];
        let instructions = decode(&code)?;

        assert_eq!(
            instructions[1].operand,
            Operand::Target(BranchTarget::Instruction(instructions[4].id))
        );
        assert_eq!(
            instructions[3].operand,
            Operand::Target(BranchTarget::Instruction(instructions[0].id))
        );
        Ok(())
    }

    #[test]
    fn decode_switch() -> Result<()> {
        let code = [
            0x45, 0x02, 0x00, 0x00, 0x00, // switch (2 targets)
            0x00, 0x00, 0x00, 0x00, // +0 -> nop at 13
            0x01, 0x00, 0x00, 0x00, // +1 -> ret at 14
            0x00, // nop
            0x2A, // ret
        ];
        let instructions = decode(&code)?;

        assert_eq!(
            instructions[0].operand,
            Operand::Switch(vec![
                BranchTarget::Instruction(instructions[1].id),
                BranchTarget::Instruction(instructions[2].id),
            ])
        );
        Ok(())
    }

    #[test]
    fn branch_into_instruction_is_malformed() {
        // br.s +1 lands inside ldc.i4.s
        let code = [0x2B, 0x01, 0x1F, 0x05, 0x2A];
        assert!(matches!(decode(&code), Err(Error::MalformedBody { .. })));
    }

    #[test]
    fn branch_past_end_is_malformed() {
        let code = [0x2B, 0x05, 0x2A];
        assert!(matches!(decode(&code), Err(Error::MalformedBody { .. })));
    }

    #[test]
    fn reserved_opcode_is_malformed() {
        assert!(matches!(decode(&[0x24]), Err(Error::MalformedBody { .. })));
        assert!(matches!(decode(&[0xFE, 0x08]), Err(Error::MalformedBody { .. })));
        assert!(matches!(decode(&[0xFE, 0x40]), Err(Error::MalformedBody { .. })));
    }

    #[test]
    fn truncated_operand() {
        // br with half its offset
        assert!(matches!(decode(&[0x38, 0x00]), Err(Error::MalformedBody { .. })));
        // ldc.i4 with two of four operand bytes
        assert!(matches!(decode(&[0x20, 0x01, 0x02]), Err(Error::MalformedBody { .. })));
        // switch with a cut-off count
        assert!(matches!(
            decode(&[0x45, 0xFF, 0xFF, 0xFF]),
            Err(Error::MalformedBody { .. })
        ));
        // switch declaring more targets than the code holds
        assert!(matches!(
            decode(&[0x45, 0xFF, 0xFF, 0xFF, 0x0F]),
            Err(Error::MalformedBody { .. })
        ));
        // 0xFE prefix without its second byte
        assert!(matches!(decode(&[0x00, 0xFE]), Err(Error::MalformedBody { .. })));
    }

    #[test]
    fn exception_markers() -> Result<()> {
        let code = [
            0x00, // 0: nop                try
            0xDE, 0x04, // 1: leave.s +4 -> ret at 7
            0x26, // 3: pop                 catch
            0xDE, 0x01, // 4: leave.s +1
            0x00, // 6: nop (unreachable)
            0x2A, // 7: ret
        ];
        let handlers = [ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 3,
            class_token: Token::new(0x0100_0001),
            filter_offset: 0,
        }];
        let body = write_body(&code, 1, 0, false, &handlers)?;

        let decoded = decode_body(&body, &mut CodeGenerator::new())?;
        let instructions = decoded.instructions;

        assert_eq!(instructions[0].blocks, vec![ExceptionBlock::BeginTry]);
        assert_eq!(
            instructions[2].blocks,
            vec![ExceptionBlock::BeginCatch(Token::new(0x0100_0001))]
        );
        assert_eq!(instructions[3].blocks, vec![ExceptionBlock::End]);
        assert!(instructions[4].blocks.is_empty());
        Ok(())
    }

    #[test]
    fn region_ending_at_code_end() -> Result<()> {
        let code = [
            0x00, // 0: nop     try
            0xDE, 0x01, // 1: leave.s +1 -> rethrow (never reached normally)
            0x26, // 3: pop     catch
            0xFE, 0x1A, // 4: rethrow
        ];
        let handlers = [ExceptionHandler {
            flags: ExceptionHandlerFlags::EXCEPTION,
            try_offset: 0,
            try_length: 3,
            handler_offset: 3,
            handler_length: 3,
            class_token: Token::new(0x0100_0001),
            filter_offset: 0,
        }];
        let body = write_body(&code, 1, 0, false, &handlers)?;

        let instructions = decode_body(&body, &mut CodeGenerator::new())?.instructions;

        assert_eq!(instructions[3].opcode, opcodes::RETHROW);
        assert_eq!(instructions[3].blocks, vec![ExceptionBlock::End]);
        Ok(())
    }

    #[test]
    fn nested_regions_and_filter() -> Result<()> {
        let code = [
            0x00, // 0: nop           outer and inner try
            0xDE, 0x08, // 1: leave.s -> 11
            0x26, // 3: pop           inner fault
            0xDC, // 4: endfinally
            0xDE, 0x04, // 5: leave.s -> 11
            0x26, // 7: pop           outer filter
            0x17, // 8: ldc.i4.1
            0xFE, 0x11, // 9: endfilter
            0x2A, // 11: ret          filter handler
        ];
        let handlers = [
            ExceptionHandler {
                flags: ExceptionHandlerFlags::FAULT,
                try_offset: 0,
                try_length: 3,
                handler_offset: 3,
                handler_length: 2,
                class_token: Token::default(),
                filter_offset: 0,
            },
            ExceptionHandler {
                flags: ExceptionHandlerFlags::FILTER,
                try_offset: 0,
                try_length: 7,
                handler_offset: 11,
                handler_length: 1,
                class_token: Token::default(),
                filter_offset: 7,
            },
        ];
        let body = write_body(&code, 1, 0, false, &handlers)?;

        let instructions = decode_body(&body, &mut CodeGenerator::new())?.instructions;

        // outer try opens before the inner one
        assert_eq!(
            instructions[0].blocks,
            vec![ExceptionBlock::BeginTry, ExceptionBlock::BeginTry]
        );
        assert_eq!(instructions[2].blocks, vec![ExceptionBlock::BeginFault]);
        assert_eq!(instructions[3].blocks, vec![ExceptionBlock::End]);
        assert_eq!(instructions[5].blocks, vec![ExceptionBlock::BeginFilter]);
        assert_eq!(
            instructions[8].blocks,
            vec![
                ExceptionBlock::BeginCatch(Token::default()),
                ExceptionBlock::End
            ]
        );
        Ok(())
    }
}
