use std::collections::HashMap;

use crate::{
    assembly::{decode_body, BranchTarget, CodeGenerator, Instruction, MemberRef, Operand},
    metadata::{
        method::{ExceptionHandler, ExceptionHandlerFlags},
        signatures::{SignatureLocalVariable, TypeSignature},
    },
    patch::SynthesizedMethod,
    Error, Result,
};

/// Upper bound of executed instructions before a run is considered stuck
const STEP_LIMIT: usize = 100_000;

/// A slot a managed pointer refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Place {
    Argument(u16),
    Local(u16),
}

/// An evaluation stack value
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    I4(i32),
    I8(i64),
    R8(f64),
    Null,
    /// An object, identified by a name
    Object(String),
    Ref(Place),
}

impl Value {
    pub fn as_i4(&self) -> i32 {
        match self {
            Value::I4(value) => *value,
            Value::I8(value) => *value as i32,
            Value::R8(value) => *value as i32,
            _ => 0,
        }
    }

    fn is_true(&self) -> bool {
        match self {
            Value::I4(value) => *value != 0,
            Value::I8(value) => *value != 0,
            Value::R8(value) => *value != 0.0,
            Value::Null => false,
            Value::Object(_) | Value::Ref(_) => true,
        }
    }

    fn zero(ty: &TypeSignature) -> Value {
        match ty {
            TypeSignature::I8 | TypeSignature::U8 | TypeSignature::I | TypeSignature::U => {
                Value::I8(0)
            }
            TypeSignature::R4 | TypeSignature::R8 => Value::R8(0.0),
            ty if ty.is_reference() => Value::Null,
            TypeSignature::ValueType(_) => Value::Null,
            _ => Value::I4(0),
        }
    }
}

/// Arguments and locals of the method being evaluated
#[derive(Debug, Default)]
pub struct Frame {
    pub args: Vec<Value>,
    pub locals: Vec<Value>,
}

impl Frame {
    fn slot(&mut self, place: Place) -> Option<&mut Value> {
        match place {
            Place::Argument(index) => self.args.get_mut(usize::from(index)),
            Place::Local(index) => self.locals.get_mut(usize::from(index)),
        }
    }

    /// The value behind a reference, or the value itself
    pub fn load(&mut self, value: &Value) -> Value {
        match value {
            Value::Ref(place) => self.slot(*place).cloned().unwrap_or(Value::Null),
            other => other.clone(),
        }
    }

    /// Stores through a reference, ignores anything else
    pub fn store(&mut self, target: &Value, value: Value) {
        if let Value::Ref(place) = target {
            if let Some(slot) = self.slot(*place) {
                *slot = value;
            }
        }
    }
}

type CallbackFn = dyn Fn(&mut Frame, &[Value]) -> std::result::Result<Option<Value>, Value>;

/// Implementations of the methods a body calls, keyed by method token
#[derive(Default)]
pub struct CallbackRegistry {
    callbacks: HashMap<u32, (usize, Box<CallbackFn>)>,
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `f` for calls to `token`, which pop `arity` arguments. Returning `Err` throws.
    pub fn register<F>(&mut self, token: u32, arity: usize, f: F)
    where
        F: Fn(&mut Frame, &[Value]) -> std::result::Result<Option<Value>, Value> + 'static,
    {
        self.callbacks.insert(token, (arity, Box::new(f)));
    }
}

/// Interprets the subset of CIL the synthesizer and the test bodies use
pub struct Evaluator {
    instructions: Vec<Instruction>,
    handlers: Vec<ExceptionHandler>,
    locals: Vec<SignatureLocalVariable>,
    callbacks: CallbackRegistry,
}

enum Flow {
    Next,
    Jump(usize),
    Return(Option<Value>),
    Throw(Value),
}

impl Evaluator {
    pub fn new(method: &SynthesizedMethod, callbacks: CallbackRegistry) -> Result<Self> {
        Self::from_body(&method.body(0)?, &method.locals, callbacks)
    }

    pub fn from_body(
        body: &[u8],
        locals: &[SignatureLocalVariable],
        callbacks: CallbackRegistry,
    ) -> Result<Self> {
        let decoded = decode_body(body, &mut CodeGenerator::new())?;
        Ok(Evaluator {
            instructions: decoded.instructions,
            handlers: decoded.header.exception_handlers,
            locals: locals.to_vec(),
            callbacks,
        })
    }

    /// Runs the method, turning an unhandled exception into an error
    pub fn run(&mut self, args: Vec<Value>) -> Result<Option<Value>> {
        match self.execute(args)? {
            Ok(value) => Ok(value),
            Err(exception) => Err(Error::Runtime(format!("Unhandled exception {exception:?}"))),
        }
    }

    /// Runs the method, returning either its result or the exception it threw
    pub fn execute(
        &mut self,
        args: Vec<Value>,
    ) -> Result<std::result::Result<Option<Value>, Value>> {
        let mut frame = Frame {
            args,
            locals: self.locals.iter().map(|local| Value::zero(&local.base)).collect(),
        };
        let mut stack = Vec::new();
        let mut pc = 0;

        for _ in 0..STEP_LIMIT {
            let Some(instruction) = self.instructions.get(pc) else {
                return Err(Error::Runtime(format!("Fell off the end at {pc}")));
            };
            match self.step(instruction, &mut frame, &mut stack)? {
                Flow::Next => pc += 1,
                Flow::Jump(target) => pc = target,
                Flow::Return(value) => return Ok(Ok(value)),
                Flow::Throw(exception) => match self.handler(instruction.offset) {
                    Some(target) => {
                        stack.clear();
                        stack.push(exception);
                        pc = target;
                    }
                    None => return Ok(Err(exception)),
                },
            }
        }
        Err(Error::Runtime("Step limit exceeded".to_string()))
    }

    fn index_of_offset(&self, offset: u32) -> Result<usize> {
        self.instructions
            .binary_search_by_key(&offset, |instruction| instruction.offset)
            .map_err(|_| Error::Runtime(format!("No instruction at offset {offset}")))
    }

    fn index_of_target(&self, target: &BranchTarget) -> Result<usize> {
        self.instructions
            .iter()
            .position(|instruction| target.is(instruction))
            .ok_or_else(|| Error::Runtime(format!("Unknown branch target {target:?}")))
    }

    fn handler(&self, offset: u32) -> Option<usize> {
        self.handlers
            .iter()
            .find(|handler| {
                handler.flags == ExceptionHandlerFlags::EXCEPTION
                    && handler.try_offset <= offset
                    && offset < handler.try_end()
            })
            .and_then(|handler| self.index_of_offset(handler.handler_offset).ok())
    }

    fn step(
        &self,
        instruction: &Instruction,
        frame: &mut Frame,
        stack: &mut Vec<Value>,
    ) -> Result<Flow> {
        let name = instruction.opcode.name();
        let base = name.strip_suffix(".s").unwrap_or(name);
        let pop = |stack: &mut Vec<Value>| {
            stack
                .pop()
                .ok_or_else(|| Error::Runtime(format!("Stack underflow at {instruction}")))
        };

        if let Some(value) = instruction.constant() {
            stack.push(if base == "ldc.i8" {
                Value::I8(value)
            } else {
                Value::I4(value as i32)
            });
            return Ok(Flow::Next);
        }

        match base {
            "nop" => {}
            "ldnull" => stack.push(Value::Null),
            "ldc.r8" | "ldc.r4" => stack.push(match instruction.operand {
                Operand::Float64(value) => Value::R8(value),
                Operand::Float32(value) => Value::R8(f64::from(value)),
                _ => Value::R8(0.0),
            }),
            "dup" => {
                let value = pop(stack)?;
                stack.push(value.clone());
                stack.push(value);
            }
            "pop" => {
                pop(stack)?;
            }
            _ if base.starts_with("ldarga") => {
                stack.push(Value::Ref(Place::Argument(argument(instruction)?)));
            }
            _ if base.starts_with("ldarg") => {
                let index = argument(instruction)?;
                stack.push(frame.load(&Value::Ref(Place::Argument(index))));
            }
            _ if base.starts_with("starg") => {
                let value = pop(stack)?;
                frame.store(&Value::Ref(Place::Argument(argument(instruction)?)), value);
            }
            _ if base.starts_with("ldloca") => {
                stack.push(Value::Ref(Place::Local(local(instruction)?)));
            }
            _ if base.starts_with("ldloc") => {
                let index = local(instruction)?;
                stack.push(frame.load(&Value::Ref(Place::Local(index))));
            }
            _ if base.starts_with("stloc") => {
                let value = pop(stack)?;
                frame.store(&Value::Ref(Place::Local(local(instruction)?)), value);
            }
            _ if base.starts_with("ldind") || base == "ldobj" => {
                let address = pop(stack)?;
                stack.push(frame.load(&address));
            }
            _ if base.starts_with("stind") => {
                let value = pop(stack)?;
                let address = pop(stack)?;
                frame.store(&address, value);
            }
            "initobj" => {
                let address = pop(stack)?;
                frame.store(&address, Value::Null);
            }
            "conv.i4" | "conv.u4" => {
                let value = pop(stack)?;
                stack.push(Value::I4(value.as_i4()));
            }
            "conv.i" | "conv.u" | "conv.i8" | "conv.u8" => {
                let value = pop(stack)?;
                stack.push(match value {
                    Value::I8(value) => Value::I8(value),
                    Value::R8(value) => Value::I8(value as i64),
                    other => Value::I8(i64::from(other.as_i4())),
                });
            }
            "neg" => {
                let value = pop(stack)?;
                stack.push(match value {
                    Value::I4(value) => Value::I4(value.wrapping_neg()),
                    Value::I8(value) => Value::I8(value.wrapping_neg()),
                    Value::R8(value) => Value::R8(-value),
                    other => return Err(Error::Runtime(format!("neg on {other:?}"))),
                });
            }
            "add" | "sub" | "mul" | "div" | "rem" | "and" | "or" | "xor" | "ceq" | "cgt"
            | "clt" => {
                let right = pop(stack)?;
                let left = pop(stack)?;
                stack.push(binary(base, &left, &right)?);
            }
            "br" | "leave" => {
                if base == "leave" {
                    stack.clear();
                }
                return Ok(Flow::Jump(self.target(instruction)?));
            }
            "brfalse" | "brtrue" => {
                let value = pop(stack)?;
                if value.is_true() == (base == "brtrue") {
                    return Ok(Flow::Jump(self.target(instruction)?));
                }
            }
            "beq" | "bne.un" | "bge" | "bgt" | "ble" | "blt" | "bge.un" | "bgt.un" | "ble.un"
            | "blt.un" => {
                let right = pop(stack)?;
                let left = pop(stack)?;
                let (left, right) = (numeric(&left), numeric(&right));
                let taken = match base.trim_end_matches(".un") {
                    "beq" => left == right,
                    "bne" => left != right,
                    "bge" => left >= right,
                    "bgt" => left > right,
                    "ble" => left <= right,
                    _ => left < right,
                };
                if taken {
                    return Ok(Flow::Jump(self.target(instruction)?));
                }
            }
            "throw" => return Ok(Flow::Throw(pop(stack)?)),
            "ret" => return Ok(Flow::Return(stack.pop())),
            "call" => {
                let Operand::Member(MemberRef::Method(token)) = &instruction.operand else {
                    return Err(Error::Runtime(format!("Unsupported call {instruction}")));
                };
                let Some((arity, callback)) = self.callbacks.callbacks.get(&token.value()) else {
                    return Err(Error::Runtime(format!("No callback for {token}")));
                };
                if stack.len() < *arity {
                    return Err(Error::Runtime(format!("Stack underflow calling {token}")));
                }
                let args = stack.split_off(stack.len() - arity);
                match callback(frame, &args) {
                    Ok(Some(value)) => stack.push(value),
                    Ok(None) => {}
                    Err(exception) => return Ok(Flow::Throw(exception)),
                }
            }
            _ => return Err(Error::Runtime(format!("Unsupported instruction {instruction}"))),
        }
        Ok(Flow::Next)
    }

    fn target(&self, instruction: &Instruction) -> Result<usize> {
        match &instruction.operand {
            Operand::Target(target) => self.index_of_target(target),
            other => Err(Error::Runtime(format!("Branch without target: {other:?}"))),
        }
    }
}

fn argument(instruction: &Instruction) -> Result<u16> {
    instruction
        .argument_index()
        .ok_or_else(|| Error::Runtime(format!("No argument index on {instruction}")))
}

fn local(instruction: &Instruction) -> Result<u16> {
    instruction
        .local_index()
        .ok_or_else(|| Error::Runtime(format!("No local index on {instruction}")))
}

fn numeric(value: &Value) -> f64 {
    match value {
        Value::I4(value) => f64::from(*value),
        Value::I8(value) => *value as f64,
        Value::R8(value) => *value,
        Value::Null => 0.0,
        _ => 1.0,
    }
}

fn binary(op: &str, left: &Value, right: &Value) -> Result<Value> {
    let compare = |result: bool| Value::I4(i32::from(result));
    Ok(match (left, right) {
        (Value::I4(a), Value::I4(b)) => match op {
            "add" => Value::I4(a.wrapping_add(*b)),
            "sub" => Value::I4(a.wrapping_sub(*b)),
            "mul" => Value::I4(a.wrapping_mul(*b)),
            "div" | "rem" if *b == 0 => {
                return Err(Error::Runtime("Division by zero".to_string()));
            }
            "div" => Value::I4(a.wrapping_div(*b)),
            "rem" => Value::I4(a.wrapping_rem(*b)),
            "and" => Value::I4(a & b),
            "or" => Value::I4(a | b),
            "xor" => Value::I4(a ^ b),
            "ceq" => compare(a == b),
            "cgt" => compare(a > b),
            _ => compare(a < b),
        },
        (Value::I8(a), Value::I8(b)) => match op {
            "add" => Value::I8(a.wrapping_add(*b)),
            "sub" => Value::I8(a.wrapping_sub(*b)),
            "mul" => Value::I8(a.wrapping_mul(*b)),
            "ceq" => compare(a == b),
            "cgt" => compare(a > b),
            "clt" => compare(a < b),
            _ => return Err(Error::Runtime(format!("Unsupported {op} on i8"))),
        },
        (left, right) if op == "ceq" => compare(left == right),
        (left, right) => {
            return Err(Error::Runtime(format!("Unsupported {op} on {left:?}, {right:?}")));
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test::method_body;

    #[test]
    fn arithmetic_and_branches() -> Result<()> {
        // ldarg.0 ldc.i4.s 10 bge.s +3 ldc.i4.1 br.s +1 ldc.i4.2 ret
        let body = method_body(&[0x02, 0x1F, 0x0A, 0x2F, 0x03, 0x17, 0x2B, 0x01, 0x18, 0x2A], 2);
        let mut evaluator = Evaluator::from_body(&body, &[], CallbackRegistry::new())?;
        assert_eq!(evaluator.run(vec![Value::I4(3)])?, Some(Value::I4(1)));
        assert_eq!(evaluator.run(vec![Value::I4(30)])?, Some(Value::I4(2)));
        Ok(())
    }

    #[test]
    fn unknown_callback_is_an_error() -> Result<()> {
        let body = method_body(&[0x28, 0x01, 0x00, 0x00, 0x06, 0x2A], 1);
        let mut evaluator = Evaluator::from_body(&body, &[], CallbackRegistry::new())?;
        assert!(matches!(evaluator.run(Vec::new()), Err(Error::Runtime(_))));
        Ok(())
    }
}
