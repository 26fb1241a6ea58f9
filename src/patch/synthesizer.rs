//! Replacement method synthesis.
//!
//! A replacement has the signature of the original and runs, in order:
//!
//! 1. **Init** - `__runOriginal` is set to `true`, the result, state and exception locals are
//!    zeroed
//! 2. **Prefixes** - each prefix is skipped once `__runOriginal` is `false`; a prefix returning
//!    `bool` stores its result into `__runOriginal`
//! 3. **Original** - the decoded and transformed original body, guarded by `__runOriginal` when
//!    a prefix can clear it. Every `ret` is turned into a store to the result local and a jump
//!    past the body
//! 4. **Postfixes** - always run
//! 5. **Finalizers** - when present, steps 2 to 4 run inside a catch-all region. The caught
//!    exception is handed to the finalizers and rethrown afterwards unless a finalizer replaced
//!    it with `null`
//! 6. **Return** - the result local, or nothing for `void` originals
//!
//! Callbacks receive values by declaring parameters with special names:
//!
//! | Name             | Value                                              |
//! |------------------|----------------------------------------------------|
//! | `__instance`     | `this` of an instance original                     |
//! | `__result`       | the result local, by value or by reference         |
//! | `__state`        | a local shared by all callbacks of the same owner  |
//! | `__runOriginal`  | whether the original runs or ran                   |
//! | `__exception`    | the caught exception, finalizers only              |
//! | `__0`, `__1`, .. | the original's parameter at that position          |
//! | any other name   | the original's parameter of that name              |
//!
//! Any other parameter, or a return type that does not fit the callback's role, is a
//! [`crate::Error::SignatureMismatch`].

use std::collections::HashMap;

use tracing::debug;

use crate::{
    assembly::{
        decode_body, encode, opcodes, CodeGenerator, ExceptionBlock, Instruction, Label,
        MemberRef, Operand,
    },
    metadata::{
        method::{write_body, ExceptionHandler, MethodDescriptor, MethodKey},
        signatures::{SignatureLocalVariable, SignatureParameter, TypeSignature},
        token::Token,
    },
    patch::{CallbackId, PatchEntry, PatchKind, PatchSet, TransformChain, Transpiler},
    Error, Result,
};

/// A compiled-ready replacement method.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizedMethod {
    /// The method this replaces
    pub original: MethodKey,
    /// Name for the runtime to give the replacement
    pub name: String,
    /// `this` is passed as argument 0
    pub has_this: bool,
    /// Parameters, identical to the original's
    pub params: Vec<SignatureParameter>,
    /// Return type, identical to the original's
    pub return_type: TypeSignature,
    /// Locals of the original followed by the locals of the replacement
    pub locals: Vec<SignatureLocalVariable>,
    /// Evaluation stack depth
    pub max_stack: u16,
    /// Encoded instruction stream
    pub code: Vec<u8>,
    /// Exception clauses of `code`
    pub exception_handlers: Vec<ExceptionHandler>,
}

impl SynthesizedMethod {
    /// The method body with header, for a runtime that registered [`SynthesizedMethod::locals`]
    /// under `local_var_sig_token`.
    ///
    /// # Errors
    /// Returns [`crate::Error::MalformedBody`] if the code is too large for a method body.
    pub fn body(&self, local_var_sig_token: u32) -> Result<Vec<u8>> {
        write_body(
            &self.code,
            self.max_stack,
            local_var_sig_token,
            true,
            &self.exception_handlers,
        )
    }

    /// Disassembly of the replacement, one instruction per line.
    ///
    /// # Errors
    /// Only fails if the replacement itself is not decodable.
    pub fn listing(&self) -> Result<String> {
        let decoded = decode_body(&self.body(0)?, &mut CodeGenerator::new())?;
        let lines: Vec<String> = decoded
            .instructions
            .iter()
            .map(ToString::to_string)
            .collect();
        Ok(lines.join("\n"))
    }
}

/// What happens to the value a callback returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReturnUse {
    /// `void`
    Nothing,
    /// Stored into `__runOriginal`
    RunOriginal,
    /// Stored into `__exception`
    Exception,
}

/// How an argument of the original is passed to a callback.
#[derive(Debug, Clone, PartialEq, Eq)]
enum ArgumentLoad {
    Value,
    Address,
    Dereference(TypeSignature),
}

/// One value pushed before a callback call.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Injection {
    Instance,
    Local { index: u16, by_ref: bool },
    Argument { index: u16, load: ArgumentLoad },
}

/// A validated callback invocation.
#[derive(Debug, Clone)]
struct CallPlan {
    token: Token,
    injections: Vec<Injection>,
    returns: ReturnUse,
}

/// Locals the replacement adds to the original's.
#[derive(Debug, Default)]
struct Slots {
    run_original: u16,
    result: Option<u16>,
    exception: Option<u16>,
    states: HashMap<String, (u16, TypeSignature)>,
}

/// Collects instructions and binds pending labels and markers to the next one pushed.
#[derive(Debug, Default)]
struct Emitter {
    code: Vec<Instruction>,
    labels: Vec<Label>,
    blocks: Vec<ExceptionBlock>,
}

impl Emitter {
    fn push(&mut self, mut instruction: Instruction) {
        if !self.labels.is_empty() {
            let mut labels = std::mem::take(&mut self.labels);
            labels.append(&mut instruction.labels);
            instruction.labels = labels;
        }
        if !self.blocks.is_empty() {
            let mut blocks = std::mem::take(&mut self.blocks);
            blocks.append(&mut instruction.blocks);
            instruction.blocks = blocks;
        }
        self.code.push(instruction);
    }

    fn mark(&mut self, label: Label) {
        self.labels.push(label);
    }

    fn begin(&mut self, block: ExceptionBlock) {
        self.blocks.push(block);
    }

    fn end_block(&mut self) -> Result<()> {
        match self.code.last_mut() {
            Some(last) => {
                last.blocks.push(ExceptionBlock::End);
                Ok(())
            }
            None => Err(malformed_error!("Exception block closed before any instruction")),
        }
    }

    fn finish(self) -> Result<Vec<Instruction>> {
        if !self.labels.is_empty() || !self.blocks.is_empty() {
            return Err(malformed_error!(
                "Labels or exception markers left without an instruction"
            ));
        }
        Ok(self.code)
    }
}

/// Builds the replacement of one original method from its pristine body and a [`PatchSet`].
///
/// # Examples
///
/// ```rust,ignore
/// let replacement = ReplacementSynthesizer::new(&descriptor, &body)
///     .exception_type(runtime.exception_type())
///     .build(&set, &transpilers)?;
/// let entry = runtime.compile(&replacement)?;
/// ```
pub struct ReplacementSynthesizer<'a> {
    original: &'a MethodDescriptor,
    body: &'a [u8],
    exception_type: Token,
}

impl<'a> ReplacementSynthesizer<'a> {
    /// Prepares synthesis for `original`, whose raw body including header is `body`
    #[must_use]
    pub fn new(original: &'a MethodDescriptor, body: &'a [u8]) -> Self {
        ReplacementSynthesizer {
            original,
            body,
            exception_type: Token::default(),
        }
    }

    /// Sets the type caught around the body when finalizers are present
    #[must_use]
    pub fn exception_type(mut self, exception_type: Token) -> Self {
        self.exception_type = exception_type;
        self
    }

    /// Builds the replacement.
    ///
    /// `transpilers` maps the callback of every transpiler entry in `set` to its transform.
    ///
    /// # Errors
    ///
    /// - [`crate::Error::SignatureMismatch`] if a callback does not fit the original
    /// - [`crate::Error::UnknownTranspiler`] if a transpiler entry has no transform
    /// - any error of decoding the original, running a transform or encoding the result
    pub fn build(
        &self,
        set: &PatchSet,
        transpilers: &HashMap<CallbackId, Transpiler>,
    ) -> Result<SynthesizedMethod> {
        let original = self.original;
        let mut generator = CodeGenerator::with_locals(original.locals.clone());
        let decoded = decode_body(self.body, &mut generator)?;

        let chain = set
            .transpilers
            .iter()
            .map(|entry| {
                transpilers
                    .get(&entry.callback.id)
                    .cloned()
                    .ok_or(Error::UnknownTranspiler(entry.callback.id))
            })
            .collect::<Result<TransformChain>>()?;
        let body = chain.apply(decoded.instructions, &mut generator, original)?;

        let mut slots = Slots {
            run_original: generator.declare_local(TypeSignature::Boolean),
            result: (!original.return_type.is_void())
                .then(|| generator.declare_local(original.return_type.clone())),
            exception: (!set.finalizers.is_empty())
                .then(|| generator.declare_local(TypeSignature::Class(self.exception_type))),
            states: HashMap::new(),
        };

        let mut plan = |kind, entries: &[PatchEntry]| {
            self.plan_all(kind, entries, &mut slots, &mut generator)
        };
        let prefixes = plan(PatchKind::Prefix, &set.prefixes)?;
        let postfixes = plan(PatchKind::Postfix, &set.postfixes)?;
        let finalizers = plan(PatchKind::Finalizer, &set.finalizers)?;

        let mut emitter = Emitter::default();
        self.emit_init(&slots, &mut emitter, &mut generator);

        let after_original = generator.define_label();
        if !finalizers.is_empty() {
            emitter.begin(ExceptionBlock::BeginTry);
        }

        for plan in &prefixes {
            let skip = generator.define_label();
            emitter.push(generator.ldloc(slots.run_original));
            emitter.push(generator.emit(opcodes::BRFALSE, Operand::Target(skip.into())));
            emit_call(plan, &slots, &mut emitter, &mut generator);
            emitter.mark(skip);
        }

        if prefixes.iter().any(|p| p.returns == ReturnUse::RunOriginal) {
            emitter.push(generator.ldloc(slots.run_original));
            let skip_original = Operand::Target(after_original.into());
            emitter.push(generator.emit(opcodes::BRFALSE, skip_original));
        }
        for instruction in body {
            if instruction.opcode == opcodes::RET {
                let result = slots.result;
                replace_return(instruction, result, after_original, &mut emitter, &mut generator);
            } else {
                emitter.push(instruction);
            }
        }
        emitter.mark(after_original);

        for plan in &postfixes {
            emit_call(plan, &slots, &mut emitter, &mut generator);
        }

        if let Some(exception) = slots.exception {
            let handled = generator.define_label();
            emitter.push(generator.emit(opcodes::LEAVE, Operand::Target(handled.into())));
            emitter.begin(ExceptionBlock::BeginCatch(self.exception_type));
            emitter.push(generator.stloc(exception));
            emitter.push(generator.emit(opcodes::LEAVE, Operand::Target(handled.into())));
            emitter.end_block()?;
            emitter.mark(handled);

            for plan in &finalizers {
                emit_call(plan, &slots, &mut emitter, &mut generator);
            }

            let done = generator.define_label();
            emitter.push(generator.ldloc(exception));
            emitter.push(generator.emit(opcodes::BRFALSE, Operand::Target(done.into())));
            emitter.push(generator.ldloc(exception));
            emitter.push(generator.emit(opcodes::THROW, Operand::None));
            emitter.mark(done);
        }

        if let Some(result) = slots.result {
            emitter.push(generator.ldloc(result));
        }
        emitter.push(generator.emit(opcodes::RET, Operand::None));

        let instructions = emitter.finish()?;
        let encoded = encode(&instructions, &mut generator)?;

        let original_stack = u16::try_from(decoded.header.max_stack).unwrap_or(u16::MAX);
        let call_stack = prefixes
            .iter()
            .chain(&postfixes)
            .chain(&finalizers)
            .map(|plan| u16::try_from(plan.injections.len()).unwrap_or(u16::MAX))
            .max()
            .unwrap_or(0);
        let max_stack = original_stack
            .max(call_stack)
            .max(2)
            .saturating_add(generator.reserved_stack());

        debug!(
            method = %original.key,
            prefixes = prefixes.len(),
            postfixes = postfixes.len(),
            transpilers = chain.len(),
            finalizers = finalizers.len(),
            code_size = encoded.code.len(),
            max_stack,
            "Synthesized replacement"
        );

        Ok(SynthesizedMethod {
            original: original.key,
            name: format!("{}_Patch", original.name),
            has_this: original.has_this,
            params: original.params.clone(),
            return_type: original.return_type.clone(),
            locals: generator.locals().to_vec(),
            max_stack,
            code: encoded.code,
            exception_handlers: encoded.exception_handlers,
        })
    }

    fn emit_init(&self, slots: &Slots, emitter: &mut Emitter, generator: &mut CodeGenerator) {
        emitter.push(generator.ldc_i4(1));
        emitter.push(generator.stloc(slots.run_original));

        if let Some(result) = slots.result {
            zero_local(&self.original.return_type, result, emitter, generator);
        }

        let mut states: Vec<&(u16, TypeSignature)> = slots.states.values().collect();
        states.sort_by_key(|(index, _)| *index);
        for (index, ty) in states {
            zero_local(ty, *index, emitter, generator);
        }

        if let Some(exception) = slots.exception {
            emitter.push(generator.emit(opcodes::LDNULL, Operand::None));
            emitter.push(generator.stloc(exception));
        }
    }

    fn plan_all(
        &self,
        kind: PatchKind,
        entries: &[PatchEntry],
        slots: &mut Slots,
        generator: &mut CodeGenerator,
    ) -> Result<Vec<CallPlan>> {
        entries
            .iter()
            .map(|entry| self.plan(kind, entry, slots, generator))
            .collect()
    }

    fn plan(
        &self,
        kind: PatchKind,
        entry: &PatchEntry,
        slots: &mut Slots,
        generator: &mut CodeGenerator,
    ) -> Result<CallPlan> {
        let signature = &entry.callback.signature;
        let returns = match (kind, &signature.return_type) {
            (_, TypeSignature::Void) => ReturnUse::Nothing,
            (PatchKind::Prefix, TypeSignature::Boolean) => ReturnUse::RunOriginal,
            (PatchKind::Finalizer, ty) if ty.is_reference() => ReturnUse::Exception,
            (_, ty) => {
                return Err(self.mismatch(kind, entry, format!("cannot return {ty}")));
            }
        };

        let injections = signature
            .params
            .iter()
            .map(|param| self.injection(kind, entry, param, slots, generator))
            .collect::<Result<Vec<_>>>()?;

        Ok(CallPlan {
            token: entry.callback.token,
            injections,
            returns,
        })
    }

    fn injection(
        &self,
        kind: PatchKind,
        entry: &PatchEntry,
        param: &SignatureParameter,
        slots: &mut Slots,
        generator: &mut CodeGenerator,
    ) -> Result<Injection> {
        let original = self.original;
        match param.name.as_str() {
            "__instance" => {
                if !original.has_this {
                    return Err(self.mismatch(kind, entry, "__instance on a static method"));
                }
                Ok(Injection::Instance)
            }
            "__result" => {
                let Some(index) = slots.result else {
                    return Err(self.mismatch(kind, entry, "__result on a void method"));
                };
                if !param.base.accepts(&original.return_type) {
                    return Err(self.mismatch(
                        kind,
                        entry,
                        format!(
                            "__result declared as {} but the method returns {}",
                            param.base, original.return_type
                        ),
                    ));
                }
                Ok(Injection::Local {
                    index,
                    by_ref: param.by_ref,
                })
            }
            "__state" => {
                if kind == PatchKind::Prefix && !param.by_ref {
                    return Err(self.mismatch(kind, entry, "__state must be passed by reference"));
                }
                let (index, ty) = slots
                    .states
                    .entry(entry.owner.clone())
                    .or_insert_with(|| {
                        (generator.declare_local(param.base.clone()), param.base.clone())
                    })
                    .clone();
                if ty != param.base {
                    return Err(self.mismatch(
                        kind,
                        entry,
                        format!("__state declared as {} but {} elsewhere", param.base, ty),
                    ));
                }
                Ok(Injection::Local {
                    index,
                    by_ref: param.by_ref,
                })
            }
            "__runOriginal" => {
                if param.by_ref || param.base != TypeSignature::Boolean {
                    return Err(self.mismatch(kind, entry, "__runOriginal must be a bool value"));
                }
                Ok(Injection::Local {
                    index: slots.run_original,
                    by_ref: false,
                })
            }
            "__exception" => {
                let Some(index) = slots.exception.filter(|_| kind == PatchKind::Finalizer) else {
                    return Err(self.mismatch(kind, entry, "__exception outside of a finalizer"));
                };
                if param.by_ref || !param.base.is_reference() {
                    return Err(self.mismatch(
                        kind,
                        entry,
                        "__exception must be an exception value",
                    ));
                }
                Ok(Injection::Local {
                    index,
                    by_ref: false,
                })
            }
            name => {
                let position = name
                    .strip_prefix("__")
                    .and_then(|index| index.parse::<usize>().ok());
                let declared = match position {
                    Some(position) => original.params.get(position).map(|p| (position, p)),
                    None => original.param(name),
                };
                let Some((position, declared)) = declared else {
                    return Err(self.mismatch(
                        kind,
                        entry,
                        format!("{} has no parameter {}", original.name, name),
                    ));
                };
                self.argument(kind, entry, position, declared, param)
            }
        }
    }

    fn argument(
        &self,
        kind: PatchKind,
        entry: &PatchEntry,
        position: usize,
        declared: &SignatureParameter,
        requested: &SignatureParameter,
    ) -> Result<Injection> {
        if declared.base.is_void() || !requested.base.accepts(&declared.base) {
            return Err(self.mismatch(
                kind,
                entry,
                format!(
                    "{} declared as {} but the method takes {}",
                    requested.name, requested.base, declared.base
                ),
            ));
        }

        let load = match (requested.by_ref, declared.by_ref) {
            (true, false) => ArgumentLoad::Address,
            (false, true) => ArgumentLoad::Dereference(declared.base.clone()),
            _ => ArgumentLoad::Value,
        };
        Ok(Injection::Argument {
            index: self.original.argument_index(position),
            load,
        })
    }

    fn mismatch(&self, kind: PatchKind, entry: &PatchEntry, reason: impl AsRef<str>) -> Error {
        Error::SignatureMismatch(format!(
            "{} {} of {} patching {}: {}",
            kind,
            entry.callback.id,
            entry.owner,
            self.original.name,
            reason.as_ref()
        ))
    }
}

fn emit_call(
    plan: &CallPlan,
    slots: &Slots,
    emitter: &mut Emitter,
    generator: &mut CodeGenerator,
) {
    for injection in &plan.injections {
        match injection {
            Injection::Instance => emitter.push(generator.ldarg(0)),
            Injection::Local { index, by_ref } => {
                if *by_ref {
                    emitter.push(generator.ldloca(*index));
                } else {
                    emitter.push(generator.ldloc(*index));
                }
            }
            Injection::Argument { index, load } => match load {
                ArgumentLoad::Value => emitter.push(generator.ldarg(*index)),
                ArgumentLoad::Address => emitter.push(generator.ldarga(*index)),
                ArgumentLoad::Dereference(ty) => {
                    emitter.push(generator.ldarg(*index));
                    emitter.push(load_indirect(ty, generator));
                }
            },
        }
    }

    let call = Operand::Member(MemberRef::Method(plan.token));
    emitter.push(generator.emit(opcodes::CALL, call));

    match plan.returns {
        ReturnUse::Nothing => {}
        ReturnUse::RunOriginal => emitter.push(generator.stloc(slots.run_original)),
        ReturnUse::Exception => {
            if let Some(exception) = slots.exception {
                emitter.push(generator.stloc(exception));
            }
        }
    }
}

/// Loads the value behind a managed pointer of type `ty`
fn load_indirect(ty: &TypeSignature, generator: &mut CodeGenerator) -> Instruction {
    let opcode = match ty {
        TypeSignature::I1 => opcodes::LDIND_I1,
        TypeSignature::U1 | TypeSignature::Boolean => opcodes::LDIND_U1,
        TypeSignature::I2 => opcodes::LDIND_I2,
        TypeSignature::U2 | TypeSignature::Char => opcodes::LDIND_U2,
        TypeSignature::I4 => opcodes::LDIND_I4,
        TypeSignature::U4 => opcodes::LDIND_U4,
        TypeSignature::I8 | TypeSignature::U8 => opcodes::LDIND_I8,
        TypeSignature::R4 => opcodes::LDIND_R4,
        TypeSignature::R8 => opcodes::LDIND_R8,
        TypeSignature::I | TypeSignature::U => opcodes::LDIND_I,
        TypeSignature::ValueType(token) => {
            return generator.emit(opcodes::LDOBJ, Operand::Member(MemberRef::Type(*token)));
        }
        _ => opcodes::LDIND_REF,
    };
    generator.emit(opcode, Operand::None)
}

/// Stores the default value of `ty` into local `index`
fn zero_local(
    ty: &TypeSignature,
    index: u16,
    emitter: &mut Emitter,
    generator: &mut CodeGenerator,
) {
    let value = match ty {
        TypeSignature::Void => return,
        TypeSignature::ValueType(token) => {
            emitter.push(generator.ldloca(index));
            let ty = Operand::Member(MemberRef::Type(*token));
            emitter.push(generator.emit(opcodes::INITOBJ, ty));
            return;
        }
        ty if ty.is_reference() => generator.emit(opcodes::LDNULL, Operand::None),
        TypeSignature::I8 | TypeSignature::U8 => {
            generator.emit(opcodes::LDC_I8, Operand::Int64(0))
        }
        TypeSignature::R4 => generator.emit(opcodes::LDC_R4, Operand::Float32(0.0)),
        TypeSignature::R8 => generator.emit(opcodes::LDC_R8, Operand::Float64(0.0)),
        TypeSignature::I | TypeSignature::U => {
            emitter.push(generator.ldc_i4(0));
            generator.emit(opcodes::CONV_I, Operand::None)
        }
        _ => generator.ldc_i4(0),
    };
    emitter.push(value);
    emitter.push(generator.stloc(index));
}

/// Turns a `ret` of the original into a store of the result and a jump past the body.
///
/// The first replacement instruction takes over identity, labels and opening markers of the
/// `ret`, so branches to it stay valid; closing markers move to the last one.
fn replace_return(
    ret: Instruction,
    result: Option<u16>,
    after_original: Label,
    emitter: &mut Emitter,
    generator: &mut CodeGenerator,
) {
    let (ends, begins): (Vec<_>, Vec<_>) = ret
        .blocks
        .into_iter()
        .partition(|block| *block == ExceptionBlock::End);

    let mut replacement = Vec::with_capacity(2);
    if let Some(result) = result {
        replacement.push(generator.stloc(result));
    }
    replacement.push(generator.emit(opcodes::BR, Operand::Target(after_original.into())));

    if let Some(first) = replacement.first_mut() {
        first.id = ret.id;
        first.offset = ret.offset;
        first.labels = ret.labels;
        first.blocks = begins;
    }
    if let Some(last) = replacement.last_mut() {
        last.blocks.extend(ends);
    }

    for instruction in replacement {
        emitter.push(instruction);
    }
}
