use std::{
    collections::HashMap,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
};

use uguid::Guid;

use crate::{
    metadata::{
        method::{MethodDescriptor, MethodKey},
        signatures::{SignatureParameter, TypeSignature},
        token::Token,
    },
    patch::{MethodRuntime, SynthesizedMethod},
    test::{method_body, CallbackRegistry, Evaluator, Value},
    trampoline::{Arch, CodeArena, ExecutableBuffer},
    Error, Result,
};

/// Token of `static int Add(int a, int b) => a + b;`
pub const ADD_METHOD: u32 = 0x0600_0001;

/// `mov eax, 1; ret`
pub const NATIVE_STUB: [u8; 6] = [0xB8, 0x01, 0x00, 0x00, 0x00, 0xC3];

/// Exception type handed out to the synthesizer
pub const EXCEPTION_TYPE: u32 = 0x0100_0001;

struct MockMethod {
    descriptor: MethodDescriptor,
    body: Vec<u8>,
    entry: ExecutableBuffer,
}

/// A runtime whose methods live in arena memory and whose compiler only remembers what it
/// was given. Entry points are x64 code, so detours must be installed with [`Arch::X64`].
pub struct MockRuntime {
    methods: HashMap<MethodKey, MockMethod>,
    compiled: Mutex<HashMap<usize, SynthesizedMethod>>,
    compilations: AtomicUsize,
}

impl MockRuntime {
    pub fn new() -> Result<Self> {
        let mut runtime = MockRuntime {
            methods: HashMap::new(),
            compiled: Mutex::new(HashMap::new()),
            compilations: AtomicUsize::new(0),
        };
        runtime.add(
            MethodDescriptor {
                key: MethodKey::new(Guid::ZERO, Token::new(ADD_METHOD)),
                name: "Add".to_string(),
                has_this: false,
                params: vec![
                    SignatureParameter::new("a", TypeSignature::I4),
                    SignatureParameter::new("b", TypeSignature::I4),
                ],
                return_type: TypeSignature::I4,
                locals: Vec::new(),
            },
            method_body(&[0x02, 0x03, 0x58, 0x2A], 2),
        )?;
        Ok(runtime)
    }

    /// Registers a method with a fresh native stub as entry point
    pub fn add(&mut self, descriptor: MethodDescriptor, body: Vec<u8>) -> Result<()> {
        let mut entry = CodeArena::global().allocate(32, 16)?;
        entry.write_bytes_at(0, &NATIVE_STUB)?;
        self.methods.insert(
            descriptor.key,
            MockMethod {
                descriptor,
                body,
                entry,
            },
        );
        Ok(())
    }

    fn method(&self, key: &MethodKey) -> Result<&MockMethod> {
        self.methods
            .get(key)
            .ok_or_else(|| Error::Runtime(format!("Unknown method {key}")))
    }

    pub fn entry(&self, key: &MethodKey) -> Result<usize> {
        Ok(self.method(key)?.entry.address())
    }

    pub fn entry_bytes(&self, key: &MethodKey) -> Result<Vec<u8>> {
        self.method(key)?.entry.read_bytes_at(0, 16)
    }

    /// Follows the detour at `entry` through its frame to the replacement
    pub fn resolve(&self, entry: usize) -> Result<Option<usize>> {
        let code = unsafe { ExecutableBuffer::from_raw(entry, Arch::X64.jump_size())? };
        let Some(frame) = Arch::X64.decode_jump(&code.read_bytes_at(0, 12)?, entry) else {
            return Ok(None);
        };
        let jump = unsafe { ExecutableBuffer::from_raw(frame, Arch::X64.jump_size())? };
        Ok(Arch::X64.decode_jump(&jump.read_bytes_at(0, 12)?, frame))
    }

    /// Calls `key` the way the process would: through its entry point
    pub fn invoke(
        &self,
        key: &MethodKey,
        callbacks: CallbackRegistry,
        args: Vec<Value>,
    ) -> Result<Option<Value>> {
        let method = self.method(key)?;
        match self.resolve(method.entry.address())? {
            Some(replacement) => {
                let compiled = self.compiled.lock().unwrap();
                let synthesized = compiled
                    .get(&replacement)
                    .ok_or_else(|| Error::Runtime(format!("Nothing compiled at {replacement:x}")))?;
                Evaluator::new(synthesized, callbacks)?.run(args)
            }
            None => Evaluator::from_body(&method.body, &method.descriptor.locals, callbacks)?
                .run(args),
        }
    }

    pub fn compilations(&self) -> usize {
        self.compilations.load(Ordering::SeqCst)
    }
}

unsafe impl MethodRuntime for MockRuntime {
    fn describe(&self, method: &MethodKey) -> Result<MethodDescriptor> {
        Ok(self.method(method)?.descriptor.clone())
    }

    fn method_body(&self, method: &MethodKey) -> Result<Vec<u8>> {
        Ok(self.method(method)?.body.clone())
    }

    fn entry_point(&self, method: &MethodKey) -> Result<usize> {
        self.entry(method)
    }

    fn compile(&self, method: &SynthesizedMethod) -> Result<usize> {
        let mut code = CodeArena::global().allocate(16, 16)?;
        code.write_bytes_at(0, &[0xB8, 0x02, 0x00, 0x00, 0x00, 0xC3])?;
        self.compilations.fetch_add(1, Ordering::SeqCst);
        self.compiled
            .lock()
            .unwrap()
            .insert(code.address(), method.clone());
        Ok(code.address())
    }

    fn exception_type(&self) -> Token {
        Token::new(EXCEPTION_TYPE)
    }
}
