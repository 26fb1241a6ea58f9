use thiserror::Error;

use crate::{assembly::Label, metadata::method::MethodKey};

macro_rules! malformed_error {
    // Single string version
    ($msg:expr) => {
        crate::Error::MalformedBody {
            message: $msg.to_string(),
            file: file!(),
            line: line!(),
        }
    };

    // Format string with arguments version
    ($fmt:expr, $($arg:tt)*) => {
        crate::Error::MalformedBody {
            message: format!($fmt, $($arg)*),
            file: file!(),
            line: line!(),
        }
    };
}

macro_rules! out_of_bounds_error {
    () => {
        crate::Error::OutOfBounds {
            file: file!(),
            line: line!(),
        }
    };
}

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// Every public operation that can fail returns this type. All variants are fatal for the single
/// patch or unpatch call that produced them: nothing is retried internally, and a failure never
/// leaves a half-written entry point behind, since the entry point is only touched after the
/// complete replacement and trampoline frame exist.
///
/// # Error Categories
///
/// ## Instruction Codec
/// - [`Error::MalformedBody`] - Truncated or invalid instruction stream or method header
/// - [`Error::OutOfBounds`] - A read or write went past the end of a buffer
/// - [`Error::UnresolvedOperand`] - An instruction needs an operand it does not carry
/// - [`Error::UndefinedLabel`] - A branch names a label no instruction carries
///
/// ## Synthesis
/// - [`Error::SignatureMismatch`] - A callback's declared shape does not fit the original
/// - [`Error::UnknownTranspiler`] - A transpiler entry has no transform behind it
///
/// ## Trampolines
/// - [`Error::FormatError`] - A detour exists but its frame header is foreign or corrupt
/// - [`Error::AddressRangeError`] - A relative displacement does not fit its encoding
/// - [`Error::Memory`] - Mapping or reprotecting executable memory failed
///
/// ## Registry
/// - [`Error::NotPatched`] - The target method has no installed patches
/// - [`Error::Serialization`] - The stored patch payload could not be (de)serialized
/// - [`Error::LockError`] - The registry lock was poisoned
/// - [`Error::Runtime`] - The host runtime refused a request
///
/// # Examples
///
/// ```rust
/// use dotpatch::{assembly::decode_stream, Error};
///
/// // `br` with a truncated 4-byte offset
/// match decode_stream(&[0x38, 0x00], &mut Default::default()) {
///     Err(Error::MalformedBody { message, .. }) => println!("bad body: {message}"),
///     Err(Error::OutOfBounds { .. }) => println!("truncated"),
///     other => println!("{other:?}"),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The instruction stream or method header is damaged and could not be decoded.
    ///
    /// Raised for unknown opcodes, reserved opcode slots, branch offsets that do not land on an
    /// instruction start and headers that are neither tiny nor fat. The error carries the source
    /// location where the malformation was detected for debugging purposes.
    ///
    /// # Fields
    ///
    /// * `message` - Detailed description of what was malformed
    /// * `file` - Source file where the error was detected
    /// * `line` - Source line where the error was detected
    #[error("Malformed body - {file}:{line}: {message}")]
    MalformedBody {
        /// The message to be printed for the MalformedBody error
        message: String,
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An out of bound access was attempted.
    ///
    /// This is a safety check that prevents reads and writes past the end of code buffers,
    /// method bodies and executable regions.
    #[error("Out of Bound access would have occurred! - {file}:{line}")]
    OutOfBounds {
        /// The source file in which this error occured
        file: &'static str,
        /// The source line in which this error occured
        line: u32,
    },

    /// An instruction requires an operand but carries none, or carries one of the wrong shape.
    ///
    /// Raised by the encoder. Also used when a branch references an instruction id that is not
    /// part of the list being encoded.
    #[error("Unresolved operand - {0}")]
    UnresolvedOperand(String),

    /// A branch references a label which is not attached to any instruction.
    #[error("Undefined label - {0}")]
    UndefinedLabel(Label),

    /// A callback declares a parameter or return type that does not fit the original method.
    ///
    /// Examples are unknown parameter names, `__instance` on a static method, a before-callback
    /// that returns something other than `bool` or an after-callback with a return value.
    #[error("Signature mismatch - {0}")]
    SignatureMismatch(String),

    /// The code reachable from a patched entry point does not carry a valid trampoline frame.
    ///
    /// This indicates a foreign detour, or memory that was overwritten after the original
    /// installation.
    #[error("Invalid trampoline frame - {0}")]
    FormatError(String),

    /// A jump displacement does not fit the encoding selected for the target architecture.
    #[error("Jump from 0x{from:x} to 0x{to:x} does not fit the displacement encoding")]
    AddressRangeError {
        /// Address the displacement is relative to
        from: usize,
        /// Address the jump should reach
        to: usize,
    },

    /// A transpiler entry names a callback for which no transform was registered.
    #[error("No transform registered for transpiler {0}")]
    UnknownTranspiler(MethodKey),

    /// A transpiler id is already registered by another owner.
    ///
    /// Transforms are shared by every method whose patches name the id, so accepting the new
    /// one would silently change what the other owner's patches do.
    #[error("Transpiler {id} is already registered by {owner}")]
    TranspilerConflict {
        /// The contested transpiler id
        id: MethodKey,
        /// Owner of the registered transform
        owner: String,
    },

    /// An unpatch or introspection call targets a method without installed patches.
    #[error("Method {0} is not patched")]
    NotPatched(MethodKey),

    /// Mapping, reprotecting or flushing executable memory failed.
    #[error("Executable memory error - {0}")]
    Memory(#[from] std::io::Error),

    /// The patch payload could not be serialized or deserialized.
    #[error("Payload serialization failed - {0}")]
    Serialization(String),

    /// The host runtime could not describe, compile or locate a method.
    #[error("Runtime error - {0}")]
    Runtime(String),

    /// Failed to lock target.
    ///
    /// Raised when the registry mutex was poisoned by a panic on another thread.
    #[error("Failed to lock target")]
    LockError,

    /// This operation is not supported on the current platform.
    #[error("This operation is not supported on the current platform")]
    NotSupported,
}

impl From<bincode::Error> for Error {
    fn from(error: bincode::Error) -> Self {
        Error::Serialization(error.to_string())
    }
}
