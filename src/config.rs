//! Configuration for the patcher.

use crate::{trampoline::Arch, Error, Result};

/// Configuration for a [`crate::patch::Patcher`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PatcherConfig {
    /// Instruction set of the entry points being detoured (default: the host architecture).
    ///
    /// Only needs to be set when the runtime hands out code for a different architecture than
    /// the one this crate was compiled for, for example when patching emulated code.
    pub arch: Option<Arch>,

    /// Log the listing of every synthesized replacement at debug level (default: false).
    pub dump_listing: bool,

    /// Read the payload back through the entry point after every install and compare it to
    /// what was written (default: true).
    pub verify_payload: bool,
}

impl Default for PatcherConfig {
    fn default() -> Self {
        Self {
            arch: None,
            dump_listing: false,
            verify_payload: true,
        }
    }
}

impl PatcherConfig {
    /// Creates a new configuration with default settings.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the target architecture.
    #[must_use]
    pub fn with_arch(mut self, arch: Arch) -> Self {
        self.arch = Some(arch);
        self
    }

    /// Enables or disables listing dumps.
    #[must_use]
    pub fn with_dump_listing(mut self, enabled: bool) -> Self {
        self.dump_listing = enabled;
        self
    }

    /// Enables or disables payload verification.
    #[must_use]
    pub fn with_verify_payload(mut self, enabled: bool) -> Self {
        self.verify_payload = enabled;
        self
    }

    /// The configured architecture, falling back to the host.
    ///
    /// # Errors
    /// Returns [`crate::Error::NotSupported`] if none is configured and the host has no
    /// jump encoding.
    pub fn target_arch(&self) -> Result<Arch> {
        self.arch.or_else(Arch::host).ok_or(Error::NotSupported)
    }
}
