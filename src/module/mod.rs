//! # Module System
//!
//! Modules extend the engine with new directives, hooks, and per-context
//! configuration. Every module implements the [`Module`] trait; the
//! engine assigns each one a stable index at registration time and uses
//! that index to address the module's configuration and data slots
//! everywhere else.

mod config;
pub mod registry;

pub use config::{ConfigData, ConfigValue, ModuleDataArray};
pub use registry::ModuleRegistry;

use crate::context::Context;
use crate::engine::Engine;
use crate::error::EngineResult;

/// Engine version string.
pub const ENGINE_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine version number, packed as `major * 1_000_000 + minor * 1_000 +
/// patch`.
pub const ENGINE_VERNUM: u32 = 1_000;

/// Engine ABI number. Bumped whenever the module interface changes in a
/// way existing modules cannot survive.
pub const ENGINE_ABINUM: u32 = 2;

/// A module's own version.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ModuleVersion {
    /// Incompatible interface changes.
    pub major: u32,
    /// Backwards-compatible additions.
    pub minor: u32,
    /// Bug fixes.
    pub patch: u32,
}

impl ModuleVersion {
    /// Creates a version.
    #[must_use]
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Packs the version into a single number, the same encoding as
    /// [`ENGINE_VERNUM`].
    #[must_use]
    pub const fn vernum(self) -> u32 {
        self.major * 1_000_000 + self.minor * 1_000 + self.patch
    }
}

impl Default for ModuleVersion {
    fn default() -> Self {
        Self::new(0, 1, 0)
    }
}

impl std::fmt::Display for ModuleVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// How a configuration directive's arguments are shaped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DirectiveKind {
    /// Single on/off argument.
    OnOff,
    /// Exactly one parameter.
    Param1,
    /// Exactly two parameters.
    Param2,
    /// Any number of parameters.
    List,
    /// Flag-style operator arguments (`+flag`, `-flag`).
    OpFlags,
    /// Opens a sub-block with one parameter.
    SubBlock,
}

/// A configuration directive a module contributes.
#[derive(Debug, Clone)]
pub struct DirectiveSpec {
    /// Directive name as written in configuration. Matched
    /// case-insensitively.
    pub name: String,
    /// Argument shape.
    pub kind: DirectiveKind,
}

impl DirectiveSpec {
    /// Creates a directive spec.
    #[must_use]
    pub fn new(name: impl Into<String>, kind: DirectiveKind) -> Self {
        Self {
            name: name.into(),
            kind,
        }
    }
}

/// The interface every engine module implements.
///
/// All methods take `&self`; a module needing mutable state keeps it in
/// the per-context configuration slot or the per-connection and
/// per-transaction data arrays, addressed by the index handed to
/// [`Module::init`].
pub trait Module: Send + Sync {
    /// Unique module name.
    fn name(&self) -> &str;

    /// Module version.
    fn version(&self) -> ModuleVersion {
        ModuleVersion::default()
    }

    /// ABI number this module was built against. Registration rejects
    /// any module whose ABI differs from [`ENGINE_ABINUM`].
    fn abi(&self) -> u32 {
        ENGINE_ABINUM
    }

    /// Called once, after the engine has assigned this module its index
    /// and materialized its configuration slots. A failure here unwinds
    /// the registration but the index is not reused.
    fn init(&self, _engine: &mut Engine, _index: usize) -> EngineResult<()> {
        Ok(())
    }

    /// Called when the module is unregistered or the engine is
    /// destroyed.
    fn fini(&self, _engine: &mut Engine) -> EngineResult<()> {
        Ok(())
    }

    /// The module's default per-context configuration, or `None` if the
    /// module carries no context configuration.
    fn global_config(&self) -> Option<Box<dyn ConfigData>> {
        None
    }

    /// Produces a child context's configuration from the parent's.
    ///
    /// Defaults to a plain clone of the parent's slot. Modules override
    /// this when a child must not inherit everything, e.g. counters or
    /// handles that belong to one context. Returning `None` makes the
    /// child start from a fresh [`Module::global_config`].
    fn config_copy(&self, parent: &dyn ConfigData) -> Option<Box<dyn ConfigData>> {
        Some(parent.clone_box())
    }

    /// Configuration directives this module handles.
    fn directives(&self) -> Vec<DirectiveSpec> {
        Vec::new()
    }

    /// Called for every context the moment it opens.
    fn context_open(&self, _engine: &Engine, _ctx: &Context) -> EngineResult<()> {
        Ok(())
    }

    /// Called for every context when it closes.
    fn context_close(&self, _engine: &Engine, _ctx: &Context) -> EngineResult<()> {
        Ok(())
    }

    /// Called for every context as it is being destroyed.
    fn context_destroy(&self, _engine: &Engine, _ctx: &Context) -> EngineResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_version_display() {
        assert_eq!(ModuleVersion::new(1, 4, 2).to_string(), "1.4.2");
    }

    #[test]
    fn test_version_ordering() {
        assert!(ModuleVersion::new(1, 0, 0) > ModuleVersion::new(0, 9, 9));
    }

    #[test]
    fn test_vernum_packing() {
        assert_eq!(ModuleVersion::new(1, 4, 2).vernum(), 1_004_002);
        assert_eq!(ModuleVersion::default().vernum(), ENGINE_VERNUM);
    }

    #[test]
    fn test_trait_defaults() {
        struct Noop;
        impl Module for Noop {
            fn name(&self) -> &str {
                "noop"
            }
        }

        let m = Noop;
        assert_eq!(m.abi(), ENGINE_ABINUM);
        assert!(m.global_config().is_none());
        assert!(m.directives().is_empty());
    }
}
