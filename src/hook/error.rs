use thiserror::Error;

use super::ModuleRef;

/// Failure resolving or patching one hook target.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    /// The module is not loaded in this process.
    #[error("module {0} is not loaded")]
    ModuleNotFound(ModuleRef),

    /// The module's mapped image could not be parsed.
    #[error("cannot parse image of {module}: {reason}")]
    Image {
        /// Module being parsed
        module: ModuleRef,
        /// Parser message
        reason: String,
    },

    /// The module's import table has no entry for the symbol.
    #[error("{symbol} is not imported by {module}")]
    SymbolNotImported {
        /// Module whose import table was searched
        module: ModuleRef,
        /// Requested symbol
        symbol: String,
    },

    /// The module exports no entry point with this name.
    #[error("{symbol} is not exported by {module}")]
    SymbolNotExported {
        /// Module whose exports were searched
        module: ModuleRef,
        /// Requested symbol
        symbol: String,
    },

    /// The import slot is unbound or already points at the replacement.
    #[error("import slot at {slot:#x} holds unexpected value {value:#x}")]
    UnexpectedSlot {
        /// Slot address
        slot: usize,
        /// Value found in the slot
        value: usize,
    },

    /// Memory protection could not be changed for a patch.
    #[error("cannot change memory protection at {address:#x}")]
    Protect {
        /// Address being patched
        address: usize,
    },

    /// The entry-point prologue could not be redirected.
    #[error("cannot redirect entry point at {address:#x}: {reason}")]
    Redirect {
        /// Entry point address
        address: usize,
        /// Backend-specific reason
        reason: String,
    },

    /// Restore was requested for an entry point that is not redirected.
    #[error("no redirection installed at {address:#x}")]
    NotRedirected {
        /// Entry point address
        address: usize,
    },
}

/// A hook set that could not be applied as a whole.
///
/// Every hook applied before the failure has already been rolled back.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("hook commit failed at {symbol} after {applied} of {requested} hooks: {source}")]
pub struct CommitFailure {
    /// Hooks applied (and then rolled back) before the failing one
    pub applied: usize,
    /// Hooks requested in the set
    pub requested: usize,
    /// Symbol of the failing hook
    pub symbol: String,
    /// Why the failing hook could not be applied
    pub source: HookError,
}
