//! Call redirection for named entry points, applied as one transactional set.
//!
//! Two strategies are supported:
//!
//! - **Table entry**: overwrite the pointer a module's import address table
//!   holds for a symbol, so only that module's calls are redirected.
//! - **Entry point**: overwrite the prologue of the exported function itself, so
//!   every caller is redirected; the original stays reachable through a
//!   trampoline.
//!
//! Symbol lookup ([`SymbolResolver`]) is kept apart from patch application
//! ([`PatchWriter`]) so another backend can be dropped in without touching the
//! bridge. [`MemoryImage`] is an in-memory backend; the Windows backend lives in
//! `hook::windows`.
//!
//! ```
//! use cmdline_hook::hook::{HookEngine, MemoryImage, ModuleRef};
//!
//! let mut image = MemoryImage::new();
//! image.add_import(ModuleRef::Host, "WriteConsoleW", 0x1000);
//! image.add_export("kernelbase.dll", "ReadConsoleW", 0x2000);
//!
//! let mut engine = HookEngine::new(image);
//! engine.add_table_redirect(ModuleRef::Host, "WriteConsoleW", 0xA000);
//! engine.add_entry_redirect(ModuleRef::named("kernelbase.dll"), "ReadConsoleW", 0xB000);
//! let table = engine.commit().expect("both hooks apply");
//! assert_eq!(table.len(), 2);
//! assert_eq!(table.target("WriteConsoleW"), Some(0x1000));
//! ```

mod error;
mod memory;
pub mod trap;
#[cfg(windows)]
pub mod windows;

use std::fmt;

use tracing::{debug, info, warn};

pub use error::{CommitFailure, HookError};
pub use memory::MemoryImage;

/// Module whose table or exports a hook targets.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ModuleRef {
    /// The host's main executable.
    Host,
    /// A loaded module by file name (`kernelbase.dll`).
    Named(String),
}

impl ModuleRef {
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named(name.into())
    }
}

impl fmt::Display for ModuleRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Host => f.write_str("<host executable>"),
            Self::Named(name) => f.write_str(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookMechanism {
    TableEntry,
    EntryPoint,
}

/// One requested redirection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookSpec {
    pub module: ModuleRef,
    pub symbol: String,
    pub mechanism: HookMechanism,
    /// Address of the function calls are redirected to.
    pub replacement: usize,
}

impl HookSpec {
    pub fn table_entry(module: ModuleRef, symbol: impl Into<String>, replacement: usize) -> Self {
        Self {
            module,
            symbol: symbol.into(),
            mechanism: HookMechanism::TableEntry,
            replacement,
        }
    }

    pub fn entry_point(module: ModuleRef, symbol: impl Into<String>, replacement: usize) -> Self {
        Self {
            module,
            symbol: symbol.into(),
            mechanism: HookMechanism::EntryPoint,
            replacement,
        }
    }
}

/// Finds patch sites.
pub trait SymbolResolver {
    /// Address of the import-table slot `module` uses to call `symbol`.
    fn import_slot(&self, module: &ModuleRef, symbol: &str) -> Result<usize, HookError>;

    /// Address of the exported entry point of `symbol` in `module`.
    fn entry_point(&self, module: &ModuleRef, symbol: &str) -> Result<usize, HookError>;
}

/// Applies and removes patches.
pub trait PatchWriter {
    fn read_slot(&self, slot: usize) -> Result<usize, HookError>;

    /// Store `value` in the pointer slot; returns the previous value.
    fn write_slot(&mut self, slot: usize, value: usize) -> Result<usize, HookError>;

    /// Redirect the code at `entry` to `replacement`; returns a callable
    /// address that behaves like the unpatched function.
    fn redirect_entry(&mut self, entry: usize, replacement: usize) -> Result<usize, HookError>;

    fn remove_redirect(&mut self, entry: usize) -> Result<(), HookError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PatchSite {
    Slot { slot: usize, previous: usize },
    Entry { entry: usize },
}

/// A hook that is currently in effect.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppliedHook {
    pub symbol: String,
    pub mechanism: HookMechanism,
    /// Callable address with the original behavior while the hook is active.
    pub original: usize,
    /// The real function; callable directly once the hook is removed.
    pub target: usize,
    site: PatchSite,
}

fn apply<B: SymbolResolver + PatchWriter>(
    backend: &mut B,
    spec: &HookSpec,
) -> Result<AppliedHook, HookError> {
    match spec.mechanism {
        HookMechanism::TableEntry => {
            let slot = backend.import_slot(&spec.module, &spec.symbol)?;
            let current = backend.read_slot(slot)?;
            if current == 0 || current == spec.replacement {
                return Err(HookError::UnexpectedSlot {
                    slot,
                    value: current,
                });
            }
            let previous = backend.write_slot(slot, spec.replacement)?;
            Ok(AppliedHook {
                symbol: spec.symbol.clone(),
                mechanism: spec.mechanism,
                original: previous,
                target: previous,
                site: PatchSite::Slot { slot, previous },
            })
        }
        HookMechanism::EntryPoint => {
            let entry = backend.entry_point(&spec.module, &spec.symbol)?;
            let trampoline = backend.redirect_entry(entry, spec.replacement)?;
            Ok(AppliedHook {
                symbol: spec.symbol.clone(),
                mechanism: spec.mechanism,
                original: trampoline,
                target: entry,
                site: PatchSite::Entry { entry },
            })
        }
    }
}

fn undo<B: PatchWriter>(backend: &mut B, hook: &AppliedHook) -> Result<(), HookError> {
    match hook.site {
        PatchSite::Slot { slot, previous } => backend.write_slot(slot, previous).map(|_| ()),
        PatchSite::Entry { entry } => backend.remove_redirect(entry),
    }
}

/// Collects hook specs and commits them as one set.
pub struct HookEngine<B> {
    backend: B,
    pending: Vec<HookSpec>,
}

impl<B: SymbolResolver + PatchWriter> HookEngine<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            pending: Vec::new(),
        }
    }

    pub fn add(&mut self, spec: HookSpec) -> &mut Self {
        self.pending.push(spec);
        self
    }

    /// Queue replacement of `module`'s import-table entry for `symbol`.
    pub fn add_table_redirect(
        &mut self,
        module: ModuleRef,
        symbol: &str,
        replacement: usize,
    ) -> &mut Self {
        self.add(HookSpec::table_entry(module, symbol, replacement))
    }

    /// Queue redirection of `symbol`'s exported entry point in `module`.
    pub fn add_entry_redirect(
        &mut self,
        module: ModuleRef,
        symbol: &str,
        replacement: usize,
    ) -> &mut Self {
        self.add(HookSpec::entry_point(module, symbol, replacement))
    }

    /// Apply every queued spec in order.
    ///
    /// # Errors
    ///
    /// When any spec fails, the specs already applied are removed again (in
    /// reverse order) and a [`CommitFailure`] describing the failing spec is
    /// returned; the backend is left as it was before the commit.
    pub fn commit(self) -> Result<HookTable<B>, CommitFailure> {
        let Self {
            mut backend,
            pending,
        } = self;
        let requested = pending.len();
        let mut applied: Vec<AppliedHook> = Vec::with_capacity(requested);

        for spec in &pending {
            match apply(&mut backend, spec) {
                Ok(hook) => {
                    debug!(
                        symbol = %spec.symbol,
                        module = %spec.module,
                        mechanism = ?spec.mechanism,
                        original = format_args!("{:#x}", hook.original),
                        "hook applied"
                    );
                    applied.push(hook);
                }
                Err(source) => {
                    warn!(
                        symbol = %spec.symbol,
                        module = %spec.module,
                        %source,
                        "hook failed; rolling back"
                    );
                    let count = applied.len();
                    rollback(&mut backend, &mut applied);
                    return Err(CommitFailure {
                        applied: count,
                        requested,
                        symbol: spec.symbol.clone(),
                        source,
                    });
                }
            }
        }

        info!(count = requested, "hook set committed");
        Ok(HookTable {
            backend,
            hooks: applied,
        })
    }
}

fn rollback<B: PatchWriter>(backend: &mut B, applied: &mut Vec<AppliedHook>) {
    while let Some(hook) = applied.pop() {
        if let Err(err) = undo(backend, &hook) {
            warn!(symbol = %hook.symbol, %err, "hook rollback failed");
        }
    }
}

/// A committed hook set.
pub struct HookTable<B> {
    backend: B,
    hooks: Vec<AppliedHook>,
}

impl<B: PatchWriter> HookTable<B> {
    #[must_use]
    pub fn len(&self) -> usize {
        self.hooks.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.hooks.is_empty()
    }

    fn find(&self, symbol: &str) -> Option<&AppliedHook> {
        self.hooks.iter().find(|hook| hook.symbol == symbol)
    }

    /// Callable original of `symbol` while the hook is active.
    #[must_use]
    pub fn original(&self, symbol: &str) -> Option<usize> {
        self.find(symbol).map(|hook| hook.original)
    }

    /// Real function address of `symbol`.
    #[must_use]
    pub fn target(&self, symbol: &str) -> Option<usize> {
        self.find(symbol).map(|hook| hook.target)
    }

    #[must_use]
    pub fn backend(&self) -> &B {
        &self.backend
    }

    /// Remove every hook, most recent first.
    ///
    /// # Errors
    ///
    /// Returns the first failure; the remaining hooks are still removed.
    pub fn restore_all(&mut self) -> Result<(), HookError> {
        let mut first_error = None;
        while let Some(hook) = self.hooks.pop() {
            if let Err(err) = undo(&mut self.backend, &hook) {
                warn!(symbol = %hook.symbol, %err, "hook restore failed");
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }
}

/// Type-erased handle on a committed set, for process-wide storage.
pub trait InstalledHooks: Send {
    fn len(&self) -> usize;

    fn restore_all(&mut self) -> Result<(), HookError>;
}

impl<B: PatchWriter + Send> InstalledHooks for HookTable<B> {
    fn len(&self) -> usize {
        HookTable::len(self)
    }

    fn restore_all(&mut self) -> Result<(), HookError> {
        HookTable::restore_all(self)
    }
}
