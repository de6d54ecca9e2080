//! In-memory patch backend: import slots, exports and redirections as plain maps.
//!
//! Clones share one image, so a test can keep a handle while the engine owns
//! another and observe exactly what a commit or rollback left behind.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use super::{HookError, ModuleRef, PatchWriter, SymbolResolver};
use crate::lock_or_recover;

const FIRST_FAKE_ADDRESS: usize = 0x7FF0_0000;

#[derive(Debug)]
struct ImageState {
    imports: HashMap<(ModuleRef, String), usize>,
    exports: HashMap<(String, String), usize>,
    slots: HashMap<usize, usize>,
    redirects: HashMap<usize, usize>,
    trampolines: HashMap<usize, usize>,
    next_address: usize,
    patch_budget: Option<usize>,
}

impl ImageState {
    fn allocate(&mut self) -> usize {
        let address = self.next_address;
        self.next_address += std::mem::size_of::<usize>();
        address
    }

    fn spend_patch(&mut self, address: usize) -> Result<(), HookError> {
        match self.patch_budget {
            Some(0) => {
                self.patch_budget = None;
                Err(HookError::Protect { address })
            }
            Some(ref mut remaining) => {
                *remaining -= 1;
                Ok(())
            }
            None => Ok(()),
        }
    }
}

/// Process image double for exercising the hook engine.
#[derive(Debug, Clone)]
pub struct MemoryImage {
    state: Arc<Mutex<ImageState>>,
}

impl Default for MemoryImage {
    fn default() -> Self {
        Self::new()
    }
}

fn export_key(module: &str, symbol: &str) -> (String, String) {
    (module.to_ascii_lowercase(), symbol.to_string())
}

impl MemoryImage {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ImageState {
                imports: HashMap::new(),
                exports: HashMap::new(),
                slots: HashMap::new(),
                redirects: HashMap::new(),
                trampolines: HashMap::new(),
                next_address: FIRST_FAKE_ADDRESS,
                patch_budget: None,
            })),
        }
    }

    /// Add an import of `symbol` by `module` bound to `target`; returns the slot address.
    pub fn add_import(&mut self, module: ModuleRef, symbol: &str, target: usize) -> usize {
        let mut state = lock_or_recover(&self.state, "memory image");
        let slot = state.allocate();
        state.slots.insert(slot, target);
        state.imports.insert((module, symbol.to_string()), slot);
        slot
    }

    pub fn add_export(&mut self, module: &str, symbol: &str, address: usize) {
        lock_or_recover(&self.state, "memory image")
            .exports
            .insert(export_key(module, symbol), address);
    }

    /// Let `count` patches succeed, then fail the next one (once).
    pub fn fail_writes_after(&mut self, count: usize) {
        lock_or_recover(&self.state, "memory image").patch_budget = Some(count);
    }

    /// Where a call from `module` through its import of `symbol` lands.
    #[must_use]
    pub fn call_import(&self, module: &ModuleRef, symbol: &str) -> Option<usize> {
        let state = lock_or_recover(&self.state, "memory image");
        let slot = state.imports.get(&(module.clone(), symbol.to_string()))?;
        state.slots.get(slot).copied()
    }

    /// Where a direct call to the exported `symbol` lands.
    #[must_use]
    pub fn call_export(&self, module: &str, symbol: &str) -> Option<usize> {
        let state = lock_or_recover(&self.state, "memory image");
        let entry = *state.exports.get(&export_key(module, symbol))?;
        Some(state.redirects.get(&entry).copied().unwrap_or(entry))
    }

    /// Entry point a trampoline stands in for.
    #[must_use]
    pub fn trampoline_target(&self, trampoline: usize) -> Option<usize> {
        lock_or_recover(&self.state, "memory image")
            .trampolines
            .get(&trampoline)
            .copied()
    }
}

impl SymbolResolver for MemoryImage {
    fn import_slot(&self, module: &ModuleRef, symbol: &str) -> Result<usize, HookError> {
        lock_or_recover(&self.state, "memory image")
            .imports
            .get(&(module.clone(), symbol.to_string()))
            .copied()
            .ok_or_else(|| HookError::SymbolNotImported {
                module: module.clone(),
                symbol: symbol.to_string(),
            })
    }

    fn entry_point(&self, module: &ModuleRef, symbol: &str) -> Result<usize, HookError> {
        let ModuleRef::Named(name) = module else {
            return Err(HookError::SymbolNotExported {
                module: module.clone(),
                symbol: symbol.to_string(),
            });
        };
        lock_or_recover(&self.state, "memory image")
            .exports
            .get(&export_key(name, symbol))
            .copied()
            .ok_or_else(|| HookError::SymbolNotExported {
                module: module.clone(),
                symbol: symbol.to_string(),
            })
    }
}

impl PatchWriter for MemoryImage {
    fn read_slot(&self, slot: usize) -> Result<usize, HookError> {
        lock_or_recover(&self.state, "memory image")
            .slots
            .get(&slot)
            .copied()
            .ok_or(HookError::Protect { address: slot })
    }

    fn write_slot(&mut self, slot: usize, value: usize) -> Result<usize, HookError> {
        let mut state = lock_or_recover(&self.state, "memory image");
        if !state.slots.contains_key(&slot) {
            return Err(HookError::Protect { address: slot });
        }
        state.spend_patch(slot)?;
        Ok(state.slots.insert(slot, value).unwrap_or_default())
    }

    fn redirect_entry(&mut self, entry: usize, replacement: usize) -> Result<usize, HookError> {
        let mut state = lock_or_recover(&self.state, "memory image");
        if state.redirects.contains_key(&entry) {
            return Err(HookError::Redirect {
                address: entry,
                reason: "already redirected".to_string(),
            });
        }
        state.spend_patch(entry)?;
        let trampoline = state.allocate();
        state.trampolines.insert(trampoline, entry);
        state.redirects.insert(entry, replacement);
        Ok(trampoline)
    }

    fn remove_redirect(&mut self, entry: usize) -> Result<(), HookError> {
        let mut state = lock_or_recover(&self.state, "memory image");
        if state.redirects.remove(&entry).is_none() {
            return Err(HookError::NotRedirected { address: entry });
        }
        state.trampolines.retain(|_, target| *target != entry);
        Ok(())
    }
}
