//! Two-phase hook installation.
//!
//! Some entry points are not safe to hook until the host has finished part of
//! its own startup. Phase one hooks an entry point the host reliably calls
//! during startup (the trap). The first call through the trap runs phase two,
//! removes the trap hook, and is then forwarded to the real function.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use tracing::{info, warn};

use super::{
    CommitFailure, HookEngine, HookError, HookSpec, InstalledHooks, PatchWriter, SymbolResolver,
};
use crate::lock_or_recover;

type PhaseTwo = Box<dyn FnOnce() + Send>;

struct ArmedTrap {
    symbol: String,
    hooks: Box<dyn InstalledHooks>,
    phase_two: PhaseTwo,
    original: usize,
}

static ARMED: Mutex<Option<ArmedTrap>> = Mutex::new(None);
static FORWARD_TO: AtomicUsize = AtomicUsize::new(0);

/// A one-shot trap hook plus the work it triggers.
pub struct BootstrapTrap {
    spec: HookSpec,
    phase_two: PhaseTwo,
}

impl BootstrapTrap {
    /// `spec.replacement` must be a thunk that calls [`fire`] and forwards the
    /// call to the address it returns.
    pub fn new(spec: HookSpec, phase_two: impl FnOnce() + Send + 'static) -> Self {
        Self {
            spec,
            phase_two: Box::new(phase_two),
        }
    }

    /// Phase one: commit the trap hook.
    ///
    /// # Errors
    ///
    /// Returns the commit failure when the trap cannot be installed; nothing is
    /// left armed in that case.
    pub fn arm<B>(self, backend: B) -> Result<(), CommitFailure>
    where
        B: SymbolResolver + PatchWriter + Send + 'static,
    {
        let Self { spec, phase_two } = self;
        let symbol = spec.symbol.clone();

        // Held across the commit so a trap call racing the commit waits for the
        // armed state instead of finding nothing.
        let mut armed = lock_or_recover(&ARMED, "bootstrap trap");
        let mut engine = HookEngine::new(backend);
        engine.add(spec);
        let table = engine.commit()?;
        let original = table.original(&symbol).unwrap_or_default();
        let target = table.target(&symbol).unwrap_or_default();
        FORWARD_TO.store(target, Ordering::SeqCst);
        *armed = Some(ArmedTrap {
            symbol: symbol.clone(),
            hooks: Box::new(table),
            phase_two,
            original,
        });
        info!(%symbol, "bootstrap trap armed");
        Ok(())
    }
}

/// Called from the trap thunk. Runs phase two on the first call, disarms the
/// trap, and returns the address the current call must be forwarded to.
///
/// Returns 0 when no trap was ever armed.
pub fn fire() -> usize {
    let taken = lock_or_recover(&ARMED, "bootstrap trap").take();
    let Some(ArmedTrap {
        symbol,
        mut hooks,
        phase_two,
        original,
    }) = taken
    else {
        return FORWARD_TO.load(Ordering::SeqCst);
    };

    info!(%symbol, "bootstrap trap fired");
    phase_two();

    match hooks.restore_all() {
        Ok(()) => FORWARD_TO.load(Ordering::SeqCst),
        Err(err) => {
            // The trap hook may still be live; keep its original reachable.
            warn!(%symbol, %err, "bootstrap trap could not be removed");
            FORWARD_TO.store(original, Ordering::SeqCst);
            std::mem::forget(hooks);
            original
        }
    }
}

/// Address trap calls are currently forwarded to (0 before any trap was armed).
pub fn forward_address() -> usize {
    FORWARD_TO.load(Ordering::SeqCst)
}

/// Remove an armed trap without running phase two.
///
/// # Errors
///
/// Returns the restore failure; the trap is forgotten either way.
pub fn disarm() -> Result<(), HookError> {
    let taken = lock_or_recover(&ARMED, "bootstrap trap").take();
    let Some(mut trap) = taken else {
        return Ok(());
    };
    info!(symbol = %trap.symbol, "bootstrap trap disarmed before firing");
    FORWARD_TO.store(trap.original, Ordering::SeqCst);
    trap.hooks.restore_all()
}

/// True while a trap is armed and has not fired.
pub fn is_armed() -> bool {
    lock_or_recover(&ARMED, "bootstrap trap").is_some()
}

#[cfg(test)]
pub(crate) fn reset_for_tests() {
    lock_or_recover(&ARMED, "bootstrap trap").take();
    FORWARD_TO.store(0, Ordering::SeqCst);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hook::{MemoryImage, ModuleRef};
    use crate::test_lock;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    const REAL_GETENV: usize = 0x3000;
    const TRAP_THUNK: usize = 0xC0DE;

    fn image() -> MemoryImage {
        let mut image = MemoryImage::new();
        image.add_import(ModuleRef::Host, "GetEnvironmentVariableW", REAL_GETENV);
        image
    }

    #[test]
    fn trap_runs_phase_two_once_and_disarms() {
        let _guard = test_lock();
        reset_for_tests();
        let image = image();
        let observer = image.clone();
        let ran = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&ran);

        BootstrapTrap::new(
            HookSpec::table_entry(ModuleRef::Host, "GetEnvironmentVariableW", TRAP_THUNK),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
        )
        .arm(image)
        .expect("arm trap");

        assert!(is_armed());
        assert_eq!(
            observer.call_import(&ModuleRef::Host, "GetEnvironmentVariableW"),
            Some(TRAP_THUNK)
        );

        assert_eq!(fire(), REAL_GETENV);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        assert!(!is_armed());
        assert_eq!(
            observer.call_import(&ModuleRef::Host, "GetEnvironmentVariableW"),
            Some(REAL_GETENV)
        );

        assert_eq!(fire(), REAL_GETENV);
        assert_eq!(ran.load(Ordering::SeqCst), 1);
        reset_for_tests();
    }

    #[test]
    fn failed_arm_leaves_nothing_armed() {
        let _guard = test_lock();
        reset_for_tests();
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        let result = BootstrapTrap::new(
            HookSpec::table_entry(ModuleRef::Host, "GetStartupInfoW", TRAP_THUNK),
            move || flag.store(true, Ordering::SeqCst),
        )
        .arm(image());

        assert!(result.is_err());
        assert!(!is_armed());
        assert_eq!(fire(), 0);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[test]
    fn disarm_restores_trap_without_phase_two() {
        let _guard = test_lock();
        reset_for_tests();
        let image = image();
        let observer = image.clone();
        let called = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&called);
        BootstrapTrap::new(
            HookSpec::table_entry(ModuleRef::Host, "GetEnvironmentVariableW", TRAP_THUNK),
            move || flag.store(true, Ordering::SeqCst),
        )
        .arm(image)
        .expect("arm trap");

        disarm().expect("disarm");
        assert!(!is_armed());
        assert!(!called.load(Ordering::SeqCst));
        assert_eq!(
            observer.call_import(&ModuleRef::Host, "GetEnvironmentVariableW"),
            Some(REAL_GETENV)
        );
        assert_eq!(disarm(), Ok(()));
        reset_for_tests();
    }
}
