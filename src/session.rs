//! Process-wide hook session and the `extern "system"` thunks the hooks point at.
//!
//! One [`Session`] is registered when phase two of the bootstrap commits the
//! console hooks, and removed by [`shutdown`]. Thunks borrow the session's
//! bridge with a non-blocking lock: a call arriving while the bridge is busy
//! (the line editor reading keys through the hooked `ReadConsoleW`) goes
//! straight to the original entry point.
//!
//! The originals are published separately as soon as the console hooks are
//! committed and stay published for the life of the process, so a hook that is
//! still reachable without a session (before registration, after shutdown, or
//! after a failed restore) forwards to them.

use std::ffi::c_void;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::slice;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use tracing::{debug, info, warn};
use widestring::{U16CStr, U16Str};

use crate::bridge::{Collaborators, LineEditingBridge};
use crate::console::{ConsoleHandle, ConsoleHost, HostCallFailed, HostResult, ReadControl};
use crate::hook::trap::{self, BootstrapTrap};
use crate::hook::{
    HookEngine, HookSpec, HookTable, InstalledHooks, ModuleRef, PatchWriter, SymbolResolver,
};
use crate::host;
use crate::prompt::{tag_environment_prompt, untag_environment_prompt};
use crate::{lock_or_recover, try_lock_or_recover};

pub const READ_CONSOLE: &str = "ReadConsoleW";
pub const WRITE_CONSOLE: &str = "WriteConsoleW";
pub const SET_ENVIRONMENT_VARIABLE: &str = "SetEnvironmentVariableW";
pub const GET_ENVIRONMENT_VARIABLE: &str = "GetEnvironmentVariableW";

/// Win32 `BOOL`.
pub type Bool = i32;
const FALSE: Bool = 0;
const TRUE: Bool = 1;

type GetEnvironmentVariableFn = unsafe extern "system" fn(*const u16, *mut u16, u32) -> u32;

/// Callable addresses of the unhooked entry points once the hook set is live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Originals {
    pub read_console: usize,
    pub write_console: usize,
    pub set_environment_variable: usize,
}

impl Originals {
    fn from_table<B: PatchWriter>(table: &HookTable<B>) -> Result<Self> {
        let original = |symbol: &str| {
            table
                .original(symbol)
                .with_context(|| format!("{symbol} missing from committed hook set"))
        };
        Ok(Self {
            read_console: original(READ_CONSOLE)?,
            write_console: original(WRITE_CONSOLE)?,
            set_environment_variable: original(SET_ENVIRONMENT_VARIABLE)?,
        })
    }
}

/// Builds the host's console entry points over the originals of a committed hook set.
pub type ConsoleFactory = Box<dyn FnOnce(Originals) -> Arc<dyn ConsoleHost> + Send>;

pub struct Session {
    host: Arc<dyn ConsoleHost>,
    bridge: Mutex<LineEditingBridge>,
    hooks: Mutex<Option<Box<dyn InstalledHooks>>>,
}

static SESSION: Mutex<Option<Arc<Session>>> = Mutex::new(None);

/// Console entry points over the originals of the committed hook set. Never cleared.
static ORIGINALS: Mutex<Option<Arc<dyn ConsoleHost>>> = Mutex::new(None);

fn publish_originals(host: Arc<dyn ConsoleHost>) {
    *lock_or_recover(&ORIGINALS, "original entry points") = Some(host);
}

fn published_originals() -> Option<Arc<dyn ConsoleHost>> {
    lock_or_recover(&ORIGINALS, "original entry points").clone()
}

impl Session {
    #[must_use]
    pub fn new(bridge: LineEditingBridge, hooks: Option<Box<dyn InstalledHooks>>) -> Self {
        Self {
            host: Arc::clone(bridge.host()),
            bridge: Mutex::new(bridge),
            hooks: Mutex::new(hooks),
        }
    }

    #[must_use]
    pub fn host(&self) -> &Arc<dyn ConsoleHost> {
        &self.host
    }

    fn read_console(
        &self,
        input: ConsoleHandle,
        buffer: &mut [u16],
        control: ReadControl,
    ) -> HostResult<u32> {
        match try_lock_or_recover(&self.bridge, "session bridge") {
            Some(mut bridge) => bridge.read_console(input, buffer, control),
            None => {
                debug!("re-entrant read; forwarding");
                self.host.read_console(input, buffer, control)
            }
        }
    }

    fn write_console(&self, output: ConsoleHandle, text: &[u16]) -> HostResult<u32> {
        match try_lock_or_recover(&self.bridge, "session bridge") {
            Some(mut bridge) => bridge.write_console(output, text),
            None => self.host.write_console(output, text),
        }
    }

    fn set_environment_variable(&self, name: &U16Str, value: Option<&U16Str>) -> HostResult<()> {
        match try_lock_or_recover(&self.bridge, "session bridge") {
            Some(mut bridge) => bridge.set_environment_variable(name, value),
            None => self.host.set_environment_variable(name, value),
        }
    }

    fn input_consumed(&self) -> bool {
        try_lock_or_recover(&self.bridge, "session bridge")
            .is_some_and(|bridge| bridge.input_consumed())
    }
}

/// Make `session` the process-wide session, replacing any previous one.
pub fn register(session: Session) -> Arc<Session> {
    let session = Arc::new(session);
    *lock_or_recover(&SESSION, "session registry") = Some(Arc::clone(&session));
    session
}

#[must_use]
pub fn current() -> Option<Arc<Session>> {
    lock_or_recover(&SESSION, "session registry").clone()
}

/// Whether hooking this process makes sense: the host executable is loaded and
/// its command line leaves it reading commands interactively.
#[must_use]
pub fn validate(host_loaded: bool, command_line: &str) -> bool {
    if !host_loaded {
        debug!(module = host::HOST_MODULE, "host module not loaded");
        return false;
    }
    let interactive = host::is_interactive(command_line);
    if !interactive {
        debug!("host runs a single command; not hooking");
    }
    interactive
}

/// Everything the two-phase installation needs.
pub struct Installer<B> {
    /// Module exporting `ReadConsoleW` (see [`host::kernel_module`]).
    pub kernel_module: String,
    /// Backend for the bootstrap trap.
    pub trap_backend: B,
    /// Backend for the console hook set committed in phase two.
    pub hook_backend: B,
    pub console: ConsoleFactory,
    pub collaborators: Collaborators,
}

impl<B> Installer<B>
where
    B: SymbolResolver + PatchWriter + Send + 'static,
{
    /// Phase one: arm the trap on the host's `GetEnvironmentVariableW` import.
    /// The console hooks are committed by the first call through the trap.
    ///
    /// # Errors
    ///
    /// Returns an error when the trap cannot be armed; the host is left untouched.
    pub fn initialise(self) -> Result<()> {
        let Self {
            kernel_module,
            trap_backend,
            hook_backend,
            console,
            collaborators,
        } = self;

        let phase_two = move || {
            let installed =
                install_console_hooks(hook_backend, &kernel_module, console, collaborators);
            if let Err(err) = installed {
                warn!("console hooks not installed: {err:#}");
            }
        };

        BootstrapTrap::new(
            HookSpec::table_entry(
                ModuleRef::Host,
                GET_ENVIRONMENT_VARIABLE,
                get_environment_variable_trap as usize,
            ),
            phase_two,
        )
        .arm(trap_backend)
        .context("arming bootstrap trap")
    }
}

fn install_console_hooks<B>(
    backend: B,
    kernel_module: &str,
    console: ConsoleFactory,
    collaborators: Collaborators,
) -> Result<()>
where
    B: SymbolResolver + PatchWriter + Send + 'static,
{
    let mut engine = HookEngine::new(backend);
    engine
        .add_entry_redirect(
            ModuleRef::named(kernel_module),
            READ_CONSOLE,
            read_console as usize,
        )
        .add_table_redirect(ModuleRef::Host, WRITE_CONSOLE, write_console as usize)
        .add_table_redirect(
            ModuleRef::Host,
            SET_ENVIRONMENT_VARIABLE,
            set_environment_variable as usize,
        );
    let mut table = engine.commit().context("committing console hooks")?;

    let originals = match Originals::from_table(&table) {
        Ok(originals) => originals,
        Err(err) => {
            if let Err(restore) = table.restore_all() {
                warn!(%restore, "console hooks could not be removed");
            }
            return Err(err);
        }
    };

    let host = console(originals);
    publish_originals(Arc::clone(&host));
    let bridge = LineEditingBridge::new(Arc::clone(&host), collaborators);
    if tag_environment_prompt(host.as_ref()).is_err() {
        warn!("prompt variable could not be tagged");
    }
    info!(hooks = table.len(), shell = %bridge.shell_name(), "console hooks installed");
    register(Session::new(bridge, Some(Box::new(table))));
    Ok(())
}

/// Remove the hooks and the prompt tag, then drop the session.
///
/// # Errors
///
/// Returns an error if a hook could not be removed. Hooks left in place keep
/// forwarding to the published originals.
pub fn shutdown() -> Result<()> {
    if let Err(err) = trap::disarm() {
        warn!(%err, "bootstrap trap could not be removed");
    }

    let Some(session) = current() else {
        return Ok(());
    };

    let restored = match lock_or_recover(&session.hooks, "session hooks").take() {
        Some(mut hooks) => hooks.restore_all(),
        None => Ok(()),
    };
    lock_or_recover(&SESSION, "session registry").take();
    if untag_environment_prompt(session.host.as_ref()).is_err() {
        debug!("prompt variable could not be untagged");
    }
    info!("console session shut down");
    restored.context("removing console hooks")
}

fn report(result: HostResult<u32>, count: *mut u32) -> Bool {
    match result {
        Ok(units) => {
            if !count.is_null() {
                // SAFETY: non-null count pointers come from the host's call and
                // point at a writable DWORD.
                unsafe { *count = units };
            }
            TRUE
        }
        Err(HostCallFailed) => FALSE,
    }
}

fn set_result(result: HostResult<()>) -> Bool {
    match result {
        Ok(()) => TRUE,
        Err(HostCallFailed) => FALSE,
    }
}

/// Replacement for `ReadConsoleW`.
///
/// # Safety
///
/// Arguments must satisfy the `ReadConsoleW` contract: `buffer` writable for
/// `capacity` units, `read` null or writable.
pub unsafe extern "system" fn read_console(
    input: *mut c_void,
    buffer: *mut u16,
    capacity: u32,
    read: *mut u32,
    control: *mut c_void,
) -> Bool {
    if buffer.is_null() {
        return FALSE;
    }
    let input = ConsoleHandle::from_raw(input);
    let control = ReadControl(control);
    // SAFETY: the caller guarantees `capacity` writable units at `buffer`.
    let buffer = unsafe { slice::from_raw_parts_mut(buffer, capacity as usize) };
    let Some(session) = current() else {
        return match published_originals() {
            Some(host) => report(host.read_console(input, buffer, control), read),
            None => FALSE,
        };
    };

    let outcome = catch_unwind(AssertUnwindSafe(|| {
        session.read_console(input, buffer, control)
    }));
    let result = match outcome {
        Ok(result) => result,
        Err(_) if session.input_consumed() => {
            warn!("panic while reading a command line; failing the read");
            Err(HostCallFailed)
        }
        Err(_) => {
            warn!("panic before input was consumed; forwarding the read");
            session.host.read_console(input, buffer, control)
        }
    };
    report(result, read)
}

/// Replacement for `WriteConsoleW`.
///
/// # Safety
///
/// Arguments must satisfy the `WriteConsoleW` contract: `text` readable for
/// `length` units, `written` null or writable.
pub unsafe extern "system" fn write_console(
    output: *mut c_void,
    text: *const u16,
    length: u32,
    written: *mut u32,
    _reserved: *mut c_void,
) -> Bool {
    let text: &[u16] = if length == 0 {
        &[]
    } else if text.is_null() {
        return FALSE;
    } else {
        // SAFETY: the caller guarantees `length` readable units at `text`.
        unsafe { slice::from_raw_parts(text, length as usize) }
    };
    let output = ConsoleHandle::from_raw(output);
    let Some(session) = current() else {
        return match published_originals() {
            Some(host) => report(host.write_console(output, text), written),
            None => FALSE,
        };
    };

    let result = catch_unwind(AssertUnwindSafe(|| session.write_console(output, text)))
        .unwrap_or_else(|_| {
            warn!("panic while inspecting a console write; forwarding");
            session.host.write_console(output, text)
        });
    report(result, written)
}

/// Replacement for `SetEnvironmentVariableW`.
///
/// # Safety
///
/// `name` must be a NUL-terminated UTF-16 string; `value` null or NUL-terminated.
pub unsafe extern "system" fn set_environment_variable(
    name: *const u16,
    value: *const u16,
) -> Bool {
    if name.is_null() {
        return FALSE;
    }
    // SAFETY: the caller passes NUL-terminated strings.
    let name = unsafe { U16CStr::from_ptr_str(name) }.as_ustr();
    let value = (!value.is_null()).then(|| unsafe { U16CStr::from_ptr_str(value) }.as_ustr());

    let Some(session) = current() else {
        return match published_originals() {
            Some(host) => set_result(host.set_environment_variable(name, value)),
            None => FALSE,
        };
    };
    let result = catch_unwind(AssertUnwindSafe(|| {
        session.set_environment_variable(name, value)
    }))
    .unwrap_or_else(|_| {
        warn!("panic while setting a variable; forwarding");
        session.host.set_environment_variable(name, value)
    });
    set_result(result)
}

/// Replacement for `GetEnvironmentVariableW` while the bootstrap trap is armed.
///
/// # Safety
///
/// Arguments must satisfy the `GetEnvironmentVariableW` contract.
pub unsafe extern "system" fn get_environment_variable_trap(
    name: *const u16,
    buffer: *mut u16,
    size: u32,
) -> u32 {
    let forward = catch_unwind(trap::fire).unwrap_or_else(|_| {
        warn!("panic during hook installation");
        trap::forward_address()
    });
    if forward == 0 {
        return 0;
    }
    // SAFETY: the forward address is the import slot's original value, which
    // has the `GetEnvironmentVariableW` signature.
    let original: GetEnvironmentVariableFn = unsafe { std::mem::transmute(forward) };
    unsafe { original(name, buffer, size) }
}

#[cfg(windows)]
pub use windows_host::{initialise_current, validate_current};

#[cfg(windows)]
mod windows_host {
    use super::*;
    use crate::collaborators::{DoskeyQueue, LineEditor};
    use crate::config::Settings;
    use crate::hook::windows::{self as backend, MuiLocalizer, WindowsConsole, WindowsImage};
    use crate::telemetry;

    /// [`validate`] for the current process.
    #[must_use]
    pub fn validate_current() -> bool {
        validate(backend::host_module_loaded(), &backend::command_line())
    }

    /// Load settings, start tracing, and arm the bootstrap trap in this process.
    ///
    /// # Errors
    ///
    /// Returns an error when settings are unreadable or the trap cannot be armed.
    pub fn initialise_current(
        editor: Box<dyn LineEditor>,
        doskey: Box<dyn DoskeyQueue>,
    ) -> Result<()> {
        let settings = Settings::load().context("loading settings")?;
        telemetry::init_tracing(&settings);

        let (major, minor) = backend::os_version();
        Installer {
            kernel_module: host::kernel_module(major, minor).to_string(),
            trap_backend: WindowsImage::for_host().context("mapping host image")?,
            hook_backend: WindowsImage::for_host().context("mapping host image")?,
            console: Box::new(|originals: Originals| -> Arc<dyn ConsoleHost> {
                Arc::new(WindowsConsole::new(originals))
            }),
            collaborators: Collaborators {
                editor,
                doskey,
                localizer: Box::new(MuiLocalizer::for_host()),
                settings: Box::new(settings),
            },
        }
        .initialise()
    }
}
