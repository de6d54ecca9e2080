//! Host-facing console entry points and the console-mode guard used around reads.

use std::ffi::c_void;
use std::fmt;

use tracing::debug;
use widestring::{U16Str, U16String};

/// Opaque console or file handle as passed by the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConsoleHandle(pub usize);

impl ConsoleHandle {
    #[must_use]
    pub fn from_raw(raw: *mut c_void) -> Self {
        Self(raw as usize)
    }

    #[must_use]
    pub fn as_raw(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

/// Standard streams the bridge touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StdStream {
    Input,
    Output,
}

/// The host's `CONSOLE_READCONSOLE_CONTROL` pointer, passed through untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReadControl(pub *mut c_void);

impl ReadControl {
    #[must_use]
    pub fn none() -> Self {
        Self(std::ptr::null_mut())
    }
}

/// An original entry point reported failure; the OS last-error value is left as the call set it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostCallFailed;

impl fmt::Display for HostCallFailed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("host console call failed")
    }
}

impl std::error::Error for HostCallFailed {}

pub type HostResult<T> = Result<T, HostCallFailed>;

/// The original (unhooked) console and environment entry points.
///
/// Every call the bridge forwards goes through this trait, so a forwarded call
/// never re-enters the hooks. Methods take `&self` because they wrap OS calls
/// without Rust-side state; test doubles use interior mutability.
pub trait ConsoleHost: Send + Sync {
    /// True when the handle refers to a character device (an interactive console).
    fn is_console_device(&self, handle: ConsoleHandle) -> bool;

    fn std_handle(&self, stream: StdStream) -> ConsoleHandle;

    fn console_mode(&self, handle: ConsoleHandle) -> Option<u32>;

    fn set_console_mode(&self, handle: ConsoleHandle, mode: u32) -> HostResult<()>;

    /// Original `ReadConsoleW`. Returns the number of units read.
    fn read_console(
        &self,
        input: ConsoleHandle,
        buffer: &mut [u16],
        control: ReadControl,
    ) -> HostResult<u32>;

    /// Original `WriteConsoleW`. Returns the number of units written.
    fn write_console(&self, output: ConsoleHandle, text: &[u16]) -> HostResult<u32>;

    fn get_environment_variable(&self, name: &U16Str) -> Option<U16String>;

    /// Original `SetEnvironmentVariableW`; `None` deletes the variable.
    fn set_environment_variable(&self, name: &U16Str, value: Option<&U16Str>) -> HostResult<()>;
}

/// Console modes of standard input and output captured for one intercepted read.
///
/// Dropping the snapshot writes the captured modes back, so every exit path of
/// the read (early forward, loop break, unwinding) restores them.
pub struct ConsoleModeSnapshot<'a> {
    host: &'a dyn ConsoleHost,
    saved: Vec<(ConsoleHandle, u32)>,
}

impl<'a> ConsoleModeSnapshot<'a> {
    #[must_use]
    pub fn capture(host: &'a dyn ConsoleHost) -> Self {
        let mut saved = Vec::with_capacity(2);
        for stream in [StdStream::Output, StdStream::Input] {
            let handle = host.std_handle(stream);
            if let Some(mode) = host.console_mode(handle) {
                saved.push((handle, mode));
            }
        }
        Self { host, saved }
    }
}

impl Drop for ConsoleModeSnapshot<'_> {
    fn drop(&mut self) {
        for &(handle, mode) in self.saved.iter().rev() {
            if self.host.set_console_mode(handle, mode).is_err() {
                debug!(handle = handle.0, mode, "console mode restore failed");
            }
        }
    }
}
