//! Windows backend: patches the live process image and calls the original
//! console entry points.

use std::collections::HashMap;
use std::ffi::{c_void, CString};
use std::mem;
use std::ptr;
use std::slice;

use goblin::pe::header::Header;
use goblin::pe::options::ParseOptions;
use goblin::pe::PE;
use retour::RawDetour;
use tracing::debug;
use widestring::{U16CString, U16Str, U16String};
use windows::core::{PCSTR, PCWSTR, PWSTR};
use windows::Win32::Foundation::{HANDLE, HMODULE};
use windows::Win32::Storage::FileSystem::{GetFileType, FILE_TYPE_CHAR};
use windows::Win32::System::Console::{
    GetConsoleMode, GetStdHandle, SetConsoleMode, CONSOLE_MODE, STD_INPUT_HANDLE,
    STD_OUTPUT_HANDLE,
};
use windows::Win32::System::Diagnostics::Debug::{
    FormatMessageW, FORMAT_MESSAGE_FROM_HMODULE, FORMAT_MESSAGE_IGNORE_INSERTS,
};
use windows::Win32::System::Environment::{GetCommandLineW, GetEnvironmentVariableW};
use windows::Win32::System::LibraryLoader::{GetModuleHandleW, GetProcAddress};
use windows::Win32::System::Memory::{VirtualProtect, PAGE_PROTECTION_FLAGS, PAGE_READWRITE};
use windows::Win32::System::SystemInformation::{GetVersionExW, OSVERSIONINFOW};

use super::{HookError, ModuleRef, PatchWriter, SymbolResolver};
use crate::collaborators::Localizer;
use crate::console::{
    ConsoleHandle, ConsoleHost, HostCallFailed, HostResult, ReadControl, StdStream,
};
use crate::host::HOST_MODULE;
use crate::session::Originals;

/// The headers always fit in the first page of a mapped image.
const HEADER_PAGE: usize = 0x1000;
const MESSAGE_CAPACITY: usize = 512;

type ReadConsoleFn =
    unsafe extern "system" fn(*mut c_void, *mut u16, u32, *mut u32, *mut c_void) -> i32;
type WriteConsoleFn =
    unsafe extern "system" fn(*mut c_void, *const u16, u32, *mut u32, *mut c_void) -> i32;
type SetEnvironmentVariableFn = unsafe extern "system" fn(*const u16, *const u16) -> i32;

fn module_handle(module: &ModuleRef) -> Result<HMODULE, HookError> {
    let handle = match module {
        ModuleRef::Host => unsafe { GetModuleHandleW(None) },
        ModuleRef::Named(name) => {
            let wide = U16CString::from_str(name)
                .map_err(|_| HookError::ModuleNotFound(module.clone()))?;
            unsafe { GetModuleHandleW(PCWSTR(wide.as_ptr())) }
        }
    };
    handle.map_err(|_| HookError::ModuleNotFound(module.clone()))
}

/// The module's image as mapped in memory.
///
/// # Safety
///
/// `base` must be the base address of a loaded module that stays loaded for
/// the returned lifetime.
unsafe fn mapped_image<'a>(base: usize, module: &ModuleRef) -> Result<&'a [u8], HookError> {
    let invalid = |err: goblin::error::Error| HookError::Image {
        module: module.clone(),
        reason: err.to_string(),
    };
    let headers = unsafe { slice::from_raw_parts(base as *const u8, HEADER_PAGE) };
    let header = Header::parse(headers).map_err(invalid)?;
    let size = header
        .optional_header
        .map(|optional| optional.windows_fields.size_of_image as usize)
        .ok_or_else(|| HookError::Image {
            module: module.clone(),
            reason: "no optional header".to_string(),
        })?;
    Ok(unsafe { slice::from_raw_parts(base as *const u8, size) })
}

struct Detour(RawDetour);

// SAFETY: detours are created, enabled and disabled only on the console thread
// that owns the hook set; the handle is moved, never shared.
unsafe impl Send for Detour {}

/// Patch backend over the current process.
pub struct WindowsImage {
    detours: HashMap<usize, Detour>,
}

impl WindowsImage {
    /// Backend for the host executable's image.
    ///
    /// # Errors
    ///
    /// Fails when the host module cannot be found.
    pub fn for_host() -> Result<Self, HookError> {
        module_handle(&ModuleRef::Host)?;
        Ok(Self {
            detours: HashMap::new(),
        })
    }
}

impl SymbolResolver for WindowsImage {
    fn import_slot(&self, module: &ModuleRef, symbol: &str) -> Result<usize, HookError> {
        let base = module_handle(module)?.0 as usize;
        // SAFETY: `base` comes from the loader and the module is not unloaded
        // while its imports are patched.
        let image = unsafe { mapped_image(base, module)? };

        let mut options = ParseOptions::default();
        // Mapped image: section data already sits at its RVA.
        options.resolve_rva = false;
        options.parse_attribute_certificates = false;
        let pe = PE::parse_with_opts(image, &options).map_err(|err| HookError::Image {
            module: module.clone(),
            reason: err.to_string(),
        })?;

        pe.imports
            .iter()
            .find(|import| import.name == symbol)
            .map(|import| base + import.rva)
            .ok_or_else(|| HookError::SymbolNotImported {
                module: module.clone(),
                symbol: symbol.to_string(),
            })
    }

    fn entry_point(&self, module: &ModuleRef, symbol: &str) -> Result<usize, HookError> {
        let handle = module_handle(module)?;
        let name = CString::new(symbol).map_err(|_| HookError::SymbolNotExported {
            module: module.clone(),
            symbol: symbol.to_string(),
        })?;
        let address = unsafe { GetProcAddress(handle, PCSTR(name.as_ptr().cast())) };
        address
            .map(|entry| entry as usize)
            .ok_or_else(|| HookError::SymbolNotExported {
                module: module.clone(),
                symbol: symbol.to_string(),
            })
    }
}

impl PatchWriter for WindowsImage {
    fn read_slot(&self, slot: usize) -> Result<usize, HookError> {
        // SAFETY: slots come from `import_slot` and lie inside the mapped IAT.
        Ok(unsafe { ptr::read_volatile(slot as *const usize) })
    }

    fn write_slot(&mut self, slot: usize, value: usize) -> Result<usize, HookError> {
        let address = slot as *const c_void;
        let size = mem::size_of::<usize>();
        let mut previous_protection = PAGE_PROTECTION_FLAGS(0);
        unsafe { VirtualProtect(address, size, PAGE_READWRITE, &mut previous_protection) }
            .map_err(|_| HookError::Protect { address: slot })?;

        // SAFETY: the slot is writable until the protection is put back below.
        let previous = unsafe {
            let previous = ptr::read_volatile(slot as *const usize);
            ptr::write_volatile(slot as *mut usize, value);
            previous
        };

        let mut ignored = PAGE_PROTECTION_FLAGS(0);
        if unsafe { VirtualProtect(address, size, previous_protection, &mut ignored) }.is_err() {
            debug!(slot = format_args!("{slot:#x}"), "import slot left writable");
        }
        Ok(previous)
    }

    fn redirect_entry(&mut self, entry: usize, replacement: usize) -> Result<usize, HookError> {
        let redirect_error = |err: retour::Error| HookError::Redirect {
            address: entry,
            reason: err.to_string(),
        };
        // SAFETY: `entry` is an exported function and `replacement` a thunk
        // with the same signature.
        let detour =
            unsafe { RawDetour::new(entry as *const (), replacement as *const ()) }
                .map_err(redirect_error)?;
        unsafe { detour.enable() }.map_err(redirect_error)?;
        let trampoline = detour.trampoline() as *const () as usize;
        self.detours.insert(entry, Detour(detour));
        Ok(trampoline)
    }

    fn remove_redirect(&mut self, entry: usize) -> Result<(), HookError> {
        let Detour(detour) = self
            .detours
            .remove(&entry)
            .ok_or(HookError::NotRedirected { address: entry })?;
        unsafe { detour.disable() }.map_err(|err| HookError::Redirect {
            address: entry,
            reason: err.to_string(),
        })
    }
}

fn raw_handle(handle: ConsoleHandle) -> HANDLE {
    HANDLE(handle.0 as isize)
}

/// The host's console entry points, called through their unhooked originals.
pub struct WindowsConsole {
    read: ReadConsoleFn,
    write: WriteConsoleFn,
    set_env: SetEnvironmentVariableFn,
}

impl WindowsConsole {
    #[must_use]
    pub fn new(originals: Originals) -> Self {
        // SAFETY: the addresses are the originals recorded by the committed hook
        // set and have exactly these signatures.
        unsafe {
            Self {
                read: mem::transmute::<usize, ReadConsoleFn>(originals.read_console),
                write: mem::transmute::<usize, WriteConsoleFn>(originals.write_console),
                set_env: mem::transmute::<usize, SetEnvironmentVariableFn>(
                    originals.set_environment_variable,
                ),
            }
        }
    }
}

impl ConsoleHost for WindowsConsole {
    fn is_console_device(&self, handle: ConsoleHandle) -> bool {
        unsafe { GetFileType(raw_handle(handle)) == FILE_TYPE_CHAR }
    }

    fn std_handle(&self, stream: StdStream) -> ConsoleHandle {
        let id = match stream {
            StdStream::Input => STD_INPUT_HANDLE,
            StdStream::Output => STD_OUTPUT_HANDLE,
        };
        unsafe { GetStdHandle(id) }
            .map(|handle| ConsoleHandle(handle.0 as usize))
            .unwrap_or(ConsoleHandle(0))
    }

    fn console_mode(&self, handle: ConsoleHandle) -> Option<u32> {
        let mut mode = CONSOLE_MODE(0);
        unsafe { GetConsoleMode(raw_handle(handle), &mut mode) }
            .ok()
            .map(|()| mode.0)
    }

    fn set_console_mode(&self, handle: ConsoleHandle, mode: u32) -> HostResult<()> {
        unsafe { SetConsoleMode(raw_handle(handle), CONSOLE_MODE(mode)) }
            .map_err(|_| HostCallFailed)
    }

    fn read_console(
        &self,
        input: ConsoleHandle,
        buffer: &mut [u16],
        control: ReadControl,
    ) -> HostResult<u32> {
        let capacity = u32::try_from(buffer.len()).map_err(|_| HostCallFailed)?;
        let mut read = 0_u32;
        let ok = unsafe {
            (self.read)(
                input.as_raw(),
                buffer.as_mut_ptr(),
                capacity,
                &mut read,
                control.0,
            )
        };
        if ok == 0 {
            Err(HostCallFailed)
        } else {
            Ok(read)
        }
    }

    fn write_console(&self, output: ConsoleHandle, text: &[u16]) -> HostResult<u32> {
        let length = u32::try_from(text.len()).map_err(|_| HostCallFailed)?;
        let mut written = 0_u32;
        let ok = unsafe {
            (self.write)(
                output.as_raw(),
                text.as_ptr(),
                length,
                &mut written,
                ptr::null_mut(),
            )
        };
        if ok == 0 {
            Err(HostCallFailed)
        } else {
            Ok(written)
        }
    }

    fn get_environment_variable(&self, name: &U16Str) -> Option<U16String> {
        let name = U16CString::from_ustr(name).ok()?;
        let name = PCWSTR(name.as_ptr());
        // The size query includes the terminating NUL; a value can change
        // between the two calls, so the second result is re-checked.
        let needed = unsafe { GetEnvironmentVariableW(name, None) } as usize;
        if needed == 0 {
            return None;
        }
        let mut value = vec![0_u16; needed];
        let length = unsafe { GetEnvironmentVariableW(name, Some(&mut value)) } as usize;
        if length == 0 || length >= needed {
            return None;
        }
        value.truncate(length);
        Some(U16String::from_vec(value))
    }

    fn set_environment_variable(&self, name: &U16Str, value: Option<&U16Str>) -> HostResult<()> {
        let name = U16CString::from_ustr(name).map_err(|_| HostCallFailed)?;
        let value = value
            .map(U16CString::from_ustr)
            .transpose()
            .map_err(|_| HostCallFailed)?;
        let value_ptr = value.as_ref().map_or(ptr::null(), |value| value.as_ptr());
        if unsafe { (self.set_env)(name.as_ptr(), value_ptr) } == 0 {
            Err(HostCallFailed)
        } else {
            Ok(())
        }
    }
}

/// Message-table lookups in the host executable.
pub struct MuiLocalizer {
    module: isize,
}

impl MuiLocalizer {
    #[must_use]
    pub fn for_host() -> Self {
        let module = unsafe { GetModuleHandleW(None) }
            .map(|handle| handle.0)
            .unwrap_or(0);
        Self { module }
    }
}

impl Localizer for MuiLocalizer {
    fn lookup(&self, message_id: u32) -> Option<U16String> {
        if self.module == 0 {
            return None;
        }
        let mut buffer = vec![0_u16; MESSAGE_CAPACITY];
        let length = unsafe {
            FormatMessageW(
                FORMAT_MESSAGE_FROM_HMODULE | FORMAT_MESSAGE_IGNORE_INSERTS,
                Some(self.module as *const c_void),
                message_id,
                0,
                PWSTR(buffer.as_mut_ptr()),
                MESSAGE_CAPACITY as u32,
                None,
            )
        } as usize;
        if length == 0 {
            debug!(message_id, "message not found in host module");
            return None;
        }
        buffer.truncate(length);
        Some(U16String::from_vec(buffer))
    }
}

/// Whether the host executable is loaded in this process.
#[must_use]
pub fn host_module_loaded() -> bool {
    module_handle(&ModuleRef::named(HOST_MODULE)).is_ok()
}

/// The process command line, lossily decoded.
#[must_use]
pub fn command_line() -> String {
    let line = unsafe { GetCommandLineW() };
    if line.is_null() {
        return String::new();
    }
    // SAFETY: the loader keeps the command line alive for the process lifetime.
    unsafe { widestring::U16CStr::from_ptr_str(line.0) }.to_string_lossy()
}

/// Major and minor OS version as reported to this process.
#[must_use]
pub fn os_version() -> (u32, u32) {
    let mut info = OSVERSIONINFOW {
        dwOSVersionInfoSize: mem::size_of::<OSVERSIONINFOW>() as u32,
        ..Default::default()
    };
    match unsafe { GetVersionExW(&mut info) } {
        Ok(()) => (info.dwMajorVersion, info.dwMinorVersion),
        // Unknown: assume a current release.
        Err(_) => (10, 0),
    }
}
