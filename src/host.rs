//! Facts about the host process that decide whether and where to hook.

/// Executable the hooks are written for.
pub const HOST_MODULE: &str = "cmd.exe";

/// Whether the host will read commands interactively.
///
/// The host's own switch parsing only looks at the character after each `/`:
/// the first `/c` means "run and exit", the first `/k` means "run and stay".
/// Neither present means an interactive session.
#[must_use]
pub fn is_interactive(command_line: &str) -> bool {
    let mut chars = command_line.chars();
    while chars.by_ref().any(|ch| ch == '/') {
        match chars.clone().next().map(|ch| ch.to_ascii_lowercase()) {
            Some('c') => return false,
            Some('k') => return true,
            _ => {}
        }
    }
    true
}

/// Module that exports the console entry points on this OS version.
///
/// Windows 8 (6.2) moved the implementations into `kernelbase.dll`.
#[must_use]
pub fn kernel_module(major: u32, minor: u32) -> &'static str {
    if (major, minor) >= (6, 2) {
        "kernelbase.dll"
    } else {
        "kernel32.dll"
    }
}
