//! Prompt capture so the bridge knows when the host is asking for a command line.
//!
//! The host's `prompt` variable is prefixed with [`PROMPT_TAG`]. When the host
//! expands and writes its prompt, the write starts with the tag, which is how a
//! prompt write is told apart from any other console output.

use tracing::debug;
use widestring::{U16Str, U16String};

use crate::console::{ConsoleHost, HostResult};

/// Name of the host's prompt variable.
pub const PROMPT_VAR: &str = "prompt";

/// Value assigned when the host has no prompt set: current path, then `>`.
pub const DEFAULT_PROMPT: &str = "$p$g";

/// Marker prefixed to the prompt variable. Contains no `$` codes so the host
/// writes it back verbatim.
pub const PROMPT_TAG: &str = "\u{1}cmdline-hook\u{1}";

const CURRENT_LINE_LIMIT: usize = 1024;

fn units(text: &str) -> Vec<u16> {
    text.encode_utf16().collect()
}

fn strip_tags<'a>(mut value: &'a [u16], tag: &[u16]) -> &'a [u16] {
    while !tag.is_empty() && value.starts_with(tag) {
        value = &value[tag.len()..];
    }
    value
}

/// Prefix the host's prompt variable with the hidden tag.
///
/// An unset variable is first given [`DEFAULT_PROMPT`]. Tags already present in
/// the value are dropped before the new one is applied, so a value copied from
/// the tagged variable (`set prompt=%prompt%`) still carries exactly one tag.
///
/// # Errors
///
/// Returns an error if the host refuses to set the variable.
pub fn tag_environment_prompt(host: &dyn ConsoleHost) -> HostResult<()> {
    let name = U16String::from_str(PROMPT_VAR);
    let value = match host.get_environment_variable(&name) {
        Some(value) => value,
        None => {
            let default = U16String::from_str(DEFAULT_PROMPT);
            host.set_environment_variable(&name, Some(default.as_ustr()))?;
            host.get_environment_variable(&name).unwrap_or(default)
        }
    };

    let tag = units(PROMPT_TAG);
    let mut tagged = tag.clone();
    tagged.extend_from_slice(strip_tags(value.as_slice(), &tag));
    host.set_environment_variable(&name, Some(U16Str::from_slice(&tagged)))?;
    debug!(prompt = %value.to_string_lossy(), "tagged prompt variable");
    Ok(())
}

/// Remove the hidden tag from the host's prompt variable, if present.
///
/// # Errors
///
/// Returns an error if the host refuses to set the variable.
pub fn untag_environment_prompt(host: &dyn ConsoleHost) -> HostResult<()> {
    let name = U16String::from_str(PROMPT_VAR);
    let Some(value) = host.get_environment_variable(&name) else {
        return Ok(());
    };
    let tag = units(PROMPT_TAG);
    let stripped = strip_tags(value.as_slice(), &tag);
    if stripped.len() == value.len() {
        return Ok(());
    }
    host.set_environment_variable(&name, Some(U16Str::from_slice(stripped)))
}

/// Most recently captured prompt plus the console line currently being written.
#[derive(Debug)]
pub struct PromptTracker {
    prompt: Option<U16String>,
    current_line: Vec<u16>,
    tag: Vec<u16>,
}

impl PromptTracker {
    #[must_use]
    pub fn new() -> Self {
        Self {
            prompt: None,
            current_line: Vec::new(),
            tag: units(PROMPT_TAG),
        }
    }

    /// Inspect a console write.
    ///
    /// A tagged write replaces the stored prompt with the text after the tag and
    /// returns true. An untagged write invalidates the stored prompt (truncating
    /// it to empty) and returns false.
    pub fn capture_prompt(&mut self, text: &[u16]) -> bool {
        if text.starts_with(&self.tag) {
            let prompt = U16String::from_vec(text[self.tag.len()..].to_vec());
            debug!(prompt = %prompt.to_string_lossy(), "captured tagged prompt");
            self.prompt = Some(prompt);
            self.current_line.clear();
            return true;
        }

        if let Some(prompt) = self.prompt.as_mut() {
            prompt.clear();
        }
        self.track_line(text);
        false
    }

    /// The captured prompt, or `None` when nothing current is stored.
    #[must_use]
    pub fn captured_prompt(&self) -> Option<&U16Str> {
        self.prompt
            .as_deref()
            .filter(|prompt| !prompt.is_empty())
    }

    /// Text written since the last line break by untagged writes.
    #[must_use]
    pub fn current_line(&self) -> &[u16] {
        &self.current_line
    }

    fn track_line(&mut self, text: &[u16]) {
        let tail = match text
            .iter()
            .rposition(|&unit| unit == u16::from(b'\n') || unit == u16::from(b'\r'))
        {
            Some(index) => {
                self.current_line.clear();
                &text[index + 1..]
            }
            None => text,
        };
        self.current_line.extend_from_slice(tail);
        if self.current_line.len() > CURRENT_LINE_LIMIT {
            let excess = self.current_line.len() - CURRENT_LINE_LIMIT;
            self.current_line.drain(..excess);
        }
    }
}

impl Default for PromptTracker {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::console::test_support::FakeConsole;

    fn tagged(text: &str) -> Vec<u16> {
        units(&format!("{PROMPT_TAG}{text}"))
    }

    #[test]
    fn tag_applies_default_when_prompt_unset() {
        let console = FakeConsole::new();
        tag_environment_prompt(&console).expect("tag prompt");
        assert_eq!(
            console.env("prompt").as_deref(),
            Some(format!("{PROMPT_TAG}$p$g").as_str())
        );
    }

    #[test]
    fn tag_wraps_existing_value_and_survives_external_reset() {
        let console = FakeConsole::new();
        console.set_env("PROMPT", "$n$g");
        tag_environment_prompt(&console).expect("tag prompt");
        assert_eq!(
            console.env("prompt").as_deref(),
            Some(format!("{PROMPT_TAG}$n$g").as_str())
        );

        console.set_env("prompt", "[$t] $p$g");
        tag_environment_prompt(&console).expect("retag prompt");
        assert_eq!(
            console.env("prompt").as_deref(),
            Some(format!("{PROMPT_TAG}[$t] $p$g").as_str())
        );
    }

    #[test]
    fn tag_does_not_stack_on_copied_tagged_value() {
        let console = FakeConsole::new();
        console.set_env("prompt", &format!("{PROMPT_TAG}{PROMPT_TAG}$g"));
        tag_environment_prompt(&console).expect("tag prompt");
        assert_eq!(
            console.env("prompt").as_deref(),
            Some(format!("{PROMPT_TAG}$g").as_str())
        );
    }

    #[test]
    fn untag_restores_plain_value() {
        let console = FakeConsole::new();
        console.set_env("prompt", "$p$g");
        tag_environment_prompt(&console).expect("tag prompt");
        untag_environment_prompt(&console).expect("untag prompt");
        assert_eq!(console.env("prompt").as_deref(), Some("$p$g"));
    }

    #[test]
    fn capture_stores_tagged_prompt_and_untagged_write_clears_it() {
        let mut tracker = PromptTracker::new();
        assert!(tracker.capture_prompt(&tagged("X")));
        assert_eq!(
            tracker.captured_prompt().map(U16Str::to_string_lossy).as_deref(),
            Some("X")
        );

        assert!(!tracker.capture_prompt(&units("Y")));
        assert!(tracker.captured_prompt().is_none());
    }

    #[test]
    fn untagged_write_without_prompt_has_no_effect_on_prompt() {
        let mut tracker = PromptTracker::new();
        assert!(!tracker.capture_prompt(&units("hello")));
        assert!(tracker.captured_prompt().is_none());
    }

    #[test]
    fn new_capture_replaces_previous_prompt() {
        let mut tracker = PromptTracker::new();
        tracker.capture_prompt(&tagged("C:\\>"));
        tracker.capture_prompt(&tagged("D:\\work>"));
        assert_eq!(
            tracker.captured_prompt().map(U16Str::to_string_lossy).as_deref(),
            Some("D:\\work>")
        );
    }

    #[test]
    fn current_line_follows_untagged_writes_across_breaks() {
        let mut tracker = PromptTracker::new();
        tracker.capture_prompt(&units("^C\r\nTerminate batch "));
        tracker.capture_prompt(&units("job (Y/N)? "));
        assert_eq!(
            String::from_utf16_lossy(tracker.current_line()),
            "Terminate batch job (Y/N)? "
        );
        tracker.capture_prompt(&tagged("C:\\>"));
        assert!(tracker.current_line().is_empty());
    }

    #[test]
    fn current_line_is_bounded() {
        let mut tracker = PromptTracker::new();
        let long = "x".repeat(CURRENT_LINE_LIMIT + 10);
        tracker.capture_prompt(&units(&long));
        tracker.capture_prompt(&units("end"));
        assert_eq!(tracker.current_line().len(), CURRENT_LINE_LIMIT);
        assert!(String::from_utf16_lossy(tracker.current_line()).ends_with("end"));
    }
}
