//! The state machine behind the intercepted read, write and set-variable calls.
//!
//! Each intercepted call either completes here or is forwarded unchanged to the
//! original entry point, so the host always sees the contract of the API it
//! called.

use std::sync::Arc;

use tracing::debug;
use widestring::{U16Str, U16String};

use crate::auto_answer::AutoAnswerPolicy;
use crate::bounded_text::BoundedText;
use crate::collaborators::{DoskeyQueue, EditOutcome, LineEditor, Localizer, SettingsSource};
use crate::console::{
    ConsoleHandle, ConsoleHost, ConsoleModeSnapshot, HostResult, ReadControl, StdStream,
};
use crate::prompt::{tag_environment_prompt, PromptTracker, PROMPT_VAR};

const CRLF: [u16; 2] = [b'\r' as u16, b'\n' as u16];
const EXIT_COMMAND: &str = "exit";

/// External services the bridge drives.
pub struct Collaborators {
    pub editor: Box<dyn LineEditor>,
    pub doskey: Box<dyn DoskeyQueue>,
    pub localizer: Box<dyn Localizer>,
    pub settings: Box<dyn SettingsSource>,
}

pub struct LineEditingBridge {
    host: Arc<dyn ConsoleHost>,
    editor: Box<dyn LineEditor>,
    doskey: Box<dyn DoskeyQueue>,
    localizer: Box<dyn Localizer>,
    settings: Box<dyn SettingsSource>,
    prompt: PromptTracker,
    auto_answer: AutoAnswerPolicy,
    input_consumed: bool,
}

fn is_prompt_var(name: &U16Str) -> bool {
    let expected = PROMPT_VAR.encode_utf16();
    name.len() == PROMPT_VAR.len()
        && name
            .as_slice()
            .iter()
            .zip(expected)
            .all(|(&unit, want)| ascii_lower(unit) == want)
}

fn ascii_lower(unit: u16) -> u16 {
    if (u16::from(b'A')..=u16::from(b'Z')).contains(&unit) {
        unit + 32
    } else {
        unit
    }
}

impl LineEditingBridge {
    pub fn new(host: Arc<dyn ConsoleHost>, collaborators: Collaborators) -> Self {
        let Collaborators {
            editor,
            doskey,
            localizer,
            settings,
        } = collaborators;
        Self {
            host,
            editor,
            doskey,
            localizer,
            settings,
            prompt: PromptTracker::new(),
            auto_answer: AutoAnswerPolicy::new(),
            input_consumed: false,
        }
    }

    #[must_use]
    pub fn host(&self) -> &Arc<dyn ConsoleHost> {
        &self.host
    }

    #[must_use]
    pub fn prompt_tracker(&self) -> &PromptTracker {
        &self.prompt
    }

    #[must_use]
    pub fn shell_name(&self) -> String {
        self.editor.shell_name()
    }

    /// True once the current read has taken input the host can no longer get
    /// back (keys read by the editor, a queued doskey command).
    #[must_use]
    pub fn input_consumed(&self) -> bool {
        self.input_consumed
    }

    /// Intercepted `ReadConsoleW`. Returns the number of units placed in `buffer`.
    ///
    /// Console modes of standard input and output are restored before returning,
    /// whichever path the read takes.
    ///
    /// # Errors
    ///
    /// Only forwarded reads can fail; the error is the original call's.
    pub fn read_console(
        &mut self,
        input: ConsoleHandle,
        buffer: &mut [u16],
        control: ReadControl,
    ) -> HostResult<u32> {
        let host = Arc::clone(&self.host);
        let _modes = ConsoleModeSnapshot::capture(host.as_ref());
        self.input_consumed = false;

        if !host.is_console_device(input) {
            return host.read_console(input, buffer, control);
        }

        // The host reads y/n confirmations one character at a time.
        if buffer.len() == 1 {
            return self.single_char_read(host.as_ref(), input, buffer, control);
        }

        // No current prompt: line input unrelated to command entry (`set /p`,
        // piped batch input).
        let Some(prompt) = self.prompt.captured_prompt().map(U16Str::to_ustring) else {
            return host.read_console(input, buffer, control);
        };

        let mut line = BoundedText::new(buffer.len());
        if self.doskey.next_command(&mut line) {
            self.input_consumed = true;
            debug!(line = %line.to_string_lossy(), "replaying queued doskey command");
        } else {
            let outcome = self.edit_line(host.as_ref(), &prompt, &mut line);
            if outcome == EditOutcome::Line {
                self.doskey.begin(&mut line);
            }
        }

        // The host treats a line without CRLF as the start of a multi-line command.
        line.push_units(&CRLF);
        let count = line.copy_to(buffer);
        Ok(u32::try_from(count).unwrap_or(u32::MAX))
    }

    fn single_char_read(
        &mut self,
        host: &dyn ConsoleHost,
        input: ConsoleHandle,
        buffer: &mut [u16],
        control: ReadControl,
    ) -> HostResult<u32> {
        let mode = self.settings.terminate_autoanswer();
        match self
            .auto_answer
            .check(mode, self.localizer.as_ref(), &self.prompt)
        {
            Some(answer) => {
                buffer[0] = self.auto_answer.next_reply(answer);
                debug!(reply = buffer[0], "auto-answered confirmation prompt");
                Ok(1)
            }
            None => host.read_console(input, buffer, control),
        }
    }

    /// Runs the editor until it yields a line. `EndOfInput` means `exit` was
    /// substituted.
    fn edit_line(
        &mut self,
        host: &dyn ConsoleHost,
        prompt: &U16String,
        line: &mut BoundedText,
    ) -> EditOutcome {
        self.input_consumed = true;
        loop {
            line.clear();
            match self.editor.edit_line(prompt, line) {
                EditOutcome::Line => return EditOutcome::Line,
                EditOutcome::EndOfInput if self.settings.ctrld_exits() => {
                    debug!("end of input; submitting exit");
                    line.set(EXIT_COMMAND);
                    return EditOutcome::EndOfInput;
                }
                EditOutcome::EndOfInput => {
                    let output = host.std_handle(StdStream::Output);
                    if host.write_console(output, &CRLF).is_err() {
                        debug!("line break after end of input was not written");
                    }
                }
            }
        }
    }

    /// Intercepted `WriteConsoleW`. Returns the number of units reported written.
    ///
    /// # Errors
    ///
    /// Only forwarded writes can fail; the error is the original call's.
    pub fn write_console(&mut self, output: ConsoleHandle, text: &[u16]) -> HostResult<u32> {
        if !self.host.is_console_device(output) {
            return self.host.write_console(output, text);
        }

        // The editor draws the prompt itself.
        if self.prompt.capture_prompt(text) {
            return Ok(u32::try_from(text.len()).unwrap_or(u32::MAX));
        }

        self.host.write_console(output, text)
    }

    /// Intercepted `SetEnvironmentVariableW`.
    ///
    /// # Errors
    ///
    /// Returns the original call's failure; re-tagging failures are only logged.
    pub fn set_environment_variable(
        &mut self,
        name: &U16Str,
        value: Option<&U16Str>,
    ) -> HostResult<()> {
        let result = self.host.set_environment_variable(name, value);
        if is_prompt_var(name) && tag_environment_prompt(self.host.as_ref()).is_err() {
            debug!("prompt variable could not be re-tagged");
        }
        result
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::collaborators::AutoAnswerMode;
    use crate::console::test_support::{PIPE, STDIN, STDOUT};
    use crate::prompt::PROMPT_TAG;

    fn show_prompt(bridge: &mut LineEditingBridge, prompt: &str) {
        let text = units(&format!("{PROMPT_TAG}{prompt}"));
        assert_eq!(bridge.write_console(STDOUT, &text), Ok(text.len() as u32));
    }

    fn read_line(bridge: &mut LineEditingBridge, capacity: usize) -> (u32, String) {
        let mut buffer = vec![0_u16; capacity];
        let count = bridge
            .read_console(STDIN, &mut buffer, ReadControl::none())
            .expect("read succeeds");
        (
            count,
            String::from_utf16_lossy(&buffer[..count as usize]),
        )
    }

    #[test]
    fn tagged_prompt_write_is_swallowed_and_untagged_write_forwarded() {
        let harness = Harness::new();
        let mut bridge = harness.bridge(DEFAULTS);
        show_prompt(&mut bridge, "C:\\>");
        assert!(harness.console.written().is_empty());

        let text = units("Volume in drive C");
        assert_eq!(bridge.write_console(STDOUT, &text), Ok(text.len() as u32));
        assert_eq!(harness.console.written(), vec!["Volume in drive C".to_string()]);
        assert!(bridge.prompt_tracker().captured_prompt().is_none());
    }

    #[test]
    fn write_to_non_console_is_forwarded_without_capture() {
        let harness = Harness::new();
        let mut bridge = harness.bridge(DEFAULTS);
        let text = units(&format!("{PROMPT_TAG}C:\\>"));
        bridge.write_console(PIPE, &text).expect("forwarded write");
        assert_eq!(harness.console.written().len(), 1);
        assert!(bridge.prompt_tracker().captured_prompt().is_none());
    }

    #[test]
    fn read_with_prompt_runs_editor_and_appends_crlf() {
        let harness = Harness::new();
        harness.script(&[Some("dir /w")]);
        let mut bridge = harness.bridge(DEFAULTS);
        show_prompt(&mut bridge, "C:\\>");

        let (count, line) = read_line(&mut bridge, 64);
        assert_eq!(line, "dir /w\r\n");
        assert_eq!(count, 8);
        let log = harness.editor.lock().expect("editor log");
        assert_eq!(log.prompts, vec!["C:\\>".to_string()]);
    }

    #[test]
    fn read_without_prompt_is_forwarded() {
        let harness = Harness::new();
        harness.console.queue_input("yes\r\n");
        let mut bridge = harness.bridge(DEFAULTS);

        let (_, line) = read_line(&mut bridge, 64);
        assert_eq!(line, "yes\r\n");
        assert_eq!(harness.console.forwarded_reads(), 1);
        assert_eq!(harness.editor_calls(), 0);
    }

    #[test]
    fn read_from_non_console_is_forwarded() {
        let harness = Harness::new();
        let mut bridge = harness.bridge(DEFAULTS);
        show_prompt(&mut bridge, "C:\\>");
        let mut buffer = [0_u16; 16];
        bridge
            .read_console(PIPE, &mut buffer, ReadControl::none())
            .expect("forwarded read");
        assert_eq!(harness.console.forwarded_reads(), 1);
        assert_eq!(harness.editor_calls(), 0);
    }

    #[test]
    fn queued_doskey_command_skips_editor() {
        let harness = Harness::new();
        harness.script(&[Some("cd src $T dir")]);
        let mut bridge = harness.bridge(DEFAULTS);
        show_prompt(&mut bridge, "C:\\>");

        assert_eq!(read_line(&mut bridge, 64).1, "cd src\r\n");
        assert_eq!(harness.editor_calls(), 1);

        assert_eq!(read_line(&mut bridge, 64).1, "dir\r\n");
        assert_eq!(harness.editor_calls(), 1);

        let log = harness.doskey.lock().expect("doskey log");
        assert_eq!(log.begun, vec!["cd src $T dir".to_string()]);
    }

    #[test]
    fn end_of_input_retries_until_a_line_arrives() {
        let harness = Harness::new();
        harness.script(&[None, None, Some("ver")]);
        let mut bridge = harness.bridge(DEFAULTS);
        show_prompt(&mut bridge, "C:\\>");

        assert_eq!(read_line(&mut bridge, 64).1, "ver\r\n");
        assert_eq!(harness.editor_calls(), 3);
        assert_eq!(
            harness.console.written(),
            vec!["\r\n".to_string(), "\r\n".to_string()]
        );
    }

    #[test]
    fn end_of_input_submits_exit_when_configured() {
        let harness = Harness::new();
        harness.script(&[None]);
        let mut bridge = harness.bridge(FixedSettings {
            ctrld_exits: true,
            ..DEFAULTS
        });
        show_prompt(&mut bridge, "C:\\>");

        assert_eq!(read_line(&mut bridge, 64).1, "exit\r\n");
        assert_eq!(harness.editor_calls(), 1);
        assert!(harness.console.written().is_empty());
        assert!(harness.doskey.lock().expect("doskey log").begun.is_empty());
    }

    #[test]
    fn line_is_truncated_to_buffer_capacity() {
        let harness = Harness::new();
        harness.script(&[Some("echo truncated")]);
        let mut bridge = harness.bridge(DEFAULTS);
        show_prompt(&mut bridge, "C:\\>");

        // "echo " is trimmed by doskey, leaving room for the carriage return only.
        let (count, line) = read_line(&mut bridge, 6);
        assert_eq!(count, 5);
        assert_eq!(line, "echo\r");
    }

    #[test]
    fn line_filling_buffer_drops_crlf() {
        let harness = Harness::new();
        harness.script(&[Some("dir/w")]);
        let mut bridge = harness.bridge(DEFAULTS);
        show_prompt(&mut bridge, "C:\\>");

        let mut buffer = [0xFFFF_u16; 6];
        let count = bridge
            .read_console(STDIN, &mut buffer, ReadControl::none())
            .expect("read succeeds");
        assert_eq!(count, 5);
        assert_eq!(String::from_utf16_lossy(&buffer[..5]), "dir/w");
        assert_eq!(buffer[5], 0);
    }

    #[test]
    fn console_modes_are_restored_on_every_read_path() {
        let harness = Harness::new();
        harness.script(&[Some("a $T b"), None, Some("c")]);
        let mut bridge = harness.bridge(DEFAULTS);
        let before = harness.console.modes();

        // forwarded (no prompt)
        read_line(&mut bridge, 16);
        assert_eq!(harness.console.modes(), before);

        show_prompt(&mut bridge, "C:\\>");
        // editor path
        read_line(&mut bridge, 16);
        assert_eq!(harness.console.modes(), before);
        // doskey path
        read_line(&mut bridge, 16);
        assert_eq!(harness.console.modes(), before);
        // end-of-input retry path
        read_line(&mut bridge, 16);
        assert_eq!(harness.console.modes(), before);
        // single character path
        read_line(&mut bridge, 1);
        assert_eq!(harness.console.modes(), before);
    }

    #[test]
    fn single_char_read_forwards_when_not_armed() {
        let harness = Harness::new();
        harness.console.queue_input("y");
        let mut bridge = harness.bridge(DEFAULTS);
        let text = units("Terminate batch job (Y/N)? ");
        bridge.write_console(STDOUT, &text).expect("write");

        assert_eq!(read_line(&mut bridge, 1), (1, "y".to_string()));
        assert_eq!(harness.console.forwarded_reads(), 1);
    }

    #[test]
    fn auto_answer_cycles_answer_and_line_feed() {
        let harness = Harness::new();
        let mut bridge = harness.bridge(FixedSettings {
            auto_answer: AutoAnswerMode::Deny,
            ..DEFAULTS
        });
        let text = units("^C\r\nTerminate batch job (Y/N)? ");
        bridge.write_console(STDOUT, &text).expect("write");

        assert_eq!(read_line(&mut bridge, 1), (1, "n".to_string()));
        assert_eq!(read_line(&mut bridge, 1), (1, "\n".to_string()));
        assert_eq!(read_line(&mut bridge, 1), (1, "n".to_string()));
        assert_eq!(harness.console.forwarded_reads(), 0);
    }

    #[test]
    fn set_prompt_variable_is_retagged_case_insensitively() {
        let harness = Harness::new();
        let mut bridge = harness.bridge(DEFAULTS);
        let name = U16String::from_str("PrOmPt");
        let value = U16String::from_str("$t$g");
        bridge
            .set_environment_variable(&name, Some(&value))
            .expect("set prompt");
        assert_eq!(
            harness.console.env("prompt").as_deref(),
            Some(format!("{PROMPT_TAG}$t$g").as_str())
        );
    }

    #[test]
    fn set_other_variable_is_left_alone() {
        let harness = Harness::new();
        let mut bridge = harness.bridge(DEFAULTS);
        let name = U16String::from_str("PROMPTS");
        let value = U16String::from_str("$g");
        bridge
            .set_environment_variable(&name, Some(&value))
            .expect("set variable");
        assert_eq!(harness.console.env("PROMPTS").as_deref(), Some("$g"));
        assert!(harness.console.env("prompt").is_none());
    }
}
