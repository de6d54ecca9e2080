//! Contracts for the services the bridge drives but does not implement.

use widestring::{U16Str, U16String};

use crate::bounded_text::BoundedText;

/// Result of one interactive line edit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EditOutcome {
    /// The buffer holds a submitted line.
    Line,
    /// The user signalled end of input (Ctrl-D) without submitting a line.
    EndOfInput,
}

/// The interactive line editor.
pub trait LineEditor: Send {
    /// Render `prompt`, run an editing session, and leave the submitted line in `buffer`.
    fn edit_line(&mut self, prompt: &U16Str, buffer: &mut BoundedText) -> EditOutcome;

    /// Name of the shell the editor is attached to.
    fn shell_name(&self) -> String;
}

/// Queue that replays one submitted line as several commands (doskey `$T`).
pub trait DoskeyQueue: Send {
    /// Register a freshly edited line. May rewrite `line` to its first sub-command.
    fn begin(&mut self, line: &mut BoundedText);

    /// Copy the next pending sub-command into `buffer`. False when the queue is empty.
    fn next_command(&mut self, buffer: &mut BoundedText) -> bool;
}

/// Host message-table lookup.
pub trait Localizer: Send {
    fn lookup(&self, message_id: u32) -> Option<U16String>;
}

/// How the host's "terminate batch job?" prompt is answered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AutoAnswerMode {
    #[default]
    Disabled,
    Deny,
    Accept,
}

impl AutoAnswerMode {
    /// Map the numeric setting: `<= 0` disabled, `1` deny, anything else accept.
    #[must_use]
    pub fn from_setting(value: i64) -> Self {
        match value {
            i64::MIN..=0 => Self::Disabled,
            1 => Self::Deny,
            _ => Self::Accept,
        }
    }

    #[must_use]
    pub fn as_setting(self) -> i64 {
        match self {
            Self::Disabled => 0,
            Self::Deny => 1,
            Self::Accept => 2,
        }
    }
}

/// Settings the bridge consults on every decision.
pub trait SettingsSource: Send {
    fn terminate_autoanswer(&self) -> AutoAnswerMode;

    fn ctrld_exits(&self) -> bool;
}
