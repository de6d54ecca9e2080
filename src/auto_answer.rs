//! Automatic replies to the host's "terminate batch job?" confirmation.
//!
//! The host reads that confirmation one character at a time and expects a line
//! feed after the answer, so replies come in two steps: the answer, then `'\n'`.

use tracing::info;

use crate::collaborators::{AutoAnswerMode, Localizer};
use crate::prompt::PromptTracker;

/// Host message id of the localized "Terminate batch job (Y/N)?" text.
pub const TERMINATE_PROMPT_MESSAGE: u32 = 0x237B;

/// Host message id of the localized no/yes letter pair.
pub const NO_YES_MESSAGE: u32 = 0x2328;

const FALLBACK_PROMPT: &str = "Terminate batch job (Y/N)? ";
const FALLBACK_NO_YES: [u16; 2] = [b'n' as u16, b'y' as u16];
const LINE_FEED: u16 = b'\n' as u16;

#[derive(Debug, Clone, PartialEq, Eq)]
struct ResolvedPrompt {
    phrase: Vec<u16>,
    deny: u16,
    accept: u16,
}

impl ResolvedPrompt {
    fn resolve(localizer: &dyn Localizer) -> Self {
        let phrase = localizer
            .lookup(TERMINATE_PROMPT_MESSAGE)
            .map(|text| first_line(text.as_slice()).to_vec())
            .filter(|phrase| !phrase.is_empty());

        let Some(phrase) = phrase else {
            info!("using fallback auto-answer prompt");
            return Self::fallback();
        };

        let no_yes = localizer
            .lookup(NO_YES_MESSAGE)
            .map(|text| text.into_vec())
            .filter(|pair| pair.len() >= 2)
            .unwrap_or_else(|| FALLBACK_NO_YES.to_vec());

        info!(
            prompt = %String::from_utf16_lossy(&phrase),
            no_yes = %String::from_utf16_lossy(&no_yes[..2]),
            "resolved auto-answer prompt"
        );
        Self {
            phrase,
            deny: no_yes[0],
            accept: no_yes[1],
        }
    }

    fn fallback() -> Self {
        Self {
            phrase: FALLBACK_PROMPT.encode_utf16().collect(),
            deny: FALLBACK_NO_YES[0],
            accept: FALLBACK_NO_YES[1],
        }
    }
}

fn first_line(text: &[u16]) -> &[u16] {
    let end = text
        .iter()
        .position(|&unit| unit == u16::from(b'\r') || unit == LINE_FEED)
        .unwrap_or(text.len());
    &text[..end]
}

fn contains(haystack: &[u16], needle: &[u16]) -> bool {
    !needle.is_empty()
        && haystack.len() >= needle.len()
        && haystack.windows(needle.len()).any(|window| window == needle)
}

/// Recognizes the confirmation prompt and produces the reply sequence.
#[derive(Debug, Default)]
pub struct AutoAnswerPolicy {
    resolved: Option<ResolvedPrompt>,
    awaiting_terminator: bool,
}

impl AutoAnswerPolicy {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the answer character when the feature is enabled and the host is
    /// showing its confirmation prompt.
    pub fn check(
        &mut self,
        mode: AutoAnswerMode,
        localizer: &dyn Localizer,
        tracker: &PromptTracker,
    ) -> Option<u16> {
        if mode == AutoAnswerMode::Disabled {
            return None;
        }

        let resolved = self
            .resolved
            .get_or_insert_with(|| ResolvedPrompt::resolve(localizer));

        let showing = tracker
            .captured_prompt()
            .is_some_and(|prompt| contains(prompt.as_slice(), &resolved.phrase))
            || contains(tracker.current_line(), &resolved.phrase);
        if !showing {
            return None;
        }

        Some(match mode {
            AutoAnswerMode::Deny => resolved.deny,
            _ => resolved.accept,
        })
    }

    /// Next character of the reply: the answer, then a line feed, then the answer again.
    pub fn next_reply(&mut self, answer: u16) -> u16 {
        if self.awaiting_terminator {
            self.awaiting_terminator = false;
            LINE_FEED
        } else {
            self.awaiting_terminator = true;
            answer
        }
    }
}
