//! Optional JSON trace log for diagnosing hooked sessions.

use crate::config::Settings;
use std::env;
use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::OnceLock;
use tracing_subscriber::fmt::time::UtcTime;

const TRACE_LOG_ENV: &str = "CMDLINE_HOOK_TRACE_LOG";

static TRACING_INIT: OnceLock<()> = OnceLock::new();

#[must_use]
pub fn tracing_log_path() -> PathBuf {
    env::var(TRACE_LOG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| env::temp_dir().join("cmdline_hook_trace.jsonl"))
}

fn init_tracing_once(settings: &Settings, once: &OnceLock<()>) {
    if !settings.logging {
        return;
    }

    let _ = once.get_or_init(|| {
        let path = tracing_log_path();
        // No fallback writer: stdout belongs to the host.
        let Ok(file) = OpenOptions::new().create(true).append(true).open(&path) else {
            return;
        };
        let subscriber = tracing_subscriber::fmt()
            .json()
            .with_timer(UtcTime::rfc_3339())
            .with_writer(file)
            .with_current_span(false)
            .with_span_list(false)
            .finish();
        let _ = tracing::subscriber::set_global_default(subscriber);
    });
}

/// Install the file subscriber once per process when `settings.logging` is set.
pub fn init_tracing(settings: &Settings) {
    init_tracing_once(settings, &TRACING_INIT);
}
