//! Doctor report: what the hook would do in a given process, and with which settings.

use std::{env, fmt::Display};

use crate::collaborators::{AutoAnswerMode, SettingsSource};
use crate::config::{settings_file_path, Settings};
use crate::host;
use crate::telemetry::tracing_log_path;

/// Structured text report builder used by `--doctor`.
pub struct DoctorReport {
    lines: Vec<String>,
}

impl DoctorReport {
    pub fn new(title: &str) -> Self {
        Self {
            lines: vec![title.to_string()],
        }
    }

    /// Append a section heading and blank separator line.
    pub fn section(&mut self, title: &str) {
        self.lines.push(String::new());
        self.lines.push(format!("{title}:"));
    }

    pub fn push_kv(&mut self, key: &str, value: impl Display) {
        self.lines.push(format!("  {key}: {value}"));
    }

    pub fn render(&self) -> String {
        self.lines.join("\n")
    }
}

fn auto_answer_label(mode: AutoAnswerMode) -> &'static str {
    match mode {
        AutoAnswerMode::Disabled => "disabled",
        AutoAnswerMode::Deny => "deny",
        AutoAnswerMode::Accept => "accept",
    }
}

fn yes_no(value: bool) -> &'static str {
    if value {
        "yes"
    } else {
        "no"
    }
}

/// OS version to pick the kernel module for; `None` off Windows.
fn os_version() -> Option<(u32, u32)> {
    #[cfg(windows)]
    {
        Some(crate::hook::windows::os_version())
    }
    #[cfg(not(windows))]
    {
        None
    }
}

/// Build the report.
///
/// `settings` is the load result so a broken settings file is reported
/// instead of aborting. `command_line` defaults to the host's bare name.
pub fn base_doctor_report(
    settings: &anyhow::Result<Settings>,
    command_line: Option<&str>,
) -> DoctorReport {
    let mut report = DoctorReport::new("cmdline-hook doctor");
    report.push_kv("version", env!("CARGO_PKG_VERSION"));
    report.push_kv("os", format!("{}/{}", env::consts::OS, env::consts::ARCH));

    report.section("Host");
    report.push_kv("module", host::HOST_MODULE);
    match os_version() {
        Some((major, minor)) => {
            report.push_kv("os_version", format!("{major}.{minor}"));
            report.push_kv("kernel_module", host::kernel_module(major, minor));
        }
        None => report.push_kv("kernel_module", "n/a (not windows)"),
    }
    let command_line = command_line.unwrap_or(host::HOST_MODULE);
    report.push_kv("command_line", command_line);
    report.push_kv("interactive", yes_no(host::is_interactive(command_line)));

    report.section("Config");
    report.push_kv(
        "settings_file",
        settings_file_path()
            .map(|path| path.display().to_string())
            .unwrap_or_else(|| "unavailable".to_string()),
    );
    match settings {
        Ok(settings) => {
            report.push_kv("validation", "ok");
            report.push_kv(
                "terminate_autoanswer",
                auto_answer_label(settings.terminate_autoanswer()),
            );
            report.push_kv("ctrld_exits", yes_no(settings.ctrld_exits));
            report.push_kv(
                "logging",
                if settings.logging {
                    "enabled"
                } else {
                    "disabled"
                },
            );
        }
        Err(err) => report.push_kv("validation", format!("error: {err:#}")),
    }
    report.push_kv("trace_log", tracing_log_path().display());

    report
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn report_renders_title_and_indented_pairs() {
        let mut report = DoctorReport::new("title");
        report.section("Section");
        report.push_kv("key", 3);
        assert_eq!(report.render(), "title\n\nSection:\n  key: 3");
    }

    #[test]
    fn report_describes_settings_and_interactivity() {
        let settings = Ok(Settings {
            terminate_autoanswer: 2,
            ctrld_exits: true,
            logging: false,
        });
        let rendered = base_doctor_report(&settings, Some("cmd.exe /c dir")).render();
        assert!(rendered.contains("  interactive: no"));
        assert!(rendered.contains("  terminate_autoanswer: accept"));
        assert!(rendered.contains("  ctrld_exits: yes"));
        assert!(rendered.contains("  logging: disabled"));
        assert!(rendered.contains("  validation: ok"));
    }

    #[test]
    fn report_keeps_going_when_settings_are_broken() {
        let settings = Settings::parse("terminate_autoanswer = \"sometimes\"");
        let rendered = base_doctor_report(&settings, None).render();
        assert!(rendered.contains("  validation: error:"));
        assert!(rendered.contains("  interactive: yes"));
        assert!(!rendered.contains("ctrld_exits"));
    }
}
