//! Diagnostic entrypoint: reports how the hook would behave without injecting anything.

use anyhow::{bail, Result};
use clap::Parser;
use cmdline_hook::config::Settings;
use cmdline_hook::doctor::base_doctor_report;

#[derive(Debug, Parser)]
#[command(
    name = "cmdline-hook",
    version,
    about = "Inspect cmdline-hook settings and host detection"
)]
struct Cli {
    /// Print the diagnostic report (default when no other action is given)
    #[arg(long)]
    doctor: bool,

    /// Print the effective settings as TOML
    #[arg(long)]
    print_config: bool,

    /// Host command line to evaluate for interactivity
    #[arg(long, value_name = "LINE", allow_hyphen_values = true)]
    command_line: Option<String>,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    let settings = Settings::load();

    if cli.print_config {
        match &settings {
            Ok(settings) => print!("{}", settings.to_toml()?),
            Err(err) => bail!("{err:#}"),
        }
    }

    if cli.doctor || !cli.print_config {
        let report = base_doctor_report(&settings, cli.command_line.as_deref());
        println!("{}", report.render());
    }
    Ok(())
}
