use anyhow::Result;

use crate::inspect::{config, runner};

/// Dispatch a subcommand. Returns `Ok(false)` when no command matched so the
/// caller can print usage.
pub fn handle_commands(args: &[String]) -> Result<bool> {
    match args.get(1).map(|s| s.as_str()) {
        Some("run") => {
            let station = config::StationConfig::from_args(args)?;
            runner::run(station)?;
            Ok(true)
        }
        Some("help") | Some("--help") => {
            println!("{}", config::USAGE);
            Ok(true)
        }
        _ => Ok(false),
    }
}
