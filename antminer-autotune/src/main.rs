use std::path::PathBuf;
use std::process::ExitCode;

use clap::Parser;

use antminer_autotune::config::{Config, DEFAULT_CONFIG_FILENAME};
use antminer_autotune::daemon::Daemon;
use antminer_autotune::tracing::{self, prelude::*};

/// Keep Antminers inside their temperature band by tuning chip frequency
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(default_value = DEFAULT_CONFIG_FILENAME)]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    tracing::init_journald_or_stdout();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            error!(path = %args.config.display(), "{e}");
            return ExitCode::FAILURE;
        }
    };

    match Daemon::new(config).run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{e:#}");
            ExitCode::FAILURE
        }
    }
}
