use drover_core::logging;

mod cli;

use crate::cli::CliCommand;

#[tokio::main]
async fn main() {
    // Initialize logging as early as possible; fall back to stderr if the
    // log directory is unusable.
    let log_dir = drover_core::config::load_or_init()
        .map(|cfg| cfg.log.filelog_folder)
        .unwrap_or_default();
    if logging::init_logging(&log_dir).is_err() {
        logging::init_logging_stderr();
    }

    if let Err(err) = CliCommand::run_from_args().await {
        eprintln!("drover error: {:#}", err);
        std::process::exit(1);
    }
}
