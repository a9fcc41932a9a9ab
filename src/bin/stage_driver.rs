//! Stage driver - runs one pipeline stage inside the execution envelope.
//!
//! Exit status: 0 committed or skipped, 1 failed, 2 rejected, 3 fatal.
//! Command-line errors are fatal.

use std::process::ExitCode;

use clap::Parser;

use stage_lineage::cli::{self, Cli};
use stage_lineage::envelope::EXIT_FATAL;
use stage_lineage::observability::init_logging;

fn main() -> ExitCode {
    let cli = match Cli::try_parse() {
        Ok(cli) => cli,
        Err(e) => {
            let _ = e.print();
            return ExitCode::from(cli::exit_code_for_usage(&e));
        }
    };
    init_logging(cli.log_format);

    let runtime = match tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
    {
        Ok(runtime) => runtime,
        Err(e) => {
            eprintln!("error: cannot start runtime: {e}");
            return ExitCode::from(EXIT_FATAL);
        }
    };

    match runtime.block_on(cli::execute(cli)) {
        Ok(code) => ExitCode::from(code),
        Err(e) => {
            tracing::error!(error = %e, "stage driver aborted");
            eprintln!("error: {e:#}");
            ExitCode::from(cli::exit_code_for(&e))
        }
    }
}
