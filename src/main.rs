use clap::Parser;
use tokio_util::sync::CancellationToken;

use podtunnel::cli::{self, Args};
use podtunnel::logging;
use podtunnel::status::ExitStatus;

/// Entry point - forwards until Ctrl+C, then shuts down cleanly
#[tokio::main]
async fn main() -> ExitStatus {
    let args = Args::parse();
    logging::init(args.verbose, args.log_format);

    let shutdown = CancellationToken::new();
    let interrupted = {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                eprintln!("\nInterrupted");
                shutdown.cancel();
                return true;
            }
            false
        })
    };

    let result = cli::run(args, shutdown.clone()).await;
    if shutdown.is_cancelled() {
        // The signal task has already finished
        if interrupted.await.unwrap_or(false) {
            return ExitStatus::Interrupted;
        }
    } else {
        interrupted.abort();
    }

    match result {
        Ok(()) => ExitStatus::Success,
        Err(e) => {
            eprintln!("podtunnel: error: {}", e);
            ExitStatus::Error
        }
    }
}
