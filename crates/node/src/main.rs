use clap::Parser;
use provider_node::{setup_logging, Cli};
use shared::utils::signal::trigger_cancellation_on_signal;
use std::panic;
use std::process::ExitCode;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if let Err(e) = setup_logging(Some(&cli)) {
        eprintln!("Warning: Failed to initialize logging: {e}. Using default logging.");
    }

    panic::set_hook(Box::new(|panic_info| {
        let location = panic_info
            .location()
            .unwrap_or_else(|| panic::Location::caller());
        let message = match panic_info.payload().downcast_ref::<&str>() {
            Some(s) => *s,
            None => match panic_info.payload().downcast_ref::<String>() {
                Some(s) => s.as_str(),
                None => "Unknown panic payload",
            },
        };

        log::error!(
            "PANIC: '{}' at {}:{}",
            message,
            location.file(),
            location.line()
        );
    }));

    let cancellation_token = CancellationToken::new();
    let signal_handle = match trigger_cancellation_on_signal(cancellation_token.clone()) {
        Ok(handle) => handle,
        Err(e) => {
            log::error!("Failed to install signal handlers: {e}");
            return ExitCode::FAILURE;
        }
    };

    // `run` waits on the token and stops the node itself.
    let result = cli.run(cancellation_token.clone()).await;

    cancellation_token.cancel();
    if tokio::time::timeout(SHUTDOWN_TIMEOUT, signal_handle)
        .await
        .is_err()
    {
        log::warn!("Timeout waiting for tasks to cleanup");
    }

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            log::error!("Command execution error: {e:#}");
            ExitCode::FAILURE
        }
    }
}
