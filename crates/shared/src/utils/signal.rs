use tokio::{
    io,
    signal::unix::{signal, SignalKind},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;

// Spawn a task that cancels `cancellation_token` on the first of
// SIGTERM, SIGINT, SIGHUP or SIGQUIT.
//
// Returns a handle to the spawned task.
pub fn trigger_cancellation_on_signal(
    cancellation_token: CancellationToken,
) -> io::Result<JoinHandle<()>> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;
    let mut sighup = signal(SignalKind::hangup())?;
    let mut sigquit = signal(SignalKind::quit())?;

    let signal_handle = tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => {
                log::info!("Received termination signal, stopping node");
            }
            _ = sigint.recv() => {
                log::info!("Received interrupt signal, stopping node");
            }
            _ = sighup.recv() => {
                log::info!("Received hangup signal, stopping node");
            }
            _ = sigquit.recv() => {
                log::info!("Received quit signal, stopping node");
            }
            _ = cancellation_token.cancelled() => {
                return;
            }
        }
        cancellation_token.cancel();
    });

    Ok(signal_handle)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn handle_exits_when_token_is_cancelled_elsewhere() {
        let token = CancellationToken::new();
        let handle = trigger_cancellation_on_signal(token.clone()).unwrap();
        token.cancel();
        tokio::time::timeout(std::time::Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
    }
}
