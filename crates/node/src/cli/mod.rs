pub mod command;

pub use command::Cli;

use tokio_util::sync::CancellationToken;

impl Cli {
    pub async fn run(&self, cancellation_token: CancellationToken) -> anyhow::Result<()> {
        command::execute_command(&self.command, cancellation_token).await
    }
}
