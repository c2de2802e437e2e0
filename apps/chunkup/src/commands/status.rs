use anyhow::Result;
use chunkup_data_channel::TcpTransport;
use chunkup_protocol::messages::TaskStatusRequest;
use chunkup_session::UploadTransport;
use clap::Args;

use super::DEFAULT_ADDR;

#[derive(Args)]
pub struct StatusArgs {
    /// Coordinator address.
    #[arg(long, default_value = DEFAULT_ADDR)]
    pub addr: String,

    /// Task to inspect. Without it, coordinator health is shown.
    pub task_id: Option<String>,
}

pub async fn run(args: StatusArgs) -> Result<()> {
    let transport = TcpTransport::new(args.addr);
    let json = match args.task_id {
        Some(task_id) => {
            let status = transport.task_status(TaskStatusRequest { task_id }).await?;
            serde_json::to_string_pretty(&status)?
        }
        None => serde_json::to_string_pretty(&transport.health().await?)?,
    };
    println!("{json}");
    Ok(())
}
