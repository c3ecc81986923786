use clap::Parser;
use relay_chat::Result;
use relay_chat::cmd::{Args, Command};
use relay_chat::relay;
use relay_chat::tracer::setup_tracing;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let _ = setup_tracing(args.log_format);

    match args.cmd {
        cmd @ Command::Serve { .. } => relay::run(cmd.relay_config()).await?,
    }

    Ok(())
}
