//! vdfs CLI Binary

use clap::Parser;
use vdfs::logging::init_logging;
use vdfs::tooling::cli::{Cli, CliContext};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut context = CliContext::new(cli.config.clone(), cli.replica.clone())?;
    context.apply_log_overrides(&cli);
    init_logging(Some(&context.config().logging))?;

    let output = context.execute(&cli.command).await?;
    println!("{}", output);
    Ok(())
}
