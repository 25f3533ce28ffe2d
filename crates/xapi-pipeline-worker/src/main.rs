use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = xapi_pipeline_worker::Cli::parse();
    xapi_pipeline_worker::run_cli(cli)
}
