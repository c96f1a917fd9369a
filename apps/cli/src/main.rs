//! toolpipe CLI — route requests through sequential tool pipelines.
//!
//! Runs single pipelines or chains of them over built-in demo tools,
//! recording every tool result in a local audit database.

mod commands;
mod tools;

use clap::Parser;
use color_eyre::eyre::Result;

use commands::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;
    let cli = Cli::parse();
    commands::init_tracing(&cli);
    commands::run(cli).await
}
