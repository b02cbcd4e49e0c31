//! corpus CLI: turn a research question into a set of cleaned source documents.
//!
//! Expands the question, searches the configured providers, fetches the best
//! candidates, filters low-quality pages, and cleans the survivors with a
//! language model.

mod commands;

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
