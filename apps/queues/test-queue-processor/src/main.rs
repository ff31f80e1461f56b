//! Test Queue Processor - Entry Point

use clap::Parser;
use core_config::tracing::install_color_eyre;
use test_queue_processor::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    install_color_eyre();
    test_queue_processor::run(Cli::parse()).await
}
