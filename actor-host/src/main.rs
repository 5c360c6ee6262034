//! # actor-host
//!
//! Binary that hosts the counter actor. Configuration comes from flags or
//! the environment; see `actor-host --help`.

mod counter;

use clap::Parser;

use actor_runtime::cli::Cli;

#[tokio::main(flavor = "current_thread")]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    actor_runtime::run_with_cli(counter::definition(), cli).await
}
