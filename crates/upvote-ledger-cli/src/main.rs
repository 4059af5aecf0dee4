use anyhow::Result;
use clap::Parser;
use upvote_ledger_cli::{run_cli, Cli};

fn main() -> Result<()> {
    let cli = Cli::parse();
    run_cli(cli)
}
