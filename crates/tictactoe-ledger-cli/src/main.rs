use anyhow::Result;
use clap::Parser;

fn main() -> Result<()> {
    let cli = tictactoe_ledger_cli::Cli::parse();
    cli.init_logging()?;
    tictactoe_ledger_cli::run_cli(cli)
}
