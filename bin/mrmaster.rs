use std::{ffi::OsString, path::PathBuf};

use clap::Parser;
use mrpi::mr;

/// Launches a process group and hosts the exchange its ranks share.
#[derive(Parser)]
#[command(name = "mrmaster")]
struct Args {
    /// Number of ranks to start.
    #[arg(short = 'n', long = "ranks", default_value_t = 1)]
    ranks: usize,
    /// Socket of the exchange service.
    #[arg(long)]
    sock: Option<PathBuf>,
    /// Rank program, started once per rank.
    program: OsString,
    /// Arguments passed to every rank.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    args: Vec<OsString>,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let master = mr::master::Master::new(args.ranks, args.sock);
    master.run(args.program, args.args).await?;

    Ok(())
}
