use clap::Parser;
use mrpi::{
    config::EngineConfig,
    mr::{self, MRApp},
    mrapps::get_app,
};
use std::sync::Arc;

/// Runs an application as one rank of the current process group.
#[derive(Parser)]
#[command(name = "mrworker")]
struct Args {
    /// Total number of map tasks.
    nbmap: u64,
    /// Samples drawn by every map task.
    nbptpermap: u64,
    /// Stop after map and print every pair.
    #[arg(long)]
    map_only: bool,
    /// Application to run.
    #[arg(long, default_value = "pi")]
    app: String,
}

#[tokio::main]
async fn main() -> Result<(), anyhow::Error> {
    tracing_subscriber::fmt::init();
    let args = Args::parse();

    let app: Arc<dyn MRApp> = Arc::from(get_app(&args.app, args.nbptpermap)?);
    let comm = mr::comm::init().await?;
    let mut mr = mr::MapReduce::new(comm.clone(), EngineConfig::from_env()?);

    let map_app = app.clone();
    mr.map(args.nbmap, move |id, kv| map_app.map(id, kv)).await?;

    if args.map_only {
        mr.scan_kv(|key, value| {
            println!("{}", app.inspect(key, value));
            Ok(())
        })
        .await?;
    } else {
        mr.collate().await?;
        mr.reduce(|key, values, out| app.reduce(key, values, out)).await?;
        mr.scan_kv(|key, value| {
            println!("{}", app.report(key, value)?);
            Ok(())
        })
        .await?;
    }

    comm.finalize().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positionals_are_task_count_and_samples() {
        let args = Args::try_parse_from(["mrworker", "4", "1000"]).unwrap();
        assert_eq!((args.nbmap, args.nbptpermap, args.app.as_str()), (4, 1000, "pi"));
        assert!(!args.map_only);

        let args = Args::try_parse_from(["mrworker", "--map-only", "2", "5"]).unwrap();
        assert!(args.map_only);
    }

    #[test]
    fn malformed_arguments_are_rejected() {
        assert!(Args::try_parse_from(["mrworker"]).is_err());
        assert!(Args::try_parse_from(["mrworker", "4"]).is_err());
        assert!(Args::try_parse_from(["mrworker", "four", "1000"]).is_err());
        assert!(Args::try_parse_from(["mrworker", "4", "-1"]).is_err());
    }
}
