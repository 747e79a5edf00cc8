use clap::Parser;
use mrpi::mrrt::sequential;

#[derive(Parser)]
#[command(name = "mrsequential")]
struct Args {
    nbmap: u64,
    nbptpermap: u64,
    #[arg(long, default_value = "pi")]
    app: String,
}

fn main() -> Result<(), anyhow::Error> {
    let args = Args::parse();

    let app = mrpi::mrapps::get_app(&args.app, args.nbptpermap)?;
    let out = sequential::run(app.as_ref(), args.nbmap)?;
    for (key, value) in &out {
        println!("{}", app.report(key, value)?);
    }

    Ok(())
}
