use std::path::PathBuf;

use clap::Parser;
use evaluation::{EvaluationError, EvaluationSettings, Evaluator, DEFAULT_EPS};
use training::{apply_overrides, ConfigOverride, TrainingConfig};

fn main() {
    tracing_subscriber::fmt().init();
    if let Err(err) = run() {
        log::error!("evaluation failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "FID evaluation of a trained deconvolver", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Training config the checkpoint was produced with"
    )]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths"
    )]
    overrides: Vec<ConfigOverride>,

    #[arg(
        long,
        default_value = "best",
        help = "Checkpoint to score: best, latest, a step number or a directory"
    )]
    model: String,

    #[arg(long, default_value_t = 50_000, help = "Generated samples to score")]
    num_samples: usize,

    #[arg(long, default_value_t = 128)]
    batch_size: usize,

    #[arg(long, help = "Euler steps for transport (defaults to the config)")]
    ode_steps: Option<usize>,

    #[arg(long, help = "Score the live weights instead of the EMA shadow")]
    live: bool,

    #[arg(long, default_value_t = DEFAULT_EPS, help = "Diagonal offset for singular covariances")]
    eps: f64,

    #[arg(long, value_name = "PATH", help = "Result file (defaults to the results directory)")]
    output: Option<PathBuf>,
}

fn run() -> Result<(), EvaluationError> {
    let args = Args::parse();

    let config = TrainingConfig::load(&args.config)?;
    let config = apply_overrides(config, &args.overrides)?;

    let settings = EvaluationSettings {
        model: args.model,
        num_samples: args.num_samples,
        batch_size: args.batch_size,
        ode_steps: args.ode_steps,
        prefer_ema: !args.live,
        eps: args.eps,
        output: args.output,
    };
    let report = Evaluator::new(config, settings)?.run()?;
    println!("FID score of {} model: {}", report.model, report.score);
    println!("results saved to {}", report.output.display());
    Ok(())
}
