use std::{
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
};

use clap::Parser;
use training::{apply_overrides, ConfigOverride, Trainer, TrainingConfig, TrainingError};

fn main() {
    tracing_subscriber::fmt().init();
    if let Err(err) = run() {
        log::error!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Deconvolving interpolant training CLI", long_about = None)]
struct Args {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to training config file"
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
        value_name = "MILESTONE",
        help = "Resume from a checkpoint: best, latest, a step number or a directory"
    )]
    resume: Option<String>,
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let config = TrainingConfig::load(&args.config)?;
    let config = apply_overrides(config, &args.overrides)?;

    let mut trainer = Trainer::new(config)?;

    if let Some(identifier) = args.resume.as_deref() {
        let descriptor = trainer.resume(identifier)?;
        log::info!(
            "resumed from {} at step {}",
            descriptor.directory.display(),
            descriptor.manifest.step
        );
    }

    let shutdown = Arc::new(AtomicBool::new(false));
    {
        let flag = Arc::clone(&shutdown);
        ctrlc::set_handler(move || {
            if !flag.swap(true, Ordering::SeqCst) {
                log::warn!("received interrupt, finishing the current step before stopping");
            }
        })
        .map_err(|err| {
            TrainingError::initialization(format!("failed to install signal handler: {err}"))
        })?;
    }

    trainer.train_with_shutdown(|| shutdown.load(Ordering::SeqCst))
}
