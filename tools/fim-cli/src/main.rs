// SPDX-License-Identifier: AGPL-3.0-or-later
// © 2025 Ryo ∴ SpiralArchitect (kishkavsesvit@icloud.com)
// Part of FisherTorch — Licensed under AGPL-3.0-or-later.
// Unauthorized derivative works or closed redistribution prohibited under AGPL §13.

use clap::{Args, Parser, Subcommand, ValueEnum, ValueHint};
use ft_curvature::{
    analyze, empirical_fim, load_matrix, run, save_heatmap, save_matrix, CalibrateSettings,
    ExecutionMode, KernelPartition, MatrixFormat, RunConfig, RunOutcome, SpectrumProbe,
    TrainSettings, DEFAULT_CLIP,
};
use ft_nn::{
    gaussian_blobs, load_checkpoint, BaseNet, BlobConfig, CheckpointFormat, CrossEntropyLoss,
    Module,
};
use nalgebra::DMatrix;
use std::error::Error;
use std::path::{Path, PathBuf};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

type DynError = Box<dyn Error>;

type Result<T> = std::result::Result<T, DynError>;

#[derive(Parser)]
#[command(
    author,
    version,
    about = "Curvature studies for FisherTorch reference classifiers"
)]
struct Cli {
    /// Base seed for every derived RNG
    #[arg(long, global = true, default_value_t = 42)]
    seed: u64,

    /// Cap rayon's global worker count
    #[arg(long, global = true)]
    threads: Option<usize>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Train a reference classifier with SGD on the synthetic dataset
    Train(TrainArgs),

    /// Wrap a trained classifier in a KFAC/EFB/INF Bayesian posterior
    Calibrate(CalibrateArgs),

    /// Accumulate the dense empirical Fisher matrix and persist it
    Fim(FimArgs),

    /// Report diagonal and kernel-block dominance of a saved matrix
    Dominance(DominanceArgs),

    /// Probe the eigen spectrum of a saved matrix's leading block
    Spectrum(SpectrumArgs),

    /// Render a saved matrix as a grayscale PNG heatmap
    Heatmap(HeatmapArgs),
}

/// Which reference classifier to instantiate.
#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModelKind {
    Basenet750,
    Basenet15k,
}

impl ModelKind {
    fn build(self) -> Result<BaseNet> {
        let net = match self {
            ModelKind::Basenet750 => BaseNet::basenet_750(),
            ModelKind::Basenet15k => BaseNet::basenet_15k(),
        };
        net.map_err(|err| Box::new(err) as DynError)
    }
}

#[derive(Args)]
struct DataArgs {
    /// Samples generated per class
    #[arg(long, default_value_t = 64)]
    samples_per_class: usize,

    /// Gaussian pixel noise added to each sample
    #[arg(long, default_value_t = 0.15)]
    noise_std: f32,

    /// Seed for the synthetic dataset (independent of the run seed)
    #[arg(long, default_value_t = 7)]
    data_seed: u64,
}

impl DataArgs {
    fn build(&self, seed_offset: u64) -> Result<ft_nn::Dataset> {
        gaussian_blobs(&BlobConfig {
            classes: 10,
            samples_per_class: self.samples_per_class,
            height: 28,
            width: 28,
            noise_std: self.noise_std,
            seed: self.data_seed.wrapping_add(seed_offset),
        })
        .map_err(|err| Box::new(err) as DynError)
    }
}

#[derive(Args)]
struct TrainArgs {
    #[arg(long, value_enum, default_value_t = ModelKind::Basenet750)]
    model: ModelKind,

    #[arg(long, default_value_t = 3)]
    epochs: usize,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    #[arg(long = "lr", default_value_t = 1e-3)]
    learning_rate: f32,

    #[arg(long, default_value_t = 0.9)]
    momentum: f32,

    /// Learning-rate decay applied at each milestone
    #[arg(long, default_value_t = 0.1)]
    gamma: f32,

    /// Iteration milestones for the step decay (repeatable)
    #[arg(long = "milestone")]
    milestones: Vec<usize>,

    /// Standard deviation of the Gaussian weight init
    #[arg(long, default_value_t = 0.2)]
    init_std: f32,

    /// Destination checkpoint (.json or binary)
    #[arg(long, value_hint = ValueHint::FilePath)]
    save: Option<PathBuf>,

    /// Checkpoint to resume from
    #[arg(long, value_hint = ValueHint::FilePath)]
    resume: Option<PathBuf>,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(Args)]
struct CalibrateArgs {
    #[arg(long, value_enum, default_value_t = ModelKind::Basenet750)]
    model: ModelKind,

    /// Trained checkpoint to calibrate
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: PathBuf,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Monte-Carlo weight samples drawn from the posterior
    #[arg(long, default_value_t = 10)]
    samples: usize,

    /// Additive diagonal-loading term
    #[arg(long, default_value_t = 1.0)]
    add: f64,

    /// Multiplicative diagonal-loading term
    #[arg(long, default_value_t = 200.0)]
    multiply: f64,

    /// Eigen-pairs kept by the INF diagonal correction
    #[arg(long, default_value_t = 100)]
    rank: usize,

    /// Reliability-diagram bins for the calibration error
    #[arg(long, default_value_t = 10)]
    bins: usize,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(Args)]
struct FimArgs {
    #[arg(long, value_enum, default_value_t = ModelKind::Basenet750)]
    model: ModelKind,

    /// Optional trained checkpoint; otherwise a fresh Gaussian init is used
    #[arg(long, value_hint = ValueHint::FilePath)]
    checkpoint: Option<PathBuf>,

    #[arg(long, default_value_t = 0.2)]
    init_std: f32,

    #[arg(long, default_value_t = 32)]
    batch_size: usize,

    /// Destination for the raw matrix (.json or binary)
    #[arg(long, value_hint = ValueHint::FilePath)]
    save: PathBuf,

    /// Optional PNG heatmap of the accumulated matrix
    #[arg(long, value_hint = ValueHint::FilePath)]
    heatmap: Option<PathBuf>,

    /// Heatmap sub-block edge
    #[arg(long, default_value_t = DEFAULT_CLIP)]
    clip: usize,

    #[command(flatten)]
    data: DataArgs,
}

#[derive(Args)]
struct DominanceArgs {
    /// Saved matrix produced by the fim subcommand
    #[arg(long, value_hint = ValueHint::FilePath)]
    matrix: PathBuf,

    /// Architecture whose layout defines the kernel coordinates
    #[arg(long, value_enum, default_value_t = ModelKind::Basenet15k)]
    model: ModelKind,

    #[arg(long, default_value_t = 1e-5)]
    tau: f64,
}

#[derive(Args)]
struct SpectrumArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    matrix: PathBuf,

    /// Leading principal sub-block edge
    #[arg(long, default_value_t = 1000)]
    block: usize,

    #[arg(long, default_value_t = 1e-5)]
    tau: f64,

    /// Imaginary-part tolerance of the realness check
    #[arg(long, default_value_t = 1e-30)]
    tolerance: f64,
}

#[derive(Args)]
struct HeatmapArgs {
    #[arg(long, value_hint = ValueHint::FilePath)]
    matrix: PathBuf,

    /// Destination PNG
    #[arg(long, value_hint = ValueHint::FilePath)]
    out: PathBuf,

    #[arg(long, default_value_t = DEFAULT_CLIP)]
    clip: usize,
}

fn main() {
    if let Err(err) = try_main() {
        eprintln!("error: {err}");
        std::process::exit(1);
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(false);
    Registry::default().with(filter).with(fmt_layer).init();
}

fn try_main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let config = RunConfig {
        seed: cli.seed,
        threads: cli.threads,
    };
    match &cli.command {
        Command::Train(args) => run_train(args, &config),
        Command::Calibrate(args) => run_calibrate(args, &config),
        Command::Fim(args) => run_fim(args, &config),
        Command::Dominance(args) => run_dominance(args),
        Command::Spectrum(args) => run_spectrum(args),
        Command::Heatmap(args) => run_heatmap(args),
    }
}

fn run_train(args: &TrainArgs, config: &RunConfig) -> Result<()> {
    let mut model = args.model.build()?;
    if args.resume.is_none() {
        let mut init_rng = config.rng_for("weight_init");
        model.init_gaussian(args.init_std, &mut init_rng)?;
    }
    let train_data = args.data.build(0)?;
    let eval_data = args.data.build(1)?;
    let settings = TrainSettings {
        epochs: args.epochs,
        batch_size: args.batch_size,
        learning_rate: args.learning_rate,
        momentum: args.momentum,
        gamma: args.gamma,
        milestones: args.milestones.clone(),
        save_path: args.save.clone(),
        resume: args.resume.clone(),
    };
    let outcome = run(
        &ExecutionMode::Train(settings),
        &mut model,
        &train_data,
        &eval_data,
        config,
    )?;
    if let RunOutcome::Trained(report) = outcome {
        println!(
            "loss: {:.6}  accuracy: {:.2}%  iterations: {}",
            report.final_loss,
            100.0 * report.accuracy,
            report.iterations
        );
    }
    Ok(())
}

fn run_calibrate(args: &CalibrateArgs, config: &RunConfig) -> Result<()> {
    let mut model = args.model.build()?;
    let eval_data = args.data.build(1)?;
    let settings = CalibrateSettings {
        checkpoint: Some(args.checkpoint.clone()),
        batch_size: args.batch_size,
        samples: args.samples,
        add: args.add,
        multiply: args.multiply,
        rank: args.rank,
        bins: args.bins,
    };
    let train_data = args.data.build(0)?;
    let outcome = run(
        &ExecutionMode::BayesianCalibrate(settings),
        &mut model,
        &train_data,
        &eval_data,
        config,
    )?;
    if let RunOutcome::Calibrated(calibration) = outcome {
        println!(
            "KFAC accuracy: {:.2}%  ECE: {:.2}%  ({} samples)",
            100.0 * calibration.accuracy,
            100.0 * calibration.ece,
            calibration.samples
        );
    }
    Ok(())
}

fn run_fim(args: &FimArgs, config: &RunConfig) -> Result<()> {
    config.apply_thread_limit();
    let mut model = args.model.build()?;
    match args.checkpoint.as_ref() {
        Some(path) => load_checkpoint(&mut model, path, CheckpointFormat::from_path(path))?,
        None => {
            let mut init_rng = config.rng_for("weight_init");
            model.init_gaussian(args.init_std, &mut init_rng)?;
        }
    }
    let data = args.data.build(0)?;
    let loader = data.loader().batched(args.batch_size);
    let mut loss = CrossEntropyLoss::new();
    let mut rng = config.rng_for("fisher_sampling");
    let fim = empirical_fim(&mut model, &mut loss, &loader, &mut rng)?;
    tracing::info!(dim = fim.dim(), batches = fim.batches(), "fisher matrix accumulated");
    save_matrix(fim.matrix(), &args.save, MatrixFormat::from_path(&args.save))?;
    if let Some(heatmap) = args.heatmap.as_ref() {
        save_heatmap(fim.matrix(), args.clip, heatmap)?;
    }
    println!("saved {}x{} matrix to {}", fim.dim(), fim.dim(), args.save.display());
    Ok(())
}

fn read_matrix(path: &Path) -> Result<DMatrix<f64>> {
    Ok(load_matrix(path, MatrixFormat::from_path(path))?)
}

fn run_dominance(args: &DominanceArgs) -> Result<()> {
    let matrix = read_matrix(&args.matrix)?;
    let model = args.model.build()?;
    let partition = KernelPartition::from_layout(&model.parameter_layout()?)?;
    let report = analyze(&matrix, &partition, args.tau)?;
    println!("{report}");
    Ok(())
}

fn run_spectrum(args: &SpectrumArgs) -> Result<()> {
    let matrix = read_matrix(&args.matrix)?;
    let probe = SpectrumProbe::new()
        .with_block_size(args.block)
        .with_tolerance(args.tolerance);
    let report = probe.probe(&matrix, args.tau)?;
    println!(
        "eigenvalues: {}  mean: {:.6e}  std: {:.6e}",
        report.count, report.mean, report.std
    );
    Ok(())
}

fn run_heatmap(args: &HeatmapArgs) -> Result<()> {
    let matrix = read_matrix(&args.matrix)?;
    save_heatmap(&matrix, args.clip, &args.out)?;
    println!("wrote {}", args.out.display());
    Ok(())
}
