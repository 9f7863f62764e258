use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::Args;
use indicatif::{ProgressBar, ProgressStyle};
use slotphot_core::exec::FailureCap;
use slotphot_core::io::ImageCube;
use slotphot_core::pipeline::{
    run_pipeline, ConvergenceConfig, PipelineConfig, PipelineStage, ProgressReporter,
};

use crate::summary::{print_config_summary, print_run_summary};

#[derive(Args)]
pub struct RunArgs {
    /// Input cube (.npy)
    pub file: PathBuf,

    /// Pipeline config file (TOML)
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Results folder for buffers and saved state
    #[arg(short, long, default_value = "results")]
    pub results: PathBuf,

    /// Worker threads (0 = all cores)
    #[arg(short = 'j', long, default_value = "0")]
    pub workers: usize,

    /// Frames combined into each sample image
    #[arg(long, default_value = "10")]
    pub n_comb: usize,

    /// Frame subset to process, as START:STOP
    #[arg(long)]
    pub subset: Option<String>,

    /// Channel of a 4-D cube
    #[arg(long)]
    pub channel: Option<usize>,

    /// Detection threshold in background sigma
    #[arg(long, default_value = "3.0")]
    pub snr: f64,

    /// Comma-separated polynomial orders of the row segments
    #[arg(long, default_value = "5,1,5")]
    pub orders_y: String,

    /// Comma-separated polynomial orders of the column segments
    #[arg(long, default_value = "1,5")]
    pub orders_x: String,

    /// Frames between knot searches in the full-cube pass
    #[arg(long, default_value = "50")]
    pub knot_search_every: usize,

    /// Run exactly this many detection rounds instead of stopping on
    /// goodness-of-fit stabilisation
    #[arg(long)]
    pub rounds: Option<usize>,

    /// Failures tolerated per batch ("30%", "5" or "none")
    #[arg(long, default_value = "30%")]
    pub failure_cap: String,

    /// Comma-separated bad detector columns
    #[arg(long)]
    pub bad_columns: Option<String>,

    /// Start over, discarding buffers and saved state
    #[arg(long)]
    pub clobber: bool,

    /// Run more detection rounds on top of a resumed tracker
    #[arg(long)]
    pub refine: bool,

    /// Skip the full-cube background pass
    #[arg(long)]
    pub no_full_cube: bool,
}

/// Drives one progress bar across the pipeline stages.
struct BarReporter {
    bar: ProgressBar,
}

impl ProgressReporter for BarReporter {
    fn begin_stage(&self, stage: PipelineStage, total_items: Option<usize>) {
        self.bar.reset();
        self.bar.set_length(total_items.unwrap_or(0) as u64);
        self.bar.set_message(stage.to_string());
    }

    fn advance(&self, items_done: usize) {
        self.bar.inc(items_done as u64);
    }

    fn finish_stage(&self) {
        if let Some(len) = self.bar.length() {
            self.bar.set_position(len);
        }
    }
}

pub fn run(args: &RunArgs) -> Result<()> {
    let config = if let Some(ref config_path) = args.config {
        PipelineConfig::from_toml_file(config_path)
            .with_context(|| format!("Failed to read config {}", config_path.display()))?
    } else {
        build_config_from_args(args)?
    };
    config.validate().context("Invalid pipeline config")?;

    let mut cube = ImageCube::open(&args.file, config.channel)
        .with_context(|| format!("Failed to open cube {}", args.file.display()))?;
    if let Some(range) = config.subset_range() {
        cube = cube.with_subset(range)?;
    }

    print_config_summary(&config, &args.file, cube.len(), cube.frame_shape());

    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:28} [{bar:40}] {pos}/{len}")?
            .progress_chars("=> "),
    );
    let reporter = BarReporter { bar };

    let summary = run_pipeline(&cube, &config, &reporter)?;
    reporter.bar.finish_with_message("Done");

    print_run_summary(&summary, &config);
    Ok(())
}

fn parse_list(s: &str) -> Result<Vec<usize>> {
    s.split(',')
        .map(|v| {
            v.trim()
                .parse::<usize>()
                .with_context(|| format!("Bad list entry '{v}'"))
        })
        .collect()
}

fn parse_subset(s: &str) -> Result<[usize; 2]> {
    let Some((start, stop)) = s.split_once(':') else {
        bail!("Subset must be START:STOP, got '{s}'");
    };
    Ok([start.trim().parse()?, stop.trim().parse()?])
}

fn build_config_from_args(args: &RunArgs) -> Result<PipelineConfig> {
    let mut config = PipelineConfig {
        results: args.results.clone(),
        n_workers: args.workers,
        clobber: args.clobber,
        channel: args.channel,
        refine_on_resume: args.refine,
        full_cube_pass: !args.no_full_cube,
        failure_cap: args.failure_cap.parse::<FailureCap>()?,
        subset: args.subset.as_deref().map(parse_subset).transpose()?,
        ..Default::default()
    };
    config.sampling.n_comb = args.n_comb;
    if let Some(ref cols) = args.bad_columns {
        config.sampling.bad_columns = parse_list(cols)?;
    }
    config.detection.snr = args.snr;
    config.background.orders_y = parse_list(&args.orders_y)?;
    config.background.orders_x = parse_list(&args.orders_x)?;
    config.background.knot_search_every = args.knot_search_every;
    if let Some(rounds) = args.rounds {
        config.convergence = ConvergenceConfig::FixedRounds { rounds };
    }
    Ok(config)
}
