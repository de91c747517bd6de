//! burstfuse CLI: merge a burst of photographs into one upscaled image.

use std::path::PathBuf;
use std::sync::Arc;
use std::sync::mpsc;
use std::time::{Duration, Instant};

use burstfuse::{
    DeconvVariant, Interpolation, KernelSpec, MergeConfig, MergeEvent, Merger,
    RegistrationFailurePolicy,
};
use clap::{Parser, ValueEnum};

type CliResult<T> = Result<T, Box<dyn std::error::Error>>;

#[derive(Debug, Clone, Copy, ValueEnum)]
enum KernelArg {
    Analytic,
    Simulated,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum VariantArg {
    Guarded,
    Unguarded,
}

#[derive(Parser)]
#[command(name = "burstfuse")]
#[command(about = "Fuse a burst of handheld photographs into an upscaled, sharpened image")]
#[command(version)]
struct Cli {
    /// Input frames. The first one is the reference.
    #[arg(required = true, num_args = 2..)]
    inputs: Vec<PathBuf>,

    /// Output image; the format follows the extension.
    #[arg(short, long)]
    output: PathBuf,

    /// TOML file with merge settings. Flags below override it.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Tile edge in input pixels.
    #[arg(long)]
    tile_size: Option<usize>,

    /// Output upscale ratio.
    #[arg(long)]
    scale: Option<f64>,

    /// Context around each tile, as a fraction of the tile size.
    #[arg(long)]
    margin: Option<f64>,

    /// Interpolation used for upscaling and warping (nearest, bilinear,
    /// bicubic, lanczos3, lanczos4).
    #[arg(long)]
    interpolation: Option<Interpolation>,

    /// Point-spread function to deconvolve with.
    #[arg(long, value_enum)]
    kernel: Option<KernelArg>,

    /// Richardson-Lucy iterations per tile.
    #[arg(long)]
    iterations: Option<usize>,

    /// Deconvolution variant.
    #[arg(long, value_enum)]
    variant: Option<VariantArg>,

    /// Leave frames that fail to register out of a tile instead of aborting.
    #[arg(long)]
    skip_failed_frames: bool,

    /// Cancel the merge after this many seconds, keeping the finished tiles.
    #[arg(long)]
    cancel_after: Option<f64>,
}

impl Cli {
    fn merge_config(&self) -> CliResult<MergeConfig> {
        let mut config = match &self.config {
            Some(path) => MergeConfig::from_toml_file(path)?,
            None => MergeConfig::default(),
        };
        if let Some(v) = self.tile_size {
            config.tile_size = v;
        }
        if let Some(v) = self.scale {
            config.scale_factor = v;
        }
        if let Some(v) = self.margin {
            config.margin_fraction = v;
        }
        if let Some(v) = self.interpolation {
            config.interpolation = v;
        }
        if let Some(v) = self.iterations {
            config.deconv_iterations = v;
        }
        match self.kernel {
            Some(KernelArg::Simulated) => config.kernel = KernelSpec::Simulated,
            Some(KernelArg::Analytic) => config.kernel = KernelSpec::default(),
            None => {}
        }
        match self.variant {
            Some(VariantArg::Guarded) => config.deconv_variant = DeconvVariant::Guarded,
            Some(VariantArg::Unguarded) => config.deconv_variant = DeconvVariant::Unguarded,
            None => {}
        }
        if self.skip_failed_frames {
            config.on_registration_failure = RegistrationFailurePolicy::SkipFrame;
        }
        config.validate()?;
        Ok(config)
    }
}

fn main() -> CliResult<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("burstfuse=info"))
        .init();

    let cli = Cli::parse();
    let config = cli.merge_config()?;
    log::debug!("{config:?}");

    let (tx, rx) = mpsc::channel();
    let mut merger = Merger::new(config).with_observer(Arc::new(tx));
    merger.load_inputs(&cli.inputs)?;
    merger.start_merge(&cli.output)?;

    let started = Instant::now();
    let deadline = cli.cancel_after.map(|s| Duration::from_secs_f64(s.max(0.0)));
    let mut failure = None;
    while merger.is_running() {
        match rx.recv_timeout(Duration::from_millis(200)) {
            Ok(MergeEvent::Progress(p)) if p > 0.0 => log::info!("{:.0}%", p * 100.0),
            Ok(MergeEvent::Error(e)) => failure = Some(e),
            _ => {}
        }
        if deadline.is_some_and(|d| started.elapsed() >= d) {
            log::warn!("cancelling after {:.1}s", started.elapsed().as_secs_f64());
            merger.request_cancel();
        }
    }
    merger.wait();
    for event in rx.try_iter() {
        if let MergeEvent::Error(e) = event {
            failure = Some(e);
        }
    }

    if let Some(e) = failure {
        return Err(e.into());
    }
    log::info!(
        "wrote {} in {:.1}s",
        cli.output.display(),
        started.elapsed().as_secs_f64()
    );
    Ok(())
}
