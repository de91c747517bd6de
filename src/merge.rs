//! The tile loop and the API that runs it on a background thread.
//!
//! A run walks the tile grid column by column. For every tile it upscales
//! the reference crop, registers and warps each candidate crop onto it,
//! averages the results, deconvolves the average and copies the tile's
//! inner part into the output canvas. The canvas is checkpointed to disk
//! after every tile, so a cancelled or failed run leaves the finished tiles
//! behind.

use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, mpsc};
use std::thread::{self, JoinHandle};

use imgref::{ImgRef, ImgVec};
use log::{debug, error, info, warn};
use rayon::prelude::*;

use crate::Error;
use crate::accumulate::TileAccumulator;
use crate::align::{Registration, RegistrationError, register};
use crate::config::{MergeConfig, RegistrationFailurePolicy};
use crate::deconvolve::deconvolve;
use crate::geometry::{TileDescriptor, TileGrid};
use crate::io::{load_frame, write_checkpoint};
use crate::kernel::Kernel;
use crate::pixel::{Frame, Rgbf, to_luma};
use crate::resample::resize;
use crate::warp::warp_inverse;

/// Flags shared between the worker and any number of readers.
#[derive(Debug, Default)]
pub struct RunState {
    processing: AtomicBool,
    cancel_requested: AtomicBool,
    error: AtomicBool,
    /// `f64` bits.
    progress: AtomicU64,
}

impl RunState {
    pub fn is_processing(&self) -> bool {
        self.processing.load(Ordering::SeqCst)
    }

    pub fn cancel_requested(&self) -> bool {
        self.cancel_requested.load(Ordering::SeqCst)
    }

    pub fn error_occurred(&self) -> bool {
        self.error.load(Ordering::SeqCst)
    }

    /// Fraction of scheduled tiles finished, in `[0, 1]`.
    pub fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::SeqCst))
    }

    /// Ask the worker to stop before its next tile. The flag is only cleared
    /// when a run ends, so a request made while idle cancels the next run
    /// before its first tile.
    pub fn request_cancel(&self) {
        self.cancel_requested.store(true, Ordering::SeqCst);
    }

    fn set_progress(&self, progress: f64) {
        self.progress.store(progress.clamp(0.0, 1.0).to_bits(), Ordering::SeqCst);
    }

    fn begin(&self) -> bool {
        let started = self
            .processing
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if started {
            self.error.store(false, Ordering::SeqCst);
            self.set_progress(0.0);
        }
        started
    }

    fn finish(&self) {
        self.set_progress(0.0);
        self.cancel_requested.store(false, Ordering::SeqCst);
        self.processing.store(false, Ordering::SeqCst);
    }
}

/// Receives run notifications from the worker thread.
pub trait MergeObserver: Send + Sync {
    fn on_progress(&self, _progress: f64) {}

    /// Called at most once per run.
    fn on_error(&self, _error: &Error) {}
}

/// Ignores every notification.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl MergeObserver for NoopObserver {}

/// Notification forwarded over a channel.
#[derive(Debug, Clone, PartialEq)]
pub enum MergeEvent {
    Progress(f64),
    Error(String),
}

impl MergeObserver for mpsc::Sender<MergeEvent> {
    fn on_progress(&self, progress: f64) {
        // A dropped receiver just means nobody is listening.
        let _ = self.send(MergeEvent::Progress(progress));
    }

    fn on_error(&self, error: &Error) {
        let _ = self.send(MergeEvent::Error(error.to_string()));
    }
}

/// How one candidate frame fared on one tile.
#[derive(Debug, Clone, PartialEq)]
pub enum FrameOutcome {
    Aligned(Registration),
    Skipped(RegistrationError),
}

/// Loads input frames and runs merges on a worker thread.
pub struct Merger {
    config: MergeConfig,
    frames: Option<Arc<[Frame]>>,
    state: Arc<RunState>,
    observer: Arc<dyn MergeObserver>,
    worker: Option<JoinHandle<()>>,
}

impl Merger {
    pub fn new(config: MergeConfig) -> Self {
        Self {
            config,
            frames: None,
            state: Arc::new(RunState::default()),
            observer: Arc::new(NoopObserver),
            worker: None,
        }
    }

    pub fn with_observer(mut self, observer: Arc<dyn MergeObserver>) -> Self {
        self.observer = observer;
        self
    }

    pub fn config(&self) -> &MergeConfig {
        &self.config
    }

    /// Decode the input files. The first one becomes the reference frame.
    pub fn load_inputs<P: AsRef<Path>>(&mut self, paths: &[P]) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        if paths.len() < 2 {
            return Err(Error::TooFewFrames { found: paths.len() });
        }
        let frames = paths
            .iter()
            .map(|p| {
                let frame = load_frame(p.as_ref())?;
                debug!("loaded {} ({}x{})", p.as_ref().display(), frame.width(), frame.height());
                Ok(frame)
            })
            .collect::<Result<Vec<_>, Error>>()?;
        self.load_frames(frames)
    }

    /// Use already decoded frames as input.
    pub fn load_frames(&mut self, frames: Vec<Frame>) -> Result<(), Error> {
        if self.is_running() {
            return Err(Error::AlreadyRunning);
        }
        check_frames(&frames)?;
        info!(
            "loaded {} frames of {}x{}",
            frames.len(),
            frames[0].width(),
            frames[0].height()
        );
        self.frames = Some(frames.into());
        Ok(())
    }

    /// Start merging the loaded frames into `output` and return immediately.
    pub fn start_merge(&mut self, output: impl Into<PathBuf>) -> Result<(), Error> {
        let frames = self.frames.clone().ok_or(Error::NoInputs)?;
        self.config.validate()?;
        if !self.state.begin() {
            return Err(Error::AlreadyRunning);
        }
        // The previous worker has already cleared the running flag.
        if let Some(previous) = self.worker.take() {
            let _ = previous.join();
        }

        let output = output.into();
        let config = self.config.clone();
        let state = Arc::clone(&self.state);
        let observer = Arc::clone(&self.observer);
        let spawned = thread::Builder::new()
            .name("burstfuse-merge".into())
            .spawn(move || {
                let run = panic::catch_unwind(AssertUnwindSafe(|| {
                    merge_frames(&frames, &config, &output, &state, observer.as_ref())
                }));
                let failure = match run {
                    Ok(Ok(_)) => None,
                    Ok(Err(e)) => Some(e),
                    Err(payload) => Some(Error::WorkerPanicked(panic_message(payload.as_ref()))),
                };
                if let Some(e) = failure {
                    error!("merge failed: {e}");
                    state.error.store(true, Ordering::SeqCst);
                    observer.on_error(&e);
                }
                state.finish();
                observer.on_progress(0.0);
            });
        match spawned {
            Ok(handle) => {
                self.worker = Some(handle);
                Ok(())
            }
            Err(e) => {
                self.state.finish();
                Err(e.into())
            }
        }
    }

    /// Stop the run before its next tile. Requested while idle, it
    /// cancels the next run before its first tile.
    pub fn request_cancel(&self) {
        self.state.request_cancel();
    }

    pub fn current_progress(&self) -> f64 {
        self.state.progress()
    }

    pub fn is_running(&self) -> bool {
        self.state.is_processing()
    }

    pub fn error_occurred(&self) -> bool {
        self.state.error_occurred()
    }

    pub fn run_state(&self) -> Arc<RunState> {
        Arc::clone(&self.state)
    }

    /// Block until the current run, if any, has ended.
    pub fn wait(&mut self) {
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                error!("merge worker panicked");
                self.state.error.store(true, Ordering::SeqCst);
                self.state.finish();
            }
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn check_frames(frames: &[Frame]) -> Result<(), Error> {
    if frames.len() < 2 {
        return Err(Error::TooFewFrames { found: frames.len() });
    }
    let expected = (frames[0].width(), frames[0].height());
    for frame in &frames[1..] {
        let found = (frame.width(), frame.height());
        if found != expected {
            return Err(Error::DimensionMismatch { expected, found });
        }
    }
    if expected.0 == 0 || expected.1 == 0 {
        return Err(Error::InvalidGeometry(format!("empty frame {}x{}", expected.0, expected.1)));
    }
    Ok(())
}

/// Merge `frames` into `output`, blocking until done or cancelled.
///
/// Progress and cancellation go through `state`; the caller owns its
/// processing flag. Returns the canvas as it was last checkpointed.
pub fn merge_frames(
    frames: &[Frame],
    config: &MergeConfig,
    output: &Path,
    state: &RunState,
    observer: &dyn MergeObserver,
) -> Result<Frame, Error> {
    check_frames(frames)?;
    config.validate()?;
    let reference = &frames[0];
    let grid = config.tile_grid(reference.width(), reference.height())?;
    let kernel = Arc::new(config.build_kernel()?);

    let (cw, ch) = grid.canvas_size();
    let mut canvas = ImgVec::new(vec![Rgbf::new(0.0, 0.0, 0.0); cw * ch], cw, ch);
    write_checkpoint(canvas.as_ref(), output)?;

    let scheduled = grid.tiles(config.first_tile_column).count();
    let (nx, ny) = grid.tile_count();
    info!(
        "merging {} frames into {cw}x{ch}: {nx}x{ny} tiles, {scheduled} scheduled",
        frames.len()
    );

    let mut done = 0usize;
    for (tx, ty) in grid.tiles(config.first_tile_column) {
        if state.cancel_requested() {
            info!("merge cancelled after {done} of {scheduled} tiles");
            return Ok(canvas);
        }
        let tile = grid.tile(tx, ty)?;
        debug!("tile {:?}: {:?}", tile.index, tile);

        let (merged, outcomes) = merge_tile(frames, &grid, &tile, config, &kernel)?;
        paste(&mut canvas, merged.as_ref(), &tile);
        write_checkpoint(canvas.as_ref(), output)?;

        done += 1;
        let progress = done as f64 / scheduled as f64;
        state.set_progress(progress);
        observer.on_progress(progress);
        let skipped = outcomes
            .iter()
            .filter(|o| matches!(o, FrameOutcome::Skipped(_)))
            .count();
        info!("tile {done}/{scheduled} ({tx}, {ty}) done, {skipped} frames skipped");
    }

    info!("merge finished: {}", output.display());
    Ok(canvas)
}

/// Register, accumulate and deconvolve one tile. Returns the whole
/// upscaled tile including its margin.
pub fn merge_tile(
    frames: &[Frame],
    grid: &TileGrid,
    tile: &TileDescriptor,
    config: &MergeConfig,
    kernel: &Kernel,
) -> Result<(ImgVec<Rgbf>, Vec<FrameOutcome>), Error> {
    let src = tile.source;
    let (up_w, up_h) = tile.upscaled_size;
    let filter = config.interpolation;
    let upscale = |frame: &Frame| {
        let crop = frame.sub_image(src.x, src.y, src.width, src.height);
        resize(crop, up_w, up_h, filter)
    };
    debug!("tile {:?} upscaled by {} to {up_w}x{up_h}", tile.index, grid.scale());

    let reference = upscale(&frames[0]);
    let reference_luma = to_luma(reference.as_ref());

    let aligned = frames[1..]
        .par_iter()
        .enumerate()
        .map(|(i, frame)| {
            let frame_index = i + 1;
            let candidate = upscale(frame);
            let luma = to_luma(candidate.as_ref());
            match register(reference_luma.as_ref(), luma.as_ref(), &config.registration) {
                Ok(reg) => {
                    debug!(
                        "tile {:?} frame {frame_index}: rho {:.4} after {} iterations",
                        tile.index, reg.correlation, reg.iterations
                    );
                    let warped = warp_inverse(candidate.as_ref(), &reg.transform, up_w, up_h, filter);
                    Ok((FrameOutcome::Aligned(reg), Some(warped)))
                }
                Err(source) => match config.on_registration_failure {
                    RegistrationFailurePolicy::Abort => Err(Error::Registration {
                        tile: tile.index,
                        frame: frame_index,
                        source,
                    }),
                    RegistrationFailurePolicy::SkipFrame => {
                        warn!("tile {:?}: skipping frame {frame_index}: {source}", tile.index);
                        Ok((FrameOutcome::Skipped(source), None))
                    }
                },
            }
        })
        .collect::<Result<Vec<_>, Error>>()?;

    let mut acc = TileAccumulator::new(up_w, up_h, frames.len());
    acc.add(reference.as_ref())?;
    let mut outcomes = Vec::with_capacity(aligned.len());
    for (outcome, warped) in aligned {
        if let Some(warped) = warped {
            acc.add(warped.as_ref())?;
        }
        outcomes.push(outcome);
    }

    let merged = deconvolve(acc.finish(), kernel, config.deconv_iterations, config.deconv_variant);
    Ok((merged, outcomes))
}

/// Copy the tile's inner part to its place in the canvas.
fn paste(canvas: &mut ImgVec<Rgbf>, tile: ImgRef<'_, Rgbf>, desc: &TileDescriptor) {
    let (dst, inner) = (desc.destination, desc.inner);
    let stride = canvas.stride();
    let buf = canvas.buf_mut();
    for (row, src_row) in tile.rows().skip(inner.y).take(inner.height).enumerate() {
        let start = (dst.y + row) * stride + dst.x;
        buf[start..start + dst.width].copy_from_slice(&src_row[inner.x..inner.right()]);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::filters::Interpolation;

    fn textured(w: usize, h: usize, dx: f32) -> Frame {
        let buf = (0..w * h)
            .map(|i| {
                let (x, y) = ((i % w) as f32 + dx, (i / w) as f32);
                let v = 120.0 + 50.0 * (x * 0.35).sin() * (y * 0.27).cos() + 20.0 * (x * 0.11 + y * 0.19).sin();
                Rgbf::new(v, v * 0.8, v * 0.6)
            })
            .collect();
        ImgVec::new(buf, w, h)
    }

    fn small_config() -> MergeConfig {
        MergeConfig {
            tile_size: 24,
            scale_factor: 2.0,
            margin_fraction: 0.25,
            interpolation: Interpolation::Bilinear,
            deconv_iterations: 3,
            ..Default::default()
        }
    }

    #[test]
    fn run_state_round_trips_progress() {
        let state = RunState::default();
        assert!(state.begin());
        assert!(!state.begin());
        state.set_progress(0.375);
        assert_eq!(state.progress(), 0.375);
        state.set_progress(7.0);
        assert_eq!(state.progress(), 1.0);
        state.request_cancel();
        state.finish();
        assert!(!state.is_processing() && !state.cancel_requested());
        assert_eq!(state.progress(), 0.0);
    }

    #[test]
    fn channel_observer_forwards_events() {
        let (tx, rx) = mpsc::channel();
        tx.on_progress(0.5);
        tx.on_error(&Error::NoInputs);
        assert_eq!(rx.recv().unwrap(), MergeEvent::Progress(0.5));
        assert!(matches!(rx.recv().unwrap(), MergeEvent::Error(_)));
    }

    #[test]
    fn rejects_bad_frame_sets() {
        let one = vec![textured(10, 10, 0.0)];
        assert!(matches!(check_frames(&one), Err(Error::TooFewFrames { found: 1 })));
        let mixed = vec![textured(10, 10, 0.0), textured(10, 11, 0.0)];
        assert!(matches!(
            check_frames(&mixed),
            Err(Error::DimensionMismatch { expected: (10, 10), found: (10, 11) })
        ));
    }

    #[test]
    fn merges_identical_frames_to_full_canvas() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.png");
        let frames = vec![textured(48, 40, 0.0), textured(48, 40, 0.0)];
        let state = RunState::default();
        let (tx, rx) = mpsc::channel();
        let canvas = merge_frames(&frames, &small_config(), &out, &state, &tx).unwrap();
        assert_eq!((canvas.width(), canvas.height()), (96, 80));
        // Nothing left black.
        assert!(canvas.pixels().all(|p| p.r > 1.0));
        let progress: Vec<f64> = rx
            .try_iter()
            .filter_map(|e| match e {
                MergeEvent::Progress(p) => Some(p),
                MergeEvent::Error(_) => None,
            })
            .collect();
        assert_eq!(progress.len(), 4);
        assert!(progress.windows(2).all(|w| w[0] < w[1]));
        assert_eq!(progress.last(), Some(&1.0));
        assert!(out.exists());
    }

    #[test]
    fn first_tile_column_leaves_black_stripe() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("out.png");
        let frames = vec![textured(48, 24, 0.0), textured(48, 24, 0.0)];
        let config = MergeConfig {
            first_tile_column: 1,
            ..small_config()
        };
        let canvas = merge_frames(&frames, &config, &out, &RunState::default(), &NoopObserver).unwrap();
        let row = &canvas.buf()[10 * canvas.stride()..][..96];
        assert!(row[..48].iter().all(|p| p.r == 0.0));
        assert!(row[48..].iter().all(|p| p.r > 1.0));
    }

    #[test]
    fn registration_failure_policy() {
        let mut flat = textured(24, 24, 0.0);
        flat.buf_mut().fill(Rgbf::new(90.0, 90.0, 90.0));
        let frames = vec![textured(24, 24, 0.0), flat];
        let grid = TileGrid::new(24, 24, 24, 2.0, 0.25).unwrap();
        let tile = grid.tile(0, 0).unwrap();
        let kernel = Kernel::analytic(5, 0.8).unwrap();

        let abort = small_config();
        let err = merge_tile(&frames, &grid, &tile, &abort, &kernel).unwrap_err();
        assert!(matches!(err, Error::Registration { tile: (0, 0), frame: 1, .. }), "{err}");

        let skip = MergeConfig {
            on_registration_failure: RegistrationFailurePolicy::SkipFrame,
            ..small_config()
        };
        let (merged, outcomes) = merge_tile(&frames, &grid, &tile, &skip, &kernel).unwrap();
        assert!(matches!(outcomes[..], [FrameOutcome::Skipped(_)]));
        // Only the reference contributed, at full weight.
        let mean = |img: ImgRef<'_, Rgbf>| {
            img.pixels().map(|p| p.r).sum::<f32>() / (img.width() * img.height()) as f32
        };
        let (got, want) = (mean(merged.as_ref()), mean(frames[0].as_ref()));
        assert!((got - want).abs() < 10.0, "mean {got}, reference {want}");
    }

    /// Panics on the first finished tile.
    #[derive(Default)]
    struct PanickingObserver {
        errors: std::sync::Mutex<Vec<String>>,
    }

    impl MergeObserver for PanickingObserver {
        fn on_progress(&self, progress: f64) {
            if progress > 0.0 {
                panic!("observer failure");
            }
        }

        fn on_error(&self, error: &Error) {
            self.errors.lock().unwrap().push(error.to_string());
        }
    }

    #[test]
    fn worker_panic_is_reported_and_clears_running() {
        let dir = tempfile::tempdir().unwrap();
        let observer = Arc::new(PanickingObserver::default());
        let mut merger = Merger::new(small_config()).with_observer(observer.clone());
        merger
            .load_frames(vec![textured(24, 24, 0.0), textured(24, 24, 0.0)])
            .unwrap();
        merger.start_merge(dir.path().join("out.png")).unwrap();
        merger.wait();

        assert!(!merger.is_running());
        assert!(merger.error_occurred());
        let errors = observer.errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].contains("observer failure"), "{errors:?}");
    }

    #[test]
    fn downscaling_config_is_rejected_before_running() {
        let dir = tempfile::tempdir().unwrap();
        let mut merger = Merger::new(MergeConfig {
            tile_size: 1,
            scale_factor: 0.3,
            margin_fraction: 0.0,
            ..Default::default()
        });
        merger
            .load_frames(vec![textured(10, 10, 0.0), textured(10, 10, 0.0)])
            .unwrap();
        let err = merger.start_merge(dir.path().join("out.png")).unwrap_err();
        assert!(matches!(err, Error::InvalidConfig(_)), "{err}");
        merger.wait();
        assert!(!merger.is_running());
        assert!(!merger.error_occurred());
    }

    #[test]
    fn merger_rejects_misuse() {
        let mut merger = Merger::new(small_config());
        assert!(matches!(merger.start_merge("out.png"), Err(Error::NoInputs)));
        assert!(matches!(
            merger.load_frames(vec![textured(8, 8, 0.0)]),
            Err(Error::TooFewFrames { found: 1 })
        ));
        let missing: [&Path; 0] = [];
        assert!(matches!(merger.load_inputs(&missing), Err(Error::TooFewFrames { found: 0 })));
    }
}
