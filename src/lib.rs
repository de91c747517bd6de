#![forbid(unsafe_code)]

//! Fuse a handheld burst of photographs into one upscaled, sharpened image.
//!
//! Small hand tremor between shots means every frame samples the scene at a
//! slightly different sub-pixel offset. This crate splits the first
//! (reference) frame into overlapping tiles, aligns every other frame to
//! each tile, averages the aligned tiles on an upscaled grid and sharpens
//! the average with Richardson-Lucy deconvolution.
//!
//! ## Pipeline
//!
//! - [`geometry`] lays out the tiles and where each lands in the output.
//! - [`align`] registers a candidate tile onto the reference tile: a phase
//!   correlation and affine seed, then ECC refinement under a rotation plus
//!   translation model. [`warp`] resamples the candidate accordingly.
//! - [`accumulate`] averages the aligned tiles.
//! - [`deconvolve`] inverts the blur described by a [`Kernel`].
//! - [`merge`] runs the tile loop on a worker thread, checkpointing the
//!   output after every tile.
//!
//! ```no_run
//! use burstfuse::{MergeConfig, Merger};
//!
//! let mut merger = Merger::new(MergeConfig::default());
//! merger.load_inputs(&["a.png", "b.png", "c.png"])?;
//! merger.start_merge("merged.png")?;
//! merger.wait();
//! assert!(!merger.error_occurred());
//! # Ok::<(), burstfuse::Error>(())
//! ```
//!
//! ## Resampling
//!
//! The separable weight tables in [`resample`] follow the approach of
//! [imageflow](https://github.com/imazen/imageflow) by Imazen. The filter
//! math in [`filters`] uses the standard definitions (sinc, Catmull-Rom).

pub mod accumulate;
pub mod align;
pub mod config;
pub mod convolve;
pub mod deconvolve;
pub mod fft;
pub mod filters;
pub mod geometry;
pub mod io;
pub mod kernel;
pub mod merge;
pub mod pixel;
pub mod resample;
pub mod transform;
pub mod warp;

pub use align::{Registration, RegistrationError, RegistrationParams};
pub use config::{KernelSpec, MergeConfig, RegistrationFailurePolicy};
pub use deconvolve::DeconvVariant;
pub use filters::Interpolation;
pub use geometry::{Rect, TileDescriptor, TileGrid};
pub use kernel::Kernel;
pub use merge::{FrameOutcome, MergeEvent, MergeObserver, Merger, NoopObserver, RunState};
pub use pixel::{Frame, Rgbf};
pub use transform::Affine;

/// Error type for loading, configuring and running a merge.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("at least two frames are needed, found {found}")]
    TooFewFrames { found: usize },
    #[error(
        "image dimensions differ: expected {}x{}, got {}x{}",
        expected.0, expected.1, found.0, found.1
    )]
    DimensionMismatch {
        expected: (usize, usize),
        found: (usize, usize),
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("image codec error: {0}")]
    Image(#[from] image::ImageError),
    #[error("registration failed on tile {tile:?}, frame {frame}: {source}")]
    Registration {
        tile: (usize, usize),
        frame: usize,
        source: RegistrationError,
    },
    #[error("invalid tile geometry: {0}")]
    InvalidGeometry(String),
    #[error("invalid kernel: {0}")]
    InvalidKernel(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("a merge is already running")]
    AlreadyRunning,
    #[error("no input frames loaded")]
    NoInputs,
    #[error("merge worker panicked: {0}")]
    WorkerPanicked(String),
}
