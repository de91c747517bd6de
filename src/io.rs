//! Reading frames from and writing frames to image files.

use std::fs;
use std::path::{Path, PathBuf};

use image::{ImageFormat, RgbImage};
use imgref::{ImgRef, ImgVec};
use log::trace;

use crate::Error;
use crate::pixel::{Frame, Rgbf};

/// Decode an image file into a frame on the 0..=255 scale.
pub fn load_frame(path: &Path) -> Result<Frame, Error> {
    let img = image::open(path)?.into_rgb8();
    let (w, h) = (img.width() as usize, img.height() as usize);
    let buf = img
        .pixels()
        .map(|p| Rgbf::new(p[0] as f32, p[1] as f32, p[2] as f32))
        .collect();
    Ok(ImgVec::new(buf, w, h))
}

fn to_rgb8(frame: ImgRef<'_, Rgbf>) -> Result<RgbImage, Error> {
    let quantize = |v: f32| v.round().clamp(0.0, 255.0) as u8;
    let raw: Vec<u8> = frame
        .pixels()
        .flat_map(|p| [quantize(p.r), quantize(p.g), quantize(p.b)])
        .collect();
    RgbImage::from_raw(frame.width() as u32, frame.height() as u32, raw).ok_or(
        Error::DimensionMismatch {
            expected: (frame.width(), frame.height()),
            found: (0, 0),
        },
    )
}

/// Encode `frame` to `path`, picking the format from the extension.
/// Values are rounded and clamped to 8 bits; NaN becomes 0.
pub fn save_frame(frame: ImgRef<'_, Rgbf>, path: &Path) -> Result<(), Error> {
    to_rgb8(frame)?.save(path)?;
    Ok(())
}

fn partial_path(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{name}.partial"))
}

/// Write `frame` next to `path` and move it into place, so readers never
/// see a half-written file.
pub fn write_checkpoint(frame: ImgRef<'_, Rgbf>, path: &Path) -> Result<(), Error> {
    let format = ImageFormat::from_path(path)?;
    let partial = partial_path(path);
    to_rgb8(frame)?.save_with_format(&partial, format)?;
    fs::rename(&partial, path)?;
    trace!("checkpointed {}", path.display());
    Ok(())
}
