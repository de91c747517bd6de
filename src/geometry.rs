//! Tile layout: which part of the reference frame a tile reads, where its
//! result lands in the upscaled canvas, and which part of the upscaled tile
//! is kept.

use crate::Error;

/// Axis-aligned pixel rectangle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Rect {
    pub x: usize,
    pub y: usize,
    pub width: usize,
    pub height: usize,
}

impl Rect {
    pub fn new(x: usize, y: usize, width: usize, height: usize) -> Self {
        Self { x, y, width, height }
    }

    pub fn right(&self) -> usize {
        self.x + self.width
    }

    pub fn bottom(&self) -> usize {
        self.y + self.height
    }

    pub fn is_empty(&self) -> bool {
        self.width == 0 || self.height == 0
    }

    /// Whether `self` lies inside a `width × height` image.
    pub fn fits_within(&self, width: usize, height: usize) -> bool {
        self.right() <= width && self.bottom() <= height
    }
}

/// Everything needed to process one tile.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileDescriptor {
    /// Tile column and row.
    pub index: (usize, usize),
    /// Tile plus margin in reference-frame coordinates.
    pub source: Rect,
    /// Size the source rectangle is upscaled to.
    pub upscaled_size: (usize, usize),
    /// Where the kept part lands in the canvas.
    pub destination: Rect,
    /// Kept part, in upscaled tile-local coordinates. Same size as `destination`.
    pub inner: Rect,
}

/// Tiling of a `width × height` frame into `tile_size` tiles, upscaled by
/// `scale ≥ 1` with a `margin` fraction of context around each tile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TileGrid {
    width: usize,
    height: usize,
    tile_size: usize,
    scale: f64,
    with_margin: usize,
    margin_pixels: usize,
    canvas: (usize, usize),
    reserve_canvas_edge: bool,
}

/// Per-axis layout of one tile.
struct Span {
    source_start: usize,
    source_len: usize,
    clipped: usize,
    dest_start: usize,
    dest_len: usize,
}

impl TileGrid {
    pub fn new(
        width: usize,
        height: usize,
        tile_size: usize,
        scale: f64,
        margin_fraction: f64,
    ) -> Result<Self, Error> {
        if width == 0 || height == 0 {
            return Err(Error::InvalidGeometry(format!("empty frame {width}x{height}")));
        }
        if tile_size == 0 {
            return Err(Error::InvalidGeometry("tile size must be positive".into()));
        }
        if !(scale.is_finite() && scale >= 1.0) {
            return Err(Error::InvalidGeometry(format!(
                "scale factor must be at least 1, got {scale}"
            )));
        }
        if !(margin_fraction.is_finite() && margin_fraction >= 0.0) {
            return Err(Error::InvalidGeometry(format!(
                "invalid margin fraction {margin_fraction}"
            )));
        }

        let with_margin = (tile_size as f64 * (1.0 + margin_fraction)) as usize;
        let margin_pixels = with_margin.saturating_sub(tile_size) / 2;
        let canvas = (
            (width as f64 * scale).round() as usize,
            (height as f64 * scale).round() as usize,
        );
        if canvas.0 == 0 || canvas.1 == 0 {
            return Err(Error::InvalidGeometry(format!(
                "scale {scale} collapses {width}x{height} to nothing"
            )));
        }

        Ok(Self {
            width,
            height,
            tile_size,
            scale,
            with_margin,
            margin_pixels,
            canvas,
            reserve_canvas_edge: false,
        })
    }

    /// Stop tiles one pixel short of the canvas's far edges, leaving the last
    /// column and row unwritten.
    pub fn with_reserved_canvas_edge(mut self, reserve: bool) -> Self {
        self.reserve_canvas_edge = reserve;
        self
    }

    /// Number of tiles along x and y.
    pub fn tile_count(&self) -> (usize, usize) {
        (
            self.width.div_ceil(self.tile_size),
            self.height.div_ceil(self.tile_size),
        )
    }

    pub fn canvas_size(&self) -> (usize, usize) {
        self.canvas
    }

    pub fn margin_pixels(&self) -> usize {
        self.margin_pixels
    }

    pub fn scale(&self) -> f64 {
        self.scale
    }

    fn span(&self, index: usize, count: usize, image_len: usize, canvas_len: usize) -> Span {
        let tile = self.tile_size;

        // Source rectangle with margin, clamped to the frame.
        let nominal = (tile * index) as isize - self.margin_pixels as isize;
        let mut len = self.with_margin;
        let (start, clipped) = if nominal < 0 {
            let clipped = nominal.unsigned_abs();
            len -= clipped;
            (0, clipped)
        } else {
            (nominal as usize, 0)
        };
        if start + len > image_len {
            len = image_len - start;
        }

        // Destination rectangle in the canvas.
        let limit = if self.reserve_canvas_edge { canvas_len - 1 } else { canvas_len };
        let step = tile as f64 * self.scale;
        let dest_start = ((step * index as f64).round() as usize).min(limit);
        let dest_end = if index + 1 == count {
            limit
        } else {
            ((step * (index + 1) as f64).round() as usize).min(limit)
        };

        Span {
            source_start: start,
            source_len: len,
            clipped,
            dest_start,
            dest_len: dest_end.saturating_sub(dest_start),
        }
    }

    /// Layout of tile `(tx, ty)`.
    pub fn tile(&self, tx: usize, ty: usize) -> Result<TileDescriptor, Error> {
        let (nx, ny) = self.tile_count();
        if tx >= nx || ty >= ny {
            return Err(Error::InvalidGeometry(format!(
                "tile ({tx}, {ty}) outside {nx}x{ny} grid"
            )));
        }
        let sx = self.span(tx, nx, self.width, self.canvas.0);
        let sy = self.span(ty, ny, self.height, self.canvas.1);

        let inner_x = (self.margin_pixels.saturating_sub(sx.clipped) as f64 * self.scale).round()
            as usize;
        let inner_y = (self.margin_pixels.saturating_sub(sy.clipped) as f64 * self.scale).round()
            as usize;

        // Rounding can leave the upscaled tile a pixel short of the crop. The
        // tile is then stretched by that pixel, which shifts content near its
        // far edge by under one output pixel.
        let up_w = ((sx.source_len as f64 * self.scale).round() as usize).max(inner_x + sx.dest_len);
        let up_h = ((sy.source_len as f64 * self.scale).round() as usize).max(inner_y + sy.dest_len);

        Ok(TileDescriptor {
            index: (tx, ty),
            source: Rect::new(sx.source_start, sy.source_start, sx.source_len, sy.source_len),
            upscaled_size: (up_w, up_h),
            destination: Rect::new(sx.dest_start, sy.dest_start, sx.dest_len, sy.dest_len),
            inner: Rect::new(inner_x, inner_y, sx.dest_len, sy.dest_len),
        })
    }

    /// All tiles from column `first_column` on, x outer and y inner.
    pub fn tiles(&self, first_column: usize) -> impl Iterator<Item = (usize, usize)> + use<> {
        let (nx, ny) = self.tile_count();
        (first_column..nx).flat_map(move |tx| (0..ny).map(move |ty| (tx, ty)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grids() -> Vec<TileGrid> {
        let mut out = Vec::new();
        for &(w, h) in &[(100, 100), (120, 77), (37, 250), (1, 1), (513, 301)] {
            for &tile in &[7, 32, 50, 256] {
                for &scale in &[1.0, 1.4, 1.49, 2.0, 2.5, 3.0] {
                    for &margin in &[0.0, 0.1, 0.25] {
                        out.push(TileGrid::new(w, h, tile, scale, margin).unwrap());
                    }
                }
            }
        }
        out
    }

    #[test]
    fn tile_counts_round_up() {
        let grid = TileGrid::new(120, 77, 50, 2.0, 0.1).unwrap();
        assert_eq!(grid.tile_count(), (3, 2));
        assert_eq!(grid.canvas_size(), (240, 154));
        assert_eq!(grid.margin_pixels(), 2);
    }

    #[test]
    fn interior_tile_layout() {
        let grid = TileGrid::new(200, 200, 50, 2.0, 0.1).unwrap();
        let t = grid.tile(1, 2).unwrap();
        assert_eq!(t.source, Rect::new(48, 98, 55, 55));
        assert_eq!(t.upscaled_size, (110, 110));
        assert_eq!(t.destination, Rect::new(100, 200, 100, 100));
        assert_eq!(t.inner, Rect::new(4, 4, 100, 100));
    }

    #[test]
    fn corner_tiles_are_clipped() {
        let grid = TileGrid::new(100, 100, 50, 2.0, 0.1).unwrap();
        let first = grid.tile(0, 0).unwrap();
        assert_eq!(first.source, Rect::new(0, 0, 53, 53));
        assert_eq!(first.inner, Rect::new(0, 0, 100, 100));

        let last = grid.tile(1, 1).unwrap();
        assert_eq!(last.source, Rect::new(48, 48, 52, 52));
        assert_eq!(last.destination, Rect::new(100, 100, 100, 100));
        assert_eq!(last.inner, Rect::new(4, 4, 100, 100));
    }

    #[test]
    fn rectangles_stay_inside_their_images() {
        for grid in grids() {
            let (cw, ch) = grid.canvas_size();
            let (nx, ny) = grid.tile_count();
            for (tx, ty) in grid.tiles(0) {
                let t = grid.tile(tx, ty).unwrap();
                assert!(t.source.fits_within(grid.width, grid.height), "{grid:?} {t:?}");
                assert!(!t.source.is_empty(), "{grid:?} {t:?}");
                assert!(t.destination.fits_within(cw, ch), "{grid:?} {t:?}");
                assert!(t.inner.fits_within(t.upscaled_size.0, t.upscaled_size.1), "{grid:?} {t:?}");
                assert_eq!(
                    (t.inner.width, t.inner.height),
                    (t.destination.width, t.destination.height)
                );
            }
            assert!(grid.tile(nx, 0).is_err());
            assert!(grid.tile(0, ny).is_err());
        }
    }

    #[test]
    fn upscaled_tiles_are_never_empty_and_barely_stretched() {
        for grid in grids() {
            for (tx, ty) in grid.tiles(0) {
                let t = grid.tile(tx, ty).unwrap();
                let natural = (
                    (t.source.width as f64 * grid.scale()).round() as usize,
                    (t.source.height as f64 * grid.scale()).round() as usize,
                );
                assert!(t.upscaled_size.0 >= 1 && t.upscaled_size.1 >= 1, "{grid:?} {t:?}");
                assert!(t.upscaled_size.0 - natural.0 <= 1, "{grid:?} {t:?}");
                assert!(t.upscaled_size.1 - natural.1 <= 1, "{grid:?} {t:?}");
            }
        }
    }

    #[test]
    fn destinations_tile_the_canvas_exactly() {
        for grid in grids() {
            let (cw, ch) = grid.canvas_size();
            let mut hits = vec![0u8; cw * ch];
            for (tx, ty) in grid.tiles(0) {
                let d = grid.tile(tx, ty).unwrap().destination;
                for y in d.y..d.bottom() {
                    for x in d.x..d.right() {
                        hits[y * cw + x] += 1;
                    }
                }
            }
            assert!(hits.iter().all(|&h| h == 1), "{grid:?}");
        }
    }

    #[test]
    fn reserved_edge_leaves_last_row_and_column() {
        let grid = TileGrid::new(100, 100, 50, 2.0, 0.1)
            .unwrap()
            .with_reserved_canvas_edge(true);
        let last = grid.tile(1, 1).unwrap();
        assert_eq!(last.destination, Rect::new(100, 100, 99, 99));
        assert_eq!((last.inner.width, last.inner.height), (99, 99));
    }

    #[test]
    fn tile_order_is_column_major_from_first_column() {
        let grid = TileGrid::new(120, 77, 50, 1.0, 0.1).unwrap();
        let all: Vec<_> = grid.tiles(0).collect();
        assert_eq!(all, vec![(0, 0), (0, 1), (1, 0), (1, 1), (2, 0), (2, 1)]);
        let skipped: Vec<_> = grid.tiles(1).collect();
        assert_eq!(skipped.first(), Some(&(1, 0)));
        assert_eq!(skipped.len(), 4);
    }

    #[test]
    fn rejects_invalid_parameters() {
        assert!(TileGrid::new(0, 10, 5, 2.0, 0.1).is_err());
        assert!(TileGrid::new(10, 10, 0, 2.0, 0.1).is_err());
        assert!(TileGrid::new(10, 10, 5, 0.0, 0.1).is_err());
        assert!(TileGrid::new(10, 10, 5, f64::NAN, 0.1).is_err());
        assert!(TileGrid::new(10, 10, 1, 0.3, 0.0).is_err());
        assert!(TileGrid::new(10, 10, 5, 0.999, 0.1).is_err());
        assert!(TileGrid::new(10, 10, 5, 2.0, -0.1).is_err());
    }
}
