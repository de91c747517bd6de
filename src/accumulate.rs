use imgref::{ImgRef, ImgVec};

use crate::Error;
use crate::pixel::Sample;

/// Running mean of `expected` equally weighted tiles.
///
/// Every tile is added pre-divided by `expected`, so once all of them are in
/// the buffer already holds the mean. Tiles that never arrive are made up
/// for in [`TileAccumulator::finish`].
#[derive(Debug, Clone)]
pub struct TileAccumulator<P> {
    sum: ImgVec<P>,
    expected: usize,
    contributed: usize,
}

impl<P: Sample> TileAccumulator<P> {
    pub fn new(width: usize, height: usize, expected: usize) -> Self {
        Self {
            sum: ImgVec::new(vec![P::ZERO; width * height], width, height),
            expected: expected.max(1),
            contributed: 0,
        }
    }

    pub fn add(&mut self, tile: ImgRef<'_, P>) -> Result<(), Error> {
        if (tile.width(), tile.height()) != (self.sum.width(), self.sum.height()) {
            return Err(Error::DimensionMismatch {
                expected: (self.sum.width(), self.sum.height()),
                found: (tile.width(), tile.height()),
            });
        }
        let weight = 1.0 / self.expected as f32;
        for (acc, px) in self.sum.buf_mut().iter_mut().zip(tile.pixels()) {
            *acc = acc.plus(px.scaled(weight));
        }
        self.contributed += 1;
        Ok(())
    }

    pub fn contributed(&self) -> usize {
        self.contributed
    }

    /// The mean of the tiles that were added.
    pub fn finish(mut self) -> ImgVec<P> {
        if self.contributed > 0 && self.contributed != self.expected {
            let rescale = self.expected as f32 / self.contributed as f32;
            for px in self.sum.buf_mut() {
                *px = px.scaled(rescale);
            }
        }
        self.sum
    }
}
