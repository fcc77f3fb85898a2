//! Contiguous per-process storage, with no distribution awareness.

use bytemuck::Pod;
use std::fmt::Debug;

/// Matrix element type: plain-old-data so fragments can travel as raw bytes.
pub trait Element: Pod + PartialEq + Debug + Send + Sync + 'static {}

impl<T> Element for T where T: Pod + PartialEq + Debug + Send + Sync + 'static {}

/// A column-major `height x width` fragment with an explicit leading
/// dimension. Local kernels receive this directly; nothing in here knows how
/// the fragment relates to the global matrix.
///
/// The generation counter increments on every reallocation so that detached
/// views can detect that their coordinates went stale.
#[derive(Debug, Clone)]
pub struct LocalBuffer<T> {
    data: Vec<T>,
    ldim: usize,
    height: usize,
    width: usize,
    generation: u64,
}

impl<T: Element> LocalBuffer<T> {
    pub fn new(height: usize, width: usize) -> Self {
        let ldim = height.max(1);
        Self {
            data: vec![T::zeroed(); ldim * width],
            ldim,
            height,
            width,
            generation: 0,
        }
    }

    pub fn height(&self) -> usize {
        self.height
    }

    pub fn width(&self) -> usize {
        self.width
    }

    /// Leading dimension: the storage distance between two elements of the
    /// same row in adjacent columns. Always at least the height.
    pub fn ldim(&self) -> usize {
        self.ldim
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    #[inline]
    fn index(&self, i: usize, j: usize) -> usize {
        debug_assert!(i < self.height && j < self.width, "index ({}, {}) out of bounds", i, j);
        j * self.ldim + i
    }

    #[inline]
    pub fn get(&self, i: usize, j: usize) -> T {
        self.data[self.index(i, j)]
    }

    #[inline]
    pub fn set(&mut self, i: usize, j: usize, value: T) {
        let index = self.index(i, j);
        self.data[index] = value;
    }

    pub fn fill(&mut self, value: T) {
        for column in 0..self.width {
            for row in 0..self.height {
                let index = self.index(row, column);
                self.data[index] = value;
            }
        }
    }

    /// One column as a contiguous slice.
    pub fn col(&self, j: usize) -> &[T] {
        debug_assert!(j < self.width);
        &self.data[j * self.ldim..j * self.ldim + self.height]
    }

    pub fn as_slice(&self) -> &[T] {
        &self.data
    }

    /// Reshapes the buffer, reallocating (and bumping the generation) when
    /// the new shape does not fit the existing storage. Contents are
    /// unspecified afterwards.
    pub fn resize(&mut self, height: usize, width: usize) {
        let ldim = height.max(1);
        if ldim * width != self.data.len() || ldim != self.ldim {
            self.data = vec![T::zeroed(); ldim * width];
            self.ldim = ldim;
            self.generation += 1;
        }
        self.height = height;
        self.width = width;
    }
}
