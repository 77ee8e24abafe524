//! Observed source lists prepared for matching.

use serde::{Deserialize, Serialize};

use crate::error::SolverError;

/// One detected source: pixel position and flux.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FieldStar {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
}

impl FieldStar {
    pub fn new(x: f64, y: f64, flux: f64) -> Self {
        FieldStar { x, y, flux }
    }

    /// Finite, non-negative position and positive flux.
    pub fn is_valid(&self) -> bool {
        self.x.is_finite()
            && self.y.is_finite()
            && self.flux.is_finite()
            && self.x >= 0.0
            && self.y >= 0.0
            && self.flux > 0.0
    }
}

/// Anything that can be read as a source: detection tables from other
/// pipelines implement this to feed [`Field::from_sources`].
pub trait PixelSource {
    fn pixel_x(&self) -> f64;
    fn pixel_y(&self) -> f64;
    fn flux(&self) -> f64;
}

impl PixelSource for FieldStar {
    fn pixel_x(&self) -> f64 {
        self.x
    }

    fn pixel_y(&self) -> f64 {
        self.y
    }

    fn flux(&self) -> f64 {
        self.flux
    }
}

impl PixelSource for (f64, f64, f64) {
    fn pixel_x(&self) -> f64 {
        self.0
    }

    fn pixel_y(&self) -> f64 {
        self.1
    }

    fn flux(&self) -> f64 {
        self.2
    }
}

/// Valid sources ordered by descending flux.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    stars: Vec<FieldStar>,
}

/// Pixel extent of a field.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FieldBounds {
    pub width: f64,
    pub height: f64,
}

impl FieldBounds {
    pub fn min_dimension(&self) -> f64 {
        self.width.min(self.height)
    }

    pub fn center(&self) -> (f64, f64) {
        (self.width / 2.0, self.height / 2.0)
    }

    pub fn contains(&self, x: f64, y: f64, margin: f64) -> bool {
        x >= -margin && x <= self.width + margin && y >= -margin && y <= self.height + margin
    }
}

impl Field {
    /// Validate, filter and sort a source list.
    ///
    /// Both the raw and the filtered counts must reach `min_count`.
    pub fn from_sources<S: PixelSource>(sources: &[S], min_count: usize) -> Result<Self, SolverError> {
        if sources.is_empty() {
            return Err(SolverError::EmptySourceList);
        }
        if sources.len() < min_count {
            return Err(SolverError::TooFewSources {
                found: sources.len(),
                required: min_count,
            });
        }

        let mut stars: Vec<FieldStar> = sources
            .iter()
            .map(|s| FieldStar::new(s.pixel_x(), s.pixel_y(), s.flux()))
            .filter(FieldStar::is_valid)
            .collect();
        if stars.len() < min_count {
            return Err(SolverError::TooFewValidSources {
                valid: stars.len(),
                required: min_count,
            });
        }

        // Stable sort keeps input order among equal fluxes.
        stars.sort_by(|a, b| b.flux.total_cmp(&a.flux));
        log::debug!(
            "field prepared: {} of {} sources valid",
            stars.len(),
            sources.len()
        );
        Ok(Field { stars })
    }

    pub fn len(&self) -> usize {
        self.stars.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stars.is_empty()
    }

    pub fn stars(&self) -> &[FieldStar] {
        &self.stars
    }

    /// The `n` brightest stars, or every star when `n` is `None` or exceeds
    /// the field size.
    pub fn brightest(&self, n: Option<usize>) -> &[FieldStar] {
        let n = n.map_or(self.stars.len(), |n| n.min(self.stars.len()));
        &self.stars[..n]
    }

    /// Extent of the sources measured from the pixel origin.
    pub fn bounds(&self) -> FieldBounds {
        let (width, height) = self
            .stars
            .iter()
            .fold((0.0_f64, 0.0_f64), |(w, h), s| (w.max(s.x), h.max(s.y)));
        FieldBounds { width, height }
    }
}
