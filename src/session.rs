//! Solve sessions: configuration, the prepared field and solve state.
//!
//! A session moves through `Unconfigured → FieldSet → Solving → {Solved |
//! Failed}`. Solving runs to completion on the calling thread, so
//! `Solving` is only ever seen by code running inside a solve.

use std::fmt;

use crate::config::{SkySystem, SolveConfig, SolverPolicy};
use crate::engine::{
    DistortionEngine, MatchResult, MatchingEngine, Parity, QuadMatcher, SipRefiner,
};
use crate::error::SolverError;
use crate::field::{Field, FieldBounds, PixelSource};
use crate::index::IndexCatalog;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SolveState {
    Unconfigured,
    FieldSet,
    Solving,
    Solved,
    Failed,
}

impl fmt::Display for SolveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SolveState::Unconfigured => "unconfigured",
            SolveState::FieldSet => "field set",
            SolveState::Solving => "solving",
            SolveState::Solved => "solved",
            SolveState::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// One plate-solving session over a shared index catalog.
///
/// The matching and distortion engines are pluggable; the defaults are
/// [`QuadMatcher`] and [`SipRefiner`].
pub struct SolverSession<M = QuadMatcher, D = SipRefiner> {
    pub(crate) catalog: IndexCatalog,
    pub(crate) sky: SkySystem,
    pub(crate) defaults: SolveConfig,
    pub(crate) config: SolveConfig,
    pub(crate) state: SolveState,
    pub(crate) field: Option<Field>,
    /// Position hint (RA, Dec) in radians for the next solve.
    pub(crate) position: Option<(f64, f64)>,
    pub(crate) result: Option<MatchResult>,
    pub(crate) matcher: M,
    pub(crate) refiner: D,
}

impl SolverSession {
    /// Open every index the policy names and start a session over them.
    pub fn new(policy: &SolverPolicy) -> Self {
        let files = policy.resolved_index_files();
        let catalog = IndexCatalog::load_metadata(&files[..]);
        SolverSession::with_catalog(catalog, policy.sky_system())
    }

    pub fn with_catalog(catalog: IndexCatalog, sky: SkySystem) -> Self {
        SolverSession::with_engines(catalog, sky, QuadMatcher::default(), SipRefiner::default())
    }
}

impl<M: MatchingEngine, D: DistortionEngine> SolverSession<M, D> {
    pub fn with_engines(catalog: IndexCatalog, sky: SkySystem, matcher: M, refiner: D) -> Self {
        SolverSession {
            catalog,
            sky,
            defaults: SolveConfig::default(),
            config: SolveConfig::default(),
            state: SolveState::Unconfigured,
            field: None,
            position: None,
            result: None,
            matcher,
            refiner,
        }
    }

    /// Replace the configuration the session starts from and resets to.
    pub fn with_defaults(mut self, defaults: SolveConfig) -> Self {
        self.config = defaults.clone();
        self.defaults = defaults;
        self
    }

    pub fn state(&self) -> SolveState {
        self.state
    }

    pub fn is_solved(&self) -> bool {
        self.state == SolveState::Solved
    }

    pub fn config(&self) -> &SolveConfig {
        &self.config
    }

    pub fn sky_system(&self) -> SkySystem {
        self.sky
    }

    pub fn field(&self) -> Option<&Field> {
        self.field.as_ref()
    }

    pub fn match_result(&self) -> Option<&MatchResult> {
        self.result.as_ref()
    }

    pub fn catalog(&self) -> &IndexCatalog {
        &self.catalog
    }

    pub fn catalog_mut(&mut self) -> &mut IndexCatalog {
        &mut self.catalog
    }

    pub(crate) fn ensure_not_solving(&self) -> Result<(), SolverError> {
        if self.state == SolveState::Solving {
            return Err(SolverError::SolveInProgress);
        }
        Ok(())
    }

    pub(crate) fn ensure_solved(&self) -> Result<&MatchResult, SolverError> {
        match (&self.state, &self.result) {
            (SolveState::Solved, Some(result)) => Ok(result),
            _ => Err(SolverError::NotSolved),
        }
    }

    /// Validate and store a source list.
    ///
    /// On error the session is left exactly as it was.
    pub fn set_field<S: PixelSource>(&mut self, sources: &[S]) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        if self.state == SolveState::Solved {
            return Err(SolverError::AlreadySolved);
        }
        let field = Field::from_sources(sources, self.config.min_field_stars)?;
        log::debug!("field set with {} sources", field.len());
        self.field = Some(field);
        self.result = None;
        self.state = SolveState::FieldSet;
        Ok(())
    }

    /// Match with only the `n` brightest sources. Distortion fitting still
    /// uses the whole field.
    pub fn set_bright_limit(&mut self, n: usize) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        if n == 0 {
            return Err(SolverError::InvalidBrightLimit);
        }
        self.config.bright_limit = Some(n);
        Ok(())
    }

    /// Lower image scale bound, arcseconds per pixel.
    pub fn set_minimum_image_scale(&mut self, scale: f64) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        self.config.min_scale = checked_scale(scale)?;
        Ok(())
    }

    /// Upper image scale bound, arcseconds per pixel.
    pub fn set_maximum_image_scale(&mut self, scale: f64) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        self.config.max_scale = checked_scale(scale)?;
        Ok(())
    }

    /// Bracket a known scale by one percent either side.
    pub fn set_image_scale(&mut self, scale: f64) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        let scale = checked_scale(scale)?;
        self.config.min_scale = 0.99 * scale;
        self.config.max_scale = 1.01 * scale;
        Ok(())
    }

    pub fn set_parity(&mut self, parity: Parity) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        self.config.parity = parity;
        Ok(())
    }

    /// Parity by numeric code: 0 normal, 1 flipped, 2 unknown.
    pub fn set_parity_code(&mut self, code: i32) -> Result<(), SolverError> {
        let parity = Parity::try_from(code)?;
        self.set_parity(parity)
    }

    /// Log-odds a match must reach to be accepted.
    pub fn set_match_threshold(&mut self, log_odds: f64) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        self.config.match_threshold = log_odds;
        Ok(())
    }

    pub fn set_image_size(&mut self, width: f64, height: f64) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        let valid = |v: f64| v.is_finite() && v > 0.0;
        if !valid(width) || !valid(height) {
            return Err(SolverError::InvalidImageSize { width, height });
        }
        self.config.image_size = Some((width, height));
        Ok(())
    }

    /// Return to `Unconfigured` with the default configuration. The index
    /// catalog, loaded data included, is kept.
    pub fn reset(&mut self) {
        self.state = SolveState::Unconfigured;
        self.field = None;
        self.result = None;
        self.position = None;
        self.config = self.defaults.clone();
    }

    /// Image extent used for solving: the configured size, else the extent
    /// of the field, which must have non-zero width and height.
    pub(crate) fn image_bounds(&self) -> Result<FieldBounds, SolverError> {
        if let Some((width, height)) = self.config.image_size {
            return Ok(FieldBounds { width, height });
        }
        let bounds = self
            .field
            .as_ref()
            .map(Field::bounds)
            .ok_or(SolverError::FieldNotSet)?;
        if bounds.min_dimension() <= 0.0 {
            return Err(SolverError::DegenerateFieldExtent {
                width: bounds.width,
                height: bounds.height,
            });
        }
        Ok(bounds)
    }
}

pub(crate) fn checked_scale(scale: f64) -> Result<f64, SolverError> {
    if scale.is_finite() && scale > 0.0 {
        Ok(scale)
    } else {
        Err(SolverError::InvalidScale(scale))
    }
}
