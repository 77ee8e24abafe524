//! Solve entry points and the attempt they share.

use std::f64::consts::PI;

use crate::engine::{DistortionEngine, MatchRequest, MatchingEngine, Parity};
use crate::error::SolverError;
use crate::geom::sphere::arcsec_to_rad;
use crate::geom::{SkyDisc, SkyProjection};
use crate::index::Index;
use crate::session::{checked_scale, SolveState, SolverSession};

/// RA normalised to [0, 360) and both converted to radians.
fn checked_position(ra: f64, dec: f64) -> Result<(f64, f64), SolverError> {
    if !ra.is_finite() || !dec.is_finite() || dec.abs() > 90.0 {
        return Err(SolverError::InvalidPosition { ra, dec });
    }
    Ok((ra.rem_euclid(360.0).to_radians(), dec.to_radians()))
}

impl<M: MatchingEngine, D: DistortionEngine> SolverSession<M, D> {
    /// Solve with no position hint. `Ok(false)` when no match was found.
    pub fn solve_blind(&mut self) -> Result<bool, SolverError> {
        self.call_solver(None)
    }

    /// Solve near (RA, Dec) in degrees. Solutions must center within twice
    /// the largest quad radius of the position.
    pub fn solve_near(&mut self, ra: f64, dec: f64) -> Result<bool, SolverError> {
        self.ensure_not_solving()?;
        let position = checked_position(ra, dec)?;
        self.call_solver(Some(position))
    }

    /// Solve near an existing WCS: its field-center position, its plate
    /// scale within `scale_uncertainty` percent and its parity.
    ///
    /// The configuration is only changed once the session is ready to solve
    /// and every derived value is valid.
    pub fn solve_using_wcs_guess<P: SkyProjection>(
        &mut self,
        wcs: &P,
        scale_uncertainty: f64,
    ) -> Result<bool, SolverError> {
        self.check_ready()?;
        if !(scale_uncertainty > 0.0 && scale_uncertainty < 100.0) {
            return Err(SolverError::InvalidScaleUncertainty(scale_uncertainty));
        }
        let (cx, cy) = self.image_bounds()?.center();
        let (ra, dec) = wcs.pixel_to_radec(cx, cy);
        let position = checked_position(ra.to_degrees(), dec.to_degrees())?;
        let scale = checked_scale(wcs.pixel_area().sqrt() * 3600.0)?;
        let fraction = scale_uncertainty / 100.0;
        let parity = Parity::from(wcs.handedness());
        log::debug!(
            "WCS guess: ({:.5}, {:.5}) deg, {scale:.4} arcsec/pixel, {parity:?} parity",
            ra.to_degrees(),
            dec.to_degrees()
        );

        self.config.min_scale = scale * (1.0 - fraction);
        self.config.max_scale = scale * (1.0 + fraction);
        self.config.parity = parity;
        self.call_solver(Some(position))
    }

    /// Session state checks shared by every solve entry point.
    fn check_ready(&self) -> Result<(), SolverError> {
        self.ensure_not_solving()?;
        if self.field.is_none() {
            return Err(SolverError::FieldNotSet);
        }
        if self.catalog.is_empty() {
            return Err(SolverError::NoIndexLoaded);
        }
        if self.state == SolveState::Solved {
            return Err(SolverError::AlreadySolved);
        }
        Ok(())
    }

    fn check_preconditions(&self) -> Result<(), SolverError> {
        self.check_ready()?;
        if self.config.min_scale >= self.config.max_scale {
            return Err(SolverError::ScaleOrdering {
                min: self.config.min_scale,
                max: self.config.max_scale,
            });
        }
        Ok(())
    }

    /// One solve attempt with the current configuration, restricted to
    /// the neighbourhood of `position` (RA, Dec radians) when given.
    fn call_solver(&mut self, position: Option<(f64, f64)>) -> Result<bool, SolverError> {
        self.check_preconditions()?;
        let bounds = self.image_bounds()?;
        self.position = position;
        let (lower, upper) = (self.config.min_scale, self.config.max_scale);
        log::info!(
            "solving {:.0} x {:.0} pixel field at {lower:.3}..{upper:.3} arcsec/pixel",
            bounds.width,
            bounds.height
        );

        let min_dim = bounds.min_dimension();
        let (frac_lo, frac_hi) = self.config.quad_size_fraction;
        let quad_pix = (frac_lo * min_dim, frac_hi * min_dim);
        let quad_arcsec = (quad_pix.0 * lower, quad_pix.1 * upper);
        log::debug!(
            "quad sizes {:.1}..{:.1} pixels, {:.2}..{:.2} arcmin",
            quad_pix.0,
            quad_pix.1,
            quad_arcsec.0 / 60.0,
            quad_arcsec.1 / 60.0
        );

        // Twice the largest quad radius, the quad being up to the field diagonal.
        let region = self.position.map(|(ra, dec)| {
            let radius = arcsec_to_rad(upper * bounds.width.hypot(bounds.height)).min(PI);
            log::info!(
                "restricting to {:.3} deg around ({:.5}, {:.5})",
                radius.to_degrees(),
                ra.to_degrees(),
                dec.to_degrees()
            );
            SkyDisc::new(ra, dec, radius)
        });

        let slots = self.catalog.select_suitable(quad_arcsec, region.as_ref())?;

        self.state = SolveState::Solving;
        let found = {
            let Some(field) = self.field.as_ref() else {
                self.state = SolveState::FieldSet;
                return Err(SolverError::FieldNotSet);
            };
            let indexes: Vec<&Index> = slots.iter().filter_map(|&s| self.catalog.get(s)).collect();
            let request = MatchRequest {
                field: field.brightest(self.config.bright_limit),
                image_size: (bounds.width, bounds.height),
                indexes: &indexes,
                scale_range_arcsec: (lower, upper),
                quad_size_range_pix: quad_pix,
                parity: self.config.parity,
                position: region,
                log_odds_accept: self.config.match_threshold,
            };
            self.matcher.run(&request)
        };

        let Some(mut result) = found else {
            log::info!("no match found");
            self.state = SolveState::Failed;
            self.result = None;
            return Ok(false);
        };
        result.index_slot = slots[result.index_slot];
        log::info!(
            "solved with index {} ({:?} parity): {} matches, {} conflicts, {} unmatched, log-odds {:.1}",
            result.index_name,
            result.handedness(),
            result.counts.matched,
            result.counts.conflict,
            result.counts.distractor,
            result.log_odds
        );
        self.result = Some(result);
        self.state = SolveState::Solved;

        let order = self.config.refine_order;
        if order > 0 {
            match self.ensure_distortion(order) {
                Ok(_) => {
                    if let Some(r) = &self.result {
                        log::info!(
                            "after refinement: {} matches, {} conflicts, {} unmatched, log-odds {:.1}",
                            r.counts.matched,
                            r.counts.conflict,
                            r.counts.distractor,
                            r.log_odds
                        );
                    }
                }
                Err(e) => log::warn!("refinement after solve failed, keeping linear solution: {e}"),
            }
        }
        Ok(true)
    }
}
