//! Correspondences between the solved field and the reference catalog,
//! and catalog queries around a position or the solution.

use serde::Serialize;

use crate::engine::{DistortionEngine, MatchingEngine};
use crate::error::SolverError;
use crate::field::FieldBounds;
use crate::geom::sphere::{arcsec_to_rad, radec_to_xyz};
use crate::geom::SkyProjection;
use crate::index::Index;
use crate::session::SolverSession;

/// Per-star log-odds above which a match is treated as certain.
const CERTAIN_LOG_ODDS: f64 = 40.0;

/// A field source as observed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ObservedSource {
    pub x: f64,
    pub y: f64,
    pub flux: f64,
    /// Pixels; shrinks towards 1 as the match becomes certain.
    pub position_error: f64,
}

/// A reference star. RA and Dec in degrees.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CatalogSource {
    pub catalog_id: u64,
    pub ra: f64,
    pub dec: f64,
    /// Position in the solved image, when projected.
    pub pixel: Option<(f64, f64)>,
    /// Linear flux from the requested magnitude column.
    pub flux: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SourceMatch {
    /// Position of the observed source in the field.
    pub field_index: usize,
    pub observed: ObservedSource,
    pub catalog: CatalogSource,
    /// Pixels between the observed and projected catalog positions.
    pub distance: f64,
}

/// Logistic map of a match's log-odds to (0, 1].
fn confidence(log_odds: f64) -> f64 {
    if log_odds > CERTAIN_LOG_ODDS {
        1.0
    } else {
        1.0 / (1.0 + (-log_odds).exp())
    }
}

fn magnitude_to_flux(mag: f64) -> f64 {
    10f64.powf(-mag / 2.5)
}

fn catalog_source(index: &Index, star: usize, mags: Option<&[f64]>) -> Option<CatalogSource> {
    let s = index.data()?.stars.get(star)?;
    Some(CatalogSource {
        catalog_id: s.catalog_id,
        ra: s.ra.to_degrees(),
        dec: s.dec.to_degrees(),
        pixel: None,
        flux: mags.and_then(|m| m.get(star)).map(|&mag| magnitude_to_flux(mag)),
    })
}

impl<M: MatchingEngine, D: DistortionEngine> SolverSession<M, D> {
    /// The solution's projection: the distortion fit when there is one.
    fn solved_projection(&self) -> Result<Box<dyn SkyProjection>, SolverError> {
        let result = self.ensure_solved()?;
        Ok(match &result.distortion {
            Some(sip) => Box::new(sip.clone()),
            None => Box::new(result.wcs.clone()),
        })
    }

    /// Every field star the solution matched, paired with its reference
    /// star. `mag_column` names the tag-along column fluxes come from.
    pub fn matched_sources(&self, mag_column: Option<&str>) -> Result<Vec<SourceMatch>, SolverError> {
        let result = self.ensure_solved()?;
        let field = self.field.as_ref().ok_or(SolverError::FieldNotSet)?;
        let projection = self.solved_projection()?;
        let index = self.catalog.get(result.index_slot).ok_or(SolverError::NotSolved)?;
        let mags = mag_column.map(|name| index.tag_along(name)).transpose()?;

        let mut matches = Vec::with_capacity(result.counts.matched);
        for (i, theta) in result.theta.iter().enumerate() {
            let Some(reference) = theta.and_then(|r| result.refs.get(r)) else {
                continue;
            };
            let Some(star) = field.stars().get(i) else {
                continue;
            };
            let Some(mut catalog) = catalog_source(index, reference.star, mags) else {
                continue;
            };
            let Some((px, py)) = projection.radec_to_pixel(reference.ra, reference.dec) else {
                continue;
            };
            catalog.pixel = Some((px, py));

            let odds = result.match_odds.get(i).copied().unwrap_or(0.0);
            matches.push(SourceMatch {
                field_index: i,
                observed: ObservedSource {
                    x: star.x,
                    y: star.y,
                    flux: star.flux,
                    position_error: 1.0 / (confidence(odds) + f64::EPSILON),
                },
                catalog,
                distance: (star.x - px).hypot(star.y - py),
            });
        }
        log::debug!("{} matched sources", matches.len());
        Ok(matches)
    }

    /// Reference stars within `radius_arcsec` of (RA, Dec) in degrees, from
    /// every index covering the disc. Stars held by several indices are
    /// returned once per index.
    pub fn catalogue(
        &mut self,
        ra: f64,
        dec: f64,
        radius_arcsec: f64,
        mag_column: Option<&str>,
    ) -> Result<Vec<CatalogSource>, SolverError> {
        if !ra.is_finite() || !dec.is_finite() || dec.abs() > 90.0 {
            return Err(SolverError::InvalidPosition { ra, dec });
        }
        if !radius_arcsec.is_finite() || radius_arcsec < 0.0 {
            return Err(SolverError::InvalidSearchRadius(radius_arcsec));
        }
        self.query(
            (ra.to_radians(), dec.to_radians()),
            arcsec_to_rad(radius_arcsec),
            mag_column,
            true,
        )
    }

    /// [`SolverSession::catalogue`] around the solved field center.
    pub fn catalogue_around_solution(
        &mut self,
        radius_arcsec: f64,
        mag_column: Option<&str>,
    ) -> Result<Vec<CatalogSource>, SolverError> {
        let (ra, dec) = self.ensure_solved()?.wcs.field_center();
        self.catalogue(ra.to_degrees(), dec.to_degrees(), radius_arcsec, mag_column)
    }

    /// Reference stars that project into the solved image grown by
    /// `margin_pix` on every side, with their pixel positions. Indices
    /// lacking `mag_column` contribute stars without flux.
    pub fn catalogue_for_solved_field(
        &mut self,
        mag_column: Option<&str>,
        margin_pix: f64,
    ) -> Result<Vec<CatalogSource>, SolverError> {
        if !margin_pix.is_finite() || margin_pix < 0.0 {
            return Err(SolverError::InvalidSearchRadius(margin_pix));
        }
        let result = self.ensure_solved()?;
        let wcs = result.wcs.clone();
        let projection = self.solved_projection()?;

        let radius = wcs.field_radius() + arcsec_to_rad(wcs.pixel_scale_arcsec() * margin_pix);
        let [width, height] = wcs.image_size;
        let bounds = FieldBounds { width, height };
        let sources = self.query(wcs.field_center(), radius, mag_column, false)?;
        let total = sources.len();

        let inside: Vec<CatalogSource> = sources
            .into_iter()
            .filter_map(|mut source| {
                let (x, y) =
                    projection.radec_to_pixel(source.ra.to_radians(), source.dec.to_radians())?;
                source.pixel = Some((x, y));
                bounds.contains(x, y, margin_pix).then_some(source)
            })
            .collect();
        log::debug!(
            "{} of {total} catalog stars fall within the field and a {margin_pix} pixel margin",
            inside.len()
        );
        Ok(inside)
    }

    /// Tag-along columns of the first configured index. Empty when that
    /// index has none; other indices are not consulted.
    pub fn catalogue_metadata_fields(&self) -> Vec<String> {
        if self.catalog.tag_along_schemas().len() > 1 {
            log::debug!("indices carry differing tag-along columns; reporting the first");
        }
        self.catalog
            .get(0)
            .map(|index| index.meta.tag_along.clone())
            .unwrap_or_default()
    }

    /// Stars within `radius` radians of `center` from every covering index.
    /// With `strict`, an index lacking `mag_column` is an error; otherwise
    /// its stars come back without flux.
    fn query(
        &mut self,
        center: (f64, f64),
        radius: f64,
        mag_column: Option<&str>,
        strict: bool,
    ) -> Result<Vec<CatalogSource>, SolverError> {
        let (ra, dec) = center;
        let xyz = radec_to_xyz(ra, dec);
        let mut sources = Vec::new();

        for slot in 0..self.catalog.len() {
            let covers = self
                .catalog
                .get(slot)
                .is_some_and(|index| index.meta.is_within_range(ra, dec, radius));
            if !covers {
                continue;
            }
            self.catalog.ensure_loaded(slot)?;
            let Some(index) = self.catalog.get(slot) else {
                continue;
            };
            let Some(data) = index.data() else {
                continue;
            };

            let mags = match mag_column.map(|name| index.tag_along(name)).transpose() {
                Ok(mags) => mags,
                Err(e) if strict => return Err(e.into()),
                Err(e) => {
                    log::warn!("{e}; returning stars without flux");
                    None
                }
            };
            let found = data.stars_within(xyz, radius);
            log::debug!("index {}: {} stars in range", index.meta.name, found.len());
            sources.extend(found.into_iter().filter_map(|star| catalog_source(index, star, mags)));
        }
        Ok(sources)
    }
}
