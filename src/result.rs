//! World coordinate systems extracted from a solved session.

use serde::Serialize;

use crate::config::SkySystem;
use crate::engine::{DistortionEngine, MatchingEngine, RefineError, RefineRequest};
use crate::error::SolverError;
use crate::geom::sip::{sip_terms, MAX_SIP_ORDER};
use crate::geom::{Handedness, SipWcs, SkyProjection, TanWcs};
use crate::session::{SolveState, SolverSession};

/// Value of one FITS-style header card.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum HeaderValue {
    Text(String),
    Int(i64),
    Float(f64),
}

pub type HeaderCards = Vec<(String, HeaderValue)>;

fn text(key: &str, value: &str) -> (String, HeaderValue) {
    (key.to_string(), HeaderValue::Text(value.to_string()))
}

fn int(key: &str, value: i64) -> (String, HeaderValue) {
    (key.to_string(), HeaderValue::Int(value))
}

fn float(key: &str, value: f64) -> (String, HeaderValue) {
    (key.to_string(), HeaderValue::Float(value))
}

fn linear_cards(tan: &TanWcs, sky: SkySystem, suffix: &str) -> HeaderCards {
    let cd = tan.cd.map(|row| row.map(f64::to_degrees));
    vec![
        text("CTYPE1", &format!("RA---TAN{suffix}")),
        text("CTYPE2", &format!("DEC--TAN{suffix}")),
        text("CUNIT1", "deg"),
        text("CUNIT2", "deg"),
        float("CRVAL1", tan.crval[0].to_degrees()),
        float("CRVAL2", tan.crval[1].to_degrees()),
        // FITS pixels are 1-based.
        float("CRPIX1", tan.crpix[0] + 1.0),
        float("CRPIX2", tan.crpix[1] + 1.0),
        float("CD1_1", cd[0][0]),
        float("CD1_2", cd[0][1]),
        float("CD2_1", cd[1][0]),
        float("CD2_2", cd[1][1]),
        float("IMAGEW", tan.image_size[0]),
        float("IMAGEH", tan.image_size[1]),
        float("EQUINOX", sky.equinox),
        text("RADESYS", sky.ra_dec_sys.as_str()),
    ]
}

/// Linear tangent-plane solution tagged with the session's sky system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SolvedWcs {
    pub tan: TanWcs,
    pub sky: SkySystem,
}

impl SolvedWcs {
    pub fn header_cards(&self) -> HeaderCards {
        linear_cards(&self.tan, self.sky, "")
    }

    /// Field center (RA, Dec) in degrees.
    pub fn center_deg(&self) -> (f64, f64) {
        let (ra, dec) = self.tan.field_center();
        (ra.to_degrees(), dec.to_degrees())
    }

    pub fn pixel_scale_arcsec(&self) -> f64 {
        self.tan.pixel_scale_arcsec()
    }
}

impl SkyProjection for SolvedWcs {
    fn pixel_to_radec(&self, px: f64, py: f64) -> (f64, f64) {
        self.tan.pixel_to_radec(px, py)
    }

    fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        self.tan.radec_to_pixel(ra, dec)
    }

    fn pixel_area(&self) -> f64 {
        self.tan.pixel_area()
    }

    fn handedness(&self) -> Handedness {
        self.tan.handedness()
    }
}

/// SIP-distorted solution tagged with the session's sky system.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DistortedWcs {
    pub sip: SipWcs,
    pub sky: SkySystem,
}

impl DistortedWcs {
    /// Linear cards with `-SIP` axis types followed by the non-zero
    /// forward and inverse coefficients.
    pub fn header_cards(&self) -> HeaderCards {
        let mut cards = linear_cards(&self.sip.tan, self.sky, "-SIP");
        let blocks = [
            ("A", &self.sip.a, self.sip.order()),
            ("B", &self.sip.b, self.sip.order()),
            ("AP", &self.sip.ap, self.sip.inverse_order()),
            ("BP", &self.sip.bp, self.sip.inverse_order()),
        ];
        for (name, coeffs, order) in blocks {
            cards.push(int(&format!("{name}_ORDER"), order as i64));
            for (p, q) in sip_terms(order) {
                let value = coeffs[[p, q]];
                if value != 0.0 {
                    cards.push(float(&format!("{name}_{p}_{q}"), value));
                }
            }
        }
        cards
    }
}

impl SkyProjection for DistortedWcs {
    fn pixel_to_radec(&self, px: f64, py: f64) -> (f64, f64) {
        self.sip.pixel_to_radec(px, py)
    }

    fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        self.sip.radec_to_pixel(ra, dec)
    }

    fn pixel_area(&self) -> f64 {
        self.sip.pixel_area()
    }

    fn handedness(&self) -> Handedness {
        self.sip.handedness()
    }
}

impl<M: MatchingEngine, D: DistortionEngine> SolverSession<M, D> {
    /// The linear solution. After refinement this is the linear part of
    /// the distortion fit.
    pub fn get_wcs(&self) -> Result<SolvedWcs, SolverError> {
        let result = self.ensure_solved()?;
        Ok(SolvedWcs {
            tan: result.wcs.clone(),
            sky: self.sky,
        })
    }

    /// A SIP solution of the given order, refining now unless a fit of
    /// that order already exists.
    pub fn get_distorted_wcs(&mut self, order: usize) -> Result<DistortedWcs, SolverError> {
        let sip = self.ensure_distortion(order)?.clone();
        Ok(DistortedWcs { sip, sky: self.sky })
    }

    /// Solved plate scale, arcseconds per pixel.
    pub fn solved_image_scale(&self) -> Result<f64, SolverError> {
        Ok(self.ensure_solved()?.wcs.pixel_scale_arcsec())
    }

    /// Fit distortion of `order` against the full field and fold the
    /// rescored match into the stored result. Repeated calls with the same
    /// order reuse the existing fit.
    pub fn ensure_distortion(&mut self, order: usize) -> Result<&SipWcs, SolverError> {
        if order > MAX_SIP_ORDER {
            return Err(SolverError::InvalidSipOrder {
                order,
                max: MAX_SIP_ORDER,
            });
        }
        if self.state != SolveState::Solved {
            return Err(SolverError::NotSolved);
        }
        let result = self.result.as_ref().ok_or(SolverError::NotSolved)?;
        let cached = result.distortion.as_ref().is_some_and(|sip| sip.order() == order);

        if !cached {
            let slot = result.index_slot;
            self.catalog.ensure_loaded(slot)?;
            let result = self.result.as_ref().ok_or(SolverError::NotSolved)?;
            let field = self.field.as_ref().ok_or(SolverError::FieldNotSet)?;
            let index = self
                .catalog
                .get(slot)
                .ok_or_else(|| RefineError::IndexNotLoaded(result.index_name.clone()))?;

            let jitter = (result.wcs.pixel_scale_arcsec() * self.config.field_jitter_pix)
                .hypot(index.meta.jitter_arcsec);
            log::debug!(
                "fitting order {order} distortion to {} sources, jitter {jitter:.2} arcsec",
                field.len()
            );
            let refinement = self.refiner.refine(&RefineRequest {
                wcs: &result.wcs,
                field: field.stars(),
                index,
                jitter_arcsec: jitter,
                order,
                inverse_order: order,
                iterations: self.config.refine_iterations,
                weighted: true,
            })?;

            let result = self.result.as_mut().ok_or(SolverError::NotSolved)?;
            result.wcs = refinement.sip.tan.clone();
            result.log_odds = refinement.log_odds;
            result.counts = refinement.counts;
            result.theta = refinement.theta;
            result.match_odds = refinement.match_odds;
            result.refs = refinement.refs;
            result.distortion = Some(refinement.sip);
        }

        self.result
            .as_ref()
            .and_then(|r| r.distortion.as_ref())
            .ok_or(SolverError::NotSolved)
    }
}
