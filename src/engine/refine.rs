//! Iterative SIP distortion fitting.
//!
//! Each iteration pairs reference stars with field stars through the
//! current model, refits the linear part on distortion-corrected
//! positions with the reference pixel held fixed, then fits the forward
//! and inverse polynomials against the new linear solution.

use ndarray::{Array1, Array2};

use crate::field::FieldStar;
use crate::geom::sip::{eval_polynomial, sip_terms, MAX_SIP_ORDER};
use crate::geom::{SipWcs, TanWcs};
use crate::index::IndexData;
use crate::kdtree::KdTree;

use super::fitting::{fit_tan_about, weighted_least_squares, FitError};
use super::verify::{references_in_view, verify, VerifyConfig};
use super::{DistortionEngine, MatchCounts, RefineError, RefineRequest, Refinement};

#[derive(Debug, Clone, PartialEq)]
pub struct SipRefinerConfig {
    /// Pairing radius in units of the positional noise.
    pub sigmas: f64,
    /// Pairing radius floor, pixels.
    pub min_match_radius_pix: f64,
}

impl Default for SipRefinerConfig {
    fn default() -> Self {
        SipRefinerConfig {
            sigmas: 3.0,
            min_match_radius_pix: 5.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct SipRefiner {
    config: SipRefinerConfig,
}

impl SipRefiner {
    pub fn new(config: SipRefinerConfig) -> Self {
        SipRefiner { config }
    }
}

/// A reference star paired with its nearest field star.
struct Pair {
    star: usize,
    field: usize,
    dist_sq: f64,
}

/// Pair references with field stars; a field star keeps only its closest
/// reference.
fn pair_up(
    sip: &SipWcs,
    image_size: (f64, f64),
    data: &IndexData,
    field_tree: &KdTree<2>,
    radius: f64,
) -> Vec<Pair> {
    let mut best: Vec<Option<Pair>> = Vec::new();
    best.resize_with(field_tree.len(), || None);
    for (reference, (px, py)) in references_in_view(sip, image_size, data, radius) {
        let Some(hit) = field_tree.nearest(&[px, py]) else {
            continue;
        };
        if hit.dist_sq > radius * radius {
            continue;
        }
        let slot = &mut best[hit.index];
        if slot.as_ref().map_or(true, |p| hit.dist_sq < p.dist_sq) {
            *slot = Some(Pair {
                star: reference.star,
                field: hit.index,
                dist_sq: hit.dist_sq,
            });
        }
    }
    best.into_iter().flatten().collect()
}

fn vandermonde(offsets: &[(f64, f64)], terms: &[(usize, usize)]) -> Array2<f64> {
    Array2::from_shape_fn((offsets.len(), terms.len()), |(i, j)| {
        let (u, v) = offsets[i];
        let (p, q) = terms[j];
        u.powi(p as i32) * v.powi(q as i32)
    })
}

fn unpack(coeffs: &Array1<f64>, terms: &[(usize, usize)], order: usize) -> Array2<f64> {
    let mut out = Array2::zeros((order + 1, order + 1));
    for (&c, &(p, q)) in coeffs.iter().zip(terms) {
        out[[p, q]] = c;
    }
    out
}

/// Fit `target ≈ Σ c_pq u^p v^q` for each axis.
fn fit_polynomials(
    offsets: &[(f64, f64)],
    targets: &[(f64, f64)],
    weights: &Array1<f64>,
    order: usize,
) -> Result<(Array2<f64>, Array2<f64>), FitError> {
    let terms = sip_terms(order);
    if terms.is_empty() {
        let zero = Array2::zeros((order + 1, order + 1));
        return Ok((zero.clone(), zero));
    }
    let design = vandermonde(offsets, &terms);
    let tx: Array1<f64> = targets.iter().map(|t| t.0).collect();
    let ty: Array1<f64> = targets.iter().map(|t| t.1).collect();
    let cx = weighted_least_squares(&design, &tx, weights)?;
    let cy = weighted_least_squares(&design, &ty, weights)?;
    Ok((unpack(&cx, &terms, order), unpack(&cy, &terms, order)))
}

impl DistortionEngine for SipRefiner {
    fn refine(&self, request: &RefineRequest<'_>) -> Result<Refinement, RefineError> {
        let order = request.order.max(request.inverse_order);
        if order > MAX_SIP_ORDER {
            return Err(RefineError::UnsupportedOrder {
                order,
                max: MAX_SIP_ORDER,
            });
        }
        let index = request.index;
        let data = index
            .data()
            .ok_or_else(|| RefineError::IndexNotLoaded(index.meta.name.clone()))?;
        let wcs = request.wcs;
        let image_size = (wcs.image_size[0], wcs.image_size[1]);
        let crpix = wcs.crpix;

        let sigma = (request.jitter_arcsec / wcs.pixel_scale_arcsec()).max(1e-3);
        let radius = (self.config.sigmas * sigma).max(self.config.min_match_radius_pix);
        let n_terms = sip_terms(request.order)
            .len()
            .max(sip_terms(request.inverse_order).len());
        let required = (n_terms + 3).max(3);

        let field_tree =
            KdTree::<2>::from_points(request.field.iter().map(|s| [s.x, s.y]).collect());
        let mut sip = SipWcs::from_tan(wcs.clone(), request.order, request.inverse_order);

        for iteration in 0..request.iterations.max(1) {
            let pairs = pair_up(&sip, image_size, data, &field_tree, radius);
            if pairs.len() < required {
                if iteration == 0 {
                    return Err(RefineError::TooFewMatches {
                        found: pairs.len(),
                        required,
                    });
                }
                log::debug!(
                    "stopping SIP iterations at {iteration}: {} pairs",
                    pairs.len()
                );
                break;
            }

            let xyz: Vec<[f64; 3]> = pairs.iter().map(|p| data.stars[p.star].xyz()).collect();
            let field_xy: Vec<(f64, f64)> = pairs
                .iter()
                .map(|p| {
                    let FieldStar { x, y, .. } = request.field[p.field];
                    (x, y)
                })
                .collect();
            let weights: Array1<f64> = pairs
                .iter()
                .map(|p| {
                    if request.weighted {
                        (-p.dist_sq / (2.0 * sigma * sigma)).exp()
                    } else {
                        1.0
                    }
                })
                .collect();

            let offsets: Vec<(f64, f64)> = field_xy
                .iter()
                .map(|&(x, y)| (x - crpix[0], y - crpix[1]))
                .collect();
            let corrected: Vec<(f64, f64)> = offsets
                .iter()
                .map(|&(u, v)| {
                    (
                        crpix[0] + u + eval_polynomial(&sip.a, u, v),
                        crpix[1] + v + eval_polynomial(&sip.b, u, v),
                    )
                })
                .collect();
            let fitted = fit_tan_about(
                &xyz,
                &corrected,
                weights.as_slice(),
                sip.tan.reference_xyz(),
                crpix,
                image_size,
            )?;
            let (ra, dec) = fitted.pixel_to_radec(crpix[0], crpix[1]);
            let tan = TanWcs {
                crval: [ra, dec],
                crpix,
                ..fitted
            };

            let ideal: Vec<(f64, f64)> = xyz
                .iter()
                .map(|&p| tan.xyz_to_pixel(p))
                .collect::<Option<_>>()
                .ok_or(FitError::ProjectionFailed)?;

            let forward_targets: Vec<(f64, f64)> = ideal
                .iter()
                .zip(&field_xy)
                .map(|(t, f)| (t.0 - f.0, t.1 - f.1))
                .collect();
            let (a, b) = fit_polynomials(&offsets, &forward_targets, &weights, request.order)?;

            let ideal_offsets: Vec<(f64, f64)> = ideal
                .iter()
                .map(|t| (t.0 - crpix[0], t.1 - crpix[1]))
                .collect();
            let inverse_targets: Vec<(f64, f64)> = forward_targets.iter().map(|d| (-d.0, -d.1)).collect();
            let (ap, bp) = fit_polynomials(
                &ideal_offsets,
                &inverse_targets,
                &weights,
                request.inverse_order,
            )?;

            sip = SipWcs { tan, a, b, ap, bp };
        }

        let config = VerifyConfig {
            match_radius_pix: radius,
            ..VerifyConfig::default()
        };
        let verification = verify(&sip, image_size, request.field, data, &[], &config);
        log::debug!(
            "SIP order {} fit: log-odds {:.1}, {} matched",
            request.order,
            verification.log_odds,
            verification.n_matched
        );
        Ok(Refinement {
            sip,
            log_odds: verification.log_odds,
            counts: MatchCounts {
                matched: verification.n_matched,
                conflict: verification.n_conflict,
                distractor: verification.n_distractor,
            },
            theta: verification.theta,
            match_odds: verification.match_odds,
            refs: verification.refs,
        })
    }
}
