//! Blind quad matching.
//!
//! Field quads are enumerated brightest-first with the incremental
//! new-star scheme: when star `n` joins, only quads containing it are
//! built, either on the backbone or as a non-backbone star. Each code is
//! looked up in every index, fitted, filtered and verified.

use crate::field::FieldStar;
use crate::geom::sphere::{arcsec_to_rad, radec_to_xyz};
use crate::geom::{Handedness, TanWcs};

use super::fitting::fit_tan_wcs;
use super::quads::{field_codes, DIMQUADS};
use super::verify::{verify, VerifyConfig};
use super::{MatchCounts, MatchRequest, MatchResult, MatchingEngine, QuadMatch};

#[derive(Debug, Clone, PartialEq)]
pub struct QuadMatcherConfig {
    /// Squared code-space distance accepted as a match.
    pub code_tolerance: f64,
    /// Field stars considered for quads, brightest first.
    pub max_quad_stars: usize,
    /// Largest pixel residual of a quad star under its own fit.
    pub quad_residual_pix: f64,
    pub verify: VerifyConfig,
}

impl Default for QuadMatcherConfig {
    fn default() -> Self {
        QuadMatcherConfig {
            code_tolerance: 0.01,
            max_quad_stars: 50,
            quad_residual_pix: 10.0,
            verify: VerifyConfig::default(),
        }
    }
}

/// Geometric-hash matching engine.
#[derive(Debug, Clone, Default)]
pub struct QuadMatcher {
    config: QuadMatcherConfig,
}

impl QuadMatcher {
    pub fn new(config: QuadMatcherConfig) -> Self {
        QuadMatcher { config }
    }

    pub fn config(&self) -> &QuadMatcherConfig {
        &self.config
    }
}

/// State of one matching attempt.
struct Search<'r, 'a> {
    request: &'r MatchRequest<'a>,
    config: &'r QuadMatcherConfig,
    stars: &'r [FieldStar],
    /// Plate scale bounds, radians per pixel.
    scale_rad: (f64, f64),
    n_verified: usize,
    best_rejected: Option<f64>,
}

impl Search<'_, '_> {
    /// Whether a backbone of `dist` pixels can be matched by some index.
    fn backbone_ok(&self, dist: f64) -> bool {
        let (lo, hi) = self.request.quad_size_range_pix;
        if dist < lo || dist > hi || dist < 1e-10 {
            return false;
        }
        let ang_lo = dist * self.scale_rad.0;
        let ang_hi = dist * self.scale_rad.1;
        self.request
            .indexes
            .iter()
            .any(|index| ang_lo <= index.meta.scale_upper && ang_hi >= index.meta.scale_lower)
    }

    fn backbone(&self, a: usize, b: usize) -> Option<(f64, f64, f64)> {
        let (sa, sb) = (&self.stars[a], &self.stars[b]);
        let dist_sq = (sb.x - sa.x).powi(2) + (sb.y - sa.y).powi(2);
        self.backbone_ok(dist_sq.sqrt())
            .then_some(((sa.x + sb.x) / 2.0, (sa.y + sb.y) / 2.0, dist_sq))
    }

    /// C and D must lie within one backbone length of its midpoint.
    fn inside(&self, i: usize, (mx, my, dist_sq): (f64, f64, f64)) -> bool {
        let s = &self.stars[i];
        (s.x - mx).powi(2) + (s.y - my).powi(2) <= dist_sq
    }

    fn run(&mut self) -> Option<MatchResult> {
        for n in 2..self.stars.len() {
            // Star n on the backbone.
            for a in 0..n {
                let Some(circle) = self.backbone(a, n) else {
                    continue;
                };
                let candidates: Vec<usize> = (0..n)
                    .filter(|&i| i != a && self.inside(i, circle))
                    .collect();
                for (ci, &c) in candidates.iter().enumerate() {
                    for &d in &candidates[ci + 1..] {
                        if let Some(found) = self.try_quad([a, n, c, d]) {
                            return Some(found);
                        }
                    }
                }
            }

            // Star n off the backbone.
            for a in 0..n {
                for b in (a + 1)..n {
                    let Some(circle) = self.backbone(a, b) else {
                        continue;
                    };
                    if !self.inside(n, circle) {
                        continue;
                    }
                    for d in 0..n {
                        if d == a || d == b || !self.inside(d, circle) {
                            continue;
                        }
                        if let Some(found) = self.try_quad([a, b, n, d]) {
                            return Some(found);
                        }
                    }
                }
            }
        }
        None
    }

    fn try_quad(&mut self, members: [usize; DIMQUADS]) -> Option<MatchResult> {
        let request = self.request;
        let positions: [(f64, f64); DIMQUADS] =
            std::array::from_fn(|i| (self.stars[members[i]].x, self.stars[members[i]].y));

        for (code, order) in field_codes(&positions) {
            let field_indices: [usize; DIMQUADS] = std::array::from_fn(|i| members[order[i]]);
            let field_xy: [(f64, f64); DIMQUADS] = std::array::from_fn(|i| positions[order[i]]);

            for (slot, index) in request.indexes.iter().enumerate() {
                let Some(data) = index.data() else {
                    continue;
                };
                for hit in data.code_tree.range_search(&code, self.config.code_tolerance) {
                    let quad = data.quads[hit.index];
                    let star_xyz: [[f64; 3]; DIMQUADS] =
                        std::array::from_fn(|i| data.stars[quad.star_ids[i]].xyz());
                    let Some(wcs) = self.candidate(&star_xyz, &field_xy) else {
                        continue;
                    };

                    let verification = verify(
                        &wcs,
                        request.image_size,
                        request.field,
                        data,
                        &field_indices,
                        &self.config.verify,
                    );
                    self.n_verified += 1;
                    if verification.log_odds >= request.log_odds_accept {
                        log::info!(
                            "quad match in index {} after {} verifications: log-odds {:.1}, {} matched",
                            index.meta.name,
                            self.n_verified,
                            verification.log_odds,
                            verification.n_matched
                        );
                        return Some(MatchResult {
                            index_slot: slot,
                            index_name: index.meta.name.clone(),
                            index_key: index.meta.key(),
                            wcs,
                            log_odds: verification.log_odds,
                            counts: MatchCounts {
                                matched: verification.n_matched,
                                conflict: verification.n_conflict,
                                distractor: verification.n_distractor,
                            },
                            theta: verification.theta,
                            match_odds: verification.match_odds,
                            refs: verification.refs,
                            quad: QuadMatch {
                                field_indices,
                                index_indices: quad.star_ids,
                            },
                            distortion: None,
                        });
                    }
                    let best = self.best_rejected.get_or_insert(verification.log_odds);
                    *best = best.max(verification.log_odds);
                }
            }
        }
        None
    }

    /// Fit a quad and apply the cheap filters ahead of verification.
    fn candidate(
        &self,
        star_xyz: &[[f64; 3]; DIMQUADS],
        field_xy: &[(f64, f64); DIMQUADS],
    ) -> Option<TanWcs> {
        let wcs = fit_tan_wcs(star_xyz, field_xy, self.request.image_size).ok()?;

        let (lo, hi) = self.request.scale_range_arcsec;
        let scale = wcs.pixel_scale_arcsec();
        if scale < lo || scale > hi {
            return None;
        }
        if !self
            .request
            .parity
            .accepts(Handedness::from_determinant(wcs.determinant()))
        {
            return None;
        }

        let limit_sq = self.config.quad_residual_pix.powi(2);
        let fits = star_xyz.iter().zip(field_xy).all(|(&xyz, &(fx, fy))| {
            wcs.xyz_to_pixel(xyz)
                .is_some_and(|(px, py)| (px - fx).powi(2) + (py - fy).powi(2) < limit_sq)
        });
        if !fits {
            return None;
        }

        if let Some(disc) = &self.request.position {
            let (ra, dec) = wcs.field_center();
            if !disc.contains(radec_to_xyz(ra, dec)) {
                return None;
            }
        }
        Some(wcs)
    }
}

impl MatchingEngine for QuadMatcher {
    fn run(&self, request: &MatchRequest<'_>) -> Option<MatchResult> {
        let n_stars = request.field.len().min(self.config.max_quad_stars);
        if n_stars < DIMQUADS || request.indexes.is_empty() {
            return None;
        }
        let (lo, hi) = request.scale_range_arcsec;
        let mut search = Search {
            request,
            config: &self.config,
            stars: &request.field[..n_stars],
            scale_rad: (arcsec_to_rad(lo), arcsec_to_rad(hi)),
            n_verified: 0,
            best_rejected: None,
        };
        let found = search.run();
        if found.is_none() {
            log::debug!(
                "no quad match after {} verifications; best rejected log-odds {:?}",
                search.n_verified,
                search.best_rejected
            );
        }
        found
    }
}
