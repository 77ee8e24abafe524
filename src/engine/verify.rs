//! Log-odds verification of candidate solutions.
//!
//! Reference stars inside the image are projected through the candidate
//! and each field star is tested against its nearest projection. A match
//! scores the odds of a Gaussian foreground over a uniform background;
//! a miss scores the distractor prior.

use std::f64::consts::PI;

use serde::{Deserialize, Serialize};

use crate::field::FieldStar;
use crate::geom::sphere::{angular_distance, radec_to_xyz};
use crate::geom::SkyProjection;
use crate::index::IndexData;
use crate::kdtree::KdTree;

#[derive(Debug, Clone, PartialEq)]
pub struct VerifyConfig {
    /// Largest pixel distance between a field star and its reference.
    pub match_radius_pix: f64,
    /// Prior probability that a field star has no catalog counterpart.
    pub distractor_fraction: f64,
    /// Scoring stops once the running total falls to this.
    pub log_odds_bail: f64,
}

impl Default for VerifyConfig {
    fn default() -> Self {
        VerifyConfig {
            match_radius_pix: 5.0,
            distractor_fraction: 0.25,
            log_odds_bail: -20.0,
        }
    }
}

/// A reference star projected into a solved image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ReferenceStar {
    /// Position within the index's star list.
    pub star: usize,
    pub catalog_id: u64,
    /// Radians.
    pub ra: f64,
    pub dec: f64,
}

/// Outcome of scoring a field against a candidate.
#[derive(Debug, Clone, PartialEq)]
pub struct Verification {
    pub log_odds: f64,
    pub n_matched: usize,
    pub n_conflict: usize,
    pub n_distractor: usize,
    /// Per field star, the position in `refs` it matched.
    pub theta: Vec<Option<usize>>,
    /// Per field star log-odds contribution; zero for excluded stars.
    pub match_odds: Vec<f64>,
    pub refs: Vec<ReferenceStar>,
}

/// Reference stars that land inside the image (plus `margin` pixels), with
/// their projected positions.
pub fn references_in_view<P: SkyProjection>(
    projection: &P,
    image_size: (f64, f64),
    data: &IndexData,
    margin: f64,
) -> Vec<(ReferenceStar, (f64, f64))> {
    let (w, h) = image_size;
    let (cra, cdec) = projection.pixel_to_radec(w / 2.0, h / 2.0);
    let center = radec_to_xyz(cra, cdec);
    let radius = [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
        .into_iter()
        .map(|(x, y)| {
            let (ra, dec) = projection.pixel_to_radec(x, y);
            angular_distance(center, radec_to_xyz(ra, dec))
        })
        .fold(0.0, f64::max);

    data.stars_within(center, radius * 1.05)
        .into_iter()
        .filter_map(|star| {
            let s = &data.stars[star];
            let (px, py) = projection.radec_to_pixel(s.ra, s.dec)?;
            let inside = px >= -margin && px <= w + margin && py >= -margin && py <= h + margin;
            inside.then_some((
                ReferenceStar {
                    star,
                    catalog_id: s.catalog_id,
                    ra: s.ra,
                    dec: s.dec,
                },
                (px, py),
            ))
        })
        .collect()
}

/// Score `field` against the references a candidate projects into the image.
///
/// Field stars listed in `exclude` (the quad that proposed the candidate)
/// carry no evidence and are skipped. Each reference can be claimed once;
/// a second claimant is a conflict and scores as a distractor.
pub fn verify<P: SkyProjection>(
    projection: &P,
    image_size: (f64, f64),
    field: &[FieldStar],
    data: &IndexData,
    exclude: &[usize],
    config: &VerifyConfig,
) -> Verification {
    let in_view = references_in_view(projection, image_size, data, config.match_radius_pix);
    let (refs, pixels): (Vec<ReferenceStar>, Vec<[f64; 2]>) = in_view
        .into_iter()
        .map(|(r, (x, y))| (r, [x, y]))
        .unzip();
    let tree = KdTree::<2>::from_points(pixels);

    let area = (image_size.0 * image_size.1).max(1.0);
    let sigma_sq = config.match_radius_pix * config.match_radius_pix / 4.0;
    let radius_sq = config.match_radius_pix * config.match_radius_pix;
    let d = config.distractor_fraction;
    let miss = d.ln();

    let mut result = Verification {
        log_odds: 0.0,
        n_matched: 0,
        n_conflict: 0,
        n_distractor: 0,
        theta: vec![None; field.len()],
        match_odds: vec![0.0; field.len()],
        refs,
    };
    let mut claimed = vec![false; result.refs.len()];

    for (i, star) in field.iter().enumerate() {
        if exclude.contains(&i) {
            continue;
        }
        let odds = match tree.nearest(&[star.x, star.y]) {
            Some(hit) if hit.dist_sq <= radius_sq && !claimed[hit.index] => {
                claimed[hit.index] = true;
                result.theta[i] = Some(hit.index);
                result.n_matched += 1;
                let fg = (-hit.dist_sq / (2.0 * sigma_sq)).exp() / (2.0 * PI * sigma_sq);
                (d + (1.0 - d) * fg * area).ln()
            }
            Some(hit) if hit.dist_sq <= radius_sq => {
                result.n_conflict += 1;
                miss
            }
            _ => {
                result.n_distractor += 1;
                miss
            }
        };
        result.match_odds[i] = odds;
        result.log_odds += odds;
        if result.log_odds <= config.log_odds_bail {
            log::trace!("verification bailed at field star {i}");
            break;
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::tan::tests::make_test_wcs;
    use crate::geom::TanWcs;
    use crate::index::IndexStar;
    use std::collections::BTreeMap;

    fn grid() -> Vec<(f64, f64)> {
        (0..20)
            .map(|i| (100.0 + (i % 5) as f64 * 200.0, 100.0 + (i / 5) as f64 * 200.0))
            .collect()
    }

    fn index_for(wcs: &TanWcs, pixels: &[(f64, f64)]) -> IndexData {
        let stars = pixels
            .iter()
            .enumerate()
            .map(|(i, &(x, y))| {
                let (ra, dec) = wcs.pixel_to_radec(x, y);
                IndexStar {
                    catalog_id: 1000 + i as u64,
                    ra,
                    dec,
                }
            })
            .collect();
        IndexData::new(stars, Vec::new(), Vec::new(), BTreeMap::new())
    }

    fn field_at(pixels: &[(f64, f64)]) -> Vec<FieldStar> {
        pixels.iter().map(|&(x, y)| FieldStar::new(x, y, 100.0)).collect()
    }

    #[test]
    fn perfect_match_scores_every_star() {
        let wcs = make_test_wcs([PI, 0.25], 1.0, 0.0, (1024.0, 1024.0), false);
        let pixels = grid();
        let data = index_for(&wcs, &pixels);
        let result = verify(
            &wcs,
            (1024.0, 1024.0),
            &field_at(&pixels),
            &data,
            &[],
            &VerifyConfig::default(),
        );
        assert_eq!(result.n_matched, 20);
        assert_eq!(result.n_distractor, 0);
        assert!(result.log_odds > 100.0);
        for (i, theta) in result.theta.iter().enumerate() {
            let r = &result.refs[theta.unwrap()];
            assert_eq!(r.catalog_id, 1000 + i as u64);
        }
    }

    #[test]
    fn excluded_stars_carry_no_evidence() {
        let wcs = make_test_wcs([PI, 0.25], 1.0, 0.0, (1024.0, 1024.0), false);
        let pixels = grid();
        let data = index_for(&wcs, &pixels);
        let config = VerifyConfig::default();
        let all = verify(&wcs, (1024.0, 1024.0), &field_at(&pixels), &data, &[], &config);
        let some = verify(&wcs, (1024.0, 1024.0), &field_at(&pixels), &data, &[0, 1, 2, 3], &config);
        assert_eq!(some.n_matched, 16);
        assert_eq!(some.theta[0], None);
        assert_eq!(some.match_odds[2], 0.0);
        assert!(some.log_odds < all.log_odds);
    }

    #[test]
    fn wrong_position_bails_negative() {
        let wcs = make_test_wcs([PI, 0.25], 1.0, 0.0, (1024.0, 1024.0), false);
        let pixels = grid();
        let data = index_for(&wcs, &pixels);
        let wrong = TanWcs {
            crval: [0.5, -0.5],
            ..wcs.clone()
        };
        let result = verify(
            &wrong,
            (1024.0, 1024.0),
            &field_at(&pixels),
            &data,
            &[],
            &VerifyConfig::default(),
        );
        assert!(result.refs.is_empty());
        assert_eq!(result.n_matched, 0);
        assert!(result.log_odds < 0.0);
    }

    #[test]
    fn second_claimant_is_a_conflict() {
        let wcs = make_test_wcs([1.0, 0.5], 1.0, 0.0, (512.0, 512.0), false);
        let data = index_for(&wcs, &[(200.0, 200.0)]);
        let field = field_at(&[(200.0, 200.0), (201.0, 200.5)]);
        let result = verify(&wcs, (512.0, 512.0), &field, &data, &[], &VerifyConfig::default());
        assert_eq!(result.n_matched, 1);
        assert_eq!(result.n_conflict, 1);
        assert_eq!(result.theta, vec![Some(0), None]);
        assert!(result.match_odds[1] < 0.0);
    }
}
