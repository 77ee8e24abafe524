//! Geometric hashing of four-star patterns.
//!
//! Stars A and B span a frame in which A sits at (0, 0) and B at (1, 1);
//! the code is the position of C and D in that frame. Canonical codes are
//! invariant to rotation, scale and relabelling of the stars.

use crate::geom::sphere::{star_coords, star_midpoint};

/// Stars in a quad.
pub const DIMQUADS: usize = 4;

/// Code dimensions: two per non-backbone star.
pub const DIMCODES: usize = 2 * (DIMQUADS - 2);

pub type Code = [f64; DIMCODES];

/// Four star positions within an index, in canonical order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quad {
    pub star_ids: [usize; DIMQUADS],
}

/// Code of four planar points, backbone first.
fn planar_code(points: &[(f64, f64); DIMQUADS]) -> Option<Code> {
    let (a_x, a_y) = points[0];
    let (b_x, b_y) = points[1];
    let ab_x = b_x - a_x;
    let ab_y = b_y - a_y;
    let scale = ab_x * ab_x + ab_y * ab_y;
    if scale <= 0.0 || !scale.is_finite() {
        return None;
    }
    let costheta = (ab_y + ab_x) / scale;
    let sintheta = (ab_y - ab_x) / scale;

    let mut code = [0.0; DIMCODES];
    for (i, &(d_x, d_y)) in points.iter().enumerate().skip(2) {
        let ad_x = d_x - a_x;
        let ad_y = d_y - a_y;
        code[2 * (i - 2)] = ad_x * costheta + ad_y * sintheta;
        code[2 * (i - 2) + 1] = -ad_x * sintheta + ad_y * costheta;
    }
    Some(code)
}

/// Code of four sky positions, projected about the backbone midpoint.
///
/// The tangent-plane axes are swapped before hashing, which is the
/// convention field codes are matched against. `None` for degenerate
/// backbones.
pub fn compute_code(star_xyz: &[[f64; 3]; DIMQUADS]) -> Option<Code> {
    let mid = star_midpoint(star_xyz[0], star_xyz[1]);
    let mut points = [(0.0, 0.0); DIMQUADS];
    for (point, &xyz) in points.iter_mut().zip(star_xyz) {
        let (x, y) = star_coords(xyz, mid)?;
        *point = (y, x);
    }
    planar_code(&points)
}

/// Put a code into canonical form.
///
/// The mean x of C and D is brought to at most 0.5 by swapping A and B,
/// then the non-backbone stars are ordered by x. Returns the canonical
/// code, the reordered ids and whether the backbone was swapped.
pub fn enforce_invariants(
    mut code: Code,
    mut ids: [usize; DIMQUADS],
) -> (Code, [usize; DIMQUADS], bool) {
    let n_extra = DIMQUADS - 2;
    let mean_x = (0..n_extra).map(|i| code[2 * i]).sum::<f64>() / n_extra as f64;

    let swapped = mean_x > 0.5;
    if swapped {
        ids.swap(0, 1);
        for v in &mut code {
            *v = 1.0 - *v;
        }
    }

    for i in 0..n_extra {
        let smallest = (i..n_extra)
            .min_by(|&p, &q| code[2 * p].total_cmp(&code[2 * q]))
            .unwrap_or(i);
        if smallest != i && code[2 * smallest] < code[2 * i] {
            ids.swap(i + 2, smallest + 2);
            code.swap(2 * i, 2 * smallest);
            code.swap(2 * i + 1, 2 * smallest + 1);
        }
    }

    (code, ids, swapped)
}

pub fn compute_canonical_code(
    star_xyz: &[[f64; 3]; DIMQUADS],
    star_ids: [usize; DIMQUADS],
) -> Option<(Code, [usize; DIMQUADS], bool)> {
    compute_code(star_xyz).map(|code| enforce_invariants(code, star_ids))
}

/// Canonical codes of a pixel quad in both handedness variants.
///
/// The second variant swaps the pixel axes, which mirrors the pattern; one
/// of the two matches the index code whatever the image parity. The ids
/// returned are positions within `positions`.
pub fn field_codes(positions: &[(f64, f64); DIMQUADS]) -> Vec<(Code, [usize; DIMQUADS])> {
    let swapped: [(f64, f64); DIMQUADS] = std::array::from_fn(|i| (positions[i].1, positions[i].0));
    [*positions, swapped]
        .iter()
        .filter_map(planar_code)
        .map(|code| {
            let (code, ids, _) = enforce_invariants(code, [0, 1, 2, 3]);
            (code, ids)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::sphere::radec_to_xyz;
    use crate::geom::tan::tests::make_test_wcs;
    use std::f64::consts::PI;

    const CODE_EPS: f64 = 1e-10;

    fn assert_code_close(a: &Code, b: &Code, tol: f64) {
        for i in 0..DIMCODES {
            assert!(
                (a[i] - b[i]).abs() <= tol,
                "code[{i}]: {} vs {} (diff = {})",
                a[i],
                b[i],
                (a[i] - b[i]).abs()
            );
        }
    }

    fn rot_z(theta: f64, v: [f64; 3]) -> [f64; 3] {
        let (s, c) = theta.sin_cos();
        [c * v[0] - s * v[1], s * v[0] + c * v[1], v[2]]
    }

    fn rot_x(theta: f64, v: [f64; 3]) -> [f64; 3] {
        let (s, c) = theta.sin_cos();
        [v[0], c * v[1] - s * v[2], s * v[1] + c * v[2]]
    }

    fn test_stars() -> [[f64; 3]; DIMQUADS] {
        [
            radec_to_xyz(0.10, 0.20),
            radec_to_xyz(0.12, 0.21),
            radec_to_xyz(0.11, 0.205),
            radec_to_xyz(0.105, 0.195),
        ]
    }

    fn canonical(stars: &[[f64; 3]; DIMQUADS], ids: [usize; DIMQUADS]) -> Code {
        compute_canonical_code(stars, ids).unwrap().0
    }

    #[test]
    fn rotation_invariance() {
        let stars = test_stars();
        let base = canonical(&stars, [0, 1, 2, 3]);
        for angle in [0.1, 0.5, 1.0, 2.0, 3.0, 5.0] {
            let rotated: [[f64; 3]; DIMQUADS] =
                std::array::from_fn(|i| rot_z(angle, rot_x(angle * 0.7, stars[i])));
            assert_code_close(&base, &canonical(&rotated, [0, 1, 2, 3]), CODE_EPS);
        }
    }

    #[test]
    fn scale_invariance_small_angles() {
        let quad = |scale: f64| {
            [
                radec_to_xyz(1.0 - scale, 0.5),
                radec_to_xyz(1.0 + scale, 0.5),
                radec_to_xyz(1.0 + scale * 0.3, 0.5 + scale * 0.7),
                radec_to_xyz(1.0 - scale * 0.2, 0.5 - scale * 0.5),
            ]
        };
        let a = canonical(&quad(1e-4), [0, 1, 2, 3]);
        let b = canonical(&quad(2e-4), [0, 1, 2, 3]);
        assert_code_close(&a, &b, 1e-4);
    }

    #[test]
    fn relabelling_gives_same_canonical_code() {
        let s = test_stars();
        let base = canonical(&s, [0, 1, 2, 3]);
        let ab = canonical(&[s[1], s[0], s[2], s[3]], [1, 0, 2, 3]);
        let cd = canonical(&[s[0], s[1], s[3], s[2]], [0, 1, 3, 2]);
        let both = canonical(&[s[1], s[0], s[3], s[2]], [1, 0, 3, 2]);
        assert_code_close(&base, &ab, CODE_EPS);
        assert_code_close(&base, &cd, CODE_EPS);
        assert_code_close(&base, &both, CODE_EPS);
    }

    #[test]
    fn invariants_hold_and_are_idempotent() {
        let code = compute_code(&test_stars()).unwrap();
        let (c1, ids1, _) = enforce_invariants(code, [0, 1, 2, 3]);
        assert!(c1[0] <= c1[2]);
        assert!((c1[0] + c1[2]) / 2.0 <= 0.5 + 1e-15);
        let (c2, ids2, swapped) = enforce_invariants(c1, ids1);
        assert_code_close(&c1, &c2, 0.0);
        assert_eq!(ids1, ids2);
        assert!(!swapped);
    }

    #[test]
    fn backbone_swap_and_reorder() {
        let (code, ids, swapped) = enforce_invariants([0.9, 0.1, 0.8, 0.2], [10, 20, 30, 40]);
        assert!(swapped);
        assert_eq!(&ids[..2], &[20, 10]);
        assert!(code[0] <= code[2]);
        assert_eq!(&ids[2..], &[30, 40]);

        let (_, ids, swapped) = enforce_invariants([0.4, 0.3, 0.2, 0.7], [10, 20, 30, 40]);
        assert!(!swapped);
        assert_eq!(ids, [10, 20, 40, 30]);
    }

    #[test]
    fn coincident_backbone_has_no_code() {
        let a = radec_to_xyz(1.0, 0.5);
        assert!(compute_code(&[a, a, radec_to_xyz(1.01, 0.5), radec_to_xyz(1.0, 0.51)]).is_none());
        assert!(field_codes(&[(1.0, 1.0), (1.0, 1.0), (2.0, 3.0), (4.0, 1.0)]).is_empty());
    }

    #[test]
    fn codes_near_pole_are_finite() {
        let dec = PI / 2.0 - 0.01;
        let stars = [
            radec_to_xyz(0.0, dec),
            radec_to_xyz(0.5, dec),
            radec_to_xyz(0.25, dec + 0.002),
            radec_to_xyz(0.75, dec - 0.002),
        ];
        assert!(compute_code(&stars).unwrap().iter().all(|v| v.is_finite()));
    }

    #[test]
    fn one_field_variant_matches_sky_code_for_either_parity() {
        let pixels = [(100.0, 120.0), (300.0, 260.0), (210.0, 150.0), (180.0, 230.0)];
        for flipped in [false, true] {
            let wcs = make_test_wcs([1.0, 0.5], 2.0, 0.4, (512.0, 512.0), flipped);
            let xyz: [[f64; 3]; DIMQUADS] =
                std::array::from_fn(|i| wcs.pixel_to_xyz(pixels[i].0, pixels[i].1));
            let sky = canonical(&xyz, [0, 1, 2, 3]);
            let best = field_codes(&pixels)
                .iter()
                .map(|(code, _)| {
                    code.iter()
                        .zip(&sky)
                        .map(|(a, b)| (a - b) * (a - b))
                        .sum::<f64>()
                })
                .fold(f64::INFINITY, f64::min);
            assert!(best < 1e-6, "flipped={flipped}: closest field code at {best}");
        }
    }
}
