//! Least-squares fitting of linear TAN solutions.

use ndarray::{Array1, Array2, Axis};
use thiserror::Error;

use crate::geom::sphere::{centroid, star_coords, xyz_to_radec};
use crate::geom::tan::TanWcs;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum FitError {
    #[error("need at least {required} correspondences, got {found}")]
    TooFewCorrespondences { found: usize, required: usize },

    #[error("normal equations are singular")]
    SingularMatrix,

    #[error("a reference star lies behind the tangent plane")]
    ProjectionFailed,
}

/// Weighted linear least squares: minimise `Σ w_i (row_i · x - target_i)²`.
///
/// Columns are rescaled to unit norm before the normal equations are
/// solved, so polynomial terms of very different magnitudes stay well
/// conditioned.
pub(crate) fn weighted_least_squares(
    design: &Array2<f64>,
    target: &Array1<f64>,
    weights: &Array1<f64>,
) -> Result<Array1<f64>, FitError> {
    let n_terms = design.ncols();
    let weighted = design * &weights.view().insert_axis(Axis(1));
    let normal = design.t().dot(&weighted);
    let rhs = weighted.t().dot(target);

    let scale: Array1<f64> = normal.diag().mapv(|d| if d > 0.0 { 1.0 / d.sqrt() } else { 0.0 });
    if scale.iter().any(|&s| s == 0.0) {
        return Err(FitError::SingularMatrix);
    }
    let mut matrix = Array2::from_shape_fn((n_terms, n_terms), |(i, j)| {
        normal[[i, j]] * scale[i] * scale[j]
    });
    let mut b: Array1<f64> = &rhs * &scale;

    // Gaussian elimination with partial pivoting.
    for col in 0..n_terms {
        let pivot = (col..n_terms)
            .max_by(|&p, &q| matrix[[p, col]].abs().total_cmp(&matrix[[q, col]].abs()))
            .unwrap_or(col);
        if matrix[[pivot, col]].abs() < 1e-12 {
            return Err(FitError::SingularMatrix);
        }
        if pivot != col {
            for k in 0..n_terms {
                matrix.swap([col, k], [pivot, k]);
            }
            b.swap(col, pivot);
        }
        for row in (col + 1)..n_terms {
            let factor = matrix[[row, col]] / matrix[[col, col]];
            for k in col..n_terms {
                matrix[[row, k]] -= factor * matrix[[col, k]];
            }
            b[row] -= factor * b[col];
        }
    }

    let mut x = Array1::zeros(n_terms);
    for row in (0..n_terms).rev() {
        let tail: f64 = ((row + 1)..n_terms).map(|k| matrix[[row, k]] * x[k]).sum();
        x[row] = (b[row] - tail) / matrix[[row, row]];
    }
    Ok(x * scale)
}

/// Single linear fit with a fixed tangent point.
///
/// Solves `iwc = CD · (p - crpix) + t` and folds the translation into the
/// reference pixel, so the result maps exactly as fitted.
fn fit_tan_once(
    star_xyz: &[[f64; 3]],
    field_xy: &[(f64, f64)],
    weights: &Array1<f64>,
    tangent: [f64; 3],
    crpix: [f64; 2],
    image_size: (f64, f64),
) -> Result<TanWcs, FitError> {
    let n = star_xyz.len();
    let mut design = Array2::zeros((n, 3));
    let mut xi = Array1::zeros(n);
    let mut eta = Array1::zeros(n);
    for (i, (&xyz, &(px, py))) in star_xyz.iter().zip(field_xy).enumerate() {
        let (x, y) = star_coords(xyz, tangent).ok_or(FitError::ProjectionFailed)?;
        design[[i, 0]] = px - crpix[0];
        design[[i, 1]] = py - crpix[1];
        design[[i, 2]] = 1.0;
        xi[i] = x;
        eta[i] = y;
    }

    let row_x = weighted_least_squares(&design, &xi, weights)?;
    let row_y = weighted_least_squares(&design, &eta, weights)?;
    let cd = [[row_x[0], row_x[1]], [row_y[0], row_y[1]]];
    let det = cd[0][0] * cd[1][1] - cd[0][1] * cd[1][0];
    if det.abs() < f64::MIN_POSITIVE || !det.is_finite() {
        return Err(FitError::SingularMatrix);
    }

    let (tx, ty) = (row_x[2], row_y[2]);
    let du = (cd[1][1] * tx - cd[0][1] * ty) / det;
    let dv = (cd[0][0] * ty - cd[1][0] * tx) / det;
    let (ra, dec) = xyz_to_radec(tangent);
    Ok(TanWcs {
        crval: [ra, dec],
        crpix: [crpix[0] - du, crpix[1] - dv],
        cd,
        image_size: [image_size.0, image_size.1],
    })
}

/// Weighted TAN fit whose result is referenced at `crpix`.
///
/// A first pass projects about `tangent`; the second projects about the
/// sky position the first pass puts at `crpix`.
pub fn fit_tan_about(
    star_xyz: &[[f64; 3]],
    field_xy: &[(f64, f64)],
    weights: Option<&[f64]>,
    tangent: [f64; 3],
    crpix: [f64; 2],
    image_size: (f64, f64),
) -> Result<TanWcs, FitError> {
    let n = star_xyz.len().min(field_xy.len());
    if n < 3 {
        return Err(FitError::TooFewCorrespondences {
            found: n,
            required: 3,
        });
    }
    let (star_xyz, field_xy) = (&star_xyz[..n], &field_xy[..n]);
    let weights = match weights {
        Some(w) => Array1::from_iter(w.iter().copied().take(n)),
        None => Array1::ones(n),
    };
    if weights.len() < n {
        return Err(FitError::TooFewCorrespondences {
            found: weights.len(),
            required: n,
        });
    }

    let first = fit_tan_once(star_xyz, field_xy, &weights, tangent, crpix, image_size)?;
    let anchor = first.pixel_to_xyz(crpix[0], crpix[1]);
    fit_tan_once(star_xyz, field_xy, &weights, anchor, crpix, image_size)
}

/// Fit a TAN WCS to matched sky/pixel positions, referenced at the image
/// center. Requires at least three correspondences.
pub fn fit_tan_wcs(
    star_xyz: &[[f64; 3]],
    field_xy: &[(f64, f64)],
    image_size: (f64, f64),
) -> Result<TanWcs, FitError> {
    let tangent = centroid(star_xyz.iter().copied()).ok_or(FitError::TooFewCorrespondences {
        found: 0,
        required: 3,
    })?;
    let crpix = [image_size.0 / 2.0, image_size.1 / 2.0];
    fit_tan_about(star_xyz, field_xy, None, tangent, crpix, image_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::geom::sphere::radec_to_xyz;
    use crate::geom::tan::tests::make_test_wcs;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::PI;

    fn grid(wcs: &TanWcs, n: usize) -> (Vec<[f64; 3]>, Vec<(f64, f64)>) {
        let [w, h] = wcs.image_size;
        let side = (n as f64).sqrt().ceil() as usize;
        let step = (side as f64 - 1.0).max(1.0);
        (0..n)
            .map(|k| {
                let px = w * 0.1 + w * 0.8 * (k % side) as f64 / step;
                let py = h * 0.1 + h * 0.8 * (k / side) as f64 / step;
                (wcs.pixel_to_xyz(px, py), (px, py))
            })
            .unzip()
    }

    fn assert_same_mapping(fitted: &TanWcs, original: &TanWcs, tol_pix: f64) {
        let [w, h] = original.image_size;
        for (px, py) in [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h), (w / 3.0, h / 2.0)] {
            let (x, y) = fitted.xyz_to_pixel(original.pixel_to_xyz(px, py)).unwrap();
            assert_abs_diff_eq!(x, px, epsilon = tol_pix);
            assert_abs_diff_eq!(y, py, epsilon = tol_pix);
        }
    }

    #[test]
    fn recovers_rotated_solutions_of_both_parities() {
        for flipped in [false, true] {
            let original = make_test_wcs([1.0, 0.5], 1.0, PI / 4.0, (100.0, 100.0), flipped);
            let (xyz, pix) = grid(&original, 16);
            let fitted = fit_tan_wcs(&xyz, &pix, (100.0, 100.0)).unwrap();
            for i in 0..2 {
                for j in 0..2 {
                    assert_abs_diff_eq!(fitted.cd[i][j], original.cd[i][j], epsilon = 1e-12);
                }
            }
            assert_abs_diff_eq!(fitted.crpix[0], 50.0, epsilon = 1e-6);
            assert_eq!(fitted.determinant() > 0.0, flipped);
            assert_same_mapping(&fitted, &original, 1e-6);
        }
    }

    #[test]
    fn quad_sized_fit_is_exact_off_center() {
        // Four stars clustered in one corner: the centroid is far from the
        // image center, which the second pass must absorb.
        let original = make_test_wcs([2.0, -0.3], 2.0, 0.3, (1024.0, 1024.0), false);
        let pix = [(40.0, 60.0), (180.0, 90.0), (120.0, 200.0), (70.0, 150.0)];
        let xyz: Vec<[f64; 3]> = pix.iter().map(|&(x, y)| original.pixel_to_xyz(x, y)).collect();
        let fitted = fit_tan_wcs(&xyz, &pix, (1024.0, 1024.0)).unwrap();
        assert_abs_diff_eq!(fitted.pixel_scale_arcsec(), 2.0, epsilon = 1e-6);
        assert_same_mapping(&fitted, &original, 1e-3);
    }

    #[test]
    fn weights_suppress_outliers() {
        let original = make_test_wcs([0.5, 0.8], 1.5, 0.0, (200.0, 200.0), false);
        let (xyz, mut pix) = grid(&original, 25);
        pix[7].0 += 40.0;
        let mut weights = vec![1.0; 25];
        weights[7] = 0.0;
        let fitted = fit_tan_about(
            &xyz,
            &pix,
            Some(&weights),
            original.reference_xyz(),
            original.crpix,
            (200.0, 200.0),
        )
        .unwrap();
        assert_same_mapping(&fitted, &original, 1e-6);
    }

    #[test]
    fn rejects_degenerate_input() {
        let xyz = radec_to_xyz(0.0, 0.0);
        assert_eq!(
            fit_tan_wcs(&[xyz, xyz], &[(1.0, 1.0), (2.0, 2.0)], (512.0, 512.0)),
            Err(FitError::TooFewCorrespondences { found: 2, required: 3 })
        );
        let collinear: Vec<[f64; 3]> = (0..4).map(|i| radec_to_xyz(0.001 * i as f64, 0.0)).collect();
        let pix: Vec<(f64, f64)> = (0..4).map(|i| (10.0 * i as f64, 0.0)).collect();
        assert_eq!(
            fit_tan_wcs(&collinear, &pix, (512.0, 512.0)),
            Err(FitError::SingularMatrix)
        );
    }

    #[test]
    fn least_squares_handles_badly_scaled_columns() {
        let design = Array2::from_shape_fn((6, 2), |(i, j)| {
            let u = i as f64 + 1.0;
            if j == 0 { u * 1e-2 } else { u * u * 1e3 }
        });
        let truth = [3.0, -0.5];
        let target = Array1::from_shape_fn(6, |i| design[[i, 0]] * truth[0] + design[[i, 1]] * truth[1]);
        let x = weighted_least_squares(&design, &target, &Array1::ones(6)).unwrap();
        assert_abs_diff_eq!(x[0], truth[0], epsilon = 1e-5);
        assert_abs_diff_eq!(x[1], truth[1], epsilon = 1e-9);
    }
}
