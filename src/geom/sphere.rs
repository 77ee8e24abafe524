//! Unit-sphere helpers shared by the index, matcher and catalog queries.
//!
//! Positions are carried as unit vectors; RA/Dec pairs are radians unless a
//! function name says otherwise.

use std::f64::consts::TAU;

/// Arcseconds in one radian.
pub const ARCSEC_PER_RAD: f64 = 180.0 * 3600.0 / std::f64::consts::PI;

pub fn arcsec_to_rad(arcsec: f64) -> f64 {
    arcsec / ARCSEC_PER_RAD
}

pub fn rad_to_arcsec(rad: f64) -> f64 {
    rad * ARCSEC_PER_RAD
}

pub fn radec_to_xyz(ra: f64, dec: f64) -> [f64; 3] {
    let (sin_dec, cos_dec) = dec.sin_cos();
    let (sin_ra, cos_ra) = ra.sin_cos();
    [cos_dec * cos_ra, cos_dec * sin_ra, sin_dec]
}

/// Degree-valued variant of [`radec_to_xyz`].
pub fn radec_deg_to_xyz(ra_deg: f64, dec_deg: f64) -> [f64; 3] {
    radec_to_xyz(ra_deg.to_radians(), dec_deg.to_radians())
}

/// Unit vector to (RA, Dec) with RA wrapped into `[0, 2π)`.
pub fn xyz_to_radec(xyz: [f64; 3]) -> (f64, f64) {
    let ra = xyz[1].atan2(xyz[0]).rem_euclid(TAU);
    (ra, xyz[2].clamp(-1.0, 1.0).asin())
}

fn dot(a: [f64; 3], b: [f64; 3]) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

fn normalize(v: [f64; 3]) -> [f64; 3] {
    let n = dot(v, v).sqrt();
    [v[0] / n, v[1] / n, v[2] / n]
}

/// Great-circle separation in radians.
pub fn angular_distance(a: [f64; 3], b: [f64; 3]) -> f64 {
    // atan2 keeps precision for both tiny and near-antipodal separations.
    let cross = [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ];
    dot(cross, cross).sqrt().atan2(dot(a, b))
}

/// Normalized midpoint of two unit vectors.
pub fn star_midpoint(a: [f64; 3], b: [f64; 3]) -> [f64; 3] {
    normalize([a[0] + b[0], a[1] + b[1], a[2] + b[2]])
}

/// Normalized mean of a set of unit vectors, `None` for an empty or
/// perfectly balanced set.
pub fn centroid(points: impl IntoIterator<Item = [f64; 3]>) -> Option<[f64; 3]> {
    let mut sum = [0.0; 3];
    for p in points {
        sum[0] += p[0];
        sum[1] += p[1];
        sum[2] += p[2];
    }
    let norm = dot(sum, sum).sqrt();
    (norm > 0.0).then(|| [sum[0] / norm, sum[1] / norm, sum[2] / norm])
}

/// Squared chord length between two unit vectors separated by `angle`.
///
/// This is the squared Euclidean distance used by the 3-D star trees.
pub fn angle_to_chord_sq(angle: f64) -> f64 {
    let half = (angle.min(std::f64::consts::PI) / 2.0).sin();
    4.0 * half * half
}

/// Gnomonic projection of `point` onto the plane tangent at `reference`.
///
/// The first coordinate grows with RA and the second toward the north pole.
/// Points on the far hemisphere have no projection.
pub fn star_coords(point: [f64; 3], reference: [f64; 3]) -> Option<(f64, f64)> {
    let cos_sep = dot(point, reference);
    if cos_sep <= 0.0 {
        return None;
    }

    let [rx, ry, rz] = reference;
    if rz.abs() == 1.0 {
        // At a pole the RA direction is degenerate; take +y (or its mirror) as east.
        let x = rz * point[0] / point[2];
        return Some((x, point[1] / point[2]));
    }

    let east_norm = rx.hypot(ry);
    let east = [-ry / east_norm, rx / east_norm, 0.0];
    let north = [-rz * east[1], rz * east[0], rx * east[1] - ry * east[0]];

    Some((dot(point, east) / cos_sep, dot(point, north) / cos_sep))
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    #[test]
    fn radec_round_trip_wraps_ra() {
        let (ra, dec) = xyz_to_radec(radec_to_xyz(-0.25, 0.4));
        assert_abs_diff_eq!(ra, TAU - 0.25, epsilon = 1e-12);
        assert_abs_diff_eq!(dec, 0.4, epsilon = 1e-12);
    }

    #[test]
    fn degree_conversion_matches_radians() {
        let a = radec_deg_to_xyz(180.0, -30.0);
        let b = radec_to_xyz(PI, -PI / 6.0);
        for i in 0..3 {
            assert_abs_diff_eq!(a[i], b[i], epsilon = 1e-15);
        }
    }

    #[test]
    fn separation_of_tiny_offsets_is_precise() {
        let a = radec_to_xyz(1.0, 0.3);
        let b = radec_to_xyz(1.0, 0.3 + arcsec_to_rad(0.01));
        assert_abs_diff_eq!(rad_to_arcsec(angular_distance(a, b)), 0.01, epsilon = 1e-6);
        let pole = radec_to_xyz(0.0, FRAC_PI_2);
        let south = radec_to_xyz(2.0, -FRAC_PI_2);
        assert_abs_diff_eq!(angular_distance(pole, south), PI, epsilon = 1e-12);
    }

    #[test]
    fn chord_matches_vector_distance() {
        let a = radec_to_xyz(0.3, 0.1);
        let b = radec_to_xyz(0.35, 0.12);
        let direct: f64 = (0..3).map(|i| (a[i] - b[i]).powi(2)).sum();
        assert_abs_diff_eq!(angle_to_chord_sq(angular_distance(a, b)), direct, epsilon = 1e-15);
    }

    #[test]
    fn centroid_of_symmetric_pair_is_midpoint() {
        let a = radec_to_xyz(0.0, 0.1);
        let b = radec_to_xyz(0.0, -0.1);
        let c = centroid([a, b]).unwrap();
        assert_abs_diff_eq!(c[0], 1.0, epsilon = 1e-12);
        assert!(centroid(std::iter::empty()).is_none());
        assert_eq!(star_midpoint(a, b), c);
    }

    #[test]
    fn tangent_plane_axes_point_east_and_north() {
        let r = radec_to_xyz(2.0, -0.5);
        let east = star_coords(radec_to_xyz(2.0 + 1e-4, -0.5), r).unwrap();
        let north = star_coords(radec_to_xyz(2.0, -0.5 + 1e-4), r).unwrap();
        assert!(east.0 > 0.0 && east.1.abs() < 1e-8);
        assert!(north.1 > 0.0 && north.0.abs() < 1e-8);
        assert!(star_coords(radec_to_xyz(2.0 + PI, 0.5), r).is_none());
    }
}
