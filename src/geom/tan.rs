use serde::{Deserialize, Serialize};

use super::sphere;
use super::{Handedness, SkyProjection};

/// Linear tangent-plane (gnomonic) WCS.
///
/// `cd` maps pixel offsets from `crpix` to intermediate world coordinates
/// in radians, the first axis growing with RA and the second with Dec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TanWcs {
    /// Reference point (RA, Dec) in radians.
    pub crval: [f64; 2],
    /// Reference pixel.
    pub crpix: [f64; 2],
    /// `[[cd1_1, cd1_2], [cd2_1, cd2_2]]`.
    pub cd: [[f64; 2]; 2],
    /// `(width, height)` in pixels.
    pub image_size: [f64; 2],
}

impl TanWcs {
    pub fn determinant(&self) -> f64 {
        self.cd[0][0] * self.cd[1][1] - self.cd[0][1] * self.cd[1][0]
    }

    pub fn reference_xyz(&self) -> [f64; 3] {
        sphere::radec_to_xyz(self.crval[0], self.crval[1])
    }

    /// Pixel offsets from `crpix` to intermediate world coordinates.
    pub fn pixel_offset_to_iwc(&self, u: f64, v: f64) -> (f64, f64) {
        (
            self.cd[0][0] * u + self.cd[0][1] * v,
            self.cd[1][0] * u + self.cd[1][1] * v,
        )
    }

    /// Intermediate world coordinates to pixel offsets from `crpix`.
    pub fn iwc_to_pixel_offset(&self, x: f64, y: f64) -> (f64, f64) {
        let inv_det = 1.0 / self.determinant();
        (
            inv_det * (self.cd[1][1] * x - self.cd[0][1] * y),
            inv_det * (self.cd[0][0] * y - self.cd[1][0] * x),
        )
    }

    pub fn pixel_to_xyz(&self, px: f64, py: f64) -> [f64; 3] {
        let (x, y) = self.pixel_offset_to_iwc(px - self.crpix[0], py - self.crpix[1]);
        self.iwc_to_xyz(x, y)
    }

    /// `None` if the point is behind the tangent plane.
    pub fn xyz_to_pixel(&self, xyz: [f64; 3]) -> Option<(f64, f64)> {
        let (x, y) = sphere::star_coords(xyz, self.reference_xyz())?;
        let (u, v) = self.iwc_to_pixel_offset(x, y);
        Some((u + self.crpix[0], v + self.crpix[1]))
    }

    pub fn pixel_to_radec(&self, px: f64, py: f64) -> (f64, f64) {
        sphere::xyz_to_radec(self.pixel_to_xyz(px, py))
    }

    pub fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        self.xyz_to_pixel(sphere::radec_to_xyz(ra, dec))
    }

    /// Plate scale in degrees per pixel.
    pub fn pixel_scale(&self) -> f64 {
        self.determinant().abs().sqrt().to_degrees()
    }

    pub fn pixel_scale_arcsec(&self) -> f64 {
        self.pixel_scale() * 3600.0
    }

    pub fn image_center(&self) -> (f64, f64) {
        (self.image_size[0] / 2.0, self.image_size[1] / 2.0)
    }

    /// RA, Dec (radians) of the image center.
    pub fn field_center(&self) -> (f64, f64) {
        let (cx, cy) = self.image_center();
        self.pixel_to_radec(cx, cy)
    }

    /// Radius (radians) of the circle about the image center that reaches
    /// every corner.
    pub fn field_radius(&self) -> f64 {
        let (cx, cy) = self.image_center();
        let center = self.pixel_to_xyz(cx, cy);
        let [w, h] = self.image_size;
        [(0.0, 0.0), (w, 0.0), (0.0, h), (w, h)]
            .into_iter()
            .map(|(x, y)| sphere::angular_distance(center, self.pixel_to_xyz(x, y)))
            .fold(0.0, f64::max)
    }

    /// Lift intermediate world coordinates (radians) off the tangent plane.
    pub(crate) fn iwc_to_xyz(&self, x: f64, y: f64) -> [f64; 3] {
        let [rx, ry, rz] = self.reference_xyz();

        // Unit vector toward decreasing RA; the x axis is negated to match.
        let (ix, iy) = if rz.abs() == 1.0 {
            (-1.0, 0.0)
        } else {
            let n = rx.hypot(ry);
            (ry / n, -rx / n)
        };
        let j = [iy * rz, -ix * rz, ix * ry - iy * rx];
        let jn = (j[0] * j[0] + j[1] * j[1] + j[2] * j[2]).sqrt();
        let (jx, jy, jz) = (j[0] / jn, j[1] / jn, j[2] / jn);

        let p = [-ix * x + jx * y + rx, -iy * x + jy * y + ry, jz * y + rz];
        let n = (p[0] * p[0] + p[1] * p[1] + p[2] * p[2]).sqrt();
        [p[0] / n, p[1] / n, p[2] / n]
    }
}

impl SkyProjection for TanWcs {
    fn pixel_to_radec(&self, px: f64, py: f64) -> (f64, f64) {
        TanWcs::pixel_to_radec(self, px, py)
    }

    fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        TanWcs::radec_to_pixel(self, ra, dec)
    }

    fn pixel_area(&self) -> f64 {
        self.pixel_scale() * self.pixel_scale()
    }

    fn handedness(&self) -> Handedness {
        Handedness::from_determinant(self.determinant())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use std::f64::consts::{FRAC_PI_2, PI};

    /// Square-pixel WCS centred on the image, rotated by `rotation` radians.
    /// `flipped` mirrors the x axis.
    pub(crate) fn make_test_wcs(
        crval: [f64; 2],
        pixel_scale_arcsec: f64,
        rotation: f64,
        image_size: (f64, f64),
        flipped: bool,
    ) -> TanWcs {
        let scale = sphere::arcsec_to_rad(pixel_scale_arcsec);
        let (s, c) = rotation.sin_cos();
        let mirror = if flipped { 1.0 } else { -1.0 };
        TanWcs {
            crval,
            crpix: [image_size.0 / 2.0, image_size.1 / 2.0],
            cd: [[mirror * c * scale, -s * scale], [mirror * s * scale, c * scale]],
            image_size: [image_size.0, image_size.1],
        }
    }

    #[test]
    fn pixel_sky_round_trip_with_rotation() {
        let wcs = make_test_wcs([1.0, 0.5], 1.5, 0.7, (1000.0, 800.0), false);
        for px in (0..=1000).step_by(250) {
            for py in (0..=800).step_by(200) {
                let (ra, dec) = wcs.pixel_to_radec(px as f64, py as f64);
                let (x, y) = wcs.radec_to_pixel(ra, dec).unwrap();
                assert_abs_diff_eq!(x, px as f64, epsilon = 1e-6);
                assert_abs_diff_eq!(y, py as f64, epsilon = 1e-6);
            }
        }
    }

    #[test]
    fn reference_pixel_maps_to_crval_near_pole() {
        let wcs = make_test_wcs([0.3, FRAC_PI_2 - 0.001], 2.0, 0.0, (512.0, 512.0), true);
        let (ra, dec) = wcs.pixel_to_radec(256.0, 256.0);
        assert_abs_diff_eq!(ra, 0.3, epsilon = 1e-9);
        assert_abs_diff_eq!(dec, FRAC_PI_2 - 0.001, epsilon = 1e-12);
    }

    #[test]
    fn normal_parity_puts_east_left() {
        let wcs = make_test_wcs([PI, 0.0], 1.0, 0.0, (100.0, 100.0), false);
        let (ra_left, _) = wcs.pixel_to_radec(0.0, 50.0);
        let (ra_right, _) = wcs.pixel_to_radec(100.0, 50.0);
        assert!(ra_left > ra_right);
        assert_eq!(wcs.handedness(), Handedness::Normal);
        assert!(!wcs.is_flipped());

        let mirrored = make_test_wcs([PI, 0.0], 1.0, 0.0, (100.0, 100.0), true);
        assert!(mirrored.is_flipped());
    }

    #[test]
    fn scale_and_area() {
        let wcs = make_test_wcs([PI, 0.25], 3.0, 1.1, (1024.0, 1024.0), false);
        assert_abs_diff_eq!(wcs.pixel_scale_arcsec(), 3.0, epsilon = 1e-9);
        assert_abs_diff_eq!(wcs.pixel_area(), (3.0 / 3600.0_f64).powi(2), epsilon = 1e-15);
    }

    #[test]
    fn field_radius_reaches_corners() {
        let wcs = make_test_wcs([PI, 0.25], 1.0, 0.0, (1024.0, 1024.0), false);
        let expected = sphere::arcsec_to_rad(512.0 * 2.0_f64.sqrt());
        assert_abs_diff_eq!(wcs.field_radius(), expected, epsilon = expected * 0.01);
    }

    #[test]
    fn far_side_is_not_projected() {
        let wcs = make_test_wcs([PI, 0.25], 1.0, 0.0, (1024.0, 1024.0), false);
        assert!(wcs.radec_to_pixel(0.0, -0.25).is_none());
    }
}
