use ndarray::Array2;
use serde::{Deserialize, Serialize};

use super::sphere;
use super::tan::TanWcs;
use super::{Handedness, SkyProjection};

/// Tangent-plane WCS with SIP polynomial distortion.
///
/// Forward (pixel to sky), with `u, v` the offsets from `crpix`:
///
/// ```text
/// U = u + Σ A[p][q] u^p v^q
/// V = v + Σ B[p][q] u^p v^q        (2 <= p + q <= order)
/// ```
///
/// after which `CD · (U, V)` is deprojected as for [`TanWcs`]. The inverse
/// uses `AP`/`BP` on the undistorted offsets. Each coefficient matrix is
/// `(order + 1) × (order + 1)` and indexed `[p, q]`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SipWcs {
    pub tan: TanWcs,
    pub a: Array2<f64>,
    pub b: Array2<f64>,
    pub ap: Array2<f64>,
    pub bp: Array2<f64>,
}

/// Highest polynomial order fitted or accepted from callers.
pub const MAX_SIP_ORDER: usize = 9;

/// Sum of `coeffs[p, q] u^p v^q` over the terms with `p + q >= 2`.
pub(crate) fn eval_polynomial(coeffs: &Array2<f64>, u: f64, v: f64) -> f64 {
    let order = coeffs.nrows().saturating_sub(1);
    let mut total = 0.0;
    let mut u_pow = 1.0;
    for p in 0..=order {
        let mut v_pow = 1.0;
        for q in 0..=(order - p) {
            if p + q >= 2 {
                total += coeffs[[p, q]] * u_pow * v_pow;
            }
            v_pow *= v;
        }
        u_pow *= u;
    }
    total
}

/// `(p, q)` exponent pairs with `2 <= p + q <= order`, lowest total first.
pub(crate) fn sip_terms(order: usize) -> Vec<(usize, usize)> {
    (2..=order)
        .flat_map(|total| (0..=total).map(move |p| (p, total - p)))
        .collect()
}

impl SipWcs {
    /// Distortion-free SIP model of the given forward and inverse orders.
    pub fn from_tan(tan: TanWcs, order: usize, inverse_order: usize) -> Self {
        let forward = Array2::zeros((order + 1, order + 1));
        let inverse = Array2::zeros((inverse_order + 1, inverse_order + 1));
        SipWcs {
            tan,
            a: forward.clone(),
            b: forward,
            ap: inverse.clone(),
            bp: inverse,
        }
    }

    pub fn order(&self) -> usize {
        self.a.nrows().saturating_sub(1)
    }

    pub fn inverse_order(&self) -> usize {
        self.ap.nrows().saturating_sub(1)
    }

    pub fn pixel_to_xyz(&self, px: f64, py: f64) -> [f64; 3] {
        let u = px - self.tan.crpix[0];
        let v = py - self.tan.crpix[1];
        let (x, y) = self.tan.pixel_offset_to_iwc(
            u + eval_polynomial(&self.a, u, v),
            v + eval_polynomial(&self.b, u, v),
        );
        self.tan.iwc_to_xyz(x, y)
    }

    /// `None` if the point is behind the tangent plane.
    pub fn xyz_to_pixel(&self, xyz: [f64; 3]) -> Option<(f64, f64)> {
        let (x, y) = sphere::star_coords(xyz, self.tan.reference_xyz())?;
        let (big_u, big_v) = self.tan.iwc_to_pixel_offset(x, y);
        let u = big_u + eval_polynomial(&self.ap, big_u, big_v);
        let v = big_v + eval_polynomial(&self.bp, big_u, big_v);
        Some((u + self.tan.crpix[0], v + self.tan.crpix[1]))
    }

    pub fn pixel_to_radec(&self, px: f64, py: f64) -> (f64, f64) {
        sphere::xyz_to_radec(self.pixel_to_xyz(px, py))
    }

    pub fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        self.xyz_to_pixel(sphere::radec_to_xyz(ra, dec))
    }
}

impl SkyProjection for SipWcs {
    fn pixel_to_radec(&self, px: f64, py: f64) -> (f64, f64) {
        SipWcs::pixel_to_radec(self, px, py)
    }

    fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)> {
        SipWcs::radec_to_pixel(self, ra, dec)
    }

    fn pixel_area(&self) -> f64 {
        self.tan.pixel_area()
    }

    fn handedness(&self) -> Handedness {
        self.tan.handedness()
    }
}
