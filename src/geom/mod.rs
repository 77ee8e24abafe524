//! Spherical geometry and pixel/sky projections.

pub mod sip;
pub mod sphere;
pub mod tan;

pub use sip::SipWcs;
pub use tan::TanWcs;

/// Handedness of a pixel-to-sky mapping.
///
/// `Normal` is the orientation of an image seen with north up and east to
/// the left (negative CD determinant); `Flipped` is its mirror image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Handedness {
    Normal,
    Flipped,
}

impl Handedness {
    /// Handedness implied by the sign of a CD-matrix determinant.
    pub fn from_determinant(det: f64) -> Self {
        if det > 0.0 {
            Handedness::Flipped
        } else {
            Handedness::Normal
        }
    }
}

/// A circular sky region: center (RA, Dec) and radius, all in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SkyDisc {
    pub ra: f64,
    pub dec: f64,
    pub radius: f64,
}

impl SkyDisc {
    pub fn new(ra: f64, dec: f64, radius: f64) -> Self {
        SkyDisc { ra, dec, radius }
    }

    pub fn center_xyz(&self) -> [f64; 3] {
        sphere::radec_to_xyz(self.ra, self.dec)
    }

    pub fn contains(&self, xyz: [f64; 3]) -> bool {
        sphere::angular_distance(self.center_xyz(), xyz) <= self.radius
    }
}

/// A pixel/sky mapping as consumed by the solve pipeline.
///
/// Angles are in radians. Implemented by [`TanWcs`] and [`SipWcs`]; callers
/// holding a WCS from another imaging stack can implement it to seed a
/// position-guided solve.
pub trait SkyProjection {
    /// Sky position (RA, Dec) of a pixel.
    fn pixel_to_radec(&self, px: f64, py: f64) -> (f64, f64);

    /// Pixel position of a sky position, `None` when it is behind the tangent plane.
    fn radec_to_pixel(&self, ra: f64, dec: f64) -> Option<(f64, f64)>;

    /// Solid angle of one pixel at the reference point, in square degrees.
    fn pixel_area(&self) -> f64;

    fn handedness(&self) -> Handedness;

    fn is_flipped(&self) -> bool {
        self.handedness() == Handedness::Flipped
    }
}
