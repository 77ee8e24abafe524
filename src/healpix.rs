//! Nested-scheme HEALPix cells describing the sky an index covers.
//!
//! A cell is named by `(healpix, nside)`. `nside` must be a power of two;
//! `nside == 0` is reserved for all-sky indices, which have no cell.
//!
//! Base cells 0–3 form the north polar cap, 4–7 the equatorial belt and
//! 8–11 the south cap. Inside a base cell `x` grows to the north-east and
//! `y` to the north-west.

use std::f64::consts::{FRAC_PI_2, FRAC_PI_4, PI, TAU};

use crate::geom::sphere::{angular_distance, radec_to_xyz};

/// Number of cells covering the sphere at `nside`.
pub fn cell_count(nside: u32) -> u64 {
    12 * u64::from(nside) * u64::from(nside)
}

pub fn is_valid_nside(nside: u32) -> bool {
    nside == 0 || nside.is_power_of_two()
}

/// Smallest power-of-two `nside` whose cells are no larger than `scale` radians.
pub fn nside_for_scale(scale: f64) -> u32 {
    let target = (PI / 3.0).sqrt() / scale;
    let exponent = target.log2().ceil().clamp(0.0, 29.0);
    1 << exponent as u32
}

/// Cell containing (lon, lat) radians.
pub fn lon_lat_to_cell(lon: f64, lat: f64, nside: u32) -> u64 {
    let (base, x, y) = locate(lon, lat, f64::from(nside));
    interleave(x, y) + base * u64::from(nside) * u64::from(nside)
}

/// (lon, lat) radians of a cell's center.
pub fn cell_center(cell: u64, nside: u32) -> (f64, f64) {
    let (base, x, y) = split_cell(cell, nside);
    base_xy_to_lon_lat(base, x as f64 + 0.5, y as f64 + 0.5, f64::from(nside))
}

/// Angular radius (radians) of a circle about the cell center that contains
/// the whole cell.
pub fn cell_radius(cell: u64, nside: u32) -> f64 {
    let (base, x, y) = split_cell(cell, nside);
    let ns = f64::from(nside);
    let (clon, clat) = cell_center(cell, nside);
    let center = radec_to_xyz(clon, clat);

    // Cell edges are curved, so sample along them rather than only at corners.
    const STEPS: usize = 8;
    let mut radius: f64 = 0.0;
    for step in 0..=STEPS {
        let t = step as f64 / STEPS as f64;
        for (dx, dy) in [(t, 0.0), (t, 1.0), (0.0, t), (1.0, t)] {
            let (lon, lat) = base_xy_to_lon_lat(base, x as f64 + dx, y as f64 + dy, ns);
            radius = radius.max(angular_distance(center, radec_to_xyz(lon, lat)));
        }
    }
    radius
}

/// Lower bound on the angular distance (radians) from `xyz` to any point of
/// the cell; zero inside it.
pub fn distance_to_cell(xyz: [f64; 3], cell: u64, nside: u32) -> f64 {
    let (lon, lat) = cell_center(cell, nside);
    let d = angular_distance(xyz, radec_to_xyz(lon, lat));
    (d - cell_radius(cell, nside)).max(0.0)
}

fn split_cell(cell: u64, nside: u32) -> (u64, u64, u64) {
    let per_base = u64::from(nside) * u64::from(nside);
    let (x, y) = deinterleave(cell % per_base);
    (cell / per_base, x, y)
}

/// `x` fills the even bits, `y` the odd bits.
fn interleave(x: u64, y: u64) -> u64 {
    (0..32).fold(0, |acc, bit| {
        acc | ((x >> bit) & 1) << (2 * bit) | ((y >> bit) & 1) << (2 * bit + 1)
    })
}

fn deinterleave(sub: u64) -> (u64, u64) {
    (0..32).fold((0, 0), |(x, y), bit| {
        (
            x | ((sub >> (2 * bit)) & 1) << bit,
            y | ((sub >> (2 * bit + 1)) & 1) << bit,
        )
    })
}

/// (lon, lat) to (base cell, x, y) at resolution `ns`.
fn locate(lon: f64, lat: f64, ns: f64) -> (u64, u64, u64) {
    let z = lat.sin();
    let phi = lon.rem_euclid(TAU);
    let phi_t = phi % FRAC_PI_2;
    let column = ((phi / FRAC_PI_2).floor() as u64) % 4;
    let clamp = |v: f64| (v.floor().max(0.0) as u64).min(ns as u64 - 1);

    if z.abs() >= 2.0 / 3.0 {
        let north = z >= 0.0;
        let sigma = 3.0 * (1.0 - z.abs());
        let kx = (sigma * (ns * (2.0 * phi_t - PI) / PI).powi(2)).max(0.0).sqrt();
        let ky = (sigma * (ns * 2.0 * phi_t / PI).powi(2)).max(0.0).sqrt();
        if north {
            (column, clamp(ns - kx), clamp(ns - ky))
        } else {
            (8 + column, clamp(ky), clamp(kx))
        }
    } else {
        let zunits = (z + 2.0 / 3.0) * 0.75;
        let phiunits = phi_t / FRAC_PI_2;
        let mut xx = (zunits + phiunits) * ns;
        let mut yy = (zunits - phiunits + 1.0) * ns;

        let base = match (xx >= ns, yy >= ns) {
            (true, true) => {
                xx -= ns;
                yy -= ns;
                column
            }
            (true, false) => {
                xx -= ns;
                (column + 1) % 4 + 4
            }
            (false, true) => {
                yy -= ns;
                column + 4
            }
            (false, false) => 8 + column,
        };
        (base, clamp(xx), clamp(yy))
    }
}

/// Continuous (base, x, y) back to (lon, lat).
fn base_xy_to_lon_lat(base: u64, x: f64, y: f64, ns: f64) -> (f64, f64) {
    let (xn, yn) = (x / ns, y / ns);
    let north = base <= 3;
    let south = base >= 8;
    let polar = (north && xn + yn > 1.0) || (south && xn + yn < 1.0);

    let (phi, z) = if !polar {
        let (phi_off, z_off, column) = if north {
            (1.0, 0.0, base)
        } else if south {
            (1.0, -2.0, base - 8)
        } else {
            (0.0, -1.0, base - 4)
        };
        (
            FRAC_PI_4 * (xn - yn + phi_off + 2.0 * column as f64),
            (2.0 / 3.0) * (xn + yn + z_off),
        )
    } else {
        let sign = if north { 1.0 } else { -1.0 };
        let (px, py) = if north { (x, y) } else { (ns - y, ns - x) };
        let (kx, ky) = (ns - px, ns - py);
        let phi_t = if kx + ky == 0.0 {
            0.0
        } else {
            PI * ky / (2.0 * (kx + ky))
        };
        let (k, denom) = if phi_t < FRAC_PI_4 {
            (kx, (2.0 * phi_t - PI) * ns)
        } else {
            (ky, 2.0 * phi_t * ns)
        };
        let z = if denom.abs() < 1e-15 {
            sign
        } else {
            let t = PI * k / denom;
            (1.0 - t * t / 3.0) * sign
        };
        let column = if south { base - 8 } else { base };
        (FRAC_PI_2 * column as f64 + phi_t, z)
    };

    (phi.rem_euclid(TAU), z.clamp(-1.0, 1.0).asin())
}
