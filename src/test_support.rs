//! Synthetic sky used across the unit tests: a known TAN solution, the
//! field it images and catalogs consistent with it.

use std::collections::BTreeMap;

use crate::field::FieldStar;
use crate::geom::sphere::arcsec_to_rad;
use crate::geom::tan::tests::make_test_wcs;
use crate::geom::TanWcs;
use crate::healpix;
use crate::index::builder::{build_index, CatalogStar, IndexBuilderConfig, MAG_COLUMN};
use crate::index::{Index, IndexData, IndexMetadata, IndexStar};

pub(crate) const PIXEL_SCALE_ARCSEC: f64 = 2.0;
pub(crate) const IMAGE_SIZE: (f64, f64) = (512.0, 512.0);
const N_FIELD: usize = 25;
const N_OUTSIDE: usize = 10;

/// Deterministic xorshift64 so fixtures never change between runs.
struct XorShift(u64);

impl XorShift {
    fn next_f64(&mut self) -> f64 {
        self.0 ^= self.0 << 13;
        self.0 ^= self.0 >> 7;
        self.0 ^= self.0 << 17;
        (self.0 >> 11) as f64 / (1u64 << 53) as f64
    }

    fn in_range(&mut self, lo: f64, hi: f64) -> f64 {
        lo + (hi - lo) * self.next_f64()
    }
}

/// A field imaged through `truth`, plus the catalog it was drawn from.
pub(crate) struct Scenario {
    pub field: Vec<FieldStar>,
    pub image_size: (f64, f64),
    pub truth: TanWcs,
    pub catalog: Vec<CatalogStar>,
}

impl Scenario {
    pub fn new() -> Self {
        let truth = make_test_wcs([1.0, 0.5], PIXEL_SCALE_ARCSEC, 0.3, IMAGE_SIZE, false);
        let mut rng = XorShift(0x2545_f491_4f6c_dd1d);

        let mut pixels: Vec<(f64, f64)> = Vec::new();
        while pixels.len() < N_FIELD {
            let p = (rng.in_range(30.0, 482.0), rng.in_range(30.0, 482.0));
            if pixels.iter().all(|q| (p.0 - q.0).hypot(p.1 - q.1) > 15.0) {
                pixels.push(p);
            }
        }

        let mut field = Vec::new();
        let mut catalog = Vec::new();
        for (i, &(x, y)) in pixels.iter().enumerate() {
            field.push(FieldStar::new(x, y, 1000.0 - 10.0 * i as f64));
            let (ra, dec) = truth.pixel_to_radec(x, y);
            catalog.push(CatalogStar::new(5000 + i as u64, ra, dec, 10.0 + 0.1 * i as f64));
        }
        for i in 0..N_OUTSIDE {
            // Off the right-hand edge, fainter than anything in the field.
            let x = rng.in_range(560.0, 760.0);
            let y = rng.in_range(0.0, 512.0);
            let (ra, dec) = truth.pixel_to_radec(x, y);
            catalog.push(CatalogStar::new(9000 + i as u64, ra, dec, 15.0 + 0.1 * i as f64));
        }

        Scenario {
            field,
            image_size: IMAGE_SIZE,
            truth,
            catalog,
        }
    }

    pub fn builder_config(&self, index_id: u32) -> IndexBuilderConfig {
        let (w, h) = self.image_size;
        IndexBuilderConfig {
            index_id,
            name: format!("synthetic-{index_id:02}"),
            scale_lower: arcsec_to_rad(10.0 * PIXEL_SCALE_ARCSEC),
            scale_upper: arcsec_to_rad(w.hypot(h) * PIXEL_SCALE_ARCSEC),
            max_stars: N_FIELD + N_OUTSIDE,
            max_quads: 10_000,
            jitter_arcsec: 1.0,
            ..IndexBuilderConfig::default()
        }
    }

    /// All-sky index over the whole catalog.
    pub fn all_sky_index(&self, index_id: u32) -> Index {
        build_index(&self.catalog, &self.builder_config(index_id))
    }

    /// Index restricted to the `nside = 8` cell holding the field center.
    pub fn cell_index(&self, index_id: u32) -> Index {
        let (ra, dec) = self.truth.field_center();
        let config = IndexBuilderConfig {
            nside: 8,
            healpix: healpix::lon_lat_to_cell(ra, dec, 8),
            ..self.builder_config(index_id)
        };
        build_index(&self.catalog, &config)
    }
}

/// A small loaded index carrying the key `(index_id, healpix, nside)`.
pub(crate) fn sample_index(index_id: u32, healpix: u64, nside: u32) -> Index {
    let scenario = Scenario::new();
    let config = IndexBuilderConfig {
        max_quads: 500,
        ..scenario.builder_config(index_id)
    };
    let mut index = build_index(&scenario.catalog, &config);
    index.meta.healpix = healpix;
    index.meta.nside = nside;
    index.meta.name = format!("sample-{index_id:02}");
    index
}

/// An index holding `stars` as-is, with no quads and a zero `mag` column.
pub(crate) fn index_from_stars(index_id: u32, stars: Vec<IndexStar>) -> Index {
    let mut tag_along = BTreeMap::new();
    tag_along.insert(MAG_COLUMN.to_string(), vec![0.0; stars.len()]);
    let meta = IndexMetadata {
        index_id,
        healpix: 0,
        nside: 0,
        name: format!("stars-{index_id:02}"),
        path: None,
        scale_lower: arcsec_to_rad(10.0),
        scale_upper: arcsec_to_rad(3600.0),
        jitter_arcsec: 1.0,
        tag_along: vec![MAG_COLUMN.to_string()],
        n_stars: stars.len(),
        n_quads: 0,
    };
    Index::in_memory(meta, IndexData::new(stars, Vec::new(), Vec::new(), tag_along))
}
