//! Building indices from reference catalogs.
//!
//! Stars are ranked by magnitude and quads are enumerated faintest-member
//! last: every quad whose faintest star is `n` is emitted before any quad
//! involving star `n + 1`. A `max_quads` cap therefore drops quads of the
//! faintest stars first, the same order in which the matcher proposes
//! field quads.

use std::collections::{BTreeMap, HashSet};

use starfield::catalogs::{StarCatalog, StarData};

use crate::engine::quads::{compute_canonical_code, Code, Quad, DIMQUADS};
use crate::geom::sphere::{
    angle_to_chord_sq, angular_distance, rad_to_arcsec, radec_to_xyz, star_midpoint,
};
use crate::healpix;
use crate::kdtree::KdTree;

use super::{Index, IndexData, IndexMetadata, IndexStar};

/// Tag-along column always written by the builder.
pub const MAG_COLUMN: &str = "mag";

/// One catalog entry fed to the builder. Angles in radians.
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogStar {
    pub catalog_id: u64,
    pub ra: f64,
    pub dec: f64,
    pub mag: f64,
    /// Values for `IndexBuilderConfig::extra_columns`, in the same order.
    pub columns: Vec<f64>,
}

impl CatalogStar {
    pub fn new(catalog_id: u64, ra: f64, dec: f64, mag: f64) -> Self {
        CatalogStar {
            catalog_id,
            ra,
            dec,
            mag,
            columns: Vec::new(),
        }
    }
}

impl From<&StarData> for CatalogStar {
    fn from(s: &StarData) -> Self {
        CatalogStar::new(s.id, s.position.ra, s.position.dec, s.magnitude)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexBuilderConfig {
    pub index_id: u32,
    pub name: String,
    /// Sky cell the index covers; ignored when `nside` is 0 (all-sky).
    pub healpix: u64,
    pub nside: u32,
    /// Quad backbone length bounds, radians.
    pub scale_lower: f64,
    pub scale_upper: f64,
    /// Brightest stars kept.
    pub max_stars: usize,
    pub max_quads: usize,
    /// Positional uncertainty of the catalog, arcseconds.
    pub jitter_arcsec: f64,
    /// Tag-along columns carried besides `mag`.
    pub extra_columns: Vec<String>,
}

impl Default for IndexBuilderConfig {
    fn default() -> Self {
        IndexBuilderConfig {
            index_id: 0,
            name: "index".to_string(),
            healpix: 0,
            nside: 0,
            scale_lower: 30.0_f64.to_radians() / 3600.0,
            scale_upper: 1800.0_f64.to_radians() / 3600.0,
            max_stars: 10_000,
            max_quads: 1_000_000,
            jitter_arcsec: 1.0,
            extra_columns: Vec::new(),
        }
    }
}

/// Quad enumeration over brightness-ranked stars.
struct QuadBuilder<'a> {
    xyz: &'a [[f64; 3]],
    tree: &'a KdTree<3>,
    scale_lower: f64,
    scale_upper: f64,
    seen: HashSet<[usize; DIMQUADS]>,
    quads: Vec<Quad>,
    codes: Vec<Code>,
}

impl QuadBuilder<'_> {
    /// Ranks below `n` within `radius` radians of `center`.
    fn brighter_within(&self, center: [f64; 3], radius: f64, n: usize) -> Vec<usize> {
        let mut found: Vec<usize> = self
            .tree
            .range_search(&center, angle_to_chord_sq(radius))
            .into_iter()
            .map(|r| r.index)
            .filter(|&i| i < n)
            .collect();
        found.sort_unstable();
        found
    }

    /// Midpoint and length of a backbone inside the scale bounds.
    fn backbone(&self, a: usize, b: usize) -> Option<([f64; 3], f64)> {
        let ab = angular_distance(self.xyz[a], self.xyz[b]);
        (ab >= self.scale_lower && ab <= self.scale_upper)
            .then(|| (star_midpoint(self.xyz[a], self.xyz[b]), ab))
    }

    fn inside(&self, i: usize, (mid, ab): ([f64; 3], f64)) -> bool {
        angular_distance(mid, self.xyz[i]) <= ab
    }

    fn emit(&mut self, ids: [usize; DIMQUADS]) {
        let mut key = ids;
        key.sort_unstable();
        if !self.seen.insert(key) {
            return;
        }
        let star_xyz: [[f64; 3]; DIMQUADS] = std::array::from_fn(|i| self.xyz[ids[i]]);
        if let Some((code, star_ids, _)) = compute_canonical_code(&star_xyz, ids) {
            self.quads.push(Quad { star_ids });
            self.codes.push(code);
        }
    }

    /// All quads whose faintest member is `n`.
    fn quads_ending_at(&mut self, n: usize, limit: usize) {
        // Off-backbone members sit within 1.5 backbone lengths of either end.
        let near = self.brighter_within(self.xyz[n], 1.5 * self.scale_upper, n);

        for &a in &near {
            let Some(circle) = self.backbone(a, n) else {
                continue;
            };
            let inner: Vec<usize> = self
                .brighter_within(circle.0, circle.1, n)
                .into_iter()
                .filter(|&i| i != a)
                .collect();
            for (ci, &c) in inner.iter().enumerate() {
                for &d in &inner[ci + 1..] {
                    self.emit([a, n, c, d]);
                    if self.quads.len() >= limit {
                        return;
                    }
                }
            }
        }

        for (ai, &a) in near.iter().enumerate() {
            for &b in &near[ai + 1..] {
                let Some(circle) = self.backbone(a, b) else {
                    continue;
                };
                if !self.inside(n, circle) {
                    continue;
                }
                for d in self.brighter_within(circle.0, circle.1, n) {
                    if d == a || d == b {
                        continue;
                    }
                    self.emit([a, b, n, d]);
                    if self.quads.len() >= limit {
                        return;
                    }
                }
            }
        }
    }
}

/// Build an in-memory index from catalog stars.
///
/// Cell indices keep only stars within `scale_upper` of their cell, so
/// quads straddling the cell edge are still formed.
pub fn build_index(catalog: &[CatalogStar], config: &IndexBuilderConfig) -> Index {
    let mut ranked: Vec<&CatalogStar> = catalog
        .iter()
        .filter(|s| s.ra.is_finite() && s.dec.is_finite())
        .filter(|s| {
            config.nside == 0
                || healpix::distance_to_cell(radec_to_xyz(s.ra, s.dec), config.healpix, config.nside)
                    <= config.scale_upper
        })
        .collect();
    ranked.sort_by(|a, b| a.mag.total_cmp(&b.mag));
    ranked.truncate(config.max_stars);

    let stars: Vec<IndexStar> = ranked
        .iter()
        .map(|s| IndexStar {
            catalog_id: s.catalog_id,
            ra: s.ra,
            dec: s.dec,
        })
        .collect();
    let xyz: Vec<[f64; 3]> = stars.iter().map(IndexStar::xyz).collect();
    let tree = KdTree::from_points(xyz.clone());

    let mut builder = QuadBuilder {
        xyz: &xyz,
        tree: &tree,
        scale_lower: config.scale_lower,
        scale_upper: config.scale_upper,
        seen: HashSet::new(),
        quads: Vec::new(),
        codes: Vec::new(),
    };
    for n in (DIMQUADS - 1)..stars.len() {
        if builder.quads.len() >= config.max_quads {
            log::debug!("quad limit {} reached at star rank {n}", config.max_quads);
            break;
        }
        builder.quads_ending_at(n, config.max_quads);
    }
    let QuadBuilder { quads, codes, .. } = builder;

    let mut tag_along = BTreeMap::new();
    tag_along.insert(
        MAG_COLUMN.to_string(),
        ranked.iter().map(|s| s.mag).collect::<Vec<f64>>(),
    );
    for (col, name) in config.extra_columns.iter().enumerate() {
        let values = ranked
            .iter()
            .map(|s| s.columns.get(col).copied().unwrap_or(f64::NAN))
            .collect();
        tag_along.insert(name.clone(), values);
    }
    let mut columns = vec![MAG_COLUMN.to_string()];
    columns.extend(config.extra_columns.iter().cloned());

    log::info!(
        "built index {}: {} stars, {} quads, quad sizes {:.1}..{:.1} arcsec",
        config.name,
        stars.len(),
        quads.len(),
        rad_to_arcsec(config.scale_lower),
        rad_to_arcsec(config.scale_upper)
    );

    let meta = IndexMetadata {
        index_id: config.index_id,
        healpix: if config.nside == 0 { 0 } else { config.healpix },
        nside: config.nside,
        name: config.name.clone(),
        path: None,
        scale_lower: config.scale_lower,
        scale_upper: config.scale_upper,
        jitter_arcsec: config.jitter_arcsec,
        tag_along: columns,
        n_stars: stars.len(),
        n_quads: quads.len(),
    };
    Index::in_memory(meta, IndexData::new(stars, quads, codes, tag_along))
}

/// Build an index from a starfield catalog.
pub fn build_index_from_catalog(catalog: &impl StarCatalog, config: &IndexBuilderConfig) -> Index {
    let stars: Vec<CatalogStar> = catalog
        .star_data()
        .map(|s| CatalogStar::new(s.id, s.position.ra, s.position.dec, s.magnitude))
        .collect();
    build_index(&stars, config)
}

/// Build an index from already filtered starfield entries.
pub fn build_index_from_star_data(stars: &[StarData], config: &IndexBuilderConfig) -> Index {
    let stars: Vec<CatalogStar> = stars.iter().map(CatalogStar::from).collect();
    build_index(&stars, config)
}
