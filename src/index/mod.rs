//! Reference-catalog indices.
//!
//! An [`Index`] always carries its [`IndexMetadata`]; star positions, quads
//! and tag-along columns are read from disk only when first needed.

pub mod builder;
pub mod catalog;
pub mod store;

use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::quads::{Code, Quad, DIMCODES};
use crate::geom::sphere::{angle_to_chord_sq, rad_to_arcsec, radec_to_xyz};
use crate::healpix;
use crate::kdtree::KdTree;

pub use catalog::IndexCatalog;

#[derive(Error, Debug)]
pub enum IndexError {
    #[error("failed to read index {}: {}", .path.display(), .source)]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("{} is not an index file", .path.display())]
    BadMagic { path: PathBuf },

    #[error("{}: unsupported index format version {}", .path.display(), .version)]
    UnsupportedVersion { path: PathBuf, version: u32 },

    #[error("{}: {}", .path.display(), .reason)]
    Corrupt { path: PathBuf, reason: String },

    #[error("index {0} has no backing file to load star data from")]
    NoBackingFile(String),

    #[error("index {0} carries no tag-along columns")]
    NoTagAlong(String),

    #[error("index {index} has no tag-along column {column:?}")]
    MissingTagAlong { column: String, index: String },
}

/// Identity and coverage of one index, available without loading it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub index_id: u32,
    pub healpix: u64,
    /// HEALPix resolution of `healpix`; 0 marks an all-sky index.
    pub nside: u32,
    pub name: String,
    pub path: Option<PathBuf>,
    /// Smallest quad diameter, radians.
    pub scale_lower: f64,
    /// Largest quad diameter, radians.
    pub scale_upper: f64,
    /// Positional uncertainty of the reference stars, arcseconds.
    pub jitter_arcsec: f64,
    pub tag_along: Vec<String>,
    pub n_stars: usize,
    pub n_quads: usize,
}

/// Duplicate-detection key: `(index_id, healpix, nside)`.
pub type IndexKey = (u32, u64, u32);

impl IndexMetadata {
    pub fn key(&self) -> IndexKey {
        (self.index_id, self.healpix, self.nside)
    }

    pub fn is_all_sky(&self) -> bool {
        self.nside == 0
    }

    /// Whether the quad diameters of this index intersect `[lower, upper]`
    /// arcseconds.
    pub fn overlaps_quad_scale(&self, lower: f64, upper: f64) -> bool {
        rad_to_arcsec(self.scale_lower) <= upper && rad_to_arcsec(self.scale_upper) >= lower
    }

    /// Whether the index's sky cell comes within `radius` of (ra, dec), all
    /// in radians.
    pub fn is_within_range(&self, ra: f64, dec: f64, radius: f64) -> bool {
        if self.is_all_sky() {
            return true;
        }
        healpix::distance_to_cell(radec_to_xyz(ra, dec), self.healpix, self.nside) <= radius
    }
}

/// A reference star; `ra`/`dec` in radians.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct IndexStar {
    pub catalog_id: u64,
    pub ra: f64,
    pub dec: f64,
}

impl IndexStar {
    pub fn xyz(&self) -> [f64; 3] {
        radec_to_xyz(self.ra, self.dec)
    }
}

/// Star and quad data of a loaded index.
#[derive(Clone)]
pub struct IndexData {
    pub stars: Vec<IndexStar>,
    pub star_tree: KdTree<3>,
    pub quads: Vec<Quad>,
    /// Canonical code of each quad.
    pub codes: Vec<Code>,
    pub code_tree: KdTree<{ DIMCODES }>,
    /// Per-star auxiliary values keyed by column name.
    pub tag_along: BTreeMap<String, Vec<f64>>,
}

impl IndexData {
    pub fn new(
        stars: Vec<IndexStar>,
        quads: Vec<Quad>,
        codes: Vec<Code>,
        tag_along: BTreeMap<String, Vec<f64>>,
    ) -> Self {
        let star_tree = KdTree::from_points(stars.iter().map(IndexStar::xyz).collect());
        let code_tree = KdTree::from_points(codes.clone());
        IndexData {
            stars,
            star_tree,
            quads,
            codes,
            code_tree,
            tag_along,
        }
    }

    /// Indices of the stars within `radius` radians of `center`.
    pub fn stars_within(&self, center: [f64; 3], radius: f64) -> Vec<usize> {
        let limit = angle_to_chord_sq(radius);
        let mut found: Vec<usize> = self
            .star_tree
            .range_search(&center, limit)
            .into_iter()
            .map(|r| r.index)
            .collect();
        found.sort_unstable();
        found
    }
}

/// An index: metadata plus, once loaded, its star data.
pub struct Index {
    pub meta: IndexMetadata,
    data: Option<IndexData>,
}

impl fmt::Debug for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Index")
            .field("name", &self.meta.name)
            .field("key", &self.meta.key())
            .field("loaded", &self.is_loaded())
            .finish()
    }
}

impl Index {
    /// An index held in memory, already loaded.
    pub fn in_memory(meta: IndexMetadata, data: IndexData) -> Self {
        Index {
            meta,
            data: Some(data),
        }
    }

    /// A metadata-only index, as restored from a metadata cache.
    pub fn from_metadata(meta: IndexMetadata) -> Self {
        Index { meta, data: None }
    }

    /// Read the metadata header of an index file, leaving star data on disk.
    pub fn open(path: &Path) -> Result<Self, IndexError> {
        let meta = store::read_metadata(path)?;
        Ok(Index { meta, data: None })
    }

    pub fn is_loaded(&self) -> bool {
        self.data.is_some()
    }

    pub fn data(&self) -> Option<&IndexData> {
        self.data.as_ref()
    }

    /// Load star data if it is not resident. Repeated calls are no-ops.
    pub fn ensure_loaded(&mut self) -> Result<&IndexData, IndexError> {
        if self.data.is_none() {
            let path = self
                .meta
                .path
                .clone()
                .ok_or_else(|| IndexError::NoBackingFile(self.meta.name.clone()))?;
            log::debug!("loading star data for index {}", self.meta.name);
            self.data = Some(store::read_data(&path, &self.meta)?);
        }
        match &self.data {
            Some(data) => Ok(data),
            None => Err(IndexError::NoBackingFile(self.meta.name.clone())),
        }
    }

    /// Drop resident star data. Indices without a backing file keep theirs,
    /// since it could not be reloaded; returns whether data was released.
    pub fn unload(&mut self) -> bool {
        if self.meta.path.is_none() || self.data.is_none() {
            return false;
        }
        self.data = None;
        true
    }

    /// A tag-along column, indexed like `IndexData::stars`.
    pub fn tag_along(&self, column: &str) -> Result<&[f64], IndexError> {
        if self.meta.tag_along.is_empty() {
            return Err(IndexError::NoTagAlong(self.meta.name.clone()));
        }
        self.data
            .as_ref()
            .and_then(|d| d.tag_along.get(column))
            .map(Vec::as_slice)
            .ok_or_else(|| IndexError::MissingTagAlong {
                column: column.to_string(),
                index: self.meta.name.clone(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_index;

    #[test]
    fn scale_overlap_is_inclusive() {
        let meta = sample_index(1, 0, 0).meta;
        let lo = rad_to_arcsec(meta.scale_lower);
        let hi = rad_to_arcsec(meta.scale_upper);
        assert!(meta.overlaps_quad_scale(hi, hi * 2.0));
        assert!(meta.overlaps_quad_scale(0.0, lo));
        assert!(!meta.overlaps_quad_scale(hi * 1.01, hi * 2.0));
        assert!(!meta.overlaps_quad_scale(0.0, lo * 0.99));
    }

    #[test]
    fn all_sky_index_is_always_in_range() {
        let meta = sample_index(1, 0, 0).meta;
        assert!(meta.is_all_sky());
        assert!(meta.is_within_range(4.0, -1.0, 0.0));
    }

    #[test]
    fn cell_coverage_uses_distance_to_cell() {
        let mut meta = sample_index(1, 0, 0).meta;
        meta.nside = 8;
        meta.healpix = healpix::lon_lat_to_cell(1.0, 0.5, 8);
        assert!(meta.is_within_range(1.0, 0.5, 0.0));
        assert!(!meta.is_within_range(1.0 + std::f64::consts::PI, -0.5, 0.1));
    }

    #[test]
    fn tag_along_lookup() {
        let index = sample_index(1, 0, 0);
        assert_eq!(index.tag_along("mag").unwrap().len(), index.meta.n_stars);
        assert!(matches!(
            index.tag_along("bogus"),
            Err(IndexError::MissingTagAlong { .. })
        ));

        let mut bare = sample_index(2, 0, 0);
        bare.meta.tag_along.clear();
        assert!(matches!(bare.tag_along("mag"), Err(IndexError::NoTagAlong(_))));
    }

    #[test]
    fn in_memory_index_cannot_be_unloaded() {
        let mut index = sample_index(1, 0, 0);
        assert!(!index.unload());
        assert!(index.is_loaded());
        assert!(index.ensure_loaded().is_ok());
    }

    #[test]
    fn star_search_returns_sorted_positions() {
        let index = sample_index(1, 0, 0);
        let data = index.data().unwrap();
        let center = data.stars[0].xyz();
        let found = data.stars_within(center, 1e-9);
        assert_eq!(found, vec![0]);
        let everything = data.stars_within(center, 1.0);
        assert_eq!(everything.len(), data.stars.len());
        assert!(everything.windows(2).all(|w| w[0] < w[1]));
    }
}
