//! The set of reference indices a session can solve against.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::SolverError;
use crate::geom::sphere::rad_to_arcsec;
use crate::geom::SkyDisc;

use super::{Index, IndexError, IndexKey, IndexMetadata};

/// Metadata for every configured index, with star data loaded on demand.
///
/// Promotion to "loaded" mutates the catalog, so sharing one between
/// sessions needs external synchronisation.
#[derive(Debug, Default)]
pub struct IndexCatalog {
    indexes: Vec<Index>,
}

impl IndexCatalog {
    pub fn new() -> Self {
        IndexCatalog::default()
    }

    /// Read the metadata of each file. Unreadable files and duplicates of an
    /// already-seen `(id, healpix, nside)` are skipped with a warning.
    pub fn load_metadata<P: AsRef<Path>>(paths: &[P]) -> Self {
        let mut catalog = IndexCatalog::new();
        for path in paths {
            let path = path.as_ref();
            match Index::open(path) {
                Ok(index) => {
                    catalog.add(index);
                }
                Err(e) => log::warn!("skipping index {}: {e}", path.display()),
            }
        }
        log::info!("loaded metadata for {} index files", catalog.len());
        catalog
    }

    /// Add an index unless one with the same key is present; returns
    /// whether it was added.
    pub fn add(&mut self, index: Index) -> bool {
        let key = index.meta.key();
        if let Some(existing) = self.indexes.iter().find(|i| i.meta.key() == key) {
            log::warn!(
                "duplicate index {} (id {}, healpix {}, nside {}) ignored; keeping {}",
                index.meta.name,
                key.0,
                key.1,
                key.2,
                existing.meta.name
            );
            return false;
        }
        self.indexes.push(index);
        true
    }

    pub fn len(&self) -> usize {
        self.indexes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.indexes.is_empty()
    }

    pub fn get(&self, slot: usize) -> Option<&Index> {
        self.indexes.get(slot)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Index> {
        self.indexes.iter()
    }

    pub fn keys(&self) -> Vec<IndexKey> {
        self.indexes.iter().map(|i| i.meta.key()).collect()
    }

    /// Load the star data of one index. Loading twice is a no-op.
    pub fn ensure_loaded(&mut self, slot: usize) -> Result<(), IndexError> {
        if let Some(index) = self.indexes.get_mut(slot) {
            index.ensure_loaded()?;
        }
        Ok(())
    }

    pub fn load_all(&mut self) -> Result<(), IndexError> {
        for index in &mut self.indexes {
            index.ensure_loaded()?;
        }
        Ok(())
    }

    /// Release star data of file-backed indices; returns how many were released.
    pub fn unload_all(&mut self) -> usize {
        self.indexes.iter_mut().map(Index::unload).filter(|&released| released).count()
    }

    /// Slots of the indices whose quad sizes overlap `quad_range_arcsec` and,
    /// when `region` is given, whose sky cell reaches into it. Selected
    /// indices are loaded.
    pub fn select_suitable(
        &mut self,
        quad_range_arcsec: (f64, f64),
        region: Option<&SkyDisc>,
    ) -> Result<Vec<usize>, SolverError> {
        let (lower, upper) = quad_range_arcsec;
        let by_scale: Vec<usize> = self
            .indexes
            .iter()
            .enumerate()
            .filter(|(_, i)| i.meta.overlaps_quad_scale(lower, upper))
            .map(|(slot, _)| slot)
            .collect();
        if by_scale.is_empty() {
            return Err(SolverError::NoSuitableScale { lower, upper });
        }

        let selected: Vec<usize> = match region {
            None => by_scale,
            Some(disc) => by_scale
                .into_iter()
                .filter(|&slot| {
                    self.indexes[slot]
                        .meta
                        .is_within_range(disc.ra, disc.dec, disc.radius)
                })
                .collect(),
        };
        if selected.is_empty() {
            return Err(SolverError::NoSuitableSkyCoverage);
        }

        for &slot in &selected {
            let index = &mut self.indexes[slot];
            index.ensure_loaded()?;
            log::info!(
                "adding index {} (quads {:.1}..{:.1} arcsec)",
                index.meta.name,
                rad_to_arcsec(index.meta.scale_lower),
                rad_to_arcsec(index.meta.scale_upper)
            );
        }
        Ok(selected)
    }

    /// Store every index's metadata as JSON.
    pub fn write_cache(&self, path: &Path) -> Result<(), IndexError> {
        let metas: Vec<&IndexMetadata> = self.indexes.iter().map(|i| &i.meta).collect();
        let json = serde_json::to_string_pretty(&metas).map_err(|e| IndexError::Corrupt {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        fs::write(path, json).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })
    }

    /// A metadata-only catalog restored from [`IndexCatalog::write_cache`]
    /// output. Duplicates are dropped as in `load_metadata`.
    pub fn from_cache(path: &Path) -> Result<Self, IndexError> {
        let text = fs::read_to_string(path).map_err(|source| IndexError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let metas: Vec<IndexMetadata> =
            serde_json::from_str(&text).map_err(|e| IndexError::Corrupt {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })?;
        let mut catalog = IndexCatalog::new();
        for meta in metas {
            catalog.add(Index::from_metadata(meta));
        }
        Ok(catalog)
    }

    /// Files backing the catalog's indices, in slot order.
    pub fn paths(&self) -> Vec<PathBuf> {
        self.indexes
            .iter()
            .filter_map(|i| i.meta.path.clone())
            .collect()
    }

    /// Distinct tag-along schemas across the catalog.
    pub fn tag_along_schemas(&self) -> HashSet<Vec<String>> {
        self.indexes.iter().map(|i| i.meta.tag_along.clone()).collect()
    }
}

impl FromIterator<Index> for IndexCatalog {
    fn from_iter<T: IntoIterator<Item = Index>>(iter: T) -> Self {
        let mut catalog = IndexCatalog::new();
        for index in iter {
            catalog.add(index);
        }
        catalog
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_index;

    fn saved(dir: &Path, name: &str, index: &Index) -> PathBuf {
        let path = dir.join(name);
        index.save(&path).unwrap();
        path
    }

    #[test]
    fn duplicates_are_loaded_once() {
        let dir = tempfile::tempdir().unwrap();
        let a = saved(dir.path(), "a.idx", &sample_index(1, 0, 0));
        let b = saved(dir.path(), "b.idx", &sample_index(1, 0, 0));
        let c = saved(dir.path(), "c.idx", &sample_index(2, 0, 0));

        let catalog = IndexCatalog::load_metadata(&[&a, &b, &c]);
        assert_eq!(catalog.len(), 2);
        assert_eq!(catalog.get(0).unwrap().meta.name, "a");
        assert_eq!(catalog.keys(), vec![(1, 0, 0), (2, 0, 0)]);
        assert!(catalog.iter().all(|i| !i.is_loaded()));
    }

    #[test]
    fn unreadable_files_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let good = saved(dir.path(), "good.idx", &sample_index(1, 0, 0));
        let junk = dir.path().join("junk.idx");
        fs::write(&junk, b"junk").unwrap();
        let missing = dir.path().join("missing.idx");

        let catalog = IndexCatalog::load_metadata(&[junk, missing, good]);
        assert_eq!(catalog.len(), 1);
        assert_eq!(catalog.get(0).unwrap().meta.name, "good");
    }

    #[test]
    fn ensure_loaded_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved(dir.path(), "a.idx", &sample_index(1, 0, 0));
        let mut catalog = IndexCatalog::load_metadata(&[path]);
        catalog.ensure_loaded(0).unwrap();
        catalog.ensure_loaded(0).unwrap();
        assert!(catalog.get(0).unwrap().is_loaded());
        assert_eq!(catalog.unload_all(), 1);
        assert!(!catalog.get(0).unwrap().is_loaded());
        catalog.load_all().unwrap();
        assert!(catalog.get(0).unwrap().is_loaded());
    }

    #[test]
    fn selection_distinguishes_scale_from_sky_coverage() {
        let index = sample_index(1, 17, 8);
        let lo = rad_to_arcsec(index.meta.scale_lower);
        let hi = rad_to_arcsec(index.meta.scale_upper);
        let (ra, dec) = crate::healpix::cell_center(17, 8);
        let mut catalog: IndexCatalog = std::iter::once(index).collect();

        assert!(matches!(
            catalog.select_suitable((hi * 2.0, hi * 3.0), None),
            Err(SolverError::NoSuitableScale { .. })
        ));
        let far = SkyDisc::new(ra + std::f64::consts::PI, -dec, 0.01);
        assert!(matches!(
            catalog.select_suitable((lo, hi), Some(&far)),
            Err(SolverError::NoSuitableSkyCoverage)
        ));
        let near = SkyDisc::new(ra, dec, 0.01);
        assert_eq!(catalog.select_suitable((lo, hi), Some(&near)).unwrap(), vec![0]);
        assert_eq!(catalog.select_suitable((lo, hi), None).unwrap(), vec![0]);
    }

    #[test]
    fn selection_loads_chosen_indices() {
        let dir = tempfile::tempdir().unwrap();
        let path = saved(dir.path(), "a.idx", &sample_index(1, 0, 0));
        let mut catalog = IndexCatalog::load_metadata(&[path]);
        let meta = catalog.get(0).unwrap().meta.clone();
        let range = (rad_to_arcsec(meta.scale_lower), rad_to_arcsec(meta.scale_upper));
        catalog.select_suitable(range, None).unwrap();
        assert!(catalog.get(0).unwrap().is_loaded());
    }

    #[test]
    fn metadata_cache_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let a = saved(dir.path(), "a.idx", &sample_index(1, 0, 0));
        let b = saved(dir.path(), "b.idx", &sample_index(2, 17, 8));
        let catalog = IndexCatalog::load_metadata(&[a, b]);

        let cache = dir.path().join("cache.json");
        catalog.write_cache(&cache).unwrap();
        let mut restored = IndexCatalog::from_cache(&cache).unwrap();
        assert_eq!(restored.keys(), catalog.keys());
        assert_eq!(restored.paths(), catalog.paths());
        assert_eq!(restored.tag_along_schemas().len(), 1);
        restored.load_all().unwrap();
        assert_eq!(
            restored.get(1).unwrap().data().unwrap().stars.len(),
            restored.get(1).unwrap().meta.n_stars
        );
    }
}
