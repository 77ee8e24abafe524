//! Binary index file format.
//!
//! Little-endian throughout:
//!
//! ```text
//! magic "ASIX", version u32
//! index_id u32, healpix u64, nside u32
//! scale_lower f64, scale_upper f64, jitter_arcsec f64
//! n_stars u64, n_quads u64, n_columns u32, column names (u32 length + UTF-8)
//! stars    n_stars × (catalog_id u64, ra f64, dec f64)
//! quads    n_quads × 4 × u32
//! codes    n_quads × 4 × f64
//! columns  n_columns × n_stars × f64
//! ```
//!
//! Everything up to the column names is the metadata header, which can be
//! read without touching the star data.

use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::Path;

use crate::engine::quads::{Code, Quad, DIMCODES, DIMQUADS};

use super::{Index, IndexData, IndexError, IndexMetadata, IndexStar};

const MAGIC: &[u8; 4] = b"ASIX";
const VERSION: u32 = 1;
const MAX_COLUMN_NAME: u32 = 1024;

fn write_u32(w: &mut impl Write, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_u64(w: &mut impl Write, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn write_f64(w: &mut impl Write, v: f64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

fn read_u32(r: &mut impl Read) -> io::Result<u32> {
    let mut buf = [0u8; 4];
    r.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(r: &mut impl Read) -> io::Result<u64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

fn read_f64(r: &mut impl Read) -> io::Result<f64> {
    let mut buf = [0u8; 8];
    r.read_exact(&mut buf)?;
    Ok(f64::from_le_bytes(buf))
}

fn io_error(path: &Path) -> impl Fn(io::Error) -> IndexError + '_ {
    move |source| IndexError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn corrupt(path: &Path, reason: impl Into<String>) -> IndexError {
    IndexError::Corrupt {
        path: path.to_path_buf(),
        reason: reason.into(),
    }
}

fn open(path: &Path) -> Result<BufReader<File>, IndexError> {
    File::open(path).map(BufReader::new).map_err(io_error(path))
}

/// Parse the header, leaving the reader at the start of the star table.
fn read_header(r: &mut impl Read, path: &Path) -> Result<IndexMetadata, IndexError> {
    let io = io_error(path);
    let mut magic = [0u8; 4];
    r.read_exact(&mut magic).map_err(&io)?;
    if &magic != MAGIC {
        return Err(IndexError::BadMagic {
            path: path.to_path_buf(),
        });
    }
    let version = read_u32(r).map_err(&io)?;
    if version != VERSION {
        return Err(IndexError::UnsupportedVersion {
            path: path.to_path_buf(),
            version,
        });
    }

    let index_id = read_u32(r).map_err(&io)?;
    let healpix = read_u64(r).map_err(&io)?;
    let nside = read_u32(r).map_err(&io)?;
    let scale_lower = read_f64(r).map_err(&io)?;
    let scale_upper = read_f64(r).map_err(&io)?;
    let jitter_arcsec = read_f64(r).map_err(&io)?;
    let n_stars = read_u64(r).map_err(&io)?;
    let n_quads = read_u64(r).map_err(&io)?;
    let n_columns = read_u32(r).map_err(&io)?;

    let mut tag_along = Vec::new();
    for _ in 0..n_columns {
        let len = read_u32(r).map_err(&io)?;
        if len > MAX_COLUMN_NAME {
            return Err(corrupt(path, format!("column name of {len} bytes")));
        }
        let mut bytes = vec![0u8; len as usize];
        r.read_exact(&mut bytes).map_err(&io)?;
        let name = String::from_utf8(bytes).map_err(|_| corrupt(path, "column name is not UTF-8"))?;
        tag_along.push(name);
    }

    let name = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.display().to_string());
    Ok(IndexMetadata {
        index_id,
        healpix,
        nside,
        name,
        path: Some(path.to_path_buf()),
        scale_lower,
        scale_upper,
        jitter_arcsec,
        tag_along,
        n_stars: usize::try_from(n_stars).map_err(|_| corrupt(path, "star count overflows"))?,
        n_quads: usize::try_from(n_quads).map_err(|_| corrupt(path, "quad count overflows"))?,
    })
}

type Body = (Vec<IndexStar>, Vec<Quad>, Vec<Code>, BTreeMap<String, Vec<f64>>);

fn read_body(r: &mut impl Read, header: &IndexMetadata) -> io::Result<Body> {
    let mut stars = Vec::with_capacity(header.n_stars);
    for _ in 0..header.n_stars {
        stars.push(IndexStar {
            catalog_id: read_u64(r)?,
            ra: read_f64(r)?,
            dec: read_f64(r)?,
        });
    }

    let mut quads = Vec::with_capacity(header.n_quads);
    for _ in 0..header.n_quads {
        let mut star_ids = [0usize; DIMQUADS];
        for id in &mut star_ids {
            *id = read_u32(r)? as usize;
        }
        quads.push(Quad { star_ids });
    }

    let mut codes: Vec<Code> = Vec::with_capacity(header.n_quads);
    for _ in 0..header.n_quads {
        let mut code = [0.0; DIMCODES];
        for v in &mut code {
            *v = read_f64(r)?;
        }
        codes.push(code);
    }

    let mut columns = BTreeMap::new();
    for name in &header.tag_along {
        let mut values = Vec::with_capacity(header.n_stars);
        for _ in 0..header.n_stars {
            values.push(read_f64(r)?);
        }
        columns.insert(name.clone(), values);
    }
    Ok((stars, quads, codes, columns))
}

/// Read only the metadata header of an index file.
pub fn read_metadata(path: &Path) -> Result<IndexMetadata, IndexError> {
    let mut r = open(path)?;
    read_header(&mut r, path)
}

/// Read the star data of an index whose metadata is already known.
///
/// The header is re-read and must agree with `meta` on identity and counts.
pub fn read_data(path: &Path, meta: &IndexMetadata) -> Result<IndexData, IndexError> {
    let mut r = open(path)?;
    let header = read_header(&mut r, path)?;
    if header.key() != meta.key() || header.n_stars != meta.n_stars || header.n_quads != meta.n_quads {
        return Err(corrupt(path, "file changed since its metadata was read"));
    }

    let (stars, quads, codes, columns) = read_body(&mut r, &header).map_err(io_error(path))?;
    if let Some(quad) = quads
        .iter()
        .find(|q| q.star_ids.iter().any(|&id| id >= stars.len()))
    {
        return Err(corrupt(path, format!("quad {:?} refers past the star table", quad.star_ids)));
    }
    Ok(IndexData::new(stars, quads, codes, columns))
}

fn write_index(path: &Path, meta: &IndexMetadata, data: &IndexData) -> io::Result<()> {
    let mut w = BufWriter::new(File::create(path)?);
    w.write_all(MAGIC)?;
    write_u32(&mut w, VERSION)?;
    write_u32(&mut w, meta.index_id)?;
    write_u64(&mut w, meta.healpix)?;
    write_u32(&mut w, meta.nside)?;
    write_f64(&mut w, meta.scale_lower)?;
    write_f64(&mut w, meta.scale_upper)?;
    write_f64(&mut w, meta.jitter_arcsec)?;
    write_u64(&mut w, data.stars.len() as u64)?;
    write_u64(&mut w, data.quads.len() as u64)?;
    write_u32(&mut w, meta.tag_along.len() as u32)?;
    for name in &meta.tag_along {
        write_u32(&mut w, name.len() as u32)?;
        w.write_all(name.as_bytes())?;
    }

    for star in &data.stars {
        write_u64(&mut w, star.catalog_id)?;
        write_f64(&mut w, star.ra)?;
        write_f64(&mut w, star.dec)?;
    }
    for quad in &data.quads {
        for &id in &quad.star_ids {
            write_u32(&mut w, id as u32)?;
        }
    }
    for code in &data.codes {
        for &v in code {
            write_f64(&mut w, v)?;
        }
    }
    for name in &meta.tag_along {
        let values = data.tag_along.get(name).map(Vec::as_slice).unwrap_or(&[]);
        for i in 0..data.stars.len() {
            write_f64(&mut w, values.get(i).copied().unwrap_or(f64::NAN))?;
        }
    }
    w.flush()
}

impl Index {
    /// Write a loaded index to `path`.
    pub fn save(&self, path: &Path) -> Result<(), IndexError> {
        let data = self
            .data()
            .ok_or_else(|| IndexError::NoBackingFile(self.meta.name.clone()))?;
        write_index(path, &self.meta, data).map_err(io_error(path))?;
        log::debug!(
            "wrote index {} ({} stars, {} quads) to {}",
            self.meta.name,
            data.stars.len(),
            data.quads.len(),
            path.display()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::sample_index;

    #[test]
    fn metadata_is_readable_without_star_data() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample-01.idx");
        let index = sample_index(3, 17, 8);
        index.save(&path).unwrap();

        let opened = Index::open(&path).unwrap();
        assert!(!opened.is_loaded());
        assert_eq!(opened.meta.name, "sample-01");
        assert_eq!(opened.meta.key(), (3, 17, 8));
        assert_eq!(opened.meta.n_stars, index.meta.n_stars);
        assert_eq!(opened.meta.tag_along, vec!["mag".to_string()]);
        assert_eq!(opened.meta.scale_upper, index.meta.scale_upper);
    }

    #[test]
    fn saved_index_loads_identically() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.idx");
        let index = sample_index(1, 0, 0);
        index.save(&path).unwrap();

        let mut opened = Index::open(&path).unwrap();
        let loaded = opened.ensure_loaded().unwrap();
        let original = index.data().unwrap();
        assert_eq!(loaded.stars, original.stars);
        assert_eq!(loaded.quads, original.quads);
        assert_eq!(loaded.tag_along, original.tag_along);
        assert_eq!(loaded.code_tree.len(), original.code_tree.len());

        assert!(opened.unload());
        assert!(!opened.is_loaded());
        assert!(opened.ensure_loaded().is_ok());
    }

    #[test]
    fn foreign_and_truncated_files_are_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let foreign = dir.path().join("foreign.idx");
        std::fs::write(&foreign, b"SIMPLE  =                    T").unwrap();
        assert!(matches!(read_metadata(&foreign), Err(IndexError::BadMagic { .. })));

        let path = dir.path().join("cut.idx");
        sample_index(1, 0, 0).save(&path).unwrap();
        let bytes = std::fs::read(&path).unwrap();
        std::fs::write(&path, &bytes[..bytes.len() / 2]).unwrap();
        let meta = read_metadata(&path).unwrap();
        assert!(matches!(read_data(&path, &meta), Err(IndexError::Io { .. })));

        let missing = dir.path().join("missing.idx");
        assert!(matches!(read_metadata(&missing), Err(IndexError::Io { .. })));
    }

    #[test]
    fn newer_versions_are_refused() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("v9.idx");
        let mut bytes = MAGIC.to_vec();
        bytes.extend_from_slice(&9u32.to_le_bytes());
        std::fs::write(&path, bytes).unwrap();
        assert!(matches!(
            read_metadata(&path),
            Err(IndexError::UnsupportedVersion { version: 9, .. })
        ));
    }
}
