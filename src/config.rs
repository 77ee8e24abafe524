//! Policy bundle and default solve configuration.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::engine::Parity;
use crate::error::SolverError;

/// Environment variable consulted for relative index paths when the policy
/// names no data directory.
pub const DATA_DIR_ENV: &str = "ASTROSOLVE_DATA_DIR";

/// Default minimum number of valid sources a field must hold.
pub const DEFAULT_MIN_FIELD_STARS: usize = 20;

#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("failed to read policy {}: {}", .path.display(), .source)]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse policy {}: {}", .path.display(), .source)]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Celestial reference frame attached to every WCS a session produces.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RaDecSys {
    #[default]
    Icrs,
    Fk5,
    Fk4,
}

impl RaDecSys {
    pub fn as_str(self) -> &'static str {
        match self {
            RaDecSys::Icrs => "ICRS",
            RaDecSys::Fk5 => "FK5",
            RaDecSys::Fk4 => "FK4",
        }
    }
}

/// Sky-system metadata fixed when a session is constructed.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SkySystem {
    pub equinox: f64,
    pub ra_dec_sys: RaDecSys,
}

impl Default for SkySystem {
    fn default() -> Self {
        SkySystem {
            equinox: 2000.0,
            ra_dec_sys: RaDecSys::Icrs,
        }
    }
}

/// Construction-time policy: sky system and the index files to load.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SolverPolicy {
    pub equinox: f64,
    pub ra_dec_sys: RaDecSys,
    pub index_files: Vec<PathBuf>,
    pub data_dir: Option<PathBuf>,
}

impl SolverPolicy {
    pub fn load(path: &Path) -> Result<Self, PolicyError> {
        let text = fs::read_to_string(path).map_err(|source| PolicyError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let mut policy: SolverPolicy =
            serde_json::from_str(&text).map_err(|source| PolicyError::Parse {
                path: path.to_path_buf(),
                source,
            })?;
        if policy.equinox == 0.0 {
            policy.equinox = SkySystem::default().equinox;
        }
        Ok(policy)
    }

    pub fn sky_system(&self) -> SkySystem {
        SkySystem {
            equinox: if self.equinox > 0.0 {
                self.equinox
            } else {
                SkySystem::default().equinox
            },
            ra_dec_sys: self.ra_dec_sys,
        }
    }

    /// Absolute paths are kept; relative ones resolve against `data_dir`,
    /// then `$ASTROSOLVE_DATA_DIR`, then the working directory.
    pub fn resolve_index_path(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            return path.to_path_buf();
        }
        match self
            .data_dir
            .clone()
            .or_else(|| env::var_os(DATA_DIR_ENV).map(PathBuf::from))
        {
            Some(dir) => dir.join(path),
            None => path.to_path_buf(),
        }
    }

    pub fn resolved_index_files(&self) -> Vec<PathBuf> {
        self.index_files
            .iter()
            .map(|p| self.resolve_index_path(p))
            .collect()
    }
}

/// Mutable per-session solve configuration.
///
/// Image scales are arcseconds per pixel. [`SolveConfig::default`] is the
/// value every session starts from and returns to on reset.
#[derive(Debug, Clone, PartialEq)]
pub struct SolveConfig {
    pub min_scale: f64,
    pub max_scale: f64,
    pub parity: Parity,
    /// Log-odds a match must reach to be accepted.
    pub match_threshold: f64,
    /// `(width, height)`; derived from the field extent when unset.
    pub image_size: Option<(f64, f64)>,
    /// Number of brightest sources handed to the matcher; `None` uses all.
    pub bright_limit: Option<usize>,
    pub min_field_stars: usize,
    /// Positional noise of the field sources, in pixels.
    pub field_jitter_pix: f64,
    /// Quad sizes searched, as fractions of the smaller image dimension.
    pub quad_size_fraction: (f64, f64),
    /// SIP order fitted right after a successful solve; 0 disables it.
    pub refine_order: usize,
    pub refine_iterations: usize,
}

impl Default for SolveConfig {
    fn default() -> Self {
        SolveConfig {
            min_scale: 1e-6,
            max_scale: 3600.0 * 360.0,
            parity: Parity::Unknown,
            match_threshold: 1e12_f64.ln(),
            image_size: None,
            bright_limit: None,
            min_field_stars: DEFAULT_MIN_FIELD_STARS,
            field_jitter_pix: 1.0,
            quad_size_fraction: (0.1, 1.0),
            refine_order: 2,
            refine_iterations: 5,
        }
    }
}

/// Map a 0..=4 verbosity onto the `log` facade's global maximum level.
pub fn set_log_level(level: i32) -> Result<(), SolverError> {
    let filter = match level {
        0 => LevelFilter::Off,
        1 => LevelFilter::Error,
        2 => LevelFilter::Info,
        3 => LevelFilter::Debug,
        4 => LevelFilter::Trace,
        other => return Err(SolverError::InvalidLogLevel(other)),
    };
    log::set_max_level(filter);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn default_threshold_is_ln_1e12() {
        let config = SolveConfig::default();
        assert!((config.match_threshold - 27.631).abs() < 1e-3);
        assert!(config.min_scale < config.max_scale);
        assert_eq!(config.parity, Parity::Unknown);
        assert_eq!(config.min_field_stars, 20);
    }

    #[test]
    fn policy_parses_and_resolves_relative_paths() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"equinox": 2000.0, "ra_dec_sys": "FK5",
                "index_files": ["a.idx", "/abs/b.idx"], "data_dir": "/data"}}"#
        )
        .unwrap();
        let policy = SolverPolicy::load(file.path()).unwrap();
        assert_eq!(policy.sky_system().ra_dec_sys, RaDecSys::Fk5);
        assert_eq!(
            policy.resolved_index_files(),
            vec![PathBuf::from("/data/a.idx"), PathBuf::from("/abs/b.idx")]
        );
    }

    #[test]
    fn missing_equinox_defaults_to_j2000() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"index_files": []}}"#).unwrap();
        let policy = SolverPolicy::load(file.path()).unwrap();
        assert_eq!(policy.sky_system(), SkySystem::default());
    }

    #[test]
    fn malformed_policy_is_a_parse_error() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "not json").unwrap();
        assert!(matches!(
            SolverPolicy::load(file.path()),
            Err(PolicyError::Parse { .. })
        ));
    }

    #[test]
    fn log_levels_outside_range_are_rejected() {
        assert!(set_log_level(3).is_ok());
        assert!(matches!(set_log_level(5), Err(SolverError::InvalidLogLevel(5))));
        assert!(set_log_level(-1).is_err());
    }
}
