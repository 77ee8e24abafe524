//! Error taxonomy for solve sessions.
//!
//! A solve that simply finds no match is not an error; it is reported as
//! `Ok(false)` by the solve entry points.

use thiserror::Error;

use crate::config::PolicyError;
use crate::engine::RefineError;
use crate::index::IndexError;

/// Broad class of a [`SolverError`], for callers deciding whether a retry
/// with different input can help.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Caller input rejected outright; nothing was changed.
    Configuration,
    /// Operation invoked in the wrong session state.
    Precondition,
    /// The source list cannot support a solve.
    DataQuality,
    /// No index covers the requested scale or sky region.
    Coverage,
    /// The distortion engine could not produce a result.
    Engine,
    /// Index files or their auxiliary columns could not be used.
    Catalog,
}

#[derive(Error, Debug)]
pub enum SolverError {
    #[error("invalid parity value {0}; expected 0 (normal), 1 (flipped) or 2 (unknown)")]
    InvalidParity(i32),

    #[error("minimum image scale {min} arcsec/pixel must be below maximum {max}")]
    ScaleOrdering { min: f64, max: f64 },

    #[error("image scale must be finite and positive, got {0}")]
    InvalidScale(f64),

    #[error("scale uncertainty must be within (0, 100) percent, got {0}")]
    InvalidScaleUncertainty(f64),

    #[error("invalid log level {0}; expected 0..=4")]
    InvalidLogLevel(i32),

    #[error("number of bright objects must be positive")]
    InvalidBrightLimit,

    #[error("image size must be finite and positive, got {width} x {height}")]
    InvalidImageSize { width: f64, height: f64 },

    #[error("invalid position: RA {ra} deg, Dec {dec} deg")]
    InvalidPosition { ra: f64, dec: f64 },

    #[error("search radius must be finite and non-negative, got {0} arcsec")]
    InvalidSearchRadius(f64),

    #[error("no source list has been set")]
    FieldNotSet,

    #[error("no index files are loaded")]
    NoIndexLoaded,

    #[error("the field is already solved; reset the session first")]
    AlreadySolved,

    #[error("no solution is available; solve the field first")]
    NotSolved,

    #[error("a solve is in progress")]
    SolveInProgress,

    #[error("source list contains no objects")]
    EmptySourceList,

    #[error("source list should contain at least {required} objects, got {found}")]
    TooFewSources { found: usize, required: usize },

    #[error("source list only has {valid} valid objects, needs {required}")]
    TooFewValidSources { valid: usize, required: usize },

    #[error("sources span {width} x {height} pixels; set the image size or supply a two-dimensional field")]
    DegenerateFieldExtent { width: f64, height: f64 },

    #[error("SIP order {order} is not supported; at most {max}")]
    InvalidSipOrder { order: usize, max: usize },

    #[error("no index covers quad sizes {lower:.1}..{upper:.1} arcsec")]
    NoSuitableScale { lower: f64, upper: f64 },

    #[error("indices cover the requested scale but none overlaps the requested sky region")]
    NoSuitableSkyCoverage,

    #[error("distortion refinement failed: {0}")]
    Refinement(#[from] RefineError),

    #[error(transparent)]
    Index(#[from] IndexError),

    #[error(transparent)]
    Policy(#[from] PolicyError),
}

impl SolverError {
    pub fn kind(&self) -> ErrorKind {
        use SolverError::*;
        match self {
            InvalidParity(_)
            | ScaleOrdering { .. }
            | InvalidScale(_)
            | InvalidScaleUncertainty(_)
            | InvalidLogLevel(_)
            | InvalidBrightLimit
            | InvalidImageSize { .. }
            | InvalidPosition { .. }
            | InvalidSearchRadius(_)
            | InvalidSipOrder { .. }
            | Policy(_) => ErrorKind::Configuration,
            FieldNotSet | NoIndexLoaded | AlreadySolved | NotSolved | SolveInProgress => {
                ErrorKind::Precondition
            }
            EmptySourceList
            | TooFewSources { .. }
            | TooFewValidSources { .. }
            | DegenerateFieldExtent { .. } => ErrorKind::DataQuality,
            NoSuitableScale { .. } | NoSuitableSkyCoverage => ErrorKind::Coverage,
            Refinement(_) => ErrorKind::Engine,
            Index(_) => ErrorKind::Catalog,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_counts() {
        let err = SolverError::TooFewValidSources {
            valid: 12,
            required: 20,
        };
        assert_eq!(err.to_string(), "source list only has 12 valid objects, needs 20");
        assert_eq!(err.kind(), ErrorKind::DataQuality);
    }

    #[test]
    fn coverage_reasons_are_distinct() {
        let scale = SolverError::NoSuitableScale {
            lower: 1.0,
            upper: 2.0,
        };
        let sky = SolverError::NoSuitableSkyCoverage;
        assert_eq!(scale.kind(), ErrorKind::Coverage);
        assert_eq!(sky.kind(), ErrorKind::Coverage);
        assert_ne!(scale.to_string(), sky.to_string());
    }

    #[test]
    fn refinement_failures_are_engine_errors() {
        let err: SolverError = RefineError::TooFewMatches { found: 2, required: 6 }.into();
        assert_eq!(err.kind(), ErrorKind::Engine);
        assert_eq!(SolverError::AlreadySolved.kind(), ErrorKind::Precondition);
        assert_eq!(SolverError::InvalidParity(7).kind(), ErrorKind::Configuration);
    }
}
