//! Matching and distortion engines.
//!
//! The solve pipeline talks to two narrow seams: a [`MatchingEngine`] that
//! turns a bright-star field into a verified linear solution, and a
//! [`DistortionEngine`] that fits SIP terms to an existing match. The
//! shipped implementations are [`QuadMatcher`] and [`SipRefiner`].

pub mod fitting;
pub mod matcher;
pub mod quads;
pub mod refine;
pub mod verify;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::error::SolverError;
use crate::field::FieldStar;
use crate::geom::{Handedness, SipWcs, SkyDisc, TanWcs};
use crate::index::{Index, IndexKey};

pub use fitting::FitError;
pub use matcher::{QuadMatcher, QuadMatcherConfig};
pub use quads::DIMQUADS;
pub use refine::SipRefiner;
pub use verify::{ReferenceStar, VerifyConfig};

/// Image parity constraint for a solve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Parity {
    Normal,
    Flipped,
    #[default]
    Unknown,
}

impl Parity {
    pub fn accepts(self, handedness: Handedness) -> bool {
        match self {
            Parity::Unknown => true,
            Parity::Normal => handedness == Handedness::Normal,
            Parity::Flipped => handedness == Handedness::Flipped,
        }
    }
}

impl TryFrom<i32> for Parity {
    type Error = SolverError;

    /// 0 normal, 1 flipped, 2 unknown.
    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Parity::Normal),
            1 => Ok(Parity::Flipped),
            2 => Ok(Parity::Unknown),
            other => Err(SolverError::InvalidParity(other)),
        }
    }
}

impl From<Handedness> for Parity {
    fn from(h: Handedness) -> Self {
        match h {
            Handedness::Normal => Parity::Normal,
            Handedness::Flipped => Parity::Flipped,
        }
    }
}

/// Everything a matching engine needs for one attempt.
pub struct MatchRequest<'a> {
    /// Bright subset of the field, brightest first.
    pub field: &'a [FieldStar],
    pub image_size: (f64, f64),
    pub indexes: &'a [&'a Index],
    /// Plate scale bounds, arcseconds per pixel.
    pub scale_range_arcsec: (f64, f64),
    /// Quad diameters to try, pixels.
    pub quad_size_range_pix: (f64, f64),
    pub parity: Parity,
    /// Solutions must center inside this disc when set.
    pub position: Option<SkyDisc>,
    pub log_odds_accept: f64,
}

/// Field and index stars of the quad that produced a match.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct QuadMatch {
    /// Positions within the matched field.
    pub field_indices: [usize; DIMQUADS],
    /// Positions within the index's star list.
    pub index_indices: [usize; DIMQUADS],
}

/// Match counts of a verified solution.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct MatchCounts {
    pub matched: usize,
    pub conflict: usize,
    pub distractor: usize,
}

/// A verified solution.
#[derive(Debug, Clone, PartialEq)]
pub struct MatchResult {
    /// Which index matched. Engines report its position within
    /// `MatchRequest::indexes`; the session stores its `IndexCatalog` slot.
    pub index_slot: usize,
    pub index_name: String,
    pub index_key: IndexKey,
    pub wcs: TanWcs,
    pub log_odds: f64,
    pub counts: MatchCounts,
    /// Per field star, the position in `refs` it matched.
    pub theta: Vec<Option<usize>>,
    pub match_odds: Vec<f64>,
    pub refs: Vec<ReferenceStar>,
    pub quad: QuadMatch,
    /// SIP model once distortion has been fitted.
    pub distortion: Option<SipWcs>,
}

impl MatchResult {
    pub fn handedness(&self) -> Handedness {
        Handedness::from_determinant(self.wcs.determinant())
    }
}

pub trait MatchingEngine {
    /// Search for a solution accepted at `request.log_odds_accept`.
    fn run(&self, request: &MatchRequest<'_>) -> Option<MatchResult>;
}

/// Inputs for a distortion fit around an accepted solution.
pub struct RefineRequest<'a> {
    pub wcs: &'a TanWcs,
    /// The full prepared field.
    pub field: &'a [FieldStar],
    pub index: &'a Index,
    /// Combined positional noise, arcseconds.
    pub jitter_arcsec: f64,
    pub order: usize,
    pub inverse_order: usize,
    pub iterations: usize,
    /// Weight correspondences by their residual.
    pub weighted: bool,
}

/// A fitted distortion model and the rescored match it implies.
#[derive(Debug, Clone, PartialEq)]
pub struct Refinement {
    pub sip: SipWcs,
    pub log_odds: f64,
    pub counts: MatchCounts,
    pub theta: Vec<Option<usize>>,
    pub match_odds: Vec<f64>,
    pub refs: Vec<ReferenceStar>,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum RefineError {
    #[error("only {found} reference stars matched, at least {required} needed")]
    TooFewMatches { found: usize, required: usize },

    #[error("polynomial order {order} exceeds the supported {max}")]
    UnsupportedOrder { order: usize, max: usize },

    #[error("index {0} has no star data loaded")]
    IndexNotLoaded(String),

    #[error(transparent)]
    Fit(#[from] FitError),
}

pub trait DistortionEngine {
    fn refine(&self, request: &RefineRequest<'_>) -> Result<Refinement, RefineError>;
}
