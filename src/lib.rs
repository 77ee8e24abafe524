//! Plate-solving orchestration.
//!
//! Astrosolve takes a list of detected sources, picks the reference indices
//! that can cover the requested plate scale and sky region, runs a pattern
//! matching engine against them and turns an accepted match into a WCS
//! (World Coordinate System) solution, optionally with SIP distortion, and
//! source-to-catalog correspondences.
//!
//! ```no_run
//! use astrosolve::{FieldStar, SolverPolicy, SolverSession};
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let policy = SolverPolicy::load("policy.json".as_ref())?;
//! let mut session = SolverSession::new(&policy);
//! let sources: Vec<FieldStar> = Vec::new();
//! session.set_field(&sources)?;
//! session.set_image_scale(1.2)?;
//! if session.solve_blind()? {
//!     let wcs = session.get_wcs()?;
//!     println!("center {:?}", wcs.center_deg());
//! }
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod crossmatch;
pub mod engine;
pub mod error;
pub mod field;
pub mod geom;
pub mod healpix;
pub mod index;
pub mod kdtree;
pub mod pipeline;
pub mod result;
pub mod session;

#[cfg(test)]
pub(crate) mod test_support;

pub use config::{set_log_level, RaDecSys, SkySystem, SolveConfig, SolverPolicy};
pub use crossmatch::{CatalogSource, ObservedSource, SourceMatch};
pub use engine::{
    DistortionEngine, MatchResult, MatchingEngine, Parity, QuadMatcher, SipRefiner,
};
pub use error::{ErrorKind, SolverError};
pub use field::{Field, FieldStar, PixelSource};
pub use index::{Index, IndexCatalog, IndexMetadata};
pub use result::{DistortedWcs, HeaderValue, SolvedWcs};
pub use session::{SolveState, SolverSession};
