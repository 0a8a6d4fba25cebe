//! Multi-perspective review.
//!
//! ## Components
//!
//! - [`consensus`]: reviewer roles, concerns and the iterative consensus protocol
//! - [`panel`]: command-backed reviewers and the review [`PhaseHandler`](crate::phase::PhaseHandler)
//!
//! ## Example
//!
//! ```
//! use cadence::review::{Concern, ConsensusManager, ReviewerOutput, ReviewerRole};
//! use cadence::config::ConsensusSection;
//! use cadence::logging::Logger;
//!
//! let manager = ConsensusManager::new(&ConsensusSection::default(), Logger::disabled());
//! let outputs = vec![
//!     ReviewerOutput::approve(ReviewerRole::TechLead),
//!     ReviewerOutput::reject(ReviewerRole::Security, vec![Concern::blocking("token in URL")]),
//!     ReviewerOutput::approve(ReviewerRole::ProductOwner),
//! ];
//! assert!(!manager.is_reached(&outputs));
//! ```

pub mod consensus;
pub mod panel;

pub use consensus::{
    Concern, ConsensusManager, ConsensusResult, ReviewerOutput, ReviewerRole, RoundContext,
    RoundExecutor, SharedConcern, UnresolvedConcern,
};
pub use panel::{CommandRoundExecutor, ConsensusReviewHandler, outcome_from_consensus};
