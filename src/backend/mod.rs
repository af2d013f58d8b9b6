//! Compute backend selection
//!
//! Turns a hardware profile and the policy table into an ordered list of
//! candidates, then walks it until one backend loads the model. Every candidate
//! is attempted at most once per load and CPU always terminates the walk.

mod candidate;
mod history;
mod selector;

pub use candidate::{BackendCandidate, BackendPlan, CandidateList, ComputeBackend, PlanReason};
pub use history::{BackendHistory, HistoryError, HISTORY_FILE};
pub use selector::{BackendSelector, LoadedBackend, EMBEDDING_ORDER};
