//! Candidate pool and tiered, airtime-gated catch-up scheduling

pub mod airtime;
pub mod filters;
pub mod guard;
pub mod merger;
pub mod model;
pub mod pins;
pub mod pool;
pub mod report;
pub mod scheduler;
pub mod store;
pub mod tier;

pub use airtime::{AirtimeGate, GateDecision, GateReason};
pub use guard::{RunPermit, SingleFlight};
pub use merger::{MergeReport, ObservationMerger};
pub use model::{CandidateEntry, CandidateKey, DiscoverySource, NextEpisodeHint, Observation, RawEpisodeEvent};
pub use pins::{KeyRule, PinRegistry, ServerSelector};
pub use pool::{CandidatePool, PoolOverview};
pub use report::{RunMode, RunReport};
pub use scheduler::{Collaborators, RunOutcome, Scheduler};
pub use store::CatchupStore;
pub use tier::{Tier, TierIntervals};
