//! External collaborator interfaces
//!
//! Media-server polling, recognition and the search/download pipeline live
//! outside this crate; these traits are the seams the scheduler calls.

pub mod discovery;
pub mod gaps;
pub mod recognizer;
pub mod search;

pub use discovery::{DiscoveryFeed, DiscoveryFilters};
pub use gaps::{GapCalculator, MissingEpisodes, SeasonGap};
pub use recognizer::{MediaIdentity, Recognizer, SeriesRef};
pub use search::{AttemptOutcome, SearchDownload};
