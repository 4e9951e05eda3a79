//! The archive pipeline: fetch a bookmark's page, extract metadata and article content,
//! download and localize its images, store a compressed snapshot and commit the archive.

pub mod localize;
pub mod rate_limiter;
pub mod service;
pub mod snapshot;

pub use localize::{localize_images, public_url};
pub use rate_limiter::{HostLimiter, HostPermit};
pub use service::{ArchiveOutcome, ArchiveService, ArchiveSummary};
