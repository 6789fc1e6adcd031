//! Core domain types for the builder.
//!
//! Repositories, builds, and per-ref enqueue state are plain records that refer
//! to each other through explicit id fields.

pub mod build;
pub mod ids;
pub mod ref_state;
pub mod repository;

pub use build::{Build, BuildStatus, BuildTrigger, NewBuild};
pub use ids::{BuildId, PrNumber, RepositoryId, Sha};
pub use ref_state::{RefKey, RefState};
pub use repository::{NewRepository, Repository};
