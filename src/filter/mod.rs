//! Noise filtering shared by every metric: who counts as a contributor and
//! which repositories count at all.

pub mod identity;
pub mod scope;

pub use identity::{normalize_identity, IdentityFilter};
pub use scope::{RepositoryDescriptor, ScopeQualifier};
