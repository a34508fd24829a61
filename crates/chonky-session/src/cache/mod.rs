//! Caches owned by or attached to the session.
//!
//! - `ProfileCache`: the last-fetched principal, cleared with the session
//! - `PrincipalCache`: per-principal application data (e.g. a cart),
//!   purged when that principal's session ends

pub mod principal;
pub mod profile;

pub use principal::{CachedData, PrincipalCache};
pub use profile::ProfileCache;
