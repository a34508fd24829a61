//! Data models shared between the session core and its consumers.
//!
//! - `Principal`, `PrincipalId`, `Role`: the signed-in identity
//! - `ProfileUpdate`: request body for editing the profile

pub mod principal;

pub use principal::{PictureUpload, Principal, PrincipalId, ProfileUpdate, Role};
