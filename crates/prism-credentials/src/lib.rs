//! Per-domain credential management for the proxy.
//!
//! Each virtual host maps to a descriptor file in the credentials directory.
//! This crate owns descriptor loading and caching, upstream auth material
//! (API key or OAuth with proactive refresh), timing-safe verification of
//! client keys, and account-pool selection with sticky routing.

pub mod descriptor;
pub mod error;
pub mod manager;
pub mod pool;
pub mod verify;

pub use descriptor::{CredentialDescriptor, CredentialKind, OAuthCredentials, PoolMembers};
pub use error::{CredentialError, Result};
pub use manager::{AuthMaterial, CredentialManager};
pub use pool::{select_account, PoolError, StickyMap};
