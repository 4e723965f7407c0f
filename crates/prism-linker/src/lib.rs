//! Conversation linker: derives conversation identity, branch labels, and
//! sub-task parentage from message-history hashes.
//!
//! Everything here is deterministic: the same request always produces the
//! same hashes. The only side channel is read queries through the
//! [`link::LinkStore`] trait.

pub mod error;
pub mod hash;
pub mod link;

pub use error::{LinkError, Result};
pub use link::{link, Linkage, LinkStore, PriorRequest, TaskMatch};
