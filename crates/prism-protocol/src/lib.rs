//! Wire types for the Anthropic Messages API as seen by the proxy.
//!
//! The proxy never rewrites bodies, so these types are projections: they
//! expose the fields the proxy inspects (roles, content blocks, usage,
//! streaming events) while preserving everything else verbatim for
//! forwarding and storage.

pub mod messages;
pub mod sse;
pub mod usage;

pub use messages::{ContentBlock, Message, MessagesRequest, ToolCall};
pub use usage::Usage;
