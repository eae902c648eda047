//! In-process message channel for Weave components.
//!
//! Every participant (worker, orchestrator, reply address) owns a FIFO
//! mailbox keyed by id. Messages are delivered directly to one mailbox or
//! broadcast to every subscriber of a topic.
//!
//! # Main types
//!
//! - [`MessageChannel`]: Mailboxes, topic subscriptions, history, statistics.
//! - [`ChannelMessage`]: The envelope routed between mailboxes.
//! - [`MessageKind`]: Task, result, error, notification, question.

/// Mailbox channel with direct delivery and topic broadcast.
pub mod channel;
/// Message envelope types.
pub mod message;

pub use channel::{ChannelStatistics, MessageChannel, DEFAULT_HISTORY_LIMIT};
pub use message::{ChannelMessage, MessageKind};
