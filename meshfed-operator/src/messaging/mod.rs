//! Event bus connecting member connectors with the federation reconciler.
//!
//! - [`Broker`]: rate-limited ingress queue with per-kind fan-out
//! - [`Message`]: a bus message, tagged with a [`MessageKind`]

mod broker;
mod message;

pub use broker::{Broker, BrokerStatsSnapshot, Subscription};
pub use message::{Message, MessageKind};
