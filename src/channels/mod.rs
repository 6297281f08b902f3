//! Channel subscription multiplexing: local subscriber sets bridged to the
//! distributed backplane.

pub mod multiplexer;
pub mod topics;

pub use multiplexer::{ChannelMultiplexer, DeliveryFn};
pub use topics::{PrefixTopics, TopicScheme};
