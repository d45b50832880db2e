mod channel;
mod message;
mod store;

pub use channel::{ChannelManager, ChannelStats, DeliveryHandler};
pub use message::{generate_message_id, now_millis, SignalKind, SignalingMessage};
pub use store::{MessageStore, DEFAULT_MESSAGE_MAX_AGE, MAX_CHANNEL_MESSAGES};
