//! sblite realtime hub: Phoenix-protocol channels over WebSocket with
//! broadcast, presence and postgres-changes fan-out.
//!
//! The daemon owns the sockets; this crate owns channel state and delivery
//! semantics. Connections carry a bounded send queue so one slow consumer
//! never stalls the rest of a channel.

pub mod channel;
pub mod filter;
pub mod hub;
pub mod presence;
pub mod protocol;

pub use crate::channel::{Channel, Subscription};
pub use crate::filter::ChangeFilter;
pub use crate::hub::{Conn, Hub, HubError, JoinAck, SEND_QUEUE_CAPACITY};
pub use crate::protocol::{ClientEvent, JoinPayload, PhoenixMessage, PHOENIX_TOPIC};
