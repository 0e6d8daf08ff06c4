//! # fanout-core
//!
//! Subscription multiplexing for the Fanout gateway.
//!
//! Many clients subscribe to named channels; the gateway holds one
//! subscription per channel on an upstream pub/sub bus and fans each
//! upstream message out to the clients that asked for it.
//!
//! - **Registry** - who is subscribed to what, and when to talk upstream
//! - **Session** - one client connection, from first frame to cleanup
//! - **Dispatch** - bus events to client frames
//! - **Bus** - the upstream adapters (Redis, in-memory)
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐ control ┌─────────────┐ subscribe ┌─────────────┐
//! │   Session   │────────▶│  Registry   │──────────▶│ UpstreamBus │
//! └─────────────┘         └─────────────┘           └─────────────┘
//!        ▲                       │ subscribers_of          │ events
//!        │ deliver        ┌─────────────┐                  │
//!        └────────────────│ Dispatcher  │◀─────────────────┘
//!                         └─────────────┘
//! ```

pub mod bus;
pub mod channel;
pub mod dispatch;
pub mod message;
pub mod registry;
pub mod retry;
pub mod session;

pub use bus::{BusError, BusEvent, BusEvents, MemoryBus, RedisBus, RedisConfig, UpstreamBus};
pub use channel::{ChannelId, ChannelInfo, ConnectionInfo};
pub use dispatch::{Dispatcher, FanOut};
pub use message::Message;
pub use registry::{ReconcileReport, Registry, RegistryConfig, RegistryError, RegistryStats};
pub use retry::RetryPolicy;
pub use session::{
    CloseReason, DeliveryOutcome, Outbound, OutboundReceiver, Session, SessionConfig,
    SessionState, SessionSummary,
};
