pub mod config;
pub mod handler;
pub mod pending;
mod peer;
pub mod state;

pub use config::{
    ConfigUpdate,
    HeartbeatConfig,
    PeerConfig,
    ReconnectPolicy,
    WebSocketConfig,
};
pub use handler::{
    Event,
    EventHandler,
    Invocation,
    ProcedureHandler,
};
pub use peer::{
    Peer,
    PeerStats,
    Publication,
    PublishedEvent,
    RegisterOptions,
    Registration,
    RpcCall,
    RpcResult,
    SubscribeOptions,
    Subscription,
};
pub use state::SessionState;
