//! RPC Transport Module
//!
//! Node-to-node calls over HTTP/2 with bincode bodies.
//!
//! ## Client side
//! - **`channel`**: one multiplexed connection to a `host:port`, with a size cap.
//! - **`pool`**: N channels per target, round-robin, rebuilt when shut down.
//! - **`factory`**: M pools per target, built lazily and cached.
//! - **`stub`**: service bindings in blocking, callback or future style.
//!
//! ## Server side
//! - **`registry`**: unique service names mapped to their routers.
//! - **`server`**: the single listening endpoint and its thread pool.
//! - **`protocol`**: paths, codec and the `Rpc<T>` body type shared by both.

pub mod channel;
pub mod factory;
pub mod pool;
pub mod protocol;
pub mod registry;
pub mod server;
pub mod stub;

pub use channel::{Channel, ChannelOptions, ChannelState};
pub use factory::ClientFactory;
pub use pool::ChannelPool;
pub use protocol::Rpc;
pub use registry::{RpcService, ServiceRegistry};
pub use server::RpcServer;
pub use stub::{RpcFuture, RpcStub, ServiceStub, StubFlavor};
