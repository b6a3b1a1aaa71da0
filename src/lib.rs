//! The client-side channel runtime of a gRPC-style RPC stack: name
//! resolution, subchannel connectivity, load balancing, and the per-call
//! filter/stream machinery that turns a picked subchannel into an RPC.
//!
//! Message (de)serialization, generated service stubs, and the server
//! side are all external collaborators -- this crate only gets a call as
//! far as a framed byte stream over a picked subchannel.

pub mod backoff;
pub mod call;
pub mod channel;
pub mod codec;
pub mod connectivity;
pub mod credentials;
#[doc(hidden)]
pub mod error;
pub mod filters;
pub mod load_balancer;
pub mod metadata;
pub mod resolver;
pub mod resolving_load_balancer;
pub mod service_config;
pub mod status;
pub mod subchannel;
pub mod subchannel_pool;
pub mod target;
pub mod transport;

pub use call::CallStream;
pub use channel::{Channel, ChannelOptions};
pub use connectivity::{ConnectivityState, PickResult};
pub use credentials::{CallCredentials, ConnectionOptions, Credentials, Insecure, Tls};
pub use error::Error;
pub use metadata::{MetadataMap, MetadataValue};
pub use resolving_load_balancer::ResolvingLoadBalancer;
pub use status::{Code, Status};
pub use subchannel::{KeepaliveConfig, Subchannel};
pub use target::Target;
