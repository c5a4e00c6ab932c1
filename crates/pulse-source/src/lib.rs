pub mod backoff;
pub mod channel;
pub mod config;
pub mod decode;
pub mod http;
pub mod mock;
pub mod transport;

pub use channel::ChannelSource;
pub use config::SourceConfig;
pub use http::HttpTransport;
pub use transport::{PollTransport, PushSubscription, PushTransport, RawMessage};
