pub mod config;
pub mod dispatcher;
pub mod registry;

pub use config::DispatchConfig;
pub use dispatcher::Dispatcher;
pub use registry::HandlerRegistry;
