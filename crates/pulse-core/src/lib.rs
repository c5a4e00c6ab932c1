pub mod errors;
pub mod event;
pub mod handler;
pub mod ids;
pub mod sink;
pub mod source;
pub mod state;
