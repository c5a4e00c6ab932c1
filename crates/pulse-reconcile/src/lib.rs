pub mod extract;
pub mod http;
pub mod memory;
pub mod reconciler;

pub use extract::{extract_candidate, ResponseCandidate};
pub use http::HttpRecordSink;
pub use memory::MemorySink;
pub use reconciler::FirstResponseReconciler;
