pub mod cursors;
pub mod database;
pub mod dead_letters;
pub mod error;
pub mod schema;

pub use cursors::{CursorRepo, ReplayCursor};
pub use database::Database;
pub use dead_letters::{DeadLetterRepo, DeadLetterRow};
pub use error::StoreError;
