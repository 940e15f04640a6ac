//! Local filesystem backend: the document is a single JSON file on disk and
//! its version token is the file's modification time.

mod store;

pub use store::LocalStore;
