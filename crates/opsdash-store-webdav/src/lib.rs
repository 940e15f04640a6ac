//! WebDAV backend: the document is a remote file, versioned by the server's ETag.

mod store;

pub use store::{WebDavConfig, WebDavStore};
