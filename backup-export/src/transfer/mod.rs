//! Byte transfer plumbing between blocking writers and async uploads.

pub mod conduit;
pub mod progress_stream;

pub use conduit::{conduit, settle, AbortGuard, ByteStream, Completion, ConduitWriter};
pub use progress_stream::ProgressStream;
