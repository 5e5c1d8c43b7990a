//! Chunked streaming of large values.
//!
//! Uploads are split into `[vint length][payload]` frames ending with a
//! zero-length frame. Downloads are read on demand, either against a
//! declared total length or by following the same frame format.

mod input;
mod output;

pub use input::{ChunkSource, ChunkedReader, ReceiverSource};
pub use output::{ChunkSink, ChunkedWriter};
