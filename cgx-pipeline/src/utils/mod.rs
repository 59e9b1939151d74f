//! Utility modules for the pipeline service

pub mod retry;
pub mod vector_codec;

pub use retry::{retry_on_lock, retry_transient, Backoff};
pub use vector_codec::{decode_vector, encode_vector, VectorCodecError};
