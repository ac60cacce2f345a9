//! Wire protocol between metadata clients and servers: primitive
//! serialization helpers plus the framed message codec built on them.

pub mod bits;
pub mod message;

pub use message::{Decoder, Encoder, Message, TagAllocator};
