//! Core shared types for stream processing
//!
//! - `Direction`: which side of a tracked flow a segment travels on
//! - `StreamSegment`: a chunk of reassembled bytes handed to a protocol

pub mod packet;

pub use packet::{Direction, StreamSegment};
