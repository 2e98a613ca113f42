//! Core wire types for docwire.
//!
//! This crate provides the protocol types shared by the connection layer
//! (`docwire-connection`) and anything else that needs to speak the wire
//! format without owning a socket.
//!
//! ## Modules
//!
//! - [`error`]: Connection error kinds and the error type
//! - [`codec`]: Compressor trait and implementations
//! - [`compression`]: Compressor configuration and negotiation
//! - [`framing`]: Message and compressed headers
//! - [`message`]: Command encoding and reply parsing
//! - [`document`]: Document encoders, decoders and command inspection
//! - [`address`]: Server addresses

mod address;
mod codec;
mod compression;
mod document;
mod error;
mod framing;
mod message;

pub use address::*;
pub use codec::*;
pub use compression::*;
pub use document::*;
pub use error::*;
pub use framing::*;
pub use message::*;

pub use bson;
