// VCDIFF building blocks (RFC 3284).
//
// - `varint`: big-endian base-128 integers
// - `address_cache`: NEAR/SAME COPY address cache
// - `code_table`: the default 256-entry instruction table
// - `header`: file and window headers
// - `decoder`: window parsing and reconstruction
// - `encoder`: window assembly from ADD/RUN/COPY instructions
//
// The patch-level codec that strings windows together is
// `crate::formats::vcdiff`.

pub mod address_cache;
pub mod code_table;
pub mod decoder;
pub mod encoder;
pub mod header;
pub mod varint;

pub use decoder::Window;
pub use encoder::WindowEncoder;
pub use header::{FileHeader, VCDIFF_MAGIC, WindowHeader};
