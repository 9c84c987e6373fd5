// Decompression used by patch formats.
//
// - `bits`: MSB-first bit reader
// - `bzip2`: self-contained bzip2 stream decoder (BDF patches carry three
//   bzip2 streams)

pub mod bits;
pub mod bzip2;

pub use bzip2::{Bzip2Error, decompress};
