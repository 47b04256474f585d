//! Fixed-layout serialization of the on-disk structures.
//!
//! UFS writes its structures in host byte order; everything this engine
//! emits uses the little-endian fixed-width layout the FreeBSD kernel
//! expects on little-endian machines.

use bincode::{
	config::{Configuration, Fixint, LittleEndian, NoLimit},
	Decode, Encode,
};

use crate::error::{Error, Result};

const DISK: Configuration<LittleEndian, Fixint, NoLimit> = bincode::config::standard()
	.with_fixed_int_encoding()
	.with_little_endian();

/// Encode `val` into the front of `buf`, returning the number of bytes
/// written. The buffer keeps its tail, so encoding a header into a larger
/// map buffer leaves the maps alone.
pub fn encode<T: Encode>(val: &T, buf: &mut [u8]) -> Result<usize> {
	bincode::encode_into_slice(val, buf, DISK).map_err(|e| Error::Codec(e.to_string()))
}

/// Decode a `T` from the front of `buf`.
pub fn decode<T: Decode>(buf: &[u8]) -> Result<T> {
	bincode::decode_from_slice(buf, DISK)
		.map(|(v, _)| v)
		.map_err(|e| Error::Codec(e.to_string()))
}
