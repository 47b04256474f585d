use std::{fmt, io::Error as IoError};

pub type Result<T> = std::result::Result<T, Error>;

/// Everything that can stop a format run. Each kind maps to the process
/// exit status historically used for it, so scripts and tests keyed on
/// those stay working.
#[derive(Debug)]
pub enum Error {
	/// Device size is zero or negative.
	PreposterousSize(i64),
	/// `-g` must be positive.
	AvgFileSize(i32),
	/// `-h` must be positive.
	AvgFilesPerDir(i32),
	BlockSizeNotPow2(i32),
	FragSizeNotPow2(i32),
	/// More than MAXFRAG fragments per block after normalization.
	FragTooSmall(i32),
	/// The device cannot hold even one viable cylinder group.
	FilesystemTooSmall { size: i64, min: i64 },
	/// A cylinder group read back without its magic number.
	BadCgMagic { code: i32 },
	/// The computed maps spill out of the cylinder group block.
	CgTooBig { over: u32 },
	/// Group 0 has no free block left for the root directory.
	FirstCgFull,
	NoBlockInCg,
	/// An invariant the solver must uphold failed even after the retry.
	Internal(String),
	Codec(String),
	Io {
		op:     &'static str,
		code:   i32,
		source: Option<IoError>,
	},
}

impl Error {
	/// Process exit status for this error.
	pub fn code(&self) -> i32 {
		match self {
			Self::PreposterousSize(_) => 13,
			Self::AvgFileSize(_) => 14,
			Self::AvgFilesPerDir(_) => 15,
			Self::BlockSizeNotPow2(_) => 16,
			Self::FragSizeNotPow2(_) => 17,
			Self::FragTooSmall(_) => 21,
			Self::FilesystemTooSmall { .. } => 28,
			Self::BadCgMagic { code } => *code,
			Self::CgTooBig { .. } => 37,
			Self::FirstCgFull => 39,
			Self::NoBlockInCg => 40,
			Self::Internal(_) | Self::Codec(_) => 34,
			Self::Io { code, .. } => *code,
		}
	}

	/// Rebind the exit status of an I/O error to the caller's path.
	pub fn with_code(mut self, new: i32) -> Self {
		if let Self::Io { code, .. } = &mut self {
			*code = new;
		}
		self
	}

	pub(crate) fn io(op: &'static str) -> Self {
		Self::Io {
			op,
			code: 1,
			source: None,
		}
	}

	pub(crate) fn io_from(op: &'static str, source: IoError) -> Self {
		Self::Io {
			op,
			code: 1,
			source: Some(source),
		}
	}
}

impl fmt::Display for Error {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		match self {
			Self::PreposterousSize(sz) => write!(f, "preposterous size {sz}"),
			Self::AvgFileSize(n) => write!(f, "illegal expected average file size {n}"),
			Self::AvgFilesPerDir(n) => {
				write!(f, "illegal expected number of files per directory {n}")
			},
			Self::BlockSizeNotPow2(n) => {
				write!(f, "block size must be a power of 2, not {n}")
			},
			Self::FragSizeNotPow2(n) => {
				write!(f, "fragment size must be a power of 2, not {n}")
			},
			Self::FragTooSmall(n) => {
				write!(f, "fragment size {n} is still too small (can't happen)")
			},
			Self::FilesystemTooSmall { size, min } => {
				write!(f, "Filesystem size {size} < minimum size of {min}")
			},
			Self::BadCgMagic { .. } => write!(f, "cg 0: bad magic number"),
			Self::CgTooBig { over } => {
				write!(f, "Panic: cylinder group too big by {over} bytes")
			},
			Self::FirstCgFull => write!(f, "first cylinder group ran out of space"),
			Self::NoBlockInCg => write!(f, "internal error: can't find block in cyl 0"),
			Self::Internal(msg) => write!(f, "{msg}"),
			Self::Codec(msg) => write!(f, "codec error: {msg}"),
			Self::Io {
				op,
				source: Some(e),
				..
			} => write!(f, "{op}: {e}"),
			Self::Io { op, .. } => write!(f, "{op}"),
		}
	}
}

impl std::error::Error for Error {
	fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
		match self {
			Self::Io {
				source: Some(e), ..
			} => Some(e),
			_ => None,
		}
	}
}
