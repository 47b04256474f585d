//! Positioned I/O on the target block device.
//!
//! Every transfer is a `pread`/`pwrite` at `bno * sectorsize`, so the file
//! offset never matters. Buffers that are not aligned to [`BUFALIGN`] are
//! staged through a freshly allocated aligned bounce buffer.

use std::{fs::File, os::unix::fs::FileExt};

use crate::error::{Error, Result};

/// Alignment the I/O subsystem requires of transfer buffers.
pub const BUFALIGN: usize = 128;

#[repr(C, align(128))]
#[derive(Clone, Copy)]
struct Chunk([u8; BUFALIGN]);

/// Aligned scratch living for the duration of one read or write.
struct Bounce {
	chunks: Vec<Chunk>,
	len:    usize,
}

impl Bounce {
	fn new(len: usize) -> Self {
		let chunks = vec![Chunk([0; BUFALIGN]); len.div_ceil(BUFALIGN)];
		Self { chunks, len }
	}

	fn as_slice(&self) -> &[u8] {
		unsafe { std::slice::from_raw_parts(self.chunks.as_ptr().cast(), self.len) }
	}

	fn as_mut_slice(&mut self) -> &mut [u8] {
		unsafe { std::slice::from_raw_parts_mut(self.chunks.as_mut_ptr().cast(), self.len) }
	}
}

fn aligned(buf: &[u8]) -> bool {
	buf.as_ptr() as usize & (BUFALIGN - 1) == 0
}

pub struct Device {
	file:   Option<File>,
	sector: i64,
	dryrun: bool,
}

impl Device {
	/// `file` may only be `None` in dry-run mode, where no I/O happens.
	pub fn new(file: Option<File>, sectorsize: i32, dryrun: bool) -> Self {
		Self {
			file,
			sector: sectorsize as i64,
			dryrun,
		}
	}

	pub fn sectorsize(&self) -> i32 {
		self.sector as i32
	}

	pub fn dryrun(&self) -> bool {
		self.dryrun
	}

	fn file(&self) -> Result<&File> {
		self.file
			.as_ref()
			.ok_or_else(|| Error::io("block device is not open"))
	}

	/// Read `buf.len()` bytes at sector `bno`. Anything short is an error.
	pub fn bread(&self, bno: i64, buf: &mut [u8]) -> Result<()> {
		let file = self.file()?;
		let off = (bno * self.sector) as u64;

		if aligned(buf) {
			return read_all(file, off, buf);
		}

		let mut bounce = Bounce::new(buf.len());
		read_all(file, off, bounce.as_mut_slice())?;
		buf.copy_from_slice(bounce.as_slice());
		Ok(())
	}

	/// Write `buf` at sector `bno`. Anything short is an error.
	pub fn bwrite(&self, bno: i64, buf: &[u8]) -> Result<()> {
		let file = self.file()?;
		let off = (bno * self.sector) as u64;

		if aligned(buf) {
			return write_all(file, off, buf);
		}

		let mut bounce = Bounce::new(buf.len());
		bounce.as_mut_slice().copy_from_slice(buf);
		write_all(file, off, bounce.as_slice())
	}

	/// Possibly write to disk: a no-op in dry-run mode. Failures here are
	/// always fatal to the format run.
	pub fn wtfs(&self, bno: i64, buf: &[u8]) -> Result<()> {
		if self.dryrun {
			return Ok(());
		}
		self.bwrite(bno, buf).map_err(|e| e.with_code(36))
	}
}

fn read_all(file: &File, off: u64, buf: &mut [u8]) -> Result<()> {
	match file.read_at(buf, off) {
		Err(e) => Err(Error::io_from("read error from block device", e)),
		Ok(0) => Err(Error::io("end of file from block device")),
		Ok(n) if n != buf.len() => {
			Err(Error::io("short read or read error from block device"))
		},
		Ok(_) => Ok(()),
	}
}

fn write_all(file: &File, off: u64, buf: &[u8]) -> Result<()> {
	match file.write_at(buf, off) {
		Err(e) => Err(Error::io_from("write error to block device", e)),
		Ok(n) if n != buf.len() => Err(Error::io("short write to block device")),
		Ok(_) => Ok(()),
	}
}

#[cfg(test)]
mod t {
	use std::io::Read;

	use super::*;

	const FSIZE: u64 = 1 << 20;

	fn harness() -> (tempfile::NamedTempFile, Device) {
		let f = tempfile::NamedTempFile::new().unwrap();
		f.as_file().set_len(FSIZE).unwrap();
		let file = File::options()
			.read(true)
			.write(true)
			.open(f.path())
			.unwrap();
		let dev = Device::new(Some(file), 512, false);
		(f, dev)
	}

	#[test]
	fn roundtrip() {
		let (_f, dev) = harness();
		let wbuf = vec![0x55u8; 4096];
		dev.bwrite(16, &wbuf).unwrap();
		let mut rbuf = vec![0u8; 4096];
		dev.bread(16, &mut rbuf).unwrap();
		assert_eq!(wbuf, rbuf);
	}

	#[test]
	fn misaligned_buffers_bounce() {
		let (_f, dev) = harness();
		let backing = vec![0xa7u8; 4097];
		// force a buffer that cannot be 128-byte aligned
		let wbuf = &backing[1..];
		dev.bwrite(4, wbuf).unwrap();

		let mut backing = vec![0u8; 4097];
		dev.bread(4, &mut backing[1..]).unwrap();
		assert_eq!(&backing[1..], vec![0xa7u8; 4096].as_slice());
	}

	#[test]
	fn short_read_fails() {
		let (_f, dev) = harness();
		let mut buf = vec![0u8; 4096];
		let last = (FSIZE / 512) as i64 - 1;
		let e = dev.bread(last, &mut buf).unwrap_err();
		assert_eq!(e.code(), 1);
	}

	#[test]
	fn dryrun_writes_nothing() {
		let f = tempfile::NamedTempFile::new().unwrap();
		f.as_file().set_len(FSIZE).unwrap();
		let dev = Device::new(None, 512, true);
		dev.wtfs(0, &[0xffu8; 512]).unwrap();

		let mut buf = [0u8; 512];
		f.as_file().read_exact(&mut buf).ok();
		assert_eq!(buf, [0u8; 512]);
	}
}
