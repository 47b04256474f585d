//! Layout and initialization engine for FreeBSD's UFS1/UFS2 filesystems.
//!
//! Given a device and a [`Config`], [`Mkfs`] computes a self-consistent
//! superblock, initializes every cylinder group and its bitmaps, builds
//! the root directory, and emits the primary superblock, its backups, and
//! the boot-area recovery record.

pub mod bitmap;
pub mod codec;
pub mod crc32c;
pub mod data;
mod device;
mod error;
mod mkfs;

pub use crate::{
	device::Device,
	error::{Error, Result},
	mkfs::{Config, Mkfs},
};
