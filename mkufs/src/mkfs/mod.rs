//! The format engine.
//!
//! [`Mkfs`] owns the device, the superblock being computed, the per-group
//! summary vector, and the scratch buffers reused across cylinder groups.
//! [`Mkfs::run`] drives the whole format: geometry solving, cylinder group
//! initialization, root directory construction, superblock and recovery
//! block emission.

use std::time::{SystemTime, UNIX_EPOCH};

use rand_core::{OsRng, RngCore};

use crate::{
	data::*,
	device::Device,
	error::{Error, Result},
};

mod cg;
mod geom;
mod root;
mod sb;

/// Everything that tunes a format run. The zero value of a numeric knob
/// means "derive the default"; `metaspace` keeps the historic three-valued
/// convention (0 unset, -1 explicitly disabled, positive in fragments).
#[derive(Debug, Clone)]
pub struct Config {
	/// Filesystem format: 1 => UFS1, 2 => UFS2.
	pub version:       u8,
	/// Path shown in the summary output.
	pub device:        String,
	/// Device size in bytes.
	pub mediasize:     i64,
	/// Filesystem size in sectors; 0 derives it from `mediasize`.
	pub fssize:        i64,
	/// Reserved sectors at the end of the device.
	pub reserved:      i64,
	pub fsize:         i32,
	pub bsize:         i32,
	/// Maximum extent size.
	pub maxbsize:      i32,
	/// Maximum blocks per cylinder group.
	pub maxblkspercg:  i32,
	/// Maximum contiguous blocks.
	pub maxcontig:     i32,
	/// Maximum blocks per file in a cylinder group.
	pub maxbpg:        i32,
	/// Minimum free space percentage.
	pub minfree:       i32,
	/// Space to hold for metadata blocks.
	pub metaspace:     i32,
	/// Bytes per inode.
	pub density:       i32,
	/// FS_OPTSPACE or FS_OPTTIME.
	pub optim:         i32,
	pub avgfilesize:   i32,
	pub avgfilesperdir: i32,
	/// Volume label, already validated.
	pub label:         Option<String>,
	/// Enable soft updates.
	pub softdep:       bool,
	/// Enable soft updates journaling (implies soft updates).
	pub suj:           bool,
	/// Enable journaling via gjournal.
	pub gjournal:      bool,
	/// Enable multilabel MAC.
	pub multilabel:    bool,
	/// Enable TRIM.
	pub trim:          bool,
	/// Do not create the `.snap` directory.
	pub nosnap:        bool,
	/// Suppress random factors for regression testing.
	pub regression:    bool,
	/// Erase previous disk contents.
	pub erase:         bool,
	/// Exit in the middle of the format for testing.
	pub xstage:        u32,
	/// gid of the `operator` group, when the host can resolve it.
	pub operator_gid:  Option<u32>,
	/// Columns available for the backup superblock listing.
	pub line_width:    usize,
}

impl Default for Config {
	fn default() -> Self {
		Self {
			version:        2,
			device:         String::new(),
			mediasize:      0,
			fssize:         0,
			reserved:       0,
			fsize:          0,
			bsize:          0,
			maxbsize:       0,
			maxblkspercg:   MAXBLKSPERCG,
			maxcontig:      0,
			maxbpg:         0,
			minfree:        MINFREE,
			metaspace:      0,
			density:        0,
			optim:          FS_OPTTIME,
			avgfilesize:    AVFILESIZ,
			avgfilesperdir: AFPDIR,
			label:          None,
			softdep:        false,
			suj:            false,
			gjournal:       false,
			multilabel:     false,
			trim:           false,
			nosnap:         false,
			regression:     false,
			erase:          false,
			xstage:         0,
			operator_gid:   None,
			line_width:     80,
		}
	}
}

pub struct Mkfs {
	dev:     Device,
	cfg:     Config,
	sb:      Superblock,
	/// Per-group summary, written at `fs_csaddr`.
	fscs:    Vec<Csum>,
	/// Cylinder group scratch, `fs_cgsize` bytes, reused across groups.
	acg:     Vec<u8>,
	/// Two blocks worth of inode I/O space.
	iobuf:   Vec<u8>,
	utime:   UfsTime,
	nextgen: u32,
}

impl Mkfs {
	pub fn new(dev: Device, cfg: Config) -> Self {
		Self {
			dev,
			cfg,
			sb: Superblock::zeroed(),
			fscs: Vec::new(),
			acg: Vec::new(),
			iobuf: Vec::new(),
			utime: 0,
			nextgen: 1,
		}
	}

	pub fn superblock(&self) -> &Superblock {
		&self.sb
	}

	pub fn summary(&self) -> &[Csum] {
		&self.fscs
	}

	/// The run time stamped into the filesystem.
	pub fn runtime(&self) -> UfsTime {
		self.utime
	}

	/// 32-bit words for inode generations and the filesystem id. An
	/// incrementing counter under regression mode, the OS entropy source
	/// otherwise.
	fn random(&mut self) -> u32 {
		if self.cfg.regression {
			let n = self.nextgen;
			self.nextgen += 1;
			n
		} else {
			OsRng.next_u32()
		}
	}

	fn v1(&self) -> bool {
		self.cfg.version == 1
	}

	/// Format the device.
	pub fn run(&mut self) -> Result<()> {
		let sector = self.dev.sectorsize();

		if self.cfg.fsize <= 0 {
			self.cfg.fsize = DFL_FRAGSIZE.max(sector);
		}
		if self.cfg.bsize <= 0 {
			self.cfg.bsize = DFL_BLKSIZE.min(8 * self.cfg.fsize);
		}
		// soft updates are the default for UFS2
		if self.cfg.version > 1 || self.cfg.suj {
			self.cfg.softdep = true;
		}
		if self.cfg.fssize == 0 {
			self.cfg.fssize = self.cfg.mediasize / sector as i64 - self.cfg.reserved;
		}

		self.utime = if self.cfg.regression {
			1_000_000_000
		} else {
			now()
		};

		self.sb.old_flags = FS_FLAGS_UPDATED as u8 as i8;
		self.sb.flags = 0;
		if self.cfg.softdep {
			self.sb.flags |= FS_DOSOFTDEP;
		}
		if let Some(label) = &self.cfg.label {
			self.sb.volname = [0; MAXVOLLEN];
			self.sb.volname[..label.len().min(MAXVOLLEN - 1)]
				.copy_from_slice(&label.as_bytes()[..label.len().min(MAXVOLLEN - 1)]);
		}
		if self.cfg.gjournal {
			self.sb.flags |= FS_GJOURNAL;
		}
		if self.cfg.multilabel {
			self.sb.flags |= FS_MULTILABEL;
		}
		if self.cfg.trim {
			self.sb.flags |= FS_TRIM;
		}

		// Validate the given file system size and verify that its last
		// sector can actually be accessed.
		if self.cfg.fssize <= 0 {
			return Err(Error::PreposterousSize(self.cfg.fssize));
		}
		let probe = vec![0u8; sector as usize];
		self.dev
			.wtfs(self.cfg.fssize - (sector / DEV_BSIZE) as i64, &probe)?;

		self.sb.avgfilesize = self.cfg.avgfilesize as u32;
		self.sb.avgfpdir = self.cfg.avgfilesperdir as u32;
		if self.cfg.avgfilesize <= 0 {
			return Err(Error::AvgFileSize(self.cfg.avgfilesize));
		}
		if self.cfg.avgfilesperdir <= 0 {
			return Err(Error::AvgFilesPerDir(self.cfg.avgfilesperdir));
		}

		let mut retried = false;
		loop {
			self.solve()?;
			if !self.write_fs()? {
				// dry run or a -X stage exit
				return Ok(());
			}
			if self.sb.cgsize_struct() <= self.sb.bsize as usize {
				return Ok(());
			}

			// This should NOT happen.
			log::error!(
				"INTERNAL ERROR: ipg {}, fpg {}, contigsumsize {}, CGSIZE {}",
				self.sb.ipg,
				self.sb.fpg,
				self.sb.contigsumsize,
				self.sb.cgsize_struct()
			);
			log::error!("Please file a bug report and include this output");
			if retried {
				return Err(Error::Internal(format!(
					"cylinder group map ({} bytes) does not fit a block even after retry",
					self.sb.cgsize_struct()
				)));
			}
			retried = true;
			self.cfg.maxblkspercg = self.sb.fragstoblks(self.sb.fpg as i64) as i32 - 1;
			self.cfg.density = 0;
		}
	}

	/// Emit every on-disk structure for the solved geometry. Returns false
	/// when the run stopped early on purpose (dry run, `-X`).
	fn write_fs(&mut self) -> Result<bool> {
		const MB: f64 = 1024.0 * 1024.0;
		let sb = &self.sb;
		println!(
			"{}: {:.1}MB ({} sectors) block size {}, fragment size {}",
			self.cfg.device,
			sb.size as f64 * sb.fsize as f64 / MB,
			sb.fsbtodb(sb.size),
			sb.bsize,
			sb.fsize
		);
		println!(
			"\tusing {} cylinder groups of {:.2}MB, {} blks, {} inodes.",
			sb.ncg,
			sb.fpg as f64 * sb.fsize as f64 / MB,
			sb.fpg / sb.frag,
			sb.ipg
		);
		if sb.flags & FS_DOSOFTDEP != 0 {
			println!("\twith soft updates");
		}

		if self.cfg.erase && !self.dev.dryrun() {
			// Device erase is left to the operator's tooling.
			log::debug!("ignoring erase request");
		}

		// Mark the filesystem incompletely initialized until every group
		// and the root directory are on disk.
		if !self.dev.dryrun() {
			self.sbwrite(false)?;
		}
		if self.cfg.xstage == 1 {
			println!("** Exiting on Xflag 1");
			return Ok(false);
		}
		if self.cfg.xstage == 2 {
			println!("** Leaving BAD MAGIC on Xflag 2");
		} else {
			self.sb.magic = if self.v1() {
				FS_UFS1_MAGIC
			} else {
				FS_UFS2_MAGIC
			};
		}

		self.acg = vec![0u8; self.sb.cgsize as usize];
		self.iobuf = vec![0u8; 2 * self.sb.bsize as usize];

		// Write out all the cylinder groups and backup superblocks, and
		// print the indices of the backups.
		println!("super-block backups (for fsck_ffs -b #) at:");
		let width = self.cfg.line_width.max(1);
		let mut line = String::new();
		for cylno in 0..self.sb.ncg as i64 {
			if !self.dev.dryrun() {
				self.initcg(cylno)?;
			}
			let sep = if cylno < self.sb.ncg as i64 - 1 { "," } else { "" };
			let tok = format!(" {}{}", self.sb.fsbtodb(self.sb.cgsblock(cylno)), sep);
			if line.len() + tok.len() >= width {
				println!("{line}");
				line.clear();
			}
			line.push_str(&tok);
		}
		println!("{line}");
		if self.dev.dryrun() {
			return Ok(false);
		}

		// Now construct the initial file system, then write out the
		// real super-block.
		self.fsinit()?;
		if self.v1() {
			self.sb.old_cstotal.ndir = self.sb.cstotal.ndir as i32;
			self.sb.old_cstotal.nbfree = self.sb.cstotal.nbfree as i32;
			self.sb.old_cstotal.nifree = self.sb.cstotal.nifree as i32;
			self.sb.old_cstotal.nffree = self.sb.cstotal.nffree as i32;
		}
		if self.cfg.xstage == 3 {
			println!("** Exiting on Xflag 3");
			return Ok(false);
		}
		self.sbwrite(false)?;

		// For UFS1 filesystems with a blocksize of 64K, the first
		// alternate superblock resides at the location used for the
		// default UFS2 superblock, and the boot code will trust it.
		// Keep its statistics correct.
		if self.v1() && self.sb.bsize == 65536 {
			let saved = self.sb.sblockactualloc;
			self.sb.sblockactualloc =
				self.sb.fsbtodb(self.sb.cgsblock(0)) * self.dev.sectorsize() as i64;
			self.sbwrite(false)?;
			self.sb.sblockactualloc = saved;
		}

		self.fsrecovery()?;
		Ok(true)
	}
}

fn now() -> UfsTime {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.map(|d| d.as_secs() as i64)
		.unwrap_or(0)
}
