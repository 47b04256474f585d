//! Geometry solver: derive a fully populated, self-consistent superblock
//! from the device size and the tuning knobs.
//!
//! The block size, fragment size, and inode density chase each other: the
//! cylinder group map (CGSIZE) must fit a single block with CGSIZEFUDGE to
//! spare, every group must meet the bytes-per-inode density, and the last
//! group must stay viable. Density falls in `fsize` steps until the map
//! fits; if the density cannot be met at all, both sizes double and the
//! whole computation starts over.

use super::*;

enum Pass {
	Done,
	/// Block size too small for a filesystem of this size; sizes doubled.
	Restart,
}

impl Mkfs {
	pub(super) fn solve(&mut self) -> Result<()> {
		loop {
			match self.layout()? {
				Pass::Done => return Ok(()),
				Pass::Restart => continue,
			}
		}
	}

	fn layout(&mut self) -> Result<Pass> {
		let sector = self.dev.sectorsize();

		// collect and verify the block and fragment sizes
		self.sb.bsize = self.cfg.bsize;
		self.sb.fsize = self.cfg.fsize;
		if !powerof2(self.sb.bsize as i64) {
			return Err(Error::BlockSizeNotPow2(self.sb.bsize));
		}
		if !powerof2(self.sb.fsize as i64) {
			return Err(Error::FragSizeNotPow2(self.sb.fsize));
		}
		if self.sb.fsize < sector {
			log::warn!(
				"increasing fragment size from {} to sector size ({})",
				self.sb.fsize,
				sector
			);
			self.sb.fsize = sector;
		}
		if self.sb.bsize > MAXBSIZE {
			log::warn!(
				"decreasing block size from {} to maximum ({})",
				self.sb.bsize,
				MAXBSIZE
			);
			self.sb.bsize = MAXBSIZE;
		}
		if self.sb.bsize < MINBSIZE {
			log::warn!(
				"increasing block size from {} to minimum ({})",
				self.sb.bsize,
				MINBSIZE
			);
			self.sb.bsize = MINBSIZE;
		}
		if self.sb.fsize > MAXBSIZE {
			log::warn!(
				"decreasing fragment size from {} to maximum ({})",
				self.sb.fsize,
				MAXBSIZE
			);
			self.sb.fsize = MAXBSIZE;
		}
		if self.sb.bsize < self.sb.fsize {
			log::warn!(
				"increasing block size from {} to fragment size ({})",
				self.sb.bsize,
				self.sb.fsize
			);
			self.sb.bsize = self.sb.fsize;
		}
		if self.sb.fsize * (MAXFRAG as i32) < self.sb.bsize {
			log::warn!(
				"increasing fragment size from {} to block size / {} ({})",
				self.sb.fsize,
				MAXFRAG,
				self.sb.bsize / MAXFRAG as i32
			);
			self.sb.fsize = self.sb.bsize / MAXFRAG as i32;
		}

		if self.cfg.maxbsize == 0 {
			self.cfg.maxbsize = self.cfg.bsize;
		}
		if self.cfg.maxbsize < self.cfg.bsize || !powerof2(self.cfg.maxbsize as i64) {
			self.sb.maxbsize = self.sb.bsize;
			log::warn!("Extent size set to {}", self.sb.maxbsize);
		} else if self.cfg.maxbsize > FS_MAXCONTIG * self.sb.bsize {
			self.sb.maxbsize = FS_MAXCONTIG * self.sb.bsize;
			log::warn!("Extent size reduced to {}", self.sb.maxbsize);
		} else {
			self.sb.maxbsize = self.cfg.maxbsize;
		}

		// Maxcontig sets the default for the maximum number of blocks
		// that may be allocated sequentially.
		if self.cfg.maxcontig == 0 {
			self.cfg.maxcontig = 1.max(MAXPHYS / self.cfg.bsize);
		}
		self.sb.maxcontig = self.cfg.maxcontig;
		if self.sb.maxcontig < self.sb.maxbsize / self.sb.bsize {
			self.sb.maxcontig = self.sb.maxbsize / self.sb.bsize;
			log::warn!("Maxcontig raised to {}", self.sb.maxbsize);
		}
		if self.sb.maxcontig > 1 {
			self.sb.contigsumsize = self.sb.maxcontig.min(FS_MAXCONTIG);
		}

		self.sb.bmask = !(self.sb.bsize - 1);
		self.sb.fmask = !(self.sb.fsize - 1);
		self.sb.qbmask = !(self.sb.bmask as i64);
		self.sb.qfmask = !(self.sb.fmask as i64);
		self.sb.bshift = ilog2(self.sb.bsize as i64);
		self.sb.fshift = ilog2(self.sb.fsize as i64);
		self.sb.frag = self.sb.numfrags(self.sb.bsize as i64) as i32;
		self.sb.fragshift = ilog2(self.sb.frag as i64);
		if self.sb.frag > MAXFRAG as i32 {
			return Err(Error::FragTooSmall(self.sb.bsize / MAXFRAG as i32));
		}
		self.sb.fsbtodb = ilog2((self.sb.fsize / sector) as i64);
		self.sb.size = self.sb.dbtofsb(self.cfg.fssize);
		self.sb.providersize = self.sb.dbtofsb(self.cfg.mediasize / sector as i64);

		// Before the filesystem is finally initialized, mark it as
		// incompletely initialized.
		self.sb.magic = FS_BAD_MAGIC;

		if self.v1() {
			self.sb.sblockloc = SBLOCK_UFS1 as i64;
			self.sb.sblockactualloc = SBLOCK_UFS1 as i64;
			self.sb.nindir = self.sb.bsize / 4;
			self.sb.inopb = (self.sb.bsize as usize / UFS1_INOSZ) as u32;
			self.sb.maxsymlinklen = ((UFS_NDADDR + UFS_NIADDR) * 4) as i32;
			self.sb.old_inodefmt = FS_44INODEFMT;
			self.sb.old_cgoffset = 0;
			self.sb.old_cgmask = !0;
			self.sb.old_size = self.sb.size as i32;
			self.sb.old_rotdelay = 0;
			self.sb.old_rps = 60;
			self.sb.old_nspf = self.sb.fsize / sector;
			self.sb.old_cpg = 1;
			self.sb.old_interleave = 1;
			self.sb.old_trackskew = 0;
			self.sb.old_cpc = 0;
			self.sb.old_postblformat = 1;
			self.sb.old_nrpos = 1;
		} else {
			self.sb.sblockloc = SBLOCK_UFS2 as i64;
			self.sb.sblockactualloc = SBLOCK_UFS2 as i64;
			self.sb.nindir = self.sb.bsize / 8;
			self.sb.inopb = (self.sb.bsize as usize / UFS2_INOSZ) as u32;
			self.sb.maxsymlinklen = ((UFS_NDADDR + UFS_NIADDR) * 8) as i32;
		}
		self.sb.sblkno = roundup(
			howmany(self.sb.sblockloc + SBLOCKSIZE as i64, self.sb.fsize as i64),
			self.sb.frag as i64,
		) as i32;
		self.sb.cblkno = self.sb.sblkno
			+ roundup(
				howmany(SBLOCKSIZE as i64, self.sb.fsize as i64),
				self.sb.frag as i64,
			) as i32;
		self.sb.iblkno = self.sb.cblkno + self.sb.frag;

		self.sb.maxfilesize = (self.sb.bsize as u64) * UFS_NDADDR as u64 - 1;
		let mut sizepb = self.sb.bsize as u64;
		for _ in 1..=UFS_NIADDR {
			sizepb *= self.sb.nindir as u64;
			self.sb.maxfilesize += sizepb;
		}

		// It's impossible to create a snapshot in case fs_maxfilesize
		// is smaller than the filesystem size.
		if self.sb.maxfilesize < self.sb.size as u64 {
			log::warn!(
				"WARNING: You will be unable to create snapshots on this file system. \
				 Correct by using a larger blocksize."
			);
		}

		// Calculate the number of blocks to put into each cylinder group.
		//
		// The first goal is to have at least enough data blocks in each
		// cylinder group to meet the density requirement. Once this goal
		// is achieved we try to expand to have at least MINCYLGRPS
		// cylinder groups. Once this goal is achieved, we pack as many
		// blocks into each cylinder group map as will fit.
		let maxinum = (1i64 << 32) - self.sb.inopb as i64;
		let minfragsperinode = 1 + self.sb.size / maxinum;
		if self.cfg.density == 0 {
			self.cfg.density = (NFPI as i64).max(minfragsperinode) as i32 * self.cfg.fsize;
		} else if (self.cfg.density as i64) < minfragsperinode * self.cfg.fsize as i64 {
			let orig = self.cfg.density;
			self.cfg.density = (minfragsperinode * self.cfg.fsize as i64) as i32;
			log::warn!("density increased from {} to {}", orig, self.cfg.density);
		}
		let origdensity = self.cfg.density;

		// Start by calculating the smallest number of blocks that fits
		// each cylinder group; if this is too big, reduce the density
		// until it fits.
		let fragsperinode = loop {
			let fragsperinode = self.sb.numfrags(self.cfg.density as i64).max(1);
			if fragsperinode < minfragsperinode {
				self.cfg.bsize <<= 1;
				self.cfg.fsize <<= 1;
				log::warn!(
					"Block size too small for a file system of this size. \
					 Increasing blocksize to {}",
					self.cfg.bsize
				);
				return Ok(Pass::Restart);
			}
			let minfpg = (fragsperinode * self.sb.inopb as i64).min(self.sb.size);
			self.sb.ipg = self.sb.inopb;
			self.sb.fpg = self.min_fpg();
			if (self.sb.fpg as i64) < minfpg {
				self.sb.fpg = minfpg as i32;
			}
			self.sb.ipg = self.ipg_for(fragsperinode);
			self.sb.fpg = self.min_fpg();
			if (self.sb.fpg as i64) < minfpg {
				self.sb.fpg = minfpg as i32;
			}
			self.sb.ipg = self.ipg_for(fragsperinode);
			if self.sb.cgsize_struct() < self.sb.bsize as usize - CGSIZEFUDGE {
				break fragsperinode;
			}
			self.cfg.density -= self.sb.fsize;
		};
		if self.cfg.density != origdensity {
			log::warn!(
				"density reduced from {} to {}",
				origdensity,
				self.cfg.density
			);
		}

		// Start packing more blocks into the cylinder group until it
		// cannot grow any larger, the number of cylinder groups drops
		// below MINCYLGRPS, or we reach the size requested. For UFS1,
		// inodes per group are stored in an int16_t, so fs_ipg is
		// limited to 2^15 - 1.
		while self.sb.fpg < self.cfg.maxblkspercg {
			self.sb.ipg = self.ipg_for(fragsperinode);
			if self.cfg.version > 1 || self.sb.ipg <= 0x7fff {
				if self.sb.size / (self.sb.fpg as i64) < MINCYLGRPS {
					break;
				}
				if self.sb.cgsize_struct() < self.sb.bsize as usize - CGSIZEFUDGE {
					self.sb.fpg += self.sb.frag;
					continue;
				}
				if self.sb.cgsize_struct() == self.sb.bsize as usize - CGSIZEFUDGE {
					break;
				}
			}
			self.sb.fpg -= self.sb.frag;
			self.sb.ipg = self.ipg_for(fragsperinode);
			break;
		}

		// Check that the last cylinder group has enough blocks to be
		// viable. If it is too small, move more blocks into it by
		// shrinking the others.
		let optimalfpg = self.sb.fpg;
		loop {
			self.sb.ncg = howmany(self.sb.size, self.sb.fpg as i64) as u32;
			let lastminfpg = self.min_fpg() as i64;
			if self.sb.size < lastminfpg {
				return Err(Error::FilesystemTooSmall {
					size: self.sb.size,
					min:  lastminfpg,
				});
			}
			let rem = self.sb.size % self.sb.fpg as i64;
			if rem >= lastminfpg || rem == 0 {
				break;
			}
			self.sb.fpg -= self.sb.frag;
			self.sb.ipg = self.ipg_for(fragsperinode);
		}
		if optimalfpg != self.sb.fpg {
			log::info!(
				"Reduced frags per cylinder group from {} to {} to enlarge last cyl group",
				optimalfpg,
				self.sb.fpg
			);
		}

		self.finish_sb();
		self.fscs = vec![Csum::default(); self.sb.ncg as usize];
		Ok(Pass::Done)
	}

	/// Inodes needed to meet the density over the current group size,
	/// rounded up to whole inode blocks.
	fn ipg_for(&self, fragsperinode: i64) -> u32 {
		roundup(
			howmany(self.sb.fpg as i64, fragsperinode),
			self.sb.inopb as i64,
		) as u32
	}

	/// Smallest group that can hold its own metadata.
	fn min_fpg(&self) -> i32 {
		roundup(
			self.sb.iblkno as i64 + self.sb.ipg as i64 / self.sb.inopf(),
			self.sb.frag as i64,
		) as i32
	}

	/// Fill in the remaining fields of the super block.
	fn finish_sb(&mut self) {
		let utime = self.utime;
		let rnd = self.random();
		let sb = &mut self.sb;
		let cfg = &self.cfg;

		sb.cgsize = sb.fragroundup(sb.cgsize_struct() as i64) as i32;
		sb.dblkno = sb.iblkno + (sb.ipg as i64 / sb.inopf()) as i32;
		if cfg.version == 1 {
			sb.old_spc = sb.fpg * sb.old_nspf;
			sb.old_nsect = sb.old_spc;
			sb.old_npsect = sb.old_spc;
			sb.old_ncyl = sb.ncg as i32;
		}

		sb.csaddr = sb.cgdmin(0);
		sb.cssize =
			sb.fragroundup(sb.ncg as i64 * std::mem::size_of::<Csum>() as i64) as i32;
		sb.sbsize = sb.fragroundup(SB_STRUCT_SIZE as i64) as i32;
		if sb.sbsize > SBLOCKSIZE as i32 {
			sb.sbsize = SBLOCKSIZE as i32;
		}
		if sb.sbsize < self.dev.sectorsize() {
			sb.sbsize = self.dev.sectorsize();
		}
		sb.minfree = cfg.minfree;
		if cfg.metaspace > 0 && cfg.metaspace < sb.fpg / 2 {
			sb.metaspace = sb.blknum(cfg.metaspace as i64);
		} else if cfg.metaspace != -1 {
			// reserve half of minfree for metadata blocks
			sb.metaspace = sb.blknum(sb.fpg as i64 * cfg.minfree as i64 / 200);
		}
		sb.maxbpg = if cfg.maxbpg == 0 {
			sb.bsize / std::mem::size_of::<UfsDaddr>() as i32
		} else {
			cfg.maxbpg
		};
		sb.optim = cfg.optim;
		sb.cgrotor = 0;
		sb.pendingblocks = 0;
		sb.pendinginodes = 0;
		sb.fmod = 0;
		sb.ronly = 0;
		sb.state = 0;
		sb.clean = 1;
		sb.id[0] = utime as i32;
		sb.id[1] = rnd as i32;
		sb.fsmnt = [0; MAXMNTLEN];

		let csfrags = howmany(sb.cssize as i64, sb.fsize as i64);
		sb.dsize = sb.size
			- sb.sblkno as i64
			- sb.ncg as i64 * (sb.dblkno - sb.sblkno) as i64;
		sb.cstotal.nbfree =
			sb.fragstoblks(sb.dsize) - howmany(csfrags, sb.frag as i64);
		sb.cstotal.nffree = sb.fragnum(sb.size)
			+ if sb.fragnum(csfrags) > 0 {
				sb.frag as i64 - sb.fragnum(csfrags)
			} else {
				0
			};
		sb.cstotal.nifree = sb.ncg as i64 * sb.ipg as i64 - UFS_ROOTINO as i64;
		sb.cstotal.ndir = 0;
		sb.dsize -= csfrags;
		sb.time = utime;
		if cfg.version == 1 {
			sb.old_time = utime as i32;
			sb.old_dsize = sb.dsize as i32;
			sb.old_csaddr = sb.csaddr as i32;
			sb.old_cstotal.ndir = sb.cstotal.ndir as i32;
			sb.old_cstotal.nbfree = sb.cstotal.nbfree as i32;
			sb.old_cstotal.nifree = sb.cstotal.nifree as i32;
			sb.old_cstotal.nffree = sb.cstotal.nffree as i32;
		}

		// Metadata check hashes are not supported by UFS1, to keep it
		// as small and simple as possible.
		if cfg.version > 1 {
			sb.flags |= FS_METACKHASH;
			sb.metackhash |= CK_CYLGRP | CK_SUPERBLOCK | CK_INODE;
		}
	}
}
