//! Cylinder group initialization.
//!
//! Each group image is built in the engine's `acg` scratch buffer: the
//! fixed header, the inode-used bitmap, the fragment-free bitmap, and
//! (with clustering) the cluster summary and cluster-free bitmap, at the
//! offsets recorded in the header itself.

use super::*;
use crate::{
	bitmap::{isset, setbit, setblock},
	codec, crc32c,
};

impl Mkfs {
	/// Initialize cylinder group `cylno` and write it out together with
	/// its backup superblock and the initialized part of its inode table.
	pub(super) fn initcg(&mut self, cylno: i64) -> Result<()> {
		let sb = &self.sb;
		let frag = sb.frag;
		let fragl = frag as i64;

		// Determine block bounds for the cylinder group. Allow space for
		// super block summary information in the first cylinder group.
		let cbase = sb.cgbase(cylno);
		let dmax = (cbase + sb.fpg as i64).min(sb.size);
		let dlower = sb.cgsblock(cylno) - cbase;
		let mut dupper = sb.cgdmin(cylno) - cbase;
		if cylno == 0 {
			dupper += howmany(sb.cssize as i64, sb.fsize as i64);
		}

		let mut cg = CylGroup {
			time: self.utime,
			magic: CG_MAGIC,
			cgx: cylno as u32,
			niblk: sb.ipg,
			initediblk: sb.ipg.min(2 * sb.inopb),
			ndblk: (dmax - cbase) as u32,
			..CylGroup::default()
		};
		if sb.contigsumsize > 0 {
			cg.nclusterblks = cg.ndblk / frag as u32;
		}
		let start = CGHDRSIZE as u32;
		if !self.v1() {
			cg.iusedoff = start;
		} else {
			cg.old_ncyl = sb.old_cpg as i16;
			cg.old_time = cg.time as i32;
			cg.time = 0;
			cg.old_niblk = cg.niblk as i16;
			cg.niblk = 0;
			cg.initediblk = 0;
			cg.old_btotoff = start as i32;
			cg.old_boff = cg.old_btotoff + sb.old_cpg * 4;
			cg.iusedoff = (cg.old_boff + sb.old_cpg * 2) as u32;
		}
		cg.freeoff = cg.iusedoff + howmany(sb.ipg, 8);
		cg.nextfreeoff = cg.freeoff + howmany(sb.fpg as u32, 8);
		if sb.contigsumsize > 0 {
			cg.clustersumoff = roundup(cg.nextfreeoff, 4) - 4;
			cg.clusteroff = cg.clustersumoff + (sb.contigsumsize as u32 + 1) * 4;
			cg.nextfreeoff =
				cg.clusteroff + howmany(sb.fragstoblks(sb.fpg as i64) as u32, 8);
		}
		if cg.nextfreeoff > sb.cgsize as u32 {
			return Err(Error::CgTooBig {
				over: cg.nextfreeoff - sb.cgsize as u32,
			});
		}

		let mut acg = std::mem::take(&mut self.acg);
		acg.fill(0);
		let iusedoff = cg.iusedoff as usize;
		let freeoff = cg.freeoff as usize;
		let clusteroff = cg.clusteroff as usize;

		cg.cs.nifree += sb.ipg as i32;
		if cylno == 0 {
			// inodes 0 and 1 are reserved
			for i in 0..UFS_ROOTINO as i64 {
				setbit(&mut acg[iusedoff..], i);
				cg.cs.nifree -= 1;
			}
		}
		if cylno > 0 {
			// In cylno 0, beginning space is reserved for boot and
			// super blocks.
			let mut d = 0;
			while d < dlower {
				let blkno = d / fragl;
				setblock(frag, &mut acg[freeoff..], blkno);
				if sb.contigsumsize > 0 {
					setbit(&mut acg[clusteroff..], blkno);
				}
				cg.cs.nbfree += 1;
				d += fragl;
			}
		}
		let partial = dupper % fragl;
		if partial != 0 {
			cg.frsum[(fragl - partial) as usize] += 1;
			let d = dupper + fragl - partial;
			while dupper < d {
				setbit(&mut acg[freeoff..], dupper);
				cg.cs.nffree += 1;
				dupper += 1;
			}
		}
		let mut d = dupper;
		while d + fragl <= cg.ndblk as i64 {
			let blkno = d / fragl;
			setblock(frag, &mut acg[freeoff..], blkno);
			if sb.contigsumsize > 0 {
				setbit(&mut acg[clusteroff..], blkno);
			}
			cg.cs.nbfree += 1;
			d += fragl;
		}
		if d < cg.ndblk as i64 {
			cg.frsum[(cg.ndblk as i64 - d) as usize] += 1;
			while d < cg.ndblk as i64 {
				setbit(&mut acg[freeoff..], d);
				cg.cs.nffree += 1;
				d += 1;
			}
		}
		if sb.contigsumsize > 0 {
			// histogram of contiguous free block runs
			let mut sump = vec![0i32; sb.contigsumsize as usize + 1];
			let mut run = 0i32;
			for i in 0..cg.nclusterblks as i64 {
				if isset(&acg[clusteroff..], i) {
					run += 1;
				} else if run != 0 {
					sump[run.min(sb.contigsumsize) as usize] += 1;
					run = 0;
				}
			}
			if run != 0 {
				sump[run.min(sb.contigsumsize) as usize] += 1;
			}
			let off = cg.clustersumoff as usize;
			for (i, v) in sump.iter().enumerate() {
				acg[off + 4 * i..off + 4 * i + 4].copy_from_slice(&v.to_le_bytes());
			}
		}
		self.fscs[cylno as usize] = cg.cs;
		self.acg = acg;

		// Write out the duplicate super block, then the cylinder group
		// map and two blocks worth of inodes.
		let saved = self.sb.sblockactualloc;
		self.sb.sblockactualloc =
			self.sb.fsbtodb(self.sb.cgsblock(cylno)) * self.dev.sectorsize() as i64;
		self.sbwrite(false)?;
		self.sb.sblockactualloc = saved;

		self.cgwrite(&mut cg)?;

		let mut iobuf = std::mem::take(&mut self.iobuf);
		iobuf.fill(0);
		let inosz = self.sb.inosz();
		for i in 0..cg.initediblk as usize {
			let gen = self.random();
			if self.v1() {
				let ino = Ufs1Inode {
					gen,
					..Ufs1Inode::default()
				};
				codec::encode(&ino, &mut iobuf[i * inosz..])?;
			} else {
				let ino = Ufs2Inode {
					gen,
					..Ufs2Inode::default()
				};
				codec::encode(&ino, &mut iobuf[i * inosz..])?;
			}
		}
		self.dev
			.wtfs(self.sb.fsbtodb(self.sb.cgimin(cylno)), &iobuf)?;

		// For the old file system, all the inodes are initialized.
		if self.v1() {
			let bsize = self.sb.bsize as usize;
			let mut i = 2 * fragl;
			while i < self.sb.ipg as i64 / self.sb.inopf() {
				for j in 0..self.sb.inopb as usize {
					let ino = Ufs1Inode {
						gen: self.random(),
						..Ufs1Inode::default()
					};
					codec::encode(&ino, &mut iobuf[j * inosz..])?;
				}
				self.dev.wtfs(
					self.sb.fsbtodb(self.sb.cgimin(cylno) + i),
					&iobuf[..bsize],
				)?;
				i += fragl;
			}
		}
		self.iobuf = iobuf;
		Ok(())
	}

	/// Write the cylinder group image held in `acg`, computing its
	/// check-hash first when the filesystem carries them.
	pub(super) fn cgwrite(&mut self, cg: &mut CylGroup) -> Result<()> {
		if self.sb.metackhash & CK_CYLGRP != 0 {
			cg.ckhash = 0;
			codec::encode(cg, &mut self.acg)?;
			cg.ckhash = crc32c::cksum(&self.acg);
		}
		codec::encode(cg, &mut self.acg)?;
		self.dev
			.bwrite(self.sb.fsbtodb(self.sb.cgtod(cg.cgx as i64)), &self.acg)
	}
}
