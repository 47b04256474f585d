//! Superblock and summary emission, plus the boot-area recovery record.

use super::*;
use crate::{codec, crc32c};

impl Mkfs {
	/// Write the summary array and the superblock at its current
	/// `sblockactualloc`. With `all`, re-emit the same superblock bytes at
	/// every group's backup location, without rewriting the summary.
	pub(super) fn sbwrite(&mut self, all: bool) -> Result<()> {
		// Write the summary information first, so an I/O error cannot
		// leave a fully valid superblock on a half-written filesystem.
		self.write_summary()?;
		self.sb.fmod = 0;
		self.oldfscompat_write();
		self.sb.time = if self.cfg.regression {
			1_000_000_000
		} else {
			now()
		};
		self.write_sb_at(self.sb.sblockactualloc)?;

		if all {
			let saved = self.sb.sblockactualloc;
			let sector = self.dev.sectorsize() as i64;
			for g in 0..self.sb.ncg as i64 {
				self.sb.sblockactualloc = self.sb.fsbtodb(self.sb.cgsblock(g)) * sector;
				let loc = self.sb.sblockactualloc;
				if let Err(e) = self.write_sb_at(loc) {
					self.sb.sblockactualloc = saved;
					return Err(e);
				}
			}
			self.sb.sblockactualloc = saved;
		}
		Ok(())
	}

	/// Write the per-group summary at `fs_csaddr`, a block at a time with
	/// a short tail chunk.
	fn write_summary(&mut self) -> Result<()> {
		if self.fscs.is_empty() {
			return Ok(());
		}
		let sb = &self.sb;
		let fsize = sb.fsize as i64;
		let blks = howmany(sb.cssize as i64, fsize);

		let mut space = vec![0u8; (blks * fsize) as usize];
		for (i, cs) in self.fscs.iter().enumerate() {
			codec::encode(cs, &mut space[i * std::mem::size_of::<Csum>()..])?;
		}

		let mut i = 0;
		while i < blks {
			let size = if i + sb.frag as i64 > blks {
				((blks - i) * fsize) as usize
			} else {
				sb.bsize as usize
			};
			let off = (i * fsize) as usize;
			self.dev
				.bwrite(sb.fsbtodb(sb.csaddr + i), &space[off..off + size])?;
			i += sb.frag as i64;
		}
		Ok(())
	}

	/// Encode the superblock, install its check-hash, and put it at byte
	/// offset `loc`.
	fn write_sb_at(&mut self, loc: i64) -> Result<()> {
		let sbsize = self.sb.sbsize as usize;
		let mut buf = vec![0u8; SBLOCKSIZE];
		if self.sb.metackhash & CK_SUPERBLOCK != 0 {
			self.sb.ckhash = 0;
			codec::encode(&self.sb, &mut buf)?;
			self.sb.ckhash = crc32c::cksum(&buf[..sbsize]);
		}
		codec::encode(&self.sb, &mut buf)?;
		self.dev
			.bwrite(loc / self.dev.sectorsize() as i64, &buf[..sbsize])
	}

	/// Unwinding superblock updates for old filesystems: UFS1 keeps
	/// duplicate legacy copies of the counters a UFS1 kernel inspects.
	fn oldfscompat_write(&mut self) {
		let sb = &mut self.sb;
		match sb.magic {
			FS_UFS1_MAGIC => {
				if sb.sblockloc != SBLOCK_UFS1 as i64
					&& sb.old_flags as u8 as i32 & FS_FLAGS_UPDATED == 0
				{
					log::warn!(
						"correcting fs_sblockloc from {} to {}",
						sb.sblockloc,
						SBLOCK_UFS1
					);
					sb.sblockloc = SBLOCK_UFS1 as i64;
				}
				sb.old_time = sb.time as i32;
				sb.old_cstotal.ndir = sb.cstotal.ndir as i32;
				sb.old_cstotal.nbfree = sb.cstotal.nbfree as i32;
				sb.old_cstotal.nifree = sb.cstotal.nifree as i32;
				sb.old_cstotal.nffree = sb.cstotal.nffree as i32;
			},
			FS_UFS2_MAGIC => {
				if sb.sblockloc != SBLOCK_UFS2 as i64
					&& sb.old_flags as u8 as i32 & FS_FLAGS_UPDATED == 0
				{
					log::warn!(
						"correcting fs_sblockloc from {} to {}",
						sb.sblockloc,
						SBLOCK_UFS2
					);
					sb.sblockloc = SBLOCK_UFS2 as i64;
				}
			},
			_ => {},
		}
	}

	/// Read the last sector of the boot block and replace its last 20
	/// bytes with the recovery information. The recovery record only
	/// works for UFS2; for UFS1 the area is zeroed so a stale UFS2
	/// record is never found.
	pub(super) fn fsrecovery(&mut self) -> Result<()> {
		let sector = self.dev.sectorsize() as usize;
		let bno = ((SBLOCK_UFS2 - sector) / sector) as i64;
		let mut buf = vec![0u8; sector];
		self.dev
			.bread(bno, &mut buf)
			.map_err(|e| e.with_code(1))?;

		let tail = sector - 20;
		if self.sb.magic != FS_UFS2_MAGIC {
			buf[tail..].fill(0);
		} else {
			let fsr = FsRecovery {
				magic:   self.sb.magic,
				fpg:     self.sb.fpg,
				fsbtodb: self.sb.fsbtodb,
				sblkno:  self.sb.sblkno,
				ncg:     self.sb.ncg as i32,
			};
			codec::encode(&fsr, &mut buf[tail..])?;
		}
		self.dev.wtfs(bno, &buf)
	}
}
