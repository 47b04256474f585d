//! Initial file population: the root directory and, unless disabled, the
//! `.snap` directory used by snapshot tooling.

use super::*;
use crate::{
	bitmap::{clrbit, clrblock, isblock, setbit},
	codec, crc32c,
};

const ROOTLINKCNT: i16 = 3;
const SNAPLINKCNT: i16 = 2;
const UMASK: u16 = 0o755;

struct Proto {
	ino:  InodeNum,
	name: &'static str,
}

const ROOT_DIR: [Proto; 3] = [
	Proto {
		ino:  UFS_ROOTINO,
		name: ".",
	},
	Proto {
		ino:  UFS_ROOTINO,
		name: "..",
	},
	Proto {
		ino:  UFS_ROOTINO + 1,
		name: ".snap",
	},
];

const SNAP_DIR: [Proto; 2] = [
	Proto {
		ino:  UFS_ROOTINO + 1,
		name: ".",
	},
	Proto {
		ino:  UFS_ROOTINO,
		name: "..",
	},
];

/// Bytes a record with an `n`-character name occupies: an 8-byte header
/// plus the NUL-terminated name, rounded up to 4 bytes.
fn directsiz(namlen: usize) -> usize {
	roundup(8 + namlen + 1, DIR_ROUNDUP)
}

/// Construct a set of directory entries at the front of `buf`; the last
/// record's length expands to consume the whole directory block.
/// Returns the size of the directory.
fn makedir(buf: &mut [u8], protodir: &[Proto]) -> usize {
	buf[..DIRBLKSIZ].fill(0);
	let mut off = 0;
	let mut spcleft = DIRBLKSIZ;
	for (i, e) in protodir.iter().enumerate() {
		let reclen = if i == protodir.len() - 1 {
			spcleft
		} else {
			directsiz(e.name.len())
		};
		buf[off..off + 4].copy_from_slice(&e.ino.to_le_bytes());
		buf[off + 4..off + 6].copy_from_slice(&(reclen as u16).to_le_bytes());
		buf[off + 6] = DT_DIR;
		buf[off + 7] = e.name.len() as u8;
		buf[off + 8..off + 8 + e.name.len()].copy_from_slice(e.name.as_bytes());
		off += directsiz(e.name.len());
		spcleft -= directsiz(e.name.len());
	}
	DIRBLKSIZ
}

impl Mkfs {
	/// Allocate a block or frag out of cylinder group 0.
	fn alloc(&mut self, size: i32, mode: u16) -> Result<i64> {
		self.dev
			.bread(self.sb.fsbtodb(self.sb.cgtod(0)), &mut self.acg)?;
		let mut cg: CylGroup = codec::decode(&self.acg)?;
		if cg.magic != CG_MAGIC {
			return Err(Error::BadCgMagic { code: 38 });
		}
		if cg.cs.nbfree == 0 {
			return Err(Error::FirstCgFull);
		}

		let sb = &self.sb;
		let frag = sb.frag;
		let fragl = frag as i64;
		let freeoff = cg.freeoff as usize;
		let mut d = 0;
		loop {
			if d >= cg.ndblk as i64 {
				return Err(Error::NoBlockInCg);
			}
			if isblock(frag, &self.acg[freeoff..], d / fragl) {
				break;
			}
			d += fragl;
		}

		let blkno = sb.fragstoblks(d);
		clrblock(frag, &mut self.acg[freeoff..], blkno);
		if sb.contigsumsize > 0 {
			clrbit(&mut self.acg[cg.clusteroff as usize..], blkno);
		}
		cg.cs.nbfree -= 1;
		self.sb.cstotal.nbfree -= 1;
		self.fscs[0].nbfree -= 1;
		if mode & S_IFDIR != 0 {
			cg.cs.ndir += 1;
			self.sb.cstotal.ndir += 1;
			self.fscs[0].ndir += 1;
		}
		if size != self.sb.bsize {
			// the tail fragments of the block stay free
			let nfrag = howmany(size as i64, self.sb.fsize as i64);
			let spare = (fragl - nfrag) as i32;
			self.fscs[0].nffree += spare;
			self.sb.cstotal.nffree += spare as i64;
			cg.cs.nffree += spare;
			cg.frsum[(fragl - nfrag) as usize] += 1;
			let freeoff = cg.freeoff as usize;
			for i in nfrag..fragl {
				setbit(&mut self.acg[freeoff..], d + i);
			}
		}
		self.cgwrite(&mut cg)?;
		Ok(d)
	}

	/// Install an inode on the disk, marking it used in its group.
	fn iput(&mut self, ino: &mut Dinode, inr: InodeNum) -> Result<()> {
		self.dev
			.bread(self.sb.fsbtodb(self.sb.cgtod(0)), &mut self.acg)?;
		let mut cg: CylGroup = codec::decode(&self.acg)?;
		if cg.magic != CG_MAGIC {
			return Err(Error::BadCgMagic { code: 31 });
		}
		cg.cs.nifree -= 1;
		setbit(&mut self.acg[cg.iusedoff as usize..], inr as i64);
		self.cgwrite(&mut cg)?;
		self.sb.cstotal.nifree -= 1;
		self.fscs[0].nifree -= 1;

		if let Dinode::Two(d2) = ino {
			update_dinode_ckhash(&self.sb, d2)?;
		}

		let blk = self.sb.ino_to_fsba(inr);
		let bsize = self.sb.bsize as usize;
		let inosz = self.sb.inosz();
		let off = self.sb.ino_to_fsbo(inr) as usize * inosz;
		let mut iobuf = std::mem::take(&mut self.iobuf);
		self.dev.bread(self.sb.fsbtodb(blk), &mut iobuf[..bsize])?;
		match ino {
			Dinode::One(d1) => codec::encode(d1, &mut iobuf[off..off + inosz])?,
			Dinode::Two(d2) => codec::encode(d2, &mut iobuf[off..off + inosz])?,
		};
		let res = self.dev.bwrite(self.sb.fsbtodb(blk), &iobuf[..bsize]);
		self.iobuf = iobuf;
		res
	}

	/// Build the root directory (and `.snap`) once every cylinder group
	/// is on disk.
	pub(super) fn fsinit(&mut self) -> Result<()> {
		let utime = self.utime;
		let gid = match self.cfg.operator_gid {
			Some(gid) => gid,
			None => {
				log::warn!("Cannot retrieve operator gid, using gid 0.");
				0
			},
		};
		let entries = if self.cfg.nosnap {
			ROOTLINKCNT - 1
		} else {
			ROOTLINKCNT
		};
		let fsize = self.sb.fsize as usize;
		let sector = self.dev.sectorsize() as i64;
		let mut dirbuf = vec![0u8; fsize];

		if self.v1() {
			let mut node = Ufs1Inode {
				atime: utime as i32,
				mtime: utime as i32,
				ctime: utime as i32,
				..Ufs1Inode::default()
			};

			// create the root directory
			node.mode = S_IFDIR | UMASK;
			node.nlink = entries;
			node.size = makedir(&mut dirbuf, &ROOT_DIR[..entries as usize]) as u64;
			node.db[0] = self.alloc(self.sb.fsize, node.mode)? as i32;
			node.blocks = (self.sb.fragroundup(node.size as i64) / sector) as u32;
			self.dev
				.wtfs(self.sb.fsbtodb(node.db[0] as i64), &dirbuf)?;
			self.iput(&mut Dinode::One(node.clone()), UFS_ROOTINO)?;

			if !self.cfg.nosnap {
				// create the .snap directory
				node.mode = S_IFDIR | 0o2755;
				node.gid = gid;
				node.nlink = SNAPLINKCNT;
				node.size = makedir(&mut dirbuf, &SNAP_DIR) as u64;
				node.db[0] = self.alloc(self.sb.fsize, node.mode)? as i32;
				node.blocks = (self.sb.fragroundup(node.size as i64) / sector) as u32;
				node.dirdepth = 1;
				self.dev
					.wtfs(self.sb.fsbtodb(node.db[0] as i64), &dirbuf)?;
				self.iput(&mut Dinode::One(node), UFS_ROOTINO + 1)?;
			}
		} else {
			let mut node = Ufs2Inode {
				atime: utime,
				mtime: utime,
				ctime: utime,
				birthtime: utime,
				..Ufs2Inode::default()
			};

			// create the root directory
			node.mode = S_IFDIR | UMASK;
			node.nlink = entries;
			node.size = makedir(&mut dirbuf, &ROOT_DIR[..entries as usize]) as u64;
			node.db[0] = self.alloc(self.sb.fsize, node.mode)?;
			node.blocks = (self.sb.fragroundup(node.size as i64) / sector) as u64;
			self.dev.wtfs(self.sb.fsbtodb(node.db[0]), &dirbuf)?;
			self.iput(&mut Dinode::Two(node.clone()), UFS_ROOTINO)?;

			if !self.cfg.nosnap {
				// create the .snap directory
				node.mode = S_IFDIR | 0o2755;
				node.gid = gid;
				node.nlink = SNAPLINKCNT;
				node.size = makedir(&mut dirbuf, &SNAP_DIR) as u64;
				node.db[0] = self.alloc(self.sb.fsize, node.mode)?;
				node.blocks = (self.sb.fragroundup(node.size as i64) / sector) as u64;
				node.dirdepth = 1;
				self.dev.wtfs(self.sb.fsbtodb(node.db[0]), &dirbuf)?;
				self.iput(&mut Dinode::Two(node), UFS_ROOTINO + 1)?;
			}
		}
		Ok(())
	}
}

/// Refresh an inode check-hash: the hash covers the on-disk bytes with
/// the hash field itself zeroed.
fn update_dinode_ckhash(sb: &Superblock, ino: &mut Ufs2Inode) -> Result<()> {
	if ino.mode == 0 || sb.metackhash & CK_INODE == 0 {
		return Ok(());
	}
	ino.ckhash = 0;
	let mut buf = [0u8; UFS2_INOSZ];
	codec::encode(ino, &mut buf)?;
	ino.ckhash = crc32c::cksum(&buf);
	Ok(())
}

#[cfg(test)]
mod t {
	use super::*;

	#[test]
	fn record_sizes() {
		assert_eq!(directsiz(1), 12);
		assert_eq!(directsiz(2), 12);
		assert_eq!(directsiz(5), 16);
		assert_eq!(directsiz(7), 16);
		assert_eq!(directsiz(8), 20);
	}

	#[test]
	fn root_block_layout() {
		let mut buf = vec![0u8; DIRBLKSIZ];
		assert_eq!(makedir(&mut buf, &ROOT_DIR), DIRBLKSIZ);

		// "."
		assert_eq!(buf[0..4], 2u32.to_le_bytes());
		assert_eq!(buf[4..6], 12u16.to_le_bytes());
		assert_eq!(buf[6], DT_DIR);
		assert_eq!(buf[7], 1);
		assert_eq!(&buf[8..9], b".");
		// ".."
		assert_eq!(buf[12..16], 2u32.to_le_bytes());
		assert_eq!(buf[16..18], 12u16.to_le_bytes());
		assert_eq!(buf[19], 2);
		assert_eq!(&buf[20..22], b"..");
		// ".snap" swallows the rest of the chunk
		assert_eq!(buf[24..28], 3u32.to_le_bytes());
		assert_eq!(buf[28..30], 488u16.to_le_bytes());
		assert_eq!(buf[31], 5);
		assert_eq!(&buf[32..37], b".snap");
	}

	#[test]
	fn two_entry_block() {
		let mut buf = vec![0u8; DIRBLKSIZ];
		makedir(&mut buf, &ROOT_DIR[..2]);
		assert_eq!(buf[16..18], 500u16.to_le_bytes());
	}

	#[test]
	fn snap_block_points_back() {
		let mut buf = vec![0u8; DIRBLKSIZ];
		makedir(&mut buf, &SNAP_DIR);
		assert_eq!(buf[0..4], 3u32.to_le_bytes());
		assert_eq!(buf[12..16], 2u32.to_le_bytes());
	}

	#[test]
	fn inode_ckhash() {
		let mut sb = Superblock::zeroed();
		sb.metackhash = CK_INODE;
		let mut ino = Ufs2Inode {
			mode: S_IFDIR | 0o755,
			..Ufs2Inode::default()
		};
		update_dinode_ckhash(&sb, &mut ino).unwrap();
		let hash = ino.ckhash;
		assert_ne!(hash, 0);

		// recomputing over the zeroed field reproduces it
		ino.ckhash = 0;
		let mut buf = [0u8; UFS2_INOSZ];
		codec::encode(&ino, &mut buf).unwrap();
		assert_eq!(crate::crc32c::cksum(&buf), hash);

		// a free inode keeps hash 0
		let mut free = Ufs2Inode::default();
		update_dinode_ckhash(&sb, &mut free).unwrap();
		assert_eq!(free.ckhash, 0);
	}
}
