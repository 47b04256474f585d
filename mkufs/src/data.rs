use std::mem::size_of;

use bincode::{Decode, Encode};

/// UFS1 fast filesystem magic number
pub const FS_UFS1_MAGIC: i32 = 0x011954;

/// UFS2 fast filesystem magic number
pub const FS_UFS2_MAGIC: i32 = 0x19540119;

/// Magic number stamped while the filesystem is still being built, so an
/// interrupted format can never be mounted.
pub const FS_BAD_MAGIC: i32 = 0x19960408;

/// Magic number stamped into every cylinder group header.
pub const CG_MAGIC: i32 = 0x090255;

/// Byte offset of the primary superblock on a UFS1 volume.
pub const SBLOCK_UFS1: usize = 8192;

/// Byte offset of the primary superblock on a UFS2 volume.
pub const SBLOCK_UFS2: usize = 65536;

/// Space reserved on disk for a superblock copy.
pub const SBLOCKSIZE: usize = 8192;

/// Encoded size of [`Superblock`]; `fs_sbsize` is this rounded up to a
/// fragment and capped at [`SBLOCKSIZE`].
pub const SB_STRUCT_SIZE: usize = 1376;

/// Size of the fixed cylinder group header, including trailing padding.
/// The allocation maps start here.
pub const CGHDRSIZE: usize = 176;

/// A block never splits into more than this many fragments.
pub const MAXFRAG: usize = 8;

/// `ufs_time_t` on FreeBSD
pub type UfsTime = i64;

/// `ufs2_daddr_t` on FreeBSD
pub type UfsDaddr = i64;

/// Inode numbers as UFS stores them.
pub type InodeNum = u32;

/// Bytes set aside in the superblock for the last mount point path.
pub const MAXMNTLEN: usize = 468;

/// Bytes set aside in the superblock for the volume label, terminator
/// included.
pub const MAXVOLLEN: usize = 32;

/// The superblock can track at most this many snapshot inodes.
pub const FSMAXSNAP: usize = 20;

/// The superblock sets aside 128 bytes (`ocsp` plus `si`) where mounted
/// kernels historically parked in-core pointers. On disk the region is
/// plain padding and must be written as zeros; this engine never stores
/// pointers there.
pub const NOCSPTRS: usize = (128 / size_of::<u64>()) - 1;

/// Direct block pointers per inode.
pub const UFS_NDADDR: usize = 12;

/// Indirect block pointers per inode.
pub const UFS_NIADDR: usize = 3;

/// Longest directory entry name.
pub const UFS_MAXNAMLEN: usize = 255;

/// Size of an on-disk UFS1 inode.
pub const UFS1_INOSZ: usize = 128;

/// Size of an on-disk UFS2 inode.
pub const UFS2_INOSZ: usize = 256;

/// First non-reserved inode: the root directory.
pub const UFS_ROOTINO: InodeNum = 2;

/// Smallest allowed block size; anything below cannot hold a cylinder
/// group map.
pub const MINBSIZE: i32 = 4096;

/// Largest allowed block size.
pub const MAXBSIZE: i32 = 65536;

/// Historic disk sector size, the unit of directory blocks.
pub const DEV_BSIZE: i32 = 512;

/// A directory is a series of 4-byte-aligned records packed into
/// independent chunks of this size.
pub const DIRBLKSIZ: usize = DEV_BSIZE as usize;

/// Directory name roundup size.
pub const DIR_ROUNDUP: usize = 4;

/// The minimum number of cylinder groups to aim for.
pub const MINCYLGRPS: i64 = 4;

/// Largest I/O the buffering layers will carry.
pub const MAXPHYS: i32 = 1024 * 1024;

/// One inode slot is allocated per NFPI fragments by default.
pub const NFPI: i32 = 2;

/// Default expected average file size.
pub const AVFILESIZ: i32 = 16384;

/// Default expected number of files per directory.
pub const AFPDIR: i32 = 64;

/// Default fragment and block sizes; both powers of two with
/// sectorsize <= DFL_FRAGSIZE <= DFL_BLKSIZE and a ratio of at most 8.
pub const DFL_FRAGSIZE: i32 = 4096;
pub const DFL_BLKSIZE: i32 = 32768;

/// Desired fs_fpg ("infinity"): pack as many blocks per group as fit.
pub const MAXBLKSPERCG: i32 = 0x7fffffff;

/// Longest cluster run tracked by the per-group cluster summary.
pub const FS_MAXCONTIG: i32 = 8;

/// The cylinder group map must leave this much slack in a block.
pub const CGSIZEFUDGE: usize = 8;

/// Minimum acceptable percentage of free blocks.
pub const MINFREE: i32 = 8;

/// Optimization preference: minimize allocation time.
pub const FS_OPTTIME: i32 = 0;

/// Optimization preference: minimize disk fragmentation.
pub const FS_OPTSPACE: i32 = 1;

// Superblock fs_flags.
pub const FS_UNCLEAN: i32 = 0x0001;
pub const FS_DOSOFTDEP: i32 = 0x0002;
pub const FS_SUJ: i32 = 0x0008;
pub const FS_MULTILABEL: i32 = 0x0020;
pub const FS_GJOURNAL: i32 = 0x0040;
pub const FS_FLAGS_UPDATED: i32 = 0x0080;
pub const FS_METACKHASH: i32 = 0x0200;
pub const FS_TRIM: i32 = 0x0400;

// Metadata check-hash classes (fs_metackhash).
pub const CK_SUPERBLOCK: u32 = 0x0001;
pub const CK_CYLGRP: u32 = 0x0002;
pub const CK_INODE: u32 = 0x0004;

/// On-disk inode format stamped into UFS1 superblocks.
pub const FS_44INODEFMT: i32 = 2;

/// Mask selecting the file type bits of an inode mode.
pub const S_IFMT: u16 = 0o170000;

/// Mode bits of a directory.
pub const S_IFDIR: u16 = 0o040000;

pub const DT_DIR: u8 = 4;

/// One cylinder group's worth of free-resource counters. The counters of
/// every group are kept together in an array at `fs_csaddr`, so mount and
/// fsck can total them without touching each group.
/// `struct csum` in FreeBSD
#[derive(Debug, Default, Clone, Copy, Decode, Encode)]
pub struct Csum {
	pub ndir:   i32, // directories
	pub nbfree: i32, // whole free blocks
	pub nifree: i32, // free inodes
	pub nffree: i32, // free fragments outside whole blocks
}

/// Filesystem-wide totals of the per-group counters, in 64 bits.
/// `struct csum_total` in FreeBSD
#[derive(Debug, Default, Decode, Encode)]
pub struct CsumTotal {
	pub ndir:        i64,
	pub nbfree:      i64,
	pub nifree:      i64,
	pub nffree:      i64,
	pub numclusters: i64,
	pub spare:       [i64; 3],
}

/// The root on-disk record of the filesystem: geometry, feature flags,
/// aggregate usage counters, and a tail of fields kept alive for UFS1
/// (`old_*`). Field order and widths are the on-disk ABI; the magic is
/// the last field, putting it at byte 1372 of the encoding.
/// `struct fs` in FreeBSD
#[derive(Debug, Decode, Encode)]
pub struct Superblock {
	// head of a linked list in ancient in-core superblocks; dead on disk
	pub firstfield:       i32,
	pub unused_1:         i32,
	// where a group's pieces sit, in fragments from the group base
	pub sblkno:           i32, // backup superblock
	pub cblkno:           i32, // group header
	pub iblkno:           i32, // inode table
	pub dblkno:           i32, // first data fragment
	pub old_cgoffset:     i32, // per-cylinder stagger, unused since UFS1
	pub old_cgmask:       i32,
	pub old_time:         i32,
	pub old_size:         i32,
	pub old_dsize:        i32,
	pub ncg:              u32, // cylinder groups
	pub bsize:            i32, // bytes per block
	pub fsize:            i32, // bytes per fragment
	pub frag:             i32, // fragments per block, 1..=MAXFRAG
	pub minfree:          i32, // percentage held back from normal users
	pub old_rotdelay:     i32,
	pub old_rps:          i32,
	pub bmask:            i32, // !(bsize - 1)
	pub fmask:            i32, // !(fsize - 1)
	pub bshift:           i32, // log2(bsize)
	pub fshift:           i32, // log2(fsize)
	pub maxcontig:        i32, // blocks the allocator will run contiguously
	pub maxbpg:           i32, // one file's block quota inside a group
	pub fragshift:        i32, // log2(frag)
	pub fsbtodb:          i32, // fragment address to sector address shift
	pub sbsize:           i32, // bytes of superblock actually written
	pub spare1:           [i32; 2],
	pub nindir:           i32, // block pointers per indirect block
	pub inopb:            u32, // inodes per block
	pub old_nspf:         i32,
	pub optim:            i32, // FS_OPTTIME or FS_OPTSPACE
	pub old_npsect:       i32,
	pub old_interleave:   i32,
	pub old_trackskew:    i32,
	pub id:               [i32; 2], // identity: format time + random word
	pub old_csaddr:       i32,
	pub cssize:           i32, // bytes of the summary array
	pub cgsize:           i32, // bytes of a cylinder group image
	pub spare2:           i32,
	pub old_nsect:        i32,
	pub old_spc:          i32,
	pub old_ncyl:         i32,
	pub old_cpg:          i32,
	pub ipg:              u32, // inodes per group
	pub fpg:              i32, // fragments per group
	pub old_cstotal:      Csum, // 32-bit totals kept for UFS1 kernels
	pub fmod:             i8,  // dirty marker, cleared on every write here
	pub clean:            i8,
	pub ronly:            i8,
	pub old_flags:        i8, // only FS_FLAGS_UPDATED matters today
	pub fsmnt:            [u8; MAXMNTLEN], // where it was last mounted
	pub volname:          [u8; MAXVOLLEN], // label, NUL terminated
	pub swuid:            u64,
	pub pad:              i32,
	pub cgrotor:          i32, // group where allocation last left off
	// room that once held in-core pointers; zeros on disk
	pub ocsp:             [u64; NOCSPTRS],
	pub si:               u64,
	pub old_cpc:          i32,
	pub maxbsize:         i32, // largest extent, bytes
	pub unrefs:           i64, // inodes unlinked but still open
	pub providersize:     i64, // fragments the whole device could hold
	pub metaspace:        i64, // fragments held back for metadata placement
	pub sparecon64:       [i64; 13],
	pub sblockactualloc:  i64, // byte offset this copy was written to
	pub sblockloc:        i64, // byte offset of the standard location
	pub cstotal:          CsumTotal, // totals across all groups
	pub time:             UfsTime,   // last write
	pub size:             i64,       // fragments in the filesystem
	pub dsize:            i64,       // fragments available to file data
	pub csaddr:           UfsDaddr,  // fragment address of the summary array
	pub pendingblocks:    i64,       // blocks in the middle of being freed
	pub pendinginodes:    u32,       // inodes in the middle of being freed
	pub snapinum:         [u32; FSMAXSNAP], // live snapshot inodes
	pub avgfilesize:      u32, // layout hint: expected file size
	pub avgfpdir:         u32, // layout hint: expected files per directory
	pub save_cgsize:      i32,
	pub mtime:            UfsTime, // last mount or fsck
	pub sujfree:          i32,
	pub sparecon32:       [i32; 21],
	pub ckhash:           u32, // CRC32C of sbsize bytes, this field as zero
	pub metackhash:       u32, // CK_* classes that carry check-hashes
	pub flags:            i32, // FS_* feature flags
	pub contigsumsize:    i32, // longest run the cluster summary records
	pub maxsymlinklen:    i32, // longest link target stored in the inode
	pub old_inodefmt:     i32,
	pub maxfilesize:      u64, // largest byte offset the pointers can reach
	pub qbmask:           i64, // !bmask widened to 64 bits
	pub qfmask:           i64, // !fmask widened to 64 bits
	pub state:            i32,
	pub old_postblformat: i32,
	pub old_nrpos:        i32,
	pub spare5:           [i32; 2],
	pub magic:            i32,
}

/// Fixed header of a cylinder group. The allocation maps follow inside
/// the same image, at the byte offsets the header records; under UFS1 the
/// widened fields move into their `old_*` twins.
/// `struct cg` in FreeBSD
#[derive(Debug, Default, Decode, Encode)]
pub struct CylGroup {
	pub firstfield:    i32,
	pub magic:         i32, // CG_MAGIC
	pub old_time:      i32,
	pub cgx:           u32, // which group this is
	pub old_ncyl:      i16,
	pub old_niblk:     i16,
	pub ndblk:         u32,  // fragments covered by this group
	pub cs:            Csum, // free-resource counters
	pub rotor:         u32,  // allocator resume positions
	pub frotor:        u32,
	pub irotor:        u32,
	pub frsum:         [u32; MAXFRAG], // free runs, indexed by run length
	pub old_btotoff:   i32,
	pub old_boff:      i32,
	pub iusedoff:      u32, // inode-used bitmap
	pub freeoff:       u32, // fragment-free bitmap
	pub nextfreeoff:   u32, // first byte past the maps
	pub clustersumoff: u32, // run-length histogram, i32 entries
	pub clusteroff:    u32, // cluster-free bitmap
	pub nclusterblks:  u32, // blocks the cluster map covers
	pub niblk:         u32, // inodes in this group
	pub initediblk:    u32, // inode slots already written to disk
	pub unrefs:        u32,
	pub sparecon32:    [i32; 1],
	pub ckhash:        u32, // CRC32C of the image, this field as zero
	pub time:          UfsTime,
	pub sparecon64:    [i64; 3],
}

/// On-disk inode of a UFS1 filesystem, 128 bytes. Timestamps are 32-bit
/// seconds, each with a separate nanosecond word.
/// `struct ufs1_dinode` in FreeBSD
#[derive(Debug, Default, Clone, Decode, Encode)]
pub struct Ufs1Inode {
	pub mode:      u16, // file type and permission bits
	pub nlink:     i16,
	pub freelink:  u32, // next inode on the SUJ unlinked chain
	pub size:      u64,
	pub atime:     i32,
	pub atimensec: i32,
	pub mtime:     i32,
	pub mtimensec: i32,
	pub ctime:     i32,
	pub ctimensec: i32,
	pub db:        [i32; UFS_NDADDR], // direct block pointers
	pub ib:        [i32; UFS_NIADDR], // indirect block pointers
	pub flags:     u32, // chflags word
	pub blocks:    u32, // sectors actually allocated
	pub gen:       u32, // generation, randomized at format time
	pub uid:       u32,
	pub gid:       u32,
	pub modrev:    u32,
	pub dirdepth:  u32, // directories: distance from the root
}

/// On-disk inode of a UFS2 filesystem, 256 bytes. The pointer arrays sit
/// at bytes 96..232 (extattr, direct, indirect); the generation word is
/// at byte 80.
/// `struct ufs2_dinode` in FreeBSD
#[derive(Debug, Default, Clone, Decode, Encode)]
pub struct Ufs2Inode {
	pub mode:      u16, // file type and permission bits
	pub nlink:     i16,
	pub uid:       u32,
	pub gid:       u32,
	pub blksize:   u32, // preferred I/O size
	pub size:      u64,
	pub blocks:    u64, // sectors actually allocated
	pub atime:     UfsTime,
	pub mtime:     UfsTime,
	pub ctime:     UfsTime,
	pub birthtime: UfsTime,
	pub mtimensec: u32,
	pub atimensec: u32,
	pub ctimensec: u32,
	pub birthnsec: u32,
	pub gen:       u32, // generation, randomized at format time
	pub kernflags: u32,
	pub flags:     u32, // chflags word
	pub extsize:   u32, // bytes of extended attribute data
	pub extb:      [UfsDaddr; 2], // extended attribute blocks
	pub db:        [UfsDaddr; UFS_NDADDR], // direct block pointers
	pub ib:        [UfsDaddr; UFS_NIADDR], // indirect block pointers
	pub modrev:    u64,
	pub dirdepth:  u32, // directories: distance from the root (SUJ reuses the slot)
	pub ckhash:    u32, // CRC32C of the inode, this field as zero
	pub spare:     [u32; 2],
}

/// The two on-disk inode layouts share slot semantics but not layout;
/// the format version picks the variant.
#[derive(Debug, Clone)]
pub enum Dinode {
	One(Ufs1Inode),
	Two(Ufs2Inode),
}

/// Tail record of the boot area used by fsck_ffs to rebuild a lost
/// UFS2 superblock.
/// `struct fsrecovery` in FreeBSD
#[derive(Debug, Default, Decode, Encode)]
pub struct FsRecovery {
	pub magic:   i32,
	pub fpg:     i32, // fragments per group
	pub fsbtodb: i32, // fragment to sector shift
	pub sblkno:  i32, // backup superblock offset within a group
	pub ncg:     i32, // cylinder groups
}

impl Superblock {
	/// An all-zero superblock to be filled in by the geometry solver.
	pub fn zeroed() -> Self {
		Self {
			firstfield:       0,
			unused_1:         0,
			sblkno:           0,
			cblkno:           0,
			iblkno:           0,
			dblkno:           0,
			old_cgoffset:     0,
			old_cgmask:       0,
			old_time:         0,
			old_size:         0,
			old_dsize:        0,
			ncg:              0,
			bsize:            0,
			fsize:            0,
			frag:             0,
			minfree:          0,
			old_rotdelay:     0,
			old_rps:          0,
			bmask:            0,
			fmask:            0,
			bshift:           0,
			fshift:           0,
			maxcontig:        0,
			maxbpg:           0,
			fragshift:        0,
			fsbtodb:          0,
			sbsize:           0,
			spare1:           [0; 2],
			nindir:           0,
			inopb:            0,
			old_nspf:         0,
			optim:            0,
			old_npsect:       0,
			old_interleave:   0,
			old_trackskew:    0,
			id:               [0; 2],
			old_csaddr:       0,
			cssize:           0,
			cgsize:           0,
			spare2:           0,
			old_nsect:        0,
			old_spc:          0,
			old_ncyl:         0,
			old_cpg:          0,
			ipg:              0,
			fpg:              0,
			old_cstotal:      Csum::default(),
			fmod:             0,
			clean:            0,
			ronly:            0,
			old_flags:        0,
			fsmnt:            [0; MAXMNTLEN],
			volname:          [0; MAXVOLLEN],
			swuid:            0,
			pad:              0,
			cgrotor:          0,
			ocsp:             [0; NOCSPTRS],
			si:               0,
			old_cpc:          0,
			maxbsize:         0,
			unrefs:           0,
			providersize:     0,
			metaspace:        0,
			sparecon64:       [0; 13],
			sblockactualloc:  0,
			sblockloc:        0,
			cstotal:          CsumTotal::default(),
			time:             0,
			size:             0,
			dsize:            0,
			csaddr:           0,
			pendingblocks:    0,
			pendinginodes:    0,
			snapinum:         [0; FSMAXSNAP],
			avgfilesize:      0,
			avgfpdir:         0,
			save_cgsize:      0,
			mtime:            0,
			sujfree:          0,
			sparecon32:       [0; 21],
			ckhash:           0,
			metackhash:       0,
			flags:            0,
			contigsumsize:    0,
			maxsymlinklen:    0,
			old_inodefmt:     0,
			maxfilesize:      0,
			qbmask:           0,
			qfmask:           0,
			state:            0,
			old_postblformat: 0,
			old_nrpos:        0,
			spare5:           [0; 2],
			magic:            0,
		}
	}

	pub fn v1(&self) -> bool {
		self.sblockloc == SBLOCK_UFS1 as i64
	}

	/// Size of an on-disk inode in this filesystem.
	pub fn inosz(&self) -> usize {
		if self.v1() {
			UFS1_INOSZ
		} else {
			UFS2_INOSZ
		}
	}

	/// Filesystem fragment address to disk sector.
	pub fn fsbtodb(&self, b: i64) -> i64 {
		b << self.fsbtodb
	}

	/// Disk sector to filesystem fragment address.
	pub fn dbtofsb(&self, d: i64) -> i64 {
		d >> self.fsbtodb
	}

	/// First fragment of cylinder group `c`.
	pub fn cgbase(&self, c: i64) -> i64 {
		self.fpg as i64 * c
	}

	pub fn cgstart(&self, c: i64) -> i64 {
		self.cgbase(c) + self.old_cgoffset as i64 * (c & !self.old_cgmask as i64)
	}

	/// Location of the backup superblock of cylinder group `c`.
	pub fn cgsblock(&self, c: i64) -> i64 {
		self.cgstart(c) + self.sblkno as i64
	}

	/// Location of the header of cylinder group `c`.
	pub fn cgtod(&self, c: i64) -> i64 {
		self.cgstart(c) + self.cblkno as i64
	}

	/// Location of the inode table of cylinder group `c`.
	pub fn cgimin(&self, c: i64) -> i64 {
		self.cgstart(c) + self.iblkno as i64
	}

	/// Location of the first data block of cylinder group `c`.
	pub fn cgdmin(&self, c: i64) -> i64 {
		self.cgstart(c) + self.dblkno as i64
	}

	pub fn fragroundup(&self, size: i64) -> i64 {
		roundup(size, self.fsize as i64)
	}

	/// Fragment offset within a block.
	pub fn fragnum(&self, fsb: i64) -> i64 {
		fsb & (self.frag as i64 - 1)
	}

	/// Round a fragment address down to its block.
	pub fn blknum(&self, fsb: i64) -> i64 {
		fsb & !(self.frag as i64 - 1)
	}

	/// Byte count to fragment count.
	pub fn numfrags(&self, loc: i64) -> i64 {
		loc >> self.fshift
	}

	pub fn fragstoblks(&self, f: i64) -> i64 {
		f >> self.fragshift
	}

	pub fn blkstofrags(&self, b: i64) -> i64 {
		b << self.fragshift
	}

	/// Inodes per fragment.
	pub fn inopf(&self) -> i64 {
		(self.inopb >> self.fragshift) as i64
	}

	/// Cylinder group an inode lives in.
	pub fn ino_to_cg(&self, ino: InodeNum) -> i64 {
		(ino / self.ipg) as i64
	}

	/// Fragment address of the inode block holding `ino`.
	pub fn ino_to_fsba(&self, ino: InodeNum) -> i64 {
		self.cgimin(self.ino_to_cg(ino))
			+ self.blkstofrags((ino % self.ipg) as i64 / self.inopb as i64)
	}

	/// Slot index of `ino` within its inode block.
	pub fn ino_to_fsbo(&self, ino: InodeNum) -> i64 {
		(ino % self.ipg) as i64 % self.inopb as i64
	}

	/// In-memory size of the cylinder group structure, maps included.
	/// Must fit a single filesystem block with CGSIZEFUDGE to spare.
	pub fn cgsize_struct(&self) -> usize {
		CGHDRSIZE
			+ size_of::<i32>()
			+ self.old_cpg as usize * size_of::<i32>()
			+ self.old_cpg as usize * size_of::<u16>()
			+ howmany(self.ipg as usize, 8)
			+ howmany(self.fpg as usize, 8)
			+ (if self.contigsumsize <= 0 {
				0
			} else {
				self.contigsumsize as usize * size_of::<i32>()
					+ howmany(self.fragstoblks(self.fpg as i64) as usize, 8)
			})
	}
}

pub fn howmany<T>(x: T, y: T) -> T
where
	T: Copy
		+ std::ops::Add<Output = T>
		+ std::ops::Sub<Output = T>
		+ std::ops::Div<Output = T>
		+ From<u8>,
{
	(x + y - T::from(1u8)) / y
}

pub fn roundup<T>(x: T, y: T) -> T
where
	T: Copy
		+ std::ops::Add<Output = T>
		+ std::ops::Sub<Output = T>
		+ std::ops::Div<Output = T>
		+ std::ops::Mul<Output = T>
		+ From<u8>,
{
	howmany(x, y) * y
}

pub fn powerof2(x: i64) -> bool {
	x > 0 && (x & (x - 1)) == 0
}

pub fn ilog2(x: i64) -> i32 {
	assert!(powerof2(x), "ilog2: {x} is not a power of 2");
	x.trailing_zeros() as i32
}
