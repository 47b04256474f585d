//! End-to-end checks over freshly formatted scratch images: the engine's
//! output is read back raw and verified for geometry, directory content,
//! check-hashes, and allocation accounting.

use std::{fs::File, os::unix::fs::FileExt};

use mkufs::{bitmap, codec, crc32c, data::*, Config, Device, Mkfs};
use rstest::rstest;
use tempfile::NamedTempFile;

fn base_cfg(bytes: u64) -> Config {
	Config {
		device: "test-image".into(),
		mediasize: bytes as i64,
		regression: true,
		..Config::default()
	}
}

fn format(bytes: u64, cfg: Config) -> (NamedTempFile, Mkfs) {
	let img = NamedTempFile::new().unwrap();
	img.as_file().set_len(bytes).unwrap();
	let file = File::options()
		.read(true)
		.write(true)
		.open(img.path())
		.unwrap();
	let mut mkfs = Mkfs::new(Device::new(Some(file), 512, false), cfg);
	mkfs.run().unwrap();
	(img, mkfs)
}

fn read_sb(img: &File, loc: usize) -> Superblock {
	let mut buf = vec![0u8; SBLOCKSIZE];
	img.read_exact_at(&mut buf, loc as u64).unwrap();
	codec::decode(&buf).unwrap()
}

fn read_cg(img: &File, sb: &Superblock, g: i64) -> (CylGroup, Vec<u8>) {
	let mut buf = vec![0u8; sb.cgsize as usize];
	img.read_exact_at(&mut buf, (sb.cgtod(g) * sb.fsize as i64) as u64)
		.unwrap();
	let cg: CylGroup = codec::decode(&buf).unwrap();
	assert_eq!(cg.magic, CG_MAGIC, "cg{g} magic");
	(cg, buf)
}

fn read_inode2(img: &File, sb: &Superblock, inr: InodeNum) -> Ufs2Inode {
	let off = sb.ino_to_fsba(inr) * sb.fsize as i64
		+ sb.ino_to_fsbo(inr) * UFS2_INOSZ as i64;
	let mut buf = [0u8; UFS2_INOSZ];
	img.read_exact_at(&mut buf, off as u64).unwrap();
	codec::decode(&buf).unwrap()
}

fn read_inode1(img: &File, sb: &Superblock, inr: InodeNum) -> Ufs1Inode {
	let off = sb.ino_to_fsba(inr) * sb.fsize as i64
		+ sb.ino_to_fsbo(inr) * UFS1_INOSZ as i64;
	let mut buf = [0u8; UFS1_INOSZ];
	img.read_exact_at(&mut buf, off as u64).unwrap();
	codec::decode(&buf).unwrap()
}

/// A parsed directory record: (inode, reclen, type, name).
fn read_dirents(img: &File, byteoff: u64) -> Vec<(u32, u16, u8, String)> {
	let mut buf = vec![0u8; DIRBLKSIZ];
	img.read_exact_at(&mut buf, byteoff).unwrap();
	let mut out = Vec::new();
	let mut off = 0;
	while off < DIRBLKSIZ {
		let ino = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap());
		let reclen = u16::from_le_bytes(buf[off + 4..off + 6].try_into().unwrap());
		if reclen == 0 || ino == 0 {
			break;
		}
		let namlen = buf[off + 7] as usize;
		let name = String::from_utf8(buf[off + 8..off + 8 + namlen].to_vec()).unwrap();
		out.push((ino, reclen, buf[off + 6], name));
		off += reclen as usize;
	}
	out
}

#[test]
fn s1_default_geometry_and_root() {
	let (img, _mkfs) = format(64 << 20, base_cfg(64 << 20));
	let sb = read_sb(img.as_file(), SBLOCK_UFS2);

	assert_eq!(sb.magic, FS_UFS2_MAGIC);
	assert_eq!(sb.bsize, 32768);
	assert_eq!(sb.fsize, 4096);
	assert_eq!(sb.ncg, 4);
	assert_eq!(sb.time, 1_000_000_000);
	assert_eq!(sb.id[0], 1_000_000_000);

	// the root directory: mode 040755, three entries
	let root = read_inode2(img.as_file(), &sb, UFS_ROOTINO);
	assert_eq!(root.mode, 0o040755);
	assert_eq!(root.nlink, 3);
	assert_eq!(root.size, DIRBLKSIZ as u64);
	assert_eq!(root.blocks, (sb.fsize / 512) as u64);
	assert_eq!(root.atime, 1_000_000_000);
	assert_eq!(root.birthtime, 1_000_000_000);
	assert!(root.db[0] != 0);

	let ents = read_dirents(img.as_file(), (root.db[0] * sb.fsize as i64) as u64);
	assert_eq!(ents.len(), 3);
	assert_eq!(ents[0], (2, 12, DT_DIR, ".".into()));
	assert_eq!(ents[1], (2, 12, DT_DIR, "..".into()));
	assert_eq!(
		ents[2],
		(3, (DIRBLKSIZ - 24) as u16, DT_DIR, ".snap".into())
	);

	// .snap: setgid directory owned by operator (unresolvable here -> 0)
	let snap = read_inode2(img.as_file(), &sb, UFS_ROOTINO + 1);
	assert_eq!(snap.mode, S_IFDIR | 0o2755);
	assert_eq!(snap.nlink, 2);
	assert_eq!(snap.dirdepth, 1);
	let ents = read_dirents(img.as_file(), (snap.db[0] * sb.fsize as i64) as u64);
	assert_eq!(ents.len(), 2);
	assert_eq!(ents[0].3, ".");
	assert_eq!(ents[0].0, 3);
	assert_eq!(ents[1].3, "..");
	assert_eq!(ents[1].0, 2);

	// two directories were allocated
	assert_eq!(sb.cstotal.ndir, 2);

	// backup superblocks live at every cgsblock and carry the real magic
	for g in 0..sb.ncg as i64 {
		let alt = read_sb(img.as_file(), (sb.cgsblock(g) * sb.fsize as i64) as usize);
		assert_eq!(alt.magic, FS_UFS2_MAGIC);
		assert_eq!(alt.sblockactualloc, sb.cgsblock(g) * sb.fsize as i64);
	}

	// UFS2 recovery record in the last boot-area sector
	let mut tail = [0u8; 20];
	img.as_file()
		.read_exact_at(&mut tail, (SBLOCK_UFS2 - 20) as u64)
		.unwrap();
	let fsr: FsRecovery = codec::decode(&tail).unwrap();
	assert_eq!(fsr.magic, FS_UFS2_MAGIC);
	assert_eq!(fsr.fpg, sb.fpg);
	assert_eq!(fsr.sblkno, sb.sblkno);
	assert_eq!(fsr.ncg, sb.ncg as i32);
}

#[test]
fn s2_ufs1_legacy() {
	let cfg = Config {
		version: 1,
		bsize: 8192,
		fsize: 1024,
		..base_cfg(16 << 20)
	};
	let (img, _mkfs) = format(16 << 20, cfg);
	let sb = read_sb(img.as_file(), SBLOCK_UFS1);

	assert_eq!(sb.magic, FS_UFS1_MAGIC);
	assert!(sb.ipg <= 0x7fff);
	assert_eq!(sb.old_size, sb.size as i32);
	assert_eq!(sb.old_dsize, sb.dsize as i32);
	assert_eq!(sb.old_csaddr, sb.csaddr as i32);
	assert_eq!(sb.old_cstotal.nbfree as i64, sb.cstotal.nbfree);
	assert_eq!(sb.old_cstotal.nifree as i64, sb.cstotal.nifree);
	assert_eq!(sb.old_cstotal.nffree as i64, sb.cstotal.nffree);
	assert_eq!(sb.old_cstotal.ndir as i64, sb.cstotal.ndir);
	assert_eq!(sb.metackhash, 0);
	assert_eq!(sb.ckhash, 0);

	let root = read_inode1(img.as_file(), &sb, UFS_ROOTINO);
	assert_eq!(root.mode, 0o040755);
	assert_eq!(root.nlink, 3);

	// the whole inode table is written; blocks past the first two carry
	// generation numbers
	let late = sb.ipg - 1;
	assert!(late as i64 / sb.inopb as i64 >= 2);
	let ino = read_inode1(img.as_file(), &sb, late);
	assert_ne!(ino.gen, 0);
	assert_eq!(ino.mode, 0);

	// no UFS2 recovery block: the 20-byte tail is zeroed
	let mut tail = [0u8; 20];
	img.as_file()
		.read_exact_at(&mut tail, (SBLOCK_UFS2 - 20) as u64)
		.unwrap();
	assert_eq!(tail, [0u8; 20]);
}

#[test]
fn s3_no_snap() {
	let cfg = Config {
		nosnap: true,
		..base_cfg(64 << 20)
	};
	let (img, _mkfs) = format(64 << 20, cfg);
	let sb = read_sb(img.as_file(), SBLOCK_UFS2);

	let root = read_inode2(img.as_file(), &sb, UFS_ROOTINO);
	assert_eq!(root.nlink, 2);
	let ents = read_dirents(img.as_file(), (root.db[0] * sb.fsize as i64) as u64);
	assert_eq!(ents.len(), 2);
	assert_eq!(ents[1], (2, (DIRBLKSIZ - 12) as u16, DT_DIR, "..".into()));

	// inode 3 was never installed
	let snap = read_inode2(img.as_file(), &sb, UFS_ROOTINO + 1);
	assert_eq!(snap.mode, 0);
	assert_eq!(snap.nlink, 0);
	assert_eq!(sb.cstotal.ndir, 1);
	assert_eq!(sb.cstotal.nifree, sb.ncg as i64 * sb.ipg as i64 - 3);
}

#[test]
fn s4_clustering() {
	let cfg = Config {
		bsize: 65536,
		fsize: 8192,
		..base_cfg(1 << 30)
	};
	let (img, _mkfs) = format(1 << 30, cfg);
	let sb = read_sb(img.as_file(), SBLOCK_UFS2);

	assert_eq!(sb.bsize, 65536);
	assert_eq!(sb.fsize, 8192);
	assert_eq!(sb.contigsumsize, 8);

	// long free runs exist, and they are recorded at the cap
	let (cg, buf) = read_cg(img.as_file(), &sb, 1);
	let off = cg.clustersumoff as usize;
	let capped = i32::from_le_bytes(buf[off + 4 * 8..off + 4 * 8 + 4].try_into().unwrap());
	assert!(capped > 0);
}

#[test]
fn s5_dry_run_writes_nothing() {
	let bytes = 64u64 << 20;
	let img = NamedTempFile::new().unwrap();
	img.as_file().set_len(bytes).unwrap();
	let file = File::options()
		.read(true)
		.write(true)
		.open(img.path())
		.unwrap();
	let mut mkfs = Mkfs::new(Device::new(Some(file), 512, true), base_cfg(bytes));
	mkfs.run().unwrap();

	// geometry was solved, but the image stayed untouched
	assert_eq!(mkfs.superblock().ncg, 4);
	let mut buf = vec![0u8; SBLOCKSIZE];
	img.as_file()
		.read_exact_at(&mut buf, SBLOCK_UFS2 as u64)
		.unwrap();
	assert!(buf.iter().all(|b| *b == 0));
	let mut last = vec![0u8; 512];
	img.as_file()
		.read_exact_at(&mut last, bytes - 512)
		.unwrap();
	assert!(last.iter().all(|b| *b == 0));
}

#[test]
fn s6_too_small_leaves_device_untouched() {
	let bytes = 128u64 << 10;
	let img = NamedTempFile::new().unwrap();
	img.as_file().set_len(bytes).unwrap();
	let file = File::options()
		.read(true)
		.write(true)
		.open(img.path())
		.unwrap();
	let mut mkfs = Mkfs::new(Device::new(Some(file), 512, false), base_cfg(bytes));
	let e = mkfs.run().unwrap_err();
	assert_eq!(e.code(), 28);

	let mut buf = vec![0u8; bytes as usize];
	img.as_file().read_exact_at(&mut buf, 0).unwrap();
	assert!(buf.iter().all(|b| *b == 0));
}

/// Re-derive each group's free counts, fragment histogram, and cluster
/// summary from the on-disk maps and compare them with the stored header
/// and summary array.
fn check_consistency(img: &File, sb: &Superblock) {
	let frag = sb.frag as i64;

	// superblock check-hash
	if sb.metackhash & CK_SUPERBLOCK != 0 {
		let mut decoded = read_sb(img, sb.sblockloc as usize);
		let stored = decoded.ckhash;
		decoded.ckhash = 0;
		let mut buf = vec![0u8; SBLOCKSIZE];
		codec::encode(&decoded, &mut buf).unwrap();
		assert_eq!(crc32c::cksum(&buf[..sb.sbsize as usize]), stored);
	}

	// summary array
	let mut csbuf = vec![0u8; sb.cssize as usize];
	img.read_exact_at(&mut csbuf, (sb.csaddr * sb.fsize as i64) as u64)
		.unwrap();
	let mut total = (0i64, 0i64, 0i64, 0i64);

	for g in 0..sb.ncg as i64 {
		let (cg, buf) = read_cg(img, sb, g);

		// cg check-hash
		if sb.metackhash & CK_CYLGRP != 0 {
			let mut copy = buf.clone();
			let mut hdr: CylGroup = codec::decode(&buf).unwrap();
			let stored = hdr.ckhash;
			hdr.ckhash = 0;
			codec::encode(&hdr, &mut copy).unwrap();
			assert_eq!(crc32c::cksum(&copy), stored, "cg{g} ckhash");
		}

		// summary entry matches the header
		let cs: Csum = codec::decode(&csbuf[g as usize * 16..]).unwrap();
		assert_eq!(cs.ndir, cg.cs.ndir, "cg{g} ndir");
		assert_eq!(cs.nbfree, cg.cs.nbfree, "cg{g} nbfree");
		assert_eq!(cs.nifree, cg.cs.nifree, "cg{g} nifree");
		assert_eq!(cs.nffree, cg.cs.nffree, "cg{g} nffree");
		total.0 += cs.ndir as i64;
		total.1 += cs.nbfree as i64;
		total.2 += cs.nifree as i64;
		total.3 += cs.nffree as i64;

		// re-derive the free counts and histogram from the fragment map
		let freeoff = cg.freeoff as usize;
		let free = |f: i64| bitmap::isset(&buf[freeoff..], f);
		let ndblk = cg.ndblk as i64;
		let mut nbfree = 0i32;
		let mut nffree = 0i32;
		let mut frsum = [0u32; MAXFRAG];
		let mut d = 0;
		while d < ndblk {
			let end = (d + frag).min(ndblk);
			if end - d == frag && (d..end).all(free) {
				nbfree += 1;
				d += frag;
				continue;
			}
			let mut run = 0usize;
			for f in d..end {
				if free(f) {
					run += 1;
					nffree += 1;
				} else if run > 0 {
					frsum[run] += 1;
					run = 0;
				}
			}
			if run > 0 {
				frsum[run] += 1;
			}
			d += frag;
		}
		assert_eq!(nbfree, cg.cs.nbfree, "cg{g} map nbfree");
		assert_eq!(nffree, cg.cs.nffree, "cg{g} map nffree");
		assert_eq!(frsum, cg.frsum, "cg{g} frsum");

		// inode-used map agrees with the free-inode count
		let iusedoff = cg.iusedoff as usize;
		let ipg = if sb.v1() {
			cg.old_niblk as i64
		} else {
			cg.niblk as i64
		};
		let used = (0..ipg)
			.filter(|i| bitmap::isset(&buf[iusedoff..], *i))
			.count() as i64;
		assert_eq!(used, ipg - cg.cs.nifree as i64, "cg{g} inode map");

		// cluster map mirrors whole-free blocks, and the run histogram
		// matches it
		if sb.contigsumsize > 0 {
			let clusteroff = cg.clusteroff as usize;
			for h in 0..cg.nclusterblks as i64 {
				assert_eq!(
					bitmap::isset(&buf[clusteroff..], h),
					bitmap::isblock(sb.frag, &buf[freeoff..], h),
					"cg{g} cluster bit {h}"
				);
			}
			let mut sump = vec![0i32; sb.contigsumsize as usize + 1];
			let mut run = 0i32;
			for h in 0..cg.nclusterblks as i64 {
				if bitmap::isset(&buf[clusteroff..], h) {
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
				let stored =
					i32::from_le_bytes(buf[off + 4 * i..off + 4 * i + 4].try_into().unwrap());
				assert_eq!(stored, *v, "cg{g} clustersum[{i}]");
			}
		}
	}

	assert_eq!(total.0, sb.cstotal.ndir);
	assert_eq!(total.1, sb.cstotal.nbfree);
	assert_eq!(total.2, sb.cstotal.nifree);
	assert_eq!(total.3, sb.cstotal.nffree);

	// decode/encode round-trip reproduces the on-disk superblock bytes
	let mut raw = vec![0u8; SB_STRUCT_SIZE];
	img.read_exact_at(&mut raw, sb.sblockloc as u64).unwrap();
	let decoded: Superblock = codec::decode(&raw).unwrap();
	let mut buf = vec![0u8; SBLOCKSIZE];
	codec::encode(&decoded, &mut buf).unwrap();
	assert_eq!(&raw[..], &buf[..SB_STRUCT_SIZE]);
}

#[rstest]
#[case::ufs2_defaults(2, 0, 0, false, 64 << 20)]
#[case::ufs2_large_frags(2, 65536, 8192, false, 256 << 20)]
#[case::ufs2_nosnap(2, 0, 0, true, 64 << 20)]
#[case::ufs1(1, 8192, 1024, false, 16 << 20)]
#[case::ufs1_nosnap(1, 16384, 2048, true, 64 << 20)]
fn image_consistency(
	#[case] version: u8,
	#[case] bsize: i32,
	#[case] fsize: i32,
	#[case] nosnap: bool,
	#[case] bytes: u64,
) {
	let cfg = Config {
		version,
		bsize,
		fsize,
		nosnap,
		..base_cfg(bytes)
	};
	let (img, _mkfs) = format(bytes, cfg);
	let loc = if version == 1 {
		SBLOCK_UFS1
	} else {
		SBLOCK_UFS2
	};
	let sb = read_sb(img.as_file(), loc);
	check_consistency(img.as_file(), &sb);
}

#[test]
fn regression_mode_is_deterministic() {
	let bytes = 64u64 << 20;
	let (a, _) = format(bytes, base_cfg(bytes));
	let (b, _) = format(bytes, base_cfg(bytes));

	let mut bufa = vec![0u8; 1 << 20];
	let mut bufb = vec![0u8; 1 << 20];
	let mut off = 0u64;
	while off < bytes {
		a.as_file().read_exact_at(&mut bufa, off).unwrap();
		b.as_file().read_exact_at(&mut bufb, off).unwrap();
		assert_eq!(bufa, bufb, "images differ at offset {off}");
		off += 1 << 20;
	}
}
