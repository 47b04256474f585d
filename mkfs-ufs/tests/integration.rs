use std::{fs::File, os::unix::fs::FileExt, process::Command};

use assert_cmd::cargo::CommandCargoExt;
use mkufs::{
	codec,
	data::{Superblock, FS_UFS1_MAGIC, FS_UFS2_MAGIC, SBLOCKSIZE, SBLOCK_UFS1, SBLOCK_UFS2},
};
use tempfile::NamedTempFile;

fn image(bytes: u64) -> NamedTempFile {
	let img = NamedTempFile::new().unwrap();
	img.as_file().set_len(bytes).unwrap();
	img
}

fn mkfs() -> Command {
	Command::cargo_bin("mkfs-ufs").unwrap()
}

fn read_sb(img: &File, loc: usize) -> Superblock {
	let mut buf = vec![0u8; SBLOCKSIZE];
	img.read_exact_at(&mut buf, loc as u64).unwrap();
	codec::decode(&buf).unwrap()
}

#[test]
fn formats_an_image_file() {
	let img = image(64 << 20);
	let out = mkfs()
		.arg("-R")
		.arg(img.path())
		.output()
		.unwrap();
	assert!(out.status.success(), "{:?}", out);

	let stdout = String::from_utf8(out.stdout).unwrap();
	assert!(stdout.contains("64.0MB (131072 sectors)"), "{stdout}");
	assert!(stdout.contains("block size 32768, fragment size 4096"));
	assert!(stdout.contains("using 4 cylinder groups"));
	assert!(stdout.contains("with soft updates"));
	assert!(stdout.contains("super-block backups (for fsck_ffs -b #) at:"));
	// first backup: fsbtodb(cgsblock(0)) = 24 << 3
	assert!(stdout.contains(" 192,"), "{stdout}");

	let sb = read_sb(img.as_file(), SBLOCK_UFS2);
	assert_eq!(sb.magic, FS_UFS2_MAGIC);
	assert_eq!(sb.ncg, 4);
}

#[test]
fn ufs1_format() {
	let img = image(16 << 20);
	let st = mkfs()
		.args(["-R", "-O", "1", "-b", "8192", "-f", "1024"])
		.arg(img.path())
		.status()
		.unwrap();
	assert!(st.success());

	let sb = read_sb(img.as_file(), SBLOCK_UFS1);
	assert_eq!(sb.magic, FS_UFS1_MAGIC);
	assert!(sb.ipg <= 0x7fff);
}

#[test]
fn dry_run_prints_but_does_not_write() {
	let img = image(64 << 20);
	let out = mkfs()
		.args(["-R", "-N"])
		.arg(img.path())
		.output()
		.unwrap();
	assert!(out.status.success());

	let stdout = String::from_utf8(out.stdout).unwrap();
	assert!(stdout.contains("super-block backups (for fsck_ffs -b #) at:"));
	assert!(stdout.contains(" 192,"));

	let mut buf = vec![0u8; SBLOCKSIZE];
	img.as_file()
		.read_exact_at(&mut buf, SBLOCK_UFS2 as u64)
		.unwrap();
	assert!(buf.iter().all(|b| *b == 0));
}

#[test]
fn volume_label_lands_in_the_superblock() {
	let img = image(64 << 20);
	let st = mkfs()
		.args(["-R", "-L", "scratch"])
		.arg(img.path())
		.status()
		.unwrap();
	assert!(st.success());

	let sb = read_sb(img.as_file(), SBLOCK_UFS2);
	assert_eq!(&sb.volname[..8], b"scratch\0");
}

#[test]
fn too_small_device_exits_28() {
	let img = image(128 << 10);
	let st = mkfs().arg("-R").arg(img.path()).status().unwrap();
	assert_eq!(st.code(), Some(28));
}

#[test]
fn usage_errors_exit_1() {
	let st = mkfs().arg("-z").arg("/nonexistent").status().unwrap();
	assert_eq!(st.code(), Some(1));

	let st = mkfs()
		.args(["-O", "3", "/nonexistent"])
		.status()
		.unwrap();
	assert_eq!(st.code(), Some(1));

	let st = mkfs()
		.args(["-L", "bad label", "/nonexistent"])
		.status()
		.unwrap();
	assert_eq!(st.code(), Some(1));
}

#[test]
fn unopenable_device_exits_1() {
	let st = mkfs()
		.arg("/nonexistent/禁/dev")
		.status()
		.unwrap();
	assert_eq!(st.code(), Some(1));
}

#[test]
fn exit_after_stage_toggle() {
	// stage 1 stops after the sentinel superblock: bad magic on disk
	let img = image(64 << 20);
	let out = mkfs()
		.args(["-R", "-X"])
		.arg(img.path())
		.output()
		.unwrap();
	assert!(out.status.success());
	let stdout = String::from_utf8(out.stdout).unwrap();
	assert!(stdout.contains("** Exiting on Xflag 1"));

	let sb = read_sb(img.as_file(), SBLOCK_UFS2);
	assert_ne!(sb.magic, FS_UFS2_MAGIC);
}
