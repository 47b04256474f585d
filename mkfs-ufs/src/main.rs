use std::{fs::File, process::exit};

use anyhow::{Context, Result};
use clap::Parser;
use mkufs::{Config, Device, Mkfs};

use crate::cli::Cli;

mod cli;

fn main() {
	let cli = match Cli::try_parse() {
		Ok(cli) => cli,
		Err(e) => {
			let _ = e.print();
			exit(1);
		},
	};

	env_logger::Builder::from_default_env()
		.format_timestamp(None)
		.init();

	if let Err(e) = run(cli) {
		match e.downcast_ref::<mkufs::Error>() {
			Some(err) => {
				eprintln!("mkfs-ufs: {err}");
				exit(err.code());
			},
			None => {
				eprintln!("mkfs-ufs: {e:#}");
				exit(1);
			},
		}
	}
}

fn run(cli: Cli) -> Result<()> {
	let mut cfg: Config = cli.config()?;

	// No path prefix; try prefixing /dev/.
	let special = if cli.device.contains('/') {
		cli.device.clone()
	} else {
		format!("/dev/{}", cli.device)
	};

	let file = match File::options().read(true).write(true).open(&special) {
		Ok(f) => Some(f),
		Err(e) if cli.dryrun => {
			log::debug!("{special}: {e}; continuing without the device");
			None
		},
		Err(e) => {
			return Err(e).with_context(|| format!("failed to open disk for writing {special}"))
		},
	};

	let mut sectorsize = cli.sectorsize;
	if sectorsize == 0 {
		sectorsize = file
			.as_ref()
			.and_then(sector_size)
			.context("can't get sector size")?;
	}
	match file.as_ref() {
		Some(f) => cfg.mediasize = media_size(f).context("can't get media size")?,
		None if cfg.fssize == 0 => anyhow::bail!("can't get media size"),
		None => {},
	}

	cfg.device = special;
	cfg.operator_gid = operator_gid();
	cfg.line_width = charsperline();

	let dev = Device::new(file, sectorsize, cli.dryrun);
	Mkfs::new(dev, cfg).run()?;
	Ok(())
}

/// Bytes per sector of the underlying device; regular files get the
/// historic 512-byte sectors.
fn sector_size(file: &File) -> Option<i32> {
	if is_regular(file) {
		return Some(512);
	}
	#[cfg(target_os = "linux")]
	{
		use std::os::unix::io::AsRawFd;
		let mut ssize: libc::c_int = 0;
		if unsafe { libc::ioctl(file.as_raw_fd(), libc::BLKSSZGET, &mut ssize) } == 0 {
			return Some(ssize);
		}
	}
	None
}

/// Device size in bytes; for regular files, the file length.
fn media_size(file: &File) -> Option<i64> {
	if is_regular(file) {
		return file.metadata().ok().map(|m| m.len() as i64);
	}
	#[cfg(target_os = "linux")]
	{
		use std::os::unix::io::AsRawFd;
		// Not exposed by the `libc` crate; value matches <linux/fs.h>'s
		// `BLKGETSIZE64 _IOR(0x12, 114, size_t)` on this platform.
		const BLKGETSIZE64: libc::Ioctl = 0x8008_1272;
		let mut msize: u64 = 0;
		if unsafe { libc::ioctl(file.as_raw_fd(), BLKGETSIZE64, &mut msize) } == 0 {
			return Some(msize as i64);
		}
	}
	None
}

fn is_regular(file: &File) -> bool {
	file.metadata().map(|m| m.is_file()).unwrap_or(false)
}

/// gid of the `operator` group, which owns `.snap`.
fn operator_gid() -> Option<u32> {
	let grp = unsafe { libc::getgrnam(b"operator\0".as_ptr().cast()) };
	if grp.is_null() {
		None
	} else {
		Some(unsafe { (*grp).gr_gid })
	}
}

/// Columns available for the backup superblock listing.
fn charsperline() -> usize {
	let mut ws: libc::winsize = unsafe { std::mem::zeroed() };
	if unsafe { libc::ioctl(0, libc::TIOCGWINSZ, &mut ws) } != -1 && ws.ws_col != 0 {
		return ws.ws_col as usize;
	}
	if let Some(cols) = std::env::var("COLUMNS")
		.ok()
		.and_then(|c| c.parse::<usize>().ok())
		.filter(|c| *c > 0)
	{
		return cols;
	}
	80
}
