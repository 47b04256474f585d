use anyhow::{bail, Result};
use clap::{ArgAction, Parser};
use mkufs::{
	data::{AFPDIR, AVFILESIZ, FS_OPTSPACE, FS_OPTTIME, MAXBLKSPERCG, MAXBSIZE, MAXVOLLEN, MINBSIZE, MINFREE},
	Config,
};

/// The traditional single-letter option surface. `-h` carries a tuning
/// value here, so clap's automatic short help is disabled.
#[derive(Parser)]
#[command(
	name = "mkfs-ufs",
	about = "Construct a new UFS1/UFS2 file system",
	disable_help_flag = true
)]
pub struct Cli {
	/// Erase previous disk contents
	#[arg(short = 'E')]
	pub erase: bool,

	/// Enable journaling via gjournal
	#[arg(short = 'J')]
	pub gjournal: bool,

	/// Volume label to add to superblock
	#[arg(short = 'L', value_name = "label")]
	pub label: Option<String>,

	/// Do not create file system, just print out parameters
	#[arg(short = 'N')]
	pub dryrun: bool,

	/// File system format: 1 => UFS1, 2 => UFS2
	#[arg(short = 'O', value_name = "version", default_value_t = 2)]
	pub format: i32,

	/// Regression test, suppress random factors
	#[arg(short = 'R')]
	pub regression: bool,

	/// Sector size
	#[arg(short = 'S', value_name = "size", default_value_t = 0)]
	pub sectorsize: i32,

	/// Accepted for compatibility, ignored
	#[arg(short = 'T', value_name = "type", hide = true)]
	pub disktype: Option<String>,

	/// Enable soft updates
	#[arg(short = 'U')]
	pub softdep: bool,

	/// Exit in middle of newfs for testing
	#[arg(short = 'X', action = ArgAction::Count, hide = true)]
	pub xstage: u8,

	/// Maximum contiguous blocks
	#[arg(short = 'a', value_name = "blocks", default_value_t = 0)]
	pub maxcontig: i32,

	/// Block size
	#[arg(short = 'b', value_name = "size", default_value_t = 0)]
	pub bsize: i32,

	/// Blocks per cylinder group
	#[arg(short = 'c', value_name = "blocks", default_value_t = MAXBLKSPERCG)]
	pub maxblkspercg: i32,

	/// Maximum extent size
	#[arg(short = 'd', value_name = "size", default_value_t = 0)]
	pub maxbsize: i32,

	/// Maximum blocks per file in a cylinder group
	#[arg(short = 'e', value_name = "blocks", default_value_t = 0)]
	pub maxbpg: i32,

	/// Frag size
	#[arg(short = 'f', value_name = "size", default_value_t = 0)]
	pub fsize: i32,

	/// Average file size
	#[arg(short = 'g', value_name = "size", default_value_t = AVFILESIZ)]
	pub avgfilesize: i32,

	/// Average files per directory
	#[arg(short = 'h', value_name = "count", default_value_t = AFPDIR)]
	pub avgfilesperdir: i32,

	/// Number of bytes per inode
	#[arg(short = 'i', value_name = "bytes", default_value_t = 0)]
	pub density: i32,

	/// Enable soft updates journaling
	#[arg(short = 'j')]
	pub suj: bool,

	/// Space to hold for metadata blocks (0 disables the reserve)
	#[arg(short = 'k', value_name = "space")]
	pub metaspace: Option<i32>,

	/// Enable multilabel MAC
	#[arg(short = 'l')]
	pub multilabel: bool,

	/// Minimum free space %
	#[arg(short = 'm', value_name = "percent", default_value_t = MINFREE)]
	pub minfree: i32,

	/// Do not create .snap directory
	#[arg(short = 'n')]
	pub nosnap: bool,

	/// Optimization preference (`space' or `time')
	#[arg(short = 'o', value_name = "optimization")]
	pub optim: Option<String>,

	/// Accepted for compatibility, ignored
	#[arg(short = 'p', value_name = "partition", hide = true)]
	pub partition: Option<String>,

	/// Reserved sectors at the end of the device
	#[arg(short = 'r', value_name = "sectors", default_value_t = 0)]
	pub reserved: i64,

	/// File system size (sectors)
	#[arg(short = 's', value_name = "sectors", default_value_t = 0)]
	pub fssize: i64,

	/// Enable TRIM
	#[arg(short = 't')]
	pub trim: bool,

	#[arg(long = "help", action = ArgAction::Help, help = "Print help")]
	help: Option<bool>,

	/// Special device to format
	pub device: String,
}

impl Cli {
	/// Check the semantic constraints getopt cannot express and build
	/// the engine configuration from the flags.
	pub fn config(&self) -> Result<Config> {
		if self.device.is_empty() {
			bail!("empty file/special name");
		}
		if !(1..=2).contains(&self.format) {
			bail!("{}: bad file system format value", self.format);
		}
		if let Some(label) = &self.label {
			if !label
				.chars()
				.all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
			{
				bail!(
					"bad volume label. Valid characters are alphanumerics, \
					 dashes, and underscores."
				);
			}
			if label.len() >= MAXVOLLEN {
				bail!("bad volume label. Length is longer than {}.", MAXVOLLEN);
			}
		}
		if self.bsize != 0 {
			if self.bsize < MINBSIZE {
				bail!("{}: block size too small, min is {}", self.bsize, MINBSIZE);
			}
			if self.bsize > MAXBSIZE {
				bail!("{}: block size too large, max is {}", self.bsize, MAXBSIZE);
			}
		}
		if self.maxbsize != 0 && self.maxbsize < MINBSIZE {
			bail!("{}: bad extent block size", self.maxbsize);
		}
		let metaspace = match self.metaspace {
			None => 0,
			Some(k) if k < 0 => bail!("{k}: bad metadata space %"),
			// force the reserve to stay zero
			Some(0) => -1,
			Some(k) => k,
		};
		if !(0..=99).contains(&self.minfree) {
			bail!("{}: bad free space %", self.minfree);
		}
		let optim = match self.optim.as_deref() {
			None => FS_OPTTIME,
			Some("space") => FS_OPTSPACE,
			Some("time") => FS_OPTTIME,
			Some(o) => {
				bail!("{o}: unknown optimization preference: use `space' or `time'")
			},
		};

		Ok(Config {
			version: self.format as u8,
			fssize: self.fssize,
			reserved: self.reserved,
			fsize: self.fsize,
			bsize: self.bsize,
			maxbsize: self.maxbsize,
			maxblkspercg: self.maxblkspercg,
			maxcontig: self.maxcontig,
			maxbpg: self.maxbpg,
			minfree: self.minfree,
			metaspace,
			density: self.density,
			optim,
			avgfilesize: self.avgfilesize,
			avgfilesperdir: self.avgfilesperdir,
			label: self.label.clone(),
			softdep: self.softdep,
			suj: self.suj,
			gjournal: self.gjournal,
			multilabel: self.multilabel,
			trim: self.trim,
			nosnap: self.nosnap,
			regression: self.regression,
			erase: self.erase,
			xstage: self.xstage as u32,
			..Config::default()
		})
	}
}
