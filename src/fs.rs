//! Filesystem context shared by the repair passes.

use crate::disk::BlockDev;
use crate::inode::Metafile;
use crate::meta;
use crate::meta::Superblock;
use crate::rgrp::Rgrp;
use crate::rgrp::RgrpSet;
use log::warn;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use std::path::Path;

/// An open filesystem: the device, its superblock and the rindex file.
pub struct Filesystem {
	/// The device holding the filesystem.
	pub dev: BlockDev,
	/// The superblock.
	pub sb: Superblock,
	/// Block address of the superblock.
	pub sb_addr: u64,
	/// The rindex file.
	pub riinode: Metafile,
	/// The reconciled descriptor set, once a repair pass has accepted one.
	pub(crate) rgrps: RgrpSet,
}

impl Filesystem {
	/// Opens the filesystem on the device at the given path.
	///
	/// Reads and validates the superblock, then the rindex dinode it points
	/// to. The rindex file's content is not trusted at this point.
	pub fn open(path: &Path) -> io::Result<Self> {
		let mut dev = BlockDev::open(path)?;

		let mut buf = [0; 512];
		dev.read_at(meta::SB_OFFSET, &mut buf)?;
		let sb = Superblock::decode(&buf).ok_or_else(|| {
			Error::new(
				ErrorKind::InvalidData,
				format!("no CFS filesystem found on {}", path.display()),
			)
		})?;

		if sb.fs_format != meta::FS_FORMAT {
			warn!("unknown filesystem format {}, proceeding anyway", sb.fs_format);
		}

		dev.set_block_size(sb.bsize);
		let sb_addr = meta::SB_OFFSET / sb.bsize as u64;
		let riinode = Metafile::open(&mut dev, sb.rindex_addr)?;

		Ok(Self {
			dev,
			sb,
			sb_addr,
			riinode,
			rgrps: RgrpSet::new(),
		})
	}

	/// Iterates over the finalized resource group descriptors, in address
	/// order. Empty until a repair pass succeeds.
	pub fn rgrps(&self) -> impl Iterator<Item = &Rgrp> {
		self.rgrps.values()
	}

	/// Returns the filesystem block size in bytes.
	pub fn bsize(&self) -> u32 {
		self.sb.bsize
	}

	/// Returns the address of the first block past the superblock, where
	/// the first resource group lives.
	pub fn first_rg_addr(&self) -> u64 {
		self.sb_addr + 1
	}

	/// Returns the number of blocks in two physical gigabytes, the largest
	/// span one resource group can cover.
	pub fn two_gigs_blocks(&self) -> u64 {
		let mega_in_blocks = (1024 * 1024) / self.bsize() as u64;
		2048 * mega_in_blocks
	}
}
