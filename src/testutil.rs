//! Synthetic filesystem images for the test suite.
//!
//! A miniature formatter: superblock, resource groups with headers and
//! zeroed bitmaps, the rindex file, and optionally a jindex with one
//! journal. Images live in sparse temporary files; unwritten blocks read
//! back as zeros, which no metadata check recognizes.

use crate::disk::BlockDev;
use crate::fs::Filesystem;
use crate::inode;
use crate::layout;
use crate::meta;
use crate::meta::MetaHeader;
use crate::meta::Superblock;
use crate::meta::FS_FORMAT;
use crate::meta::JINDEX_RECORD_SIZE;
use crate::meta::META_FORMAT_RB;
use crate::meta::META_TYPE_RB;
use crate::meta::MULTIHOST_FORMAT;
use crate::meta::RINDEX_RECORD_SIZE;
use crate::rgrp::Rgrp;
use crate::rgrp::RgrpSet;
use crate::util::ceil_division;
use tempfile::NamedTempFile;

/// A journal placed in an image.
pub struct JournalInfo {
	/// Block address of the journal's dinode.
	pub dinode: u64,
	/// First block of the journal's contiguous run.
	pub first_block: u64,
	/// Number of blocks in the journal.
	pub blocks: u64,
}

/// Description of an image to build.
pub struct ImageSpec {
	bsize: u32,
	devlen: u64,
	rgs: RgrpSet,
	journal_blocks: u64,
}

impl ImageSpec {
	/// A uniformly laid out filesystem, as the formatter would produce.
	pub fn uniform(devlen_mb: u64, bsize: u32, rgsize_mb: u32) -> Self {
		let devlen = devlen_mb * 1024 * 1024 / bsize as u64;
		let sb_addr = meta::SB_OFFSET / bsize as u64;
		let rgs = layout::compute_layout(devlen, bsize, sb_addr, rgsize_mb).unwrap();

		Self {
			bsize,
			devlen,
			rgs,
			journal_blocks: 0,
		}
	}

	/// A filesystem grown after format: one region per `(count, stride)`
	/// pair, each region starting where the previous one's data ends.
	pub fn grown(bsize: u32, regions: &[(u32, u64)]) -> Self {
		let sb_addr = meta::SB_OFFSET / bsize as u64;
		let mut rgs = RgrpSet::new();
		let mut addr = sb_addr + 1;
		let mut devlen = addr;

		for (count, stride) in regions {
			for i in 0..*count {
				let mut rg = Rgrp::new(addr);
				rg.fill_from_span(bsize, *stride);
				rg.free = rg.data;

				devlen = addr + stride;
				let next = if i + 1 == *count {
					// The next region begins at this group's data end
					rg.data0 + rg.data as u64
				} else {
					addr + stride
				};
				rgs.insert(addr, rg);
				addr = next;
			}
		}

		Self {
			bsize,
			devlen,
			rgs,
			journal_blocks: 0,
		}
	}

	/// Adds one journal of the given length to the image.
	pub fn journal_blocks(mut self, blocks: u64) -> Self {
		self.journal_blocks = blocks;
		self
	}

	/// Writes the image out.
	pub fn build(self) -> Image {
		let bsize = self.bsize;
		let tmp = NamedTempFile::new().unwrap();
		tmp.as_file().set_len(self.devlen * bsize as u64).unwrap();

		let mut dev = BlockDev::open(tmp.path()).unwrap();
		dev.set_block_size(bsize);

		// Group footprints: header plus zeroed bitmap continuations
		for rg in self.rgs.values() {
			let mut buf = vec![0; bsize as usize];
			let mut hdr = rg.header();
			hdr.free = rg.data;
			hdr.encode(&mut buf);
			dev.write_block(rg.addr, &buf).unwrap();

			for i in 1..rg.length as u64 {
				let mut buf = vec![0; bsize as usize];
				MetaHeader::new(META_TYPE_RB, META_FORMAT_RB).encode(&mut buf);
				dev.write_block(rg.addr + i, &buf).unwrap();
			}
		}

		// System files live in the first group's data area
		let first = self.rgs.values().next().unwrap();
		let mut cursor = first.data0;

		let ri_bytes = self.rgs.len() as u64 * RINDEX_RECORD_SIZE as u64;
		let ri_blocks = ceil_division(ri_bytes.max(1), bsize as u64);
		let ri_di = cursor;
		cursor += 1;
		let ri_ptrs: Vec<u64> = (0..ri_blocks).map(|i| cursor + i).collect();
		cursor += ri_blocks;
		dev.write_block(
			ri_di,
			&inode::encode_dinode(bsize, ri_di, 0o600, 0, ri_bytes, ri_blocks + 1, &ri_ptrs),
		)
		.unwrap();

		let ji_di = cursor;
		cursor += 1;
		let journal = if self.journal_blocks > 0 {
			let ji_data = cursor;
			cursor += 1;
			let j_di = cursor;
			cursor += 1;
			let j_first = cursor;
			cursor += self.journal_blocks;

			// Jindex: one record naming the journal dinode
			let mut rec = vec![0u8; JINDEX_RECORD_SIZE];
			meta::put_u64(&mut rec, 0, j_di);
			let mut blk = vec![0u8; bsize as usize];
			blk[..JINDEX_RECORD_SIZE].copy_from_slice(&rec);
			dev.write_block(ji_data, &blk).unwrap();
			dev.write_block(
				ji_di,
				&inode::encode_dinode(
					bsize,
					ji_di,
					0o600,
					0,
					JINDEX_RECORD_SIZE as u64,
					2,
					&[ji_data],
				),
			)
			.unwrap();

			// The journal itself: contiguous direct blocks, content zeroed
			let j_ptrs: Vec<u64> = (0..self.journal_blocks).map(|i| j_first + i).collect();
			dev.write_block(
				j_di,
				&inode::encode_dinode(
					bsize,
					j_di,
					0o600,
					0,
					self.journal_blocks * bsize as u64,
					self.journal_blocks + 1,
					&j_ptrs,
				),
			)
			.unwrap();

			Some(JournalInfo {
				dinode: j_di,
				first_block: j_first,
				blocks: self.journal_blocks,
			})
		} else {
			dev.write_block(ji_di, &inode::encode_dinode(bsize, ji_di, 0o600, 0, 0, 1, &[]))
				.unwrap();
			None
		};
		assert!(cursor <= first.data0 + first.data as u64);

		// Superblock last, once everything it points at exists
		let sb = Superblock {
			fs_format: FS_FORMAT,
			multihost_format: MULTIHOST_FORMAT,
			bsize,
			bsize_shift: bsize.trailing_zeros(),
			rindex_addr: ri_di,
			jindex_addr: ji_di,
		};
		let mut buf = vec![0; bsize as usize];
		sb.encode(&mut buf);
		dev.write_at(meta::SB_OFFSET, &buf).unwrap();

		// And the rindex records through the file itself
		let mut fs = Filesystem::open(tmp.path()).unwrap();
		for (i, rg) in self.rgs.values().enumerate() {
			crate::rgrp::rindex_write_record(&mut fs.dev, &mut fs.riinode, i as u64, rg)
				.unwrap();
		}

		Image {
			tmp,
			bsize,
			rgs: self.rgs,
			journal,
		}
	}
}

/// A built image, with the layout that was written to it.
pub struct Image {
	/// The backing file.
	pub tmp: NamedTempFile,
	/// The block size.
	pub bsize: u32,
	/// The groups as laid out.
	pub rgs: RgrpSet,
	/// The journal, if one was placed.
	pub journal: Option<JournalInfo>,
}

impl Image {
	/// Opens the image as a filesystem.
	pub fn open(&self) -> Filesystem {
		Filesystem::open(self.tmp.path()).unwrap()
	}

	/// Zeroes one block of the image.
	pub fn zero_block(&self, addr: u64) {
		let mut fs = self.open();
		let buf = vec![0; self.bsize as usize];
		fs.dev.write_block(addr, &buf).unwrap();
	}
}

/// Reads one record back from the rindex file.
pub fn read_record(fs: &mut Filesystem, slot: u64) -> Rgrp {
	let mut buf = [0; RINDEX_RECORD_SIZE];
	let read = fs
		.riinode
		.readi(&mut fs.dev, slot * RINDEX_RECORD_SIZE as u64, &mut buf)
		.unwrap();
	assert_eq!(read, RINDEX_RECORD_SIZE);
	Rgrp::from_record(&buf)
}

/// Patches one record of the rindex file in place.
pub fn patch_record(fs: &mut Filesystem, slot: u64, patch: impl FnOnce(&mut Rgrp)) {
	let mut rg = read_record(fs, slot);
	patch(&mut rg);
	fs.riinode
		.writei(
			&mut fs.dev,
			slot * RINDEX_RECORD_SIZE as u64,
			&rg.to_record(),
		)
		.unwrap();
}
