//! Resource group descriptors and the rindex file.
//!
//! A resource group is one header block, a run of bitmap continuation
//! blocks, and the span of data blocks the bitmaps govern. The rindex file
//! lists every group as a fixed-size record. Descriptors live in an ordered
//! set keyed by the header address.

use crate::disk::BlockDev;
use crate::inode::Metafile;
use crate::meta;
use crate::meta::RgHeader;
use crate::meta::META_HEADER_SIZE;
use crate::meta::META_TYPE_RB;
use crate::meta::META_TYPE_RG;
use crate::meta::NBBY;
use crate::meta::RG_HEADER_SIZE;
use crate::meta::RINDEX_RECORD_SIZE;
use crate::util::ceil_division;
use std::collections::BTreeMap;
use std::io;

/// The ordered set of resource group descriptors, keyed by header address.
pub type RgrpSet = BTreeMap<u64, Rgrp>;

/// In-memory descriptor of one resource group.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct Rgrp {
	/// Block address of the group header.
	pub addr: u64,
	/// Number of blocks occupied by the header and its bitmaps.
	pub length: u32,
	/// First data block governed by the group.
	pub data0: u64,
	/// Number of data blocks governed by the group.
	pub data: u32,
	/// Number of bitmap bytes.
	pub bitbytes: u32,

	/// Number of free data blocks. Runtime only.
	pub free: u32,
	/// Number of dinodes allocated in the group. Runtime only.
	pub dinodes: u32,
	/// Inode generation counter. Runtime only.
	pub igeneration: u64,
	/// Distance to the next group, as laid out. Runtime only.
	pub skip: u64,
	/// Set when the descriptor was fabricated over a damaged header.
	pub damaged: bool,
}

impl Rgrp {
	/// Creates a descriptor for a group whose header is at `addr`.
	pub fn new(addr: u64) -> Self {
		Self {
			addr,
			length: 1,
			..Default::default()
		}
	}

	/// Fills the derived fields of the descriptor from the span of blocks
	/// the group covers, keeping the data count a multiple of the states
	/// packed per bitmap byte.
	pub fn fill_from_span(&mut self, bsize: u32, span: u64) {
		let (bitblocks, data) = rgblocks_to_bitblocks(bsize, span);

		self.length = bitblocks;
		self.data0 = self.addr + bitblocks as u64;
		self.data = data;
		self.bitbytes = data / NBBY;
		self.skip = span;
	}

	/// Decodes a descriptor from an rindex record.
	pub fn from_record(buf: &[u8]) -> Self {
		Self {
			addr: meta::get_u64(buf, 0),
			length: meta::get_u32(buf, 8),
			data0: meta::get_u64(buf, 16),
			data: meta::get_u32(buf, 24),
			bitbytes: meta::get_u32(buf, 28),
			..Default::default()
		}
	}

	/// Encodes the descriptor as an rindex record.
	pub fn to_record(&self) -> [u8; RINDEX_RECORD_SIZE] {
		let mut buf = [0; RINDEX_RECORD_SIZE];

		meta::put_u64(&mut buf, 0, self.addr);
		meta::put_u32(&mut buf, 8, self.length);
		meta::put_u64(&mut buf, 16, self.data0);
		meta::put_u32(&mut buf, 24, self.data);
		meta::put_u32(&mut buf, 28, self.bitbytes);

		buf
	}

	/// Builds the on-disk header for the group.
	pub fn header(&self) -> RgHeader {
		RgHeader {
			flags: 0,
			free: self.free,
			dinodes: self.dinodes,
			igeneration: self.igeneration,
		}
	}

	/// Tells whether the index fields of two descriptors match.
	pub fn same_index(&self, other: &Self) -> bool {
		self.addr == other.addr
			&& self.length == other.length
			&& self.data0 == other.data0
			&& self.data == other.data
			&& self.bitbytes == other.bitbytes
	}
}

/// Computes the number of bitmap blocks (header included) and the data
/// block count for a group spanning `rgblocks` blocks.
///
/// The data count is rounded down to a multiple of the allocation states
/// packed per bitmap byte.
pub fn rgblocks_to_bitblocks(bsize: u32, rgblocks: u64) -> (u32, u32) {
	// Data blocks mappable by the header block and by each continuation
	let blks_rgrp = NBBY as u64 * (bsize as u64 - RG_HEADER_SIZE as u64);
	let blks_meta = NBBY as u64 * (bsize as u64 - META_HEADER_SIZE as u64);

	let bitblocks = if rgblocks > blks_rgrp {
		ceil_division(rgblocks - blks_rgrp, blks_meta) + 1
	} else {
		1
	};
	let data = rgblocks.saturating_sub(bitblocks) & !3;

	(bitblocks as u32, data as u32)
}

/// Reads the on-disk rindex into a descriptor set.
///
/// A trailing partial record is ignored; insertion orders and deduplicates
/// by address.
pub fn rindex_read(dev: &mut BlockDev, ri: &Metafile) -> io::Result<RgrpSet> {
	let count = ri.size() / RINDEX_RECORD_SIZE as u64;
	let mut set = RgrpSet::new();

	for i in 0..count {
		let mut buf = [0; RINDEX_RECORD_SIZE];
		let read = ri.readi(dev, i * RINDEX_RECORD_SIZE as u64, &mut buf)?;
		if read < RINDEX_RECORD_SIZE {
			break;
		}

		let rg = Rgrp::from_record(&buf);
		set.insert(rg.addr, rg);
	}

	Ok(set)
}

/// Writes one descriptor to the rindex file at the given record slot.
pub fn rindex_write_record(
	dev: &mut BlockDev,
	ri: &mut Metafile,
	slot: u64,
	rg: &Rgrp,
) -> io::Result<()> {
	ri.writei(dev, slot * RINDEX_RECORD_SIZE as u64, &rg.to_record())
}

/// Validates every block in the group's footprint: the header must carry
/// the resource group tag and each following block the bitmap tag.
///
/// Returns the address of the first offending block.
pub fn rgrp_read(dev: &mut BlockDev, rg: &Rgrp) -> io::Result<Option<u64>> {
	for i in 0..rg.length as u64 {
		let addr = rg.addr + i;
		let buf = dev.read_block(addr)?;

		let expected = if i == 0 { META_TYPE_RG } else { META_TYPE_RB };
		if !meta::check_meta(&buf, expected) {
			return Ok(Some(addr));
		}
	}

	Ok(None)
}
