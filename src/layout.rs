//! Layout calculation: the rindex a fresh format would have produced.
//!
//! Used when the on-disk rindex might be fine but needs verifying: compute
//! what the formatter would have laid out for this device and compare.

use crate::fs::Filesystem;
use crate::meta::RINDEX_RECORD_SIZE;
use crate::rgrp::rgblocks_to_bitblocks;
use crate::rgrp::Rgrp;
use crate::rgrp::RgrpSet;
use crate::util::ceil_division;
use log::info;
use log::warn;

/// Default resource group size in mebibytes.
pub const RG_SIZE_DEFAULT: u32 = 2048;
/// Smallest resource group size considered, in mebibytes.
pub const RG_SIZE_MIN: u32 = 32;
/// A group's header and bitmap blocks must fit this count, the most the
/// on-disk length field can describe.
const MAX_BITBLOCKS: u32 = 2149;

/// Returns how many groups of `rgsize_mb` mebibytes cover `avail` blocks,
/// or `None` when either the majority-sized groups or the first
/// (remainder-absorbing) one would overflow the bitmap block limit.
fn how_many_rgrps(avail: u64, bsize: u32, rgsize_mb: u32) -> Option<u64> {
	if avail == 0 {
		return None;
	}

	let rg_blocks = rgsize_mb as u64 * 1024 * 1024 / bsize as u64;
	let nrgrp = ceil_division(avail, rg_blocks);

	let (bitblocks_n, _) = rgblocks_to_bitblocks(bsize, avail / nrgrp);
	let (bitblocks_1, _) =
		rgblocks_to_bitblocks(bsize, avail - (nrgrp - 1) * (avail / nrgrp));

	(bitblocks_1 <= MAX_BITBLOCKS && bitblocks_n <= MAX_BITBLOCKS).then_some(nrgrp)
}

/// Lays out resource groups the way a fresh format would.
///
/// Addresses begin right after the superblock; every following group is one
/// skip further. The first skip absorbs the division remainder so that the
/// groups cover the device exactly.
///
/// Returns `None` when the group size is unusable for this geometry.
pub fn compute_layout(
	devlen: u64,
	bsize: u32,
	sb_addr: u64,
	rgsize_mb: u32,
) -> Option<RgrpSet> {
	let avail = devlen.checked_sub(sb_addr + 1)?;
	let nrgrp = how_many_rgrps(avail, bsize, rgsize_mb)?;
	let rglength = avail / nrgrp;

	let mut set = RgrpSet::new();
	let mut addr = sb_addr + 1;
	for i in 0..nrgrp {
		let skip = if i == 0 {
			avail - (nrgrp - 1) * rglength
		} else {
			rglength
		};

		let mut rg = Rgrp::new(addr);
		rg.fill_from_span(bsize, skip);
		rg.free = rg.data;

		addr += skip;
		set.insert(rg.addr, rg);
	}

	Some(set)
}

/// Calculates what the rindex should look like in a perfect world.
///
/// Candidate group sizes are tried from the default downwards. A candidate
/// reproducing the record count asserted by the rindex file size wins
/// immediately; failing that (a truncated or padded index asserts a count
/// no size can produce), the candidate whose addresses agree best with the
/// on-disk records wins and the discrepancy tolerance decides later.
pub fn rindex_calculate(fs: &Filesystem, actual: &RgrpSet) -> Option<RgrpSet> {
	let num_rgs = fs.riinode.size() / RINDEX_RECORD_SIZE as u64;
	let devlen = fs.dev.length();

	let mut best: Option<(usize, RgrpSet)> = None;
	let mut rgsize = RG_SIZE_DEFAULT;
	while rgsize >= RG_SIZE_MIN {
		if let Some(set) = compute_layout(devlen, fs.bsize(), fs.sb_addr, rgsize) {
			if set.len() as u64 == num_rgs {
				info!("rgsize must be: {} MB ({} rgrps)", rgsize, set.len());
				return Some(set);
			}

			let mismatches = address_mismatches(&set, actual);
			if best.as_ref().map(|(m, _)| mismatches < *m).unwrap_or(true) {
				best = Some((mismatches, set));
			}
		}
		rgsize /= 2;
	}

	warn!(
		"no rgrp size matches the {} records the rindex file size asserts",
		num_rgs
	);
	best.map(|(_, set)| set)
}

/// Counts the addresses present in one set but not the other.
fn address_mismatches(a: &RgrpSet, b: &RgrpSet) -> usize {
	a.keys().filter(|addr| !b.contains_key(addr)).count()
		+ b.keys().filter(|addr| !a.contains_key(addr)).count()
}

#[cfg(test)]
mod test {
	use super::*;
	use proptest::prelude::*;

	fn check_invariants(set: &RgrpSet, devlen: u64, sb_addr: u64) {
		assert!(!set.is_empty());
		assert_eq!(*set.keys().next().unwrap(), sb_addr + 1);

		let mut total = 0u64;
		let rgs: Vec<_> = set.values().collect();
		for (i, rg) in rgs.iter().enumerate() {
			assert_eq!(rg.data % 4, 0);
			assert_eq!(rg.bitbytes, rg.data / 4);
			assert_eq!(rg.data0, rg.addr + rg.length as u64);
			assert!(rg.length >= 1);

			if let Some(next) = rgs.get(i + 1) {
				assert!(rg.data0 + rg.data as u64 <= next.addr);
			} else {
				assert!(rg.data0 + rg.data as u64 <= devlen);
			}

			total += rg.length as u64 + rg.data as u64;
		}
		assert!(total <= devlen);
	}

	#[test]
	fn four_gigs_four_rgrps() {
		let bsize = 4096;
		let devlen = 4 * 1024 * 1024 * 1024 / bsize as u64;
		let sb_addr = 65536 / bsize as u64;

		let set = compute_layout(devlen, bsize, sb_addr, 1024).unwrap();
		assert_eq!(set.len(), 4);
		check_invariants(&set, devlen, sb_addr);

		// The default size covers the same device with two groups
		let set = compute_layout(devlen, bsize, sb_addr, RG_SIZE_DEFAULT).unwrap();
		assert_eq!(set.len(), 2);
	}

	#[test]
	fn small_blocks_reject_large_groups() {
		// At 512 byte blocks a 2 GiB group needs more bitmap blocks than
		// the length field can describe
		let bsize = 512;
		let devlen = 8 * 1024 * 1024 * 1024 / bsize as u64;
		let sb_addr = 65536 / bsize as u64;

		assert!(compute_layout(devlen, bsize, sb_addr, RG_SIZE_DEFAULT).is_none());
		let set = compute_layout(devlen, bsize, sb_addr, 1024).unwrap();
		check_invariants(&set, devlen, sb_addr);
	}

	proptest! {
		// Any geometry that yields a layout must satisfy the rindex
		// invariants
		#[test]
		fn layout_closure(bshift in 9u32..=12, devlen_mb in 64u64..4096, rgsize_exp in 0u32..7) {
			let bsize: u32 = 1 << bshift;
			let devlen = devlen_mb * 1024 * 1024 / bsize as u64;
			let sb_addr = 65536 / bsize as u64;
			let rgsize = RG_SIZE_MIN << rgsize_exp;

			if let Some(set) = compute_layout(devlen, bsize, sb_addr, rgsize) {
				check_invariants(&set, devlen, sb_addr);
			}
		}
	}
}
