//! Rebuilding the rindex from what is actually on the device.
//!
//! Last resort: the index cannot be trusted and the groups do not agree
//! with how a fresh format would have laid them out, so the device is
//! walked and the groups counted by hand. The walk skips at known strides
//! where possible and shuffles block by block where it must.

use crate::fs::Filesystem;
use crate::journal;
use crate::meta;
use crate::meta::BlockType;
use crate::meta::RgHeader;
use crate::meta::BLKST_FREE;
use crate::meta::BLKST_UNLINKED;
use crate::meta::META_HEADER_SIZE;
use crate::meta::META_TYPE_RB;
use crate::meta::META_TYPE_RG;
use crate::meta::NBBY;
use crate::meta::RG_HEADER_SIZE;
use crate::meta::STATE_BITS;
use crate::meta::STATE_MASK;
use crate::probe;
use crate::probe::RgSegments;
use crate::rgrp::Rgrp;
use crate::rgrp::RgrpSet;
use crate::RepairError;
use log::debug;
use log::error;
use log::info;
use log::warn;
use std::cmp::min;
use std::io;
use std::io::ErrorKind;

/// Blocks skipped past a damaged group before hunting for the next one, to
/// get clear of the previous group's bitmaps. Empirical.
pub const AWAY_FROM_BITMAPS: u64 = 0x1000;
/// Most consecutive candidate slots allowed to miss a group before the
/// rebuild declares the structure beyond this method's reach.
const MAX_CONSECUTIVE_CORRUPT: u32 = 4;

/// Rebuilds the expected descriptor set by walking the device.
///
/// With `grown` set, the groups are assumed to sit on uneven boundaries
/// (the filesystem was grown after format) and each step is derived from
/// the previous group's own bitmaps instead of the probed strides.
///
/// Returns the rebuilt set along with the probed segments.
pub fn rindex_rebuild(
	fs: &mut Filesystem,
	grown: bool,
) -> Result<(RgrpSet, RgSegments), RepairError> {
	// The journals are needed to ignore journaled group copies; without
	// them every distance could be wrong, so refuse to guess.
	let false_rgrps = match journal::find_journaled_rgs(fs) {
		Ok(set) => set,
		Err(e) if e.kind() == ErrorKind::InvalidData => {
			error!("can't read jindex required for rindex repairs: {}", e);
			return Err(RepairError::Unrecoverable);
		}
		Err(e) => return Err(e.into()),
	};

	let segs = probe::find_shortest_rgdist(fs, &false_rgrps)?;
	for i in 0..segs.len() {
		info!(
			"segment {}: rgrp distance {:#x}, count {}",
			i + 1,
			segs.dist[i],
			segs.count[i]
		);
	}

	let devlen = fs.dev.length();
	let first_rg = fs.first_rg_addr();
	let bsize = fs.bsize();

	let mut rgcalc = RgrpSet::new();
	let mut prev_addr: Option<u64> = None;
	let mut number_of_rgs = 0u32;
	let mut segment_rgs = 0u32;
	let mut segment = 0usize;
	let mut corrupt_rgs = 0u32;
	let mut block_bump = segs.dist[0];

	let mut blk = first_rg;
	while blk < devlen {
		debug!("block {:#x}", blk);
		let buf = fs.dev.read_block(blk)?;
		let rg_was_fnd = meta::check_meta(&buf, META_TYPE_RG);

		let mut calc_rgd = Rgrp::new(blk);
		if rg_was_fnd {
			corrupt_rgs = 0;
			let hdr = RgHeader::decode(&buf);
			calc_rgd.free = hdr.free;
			calc_rgd.dinodes = hdr.dinodes;
			calc_rgd.igeneration = hdr.igeneration;
		} else {
			// This SHOULD be a group but isn't
			calc_rgd.damaged = true;
			corrupt_rgs += 1;
			if corrupt_rgs > MAX_CONSECUTIVE_CORRUPT {
				error!("too many missing or damaged rgrps using this method, time to try another method");
				return Err(RepairError::Unrecoverable);
			}
			debug!("missing or damaged rgrp at block {} ({:#x})", blk, blk);
		}

		// Count the bitmap continuations of this group
		let mut fwd_block = blk + 1;
		while fwd_block < devlen {
			let buf = fs.dev.read_block(fwd_block)?;
			if !meta::check_meta(&buf, META_TYPE_RB) {
				break;
			}
			calc_rgd.length += 1;
			fwd_block += 1;
		}
		calc_rgd.data0 = calc_rgd.addr + calc_rgd.length as u64;

		// The previous group's span is now known: back-fill its allocation
		// fields from the observed stride
		if let Some(prev) = prev_addr {
			if let Some(p) = rgcalc.get_mut(&prev) {
				p.fill_from_span(bsize, block_bump);
				debug!("prev ri_data set to {:#x}", p.data);
			}
		}

		number_of_rgs += 1;
		segment_rgs += 1;
		if rg_was_fnd {
			info!("  rgrp {} at block {:#x} intact", number_of_rgs, blk);
		} else {
			warn!("* rgrp {} at block {:#x} *** DAMAGED ***", number_of_rgs, blk);
		}
		rgcalc.insert(blk, calc_rgd);
		prev_addr = Some(blk);

		// Figure out where the next group should be
		if blk == first_rg || !grown {
			block_bump = segs.dist[segment];
			if segment_rgs >= segs.count[segment] {
				segment += 1;
				debug!("end of segment {}", segment);
				segment_rgs = 0;
				if segment >= segs.len() {
					debug!("last segment");
					break;
				}
			}
			if block_bump == 0 {
				break;
			}
			// Uniformly spaced groups may leave wasted space at the end of
			// the device; a short trailing group would break the
			// uniformity, so stop instead of fabricating one
			if !grown && blk + 2 * block_bump > devlen {
				break;
			}
		} else if rg_was_fnd {
			block_bump = find_next_rgrp_dist(fs, blk)?;
		} else {
			block_bump = hunt_and_peck(fs, blk, block_bump)?;
		}
		if block_bump == 0 {
			break;
		}

		debug!("  [length {:#x}]", block_bump);
		blk += block_bump;
	}

	// The last group has no successor to measure against; give it the
	// remaining stride
	if let Some(prev) = prev_addr {
		if let Some(p) = rgcalc.get_mut(&prev) {
			if p.data == 0 {
				p.fill_from_span(bsize, block_bump);
				debug!("prev ri_data set to {:#x}", p.data);
			}
		}
	}

	debug!("rindex rebuilt as follows:");
	for (i, rg) in rgcalc.values().enumerate() {
		debug!(
			"{}: {:#x}/{:x}/{:#x}/{:x}/{:x}",
			i + 1,
			rg.addr,
			rg.length,
			rg.data0,
			rg.data,
			rg.bitbytes
		);
	}

	Ok((rgcalc, segs))
}

/// Counts the used blocks recorded in one bitmap buffer.
///
/// `first` selects the header block layout, whose bitmap starts after the
/// full group header rather than the generic one.
fn count_usedspace(first: bool, buf: &[u8]) -> u64 {
	let off = if first { RG_HEADER_SIZE } else { META_HEADER_SIZE };

	let mut used = 0;
	for byte in &buf[off..] {
		match *byte {
			// All four states used: common enough to shortcut
			0x55 => used += NBBY as u64,
			0x00 => {}

			b => {
				for y in 0..NBBY {
					let state = (b >> (STATE_BITS * y)) & STATE_MASK;
					if state != BLKST_FREE && state != BLKST_UNLINKED {
						used += 1;
					}
				}
			}
		}
	}

	used
}

/// Finds the distance from the intact group at `blk` to its successor when
/// the groups sit on uneven boundaries.
///
/// The group's bitmaps give its used count; used plus the header's free
/// count plus the bitmap blocks themselves bound where the group ends. A
/// window past that point is scanned for the successor, absorbing the
/// rounding the formatter applies.
fn find_next_rgrp_dist(fs: &mut Filesystem, blk: u64) -> io::Result<u64> {
	let devlen = fs.dev.length();
	let twogigs = fs.two_gigs_blocks();

	let mut used_blocks = 0u64;
	let mut free_blocks = 0u32;
	let mut length = 0u64;
	let mut rgrp_dist = 0u64;
	let mut found = false;

	let mut block = blk;
	let mut first = true;
	loop {
		if block >= devlen || block >= blk + twogigs {
			break;
		}

		let buf = fs.dev.read_block(block)?;
		let expected = if first { META_TYPE_RG } else { META_TYPE_RB };
		if !meta::check_meta(&buf, expected) {
			break;
		}
		if first {
			free_blocks = RgHeader::decode(&buf).free;
		}

		used_blocks += count_usedspace(first, &buf);
		first = false;
		block += 1;
		length += 1;

		// User blocks can look exactly like bitmap blocks; only the
		// used/free accounting says where the group really ends
		rgrp_dist = used_blocks + free_blocks as u64 + length;
		let next_block = blk + rgrp_dist;
		for b in 0..=(length + NBBY as u64) {
			if next_block + b >= devlen {
				break;
			}
			match fs.dev.block_type(next_block + b)? {
				BlockType::Rg => found = true,
				BlockType::Rb => {
					// A bitmap first means a damaged group header sits on
					// the block before it
					found = true;
					rgrp_dist -= 1;
				}

				_ => {}
			}
			if found {
				break;
			}
			rgrp_dist += 1;
		}
		if found {
			info!(
				"rgrp found at {:#x}, length={}, used={}, free={}",
				blk, length, used_blocks, free_blocks
			);
			break;
		}
	}

	Ok(rgrp_dist)
}

/// Finds the distance from the damaged group at `blk` to its successor:
/// skip clear of any bitmaps, then scan for a group tag, at most two
/// gigabytes out.
fn hunt_and_peck(fs: &mut Filesystem, blk: u64, last_bump: u64) -> io::Result<u64> {
	let devlen = fs.dev.length();

	// Skip ahead the previous amount: we might get lucky. Close to the end
	// of the device, take the rest.
	if blk + last_bump >= devlen {
		return Ok(devlen - blk);
	}
	let buf = fs.dev.read_block(blk + last_bump)?;
	if meta::check_meta(&buf, META_TYPE_RG) {
		info!("rgrp found at {:#x}, length={}", blk + last_bump, last_bump);
		return Ok(last_bump);
	}

	let limit = min(fs.two_gigs_blocks(), devlen - blk);
	let mut dist = AWAY_FROM_BITMAPS;
	while dist < limit {
		match fs.dev.block_type(blk + dist)? {
			BlockType::Rg => return Ok(dist),
			// A bitmap first means the real group is one block earlier
			BlockType::Rb => return Ok(dist - 1),

			_ => {}
		}
		dist += 1;
	}

	Ok(devlen - blk)
}
