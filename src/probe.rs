//! Distance probing between resource groups.
//!
//! The stride between consecutive groups is the key to rebuilding the
//! rindex. A single blasted group would make its neighbor look twice as far
//! away, so several distances are sampled per segment and the shortest one
//! wins. A filesystem that was grown after format has several segments,
//! each with its own stride.

use crate::fs::Filesystem;
use crate::meta;
use crate::meta::META_TYPE_RG;
use crate::meta::RINDEX_RECORD_SIZE;
use log::info;
use log::warn;
use std::collections::BTreeSet;
use std::io;

/// Most segments a grown filesystem may carry before probing gives up.
pub const MAX_RG_SEGMENTS: usize = 20;
/// Distance samples needed to settle a segment's stride.
const SAMPLES_NEEDED: u32 = 6;
/// Blocks skipped after a confirmed group while still sampling; far smaller
/// than any valid group spacing.
const SAMPLE_SKIP: u64 = 250;
/// Blocks backed up when a segment ends and a new one may begin.
const SEGMENT_BACKUP: u64 = 16;

/// The strides discovered on the device.
///
/// Entry 0 describes the first group alone: its distance to the second
/// group, which the superblock and the reserved span push off the common
/// grid. Every further entry is one segment's shortest stride and the
/// number of groups attributed to it.
#[derive(Clone, Debug, Default)]
pub struct RgSegments {
	/// Shortest observed stride per segment.
	pub dist: Vec<u64>,
	/// Number of groups attributed to each segment.
	pub count: Vec<u32>,
}

impl RgSegments {
	/// Returns the number of segments.
	pub fn len(&self) -> usize {
		self.dist.len()
	}

	/// Tells whether no segment was found.
	pub fn is_empty(&self) -> bool {
		self.dist.is_empty()
	}
}

/// Hunts for the shortest distance between resource groups, per segment.
///
/// Addresses in `false_rgrps` are never considered groups. The rindex file
/// is only consulted for the first-stride sanity check at the end.
pub fn find_shortest_rgdist(
	fs: &mut Filesystem,
	false_rgrps: &BTreeSet<u64>,
) -> io::Result<RgSegments> {
	let devlen = fs.dev.length();
	let first_rg = fs.first_rg_addr();
	let twogigs = fs.two_gigs_blocks();

	// Entry 0 starts at a marker value so the first measured distance can
	// be told apart from an already settled one.
	let initial_first_rg_dist = first_rg;
	let mut segs = RgSegments {
		dist: vec![initial_first_rg_dist],
		count: vec![0],
	};
	let mut gsegment = 0;
	let mut rgs_sampled = 0;
	let mut shortest = devlen;
	let mut block_last_rg = first_rg;
	// A segment opened after a close starts with a distance spanning the
	// boundary; it is counted but not sampled.
	let mut boundary_pending = false;

	let mut blk = first_rg;
	while blk < devlen {
		let is_rgrp = if blk == first_rg {
			// The first post-superblock block is a group by fiat
			true
		} else if false_rgrps.contains(&blk) {
			false
		} else {
			let buf = fs.dev.read_block(blk)?;
			meta::check_meta(&buf, META_TYPE_RG)
		};

		if !is_rgrp {
			if rgs_sampled >= SAMPLES_NEEDED {
				info!(
					"rgrp not found at block {:#x}, last found rgrp was {:#x}, checking the next one",
					blk, block_last_rg
				);

				// A single damaged group should not end the segment: peek
				// one stride further
				let nblk = blk + segs.dist[gsegment];
				let peek_ok = nblk < devlen && !false_rgrps.contains(&nblk) && {
					let buf = fs.dev.read_block(nblk)?;
					meta::check_meta(&buf, META_TYPE_RG)
				};
				if peek_ok {
					info!("next rgrp is intact, so this one is damaged");
					segs.count[gsegment] += 1;
					blk = nblk;
					continue;
				}

				info!("looking for a new segment");
				blk = blk.saturating_sub(SEGMENT_BACKUP);
				rgs_sampled = 0;
				shortest = devlen;
				gsegment += 1;
				if gsegment >= MAX_RG_SEGMENTS {
					warn!(
						"this file system has more than {} resource group segments",
						MAX_RG_SEGMENTS
					);
					break;
				}
				segs.dist.push(0);
				segs.count.push(0);
				boundary_pending = true;
			}

			if blk - block_last_rg > twogigs {
				info!("no rgrps within 2GB of the last one, must be the end of the file system");
				break;
			}
			blk += 1;
			continue;
		}

		segs.count[gsegment] += 1;

		if rgs_sampled >= SAMPLES_NEEDED {
			// Stride settled: jump group to group
			block_last_rg = blk;
			blk += segs.dist[gsegment];
			continue;
		}

		info!("segment {}: rgrp found at block {:#x}", gsegment + 1, blk);
		let dist = blk - block_last_rg;
		if blk == first_rg {
			// The first group belongs to entry 0 alone
			gsegment += 1;
			segs.dist.push(0);
			segs.count.push(0);
		} else if boundary_pending {
			// Distance from the previous segment's last group; not a
			// sample of this segment's stride
			boundary_pending = false;
		} else {
			if segs.dist[0] == initial_first_rg_dist {
				// The first distance is always different because of the
				// superblock and the reserved span before it
				segs.dist[0] = dist;
				segs.count[0] = 1;
				rgs_sampled = 0;
			}
			if dist < shortest {
				shortest = dist;
				info!("(shortest so far: {:#x})", dist);
			}
			rgs_sampled += 1;
			if rgs_sampled == SAMPLES_NEEDED {
				segs.dist[gsegment] = shortest;
				info!(
					"settled on distance {:#x} for segment {}",
					shortest,
					gsegment + 1
				);
			}
		}

		block_last_rg = blk;
		if rgs_sampled < SAMPLES_NEEDED {
			blk += SAMPLE_SKIP;
		} else {
			blk += segs.dist[gsegment];
		}
	}

	// A segment cut short by the device end settles on what it saw
	if rgs_sampled > 0 && rgs_sampled < SAMPLES_NEEDED && shortest < devlen {
		segs.dist[gsegment] = shortest;
	}
	// Drop a trailing segment that never found a group
	while segs.dist.len() > 1 && *segs.count.last().unwrap_or(&1) == 0 {
		segs.dist.pop();
		segs.count.pop();
	}
	// A segment left without a settled stride inherits its neighbor's
	for i in 1..segs.dist.len() {
		if segs.dist[i] == 0 {
			segs.dist[i] = segs.dist[i - 1];
		}
	}

	first_dist_sanity_check(fs, &mut segs, shortest)?;

	Ok(segs)
}

/// Sanity-check the first-group distance.
///
/// If the second group got blasted, the measured first distance spans
/// group 1 to group 3 and is far too long. The second on-disk rindex record
/// is consulted even though the index is under suspicion; failing that, the
/// distance is extrapolated from the device length and the record count.
fn first_dist_sanity_check(
	fs: &mut Filesystem,
	segs: &mut RgSegments,
	shortest: u64,
) -> io::Result<()> {
	let base = if segs.dist.len() > 1 {
		segs.dist[1]
	} else {
		shortest
	};
	if base == 0 || segs.dist[0] < base + base / 4 {
		return Ok(());
	}

	let first_rg = fs.first_rg_addr();
	let devlen = fs.dev.length();

	let mut rec = [0; RINDEX_RECORD_SIZE];
	let read = fs
		.riinode
		.readi(&mut fs.dev, RINDEX_RECORD_SIZE as u64, &mut rec)?;
	let ri_addr = if read == RINDEX_RECORD_SIZE {
		meta::get_u64(&rec, 0)
	} else {
		0
	};

	if ri_addr > first_rg {
		segs.dist[0] = ri_addr - first_rg;
		warn!(
			"rgrp 2 is damaged: getting dist from index: {:#x}",
			segs.dist[0]
		);
	} else {
		let nrg = fs.riinode.size() / RINDEX_RECORD_SIZE as u64;
		if nrg > 1 {
			segs.dist[0] = devlen - (nrg - 1) * (devlen / nrg);
			warn!(
				"rgrp index 2 is damaged: extrapolating dist: {:#x}",
				segs.dist[0]
			);
		}
	}

	Ok(())
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::testutil::ImageSpec;

	#[test]
	fn uniform_distances() {
		// 256 MiB, 64 MiB groups: four groups, three sampled distances
		let img = ImageSpec::uniform(256, 4096, 64).build();
		let addrs: Vec<u64> = img.rgs.keys().copied().collect();

		let mut fs = img.open();
		let segs = find_shortest_rgdist(&mut fs, &BTreeSet::new()).unwrap();

		assert_eq!(segs.dist[0], addrs[1] - addrs[0]);
		assert_eq!(segs.count[0], 1);
		assert_eq!(segs.dist[1], addrs[2] - addrs[1]);
		assert_eq!(segs.count.iter().sum::<u32>() as usize, addrs.len());
	}

	#[test]
	fn damaged_second_group_falls_back_to_index() {
		// Eight groups: enough to settle the stride and enter jump mode
		let img = ImageSpec::uniform(256, 4096, 32).build();
		let addrs: Vec<u64> = img.rgs.keys().copied().collect();

		// With group 2 blasted, the measured first distance spans group 1
		// to group 3; the prober must pull the real one from the index
		img.zero_block(addrs[1]);

		let mut fs = img.open();
		let segs = find_shortest_rgdist(&mut fs, &BTreeSet::new()).unwrap();

		assert_eq!(segs.dist[0], addrs[1] - addrs[0]);
		assert_eq!(segs.dist[1], addrs[2] - addrs[1]);
	}

	#[test]
	fn grown_filesystem_yields_two_segments() {
		let img = ImageSpec::grown(4096, &[(8, 2048), (8, 6144)]).build();

		let mut fs = img.open();
		let segs = find_shortest_rgdist(&mut fs, &BTreeSet::new()).unwrap();

		assert_eq!(segs.len(), 3);
		assert_eq!(segs.dist[1], 2048);
		assert_eq!(segs.dist[2], 6144);
		// Entry 0 carries the first group; the two regions account for
		// eight groups each
		assert_eq!(segs.count[0] + segs.count[1], 8);
		assert_eq!(segs.count[2], 8);
	}
}
