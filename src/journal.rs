//! Journal scanning for false resource groups.
//!
//! Resource groups are journaled, so copies of their header blocks commonly
//! sit inside journals. When the engine has to hunt for groups on the raw
//! device, those copies look exactly like the real thing and must be
//! excluded before any distance is measured.

use crate::fs::Filesystem;
use crate::inode::Metafile;
use crate::meta;
use crate::meta::JINDEX_RECORD_SIZE;
use crate::meta::META_TYPE_RG;
use log::debug;
use std::collections::BTreeSet;
use std::io;

/// Walks every journal and collects the addresses of blocks that resemble
/// a resource group header.
///
/// Journals are contiguously allocated; the walk of each one stops at its
/// first unmapped logical block.
pub fn find_journaled_rgs(fs: &mut Filesystem) -> io::Result<BTreeSet<u64>> {
	let jindex = Metafile::open(&mut fs.dev, fs.sb.jindex_addr)?;
	let journals = jindex.size() / JINDEX_RECORD_SIZE as u64;

	let mut false_rgrps = BTreeSet::new();
	for j in 0..journals {
		let mut rec = [0; JINDEX_RECORD_SIZE];
		let read = jindex.readi(&mut fs.dev, j * JINDEX_RECORD_SIZE as u64, &mut rec)?;
		if read < JINDEX_RECORD_SIZE {
			break;
		}
		let addr = meta::get_u64(&rec, 0);

		let ip = Metafile::open(&mut fs.dev, addr)?;
		debug!(
			"checking for rgrps in journal{} which starts at block {:#x}",
			j, addr
		);

		let jblocks = ip.size() / fs.bsize() as u64;
		let mut false_count = 0;
		for b in 0..jblocks {
			let Some(dblock) = ip.block_map(b) else {
				break;
			};
			let buf = fs.dev.read_block(dblock)?;
			if meta::check_meta(&buf, META_TYPE_RG) {
				// False rgrp found at this block
				false_count += 1;
				false_rgrps.insert(dblock);
			}
		}
		debug!("{} false positives identified", false_count);
	}

	Ok(false_rgrps)
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::probe;
	use crate::rgrp::Rgrp;
	use crate::testutil::ImageSpec;

	#[test]
	fn journal_decoy_skipped() {
		let img = ImageSpec::uniform(256, 4096, 64).journal_blocks(16).build();
		let addrs: Vec<u64> = img.rgs.keys().copied().collect();
		let journal = img.journal.as_ref().unwrap();

		// Forge a journaled copy of a group header inside the journal
		let decoy = journal.first_block + 5;
		{
			let mut fs = img.open();
			let mut buf = vec![0; 4096];
			Rgrp::new(decoy).header().encode(&mut buf);
			fs.dev.write_block(decoy, &buf).unwrap();
		}

		let mut fs = img.open();
		let false_rgrps = find_journaled_rgs(&mut fs).unwrap();
		assert_eq!(false_rgrps, BTreeSet::from([decoy]));

		// Without the scanner the prober mistakes the copy for a group and
		// measures distances against it
		let blind = probe::find_shortest_rgdist(&mut fs, &BTreeSet::new()).unwrap();
		assert_ne!(blind.dist[0], addrs[1] - addrs[0]);
		assert_ne!(blind.dist[1], addrs[2] - addrs[1]);

		// With it, the decoy is ignored and the true strides recovered
		let segs = probe::find_shortest_rgdist(&mut fs, &false_rgrps).unwrap();
		assert_eq!(segs.dist[0], addrs[1] - addrs[0]);
		assert_eq!(segs.dist[1], addrs[2] - addrs[1]);
	}
}
