//! Reconciling the on-disk rindex against the expected layout.
//!
//! Entry point of the repair engine. The expected descriptor set is built
//! according to a trust level, compared against what the rindex actually
//! says, fixed up record by record under operator approval, and finally
//! every group's header and bitmap blocks are validated and rewritten where
//! damaged.

use crate::fs::Filesystem;
use crate::layout;
use crate::meta;
use crate::meta::MetaHeader;
use crate::meta::META_FORMAT_RB;
use crate::meta::META_TYPE_RB;
use crate::meta::META_TYPE_RG;
use crate::meta::RINDEX_RECORD_SIZE;
use crate::probe::RgSegments;
use crate::prompt::Prompter;
use crate::rebuild;
use crate::rgrp;
use crate::rgrp::Rgrp;
use crate::rgrp::RgrpSet;
use crate::RepairError;
use log::debug;
use log::error;
use log::info;
use log::warn;
use std::fmt;

/// Percentage of mismatched records above which a level gives up so the
/// caller can escalate.
const BAD_RG_PERCENT_TOLERANCE: u32 = 11;

/// How much of the on-disk rindex the engine believes.
///
/// Escalates monotonically: every level recomputes from scratch, so the
/// engine is idempotent across restarts.
#[derive(Clone, Copy, Debug, Eq, Ord, PartialEq, PartialOrd)]
pub enum TrustLevel {
	/// Take the rindex at face value.
	BlindFaith,
	/// The rindex parsed cleanly, but its values need verification.
	YeOfLittleFaith,
	/// The rindex might be okay; recompute what it should be and compare.
	OpenMinded,
	/// The rindex is not to be trusted; rebuild it from the device.
	Distrust,
	/// The filesystem was grown after format and nothing sits on nice
	/// boundaries.
	Indignation,
}

impl TrustLevel {
	/// Every level, in escalation order.
	pub const ALL: [TrustLevel; 5] = [
		TrustLevel::BlindFaith,
		TrustLevel::YeOfLittleFaith,
		TrustLevel::OpenMinded,
		TrustLevel::Distrust,
		TrustLevel::Indignation,
	];

	/// Returns the one-based number of the level, for diagnostics.
	pub fn number(self) -> u32 {
		self as u32 + 1
	}
}

impl fmt::Display for TrustLevel {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		let name = match self {
			Self::BlindFaith => "blind faith",
			Self::YeOfLittleFaith => "ye of little faith",
			Self::OpenMinded => "open minded",
			Self::Distrust => "distrust",
			Self::Indignation => "indignation",
		};
		write!(fmt, "{}", name)
	}
}

/// What a successful repair pass did. Recovered discrepancies are reported,
/// never masked.
#[derive(Debug)]
pub struct RepairReport {
	/// The level the pass ran at.
	pub level: TrustLevel,
	/// Number of groups in the reconciled set.
	pub rg_count: usize,
	/// Record pairs compared during the gap walk.
	pub pairs: u32,
	/// Discrepancies tallied during the gap walk.
	pub discrepancies: u32,
	/// Records whose fields were corrected.
	pub records_fixed: u32,
	/// Records inserted because the index skipped them.
	pub records_added: u32,
	/// Whether the rindex file was truncated.
	pub truncated: bool,
	/// Group header or bitmap blocks rewritten by the scrub pass.
	pub blocks_rewritten: u32,
	/// Total writes issued, of any kind.
	pub writes: u32,
	/// The probed segments, when a rebuild ran.
	pub segments: Option<RgSegments>,
}

impl RepairReport {
	fn new(level: TrustLevel) -> Self {
		Self {
			level,
			rg_count: 0,
			pairs: 0,
			discrepancies: 0,
			records_fixed: 0,
			records_added: 0,
			truncated: false,
			blocks_rewritten: 0,
			writes: 0,
			segments: None,
		}
	}
}

/// Tries to repair the resource group index at the given trust level.
///
/// Every destructive step asks the prompter first; a declined prompt
/// unwinds with [`RepairError::Refused`] without further writes. A level
/// overwhelmed by corruption returns [`RepairError::Rejected`] so the
/// caller can escalate.
pub fn rindex_repair(
	fs: &mut Filesystem,
	trust_lvl: TrustLevel,
	prompter: &dyn Prompter,
) -> Result<RepairReport, RepairError> {
	info!("validating resource group index (level {}: {})", trust_lvl.number(), trust_lvl);
	let mut report = RepairReport::new(trust_lvl);

	let actual = rgrp::rindex_read(&mut fs.dev, &fs.riinode)?;

	// At blind faith the index is accepted as-is; only the groups
	// themselves get scrubbed
	if trust_lvl == TrustLevel::BlindFaith {
		let reconciled: Vec<Rgrp> = actual.into_values().collect();
		scrub(fs, &reconciled, prompter, &mut report)?;
		report.rg_count = reconciled.len();
		fs.rgrps = reconciled.into_iter().map(|rg| (rg.addr, rg)).collect();
		return Ok(report);
	}

	// Build the expected set
	let mut expected = match trust_lvl {
		TrustLevel::YeOfLittleFaith => {
			if actual.is_empty() {
				error!("the rindex file does not meet our expectations");
				return Err(RepairError::Rejected);
			}
			expect_rindex_sanity(fs, &actual)
		}

		TrustLevel::OpenMinded => {
			let Some(expected) = layout::rindex_calculate(fs, &actual) else {
				return Err(RepairError::Rejected);
			};
			expected
		}

		TrustLevel::Distrust | TrustLevel::Indignation => {
			let grown = trust_lvl == TrustLevel::Indignation;
			let (expected, segments) = rebuild::rindex_rebuild(fs, grown)?;
			report.segments = Some(segments);
			expected
		}

		TrustLevel::BlindFaith => unreachable!(),
	};

	// The file size must be a whole number of records
	if fs.riinode.size() % RINDEX_RECORD_SIZE as u64 != 0 {
		warn!("rindex file has an invalid size");
		if !prompter.query("Truncate the rindex size?") {
			error!("the rindex was not repaired");
			return Err(RepairError::Refused);
		}
		let size = fs.riinode.size() / RINDEX_RECORD_SIZE as u64 * RINDEX_RECORD_SIZE as u64;
		fs.riinode.set_size(size);
		report.truncated = true;
		info!("changing rindex size to {}", size);
	}

	let num_rgs = actual.len();
	info!("L{}: number of rgs expected = {}", trust_lvl.number(), expected.len());
	if expected.len() != num_rgs {
		warn!(
			"L{}: they don't match; either (1) the fs was extended, (2) an odd rgrp size \
			 was used, or (3) the rg index is corrupt",
			trust_lvl.number()
		);

		if trust_lvl >= TrustLevel::Distrust {
			if !prompter.query("Attempt to use what rgrps we can?") {
				error!("the rindex was not repaired");
				return Err(RepairError::Refused);
			}
			// Nothing can be allocated this early, so only what already
			// fits the index can be kept; this also sheds a trailing
			// fabricated descriptor from a rebuild that overran the last
			// real group
			let most_that_fit = if num_rgs > 0 {
				num_rgs
			} else {
				(fs.riinode.capacity(fs.bsize()) / RINDEX_RECORD_SIZE as u64) as usize
			};
			debug!("the most we can fit is {} rgrps", most_that_fit);
			while expected.len() > most_that_fit {
				let last = *expected.keys().next_back().unwrap_or(&0);
				expected.remove(&last);
			}
			error!("attempting to fix rindex with {} rgrps", expected.len());
		} else {
			// A lower level may still append missing trailing records, as
			// long as they describe real groups and fit the file's
			// allocated blocks
			let capacity = fs.riinode.capacity(fs.bsize()) / RINDEX_RECORD_SIZE as u64;
			let appendable = expected.len() > num_rgs
				&& expected.len() as u64 <= capacity
				&& expected.values().all(|rg| !rg.damaged);
			if !appendable {
				error!("the rindex was not repaired");
				return Err(RepairError::Rejected);
			}
		}
	}

	// See how far off the expectations are; if too far, this level's
	// method of recovery is the wrong one
	let (pairs, discrepancies) = gap_walk(&expected, &actual);
	report.pairs = pairs;
	report.discrepancies = discrepancies;
	if trust_lvl >= TrustLevel::OpenMinded && pairs > 0 {
		let percent = discrepancies * 100 / pairs;
		if percent > BAD_RG_PERCENT_TOLERANCE {
			warn!("level {} didn't work: too many discrepancies", trust_lvl.number());
			warn!(
				"{} out of {} rgrps ({} percent) did not match what was expected",
				discrepancies, pairs, percent
			);
			return Err(RepairError::Rejected);
		}
	}
	debug!(
		"calculated {} rgrps: total {}, match {}, mismatch {}",
		expected.len(),
		pairs,
		pairs - discrepancies,
		discrepancies
	);

	let reconciled = merge(fs, &expected, &actual, prompter, &mut report)?;

	// Records past the reconciled set would describe groups twice or not
	// at all; drop them
	let file_records = fs.riinode.size() / RINDEX_RECORD_SIZE as u64;
	if (reconciled.len() as u64) < file_records {
		warn!(
			"the rindex lists {} records past the reconciled set",
			file_records - reconciled.len() as u64
		);
		if !prompter.query("Truncate the rindex?") {
			error!("the rindex was not repaired");
			return Err(RepairError::Refused);
		}
		fs.riinode
			.set_size(reconciled.len() as u64 * RINDEX_RECORD_SIZE as u64);
		report.truncated = true;
	}

	scrub(fs, &reconciled, prompter, &mut report)?;

	if fs.riinode.is_dirty() {
		debug!("syncing rindex inode changes to disk");
		fs.riinode.flush(&mut fs.dev)?;
		report.writes += 1;
	}

	report.rg_count = reconciled.len();
	fs.rgrps = reconciled.into_iter().map(|rg| (rg.addr, rg)).collect();
	Ok(report)
}

/// The rindex seems trustworthy: keep its addresses and recompute every
/// derived field from the strides between them, so that damage to a single
/// field shows up against solid expectations.
fn expect_rindex_sanity(fs: &Filesystem, actual: &RgrpSet) -> RgrpSet {
	let devlen = fs.dev.length();
	let addrs: Vec<u64> = actual.keys().copied().collect();

	let mut expected = RgrpSet::new();
	for (i, addr) in addrs.iter().enumerate() {
		let span = match addrs.get(i + 1) {
			Some(next) => next - addr,
			None => devlen.saturating_sub(*addr),
		};

		let mut rg = Rgrp::new(*addr);
		rg.fill_from_span(fs.bsize(), span);
		expected.insert(*addr, rg);
	}

	expected
}

/// Walks the two sorted sets with parallel cursors, tallying address and
/// field discrepancies. Nothing is written.
///
/// Returns the number of pairs walked and the discrepancies among them; a
/// trailing run present on only one side is not counted.
fn gap_walk(expected: &RgrpSet, actual: &RgrpSet) -> (u32, u32) {
	let mut e = expected.values().peekable();
	let mut a = actual.values().peekable();
	let mut pairs = 0;
	let mut discrepancies = 0;

	loop {
		let (Some(exp), Some(act)) = (e.peek(), a.peek()) else {
			break;
		};
		pairs += 1;

		if act.addr < exp.addr {
			info!(
				"{} addr: {:#x} < {:#x} * mismatch",
				pairs, act.addr, exp.addr
			);
			discrepancies += 1;
			a.next();
			continue;
		}
		if exp.addr < act.addr {
			info!(
				"{} addr: {:#x} > {:#x} * mismatch",
				pairs, act.addr, exp.addr
			);
			discrepancies += 1;
			e.next();
			continue;
		}

		if !act.same_index(exp) {
			info!("{} addr: {:#x} * has mismatch", pairs, act.addr);
			discrepancies += 1;
		}
		e.next();
		a.next();
	}

	(pairs, discrepancies)
}

/// Logs every index field on which the two descriptors disagree.
fn log_field_mismatches(slot: usize, ondisk: &Rgrp, expected: &Rgrp) {
	if ondisk.length != expected.length {
		warn!(
			"rindex #{} length discrepancy: index {:#x} != expected {:#x}",
			slot + 1,
			ondisk.length,
			expected.length
		);
	}
	if ondisk.data0 != expected.data0 {
		warn!(
			"rindex #{} data0 discrepancy: index {:#x} != expected {:#x}",
			slot + 1,
			ondisk.data0,
			expected.data0
		);
	}
	if ondisk.data != expected.data {
		warn!(
			"rindex #{} data discrepancy: index {:#x} != expected {:#x}",
			slot + 1,
			ondisk.data,
			expected.data
		);
	}
	if ondisk.bitbytes != expected.bitbytes {
		warn!(
			"rindex #{} bitbytes discrepancy: index {:#x} != expected {:#x}",
			slot + 1,
			ondisk.bitbytes,
			expected.bitbytes
		);
	}
}

/// Merges the expected set into the on-disk rindex: fixes mismatched
/// records and inserts skipped ones, each after approval. Once a record is
/// inserted, every following slot shifts and is rewritten.
fn merge(
	fs: &mut Filesystem,
	expected: &RgrpSet,
	actual: &RgrpSet,
	prompter: &dyn Prompter,
	report: &mut RepairReport,
) -> Result<Vec<Rgrp>, RepairError> {
	let mut reconciled = Vec::with_capacity(expected.len());
	let mut shifted = false;

	for (slot, exp) in expected.values().enumerate() {
		match actual.get(&exp.addr) {
			Some(act) if act.same_index(exp) && !shifted => {}

			Some(act) => {
				let mismatch = !act.same_index(exp);
				if mismatch {
					log_field_mismatches(slot, act, exp);
				}
				if !prompter.query("Fix the index?") {
					error!("rindex not fixed");
					return Err(RepairError::Refused);
				}
				rgrp::rindex_write_record(&mut fs.dev, &mut fs.riinode, slot as u64, exp)?;
				if mismatch {
					report.records_fixed += 1;
				}
				report.writes += 1;
			}

			None => {
				error!("entry missing from rindex: {:#x}", exp.addr);
				if !prompter.query("Fix the index?") {
					error!("rindex not fixed");
					return Err(RepairError::Refused);
				}
				rgrp::rindex_write_record(&mut fs.dev, &mut fs.riinode, slot as u64, exp)?;
				report.records_added += 1;
				report.writes += 1;
				shifted = true;
			}
		}

		reconciled.push(exp.clone());
	}

	Ok(reconciled)
}

/// Reads every group of the reconciled set and rewrites damaged header or
/// bitmap blocks, re-reading until clean or until the same block keeps
/// failing.
fn scrub(
	fs: &mut Filesystem,
	rgs: &[Rgrp],
	prompter: &dyn Prompter,
	report: &mut RepairReport,
) -> Result<(), RepairError> {
	for rg in rgs {
		let mut prev_err = 0;
		let mut i = 0;

		while i < rg.length {
			match rgrp::rgrp_read(&mut fs.dev, rg)? {
				None => break,

				Some(errblock) => {
					if errblock == prev_err {
						// No progress; leave it to a later level
						break;
					}
					prev_err = errblock;
					if !rewrite_rg_block(fs, rg, errblock, prompter, report)? {
						return Err(RepairError::Refused);
					}
				}
			}
			i += 1;
		}
	}

	Ok(())
}

/// Rewrites one block of a group: a fresh bitmap header for a continuation
/// block, or a header rebuilt from the descriptor for the group header.
/// The rest of the block is preserved.
///
/// Returns `false` when the operator declines.
fn rewrite_rg_block(
	fs: &mut Filesystem,
	rg: &Rgrp,
	errblock: u64,
	prompter: &dyn Prompter,
	report: &mut RepairReport,
) -> Result<bool, RepairError> {
	let x = errblock - rg.addr;
	let typedesc = if x == 0 {
		meta::meta_type_name(META_TYPE_RG)
	} else {
		meta::meta_type_name(META_TYPE_RB)
	};
	error!(
		"block #{} ({:#x}) ({} of {}) is not a {}",
		errblock,
		errblock,
		x + 1,
		rg.length,
		typedesc
	);

	if !prompter.query("Fix the resource group?") {
		return Ok(false);
	}

	error!("attempting to repair the resource group");
	let mut buf = fs.dev.read_block(errblock)?;
	if x != 0 {
		MetaHeader::new(META_TYPE_RB, META_FORMAT_RB).encode(&mut buf);
	} else {
		let mut hdr = rg.header();
		hdr.free = rg.data;
		hdr.encode(&mut buf);
	}
	fs.dev.write_block(errblock, &buf)?;
	report.blocks_rewritten += 1;
	report.writes += 1;

	Ok(true)
}
