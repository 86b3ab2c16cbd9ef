//! Resource group index repair engine of the CFS cluster filesystem
//! checker.
//!
//! The rindex file lists every resource group of the filesystem as a
//! fixed-size record. When it is missing, truncated or inconsistent with
//! what is actually on disk, [`repair::rindex_repair`] recovers a correct
//! index from the raw device, escalating effort through a ladder of trust
//! levels as evidence of corruption accumulates.

pub mod disk;
pub mod fs;
pub mod inode;
pub mod journal;
pub mod layout;
pub mod meta;
pub mod probe;
pub mod prompt;
pub mod rebuild;
pub mod repair;
pub mod rgrp;
pub mod util;

#[cfg(test)]
pub mod testutil;

use std::io;
use thiserror::Error;

pub use fs::Filesystem;
pub use repair::rindex_repair;
pub use repair::RepairReport;
pub use repair::TrustLevel;

/// The ways a repair pass can end, ordered by escalation.
#[derive(Debug, Error)]
pub enum RepairError {
	/// Fatal I/O failure; the current pass aborts.
	#[error("i/o error: {0}")]
	Io(#[from] io::Error),
	/// Corruption exceeding what this trust level tolerates; the caller
	/// escalates to the next level.
	#[error("too many discrepancies at this trust level")]
	Rejected,
	/// The operator declined a repair; no further writes were issued.
	#[error("repair refused by operator")]
	Refused,
	/// The recovery method is exhausted.
	#[error("recovery method exhausted")]
	Unrecoverable,
}
