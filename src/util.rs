//! This module implements utility functions.

use std::fmt;

/// Performs a division of `a` by `b`, rounding up.
pub fn ceil_division(a: u64, b: u64) -> u64 {
	(a + b - 1) / b
}

/// Structure representing a number of bytes.
pub struct ByteSize(pub u64);

impl ByteSize {
	/// Creates a size from a number of filesystem blocks.
	pub fn from_blocks(cnt: u64, bsize: u32) -> Self {
		Self(cnt * bsize as u64)
	}
}

impl fmt::Display for ByteSize {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut order = 0;
		while order < 8 && self.0 >= 1024u64.pow(order + 1) {
			order += 1;
		}

		let suffix = match order {
			0 => "bytes",
			1 => "KiB",
			2 => "MiB",
			3 => "GiB",
			4 => "TiB",
			5 => "PiB",
			6 => "EiB",

			_ => "ZiB",
		};

		let unit = 1024u64.pow(order);
		write!(fmt, "{} {}", self.0 / unit, suffix)
	}
}
