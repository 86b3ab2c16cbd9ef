//! This module implements operator prompting.
//!
//! Every destructive step of the repair engine is guarded by a yes/no
//! question. The prompter is injected so that automated runs can answer
//! deterministically.

use std::io;
use std::io::BufRead;
use std::io::Write;

/// An object answering the yes/no questions guarding repairs.
pub trait Prompter {
	/// Asks the given question. Returns `true` on approval.
	fn query(&self, msg: &str) -> bool;
}

/// Interactive prompter reading answers from the standard input.
pub struct Interactive;

impl Prompter for Interactive {
	fn query(&self, msg: &str) -> bool {
		loop {
			print!("{} (y/n) ", msg);
			let _ = io::stdout().flush();

			let Some(Ok(line)) = io::stdin().lock().lines().next() else {
				// End of input counts as a refusal
				return false;
			};

			match line.trim() {
				"y" | "Y" | "yes" => return true,
				"n" | "N" | "no" => return false,

				_ => {},
			}
		}
	}
}

/// Prompter giving the same answer to every question, as with the `-y` and
/// `-n` command line options.
pub struct Assume(pub bool);

impl Prompter for Assume {
	fn query(&self, msg: &str) -> bool {
		println!("{} (y/n) {}", msg, if self.0 { "y" } else { "n" });
		self.0
	}
}
