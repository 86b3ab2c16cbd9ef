//! `cfsck` checks and repairs the resource group index of a CFS cluster
//! filesystem.
//!
//! The on-disk rindex is validated through a ladder of trust levels, each
//! putting less faith in the index and more effort into recovering it from
//! the raw device. A level overwhelmed by corruption hands over to the
//! next one.

use cfsck::fs::Filesystem;
use cfsck::prompt::Assume;
use cfsck::prompt::Interactive;
use cfsck::prompt::Prompter;
use cfsck::repair::rindex_repair;
use cfsck::repair::TrustLevel;
use cfsck::util::ByteSize;
use cfsck::RepairError;
use log::LevelFilter;
use std::env;
use std::path::PathBuf;
use std::process::exit;

/// Structure storing command line arguments.
#[derive(Default)]
struct Args {
	/// The name of the current program used in command line.
	prog: String,

	/// If true, print command line help.
	help: bool,
	/// Answer yes to every question.
	yes: bool,
	/// Answer no to every question.
	no: bool,
	/// Print debug information.
	verbose: bool,

	/// The path to the device holding the filesystem.
	device_path: Option<PathBuf>,
}

fn parse_args() -> Args {
	let mut args: Args = Default::default();
	let mut iter = env::args();

	args.prog = iter.next().unwrap_or("cfsck".to_owned());

	for arg in iter {
		match arg.as_str() {
			"-h" | "--help" => args.help = true,
			"-y" | "--yes" => args.yes = true,
			"-n" | "--no" => args.no = true,
			"-v" | "--verbose" => args.verbose = true,

			_ => args.device_path = Some(PathBuf::from(arg)),
		}
	}

	args
}

/// Prints command usage.
///
/// `prog` is the name of the current program.
fn print_usage(prog: &str) {
	eprintln!("{}: bad usage", prog);
	eprintln!("Try '{} --help' for more information.", prog);
}

/// Prints command help.
fn print_help(prog: &str) {
	println!();
	println!("Usage:");
	println!(" {} [options] <device>", prog);
	println!();
	println!("Checks and repairs the resource group index of a CFS filesystem.");
	println!();
	println!("Options:");
	println!(" -h, --help\tPrints help.");
	println!(" -y, --yes\tAnswers yes to every question.");
	println!(" -n, --no\tAnswers no to every question.");
	println!(" -v, --verbose\tPrints debug information.");
}

fn main() {
	let args = parse_args();

	if args.help {
		print_help(&args.prog);
		exit(0);
	}
	if args.yes && args.no {
		eprintln!("{}: -y and -n are mutually exclusive", args.prog);
		exit(1);
	}
	let Some(device_path) = args.device_path else {
		print_usage(&args.prog);
		exit(1);
	};

	env_logger::Builder::new()
		.filter_level(if args.verbose {
			LevelFilter::Debug
		} else {
			LevelFilter::Warn
		})
		.parse_default_env()
		.init();

	let prompter: Box<dyn Prompter> = if args.yes {
		Box::new(Assume(true))
	} else if args.no {
		Box::new(Assume(false))
	} else {
		Box::new(Interactive)
	};

	let mut fs = Filesystem::open(&device_path).unwrap_or_else(|e| {
		eprintln!("{}: {}: {}", args.prog, device_path.display(), e);
		exit(1);
	});
	println!(
		"{}: {}: {} blocks of {} bytes ({})",
		args.prog,
		device_path.display(),
		fs.dev.length(),
		fs.bsize(),
		ByteSize::from_blocks(fs.dev.length(), fs.bsize())
	);

	for trust_lvl in TrustLevel::ALL {
		match rindex_repair(&mut fs, trust_lvl, prompter.as_ref()) {
			Ok(report) => {
				println!(
					"{}: resource group index valid at level {} ({})",
					args.prog,
					trust_lvl.number(),
					trust_lvl
				);
				println!(
					"{}: {} rgrps, {} records fixed, {} inserted, {} blocks rewritten",
					args.prog,
					report.rg_count,
					report.records_fixed,
					report.records_added,
					report.blocks_rewritten
				);
				if report.writes == 0 {
					println!("{}: no changes were needed", args.prog);
				}
				exit(0);
			}

			Err(e @ (RepairError::Rejected | RepairError::Unrecoverable)) => {
				eprintln!(
					"{}: level {} ({}) failed: {}",
					args.prog,
					trust_lvl.number(),
					trust_lvl,
					e
				);
			}

			Err(e) => {
				eprintln!("{}: {}", args.prog, e);
				exit(1);
			}
		}
	}

	eprintln!(
		"{}: the resource group index could not be repaired; manual intervention is required",
		args.prog
	);
	exit(1);
}
