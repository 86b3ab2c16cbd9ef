//! Block-level access to the device under repair.
//!
//! The engine reads and writes whole filesystem blocks. Short reads and
//! writes are surfaced as fatal I/O errors, callers do not retry.

use crate::meta;
use crate::meta::BlockType;
use libc::ioctl;
use std::fs::File;
use std::fs::OpenOptions;
use std::io;
use std::io::Error;
use std::io::ErrorKind;
use std::io::Read;
use std::io::Seek;
use std::io::SeekFrom;
use std::io::Write;
use std::os::fd::AsRawFd;
use std::os::unix::fs::FileTypeExt;
use std::path::Path;

/// ioctl macro: builds a command from direction, type, number and size.
macro_rules! ioc {
	($a:expr, $b:expr, $c:expr, $d:expr) => {
		(($a) << 30) | (($b) << 8) | ($c) | (($d) << 16)
	};
}

/// ioctl macro: Read command.
macro_rules! ior {
	($a:expr, $b:expr, $c:ty) => {
		ioc!(2, $a, $b, std::mem::size_of::<$c>() as u64)
	};
}

/// ioctl command: Get size of the device in bytes.
const BLKGETSIZE64: u64 = ior!(0x12, 114, usize);

/// A device holding the filesystem, addressed in fixed-size blocks.
pub struct BlockDev {
	/// The open device file.
	file: File,
	/// The size of the device in bytes.
	bytes: u64,
	/// The filesystem block size in bytes.
	bsize: u32,
	/// The size of the device in blocks.
	length: u64,
}

impl BlockDev {
	/// Opens the device at the given path for reading and writing.
	///
	/// The block size is unknown until the superblock has been read; it
	/// defaults to 512 until [`Self::set_block_size`] is called.
	pub fn open(path: &Path) -> io::Result<Self> {
		let file = OpenOptions::new().read(true).write(true).open(path)?;
		let bytes = device_size(&file)?;

		let mut dev = Self {
			file,
			bytes,
			bsize: 0,
			length: 0,
		};
		dev.set_block_size(512);

		Ok(dev)
	}

	/// Sets the filesystem block size, recomputing the device length.
	pub fn set_block_size(&mut self, bsize: u32) {
		self.bsize = bsize;
		self.length = self.bytes / bsize as u64;
	}

	/// Returns the filesystem block size in bytes.
	pub fn block_size(&self) -> u32 {
		self.bsize
	}

	/// Returns the size of the device in blocks.
	pub fn length(&self) -> u64 {
		self.length
	}

	/// Reads raw bytes at the given byte offset, regardless of block size.
	pub fn read_at(&mut self, off: u64, buf: &mut [u8]) -> io::Result<()> {
		self.file.seek(SeekFrom::Start(off))?;
		self.file.read_exact(buf)
	}

	/// Writes raw bytes at the given byte offset, regardless of block size.
	pub fn write_at(&mut self, off: u64, buf: &[u8]) -> io::Result<()> {
		self.file.seek(SeekFrom::Start(off))?;
		self.file.write_all(buf)
	}

	/// Reads the block at the given address.
	pub fn read_block(&mut self, addr: u64) -> io::Result<Vec<u8>> {
		if addr >= self.length {
			return Err(Error::new(
				ErrorKind::InvalidInput,
				format!("block address {:#x} out of range", addr),
			));
		}

		let mut buf = vec![0; self.bsize as usize];
		self.read_at(addr * self.bsize as u64, &mut buf)?;

		Ok(buf)
	}

	/// Writes a block at the given address.
	pub fn write_block(&mut self, addr: u64, buf: &[u8]) -> io::Result<()> {
		if addr >= self.length {
			return Err(Error::new(
				ErrorKind::InvalidInput,
				format!("block address {:#x} out of range", addr),
			));
		}

		self.write_at(addr * self.bsize as u64, buf)
	}

	/// Reads the block at the given address and classifies it from its
	/// magic and type tag.
	pub fn block_type(&mut self, addr: u64) -> io::Result<BlockType> {
		let buf = self.read_block(addr)?;
		Ok(meta::block_type(&buf))
	}
}

/// Returns the size in bytes of the device behind the given file.
///
/// Block devices are sized with an ioctl; a regular file (a filesystem
/// image) falls back to its length.
fn device_size(file: &File) -> io::Result<u64> {
	let metadata = file.metadata()?;
	let file_type = metadata.file_type();

	if file_type.is_block_device() || file_type.is_char_device() {
		let mut size = 0u64;

		let ret = unsafe {
			ioctl(file.as_raw_fd(), BLKGETSIZE64 as _, &mut size)
		};
		if ret < 0 {
			return Err(Error::last_os_error());
		}

		Ok(size)
	} else {
		Ok(metadata.len())
	}
}

#[cfg(test)]
mod test {
	use super::*;
	use crate::meta::MetaHeader;
	use crate::meta::META_FORMAT_RB;
	use crate::meta::META_TYPE_RB;
	use std::io::Write;

	#[test]
	fn block_roundtrip() {
		let mut tmp = tempfile::NamedTempFile::new().unwrap();
		tmp.as_file_mut().set_len(64 * 4096).unwrap();
		tmp.flush().unwrap();

		let mut dev = BlockDev::open(tmp.path()).unwrap();
		dev.set_block_size(4096);
		assert_eq!(dev.length(), 64);

		let mut buf = vec![0u8; 4096];
		MetaHeader::new(META_TYPE_RB, META_FORMAT_RB).encode(&mut buf);
		dev.write_block(7, &buf).unwrap();

		assert_eq!(dev.block_type(7).unwrap(), BlockType::Rb);
		assert_eq!(dev.block_type(8).unwrap(), BlockType::Other);
		assert!(dev.read_block(64).is_err());
	}
}
