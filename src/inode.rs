//! Metadata file access through dinodes.
//!
//! The rindex and jindex are regular metadata files: a dinode carrying the
//! size, followed by a table of direct block pointers filling the rest of
//! the dinode block. Journals are walked through the same map. The repair
//! engine never allocates blocks, so a file can only grow within the
//! pointers it already has.

use crate::disk::BlockDev;
use crate::meta;
use crate::meta::MetaHeader;
use crate::meta::DINODE_HEADER_SIZE;
use crate::meta::META_FORMAT_DI;
use crate::meta::META_TYPE_DI;
use std::cmp::min;
use std::io;
use std::io::Error;
use std::io::ErrorKind;

/// A metadata file, read and written through its dinode's block map.
pub struct Metafile {
	/// Block address of the dinode.
	pub addr: u64,
	/// Size of the file in bytes.
	size: u64,
	/// File mode.
	mode: u32,
	/// Inode flags.
	flags: u32,
	/// Number of blocks charged to the file.
	blocks: u64,
	/// The direct block pointers, in logical order. Zero is unmapped.
	ptrs: Vec<u64>,
	/// Tells whether the in-memory dinode diverged from disk.
	dirty: bool,
}

impl Metafile {
	/// Reads the dinode at the given block address.
	pub fn open(dev: &mut BlockDev, addr: u64) -> io::Result<Self> {
		let buf = dev.read_block(addr)?;
		if !meta::check_meta(&buf, META_TYPE_DI) {
			return Err(Error::new(
				ErrorKind::InvalidData,
				format!("block {:#x} is not a dinode", addr),
			));
		}

		let ptrs = buf[DINODE_HEADER_SIZE..]
			.chunks_exact(8)
			.map(|c| u64::from_be_bytes(c.try_into().unwrap()))
			.collect();

		Ok(Self {
			addr,
			size: meta::get_u64(&buf, 40),
			mode: meta::get_u32(&buf, 32),
			flags: meta::get_u32(&buf, 36),
			blocks: meta::get_u64(&buf, 48),
			ptrs,
			dirty: false,
		})
	}

	/// Returns the size of the file in bytes.
	pub fn size(&self) -> u64 {
		self.size
	}

	/// Sets the size of the file, marking the dinode dirty.
	pub fn set_size(&mut self, size: u64) {
		self.size = size;
		self.dirty = true;
	}

	/// Tells whether the dinode needs to be written back.
	pub fn is_dirty(&self) -> bool {
		self.dirty
	}

	/// Returns the number of bytes the file can hold without allocating,
	/// i.e. the capacity of its contiguously mapped blocks.
	pub fn capacity(&self, bsize: u32) -> u64 {
		let mapped = self.ptrs.iter().take_while(|p| **p != 0).count();
		mapped as u64 * bsize as u64
	}

	/// Maps a logical block of the file to its physical block address.
	pub fn block_map(&self, lblk: u64) -> Option<u64> {
		match self.ptrs.get(lblk as usize) {
			Some(0) | None => None,
			Some(p) => Some(*p),
		}
	}

	/// Reads up to `buf.len()` bytes at `offset` into `buf`.
	///
	/// Returns the number of bytes read, which is short at end of file or
	/// at the first unmapped block.
	pub fn readi(&self, dev: &mut BlockDev, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
		let bsize = dev.block_size() as u64;
		let mut copied = 0;

		while copied < buf.len() {
			let off = offset + copied as u64;
			if off >= self.size {
				break;
			}

			let Some(pblk) = self.block_map(off / bsize) else {
				break;
			};
			let blk = dev.read_block(pblk)?;

			let boff = (off % bsize) as usize;
			let amount = min(
				buf.len() - copied,
				min(bsize as usize - boff, (self.size - off) as usize),
			);
			buf[copied..copied + amount].copy_from_slice(&blk[boff..boff + amount]);
			copied += amount;
		}

		Ok(copied)
	}

	/// Writes `buf` at `offset`, growing the file size if needed.
	///
	/// Fails if the range reaches past the file's mapped blocks: the engine
	/// cannot allocate.
	pub fn writei(&mut self, dev: &mut BlockDev, offset: u64, buf: &[u8]) -> io::Result<()> {
		let bsize = dev.block_size() as u64;
		let mut copied = 0;

		while copied < buf.len() {
			let off = offset + copied as u64;

			let Some(pblk) = self.block_map(off / bsize) else {
				return Err(Error::new(
					ErrorKind::InvalidData,
					format!("no block mapped at file offset {}", off),
				));
			};
			let mut blk = dev.read_block(pblk)?;

			let boff = (off % bsize) as usize;
			let amount = min(buf.len() - copied, bsize as usize - boff);
			blk[boff..boff + amount].copy_from_slice(&buf[copied..copied + amount]);
			dev.write_block(pblk, &blk)?;
			copied += amount;
		}

		if offset + buf.len() as u64 > self.size {
			self.set_size(offset + buf.len() as u64);
		}

		Ok(())
	}

	/// Writes the dinode back to disk if it was modified.
	pub fn flush(&mut self, dev: &mut BlockDev) -> io::Result<()> {
		if !self.dirty {
			return Ok(());
		}

		let buf = encode_dinode(
			dev.block_size(),
			self.addr,
			self.mode,
			self.flags,
			self.size,
			self.blocks,
			&self.ptrs,
		);
		dev.write_block(self.addr, &buf)?;
		self.dirty = false;

		Ok(())
	}
}

/// Builds a raw dinode block.
pub fn encode_dinode(
	bsize: u32,
	addr: u64,
	mode: u32,
	flags: u32,
	size: u64,
	blocks: u64,
	ptrs: &[u64],
) -> Vec<u8> {
	let mut buf = vec![0; bsize as usize];

	MetaHeader::new(META_TYPE_DI, META_FORMAT_DI).encode(&mut buf);
	meta::put_u64(&mut buf, 24, addr);
	meta::put_u32(&mut buf, 32, mode);
	meta::put_u32(&mut buf, 36, flags);
	meta::put_u64(&mut buf, 40, size);
	meta::put_u64(&mut buf, 48, blocks);

	for (i, p) in ptrs.iter().enumerate() {
		let off = DINODE_HEADER_SIZE + i * 8;
		if off + 8 > buf.len() {
			break;
		}
		meta::put_u64(&mut buf, off, *p);
	}

	buf
}

#[cfg(test)]
mod test {
	use super::*;
	use std::io::Write;

	fn test_dev(blocks: u64) -> (tempfile::NamedTempFile, BlockDev) {
		let mut tmp = tempfile::NamedTempFile::new().unwrap();
		tmp.as_file_mut().set_len(blocks * 4096).unwrap();
		tmp.flush().unwrap();

		let mut dev = BlockDev::open(tmp.path()).unwrap();
		dev.set_block_size(4096);

		(tmp, dev)
	}

	#[test]
	fn read_write_across_blocks() {
		let (_tmp, mut dev) = test_dev(16);

		let dinode = encode_dinode(4096, 2, 0o600, 0, 6000, 3, &[3, 4]);
		dev.write_block(2, &dinode).unwrap();

		let mut file = Metafile::open(&mut dev, 2).unwrap();
		assert_eq!(file.size(), 6000);
		assert_eq!(file.block_map(0), Some(3));
		assert_eq!(file.block_map(1), Some(4));
		assert_eq!(file.block_map(2), None);
		assert_eq!(file.capacity(4096), 8192);

		// Straddle the boundary between the two mapped blocks
		let data: Vec<u8> = (0..512).map(|i| (i % 251) as u8).collect();
		file.writei(&mut dev, 4000, &data).unwrap();

		let mut back = vec![0; 512];
		assert_eq!(file.readi(&mut dev, 4000, &mut back).unwrap(), 512);
		assert_eq!(back, data);

		// Reads stop at end of file
		let mut tail = vec![0; 512];
		assert_eq!(file.readi(&mut dev, 5800, &mut tail).unwrap(), 200);
	}

	#[test]
	fn write_extends_size_and_flushes() {
		let (_tmp, mut dev) = test_dev(16);

		let dinode = encode_dinode(4096, 2, 0o600, 0, 100, 2, &[3]);
		dev.write_block(2, &dinode).unwrap();

		let mut file = Metafile::open(&mut dev, 2).unwrap();
		file.writei(&mut dev, 100, &[7; 50]).unwrap();
		assert_eq!(file.size(), 150);
		assert!(file.is_dirty());

		file.flush(&mut dev).unwrap();
		assert!(!file.is_dirty());

		let reread = Metafile::open(&mut dev, 2).unwrap();
		assert_eq!(reread.size(), 150);

		// Growing past the mapped blocks must fail
		let mut file = reread;
		assert!(file.writei(&mut dev, 4096, &[0; 8]).is_err());
	}
}
