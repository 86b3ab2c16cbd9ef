//! On-disk metadata formats of the CFS filesystem.
//!
//! Every metadata block begins with a 24 byte header carrying a 32-bit magic
//! constant and a type tag. All on-disk integers are big-endian.

/// Magic constant present at the start of every metadata block.
pub const META_MAGIC: u32 = 0x01161970;

/// Metadata type tag: no type.
pub const META_TYPE_NONE: u32 = 0;
/// Metadata type tag: superblock.
pub const META_TYPE_SB: u32 = 1;
/// Metadata type tag: resource group header.
pub const META_TYPE_RG: u32 = 2;
/// Metadata type tag: resource group bitmap continuation.
pub const META_TYPE_RB: u32 = 3;
/// Metadata type tag: dinode.
pub const META_TYPE_DI: u32 = 4;
/// Metadata type tag: indirect pointer block.
pub const META_TYPE_IN: u32 = 5;
/// Metadata type tag: directory leaf.
pub const META_TYPE_LF: u32 = 6;
/// Metadata type tag: journaled data.
pub const META_TYPE_JD: u32 = 7;
/// Metadata type tag: journal log header.
pub const META_TYPE_LH: u32 = 8;
/// Metadata type tag: log descriptor.
pub const META_TYPE_LD: u32 = 9;
/// Metadata type tag: extended attribute block.
pub const META_TYPE_EA: u32 = 10;
/// Metadata type tag: extended attribute data block.
pub const META_TYPE_ED: u32 = 11;
/// Metadata type tag: log continuation block.
pub const META_TYPE_LB: u32 = 12;
/// Metadata type tag: quota change block.
pub const META_TYPE_QC: u32 = 13;

/// Format number stored in superblock headers.
pub const META_FORMAT_SB: u32 = 100;
/// Format number stored in resource group headers.
pub const META_FORMAT_RG: u32 = 200;
/// Format number stored in bitmap continuation headers.
pub const META_FORMAT_RB: u32 = 300;
/// Format number stored in dinode headers.
pub const META_FORMAT_DI: u32 = 400;
/// Format number of the rindex record layout.
pub const META_FORMAT_RI: u32 = 1100;

/// Symbolic names of the metadata type tags, for diagnostics.
pub const META_TYPE_NAMES: &[(u32, &str)] = &[
	(META_TYPE_NONE, "none"),
	(META_TYPE_SB, "superblock"),
	(META_TYPE_RG, "resource group"),
	(META_TYPE_RB, "resource group bitmap"),
	(META_TYPE_DI, "dinode"),
	(META_TYPE_IN, "indirect"),
	(META_TYPE_LF, "directory leaf"),
	(META_TYPE_JD, "journaled data"),
	(META_TYPE_LH, "log header"),
	(META_TYPE_LD, "log descriptor"),
	(META_TYPE_EA, "extended attribute"),
	(META_TYPE_ED, "extended attribute data"),
	(META_TYPE_LB, "log continuation"),
	(META_TYPE_QC, "quota change"),
];

/// Returns the symbolic name of a metadata type tag.
pub fn meta_type_name(mtype: u32) -> &'static str {
	META_TYPE_NAMES
		.iter()
		.find(|(t, _)| *t == mtype)
		.map(|(_, name)| *name)
		.unwrap_or("unknown")
}

/// Format version of the filesystem as a whole.
pub const FS_FORMAT: u32 = 1201;
/// Format version of the multihost (cluster) protocol.
pub const MULTIHOST_FORMAT: u32 = 1301;

/// Byte offset of the superblock, just past the initial reserved span.
pub const SB_OFFSET: u64 = 65536;

/// Size in bytes of the generic metadata header.
pub const META_HEADER_SIZE: usize = 24;
/// Size in bytes of a resource group header.
pub const RG_HEADER_SIZE: usize = 128;
/// Size in bytes of the fixed part of a dinode.
pub const DINODE_HEADER_SIZE: usize = 56;
/// Size in bytes of one rindex record.
pub const RINDEX_RECORD_SIZE: usize = 104;
/// Size in bytes of one jindex record.
pub const JINDEX_RECORD_SIZE: usize = 16;

/// Number of allocation states encoded per bitmap byte.
pub const NBBY: u32 = 4;
/// Width in bits of one allocation state.
pub const STATE_BITS: u32 = 2;
/// Mask extracting one allocation state.
pub const STATE_MASK: u8 = 0b11;

/// Allocation state: block is free.
pub const BLKST_FREE: u8 = 0;
/// Allocation state: block holds user data.
pub const BLKST_USED: u8 = 1;
/// Allocation state: block belongs to an unlinked inode.
pub const BLKST_UNLINKED: u8 = 2;
/// Allocation state: block holds metadata.
pub const BLKST_META: u8 = 3;

pub(crate) fn get_u32(buf: &[u8], off: usize) -> u32 {
	u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

pub(crate) fn get_u64(buf: &[u8], off: usize) -> u64 {
	u64::from_be_bytes(buf[off..off + 8].try_into().unwrap())
}

pub(crate) fn put_u32(buf: &mut [u8], off: usize, val: u32) {
	buf[off..off + 4].copy_from_slice(&val.to_be_bytes());
}

pub(crate) fn put_u64(buf: &mut [u8], off: usize, val: u64) {
	buf[off..off + 8].copy_from_slice(&val.to_be_bytes());
}

/// The classes of blocks the repair engine distinguishes.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BlockType {
	/// Superblock.
	Sb,
	/// Resource group header.
	Rg,
	/// Resource group bitmap continuation.
	Rb,
	/// Dinode.
	Di,
	/// Anything else, including blocks with a wrong magic.
	Other,
}

/// The generic header at the start of every metadata block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct MetaHeader {
	/// The magic constant.
	pub magic: u32,
	/// The metadata type tag.
	pub mtype: u32,
	/// The on-disk format number of the block's payload.
	pub format: u32,
	/// The journal that last wrote the block.
	pub jid: u32,
}

impl MetaHeader {
	/// Creates a header for a block of the given type and format.
	pub fn new(mtype: u32, format: u32) -> Self {
		Self {
			magic: META_MAGIC,
			mtype,
			format,
			jid: 0,
		}
	}

	/// Decodes a header from the start of a block buffer.
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			magic: get_u32(buf, 0),
			mtype: get_u32(buf, 4),
			format: get_u32(buf, 12),
			jid: get_u32(buf, 16),
		}
	}

	/// Encodes the header at the start of a block buffer.
	pub fn encode(&self, buf: &mut [u8]) {
		put_u32(buf, 0, self.magic);
		put_u32(buf, 4, self.mtype);
		put_u32(buf, 8, 0);
		put_u32(buf, 12, self.format);
		put_u32(buf, 16, self.jid);
		put_u32(buf, 20, 0);
	}
}

/// Tells whether the buffer holds a metadata block of the given type.
///
/// A wrong magic always fails the check, whatever the type tag says.
pub fn check_meta(buf: &[u8], mtype: u32) -> bool {
	buf.len() >= META_HEADER_SIZE
		&& get_u32(buf, 0) == META_MAGIC
		&& get_u32(buf, 4) == mtype
}

/// Classifies a block buffer from its magic and type tag.
pub fn block_type(buf: &[u8]) -> BlockType {
	if buf.len() < META_HEADER_SIZE || get_u32(buf, 0) != META_MAGIC {
		return BlockType::Other;
	}

	match get_u32(buf, 4) {
		META_TYPE_SB => BlockType::Sb,
		META_TYPE_RG => BlockType::Rg,
		META_TYPE_RB => BlockType::Rb,
		META_TYPE_DI => BlockType::Di,

		_ => BlockType::Other,
	}
}

/// The filesystem superblock.
#[derive(Clone, Copy, Debug)]
pub struct Superblock {
	/// Format version of the filesystem.
	pub fs_format: u32,
	/// Format version of the cluster protocol.
	pub multihost_format: u32,
	/// The filesystem block size in bytes.
	pub bsize: u32,
	/// log2 of the block size.
	pub bsize_shift: u32,
	/// Block address of the rindex file's dinode.
	pub rindex_addr: u64,
	/// Block address of the jindex file's dinode.
	pub jindex_addr: u64,
}

impl Superblock {
	/// Decodes and validates a superblock from a raw buffer.
	pub fn decode(buf: &[u8]) -> Option<Self> {
		if !check_meta(buf, META_TYPE_SB) {
			return None;
		}

		let sb = Self {
			fs_format: get_u32(buf, 24),
			multihost_format: get_u32(buf, 28),
			bsize: get_u32(buf, 32),
			bsize_shift: get_u32(buf, 36),
			rindex_addr: get_u64(buf, 40),
			jindex_addr: get_u64(buf, 48),
		};

		if !sb.bsize.is_power_of_two() || !(512..=65536).contains(&sb.bsize) {
			return None;
		}
		if sb.bsize != 1 << sb.bsize_shift {
			return None;
		}

		Some(sb)
	}

	/// Encodes the superblock at the start of a block buffer.
	pub fn encode(&self, buf: &mut [u8]) {
		MetaHeader::new(META_TYPE_SB, META_FORMAT_SB).encode(buf);
		put_u32(buf, 24, self.fs_format);
		put_u32(buf, 28, self.multihost_format);
		put_u32(buf, 32, self.bsize);
		put_u32(buf, 36, self.bsize_shift);
		put_u64(buf, 40, self.rindex_addr);
		put_u64(buf, 48, self.jindex_addr);
	}
}

/// The payload of a resource group header block.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct RgHeader {
	/// Resource group flags.
	pub flags: u32,
	/// Number of free data blocks.
	pub free: u32,
	/// Number of dinodes allocated in the group.
	pub dinodes: u32,
	/// Inode generation counter for the group.
	pub igeneration: u64,
}

impl RgHeader {
	/// Decodes a resource group header from a block buffer.
	pub fn decode(buf: &[u8]) -> Self {
		Self {
			flags: get_u32(buf, 24),
			free: get_u32(buf, 28),
			dinodes: get_u32(buf, 32),
			igeneration: get_u64(buf, 40),
		}
	}

	/// Encodes the header, including the metadata header, at the start of a
	/// block buffer. Bytes past the header are left untouched.
	pub fn encode(&self, buf: &mut [u8]) {
		MetaHeader::new(META_TYPE_RG, META_FORMAT_RG).encode(buf);
		put_u32(buf, 24, self.flags);
		put_u32(buf, 28, self.free);
		put_u32(buf, 32, self.dinodes);
		put_u32(buf, 36, 0);
		put_u64(buf, 40, self.igeneration);
		buf[48..RG_HEADER_SIZE].fill(0);
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn block_classification() {
		let mut buf = vec![0u8; 4096];
		assert_eq!(block_type(&buf), BlockType::Other);

		MetaHeader::new(META_TYPE_RG, META_FORMAT_RG).encode(&mut buf);
		assert_eq!(block_type(&buf), BlockType::Rg);
		assert!(check_meta(&buf, META_TYPE_RG));
		assert!(!check_meta(&buf, META_TYPE_RB));

		// Right type tag but wrong magic must not be recognized
		put_u32(&mut buf, 0, 0xdeadbeef);
		assert_eq!(block_type(&buf), BlockType::Other);
		assert!(!check_meta(&buf, META_TYPE_RG));
	}

	#[test]
	fn superblock_validation() {
		let mut buf = vec![0u8; 4096];
		let sb = Superblock {
			fs_format: FS_FORMAT,
			multihost_format: MULTIHOST_FORMAT,
			bsize: 4096,
			bsize_shift: 12,
			rindex_addr: 42,
			jindex_addr: 43,
		};
		sb.encode(&mut buf);

		let read = Superblock::decode(&buf).unwrap();
		assert_eq!(read.bsize, 4096);
		assert_eq!(read.rindex_addr, 42);
		assert_eq!(read.jindex_addr, 43);

		// A bogus block size must be rejected
		put_u32(&mut buf, 32, 1234);
		assert!(Superblock::decode(&buf).is_none());
	}

	#[test]
	fn rg_header_preserves_payload() {
		let mut buf = vec![0xaau8; 4096];
		let hdr = RgHeader {
			flags: 0,
			free: 1000,
			dinodes: 3,
			igeneration: 7,
		};
		hdr.encode(&mut buf);

		assert_eq!(RgHeader::decode(&buf), hdr);
		// The bitmap payload after the header must be untouched
		assert!(buf[RG_HEADER_SIZE..].iter().all(|b| *b == 0xaa));
	}
}
