//! Builds PS4 PFS disk images from an in-memory filesystem tree: a flattened inode table, a flat
//! path table, and (optionally) per-block HMAC-SHA256 signing and XTS-AES-128 sector encryption.

pub mod crypto;
pub mod dirent;
pub mod error;
pub mod fpt;
pub mod fstree;
pub mod header;
pub mod inode;
pub mod layout;
mod writer;

pub use error::{PfsError, Result};
pub use fstree::{FileProducer, FsTree, HostFile, MemFile, NodeId};

use std::cell::RefCell;
use std::io::{Read, Seek, Write};

/// Default PFS block size, matching every concrete scenario in common use.
pub const DEFAULT_BLOCK_SIZE: u64 = 65536;

/// Build-time configuration. Every field is either a plain toggle or an `Option` the builder
/// fills in with a sensible default, mirroring the reference tool's own factory-style
/// configuration records.
pub struct Properties {
	/// Emit the signed (`DinodeS32`) profile with a full HMAC signing queue, instead of the
	/// plain (`DinodeD32`) profile.
	pub sign: bool,
	/// Encrypt data sectors with XTS-AES-128 after signing. Requires `sign` and `ekpfs`.
	pub encrypt: bool,
	/// Block size in bytes. Defaults to [`DEFAULT_BLOCK_SIZE`].
	pub block_size: Option<u64>,
	/// Per-image seed mixed into both key derivations. Defaults to all-zero, which is only
	/// appropriate for tests and reproducible fixtures.
	pub seed: Option<[u8; 16]>,
	/// Fixed timestamp stamped on every inode. Defaults to the current time.
	pub timestamp: Option<u64>,
	/// The title's EKPFS key material. Required when `sign` or `encrypt` is set.
	pub ekpfs: Option<[u8; crypto::EKPFS_SIZE]>,
	/// Receives phase-boundary strings ("Setting up root structure", "Writing inodes", ...) as
	/// the planner and writer progress. Purely advisory: never influences control flow. Defaults
	/// to a closure that writes to stderr.
	log: RefCell<Box<dyn FnMut(&str)>>,
}

impl Default for Properties {
	fn default() -> Self {
		Self {
			sign: false,
			encrypt: false,
			block_size: None,
			seed: None,
			timestamp: None,
			ekpfs: None,
			log: RefCell::new(Box::new(|msg: &str| eprintln!("{msg}"))),
		}
	}
}

impl Properties {
	pub fn sign(mut self, sign: bool) -> Self {
		self.sign = sign;
		self
	}

	pub fn encrypt(mut self, encrypt: bool) -> Self {
		self.encrypt = encrypt;
		self
	}

	pub fn block_size(mut self, block_size: u64) -> Self {
		self.block_size = Some(block_size);
		self
	}

	pub fn seed(mut self, seed: [u8; 16]) -> Self {
		self.seed = Some(seed);
		self
	}

	pub fn ekpfs(mut self, ekpfs: [u8; crypto::EKPFS_SIZE]) -> Self {
		self.ekpfs = Some(ekpfs);
		self
	}

	/// Replaces the phase-boundary logging callback, which otherwise defaults to `eprintln!`.
	pub fn log_fn(self, f: impl FnMut(&str) + 'static) -> Self {
		*self.log.borrow_mut() = Box::new(f);
		self
	}

	/// Reports a phase boundary to the logging callback. Never affects control flow.
	pub(crate) fn log(&self, msg: &str) {
		(self.log.borrow_mut())(msg);
	}

	fn validate(&self) -> Result<()> {
		if (self.sign || self.encrypt) && self.ekpfs.is_none() {
			return Err(PfsError::ConfigMismatch(
				"sign or encrypt requested without ekpfs key material".to_string(),
			));
		}
		if self.encrypt && !self.sign {
			return Err(PfsError::ConfigMismatch(
				"encrypt requires sign (unsigned images are never encrypted)".to_string(),
			));
		}
		Ok(())
	}
}

/// Entry point: plans and writes a PFS image for a [`FsTree`] under the given [`Properties`].
pub struct Builder {
	props: Properties,
}

impl Builder {
	pub fn new(props: Properties) -> Self {
		Self { props }
	}

	/// Runs the layout planner without writing anything, mainly so a caller can size an output
	/// file or device region ahead of time.
	pub fn calculate_size(&self, tree: &FsTree) -> Result<u64> {
		self.props.validate()?;
		let planned = layout::plan(tree, &self.props)?;
		Ok(planned.ndblock * planned.block_size)
	}

	/// Plans and writes the full image to `out`, which must support `Read`, `Write` and `Seek`
	/// (the signer and encryptor both need to read back and re-seek over already-written
	/// blocks).
	pub fn build(&self, tree: &FsTree, out: &mut (impl Read + Write + Seek)) -> Result<()> {
		self.props.validate()?;
		let planned = layout::plan(tree, &self.props)?;
		writer::write_image(&planned, tree, &self.props, out)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn rejects_encrypt_without_sign() {
		let props = Properties::default().encrypt(true).ekpfs([0; crypto::EKPFS_SIZE]);
		assert!(props.validate().is_err());
	}

	#[test]
	fn rejects_sign_without_ekpfs() {
		let props = Properties::default().sign(true);
		assert!(props.validate().is_err());
	}

	#[test]
	fn accepts_plain_unsigned_defaults() {
		let props = Properties::default();
		assert!(props.validate().is_ok());
	}

	#[test]
	fn build_reports_phase_boundaries() {
		use std::cell::RefCell;
		use std::rc::Rc;

		let messages = Rc::new(RefCell::new(Vec::new()));
		let sink = messages.clone();
		let props = Properties::default()
			.block_size(65536)
			.log_fn(move |msg| sink.borrow_mut().push(msg.to_string()));

		let tree = FsTree::new("uroot");
		let mut out = std::io::Cursor::new(Vec::new());
		Builder::new(props).build(&tree, &mut out).unwrap();

		let seen = messages.borrow();
		assert!(seen.iter().any(|m| m == "Setting up root structure"));
		assert!(seen.iter().any(|m| m == "Writing inodes"));
		assert!(seen.iter().any(|m| m == "Writing file data"));
	}
}
