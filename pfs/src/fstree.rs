//! The in-memory filesystem tree the caller builds before handing it to [`crate::Builder`].
//!
//! Modeled as an arena of nodes addressed by index, with upward parent links, per the "avoid
//! owning parent pointers" design note.

use crate::dirent::Dirent;
use std::io;
use std::io::Write;

/// Index of a node within a [`FsTree`]'s arena.
pub type NodeId = usize;

/// A source of file content, streamed into the writer without being buffered whole.
pub trait FileProducer {
	/// Writes the file's raw (uncompressed) bytes to `out`.
	fn write_to(&self, out: &mut dyn Write) -> io::Result<()>;
}

/// A [`FileProducer`] that streams the bytes of a host file.
pub struct HostFile {
	path: std::path::PathBuf,
}

impl HostFile {
	pub fn new(path: impl Into<std::path::PathBuf>) -> Self {
		Self { path: path.into() }
	}
}

impl FileProducer for HostFile {
	fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
		let mut f = std::fs::File::open(&self.path)?;
		io::copy(&mut f, out)?;
		Ok(())
	}
}

/// A [`FileProducer`] backed by an in-memory buffer, mainly useful for tests and for the
/// synthetic flat-path-table "file" the writer inserts at build time.
pub struct MemFile {
	data: Vec<u8>,
}

impl MemFile {
	pub fn new(data: Vec<u8>) -> Self {
		Self { data }
	}
}

impl FileProducer for MemFile {
	fn write_to(&self, out: &mut dyn Write) -> io::Result<()> {
		out.write_all(&self.data)
	}
}

/// A directory node: an ordered list of child directories and files, plus the dirents pointing
/// at them (including `.` and `..`, added by [`crate::layout`] at setup time).
pub struct DirNode {
	pub name: String,
	pub parent: Option<NodeId>,
	pub child_dirs: Vec<NodeId>,
	pub child_files: Vec<NodeId>,
	pub dirents: Vec<Dirent>,
}

/// A file node: metadata plus the producer that streams its content.
pub struct FileNode {
	pub name: String,
	pub parent: Option<NodeId>,
	pub size: u64,
	/// Recorded compressed size; `0` means "same as `size`" (no compression savings recorded).
	pub size_compressed: u64,
	pub compress: bool,
	pub producer: Box<dyn FileProducer>,
}

/// A node in the tree: either a directory or a file.
pub enum FsNode {
	Directory(DirNode),
	File(FileNode),
}

impl FsNode {
	pub fn name(&self) -> &str {
		match self {
			FsNode::Directory(d) => &d.name,
			FsNode::File(f) => &f.name,
		}
	}

	pub fn parent(&self) -> Option<NodeId> {
		match self {
			FsNode::Directory(d) => d.parent,
			FsNode::File(f) => f.parent,
		}
	}

	pub fn as_dir(&self) -> Option<&DirNode> {
		match self {
			FsNode::Directory(d) => Some(d),
			_ => None,
		}
	}

	pub fn as_dir_mut(&mut self) -> Option<&mut DirNode> {
		match self {
			FsNode::Directory(d) => Some(d),
			_ => None,
		}
	}

	pub fn as_file(&self) -> Option<&FileNode> {
		match self {
			FsNode::File(f) => Some(f),
			_ => None,
		}
	}
}

/// The caller-built filesystem tree. The root, once handed to [`crate::Builder`], becomes
/// `uroot`.
pub struct FsTree {
	pub nodes: Vec<FsNode>,
	pub root: NodeId,
}

impl FsTree {
	/// Starts a tree with a single, empty root directory.
	pub fn new(root_name: impl Into<String>) -> Self {
		let root = FsNode::Directory(DirNode {
			name: root_name.into(),
			parent: None,
			child_dirs: Vec::new(),
			child_files: Vec::new(),
			dirents: Vec::new(),
		});
		Self {
			nodes: vec![root],
			root: 0,
		}
	}

	/// Adds a subdirectory under `parent`, returning its node id.
	pub fn add_dir(&mut self, parent: NodeId, name: impl Into<String>) -> NodeId {
		let id = self.nodes.len();
		self.nodes.push(FsNode::Directory(DirNode {
			name: name.into(),
			parent: Some(parent),
			child_dirs: Vec::new(),
			child_files: Vec::new(),
			dirents: Vec::new(),
		}));
		self.nodes[parent]
			.as_dir_mut()
			.expect("parent must be a directory")
			.child_dirs
			.push(id);
		id
	}

	/// Adds a file under `parent`, returning its node id.
	pub fn add_file(
		&mut self,
		parent: NodeId,
		name: impl Into<String>,
		size: u64,
		compress: bool,
		producer: Box<dyn FileProducer>,
	) -> NodeId {
		let id = self.nodes.len();
		self.nodes.push(FsNode::File(FileNode {
			name: name.into(),
			parent: Some(parent),
			size,
			size_compressed: 0,
			compress,
			producer,
		}));
		self.nodes[parent]
			.as_dir_mut()
			.expect("parent must be a directory")
			.child_files
			.push(id);
		id
	}

	/// Full slash-separated path of `id` from the tree root (the root itself is `"/"`).
	pub fn full_path(&self, id: NodeId) -> String {
		if id == self.root {
			return "/".to_string();
		}
		let mut parts = Vec::new();
		let mut cur = id;
		loop {
			parts.push(self.nodes[cur].name().clone());
			match self.nodes[cur].parent() {
				Some(p) if p != self.root => cur = p,
				_ => break,
			}
		}
		parts.reverse();
		format!("/{}", parts.join("/"))
	}

	/// All directory ids in stable pre-order, starting with the root.
	pub fn dirs_preorder(&self) -> Vec<NodeId> {
		let mut out = Vec::new();
		self.walk_dirs(self.root, &mut out);
		out
	}

	fn walk_dirs(&self, id: NodeId, out: &mut Vec<NodeId>) {
		out.push(id);
		let dir = self.nodes[id].as_dir().expect("walk_dirs on a non-directory");
		for &child in &dir.child_dirs {
			self.walk_dirs(child, out);
		}
	}

	/// All file ids, sorted by full path (lexicographic), for deterministic inode numbering.
	pub fn files_path_sorted(&self) -> Vec<NodeId> {
		let mut files: Vec<NodeId> = self
			.dirs_preorder()
			.into_iter()
			.flat_map(|d| self.nodes[d].as_dir().unwrap().child_files.iter().copied())
			.collect();
		files.sort_by_key(|&id| self.full_path(id));
		files
	}

	/// Validates the tree's structural invariants: every child's parent link points back at a
	/// real directory, and no directory has two children with the same name.
	pub fn validate(&self) -> crate::error::Result<()> {
		for dir_id in self.dirs_preorder() {
			let dir = self.nodes[dir_id].as_dir().unwrap();
			let mut seen = std::collections::HashSet::new();
			for &child in dir.child_dirs.iter().chain(dir.child_files.iter()) {
				let name = self.nodes[child].name();
				if !seen.insert(name.to_string()) {
					return Err(crate::error::PfsError::InvalidTree(format!(
						"duplicate name {:?} in directory {:?}",
						name, dir.name
					)));
				}
				if self.nodes[child].parent() != Some(dir_id) {
					return Err(crate::error::PfsError::InvalidTree(format!(
						"node {:?} does not link back to its parent",
						name
					)));
				}
			}
		}
		Ok(())
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn full_path_nested() {
		let mut tree = FsTree::new("uroot");
		let d1 = tree.add_dir(tree.root, "d1");
		let d2 = tree.add_dir(d1, "d2");
		let f = tree.add_file(d2, "f", 4, false, Box::new(MemFile::new(vec![0; 4])));
		assert_eq!(tree.full_path(f), "/d1/d2/f");
		assert_eq!(tree.full_path(tree.root), "/");
	}

	#[test]
	fn files_sorted_by_path() {
		let mut tree = FsTree::new("uroot");
		let b = tree.add_dir(tree.root, "b");
		tree.add_file(tree.root, "z", 0, false, Box::new(MemFile::new(vec![])));
		tree.add_file(b, "a", 0, false, Box::new(MemFile::new(vec![])));
		let paths: Vec<String> = tree
			.files_path_sorted()
			.into_iter()
			.map(|id| tree.full_path(id))
			.collect();
		assert_eq!(paths, vec!["/b/a".to_string(), "/z".to_string()]);
	}

	#[test]
	fn validate_rejects_duplicate_names() {
		let mut tree = FsTree::new("uroot");
		tree.add_file(tree.root, "dup", 0, false, Box::new(MemFile::new(vec![])));
		tree.add_file(tree.root, "dup", 0, false, Box::new(MemFile::new(vec![])));
		assert!(tree.validate().is_err());
	}
}
