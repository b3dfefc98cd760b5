//! The flat path table: a linear list of every node's inode number and full path, rooted at the
//! image root (`uroot`, i.e. paths are reported without the synthetic `super_root` prefix).

/// One entry of the flat path table.
pub struct FptEntry {
	pub ino: u32,
	pub path: String,
}

/// Serializes the flat path table.
///
/// Encoding: for each entry, a little-endian `u32` inode number, a little-endian `u16` path
/// length, then the path bytes (no terminator, no padding between entries).
pub fn serialize(entries: &[FptEntry]) -> Vec<u8> {
	let mut out = Vec::new();
	for entry in entries {
		out.extend_from_slice(&entry.ino.to_le_bytes());
		let path_bytes = entry.path.as_bytes();
		out.extend_from_slice(&(path_bytes.len() as u16).to_le_bytes());
		out.extend_from_slice(path_bytes);
	}
	out
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn serialize_is_deterministic() {
		let entries = vec![
			FptEntry { ino: 2, path: "/".to_string() },
			FptEntry { ino: 3, path: "/a".to_string() },
		];
		let a = serialize(&entries);
		let b = serialize(&entries);
		assert_eq!(a, b);
		assert!(!a.is_empty());
	}
}
