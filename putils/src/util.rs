//! This module implements utility functions.

use std::fmt;
use std::mem::size_of;
use std::slice;
use std::time::Duration;
use std::time::SystemTime;
use std::time::UNIX_EPOCH;

/// Returns the current timestamp since the Unix epoch.
pub fn get_timestamp() -> Duration {
	SystemTime::now()
		.duration_since(UNIX_EPOCH)
		.expect("System clock panic!")
}

/// Performs the log2 operation on the given integer.
///
/// If the result is undefined, the function returns `None`.
pub fn log2(n: u64) -> Option<u64> {
	let num_bits = (size_of::<u64>() * 8) as u64;

	let n = num_bits - n.leading_zeros() as u64;
	if n > 0 {
		Some(n - 1)
	} else {
		None
	}
}

/// Returns `2^n`.
pub fn pow2(n: u32) -> u64 {
	1u64 << n
}

/// Divides `n` by `d`, rounding the result up.
pub fn ceil_division(n: u64, d: u64) -> u64 {
	(n + d - 1) / d
}

/// Rounds `n` up to the next multiple of `align` (`align` must be a power of two).
pub fn align_up(n: u64, align: u64) -> u64 {
	(n + align - 1) & !(align - 1)
}

/// Returns the byte representation of a `#[repr(C)]` plain-old-data value.
///
/// # Safety
/// `T` must not contain padding that is observed (the returned bytes are written verbatim to
/// disk) and must have no interior pointers/references.
pub unsafe fn reinterpret<T>(val: &T) -> &[u8] {
	slice::from_raw_parts(val as *const T as *const u8, size_of::<T>())
}

/// Structure representing a number of bytes, for human-readable logging.
pub struct ByteSize(pub u64);

impl ByteSize {
	/// Creates a size from a given number of sectors.
	pub fn from_sectors_count(cnt: u64) -> Self {
		Self(cnt * 512)
	}
}

impl fmt::Display for ByteSize {
	fn fmt(&self, fmt: &mut fmt::Formatter<'_>) -> fmt::Result {
		let mut order = log2(self.0).unwrap_or(0) / log2(1024).unwrap();

		let suffix = match order {
			0 => "bytes",
			1 => "KiB",
			2 => "MiB",
			3 => "GiB",
			4 => "TiB",
			5 => "PiB",
			6 => "EiB",
			7 => "ZiB",
			8 => "YiB",

			_ => {
				order = 0;
				"bytes"
			}
		};

		let unit = 1024usize.pow(order as u32);
		let nbr = self.0 / unit as u64;

		write!(fmt, "{} {}", nbr, suffix)
	}
}

#[cfg(test)]
mod test {
	use super::*;

	#[test]
	fn bytesize() {
		assert_eq!(format!("{}", ByteSize(0)).as_str(), "0 bytes");
		assert_eq!(format!("{}", ByteSize(1)).as_str(), "1 bytes");
		assert_eq!(format!("{}", ByteSize(1023)).as_str(), "1023 bytes");
		assert_eq!(format!("{}", ByteSize(1024)).as_str(), "1 KiB");
		assert_eq!(format!("{}", ByteSize(1024 * 1024)).as_str(), "1 MiB");
	}

	#[test]
	fn ceil_division_exact() {
		assert_eq!(ceil_division(12, 4), 3);
		assert_eq!(ceil_division(13, 4), 4);
		assert_eq!(ceil_division(0, 4), 0);
	}

	#[test]
	fn align_up_rounds() {
		assert_eq!(align_up(0, 4), 0);
		assert_eq!(align_up(1, 4), 4);
		assert_eq!(align_up(4, 4), 4);
		assert_eq!(align_up(5, 4), 8);
	}

	#[test]
	fn log2_basic() {
		assert_eq!(log2(1), Some(0));
		assert_eq!(log2(2), Some(1));
		assert_eq!(log2(1024), Some(10));
		assert_eq!(log2(0), None);
	}
}
