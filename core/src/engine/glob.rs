//! Path glob matching for locating state files.
//!
//! `**` spans any number of path segments (zero included), `*` stays within
//! one segment, `?` is exactly one character and `[...]` is a character class.

use glob::{MatchOptions, Pattern, PatternError};

const PATH_OPTIONS: MatchOptions = MatchOptions {
	case_sensitive: true,
	require_literal_separator: true,
	require_literal_leading_dot: false,
};

const WILDCARDS: [char; 3] = ['*', '?', '['];

#[derive(Debug, Clone)]
pub struct GlobMatcher {
	raw: String,
	pattern: Pattern,
}

impl GlobMatcher {
	pub fn new(pattern: &str) -> Result<Self, PatternError> {
		Ok(Self { raw: pattern.to_string(), pattern: Pattern::new(pattern)? })
	}

	pub fn as_str(&self) -> &str {
		&self.raw
	}

	/// Matches a `/`-separated path.
	pub fn matches(&self, path: &str) -> bool {
		self.pattern.matches_with(path, PATH_OPTIONS)
	}

	/// The leading segments that contain no wildcard, e.g. `environments`
	/// for `environments/**/*.tfstate`. Used as a listing root or prefix.
	pub fn base(&self) -> &str {
		literal_base(&self.raw)
	}
}

pub fn has_wildcard(pattern: &str) -> bool {
	pattern.contains(WILDCARDS)
}

/// Longest `/`-terminated prefix without wildcards, trailing `/` removed.
pub fn literal_base(pattern: &str) -> &str {
	let first_wild = pattern.find(WILDCARDS).unwrap_or(pattern.len());
	if first_wild == pattern.len() {
		return pattern;
	}
	match pattern[..first_wild].rfind('/') {
		Some(0) => "/",
		Some(idx) => &pattern[..idx],
		None => "",
	}
}

/// Glob over resource addresses (`aws_instance.web`, `module.vpc.aws_subnet.a[0]`).
/// Addresses have no path separators, so `*` may span dots.
#[derive(Debug, Clone)]
pub struct AddressPattern {
	pattern: Pattern,
}

impl AddressPattern {
	pub fn new(pattern: &str) -> Result<Self, PatternError> {
		Ok(Self { pattern: Pattern::new(pattern)? })
	}

	pub fn matches(&self, address: &str) -> bool {
		self.pattern.matches_with(
			address,
			MatchOptions { case_sensitive: true, require_literal_separator: false, require_literal_leading_dot: false },
		)
	}
}
