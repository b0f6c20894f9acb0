use std::{
    borrow::Borrow,
    error::Error,
    fmt::{Debug, Display, Formatter},
    ops::Deref,
};
use once_cell::sync::Lazy;
use regex::Regex;

/// Longest entry name accepted by the union. Host filesystems allow 255 bytes;
/// the difference is headroom for the whiteout and opaque-directory prefixes
/// that a whiteout collaborator adds to names on the host.
pub const MAX_NAME_LEN: usize = 242;

/// Prefix reserved for whiteout entries on host branches.
pub const WHITEOUT_PREFIX: &str = ".wh.";

#[derive(Debug,PartialEq,Eq)]
pub enum NameFromStrError {
    /// The name was empty.
    Empty,
    /// The name was `.` or `..`.
    DotName,
    /// The name contained `/` or NUL.
    InvalidChar,
    /// The name was longer than `MAX_NAME_LEN` bytes.
    TooLong,
    /// The name began with the whiteout prefix.
    ReservedPrefix,
}

impl Display for NameFromStrError {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
	match *self {
	    NameFromStrError::Empty
		=> write!(fmt, "empty name"),
	    NameFromStrError::DotName
		=> write!(fmt, "\".\" and \"..\" are not entry names"),
	    NameFromStrError::InvalidChar
		=> write!(fmt, "invalid char in name"),
	    NameFromStrError::TooLong
		=> write!(fmt, "name longer than {} bytes", MAX_NAME_LEN),
	    NameFromStrError::ReservedPrefix
		=> write!(fmt, "name begins with the reserved whiteout prefix \
				\"{}\"", WHITEOUT_PREFIX),
	}
    }
}

impl Error for NameFromStrError {}

static INVALID_NAME_CHAR_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"[\x00/]"#)
	.unwrap()
});
static RESERVED_NAME_PREFIX_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^\.wh\."#)
	.unwrap()
});

/// A single directory entry name, as it appears in every branch of the union.
/// This is to [`NameBuf`](struct.NameBuf.html) what `str` is to `String`.
///
/// # Restrictions
///
/// - A name MUST contain at least one byte and at most `MAX_NAME_LEN` bytes.
/// - A name MUST NOT be `.` or `..`.
/// - A name MUST NOT contain `/` (U+002F) or NUL (U+0000).
/// - A name MUST NOT begin with `.wh.`. Those names belong to whiteouts on
///   the host branches and are never visible through the union.
///
/// Names are compared byte for byte. Unlike a path, a name is never
/// normalized: the host trees already contain whatever bytes they contain,
/// and the union has to find them again.
#[repr(transparent)]
#[derive(PartialEq,Eq,PartialOrd,Ord,Hash)]
pub struct Name {
    inner: str
}

impl Name {
    /// Internal use only. Takes a `&str` and transmutes it into a `&Name`,
    /// without rechecking.
    ///
    /// Used by the `n!` macro.
    #[doc(hidden)]
    pub const fn from_str_preverified(s: &str) -> &Name {
	// This is `unsafe`, but sound. It's sound because `Name` is a
	// transparent wrapper around `str`.
	unsafe { std::mem::transmute(s) }
    }
    /// Checks that the given `&str` is a valid entry name and borrows it as
    /// one. Names are never rewritten, so this never copies.
    pub fn try_from_str(s: &str) -> Result<&Name, NameFromStrError> {
	if s.is_empty() {
	    return Err(NameFromStrError::Empty)
	}
	else if s == "." || s == ".." {
	    return Err(NameFromStrError::DotName)
	}
	else if s.len() > MAX_NAME_LEN {
	    return Err(NameFromStrError::TooLong)
	}
	else if INVALID_NAME_CHAR_PATTERN.is_match(s) {
	    return Err(NameFromStrError::InvalidChar)
	}
	else if RESERVED_NAME_PREFIX_PATTERN.is_match(s) {
	    return Err(NameFromStrError::ReservedPrefix)
	}
	Ok(Name::from_str_preverified(s))
    }
    /// Returns the name as a `&str`.
    pub fn as_str(&self) -> &str { &self.inner }
}

impl Display for Name {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
	Display::fmt(&self.inner, fmt)
    }
}

impl Debug for Name {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
	Debug::fmt(&self.inner, fmt)
    }
}

impl AsRef<str> for Name {
    fn as_ref(&self) -> &str { &self.inner }
}

impl AsRef<std::path::Path> for Name {
    fn as_ref(&self) -> &std::path::Path { std::path::Path::new(&self.inner) }
}

impl ToOwned for Name {
    type Owned = NameBuf;
    fn to_owned(&self) -> NameBuf {
	NameBuf { inner: self.inner.to_string() }
    }
}

impl Deref for Name {
    type Target = str;
    fn deref(&self) -> &str {
        &self.inner
    }
}

impl PartialEq<str> for Name {
    fn eq(&self, other: &str) -> bool {
        &self.inner == other
    }
}

/// Owned entry name. See [`Name`](struct.Name.html) for the restrictions.
#[repr(transparent)]
#[derive(PartialEq,Eq,PartialOrd,Ord,Hash,Clone)]
pub struct NameBuf {
    inner: String
}

impl NameBuf {
    /// Creates a new `NameBuf` from a `&str`. Returns an error if the passed
    /// name is invalid in any way.
    pub fn try_from_str(s: &str) -> Result<NameBuf, NameFromStrError> {
	Name::try_from_str(s).map(Name::to_owned)
    }
    /// Borrows this `NameBuf`'s contents as a `&Name`.
    pub fn as_name(&self) -> &Name {
	self.borrow()
    }
}

impl Borrow<Name> for NameBuf {
    fn borrow(&self) -> &Name {
	Name::from_str_preverified(self.inner.as_str())
    }
}

impl AsRef<Name> for NameBuf {
    fn as_ref(&self) -> &Name {
	self.borrow()
    }
}

impl Deref for NameBuf {
    type Target = Name;
    fn deref(&self) -> &Name {
	self.as_ref()
    }
}

impl Display for NameBuf {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
	Display::fmt(self.as_name(), fmt)
    }
}

impl Debug for NameBuf {
    fn fmt(&self, fmt: &mut Formatter<'_>) -> std::fmt::Result {
	Debug::fmt(self.as_name(), fmt)
    }
}

#[cfg(test)]
mod test {
    use super::*;
    #[test] fn good_names() {
	for name in &["foo", "foo.bar", ".hidden", "with space", "résumé",
		      "..dots", ".wh", "x.wh.y"] {
	    assert_eq!(Name::try_from_str(name).map(Name::as_str),
		       Ok(*name));
	}
    }
    #[test] fn bad_names() {
	let too_long = "a".repeat(MAX_NAME_LEN + 1);
	let cases: &[(&str, NameFromStrError)] = &[
	    ("", NameFromStrError::Empty),
	    (".", NameFromStrError::DotName),
	    ("..", NameFromStrError::DotName),
	    ("a/b", NameFromStrError::InvalidChar),
	    ("nul\0here", NameFromStrError::InvalidChar),
	    (&too_long, NameFromStrError::TooLong),
	    (".wh.foo", NameFromStrError::ReservedPrefix),
	    (".wh..wh..opq", NameFromStrError::ReservedPrefix),
	];
	for (name, expected) in cases {
	    match Name::try_from_str(name) {
		Ok(_) => panic!("try_from_str on {:?} should fail", name),
		Err(x) => {
		    if x != *expected {
			panic!("try_from_str on {:?} should fail with {:?}, \
				got {:?} instead", name, expected, x);
		    }
		},
	    }
	}
    }
    #[test] fn longest_name_is_accepted() {
	let longest = "z".repeat(MAX_NAME_LEN);
	assert!(NameBuf::try_from_str(&longest).is_ok());
    }
    #[test] fn macro_agrees() {
	assert_eq!(crate::n!("kernel.img"),
		   Name::try_from_str("kernel.img").unwrap());
    }
}
