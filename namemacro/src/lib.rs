use std::{
    error::Error,
    fmt::{Display, Formatter},
};
use proc_macro::TokenStream;
use syn::{parse_macro_input, LitStr};
use once_cell::sync::Lazy;
use regex::Regex;
use quote::quote;

// Keep in step with `MAX_NAME_LEN` and `Name::try_from_str` in the main
// crate. The error type is duplicated so the messages match.
const MAX_NAME_LEN: usize = 242;

#[derive(Debug,PartialEq,Eq)]
enum NameFromStrError {
    Empty,
    DotName,
    InvalidChar,
    TooLong,
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
				\".wh.\""),
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

fn validated(s: &str) -> Result<&str, NameFromStrError> {
    if s.is_empty() {
	Err(NameFromStrError::Empty)
    }
    else if s == "." || s == ".." {
	Err(NameFromStrError::DotName)
    }
    else if s.len() > MAX_NAME_LEN {
	Err(NameFromStrError::TooLong)
    }
    else if INVALID_NAME_CHAR_PATTERN.is_match(s) {
	Err(NameFromStrError::InvalidChar)
    }
    else if RESERVED_NAME_PREFIX_PATTERN.is_match(s) {
	Err(NameFromStrError::ReservedPrefix)
    }
    else {
	Ok(s)
    }
}

/// Validates a literal entry name and expands to a `&'static Name`.
#[proc_macro]
pub fn n(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as LitStr);
    let value = input.value();
    let value = match validated(&value) {
	Ok(x) => x,
	Err(x) => {
	    return proc_macro::TokenStream::from(syn::parse::Error::new_spanned(input, x.to_string()).to_compile_error())
	},
    };
    (quote!{
	::stackfs::Name::from_str_preverified(#value)
    }).into()
}
