//! Placeholder parsing and substitution for plan values.
//!
//! Plan strings may reference values that come from the build configuration
//! (`$${base}`, `$${version}`, `$${name}`) or from the stage being executed
//! (`$${out}`). Configuration placeholders are substituted when the plan is
//! loaded; `$${out}` survives until a command actually runs.
//!
//! # Shell Variables
//!
//! Single `$` characters pass through unchanged, so shell variables like
//! `$HOME` and `$PATH` work naturally without any escaping.
//!
//! # Escaping
//!
//! Use `$$$` before `{` to produce a literal `$${` sequence.
//!
//! # Example
//!
//! ```
//! use strata_lib::placeholder::{parse, Placeholder, Segment};
//!
//! let segments = parse("$${base}/bin:$PATH").unwrap();
//! assert_eq!(segments, vec![
//!     Segment::Placeholder(Placeholder::Base),
//!     Segment::Literal("/bin:$PATH".to_string()),
//! ]);
//! ```

use std::str::FromStr;

use thiserror::Error;

/// A parsed placeholder reference.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placeholder {
  /// `$${base}` - the image base directory
  Base,
  /// `$${version}` - the image version string
  Version,
  /// `$${name}` - the image name
  Name,
  /// `$${out}` - the host directory holding the current stage's filesystem
  Out,
}

impl Placeholder {
  fn as_str(self) -> &'static str {
    match self {
      Placeholder::Base => "base",
      Placeholder::Version => "version",
      Placeholder::Name => "name",
      Placeholder::Out => "out",
    }
  }
}

/// A segment of parsed text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
  Literal(String),
  Placeholder(Placeholder),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PlaceholderError {
  #[error("unclosed placeholder at position {0}")]
  Unclosed(usize),

  #[error("unknown placeholder: {0}")]
  Unknown(String),

  #[error("placeholder '{0}' has no value here")]
  Unresolved(&'static str),
}

/// Supplies values for placeholders.
///
/// Returning `None` means the value is not known in this context.
pub trait Resolver {
  fn resolve(&self, placeholder: Placeholder) -> Option<&str>;
}

const OPEN: &str = "$${";

/// Split a string into literal text and placeholder references.
pub fn parse(input: &str) -> Result<Vec<Segment>, PlaceholderError> {
  let mut segments = Vec::new();
  let mut literal = String::new();
  let mut pos = 0;

  while let Some(found) = input[pos..].find(OPEN) {
    let start = pos + found;
    // `$$${` stays literal.
    if input[pos..start].ends_with('$') {
      literal.push_str(&input[pos..start - 1]);
      literal.push_str(OPEN);
      pos = start + OPEN.len();
      continue;
    }

    literal.push_str(&input[pos..start]);
    let name_start = start + OPEN.len();
    let Some(name_len) = input[name_start..].find('}') else {
      return Err(PlaceholderError::Unclosed(start));
    };
    if !literal.is_empty() {
      segments.push(Segment::Literal(std::mem::take(&mut literal)));
    }
    segments.push(Segment::Placeholder(input[name_start..name_start + name_len].parse()?));
    pos = name_start + name_len + 1;
  }

  literal.push_str(&input[pos..]);
  if !literal.is_empty() {
    segments.push(Segment::Literal(literal));
  }
  Ok(segments)
}

impl FromStr for Placeholder {
  type Err = PlaceholderError;

  fn from_str(name: &str) -> Result<Self, Self::Err> {
    [Placeholder::Base, Placeholder::Version, Placeholder::Name, Placeholder::Out]
      .into_iter()
      .find(|p| p.as_str() == name.trim())
      .ok_or_else(|| PlaceholderError::Unknown(name.trim().to_string()))
  }
}

/// Substitute every placeholder; any value the resolver lacks is an error.
pub fn substitute(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::with_capacity(input.len());
  for segment in parse(input)? {
    match segment {
      Segment::Literal(s) => result.push_str(&s),
      Segment::Placeholder(p) => {
        let value = resolver.resolve(p).ok_or(PlaceholderError::Unresolved(p.as_str()))?;
        result.push_str(value);
      }
    }
  }
  Ok(result)
}

/// Substitute the placeholders the resolver knows and keep the rest verbatim.
///
/// Used at plan load time, where `$${out}` is not known yet.
pub fn substitute_known(input: &str, resolver: &impl Resolver) -> Result<String, PlaceholderError> {
  let mut result = String::with_capacity(input.len());
  for segment in parse(input)? {
    match segment {
      Segment::Literal(s) => result.push_str(&escape_literal(&s)),
      Segment::Placeholder(p) => match resolver.resolve(p) {
        Some(value) => result.push_str(&escape_literal(value)),
        None => {
          result.push_str("$${");
          result.push_str(p.as_str());
          result.push('}');
        }
      },
    }
  }
  Ok(result)
}

/// Re-escape a literal so a second parse yields the same text.
fn escape_literal(s: &str) -> String {
  s.replace("$${", "$$${")
}
