//! Content-derived run identifiers.
//!
//! A run's identifier is the SHA-256 hex digest of its captured output bytes.
//! Two runs that produce byte-identical output share one identifier on
//! purpose: the history store treats recording the second as already done.
//! Metadata (author, time, command) is deliberately excluded from the hash.

use sha2::{Digest, Sha256};

use crate::error::Error;

/// Character length of a full hex identifier.
pub const FULL_LEN: usize = 64;

/// Compute the identifier for a run from its captured output.
///
/// Stdout bytes are hashed first, then stderr bytes.
pub fn run_identifier(stdout: &[u8], stderr: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(stdout);
    hasher.update(stderr);
    hex::encode(hasher.finalize())
}

/// Resolve `prefix` against a set of identifiers.
///
/// An exact match wins immediately; otherwise exactly one identifier must
/// start with `prefix`. Matching is case-sensitive, left-anchored, byte-wise.
pub fn match_prefix<'a, I>(identifiers: I, prefix: &str) -> Result<String, Error>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut matches: Vec<&str> = Vec::new();
    for id in identifiers {
        if id == prefix {
            return Ok(id.to_string());
        }
        if id.starts_with(prefix) {
            matches.push(id);
        }
    }
    match matches.len() {
        0 => Err(Error::NotFound {
            prefix: prefix.to_string(),
        }),
        1 => Ok(matches[0].to_string()),
        count => Err(Error::AmbiguousIdentifier {
            prefix: prefix.to_string(),
            count,
        }),
    }
}
