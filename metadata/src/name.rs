use lazy_static::lazy_static;
use regex::Regex;

use crate::error::{MetaError, Result};

lazy_static! {
    /// Characters that break at least one of the consuming filesystems.
    static ref HOSTILE_CHARS: Regex = Regex::new(r#"[\x00-\x1f/\\:*?"<>|]"#).unwrap();
}

/// Validates a single path component against the blacklist of
/// filesystem-hostile characters.
pub fn validate_name(name: &str) -> Result<()> {
    if name.is_empty() {
        return Err(MetaError::InvalidName("name is empty".to_string()));
    }
    if name == "." || name == ".." {
        return Err(MetaError::InvalidName(format!("name {name} is reserved")));
    }
    if HOSTILE_CHARS.is_match(name) {
        return Err(MetaError::InvalidName(format!(
            "name {name} contains a forbidden character"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_names_pass() {
        for name in ["report.txt", "music", "a b c", "ünïcode", "x.tar.gz"] {
            assert!(validate_name(name).is_ok(), "{name}");
        }
    }

    #[test]
    fn hostile_names_fail() {
        for name in ["", ".", "..", "a/b", "a\\b", "a:b", "a*b", "a?b", "a\"b", "a<b", "a>b", "a|b", "a\x07b"] {
            assert!(validate_name(name).is_err(), "{name:?}");
        }
    }
}
