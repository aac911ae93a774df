//! Codec for the signed attachment-URL form.
//!
//! A signed URL carries `ex` (expiry) and `is` (issued) as hex-encoded
//! unix seconds plus `hm`, the signature. The canonical form persisted in
//! metadata is the same URL with the query string stripped.

use lazy_static::lazy_static;
use regex::Regex;
use url::Url;

use crate::error::{ClientError, Result};

lazy_static! {
    static ref CDN_CHANNEL_RE: Regex =
        Regex::new(r"^https://cdn\.discordapp\.com/attachments/(\d+)/").unwrap();
}

/// The decoded pieces of a signed URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SignedUrlParts {
    pub canonical_url: String,
    pub expiry: u32,
    pub issued: u32,
    pub signature: String,
}

/// Splits a signed URL into its canonical form and signing parameters.
/// Missing or malformed `ex`/`is` values are an error; nodes with
/// unparseable URLs must halt the operation rather than get defaults.
pub fn decode(signed: &str) -> Result<SignedUrlParts> {
    let parsed = Url::parse(signed)
        .map_err(|e| ClientError::Decode(format!("failed to parse attachment url {signed}: {e}")))?;

    let mut expiry = None;
    let mut issued = None;
    let mut signature = String::new();
    for (key, value) in parsed.query_pairs() {
        match key.as_ref() {
            "ex" => expiry = Some(parse_hex("ex", &value)?),
            "is" => issued = Some(parse_hex("is", &value)?),
            "hm" => signature = value.into_owned(),
            _ => {}
        }
    }

    let expiry = expiry.ok_or_else(|| missing_param("ex", signed))?;
    let issued = issued.ok_or_else(|| missing_param("is", signed))?;

    Ok(SignedUrlParts {
        canonical_url: canonical(&parsed),
        expiry,
        issued,
        signature,
    })
}

/// Rebuilds the signed form from a canonical URL and its parameters.
/// `ex` and `is` are written as lowercase hex.
pub fn encode(canonical_url: &str, expiry: u32, issued: u32, signature: &str) -> Result<String> {
    let mut parsed = Url::parse(canonical_url)
        .map_err(|e| ClientError::Decode(format!("failed to parse attachment url {canonical_url}: {e}")))?;

    parsed
        .query_pairs_mut()
        .clear()
        .append_pair("ex", &format!("{expiry:x}"))
        .append_pair("is", &format!("{issued:x}"))
        .append_pair("hm", signature);

    Ok(parsed.into())
}

/// Extracts the channel id from a CDN attachment URL.
pub fn extract_channel_id(url: &str) -> Result<String> {
    CDN_CHANNEL_RE
        .captures(url)
        .map(|c| c[1].to_string())
        .ok_or_else(|| ClientError::Decode(format!("failed to extract channel id from {url}")))
}

fn canonical(parsed: &Url) -> String {
    let mut canonical = parsed.clone();
    canonical.set_query(None);
    canonical.set_fragment(None);
    canonical.into()
}

fn parse_hex(name: &str, value: &str) -> Result<u32> {
    u32::from_str_radix(value, 16)
        .map_err(|_| ClientError::Decode(format!("query parameter {name} is not hex: {value}")))
}

fn missing_param(name: &str, url: &str) -> ClientError {
    ClientError::Decode(format!("signed url is missing the {name} parameter: {url}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIGNED: &str =
        "https://cdn.discordapp.com/attachments/123/456/f.bin?ex=65a0b1c2&is=659f603d&hm=deadbeef";

    #[test]
    fn decode_signed_url() {
        let parts = decode(SIGNED).unwrap();
        assert_eq!(parts.canonical_url, "https://cdn.discordapp.com/attachments/123/456/f.bin");
        assert_eq!(parts.expiry, 0x65a0b1c2);
        assert_eq!(parts.issued, 0x659f603d);
        assert_eq!(parts.signature, "deadbeef");
    }

    #[test]
    fn encode_round_trips() {
        let parts = decode(SIGNED).unwrap();
        let rebuilt = encode(&parts.canonical_url, parts.expiry, parts.issued, &parts.signature).unwrap();
        assert_eq!(rebuilt, SIGNED);
    }

    #[test]
    fn decode_rejects_missing_expiry() {
        let err = decode("https://cdn.discordapp.com/attachments/123/456/f.bin?is=659f603d&hm=aa").unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[test]
    fn decode_rejects_non_hex_values() {
        let err = decode("https://cdn.discordapp.com/attachments/1/2/f.bin?ex=zzzz&is=659f603d&hm=aa").unwrap_err();
        assert!(matches!(err, ClientError::Decode(_)));
    }

    #[test]
    fn channel_id_from_cdn_url() {
        let id = extract_channel_id("https://cdn.discordapp.com/attachments/10691284376/99/blob").unwrap();
        assert_eq!(id, "10691284376");
    }

    #[test]
    fn channel_id_rejects_foreign_hosts() {
        assert!(extract_channel_id("https://example.com/attachments/12/34/blob").is_err());
    }
}
