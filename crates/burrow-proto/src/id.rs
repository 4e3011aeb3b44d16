//! Public tunnel identifiers
//!
//! A requested identifier is accepted when it is either 4-63 lowercase
//! alphanumeric characters, or an alphanumeric first and last character
//! around 4-63 characters of alphanumerics and hyphens.

use rand::Rng;
use thiserror::Error;

/// Message returned to clients asking for a malformed subdomain
pub const INVALID_ID_MESSAGE: &str =
    "Invalid subdomain. Subdomains must be lowercase and between 4 and 63 alphanumeric characters.";

/// Length of generated identifiers
const GENERATED_ID_LEN: usize = 10;

const ID_ALPHABET: &[u8] = b"abcdefghijklmnopqrstuvwxyz0123456789";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum IdError {
    #[error("{}", INVALID_ID_MESSAGE)]
    Invalid(String),
}

fn is_id_char(b: u8) -> bool {
    b.is_ascii_lowercase() || b.is_ascii_digit()
}

/// Validate an identifier requested through `GET /<id>`
pub fn validate_requested_id(id: &str) -> Result<(), IdError> {
    let bytes = id.as_bytes();

    let plain = (4..=63).contains(&bytes.len()) && bytes.iter().all(|&b| is_id_char(b));
    if plain {
        return Ok(());
    }

    // Hyphenated form: edge characters are alphanumeric, 4-63 characters between them
    let hyphenated = (6..=65).contains(&bytes.len())
        && is_id_char(bytes[0])
        && is_id_char(bytes[bytes.len() - 1])
        && bytes[1..bytes.len() - 1]
            .iter()
            .all(|&b| is_id_char(b) || b == b'-');
    if hyphenated {
        return Ok(());
    }

    Err(IdError::Invalid(id.to_string()))
}

/// Generate a random lowercase identifier
pub fn generate_id() -> String {
    let mut rng = rand::thread_rng();
    (0..GENERATED_ID_LEN)
        .map(|_| ID_ALPHABET[rng.gen_range(0..ID_ALPHABET.len())] as char)
        .collect()
}
