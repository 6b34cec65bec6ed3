//! Human-readable magnitude parsing for command line values.
//!
//! Bandwidths are decimal (K = 10^3 bits), sizes are binary
//! (K = 1024 bytes), matching the usual convention of bandwidth
//! measurement tools. Suffixes are case-insensitive and optional.

#[derive(Debug, PartialEq, Eq)]
pub enum UnitError {
    BadUnit(String),
}

impl std::error::Error for UnitError {}

impl std::fmt::Display for UnitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::BadUnit(value) => write!(f, "invalid unit: {:?}", value),
        }
    }
}

/// Parse a bit-rate, `K`/`M`/`G` scaling by powers of 1000.
///
/// ```
/// assert_eq!(flowgen::units::parse_bps("100K").unwrap(), 100_000);
/// assert_eq!(flowgen::units::parse_bps("2M").unwrap(), 2_000_000);
/// ```
pub fn parse_bps(value: &str) -> Result<u64, UnitError> {
    parse_scaled(value, 1000)
}

/// Parse a byte count, `K`/`M`/`G` scaling by powers of 1024.
///
/// ```
/// assert_eq!(flowgen::units::parse_bytes("1K").unwrap(), 1024);
/// assert_eq!(flowgen::units::parse_bytes("1M").unwrap(), 1_048_576);
/// ```
pub fn parse_bytes(value: &str) -> Result<u64, UnitError> {
    parse_scaled(value, 1024)
}

fn parse_scaled(value: &str, base: u64) -> Result<u64, UnitError> {
    let bad = || UnitError::BadUnit(value.to_string());
    let value = value.trim();

    let (digits, scale) = match value.chars().last() {
        Some('k') | Some('K') => (&value[..value.len() - 1], base),
        Some('m') | Some('M') => (&value[..value.len() - 1], base * base),
        Some('g') | Some('G') => (&value[..value.len() - 1], base * base * base),
        Some(char) if char.is_ascii_digit() => (value, 1),
        _ => return Err(bad()),
    };

    digits
        .parse::<u64>()
        .ok()
        .and_then(|raw| raw.checked_mul(scale))
        .ok_or_else(bad)
}
