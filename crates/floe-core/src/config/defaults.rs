use std::time::Duration;

use floe_storage::StorageClass;
use floe_types::error::{FloeError, Result};

use super::types::{CipherKind, CompressionAlgorithm, FingerprintMode};

pub(super) fn default_prefix() -> String {
    "{year}-backup/".to_string()
}

pub(super) fn default_bag_storage_class() -> StorageClass {
    StorageClass::DeepArchive
}

pub(super) fn default_bag_size() -> String {
    "40G".to_string()
}

pub(super) fn default_min_retention_days() -> u32 {
    180
}

pub(super) fn default_scan_interval_days() -> u32 {
    190
}

pub(super) fn default_restore_days() -> u32 {
    7
}

pub(super) fn default_fingerprint() -> FingerprintMode {
    FingerprintMode::Content
}

pub(super) fn default_algorithm() -> CompressionAlgorithm {
    CompressionAlgorithm::Gzip
}

pub(super) fn default_cipher() -> CipherKind {
    CipherKind::Aes256Gcm
}

pub(super) fn default_transfer_concurrency() -> usize {
    2
}

pub(super) fn default_price_per_gb_month() -> f64 {
    0.00099
}

pub(super) fn default_price_per_1000_puts() -> f64 {
    0.05
}

pub(super) fn default_price_egress_per_gb() -> f64 {
    0.09
}

pub(super) fn default_price_thaw_standard_per_gb() -> f64 {
    0.02
}

pub(super) fn default_price_thaw_bulk_per_gb() -> f64 {
    0.0025
}

pub(super) fn default_currency() -> String {
    "USD".to_string()
}

/// Parse a simple duration string like "30m", "4h", "2d" or "26w".
pub fn parse_human_duration(raw: &str) -> Result<Duration> {
    let input = raw.trim();
    if input.is_empty() {
        return Err(FloeError::Config("duration must not be empty".into()));
    }

    let (num_part, unit) = match input.chars().last() {
        Some(c) if c.is_ascii_alphabetic() => (&input[..input.len() - 1], Some(c)),
        Some(_) => (input, None),
        None => return Err(FloeError::Config("duration must not be empty".into())),
    };

    let value: u64 = num_part
        .parse()
        .map_err(|_| FloeError::Config(format!("invalid duration value: '{raw}'")))?;

    let secs = match unit {
        Some('m') | Some('M') => value.saturating_mul(60),
        Some('h') | Some('H') => value.saturating_mul(60 * 60),
        Some('d') | Some('D') => value.saturating_mul(60 * 60 * 24),
        Some('w') | Some('W') => value.saturating_mul(60 * 60 * 24 * 7),
        Some(other) => {
            return Err(FloeError::Config(format!(
                "unsupported duration suffix '{other}' in '{raw}' (use m/h/d/w)"
            )));
        }
        None => value.saturating_mul(60 * 60 * 24),
    };

    if secs == 0 {
        return Err(FloeError::Config("duration must be greater than zero".into()));
    }

    Ok(Duration::from_secs(secs))
}

/// Parse a size like "40G", "512M", "1.5T" or a plain byte count.
pub fn parse_human_size(raw: &str) -> Result<u64> {
    let s = raw.trim();
    if s.is_empty() {
        return Err(FloeError::Config("size must not be empty".into()));
    }
    let s = s.strip_suffix(&['B', 'b'][..]).unwrap_or(s);
    let s = s.strip_suffix('i').unwrap_or(s);

    let (num_str, multiplier) = match s.as_bytes().last() {
        Some(b'K' | b'k') => (&s[..s.len() - 1], 1024u64),
        Some(b'M' | b'm') => (&s[..s.len() - 1], 1024 * 1024),
        Some(b'G' | b'g') => (&s[..s.len() - 1], 1024 * 1024 * 1024),
        Some(b'T' | b't') => (&s[..s.len() - 1], 1024 * 1024 * 1024 * 1024),
        _ => (s, 1u64),
    };

    let num: f64 = num_str
        .trim()
        .parse()
        .map_err(|_| FloeError::Config(format!("invalid size: '{raw}'")))?;
    if !num.is_finite() || num < 0.0 {
        return Err(FloeError::Config(format!("invalid size: '{raw}'")));
    }
    Ok((num * multiplier as f64) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_human_duration_units() {
        assert_eq!(parse_human_duration("30m").unwrap().as_secs(), 30 * 60);
        assert_eq!(parse_human_duration("4h").unwrap().as_secs(), 4 * 60 * 60);
        assert_eq!(
            parse_human_duration("2w").unwrap().as_secs(),
            14 * 24 * 60 * 60
        );
    }

    #[test]
    fn test_parse_human_duration_plain_number_is_days() {
        assert_eq!(
            parse_human_duration("3").unwrap().as_secs(),
            3 * 24 * 60 * 60
        );
    }

    #[test]
    fn test_parse_human_duration_rejects_invalid_values() {
        assert!(parse_human_duration("").is_err());
        assert!(parse_human_duration("0h").is_err());
        assert!(parse_human_duration("5y").is_err());
    }

    #[test]
    fn test_parse_human_size() {
        assert_eq!(parse_human_size("40G").unwrap(), 40 * 1024 * 1024 * 1024);
        assert_eq!(parse_human_size("512MiB").unwrap(), 512 * 1024 * 1024);
        assert_eq!(parse_human_size("1.5K").unwrap(), 1536);
        assert_eq!(parse_human_size("100").unwrap(), 100);
        assert!(parse_human_size("lots").is_err());
        assert!(parse_human_size("").is_err());
    }
}
