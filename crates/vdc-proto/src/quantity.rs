//! Parsing of Kubernetes-style resource quantities.
//!
//! Kubernetes and the resource text form share one grammar: a decimal number
//! optionally followed by a suffix. CPU accepts the `m` (milli) suffix;
//! memory accepts binary (`Ki`..`Ei`) and decimal (`k`/`K`..`E`) suffixes.

use crate::error::{ProtoError, Result};

/// Bytes in one MiB.
pub const BYTES_PER_MIB: f64 = 1_048_576.0;

const BINARY_SUFFIXES: [(&str, f64); 6] = [
    ("Ki", 1024.0),
    ("Mi", 1_048_576.0),
    ("Gi", 1_073_741_824.0),
    ("Ti", 1_099_511_627_776.0),
    ("Pi", 1_125_899_906_842_624.0),
    ("Ei", 1_152_921_504_606_846_976.0),
];

const DECIMAL_SUFFIXES: [(&str, f64); 7] = [
    ("k", 1e3),
    ("K", 1e3),
    ("M", 1e6),
    ("G", 1e9),
    ("T", 1e12),
    ("P", 1e15),
    ("E", 1e18),
];

/// Parse a CPU quantity into cores (`"500m"` → `0.5`, `"2"` → `2.0`).
///
/// # Errors
///
/// Returns [`ProtoError::InvalidResourceRequest`] on malformed or negative
/// input.
pub fn parse_cpu(value: &str) -> Result<f64> {
    let value = value.trim();
    let cores = match value.strip_suffix('m') {
        Some(milli) => parse_number(milli, value)? / 1000.0,
        None => parse_number(value, value)?,
    };
    non_negative(cores, value)
}

/// Parse a memory quantity into bytes (`"1Gi"` → `1073741824`).
///
/// A bare number is bytes, as in Kubernetes.
///
/// # Errors
///
/// Returns [`ProtoError::InvalidResourceRequest`] on malformed or negative
/// input.
pub fn parse_bytes(value: &str) -> Result<f64> {
    let value = value.trim();
    for (suffix, factor) in BINARY_SUFFIXES.iter().chain(DECIMAL_SUFFIXES.iter()) {
        if let Some(number) = value.strip_suffix(suffix) {
            return non_negative(parse_number(number, value)? * factor, value);
        }
    }
    non_negative(parse_number(value, value)?, value)
}

/// Parse a memory quantity straight into MiB.
///
/// # Errors
///
/// Same as [`parse_bytes`].
pub fn parse_mib(value: &str) -> Result<f64> {
    Ok(parse_bytes(value)? / BYTES_PER_MIB)
}

/// Parse a whole-device count such as a GPU quantity.
///
/// # Errors
///
/// Returns [`ProtoError::InvalidResourceRequest`] if the value is not a
/// non-negative integer.
pub fn parse_count(value: &str) -> Result<u32> {
    value.trim().parse::<u32>().map_err(|_| {
        ProtoError::InvalidResourceRequest(format!("'{value}' is not a whole device count"))
    })
}

fn parse_number(number: &str, original: &str) -> Result<f64> {
    let parsed = number
        .trim()
        .parse::<f64>()
        .map_err(|_| ProtoError::InvalidResourceRequest(format!("unparseable quantity '{original}'")))?;
    if parsed.is_finite() {
        Ok(parsed)
    } else {
        Err(ProtoError::InvalidResourceRequest(format!(
            "quantity '{original}' is not finite"
        )))
    }
}

fn non_negative(value: f64, original: &str) -> Result<f64> {
    if value < 0.0 {
        return Err(ProtoError::InvalidResourceRequest(format!(
            "quantity '{original}' cannot be negative"
        )));
    }
    Ok(value)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case("2", 2.0 ; "whole cores")]
    #[test_case("1.5", 1.5 ; "fractional cores")]
    #[test_case("500m", 0.5 ; "millicores")]
    #[test_case(" 250m ", 0.25 ; "padded millicores")]
    fn test_parse_cpu(input: &str, expected: f64) {
        let cores = parse_cpu(input).unwrap_or(-1.0);
        assert!((cores - expected).abs() < f64::EPSILON);
    }

    #[test_case("1Gi", 1_073_741_824.0 ; "gibibytes")]
    #[test_case("512Mi", 536_870_912.0 ; "mebibytes")]
    #[test_case("1G", 1e9 ; "gigabytes")]
    #[test_case("128974848", 128_974_848.0 ; "bare bytes")]
    #[test_case("1k", 1000.0 ; "lowercase kilo")]
    fn test_parse_bytes(input: &str, expected: f64) {
        let bytes = parse_bytes(input).unwrap_or(-1.0);
        assert!((bytes - expected).abs() < 1.0);
    }

    #[test]
    fn test_parse_mib() {
        assert_eq!(parse_mib("2Gi").ok(), Some(2048.0));
    }

    #[test_case("" ; "empty")]
    #[test_case("abc" ; "letters")]
    #[test_case("-1" ; "negative")]
    #[test_case("12Xi" ; "unknown suffix")]
    #[test_case("inf" ; "infinite")]
    fn test_parse_cpu_rejects(input: &str) {
        assert!(parse_cpu(input).is_err());
    }

    #[test]
    fn test_parse_count() {
        assert_eq!(parse_count("4").ok(), Some(4));
        assert!(parse_count("-1").is_err());
        assert!(parse_count("1.5").is_err());
    }
}
