use anyhow::{anyhow, Result};
use once_cell::sync::Lazy;
use regex::Regex;

static QUANTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"^([0-9]+(?:\.[0-9]*)?|\.[0-9]+)([A-Za-z]*)$").expect("static regex"));

fn multiplier(suffix: &str) -> Option<f64> {
    let m = match suffix {
        "" => 1.0,
        "Ki" => 1024f64,
        "Mi" => 1024f64.powi(2),
        "Gi" => 1024f64.powi(3),
        "Ti" => 1024f64.powi(4),
        "Pi" => 1024f64.powi(5),
        "Ei" => 1024f64.powi(6),
        "k" | "K" => 1e3,
        "M" => 1e6,
        "G" => 1e9,
        "T" => 1e12,
        "P" => 1e15,
        "E" => 1e18,
        "m" => 1e-3,
        _ => return None,
    };
    Some(m)
}

/// Parse a Kubernetes resource quantity (`16Gi`, `500M`, `1.5Ki`, `1024`) into base units.
pub fn parse_quantity(s: &str) -> Result<u64> {
    let s = s.trim();
    let caps = QUANTITY.captures(s).ok_or_else(|| anyhow!("invalid quantity: {:?}", s))?;
    let number: f64 = caps[1].parse().map_err(|_| anyhow!("invalid quantity number: {:?}", s))?;
    let mult = multiplier(&caps[2]).ok_or_else(|| anyhow!("unknown quantity suffix {:?} in {:?}", &caps[2], s))?;
    Ok((number * mult).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binary_suffixes() {
        assert_eq!(parse_quantity("1Ki").unwrap(), 1024);
        assert_eq!(parse_quantity("16Gi").unwrap(), 16 * 1024 * 1024 * 1024);
        assert_eq!(parse_quantity("1.5Mi").unwrap(), 1_572_864);
    }

    #[test]
    fn decimal_suffixes() {
        assert_eq!(parse_quantity("500M").unwrap(), 500_000_000);
        assert_eq!(parse_quantity("2k").unwrap(), 2000);
        assert_eq!(parse_quantity("2K").unwrap(), 2000);
        assert_eq!(parse_quantity("3G").unwrap(), 3_000_000_000);
    }

    #[test]
    fn plain_and_milli() {
        assert_eq!(parse_quantity("123456").unwrap(), 123456);
        assert_eq!(parse_quantity(" 42 ").unwrap(), 42);
        assert_eq!(parse_quantity("1500m").unwrap(), 2);
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_quantity("").is_err());
        assert!(parse_quantity("Gi").is_err());
        assert!(parse_quantity("12Xi").is_err());
        assert!(parse_quantity("-5Mi").is_err());
    }
}
