//! Configuration parser utilities

use crate::{Error, Result};
use ipnet::IpNet;
use std::collections::BTreeMap;
use std::net::IpAddr;

/// Parse a CIDR range; a bare address becomes a host range (/32 or /128)
pub fn parse_range(s: &str) -> Result<IpNet> {
    let s = s.trim();
    if s.contains('/') {
        let net: IpNet = s
            .parse()
            .map_err(|e| Error::config(format!("Invalid range {}: {}", s, e)))?;
        Ok(net.trunc())
    } else {
        let ip: IpAddr = s
            .parse()
            .map_err(|e| Error::config(format!("Invalid address {}: {}", s, e)))?;
        Ok(IpNet::from(ip))
    }
}

/// Parse a comma separated list of ranges
pub fn parse_range_list(s: &str) -> Result<Vec<IpNet>> {
    s.split(',')
        .map(str::trim)
        .filter(|part| !part.is_empty())
        .map(parse_range)
        .collect()
}

/// Parse `k1=v1,k2=v2` into a label map
pub fn parse_labels(s: &str) -> Result<BTreeMap<String, String>> {
    let mut labels = BTreeMap::new();
    for pair in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
        let (key, value) = pair
            .split_once('=')
            .ok_or_else(|| Error::config(format!("Invalid label {}, expected key=value", pair)))?;
        validate_label(key, value)?;
        labels.insert(key.to_string(), value.to_string());
    }
    Ok(labels)
}

/// Render a label map as a Kubernetes label selector
pub fn format_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}

/// Loose check of Kubernetes label syntax
pub fn validate_label(key: &str, value: &str) -> Result<()> {
    let valid_char = |c: char| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.');
    let name = key.rsplit('/').next().unwrap_or(key);
    if name.is_empty() || name.len() > 63 || !name.chars().all(valid_char) {
        return Err(Error::config(format!("Invalid label key: {}", key)));
    }
    if value.len() > 63 || !value.chars().all(valid_char) {
        return Err(Error::config(format!("Invalid label value for {}: {}", key, value)));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_range() {
        assert_eq!(parse_range("10.0.0.0/8").unwrap().to_string(), "10.0.0.0/8");
        assert_eq!(parse_range(" 10.1.2.3 ").unwrap().to_string(), "10.1.2.3/32");
        assert_eq!(parse_range("fd00::1").unwrap().to_string(), "fd00::1/128");
        // host bits are cleared
        assert_eq!(parse_range("10.1.2.3/16").unwrap().to_string(), "10.1.0.0/16");
        assert!(parse_range("not-an-ip").is_err());
    }

    #[test]
    fn test_parse_range_list() {
        let ranges = parse_range_list("10.0.0.0/8, ,192.168.1.1").unwrap();
        assert_eq!(ranges.len(), 2);
    }

    #[test]
    fn test_parse_labels() {
        let labels = parse_labels("owner=alice,team=core").unwrap();
        assert_eq!(format_selector(&labels), "owner=alice,team=core");
        assert!(parse_labels("owner").is_err());
        assert!(parse_labels("bad key=x").is_err());
    }
}
