//! Input validation for gRPC requests.

use crate::addr::MacAddr;
use std::net::Ipv4Addr;
use thiserror::Error;

/// Validation errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("{0} is required")]
    Required(&'static str),

    #[error("Invalid IPv4 address: {0}")]
    InvalidIpv4Address(String),

    #[error("Invalid MAC address: {0}")]
    InvalidMacAddress(String),

    #[error("Port out of range: {0} (must be 1-65535)")]
    PortOutOfRange(u32),
}

pub type Result<T> = std::result::Result<T, ValidationError>;

/// Parse a required dotted-quad IPv4 address.
pub fn parse_ipv4(field: &'static str, value: &str) -> Result<Ipv4Addr> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required(field));
    }
    value
        .parse()
        .map_err(|_| ValidationError::InvalidIpv4Address(value.to_string()))
}

/// Parse an optional IPv4 address. Empty and `0.0.0.0` both mean none.
pub fn parse_optional_ipv4(value: &str) -> Result<Option<Ipv4Addr>> {
    let value = value.trim();
    if value.is_empty() {
        return Ok(None);
    }
    let ip: Ipv4Addr = value
        .parse()
        .map_err(|_| ValidationError::InvalidIpv4Address(value.to_string()))?;
    Ok((!ip.is_unspecified()).then_some(ip))
}

/// Parse a required MAC address.
pub fn parse_mac(value: &str) -> Result<MacAddr> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ValidationError::Required("mac"));
    }
    value
        .parse()
        .map_err(|_| ValidationError::InvalidMacAddress(value.to_string()))
}

/// Narrow a proto `uint32` to a usable UDP port.
pub fn validate_port(port: u32) -> Result<u16> {
    match u16::try_from(port) {
        Ok(port) if port != 0 => Ok(port),
        _ => Err(ValidationError::PortOutOfRange(port)),
    }
}

/// Validate an `UpsertRemote` request.
pub fn validate_upsert_remote(
    local_ip: &str,
    remote_ip: &str,
    remote_port: u32,
) -> Result<(Ipv4Addr, Ipv4Addr, u16)> {
    Ok((
        parse_ipv4("local_ip", local_ip)?,
        parse_ipv4("remote_ip", remote_ip)?,
        validate_port(remote_port)?,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_ipv4() {
        assert_eq!(
            parse_ipv4("ip", " 10.0.0.1 "),
            Ok(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert_eq!(parse_ipv4("ip", ""), Err(ValidationError::Required("ip")));
        assert!(matches!(
            parse_ipv4("ip", "10.0.0"),
            Err(ValidationError::InvalidIpv4Address(_))
        ));
        assert!(matches!(
            parse_ipv4("ip", "fd00::1"),
            Err(ValidationError::InvalidIpv4Address(_))
        ));
    }

    #[test]
    fn test_optional_ipv4_clears() {
        assert_eq!(parse_optional_ipv4(""), Ok(None));
        assert_eq!(parse_optional_ipv4("0.0.0.0"), Ok(None));
        assert_eq!(
            parse_optional_ipv4("10.13.37.254"),
            Ok(Some(Ipv4Addr::new(10, 13, 37, 254)))
        );
        assert!(parse_optional_ipv4("gateway").is_err());
    }

    #[test]
    fn test_parse_mac() {
        assert_eq!(
            parse_mac("AA:BB:CC:DD:EE:FF"),
            Ok(MacAddr::new([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]))
        );
        assert_eq!(parse_mac(""), Err(ValidationError::Required("mac")));
        assert!(matches!(
            parse_mac("aa:bb:cc"),
            Err(ValidationError::InvalidMacAddress(_))
        ));
    }

    #[test]
    fn test_port_range() {
        assert_eq!(validate_port(40000), Ok(40000));
        assert_eq!(validate_port(65535), Ok(65535));
        assert_eq!(validate_port(0), Err(ValidationError::PortOutOfRange(0)));
        assert_eq!(
            validate_port(65536),
            Err(ValidationError::PortOutOfRange(65536))
        );
    }

    #[test]
    fn test_upsert_remote() {
        assert_eq!(
            validate_upsert_remote("10.0.0.5", "203.0.113.9", 40000),
            Ok((
                Ipv4Addr::new(10, 0, 0, 5),
                Ipv4Addr::new(203, 0, 113, 9),
                40000
            ))
        );
        assert_eq!(
            validate_upsert_remote("10.0.0.5", "", 40000),
            Err(ValidationError::Required("remote_ip"))
        );
    }
}
