//! Connection addresses
//!
//! An address is `<scheme>:<target>`, for example `local:`, `ssh:host`,
//! `smb:fileserver`, or `daemon:10.0.0.5:10101`. The scheme selects the
//! transport; the target is interpreted by that transport.

use crate::error::{Result, TetherError};
use std::fmt;
use std::str::FromStr;

/// A parsed connection address
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Address {
    scheme: String,
    target: String,
    port: Option<u16>,
    raw: String,
}

impl Address {
    /// Parse an address string.
    ///
    /// A trailing `:<digits>` on the target is taken as the port. IPv6
    /// literals need brackets to carry a port (`ssh:[::1]:2222`); a bare IPv6
    /// literal is kept whole.
    pub fn parse(raw: &str) -> Result<Self> {
        let (scheme, rest) = raw
            .split_once(':')
            .ok_or_else(|| TetherError::address(raw, "missing 'scheme:' prefix"))?;

        if !is_valid_scheme(scheme) {
            return Err(TetherError::address(
                raw,
                format!("invalid scheme '{}'", scheme),
            ));
        }

        let (target, port) = split_port(raw, rest)?;

        Ok(Self {
            scheme: scheme.to_string(),
            target,
            port,
            raw: raw.to_string(),
        })
    }

    /// Transport scheme
    pub fn scheme(&self) -> &str {
        &self.scheme
    }

    /// Scheme-defined target (host name, IP, empty for `local:`)
    pub fn target(&self) -> &str {
        &self.target
    }

    /// Port given in the address, if any
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// The original string
    pub fn raw(&self) -> &str {
        &self.raw
    }

    /// Port resolved against an explicit override and a transport default
    pub fn port_or(&self, override_port: Option<u16>, default: u16) -> u16 {
        override_port.or(self.port).unwrap_or(default)
    }
}

impl FromStr for Address {
    type Err = TetherError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.raw)
    }
}

/// Schemes follow URI rules: a letter, then letters, digits, `+`, `-`, `.`
fn is_valid_scheme(scheme: &str) -> bool {
    let mut chars = scheme.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || matches!(c, '+' | '-' | '.'))
}

fn split_port(raw: &str, rest: &str) -> Result<(String, Option<u16>)> {
    if let Some(bracketed) = rest.strip_prefix('[') {
        let (host, after) = bracketed
            .split_once(']')
            .ok_or_else(|| TetherError::address(raw, "unterminated '[' in target"))?;
        let port = match after {
            "" => None,
            _ => {
                let digits = after
                    .strip_prefix(':')
                    .ok_or_else(|| TetherError::address(raw, "unexpected text after ']'"))?;
                Some(parse_port(raw, digits)?)
            }
        };
        return Ok((host.to_string(), port));
    }

    match rest.matches(':').count() {
        0 => Ok((rest.to_string(), None)),
        1 => {
            let (host, digits) = rest.split_once(':').unwrap_or((rest, ""));
            Ok((host.to_string(), Some(parse_port(raw, digits)?)))
        }
        // Bare IPv6 literal
        _ => Ok((rest.to_string(), None)),
    }
}

fn parse_port(raw: &str, digits: &str) -> Result<u16> {
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return Err(TetherError::address(raw, format!("invalid port '{}'", digits)));
    }
    digits
        .parse()
        .map_err(|_| TetherError::address(raw, format!("port out of range '{}'", digits)))
}
