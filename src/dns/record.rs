use std::net::{Ipv4Addr, Ipv6Addr};

use crate::{error::ValidationError, resources::subdomain::RecordType};

/// Record value, checked against the shape its type requires.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordData {
    A(Ipv4Addr),
    Aaaa(Ipv6Addr),
    Mx { preference: u16, exchange: String },
    Srv { priority: u16, weight: u16, port: u16, target: String },
    Caa { flags: u8, tag: String, value: String },
    Cname(String),
    Txt(String),
    Ptr(String),
    Dname(String),
    Aname(String),
}

fn invalid(message: impl Into<String>) -> ValidationError {
    ValidationError::InvalidRecord(message.into())
}

fn parts<const N: usize>(
    record_type: RecordType,
    value: &str,
) -> Result<[&str; N], ValidationError> {
    let parts: Vec<&str> = value.split_whitespace().collect();
    parts.try_into().map_err(|_| {
        invalid(format!(
            "{record_type} records take {N} values separated by spaces"
        ))
    })
}

fn number<T: std::str::FromStr>(field: &str, value: &str) -> Result<T, ValidationError> {
    value
        .parse()
        .map_err(|_| invalid(format!("{field} must be a number, got {value:?}")))
}

impl RecordData {
    pub fn parse(record_type: RecordType, value: &str) -> Result<Self, ValidationError> {
        let value = value.trim();
        if value.is_empty() {
            return Err(invalid("record value must not be empty"));
        }

        let data = match record_type {
            RecordType::A => RecordData::A(
                value
                    .parse()
                    .map_err(|_| invalid("A records take an IPv4 address"))?,
            ),
            RecordType::Aaaa => RecordData::Aaaa(
                value
                    .parse()
                    .map_err(|_| invalid("AAAA records take an IPv6 address"))?,
            ),
            RecordType::Mx => {
                let [preference, exchange] = parts(record_type, value)?;
                RecordData::Mx {
                    preference: number("preference", preference)?,
                    exchange: exchange.to_string(),
                }
            }
            RecordType::Srv => {
                let [priority, weight, port, target] = parts(record_type, value)?;
                RecordData::Srv {
                    priority: number("priority", priority)?,
                    weight: number("weight", weight)?,
                    port: number("port", port)?,
                    target: target.to_string(),
                }
            }
            RecordType::Caa => {
                let [flags, tag, caa_value] = parts(record_type, value)?;
                RecordData::Caa {
                    flags: number("flags", flags)?,
                    tag: tag.to_string(),
                    value: caa_value.to_string(),
                }
            }
            RecordType::Cname => RecordData::Cname(value.to_string()),
            RecordType::Txt => RecordData::Txt(value.to_string()),
            RecordType::Ptr => RecordData::Ptr(value.to_string()),
            RecordType::Dname => RecordData::Dname(value.to_string()),
            RecordType::Aname => RecordData::Aname(value.to_string()),
        };

        Ok(data)
    }

    pub fn record_type(&self) -> RecordType {
        match self {
            RecordData::A(_) => RecordType::A,
            RecordData::Aaaa(_) => RecordType::Aaaa,
            RecordData::Mx { .. } => RecordType::Mx,
            RecordData::Srv { .. } => RecordType::Srv,
            RecordData::Caa { .. } => RecordType::Caa,
            RecordData::Cname(_) => RecordType::Cname,
            RecordData::Txt(_) => RecordType::Txt,
            RecordData::Ptr(_) => RecordType::Ptr,
            RecordData::Dname(_) => RecordType::Dname,
            RecordData::Aname(_) => RecordType::Aname,
        }
    }

    /// Canonical single-string form, as stored locally.
    pub fn value(&self) -> String {
        match self {
            RecordData::A(ip) => ip.to_string(),
            RecordData::Aaaa(ip) => ip.to_string(),
            RecordData::Mx {
                preference,
                exchange,
            } => format!("{preference} {exchange}"),
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => format!("{priority} {weight} {port} {target}"),
            RecordData::Caa { flags, tag, value } => format!("{flags} {tag} {value}"),
            RecordData::Cname(v)
            | RecordData::Txt(v)
            | RecordData::Ptr(v)
            | RecordData::Dname(v)
            | RecordData::Aname(v) => v.clone(),
        }
    }

    /// Technitium `rData` query parameters.
    pub fn params(&self) -> Vec<(&'static str, String)> {
        match self {
            RecordData::A(ip) => vec![("ipAddress", ip.to_string())],
            RecordData::Aaaa(ip) => vec![("ipAddress", ip.to_string())],
            RecordData::Mx {
                preference,
                exchange,
            } => vec![
                ("preference", preference.to_string()),
                ("exchange", exchange.clone()),
            ],
            RecordData::Srv {
                priority,
                weight,
                port,
                target,
            } => vec![
                ("priority", priority.to_string()),
                ("weight", weight.to_string()),
                ("port", port.to_string()),
                ("target", target.clone()),
            ],
            RecordData::Caa { flags, tag, value } => vec![
                ("flags", flags.to_string()),
                ("tag", tag.clone()),
                ("value", value.clone()),
            ],
            RecordData::Cname(v) => vec![("cname", v.clone())],
            RecordData::Txt(v) => vec![("text", v.clone())],
            RecordData::Ptr(v) => vec![("ptrName", v.clone())],
            RecordData::Dname(v) => vec![("dname", v.clone())],
            RecordData::Aname(v) => vec![("aname", v.clone())],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_typed_values() {
        assert_eq!(
            RecordData::parse(RecordType::A, "10.0.0.1").unwrap(),
            RecordData::A(Ipv4Addr::new(10, 0, 0, 1))
        );
        assert!(RecordData::parse(RecordType::A, "::1").is_err());
        assert!(RecordData::parse(RecordType::Aaaa, "::1").is_ok());

        let mx = RecordData::parse(RecordType::Mx, "10  mail.example.org").unwrap();
        assert_eq!(mx.value(), "10 mail.example.org");
        assert!(RecordData::parse(RecordType::Mx, "mail.example.org").is_err());
        assert!(RecordData::parse(RecordType::Mx, "high mail.example.org").is_err());

        let srv = RecordData::parse(RecordType::Srv, "1 5 443 web.example.org").unwrap();
        assert_eq!(srv.params().len(), 4);
        assert!(RecordData::parse(RecordType::Srv, "1 5 web.example.org").is_err());

        assert!(RecordData::parse(RecordType::Caa, "0 issue letsencrypt.org").is_ok());
        assert!(RecordData::parse(RecordType::Caa, "0 issue").is_err());

        let txt = RecordData::parse(RecordType::Txt, "v=spf1 -all").unwrap();
        assert_eq!(txt.params(), vec![("text", "v=spf1 -all".to_string())]);
        assert!(RecordData::parse(RecordType::Cname, "  ").is_err());
    }
}
