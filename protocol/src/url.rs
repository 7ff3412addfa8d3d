//! Service URLs (RFC 2609).

use crate::SlpError;
use std::fmt::Display;
use std::fmt::Formatter;
use std::str::FromStr;

const SERVICE_SCHEME: &str = "service:";

#[derive(Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum NetworkFamily {
    Ip,
    Ipv6,
    Ipx,
    AppleTalk,
}

impl NetworkFamily {
    /// Textual form used by the SLP API, empty for plain IP.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Ip => "",
            Self::Ipv6 => "v6",
            Self::Ipx => "ipx",
            Self::AppleTalk => "at",
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone, Hash)]
pub struct ServiceUrl {
    has_service_scheme: bool,
    service_type: String,
    network_family: NetworkFamily,
    host: String,
    port: u16,
    service_part: String,
}

impl ServiceUrl {
    pub fn parse(url: &str) -> Result<Self, SlpError> {
        let (has_service_scheme, rest) = match strip_prefix_ignore_case(url, SERVICE_SCHEME) {
            Some(rest) => (true, rest),
            None => (false, url),
        };

        let ip_location = rest.find("://");
        for (marker, network_family) in [
            (":/ipx/", NetworkFamily::Ipx),
            (":/at/", NetworkFamily::AppleTalk),
        ] {
            let Some(i) = rest.find(marker) else {
                continue;
            };
            if ip_location.is_some_and(|j| j < i) {
                continue;
            }
            let (service_type, address) = (&rest[..i], &rest[i + marker.len()..]);
            if service_type.is_empty() || address.is_empty() {
                return Err(SlpError::ParseError);
            }
            return Ok(Self {
                has_service_scheme,
                service_type: service_type.into(),
                network_family,
                host: address.into(),
                port: 0,
                service_part: String::default(),
            });
        }

        let (service_type, location) = rest.split_once("://").ok_or(SlpError::ParseError)?;
        if service_type.is_empty() {
            return Err(SlpError::ParseError);
        }
        let (authority, service_part) = match location.find('/') {
            Some(i) => location.split_at(i),
            None => (location, ""),
        };
        let (network_family, host, port) = parse_authority(authority)?;

        Ok(Self {
            has_service_scheme,
            service_type: service_type.into(),
            network_family,
            host: host.into(),
            port,
            service_part: service_part.into(),
        })
    }

    /// Service type without the `service:` scheme, e.g. `printer:lpr`.
    pub fn service_type(&self) -> &str {
        &self.service_type
    }

    /// Service type as carried in registrations, e.g. `service:printer:lpr`.
    pub fn full_service_type(&self) -> String {
        if self.has_service_scheme {
            format!("{}{}", SERVICE_SCHEME, self.service_type)
        } else {
            self.service_type.clone()
        }
    }

    pub fn network_family(&self) -> NetworkFamily {
        self.network_family
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Port of the service, 0 when the URL does not name one.
    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn service_part(&self) -> &str {
        &self.service_part
    }
}

impl FromStr for ServiceUrl {
    type Err = SlpError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Display for ServiceUrl {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.has_service_scheme {
            f.write_str(SERVICE_SCHEME)?;
        }
        match self.network_family {
            NetworkFamily::Ipx | NetworkFamily::AppleTalk => {
                return write!(
                    f,
                    "{}:/{}/{}",
                    self.service_type,
                    self.network_family.as_str(),
                    self.host
                );
            }
            NetworkFamily::Ipv6 => write!(f, "{}://[{}]", self.service_type, self.host)?,
            NetworkFamily::Ip => write!(f, "{}://{}", self.service_type, self.host)?,
        }
        if self.port != 0 {
            write!(f, ":{}", self.port)?;
        }
        f.write_str(&self.service_part)
    }
}

fn parse_authority(authority: &str) -> Result<(NetworkFamily, &str, u16), SlpError> {
    let (network_family, host, port) = if let Some(bracketed) = authority.strip_prefix('[') {
        let (host, after) = bracketed.split_once(']').ok_or(SlpError::ParseError)?;
        let port = match after {
            "" => None,
            _ => Some(after.strip_prefix(':').ok_or(SlpError::ParseError)?),
        };
        (NetworkFamily::Ipv6, host, port)
    } else {
        match authority.rsplit_once(':') {
            Some((host, port)) => (NetworkFamily::Ip, host, Some(port)),
            None => (NetworkFamily::Ip, authority, None),
        }
    };
    if host.is_empty() {
        return Err(SlpError::ParseError);
    }
    let port = match port {
        Some(p) => p.parse().map_err(|_| SlpError::ParseError)?,
        None => 0,
    };
    Ok((network_family, host, port))
}

fn strip_prefix_ignore_case<'a>(s: &'a str, prefix: &str) -> Option<&'a str> {
    let head = s.get(..prefix.len())?;
    if head.eq_ignore_ascii_case(prefix) {
        Some(&s[prefix.len()..])
    } else {
        None
    }
}
