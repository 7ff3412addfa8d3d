//! Service Location Protocol version 2 wire format.

mod error;
mod escape;
pub mod pdu;
mod url;

use std::net::Ipv4Addr;

pub use error::error_name;
pub use error::SlpError;
pub use error::SLP_LAST_CALL;
pub use error::SLP_OK;
pub use escape::escape;
pub use escape::unescape;
pub use url::NetworkFamily;
pub use url::ServiceUrl;

/// Port registered for SLP with IANA.
pub const DEFAULT_PORT: u16 = 427;

/// Administratively scoped group for SLPv2 requests (RFC 2608 section 6.1).
pub const MULTICAST_IP: Ipv4Addr = Ipv4Addr::new(239, 255, 255, 253);

/// Registration lifetime that never expires.
pub const LIFETIME_MAXIMUM: u16 = 0xFFFF;

/// Lifetime used when a registration does not ask for one, 3 hours.
pub const LIFETIME_DEFAULT: u16 = 10800;

pub const DEFAULT_SCOPE: &str = "DEFAULT";
