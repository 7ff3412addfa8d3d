//! Service Location Protocol (RFC 2608) user agent and registration client.
//!
//! Open a [`Handle`], then discover services with
//! [`Handle::find_services`] or advertise them with [`Handle::register`].

mod engine;
mod handle;
mod lifetime;
mod property;
mod transport;
mod xid;

use slp_protocol::MULTICAST_IP;
use std::net::SocketAddrV4;

pub use engine::Flow;
pub use engine::FoundService;
pub use engine::Reply;
pub use handle::Handle;
pub use handle::PendingRequest;
pub use handle::RequestId;
pub use lifetime::Registration;
pub use property::Properties;
pub use property::PropertyError;
pub use property::CONFIGURATION_FILE_VARIABLE;
pub use slp_protocol::error_name;
pub use slp_protocol::escape;
pub use slp_protocol::unescape;
pub use slp_protocol::NetworkFamily;
pub use slp_protocol::ServiceUrl;
pub use slp_protocol::SlpError;
pub use slp_protocol::LIFETIME_DEFAULT;
pub use slp_protocol::LIFETIME_MAXIMUM;
pub use slp_protocol::SLP_LAST_CALL;
pub use slp_protocol::SLP_OK;

/// Reads a property of the process-wide configuration.
pub fn get_property(name: &str) -> Option<String> {
    Properties::global().get(name)
}

/// Does nothing. See [`Properties::set`].
pub fn set_property(name: &str, value: &str) {
    Properties::global().set(name, value)
}

/// Minimum registration lifetime in seconds of the process-wide
/// configuration, 0 when there is none.
pub fn refresh_interval() -> u32 {
    Properties::global().min_refresh_interval()
}

pub fn parse_service_url(url: &str) -> Result<ServiceUrl, SlpError> {
    ServiceUrl::parse(url)
}

fn get_multicast_address(port: u16) -> SocketAddrV4 {
    SocketAddrV4::new(MULTICAST_IP, port)
}
