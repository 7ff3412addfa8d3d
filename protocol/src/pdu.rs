//! SLPv2 messages (RFC 2608 section 8 to 10).
//!
//! Only the messages a user agent and a registering client exchange are
//! modelled. Authentication blocks are skipped when received and never sent.

use crate::SlpError;
use bytes::Buf;
use bytes::BufMut;
use bytes::Bytes;
use bytes::BytesMut;
use std::ops::BitOr;
use std::string::FromUtf8Error;
use thiserror::Error;

pub const VERSION: u8 = 2;

/// Size of the header without the language tag.
const HEADER_SIZE: usize = 14;

const MAX_MESSAGE_LENGTH: usize = (1 << 24) - 1;

/// Wire length announcing "all naming authorities" in a service type request.
const NAMING_AUTHORITY_ALL: u16 = 0xFFFF;

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
#[repr(u8)]
pub enum FunctionId {
    ServiceRequest = 1,
    ServiceReply = 2,
    ServiceRegistration = 3,
    ServiceDeregistration = 4,
    ServiceAcknowledge = 5,
    AttributeRequest = 6,
    AttributeReply = 7,
    ServiceTypeRequest = 9,
    ServiceTypeReply = 10,
}

impl TryFrom<u8> for FunctionId {
    type Error = DecodeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => Self::ServiceRequest,
            2 => Self::ServiceReply,
            3 => Self::ServiceRegistration,
            4 => Self::ServiceDeregistration,
            5 => Self::ServiceAcknowledge,
            6 => Self::AttributeRequest,
            7 => Self::AttributeReply,
            9 => Self::ServiceTypeRequest,
            10 => Self::ServiceTypeReply,
            other => return Err(DecodeError::UnsupportedFunction(other)),
        })
    }
}

#[derive(Debug, Default, PartialEq, Eq, Clone, Copy)]
pub struct Flags(pub u16);

impl Flags {
    pub const OVERFLOW: Self = Self(0x8000);
    pub const FRESH: Self = Self(0x4000);
    pub const REQUEST_MCAST: Self = Self(0x2000);

    pub fn contains(self, other: Self) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for Flags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self {
        Self(self.0 | rhs.0)
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Header {
    pub flags: Flags,
    pub xid: u16,
    pub language: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct Message {
    pub header: Header,
    pub body: Body,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum Body {
    ServiceRequest(ServiceRequest),
    ServiceReply(ServiceReply),
    ServiceRegistration(ServiceRegistration),
    ServiceDeregistration(ServiceDeregistration),
    ServiceAcknowledge(ServiceAcknowledge),
    AttributeRequest(AttributeRequest),
    AttributeReply(AttributeReply),
    ServiceTypeRequest(ServiceTypeRequest),
    ServiceTypeReply(ServiceTypeReply),
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct UrlEntry {
    pub lifetime: u16,
    pub url: String,
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct ServiceRequest {
    /// Comma separated addresses of agents that already answered.
    pub previous_responders: String,
    pub service_type: String,
    pub scopes: String,
    pub predicate: String,
    pub spi: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServiceReply {
    pub error_code: u16,
    pub urls: Vec<UrlEntry>,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServiceRegistration {
    pub url: UrlEntry,
    pub service_type: String,
    pub scopes: String,
    pub attributes: String,
}

/// Deregisters a service, or only the listed attribute tags when `tags` is
/// not empty.
#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServiceDeregistration {
    pub scopes: String,
    pub url: UrlEntry,
    pub tags: String,
}

#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct ServiceAcknowledge {
    pub error_code: u16,
}

#[derive(Debug, Default, PartialEq, Eq, Clone)]
pub struct AttributeRequest {
    pub previous_responders: String,
    /// Service URL or service type.
    pub url: String,
    pub scopes: String,
    pub tags: String,
    pub spi: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct AttributeReply {
    pub error_code: u16,
    pub attributes: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub enum NamingAuthority {
    All,
    /// IANA.
    Default,
    Named(String),
}

impl NamingAuthority {
    /// Interprets the naming authority argument of the SLP API.
    pub fn from_api(naming_authority: &str) -> Self {
        match naming_authority {
            "*" => Self::All,
            "" => Self::Default,
            other => Self::Named(other.into()),
        }
    }
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServiceTypeRequest {
    pub previous_responders: String,
    pub naming_authority: NamingAuthority,
    pub scopes: String,
}

#[derive(Debug, PartialEq, Eq, Clone)]
pub struct ServiceTypeReply {
    pub error_code: u16,
    pub service_types: String,
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum DecodeError {
    #[error("Message is truncated")]
    Truncated,

    #[error("Unsupported SLP version {0}")]
    Version(u8),

    #[error("Length field {0} does not match the message")]
    Length(usize),

    #[error("Unsupported function ID {0}")]
    UnsupportedFunction(u8),

    #[error("Malformed authentication block")]
    AuthenticationBlock,

    #[error("String is not valid UTF-8")]
    Utf8(#[from] FromUtf8Error),
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EncodeError {
    #[error("Field or message is too long for the wire format")]
    TooLong,
}

impl From<DecodeError> for SlpError {
    fn from(_: DecodeError) -> Self {
        SlpError::ParseError
    }
}

impl From<EncodeError> for SlpError {
    fn from(_: EncodeError) -> Self {
        SlpError::BufferOverflow
    }
}

impl Body {
    pub fn function_id(&self) -> FunctionId {
        match self {
            Self::ServiceRequest(_) => FunctionId::ServiceRequest,
            Self::ServiceReply(_) => FunctionId::ServiceReply,
            Self::ServiceRegistration(_) => FunctionId::ServiceRegistration,
            Self::ServiceDeregistration(_) => FunctionId::ServiceDeregistration,
            Self::ServiceAcknowledge(_) => FunctionId::ServiceAcknowledge,
            Self::AttributeRequest(_) => FunctionId::AttributeRequest,
            Self::AttributeReply(_) => FunctionId::AttributeReply,
            Self::ServiceTypeRequest(_) => FunctionId::ServiceTypeRequest,
            Self::ServiceTypeReply(_) => FunctionId::ServiceTypeReply,
        }
    }

    fn encode(&self, buf: &mut BytesMut) -> Result<(), EncodeError> {
        match self {
            Self::ServiceRequest(r) => {
                put_string(buf, &r.previous_responders)?;
                put_string(buf, &r.service_type)?;
                put_string(buf, &r.scopes)?;
                put_string(buf, &r.predicate)?;
                put_string(buf, &r.spi)?;
            }
            Self::ServiceReply(r) => {
                buf.put_u16(r.error_code);
                buf.put_u16(r.urls.len().try_into().map_err(|_| EncodeError::TooLong)?);
                for entry in &r.urls {
                    put_url_entry(buf, entry)?;
                }
            }
            Self::ServiceRegistration(r) => {
                put_url_entry(buf, &r.url)?;
                put_string(buf, &r.service_type)?;
                put_string(buf, &r.scopes)?;
                put_string(buf, &r.attributes)?;
                buf.put_u8(0);
            }
            Self::ServiceDeregistration(r) => {
                put_string(buf, &r.scopes)?;
                put_url_entry(buf, &r.url)?;
                put_string(buf, &r.tags)?;
            }
            Self::ServiceAcknowledge(r) => buf.put_u16(r.error_code),
            Self::AttributeRequest(r) => {
                put_string(buf, &r.previous_responders)?;
                put_string(buf, &r.url)?;
                put_string(buf, &r.scopes)?;
                put_string(buf, &r.tags)?;
                put_string(buf, &r.spi)?;
            }
            Self::AttributeReply(r) => {
                buf.put_u16(r.error_code);
                put_string(buf, &r.attributes)?;
                buf.put_u8(0);
            }
            Self::ServiceTypeRequest(r) => {
                put_string(buf, &r.previous_responders)?;
                match &r.naming_authority {
                    NamingAuthority::All => buf.put_u16(NAMING_AUTHORITY_ALL),
                    NamingAuthority::Default => buf.put_u16(0),
                    NamingAuthority::Named(name) => put_string(buf, name)?,
                }
                put_string(buf, &r.scopes)?;
            }
            Self::ServiceTypeReply(r) => {
                buf.put_u16(r.error_code);
                put_string(buf, &r.service_types)?;
            }
        }
        Ok(())
    }

    fn decode(function_id: FunctionId, buf: &mut &[u8]) -> Result<Self, DecodeError> {
        Ok(match function_id {
            FunctionId::ServiceRequest => Self::ServiceRequest(ServiceRequest {
                previous_responders: get_string(buf)?,
                service_type: get_string(buf)?,
                scopes: get_string(buf)?,
                predicate: get_string(buf)?,
                spi: get_string(buf)?,
            }),
            FunctionId::ServiceReply => {
                let error_code = get_u16(buf)?;
                let count = get_u16(buf)?;
                let urls: Vec<UrlEntry> = (0..count)
                    .map(|_| get_url_entry(buf))
                    .collect::<Result<_, _>>()?;
                Self::ServiceReply(ServiceReply { error_code, urls })
            }
            FunctionId::ServiceRegistration => {
                let registration = ServiceRegistration {
                    url: get_url_entry(buf)?,
                    service_type: get_string(buf)?,
                    scopes: get_string(buf)?,
                    attributes: get_string(buf)?,
                };
                skip_authentication_blocks(buf)?;
                Self::ServiceRegistration(registration)
            }
            FunctionId::ServiceDeregistration => {
                Self::ServiceDeregistration(ServiceDeregistration {
                    scopes: get_string(buf)?,
                    url: get_url_entry(buf)?,
                    tags: get_string(buf)?,
                })
            }
            FunctionId::ServiceAcknowledge => Self::ServiceAcknowledge(ServiceAcknowledge {
                error_code: get_u16(buf)?,
            }),
            FunctionId::AttributeRequest => Self::AttributeRequest(AttributeRequest {
                previous_responders: get_string(buf)?,
                url: get_string(buf)?,
                scopes: get_string(buf)?,
                tags: get_string(buf)?,
                spi: get_string(buf)?,
            }),
            FunctionId::AttributeReply => {
                let error_code = get_u16(buf)?;
                // Error replies may end right after the error code.
                if error_code != 0 && buf.is_empty() {
                    return Ok(Self::AttributeReply(AttributeReply {
                        error_code,
                        attributes: String::default(),
                    }));
                }
                let attributes = get_string(buf)?;
                skip_authentication_blocks(buf)?;
                Self::AttributeReply(AttributeReply {
                    error_code,
                    attributes,
                })
            }
            FunctionId::ServiceTypeRequest => {
                let previous_responders = get_string(buf)?;
                let naming_authority = match get_u16(buf)? {
                    NAMING_AUTHORITY_ALL => NamingAuthority::All,
                    0 => NamingAuthority::Default,
                    length => NamingAuthority::Named(get_bytes_as_string(buf, length.into())?),
                };
                Self::ServiceTypeRequest(ServiceTypeRequest {
                    previous_responders,
                    naming_authority,
                    scopes: get_string(buf)?,
                })
            }
            FunctionId::ServiceTypeReply => {
                let error_code = get_u16(buf)?;
                if error_code != 0 && buf.is_empty() {
                    return Ok(Self::ServiceTypeReply(ServiceTypeReply {
                        error_code,
                        service_types: String::default(),
                    }));
                }
                Self::ServiceTypeReply(ServiceTypeReply {
                    error_code,
                    service_types: get_string(buf)?,
                })
            }
        })
    }
}

impl Message {
    pub fn new(xid: u16, language: impl Into<String>, body: Body) -> Self {
        Self {
            header: Header {
                flags: Flags::default(),
                xid,
                language: language.into(),
            },
            body,
        }
    }

    pub fn function_id(&self) -> FunctionId {
        self.body.function_id()
    }

    pub fn encode(&self) -> Result<Bytes, EncodeError> {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.header.language.len() + 64);
        buf.put_u8(VERSION);
        buf.put_u8(self.function_id() as u8);
        buf.put_uint(0, 3);
        buf.put_u16(self.header.flags.0);
        buf.put_uint(0, 3);
        buf.put_u16(self.header.xid);
        put_string(&mut buf, &self.header.language)?;
        self.body.encode(&mut buf)?;

        let length = buf.len();
        if length > MAX_MESSAGE_LENGTH {
            return Err(EncodeError::TooLong);
        }
        buf[2..5].copy_from_slice(&(length as u32).to_be_bytes()[1..]);
        Ok(buf.freeze())
    }

    pub fn decode(data: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = data;
        ensure(buf, HEADER_SIZE)?;
        let version = buf.get_u8();
        if version != VERSION {
            return Err(DecodeError::Version(version));
        }
        let function_id = buf.get_u8();
        let length = buf.get_uint(3) as usize;
        if length < HEADER_SIZE || length > data.len() {
            return Err(DecodeError::Length(length));
        }
        // Anything past the announced length is not part of the message.
        let mut buf = &data[2 + 3..length];

        let flags = Flags(buf.get_u16());
        // Extensions are not interpreted.
        let _next_extension_offset = buf.get_uint(3);
        let xid = buf.get_u16();
        let language = get_string(&mut buf)?;
        let body = Body::decode(function_id.try_into()?, &mut buf)?;

        Ok(Self {
            header: Header {
                flags,
                xid,
                language,
            },
            body,
        })
    }
}

fn put_string(buf: &mut BytesMut, s: &str) -> Result<(), EncodeError> {
    let length: u16 = s.len().try_into().map_err(|_| EncodeError::TooLong)?;
    // 0xFFFF is reserved for "all naming authorities".
    if length == NAMING_AUTHORITY_ALL {
        return Err(EncodeError::TooLong);
    }
    buf.put_u16(length);
    buf.put_slice(s.as_bytes());
    Ok(())
}

fn put_url_entry(buf: &mut BytesMut, entry: &UrlEntry) -> Result<(), EncodeError> {
    buf.put_u8(0);
    buf.put_u16(entry.lifetime);
    put_string(buf, &entry.url)?;
    buf.put_u8(0);
    Ok(())
}

fn ensure(buf: &[u8], size: usize) -> Result<(), DecodeError> {
    if buf.remaining() < size {
        Err(DecodeError::Truncated)
    } else {
        Ok(())
    }
}

fn get_u8(buf: &mut &[u8]) -> Result<u8, DecodeError> {
    ensure(buf, 1)?;
    Ok(buf.get_u8())
}

fn get_u16(buf: &mut &[u8]) -> Result<u16, DecodeError> {
    ensure(buf, 2)?;
    Ok(buf.get_u16())
}

fn get_string(buf: &mut &[u8]) -> Result<String, DecodeError> {
    let length = get_u16(buf)?;
    get_bytes_as_string(buf, length.into())
}

fn get_bytes_as_string(buf: &mut &[u8], length: usize) -> Result<String, DecodeError> {
    ensure(buf, length)?;
    let bytes = buf[..length].to_vec();
    buf.advance(length);
    Ok(String::from_utf8(bytes)?)
}

fn get_url_entry(buf: &mut &[u8]) -> Result<UrlEntry, DecodeError> {
    let _reserved = get_u8(buf)?;
    let lifetime = get_u16(buf)?;
    let url = get_string(buf)?;
    skip_authentication_blocks(buf)?;
    Ok(UrlEntry { lifetime, url })
}

fn skip_authentication_blocks(buf: &mut &[u8]) -> Result<(), DecodeError> {
    let count = get_u8(buf)?;
    for _ in 0..count {
        let _block_structure_descriptor = get_u16(buf)?;
        let length = usize::from(get_u16(buf)?);
        // The length covers the descriptor and the length field themselves.
        let rest = length
            .checked_sub(4)
            .ok_or(DecodeError::AuthenticationBlock)?;
        ensure(buf, rest)?;
        buf.advance(rest);
    }
    Ok(())
}
