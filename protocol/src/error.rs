use thiserror::Error;

/// Success code of the SLP API.
pub const SLP_OK: i32 = 0;

/// Code passed along with the final delivery of a multi-response operation.
pub const SLP_LAST_CALL: i32 = 1;

/// Every failure the SLP API can report.
///
/// The discriminants are the numeric codes defined by RFC 2614.
/// Codes in the range `-1..=-15` double as negated wire error codes.
#[derive(Error, Debug, PartialEq, Eq, Clone, Copy, Hash)]
pub enum SlpError {
    #[error("Language not supported")]
    LanguageNotSupported = -1,

    #[error("Parse error")]
    ParseError = -2,

    #[error("Invalid registration")]
    InvalidRegistration = -3,

    #[error("Scope not supported")]
    ScopeNotSupported = -4,

    #[error("Authentication absent")]
    AuthenticationAbsent = -6,

    #[error("Authentication failed")]
    AuthenticationFailed = -7,

    #[error("Invalid update")]
    InvalidUpdate = -13,

    #[error("Refresh rejected")]
    RefreshRejected = -15,

    #[error("Not implemented")]
    NotImplemented = -17,

    #[error("Buffer overflow")]
    BufferOverflow = -18,

    #[error("Network timed out")]
    NetworkTimedOut = -19,

    #[error("Network initialization failed")]
    NetworkInitFailed = -20,

    #[error("Memory allocation failed")]
    MemoryAllocFailed = -21,

    #[error("Bad parameter")]
    ParameterBad = -22,

    #[error("Network error")]
    NetworkError = -23,

    #[error("Internal system error")]
    InternalSystemError = -24,

    #[error("Handle in use")]
    HandleInUse = -25,

    #[error("Type error")]
    TypeError = -26,
}

impl SlpError {
    pub const ALL: [SlpError; 18] = [
        Self::LanguageNotSupported,
        Self::ParseError,
        Self::InvalidRegistration,
        Self::ScopeNotSupported,
        Self::AuthenticationAbsent,
        Self::AuthenticationFailed,
        Self::InvalidUpdate,
        Self::RefreshRejected,
        Self::NotImplemented,
        Self::BufferOverflow,
        Self::NetworkTimedOut,
        Self::NetworkInitFailed,
        Self::MemoryAllocFailed,
        Self::ParameterBad,
        Self::NetworkError,
        Self::InternalSystemError,
        Self::HandleInUse,
        Self::TypeError,
    ];

    pub fn code(self) -> i32 {
        self as i32
    }

    pub fn from_code(code: i32) -> Option<Self> {
        Self::ALL.into_iter().find(|e| e.code() == code)
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::LanguageNotSupported => "SLP_LANGUAGE_NOT_SUPPORTED",
            Self::ParseError => "SLP_PARSE_ERROR",
            Self::InvalidRegistration => "SLP_INVALID_REGISTRATION",
            Self::ScopeNotSupported => "SLP_SCOPE_NOT_SUPPORTED",
            Self::AuthenticationAbsent => "SLP_AUTHENTICATION_ABSENT",
            Self::AuthenticationFailed => "SLP_AUTHENTICATION_FAILED",
            Self::InvalidUpdate => "SLP_INVALID_UPDATE",
            Self::RefreshRejected => "SLP_REFRESH_REJECTED",
            Self::NotImplemented => "SLP_NOT_IMPLEMENTED",
            Self::BufferOverflow => "SLP_BUFFER_OVERFLOW",
            Self::NetworkTimedOut => "SLP_NETWORK_TIMED_OUT",
            Self::NetworkInitFailed => "SLP_NETWORK_INIT_FAILED",
            Self::MemoryAllocFailed => "SLP_MEMORY_ALLOC_FAILED",
            Self::ParameterBad => "SLP_PARAMETER_BAD",
            Self::NetworkError => "SLP_NETWORK_ERROR",
            Self::InternalSystemError => "SLP_INTERNAL_SYSTEM_ERROR",
            Self::HandleInUse => "SLP_HANDLE_IN_USE",
            Self::TypeError => "SLP_TYPE_ERROR",
        }
    }

    /// Maps the error code field of a reply or acknowledgement.
    ///
    /// Wire codes without an API counterpart (unknown authentication,
    /// unsupported version, busy DA, ...) surface as `InternalSystemError`.
    pub fn from_wire(code: u16) -> Result<(), Self> {
        match code {
            0 => Ok(()),
            1..=15 => Err(Self::from_code(-i32::from(code)).unwrap_or(Self::InternalSystemError)),
            _ => Err(Self::InternalSystemError),
        }
    }
}

/// Name of any numeric API code, including success and the last-call marker.
///
/// Codes with no assigned meaning, inside or outside the defined range,
/// are all reported as `UNKNOWN_ERROR`.
pub fn error_name(code: i32) -> &'static str {
    match code {
        SLP_OK => "SLP_OK",
        SLP_LAST_CALL => "SLP_LAST_CALL",
        _ => SlpError::from_code(code)
            .map(SlpError::name)
            .unwrap_or("UNKNOWN_ERROR"),
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn code_round_trip() {
        for error in SlpError::ALL {
            assert_eq!(SlpError::from_code(error.code()), Some(error));
        }
    }

    #[test]
    fn names() {
        assert_eq!(error_name(0), "SLP_OK");
        assert_eq!(error_name(1), "SLP_LAST_CALL");
        assert_eq!(error_name(-2), "SLP_PARSE_ERROR");
        assert_eq!(error_name(-26), "SLP_TYPE_ERROR");
    }

    #[test]
    fn unassigned_codes_are_unknown() {
        for code in [-5, -8, -12, -14, -16, -27, 2, i32::MIN] {
            assert_eq!(error_name(code), "UNKNOWN_ERROR", "code {}", code);
        }
    }

    #[test]
    fn wire_codes() {
        assert_eq!(SlpError::from_wire(0), Ok(()));
        assert_eq!(SlpError::from_wire(4), Err(SlpError::ScopeNotSupported));
        assert_eq!(SlpError::from_wire(15), Err(SlpError::RefreshRejected));

        // Authentication unknown has no API counterpart.
        assert_eq!(SlpError::from_wire(5), Err(SlpError::InternalSystemError));
        assert_eq!(SlpError::from_wire(300), Err(SlpError::InternalSystemError));
    }
}
