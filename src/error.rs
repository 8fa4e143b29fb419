use core::fmt;

/// Errors surfaced by the firmware core.
#[derive(Debug, PartialEq, Eq, Copy, Clone)]
#[non_exhaustive]
pub enum Error {
    /// Caller violated an operation's contract (out-of-range intensity,
    /// missing parameter, malformed field value).
    InvalidArg,

    /// Operation attempted in the wrong state (send before a peer was set,
    /// pattern load while locked, start before init).
    InvalidState,

    /// External input had an impossible or out-of-budget size.
    InvalidSize,

    /// External input failed its checksum.
    InvalidCrc,

    /// A wait or handshake budget was exhausted.
    Timeout,

    /// The HKDF/SHA primitive reported an error.
    CryptoFailed,

    /// Unexpectedly reached the end of a buffer while reading or writing.
    ///
    /// This is returned when a frame does not fit its transmit buffer, and
    /// when parsing runs out of input early.
    Eof,

    /// The PHY or a peripheral reported a non-specific failure. Callers
    /// treat this as non-fatal.
    Fail,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Error::InvalidArg => "invalid argument",
            Error::InvalidState => "operation not allowed in current state",
            Error::InvalidSize => "invalid size",
            Error::InvalidCrc => "checksum mismatch",
            Error::Timeout => "wait budget exhausted",
            Error::CryptoFailed => "crypto primitive failed",
            Error::Eof => "end of buffer",
            Error::Fail => "peripheral failure",
        })
    }
}
