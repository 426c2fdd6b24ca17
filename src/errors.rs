//! Error types for ADS operations.

/// Result alias using [`enum@Error`].
pub type Result<T> = std::result::Result<T, Error>;

/// The different ways an ADS operation can fail.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Connecting or socket I/O failed.  The connection is unusable
    /// afterwards; there is no automatic retry.
    #[error("{0}: {1}")]
    Io(&'static str, std::io::Error),

    /// The per-operation read timeout elapsed before a response arrived.
    #[error("{0}: timed out waiting for the response")]
    Timeout(&'static str),

    /// The operation's cancellation context fired before a response arrived.
    #[error("{0}: operation cancelled")]
    Cancelled(&'static str),

    /// A frame or record could not be decoded.  Fatal when it concerns a
    /// response, logged and skipped for inbound notifications.
    #[error("{0}: {1}")]
    Decode(&'static str, &'static str),

    /// The server answered with a nonzero ADS result code.
    #[error("{0}: {1} ({2:#x})")]
    Ads(&'static str, &'static str, u32),

    /// A response was well-formed but inconsistent with its request.
    #[error("{0}: {1} ({2})")]
    Reply(&'static str, &'static str, u32),

    /// No symbol or struct field with the given name exists.
    #[error("symbol or field {0:?} not found")]
    SymbolNotFound(String),

    /// Payload length does not match the declared size of the target.
    #[error("size mismatch: got {got} bytes, target takes {expected}")]
    SizeMismatch {
        /// Declared size of the target field or symbol.
        expected: usize,
        /// Length of the payload that was passed in.
        got: usize,
    },

    /// The primitive value codec does not know the given data type.
    #[error("unsupported data type {0:?}")]
    UnsupportedType(String),

    /// A length or duration exceeds the 32 bits ADS allows.
    #[error("length or duration exceeds 32 bits")]
    Overflow(#[from] std::num::TryFromIntError),
}

// io::Error is not Clone, but the pump needs to broadcast its exit error
// to every pending request.
impl Clone for Error {
    fn clone(&self) -> Self {
        use Error::*;
        match self {
            Io(ctx, e) => Io(ctx, std::io::Error::from(e.kind())),
            Timeout(ctx) => Timeout(ctx),
            Cancelled(ctx) => Cancelled(ctx),
            Decode(ctx, e) => Decode(ctx, e),
            Ads(ctx, e, i) => Ads(ctx, e, *i),
            Reply(ctx, e, i) => Reply(ctx, e, *i),
            SymbolNotFound(name) => SymbolNotFound(name.clone()),
            SizeMismatch { expected, got } => SizeMismatch { expected: *expected, got: *got },
            UnsupportedType(ty) => UnsupportedType(ty.clone()),
            Overflow(e) => Overflow(*e),
        }
    }
}

pub(crate) trait ErrContext {
    type Success;
    fn ctx(self, context: &'static str) -> Result<Self::Success>;
}

impl<T> ErrContext for std::result::Result<T, std::io::Error> {
    type Success = T;
    fn ctx(self, context: &'static str) -> Result<T> {
        self.map_err(|e| Error::Io(context, e))
    }
}

/// Commonly encountered ADS result codes, from the
/// [Beckhoff Information System](https://infosys.beckhoff.com/content/1033/tc3_ads_intro_howto/374277003.html).
pub const ADS_ERRORS: &[(u32, &str)] = &[
    (0x001, "Internal error"),
    (0x002, "No real-time"),
    (0x004, "Mailbox full - ADS message could not be sent"),
    (0x006, "Target port not found, possibly ADS server not started"),
    (0x007, "Target machine not found, possibly missing ADS routes"),
    (0x008, "Unknown command ID"),
    (0x00B, "Unknown AMS command"),
    (0x00D, "Port not connected"),
    (0x00E, "Invalid AMS length"),
    (0x00F, "Invalid AMS NetID"),
    (0x012, "Port disabled - system service not started"),
    (0x013, "Port already connected"),
    (0x015, "AMS Sync timeout"),
    (0x018, "Invalid AMS port"),
    (0x019, "No memory"),
    (0x01A, "TCP send error"),
    (0x01B, "Host unreachable"),
    (0x700, "General device error"),
    (0x701, "Service is not supported by server"),
    (0x702, "Invalid index group"),
    (0x703, "Invalid index offset"),
    (0x704, "Reading/writing not permitted"),
    (0x705, "Parameter size not correct"),
    (0x706, "Invalid parameter value(s)"),
    (0x707, "Device is not in a ready state"),
    (0x708, "Device is busy"),
    (0x70A, "Out of memory"),
    (0x70B, "Invalid parameter value(s)"),
    (0x70C, "Not found (files, ...)"),
    (0x710, "Symbol not found"),
    (0x711, "Symbol version invalid -> create a new handle"),
    (0x712, "Server is in an invalid state"),
    (0x713, "AdsTransMode not supported"),
    (0x714, "Notification handle is invalid"),
    (0x715, "Notification client not registered"),
    (0x716, "No more notification handles"),
    (0x717, "Notification size too large"),
    (0x718, "Device not initialized"),
    (0x719, "Device has a timeout"),
    (0x71E, "Request is pending"),
    (0x71F, "Request is aborted"),
    (0x722, "Symbol not active -> release handle and try again"),
    (0x723, "Access denied"),
    (0x740, "General client error"),
    (0x741, "Invalid parameter at service"),
    (0x744, "Invoke ID in use"),
    (0x745, "Timeout elapsed -> check route setting"),
    (0x748, "ADS port not opened"),
    (0x749, "No AMS address"),
    (0x754, "Invalid response received"),
];

/// Return an `Err` with the [`Error::Ads`] variant for the given result code.
pub fn ads_error<T>(action: &'static str, code: u32) -> Result<T> {
    match ADS_ERRORS.binary_search_by_key(&code, |e| e.0) {
        Ok(idx) => Err(Error::Ads(action, ADS_ERRORS[idx].1, code)),
        Err(_) => Err(Error::Ads(action, "Unknown error code", code)),
    }
}
