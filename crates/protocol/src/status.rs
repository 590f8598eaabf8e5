//! Response status codes.

/// Success.
pub const OK: i64 = 0;
/// Operation not permitted.
pub const EPERM: i64 = 1;
/// Service unreachable (no network could serve a forwarded request).
pub const EHOSTUNREACH: i64 = 113;
/// Token required but not provided.
pub const ENOTOK: i64 = 1000;
/// Action disabled or not supported.
pub const ENOACT: i64 = 1001;
/// Token expired.
pub const ETOKEXPIRED: i64 = 1002;
/// Internal server error.
pub const ESERVER: i64 = 1003;
/// User not found.
pub const ENOUSR: i64 = 1004;
/// Malformed client request.
pub const ECLIENT: i64 = 1005;
/// Token limit reached.
pub const ETOKLIMIT: i64 = 1006;
/// Service disabled or not found.
pub const ENOSRV: i64 = 1007;

/// Default message sent alongside a status code.
pub fn default_message(code: i64) -> &'static str {
    match code {
        OK => "ok",
        EPERM => "permission denied",
        EHOSTUNREACH => "service unreachable",
        ENOTOK => "a token is required",
        ENOACT => "action not available",
        ETOKEXPIRED => "token expired",
        ESERVER => "internal server error",
        ENOUSR => "user not found",
        ECLIENT => "client error",
        ETOKLIMIT => "token limit reached",
        ENOSRV => "service not available",
        _ => "unknown error",
    }
}
