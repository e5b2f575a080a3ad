//! API numbers and service error codes used by the connection core.

/// API numbers carried in `intInfo` of `RODS_API_REQ` messages.
pub mod api {
    pub const AUTH_REQUEST_AN: i32 = 703;
    pub const AUTH_RESPONSE_AN: i32 = 704;
    pub const END_TRANSACTION_AN: i32 = 718;
    pub const TICKET_ADMIN_AN: i32 = 723;
    pub const PAM_AUTH_REQUEST_AN: i32 = 725;
    pub const AUTH_PLUG_REQ_AN: i32 = 1201;
    /// Generic authentication-agent endpoint (iRODS 4.3+).
    pub const AUTHENTICATION_APN: i32 = 110000;
}

const ERROR_NAMES: &[(i32, &str)] = &[
    (-4000, "SYS_HEADER_READ_LEN_ERR"),
    (-5000, "SYS_HEADER_WRITE_LEN_ERR"),
    (-6000, "SYS_HEADER_TYPE_LEN_ERR"),
    (-8000, "SYS_GETSTARTUP_PACK_ERR"),
    (-9000, "SYS_EXCEED_CONNECT_CNT"),
    (-10000, "SYS_USER_NOT_ALLOWED_TO_CONN"),
    (-11000, "SYS_READ_MSG_BODY_INPUT_ERR"),
    (-12000, "SYS_UNMATCHED_API_NUM"),
    (-13000, "SYS_NO_API_PRIV"),
    (-14000, "SYS_API_INPUT_ERR"),
    (-15000, "SYS_PACK_INSTRUCT_FORMAT_ERR"),
    (-154000, "SYS_INTERNAL_ERR"),
    (-169000, "SYS_NOT_SUPPORTED"),
    (-300000, "USER_AUTH_SCHEME_ERR"),
    (-301000, "USER_AUTH_STRING_EMPTY"),
    (-302000, "USER_RODS_HOST_EMPTY"),
    (-303000, "USER_RODS_HOSTNAME_ERR"),
    (-304000, "USER_SOCK_OPEN_ERR"),
    (-305000, "USER_SOCK_CONNECT_ERR"),
    (-808000, "CAT_NO_ROWS_FOUND"),
    (-816000, "CAT_INVALID_ARGUMENT"),
    (-826000, "CAT_INVALID_AUTHENTICATION"),
    (-827000, "CAT_INVALID_USER"),
    (-840000, "CAT_PASSWORD_EXPIRED"),
    (-990000, "PAM_AUTH_NOT_BUILT_INTO_CLIENT"),
    (-991000, "PAM_AUTH_NOT_BUILT_INTO_SERVER"),
    (-993000, "PAM_AUTH_PASSWORD_FAILED"),
    (-994000, "PAM_AUTH_PASSWORD_INVALID_TTL"),
];

/// Returns the symbolic name of a service error code.
///
/// Service codes are multiples of 1000 with an optional errno folded into
/// the last three digits, so `-826002` resolves to `CAT_INVALID_AUTHENTICATION`.
pub fn error_name(code: i32) -> &'static str {
    let base = code - (code % 1000);
    ERROR_NAMES
        .iter()
        .find(|(c, _)| *c == code || *c == base)
        .map(|(_, name)| *name)
        .unwrap_or("UNKNOWN_ERROR")
}

/// Errno part of a service error code.
pub fn errno_of(code: i32) -> i32 {
    -(code % 1000)
}
