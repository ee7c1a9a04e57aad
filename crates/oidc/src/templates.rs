//! Static pages returned to the browser when the callback completes.

/// Served after a successful code exchange.
pub const SUCCESS_PAGE: &str = include_str!("assets/success.html");

/// Served when the callback is rejected or the exchange fails.
pub const ERROR_PAGE: &str = include_str!("assets/error.html");

/// Plain-text body for requests that carry no authorization code.
pub const MISSING_CODE_BODY: &str = "Bad Request: No authorization code received";
