use percent_encoding::{utf8_percent_encode, AsciiSet, PercentEncode, NON_ALPHANUMERIC};
use reqwest::StatusCode;

// RFC 3986 unreserved characters are the only ones left bare; this matches what the commons'
// verifier expects in canonical requests and what its API expects in path segments.
const NOT_ENCODED: &AsciiSet = &NON_ALPHANUMERIC
    .remove(b'_')
    .remove(b'.')
    .remove(b'-')
    .remove(b'~');

pub(crate) fn urlencode(input: &str) -> PercentEncode<'_> {
    utf8_percent_encode(input, NOT_ENCODED)
}

/// If this error was due to a reqwest error created from an HTTP response, return the status code
/// from that response.  If the error is not a `reqwest::Error`, or was not caused by an HTTP
/// response, returns None.
pub fn err_status_code(err: &anyhow::Error) -> Option<StatusCode> {
    if let Some(err) = err.downcast_ref::<reqwest::Error>() {
        err.status()
    } else {
        None
    }
}
