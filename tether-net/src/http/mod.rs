//! HTTP/1.1 codec
//!
//! Header composition and parsing, URL helpers, proxy tunneling and a
//! blocking request primitive. Bodies are buffered whole; there is no
//! streaming API.

pub mod header;
pub mod proxy;
pub mod request;
pub mod url;

pub use header::{
    build_connect_header, build_request_header, build_response_header, parse_header_lines,
    read_header, HeaderLines, HttpHeader,
};
pub use proxy::{proxy_connect, ProxySettings};
pub use request::{request, send_request, HttpRequest, HttpResponse};
pub use url::{encode_url, parse_url, ParsedUrl};
