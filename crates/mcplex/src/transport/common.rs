pub mod http_header;

#[cfg(feature = "client-side-sse")]
#[cfg_attr(docsrs, doc(cfg(feature = "client-side-sse")))]
pub mod client_side_sse;

#[cfg(feature = "server-side-http")]
#[cfg_attr(docsrs, doc(cfg(feature = "server-side-http")))]
pub mod server_side_http;
