//! Public IP discovery
//!
//! The server needs its publicly-visible IPv4 address to publish
//! `domain -> IP` records; it asks an external text-returning service once
//! at startup. Failure is fatal: without a public address no domain can be
//! registered.

use std::io;
use std::net::Ipv4Addr;

/// The service queried for the server's public address
const DISCOVERY_URL: &str = "http://ipv4.icanhazip.com";

/// Discover this host's public IPv4 address.
///
/// The service answers with the dotted-quad address followed by a newline;
/// trailing whitespace is trimmed before parsing so a missing newline is
/// tolerated.
///
/// # Errors
///
/// Returns an error if the request fails or the body does not parse as an
/// IPv4 address.
pub async fn discover() -> io::Result<Ipv4Addr> {
    let body = reqwest::get(DISCOVERY_URL)
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::NotConnected, e))?
        .text()
        .await
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;

    parse_discovery_body(&body)
}

fn parse_discovery_body(body: &str) -> io::Result<Ipv4Addr> {
    let trimmed = body.trim_end();
    trimmed.parse::<Ipv4Addr>().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("discovery service returned invalid IPv4 address: {trimmed:?}"),
        )
    })
}
