//! Error types for tunneld
//!
//! Errors are categorized by subsystem; the top-level [`TunneldError`]
//! aggregates them for callers that cross subsystem boundaries.

use std::io;
use std::net::SocketAddr;

use thiserror::Error;

/// Top-level error type for tunneld
#[derive(Debug, Error)]
pub enum TunneldError {
    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// VIP pool errors
    #[error("VIP pool error: {0}")]
    Vip(#[from] VipError),

    /// Domain resolver bridge errors
    #[error("Resolver error: {0}")]
    Resolver(#[from] ResolverError),

    /// TUN device errors
    #[error("TUN error: {0}")]
    Tun(#[from] TunError),

    /// Control-session errors
    #[error("Session error: {0}")]
    Session(#[from] SessionError),

    /// Transparent forwarder errors
    #[error("Forward error: {0}")]
    Forward(#[from] ForwardError),

    /// Plugin errors
    #[error("Plugin error: {0}")]
    Plugin(#[from] PluginError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// YAML parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::ValidationError(msg.into())
    }
}

/// VIP allocator errors
#[derive(Debug, Error)]
pub enum VipError {
    /// Every host address in the pool is handed out
    #[error("No VIP available in pool {cidr}")]
    NoVipAvailable { cidr: String },

    /// Invalid CIDR string
    #[error("Invalid CIDR: {0}")]
    InvalidCidr(String),

    /// The configured gateway does not belong to the pool CIDR
    #[error("Gateway {gateway} is not a host address of {cidr}")]
    GatewayOutOfRange { gateway: String, cidr: String },
}

/// Resolver bridge errors
#[derive(Debug, Error)]
pub enum ResolverError {
    /// Could not reach the KV store
    #[error("Failed to connect to etcd: {0}")]
    Connect(String),

    /// A put/delete against the KV store failed
    #[error("KV operation failed for {domain}: {reason}")]
    Kv { domain: String, reason: String },
}

impl ResolverError {
    pub fn kv(domain: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Kv {
            domain: domain.into(),
            reason: reason.into(),
        }
    }
}

/// TUN device errors
#[derive(Debug, Error)]
pub enum TunError {
    /// Device creation failed
    #[error("Failed to open TUN device {name}: {reason}")]
    Open { name: String, reason: String },

    /// Read/write on the device failed
    #[error("TUN I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Control-session errors
#[derive(Debug, Error)]
pub enum SessionError {
    /// The client never produced a valid auth frame in time
    #[error("Auth timed out")]
    AuthTimeout,

    /// Wrong pre-shared key or malformed auth payload
    #[error("Auth rejected: {0}")]
    AuthRejected(String),

    /// Frame-level protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Opening a sub-stream on the session mux failed
    #[error("Failed to open stream: {0}")]
    OpenStream(String),

    /// The peer went away or the carrier connection broke
    #[error("Session closed: {0}")]
    Closed(String),

    /// I/O error on the control stream
    #[error("Session I/O error: {0}")]
    Io(#[from] io::Error),
}

/// Transparent forwarder errors
#[derive(Debug, Error)]
pub enum ForwardError {
    /// Failed to create a socket
    #[error("Failed to create socket: {0}")]
    SocketCreation(String),

    /// Failed to set a socket option (IP_TRANSPARENT, IP_HDRINCL, ...)
    #[error("Failed to set socket option {option}: {reason}")]
    SocketOption { option: String, reason: String },

    /// Failed to bind to an address
    #[error("Failed to bind to {addr}: {reason}")]
    BindError { addr: SocketAddr, reason: String },

    /// Failed to retrieve the original destination of a redirected flow
    #[error("Failed to get original destination: {0}")]
    OriginalDst(String),

    /// No session owns the original-destination VIP
    #[error("No route to host: {0}")]
    NoRoute(String),

    /// Permission denied (CAP_NET_ADMIN required)
    #[error("Permission denied: transparent sockets require CAP_NET_ADMIN")]
    PermissionDenied,

    /// I/O error
    #[error("Forward I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ForwardError {
    /// Create a socket option error
    pub fn socket_option(option: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SocketOption {
            option: option.into(),
            reason: reason.into(),
        }
    }

    /// Create a bind error
    pub fn bind(addr: SocketAddr, reason: impl Into<String>) -> Self {
        Self::BindError {
            addr,
            reason: reason.into(),
        }
    }
}

/// Plugin errors
#[derive(Debug, Error)]
pub enum PluginError {
    /// No plugin registered under the requested protocol name
    #[error("Plugin not found: {0}")]
    NotFound(String),

    /// Process-start setup failed
    #[error("Plugin setup failed for {name}: {reason}")]
    Setup { name: String, reason: String },

    /// Per-attach proxy startup failed
    #[error("Plugin run failed for {protocol}: {reason}")]
    Run { protocol: String, reason: String },
}

impl PluginError {
    pub fn setup(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Setup {
            name: name.into(),
            reason: reason.into(),
        }
    }

    pub fn run(protocol: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Run {
            protocol: protocol.into(),
            reason: reason.into(),
        }
    }
}

/// Type alias for Result with TunneldError
pub type Result<T> = std::result::Result<T, TunneldError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = VipError::NoVipAvailable {
            cidr: "100.64.240.0/24".into(),
        };
        assert!(err.to_string().contains("100.64.240.0/24"));

        let err = ForwardError::PermissionDenied;
        assert!(err.to_string().contains("CAP_NET_ADMIN"));

        let err = PluginError::run("http", "listen failed");
        let msg = err.to_string();
        assert!(msg.contains("http"));
        assert!(msg.contains("listen failed"));
    }

    #[test]
    fn test_error_conversion() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "timeout");
        let err: TunneldError = io_err.into();
        assert!(matches!(err, TunneldError::Io(_)));

        let config_err = ConfigError::validation("bad cidr");
        let err: TunneldError = config_err.into();
        assert!(matches!(err, TunneldError::Config(_)));
    }
}
