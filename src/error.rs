/// Errors produced by the tunnel dispatcher.
///
/// Control-plane errors (ports, keys, subdomains) are delivered to the SSH
/// client over its error stream; data-plane errors only affect the request
/// or connection that triggered them.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ServerError {
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    #[error("unsupported port: {0}")]
    UnsupportedPort(u32),
    #[error("forwarder already registered")]
    ForwarderExists,
    #[error("subdomain already registered")]
    SubdomainTaken,
    #[error("invalid subdomain {0}")]
    InvalidSubdomain(String),
    #[error("Missing Host header")]
    MissingHostHeader,
    #[error("Invalid Host header")]
    InvalidHostHeader,
    #[error("Missing Upgrade header")]
    MissingUpgradeHeader,
    #[error("upstream unavailable: {0}")]
    UpstreamUnavailable(String),
}
