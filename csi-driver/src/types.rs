//! Type-safe wrappers for driver configuration values.
//!
//! Each type implements `FromStr` so it can be parsed directly from command
//! line flags and environment variables at startup.

use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;

// ============================================================================
// CsiEndpoint
// ============================================================================

/// Address the CSI gRPC server listens on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CsiEndpoint {
    /// Unix domain socket at the given path
    Unix(PathBuf),
    /// TCP listener at host:port
    Tcp(String),
}

impl Display for CsiEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsiEndpoint::Unix(path) => write!(f, "unix://{}", path.display()),
            CsiEndpoint::Tcp(addr) => write!(f, "tcp://{}", addr),
        }
    }
}

impl FromStr for CsiEndpoint {
    type Err = EndpointParseError;

    /// Parse `unix://<path>` or `tcp://<host>:<port>`.
    ///
    /// The text after `unix://` is taken verbatim as the socket path, so
    /// `unix:///run/csi.sock` is absolute and `unix://tmp/csi.sock` is relative.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();

        if let Some(path) = s.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(EndpointParseError(s.to_string()));
            }
            return Ok(CsiEndpoint::Unix(PathBuf::from(path)));
        }

        if let Some(addr) = s.strip_prefix("tcp://") {
            // Require a numeric port after the last colon
            let valid = addr
                .rsplit_once(':')
                .is_some_and(|(host, port)| !host.is_empty() && port.parse::<u16>().is_ok());
            if !valid {
                return Err(EndpointParseError(s.to_string()));
            }
            return Ok(CsiEndpoint::Tcp(addr.to_string()));
        }

        Err(EndpointParseError(s.to_string()))
    }
}

/// Error returned when parsing an invalid endpoint.
#[derive(Debug, Clone)]
pub struct EndpointParseError(String);

impl Display for EndpointParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "invalid endpoint '{}': expected 'unix://<path>' or 'tcp://<host>:<port>'",
            self.0
        )
    }
}

impl std::error::Error for EndpointParseError {}

// ============================================================================
// UnpublishPolicy
// ============================================================================

/// How ControllerUnpublishVolume responds.
///
/// The backend exposes no detach primitive, so the controller either reports
/// the call as unimplemented or acknowledges it without doing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum UnpublishPolicy {
    /// Respond with UNIMPLEMENTED (default)
    #[default]
    Unimplemented,
    /// Validate the request and return success without touching the backend
    NoOp,
}

impl Display for UnpublishPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            UnpublishPolicy::Unimplemented => write!(f, "unimplemented"),
            UnpublishPolicy::NoOp => write!(f, "noop"),
        }
    }
}

impl FromStr for UnpublishPolicy {
    type Err = UnpublishPolicyParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "unimplemented" | "" => Ok(UnpublishPolicy::Unimplemented),
            "noop" | "no-op" => Ok(UnpublishPolicy::NoOp),
            _ => Err(UnpublishPolicyParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid unpublish policy.
#[derive(Debug, Clone)]
pub struct UnpublishPolicyParseError(String);

impl Display for UnpublishPolicyParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown unpublish policy '{}': expected 'unimplemented' or 'noop'",
            self.0
        )
    }
}

impl std::error::Error for UnpublishPolicyParseError {}

// ============================================================================
// BackendKind
// ============================================================================

/// Which backend volume client the driver is wired to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BackendKind {
    /// Remote block agent over gRPC (default)
    #[default]
    Agent,
    /// In-process disks, lost on exit
    Memory,
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BackendKind::Agent => write!(f, "agent"),
            BackendKind::Memory => write!(f, "memory"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = BackendKindParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "agent" => Ok(BackendKind::Agent),
            "memory" | "mem" => Ok(BackendKind::Memory),
            _ => Err(BackendKindParseError(s.to_string())),
        }
    }
}

/// Error returned when parsing an invalid backend kind.
#[derive(Debug, Clone)]
pub struct BackendKindParseError(String);

impl Display for BackendKindParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "unknown backend '{}': expected 'agent' or 'memory'",
            self.0
        )
    }
}

impl std::error::Error for BackendKindParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_unix_absolute() {
        let ep: CsiEndpoint = "unix:///var/run/csi/csi.sock".parse().unwrap();
        assert_eq!(ep, CsiEndpoint::Unix(PathBuf::from("/var/run/csi/csi.sock")));
        assert_eq!(ep.to_string(), "unix:///var/run/csi/csi.sock");
    }

    #[test]
    fn test_endpoint_unix_relative() {
        let ep: CsiEndpoint = "unix://tmp/csi.sock".parse().unwrap();
        assert_eq!(ep, CsiEndpoint::Unix(PathBuf::from("tmp/csi.sock")));
    }

    #[test]
    fn test_endpoint_tcp() {
        let ep: CsiEndpoint = "tcp://0.0.0.0:10000".parse().unwrap();
        assert_eq!(ep, CsiEndpoint::Tcp("0.0.0.0:10000".to_string()));
        assert_eq!(ep.to_string(), "tcp://0.0.0.0:10000");

        let ep: CsiEndpoint = "tcp://[::1]:10000".parse().unwrap();
        assert_eq!(ep, CsiEndpoint::Tcp("[::1]:10000".to_string()));
    }

    #[test]
    fn test_endpoint_invalid() {
        assert!("".parse::<CsiEndpoint>().is_err());
        assert!("unix://".parse::<CsiEndpoint>().is_err());
        assert!("tcp://localhost".parse::<CsiEndpoint>().is_err());
        assert!("tcp://:10000".parse::<CsiEndpoint>().is_err());
        assert!("http://localhost:80".parse::<CsiEndpoint>().is_err());
        assert!("/var/run/csi.sock".parse::<CsiEndpoint>().is_err());
    }

    #[test]
    fn test_unpublish_policy_from_str() {
        assert_eq!(
            "unimplemented".parse::<UnpublishPolicy>().unwrap(),
            UnpublishPolicy::Unimplemented
        );
        assert_eq!("NOOP".parse::<UnpublishPolicy>().unwrap(), UnpublishPolicy::NoOp);
        assert_eq!("no-op".parse::<UnpublishPolicy>().unwrap(), UnpublishPolicy::NoOp);
        assert!("detach".parse::<UnpublishPolicy>().is_err());
    }

    #[test]
    fn test_unpublish_policy_display() {
        assert_eq!(UnpublishPolicy::Unimplemented.to_string(), "unimplemented");
        assert_eq!(UnpublishPolicy::NoOp.to_string(), "noop");
        assert_eq!(UnpublishPolicy::default(), UnpublishPolicy::Unimplemented);
    }

    #[test]
    fn test_backend_kind_from_str() {
        assert_eq!("agent".parse::<BackendKind>().unwrap(), BackendKind::Agent);
        assert_eq!("Memory".parse::<BackendKind>().unwrap(), BackendKind::Memory);
        assert!("s3".parse::<BackendKind>().is_err());
    }
}
