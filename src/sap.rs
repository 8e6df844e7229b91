use std::{fmt, str::FromStr};

use crate::Error;

/// Service access point: the concrete transport address of an endpoint.
///
/// The string form is `<scheme>@<body>`; for tcp the body is `host[:port]`.
/// Port 0 (or an absent port) means "choose a free local port at bind time",
/// so once a transport is opened or connected its SAP always carries a
/// concrete port.
///
/// # Test
///
/// ```
/// use potp::sap::Sap;
///
/// let sap: Sap = "tcp@127.0.0.1:10500".parse().unwrap();
///
/// assert_eq!(sap, Sap::tcp("127.0.0.1", 10500));
/// assert_eq!(sap.to_string(), "tcp@127.0.0.1:10500");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Sap {
    Tcp { host: String, port: u16 },
    Null,
}

impl Sap {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self::Tcp {
            host: host.into(),
            port,
        }
    }

    /// A tcp SAP on all interfaces with a port chosen at bind time.
    pub fn any() -> Self {
        Self::tcp("0.0.0.0", 0)
    }
}

impl fmt::Display for Sap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => write!(f, "tcp@{}:{}", host, port),
            Self::Null => write!(f, "null@"),
        }
    }
}

impl FromStr for Sap {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidUri(s.to_string());
        let (scheme, body) = s.split_once('@').ok_or_else(invalid)?;
        match scheme {
            "null" => Ok(Self::Null),
            "tcp" => match body.split_once(':') {
                None if !body.is_empty() => Ok(Self::tcp(body, 0)),
                Some((host, port)) if !host.is_empty() => {
                    let port = port.parse().map_err(|_| invalid())?;
                    Ok(Self::tcp(host, port))
                }
                _ => Err(invalid()),
            },
            _ => Err(invalid()),
        }
    }
}

/// A POTP endpoint reference: `potp://<sap>[/<handler-id>]`.
///
/// The optional handler segment selects a non-default handler of the target
/// endpoint; without it the request goes to the default handler.
///
/// # Test
///
/// ```
/// use potp::sap::{Sap, Uri};
///
/// let uri: Uri = "potp://tcp@localhost:10500/calculator".parse().unwrap();
///
/// assert_eq!(uri.sap, Sap::tcp("localhost", 10500));
/// assert_eq!(uri.handler.as_deref(), Some("calculator"));
/// assert_eq!(uri.to_string(), "potp://tcp@localhost:10500/calculator");
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Uri {
    pub sap: Sap,
    pub handler: Option<String>,
}

impl Uri {
    pub fn new(sap: Sap, handler: Option<String>) -> Self {
        Self { sap, handler }
    }
}

impl fmt::Display for Uri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.handler {
            Some(handler) => write!(f, "potp://{}/{}", self.sap, handler),
            None => write!(f, "potp://{}", self.sap),
        }
    }
}

impl FromStr for Uri {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || Error::InvalidUri(s.to_string());
        let rest = s.strip_prefix("potp://").ok_or_else(invalid)?;
        let (sap, handler) = match rest.split_once('/') {
            Some((sap, handler)) => {
                if handler.is_empty() || handler.contains('/') {
                    return Err(invalid());
                }
                (sap, Some(handler.to_string()))
            }
            None => (rest, None),
        };

        Ok(Self {
            sap: sap.parse().map_err(|_| invalid())?,
            handler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sap_round_trip() {
        for text in ["tcp@0.0.0.0:0", "tcp@localhost:10500", "null@"] {
            let sap: Sap = text.parse().unwrap();
            assert_eq!(sap.to_string(), text);
        }
    }

    #[test]
    fn sap_without_port_binds_anywhere() {
        let sap: Sap = "tcp@example.org".parse().unwrap();
        assert_eq!(sap, Sap::tcp("example.org", 0));
    }

    #[test]
    fn sap_rejects_garbage() {
        for text in ["", "tcp", "tcp@", "tcp@:80", "udp@host:1", "tcp@host:notaport"] {
            assert!(text.parse::<Sap>().is_err(), "{:?} parsed", text);
        }
    }

    #[test]
    fn uri_without_handler() {
        let uri: Uri = "potp://tcp@127.0.0.1:9000".parse().unwrap();
        assert_eq!(uri.handler, None);
    }

    #[test]
    fn uri_rejects_garbage() {
        for text in [
            "http://tcp@host:1",
            "potp://",
            "potp://tcp@host:1/",
            "potp://tcp@host:1/a/b",
        ] {
            assert!(text.parse::<Uri>().is_err(), "{:?} parsed", text);
        }
    }
}
