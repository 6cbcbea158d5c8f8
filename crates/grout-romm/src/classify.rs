//! Transport failure classification
//!
//! Classification walks the error's source chain and looks for I/O error
//! kinds first, then for well-known resolver / TLS / HTTP-parser messages.
//! The same chain always yields the same taxon.

use crate::RommError;
use std::error::Error as StdError;
use std::io;

const DNS_MARKERS: &[&str] = &[
    "dns error",
    "failed to lookup address",
    "name or service not known",
    "nodename nor servname",
    "no such host",
    "temporary failure in name resolution",
];

/// Plaintext bytes received on a TLS connection
const TLS_ON_PLAINTEXT_MARKERS: &[&str] = &[
    "invalidcontenttype",
    "corrupt message",
    "wrong version number",
    "record overflow",
];

/// TLS handshake bytes received on a plaintext connection
const PLAINTEXT_ON_TLS_MARKERS: &[&str] = &[
    "invalid http version",
    "invalid status",
    "http2 error",
    "malformed http response",
];

/// Classify a reqwest failure for a request made with `scheme`
pub fn classify_error(scheme: &str, err: &reqwest::Error) -> RommError {
    if err.is_timeout() {
        return RommError::Timeout;
    }

    if let Some(classified) = classify_source(scheme, err) {
        return classified;
    }

    if err.is_decode() {
        return RommError::Decode(err.to_string());
    }

    if let Some(status) = err.status() {
        return RommError::from_status(status.as_u16());
    }

    RommError::Request(err.to_string())
}

/// Classify any error by inspecting its source chain
pub fn classify_source(scheme: &str, err: &(dyn StdError + 'static)) -> Option<RommError> {
    let mut messages = Vec::new();
    let mut current: Option<&(dyn StdError + 'static)> = Some(err);

    while let Some(e) = current {
        if let Some(io_err) = e.downcast_ref::<io::Error>() {
            match io_err.kind() {
                io::ErrorKind::ConnectionRefused => {
                    return Some(RommError::ConnectionRefused(io_err.to_string()));
                }
                io::ErrorKind::TimedOut => return Some(RommError::Timeout),
                _ => {}
            }
        }
        messages.push(e.to_string().to_ascii_lowercase());
        current = e.source();
    }

    let chain = messages.join(": ");

    if DNS_MARKERS.iter().any(|m| chain.contains(m)) {
        return Some(RommError::InvalidHostname(chain));
    }

    if chain.contains("connection refused") {
        return Some(RommError::ConnectionRefused(chain));
    }

    if chain.contains("timed out") || chain.contains("deadline has elapsed") {
        return Some(RommError::Timeout);
    }

    if scheme == "https" && TLS_ON_PLAINTEXT_MARKERS.iter().any(|m| chain.contains(m)) {
        return Some(RommError::WrongProtocol {
            requested: "https".to_string(),
            correct: "http".to_string(),
        });
    }

    if scheme == "http" && PLAINTEXT_ON_TLS_MARKERS.iter().any(|m| chain.contains(m)) {
        return Some(RommError::WrongProtocol {
            requested: "http".to_string(),
            correct: "https".to_string(),
        });
    }

    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fmt;

    #[derive(Debug)]
    struct Wrapped {
        message: &'static str,
        source: io::Error,
    }

    impl fmt::Display for Wrapped {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(self.message)
        }
    }

    impl StdError for Wrapped {
        fn source(&self) -> Option<&(dyn StdError + 'static)> {
            Some(&self.source)
        }
    }

    fn wrapped(message: &'static str, kind: io::ErrorKind, inner: &str) -> Wrapped {
        Wrapped {
            message,
            source: io::Error::new(kind, inner.to_string()),
        }
    }

    #[test]
    fn test_connection_refused_by_kind() {
        let err = wrapped("error sending request", io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(
            classify_source("http", &err),
            Some(RommError::ConnectionRefused(_))
        ));
    }

    #[test]
    fn test_dns_failure() {
        let err = wrapped(
            "error sending request",
            io::ErrorKind::Other,
            "dns error: failed to lookup address information: Name or service not known",
        );
        assert!(matches!(
            classify_source("http", &err),
            Some(RommError::InvalidHostname(_))
        ));
    }

    #[test]
    fn test_tls_against_plaintext_server() {
        let err = wrapped(
            "error sending request",
            io::ErrorKind::InvalidData,
            "received corrupt message of type InvalidContentType",
        );
        assert_eq!(
            classify_source("https", &err),
            Some(RommError::WrongProtocol {
                requested: "https".into(),
                correct: "http".into()
            })
        );
    }

    #[test]
    fn test_plaintext_against_tls_server() {
        let err = wrapped(
            "error sending request",
            io::ErrorKind::Other,
            "invalid HTTP version parsed",
        );
        assert_eq!(
            classify_source("http", &err),
            Some(RommError::WrongProtocol {
                requested: "http".into(),
                correct: "https".into()
            })
        );
    }

    #[test]
    fn test_classification_is_deterministic() {
        let err = wrapped("error sending request", io::ErrorKind::TimedOut, "timed out");
        let first = classify_source("http", &err);
        for _ in 0..10 {
            assert_eq!(classify_source("http", &err), first);
        }
        assert_eq!(first, Some(RommError::Timeout));
    }

    #[test]
    fn test_unknown_error_is_unclassified() {
        let err = wrapped("something odd", io::ErrorKind::Other, "mystery");
        assert_eq!(classify_source("http", &err), None);
    }
}
