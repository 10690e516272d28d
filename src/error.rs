use http::StatusCode;
use thiserror::Error;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failures of a single download or upload test. All of them abort the
/// test; nothing here is retried.
#[derive(Debug, Error)]
pub enum TestError {
    /// Connection refused/reset, timeout, or a broken body stream.
    #[error("request to {url} failed")]
    Transport {
        url: String,
        #[source]
        source: BoxError,
    },

    /// The server answered with a non-2xx status.
    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: StatusCode },

    /// The response did not match the speed test protocol.
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("interrupted")]
    Interrupted,

    #[error("invalid sampler settings: {0}")]
    Settings(String),
}

impl TestError {
    pub fn transport(url: impl Into<String>, source: impl Into<BoxError>) -> Self {
        TestError::Transport {
            url: url.into(),
            source: source.into(),
        }
    }

    /// Transport-level failures, as opposed to protocol violations.
    pub fn is_transport(&self) -> bool {
        matches!(self, TestError::Transport { .. } | TestError::Status { .. })
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("reading config file {path}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("parsing config file {path}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("no server given and no default_server configured. Pass a server URL or profile name.")]
    NoServer,

    #[error("invalid server URL '{url}': {reason}")]
    BadUrl { url: String, reason: String },
}

/// Failures looking up public speedtest.net servers.
#[derive(Debug, Error)]
pub enum NearbyError {
    #[error("fetching speedtest.net server list")]
    Fetch(#[source] TestError),

    #[error("parsing speedtest.net server list")]
    Parse(#[source] quick_xml::DeError),

    #[error("server list cache {path}")]
    Cache {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("speedtest.net server list is empty")]
    Empty,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_kinds() {
        let io = std::io::Error::from(std::io::ErrorKind::ConnectionRefused);
        assert!(TestError::transport("http://x/", io).is_transport());
        let status = TestError::Status {
            url: "http://x/".into(),
            status: StatusCode::BAD_GATEWAY,
        };
        assert!(status.is_transport());
        assert!(!TestError::Protocol("short body".into()).is_transport());
        assert!(!TestError::Interrupted.is_transport());
    }

    #[test]
    fn status_message_names_url() {
        let err = TestError::Status {
            url: "http://x/hello".into(),
            status: StatusCode::NOT_FOUND,
        };
        assert_eq!(err.to_string(), "http://x/hello returned HTTP 404 Not Found");
    }
}
