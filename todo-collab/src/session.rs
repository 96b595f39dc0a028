//! Session validation hook run by the relay after the WebSocket handshake.
//!
//! Clients connect to `/?session=<token>`. Validation is pluggable; the
//! default accepts everything.

use std::collections::HashSet;
use std::net::SocketAddr;

/// What the relay knows about a connection when validating it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRequest {
    /// Request path without the query, e.g. `/`
    pub path: String,
    /// Value of the `session` query parameter
    pub token: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

impl SessionRequest {
    /// Parse from a request target such as `/?session=anon3f`.
    pub fn from_uri(uri: &str, remote_addr: Option<SocketAddr>) -> Self {
        let (path, query) = match uri.split_once('?') {
            Some((path, query)) => (path, query),
            None => (uri, ""),
        };
        let token = query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(key, _)| *key == "session")
            .map(|(_, value)| value.to_string())
            .filter(|value| !value.is_empty());

        Self {
            path: if path.is_empty() { "/".to_string() } else { path.to_string() },
            token,
            remote_addr,
        }
    }
}

/// Decides whether an upgraded connection may join. Runs once per
/// connection, before the host sees it.
pub trait SessionValidator: Send + Sync {
    /// `Err(reason)` rejects the connection; the reason goes into the close frame.
    fn validate(&self, request: &SessionRequest) -> Result<(), String>;
}

/// Accepts every session.
#[derive(Debug, Default, Clone, Copy)]
pub struct AcceptAllSessions;

impl SessionValidator for AcceptAllSessions {
    fn validate(&self, request: &SessionRequest) -> Result<(), String> {
        log::debug!(
            "session validation not enforced, accepting {:?} from {:?}",
            request.token,
            request.remote_addr
        );
        Ok(())
    }
}

/// Accepts only sessions whose token is on the list.
#[derive(Debug, Default, Clone)]
pub struct TokenAllowList {
    tokens: HashSet<String>,
}

impl TokenAllowList {
    pub fn new<I, S>(tokens: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            tokens: tokens.into_iter().map(Into::into).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}

impl SessionValidator for TokenAllowList {
    fn validate(&self, request: &SessionRequest) -> Result<(), String> {
        match &request.token {
            Some(token) if self.tokens.contains(token) => Ok(()),
            Some(_) => Err("unknown session".to_string()),
            None => Err("missing session".to_string()),
        }
    }
}
