//! Handles for stack-owned objects.
//!
//! Endpoints and connections live inside the network stack. Callers only
//! ever hold a typed handle, which maps one-to-one onto the slab key and
//! the mio `Token` used for readiness correlation.

use mio::Token;

/// Handle to a listening endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EndpointId(pub(crate) usize);

/// Handle to an accepted connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(pub(crate) usize);

impl EndpointId {
    pub fn token(self) -> Token {
        Token(self.0)
    }
}

impl ConnId {
    pub fn token(self) -> Token {
        Token(self.0)
    }
}

impl From<Token> for ConnId {
    fn from(token: Token) -> Self {
        ConnId(token.0)
    }
}

impl std::fmt::Display for ConnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

impl std::fmt::Display for EndpointId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "endpoint#{}", self.0)
    }
}
