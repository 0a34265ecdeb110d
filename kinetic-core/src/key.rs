//! Computation keys: the canonical identity of one cached call.
//!
//! A `ComputationKey` is built from an operation name, its ordered argument
//! list and (for session-scoped operations) the caller's session. Equality and
//! hashing are structural over a canonical text encoding, so two calls with
//! the same operation and JSON-equal arguments always hit the same entry.
//!
//! # Encoding
//!
//! ```text
//! operation(arg0,arg1,...)            -- no session
//! operation(arg0,arg1,...)#session    -- session-scoped
//! ```
//!
//! Arguments are rendered as compact JSON. Object members are emitted in
//! sorted order, which makes the encoding independent of the order in which
//! a client happened to write them.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Separator between the call part of an encoded key and its session.
const SESSION_SEPARATOR: char = '#';

/// Opaque identity token issued by an external session provider.
///
/// Never interpreted by the cache; it only partitions keys of
/// session-scoped operations.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Session(String);

impl Session {
    /// Wrap a session token.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Session {
    fn from(token: &str) -> Self {
        Self::new(token)
    }
}

/// Canonical identity of a cached computation.
///
/// Cloning is cheap: the key data is shared behind an `Arc`.
#[derive(Clone)]
pub struct ComputationKey {
    inner: Arc<KeyInner>,
}

struct KeyInner {
    operation: String,
    args: Vec<Value>,
    session: Option<Session>,
    encoded: String,
}

impl ComputationKey {
    /// Create a key for a call without a session.
    pub fn new(operation: impl Into<String>, args: Vec<Value>) -> Self {
        Self::build(operation.into(), args, None)
    }

    /// Create a key for a session-scoped call.
    pub fn with_session(operation: impl Into<String>, args: Vec<Value>, session: Session) -> Self {
        Self::build(operation.into(), args, Some(session))
    }

    fn build(operation: String, args: Vec<Value>, session: Option<Session>) -> Self {
        let encoded = encode(&operation, &args, session.as_ref());
        Self {
            inner: Arc::new(KeyInner {
                operation,
                args,
                session,
                encoded,
            }),
        }
    }

    /// The operation this key invokes.
    pub fn operation(&self) -> &str {
        &self.inner.operation
    }

    /// The ordered call arguments.
    pub fn args(&self) -> &[Value] {
        &self.inner.args
    }

    /// The session this key is scoped to, if any.
    pub fn session(&self) -> Option<&Session> {
        self.inner.session.as_ref()
    }

    /// The canonical encoding, also used as the wire identifier.
    pub fn encoded(&self) -> &str {
        &self.inner.encoded
    }
}

fn encode(operation: &str, args: &[Value], session: Option<&Session>) -> String {
    let mut out = String::with_capacity(operation.len() + 2 + args.len() * 8);
    out.push_str(operation);
    out.push('(');
    for (i, arg) in args.iter().enumerate() {
        if i > 0 {
            out.push(',');
        }
        // Display on Value is compact JSON and cannot fail.
        out.push_str(&arg.to_string());
    }
    out.push(')');
    if let Some(session) = session {
        out.push(SESSION_SEPARATOR);
        out.push_str(session.as_str());
    }
    out
}

impl PartialEq for ComputationKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner) || self.inner.encoded == other.inner.encoded
    }
}

impl Eq for ComputationKey {}

impl Hash for ComputationKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.inner.encoded.hash(state);
    }
}

impl PartialOrd for ComputationKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for ComputationKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.inner.encoded.cmp(&other.inner.encoded)
    }
}

impl fmt::Debug for ComputationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ComputationKey({})", self.inner.encoded)
    }
}

impl fmt::Display for ComputationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.inner.encoded)
    }
}

impl Serialize for ComputationKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.inner.encoded)
    }
}
