//! Trust policies for upstream connections.
//!
//! A policy decides, per connection, how an observed (or absent) PROXY
//! protocol header is treated. The [`io::Listener`](crate::io::Listener)
//! consults a policy with the peer address of every accepted connection
//! before wrapping it.

use std::net::{IpAddr, SocketAddr};

use crate::Error;

/// How a connection that may carry a PROXY protocol header is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Policy {
    /// Parse the header and honor its addresses.
    Use,
    /// Parse and discard the header; the reported peer stays the socket peer.
    Ignore,
    /// Fail with [`Error::SuperfluousProxyHeader`] if a header is present.
    Reject,
    /// A header must be present; absence fails with
    /// [`Error::NoProxyProtocol`].
    Require,
    /// Bypass header handling entirely and expose the raw stream.
    Skip,
}

/// Decides how to treat a connection from the given upstream peer address.
///
/// Returning [`Error::InvalidUpstream`] drops the connection while the
/// listener keeps accepting; any other error is surfaced to the accept
/// caller.
pub type PolicyFn = dyn Fn(SocketAddr) -> Result<Policy, Error> + Send + Sync;

/// Addresses of an accepted connection, for policies that also need the
/// local (downstream) side, e.g. to trust a header only on one interface.
#[derive(Debug, Clone, Copy)]
pub struct ConnInfo {
    /// Peer address of the immediate upstream (the proxy, not the client).
    pub upstream: SocketAddr,
    /// Local address the connection arrived on.
    pub downstream: SocketAddr,
}

/// Connection-level variant of [`PolicyFn`].
pub type ConnPolicyFn = dyn Fn(ConnInfo) -> Result<Policy, Error> + Send + Sync;

/// Policy that honors headers only from the listed upstream addresses.
///
/// Headers from other peers are parsed and discarded ([`Policy::Ignore`]);
/// the connection itself stays usable.
pub fn lax_white_list(
    allowed: Vec<IpAddr>,
) -> impl Fn(SocketAddr) -> Result<Policy, Error> + Send + Sync {
    white_list(allowed, Policy::Ignore)
}

/// Policy that honors headers only from the listed upstream addresses and
/// refuses headers from anyone else ([`Policy::Reject`]).
pub fn strict_white_list(
    allowed: Vec<IpAddr>,
) -> impl Fn(SocketAddr) -> Result<Policy, Error> + Send + Sync {
    white_list(allowed, Policy::Reject)
}

fn white_list(
    allowed: Vec<IpAddr>,
    miss: Policy,
) -> impl Fn(SocketAddr) -> Result<Policy, Error> + Send + Sync {
    move |upstream: SocketAddr| {
        if allowed.contains(&upstream.ip()) {
            Ok(Policy::Use)
        } else {
            Ok(miss)
        }
    }
}
