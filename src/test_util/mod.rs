//! Utilities for testing code that uses the proxy without opening sockets. They are used for
//!  testing the proxy itself, but they are also exported for application testing, which is why
//!  they are part of the crate's regular (non-#[cfg(test)]) code.

pub mod link;
#[cfg(test)]
pub(crate) mod pki;

use crate::link::Party;

/// Parties with the given ids and distinct (but unused) loopback addresses, in rank order
pub fn test_parties(ids: &[&str]) -> Vec<Party> {
    ids.iter()
        .enumerate()
        .map(|(i, id)| Party::new(*id, format!("127.0.0.1:{}", 30000 + i)))
        .collect()
}
