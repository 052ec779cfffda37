//! Point-to-point delivery of opaque messages between a fixed set of parties.
//!
//! A link knows parties only by their *rank*, i.e. their index in the topology. It does not look
//!  into the messages it transports, and it keeps a single inbound queue per peer, in arrival
//!  order, regardless of what the messages contain. Demultiplexing is the caller's job.

pub mod control_messages;
pub mod frame;
pub mod tcp_link;
pub mod tls;

use std::sync::Arc;
use std::time::Duration;

use anyhow::bail;
use async_trait::async_trait;
use bytes::Bytes;
#[cfg(test)] use mockall::automock;
use rustc_hash::FxHashSet;

use crate::config::{LinkOptions, TlsConfig};

#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Party {
    pub id: String,
    /// `host:port`
    pub address: String,
}

impl Party {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Party {
        Party {
            id: id.into(),
            address: address.into(),
        }
    }
}

/// Everything needed to set up a link: the topology (in rank order), tuning and TLS material
#[derive(Debug, Clone)]
pub struct LinkDesc {
    pub parties: Vec<Party>,
    pub options: LinkOptions,
    pub tls: Option<TlsConfig>,
}

impl LinkDesc {
    pub fn new(parties: Vec<Party>, options: LinkOptions, tls: Option<TlsConfig>) -> anyhow::Result<LinkDesc> {
        if parties.is_empty() {
            bail!("topology must contain at least one party");
        }

        let mut ids = FxHashSet::default();
        for party in &parties {
            if party.id.is_empty() {
                bail!("party ids must not be empty");
            }
            if !ids.insert(party.id.as_str()) {
                bail!("duplicate party id {:?} in topology", party.id);
            }
        }

        options.validate()?;

        Ok(LinkDesc {
            parties,
            options,
            tls,
        })
    }

    pub fn rank_of(&self, party_id: &str) -> Option<usize> {
        self.parties.iter()
            .position(|p| p.id == party_id)
    }

    pub fn world_size(&self) -> usize {
        self.parties.len()
    }
}

#[derive(Debug, thiserror::Error)]
pub enum LinkError {
    #[error("no message within {0:?}")]
    Timeout(Duration),
    #[error("link to rank {0} is closed")]
    Closed(usize),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// A started link for one party
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Link: Send + Sync + 'static {
    fn self_rank(&self) -> usize;

    /// Hands a message over to the outbound queue for a peer. This returns as soon as the
    ///  message is queued, it does not wait for (let alone confirm) delivery. It waits only if the
    ///  peer's outbound queue is full.
    async fn send_async(&self, to_rank: usize, msg: Bytes) -> anyhow::Result<()>;

    /// Waits for the next message from a given peer, up to the configured receive timeout.
    async fn recv(&self, from_rank: usize) -> Result<Bytes, LinkError>;

    /// Releases all resources. Calling this more than once has no additional effect.
    fn stop(&self);
}

#[cfg_attr(test, automock)]
#[async_trait]
pub trait LinkFactory: Send + Sync + 'static {
    async fn create(&self, desc: &LinkDesc, self_rank: usize) -> anyhow::Result<Arc<dyn Link>>;
}
