use std::time::Duration;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::{select, time};

use crate::link::{Link, LinkDesc, LinkError, LinkFactory};

/// Connects a fixed number of parties through in-process queues. Every party's link is created
///  through the same factory instance, at most once per rank.
pub struct InMemoryLinkFactory {
    world_size: usize,
    /// `senders[from][to]`
    senders: Vec<Vec<mpsc::UnboundedSender<Bytes>>>,
    /// `receivers[to][from]`, taken when the link for `to` is created
    receivers: Mutex<Vec<Option<Vec<mpsc::UnboundedReceiver<Bytes>>>>>,
}

impl InMemoryLinkFactory {
    pub fn new(world_size: usize) -> InMemoryLinkFactory {
        let mut senders: Vec<Vec<mpsc::UnboundedSender<Bytes>>> = (0..world_size).map(|_| Vec::new()).collect();
        let mut receivers: Vec<Vec<mpsc::UnboundedReceiver<Bytes>>> = (0..world_size).map(|_| Vec::new()).collect();

        for to in 0..world_size {
            for from in 0..world_size {
                let (sender, receiver) = mpsc::unbounded_channel();
                senders[from].push(sender);
                receivers[to].push(receiver);
            }
        }

        InMemoryLinkFactory {
            world_size,
            senders,
            receivers: Mutex::new(receivers.into_iter().map(Some).collect()),
        }
    }

    /// Puts raw bytes on the wire from one party to another, bypassing the sender's link
    pub fn inject(&self, from_rank: usize, to_rank: usize, msg: Bytes) -> anyhow::Result<()> {
        self.senders.get(from_rank)
            .and_then(|s| s.get(to_rank))
            .ok_or_else(|| anyhow!("no queue from rank {} to rank {}", from_rank, to_rank))?
            .send(msg)
            .map_err(|_| anyhow!("queue from rank {} to rank {} is closed", from_rank, to_rank))
    }
}

#[async_trait]
impl LinkFactory for InMemoryLinkFactory {
    async fn create(&self, desc: &LinkDesc, self_rank: usize) -> anyhow::Result<Arc<dyn Link>> {
        if desc.world_size() != self.world_size {
            bail!("topology has {} parties, the in-memory network {}", desc.world_size(), self.world_size);
        }

        let inbound = self.receivers.lock().await
            .get_mut(self_rank)
            .and_then(|r| r.take())
            .ok_or_else(|| anyhow!("link for rank {} was created before", self_rank))?;

        let (stopped, _) = watch::channel(false);
        Ok(Arc::new(InMemoryLink {
            self_rank,
            recv_timeout: desc.options.recv_timeout,
            outbound: self.senders[self_rank].clone(),
            inbound: inbound.into_iter().map(Mutex::new).collect(),
            stopped,
        }))
    }
}

pub struct InMemoryLink {
    self_rank: usize,
    recv_timeout: Duration,
    outbound: Vec<mpsc::UnboundedSender<Bytes>>,
    inbound: Vec<Mutex<mpsc::UnboundedReceiver<Bytes>>>,
    stopped: watch::Sender<bool>,
}

#[async_trait]
impl Link for InMemoryLink {
    fn self_rank(&self) -> usize {
        self.self_rank
    }

    async fn send_async(&self, to_rank: usize, msg: Bytes) -> anyhow::Result<()> {
        if *self.stopped.borrow() {
            bail!("link is stopped");
        }
        if to_rank == self.self_rank {
            bail!("cannot send to own rank {}", to_rank);
        }
        self.outbound.get(to_rank)
            .ok_or_else(|| anyhow!("rank {} is outside the topology", to_rank))?
            .send(msg)
            .map_err(|_| anyhow!("queue to rank {} is closed", to_rank))
    }

    async fn recv(&self, from_rank: usize) -> Result<Bytes, LinkError> {
        if from_rank == self.self_rank {
            return Err(anyhow!("cannot receive from own rank {}", from_rank).into());
        }
        let queue = self.inbound.get(from_rank)
            .ok_or_else(|| anyhow!("rank {} is outside the topology", from_rank))?;

        let mut stopped = self.stopped.subscribe();
        let mut queue = queue.lock().await;
        select! {
            received = time::timeout(self.recv_timeout, queue.recv()) => match received {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => Err(LinkError::Closed(from_rank)),
                Err(_) => Err(LinkError::Timeout(self.recv_timeout)),
            },
            _ = stopped.wait_for(|s| *s) => Err(LinkError::Closed(from_rank)),
        }
    }

    fn stop(&self) {
        self.stopped.send_replace(true);
    }
}
