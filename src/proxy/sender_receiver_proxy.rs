use std::fmt::Display;
use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{LinkOptions, ProxyConfig, TlsConfig};
use crate::envelope::{Envelope, Payload, StepPair};
use crate::error::{ProxyError, ProxyResult, RemoteError};
use crate::link::tls::LinkTls;
use crate::link::{Link, LinkDesc, LinkError, LinkFactory, Party};
use crate::proxy::mailbox::{Mailbox, MailboxError};
use crate::proxy::readiness::{ProxyReadiness, Readiness};

/// the cause sent to peers in place of a local failure's message if `expose_error_trace` is off
pub const REDACTED_CAUSE: &str = "an error occurred on the remote party (details are not exposed)";

enum ProxyState {
    Constructed,
    Starting,
    Running(Arc<dyn Link>),
    Failed,
    Stopped,
}

/// Sends payloads tagged with a (producer step, consumer step) pair to peers, and hands out
///  received payloads by their exact pair, regardless of the order in which they arrived.
///
/// Lifecycle: `Constructed -> Starting -> (Ready | Failed) -> Stopped`. Starting happens in the
///  background (see [SenderReceiverProxy::spawn_start]), and its outcome is observed through
///  [SenderReceiverProxy::is_ready] rather than returned to the caller.
///
/// Receiving is done by one pump task per peer which is the only reader of that peer's inbound
///  link queue. It decodes envelopes and delivers them to the peer's [Mailbox], where
///  [SenderReceiverProxy::get_data] callers pick them up.
pub struct SenderReceiverProxy {
    self_party: String,
    self_rank: usize,
    desc: LinkDesc,
    expose_error_trace: bool,
    link_factory: Arc<dyn LinkFactory>,
    readiness: Readiness,
    state: RwLock<ProxyState>,
    /// indexed by rank, `None` for our own rank
    mailboxes: Vec<Option<Arc<Mailbox>>>,
}

impl SenderReceiverProxy {
    /// Validates the topology, config and TLS material. Nothing is bound or connected before
    ///  [SenderReceiverProxy::start].
    pub fn new(
        parties: Vec<Party>,
        self_party: &str,
        tls: Option<TlsConfig>,
        config: &ProxyConfig,
        link_factory: Arc<dyn LinkFactory>,
    ) -> ProxyResult<SenderReceiverProxy> {
        let mut options = LinkOptions::default();
        config.apply_to(&mut options)
            .map_err(|e| ProxyError::Construction(format!("{:#}", e)))?;

        if let Some(tls) = &tls {
            LinkTls::load(tls)
                .map_err(|e| ProxyError::Construction(format!("invalid TLS material: {:#}", e)))?;
        }

        let desc = LinkDesc::new(parties, options, tls)
            .map_err(|e| ProxyError::Construction(format!("{:#}", e)))?;
        let self_rank = desc.rank_of(self_party)
            .ok_or_else(|| ProxyError::Construction(format!("own party {:?} is not part of the topology", self_party)))?;

        let mailboxes = desc.parties.iter()
            .enumerate()
            .map(|(rank, party)| (rank != self_rank).then(|| Arc::new(Mailbox::new(party.id.clone()))))
            .collect();

        debug!("created proxy for party {} (rank {} of {})", self_party, self_rank, desc.world_size());

        Ok(SenderReceiverProxy {
            self_party: self_party.to_string(),
            self_rank,
            desc,
            expose_error_trace: config.expose_error_trace(),
            link_factory,
            readiness: Readiness::new(),
            state: RwLock::new(ProxyState::Constructed),
            mailboxes,
        })
    }

    pub fn self_party(&self) -> &str {
        &self.self_party
    }

    pub fn parties(&self) -> &[Party] {
        &self.desc.parties
    }

    /// Creates and starts the link, recording the outcome as readiness. This never fails: a
    ///  startup failure is captured and reported through [SenderReceiverProxy::is_ready]. Starting
    ///  is possible only once, and later calls have no effect.
    pub async fn start(&self) {
        {
            let mut state = self.state.write().await;
            if !matches!(*state, ProxyState::Constructed) {
                warn!("proxy for party {} was started before - ignoring", self.self_party);
                return;
            }
            *state = ProxyState::Starting;
        }

        let created = self.link_factory.create(&self.desc, self.self_rank).await;

        let mut state = self.state.write().await;
        match created {
            Ok(link) => {
                if matches!(*state, ProxyState::Stopped) {
                    link.stop();
                    self.fail_start("proxy was stopped while starting".to_string()).await;
                    return;
                }

                for (rank, mailbox) in self.mailboxes.iter().enumerate() {
                    if let Some(mailbox) = mailbox {
                        tokio::spawn(pump(link.clone(), rank, self.desc.parties[rank].id.clone(), mailbox.clone()));
                    }
                }
                *state = ProxyState::Running(link);

                let msg = format!("Succeeded to listen on {}.", self.desc.parties[self.self_rank].address);
                info!("{}", msg);
                self.readiness.set(ProxyReadiness::Ready(msg));
            }
            Err(e) => {
                if !matches!(*state, ProxyState::Stopped) {
                    *state = ProxyState::Failed;
                }
                self.fail_start(format!("{:#}", e)).await;
            }
        }
    }

    async fn fail_start(&self, reason: String) {
        error!("failed to start proxy for party {}: {}", self.self_party, reason);
        for mailbox in self.mailboxes.iter().flatten() {
            mailbox.fail(format!("proxy failed to start: {}", reason)).await;
        }
        self.readiness.set(ProxyReadiness::Failed(reason));
    }

    /// Runs [SenderReceiverProxy::start] in the background
    pub fn spawn_start(self: &Arc<Self>) -> JoinHandle<()> {
        let proxy = self.clone();
        tokio::spawn(async move { proxy.start().await })
    }

    /// Waits until starting finished, returning whether it succeeded and the corresponding
    ///  message. Every caller observes the same outcome.
    pub async fn is_ready(&self) -> (bool, String) {
        match self.readiness.wait().await {
            ProxyReadiness::Ready(msg) => (true, msg),
            ProxyReadiness::Failed(reason) => (false, reason),
            ProxyReadiness::Pending => (false, "proxy is not started".to_string()),
        }
    }

    fn rank_of(&self, party: &str) -> ProxyResult<usize> {
        self.desc.rank_of(party)
            .ok_or_else(|| ProxyError::UnknownParty(party.to_string()))
    }

    async fn running_link(&self) -> ProxyResult<Arc<dyn Link>> {
        match &*self.state.read().await {
            ProxyState::Running(link) => Ok(link.clone()),
            ProxyState::Constructed => Err(ProxyError::NotReady("proxy was not started".to_string())),
            ProxyState::Starting => Err(ProxyError::NotReady("proxy is still starting".to_string())),
            ProxyState::Failed => Err(ProxyError::NotReady("proxy failed to start".to_string())),
            ProxyState::Stopped => Err(ProxyError::NotReady("proxy is stopped".to_string())),
        }
    }

    /// Hands a payload to the link for delivery to `dest_party`. This returns once the payload is
    ///  queued, it does not wait for (or confirm) delivery.
    pub async fn send(
        &self,
        dest_party: &str,
        payload: Payload,
        upstream_seq_id: impl ToString,
        downstream_seq_id: impl ToString,
    ) -> ProxyResult<bool> {
        let rank = self.rank_of(dest_party)?;
        let link = self.running_link().await?;

        let envelope = Envelope::new(StepPair::new(upstream_seq_id, downstream_seq_id), payload);
        debug!("Sending {:?} to {}{}", envelope.pair, dest_party, if envelope.payload.is_error() { " (error)" } else { "" });

        link.send_async(rank, envelope.ser()).await?;
        Ok(true)
    }

    /// Sends a local failure to a peer in place of the data it expects. The peer's matching
    ///  [SenderReceiverProxy::get_data] call fails with [ProxyError::Remote], attributed to this
    ///  party.
    pub async fn send_error(
        &self,
        dest_party: &str,
        cause: impl Display,
        upstream_seq_id: impl ToString,
        downstream_seq_id: impl ToString,
    ) -> ProxyResult<bool> {
        let cause = if self.expose_error_trace {
            cause.to_string()
        }
        else {
            debug!("redacting error sent to {}: {}", dest_party, cause);
            REDACTED_CAUSE.to_string()
        };

        let payload = Payload::Error(RemoteError::new(self.self_party.clone(), cause));
        self.send(dest_party, payload, upstream_seq_id, downstream_seq_id).await
    }

    /// Returns the data `src_party` sent for exactly this pair of step ids, waiting for it up to
    ///  the configured receive timeout. Each received payload is returned once.
    ///
    /// If the peer sent an error instead of data, it is returned as [ProxyError::Remote].
    pub async fn get_data(
        &self,
        src_party: &str,
        upstream_seq_id: impl ToString,
        downstream_seq_id: impl ToString,
    ) -> ProxyResult<Bytes> {
        let rank = self.rank_of(src_party)?;
        let mailbox = self.mailboxes[rank].as_ref()
            .ok_or_else(|| ProxyError::Transport(anyhow!("party {} cannot receive data from itself", src_party)))?;

        if matches!(*self.state.read().await, ProxyState::Constructed) {
            return Err(ProxyError::NotReady("proxy was not started".to_string()));
        }

        let pair = StepPair::new(upstream_seq_id, downstream_seq_id);
        debug!("Getting data for {} from {} of {}", pair.downstream_seq_id, pair.upstream_seq_id, src_party);

        let timeout = self.desc.options.recv_timeout;
        match mailbox.take(&pair, timeout).await {
            Ok(Payload::Data(data)) => Ok(data),
            Ok(Payload::Error(e)) => {
                warn!("Receiving exception from {} for {} of {}: {}. Re-raising it.", src_party, pair.downstream_seq_id, pair.upstream_seq_id, e);
                Err(ProxyError::Remote(e))
            }
            Err(MailboxError::Timeout) => Err(ProxyError::Timeout {
                party: src_party.to_string(),
                upstream_seq_id: pair.upstream_seq_id,
                downstream_seq_id: pair.downstream_seq_id,
                timeout,
            }),
            Err(MailboxError::Failed(reason)) => Err(ProxyError::Transport(anyhow!(reason))),
        }
    }

    /// The number of messages from `src_party` that were dropped because they could not be decoded
    pub fn num_undecodable(&self, src_party: &str) -> ProxyResult<u64> {
        let rank = self.rank_of(src_party)?;
        Ok(self.mailboxes[rank].as_ref()
            .map(|mailbox| mailbox.num_undecodable())
            .unwrap_or(0))
    }

    /// Stops the link. Payloads that were received already can still be retrieved. Calling
    ///  this more than once has no additional effect.
    pub async fn stop(&self) {
        let mut state = self.state.write().await;
        match &*state {
            ProxyState::Running(link) => {
                info!("stopping proxy for party {}", self.self_party);
                link.stop();
            }
            ProxyState::Starting => debug!("stopping proxy for party {} while it is starting", self.self_party),
            ProxyState::Constructed | ProxyState::Failed => {
                // a proxy that was never running stays startable
                debug!("proxy for party {} was never running - nothing to stop", self.self_party);
                return;
            }
            ProxyState::Stopped => return,
        }
        *state = ProxyState::Stopped;
    }
}

impl Drop for SenderReceiverProxy {
    fn drop(&mut self) {
        if let ProxyState::Running(link) = self.state.get_mut() {
            link.stop();
        }
    }
}

async fn pump(link: Arc<dyn Link>, rank: usize, peer: String, mailbox: Arc<Mailbox>) {
    debug!("receiving from {} (rank {})", peer, rank);
    loop {
        match link.recv(rank).await {
            Ok(buf) => match Envelope::try_deser(buf) {
                Ok(envelope) => mailbox.deliver(envelope).await,
                Err(e) => {
                    let num_dropped = mailbox.record_undecodable();
                    error!("dropping undecodable message from {} ({} so far): {:#}", peer, num_dropped, e);
                }
            },
            Err(LinkError::Timeout(_)) => {}
            Err(LinkError::Closed(_)) => {
                mailbox.fail(format!("link to {} is closed", peer)).await;
                break;
            }
            Err(LinkError::Other(e)) => {
                mailbox.fail(format!("receiving from {} failed: {:#}", peer, e)).await;
                break;
            }
        }
    }
    debug!("stopped receiving from {}", peer);
}
