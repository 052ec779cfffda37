use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context};
use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch, Mutex};
use tokio::task::JoinSet;
use tokio::{select, time};
use tracing::{debug, error, info, instrument, trace, warn};
use uuid::Uuid;

use crate::config::{ChannelConnectionType, ChannelProtocol, LinkOptions};
use crate::link::control_messages::{InitMsg, InitResponseMsg};
use crate::link::frame::{read_frame, write_frame, PeerStream};
use crate::link::tls::{server_name_for, LinkTls};
use crate::link::{Link, LinkDesc, LinkError, LinkFactory, Party};

const MAX_CONTROL_MSG_LEN: usize = 64;

pub struct TcpLinkFactory;

#[async_trait]
impl LinkFactory for TcpLinkFactory {
    async fn create(&self, desc: &LinkDesc, self_rank: usize) -> anyhow::Result<Arc<dyn Link>> {
        let link = TcpLink::create(desc, self_rank).await?;
        Ok(Arc::new(link))
    }
}

struct LinkShared {
    self_rank: usize,
    parties: Vec<Party>,
    options: LinkOptions,
    tls: Option<LinkTls>,
}

impl LinkShared {
    fn world_size(&self) -> usize {
        self.parties.len()
    }
}

/// A [Link] over TCP (optionally wrapped in TLS).
///
/// Every party listens on its own address. Outbound traffic uses connections initiated by the
///  sender, so each connection carries data in one direction only. Each connection starts with a
///  handshake ([InitMsg] / [InitResponseMsg]) establishing the sender's rank, followed by
///  length-prefixed frames.
///
/// Creating a link binds the listening socket and then connects to every peer (retrying as
///  configured), so a successfully created link has a complete mesh.
pub struct TcpLink {
    shared: Arc<LinkShared>,
    outbound: Vec<Option<mpsc::Sender<Bytes>>>,
    inbound: Vec<Option<Mutex<mpsc::UnboundedReceiver<Bytes>>>>,
    shutdown: watch::Sender<bool>,
}

impl TcpLink {
    pub async fn create(desc: &LinkDesc, self_rank: usize) -> anyhow::Result<TcpLink> {
        let self_party = desc.parties.get(self_rank)
            .ok_or_else(|| anyhow!("rank {} is outside the topology of {} parties", self_rank, desc.world_size()))?;

        let tls = match &desc.tls {
            Some(tls_config) => Some(LinkTls::load(tls_config)?),
            None => {
                warn!("initializing without TLS - this is for debugging purposes and not recommended for production use");
                None
            }
        };

        let shared = Arc::new(LinkShared {
            self_rank,
            parties: desc.parties.clone(),
            options: desc.options.clone(),
            tls,
        });

        let listener = TcpListener::bind(&self_party.address).await
            .with_context(|| format!("binding to {}", self_party.address))?;
        let local_addr = listener.local_addr()?;
        info!("party {} (rank {}) listening on {:?}", self_party.id, self_rank, local_addr);

        let (shutdown, _) = watch::channel(false);

        let mut inbound_senders = Vec::with_capacity(shared.world_size());
        let mut inbound = Vec::with_capacity(shared.world_size());
        for rank in 0..shared.world_size() {
            if rank == self_rank {
                inbound_senders.push(None);
                inbound.push(None);
            }
            else {
                let (sender, receiver) = mpsc::unbounded_channel();
                inbound_senders.push(Some(sender));
                inbound.push(Some(Mutex::new(receiver)));
            }
        }
        tokio::spawn(accept_loop(listener, shared.clone(), Arc::new(inbound_senders), shutdown.subscribe()));

        let mut connections = match connect_to_mesh(&shared).await {
            Ok(connections) => connections,
            Err(e) => {
                shutdown.send_replace(true);
                return Err(e);
            }
        };

        let mut outbound = Vec::with_capacity(shared.world_size());
        for rank in 0..shared.world_size() {
            if rank == self_rank {
                outbound.push(None);
                continue;
            }

            let connection = match shared.options.channel_connection_type {
                ChannelConnectionType::Single => connections[rank].take(),
                ChannelConnectionType::Short => {
                    if let Some(mut handshake_only) = connections[rank].take() {
                        handshake_only.shutdown().await.ok();
                    }
                    None
                }
            };

            let (sender, receiver) = mpsc::channel(shared.options.throttle_window_size);
            tokio::spawn(send_loop(shared.clone(), rank, connection, receiver, shutdown.subscribe()));
            outbound.push(Some(sender));
        }

        info!("party {} connected to all {} peers", self_party.id, shared.world_size() - 1);

        Ok(TcpLink {
            shared,
            outbound,
            inbound,
            shutdown,
        })
    }

    fn is_stopped(&self) -> bool {
        *self.shutdown.borrow()
    }
}

impl Drop for TcpLink {
    fn drop(&mut self) {
        self.shutdown.send_replace(true);
    }
}

#[async_trait]
impl Link for TcpLink {
    fn self_rank(&self) -> usize {
        self.shared.self_rank
    }

    async fn send_async(&self, to_rank: usize, msg: Bytes) -> anyhow::Result<()> {
        if self.is_stopped() {
            bail!("link is stopped");
        }

        let queue = self.outbound.get(to_rank)
            .and_then(|q| q.as_ref())
            .ok_or_else(|| anyhow!("rank {} is not a peer of rank {}", to_rank, self.shared.self_rank))?;

        let max_len = self.shared.options.http_max_payload_size;
        if msg.len() > max_len {
            bail!("message of {} bytes to rank {} exceeds the configured maximum of {} bytes", msg.len(), to_rank, max_len);
        }

        trace!("queueing {} bytes for rank {}", msg.len(), to_rank);
        queue.send(msg).await
            .map_err(|_| anyhow!("outbound queue for rank {} is closed", to_rank))
    }

    async fn recv(&self, from_rank: usize) -> Result<Bytes, LinkError> {
        let queue = self.inbound.get(from_rank)
            .and_then(|q| q.as_ref())
            .ok_or_else(|| anyhow!("rank {} is not a peer of rank {}", from_rank, self.shared.self_rank))?;

        let mut shutdown = self.shutdown.subscribe();
        let timeout = self.shared.options.recv_timeout;
        let mut queue = queue.lock().await;

        select! {
            received = time::timeout(timeout, queue.recv()) => match received {
                Ok(Some(msg)) => Ok(msg),
                Ok(None) => Err(LinkError::Closed(from_rank)),
                Err(_) => Err(LinkError::Timeout(timeout)),
            },
            _ = shutdown.wait_for(|stopped| *stopped) => Err(LinkError::Closed(from_rank)),
        }
    }

    fn stop(&self) {
        let was_stopped = self.shutdown.send_replace(true);
        if !was_stopped {
            info!("stopping link for rank {}", self.shared.self_rank);
        }
    }
}

async fn connect_to_mesh(shared: &Arc<LinkShared>) -> anyhow::Result<Vec<Option<Box<dyn PeerStream>>>> {
    let mut join_set = JoinSet::new();
    for rank in 0..shared.world_size() {
        if rank == shared.self_rank {
            continue;
        }
        let shared = shared.clone();
        join_set.spawn(async move {
            let connection = connect_with_retry(&shared, rank).await;
            (rank, connection)
        });
    }

    let mut connections: Vec<Option<Box<dyn PeerStream>>> = (0..shared.world_size()).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
        let (rank, connection) = joined?;
        connections[rank] = Some(connection?);
    }
    Ok(connections)
}

async fn connect_with_retry(shared: &LinkShared, peer_rank: usize) -> anyhow::Result<Box<dyn PeerStream>> {
    let peer = &shared.parties[peer_rank];
    let mut attempt = 0;
    loop {
        let e = match time::timeout(shared.options.http_timeout, connect(shared, peer_rank)).await {
            Ok(Ok(stream)) => {
                debug!("connected to party {} at {}", peer.id, peer.address);
                return Ok(stream);
            }
            Ok(Err(e)) => e,
            Err(_) => anyhow!("timed out after {:?}", shared.options.http_timeout),
        };

        if attempt >= shared.options.connect_retry_times {
            return Err(e.context(format!("connecting to party {} at {} failed after {} attempt(s)", peer.id, peer.address, attempt + 1)));
        }
        attempt += 1;
        debug!("connecting to party {} at {} failed, retrying ({}/{}): {:#}", peer.id, peer.address, attempt, shared.options.connect_retry_times, e);
        time::sleep(shared.options.connect_retry_interval).await;
    }
}

async fn connect(shared: &LinkShared, peer_rank: usize) -> anyhow::Result<Box<dyn PeerStream>> {
    let peer = &shared.parties[peer_rank];
    let tcp = TcpStream::connect(&peer.address).await?;
    tcp.set_nodelay(true)?;

    let mut stream: Box<dyn PeerStream> = match &shared.tls {
        Some(tls) => Box::new(tls.connector.connect(server_name_for(&peer.address)?, tcp).await?),
        None => Box::new(tcp),
    };

    let init = InitMsg {
        sender_rank: shared.self_rank as u32,
        world_size: shared.world_size() as u32,
        channel_protocol: shared.options.channel_protocol,
    };
    write_frame(&mut stream, ChannelProtocol::Frame, MAX_CONTROL_MSG_LEN, &init.to_bytes()).await?;

    let mut buf = [0u8; InitResponseMsg::SERIALIZED_LEN];
    stream.read_exact(&mut buf).await?;
    let response = InitResponseMsg::deser(&mut buf.as_ref())?;
    if response.receiver_rank as usize != peer_rank {
        bail!("expected party {} at {} to have rank {}, but it reported rank {}", peer.id, peer.address, peer_rank, response.receiver_rank);
    }

    Ok(stream)
}

async fn send_loop(
    shared: Arc<LinkShared>,
    peer_rank: usize,
    mut connection: Option<Box<dyn PeerStream>>,
    mut queue: mpsc::Receiver<Bytes>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let msg = select! {
            msg = queue.recv() => match msg {
                Some(msg) => msg,
                None => break,
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };

        if let Err(e) = send_one(&shared, peer_rank, &mut connection, &msg).await {
            error!("dropping message of {} bytes to rank {}: {:#}", msg.len(), peer_rank, e);
        }
    }

    if let Some(mut connection) = connection {
        connection.shutdown().await.ok();
    }
    debug!("send loop for rank {} terminated", peer_rank);
}

async fn send_one(
    shared: &LinkShared,
    peer_rank: usize,
    connection: &mut Option<Box<dyn PeerStream>>,
    msg: &[u8],
) -> anyhow::Result<()> {
    let options = &shared.options;

    // a persistent connection may have been closed by the peer since the previous message, so
    //  a failed write is retried once on a fresh connection
    let mut attempt = 0;
    loop {
        let mut stream = match connection.take() {
            Some(stream) => stream,
            None => connect_with_retry(shared, peer_rank).await?,
        };

        let written = time::timeout(
            options.http_timeout,
            write_frame(&mut stream, options.channel_protocol, options.http_max_payload_size, msg),
        ).await;

        let e = match written {
            Ok(Ok(())) => {
                match options.channel_connection_type {
                    ChannelConnectionType::Single => *connection = Some(stream),
                    ChannelConnectionType::Short => { stream.shutdown().await.ok(); }
                }
                return Ok(());
            }
            Ok(Err(e)) => e,
            Err(_) => anyhow!("write timed out after {:?}", options.http_timeout),
        };

        attempt += 1;
        if attempt > 1 {
            return Err(e);
        }
        warn!("sending to rank {} failed, reconnecting: {:#}", peer_rank, e);
    }
}

async fn accept_loop(
    listener: TcpListener,
    shared: Arc<LinkShared>,
    inbound: Arc<Vec<Option<mpsc::UnboundedSender<Bytes>>>>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let (stream, addr) = select! {
            accepted = listener.accept() => match accepted {
                Ok(accepted) => accepted,
                Err(e) => {
                    error!("error accepting connection: {}", e);
                    continue;
                }
            },
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };

        let shared = shared.clone();
        let inbound = inbound.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = handle_connection(addr, stream, shared, inbound, shutdown).await {
                warn!("connection from {} broke with an error: {:#}", addr, e);
            }
        });
    }
    debug!("accept loop terminated");
}

#[instrument(name = "accepted_connection", skip_all, fields(addr = %addr, correlation_id = %Uuid::new_v4()))]
async fn handle_connection(
    addr: SocketAddr,
    tcp: TcpStream,
    shared: Arc<LinkShared>,
    inbound: Arc<Vec<Option<mpsc::UnboundedSender<Bytes>>>>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()> {
    debug!("received connection request");
    tcp.set_nodelay(true)?;
    let options = &shared.options;

    let mut stream: Box<dyn PeerStream> = match &shared.tls {
        Some(tls) => Box::new(time::timeout(options.http_timeout, tls.acceptor.accept(tcp)).await??),
        None => Box::new(tcp),
    };

    let init_buf = time::timeout(options.http_timeout, read_frame(&mut stream, ChannelProtocol::Frame, MAX_CONTROL_MSG_LEN)).await??
        .ok_or_else(|| anyhow!("connection closed before handshake"))?;
    let peer_rank = InitMsg::deser(&mut init_buf.as_ref())?
        .validate(shared.self_rank, shared.world_size(), options.channel_protocol)?;

    let mut buf = BytesMut::new();
    InitResponseMsg { receiver_rank: shared.self_rank as u32 }.ser(&mut buf);
    stream.write_all(&buf).await?;
    stream.flush().await?;
    debug!("initial handshake complete, peer is rank {}", peer_rank);

    let queue = inbound[peer_rank].as_ref()
        .ok_or_else(|| anyhow!("no inbound queue for rank {}", peer_rank))?;

    loop {
        let frame = select! {
            frame = read_frame(&mut stream, options.channel_protocol, options.http_max_payload_size) => frame?,
            _ = shutdown.wait_for(|stopped| *stopped) => break,
        };

        match frame {
            Some(msg) => {
                trace!("received {} bytes from rank {}", msg.len(), peer_rank);
                if queue.send(msg).is_err() {
                    debug!("inbound queue for rank {} is closed", peer_rank);
                    break;
                }
            }
            None => {
                debug!("connection closed by peer");
                break;
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;
    use rstest::rstest;
    use crate::config::{ProxyConfig, TlsConfig};
    use crate::test_util::pki::{PemDir, TestCa};
    use super::*;

    fn free_local_address() -> String {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().to_string()
    }

    fn desc(num_parties: usize, config: ProxyConfig) -> LinkDesc {
        let parties = (0..num_parties)
            .map(|i| Party::new(format!("party{}", i), free_local_address()))
            .collect();
        let mut options = LinkOptions::default();
        options.connect_retry_interval = Duration::from_millis(20);
        config.apply_to(&mut options).unwrap();
        LinkDesc::new(parties, options, None).unwrap()
    }

    fn with_tls(desc: &LinkDesc, tls: TlsConfig) -> LinkDesc {
        LinkDesc::new(desc.parties.clone(), desc.options.clone(), Some(tls)).unwrap()
    }

    #[rstest]
    #[case::default(ProxyConfig::default())]
    #[case::crc_short(ProxyConfig {
        channel_protocol: Some("frame_crc".to_string()),
        channel_connection_type: Some("short".to_string()),
        ..Default::default()
    })]
    #[tokio::test]
    async fn test_send_and_receive(#[case] config: ProxyConfig) {
        let desc = desc(2, config);

        let (a, b) = tokio::join!(
            TcpLink::create(&desc, 0),
            TcpLink::create(&desc, 1),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        a.send_async(1, Bytes::from_static(b"hello")).await.unwrap();
        a.send_async(1, Bytes::from_static(b"world")).await.unwrap();
        b.send_async(0, Bytes::from_static(b"back")).await.unwrap();

        assert_eq!(b.recv(0).await.unwrap().as_ref(), b"hello");
        assert_eq!(b.recv(0).await.unwrap().as_ref(), b"world");
        assert_eq!(a.recv(1).await.unwrap().as_ref(), b"back");

        a.stop();
        b.stop();
    }

    #[tokio::test]
    async fn test_recv_times_out() {
        let desc = desc(2, ProxyConfig {
            recv_timeout_ms: Some(50),
            ..Default::default()
        });
        let (a, b) = tokio::join!(
            TcpLink::create(&desc, 0),
            TcpLink::create(&desc, 1),
        );
        let (_a, b) = (a.unwrap(), b.unwrap());

        match b.recv(0).await {
            Err(LinkError::Timeout(timeout)) => assert_eq!(timeout, Duration::from_millis(50)),
            other => panic!("expected timeout, was {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_stop_is_idempotent_and_closes_receivers() {
        let desc = desc(2, ProxyConfig::default());
        let (a, b) = tokio::join!(
            TcpLink::create(&desc, 0),
            TcpLink::create(&desc, 1),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        b.stop();
        b.stop();

        assert!(matches!(b.recv(0).await, Err(LinkError::Closed(0))));
        assert!(b.send_async(0, Bytes::from_static(b"x")).await.is_err());
        a.stop();
    }

    #[tokio::test]
    async fn test_invalid_ranks() {
        let desc = desc(2, ProxyConfig::default());
        let (a, b) = tokio::join!(
            TcpLink::create(&desc, 0),
            TcpLink::create(&desc, 1),
        );
        let (a, _b) = (a.unwrap(), b.unwrap());

        assert!(a.send_async(0, Bytes::from_static(b"to myself")).await.is_err());
        assert!(a.send_async(7, Bytes::from_static(b"to nowhere")).await.is_err());
        assert!(matches!(a.recv(0).await, Err(LinkError::Other(_))));
    }

    #[tokio::test]
    async fn test_oversized_message_is_rejected() {
        let desc = desc(2, ProxyConfig {
            http_max_payload_size: Some(4),
            ..Default::default()
        });
        let (a, b) = tokio::join!(
            TcpLink::create(&desc, 0),
            TcpLink::create(&desc, 1),
        );
        let (a, _b) = (a.unwrap(), b.unwrap());

        assert!(a.send_async(1, Bytes::from_static(b"too long")).await.is_err());
    }

    #[tokio::test]
    async fn test_create_fails_if_peer_is_unreachable() {
        let desc = desc(2, ProxyConfig {
            connect_retry_times: Some(1),
            connect_retry_interval_ms: Some(10),
            ..Default::default()
        });

        assert!(TcpLink::create(&desc, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_create_fails_if_address_is_taken() {
        let desc = desc(2, ProxyConfig::default());
        let _occupied = std::net::TcpListener::bind(&desc.parties[0].address).unwrap();

        assert!(TcpLink::create(&desc, 0).await.is_err());
    }

    #[tokio::test]
    async fn test_send_and_receive_over_tls() {
        let ca = TestCa::root("fedproxy test CA");
        let dir = PemDir::new();
        let desc = desc(2, ProxyConfig::default());
        let desc_a = with_tls(&desc, dir.party_tls("party0", &ca, &ca));
        let desc_b = with_tls(&desc, dir.party_tls("party1", &ca, &ca));

        let (a, b) = tokio::join!(
            TcpLink::create(&desc_a, 0),
            TcpLink::create(&desc_b, 1),
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        a.send_async(1, Bytes::from_static(b"hello")).await.unwrap();
        b.send_async(0, Bytes::from_static(b"back")).await.unwrap();
        a.send_async(1, Bytes::from_static(b"again")).await.unwrap();

        assert_eq!(b.recv(0).await.unwrap().as_ref(), b"hello");
        assert_eq!(a.recv(1).await.unwrap().as_ref(), b"back");
        assert_eq!(b.recv(0).await.unwrap().as_ref(), b"again");

        a.stop();
        b.stop();
    }

    /// party0's certificate is unacceptable to party1, which makes the mesh fail in both
    ///  directions: party1 rejects it as a server certificate, and as a client certificate
    #[rstest]
    #[case::issued_by_intermediate(true)]
    #[case::issued_by_foreign_ca(false)]
    #[tokio::test]
    async fn test_create_fails_for_untrusted_certificate(#[case] via_intermediate: bool) {
        let ca = TestCa::root("fedproxy test CA");
        let foreign_ca = TestCa::root("some other CA");
        let intermediate = ca.intermediate("fedproxy intermediate CA");
        let dir = PemDir::new();

        let desc = desc(2, ProxyConfig {
            connect_retry_times: Some(1),
            connect_retry_interval_ms: Some(10),
            http_timeout_ms: Some(2000),
            ..Default::default()
        });
        let issuer = if via_intermediate { &intermediate } else { &foreign_ca };
        let desc_a = with_tls(&desc, dir.party_tls("party0", issuer, &ca));
        let desc_b = with_tls(&desc, dir.party_tls("party1", &ca, &ca));

        let (a, b) = tokio::join!(
            TcpLink::create(&desc_a, 0),
            TcpLink::create(&desc_b, 1),
        );
        assert!(a.is_err());
        assert!(b.is_err());
    }
}
