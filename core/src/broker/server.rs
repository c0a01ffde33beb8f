use futures::SinkExt;
use parking_lot::RwLock;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio_util::codec::Framed;
use tracing::{debug, error, info};

use super::handler;
use crate::config::BrokerConfig;
use crate::protocol::{owner_index, ConnectionInfo, Frame, FrameCodec};
use crate::storage::TopicStore;
use crate::topic_manager::BrokerTopicManager;
use crate::Result;

/// The ordered list of peer brokers known to this node, by their
/// client-facing endpoints.
///
/// The list is append-only: a peer whose connection drops keeps its slot, so
/// the ownership function stays stable for the lifetime of the cluster.
/// Re-registering a restarted peer appends a duplicate entry; failure
/// detection is out of scope.
#[derive(Default)]
pub(crate) struct PeerSet {
    client_cis: RwLock<Vec<ConnectionInfo>>,
}

impl PeerSet {
    pub(crate) fn add(&self, ci: ConnectionInfo) {
        self.client_cis.write().push(ci);
    }

    /// The client endpoint of the broker that owns `topic_name`, where
    /// `self_ci` is the endpoint of the broker asking.
    pub(crate) fn owner_of(&self, topic_name: &str, self_ci: &ConnectionInfo) -> ConnectionInfo {
        let cis = self.client_cis.read();
        let index = owner_index(topic_name, cis.len());
        // the slot one past the peer list means "the broker asking owns it"
        cis.get(index).cloned().unwrap_or_else(|| self_ci.clone())
    }
}

/// Shared state every connection handler works against.
pub(crate) struct BrokerContext {
    pub(crate) manager: Arc<BrokerTopicManager>,
    pub(crate) peers: Arc<PeerSet>,
    pub(crate) advertised: ConnectionInfo,
    pub(crate) shutdown_tx: broadcast::Sender<()>,
}

/// Fires the broker's shutdown signal. Cloneable and usable from signal
/// handlers, tests and the persistence workers alike.
#[derive(Clone)]
pub struct ShutdownHandle {
    tx: broadcast::Sender<()>,
}

impl ShutdownHandle {
    pub fn shutdown(&self) {
        let _ = self.tx.send(());
    }
}

/// One broker node of the delivery fabric.
pub struct Broker {
    ctx: Arc<BrokerContext>,
    client_listener: TcpListener,
    peer_listener: TcpListener,
    leader_link: Option<Framed<TcpStream, FrameCodec>>,
}

impl Broker {
    /// Builds a broker: reloads its topics from the store, binds both
    /// listeners and, for a follower, registers with the leader.
    ///
    /// A leader starts with an empty peer list. A follower dials the
    /// leader's peer port once and announces its own client endpoint; there
    /// is no reconnect if that link later drops.
    pub async fn new(config: BrokerConfig, store: Box<dyn TopicStore>) -> Result<Self> {
        let manager = Arc::new(BrokerTopicManager::new(store)?);

        let client_listener =
            TcpListener::bind((config.host.as_str(), config.client_port)).await?;
        let peer_listener = TcpListener::bind((config.host.as_str(), config.peer_port)).await?;

        let advertised = ConnectionInfo::new(
            config.advertised_host.clone(),
            client_listener.local_addr()?.port(),
        );

        let (shutdown_tx, _) = broadcast::channel(16);
        let ctx = Arc::new(BrokerContext {
            manager,
            peers: Arc::new(PeerSet::default()),
            advertised,
            shutdown_tx,
        });

        for topic in ctx.manager.topics() {
            handler::spawn_persistence_worker(topic, Arc::clone(&ctx));
        }

        let leader_link = match &config.leader {
            Some(leader) => {
                let stream = TcpStream::connect((leader.host.as_str(), leader.port)).await?;
                let mut framed = Framed::new(stream, FrameCodec::new());
                framed
                    .send(Frame::ConnectionInfo(ctx.advertised.clone()))
                    .await?;
                info!(leader = %leader, "joined cluster as follower");
                Some(framed)
            }
            None => {
                info!("starting as cluster leader");
                None
            }
        };

        info!(
            client = %client_listener.local_addr()?,
            peer = %peer_listener.local_addr()?,
            "broker listening"
        );

        Ok(Self {
            ctx,
            client_listener,
            peer_listener,
            leader_link,
        })
    }

    /// Address of the client listener. With port 0 in the config this is
    /// where the ephemeral port shows up.
    pub fn client_addr(&self) -> Result<SocketAddr> {
        Ok(self.client_listener.local_addr()?)
    }

    /// Address of the peer listener followers should dial.
    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(self.peer_listener.local_addr()?)
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            tx: self.ctx.shutdown_tx.clone(),
        }
    }

    /// Serves requests until the shutdown signal fires, then disconnects
    /// every consumer and returns.
    pub async fn run(self) -> Result<()> {
        let Self {
            ctx,
            client_listener,
            peer_listener,
            leader_link,
        } = self;

        let client_loop = tokio::spawn(accept_loop(
            client_listener,
            Arc::clone(&ctx),
            handler::handle_client,
        ));
        let peer_loop = tokio::spawn(accept_loop(
            peer_listener,
            Arc::clone(&ctx),
            handler::handle_peer,
        ));

        // a follower parks its leader link here so the TCP connection stays
        // up for the lifetime of the broker
        if let Some(mut framed) = leader_link {
            let mut shutdown = ctx.shutdown_tx.subscribe();
            tokio::spawn(async move {
                tokio::select! {
                    _ = shutdown.recv() => {}
                    _ = futures::StreamExt::next(&mut framed) => {
                        debug!("connection to leader closed");
                    }
                }
            });
        }

        let mut shutdown = ctx.shutdown_tx.subscribe();
        let _ = shutdown.recv().await;

        info!("broker shutting down");
        ctx.manager.close();
        let _ = client_loop.await;
        let _ = peer_loop.await;
        Ok(())
    }
}

/// Accepts connections and hands each to `handle` on its own task, until
/// shutdown. An accept error is fatal for the broker, as a wedged listener
/// serves nobody.
async fn accept_loop<F, Fut>(listener: TcpListener, ctx: Arc<BrokerContext>, handle: F)
where
    F: Fn(TcpStream, Arc<BrokerContext>) -> Fut,
    Fut: std::future::Future<Output = ()> + Send + 'static,
{
    let mut shutdown = ctx.shutdown_tx.subscribe();
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((socket, addr)) => {
                    debug!(%addr, "accepted connection");
                    tokio::spawn(handle(socket, Arc::clone(&ctx)));
                }
                Err(e) => {
                    error!(error = %e, "accept failed; shutting broker down");
                    let _ = ctx.shutdown_tx.send(());
                    break;
                }
            },
            _ = shutdown.recv() => break,
        }
    }
}
