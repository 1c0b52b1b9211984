//! A star-shaped collective over TCP: rank 0 is the hub every other rank connects to.

use std::{
    borrow::Cow,
    io,
    net::SocketAddr,
    num::NonZeroUsize,
    time::Duration,
};

use comms::{
    FrameReceiver, FrameSender,
    msg::{Command, Msg, Payload},
};
use futures::future;
use log::{debug, info, warn};
use parking_lot::Mutex;
use tokio::{
    net::{
        TcpListener, TcpStream,
        tcp::{OwnedReadHalf, OwnedWriteHalf},
    },
    runtime::{Builder, Runtime},
};

use super::{Collective, check_root};
use crate::{Result, StateErr, framework::Tensor};

type NetRx = FrameReceiver<OwnedReadHalf>;
type NetTx = FrameSender<OwnedWriteHalf>;

const HUB_RANK: usize = 0;
const DEFAULT_CONNECT_ATTEMPTS: usize = 20;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_millis(500);

/// Where and as whom a process joins a TCP group.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    rank: usize,
    size: NonZeroUsize,
    hub_addr: SocketAddr,
    connect_attempts: NonZeroUsize,
    retry_delay: Duration,
}

impl GroupConfig {
    /// Creates a new group configuration with default connection retries.
    ///
    /// # Args
    /// * `rank` - This process' rank, rank 0 hosts the hub.
    /// * `size` - Number of ranks in the group.
    /// * `hub_addr` - The address rank 0 listens on.
    ///
    /// # Returns
    /// A `GroupConfig` instance.
    pub fn new(rank: usize, size: NonZeroUsize, hub_addr: SocketAddr) -> Self {
        Self {
            rank,
            size,
            hub_addr,
            // SAFETY: The default is a non zero constant.
            connect_attempts: NonZeroUsize::new(DEFAULT_CONNECT_ATTEMPTS).unwrap(),
            retry_delay: DEFAULT_RETRY_DELAY,
        }
    }

    /// Overrides how many times, and how often, a rank tries to reach the hub.
    pub fn with_retries(mut self, attempts: NonZeroUsize, delay: Duration) -> Self {
        self.connect_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    pub fn rank(&self) -> usize {
        self.rank
    }

    pub fn size(&self) -> usize {
        self.size.get()
    }

    pub fn hub_addr(&self) -> SocketAddr {
        self.hub_addr
    }
}

struct Link {
    rank: usize,
    rx: NetRx,
    tx: NetTx,
}

enum Role {
    /// Links to ranks `1..size`, sorted by rank.
    Hub(Vec<Link>),
    Peer(Link),
}

/// A hub that is listening but has not admitted its peers yet.
pub struct PendingHub {
    listener: TcpListener,
    size: NonZeroUsize,
    runtime: Runtime,
}

impl PendingHub {
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Blocks until every rank of the group joined.
    ///
    /// Peers announcing a different group size, an out of range rank or an already
    /// taken rank are answered with an error and dropped.
    pub fn accept(self) -> Result<TcpGroup> {
        let Self {
            listener,
            size,
            runtime,
        } = self;

        let peers = runtime.block_on(admit_peers(&listener, size.get()))?;
        info!(size = size.get(); "group formed");

        Ok(TcpGroup {
            rank: HUB_RANK,
            size: size.get(),
            role: Mutex::new(Role::Hub(peers)),
            runtime,
        })
    }
}

/// One rank's handle into a TCP group.
pub struct TcpGroup {
    rank: usize,
    size: usize,
    // Links are dropped before the runtime driving them.
    role: Mutex<Role>,
    runtime: Runtime,
}

impl TcpGroup {
    /// Starts listening as the hub (rank 0) of a group of `size` ranks.
    pub fn bind(addr: SocketAddr, size: NonZeroUsize) -> Result<PendingHub> {
        let runtime = new_runtime()?;
        let listener = runtime.block_on(TcpListener::bind(addr))?;
        info!("hub listening at {}", listener.local_addr()?);

        Ok(PendingHub {
            listener,
            size,
            runtime,
        })
    }

    /// Joins the group described by `config` as a non-hub rank.
    pub fn join(config: &GroupConfig) -> Result<Self> {
        if config.rank == HUB_RANK || config.rank >= config.size() {
            return Err(StateErr::Collective(format!(
                "rank {} cannot join a group of {} as a peer",
                config.rank,
                config.size()
            )));
        }

        let runtime = new_runtime()?;
        let hub = runtime.block_on(join_hub(config))?;
        info!(rank = config.rank; "joined group at {}", config.hub_addr);

        Ok(Self {
            rank: config.rank,
            size: config.size(),
            role: Mutex::new(Role::Peer(hub)),
            runtime,
        })
    }

    /// Hosts the group when `config` names rank 0, joins it otherwise.
    pub fn connect(config: &GroupConfig) -> Result<Self> {
        if config.rank == HUB_RANK {
            Self::bind(config.hub_addr, config.size)?.accept()
        } else {
            Self::join(config)
        }
    }
}

impl Collective for TcpGroup {
    fn rank(&self) -> usize {
        self.rank
    }

    fn size(&self) -> usize {
        self.size
    }

    fn broadcast(&self, values: &mut [Tensor], root_rank: usize) -> Result<()> {
        check_root(root_rank, self.size)?;
        let mut role = self.role.lock();

        self.runtime.block_on(async {
            match &mut *role {
                Role::Hub(peers) => {
                    if root_rank != HUB_RANK {
                        recv_tensors(&mut peers[root_rank - 1], values).await?;
                    }

                    let values = &*values;
                    let sends = peers
                        .iter_mut()
                        .filter(|link| link.rank != root_rank)
                        .map(|link| send_tensors(link, values));

                    future::try_join_all(sends).await?;
                    Ok::<_, StateErr>(())
                }
                Role::Peer(hub) if self.rank == root_rank => send_tensors(hub, values).await,
                Role::Peer(hub) => recv_tensors(hub, values).await,
            }
        })
    }

    fn broadcast_object(&self, obj: Vec<u8>, root_rank: usize) -> Result<Vec<u8>> {
        check_root(root_rank, self.size)?;
        let mut role = self.role.lock();
        let is_root = self.rank == root_rank;

        self.runtime.block_on(async {
            match &mut *role {
                Role::Hub(peers) => {
                    let bytes = if is_root {
                        obj
                    } else {
                        recv_object(&mut peers[root_rank - 1]).await?
                    };

                    let sends = peers
                        .iter_mut()
                        .filter(|link| link.rank != root_rank)
                        .map(|link| send_object(link, &bytes));

                    future::try_join_all(sends).await?;
                    Ok::<_, StateErr>(bytes)
                }
                Role::Peer(hub) if is_root => {
                    send_object(hub, &obj).await?;
                    Ok(obj)
                }
                Role::Peer(hub) => recv_object(hub).await,
            }
        })
    }
}

fn new_runtime() -> io::Result<Runtime> {
    Builder::new_current_thread().enable_all().build()
}

fn channel(stream: TcpStream) -> io::Result<(NetRx, NetTx)> {
    stream.set_nodelay(true)?;
    let (rx, tx) = stream.into_split();
    Ok(comms::channel(rx, tx))
}

fn link_err(rank: usize) -> impl Fn(io::Error) -> StateErr {
    move |e| StateErr::Collective(format!("link to rank {rank} failed: {e}"))
}

fn unexpected(rank: usize, expected: &str, msg: &Msg<'_>) -> StateErr {
    match msg {
        Msg::Err(detail) => StateErr::Collective(format!("rank {rank} reported: {detail}")),
        other => StateErr::Collective(format!(
            "expected {expected} from rank {rank}, got {}",
            other.kind()
        )),
    }
}

async fn admit_peers(listener: &TcpListener, size: usize) -> Result<Vec<Link>> {
    let mut peers: Vec<Link> = Vec::with_capacity(size - 1);

    while peers.len() < size - 1 {
        let (stream, addr) = listener.accept().await?;
        let (mut rx, mut tx) = channel(stream)?;

        let joined = match rx.recv().await {
            Ok(Msg::Control(Command::Join {
                rank,
                size: their_size,
            })) => Some((rank, their_size)),
            Ok(other) => {
                warn!("expected Join from {addr}, got {}", other.kind());
                None
            }
            Err(e) => {
                warn!("failed to read Join from {addr}: {e}");
                None
            }
        };

        let Some((rank, their_size)) = joined else {
            continue;
        };

        let refusal = if their_size != size {
            Some(format!("group size is {size}, not {their_size}"))
        } else if rank == HUB_RANK || rank >= size {
            Some(format!("rank {rank} is out of range"))
        } else if peers.iter().any(|link| link.rank == rank) {
            Some(format!("rank {rank} already joined"))
        } else {
            None
        };

        if let Some(detail) = refusal {
            warn!(rank = rank; "refusing peer from {addr}: {detail}");
            let _ = tx.send(&Msg::Err(Cow::Owned(detail))).await;
            continue;
        }

        info!(rank = rank; "peer joined from {addr}");
        peers.push(Link { rank, rx, tx });
    }

    peers.sort_by_key(|link| link.rank);

    for link in &mut peers {
        link.tx
            .send(&Msg::Control(Command::Ready))
            .await
            .map_err(link_err(link.rank))?;
    }

    Ok(peers)
}

async fn connect(config: &GroupConfig) -> io::Result<TcpStream> {
    let attempts = config.connect_attempts.get();
    let mut attempt = 1;

    loop {
        match TcpStream::connect(config.hub_addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) if attempt < attempts => {
                warn!(
                    rank = config.rank,
                    attempt = attempt;
                    "failed to reach hub at {}: {e}, retrying", config.hub_addr
                );

                attempt += 1;
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

async fn join_hub(config: &GroupConfig) -> Result<Link> {
    let stream = connect(config).await?;
    let (mut rx, mut tx) = channel(stream)?;

    let join = Msg::Control(Command::Join {
        rank: config.rank,
        size: config.size(),
    });
    tx.send(&join).await.map_err(link_err(HUB_RANK))?;

    match rx.recv().await.map_err(link_err(HUB_RANK))? {
        Msg::Control(Command::Ready) => {}
        other => return Err(unexpected(HUB_RANK, "Ready", &other)),
    }

    Ok(Link {
        rank: HUB_RANK,
        rx,
        tx,
    })
}

async fn send_tensors(link: &mut Link, values: &[Tensor]) -> Result<()> {
    for value in values {
        let flat: Cow<'_, [f32]> = match value.as_slice() {
            Some(slice) => Cow::Borrowed(slice),
            None => Cow::Owned(value.iter().copied().collect()),
        };

        let msg = Msg::Data(Payload::Tensor(&flat));
        link.tx.send(&msg).await.map_err(link_err(link.rank))?;
    }

    debug!(to = link.rank, tensors = values.len(); "sent tensors");
    Ok(())
}

async fn recv_tensors(link: &mut Link, values: &mut [Tensor]) -> Result<()> {
    for value in values.iter_mut() {
        let msg = link.rx.recv().await.map_err(link_err(link.rank))?;

        let data = match msg {
            Msg::Data(Payload::Tensor(data)) => data,
            other => return Err(unexpected(link.rank, "tensor", &other)),
        };

        if data.len() != value.len() {
            return Err(StateErr::LengthMismatch {
                what: "broadcast tensor",
                got: data.len(),
                expected: value.len(),
            });
        }

        match value.as_slice_mut() {
            Some(dst) => dst.copy_from_slice(data),
            None => value
                .iter_mut()
                .zip(data)
                .for_each(|(dst, src)| *dst = *src),
        }
    }

    debug!(from = link.rank, tensors = values.len(); "received tensors");
    Ok(())
}

async fn send_object(link: &mut Link, bytes: &[u8]) -> Result<()> {
    let msg = Msg::Data(Payload::Object(bytes));
    link.tx.send(&msg).await.map_err(link_err(link.rank))
}

async fn recv_object(link: &mut Link) -> Result<Vec<u8>> {
    match link.rx.recv().await.map_err(link_err(link.rank))? {
        Msg::Data(Payload::Object(bytes)) => Ok(bytes.to_vec()),
        other => Err(unexpected(link.rank, "object", &other)),
    }
}
