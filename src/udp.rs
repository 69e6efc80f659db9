use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;

use crate::shutdown::ShutdownManager;

/// Size of the buffer used to hold a received datagram. The largest
/// TFTP datagram is 516 bytes; anything longer is truncated here and
/// rejected downstream by the codec.
pub const MAX_DATAGRAM: usize = 1024;

/// A framed datagram tagged with the peer it came from or goes to.
#[derive(Debug, Clone, PartialEq)]
pub struct Datagram {
    pub peer: SocketAddr,
    pub data: Vec<u8>,
}

impl Datagram {
    pub fn new(peer: SocketAddr, data: Vec<u8>) -> Datagram {
        Datagram { peer, data }
    }
}

/// Spawns a task that reads datagrams off `socket` into a bounded
/// channel until shutdown, a receive error (treated as the socket
/// closing), or the receiver being dropped.
///
/// The extra `Sender` handle lets the caller inject a datagram into
/// the same stream the socket feeds.
pub fn spawn_listener(
    socket: Arc<UdpSocket>,
    mut shutdown: ShutdownManager,
    capacity: usize,
) -> (mpsc::Sender<Datagram>, mpsc::Receiver<Datagram>) {
    let (tx, rx) = mpsc::channel(capacity);
    let task_tx = tx.clone();
    tokio::spawn(async move {
        let mut buf = [0u8; MAX_DATAGRAM];
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                _ = task_tx.closed() => return,
                received = socket.recv_from(&mut buf) => match received {
                    Ok((n, peer)) => {
                        log::debug!("got {n} byte datagram from {peer}");
                        if task_tx.send(Datagram::new(peer, buf[..n].to_vec())).await.is_err() {
                            return;
                        }
                    }
                    Err(e) => {
                        // closed or unusable socket, exit
                        log::debug!("error reading from UDP socket: {e}");
                        return;
                    }
                },
            }
        }
    });
    (tx, rx)
}

/// Spawns a task that drains a bounded channel of datagrams onto
/// `socket` until shutdown or all senders are dropped.
pub fn spawn_responder(
    socket: Arc<UdpSocket>,
    mut shutdown: ShutdownManager,
    capacity: usize,
) -> mpsc::Sender<Datagram> {
    let (tx, mut rx) = mpsc::channel::<Datagram>(capacity);
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = shutdown.recv() => return,
                queued = rx.recv() => match queued {
                    Some(datagram) => {
                        if let Err(e) = socket.send_to(&datagram.data, datagram.peer).await {
                            log::warn!("could not send datagram to {}: {e}", datagram.peer);
                        }
                    }
                    None => return,
                },
            }
        }
    });
    tx
}
