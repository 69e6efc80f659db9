use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio::time;

use crate::shutdown::ShutdownManager;
use crate::storage::{FileStore, WriteLocks};
use crate::tftp::Packet;
use crate::tid::TidPool;
use crate::transfer::{self, Op, Transfer};
use crate::udp::{self, Datagram};

/// How many times a silent peer gets the last reply again before the
/// transfer is abandoned.
const RETRY_LIMIT: u32 = 5;

/// How long a worker waits for the peer before retransmitting.
const IDLE_TIMEOUT: Duration = Duration::from_secs(3);

// TFTP is lock-step, so worker channels stay tiny.
const WORKER_INBOUND_BUFFER: usize = 2;
const WORKER_OUTBOUND_BUFFER: usize = 1;

/// The TFTP server: a socket on the well-known port plus the state
/// shared by all transfer workers.
pub struct Server {
    socket: Arc<UdpSocket>,
    files: Arc<FileStore>,
    locks: Arc<WriteLocks>,
    tids: Arc<TidPool>,
}

impl Server {
    /// Binds the well-known port. Workers draw their private ports
    /// from the half-open TID range `[tid_min, tid_max)`.
    pub async fn bind(addr: SocketAddr, tid_min: u16, tid_max: u16) -> io::Result<Server> {
        let socket = UdpSocket::bind(addr).await?;
        Ok(Server {
            socket: Arc::new(socket),
            files: Arc::new(FileStore::new()),
            locks: Arc::new(WriteLocks::new()),
            tids: Arc::new(TidPool::new(tid_min, tid_max)),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// The dispatch loop. Every datagram that arrives on the
    /// well-known port starts a new worker; the dispatcher itself
    /// never parses or replies.
    pub async fn serve(self, shutdown: ShutdownManager) {
        let capacity = thread::available_parallelism().map(|n| n.get()).unwrap_or(1);
        let (_inject, mut inbound) =
            udp::spawn_listener(self.socket.clone(), shutdown.clone(), capacity);

        let mut dispatcher_shutdown = shutdown.clone();
        loop {
            tokio::select! {
                _ = dispatcher_shutdown.recv() => return,
                received = inbound.recv() => {
                    let Some(datagram) = received else { return };
                    tokio::spawn(run_worker(
                        self.files.clone(),
                        self.locks.clone(),
                        self.tids.clone(),
                        shutdown.clone(),
                        datagram,
                    ));
                }
            }
        }
    }
}

/// Runs one transfer to completion. The worker claims a TID, opens
/// its own endpoint at that port, replays the initial packet into it,
/// and drives the state machine until the transfer ends one way or
/// another. Whatever happens, the TID and any held write lock are
/// returned on the way out.
async fn run_worker(
    files: Arc<FileStore>,
    locks: Arc<WriteLocks>,
    tids: Arc<TidPool>,
    shutdown: ShutdownManager,
    initial: Datagram,
) {
    let tid = match tids.acquire() {
        Some(tid) => tid,
        None => {
            // dropped on the floor; the client's retransmit will try again
            log::error!("TID pool exhausted, dropping request from {}", initial.peer);
            return;
        }
    };

    let addr = format!("0.0.0.0:{tid}");
    let socket = match UdpSocket::bind(&addr).await {
        Ok(socket) => Arc::new(socket),
        Err(e) => {
            log::error!("could not bind transfer endpoint at {addr}: {e}");
            tids.release(tid);
            return;
        }
    };

    let (inject, inbound) =
        udp::spawn_listener(socket.clone(), shutdown.clone(), WORKER_INBOUND_BUFFER);
    let outbound = udp::spawn_responder(socket, shutdown.clone(), WORKER_OUTBOUND_BUFFER);
    let _ = inject.send(initial).await;

    let transfer = drive_transfer(&files, &locks, shutdown, inbound, outbound).await;

    if transfer.op == Some(Op::Write) {
        locks.release(&transfer.file.filename);
    }
    tids.release(tid);
}

/// The per-transfer loop: feed inbound packets to the state machine,
/// send its replies, retransmit the last reply on silence, and commit
/// completed writes to the store.
async fn drive_transfer(
    files: &FileStore,
    locks: &WriteLocks,
    mut shutdown: ShutdownManager,
    mut inbound: mpsc::Receiver<Datagram>,
    outbound: mpsc::Sender<Datagram>,
) -> Transfer {
    let mut transfer = Transfer::new();
    let mut retries = RETRY_LIMIT;
    let mut last_reply: Option<Datagram> = None;

    while retries > 0 {
        tokio::select! {
            _ = shutdown.recv() => return transfer,
            received = inbound.recv() => {
                let Some(datagram) = received else { return transfer };
                retries = RETRY_LIMIT;

                let packet = match Packet::parse(&datagram.data) {
                    Ok(packet) => packet,
                    Err(e) => {
                        log::error!(target: "request",
                            "unknown request from {}: {e} ({})",
                            datagram.peer, String::from_utf8_lossy(&datagram.data));
                        return transfer;
                    }
                };

                if let Some(reply) = transfer::process(files, locks, &mut transfer, datagram.peer, &packet) {
                    let reply = Datagram::new(datagram.peer, reply.serialize());
                    if outbound.send(reply.clone()).await.is_err() {
                        return transfer;
                    }
                    last_reply = Some(reply);
                }

                if transfer.finished() {
                    if transfer.op == Some(Op::Write) {
                        files.set(transfer.file.clone());
                    }
                    let op = transfer.op.map(|op| op.as_str()).unwrap_or("get");
                    log::info!(target: "request",
                        "transfer complete: {op} {} ({} bytes) for {}",
                        transfer.file.filename, transfer.file.data.len(), datagram.peer);
                    return transfer;
                }
            }
            _ = time::sleep(IDLE_TIMEOUT) => {
                // replay the last reply if the peer has gone quiet
                if let Some(reply) = &last_reply {
                    if outbound.send(reply.clone()).await.is_err() {
                        return transfer;
                    }
                }
                retries -= 1;
            }
        }
    }

    log::debug!("transfer abandoned after {RETRY_LIMIT} idle timeouts");
    transfer
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tftp::ErrorCode;
    use crate::udp::MAX_DATAGRAM;
    use tokio::time::timeout;

    async fn start_server(tid_min: u16, tid_max: u16) -> (SocketAddr, ShutdownManager) {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), tid_min, tid_max)
            .await
            .unwrap();
        let addr = server.local_addr().unwrap();
        let shutdown = ShutdownManager::new();
        tokio::spawn(server.serve(shutdown.clone()));
        (addr, shutdown)
    }

    async fn recv_packet(client: &UdpSocket) -> (Packet, SocketAddr) {
        let mut buf = [0u8; MAX_DATAGRAM];
        let (n, from) = timeout(Duration::from_secs(5), client.recv_from(&mut buf))
            .await
            .expect("timed out waiting for the server")
            .unwrap();
        (Packet::parse(&buf[..n]).unwrap(), from)
    }

    async fn request(client: &UdpSocket, to: SocketAddr, packet: &Packet) -> (Packet, SocketAddr) {
        client.send_to(&packet.serialize(), to).await.unwrap();
        recv_packet(client).await
    }

    fn read_req(filename: &str) -> Packet {
        Packet::ReadReq { filename: filename.to_string(), mode: "octet".to_string() }
    }

    fn write_req(filename: &str) -> Packet {
        Packet::WriteReq { filename: filename.to_string(), mode: "octet".to_string() }
    }

    #[tokio::test]
    async fn test_write_then_read_round_trip() {
        let (addr, mut shutdown) = start_server(45640, 45660).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload: Vec<u8> = (0..700u32).map(|i| i as u8).collect();

        // push "hello" in a 512 byte block and a 188 byte block
        let (reply, tid_addr) = request(&client, addr, &write_req("hello")).await;
        assert_eq!(reply, Packet::Ack { block: 0 });
        assert!((45640..45660).contains(&tid_addr.port()));

        let (reply, _) = request(&client, tid_addr, &Packet::Data {
            block: 1,
            data: payload[..512].to_vec(),
        }).await;
        assert_eq!(reply, Packet::Ack { block: 1 });

        let (reply, _) = request(&client, tid_addr, &Packet::Data {
            block: 2,
            data: payload[512..].to_vec(),
        }).await;
        assert_eq!(reply, Packet::Ack { block: 2 });

        // pull it back on a fresh session
        let (reply, read_addr) = request(&client, addr, &read_req("hello")).await;
        assert_eq!(reply, Packet::Data { block: 1, data: payload[..512].to_vec() });
        assert_ne!(read_addr, tid_addr);

        let (reply, _) = request(&client, read_addr, &Packet::Ack { block: 1 }).await;
        assert_eq!(reply, Packet::Data { block: 2, data: payload[512..].to_vec() });

        let (reply, _) = request(&client, read_addr, &Packet::Ack { block: 2 }).await;
        assert_eq!(reply, Packet::Data { block: 3, data: vec![] });

        shutdown.send();
    }

    #[tokio::test]
    async fn test_read_of_missing_file() {
        let (addr, mut shutdown) = start_server(45660, 45680).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (reply, _) = request(&client, addr, &read_req("nope")).await;
        assert_eq!(reply, Packet::Error {
            code: ErrorCode::FileNotFound,
            message: "file not found".to_string(),
        });

        shutdown.send();
    }

    #[tokio::test]
    async fn test_concurrent_writes_conflict() {
        let (addr, mut shutdown) = start_server(45680, 45700).await;
        let first = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let second = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (reply, tid_addr) = request(&first, addr, &write_req("x")).await;
        assert_eq!(reply, Packet::Ack { block: 0 });

        let (reply, _) = request(&second, addr, &write_req("x")).await;
        assert_eq!(reply, Packet::Error {
            code: ErrorCode::FileAlreadyExists,
            message: "Write already in progress for x".to_string(),
        });

        // first writer finishes; its worker releases the lock on exit
        let (reply, _) = request(&first, tid_addr, &Packet::Data {
            block: 1,
            data: vec![0x61; 10],
        }).await;
        assert_eq!(reply, Packet::Ack { block: 1 });

        let (reply, _) = request(&second, addr, &write_req("x")).await;
        assert_eq!(reply, Packet::Ack { block: 0 });

        shutdown.send();
    }

    #[tokio::test]
    async fn test_empty_file_round_trip() {
        let (addr, mut shutdown) = start_server(45700, 45720).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let (reply, tid_addr) = request(&client, addr, &write_req("empty")).await;
        assert_eq!(reply, Packet::Ack { block: 0 });
        let (reply, _) = request(&client, tid_addr, &Packet::Data { block: 1, data: vec![] }).await;
        assert_eq!(reply, Packet::Ack { block: 1 });

        let (reply, _) = request(&client, addr, &read_req("empty")).await;
        assert_eq!(reply, Packet::Data { block: 1, data: vec![] });

        shutdown.send();
    }

    #[tokio::test]
    async fn test_exact_block_file_round_trip() {
        let (addr, mut shutdown) = start_server(45740, 45760).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = vec![0x42; 512];

        // a file ending on the block boundary needs a trailing empty
        // data packet to close the write
        let (reply, tid_addr) = request(&client, addr, &write_req("e512")).await;
        assert_eq!(reply, Packet::Ack { block: 0 });

        let (reply, _) = request(&client, tid_addr, &Packet::Data {
            block: 1,
            data: payload.clone(),
        }).await;
        assert_eq!(reply, Packet::Ack { block: 1 });

        let (reply, _) = request(&client, tid_addr, &Packet::Data {
            block: 2,
            data: vec![],
        }).await;
        assert_eq!(reply, Packet::Ack { block: 2 });

        // reading it back draws the full block, then an empty block
        // after the ack rather than a short one
        let (reply, read_addr) = request(&client, addr, &read_req("e512")).await;
        assert_eq!(reply, Packet::Data { block: 1, data: payload });

        let (reply, _) = request(&client, read_addr, &Packet::Ack { block: 1 }).await;
        assert_eq!(reply, Packet::Data { block: 2, data: vec![] });

        shutdown.send();
    }

    #[tokio::test]
    async fn test_serve_stops_on_shutdown() {
        let server = Server::bind("127.0.0.1:0".parse().unwrap(), 45720, 45740)
            .await
            .unwrap();
        let mut shutdown = ShutdownManager::new();
        let handle = tokio::spawn(server.serve(shutdown.clone()));

        shutdown.send();
        timeout(Duration::from_secs(2), handle)
            .await
            .expect("serve did not stop on shutdown")
            .unwrap();
    }
}
