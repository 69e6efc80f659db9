use std::net::SocketAddr;

use crate::storage::{File, FileStore, WriteLocks, BLOCK_SIZE};
use crate::tftp::{ErrorCode, Packet};

/// Direction of a transfer, fixed by the request packet that
/// started it.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    Read,
    Write,
}

impl Op {
    /// Short name used in the request log.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Read => "get",
            Op::Write => "put",
        }
    }
}

/// Per-session transfer state. Owned exclusively by one worker;
/// never shared.
///
/// `block` is the next block expected (write) or to send (read). It
/// is kept wider than the 16-bit wire field so that transfers larger
/// than 65535 blocks survive the wraparound; it is reduced mod 2^16
/// only when compared against or placed into a packet.
#[derive(Debug, PartialEq)]
pub struct Transfer {
    pub file: File,
    pub block: u64,
    pub op: Option<Op>,
    pub done: bool,
    pub error: bool,
}

impl Transfer {
    pub fn new() -> Transfer {
        Transfer {
            file: File::new(""),
            block: 0,
            op: None,
            done: false,
            error: false,
        }
    }

    /// True once the transfer has terminated without error, i.e. the
    /// worker should commit (for writes) and exit.
    pub fn finished(&self) -> bool {
        self.done && !self.error
    }
}

impl Default for Transfer {
    fn default() -> Transfer {
        Transfer::new()
    }
}

/// Steps the transfer state machine with one parsed packet and
/// returns the reply to send, if any.
///
/// Duplicate or out-of-sequence packets and requests against an
/// already-running transfer produce no reply and no state change;
/// the peer's retransmission timer sorts those out.
pub fn process(
    files: &FileStore,
    locks: &WriteLocks,
    transfer: &mut Transfer,
    peer: SocketAddr,
    packet: &Packet,
) -> Option<Packet> {
    match packet {
        Packet::ReadReq { filename, .. } => process_read_req(files, transfer, peer, filename),
        Packet::WriteReq { filename, .. } => process_write_req(locks, transfer, peer, filename),
        Packet::Ack { block } => process_ack(transfer, *block),
        Packet::Data { block, data } => process_data(transfer, *block, data),
        Packet::Error { code, message } => {
            log::info!("peer {peer} sent error {:?}: {message}", code);
            transfer.done = true;
            transfer.error = true;
            None
        }
    }
}

fn process_read_req(
    files: &FileStore,
    transfer: &mut Transfer,
    peer: SocketAddr,
    filename: &str,
) -> Option<Packet> {
    if transfer.op.is_some() || transfer.block != 0 {
        return None;
    }
    log::info!(target: "request", "get {filename} transfer requested by {peer}");

    let file = match files.get(filename) {
        Some(file) => file,
        None => {
            transfer.done = true;
            transfer.error = true;
            return Some(Packet::Error {
                code: ErrorCode::FileNotFound,
                message: "file not found".to_string(),
            });
        }
    };

    let data = match file.read_block(1) {
        Some(block) => block.to_vec(),
        None => {
            transfer.done = true;
            transfer.error = true;
            return Some(Packet::Error {
                code: ErrorCode::Undefined,
                message: "no blocks in file".to_string(),
            });
        }
    };

    transfer.op = Some(Op::Read);
    transfer.file = file;
    transfer.block = 2;
    if data.len() < BLOCK_SIZE {
        transfer.done = true;
    }
    Some(Packet::Data { block: 1, data })
}

fn process_write_req(
    locks: &WriteLocks,
    transfer: &mut Transfer,
    peer: SocketAddr,
    filename: &str,
) -> Option<Packet> {
    if transfer.op.is_some() || transfer.block != 0 {
        return None;
    }
    if !locks.try_acquire(filename) {
        return Some(Packet::Error {
            code: ErrorCode::FileAlreadyExists,
            message: format!("Write already in progress for {filename}"),
        });
    }
    log::info!(target: "request", "put {filename} transfer requested by {peer}");

    transfer.op = Some(Op::Write);
    transfer.file.filename = filename.to_string();
    transfer.block = 1;
    Some(Packet::Ack { block: 0 })
}

fn process_ack(transfer: &mut Transfer, block: u16) -> Option<Packet> {
    // a terminal transfer never transitions again; late acks are left
    // to the worker's replay timer
    if transfer.done {
        return None;
    }
    if transfer.op != Some(Op::Read) {
        return None;
    }
    // compare the wire block # against the wrapped transfer block #
    if (transfer.block as u16).wrapping_sub(1) != block {
        return None;
    }
    match transfer.file.read_block(transfer.block) {
        Some(data) => {
            // even when this block is short, clients still send a final
            // ack, so completion waits for the read past the end below
            let data = data.to_vec();
            transfer.block += 1;
            Some(Packet::Data { block: block.wrapping_add(1), data })
        }
        None => {
            // catch-all for the last-block ack, or a file ending on an
            // exact block boundary: answer with an empty block to stop
            // the transfer
            transfer.done = true;
            Some(Packet::Data { block: block.wrapping_add(1), data: Vec::new() })
        }
    }
}

fn process_data(transfer: &mut Transfer, block: u16, data: &[u8]) -> Option<Packet> {
    // a terminal transfer never transitions again
    if transfer.done {
        return None;
    }
    if transfer.op != Some(Op::Write) {
        return None;
    }
    // compare the wire block # against the wrapped transfer block #
    if transfer.block as u16 != block {
        return None;
    }
    match transfer.file.write_block(transfer.block, data) {
        Ok(_) => {
            if data.len() < BLOCK_SIZE {
                transfer.done = true;
            } else {
                transfer.block += 1;
            }
            Some(Packet::Ack { block })
        }
        Err(e) => {
            log::debug!("dropping data block {block}: {e}");
            None
        }
    }
}
