// This is an in-memory implementation of a TFTP server compliant with RFC 1350.
//
// A transfer begins with a request to read or write a file. If the server
// grants the request, the file moves in blocks of 512 bytes, and each data
// packet must be acked before the next one is sent. A data packet shorter
// than 512 bytes marks the end of its transfer.
//
// Each end of a connection picks a Transfer ID (TID) for itself, and the
// TIDs are used as UDP ports. The requesting host sends its initial request
// to the well-known port 69; the server answers from a freshly chosen TID,
// and the rest of the transfer runs between the two TIDs. On data loss the
// waiting side times out and retransmits its last packet, which prompts the
// other side to retransmit the lost one.
//
// Files live only in process memory. A completed write is stored under its
// filename (an opaque key, no directory semantics) and can be fetched back
// by any number of readers; a second write to a name that is still being
// written is refused with error 6.

mod server;
mod shutdown;
mod storage;
mod tftp;
mod tid;
mod transfer;
mod udp;

use std::net::SocketAddr;

use anyhow::{bail, Context, Result};
use clap::Parser;
use simple_logger::SimpleLogger;

use server::Server;
use shutdown::ShutdownManager;

#[derive(Parser)]
#[command(name = "memtftp", about = "In-memory TFTP server (RFC 1350)")]
struct Args {
    /// IP address and port to listen on (ex: 0.0.0.0:69)
    #[arg(long)]
    address: SocketAddr,

    /// Logging level (trace, debug, info, warn, error); anything
    /// unrecognized falls back to info
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Lower bound of the transfer ID port range
    #[arg(long, default_value_t = 6000)]
    tid_min: u16,

    /// Upper bound (exclusive) of the transfer ID port range
    #[arg(long, default_value_t = 9000)]
    tid_max: u16,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let level = args.log_level.parse().unwrap_or(log::LevelFilter::Info);
    SimpleLogger::new().with_level(level).init()?;

    if args.tid_min >= args.tid_max {
        bail!("invalid TID range {}..{}", args.tid_min, args.tid_max);
    }

    let server = Server::bind(args.address, args.tid_min, args.tid_max)
        .await
        .with_context(|| format!("could not bind {}", args.address))?;
    let addr = server.local_addr().context("could not read bound address")?;
    log::info!("starting tftp server at {addr}");

    let shutdown = ShutdownManager::new();
    let mut signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::info!("shutdown signal received");
            signal_shutdown.send();
        }
    });

    server.serve(shutdown).await;
    Ok(())
}
