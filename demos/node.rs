use async_trait::async_trait;
use clap::Parser;
use clap_derive::{Parser, Subcommand};
use relink::config::LinkConfig;
use relink::connection::{Connection, Role};
use relink::dispatcher::EventDispatcher;
use relink::segment::parse_segment;
use relink::stream::StreamJob;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::UdpSocket;
use tokio::time;
use tracing::{debug, error, info, warn, Level};

const MAX_DATAGRAM: usize = 65536;

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Command,

    #[clap(short, long, default_value_t = false)]
    verbose: bool,

    #[clap(long, default_value_t = false)]
    very_verbose: bool,
}

#[derive(Subcommand)]
enum Command {
    /// Bind a port and wait for a peer to make contact.
    Server { port: u16 },
    /// Contact a waiting peer.
    Client { address: IpAddr, port: u16 },
}

/// Prints whatever the peer delivers.
struct PrintDispatcher;

#[async_trait]
impl EventDispatcher for PrintDispatcher {
    async fn on_text(&self, stream_id: u32, text: &str) {
        println!("[stream {}] {}", stream_id, text);
    }

    async fn on_file(&self, stream_id: u32, path: &str, fragments: u16) {
        println!("[stream {}] received {} ({} fragments)", stream_id, path, fragments);
    }
}

#[tokio::main]
pub async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let level = match (args.verbose, args.very_verbose) {
        (_, true) => Level::TRACE,
        (true, _) => Level::DEBUG,
        (false, false) => Level::INFO,
    };

    tracing_subscriber::fmt()
        .with_max_level(level)
        .try_init()
        .ok();

    let (socket, conn) = match args.command {
        Command::Server { port } => {
            let socket = Arc::new(UdpSocket::bind(("0.0.0.0", port)).await?);
            info!("waiting for a peer on port {}", port);
            let conn = accept_first_peer(&socket).await?;
            (socket, conn)
        }
        Command::Client { address, port } => {
            let socket = Arc::new(UdpSocket::bind("0.0.0.0:0").await?);
            let peer_addr = SocketAddr::from((address, port));
            info!("connecting to {}", peer_addr);
            let conn = Connection::new(
                Arc::new(socket.clone()),
                peer_addr,
                Role::Client,
                LinkConfig::new(),
                Arc::new(PrintDispatcher),
            )?;
            conn.open_stream(StreamJob::SendInit).await;
            (socket, conn)
        }
    };

    tokio::spawn(console_loop(conn.clone()));
    receive_loop(socket, conn.clone()).await;

    conn.dispose().await;
    info!("bye");
    Ok(())
}

/// Waits for the first parseable segment from anyone; whoever sent it is the
///  peer for the rest of the session.
async fn accept_first_peer(socket: &Arc<UdpSocket>) -> anyhow::Result<Arc<Connection>> {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        let (len, from) = socket.recv_from(&mut buf).await?;
        let Some(segment) = parse_segment(&buf[..len]) else {
            debug!("unparseable datagram from {:?} - ignoring", from);
            continue;
        };
        info!("peer {:?} connected", from);
        let conn = Connection::new(
            Arc::new(socket.clone()),
            from,
            Role::Server,
            LinkConfig::new(),
            Arc::new(PrintDispatcher),
        )?;
        conn.handle_segment(segment).await;
        return Ok(conn);
    }
}

/// Pumps inbound datagrams into the connection. The receive timeout doubles
///  as the keep-alive tick.
async fn receive_loop(socket: Arc<UdpSocket>, conn: Arc<Connection>) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    while conn.is_open() {
        match time::timeout(Duration::from_millis(100), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, from))) => {
                if from != conn.peer_addr() {
                    debug!("datagram from {:?} is not from the peer - ignoring", from);
                    continue;
                }
                if let Some(segment) = parse_segment(&buf[..len]) {
                    debug!("<-- {}", segment);
                    conn.handle_segment(segment).await;
                }
            }
            Ok(Err(e)) => {
                error!("socket error: {}", e);
            }
            Err(_) => {
                conn.tick().await;
            }
        }
    }
}

/// Reads directives from stdin:
///   FIN                  orderly shutdown
///   FILE <src>,<dest>    upload a local file to the peer's destination path
///   SIZE <n>             fragment size for subsequent transfers
///   LOSS <n>             corrupt the next n outbound payload segments
/// Anything else goes to the peer as a text message.
async fn console_loop(conn: Arc<Connection>) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => return,
            Err(e) => {
                error!("console error: {}", e);
                return;
            }
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if line == "FIN" {
            conn.request_fin().await;
        } else if let Some(rest) = line.strip_prefix("FILE ") {
            match rest.split_once(',') {
                Some((source, dest)) => {
                    conn.open_stream(StreamJob::SendFile {
                        source: PathBuf::from(source.trim()),
                        dest: dest.trim().to_string(),
                    }).await;
                }
                None => warn!("usage: FILE <source>,<destination>"),
            }
        } else if let Some(rest) = line.strip_prefix("SIZE ") {
            match rest.trim().parse::<usize>() {
                Ok(fragment_size) => {
                    if let Err(e) = conn.set_fragment_size(fragment_size) {
                        warn!("{}", e);
                    }
                }
                Err(_) => warn!("usage: SIZE <bytes>"),
            }
        } else if let Some(rest) = line.strip_prefix("LOSS ") {
            match rest.trim().parse::<u32>() {
                Ok(count) => conn.arm_corruption(count),
                Err(_) => warn!("usage: LOSS <count>"),
            }
        } else {
            conn.open_stream(StreamJob::SendText(line.to_string())).await;
        }
    }
}
