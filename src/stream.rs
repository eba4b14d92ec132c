use crate::connection::Connection;
use crate::reassembly::Reassembly;
use crate::segment::{DataSegment, Message, MessageKind, Segment, SegmentType};
use crate::send_window::SendWindow;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::time;
use tracing::{debug, error, info, trace, warn};

/// The handling routine assigned to a stream's worker. Locally opened
///  streams get one of the send jobs; streams opened by the peer always
///  listen.
#[derive(Debug)]
pub enum StreamJob {
    SendInit,
    SendPing,
    SendFin,
    SendText(String),
    SendFile { source: PathBuf, dest: String },
    Listen,
}

/// Why a stream routine stopped making progress.
#[derive(Debug)]
pub(crate) enum StreamError {
    /// Nothing arrived within the receive timeout.
    NoReply,
    /// The mailbox was closed: the connection is being disposed.
    Stopped,
    /// Protocol violation or unrecoverable local failure; the worker wrapper
    ///  turns this into connection teardown.
    Fatal(String),
}

type StreamResult<T> = Result<T, StreamError>;

struct Download {
    file: File,
    path: String,
}

/// One logical, independently ordered channel. The worker task owns the
///  stream exclusively; the only way in is the mailbox.
pub(crate) struct Stream {
    id: u32,
    conn: Arc<Connection>,
    inbound: mpsc::Receiver<Segment>,
    /// The id the next message of this stream's conversation must carry,
    ///  shared by both directions: sending and receiving each advance it.
    next_message_id: u16,
    reassembly: Reassembly,
    download: Option<Download>,
}

impl Stream {
    pub(crate) fn new(id: u32, conn: Arc<Connection>, inbound: mpsc::Receiver<Segment>) -> Stream {
        Stream {
            id,
            conn,
            inbound,
            next_message_id: 0,
            reassembly: Reassembly::new(),
            download: None,
        }
    }

    /// Worker entry point: runs the job, then unregisters the stream and
    ///  drains late arrivals. Fatal outcomes close the connection.
    pub(crate) async fn run(mut self, job: StreamJob) {
        trace!("stream {}: worker starting {:?}", self.id, job);
        match self.execute(job).await {
            Ok(()) => {}
            Err(StreamError::NoReply) => {
                debug!("stream {}: peer stopped answering - giving up", self.id);
            }
            Err(StreamError::Stopped) => {
                return;
            }
            Err(StreamError::Fatal(reason)) => {
                warn!("stream {}: {} - closing the connection", self.id, reason);
                self.conn.close();
                return;
            }
        }
        self.conn.unregister_stream(self.id).await;
        self.drain().await;
    }

    async fn execute(&mut self, job: StreamJob) -> StreamResult<()> {
        match job {
            StreamJob::SendInit => self.send_init().await,
            StreamJob::SendPing => self.send_ping().await,
            StreamJob::SendFin => self.send_fin().await,
            StreamJob::SendText(text) => self.send_text(&text).await,
            StreamJob::SendFile { source, dest } => self.send_file(&source, dest).await,
            StreamJob::Listen => self.listen().await,
        }
    }

    async fn drain(&mut self) {
        while let Ok(residual) = self.receive().await {
            trace!("stream {}: draining residual {}", self.id, residual);
        }
    }

    /// Pops the next inbound segment, waiting at most the receive timeout.
    async fn receive(&mut self) -> StreamResult<Segment> {
        match time::timeout(self.conn.config().receive_timeout, self.inbound.recv()).await {
            Err(_) => Err(StreamError::NoReply),
            Ok(None) => Err(StreamError::Stopped),
            Ok(Some(segment)) => Ok(segment),
        }
    }

    /// Pops segments until the conversation's next message arrives. Data
    ///  segments are fed to reassembly along the way; messages out of order
    ///  are discarded, the peer re-sends until we acknowledge.
    async fn receive_message(&mut self) -> StreamResult<Message> {
        loop {
            match self.receive().await? {
                Segment::Message(message) => {
                    if message.message_id != self.next_message_id {
                        warn!("stream {}: out-of-order message id {} (expected {}) - discarding",
                              self.id, message.message_id, self.next_message_id);
                        continue;
                    }
                    self.next_message_id = message.message_id.wrapping_add(1);
                    return Ok(message);
                }
                Segment::Data(data) => {
                    self.accept_fragment(data).await?;
                }
            }
        }
    }

    async fn accept_fragment(&mut self, data: DataSegment) -> StreamResult<()> {
        let Some(download) = &mut self.download else {
            trace!("stream {}: fragment {} outside a transfer - ignoring", self.id, data.fragment_id);
            return Ok(());
        };
        for chunk in self.reassembly.offer(data.fragment_id, data.data) {
            if let Err(e) = download.file.write_all(&chunk).await {
                let path = download.path.clone();
                error!("stream {}: writing to {} failed: {}", self.id, path, e);
                self.download = None;
                return Err(StreamError::Fatal(format!("writing the download to {} failed", path)));
            }
        }
        Ok(())
    }

    /// Sends a message carrying the conversation's current id and waits for
    ///  the correctly ordered reply, re-sending up to the configured retry
    ///  budget. `repeat` extra duplicates go out up front for loss
    ///  resilience. An unexpected reply variant, like an exhausted budget,
    ///  is fatal.
    async fn send_message(
        &mut self,
        kind: MessageKind,
        expected_reply: Option<SegmentType>,
        repeat: u32,
    ) -> StreamResult<Message> {
        let message = Message {
            stream_id: self.id,
            message_id: self.next_message_id,
            kind,
        };
        self.next_message_id = message.message_id.wrapping_add(1);

        for _ in 0..repeat {
            self.conn.send(&Segment::Message(message.clone())).await;
        }

        for _ in 0..self.conn.config().repeat_limit {
            self.conn.send(&Segment::Message(message.clone())).await;
            match self.receive_message().await {
                Ok(reply) => {
                    if let Some(expected) = expected_reply {
                        if reply.kind.segment_type() != expected {
                            return Err(StreamError::Fatal(format!(
                                "peer answered {:?} with {:?} where {:?} was required",
                                message.kind.segment_type(), reply.kind.segment_type(), expected)));
                        }
                    }
                    return Ok(reply);
                }
                Err(StreamError::NoReply) => {
                    debug!("stream {}: no reply to {} - retrying", self.id, message);
                }
                Err(other) => return Err(other),
            }
        }
        Err(StreamError::Fatal(format!(
            "no reply to {} after {} attempts",
            message, self.conn.config().repeat_limit)))
    }

    /// Sends an OK and keeps re-acknowledging whatever else straggles in on
    ///  this stream until a receive timeout passes quietly. The OK echoes
    ///  the current conversation id without advancing it.
    async fn send_ok(&mut self) -> StreamResult<()> {
        let ok = Message {
            stream_id: self.id,
            message_id: self.next_message_id,
            kind: MessageKind::Ok,
        };
        self.conn.send(&Segment::Message(ok.clone())).await;
        loop {
            match self.receive().await {
                Ok(residual) => {
                    trace!("stream {}: re-acknowledging {}", self.id, residual);
                    self.conn.send(&Segment::Message(ok.clone())).await;
                }
                Err(StreamError::NoReply) => return Ok(()),
                Err(other) => return Err(other),
            }
        }
    }

    async fn send_init(&mut self) -> StreamResult<()> {
        self.send_message(MessageKind::Init, Some(SegmentType::Ok), 0).await?;
        info!("stream {}: peer acknowledged the connection", self.id);
        Ok(())
    }

    async fn send_ping(&mut self) -> StreamResult<()> {
        self.send_message(MessageKind::Ping, Some(SegmentType::Ok), 0).await?;
        debug!("stream {}: peer answered the keep-alive ping", self.id);
        Ok(())
    }

    async fn send_fin(&mut self) -> StreamResult<()> {
        self.send_message(MessageKind::Fin, Some(SegmentType::Ok), 0).await?;
        // give the peer's ack-drain a moment before the connection goes away
        time::sleep(Duration::from_millis(10)).await;
        info!("stream {}: peer acknowledged fin - closing the connection", self.id);
        self.conn.close();
        Ok(())
    }

    /// Splits `text` into fragment-sized chunks, each sent as a Text message
    ///  expecting a Next reply, and finishes the conversation with an OK.
    async fn send_text(&mut self, text: &str) -> StreamResult<()> {
        let fragment_size = self.conn.fragment_size();
        let force_repeat = self.conn.config().force_repeat;
        for chunk in split_chunks(text, fragment_size) {
            self.send_message(MessageKind::Text(chunk), Some(SegmentType::Next), force_repeat).await?;
        }
        self.send_ok().await
    }

    /// Uploads `source` to the peer's `dest` through the sliding window.
    async fn send_file(&mut self, source: &Path, dest: String) -> StreamResult<()> {
        let mut file = match File::open(source).await {
            Ok(file) => file,
            Err(e) => {
                error!("stream {}: cannot open {:?} for upload: {}", self.id, source, e);
                return Ok(());
            }
        };
        let size = match file.metadata().await {
            Ok(metadata) => metadata.len(),
            Err(e) => {
                error!("stream {}: cannot stat {:?}: {}", self.id, source, e);
                return Ok(());
            }
        };
        let fragment_size = self.conn.fragment_size();
        if size > (u16::MAX as u64 + 1) * fragment_size as u64 {
            error!("stream {}: {:?} does not fit the 16-bit fragment id space at {} bytes per fragment - not offering it",
                   self.id, source, fragment_size);
            return Ok(());
        }

        info!("stream {}: offering {:?} as {} ({} bytes)", self.id, source, dest, size);
        let reply = self.send_message(MessageKind::File { path: dest.clone(), size: size as u16 }, None, 0).await?;
        match reply.kind {
            MessageKind::Accept => {}
            MessageKind::Text(reason) => {
                warn!("stream {}: peer rejected the transfer: {}", self.id, reason);
                return self.send_ok().await;
            }
            other => {
                return Err(StreamError::Fatal(format!(
                    "peer answered a file offer with {:?}", other.segment_type())));
            }
        }

        let force_repeat = self.conn.config().force_repeat;
        let mut window = SendWindow::new(self.conn.config().window_size, self.conn.config().fragment_max_age);
        let mut next_fragment_id: u16 = 0;
        let mut exhausted = false;

        loop {
            while !exhausted && window.has_room() && window.has_budget() {
                let chunk = match read_chunk(&mut file, fragment_size).await {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        error!("stream {}: reading {:?} failed: {}", self.id, source, e);
                        return Err(StreamError::Fatal(format!("reading the upload source {:?} failed", source)));
                    }
                };
                if chunk.is_empty() {
                    exhausted = true;
                    break;
                }
                let segment = Segment::Data(DataSegment {
                    stream_id: self.id,
                    fragment_id: next_fragment_id,
                    data: chunk.clone(),
                });
                window.admit(next_fragment_id, chunk);
                for _ in 0..=force_repeat {
                    self.conn.send(&segment).await;
                }
                next_fragment_id = next_fragment_id.wrapping_add(1);
            }

            if exhausted && window.is_empty() {
                info!("stream {}: upload of {} complete ({} bytes in {} fragments)",
                      self.id, dest, size, next_fragment_id);
                return self.send_ok().await;
            }

            let reply = self.send_message(MessageKind::Done, Some(SegmentType::Next), 0).await?;
            window.start_round();
            if let MessageKind::Next(acknowledged) = &reply.kind {
                window.acknowledge(acknowledged);
            }
            for (fragment_id, data) in window.age_round() {
                debug!("stream {}: fragment {} unacknowledged for too long - retransmitting", self.id, fragment_id);
                self.conn.send(&Segment::Data(DataSegment {
                    stream_id: self.id,
                    fragment_id,
                    data,
                })).await;
            }
        }
    }

    /// Passive mode for peer-opened streams: the first message decides what
    ///  this stream is about.
    async fn listen(&mut self) -> StreamResult<()> {
        let first = match self.receive_message().await {
            Ok(message) => message,
            Err(StreamError::NoReply) => {
                debug!("stream {}: opened by the peer but nothing arrived", self.id);
                return Ok(());
            }
            Err(other) => return Err(other),
        };
        match first.kind {
            MessageKind::Init => {
                info!("stream {}: peer established the connection", self.id);
                self.send_ok().await
            }
            MessageKind::Ping => {
                debug!("stream {}: answering keep-alive ping", self.id);
                self.send_ok().await
            }
            MessageKind::Fin => {
                info!("stream {}: peer asked to finish - closing after the ack", self.id);
                self.send_ok().await?;
                self.conn.close();
                Ok(())
            }
            MessageKind::Text(chunk) => self.receive_text(chunk).await,
            MessageKind::File { path, size } => self.receive_file(path, size).await,
            MessageKind::Ok | MessageKind::Accept | MessageKind::Done | MessageKind::Next(_) => {
                warn!("stream {}: {:?} cannot start a conversation - ignoring",
                      self.id, first.kind.segment_type());
                Ok(())
            }
        }
    }

    /// Receiver half of a text conversation: acknowledge each chunk with an
    ///  empty Next, accumulate until the sender's OK.
    async fn receive_text(&mut self, first_chunk: String) -> StreamResult<()> {
        let mut text = first_chunk;
        loop {
            let reply = self.send_message(MessageKind::Next(Vec::new()), None, 0).await?;
            match reply.kind {
                MessageKind::Ok => break,
                MessageKind::Text(chunk) => text.push_str(&chunk),
                other => {
                    return Err(StreamError::Fatal(format!(
                        "peer interleaved {:?} into a text conversation", other.segment_type())));
                }
            }
        }
        info!("stream {}: received a text of {} bytes", self.id, text.len());
        self.conn.dispatcher().on_text(self.id, &text).await;
        Ok(())
    }

    /// Receiver half of a file transfer: accept the offer, feed arriving
    ///  fragments through reassembly, answer every Done with a selective-ack
    ///  report, finish on the sender's OK.
    async fn receive_file(&mut self, path: String, declared_size: u16) -> StreamResult<()> {
        info!("stream {}: peer offers a file for {} (declared size {})", self.id, path, declared_size);
        let file = match File::create(&path).await {
            Ok(file) => file,
            Err(e) => {
                warn!("stream {}: cannot create {}: {} - rejecting the transfer", self.id, path, e);
                self.send_message(
                    MessageKind::Text(format!("cannot receive file: {}", e)),
                    Some(SegmentType::Ok),
                    0,
                ).await?;
                return Ok(());
            }
        };
        self.reassembly = Reassembly::new();
        self.download = Some(Download { file, path });

        let mut reply = self.send_message(MessageKind::Accept, None, 0).await?;
        loop {
            match reply.kind {
                MessageKind::Ok => {
                    if let Some(mut download) = self.download.take() {
                        if let Err(e) = download.file.flush().await {
                            error!("stream {}: flushing {} failed: {}", self.id, download.path, e);
                            return Err(StreamError::Fatal(format!("finalizing the download {} failed", download.path)));
                        }
                        info!("stream {}: download of {} complete ({} fragments)",
                              self.id, download.path, self.reassembly.fragments_written());
                        self.conn.dispatcher()
                            .on_file(self.id, &download.path, self.reassembly.fragments_written())
                            .await;
                    }
                    return Ok(());
                }
                MessageKind::Done => {
                    let report = self.reassembly.take_report();
                    reply = self.send_message(MessageKind::Next(report), None, 0).await?;
                }
                other => {
                    return Err(StreamError::Fatal(format!(
                        "peer drove a file transfer with {:?}", other.segment_type())));
                }
            }
        }
    }

}

/// Splits text into chunks of at most `max_bytes`, never splitting a
///  character; a single character wider than the budget forms its own chunk.
fn split_chunks(text: &str, max_bytes: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    for ch in text.chars() {
        if current.len() + ch.len_utf8() > max_bytes && !current.is_empty() {
            chunks.push(std::mem::take(&mut current));
        }
        current.push(ch);
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}

/// Reads up to `fragment_size` bytes; shorter only at EOF.
async fn read_chunk(file: &mut File, fragment_size: usize) -> std::io::Result<Bytes> {
    let mut chunk = vec![0u8; fragment_size];
    let mut filled = 0;
    while filled < fragment_size {
        let n = file.read(&mut chunk[filled..]).await?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    chunk.truncate(filled);
    Ok(Bytes::from(chunk))
}
