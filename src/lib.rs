//! Reliable, ordered, multiplexed messaging between exactly two peers over
//!  plain UDP. The protocol trades raw throughput for simplicity: every wire
//!  unit fits a single datagram, every exchange is acknowledged, and loss is
//!  handled by re-sending until the other side answers.
//!
//! ## Design goals
//!
//! * Exactly two peers per link, one UDP socket each
//!   * a server side that waits to be contacted and a client side that
//!     initiates, distinguished only by who sends the first segment and by
//!     stream id parity
//!   * explicitly *not* a mesh or pub/sub system - one connection, one peer
//! * Concurrent conversations multiplex over the one socket pair as
//!   *streams*, each an independently ordered channel
//!   * the server allocates even stream ids, the client odd ones, so both
//!     sides can open streams at any time without coordination
//!   * a stream carries one conversation (a text, a file transfer, a
//!     handshake) and is discarded afterwards
//! * Everything on the wire is a *segment* that fits one datagram
//!   * control messages carry a per-stream sequence number and are re-sent
//!     until the correctly numbered reply arrives
//!   * file payload travels as unsequenced data fragments, covered instead
//!     by selective acknowledgement reports
//! * Corruption is detected per segment with a CRC-32 checksum; a segment
//!   that does not check out is treated exactly like one that never arrived
//! * Uploads are flow-controlled by a fixed-size window with ack-round
//!   ageing rather than timers, keeping retransmission decisions at the
//!   round boundaries
//! * Idle links are watched by a keep-alive that pings over a regular
//!   stream, so liveness probing exercises the same code as everything else
//!
//! ## Segment layout
//!
//! All numbers in network byte order (BE):
//! ```ascii
//! 0:  segment type (u8)
//! 1:  payload length (u16) - counts the body behind the fixed header,
//!      except that a message's sequence number is never counted and a data
//!      segment's fragment id is not either
//! 3:  stream id (u32)
//! 7:  checksum (u32) - CRC-32 over the whole serialized segment with this
//!      field zeroed
//! 11: message id (u16) for control messages, fragment id (u16) for data
//! 13: body
//! ```
//!
//! ## Segment types
//!
//! *INIT* (1), *FIN* (2), *OK* (3), *PING* (10) - bodiless control
//!  messages. INIT opens a connection, FIN closes it, PING probes it, OK
//!  acknowledges. An OK echoes the conversation's current sequence number
//!  without advancing it, so it can be repeated for duplicates.
//!
//! *TEXT* (4) - one chunk of a UTF-8 message, at most a fragment size per
//!  segment. Each chunk is answered with NEXT; the final OK ends the
//!  conversation. Also doubles as the rejection reply to a file offer,
//!  carrying the reason.
//!
//! *FILE* (5) - a transfer offer: the destination path and a low 16-bit
//!  slice of the byte size, which is advisory only. Answered with ACCEPT or
//!  a TEXT rejection.
//!
//! *ACCEPT* (6) - the receiver is ready for fragments.
//!
//! *DATA* (7) - one file fragment, identified by a 16-bit fragment id
//!  instead of a message sequence number. Not individually acknowledged.
//!
//! *DONE* (8) - the sender's window is full or the file is exhausted; asks
//!  the receiver for a report.
//!
//! *NEXT* (9) - the receiver's report: the fragment ids newly accepted since
//!  the last report, as a list of u16 values. Outside file transfers an
//!  empty NEXT acknowledges a text chunk.
//!
//! ## Conversations
//!
//! Every stream runs one conversation with a single shared sequence
//!  counter: each message sent or accepted advances it by one, so both
//!  peers always know which number comes next and duplicates or stale
//!  re-sends are recognized on arrival.
//!
//! A text transfer:
//! ```ascii
//! sender                       receiver
//!   TEXT(0) "hel"         -->
//!                         <--  NEXT(1) []
//!   TEXT(2) "lo"          -->
//!                         <--  NEXT(3) []
//!   OK(4)                 -->
//! ```
//!
//! A file transfer, window permitting two fragments per round:
//! ```ascii
//! sender                       receiver
//!   FILE(0) "dest", size  -->
//!                         <--  ACCEPT(1)
//!   DATA fragment 0       -->
//!   DATA fragment 1       -->
//!   DONE(2)               -->
//!                         <--  NEXT(3) [0, 1]
//!   ...                   ...
//!   OK(n)                 -->
//! ```
//! Fragments that go unmentioned in reports for enough rounds are re-sent;
//!  the receiver writes them in fragment id order regardless of arrival
//!  order and never names the same id in two reports.
//!
//! ## Keep-alive
//!
//! Each endpoint tracks when it last heard from the peer. After a silent
//!  ping interval it opens a regular stream with a PING conversation; if the
//!  silence continues past twice the interval, the connection is closed. The
//!  timestamp is jittered slightly into the future on every inbound segment
//!  so the two endpoints do not settle into pinging each other in lockstep.

pub mod segment;
pub mod connection;
pub mod stream;
pub mod dispatcher;
pub mod send_socket;
pub mod config;
mod fault;
mod reassembly;
mod send_window;

#[cfg(test)]
mod test {
    use tracing::Level;

    #[ctor::ctor]
    fn init_test_logging() {
        tracing_subscriber::fmt()
            .with_test_writer()
            // .with_max_level(Level::DEBUG)
            .with_max_level(Level::TRACE)
            .try_init()
            .ok();
    }
}
