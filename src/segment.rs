use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use crc::Crc;
use num_enum::{IntoPrimitive, TryFromPrimitive};
use std::fmt::{Display, Formatter};
use tracing::warn;

/// Wire-level type tag, the first byte of every serialized segment.
#[derive(Debug, Copy, Clone, Eq, PartialEq, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum SegmentType {
    Init = 1,
    Fin = 2,
    Ok = 3,
    Text = 4,
    File = 5,
    Accept = 6,
    Data = 7,
    Done = 8,
    Next = 9,
    Ping = 10,
}

/// One protocol unit, sent in a single datagram. Everything except raw file
///  fragments is a [Message] taking part in a stream's ordered conversation;
///  fragments travel unordered as [DataSegment]s and are sequenced by their
///  fragment id instead.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum Segment {
    Message(Message),
    Data(DataSegment),
}

impl Segment {
    pub fn stream_id(&self) -> u32 {
        match self {
            Segment::Message(message) => message.stream_id,
            Segment::Data(data) => data.stream_id,
        }
    }

    pub fn segment_type(&self) -> SegmentType {
        match self {
            Segment::Message(message) => message.kind.segment_type(),
            Segment::Data(_) => SegmentType::Data,
        }
    }

    /// Appends the serialized segment to `buf`, checksum filled in.
    pub fn ser(&self, buf: &mut BytesMut) {
        let start = buf.len();
        match self {
            Segment::Message(message) => message.ser(buf),
            Segment::Data(data) => data.ser(buf),
        }
        let checksum = checksum_of(&buf[start..]);
        patch_checksum(&mut buf[start..], checksum);
    }
}

/// An ordered control message: all variants except Data. The message id is a
///  per-stream counter that both peers advance in lockstep, one increment per
///  message of the conversation regardless of who sent it.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Message {
    pub stream_id: u32,
    pub message_id: u16,
    pub kind: MessageKind,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum MessageKind {
    Init,
    Fin,
    Ok,
    Text(String),
    /// A file offer: destination path plus the declared size. The size rides
    ///  in a 16-bit wire field and is advisory (logged, never used to decide
    ///  completion).
    File { path: String, size: u16 },
    Accept,
    Done,
    /// Selective-ack report: the fragment ids received since the last report.
    Next(Vec<u16>),
    Ping,
}

impl MessageKind {
    pub fn segment_type(&self) -> SegmentType {
        match self {
            MessageKind::Init => SegmentType::Init,
            MessageKind::Fin => SegmentType::Fin,
            MessageKind::Ok => SegmentType::Ok,
            MessageKind::Text(_) => SegmentType::Text,
            MessageKind::File { .. } => SegmentType::File,
            MessageKind::Accept => SegmentType::Accept,
            MessageKind::Next(_) => SegmentType::Next,
            MessageKind::Done => SegmentType::Done,
            MessageKind::Ping => SegmentType::Ping,
        }
    }
}

impl Message {
    fn ser(&self, buf: &mut BytesMut) {
        let body_len = match &self.kind {
            MessageKind::Text(text) => text.len(),
            MessageKind::File { path, .. } => path.len() + 2,
            MessageKind::Next(fragments) => 2 * fragments.len(),
            _ => 0,
        };
        debug_assert!(body_len <= u16::MAX as usize);

        buf.put_u8(self.kind.segment_type().into());
        buf.put_u16(body_len as u16);
        buf.put_u32(self.stream_id);
        buf.put_u32(0); // checksum, patched once the body is assembled
        buf.put_u16(self.message_id);
        match &self.kind {
            MessageKind::Text(text) => buf.put_slice(text.as_bytes()),
            MessageKind::File { path, size } => {
                buf.put_u16(*size);
                buf.put_slice(path.as_bytes());
            }
            MessageKind::Next(fragments) => {
                for fragment_id in fragments {
                    buf.put_u16(*fragment_id);
                }
            }
            _ => {}
        }
    }
}

/// One chunk of a file transfer. The length field counts only the payload
///  bytes, not the fragment id.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct DataSegment {
    pub stream_id: u32,
    pub fragment_id: u16,
    pub data: Bytes,
}

impl DataSegment {
    fn ser(&self, buf: &mut BytesMut) {
        debug_assert!(self.data.len() <= u16::MAX as usize);

        buf.put_u8(SegmentType::Data.into());
        buf.put_u16(self.data.len() as u16);
        buf.put_u32(self.stream_id);
        buf.put_u32(0);
        buf.put_u16(self.fragment_id);
        buf.put_slice(&self.data);
    }
}

pub(crate) const OFFSET_CHECKSUM: usize = 7;
const HEADER_LEN: usize = 11;

/// Serializes a segment into a fresh buffer.
pub fn emit_segment(segment: &Segment) -> BytesMut {
    let mut buf = BytesMut::with_capacity(HEADER_LEN + 2);
    segment.ser(&mut buf);
    buf
}

/// Parses one datagram. Anything that cannot be a well-formed segment -
///  unknown tag, bad checksum, truncated or inconsistent body - is logged and
///  dropped; the peer's retransmission is what recovers the data.
pub fn parse_segment(raw: &[u8]) -> Option<Segment> {
    match try_parse_segment(raw) {
        Ok(segment) => Some(segment),
        Err(e) => {
            warn!("dropping segment: {}", e);
            None
        }
    }
}

fn try_parse_segment(raw: &[u8]) -> anyhow::Result<Segment> {
    let buf = &mut &raw[..];

    let type_tag = buf.try_get_u8()?;
    let segment_type = SegmentType::try_from_primitive(type_tag)
        .map_err(|_| anyhow!("unknown segment type {}", type_tag))?;
    let length = buf.try_get_u16()? as usize;
    let stream_id = buf.try_get_u32()?;
    let checksum = buf.try_get_u32()?;
    if checksum != checksum_of(raw) {
        bail!("corrupted {:?} segment on stream {} (checksum mismatch)", segment_type, stream_id);
    }

    // message id, or the fragment id for Data - same slot on the wire
    let id = buf.try_get_u16()?;

    let segment = match segment_type {
        SegmentType::Data => Segment::Data(DataSegment {
            stream_id,
            fragment_id: id,
            data: take_bytes(buf, length)?,
        }),
        SegmentType::Init => msg(stream_id, id, MessageKind::Init),
        SegmentType::Fin => msg(stream_id, id, MessageKind::Fin),
        SegmentType::Ok => msg(stream_id, id, MessageKind::Ok),
        SegmentType::Accept => msg(stream_id, id, MessageKind::Accept),
        SegmentType::Done => msg(stream_id, id, MessageKind::Done),
        SegmentType::Ping => msg(stream_id, id, MessageKind::Ping),
        SegmentType::Text => msg(stream_id, id, MessageKind::Text(take_string(buf, length)?)),
        SegmentType::File => {
            let path_len = length.checked_sub(2)
                .ok_or_else(|| anyhow!("file offer with length {} (minimum is 2)", length))?;
            let size = buf.try_get_u16()?;
            msg(stream_id, id, MessageKind::File { path: take_string(buf, path_len)?, size })
        }
        SegmentType::Next => {
            if length % 2 != 0 {
                bail!("selective-ack report with odd length {}", length);
            }
            let mut fragments = Vec::with_capacity(length / 2);
            for _ in 0..length / 2 {
                fragments.push(buf.try_get_u16()?);
            }
            msg(stream_id, id, MessageKind::Next(fragments))
        }
    };
    Ok(segment)
}

fn msg(stream_id: u32, message_id: u16, kind: MessageKind) -> Segment {
    Segment::Message(Message { stream_id, message_id, kind })
}

fn take_bytes(buf: &mut impl Buf, len: usize) -> anyhow::Result<Bytes> {
    if buf.remaining() < len {
        bail!("segment body shorter than its length field");
    }
    Ok(buf.copy_to_bytes(len))
}

fn take_string(buf: &mut impl Buf, len: usize) -> anyhow::Result<String> {
    let raw = take_bytes(buf, len)?;
    String::from_utf8(raw.into())
        .map_err(|_| anyhow!("string payload with invalid UTF-8"))
}

/// The checksum covers the whole serialized segment with the checksum field
///  itself treated as zero, identically on emit and parse.
fn checksum_of(serialized: &[u8]) -> u32 {
    let crc = Crc::<u32>::new(&crc::CRC_32_ISO_HDLC);
    let mut digest = crc.digest();
    digest.update(&serialized[..OFFSET_CHECKSUM]);
    digest.update(&[0u8; 4]);
    digest.update(&serialized[OFFSET_CHECKSUM + 4..]);
    digest.finalize()
}

fn patch_checksum(serialized: &mut [u8], checksum: u32) {
    serialized[OFFSET_CHECKSUM..OFFSET_CHECKSUM + 4].copy_from_slice(&checksum.to_be_bytes());
}

const PRINTABLE_PAYLOAD_LIMIT: usize = 50;
const PRINTABLE_PREVIEW_LEN: usize = 10;

impl Display for Segment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Segment::Message(message) => message.fmt(f),
            Segment::Data(data) => data.fmt(f),
        }
    }
}

impl Display for Message {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}(stream={}, id={}", self.kind.segment_type(), self.stream_id, self.message_id)?;
        match &self.kind {
            MessageKind::Text(text) => write!(f, ", {:?}", text)?,
            MessageKind::File { path, size } => write!(f, ", path={:?}, size={}", path, size)?,
            MessageKind::Next(fragments) => write!(f, ", acks={:?}", fragments)?,
            _ => {}
        }
        write!(f, ")")
    }
}

impl Display for DataSegment {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        if self.data.len() > PRINTABLE_PAYLOAD_LIMIT {
            write!(f, "Data(stream={}, fragment={}, {} bytes, {:?}..)",
                   self.stream_id, self.fragment_id, self.data.len(), &self.data[..PRINTABLE_PREVIEW_LEN])
        }
        else {
            write!(f, "Data(stream={}, fragment={}, {} bytes, {:?})",
                   self.stream_id, self.fragment_id, self.data.len(), &self.data[..])
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::init(msg(0, 0, MessageKind::Init))]
    #[case::fin(msg(4, 17, MessageKind::Fin))]
    #[case::ok(msg(1, 1, MessageKind::Ok))]
    #[case::text(msg(3, 2, MessageKind::Text("hello, world".to_string())))]
    #[case::text_umlaut(msg(3, 2, MessageKind::Text("grüße".to_string())))]
    #[case::file(msg(2, 0, MessageKind::File { path: "out/archive.bin".to_string(), size: 40_000 }))]
    #[case::accept(msg(2, 1, MessageKind::Accept))]
    #[case::done(msg(2, 2, MessageKind::Done))]
    #[case::next_empty(msg(2, 3, MessageKind::Next(vec![])))]
    #[case::next(msg(2, 3, MessageKind::Next(vec![0, 5, 3, 1])))]
    #[case::ping(msg(6, 0, MessageKind::Ping))]
    #[case::data(Segment::Data(DataSegment { stream_id: 2, fragment_id: 9, data: Bytes::from_static(b"abcdef") }))]
    #[case::data_empty(Segment::Data(DataSegment { stream_id: 2, fragment_id: 0, data: Bytes::new() }))]
    fn test_ser_parse_round_trip(#[case] segment: Segment) {
        let buf = emit_segment(&segment);
        assert_eq!(parse_segment(&buf), Some(segment));
    }

    #[test]
    fn test_ser_layout_message() {
        let buf = emit_segment(&msg(3, 7, MessageKind::Init));

        let mut expected = vec![
            1,          // type tag
            0, 0,       // length: Init has no body
            0, 0, 0, 3, // stream id
            0, 0, 0, 0, // checksum placeholder
            0, 7,       // message id
        ];
        let checksum = checksum_of(&expected);
        patch_checksum(&mut expected, checksum);

        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_ser_layout_data_length_excludes_fragment_id() {
        let buf = emit_segment(&Segment::Data(DataSegment {
            stream_id: 260,
            fragment_id: 513,
            data: Bytes::from_static(b"xyz"),
        }));

        let mut expected = vec![
            7,            // type tag
            0, 3,         // length: payload only
            0, 0, 1, 4,   // stream id 260
            0, 0, 0, 0,   // checksum placeholder
            2, 1,         // fragment id 513
            b'x', b'y', b'z',
        ];
        let checksum = checksum_of(&expected);
        patch_checksum(&mut expected, checksum);

        assert_eq!(buf.as_ref(), expected.as_slice());
    }

    #[test]
    fn test_ser_layout_file_length_includes_size_field() {
        let buf = emit_segment(&msg(0, 0, MessageKind::File { path: "a.txt".to_string(), size: 9 }));
        // length = 5 path bytes + 2 size bytes
        assert_eq!(buf[1..3], [0, 7]);
        assert_eq!(buf[11..13], [0, 9]);
        assert_eq!(&buf[13..], b"a.txt".as_slice());
    }

    #[test]
    fn test_ser_layout_next_length() {
        let buf = emit_segment(&msg(0, 4, MessageKind::Next(vec![1, 2, 3])));
        assert_eq!(buf[1..3], [0, 6]);
    }

    #[rstest]
    #[case::checksum_byte(7)]
    #[case::payload_byte(13)]
    fn test_parse_rejects_flipped_bit(#[case] offset: usize) {
        let mut buf = emit_segment(&msg(1, 0, MessageKind::Text("hi".to_string())));
        buf[offset] ^= 0x01;
        assert_eq!(parse_segment(&buf), None);
    }

    #[test]
    fn test_parse_rejects_unknown_type_tag() {
        let mut buf = emit_segment(&msg(1, 0, MessageKind::Init));
        buf[0] = 42;
        let checksum = checksum_of(&buf);
        patch_checksum(&mut buf, checksum);
        assert_eq!(parse_segment(&buf), None);
    }

    #[test]
    fn test_parse_rejects_truncated_buffers() {
        let buf = emit_segment(&msg(1, 0, MessageKind::Text("hello".to_string())));
        for len in 0..buf.len() {
            assert_eq!(parse_segment(&buf[..len]), None, "prefix of {} bytes", len);
        }
    }

    #[test]
    fn test_parse_rejects_file_offer_without_size_field() {
        // handcrafted File segment whose length field (1) cannot hold the size field
        let mut buf = vec![
            5,
            0, 1,
            0, 0, 0, 0,
            0, 0, 0, 0,
            0, 0,
            b'x',
        ];
        let checksum = checksum_of(&buf);
        patch_checksum(&mut buf, checksum);
        assert_eq!(parse_segment(&buf), None);
    }

    #[test]
    fn test_parse_rejects_odd_ack_report_length() {
        let mut buf = vec![
            9,
            0, 3,
            0, 0, 0, 0,
            0, 0, 0, 0,
            0, 0,
            0, 1, 2,
        ];
        let checksum = checksum_of(&buf);
        patch_checksum(&mut buf, checksum);
        assert_eq!(parse_segment(&buf), None);
    }

    #[test]
    fn test_parse_rejects_invalid_utf8_text() {
        let mut buf = vec![
            4,
            0, 2,
            0, 0, 0, 0,
            0, 0, 0, 0,
            0, 0,
            0xff, 0xfe,
        ];
        let checksum = checksum_of(&buf);
        patch_checksum(&mut buf, checksum);
        assert_eq!(parse_segment(&buf), None);
    }

    #[test]
    fn test_printable_truncates_long_payloads() {
        let rendered = Segment::Data(DataSegment {
            stream_id: 1,
            fragment_id: 2,
            data: Bytes::from(vec![7u8; 60]),
        }).to_string();
        assert!(rendered.contains("60 bytes"));
        assert!(rendered.ends_with("..)"));
        assert!(rendered.len() < 120);
    }

    #[test]
    fn test_printable_keeps_short_payloads() {
        let rendered = Segment::Data(DataSegment {
            stream_id: 1,
            fragment_id: 2,
            data: Bytes::from_static(b"ab"),
        }).to_string();
        assert_eq!(rendered, "Data(stream=1, fragment=2, 2 bytes, [97, 98])");
    }

    #[test]
    fn test_printable_message() {
        assert_eq!(msg(3, 7, MessageKind::Init).to_string(), "Init(stream=3, id=7)");
        assert_eq!(
            msg(1, 2, MessageKind::Text("hi".to_string())).to_string(),
            "Text(stream=1, id=2, \"hi\")"
        );
        assert_eq!(
            msg(2, 5, MessageKind::Next(vec![1, 4])).to_string(),
            "Next(stream=2, id=5, acks=[1, 4])"
        );
    }
}
