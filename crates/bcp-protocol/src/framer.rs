//! Byte-stream reassembly.
//!
//! `BcpFramer` implements `tokio_util::codec::{Decoder, Encoder}` so a peer
//! socket can be driven through `Framed`. Each frame is one `\n`-terminated
//! header line, optionally followed by a binary payload whose length is
//! declared by a trailing `&bytes=<N>` in the header. The payload bytes are
//! consumed off the stream before the next header starts.
//!
//! The `&bytes=` sentinel is recognized anywhere in the header (split at its
//! last occurrence), matching the wire behavior media controllers rely on.

use crate::codec::CodecError;
use bytes::{Buf, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

const PAYLOAD_MARKER: &[u8] = b"&bytes=";

/// One reassembled message: the header line (without terminator or the
/// `&bytes=N` suffix) plus the binary payload, if one was declared.
#[derive(Debug, Clone, PartialEq)]
pub struct RawFrame {
    pub line: String,
    pub payload: Option<Bytes>,
}

impl RawFrame {
    pub fn line(line: impl Into<String>) -> RawFrame {
        RawFrame {
            line: line.into(),
            payload: None,
        }
    }
}

/// Stateless frame codec; all reassembly state lives in the `BytesMut`
/// read buffer owned by `Framed`.
#[derive(Debug, Default)]
pub struct BcpFramer;

impl Decoder for BcpFramer {
    type Item = RawFrame;
    type Error = CodecError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, CodecError> {
        let Some(newline) = src.iter().position(|&b| b == b'\n') else {
            return Ok(None);
        };
        let header = &src[..newline];

        let Some(marker) = rfind(header, PAYLOAD_MARKER) else {
            let mut head = src.split_to(newline + 1);
            head.truncate(newline);
            return Ok(Some(RawFrame {
                line: header_to_string(&head)?,
                payload: None,
            }));
        };

        let count = &header[marker + PAYLOAD_MARKER.len()..];
        let Some(needed) = parse_payload_len(count) else {
            // Unparseable length: drop the whole header and resynchronize at
            // the next newline.
            let raw = String::from_utf8_lossy(header).into_owned();
            src.advance(newline + 1);
            return Err(CodecError::PayloadLength(raw));
        };

        if src.len() < newline + 1 + needed {
            // Payload not fully arrived; put everything back and wait.
            src.reserve(newline + 1 + needed - src.len());
            return Ok(None);
        }

        let mut head = src.split_to(newline + 1);
        head.truncate(marker);
        let payload = src.split_to(needed).freeze();
        Ok(Some(RawFrame {
            line: header_to_string(&head)?,
            payload: Some(payload),
        }))
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<RawFrame>, CodecError> {
        match self.decode(src)? {
            Some(frame) => Ok(Some(frame)),
            None => {
                // A partial header at EOF carries nothing recoverable.
                src.clear();
                Ok(None)
            }
        }
    }
}

impl Encoder<String> for BcpFramer {
    type Error = CodecError;

    fn encode(&mut self, line: String, dst: &mut BytesMut) -> Result<(), CodecError> {
        debug_assert!(!line.contains('\n'), "header lines must be newline-free");
        dst.reserve(line.len() + 1);
        dst.extend_from_slice(line.as_bytes());
        dst.extend_from_slice(b"\n");
        Ok(())
    }
}

fn header_to_string(head: &[u8]) -> Result<String, CodecError> {
    std::str::from_utf8(head)
        .map(str::to_owned)
        .map_err(|_| CodecError::HeaderUtf8)
}

fn rfind(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    if haystack.len() < needle.len() {
        return None;
    }
    haystack
        .windows(needle.len())
        .rposition(|window| window == needle)
}

fn parse_payload_len(count: &[u8]) -> Option<usize> {
    std::str::from_utf8(count).ok()?.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Drain every frame currently decodable from the buffer.
    fn drain(framer: &mut BcpFramer, buf: &mut BytesMut) -> Vec<RawFrame> {
        let mut frames = Vec::new();
        while let Some(frame) = framer.decode(buf).expect("decode") {
            frames.push(frame);
        }
        frames
    }

    #[test]
    fn splits_consecutive_lines() {
        let mut buf = BytesMut::from(&b"trigger?name=x\nswitch?name=s&state=int:1\n"[..]);
        let frames = drain(&mut BcpFramer, &mut buf);
        assert_eq!(
            frames,
            vec![
                RawFrame::line("trigger?name=x"),
                RawFrame::line("switch?name=s&state=int:1"),
            ]
        );
        assert!(buf.is_empty());
    }

    #[test]
    fn extracts_binary_payload_exactly() {
        let mut buf = BytesMut::from(&b"dmd_frame?&bytes=4\nABCDmode_start?name=attract\n"[..]);
        let frames = drain(&mut BcpFramer, &mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].line, "dmd_frame?");
        assert_eq!(frames[0].payload.as_deref(), Some(&b"ABCD"[..]));
        assert_eq!(frames[1], RawFrame::line("mode_start?name=attract"));
    }

    #[test]
    fn waits_for_full_payload() {
        let mut framer = BcpFramer;
        let mut buf = BytesMut::from(&b"dmd_frame?&bytes=6\nABC"[..]);
        assert!(framer.decode(&mut buf).unwrap().is_none());
        buf.extend_from_slice(b"DEF");
        let frame = framer.decode(&mut buf).unwrap().expect("complete frame");
        assert_eq!(frame.payload.as_deref(), Some(&b"ABCDEF"[..]));
    }

    #[test]
    fn byte_at_a_time_matches_whole_stream() {
        let stream = b"a?x=1\ndmd_frame?&bytes=3\n\x01\x02\x03b\nc?k=v\n";

        let mut whole = BytesMut::from(&stream[..]);
        let expected = drain(&mut BcpFramer, &mut whole);

        let mut framer = BcpFramer;
        let mut buf = BytesMut::new();
        let mut trickled = Vec::new();
        for &byte in stream {
            buf.extend_from_slice(&[byte]);
            trickled.extend(drain(&mut framer, &mut buf));
        }
        assert_eq!(trickled, expected);
        assert_eq!(trickled.len(), 4);
    }

    #[test]
    fn payload_bytes_do_not_leak_into_next_header() {
        // The payload itself contains a newline and a fake header.
        let mut buf = BytesMut::from(&b"f?&bytes=8\nx\ny?z=1\nnext\n"[..]);
        let frames = drain(&mut BcpFramer, &mut buf);
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].payload.as_deref(), Some(&b"x\ny?z=1\n"[..]));
        assert_eq!(frames[1], RawFrame::line("next"));
    }

    #[test]
    fn marker_is_split_at_last_occurrence() {
        let mut buf = BytesMut::from(&b"f?a=&bytes=zzz&bytes=2\nhi\n"[..]);
        let frames = drain(&mut BcpFramer, &mut buf);
        assert_eq!(frames[0].line, "f?a=&bytes=zzz");
        assert_eq!(frames[0].payload.as_deref(), Some(&b"hi"[..]));
    }

    #[test]
    fn empty_header_is_surfaced_not_swallowed() {
        let mut buf = BytesMut::from(&b"\nreal?k=v\n"[..]);
        let frames = drain(&mut BcpFramer, &mut buf);
        assert_eq!(frames[0], RawFrame::line(""));
        assert_eq!(frames[1], RawFrame::line("real?k=v"));
    }

    #[test]
    fn bad_payload_length_drops_header_and_resynchronizes() {
        let mut framer = BcpFramer;
        let mut buf = BytesMut::from(&b"f?&bytes=abc\nok?k=v\n"[..]);
        assert!(matches!(
            framer.decode(&mut buf),
            Err(CodecError::PayloadLength(_))
        ));
        let frame = framer.decode(&mut buf).unwrap().expect("next frame");
        assert_eq!(frame, RawFrame::line("ok?k=v"));
    }

    #[test]
    fn partial_header_is_discarded_at_eof() {
        let mut framer = BcpFramer;
        let mut buf = BytesMut::from(&b"whole?k=v\npartial?x="[..]);
        let frame = framer.decode_eof(&mut buf).unwrap().expect("whole frame");
        assert_eq!(frame, RawFrame::line("whole?k=v"));
        assert!(framer.decode_eof(&mut buf).unwrap().is_none());
        assert!(buf.is_empty());
    }

    #[test]
    fn encoder_appends_newline() {
        let mut framer = BcpFramer;
        let mut buf = BytesMut::new();
        framer.encode("hello?version=1.0".to_owned(), &mut buf).unwrap();
        framer.encode("goodbye".to_owned(), &mut buf).unwrap();
        assert_eq!(&buf[..], b"hello?version=1.0\ngoodbye\n");
    }
}
