use anyhow::bail;
use bytes::{BufMut, BytesMut};

/// Upper bound for the encoded size of a single frame. Anything bigger is not a frame,
///  neither incoming nor outgoing.
pub const MAX_FRAME_LEN: usize = 999;

/// Largest legal value for the numeric fields (session id, position, length): 2^31 - 1.
pub const MAX_NUMERIC: u32 = 2_147_483_647;

/// One parsed protocol message. Frames are transient: they carry no identity beyond
///  their field values, and a frame is always carried in exactly one datagram.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Frame {
    Connect { session: u32 },
    Data { session: u32, pos: u32, payload: Vec<u8> },
    Ack { session: u32, length: u32 },
    Close { session: u32 },
}

impl Frame {
    pub fn session(&self) -> u32 {
        match self {
            Frame::Connect { session }
            | Frame::Data { session, .. }
            | Frame::Ack { session, .. }
            | Frame::Close { session } => *session,
        }
    }

    /// Checks the numeric wire bounds. Frames assembled from parsed input always pass;
    ///  locally built frames are checked before they are handed to the socket.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.session() > MAX_NUMERIC {
            bail!("session id {} is out of range", self.session());
        }
        match self {
            Frame::Data { pos, payload, .. } => {
                if *pos > MAX_NUMERIC {
                    bail!("position {} is out of range", pos);
                }
                let total = *pos as u64 + payload.len() as u64;
                if total > MAX_NUMERIC as u64 {
                    bail!("total stream length {} is out of range", total);
                }
            }
            Frame::Ack { length, .. } => {
                if *length > MAX_NUMERIC {
                    bail!("length {} is out of range", length);
                }
            }
            Frame::Connect { .. } | Frame::Close { .. } => {}
        }
        Ok(())
    }

    pub fn encode_into(&self, out: &mut BytesMut) {
        match self {
            Frame::Connect { session } => {
                out.put_slice(format!("/connect/{}/", session).as_bytes());
            }
            Frame::Ack { session, length } => {
                out.put_slice(format!("/ack/{}/{}/", session, length).as_bytes());
            }
            Frame::Close { session } => {
                out.put_slice(format!("/close/{}/", session).as_bytes());
            }
            Frame::Data { session, pos, payload } => {
                out.put_slice(format!("/data/{}/{}/", session, pos).as_bytes());
                escape_into(payload, out);
                out.put_u8(b'/');
            }
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = BytesMut::with_capacity(MAX_FRAME_LEN);
        self.encode_into(&mut buf);
        buf.to_vec()
    }
}

/// Parses a full datagram payload into a frame. Everything that fails here is dropped
///  silently by the caller - an unparseable datagram never gets a response.
pub fn parse_frame(raw: &[u8]) -> anyhow::Result<Frame> {
    if raw.is_empty() {
        bail!("empty datagram");
    }
    if raw.len() > MAX_FRAME_LEN {
        bail!("datagram of {} bytes exceeds the frame size bound", raw.len());
    }
    if raw[0] != b'/' {
        bail!("missing leading slash");
    }

    let mut fields = Fields::new(&raw[1..]);
    let frame = match fields.next_raw()? {
        b"connect" => Frame::Connect {
            session: parse_numeric(fields.next_raw()?)?,
        },
        b"data" => Frame::Data {
            session: parse_numeric(fields.next_raw()?)?,
            pos: parse_numeric(fields.next_raw()?)?,
            payload: unescape(fields.next_raw()?)?,
        },
        b"ack" => Frame::Ack {
            session: parse_numeric(fields.next_raw()?)?,
            length: parse_numeric(fields.next_raw()?)?,
        },
        b"close" => Frame::Close {
            session: parse_numeric(fields.next_raw()?)?,
        },
        other => bail!("unknown frame type {:?}", String::from_utf8_lossy(other)),
    };
    fields.expect_end()?;
    frame.validate()?;
    Ok(frame)
}

/// Packs as many bytes of `stream` as fit into a single data frame at offset `pos`,
///  accounting for escape expansion: a byte whose two-byte escape would push the encoded
///  frame past the size bound ends the frame one byte early.
///
/// Returns the number of *source* bytes consumed; the frame's payload holds exactly
///  those bytes, unescaped. The encoded size and the consumed count are deliberately
///  decoupled.
pub fn pack_data(session: u32, pos: u32, stream: &[u8]) -> (usize, Frame) {
    // encoded framing around the payload: "/data/" + session + "/" + pos + "/" ... "/"
    let overhead = 9 + decimal_digits(session) + decimal_digits(pos);
    let budget = MAX_FRAME_LEN.saturating_sub(overhead);

    let mut encoded_len = 0;
    let mut consumed = 0;
    for &b in stream {
        let cost = if b == b'/' || b == b'\\' { 2 } else { 1 };
        if encoded_len + cost > budget {
            break;
        }
        encoded_len += cost;
        consumed += 1;
    }

    let frame = Frame::Data {
        session,
        pos,
        payload: stream[..consumed].to_vec(),
    };
    (consumed, frame)
}

struct Fields<'a> {
    rest: &'a [u8],
}

impl<'a> Fields<'a> {
    fn new(rest: &'a [u8]) -> Fields<'a> {
        Fields { rest }
    }

    /// The raw bytes up to the next unescaped `/`, escape sequences left intact. A `\`
    ///  always consumes the byte after it, so an escaped backslash never hides the
    ///  field terminator.
    fn next_raw(&mut self) -> anyhow::Result<&'a [u8]> {
        let mut i = 0;
        while i < self.rest.len() {
            match self.rest[i] {
                b'/' => {
                    let field = &self.rest[..i];
                    self.rest = &self.rest[i + 1..];
                    return Ok(field);
                }
                b'\\' => i += 2,
                _ => i += 1,
            }
        }
        bail!("unterminated field");
    }

    fn expect_end(&self) -> anyhow::Result<()> {
        if !self.rest.is_empty() {
            bail!("{} trailing bytes after the final slash", self.rest.len());
        }
        Ok(())
    }
}

fn parse_numeric(field: &[u8]) -> anyhow::Result<u32> {
    if field.is_empty() {
        bail!("empty numeric field");
    }
    if field.len() > 10 {
        bail!("numeric field of {} digits is out of range", field.len());
    }
    let mut value: u64 = 0;
    for &b in field {
        if !b.is_ascii_digit() {
            bail!("byte {:#04x} in numeric field is not a digit", b);
        }
        value = value * 10 + (b - b'0') as u64;
    }
    if value > MAX_NUMERIC as u64 {
        bail!("numeric value {} is out of range", value);
    }
    Ok(value as u32)
}

/// Resolves the escape sequences of a data payload into a fresh buffer. Fails on an
///  unescaped `/`, and on a `\` followed by anything other than `/` or `\`.
fn unescape(field: &[u8]) -> anyhow::Result<Vec<u8>> {
    let mut out = Vec::with_capacity(field.len());
    let mut i = 0;
    while i < field.len() {
        match field[i] {
            b'\\' => match field.get(i + 1) {
                Some(&b @ (b'/' | b'\\')) => {
                    out.push(b);
                    i += 2;
                }
                Some(&b) => bail!("illegal escape sequence over byte {:#04x}", b),
                None => bail!("dangling escape at the end of the payload"),
            },
            b'/' => bail!("unescaped slash at position {} in payload", i),
            b => {
                out.push(b);
                i += 1;
            }
        }
    }
    Ok(out)
}

fn escape_into(payload: &[u8], out: &mut BytesMut) {
    for &b in payload {
        if b == b'/' || b == b'\\' {
            out.put_u8(b'\\');
        }
        out.put_u8(b);
    }
}

fn decimal_digits(mut value: u32) -> usize {
    let mut digits = 1;
    while value >= 10 {
        value /= 10;
        digits += 1;
    }
    digits
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::connect(b"/connect/1234567/".to_vec(), Frame::Connect { session: 1234567 })]
    #[case::connect_zero(b"/connect/0/".to_vec(), Frame::Connect { session: 0 })]
    #[case::connect_max(b"/connect/2147483647/".to_vec(), Frame::Connect { session: 2147483647 })]
    #[case::close(b"/close/55/".to_vec(), Frame::Close { session: 55 })]
    #[case::ack(b"/ack/1234/1024/".to_vec(), Frame::Ack { session: 1234, length: 1024 })]
    #[case::data(b"/data/123/0/hello/".to_vec(), Frame::Data { session: 123, pos: 0, payload: b"hello".to_vec() })]
    #[case::data_empty(b"/data/9/0//".to_vec(), Frame::Data { session: 9, pos: 0, payload: vec![] })]
    #[case::data_escaped_slash(br"/data/9/0/a\/b/".to_vec(), Frame::Data { session: 9, pos: 0, payload: b"a/b".to_vec() })]
    #[case::data_escaped_backslash(br"/data/9/0/a\\b/".to_vec(), Frame::Data { session: 9, pos: 0, payload: br"a\b".to_vec() })]
    #[case::data_escaped_backslash_at_end(br"/data/9/0/ab\\/".to_vec(), Frame::Data { session: 9, pos: 0, payload: br"ab\".to_vec() })]
    #[case::data_mixed_escapes(b"/data/9/0/a\\/b\\\\c\n/".to_vec(), Frame::Data { session: 9, pos: 0, payload: b"a/b\\c\n".to_vec() })]
    #[case::data_binary(b"/data/7/3/\x01\x02\xff/".to_vec(), Frame::Data { session: 7, pos: 3, payload: vec![1, 2, 255] })]
    fn test_parse_frame(#[case] raw: Vec<u8>, #[case] expected: Frame) {
        assert_eq!(parse_frame(&raw).unwrap(), expected);
    }

    #[rstest]
    #[case::empty(b"".to_vec())]
    #[case::no_leading_slash(b"connect/123/".to_vec())]
    #[case::unknown_type(b"/shutdown/123/".to_vec())]
    #[case::type_case_sensitive(b"/Connect/123/".to_vec())]
    #[case::missing_terminator(b"/connect/123".to_vec())]
    #[case::missing_session(b"/connect/".to_vec())]
    #[case::trailing_bytes(b"/connect/123/x".to_vec())]
    #[case::trailing_slash(b"/connect/123//".to_vec())]
    #[case::signed_session(b"/connect/+123/".to_vec())]
    #[case::negative_session(b"/connect/-1/".to_vec())]
    #[case::session_too_large(b"/connect/2147483648/".to_vec())]
    #[case::session_way_too_large(b"/connect/99999999999999999999/".to_vec())]
    #[case::session_not_numeric(b"/connect/abc/".to_vec())]
    #[case::connect_extra_field(b"/connect/123/456/".to_vec())]
    #[case::ack_missing_length(b"/ack/123/".to_vec())]
    #[case::data_missing_payload(b"/data/123/0/".to_vec())]
    #[case::data_unescaped_slash_is_extra_field(b"/data/123/0/a/b/".to_vec())]
    #[case::data_dangling_escape(b"/data/123/0/ab\\/".to_vec())]
    #[case::data_illegal_escape(br"/data/123/0/a\nb/".to_vec())]
    #[case::data_overflowing_stream(b"/data/123/2147483647/x/".to_vec())]
    #[case::escaped_slash_in_numeric_field(br"/connect/1\/2/".to_vec())]
    fn test_parse_frame_rejects(#[case] raw: Vec<u8>) {
        assert!(parse_frame(&raw).is_err(), "{:?}", String::from_utf8_lossy(&raw));
    }

    #[test]
    fn test_parse_frame_rejects_oversized_datagram() {
        let mut raw = b"/data/1/0/".to_vec();
        raw.resize(MAX_FRAME_LEN, b'x');
        raw.push(b'/');
        assert_eq!(raw.len(), 1000);
        assert!(parse_frame(&raw).is_err());
    }

    #[rstest]
    #[case::connect(Frame::Connect { session: 1234 }, b"/connect/1234/".to_vec())]
    #[case::ack(Frame::Ack { session: 1234, length: 0 }, b"/ack/1234/0/".to_vec())]
    #[case::close(Frame::Close { session: 7 }, b"/close/7/".to_vec())]
    #[case::data(Frame::Data { session: 1234, pos: 0, payload: b"abc".to_vec() }, b"/data/1234/0/abc/".to_vec())]
    #[case::data_escapes(Frame::Data { session: 9, pos: 0, payload: b"a/b\\c".to_vec() }, b"/data/9/0/a\\/b\\\\c/".to_vec())]
    #[case::data_empty(Frame::Data { session: 9, pos: 5, payload: vec![] }, b"/data/9/5//".to_vec())]
    fn test_encode(#[case] frame: Frame, #[case] expected: Vec<u8>) {
        assert_eq!(frame.encode(), expected);
    }

    #[rstest]
    #[case::connect(Frame::Connect { session: 42 })]
    #[case::ack(Frame::Ack { session: 42, length: 17 })]
    #[case::close(Frame::Close { session: 0 })]
    #[case::data(Frame::Data { session: 42, pos: 99, payload: b"a/b\\c\nd".to_vec() })]
    #[case::data_only_escapes(Frame::Data { session: 1, pos: 0, payload: b"//\\\\".to_vec() })]
    fn test_encode_parse_round_trip(#[case] frame: Frame) {
        assert_eq!(parse_frame(&frame.encode()).unwrap(), frame);
    }

    #[rstest]
    #[case::session_out_of_range(Frame::Connect { session: u32::MAX })]
    #[case::length_out_of_range(Frame::Ack { session: 1, length: 2_147_483_648 })]
    #[case::stream_end_out_of_range(Frame::Data { session: 1, pos: 2_147_483_640, payload: vec![0; 8] })]
    fn test_validate_rejects(#[case] frame: Frame) {
        assert!(frame.validate().is_err());
    }

    #[test]
    fn test_validate_accepts_stream_end_at_bound() {
        let frame = Frame::Data { session: 1, pos: 2_147_483_640, payload: vec![0; 7] };
        assert!(frame.validate().is_ok());
    }

    #[rstest]
    #[case::empty(1234, 0, vec![], 0, vec![])]
    #[case::single_byte(1234, 0, vec![1], 1, vec![1])]
    #[case::all_fits(1234, 56, b"hello".to_vec(), 5, b"hello".to_vec())]
    // framing overhead is 9 bytes plus the digits of session and pos
    #[case::fills_the_budget(1234, 56, vec![b'a'; 1200], 999 - 9 - 4 - 2, vec![b'a'; 999 - 9 - 4 - 2])]
    #[case::greatest_metadata(2147483647, 2147483647, vec![b'a'; 1200], 999 - 9 - 20, vec![b'a'; 999 - 9 - 20])]
    #[case::slashes_count_double(1234, 56, br"abc/def/ghi\jkl\mno".to_vec(), 19, br"abc/def/ghi\jkl\mno".to_vec())]
    fn test_pack_data(
        #[case] session: u32,
        #[case] pos: u32,
        #[case] stream: Vec<u8>,
        #[case] expected_consumed: usize,
        #[case] expected_payload: Vec<u8>,
    ) {
        let (consumed, frame) = pack_data(session, pos, &stream);
        assert_eq!(consumed, expected_consumed);
        assert_eq!(frame, Frame::Data { session, pos, payload: expected_payload });
        assert!(frame.encode().len() <= MAX_FRAME_LEN);
    }

    #[test]
    fn test_pack_data_drops_final_byte_whose_escape_would_overflow() {
        // session 1234 / pos 56: room for 984 plain bytes. Fill all but the last slot,
        // then offer a slash - its two-byte escape must not be squeezed in.
        let mut stream = vec![b'a'; 999 - 9 - 4 - 2 - 1];
        stream.push(b'/');
        let (consumed, frame) = pack_data(1234, 56, &stream);
        assert_eq!(consumed, 999 - 9 - 4 - 2 - 1);
        assert_eq!(frame.encode().len(), MAX_FRAME_LEN - 1);
    }

    #[test]
    fn test_pack_data_escape_exactly_at_the_boundary() {
        // leave exactly two bytes of budget so a final escaped byte still fits
        let mut stream = vec![b'a'; 999 - 9 - 4 - 2 - 2];
        stream.push(b'\\');
        let (consumed, frame) = pack_data(1234, 56, &stream);
        assert_eq!(consumed, stream.len());
        assert_eq!(frame.encode().len(), MAX_FRAME_LEN);
    }

    #[test]
    fn test_packed_frame_round_trips() {
        let stream: Vec<u8> = (0..=255u8).cycle().take(2000).collect();
        let (consumed, frame) = pack_data(77, 1000, &stream);
        assert!(consumed > 0 && consumed < stream.len());
        assert_eq!(parse_frame(&frame.encode()).unwrap(), frame);
    }
}
