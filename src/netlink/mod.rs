// Netlink wire framing for the conntrack subsystem.
//
// Messages are framed with a 16-byte native-endian header (length, type,
// flags, sequence, port id) and 4-byte alignment between messages. Only
// the framing layer lives here; payload interpretation is left to
// downstream decoders.

pub mod conn;
pub mod socket;

use std::ops::Range;

use crate::error::CtError;

pub const NLMSG_HDRLEN: usize = 16;
const NLMSG_ALIGNTO: usize = 4;

// Control message types (linux/netlink.h).
pub const NLMSG_NOOP: u16 = 1;
pub const NLMSG_ERROR: u16 = 2;
pub const NLMSG_DONE: u16 = 3;
pub const NLMSG_OVERRUN: u16 = 4;

// Header flags.
pub const NLM_F_REQUEST: u16 = 0x0001;
pub const NLM_F_MULTI: u16 = 0x0002;
pub const NLM_F_ACK: u16 = 0x0004;
pub const NLM_F_ROOT: u16 = 0x0100;
pub const NLM_F_MATCH: u16 = 0x0200;
pub const NLM_F_DUMP: u16 = NLM_F_ROOT | NLM_F_MATCH;

// Conntrack subsystem (linux/netfilter/nfnetlink.h and
// nfnetlink_conntrack.h).
pub const NFNL_SUBSYS_CTNETLINK: u16 = 1;
pub const IPCTNL_MSG_CT_GET: u16 = 1;
pub const NFNETLINK_V0: u8 = 0;

/// Message type of a conntrack table get/dump request.
pub const CTNETLINK_GET: u16 = (NFNL_SUBSYS_CTNETLINK << 8) | IPCTNL_MSG_CT_GET;

/// Multicast group carrying new-connection events.
pub const CONNTRACK_NEW_GROUP: u32 = 1;

// Namespace id queries over rtnetlink (linux/net_namespace.h).
pub const NETNSA_NSID: u16 = 1;
pub const NETNSA_FD: u16 = 3;

const fn nlmsg_align(len: usize) -> usize {
    (len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1)
}

/// The fixed netlink message header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NlMsgHdr {
    pub len: u32,
    pub ty: u16,
    pub flags: u16,
    pub seq: u32,
    pub pid: u32,
}

impl NlMsgHdr {
    fn parse(buf: &[u8]) -> Self {
        Self {
            len: u32::from_ne_bytes([buf[0], buf[1], buf[2], buf[3]]),
            ty: u16::from_ne_bytes([buf[4], buf[5]]),
            flags: u16::from_ne_bytes([buf[6], buf[7]]),
            seq: u32::from_ne_bytes([buf[8], buf[9], buf[10], buf[11]]),
            pid: u32::from_ne_bytes([buf[12], buf[13], buf[14], buf[15]]),
        }
    }
}

/// A message framed inside a receive buffer; the payload is a range into
/// that buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FramedMessage {
    pub header: NlMsgHdr,
    pub payload: Range<usize>,
}

/// A message owning its payload, used on the request/reply path.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OwnedMessage {
    pub header: NlMsgHdr,
    pub data: Vec<u8>,
}

/// Borrowed view of one framed message inside an event.
#[derive(Debug, Clone, Copy)]
pub struct NetlinkMessage<'a> {
    pub header: NlMsgHdr,
    pub data: &'a [u8],
}

/// A framing defect found while splitting a receive buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum FrameError {
    #[error("message length {len} at offset {offset} out of range")]
    LengthOutOfRange { offset: usize, len: u32 },
    #[error("{remaining} trailing bytes at offset {offset} are too short for a header")]
    Truncated { offset: usize, remaining: usize },
}

/// Split a receive buffer into framed messages.
///
/// Framing defects do not discard the messages parsed before them; the
/// valid prefix and the defect are returned together.
pub fn parse_frames(buf: &[u8]) -> (Vec<FramedMessage>, Option<FrameError>) {
    let mut messages = Vec::new();
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let header = NlMsgHdr::parse(&buf[offset..offset + NLMSG_HDRLEN]);
        let len = header.len as usize;
        if len < NLMSG_HDRLEN || offset + len > buf.len() {
            return (
                messages,
                Some(FrameError::LengthOutOfRange {
                    offset,
                    len: header.len,
                }),
            );
        }
        messages.push(FramedMessage {
            header,
            payload: offset + NLMSG_HDRLEN..offset + len,
        });
        // The final message may omit its trailing padding.
        offset = nlmsg_align(offset + len).min(buf.len());
    }

    let error = if offset < buf.len() {
        Some(FrameError::Truncated {
            offset,
            remaining: buf.len() - offset,
        })
    } else {
        None
    };
    (messages, error)
}

/// Serialize a message as header, payload, and alignment padding. The
/// header length field is computed, not trusted.
pub fn serialize(msg: &OwnedMessage) -> Vec<u8> {
    let len = NLMSG_HDRLEN + msg.data.len();
    let mut out = Vec::with_capacity(nlmsg_align(len));
    out.extend_from_slice(&(len as u32).to_ne_bytes());
    out.extend_from_slice(&msg.header.ty.to_ne_bytes());
    out.extend_from_slice(&msg.header.flags.to_ne_bytes());
    out.extend_from_slice(&msg.header.seq.to_ne_bytes());
    out.extend_from_slice(&msg.header.pid.to_ne_bytes());
    out.extend_from_slice(&msg.data);
    out.resize(nlmsg_align(len), 0);
    out
}

/// Protocol-level sanity check applied to every received message.
///
/// Rejects headers whose declared length disagrees with the framed payload
/// and kernel error frames carrying a nonzero errno. Error frames with a
/// zero code are acknowledgments and pass.
pub fn check_message(header: &NlMsgHdr, payload: &[u8]) -> Result<(), CtError> {
    if header.len as usize != NLMSG_HDRLEN + payload.len() {
        return Err(CtError::Validation(format!(
            "declared length {} does not match framed payload of {} bytes",
            header.len,
            payload.len()
        )));
    }
    if header.ty == NLMSG_ERROR {
        if payload.len() < 4 {
            return Err(CtError::ShortErrorMessage);
        }
        let code = i32::from_ne_bytes([payload[0], payload[1], payload[2], payload[3]]);
        if code != 0 {
            return Err(CtError::Kernel(-code));
        }
    }
    Ok(())
}

/// Validate replies against the request that produced them: no error
/// frames, and sequence/port correlation wherever the request carried
/// nonzero values.
pub fn validate(request: &NlMsgHdr, replies: &[OwnedMessage]) -> Result<(), CtError> {
    for reply in replies {
        if reply.header.ty == NLMSG_ERROR {
            check_message(&reply.header, &reply.data)?;
        }
        if request.seq != 0 && reply.header.seq != request.seq {
            return Err(CtError::Validation(format!(
                "mismatched sequence: request {} reply {}",
                request.seq, reply.header.seq
            )));
        }
        if request.pid != 0 && reply.header.pid != 0 && reply.header.pid != request.pid {
            return Err(CtError::Validation(format!(
                "mismatched port id: request {} reply {}",
                request.pid, reply.header.pid
            )));
        }
    }
    Ok(())
}

/// Encoder for the attribute section of a request payload.
#[derive(Default)]
pub struct AttributeEncoder {
    buf: Vec<u8>,
}

impl AttributeEncoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn u32(&mut self, ty: u16, value: u32) {
        self.buf.extend_from_slice(&8u16.to_ne_bytes());
        self.buf.extend_from_slice(&ty.to_ne_bytes());
        self.buf.extend_from_slice(&value.to_ne_bytes());
    }

    pub fn finish(self) -> Vec<u8> {
        self.buf
    }
}

/// Iterate the attributes of a reply payload as (type, value) pairs.
/// Malformed trailers end the iteration.
pub fn attributes(data: &[u8]) -> AttrIter<'_> {
    AttrIter { data, offset: 0 }
}

pub struct AttrIter<'a> {
    data: &'a [u8],
    offset: usize,
}

impl<'a> Iterator for AttrIter<'a> {
    type Item = (u16, &'a [u8]);

    fn next(&mut self) -> Option<Self::Item> {
        let rest = self.data.get(self.offset..)?;
        if rest.len() < 4 {
            return None;
        }
        let len = u16::from_ne_bytes([rest[0], rest[1]]) as usize;
        let ty = u16::from_ne_bytes([rest[2], rest[3]]);
        if len < 4 || len > rest.len() {
            return None;
        }
        let value = &rest[4..len];
        self.offset += nlmsg_align(len);
        Some((ty, value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(ty: u16, data: &[u8]) -> OwnedMessage {
        OwnedMessage {
            header: NlMsgHdr {
                len: (NLMSG_HDRLEN + data.len()) as u32,
                ty,
                flags: 0,
                seq: 7,
                pid: 99,
            },
            data: data.to_vec(),
        }
    }

    #[test]
    fn roundtrip_two_messages() {
        let mut buf = serialize(&msg(CTNETLINK_GET, b"hello"));
        buf.extend_from_slice(&serialize(&msg(NLMSG_DONE, &[])));

        let (frames, err) = parse_frames(&buf);
        assert!(err.is_none());
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].header.ty, CTNETLINK_GET);
        assert_eq!(&buf[frames[0].payload.clone()], b"hello");
        assert_eq!(frames[1].header.ty, NLMSG_DONE);
        assert!(frames[1].payload.is_empty());
    }

    #[test]
    fn serialize_pads_to_alignment() {
        let bytes = serialize(&msg(1, b"abc"));
        assert_eq!(bytes.len(), 20);
        assert_eq!(bytes[19], 0);
    }

    #[test]
    fn parse_rejects_oversized_length() {
        let mut buf = serialize(&msg(1, b"abcd"));
        // Inflate the declared length past the buffer.
        buf[0..4].copy_from_slice(&64u32.to_ne_bytes());
        let (frames, err) = parse_frames(&buf);
        assert!(frames.is_empty());
        assert!(matches!(err, Some(FrameError::LengthOutOfRange { offset: 0, len: 64 })));
    }

    #[test]
    fn parse_keeps_prefix_before_defect() {
        let mut buf = serialize(&msg(1, b"ok"));
        let mut bad = serialize(&msg(2, b"xx"));
        bad[0..4].copy_from_slice(&3u32.to_ne_bytes());
        let prefix_len = buf.len();
        buf.extend_from_slice(&bad);

        let (frames, err) = parse_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert!(matches!(
            err,
            Some(FrameError::LengthOutOfRange { offset, len: 3 }) if offset == prefix_len
        ));
    }

    #[test]
    fn parse_reports_trailing_garbage() {
        let mut buf = serialize(&msg(1, &[]));
        buf.extend_from_slice(&[1, 2, 3]);
        let (frames, err) = parse_frames(&buf);
        assert_eq!(frames.len(), 1);
        assert!(matches!(err, Some(FrameError::Truncated { remaining: 3, .. })));
    }

    #[test]
    fn check_message_accepts_plain_and_ack() {
        let m = msg(CTNETLINK_GET, b"data");
        assert!(check_message(&m.header, &m.data).is_ok());

        let ack = msg(NLMSG_ERROR, &0i32.to_ne_bytes());
        assert!(check_message(&ack.header, &ack.data).is_ok());
    }

    #[test]
    fn check_message_rejects_error_frame() {
        let nack = msg(NLMSG_ERROR, &(-libc::EPERM).to_ne_bytes());
        match check_message(&nack.header, &nack.data) {
            Err(CtError::Kernel(errno)) => assert_eq!(errno, libc::EPERM),
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn check_message_rejects_short_error_frame() {
        let short = msg(NLMSG_ERROR, &[1, 2]);
        assert!(matches!(
            check_message(&short.header, &short.data),
            Err(CtError::ShortErrorMessage)
        ));
    }

    #[test]
    fn check_message_rejects_length_mismatch() {
        let mut m = msg(CTNETLINK_GET, b"data");
        m.header.len += 8;
        assert!(matches!(
            check_message(&m.header, &m.data),
            Err(CtError::Validation(_))
        ));
    }

    #[test]
    fn validate_checks_correlation() {
        let req = NlMsgHdr {
            seq: 7,
            pid: 99,
            ..Default::default()
        };
        assert!(validate(&req, &[msg(CTNETLINK_GET, b"ok")]).is_ok());

        let mut wrong_seq = msg(CTNETLINK_GET, b"ok");
        wrong_seq.header.seq = 8;
        assert!(validate(&req, &[wrong_seq]).is_err());

        // A zero-sequence request skips the correlation checks.
        let probe = NlMsgHdr::default();
        let mut reply = msg(CTNETLINK_GET, b"ok");
        reply.header.seq = 1234;
        assert!(validate(&probe, &[reply]).is_ok());
    }

    #[test]
    fn validate_rejects_error_reply() {
        let req = NlMsgHdr {
            seq: 7,
            pid: 99,
            ..Default::default()
        };
        let err = msg(NLMSG_ERROR, &(-libc::ENOENT).to_ne_bytes());
        assert!(validate(&req, &[err]).is_err());
    }

    #[test]
    fn attribute_roundtrip() {
        let mut enc = AttributeEncoder::new();
        enc.u32(NETNSA_FD, 42);
        enc.u32(NETNSA_NSID, 0xFFFF_FFFF);
        let buf = enc.finish();

        let attrs: Vec<_> = attributes(&buf).collect();
        assert_eq!(attrs.len(), 2);
        assert_eq!(attrs[0].0, NETNSA_FD);
        assert_eq!(attrs[0].1, &42u32.to_ne_bytes());
        assert_eq!(attrs[1].0, NETNSA_NSID);
    }

    #[test]
    fn attribute_iteration_stops_on_malformed_trailer() {
        let mut enc = AttributeEncoder::new();
        enc.u32(NETNSA_NSID, 5);
        let mut buf = enc.finish();
        buf.extend_from_slice(&[2, 0]);
        assert_eq!(attributes(&buf).count(), 1);
    }

    #[test]
    fn dump_request_type_value() {
        // (subsystem << 8) | message as encoded on the wire.
        assert_eq!(CTNETLINK_GET, 0x0101);
    }
}
