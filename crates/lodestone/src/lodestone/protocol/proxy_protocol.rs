//! HAProxy PROXY protocol.
//!
//! Inbound headers (v1 text or v2 binary) are parsed off the front of a
//! client stream; outbound headers are always v2, with the STREAM transport
//! for Java and DGRAM for Bedrock.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

use thiserror::Error;
use tokio::io::AsyncRead;

use super::java::{CodecError, PacketReader};

const V2_SIGNATURE: [u8; 12] = [
    0x0d, 0x0a, 0x0d, 0x0a, 0x00, 0x0d, 0x0a, 0x51, 0x55, 0x49, 0x54, 0x0a,
];
const V1_PREFIX: &[u8] = b"PROXY ";
/// Longest legal v1 line, CRLF included.
const V1_MAX_LEN: usize = 107;

const CMD_LOCAL: u8 = 0x20;
const CMD_PROXY: u8 = 0x21;

const AF_UNSPEC: u8 = 0x00;
const AF_INET: u8 = 0x10;
const AF_INET6: u8 = 0x20;

const TRANSPORT_STREAM: u8 = 0x01;
const TRANSPORT_DGRAM: u8 = 0x02;

#[derive(Debug, Error)]
pub enum ProxyHeaderError {
    #[error("expected a PROXY protocol header")]
    Missing,
    #[error("malformed v1 header: {0}")]
    V1(&'static str),
    #[error("malformed v2 header: {0}")]
    V2(&'static str),
    #[error("connection closed before PROXY header completed")]
    Eof,
    #[error(transparent)]
    Codec(#[from] CodecError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    Stream,
    Datagram,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyHeader {
    pub version: u8,
    /// `None` for LOCAL / UNKNOWN headers, which carry no usable address.
    pub source: Option<SocketAddr>,
    pub destination: Option<SocketAddr>,
}

/// Parses a header from the front of `buf`.
///
/// `Ok(None)` means `buf` is a valid prefix and more bytes are needed.
pub fn parse(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyHeaderError> {
    if buf.is_empty() {
        return Ok(None);
    }
    let n = buf.len().min(V2_SIGNATURE.len());
    if buf[..n] == V2_SIGNATURE[..n] {
        return parse_v2(buf);
    }
    let n = buf.len().min(V1_PREFIX.len());
    if buf[..n] == V1_PREFIX[..n] {
        return parse_v1(buf);
    }
    Err(ProxyHeaderError::Missing)
}

fn parse_v1(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyHeaderError> {
    let window = &buf[..buf.len().min(V1_MAX_LEN)];
    let Some(end) = window.windows(2).position(|w| w == b"\r\n") else {
        if buf.len() >= V1_MAX_LEN {
            return Err(ProxyHeaderError::V1("line too long"));
        }
        return Ok(None);
    };
    let line = std::str::from_utf8(&buf[..end]).map_err(|_| ProxyHeaderError::V1("not ascii"))?;
    let mut parts = line.split(' ');
    let _proxy = parts.next();
    let family = parts.next().ok_or(ProxyHeaderError::V1("missing family"))?;

    let consumed = end + 2;
    if family == "UNKNOWN" {
        return Ok(Some((
            ProxyHeader {
                version: 1,
                source: None,
                destination: None,
            },
            consumed,
        )));
    }
    if family != "TCP4" && family != "TCP6" {
        return Err(ProxyHeaderError::V1("unknown family"));
    }

    let fields: Vec<&str> = parts.collect();
    let [src_ip, dst_ip, src_port, dst_port] = fields[..] else {
        return Err(ProxyHeaderError::V1("expected four address fields"));
    };
    let parse_ip = |s: &str| -> Result<IpAddr, ProxyHeaderError> {
        let ip: IpAddr = s.parse().map_err(|_| ProxyHeaderError::V1("bad address"))?;
        match (family, ip) {
            ("TCP4", IpAddr::V4(_)) | ("TCP6", IpAddr::V6(_)) => Ok(ip),
            _ => Err(ProxyHeaderError::V1("address does not match family")),
        }
    };
    let parse_port =
        |s: &str| -> Result<u16, ProxyHeaderError> { s.parse().map_err(|_| ProxyHeaderError::V1("bad port")) };

    Ok(Some((
        ProxyHeader {
            version: 1,
            source: Some(SocketAddr::new(parse_ip(src_ip)?, parse_port(src_port)?)),
            destination: Some(SocketAddr::new(parse_ip(dst_ip)?, parse_port(dst_port)?)),
        },
        consumed,
    )))
}

fn parse_v2(buf: &[u8]) -> Result<Option<(ProxyHeader, usize)>, ProxyHeaderError> {
    if buf.len() < 16 {
        return Ok(None);
    }
    let ver_cmd = buf[12];
    let fam = buf[13];
    let len = u16::from_be_bytes([buf[14], buf[15]]) as usize;
    if ver_cmd >> 4 != 2 {
        return Err(ProxyHeaderError::V2("unsupported version"));
    }
    let total = 16 + len;
    if buf.len() < total {
        return Ok(None);
    }
    let body = &buf[16..total];

    let header = match ver_cmd {
        CMD_LOCAL => ProxyHeader {
            version: 2,
            source: None,
            destination: None,
        },
        CMD_PROXY => {
            let (source, destination) = match fam & 0xf0 {
                AF_INET => {
                    if body.len() < 12 {
                        return Err(ProxyHeaderError::V2("short ipv4 block"));
                    }
                    let src = Ipv4Addr::new(body[0], body[1], body[2], body[3]);
                    let dst = Ipv4Addr::new(body[4], body[5], body[6], body[7]);
                    let sp = u16::from_be_bytes([body[8], body[9]]);
                    let dp = u16::from_be_bytes([body[10], body[11]]);
                    (
                        Some(SocketAddr::new(src.into(), sp)),
                        Some(SocketAddr::new(dst.into(), dp)),
                    )
                }
                AF_INET6 => {
                    if body.len() < 36 {
                        return Err(ProxyHeaderError::V2("short ipv6 block"));
                    }
                    let mut src = [0u8; 16];
                    let mut dst = [0u8; 16];
                    src.copy_from_slice(&body[0..16]);
                    dst.copy_from_slice(&body[16..32]);
                    let sp = u16::from_be_bytes([body[32], body[33]]);
                    let dp = u16::from_be_bytes([body[34], body[35]]);
                    (
                        Some(SocketAddr::new(Ipv6Addr::from(src).into(), sp)),
                        Some(SocketAddr::new(Ipv6Addr::from(dst).into(), dp)),
                    )
                }
                // AF_UNSPEC and AF_UNIX carry nothing we can route on.
                _ => (None, None),
            };
            ProxyHeader {
                version: 2,
                source,
                destination,
            }
        }
        _ => return Err(ProxyHeaderError::V2("unknown command")),
    };
    // Anything after the address block is TLVs, which are skipped.
    Ok(Some((header, total)))
}

fn to_v4(ip: IpAddr) -> Option<Ipv4Addr> {
    match ip {
        IpAddr::V4(v4) => Some(v4),
        IpAddr::V6(v6) => v6.to_ipv4_mapped(),
    }
}

fn to_v6(ip: IpAddr) -> Ipv6Addr {
    match ip {
        IpAddr::V4(v4) => v4.to_ipv6_mapped(),
        IpAddr::V6(v6) => v6,
    }
}

/// Builds a v2 PROXY header. Mixed address families are folded to IPv4
/// when both ends allow it, otherwise to IPv4-mapped IPv6.
pub fn encode_v2(src: SocketAddr, dst: SocketAddr, transport: Transport) -> Vec<u8> {
    let proto = match transport {
        Transport::Stream => TRANSPORT_STREAM,
        Transport::Datagram => TRANSPORT_DGRAM,
    };
    let mut out = Vec::with_capacity(16 + 36);
    out.extend_from_slice(&V2_SIGNATURE);
    out.push(CMD_PROXY);

    match (to_v4(src.ip()), to_v4(dst.ip())) {
        (Some(s), Some(d)) if !(src.is_ipv6() && dst.is_ipv6()) => {
            out.push(AF_INET | proto);
            out.extend_from_slice(&12u16.to_be_bytes());
            out.extend_from_slice(&s.octets());
            out.extend_from_slice(&d.octets());
        }
        _ => {
            out.push(AF_INET6 | proto);
            out.extend_from_slice(&36u16.to_be_bytes());
            out.extend_from_slice(&to_v6(src.ip()).octets());
            out.extend_from_slice(&to_v6(dst.ip()).octets());
        }
    }
    out.extend_from_slice(&src.port().to_be_bytes());
    out.extend_from_slice(&dst.port().to_be_bytes());
    out
}

/// LOCAL header with no address block.
pub fn encode_v2_local() -> Vec<u8> {
    let mut out = V2_SIGNATURE.to_vec();
    out.push(CMD_LOCAL);
    out.push(AF_UNSPEC);
    out.extend_from_slice(&0u16.to_be_bytes());
    out
}

/// Consumes a header from a buffered stream.
pub async fn read_from<R>(reader: &mut PacketReader<R>) -> Result<ProxyHeader, ProxyHeaderError>
where
    R: AsyncRead + Unpin,
{
    loop {
        if let Some((header, used)) = parse(reader.buffered())? {
            reader.consume(used);
            return Ok(header);
        }
        if reader.fill().await? == 0 {
            return Err(ProxyHeaderError::Eof);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sa(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn v2_ipv4_stream_layout() {
        let h = encode_v2(sa("1.2.3.4:55555"), sa("127.0.0.1:25566"), Transport::Stream);
        assert_eq!(&h[..12], &V2_SIGNATURE);
        assert_eq!(h[12], 0x21);
        assert_eq!(h[13], 0x11);
        assert_eq!(&h[14..16], &[0, 12]);
        assert_eq!(&h[16..20], &[1, 2, 3, 4]);
        assert_eq!(&h[20..24], &[127, 0, 0, 1]);
        assert_eq!(&h[24..26], &55555u16.to_be_bytes());
        assert_eq!(&h[26..28], &25566u16.to_be_bytes());
        assert_eq!(h.len(), 28);

        let (parsed, used) = parse(&h).unwrap().unwrap();
        assert_eq!(used, 28);
        assert_eq!(parsed.source, Some(sa("1.2.3.4:55555")));
        assert_eq!(parsed.destination, Some(sa("127.0.0.1:25566")));
    }

    #[test]
    fn v2_dgram_and_ipv6() {
        let h = encode_v2(sa("[2001:db8::1]:4000"), sa("[::1]:19132"), Transport::Datagram);
        assert_eq!(h[13], 0x22);
        assert_eq!(h.len(), 16 + 36);
        let (parsed, _) = parse(&h).unwrap().unwrap();
        assert_eq!(parsed.source, Some(sa("[2001:db8::1]:4000")));
    }

    #[test]
    fn v2_mixed_family_maps_to_v6() {
        let h = encode_v2(sa("[2001:db8::1]:4000"), sa("10.0.0.1:25565"), Transport::Stream);
        assert_eq!(h[13], 0x21);
        let (parsed, _) = parse(&h).unwrap().unwrap();
        assert_eq!(parsed.destination, Some(sa("[::ffff:10.0.0.1]:25565")));
    }

    #[test]
    fn v2_v4_mapped_pair_folds_to_v4() {
        // Dual-stack listeners report IPv4 clients as mapped addresses.
        let h = encode_v2(sa("[::ffff:1.2.3.4]:4000"), sa("10.0.0.1:25565"), Transport::Stream);
        assert_eq!(h[13], 0x11);
        let (parsed, _) = parse(&h).unwrap().unwrap();
        assert_eq!(parsed.source, Some(sa("1.2.3.4:4000")));
        assert_eq!(parsed.destination, Some(sa("10.0.0.1:25565")));
    }

    #[test]
    fn v2_skips_tlvs_and_handles_local() {
        let mut h = encode_v2(sa("1.2.3.4:1"), sa("5.6.7.8:2"), Transport::Stream);
        h[15] += 5;
        h.extend_from_slice(&[0x04, 0x00, 0x02, 0xaa, 0xbb]);
        h.extend_from_slice(b"rest");
        let (_, used) = parse(&h).unwrap().unwrap();
        assert_eq!(&h[used..], b"rest");

        let (local, used) = parse(&encode_v2_local()).unwrap().unwrap();
        assert_eq!(used, 16);
        assert_eq!(local.source, None);
    }

    #[test]
    fn v1_tcp4_tcp6_unknown() {
        let (h, used) = parse(b"PROXY TCP4 192.168.0.1 192.168.0.11 56324 443\r\nGET")
            .unwrap()
            .unwrap();
        assert_eq!(used, 47);
        assert_eq!(h.version, 1);
        assert_eq!(h.source, Some(sa("192.168.0.1:56324")));

        let (h, _) = parse(b"PROXY TCP6 ::1 ::2 1 2\r\n").unwrap().unwrap();
        assert_eq!(h.destination, Some(sa("[::2]:2")));

        let (h, _) = parse(b"PROXY UNKNOWN\r\n").unwrap().unwrap();
        assert_eq!(h.source, None);

        assert!(parse(b"PROXY TCP4 1.1.1.1 ::1 1 2\r\n").is_err());
    }

    #[test]
    fn partial_headers_need_more() {
        let h = encode_v2(sa("1.2.3.4:1"), sa("5.6.7.8:2"), Transport::Stream);
        for i in 0..h.len() {
            assert!(parse(&h[..i]).unwrap().is_none(), "prefix {i}");
        }
        assert!(parse(b"PROXY TCP4 1.2").unwrap().is_none());
        assert!(matches!(parse(&[0x10, 0x00]), Err(ProxyHeaderError::Missing)));
    }

    #[tokio::test]
    async fn read_from_leaves_payload_buffered() {
        let mut wire = encode_v2(sa("9.9.9.9:9"), sa("1.1.1.1:1"), Transport::Stream);
        wire.extend_from_slice(&[0x10, 0x00]);
        let mut reader = PacketReader::new(&wire[..], 1024);
        let h = read_from(&mut reader).await.unwrap();
        assert_eq!(h.source, Some(sa("9.9.9.9:9")));
        reader.start_recording();
        assert_eq!(reader.recorded(), &[0x10, 0x00]);
    }
}
