use std::net::{IpAddr, SocketAddr};

use thiserror::Error;
use tokio::io::AsyncRead;
use uuid::Uuid;

use crate::lodestone::protocol::{
    bedrock::{self, BatchEncoding, BedrockError, ClientData, IdentityData, LoginPacket},
    java::{CodecError, Decoder, Encoder, MAX_STRING_LEN, Packet, PacketReader},
    proxy_protocol::ProxyHeaderError,
};

pub const HANDSHAKE_PACKET_ID: i32 = 0x00;
pub const LOGIN_START_PACKET_ID: i32 = 0x00;
pub const MAX_ADDRESS_LEN: usize = 255;
pub const MAX_USERNAME_LEN: usize = 16;

#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("unsupported next state {0}")]
    UnsupportedNextState(i32),
    #[error("malformed handshake: {0}")]
    Malformed(&'static str),
    #[error("unexpected packet id {0:#04x}")]
    UnexpectedPacketId(i32),
    #[error("server address exceeds {MAX_ADDRESS_LEN} characters")]
    AddressTooLong,
    #[error("login chain has {0} entries, expected 1 or 3")]
    LoginChainWrongLength(usize),
    #[error("codec: {0}")]
    Codec(#[from] CodecError),
    #[error("bedrock: {0}")]
    Bedrock(BedrockError),
    #[error("proxy header: {0}")]
    ProxyHeader(#[from] ProxyHeaderError),
    #[error("handshake timed out")]
    Timeout,
}

impl From<BedrockError> for HandshakeError {
    fn from(e: BedrockError) -> Self {
        match e {
            BedrockError::ChainWrongLength(n) => HandshakeError::LoginChainWrongLength(n),
            other => HandshakeError::Bedrock(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextState {
    Status,
    Login,
    /// 1.20.5+ transfer intent; continues like a login.
    Transfer,
}

impl NextState {
    pub fn from_i32(v: i32) -> Result<Self, HandshakeError> {
        match v {
            1 => Ok(NextState::Status),
            2 => Ok(NextState::Login),
            3 => Ok(NextState::Transfer),
            other => Err(HandshakeError::UnsupportedNextState(other)),
        }
    }

    pub fn as_i32(self) -> i32 {
        match self {
            NextState::Status => 1,
            NextState::Login => 2,
            NextState::Transfer => 3,
        }
    }

    pub fn is_login(self) -> bool {
        !matches!(self, NextState::Status)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Handshake {
    pub protocol_version: i32,
    pub server_address: String,
    pub server_port: u16,
    pub next_state: NextState,
}

impl Handshake {
    /// `max_address` bounds the raw address field; forwarding payloads make
    /// it longer than the vanilla limit.
    pub fn decode(packet: &Packet, max_address: usize) -> Result<Self, HandshakeError> {
        if packet.id != HANDSHAKE_PACKET_ID {
            return Err(HandshakeError::UnexpectedPacketId(packet.id));
        }
        let mut d = packet.decoder();
        let protocol_version = d.read_var_int()?;
        let server_address = match d.read_string(max_address) {
            Ok(s) => s.to_string(),
            Err(CodecError::StringTooLong { .. }) => return Err(HandshakeError::AddressTooLong),
            Err(e) => return Err(e.into()),
        };
        let server_port = d.read_u16()?;
        let next_state = NextState::from_i32(d.read_var_int()?)?;
        Ok(Self {
            protocol_version,
            server_address,
            server_port,
            next_state,
        })
    }

    pub fn to_packet(&self) -> Packet {
        let mut e = Encoder::new();
        e.write_var_int(self.protocol_version)
            .write_string(&self.server_address)
            .write_u16(self.server_port)
            .write_var_int(self.next_state.as_i32());
        Packet::new(HANDSHAKE_PACKET_ID, e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginStart {
    pub username: String,
    pub uuid: Option<Uuid>,
}

impl LoginStart {
    pub fn decode(packet: &Packet, protocol_version: i32) -> Result<Self, HandshakeError> {
        if packet.id != LOGIN_START_PACKET_ID {
            return Err(HandshakeError::UnexpectedPacketId(packet.id));
        }
        let mut d = packet.decoder();
        let username = d.read_string(MAX_USERNAME_LEN)?.to_string();
        // Clients differ in what follows the name; a bad tail still leaves a
        // usable username.
        let uuid = read_login_tail(&mut d, protocol_version).ok().flatten();
        Ok(Self { username, uuid })
    }

    pub fn to_packet(&self, protocol_version: i32) -> Packet {
        let mut e = Encoder::new();
        e.write_string(&self.username);
        match protocol_version {
            759..=760 => {
                e.write_bool(false);
                if protocol_version == 760 {
                    write_optional_uuid(&mut e, self.uuid);
                }
            }
            761..=763 => write_optional_uuid(&mut e, self.uuid),
            v if v >= 764 => {
                e.write_uuid(&self.uuid.unwrap_or(Uuid::nil()));
            }
            _ => {}
        }
        Packet::new(LOGIN_START_PACKET_ID, e.into_inner())
    }
}

fn write_optional_uuid(e: &mut Encoder, uuid: Option<Uuid>) {
    match uuid {
        Some(id) => {
            e.write_bool(true).write_uuid(&id);
        }
        None => {
            e.write_bool(false);
        }
    }
}

fn read_login_tail(d: &mut Decoder<'_>, protocol_version: i32) -> Result<Option<Uuid>, CodecError> {
    let read_optional_uuid = |d: &mut Decoder<'_>| -> Result<Option<Uuid>, CodecError> {
        if d.read_bool()? {
            d.read_uuid().map(Some)
        } else {
            Ok(None)
        }
    };
    match protocol_version {
        759..=760 => {
            if d.read_bool()? {
                d.read_i64()?;
                d.read_byte_array()?;
                d.read_byte_array()?;
            }
            if protocol_version == 760 {
                read_optional_uuid(d)
            } else {
                Ok(None)
            }
        }
        761..=763 => read_optional_uuid(d),
        v if v >= 764 => d.read_uuid().map(Some),
        _ => Ok(None),
    }
}

/// Routing key extracted from a handshake address.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VirtualHost {
    pub host: String,
    /// Client address forwarded by an upstream proxy in the address field.
    pub real_ip: Option<IpAddr>,
    pub real_port: Option<u16>,
}

impl VirtualHost {
    /// The client's apparent address: the forwarded one when present.
    pub fn apparent_addr(&self, peer: SocketAddr) -> SocketAddr {
        match self.real_ip {
            Some(ip) => SocketAddr::new(ip, self.real_port.unwrap_or(peer.port())),
            None => peer,
        }
    }
}

fn parse_forwarded_addr(s: &str) -> Option<(IpAddr, Option<u16>)> {
    let s = s.trim();
    if let Ok(sa) = s.parse::<SocketAddr>() {
        return Some((sa.ip(), Some(sa.port())));
    }
    s.parse::<IpAddr>().ok().map(|ip| (ip, None))
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        return match rest.find(']') {
            Some(end) => &rest[..end],
            None => host,
        };
    }
    match host.rfind(':') {
        Some(i)
            if host[..i].find(':').is_none()
                && !host[i + 1..].is_empty()
                && host[i + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &host[..i]
        }
        _ => host,
    }
}

/// Normalises a handshake server address into a routing key.
///
/// Everything from the first NUL (forge markers, forwarding payloads) is
/// dropped, then any `:port`, then case and a trailing dot. With
/// `receive_real_ip` the client address is taken from either a NUL
/// separated segment or the `host///ip:port///timestamp` form.
pub fn normalize_virtual_host(raw: &str, receive_real_ip: bool) -> VirtualHost {
    let mut host = raw;
    let mut real = None;

    if receive_real_ip {
        if let Some((h, rest)) = raw.split_once("///") {
            host = h;
            real = rest.split("///").next().and_then(parse_forwarded_addr);
        }
    }

    let mut segments = host.split('\0');
    let host = segments.next().unwrap_or_default();
    if receive_real_ip && real.is_none() {
        real = segments.find_map(parse_forwarded_addr);
    }

    let host = strip_port(host.trim())
        .trim_end_matches('.')
        .to_ascii_lowercase();
    VirtualHost {
        host,
        real_ip: real.map(|(ip, _)| ip),
        real_port: real.and_then(|(_, port)| port),
    }
}

#[derive(Debug, Clone)]
pub struct JavaHandshake {
    pub handshake: Handshake,
    pub login: Option<LoginStart>,
    pub vhost: VirtualHost,
}

impl JavaHandshake {
    pub fn username(&self) -> Option<&str> {
        self.login.as_ref().map(|l| l.username.as_str())
    }
}

/// Reads the handshake and, for logins, the login-start packet.
///
/// The reader keeps recording, so everything consumed here (and anything
/// buffered behind it) stays available for replay.
pub async fn read_java_handshake<R>(
    reader: &mut PacketReader<R>,
    receive_real_ip: bool,
) -> Result<JavaHandshake, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    let max_address = if receive_real_ip {
        MAX_STRING_LEN
    } else {
        MAX_ADDRESS_LEN
    };
    let first = reader.read_packet().await?;
    let handshake = Handshake::decode(&first, max_address)?;
    let vhost = normalize_virtual_host(&handshake.server_address, receive_real_ip);
    if vhost.host.chars().count() > MAX_ADDRESS_LEN {
        return Err(HandshakeError::AddressTooLong);
    }
    if vhost.host.is_empty() {
        return Err(HandshakeError::Malformed("empty server address"));
    }

    let login = if handshake.next_state.is_login() {
        let packet = reader.read_packet().await?;
        Some(LoginStart::decode(&packet, handshake.protocol_version)?)
    } else {
        None
    };

    Ok(JavaHandshake {
        handshake,
        login,
        vhost,
    })
}

#[derive(Debug, Clone)]
pub struct BedrockLogin {
    pub login: LoginPacket,
    pub identity: IdentityData,
    pub client_data: ClientData,
    pub encoding: BatchEncoding,
}

/// Parses the first Bedrock datagram of a session.
pub fn parse_bedrock_login(datagram: &[u8], max_len: usize) -> Result<BedrockLogin, HandshakeError> {
    let (login, encoding) = bedrock::decode_login_datagram(datagram, max_len)?;
    let identity = login.identity()?;
    // Client data is informational; a bad token does not fail the login.
    let client_data = login.client_data().unwrap_or_default();
    Ok(BedrockLogin {
        login,
        identity,
        client_data,
        encoding,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lodestone::protocol::bedrock::testing::offline_login;

    fn handshake(host: &str, next: NextState) -> Handshake {
        Handshake {
            protocol_version: 760,
            server_address: host.into(),
            server_port: 25565,
            next_state: next,
        }
    }

    #[test]
    fn normalize_strips_forge_port_case_and_dot() {
        assert_eq!(
            normalize_virtual_host("Play.Example.COM.\0FML2\0", false).host,
            "play.example.com"
        );
        assert_eq!(
            normalize_virtual_host("play.example.com:25565", false).host,
            "play.example.com"
        );
        assert_eq!(normalize_virtual_host("[::1]:25565", false).host, "::1");
        assert_eq!(normalize_virtual_host("::1", false).host, "::1");
    }

    #[test]
    fn real_ip_forms() {
        let v = normalize_virtual_host("mc.example.com///1.2.3.4:55555///1700000000///sig", true);
        assert_eq!(v.host, "mc.example.com");
        assert_eq!(v.real_ip, Some("1.2.3.4".parse().unwrap()));
        assert_eq!(v.real_port, Some(55555));

        let v = normalize_virtual_host("mc.example.com\010.0.0.7\0abcd", true);
        assert_eq!(v.host, "mc.example.com");
        let peer: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        assert_eq!(v.apparent_addr(peer), "10.0.0.7:4000".parse::<SocketAddr>().unwrap());

        let v = normalize_virtual_host("mc.example.com///1.2.3.4:55555///1", false);
        assert_eq!(v.real_ip, None);
        assert_eq!(v.host, "mc.example.com///1.2.3.4:55555///1");
    }

    #[test]
    fn next_state_validation() {
        let mut p = handshake("a", NextState::Login).to_packet();
        *p.payload.last_mut().unwrap() = 7;
        assert!(matches!(
            Handshake::decode(&p, MAX_ADDRESS_LEN),
            Err(HandshakeError::UnsupportedNextState(7))
        ));
        let p = Packet::new(0x01, vec![]);
        assert!(matches!(
            Handshake::decode(&p, MAX_ADDRESS_LEN),
            Err(HandshakeError::UnexpectedPacketId(1))
        ));
    }

    #[test]
    fn address_length_limit() {
        let p = handshake(&"a".repeat(256), NextState::Status).to_packet();
        assert!(matches!(
            Handshake::decode(&p, MAX_ADDRESS_LEN),
            Err(HandshakeError::AddressTooLong)
        ));
    }

    #[test]
    fn login_start_versions() {
        let id = Uuid::from_u128(7);
        for (proto, expect) in [
            (758, None),
            (759, None),
            (760, Some(id)),
            (762, Some(id)),
            (765, Some(id)),
        ] {
            let ls = LoginStart {
                username: "notch".into(),
                uuid: Some(id),
            };
            let got = LoginStart::decode(&ls.to_packet(proto), proto).unwrap();
            assert_eq!(got.username, "notch");
            assert_eq!(got.uuid, expect, "protocol {proto}");
        }
    }

    #[test]
    fn login_start_tolerates_bad_tail() {
        let mut e = Encoder::new();
        e.write_string("alice").write_u8(0x09);
        let p = Packet::new(0, e.into_inner());
        let ls = LoginStart::decode(&p, 765).unwrap();
        assert_eq!(ls.username, "alice");
        assert_eq!(ls.uuid, None);
    }

    #[tokio::test]
    async fn reads_handshake_and_login() {
        let hs = handshake("Play.Example.com", NextState::Login).to_packet().encode();
        let ls = LoginStart {
            username: "notch".into(),
            uuid: None,
        }
        .to_packet(760)
        .encode();
        let wire = [hs.clone(), ls.clone()].concat();

        let mut reader = PacketReader::new(&wire[..], 1 << 16);
        reader.start_recording();
        let got = read_java_handshake(&mut reader, false).await.unwrap();
        assert_eq!(got.vhost.host, "play.example.com");
        assert_eq!(got.username(), Some("notch"));
        assert_eq!(reader.recorded(), &wire[..]);
    }

    #[tokio::test]
    async fn status_handshake_does_not_read_login() {
        let hs = handshake("play.example.com", NextState::Status).to_packet().encode();
        let mut reader = PacketReader::new(&hs[..], 1 << 16);
        let got = read_java_handshake(&mut reader, false).await.unwrap();
        assert!(got.login.is_none());
        assert_eq!(got.handshake.next_state, NextState::Status);
    }

    #[test]
    fn bedrock_login_identity() {
        let dgram = offline_login("Steve", BatchEncoding::HeaderDeflate);
        let got = parse_bedrock_login(&dgram, 1 << 20).unwrap();
        assert_eq!(got.identity.display_name, "Steve");
        assert_eq!(got.encoding, BatchEncoding::HeaderDeflate);
        assert_eq!(got.client_data.game_version, "1.20.80");
    }
}
