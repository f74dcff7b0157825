//! Bedrock game packets as carried inside RakNet user datagrams.
//!
//! A datagram is `0xfe || batch`. The batch body is a run of
//! `varuint32 length || varuint32 header || body` entries and may be wrapped
//! in raw deflate, either implicitly (older clients) or behind a one byte
//! compression header (`0x00` deflate, `0xff` none).

use std::io::{Read, Write};

use base64::Engine;
use base64::engine::general_purpose::{STANDARD_NO_PAD, URL_SAFE_NO_PAD};
use flate2::{Compression, read::DeflateDecoder, write::DeflateEncoder};
use serde::Deserialize;
use thiserror::Error;

use super::java::{self, CodecError};

pub const GAME_PACKET_ID: u8 = 0xfe;
pub const LOGIN_PACKET_ID: u32 = 0x01;
pub const DISCONNECT_PACKET_ID: u32 = 0x05;

const HEADER_DEFLATE: u8 = 0x00;
const HEADER_NONE: u8 = 0xff;

#[derive(Debug, Error)]
pub enum BedrockError {
    #[error("not a game packet (first byte {0:#04x})")]
    NotGamePacket(u8),
    #[error("empty datagram")]
    Empty,
    #[error("batch framing: {0}")]
    Framing(#[from] CodecError),
    #[error("inflate: {0}")]
    Inflate(std::io::Error),
    #[error("inflated batch exceeds {0} bytes")]
    TooLarge(usize),
    #[error("no login packet in batch")]
    NoLogin,
    #[error("login chain has {0} entries, expected 1 or 3")]
    ChainWrongLength(usize),
    #[error("malformed login: {0}")]
    MalformedLogin(&'static str),
    #[error("malformed jwt: {0}")]
    Jwt(&'static str),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

impl BedrockError {
    // Errors raised after the batch itself was understood.
    fn is_semantic(&self) -> bool {
        matches!(
            self,
            BedrockError::ChainWrongLength(_)
                | BedrockError::MalformedLogin(_)
                | BedrockError::Jwt(_)
                | BedrockError::Json(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchEncoding {
    Raw,
    Deflate,
    HeaderNone,
    HeaderDeflate,
}

/// One game packet inside a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GamePacket {
    pub id: u32,
    pub body: Vec<u8>,
}

fn read_var_u32(d: &mut java::Decoder<'_>) -> Result<u32, CodecError> {
    d.read_var_int().map(|v| v as u32)
}

fn write_var_u32(v: u32, out: &mut Vec<u8>) {
    java::write_var_int(v as i32, out);
}

fn inflate(data: &[u8], max: usize) -> Result<Vec<u8>, BedrockError> {
    let mut out = Vec::new();
    DeflateDecoder::new(data)
        .take(max as u64 + 1)
        .read_to_end(&mut out)
        .map_err(BedrockError::Inflate)?;
    if out.len() > max {
        return Err(BedrockError::TooLarge(max));
    }
    Ok(out)
}

fn deflate(data: &[u8]) -> Vec<u8> {
    let mut enc = DeflateEncoder::new(Vec::new(), Compression::default());
    // Writing into a Vec cannot fail.
    let _ = enc.write_all(data);
    enc.finish().unwrap_or_default()
}

fn split_batch(body: &[u8]) -> Result<Vec<GamePacket>, BedrockError> {
    let mut d = java::Decoder::new(body);
    let mut packets = Vec::new();
    while !d.is_finished() {
        let len = read_var_u32(&mut d)? as usize;
        if len > d.remaining() {
            return Err(CodecError::Truncated {
                need: len,
                have: d.remaining(),
            }
            .into());
        }
        let entry = d.read_remaining();
        let (entry, rest) = entry.split_at(len);
        d = java::Decoder::new(rest);

        let mut pd = java::Decoder::new(entry);
        let header = read_var_u32(&mut pd)?;
        packets.push(GamePacket {
            id: header & 0x3ff,
            body: pd.read_remaining().to_vec(),
        });
    }
    Ok(packets)
}

/// Decodes a `0xfe` datagram under a specific encoding.
pub fn decode_batch(
    datagram: &[u8],
    encoding: BatchEncoding,
    max_len: usize,
) -> Result<Vec<GamePacket>, BedrockError> {
    let (&first, rest) = datagram.split_first().ok_or(BedrockError::Empty)?;
    if first != GAME_PACKET_ID {
        return Err(BedrockError::NotGamePacket(first));
    }
    match encoding {
        BatchEncoding::Raw => split_batch(rest),
        BatchEncoding::Deflate => split_batch(&inflate(rest, max_len)?),
        BatchEncoding::HeaderNone => match rest.split_first() {
            Some((&HEADER_NONE, body)) => split_batch(body),
            _ => Err(BedrockError::MalformedLogin("missing compression header")),
        },
        BatchEncoding::HeaderDeflate => match rest.split_first() {
            Some((&HEADER_DEFLATE, body)) => split_batch(&inflate(body, max_len)?),
            _ => Err(BedrockError::MalformedLogin("missing compression header")),
        },
    }
}

pub fn encode_batch(packets: &[GamePacket], encoding: BatchEncoding) -> Vec<u8> {
    let mut body = Vec::new();
    for p in packets {
        let mut entry = Vec::with_capacity(p.body.len() + 2);
        write_var_u32(p.id & 0x3ff, &mut entry);
        entry.extend_from_slice(&p.body);
        write_var_u32(entry.len() as u32, &mut body);
        body.extend_from_slice(&entry);
    }

    let mut out = vec![GAME_PACKET_ID];
    match encoding {
        BatchEncoding::Raw => out.extend_from_slice(&body),
        BatchEncoding::Deflate => out.extend_from_slice(&deflate(&body)),
        BatchEncoding::HeaderNone => {
            out.push(HEADER_NONE);
            out.extend_from_slice(&body);
        }
        BatchEncoding::HeaderDeflate => {
            out.push(HEADER_DEFLATE);
            out.extend_from_slice(&deflate(&body));
        }
    }
    out
}

/// Claims from the identity token's `extraData`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct IdentityData {
    #[serde(rename = "displayName", default)]
    pub display_name: String,
    #[serde(rename = "XUID", default)]
    pub xuid: String,
    #[serde(default)]
    pub identity: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
pub struct ClientData {
    #[serde(rename = "ServerAddress", default)]
    pub server_address: String,
    #[serde(rename = "DeviceOS", default)]
    pub device_os: i64,
    #[serde(rename = "GameVersion", default)]
    pub game_version: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoginPacket {
    pub protocol_version: i32,
    pub chain: Vec<String>,
    pub client_data_token: String,
}

#[derive(Deserialize)]
struct ChainEnvelope {
    #[serde(default)]
    chain: Option<Vec<String>>,
    #[serde(rename = "Certificate", default)]
    certificate: Option<String>,
}

#[derive(Deserialize)]
struct ChainOnly {
    chain: Vec<String>,
}

#[derive(Deserialize)]
struct IdentityClaims {
    #[serde(rename = "extraData", default)]
    extra_data: Option<IdentityData>,
}

fn take_le_block<'a>(d: &mut java::Decoder<'a>, what: &'static str) -> Result<&'a [u8], BedrockError> {
    let rest = d.read_remaining();
    if rest.len() < 4 {
        return Err(BedrockError::MalformedLogin(what));
    }
    let len = i32::from_le_bytes([rest[0], rest[1], rest[2], rest[3]]);
    if len < 0 || (len as usize) > rest.len() - 4 {
        return Err(BedrockError::MalformedLogin(what));
    }
    let end = 4 + len as usize;
    *d = java::Decoder::new(&rest[end..]);
    Ok(&rest[4..end])
}

impl LoginPacket {
    /// Parses a Login packet body (after the packet header).
    pub fn decode(body: &[u8]) -> Result<Self, BedrockError> {
        if body.len() < 4 {
            return Err(BedrockError::MalformedLogin("protocol version"));
        }
        let protocol_version = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let mut d = java::Decoder::new(&body[4..]);
        let req_len = read_var_u32(&mut d)? as usize;
        if req_len > d.remaining() {
            return Err(BedrockError::MalformedLogin("connection request length"));
        }
        let req = &d.read_remaining()[..req_len];

        let mut rd = java::Decoder::new(req);
        let chain_json = take_le_block(&mut rd, "chain length")?;
        let token = take_le_block(&mut rd, "client data length")?;

        let env: ChainEnvelope = serde_json::from_slice(chain_json)?;
        let chain = match (env.chain, env.certificate) {
            (Some(chain), _) => chain,
            (None, Some(cert)) => serde_json::from_str::<ChainOnly>(&cert)?.chain,
            (None, None) => return Err(BedrockError::MalformedLogin("no chain")),
        };
        if chain.len() != 1 && chain.len() != 3 {
            return Err(BedrockError::ChainWrongLength(chain.len()));
        }

        let client_data_token = std::str::from_utf8(token)
            .map_err(|_| BedrockError::MalformedLogin("client data token is not utf-8"))?
            .to_string();

        Ok(Self {
            protocol_version,
            chain,
            client_data_token,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let chain_json = serde_json::json!({ "chain": self.chain }).to_string();
        let mut req = Vec::new();
        req.extend_from_slice(&(chain_json.len() as i32).to_le_bytes());
        req.extend_from_slice(chain_json.as_bytes());
        req.extend_from_slice(&(self.client_data_token.len() as i32).to_le_bytes());
        req.extend_from_slice(self.client_data_token.as_bytes());

        let mut out = Vec::with_capacity(req.len() + 9);
        out.extend_from_slice(&self.protocol_version.to_be_bytes());
        write_var_u32(req.len() as u32, &mut out);
        out.extend_from_slice(&req);
        out
    }

    /// Identity token: the sole entry of an offline chain, the last of an
    /// Xbox-authenticated one.
    pub fn identity_token(&self) -> &str {
        if self.chain.len() == 3 {
            &self.chain[2]
        } else {
            &self.chain[0]
        }
    }

    pub fn identity(&self) -> Result<IdentityData, BedrockError> {
        let claims: IdentityClaims = decode_jwt_claims(self.identity_token())?;
        Ok(claims.extra_data.unwrap_or_default())
    }

    pub fn client_data(&self) -> Result<ClientData, BedrockError> {
        decode_jwt_claims(&self.client_data_token)
    }
}

/// Decodes a JWT payload. Signatures are not checked.
pub fn decode_jwt_claims<T: serde::de::DeserializeOwned>(token: &str) -> Result<T, BedrockError> {
    let mut parts = token.split('.');
    let payload = match (parts.next(), parts.next()) {
        (Some(_), Some(p)) => p,
        _ => return Err(BedrockError::Jwt("expected header.payload[.signature]")),
    };
    let raw = URL_SAFE_NO_PAD
        .decode(payload.trim_end_matches('='))
        .or_else(|_| STANDARD_NO_PAD.decode(payload.trim_end_matches('=')))
        .map_err(|_| BedrockError::Jwt("payload is not base64"))?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Decodes the first client datagram as a Login packet, detecting the batch
/// encoding. The encoding is returned so replies can mirror it.
pub fn decode_login_datagram(
    datagram: &[u8],
    max_len: usize,
) -> Result<(LoginPacket, BatchEncoding), BedrockError> {
    const ORDER: [BatchEncoding; 4] = [
        BatchEncoding::HeaderNone,
        BatchEncoding::HeaderDeflate,
        BatchEncoding::Deflate,
        BatchEncoding::Raw,
    ];

    let mut first_err: Option<BedrockError> = None;
    for enc in ORDER {
        let attempt = decode_batch(datagram, enc, max_len).and_then(|packets| {
            let login = packets
                .iter()
                .find(|p| p.id == LOGIN_PACKET_ID)
                .ok_or(BedrockError::NoLogin)?;
            LoginPacket::decode(&login.body)
        });
        match attempt {
            Ok(login) => return Ok((login, enc)),
            Err(e @ BedrockError::NotGamePacket(_)) | Err(e @ BedrockError::Empty) => {
                return Err(e);
            }
            Err(e) => {
                let replace = match &first_err {
                    None => true,
                    Some(prev) => e.is_semantic() && !prev.is_semantic(),
                };
                if replace {
                    first_err = Some(e);
                }
            }
        }
    }
    Err(first_err.unwrap_or(BedrockError::NoLogin))
}

/// Disconnect packet wrapped in a batch using `encoding`.
pub fn encode_disconnect(message: &str, hide_screen: bool, encoding: BatchEncoding) -> Vec<u8> {
    let mut body = vec![u8::from(hide_screen)];
    write_var_u32(message.len() as u32, &mut body);
    body.extend_from_slice(message.as_bytes());
    encode_batch(
        &[GamePacket {
            id: DISCONNECT_PACKET_ID,
            body,
        }],
        encoding,
    )
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;

    pub fn jwt(claims: &serde_json::Value) -> String {
        let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"ES384"}"#);
        let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
        format!("{header}.{payload}.c2ln")
    }

    pub fn offline_login(name: &str, encoding: BatchEncoding) -> Vec<u8> {
        let identity = jwt(&serde_json::json!({
            "extraData": {"displayName": name, "XUID": "", "identity": "6d1f0f4f-0000-4000-8000-000000000001"}
        }));
        let client = jwt(&serde_json::json!({
            "ServerAddress": "bedrock.example.com:19132",
            "DeviceOS": 7,
            "GameVersion": "1.20.80"
        }));
        let login = LoginPacket {
            protocol_version: 671,
            chain: vec![identity],
            client_data_token: client,
        };
        encode_batch(
            &[GamePacket {
                id: LOGIN_PACKET_ID,
                body: login.encode(),
            }],
            encoding,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    #[test]
    fn login_detected_under_every_encoding() {
        for enc in [
            BatchEncoding::Raw,
            BatchEncoding::Deflate,
            BatchEncoding::HeaderNone,
            BatchEncoding::HeaderDeflate,
        ] {
            let dgram = offline_login("Steve", enc);
            let (login, got) = decode_login_datagram(&dgram, 1 << 20).unwrap();
            assert_eq!(login.protocol_version, 671);
            assert_eq!(login.identity().unwrap().display_name, "Steve");
            let cd = login.client_data().unwrap();
            assert_eq!(cd.server_address, "bedrock.example.com:19132");
            assert_eq!(cd.device_os, 7);
            if matches!(enc, BatchEncoding::HeaderNone | BatchEncoding::HeaderDeflate) {
                assert_eq!(got, enc);
            }
        }
    }

    #[test]
    fn authenticated_chain_uses_last_token() {
        let other = jwt(&serde_json::json!({"certificateAuthority": true}));
        let ident = jwt(&serde_json::json!({"extraData": {"displayName": "Alex", "XUID": "2535"}}));
        let login = LoginPacket {
            protocol_version: 712,
            chain: vec![other.clone(), other, ident],
            client_data_token: jwt(&serde_json::json!({})),
        };
        let parsed = LoginPacket::decode(&login.encode()).unwrap();
        let id = parsed.identity().unwrap();
        assert_eq!(id.display_name, "Alex");
        assert_eq!(id.xuid, "2535");
    }

    #[test]
    fn chain_of_two_is_rejected() {
        let t = jwt(&serde_json::json!({}));
        let login = LoginPacket {
            protocol_version: 712,
            chain: vec![t.clone(), t],
            client_data_token: String::new(),
        };
        let dgram = encode_batch(
            &[GamePacket {
                id: LOGIN_PACKET_ID,
                body: login.encode(),
            }],
            BatchEncoding::HeaderNone,
        );
        assert!(matches!(
            decode_login_datagram(&dgram, 1 << 20),
            Err(BedrockError::ChainWrongLength(2))
        ));
    }

    #[test]
    fn certificate_envelope_accepted() {
        let ident = jwt(&serde_json::json!({"extraData": {"displayName": "Kai"}}));
        let cert = serde_json::json!({ "chain": [ident] }).to_string();
        let chain_json = serde_json::json!({ "AuthenticationType": 2, "Certificate": cert }).to_string();
        let token = jwt(&serde_json::json!({}));

        let mut req = Vec::new();
        req.extend_from_slice(&(chain_json.len() as i32).to_le_bytes());
        req.extend_from_slice(chain_json.as_bytes());
        req.extend_from_slice(&(token.len() as i32).to_le_bytes());
        req.extend_from_slice(token.as_bytes());
        let mut body = 800i32.to_be_bytes().to_vec();
        write_var_u32(req.len() as u32, &mut body);
        body.extend_from_slice(&req);

        let login = LoginPacket::decode(&body).unwrap();
        assert_eq!(login.identity().unwrap().display_name, "Kai");
    }

    #[test]
    fn non_game_packet_rejected() {
        assert!(matches!(
            decode_login_datagram(&[0x05, 0x00], 1024),
            Err(BedrockError::NotGamePacket(0x05))
        ));
    }

    #[test]
    fn inflate_is_bounded() {
        let big = encode_batch(
            &[GamePacket {
                id: 0x09,
                body: vec![0u8; 8192],
            }],
            BatchEncoding::Deflate,
        );
        assert!(matches!(
            decode_batch(&big, BatchEncoding::Deflate, 1024),
            Err(BedrockError::TooLarge(1024))
        ));
    }

    #[test]
    fn disconnect_packet_shape() {
        let dgram = encode_disconnect("bye", false, BatchEncoding::HeaderNone);
        let packets = decode_batch(&dgram, BatchEncoding::HeaderNone, 1024).unwrap();
        assert_eq!(packets.len(), 1);
        assert_eq!(packets[0].id, DISCONNECT_PACKET_ID);
        assert_eq!(packets[0].body, [0x00, 0x03, b'b', b'y', b'e']);
    }
}
