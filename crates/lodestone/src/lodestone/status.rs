//! Responses the proxy answers by itself: Java status / disconnect packets
//! and the Bedrock unconnected-pong advertisement.

use std::path::Path;

use anyhow::Context;
use base64::Engine;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::lodestone::protocol::java::{CodecError, Encoder, Packet, PacketReader, write_packet};

pub const STATUS_REQUEST_ID: i32 = 0x00;
pub const STATUS_RESPONSE_ID: i32 = 0x00;
pub const PING_ID: i32 = 0x01;
pub const LOGIN_DISCONNECT_ID: i32 = 0x00;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlayerSample {
    pub name: String,
    #[serde(alias = "id")]
    pub uuid: String,
}

/// Template for a synthetic Java status response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusTemplate {
    pub version_name: String,
    /// 0 echoes the client's protocol so it never shows as outdated.
    pub protocol_number: i32,
    pub max_players: i32,
    pub players_online: i32,
    pub player_samples: Vec<PlayerSample>,
    /// `data:image/png;base64,...`
    pub favicon: Option<String>,
    pub motd: String,
}

impl StatusTemplate {
    pub fn offline_default() -> Self {
        Self {
            version_name: "lodestone".into(),
            protocol_number: 0,
            max_players: 0,
            players_online: 0,
            player_samples: Vec::new(),
            favicon: None,
            motd: "Server is offline".into(),
        }
    }

    pub fn not_found_default() -> Self {
        Self {
            motd: "Server not found".into(),
            ..Self::offline_default()
        }
    }

    pub fn response(&self, client_protocol: i32) -> StatusResponse {
        StatusResponse {
            version: StatusVersion {
                name: self.version_name.clone(),
                protocol: if self.protocol_number == 0 {
                    client_protocol
                } else {
                    self.protocol_number
                },
            },
            players: StatusPlayers {
                max: self.max_players,
                online: self.players_online,
                sample: self
                    .player_samples
                    .iter()
                    .map(|p| StatusSample {
                        name: p.name.clone(),
                        id: p.uuid.clone(),
                    })
                    .collect(),
            },
            description: TextComponent {
                text: self.motd.clone(),
            },
            favicon: self.favicon.clone(),
        }
    }

    pub fn response_packet(&self, client_protocol: i32) -> Packet {
        // Plain structs of strings and integers always serialise.
        let json = serde_json::to_string(&self.response(client_protocol)).unwrap_or_default();
        let mut e = Encoder::new();
        e.write_string(&json);
        Packet::new(STATUS_RESPONSE_ID, e.into_inner())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: StatusVersion,
    pub players: StatusPlayers,
    pub description: TextComponent,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub favicon: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusVersion {
    pub name: String,
    pub protocol: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusPlayers {
    pub max: i32,
    pub online: i32,
    #[serde(default)]
    pub sample: Vec<StatusSample>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSample {
    pub name: String,
    pub id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TextComponent {
    pub text: String,
}

/// Reads a PNG and embeds it as a data URL.
pub fn load_favicon(path: &Path) -> anyhow::Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("status: read icon {}", path.display()))?;
    Ok(format!(
        "data:image/png;base64,{}",
        base64::engine::general_purpose::STANDARD.encode(bytes)
    ))
}

/// Login-state disconnect carrying a plain text chat component.
pub fn login_disconnect_packet(text: &str) -> Packet {
    let json = serde_json::to_string(&TextComponent { text: text.into() }).unwrap_or_default();
    let mut e = Encoder::new();
    e.write_string(&json);
    Packet::new(LOGIN_DISCONNECT_ID, e.into_inner())
}

/// Serves the status exchange after a status handshake: request, response,
/// then an optional ping that is echoed back.
pub async fn serve_status<S>(
    reader: &mut PacketReader<S>,
    template: &StatusTemplate,
    client_protocol: i32,
) -> Result<(), CodecError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let req = reader.read_packet().await?;
    if req.id != STATUS_REQUEST_ID {
        return Ok(());
    }
    write_packet(reader.get_mut(), &template.response_packet(client_protocol)).await?;

    match reader.read_packet().await {
        Ok(ping) if ping.id == PING_ID => write_packet(reader.get_mut(), &ping).await,
        Ok(_) | Err(CodecError::Eof) => Ok(()),
        Err(e) => Err(e),
    }
}

/// Fields advertised in the RakNet unconnected pong.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BedrockPing {
    pub edition: String,
    pub motd: String,
    pub protocol_version: i32,
    pub version_name: String,
    pub player_count: i32,
    pub max_player_count: i32,
    pub level_name: String,
    pub gamemode: String,
    pub gamemode_numeric: i32,
}

impl Default for BedrockPing {
    fn default() -> Self {
        Self {
            edition: "MCPE".into(),
            motd: "Lodestone".into(),
            protocol_version: 671,
            version_name: "1.20.80".into(),
            player_count: 0,
            max_player_count: 20,
            level_name: "Lodestone".into(),
            gamemode: "Survival".into(),
            gamemode_numeric: 1,
        }
    }
}

impl BedrockPing {
    /// `MCPE;motd;protocol;version;players;max;guid;level;gamemode;gm;port4;port6;`
    pub fn pong_blob(&self, guid: u64, port: u16) -> String {
        format!(
            "{};{};{};{};{};{};{};{};{};{};{};{};",
            self.edition,
            self.motd,
            self.protocol_version,
            self.version_name,
            self.player_count,
            self.max_player_count,
            guid,
            self.level_name,
            self.gamemode,
            self.gamemode_numeric,
            port,
            port,
        )
    }
}
