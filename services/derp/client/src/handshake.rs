//! Client side of the relay handshake.
//!
//! The relay speaks first with its ServerKey frame. We answer with our key
//! and a sealed ClientInfo; the relay replies with a sealed ServerInfo, or a
//! Health frame explaining why it will not serve us.

use derp_wire::{
    parse_server_key, ClientInfo, FrameType, ServerInfo, WireError, PROTOCOL_VERSION,
};
use tracing::{debug, warn};

use crate::config::ClientConfig;
use crate::connection::Connection;
use crate::framed::{write_frame, FrameReader};
use crate::transport::BoxedStream;
use crate::RelayError;

/// Run the handshake over a freshly dialed stream.
///
/// On success the stream is owned by the returned [`Connection`], tagged
/// with `generation`.
pub async fn handshake(
    stream: BoxedStream,
    config: &ClientConfig,
    generation: u64,
) -> Result<Connection, RelayError> {
    if config.is_watcher && config.mesh_key.is_none() {
        return Err(RelayError::Auth("watcher requires a mesh key".to_string()));
    }

    let (read_half, mut write_half) = tokio::io::split(stream);
    let mut reader = FrameReader::new(read_half);

    let frame = reader.read_frame().await?;
    let server_key = parse_server_key(&frame)?;
    debug!("Received server key {}", server_key.short_string());

    let info = ClientInfo {
        version: PROTOCOL_VERSION,
        mesh_key: config.mesh_key.clone(),
        can_ack_pings: config.can_ack_pings,
        is_prober: config.is_prober,
    };
    write_frame(&mut write_half, &info.seal(&config.private_key, &server_key)?).await?;

    let frame = reader.read_frame().await?;
    let server_info = match frame.typ {
        FrameType::ServerInfo => ServerInfo::open(&frame, &config.private_key, &server_key)?,
        FrameType::Health => {
            let problem = String::from_utf8_lossy(&frame.payload).into_owned();
            warn!("Relay {} rejected client: {}", server_key.short_string(), problem);
            return Err(RelayError::Auth(problem));
        }
        other => {
            return Err(WireError::Unexpected {
                got: other,
                want: FrameType::ServerInfo,
            }
            .into())
        }
    };

    if server_info.version != PROTOCOL_VERSION {
        return Err(RelayError::ProtocolMismatch {
            ours: PROTOCOL_VERSION,
            theirs: server_info.version,
        });
    }

    debug!(
        "Handshake complete with {} (generation {})",
        server_key.short_string(),
        generation
    );

    Ok(Connection::new(
        generation,
        config.private_key.clone(),
        server_key,
        server_info,
        reader,
        write_half,
    ))
}
