//! Thin wrapper around the `rosc` codec, converting its errors to `anyhow`.

use anyhow::anyhow;
use rosc::{decoder, encoder, OscPacket};
use tracing::debug;

pub fn decode_packet(buf: &[u8]) -> anyhow::Result<OscPacket> {
    let (rest, packet) = decoder::decode_udp(buf)
        .map_err(|e| anyhow!("malformed OSC packet: {:?}", e))?;

    if !rest.is_empty() {
        debug!("ignoring {} trailing bytes after OSC packet", rest.len());
    }
    Ok(packet)
}

pub fn encode_packet(packet: &OscPacket) -> anyhow::Result<Vec<u8>> {
    encoder::encode(packet)
        .map_err(|e| anyhow!("OSC packet can not be encoded: {:?}", e))
}
