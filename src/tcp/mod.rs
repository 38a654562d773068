//! OSC over TCP: packets are delimited by a [FramingMode](crate::framing::FramingMode) that
//!  both sides of a connection agree on.

pub mod tcp_client;
pub mod tcp_server;

use std::io;
use std::net::SocketAddr;
use bytes::BytesMut;
use rosc::OscPacket;
use tokio::io::AsyncReadExt;
use tokio::net::tcp::OwnedReadHalf;
use tracing::{debug, trace, warn};
use crate::codec::encode_packet;
use crate::dispatch_queue::DispatchQueue;
use crate::framing::{encode_frame, FrameDecoder, FramingMode};

const READ_BUF_SIZE: usize = 8192;

/// Reads frames from a connection and hands them to the dispatch queue until the connection is
///  closed. Returns `Ok` if the peer closed the connection regularly.
pub(crate) async fn receive_loop(mut reader: OwnedReadHalf, remote: SocketAddr, mut decoder: FrameDecoder, queue: DispatchQueue) -> io::Result<()> {
    debug!("starting receive loop for {:?}", remote);

    let mut buf = vec![0u8; READ_BUF_SIZE];
    loop {
        let num_read = reader.read(&mut buf).await?;
        if num_read == 0 {
            if decoder.buffered_len() > 0 {
                debug!("connection to {:?} closed with {} bytes of an incomplete frame", remote, decoder.buffered_len());
            }
            return Ok(());
        }
        trace!("read {} bytes from {:?}", num_read, remote);

        decoder.push(&buf[..num_read]);
        loop {
            match decoder.next_frame() {
                Ok(Some(frame)) => queue.decode_and_dispatch(&frame, remote),
                Ok(None) => break,
                Err(e) => warn!("discarding frame from {:?}: {}", remote, e),
            }
        }
    }
}

pub(crate) fn frame_packet(framing: FramingMode, packet: &OscPacket) -> anyhow::Result<BytesMut> {
    let payload = encode_packet(packet)?;
    let mut buf = BytesMut::new();
    encode_frame(framing, &payload, &mut buf)?;
    Ok(buf)
}
