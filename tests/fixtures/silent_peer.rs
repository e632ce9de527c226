//! A peer that accepts channels and never answers on its own.
//!
//! Tests use it to hold requests pending, then drive the remote side by
//! hand: late responses, garbage bytes, closed channels.

use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use skein_core::{Frame, FrameCodec, FrameDecoder, Node, ResponseStatus};
use skein_transport::{Channel, ChannelHandler, ChannelRef, MemoryNetwork, TransportError};
use std::sync::Arc;

#[derive(Default)]
struct Inbound {
    decoder: FrameDecoder,
    buffer: BytesMut,
    frames: Vec<Frame>,
}

/// Listener that records what it receives
#[derive(Default)]
pub struct SilentPeer {
    channels: Mutex<Vec<ChannelRef>>,
    inbound: Mutex<Inbound>,
}

impl SilentPeer {
    /// Listen on `host:port` of `network` and return the peer with the node
    /// addressing it
    ///
    /// # Panics
    ///
    /// Panics if the address is already taken.
    pub fn listen(network: &MemoryNetwork, host: &str, port: u16) -> (Arc<Self>, Node) {
        let peer = Arc::new(Self::default());
        network
            .listen(host, port, peer.clone())
            .expect("silent peer address is free");
        (peer, Node::new(host, host, port))
    }

    /// Channels accepted so far
    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }

    /// Frames decoded so far
    pub fn frames(&self) -> Vec<Frame> {
        self.inbound.lock().frames.clone()
    }

    /// Number of frames decoded so far
    pub fn frame_count(&self) -> usize {
        self.inbound.lock().frames.len()
    }

    fn latest_channel(&self) -> Option<ChannelRef> {
        self.channels.lock().last().cloned()
    }

    /// Answer `request` with status OK on the most recent channel
    pub fn respond(&self, request: &Frame, payload: &'static [u8]) {
        let response = Frame::response_to(request, ResponseStatus::Ok, Bytes::from_static(payload));
        let bytes = FrameCodec::default()
            .encode(&response)
            .expect("response encodes");
        self.write_raw(bytes);
    }

    /// Write raw bytes on the most recent channel
    pub fn write_raw(&self, bytes: Bytes) {
        if let Some(channel) = self.latest_channel() {
            channel.write(bytes, Box::new(|_| {}));
        }
    }

    /// Close every accepted channel
    pub fn close_all(&self) {
        for channel in self.channels.lock().iter() {
            channel.close();
        }
    }
}

impl ChannelHandler for SilentPeer {
    fn on_open(&self, channel: &ChannelRef) {
        self.channels.lock().push(channel.clone());
    }

    fn on_read(&self, _channel: &ChannelRef, bytes: Bytes) {
        let mut inbound = self.inbound.lock();
        let state = &mut *inbound;
        state.buffer.extend_from_slice(&bytes);
        while let Ok(Some(frame)) = state.decoder.decode(&mut state.buffer) {
            state.frames.push(frame);
        }
    }

    fn on_closed(&self, _channel: &ChannelRef, _cause: Option<TransportError>) {}
}
