//! Multipart message framing over byte streams.
//!
//! Every frame travels as one length-delimited chunk whose first byte is a
//! flag: [`MORE`] when another frame of the same message follows, [`LAST`]
//! on the final frame. A message is handed to the caller only once its last
//! frame has arrived, and an encoded message is always written to the send
//! buffer whole, so peers never observe half a message. Incoming messages
//! are bounded in frame count and total size.

use std::{io, net::SocketAddr};

use bytes::{BufMut, Bytes, BytesMut};
use futures_util::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    net::TcpStream,
};
use tokio_util::codec::{Decoder, Encoder, Framed, LengthDelimitedCodec};

pub const MORE: u8 = 0x01;
pub const LAST: u8 = 0x00;
pub const MAX_FRAME_LENGTH: usize = 16 * 1024 * 1024;
/// Most frames a single message may carry.
pub const MAX_MESSAGE_FRAMES: usize = 16;
/// Most payload bytes a single message may carry across all its frames.
pub const MAX_MESSAGE_LENGTH: usize = 32 * 1024 * 1024;

/// One message: an ordered, non-empty list of frames.
pub type Multipart = Vec<Bytes>;

#[derive(Debug)]
pub struct MultipartCodec {
    chunks: LengthDelimitedCodec,
    pending: Multipart,
    pending_length: usize,
    max_frames: usize,
    max_message_length: usize,
}

impl MultipartCodec {
    pub fn new() -> Self {
        Self::with_limits(MAX_MESSAGE_FRAMES, MAX_MESSAGE_LENGTH)
    }

    /// A codec that refuses messages with more than `max_frames` frames or
    /// more than `max_message_length` payload bytes.
    pub fn with_limits(max_frames: usize, max_message_length: usize) -> Self {
        Self {
            chunks: LengthDelimitedCodec::builder()
                .max_frame_length(MAX_FRAME_LENGTH)
                .new_codec(),
            pending: Vec::new(),
            pending_length: 0,
            max_frames,
            max_message_length,
        }
    }

    fn push_frame(&mut self, frame: Bytes) -> io::Result<()> {
        if self.pending.len() == self.max_frames {
            return Err(invalid_data(format!(
                "message exceeds {} frames",
                self.max_frames
            )));
        }
        self.pending_length += frame.len();
        if self.pending_length > self.max_message_length {
            return Err(invalid_data(format!(
                "message exceeds {} bytes",
                self.max_message_length
            )));
        }
        self.pending.push(frame);
        Ok(())
    }
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder for MultipartCodec {
    type Item = Multipart;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> io::Result<Option<Multipart>> {
        while let Some(mut chunk) = self.chunks.decode(src)? {
            if chunk.is_empty() {
                return Err(invalid_data("frame is missing its flag byte".to_string()));
            }
            let flag = chunk.split_to(1)[0];
            match flag {
                MORE => self.push_frame(chunk.freeze())?,
                LAST => {
                    self.push_frame(chunk.freeze())?;
                    self.pending_length = 0;
                    return Ok(Some(std::mem::take(&mut self.pending)));
                }
                other => return Err(invalid_data(format!("unknown frame flag {other:#04x}"))),
            }
        }
        Ok(None)
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> io::Result<Option<Multipart>> {
        match self.decode(src)? {
            Some(message) => Ok(Some(message)),
            None if src.is_empty() && self.pending.is_empty() => Ok(None),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "connection closed mid-message",
            )),
        }
    }
}

impl Encoder<Multipart> for MultipartCodec {
    type Error = io::Error;

    fn encode(&mut self, message: Multipart, dst: &mut BytesMut) -> io::Result<()> {
        if message.is_empty() {
            return Err(invalid_data("cannot send a message without frames".to_string()));
        }

        let last = message.len() - 1;
        for (index, frame) in message.into_iter().enumerate() {
            let mut chunk = BytesMut::with_capacity(frame.len() + 1);
            chunk.put_u8(if index == last { LAST } else { MORE });
            chunk.extend_from_slice(&frame);
            self.chunks.encode(chunk.freeze(), dst)?;
        }
        Ok(())
    }
}

fn invalid_data(message: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, message)
}

/// A message-oriented connection to one peer.
pub struct Connection<S = TcpStream> {
    framed: Framed<S, MultipartCodec>,
}

impl Connection<TcpStream> {
    pub async fn connect(addr: SocketAddr) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        stream.set_nodelay(true)?;
        Ok(Self::new(stream))
    }
}

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(stream: S) -> Self {
        Self {
            framed: Framed::new(stream, MultipartCodec::new()),
        }
    }

    pub async fn send(&mut self, message: Multipart) -> io::Result<()> {
        self.framed.send(message).await
    }

    /// Queues every message and flushes once at the end.
    pub async fn send_batch<I>(&mut self, messages: I) -> io::Result<()>
    where
        I: IntoIterator<Item = Multipart>,
    {
        for message in messages {
            self.framed.feed(message).await?;
        }
        self.framed.flush().await
    }

    /// Returns `Ok(None)` once the peer has closed the connection.
    ///
    /// Cancel safe: a partially received message stays buffered for the
    /// next call.
    pub async fn recv(&mut self) -> io::Result<Option<Multipart>> {
        self.framed.next().await.transpose()
    }

    /// Flushes anything queued and shuts down the write half.
    pub async fn close(&mut self) -> io::Result<()> {
        self.framed.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frames(parts: &[&'static [u8]]) -> Multipart {
        parts.iter().map(|part| Bytes::from_static(part)).collect()
    }

    #[tokio::test]
    async fn multipart_messages_keep_frame_boundaries() {
        let (client, server) = tokio::io::duplex(1024);
        let mut client = Connection::new(client);
        let mut server = Connection::new(server);

        client
            .send_batch(vec![frames(&[b"key", b"", b"body"]), frames(&[b"ICANHAZ?"])])
            .await
            .expect("send batch");

        let first = server.recv().await.expect("recv").expect("first message");
        assert_eq!(first, frames(&[b"key", b"", b"body"]));
        let second = server.recv().await.expect("recv").expect("second message");
        assert_eq!(second, frames(&[b"ICANHAZ?"]));
    }

    #[tokio::test]
    async fn closed_peer_reads_as_none() {
        let (client, server) = tokio::io::duplex(64);
        drop(client);
        let mut server = Connection::new(server);
        assert!(server.recv().await.expect("clean eof").is_none());
    }

    #[test]
    fn truncated_message_is_an_error_at_eof() {
        let mut codec = MultipartCodec::new();
        let mut buffer = BytesMut::new();
        let mut chunks = LengthDelimitedCodec::new();
        chunks
            .encode(Bytes::from_static(b"\x01key"), &mut buffer)
            .expect("encode chunk");

        assert!(codec.decode(&mut buffer).expect("decode").is_none());
        let err = codec.decode_eof(&mut buffer).expect_err("dangling frame");
        assert_eq!(err.kind(), io::ErrorKind::UnexpectedEof);
    }

    #[test]
    fn unknown_flag_is_rejected() {
        let mut codec = MultipartCodec::new();
        let mut buffer = BytesMut::new();
        LengthDelimitedCodec::new()
            .encode(Bytes::from_static(b"\x07oops"), &mut buffer)
            .expect("encode chunk");

        let err = codec.decode(&mut buffer).expect_err("bad flag");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    fn encode_chunks(chunks: &[&'static [u8]]) -> BytesMut {
        let mut buffer = BytesMut::new();
        let mut codec = LengthDelimitedCodec::new();
        for chunk in chunks {
            codec
                .encode(Bytes::from_static(chunk), &mut buffer)
                .expect("encode chunk");
        }
        buffer
    }

    #[test]
    fn endless_message_is_cut_off_at_the_frame_limit() {
        let mut codec = MultipartCodec::with_limits(3, 1024);
        let mut buffer = encode_chunks(&[b"\x01a", b"\x01b", b"\x01c", b"\x01d"]);

        let err = codec.decode(&mut buffer).expect_err("too many frames");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn oversized_message_is_rejected() {
        let mut codec = MultipartCodec::with_limits(16, 8);
        let mut buffer = encode_chunks(&[b"\x0112345", b"\x0067890"]);

        let err = codec.decode(&mut buffer).expect_err("too many bytes");
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[test]
    fn limits_apply_per_message() {
        let mut codec = MultipartCodec::with_limits(3, 6);
        let mut buffer = encode_chunks(&[
            b"\x01ab", b"\x01cd", b"\x00ef",
            b"\x01gh", b"\x01ij", b"\x00kl",
        ]);

        let first = codec.decode(&mut buffer).expect("decode").expect("first");
        assert_eq!(first, frames(&[b"ab", b"cd", b"ef"]));
        let second = codec.decode(&mut buffer).expect("decode").expect("second");
        assert_eq!(second, frames(&[b"gh", b"ij", b"kl"]));
    }

    #[test]
    fn empty_message_cannot_be_encoded() {
        let mut codec = MultipartCodec::new();
        let mut buffer = BytesMut::new();
        assert!(codec.encode(Vec::new(), &mut buffer).is_err());
        assert!(buffer.is_empty());
    }
}
