//! Length-delimited framing for stream transports.
//!
//! Every frame is a 5-byte header followed by the body:
//!
//! ```text
//! [u32 length (LE, counts kind byte + body)][u8 kind][body]
//! ```
//!
//! [`FrameComposer`] accumulates raw socket chunks and yields whole frames in
//! arrival order, whatever the chunk boundaries. A framing error poisons the
//! composer: the stream position is unknown afterwards, so the connection has
//! to be closed.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::ProtocolError;

/// Size of the length prefix.
pub const LENGTH_PREFIX_SIZE: usize = 4;

/// Size of the full frame header (length prefix + kind byte).
pub const FRAME_HEADER_SIZE: usize = LENGTH_PREFIX_SIZE + 1;

/// Default maximum frame length (kind byte + body), 4 MiB.
pub const DEFAULT_MAX_FRAME_LENGTH: usize = 4 * 1024 * 1024;

/// What a frame carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameKind {
    /// Client hello; asks the server for its service index.
    Connect = 0x01,
    /// Server's service index (JSON).
    Handshake = 0x02,
    /// One encoded envelope.
    Message = 0x03,
    /// Several encoded envelopes, in order.
    Batch = 0x04,
    /// Keepalive request.
    Ping = 0x05,
    /// Keepalive answer.
    Pong = 0x06,
}

impl TryFrom<u8> for FrameKind {
    type Error = ProtocolError;

    fn try_from(raw: u8) -> Result<Self, Self::Error> {
        match raw {
            0x01 => Ok(FrameKind::Connect),
            0x02 => Ok(FrameKind::Handshake),
            0x03 => Ok(FrameKind::Message),
            0x04 => Ok(FrameKind::Batch),
            0x05 => Ok(FrameKind::Ping),
            0x06 => Ok(FrameKind::Pong),
            other => Err(ProtocolError::UnknownFrameKind(other)),
        }
    }
}

/// A single decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// Frame kind.
    pub kind: FrameKind,
    /// Frame body, possibly empty.
    pub body: Bytes,
}

impl Frame {
    /// Creates a frame.
    pub fn new(kind: FrameKind, body: impl Into<Bytes>) -> Self {
        Self {
            kind,
            body: body.into(),
        }
    }

    /// A frame with no body.
    pub fn control(kind: FrameKind) -> Self {
        Self {
            kind,
            body: Bytes::new(),
        }
    }

    /// Encoded size including the header.
    pub fn wire_len(&self) -> usize {
        FRAME_HEADER_SIZE + self.body.len()
    }
}

/// Reassembles frames from an unbounded byte stream.
#[derive(Debug)]
pub struct FrameComposer {
    max_frame_length: usize,
    buf: BytesMut,
    poisoned: bool,
    deferred: Option<ProtocolError>,
}

impl FrameComposer {
    /// Creates a composer enforcing `max_frame_length` (kind byte + body).
    pub fn new(max_frame_length: usize) -> Self {
        Self {
            max_frame_length,
            buf: BytesMut::new(),
            poisoned: false,
            deferred: None,
        }
    }

    /// Maximum accepted frame length.
    pub fn max_frame_length(&self) -> usize {
        self.max_frame_length
    }

    /// Bytes buffered but not yet part of a complete frame.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Returns true once a framing error has been reported.
    pub fn is_poisoned(&self) -> bool {
        self.poisoned
    }

    /// Returns the framing error not yet reported, or `Poisoned` if it was.
    pub fn take_error(&mut self) -> Option<ProtocolError> {
        if let Some(err) = self.deferred.take() {
            return Some(err);
        }
        self.poisoned.then_some(ProtocolError::Poisoned)
    }

    /// Appends a chunk and returns every frame completed by it, in order.
    ///
    /// Frames that precede a framing error in the same chunk are still
    /// returned; the error itself comes from the next call to `feed`,
    /// `next_frame` or `take_error`.
    pub fn feed(&mut self, chunk: &[u8]) -> Result<Vec<Frame>, ProtocolError> {
        if let Some(err) = self.take_error() {
            return Err(err);
        }
        self.buf.extend_from_slice(chunk);
        let mut frames = Vec::new();
        loop {
            match self.next_frame() {
                Ok(Some(frame)) => frames.push(frame),
                Ok(None) => break,
                Err(err) if frames.is_empty() => return Err(err),
                Err(err) => {
                    self.deferred = Some(err);
                    break;
                }
            }
        }
        Ok(frames)
    }

    /// Pops the next complete frame from the buffer, if there is one.
    pub fn next_frame(&mut self) -> Result<Option<Frame>, ProtocolError> {
        if let Some(err) = self.deferred.take() {
            return Err(err);
        }
        if self.poisoned {
            return Err(ProtocolError::Poisoned);
        }
        if self.buf.len() < LENGTH_PREFIX_SIZE {
            return Ok(None);
        }
        let mut prefix = [0u8; LENGTH_PREFIX_SIZE];
        prefix.copy_from_slice(&self.buf[..LENGTH_PREFIX_SIZE]);
        let length = u32::from_le_bytes(prefix) as usize;
        if length == 0 {
            return Err(self.poison(ProtocolError::EmptyFrame));
        }
        if length > self.max_frame_length {
            return Err(self.poison(ProtocolError::FrameTooLarge {
                size: length,
                max_size: self.max_frame_length,
            }));
        }
        if self.buf.len() >= FRAME_HEADER_SIZE {
            if let Err(e) = FrameKind::try_from(self.buf[LENGTH_PREFIX_SIZE]) {
                return Err(self.poison(e));
            }
        }
        if self.buf.len() < LENGTH_PREFIX_SIZE + length {
            self.buf.reserve(LENGTH_PREFIX_SIZE + length - self.buf.len());
            return Ok(None);
        }
        self.buf.advance(LENGTH_PREFIX_SIZE);
        let mut payload = self.buf.split_to(length);
        let kind = FrameKind::try_from(payload.get_u8())?;
        Ok(Some(Frame {
            kind,
            body: payload.freeze(),
        }))
    }

    fn poison(&mut self, err: ProtocolError) -> ProtocolError {
        self.poisoned = true;
        self.buf.clear();
        err
    }

    /// Encodes a frame, rejecting bodies above the maximum length.
    pub fn compose(&self, frame: &Frame) -> Result<Bytes, ProtocolError> {
        encode_frame(frame, self.max_frame_length)
    }
}

/// Encodes a frame with its header.
pub fn encode_frame(frame: &Frame, max_frame_length: usize) -> Result<Bytes, ProtocolError> {
    let length = frame.body.len() + 1;
    if length > max_frame_length {
        return Err(ProtocolError::FrameTooLarge {
            size: length,
            max_size: max_frame_length,
        });
    }
    let mut out = BytesMut::with_capacity(LENGTH_PREFIX_SIZE + length);
    out.put_u32_le(length as u32);
    out.put_u8(frame.kind as u8);
    out.put_slice(&frame.body);
    Ok(out.freeze())
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn sample_frames() -> Vec<Frame> {
        vec![
            Frame::control(FrameKind::Connect),
            Frame::new(FrameKind::Message, Bytes::from_static(b"hello")),
            Frame::new(FrameKind::Batch, Bytes::from(vec![7u8; 300])),
            Frame::control(FrameKind::Ping),
        ]
    }

    fn wire(frames: &[Frame]) -> Vec<u8> {
        let mut out = Vec::new();
        for frame in frames {
            out.extend_from_slice(&encode_frame(frame, DEFAULT_MAX_FRAME_LENGTH).unwrap());
        }
        out
    }

    #[test]
    fn test_header_layout() {
        let bytes = encode_frame(&Frame::new(FrameKind::Message, Bytes::from_static(b"ab")), 64).unwrap();
        assert_eq!(&bytes[..], &[3, 0, 0, 0, 0x03, b'a', b'b']);
    }

    #[test]
    fn test_coalesced_frames() {
        let frames = sample_frames();
        let mut composer = FrameComposer::new(DEFAULT_MAX_FRAME_LENGTH);
        let decoded = composer.feed(&wire(&frames)).unwrap();
        assert_eq!(decoded, frames);
        assert_eq!(composer.buffered(), 0);
    }

    #[test]
    fn test_fragmented_frames_byte_by_byte() {
        let frames = sample_frames();
        let mut composer = FrameComposer::new(DEFAULT_MAX_FRAME_LENGTH);
        let mut decoded = Vec::new();
        for byte in wire(&frames) {
            decoded.extend(composer.feed(&[byte]).unwrap());
        }
        assert_eq!(decoded, frames);
    }

    #[test]
    fn test_frame_too_large_poisons() {
        let mut composer = FrameComposer::new(16);
        let oversized = encode_frame(&Frame::new(FrameKind::Message, vec![0u8; 64]), 1024).unwrap();
        let err = composer.feed(&oversized[..4]).unwrap_err();
        assert_eq!(err, ProtocolError::FrameTooLarge { size: 65, max_size: 16 });
        assert!(composer.is_poisoned());
        let ok = encode_frame(&Frame::control(FrameKind::Ping), 16).unwrap();
        assert_eq!(composer.feed(&ok).unwrap_err(), ProtocolError::Poisoned);
    }

    #[test]
    fn test_frames_before_error_are_kept() {
        let mut composer = FrameComposer::new(1024);
        let mut chunk = wire(&sample_frames()[..2]);
        chunk.extend_from_slice(&[1, 0, 0, 0, 0x7F]);

        let frames = composer.feed(&chunk).unwrap();
        assert_eq!(frames, sample_frames()[..2].to_vec());
        assert!(composer.is_poisoned());
        assert_eq!(composer.take_error(), Some(ProtocolError::UnknownFrameKind(0x7F)));
        assert_eq!(composer.take_error(), Some(ProtocolError::Poisoned));
    }

    #[test]
    fn test_deferred_error_reported_by_next_feed() {
        let mut composer = FrameComposer::new(1024);
        let mut chunk = wire(&[Frame::control(FrameKind::Ping)]);
        chunk.extend_from_slice(&[0, 0, 0, 0]);

        assert_eq!(composer.feed(&chunk).unwrap(), vec![Frame::control(FrameKind::Ping)]);
        let ok = wire(&[Frame::control(FrameKind::Pong)]);
        assert_eq!(composer.feed(&ok).unwrap_err(), ProtocolError::EmptyFrame);
        assert_eq!(composer.feed(&ok).unwrap_err(), ProtocolError::Poisoned);
    }

    #[test]
    fn test_healthy_composer_has_no_error() {
        let mut composer = FrameComposer::new(1024);
        composer.feed(&wire(&sample_frames())).unwrap();
        assert_eq!(composer.take_error(), None);
    }

    #[test]
    fn test_unknown_kind_rejected_before_body_arrives() {
        let mut composer = FrameComposer::new(1024);
        let err = composer.feed(&[10, 0, 0, 0, 0x7F]).unwrap_err();
        assert_eq!(err, ProtocolError::UnknownFrameKind(0x7F));
    }

    #[test]
    fn test_zero_length_rejected() {
        let mut composer = FrameComposer::new(1024);
        assert_eq!(composer.feed(&[0, 0, 0, 0]).unwrap_err(), ProtocolError::EmptyFrame);
    }

    #[test]
    fn test_compose_rejects_oversized_body() {
        let composer = FrameComposer::new(8);
        let err = composer
            .compose(&Frame::new(FrameKind::Message, vec![0u8; 8]))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::FrameTooLarge { size: 9, max_size: 8 }));
    }

    proptest! {
        #[test]
        fn prop_any_split_points_yield_same_frames(
            bodies in proptest::collection::vec(proptest::collection::vec(any::<u8>(), 0..64), 1..8),
            cuts in proptest::collection::vec(1usize..40, 0..16),
        ) {
            let frames: Vec<Frame> = bodies
                .into_iter()
                .map(|b| Frame::new(FrameKind::Message, b))
                .collect();
            let bytes = wire(&frames);
            let mut composer = FrameComposer::new(DEFAULT_MAX_FRAME_LENGTH);
            let mut decoded = Vec::new();
            let mut rest = &bytes[..];
            for cut in cuts {
                let cut = cut.min(rest.len());
                let (chunk, tail) = rest.split_at(cut);
                decoded.extend(composer.feed(chunk).unwrap());
                rest = tail;
            }
            decoded.extend(composer.feed(rest).unwrap());
            prop_assert_eq!(decoded, frames);
        }
    }
}
