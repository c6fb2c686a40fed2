//! HTTP/2 frame encoding.

use bytes::{BufMut, BytesMut};

use super::types::{flags, *};
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};

/// Serializes HTTP/2 frames into a byte buffer.
pub struct FrameEncoder {
    max_frame_size: u32,
}

impl Default for FrameEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameEncoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Apply the peer's SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    pub fn max_frame_size(&self) -> u32 {
        self.max_frame_size
    }

    /// Encode a frame into `buf`. DATA frames larger than the maximum
    /// frame size are split; END_STREAM goes on the final piece.
    pub fn encode(&self, frame: &Frame, buf: &mut BytesMut) {
        match frame {
            Frame::Data(f) => self.encode_data(f, buf),
            Frame::Headers(f) => self.encode_headers(f, buf),
            Frame::Priority(f) => self.encode_priority(f, buf),
            Frame::RstStream(f) => self.encode_rst_stream(f, buf),
            Frame::Settings(f) => self.encode_settings(f, buf),
            Frame::PushPromise(f) => self.encode_push_promise(f, buf),
            Frame::Ping(f) => self.encode_ping(f, buf),
            Frame::GoAway(f) => self.encode_goaway(f, buf),
            Frame::WindowUpdate(f) => self.encode_window_update(f, buf),
            Frame::Continuation(f) => self.encode_continuation(f, buf),
            Frame::Unknown(f) => self.encode_unknown(f, buf),
        }
    }

    #[inline]
    fn header(
        &self,
        buf: &mut BytesMut,
        length: usize,
        frame_type: FrameType,
        frame_flags: u8,
        stream_id: StreamId,
    ) {
        buf.reserve(FRAME_HEADER_SIZE + length);
        let length = length as u32;
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);
        buf.put_u8(frame_type as u8);
        buf.put_u8(frame_flags);
        buf.put_u32(stream_id.value());
    }

    fn encode_data(&self, frame: &DataFrame, buf: &mut BytesMut) {
        let max = self.max_frame_size as usize;
        let mut rest = frame.data.as_ref();

        loop {
            let take = rest.len().min(max);
            let (piece, remainder) = rest.split_at(take);
            rest = remainder;

            let last = rest.is_empty();
            let frame_flags = if last && frame.end_stream {
                flags::END_STREAM
            } else {
                0
            };
            self.header(buf, piece.len(), FrameType::Data, frame_flags, frame.stream_id);
            buf.extend_from_slice(piece);

            if last {
                break;
            }
        }
    }

    fn encode_headers(&self, frame: &HeadersFrame, buf: &mut BytesMut) {
        let mut frame_flags = 0u8;
        if frame.end_stream {
            frame_flags |= flags::END_STREAM;
        }
        if frame.end_headers {
            frame_flags |= flags::END_HEADERS;
        }
        if frame.priority.is_some() {
            frame_flags |= flags::PRIORITY;
        }

        let priority_len = if frame.priority.is_some() { 5 } else { 0 };
        let length = priority_len + frame.header_block.len();

        self.header(buf, length, FrameType::Headers, frame_flags, frame.stream_id);

        if let Some(priority) = &frame.priority {
            put_priority_fields(buf, priority);
        }
        buf.extend_from_slice(&frame.header_block);
    }

    fn encode_priority(&self, frame: &PriorityFrame, buf: &mut BytesMut) {
        self.header(buf, 5, FrameType::Priority, 0, frame.stream_id);
        put_priority_fields(buf, &frame.priority);
    }

    fn encode_rst_stream(&self, frame: &RstStreamFrame, buf: &mut BytesMut) {
        self.header(buf, 4, FrameType::RstStream, 0, frame.stream_id);
        buf.put_u32(frame.error_code);
    }

    fn encode_settings(&self, frame: &SettingsFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.ack { flags::ACK } else { 0 };
        let length = if frame.ack { 0 } else { frame.settings.len() * 6 };

        self.header(
            buf,
            length,
            FrameType::Settings,
            frame_flags,
            StreamId::CONNECTION,
        );

        if !frame.ack {
            for setting in &frame.settings {
                buf.put_u16(setting.id.to_u16());
                buf.put_u32(setting.value);
            }
        }
    }

    fn encode_push_promise(&self, frame: &PushPromiseFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.end_headers {
            flags::END_HEADERS
        } else {
            0
        };
        let length = 4 + frame.header_block.len();

        self.header(
            buf,
            length,
            FrameType::PushPromise,
            frame_flags,
            frame.stream_id,
        );
        buf.put_u32(frame.promised_stream_id.value());
        buf.extend_from_slice(&frame.header_block);
    }

    fn encode_ping(&self, frame: &PingFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.ack { flags::ACK } else { 0 };
        self.header(buf, 8, FrameType::Ping, frame_flags, StreamId::CONNECTION);
        buf.extend_from_slice(&frame.data);
    }

    fn encode_goaway(&self, frame: &GoAwayFrame, buf: &mut BytesMut) {
        let length = 8 + frame.debug_data.len();
        self.header(buf, length, FrameType::GoAway, 0, StreamId::CONNECTION);
        buf.put_u32(frame.last_stream_id.value());
        buf.put_u32(frame.error_code);
        buf.extend_from_slice(&frame.debug_data);
    }

    fn encode_window_update(&self, frame: &WindowUpdateFrame, buf: &mut BytesMut) {
        self.header(buf, 4, FrameType::WindowUpdate, 0, frame.stream_id);
        buf.put_u32(frame.increment & 0x7FFF_FFFF);
    }

    fn encode_continuation(&self, frame: &ContinuationFrame, buf: &mut BytesMut) {
        let frame_flags = if frame.end_headers {
            flags::END_HEADERS
        } else {
            0
        };
        self.header(
            buf,
            frame.header_block.len(),
            FrameType::Continuation,
            frame_flags,
            frame.stream_id,
        );
        buf.extend_from_slice(&frame.header_block);
    }

    fn encode_unknown(&self, frame: &UnknownFrame, buf: &mut BytesMut) {
        let length = frame.payload.len() as u32;
        buf.reserve(FRAME_HEADER_SIZE + frame.payload.len());
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);
        buf.put_u8(frame.frame_type);
        buf.put_u8(frame.flags);
        buf.put_u32(frame.stream_id.value());
        buf.extend_from_slice(&frame.payload);
    }
}

fn put_priority_fields(buf: &mut BytesMut, priority: &Priority) {
    let mut dep = priority.dependency.value();
    if priority.exclusive {
        dep |= 0x8000_0000;
    }
    buf.put_u32(dep);
    buf.put_u8(priority.weight);
}
