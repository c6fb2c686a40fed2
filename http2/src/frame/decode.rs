//! HTTP/2 frame decoding.

use bytes::{Buf, Bytes, BytesMut};

use super::error::FrameError;
use super::types::{flags, *};
use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_HEADER_SIZE};

/// Incremental frame parser.
///
/// `decode` pulls one complete frame off the front of the receive buffer,
/// returning `Ok(None)` until enough bytes have arrived.
pub struct FrameDecoder {
    max_frame_size: u32,
}

impl Default for FrameDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self {
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Apply our advertised SETTINGS_MAX_FRAME_SIZE.
    pub fn set_max_frame_size(&mut self, size: u32) {
        self.max_frame_size = size;
    }

    /// Peek at the next frame header without consuming it.
    pub fn peek_header(&self, buf: &[u8]) -> Option<FrameHeader> {
        if buf.len() < FRAME_HEADER_SIZE {
            return None;
        }
        Some(FrameHeader {
            length: (u32::from(buf[0]) << 16) | (u32::from(buf[1]) << 8) | u32::from(buf[2]),
            frame_type: buf[3],
            flags: buf[4],
            stream_id: StreamId::new(u32::from_be_bytes([buf[5], buf[6], buf[7], buf[8]])),
        })
    }

    /// Decode the next complete frame from `buf`, consuming its bytes.
    pub fn decode(&self, buf: &mut BytesMut) -> Result<Option<Frame>, FrameError> {
        let Some(hd) = self.peek_header(buf) else {
            return Ok(None);
        };

        if hd.length > self.max_frame_size {
            return Err(FrameError::TooLarge {
                length: hd.length,
                max: self.max_frame_size,
            });
        }

        if buf.len() < FRAME_HEADER_SIZE + hd.length as usize {
            return Ok(None);
        }

        buf.advance(FRAME_HEADER_SIZE);
        let mut payload = buf.split_to(hd.length as usize).freeze();

        let frame = match hd.known_type() {
            Some(FrameType::Data) => self.parse_data(&hd, payload)?,
            Some(FrameType::Headers) => self.parse_headers(&hd, payload)?,
            Some(FrameType::Priority) => self.parse_priority(&hd, &payload)?,
            Some(FrameType::RstStream) => self.parse_rst_stream(&hd, &payload)?,
            Some(FrameType::Settings) => self.parse_settings(&hd, &payload)?,
            Some(FrameType::PushPromise) => self.parse_push_promise(&hd, payload)?,
            Some(FrameType::Ping) => self.parse_ping(&hd, &payload)?,
            Some(FrameType::GoAway) => self.parse_goaway(&hd, &mut payload)?,
            Some(FrameType::WindowUpdate) => self.parse_window_update(&hd, &payload)?,
            Some(FrameType::Continuation) => Frame::Continuation(ContinuationFrame {
                stream_id: hd.stream_id,
                end_headers: hd.has_flag(flags::END_HEADERS),
                header_block: payload,
            }),
            None => Frame::Unknown(UnknownFrame {
                frame_type: hd.frame_type,
                flags: hd.flags,
                stream_id: hd.stream_id,
                payload,
            }),
        };

        Ok(Some(frame))
    }

    fn parse_data(&self, hd: &FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if hd.stream_id.is_connection_level() {
            return Err(FrameError::BadStreamId {
                frame_type: hd.frame_type,
            });
        }
        let data = strip_padding(hd, payload)?;
        Ok(Frame::Data(DataFrame {
            stream_id: hd.stream_id,
            end_stream: hd.has_flag(flags::END_STREAM),
            data,
        }))
    }

    fn parse_headers(&self, hd: &FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        if hd.stream_id.is_connection_level() {
            return Err(FrameError::BadStreamId {
                frame_type: hd.frame_type,
            });
        }
        let mut body = strip_padding(hd, payload)?;

        let priority = if hd.has_flag(flags::PRIORITY) {
            if body.len() < 5 {
                return Err(FrameError::BadLength {
                    frame_type: hd.frame_type,
                    length: hd.length,
                });
            }
            let dep = body.get_u32();
            let weight = body.get_u8();
            Some(Priority {
                exclusive: dep & 0x8000_0000 != 0,
                dependency: StreamId::new(dep),
                weight,
            })
        } else {
            None
        };

        Ok(Frame::Headers(HeadersFrame {
            stream_id: hd.stream_id,
            end_stream: hd.has_flag(flags::END_STREAM),
            end_headers: hd.has_flag(flags::END_HEADERS),
            priority,
            header_block: body,
        }))
    }

    fn parse_priority(&self, hd: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
        if payload.len() != 5 {
            return Err(FrameError::BadLength {
                frame_type: hd.frame_type,
                length: hd.length,
            });
        }
        let dep = u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]);
        Ok(Frame::Priority(PriorityFrame {
            stream_id: hd.stream_id,
            priority: Priority {
                exclusive: dep & 0x8000_0000 != 0,
                dependency: StreamId::new(dep),
                weight: payload[4],
            },
        }))
    }

    fn parse_rst_stream(&self, hd: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
        if payload.len() != 4 {
            return Err(FrameError::BadLength {
                frame_type: hd.frame_type,
                length: hd.length,
            });
        }
        if hd.stream_id.is_connection_level() {
            return Err(FrameError::BadStreamId {
                frame_type: hd.frame_type,
            });
        }
        Ok(Frame::RstStream(RstStreamFrame {
            stream_id: hd.stream_id,
            error_code: u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]),
        }))
    }

    fn parse_settings(&self, hd: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
        let ack = hd.has_flag(flags::ACK);
        if (ack && !payload.is_empty()) || payload.len() % 6 != 0 {
            return Err(FrameError::BadLength {
                frame_type: hd.frame_type,
                length: hd.length,
            });
        }
        let settings = payload
            .chunks_exact(6)
            .map(|chunk| Setting {
                id: SettingId::from_u16(u16::from_be_bytes([chunk[0], chunk[1]])),
                value: u32::from_be_bytes([chunk[2], chunk[3], chunk[4], chunk[5]]),
            })
            .collect();
        Ok(Frame::Settings(SettingsFrame { ack, settings }))
    }

    fn parse_push_promise(&self, hd: &FrameHeader, payload: Bytes) -> Result<Frame, FrameError> {
        let mut body = strip_padding(hd, payload)?;
        if body.len() < 4 {
            return Err(FrameError::BadLength {
                frame_type: hd.frame_type,
                length: hd.length,
            });
        }
        let promised = body.get_u32();
        Ok(Frame::PushPromise(PushPromiseFrame {
            stream_id: hd.stream_id,
            end_headers: hd.has_flag(flags::END_HEADERS),
            promised_stream_id: StreamId::new(promised),
            header_block: body,
        }))
    }

    fn parse_ping(&self, hd: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
        if payload.len() != 8 {
            return Err(FrameError::BadLength {
                frame_type: hd.frame_type,
                length: hd.length,
            });
        }
        let mut data = [0u8; 8];
        data.copy_from_slice(payload);
        Ok(Frame::Ping(PingFrame {
            ack: hd.has_flag(flags::ACK),
            data,
        }))
    }

    fn parse_goaway(&self, hd: &FrameHeader, payload: &mut Bytes) -> Result<Frame, FrameError> {
        if payload.len() < 8 {
            return Err(FrameError::BadLength {
                frame_type: hd.frame_type,
                length: hd.length,
            });
        }
        let last_stream_id = StreamId::new(payload.get_u32());
        let error_code = payload.get_u32();
        Ok(Frame::GoAway(GoAwayFrame {
            last_stream_id,
            error_code,
            debug_data: payload.clone(),
        }))
    }

    fn parse_window_update(&self, hd: &FrameHeader, payload: &[u8]) -> Result<Frame, FrameError> {
        if payload.len() != 4 {
            return Err(FrameError::BadLength {
                frame_type: hd.frame_type,
                length: hd.length,
            });
        }
        let increment =
            u32::from_be_bytes([payload[0], payload[1], payload[2], payload[3]]) & 0x7FFF_FFFF;
        if increment == 0 {
            return Err(FrameError::ZeroWindowIncrement);
        }
        Ok(Frame::WindowUpdate(WindowUpdateFrame {
            stream_id: hd.stream_id,
            increment,
        }))
    }
}

/// Remove the padding-length octet and trailing padding when PADDED is set.
fn strip_padding(hd: &FrameHeader, mut payload: Bytes) -> Result<Bytes, FrameError> {
    if !hd.has_flag(flags::PADDED) {
        return Ok(payload);
    }
    if payload.is_empty() {
        return Err(FrameError::BadPadding);
    }
    let pad_len = payload.get_u8() as usize;
    if pad_len > payload.len() {
        return Err(FrameError::BadPadding);
    }
    payload.truncate(payload.len() - pad_len);
    Ok(payload)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BufMut;

    fn raw_frame(frame_type: u8, frame_flags: u8, stream_id: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let length = payload.len() as u32;
        buf.put_u8((length >> 16) as u8);
        buf.put_u8((length >> 8) as u8);
        buf.put_u8(length as u8);
        buf.put_u8(frame_type);
        buf.put_u8(frame_flags);
        buf.put_u32(stream_id);
        buf.extend_from_slice(payload);
        buf
    }

    #[test]
    fn incomplete_header_returns_none() {
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::from(&[0u8, 0, 5, 0][..]);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 4); // untouched
    }

    #[test]
    fn incomplete_payload_returns_none() {
        let decoder = FrameDecoder::new();
        let mut buf = raw_frame(0x0, 0, 1, b"hello");
        buf.truncate(FRAME_HEADER_SIZE + 2);
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn oversized_frame_rejected() {
        let decoder = FrameDecoder::new();
        let mut buf = BytesMut::new();
        // Header claims a 1 MiB payload.
        buf.put_u8(0x10);
        buf.put_u8(0x00);
        buf.put_u8(0x00);
        buf.put_u8(0x0);
        buf.put_u8(0);
        buf.put_u32(1);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::TooLarge { .. })
        ));
    }

    #[test]
    fn padded_data_stripped() {
        let decoder = FrameDecoder::new();
        // Payload: pad length 3, "abc", 3 bytes of padding.
        let mut payload = vec![3u8];
        payload.extend_from_slice(b"abc");
        payload.extend_from_slice(&[0, 0, 0]);
        let mut buf = raw_frame(0x0, flags::PADDED, 1, &payload);
        match decoder.decode(&mut buf).unwrap().unwrap() {
            Frame::Data(f) => assert_eq!(&f.data[..], b"abc"),
            other => panic!("expected DATA, got {other:?}"),
        }
    }

    #[test]
    fn bad_padding_rejected() {
        let decoder = FrameDecoder::new();
        // Pad length exceeds remaining payload.
        let mut buf = raw_frame(0x0, flags::PADDED, 1, &[200, 1, 2]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::BadPadding)
        ));
    }

    #[test]
    fn data_on_stream_zero_rejected() {
        let decoder = FrameDecoder::new();
        let mut buf = raw_frame(0x0, 0, 0, b"x");
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::BadStreamId { .. })
        ));
    }

    #[test]
    fn rst_stream_wrong_length_rejected() {
        let decoder = FrameDecoder::new();
        let mut buf = raw_frame(0x3, 0, 1, &[0, 0, 0]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::BadLength { .. })
        ));
    }

    #[test]
    fn settings_length_not_multiple_of_six_rejected() {
        let decoder = FrameDecoder::new();
        let mut buf = raw_frame(0x4, 0, 0, &[0, 4, 0, 0]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::BadLength { .. })
        ));
    }

    #[test]
    fn zero_window_increment_rejected() {
        let decoder = FrameDecoder::new();
        let mut buf = raw_frame(0x8, 0, 0, &[0, 0, 0, 0]);
        assert!(matches!(
            decoder.decode(&mut buf),
            Err(FrameError::ZeroWindowIncrement)
        ));
    }

    #[test]
    fn unknown_frame_type_passes_through() {
        let decoder = FrameDecoder::new();
        let mut buf = raw_frame(0x42, 0x7, 9, b"opaque");
        match decoder.decode(&mut buf).unwrap().unwrap() {
            Frame::Unknown(f) => {
                assert_eq!(f.frame_type, 0x42);
                assert_eq!(f.flags, 0x7);
                assert_eq!(f.stream_id.value(), 9);
                assert_eq!(&f.payload[..], b"opaque");
            }
            other => panic!("expected Unknown, got {other:?}"),
        }
    }

    #[test]
    fn two_frames_decode_in_sequence() {
        let decoder = FrameDecoder::new();
        let mut buf = raw_frame(0x6, 0, 0, &[0; 8]);
        buf.extend_from_slice(&raw_frame(0x8, 0, 0, &[0, 0, 0, 10]));

        assert!(matches!(
            decoder.decode(&mut buf).unwrap().unwrap(),
            Frame::Ping(_)
        ));
        assert!(matches!(
            decoder.decode(&mut buf).unwrap().unwrap(),
            Frame::WindowUpdate(_)
        ));
        assert!(decoder.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn goaway_with_debug_data() {
        let decoder = FrameDecoder::new();
        let mut payload = vec![0, 0, 0, 5, 0, 0, 0, 2];
        payload.extend_from_slice(b"oops");
        let mut buf = raw_frame(0x7, 0, 0, &payload);
        match decoder.decode(&mut buf).unwrap().unwrap() {
            Frame::GoAway(f) => {
                assert_eq!(f.last_stream_id.value(), 5);
                assert_eq!(f.error_code, 2);
                assert_eq!(&f.debug_data[..], b"oops");
            }
            other => panic!("expected GOAWAY, got {other:?}"),
        }
    }
}
