use super::*;
use crate::frame::flags;
use bytes::BytesMut;
use std::collections::VecDeque;

/// Recorded hook invocations.
#[derive(Debug, PartialEq, Eq)]
enum Event {
    BeginFrame(u8, u32),
    Header(u32, Vec<u8>, Vec<u8>),
    Received(&'static str, u32),
    DataChunk(u32, Vec<u8>),
    BeforeSend(&'static str, u32),
    Sent(&'static str, u32, bool),
    NotSent(&'static str, u32),
    StreamClosed(u32, ErrorCode),
}

/// Hook recorder with a scripted request-body source.
#[derive(Default)]
struct Recorder {
    events: Vec<Event>,
    pulls: VecDeque<Pull>,
    pull_payload: Vec<u8>,
}

impl Recorder {
    fn sent_frames(&self) -> Vec<&'static str> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::Sent(name, _, _) => Some(*name),
                _ => None,
            })
            .collect()
    }

    fn closed(&self) -> Vec<(u32, ErrorCode)> {
        self.events
            .iter()
            .filter_map(|e| match e {
                Event::StreamClosed(id, code) => Some((*id, *code)),
                _ => None,
            })
            .collect()
    }
}

impl EngineHooks for Recorder {
    fn on_begin_frame(&mut self, hd: &FrameHeader) {
        self.events
            .push(Event::BeginFrame(hd.frame_type, hd.stream_id.value()));
    }

    fn on_header(&mut self, stream_id: StreamId, name: &[u8], value: &[u8]) {
        self.events
            .push(Event::Header(stream_id.value(), name.to_vec(), value.to_vec()));
    }

    fn on_frame_received(&mut self, frame: &FrameInfo) {
        self.events
            .push(Event::Received(frame.type_name(), frame.stream_id.value()));
    }

    fn on_data_chunk(&mut self, stream_id: StreamId, data: &[u8]) {
        self.events
            .push(Event::DataChunk(stream_id.value(), data.to_vec()));
    }

    fn on_before_frame_send(&mut self, frame: &FrameInfo) {
        self.events
            .push(Event::BeforeSend(frame.type_name(), frame.stream_id.value()));
    }

    fn on_frame_sent(&mut self, frame: &FrameInfo) {
        self.events.push(Event::Sent(
            frame.type_name(),
            frame.stream_id.value(),
            frame.end_stream(),
        ));
    }

    fn on_frame_not_sent(&mut self, frame: &FrameInfo, _error: &EngineError) {
        self.events
            .push(Event::NotSent(frame.type_name(), frame.stream_id.value()));
    }

    fn on_stream_closed(&mut self, stream_id: StreamId, error_code: ErrorCode) {
        self.events
            .push(Event::StreamClosed(stream_id.value(), error_code));
    }

    fn pull_request_data(&mut self, _stream_id: StreamId, buf: &mut [u8]) -> Pull {
        match self.pulls.pop_front() {
            Some(Pull::Data { len, eof }) => {
                let len = len.min(buf.len()).min(self.pull_payload.len());
                buf[..len].copy_from_slice(&self.pull_payload[..len]);
                self.pull_payload.drain(..len);
                Pull::Data { len, eof }
            }
            Some(other) => other,
            None => Pull::Data { len: 0, eof: true },
        }
    }
}

/// Peer-side frame scripting.
struct Peer {
    encoder: FrameEncoder,
    decoder: FrameDecoder,
    hpack_encoder: HpackEncoder,
    hpack_decoder: HpackDecoder,
    inbuf: BytesMut,
}

impl Peer {
    fn new() -> Self {
        let mut hpack_encoder = HpackEncoder::new();
        hpack_encoder.set_huffman(false);
        Self {
            encoder: FrameEncoder::new(),
            decoder: FrameDecoder::new(),
            hpack_encoder,
            hpack_decoder: HpackDecoder::new(),
            inbuf: BytesMut::new(),
        }
    }

    fn settings(&mut self) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encoder.encode(
            &Frame::Settings(SettingsFrame {
                ack: false,
                settings: Vec::new(),
            }),
            &mut buf,
        );
        buf.to_vec()
    }

    fn response_headers(&mut self, stream_id: u32, status: &str, end_stream: bool) -> Vec<u8> {
        let mut block = Vec::new();
        self.hpack_encoder
            .encode(&[HeaderField::new(":status", status)], &mut block);
        let mut buf = BytesMut::new();
        self.encoder.encode(
            &Frame::Headers(HeadersFrame {
                stream_id: StreamId::new(stream_id),
                end_stream,
                end_headers: true,
                priority: None,
                header_block: Bytes::from(block),
            }),
            &mut buf,
        );
        buf.to_vec()
    }

    fn data(&mut self, stream_id: u32, payload: &[u8], end_stream: bool) -> Vec<u8> {
        let mut buf = BytesMut::new();
        self.encoder.encode(
            &Frame::Data(DataFrame {
                stream_id: StreamId::new(stream_id),
                end_stream,
                data: Bytes::copy_from_slice(payload),
            }),
            &mut buf,
        );
        buf.to_vec()
    }

    /// Consume client output, skipping the connection preface, and
    /// return the decoded frames.
    fn read(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.inbuf.extend_from_slice(chunk);
        if self.inbuf.starts_with(CONNECTION_PREFACE) {
            let _ = self.inbuf.split_to(CONNECTION_PREFACE.len());
        }
        let mut frames = Vec::new();
        while let Some(frame) = self.decoder.decode(&mut self.inbuf).unwrap() {
            frames.push(frame);
        }
        frames
    }

    fn decode_block(&mut self, block: &[u8]) -> Vec<HeaderField> {
        self.hpack_decoder.decode(block).unwrap()
    }
}

fn drain(engine: &mut Engine, hooks: &mut Recorder) -> Vec<u8> {
    let mut out = Vec::new();
    while let Some(chunk) = engine.next_output_chunk(hooks) {
        out.extend_from_slice(&chunk);
    }
    out
}

fn client_settings() -> Vec<Setting> {
    vec![
        Setting {
            id: SettingId::InitialWindowSize,
            value: 32 * 1024 * 1024,
        },
        Setting {
            id: SettingId::HeaderTableSize,
            value: 65_536,
        },
        Setting {
            id: SettingId::EnablePush,
            value: 0,
        },
    ]
}

fn ready_engine(peer: &mut Peer, hooks: &mut Recorder) -> Engine {
    let mut engine = Engine::client();
    engine.submit_settings(&client_settings());
    engine.set_local_window_size(32 * 1024 * 1024);
    let hello = drain(&mut engine, hooks);
    peer.read(&hello);
    let settings = peer.settings();
    engine.feed_input(&settings, hooks).unwrap();
    engine
}

fn get_request() -> Vec<HeaderField> {
    vec![
        HeaderField::new(":method", "GET"),
        HeaderField::new(":scheme", "https"),
        HeaderField::new(":authority", "example.com"),
        HeaderField::new(":path", "/"),
    ]
}

#[test]
fn preface_settings_and_window_update_first() {
    let mut hooks = Recorder::default();
    let mut engine = Engine::client();
    engine.submit_settings(&client_settings());
    engine.set_local_window_size(32 * 1024 * 1024);

    let bytes = drain(&mut engine, &mut hooks);
    assert!(bytes.starts_with(CONNECTION_PREFACE));

    let mut peer = Peer::new();
    let frames = peer.read(&bytes);
    assert!(matches!(frames[0], Frame::Settings(ref f) if !f.ack));
    match &frames[1] {
        Frame::WindowUpdate(f) => {
            assert!(f.stream_id.is_connection_level());
            assert_eq!(f.increment, 32 * 1024 * 1024 - 65_535);
        }
        other => panic!("expected WINDOW_UPDATE, got {other:?}"),
    }
}

#[test]
fn peer_settings_are_acked() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    assert!(
        frames
            .iter()
            .any(|f| matches!(f, Frame::Settings(s) if s.ack)),
        "SETTINGS ACK expected, got {frames:?}"
    );
}

#[test]
fn request_headers_carry_priority_weight() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let stream_id = engine
        .submit_request(&get_request(), MAX_WEIGHT, RequestBody::None)
        .unwrap();
    assert_eq!(stream_id.value(), 1);

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    let headers = frames
        .iter()
        .find_map(|f| match f {
            Frame::Headers(h) => Some(h),
            _ => None,
        })
        .expect("HEADERS frame");

    assert!(headers.end_stream);
    assert!(headers.end_headers);
    assert_eq!(headers.priority.unwrap().effective_weight(), 256);

    let fields = peer.decode_block(&headers.header_block);
    assert_eq!(fields[0], HeaderField::new(":method", "GET"));

    assert!(hooks.sent_frames().contains(&"HEADERS"));
}

#[test]
fn stream_ids_are_odd_and_increment() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let a = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let b = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    assert_eq!(a.value(), 1);
    assert_eq!(b.value(), 3);
}

#[test]
fn stream_id_exhaustion_reported() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    engine.next_stream_id = 0x7FFF_FFFF + 2;
    assert_eq!(
        engine.submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None),
        Err(SubmitError::StreamIdUnavailable)
    );
    assert!(!engine.is_request_allowed());
}

#[test]
fn response_is_delivered_through_hooks() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    peer.read(&bytes);

    let response = peer.response_headers(stream_id.value(), "200", false);
    engine.feed_input(&response, &mut hooks).unwrap();
    let body = peer.data(stream_id.value(), b"hello", true);
    engine.feed_input(&body, &mut hooks).unwrap();

    assert!(hooks.events.contains(&Event::Header(
        1,
        b":status".to_vec(),
        b"200".to_vec()
    )));
    assert!(hooks
        .events
        .contains(&Event::DataChunk(1, b"hello".to_vec())));
    assert_eq!(hooks.closed(), vec![(1, ErrorCode::NoError)]);
}

#[test]
fn request_body_pulled_under_flow_control() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    hooks.pull_payload = b"ABC".to_vec();
    hooks.pulls.push_back(Pull::Data { len: 3, eof: true });

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::Provided)
        .unwrap();
    let before = engine.session_remote_window();

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    let data = frames
        .iter()
        .find_map(|f| match f {
            Frame::Data(d) => Some(d),
            _ => None,
        })
        .expect("DATA frame");

    assert_eq!(&data.data[..], b"ABC");
    assert!(data.end_stream);
    assert_eq!(engine.session_remote_window(), before - 3);
    assert_eq!(engine.stream_remote_window(stream_id), 65_535 - 3);
}

#[test]
fn deferred_provider_suspends_until_resume() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    hooks.pulls.push_back(Pull::Deferred);

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::Provided)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    assert!(
        !frames.iter().any(|f| matches!(f, Frame::Data(_))),
        "no DATA while deferred"
    );
    assert!(!engine.wants_write());

    hooks.pull_payload = b"later".to_vec();
    hooks.pulls.push_back(Pull::Data { len: 5, eof: true });
    engine.resume_data(stream_id);
    assert!(engine.wants_write());

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    match frames.as_slice() {
        [Frame::Data(d)] => {
            assert_eq!(&d.data[..], b"later");
            assert!(d.end_stream);
        }
        other => panic!("expected one DATA frame, got {other:?}"),
    }
}

#[test]
fn failing_provider_resets_stream() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    hooks.pulls.push_back(Pull::TemporaryFailure);

    engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::Provided)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    let rst = frames
        .iter()
        .find_map(|f| match f {
            Frame::RstStream(r) => Some(r),
            _ => None,
        })
        .expect("RST_STREAM frame");
    assert_eq!(rst.error_code, ErrorCode::InternalError.to_u32());
}

#[test]
fn received_data_generates_window_updates() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();

    // Keep the default 65535 windows so the half-window threshold is
    // reachable with a few frames.
    let mut engine = Engine::client();
    let hello = drain(&mut engine, &mut hooks);
    peer.read(&hello);
    let settings = peer.settings();
    engine.feed_input(&settings, &mut hooks).unwrap();

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    peer.read(&bytes);

    let response = peer.response_headers(stream_id.value(), "200", false);
    engine.feed_input(&response, &mut hooks).unwrap();

    // 48000 bytes crosses the 32767-byte threshold on both levels.
    for _ in 0..3 {
        let body = peer.data(stream_id.value(), &[0u8; 16_000], false);
        engine.feed_input(&body, &mut hooks).unwrap();
    }

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    let updates: Vec<&WindowUpdateFrame> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::WindowUpdate(w) => Some(w),
            _ => None,
        })
        .collect();
    assert!(
        updates.iter().any(|w| w.stream_id.is_connection_level()),
        "expected a connection-level WINDOW_UPDATE, got {frames:?}"
    );
    assert!(
        updates.iter().any(|w| w.stream_id == stream_id),
        "expected a stream-level WINDOW_UPDATE, got {frames:?}"
    );
}

#[test]
fn ping_is_acked_automatically() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let mut ping = BytesMut::new();
    peer.encoder.encode(
        &Frame::Ping(PingFrame {
            ack: false,
            data: [9; 8],
        }),
        &mut ping,
    );
    engine.feed_input(&ping, &mut hooks).unwrap();

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    match frames.as_slice() {
        [Frame::Ping(f)] => {
            assert!(f.ack);
            assert_eq!(f.data, [9; 8]);
        }
        other => panic!("expected PING ACK, got {other:?}"),
    }
}

#[test]
fn goaway_refuses_queued_requests() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    // Queue a request but do not flush it yet.
    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();

    let mut goaway = BytesMut::new();
    peer.encoder.encode(
        &Frame::GoAway(GoAwayFrame {
            last_stream_id: StreamId::CONNECTION,
            error_code: 0,
            debug_data: Bytes::new(),
        }),
        &mut goaway,
    );
    engine.feed_input(&goaway, &mut hooks).unwrap();
    assert!(engine.goaway_received());
    assert!(!engine.is_request_allowed());

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    assert!(
        !frames.iter().any(|f| matches!(f, Frame::Headers(_))),
        "HEADERS must not go out after GOAWAY"
    );
    assert!(hooks.events.contains(&Event::NotSent("HEADERS", 1)));
    assert!(hooks
        .closed()
        .contains(&(stream_id.value(), ErrorCode::RefusedStream)));
}

#[test]
fn terminate_session_sends_goaway_once() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    engine.terminate_session(ErrorCode::NoError);
    engine.terminate_session(ErrorCode::NoError);

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    let goaways: Vec<_> = frames
        .iter()
        .filter(|f| matches!(f, Frame::GoAway(_)))
        .collect();
    assert_eq!(goaways.len(), 1);
    assert!(!engine.wants_read());
    assert!(!engine.is_request_allowed());
}

#[test]
fn push_promise_is_a_protocol_error() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    peer.read(&bytes);

    let mut push = BytesMut::new();
    peer.encoder.encode(
        &Frame::PushPromise(crate::frame::PushPromiseFrame {
            stream_id,
            end_headers: true,
            promised_stream_id: StreamId::new(2),
            header_block: Bytes::new(),
        }),
        &mut push,
    );
    assert!(matches!(
        engine.feed_input(&push, &mut hooks),
        Err(EngineError::Protocol(_))
    ));
}

#[test]
fn reset_stream_discards_further_data() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    peer.read(&bytes);

    let response = peer.response_headers(stream_id.value(), "200", false);
    engine.feed_input(&response, &mut hooks).unwrap();

    engine.submit_rst_stream(stream_id, ErrorCode::Cancel);
    hooks.events.clear();

    let body = peer.data(stream_id.value(), b"late", false);
    engine.feed_input(&body, &mut hooks).unwrap();
    assert!(
        !hooks
            .events
            .iter()
            .any(|e| matches!(e, Event::DataChunk(..))),
        "data after local reset must be discarded"
    );
}

#[test]
fn withheld_body_waits_for_submit_data() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    hooks.pull_payload = b"ABC".to_vec();
    hooks.pulls.push_back(Pull::Data { len: 3, eof: true });

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::Withheld)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);

    let headers = frames
        .iter()
        .find_map(|f| match f {
            Frame::Headers(h) => Some(h),
            _ => None,
        })
        .expect("HEADERS");
    assert!(!headers.end_stream, "withheld body leaves the stream open");
    assert!(
        !frames.iter().any(|f| matches!(f, Frame::Data(_))),
        "no DATA before submit_data"
    );

    engine.submit_data(stream_id).unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    match frames.as_slice() {
        [Frame::Data(d)] => {
            assert_eq!(&d.data[..], b"ABC");
            assert!(d.end_stream);
        }
        other => panic!("expected DATA after submit_data, got {other:?}"),
    }
}

#[test]
fn priority_change_emits_priority_frame() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    peer.read(&bytes);

    engine.submit_priority(stream_id, MIN_WEIGHT).unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    match frames.as_slice() {
        [Frame::Priority(f)] => {
            assert_eq!(f.stream_id, stream_id);
            assert_eq!(f.priority.effective_weight(), 1);
            assert!(!f.priority.exclusive);
            assert!(f.priority.dependency.is_connection_level());
        }
        other => panic!("expected PRIORITY, got {other:?}"),
    }
}

#[test]
fn higher_weight_stream_sends_first() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    hooks.pull_payload = b"XY".to_vec();
    hooks.pulls.push_back(Pull::Data { len: 1, eof: true });
    hooks.pulls.push_back(Pull::Data { len: 1, eof: true });

    let low = engine
        .submit_request(&get_request(), MIN_WEIGHT, RequestBody::Provided)
        .unwrap();
    let high = engine
        .submit_request(&get_request(), MAX_WEIGHT, RequestBody::Provided)
        .unwrap();

    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    let data_streams: Vec<u32> = frames
        .iter()
        .filter_map(|f| match f {
            Frame::Data(d) => Some(d.stream_id.value()),
            _ => None,
        })
        .collect();
    assert_eq!(data_streams, vec![high.value(), low.value()]);
}

#[test]
fn end_stream_headers_flag_set_on_bodyless_request() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    let frames = peer.read(&bytes);
    let headers = frames
        .iter()
        .find_map(|f| match f {
            Frame::Headers(h) => Some(h),
            _ => None,
        })
        .expect("HEADERS");
    assert!(headers.end_stream);
    assert!(
        !frames.iter().any(|f| matches!(f, Frame::Data(_))),
        "no DATA for a bodyless request"
    );
}

#[test]
fn continuation_frames_accumulate() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    peer.read(&bytes);

    // Split a response header block across HEADERS + CONTINUATION.
    let mut block = Vec::new();
    peer.hpack_encoder.encode(
        &[
            HeaderField::new(":status", "200"),
            HeaderField::new("content-type", "text/plain"),
        ],
        &mut block,
    );
    let split = block.len() / 2;

    let mut wire = BytesMut::new();
    peer.encoder.encode(
        &Frame::Headers(HeadersFrame {
            stream_id,
            end_stream: false,
            end_headers: false,
            priority: None,
            header_block: Bytes::copy_from_slice(&block[..split]),
        }),
        &mut wire,
    );
    peer.encoder.encode(
        &Frame::Continuation(crate::frame::ContinuationFrame {
            stream_id,
            end_headers: true,
            header_block: Bytes::copy_from_slice(&block[split..]),
        }),
        &mut wire,
    );
    engine.feed_input(&wire, &mut hooks).unwrap();

    assert!(hooks.events.contains(&Event::Header(
        stream_id.value(),
        b":status".to_vec(),
        b"200".to_vec()
    )));
    assert!(hooks.events.contains(&Event::Header(
        stream_id.value(),
        b"content-type".to_vec(),
        b"text/plain".to_vec()
    )));
}

#[test]
fn interleaved_frame_during_continuation_rejected() {
    let mut hooks = Recorder::default();
    let mut peer = Peer::new();
    let mut engine = ready_engine(&mut peer, &mut hooks);

    let stream_id = engine
        .submit_request(&get_request(), DEFAULT_WEIGHT, RequestBody::None)
        .unwrap();
    let bytes = drain(&mut engine, &mut hooks);
    peer.read(&bytes);

    let mut wire = BytesMut::new();
    peer.encoder.encode(
        &Frame::Headers(HeadersFrame {
            stream_id,
            end_stream: false,
            end_headers: false,
            priority: None,
            header_block: Bytes::from_static(&[0x88]),
        }),
        &mut wire,
    );
    peer.encoder.encode(
        &Frame::Ping(PingFrame {
            ack: false,
            data: [0; 8],
        }),
        &mut wire,
    );
    assert!(matches!(
        engine.feed_input(&wire, &mut hooks),
        Err(EngineError::Protocol(_))
    ));
}

#[test]
fn flag_constants_match_wire_values() {
    assert_eq!(flags::END_STREAM, 0x1);
    assert_eq!(flags::END_HEADERS, 0x4);
    assert_eq!(flags::ACK, 0x1);
}
