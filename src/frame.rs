//! 프레임 정의 및 코덱
//!
//! 모든 데이터그램은 고정 헤더 + 페이로드로 구성된다 (빅엔디안).
//!
//! ```text
//! offset 0..3  : sequence id (u32, < max_id)
//! offset 4..7  : 헤더 전체 크기 (u32, 항상 HEADER_SIZE)
//! offset 8..11 : 문자열 오프셋 (u32, 페이로드 앞쪽 텍스트 토큰 길이)
//! offset 12..  : 페이로드 (0..max_payload bytes)
//! ```

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::{FrameError, DEFAULT_MAX_ID, HEADER_SIZE, MAX_PACKET_SIZE};

/// 단일 프로토콜 프레임 (데이터그램 하나)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    /// wire 시퀀스 ID (max_id 모듈러)
    pub sequence_id: u32,

    /// 페이로드 앞쪽 텍스트 토큰 길이
    pub string_offset: u32,

    /// 페이로드
    pub payload: Bytes,

    /// 전달 확인 여부 (로컬 전용, 전송되지 않음)
    pub ack: bool,
}

impl Frame {
    /// 바이너리 데이터 프레임
    pub fn data(sequence_id: u32, payload: Bytes) -> Self {
        Self {
            sequence_id,
            string_offset: 0,
            payload,
            ack: false,
        }
    }

    /// 텍스트 제어 프레임 (페이로드 전체가 문자열)
    pub fn control(sequence_id: u32, text: &str) -> Self {
        Self {
            sequence_id,
            string_offset: text.len() as u32,
            payload: Bytes::copy_from_slice(text.as_bytes()),
            ack: false,
        }
    }

    /// 텍스트 토큰 + 바이너리 혼합 프레임
    pub fn mixed(sequence_id: u32, text: &str, body: &[u8]) -> Self {
        let mut payload = BytesMut::with_capacity(text.len() + body.len());
        payload.put_slice(text.as_bytes());
        payload.put_slice(body);
        Self {
            sequence_id,
            string_offset: text.len() as u32,
            payload: payload.freeze(),
            ack: false,
        }
    }

    /// 앞쪽 텍스트 토큰 (UTF-8이 아니면 None)
    pub fn text(&self) -> Option<&str> {
        let end = (self.string_offset as usize).min(self.payload.len());
        std::str::from_utf8(&self.payload[..end]).ok()
    }

    /// 텍스트 토큰 뒤의 바이너리 부분
    pub fn body(&self) -> &[u8] {
        let start = (self.string_offset as usize).min(self.payload.len());
        &self.payload[start..]
    }

    /// 텍스트 토큰을 가진 프레임인지
    pub fn is_control(&self) -> bool {
        self.string_offset > 0
    }

    /// 인코딩 후 크기
    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len()
    }
}

/// 프레임 인코더/디코더
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameCodec {
    max_packet_size: usize,
    max_id: u32,
}

impl Default for FrameCodec {
    fn default() -> Self {
        Self::new(MAX_PACKET_SIZE, DEFAULT_MAX_ID)
    }
}

impl FrameCodec {
    pub fn new(max_packet_size: usize, max_id: u32) -> Self {
        Self {
            max_packet_size,
            max_id,
        }
    }

    pub fn max_packet_size(&self) -> usize {
        self.max_packet_size
    }

    pub fn max_id(&self) -> u32 {
        self.max_id
    }

    /// 최대 페이로드 길이
    pub fn max_payload_len(&self) -> usize {
        self.max_packet_size.saturating_sub(HEADER_SIZE)
    }

    /// 프레임을 `header ‖ payload` 바이트로 인코딩
    pub fn encode(&self, frame: &Frame) -> Result<Bytes, FrameError> {
        if frame.sequence_id >= self.max_id {
            return Err(FrameError::IdOutOfRange {
                id: frame.sequence_id,
                max_id: self.max_id,
            });
        }
        let size = frame.encoded_len();
        if size > self.max_packet_size {
            return Err(FrameError::Oversized {
                size,
                max: self.max_packet_size,
            });
        }
        if frame.string_offset as usize > frame.payload.len() {
            return Err(FrameError::OffsetBeyondPayload {
                offset: frame.string_offset,
                payload_len: frame.payload.len(),
            });
        }

        let mut buf = BytesMut::with_capacity(size);
        buf.put_u32(frame.sequence_id);
        buf.put_u32(HEADER_SIZE as u32);
        buf.put_u32(frame.string_offset);
        buf.put_slice(&frame.payload);
        Ok(buf.freeze())
    }

    /// 수신 바이트에서 프레임 디코딩
    pub fn decode(&self, bytes: &[u8]) -> Result<Frame, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Truncated { len: bytes.len() });
        }
        if bytes.len() > self.max_packet_size {
            return Err(FrameError::Oversized {
                size: bytes.len(),
                max: self.max_packet_size,
            });
        }

        let mut header = &bytes[..HEADER_SIZE];
        let sequence_id = header.get_u32();
        let header_len = header.get_u32();
        let string_offset = header.get_u32();

        if header_len != HEADER_SIZE as u32 {
            return Err(FrameError::HeaderLength {
                expected: HEADER_SIZE as u32,
                got: header_len,
            });
        }
        if sequence_id >= self.max_id {
            return Err(FrameError::IdOutOfRange {
                id: sequence_id,
                max_id: self.max_id,
            });
        }

        let payload_len = bytes.len() - HEADER_SIZE;
        if string_offset as usize > payload_len {
            return Err(FrameError::OffsetBeyondPayload {
                offset: string_offset,
                payload_len,
            });
        }

        Ok(Frame {
            sequence_id,
            string_offset,
            payload: Bytes::copy_from_slice(&bytes[HEADER_SIZE..]),
            ack: false,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let codec = FrameCodec::default();
        let frames = [
            Frame::data(0, Bytes::new()),
            Frame::data(42, Bytes::from(vec![1, 2, 3, 4, 5])),
            Frame::control(DEFAULT_MAX_ID - 1, "START"),
            Frame::mixed(7, "upload;a.bin", &[0xde, 0xad]),
            Frame::data(9, Bytes::from(vec![0xab; codec.max_payload_len()])),
        ];

        for frame in frames {
            let bytes = codec.encode(&frame).unwrap();
            assert_eq!(bytes.len(), frame.encoded_len());
            assert_eq!(codec.decode(&bytes).unwrap(), frame);
        }
    }

    #[test]
    fn test_header_layout_is_big_endian() {
        let codec = FrameCodec::default();
        let frame = Frame::mixed(0x0102_0304, "ACK", b"\xff");
        let bytes = codec.encode(&frame).unwrap();

        assert_eq!(&bytes[0..4], &[0x01, 0x02, 0x03, 0x04]);
        assert_eq!(&bytes[4..8], &[0, 0, 0, HEADER_SIZE as u8]);
        assert_eq!(&bytes[8..12], &[0, 0, 0, 3]);
        assert_eq!(&bytes[12..], b"ACK\xff");
    }

    #[test]
    fn test_text_and_body_split() {
        let frame = Frame::mixed(1, "INIT", b"tail");
        assert_eq!(frame.text(), Some("INIT"));
        assert_eq!(frame.body(), b"tail");
        assert!(frame.is_control());

        let data = Frame::data(1, Bytes::from_static(b"raw"));
        assert_eq!(data.text(), Some(""));
        assert_eq!(data.body(), b"raw");
        assert!(!data.is_control());
    }

    #[test]
    fn test_encode_rejects_oversized_payload() {
        let codec = FrameCodec::new(64, DEFAULT_MAX_ID);
        let frame = Frame::data(1, Bytes::from(vec![0u8; 64 - HEADER_SIZE + 1]));
        assert_eq!(
            codec.encode(&frame),
            Err(FrameError::Oversized { size: 65, max: 64 })
        );
    }

    #[test]
    fn test_encode_rejects_id_out_of_range() {
        let codec = FrameCodec::new(MAX_PACKET_SIZE, 10);
        assert_eq!(
            codec.encode(&Frame::data(10, Bytes::new())),
            Err(FrameError::IdOutOfRange { id: 10, max_id: 10 })
        );
    }

    #[test]
    fn test_decode_rejects_malformed() {
        let codec = FrameCodec::new(MAX_PACKET_SIZE, 10);

        assert_eq!(
            codec.decode(&[0u8; HEADER_SIZE - 1]),
            Err(FrameError::Truncated { len: HEADER_SIZE - 1 })
        );

        // id >= max_id
        let mut bytes = vec![0, 0, 0, 11, 0, 0, 0, 12, 0, 0, 0, 0];
        assert_eq!(
            codec.decode(&bytes),
            Err(FrameError::IdOutOfRange { id: 11, max_id: 10 })
        );

        // 오프셋이 페이로드보다 큼
        bytes[3] = 1;
        bytes[11] = 3;
        bytes.extend_from_slice(b"ab");
        assert_eq!(
            codec.decode(&bytes),
            Err(FrameError::OffsetBeyondPayload {
                offset: 3,
                payload_len: 2
            })
        );

        // 헤더 길이 필드 불일치
        bytes[7] = 16;
        assert!(matches!(
            codec.decode(&bytes),
            Err(FrameError::HeaderLength { got: 16, .. })
        ));
    }

    #[test]
    fn test_decode_rejects_datagram_larger_than_max() {
        let codec = FrameCodec::new(32, DEFAULT_MAX_ID);
        let mut bytes = vec![0, 0, 0, 1, 0, 0, 0, 12, 0, 0, 0, 0];
        bytes.resize(33, 0);
        assert_eq!(
            codec.decode(&bytes),
            Err(FrameError::Oversized { size: 33, max: 32 })
        );
    }
}
