//! 프로토콜 메시지 정의
//!
//! - 제어 토큰: 페이로드 전체가 정확히 일치해야 하는 단일 토큰 (`INIT`, `START`, `ACK`, ...)
//! - 세션 명령/응답: `;`로 구분된 텍스트 (`download;name;port` 등)

use crate::frame::Frame;
use crate::{Error, Result, DELIMITER};

/// 제어 토큰
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlToken {
    /// 세션 초기화
    Init,

    /// 수신측 주도 다운로드 시작
    Start,

    /// 누적 ACK (번호는 sequence id에 실림)
    Ack,

    /// 송신 일시정지 요청
    Pause,

    /// 송신 재개 요청
    Resume,
}

impl ControlToken {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControlToken::Init => "INIT",
            ControlToken::Start => "START",
            ControlToken::Ack => "ACK",
            ControlToken::Pause => "pause",
            ControlToken::Resume => "resume",
        }
    }

    /// 페이로드가 토큰과 정확히 일치할 때만 Some
    pub fn from_frame(frame: &Frame) -> Option<Self> {
        if frame.string_offset as usize != frame.payload.len() {
            return None;
        }
        Self::parse(frame.text()?)
    }

    fn parse(text: &str) -> Option<Self> {
        match text {
            "INIT" => Some(ControlToken::Init),
            "START" => Some(ControlToken::Start),
            "ACK" => Some(ControlToken::Ack),
            "pause" => Some(ControlToken::Pause),
            "resume" => Some(ControlToken::Resume),
            _ => None,
        }
    }

    /// 이 토큰을 담은 프레임
    pub fn frame(&self, sequence_id: u32) -> Frame {
        Frame::control(sequence_id, self.as_str())
    }
}

/// 클라이언트 → 서버 세션 명령
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// 원격 파일 목록
    List,

    /// 서버 → 클라이언트 전송 요청
    Download { name: String, port: u16 },

    /// 클라이언트 → 서버 전송 요청
    Upload { name: String, size: u64, port: u16 },

    /// 원격 파일 삭제
    Delete { name: String },

    /// 서버측 전송 일시정지
    Pause { transfer: u32 },

    /// 서버측 전송 재개
    Resume { transfer: u32 },

    /// 세션 종료
    Exit,
}

impl Command {
    pub fn encode(&self) -> String {
        match self {
            Command::List => "ls".to_string(),
            Command::Download { name, port } => format!("download;{name};{port}"),
            Command::Upload { name, size, port } => format!("upload;{name};{size};{port}"),
            Command::Delete { name } => format!("delete;{name}"),
            Command::Pause { transfer } => format!("pause;{transfer}"),
            Command::Resume { transfer } => format!("resume;{transfer}"),
            Command::Exit => "exit".to_string(),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split(DELIMITER).collect();
        let command = match fields.as_slice() {
            ["ls"] => Command::List,
            ["download", name, port] => Command::Download {
                name: file_name(name)?,
                port: number(port)?,
            },
            ["upload", name, size, port] => Command::Upload {
                name: file_name(name)?,
                size: number(size)?,
                port: number(port)?,
            },
            ["delete", name] => Command::Delete {
                name: file_name(name)?,
            },
            ["pause", transfer] => Command::Pause {
                transfer: number(transfer)?,
            },
            ["resume", transfer] => Command::Resume {
                transfer: number(transfer)?,
            },
            ["exit"] => Command::Exit,
            _ => return Err(Error::Protocol(format!("알 수 없는 명령: {text}"))),
        };
        Ok(command)
    }

    pub fn to_frame(&self, sequence_id: u32) -> Frame {
        Frame::control(sequence_id, &self.encode())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let text = frame
            .text()
            .ok_or_else(|| Error::Protocol("UTF-8이 아닌 명령".into()))?;
        Self::decode(text)
    }
}

/// 서버 → 클라이언트 응답
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    /// 핸드쉐이크 응답: 세션 포트
    Init { port: u16 },

    /// 파일 목록
    Listing(Vec<String>),

    /// 다운로드 수락: 서버 전송 포트와 파일 크기
    Download { port: u16, size: u64 },

    /// 업로드 수락: 서버 전송 포트와 시작 sequence id
    Upload { port: u16, start_id: u32 },

    Ok,

    Error(String),
}

impl Reply {
    pub fn encode(&self) -> String {
        match self {
            Reply::Init { port } => format!("{};{port}", ControlToken::Init.as_str()),
            Reply::Listing(names) => {
                let mut text = String::from("ls");
                for name in names {
                    text.push(DELIMITER);
                    text.push_str(name);
                }
                text
            }
            Reply::Download { port, size } => format!("download;{port};{size}"),
            Reply::Upload { port, start_id } => format!("upload;{port};{start_id}"),
            Reply::Ok => "ok".to_string(),
            Reply::Error(message) => format!("error;{message}"),
        }
    }

    pub fn decode(text: &str) -> Result<Self> {
        let fields: Vec<&str> = text.split(DELIMITER).collect();
        let reply = match fields.as_slice() {
            ["INIT", port] => Reply::Init {
                port: number(port)?,
            },
            ["ls", names @ ..] => Reply::Listing(
                names
                    .iter()
                    .filter(|name| !name.is_empty())
                    .map(|name| name.to_string())
                    .collect(),
            ),
            ["download", port, size] => Reply::Download {
                port: number(port)?,
                size: number(size)?,
            },
            ["upload", port, start_id] => Reply::Upload {
                port: number(port)?,
                start_id: number(start_id)?,
            },
            ["ok"] => Reply::Ok,
            ["error", message @ ..] => Reply::Error(message.join(";")),
            _ => return Err(Error::Protocol(format!("알 수 없는 응답: {text}"))),
        };
        Ok(reply)
    }

    pub fn to_frame(&self, sequence_id: u32) -> Frame {
        Frame::control(sequence_id, &self.encode())
    }

    pub fn from_frame(frame: &Frame) -> Result<Self> {
        let text = frame
            .text()
            .ok_or_else(|| Error::Protocol("UTF-8이 아닌 응답".into()))?;
        Self::decode(text)
    }
}

fn number<T: std::str::FromStr>(field: &str) -> Result<T> {
    field
        .parse()
        .map_err(|_| Error::Protocol(format!("숫자가 아님: {field}")))
}

fn file_name(field: &str) -> Result<String> {
    if field.is_empty() || field.contains(['/', '\\']) || field == "." || field == ".." {
        return Err(Error::Protocol(format!("유효하지 않은 파일 이름: {field:?}")));
    }
    Ok(field.to_string())
}
