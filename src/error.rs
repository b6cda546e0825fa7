//! 에러 타입 정의
//!
//! 모든 변종은 온와이어 `ERROR` 메시지용 숫자 코드와 일대일 대응된다.

use thiserror::Error;

/// Teleport 엔진 에러 타입
#[derive(Error, Debug)]
pub enum Error {
    #[error("IO 에러: {0}")]
    Io(#[from] std::io::Error),

    #[error("잘못된 인자: {0}")]
    InvalidArgument(String),

    #[error("소켓 생성 실패: {0}")]
    SocketCreate(String),

    #[error("소켓 바인드 실패: {0}")]
    SocketBind(String),

    #[error("연결 실패: {0}")]
    SocketConnect(String),

    #[error("송신 실패: {0}")]
    SocketSend(String),

    #[error("수신 실패: {0}")]
    SocketRecv(String),

    #[error("파일 열기 실패: {0}")]
    FileOpen(String),

    #[error("파일 읽기 실패: {0}")]
    FileRead(String),

    #[error("파일 쓰기 실패: {0}")]
    FileWrite(String),

    #[error("프로토콜 위반: {0}")]
    Protocol(String),

    #[error("타임아웃: {0}")]
    Timeout(String),

    #[error("전송 취소됨")]
    Cancelled,

    #[error("상대방이 거부함: {0}")]
    Rejected(String),

    #[error("이미 실행 중")]
    AlreadyRunning,

    #[error("실행 중이 아님")]
    NotRunning,

    #[error("연결 종료")]
    ConnectionClosed,

    #[error("장치를 찾을 수 없음: {0}")]
    DeviceNotFound(String),

    #[error("전송 실패: {0}")]
    TransferFailed(String),

    #[error("내부 에러: {0}")]
    Internal(String),
}

impl Error {
    /// 온와이어 `ERROR` 메시지에 싣는 숫자 코드
    pub fn code(&self) -> i32 {
        match self {
            Error::InvalidArgument(_) => -1,
            Error::SocketCreate(_) => -3,
            Error::SocketBind(_) => -4,
            Error::SocketConnect(_) => -5,
            Error::SocketSend(_) => -6,
            Error::SocketRecv(_) | Error::ConnectionClosed => -7,
            Error::FileOpen(_) => -8,
            Error::FileRead(_) => -9,
            Error::FileWrite(_) => -10,
            Error::Protocol(_) => -11,
            Error::Timeout(_) => -12,
            Error::Cancelled => -13,
            Error::Rejected(_) => -14,
            Error::AlreadyRunning => -15,
            Error::NotRunning => -16,
            Error::DeviceNotFound(_) => -18,
            Error::TransferFailed(_) => -19,
            Error::Io(_) | Error::Internal(_) => -100,
        }
    }

    /// 수신한 `ERROR` 메시지의 숫자 코드를 다시 에러로 복원
    pub fn from_code(code: i32, message: String) -> Self {
        match code {
            -1 => Error::InvalidArgument(message),
            -3 => Error::SocketCreate(message),
            -4 => Error::SocketBind(message),
            -5 => Error::SocketConnect(message),
            -6 => Error::SocketSend(message),
            -7 => Error::SocketRecv(message),
            -8 => Error::FileOpen(message),
            -9 => Error::FileRead(message),
            -10 => Error::FileWrite(message),
            -11 => Error::Protocol(message),
            -12 => Error::Timeout(message),
            -13 => Error::Cancelled,
            -14 => Error::Rejected(message),
            -15 => Error::AlreadyRunning,
            -16 => Error::NotRunning,
            -18 => Error::DeviceNotFound(message),
            -19 => Error::TransferFailed(message),
            _ => Error::Internal(message),
        }
    }

    /// 수신측 세션을 즉시 끊어야 하는 에러인지
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Error::Protocol(_) | Error::ConnectionClosed | Error::Internal(_)
        )
    }
}

/// Result 타입 별칭
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_code_roundtrip() {
        let cases = vec![
            Error::InvalidArgument("x".into()),
            Error::SocketConnect("x".into()),
            Error::Protocol("x".into()),
            Error::Timeout("x".into()),
            Error::Cancelled,
            Error::Rejected("x".into()),
            Error::AlreadyRunning,
            Error::TransferFailed("x".into()),
        ];

        for err in cases {
            let code = err.code();
            let restored = Error::from_code(code, "x".into());
            assert_eq!(code, restored.code());
        }
    }

    #[test]
    fn test_protocol_code_is_minus_11() {
        assert_eq!(Error::Protocol("version".into()).code(), -11);
    }

    #[test]
    fn test_connection_closed_maps_to_recv() {
        assert_eq!(Error::ConnectionClosed.code(), -7);
    }
}
