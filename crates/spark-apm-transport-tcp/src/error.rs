use std::io;

use spark_apm::TransportError;
use thiserror::Error;

/// 采集端应答行无法解析。
#[derive(Debug, Error, PartialEq, Eq)]
pub enum StatusLineError {
    /// 连接在写出应答行之前被关闭。
    #[error("collector closed the connection without a status line")]
    Missing,
    /// 应答行不符合 `<code> <reason>` 格式。
    #[error("malformed status line: {0:?}")]
    Malformed(String),
}

impl From<StatusLineError> for TransportError {
    fn from(err: StatusLineError) -> Self {
        let kind = match err {
            StatusLineError::Missing => io::ErrorKind::UnexpectedEof,
            StatusLineError::Malformed(_) => io::ErrorKind::InvalidData,
        };
        TransportError::Io(io::Error::new(kind, err))
    }
}

/// 建连超时统一映射为 `TimedOut` IO 错误。
pub(crate) fn connect_timed_out(addr: &str) -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::TimedOut,
        format!("connecting to {addr} timed out"),
    ))
}
