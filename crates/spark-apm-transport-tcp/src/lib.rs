#![doc = r#"
# spark-apm-transport-tcp

## 设计动机（Why）
- **定位**：为 `spark-apm` 的 [`Transport`](spark_apm::Transport) 能力提供一个基于原始 TCP
  连接的实现，使代理无需 HTTP 栈即可把压缩请求流推送给采集端；
- **架构角色**：位于传输实现层，只依赖代理核心公开的 `Transport`/`StreamReader`/`Cancellation`
  契约，不感知缓冲与请求组装细节。

## 核心契约（What）
- 每次发送建立一条新连接，把请求流原样写入套接字，流结束后半关闭写方向；
- 采集端以一行 `<code> <reason>` 作答：2xx 视为成功，404 视为版本不匹配
  （[`TransportError::VersionMismatch`](spark_apm::TransportError::VersionMismatch)），
  其余状态码为 [`TransportError::Rejected`](spark_apm::TransportError::Rejected)；
- 发送上下文被取消（追踪器关闭）时，请求流会以 EOF 结束，本实现不再等待应答并返回成功。

## 实现策略（How）
- 连接建立受 [`DEFAULT_CONNECT_TIMEOUT`] 约束，超时映射为 IO 错误；
- 写入使用 `tokio::io::copy`，读取的节奏由代理的拉取式请求流决定；
- 应答行读取长度有上限，畸形应答映射为 `InvalidData` IO 错误。

## 风险与考量（Trade-offs）
- 不复用连接：代理同一时刻至多一个请求在途，建连开销相对请求周期可以忽略；
- 不支持 TLS，需要加密时应在前置代理终结。
"#]

mod error;
mod status;
mod transport;

pub use error::StatusLineError;
pub use transport::{DEFAULT_CONNECT_TIMEOUT, TcpStreamTransport};
