//! 请求元数据行。
//!
//! 每条请求流以一行 `{"metadata":{...}}` 开头，描述系统、进程与服务；
//! 内容在首次建立请求时编码一次并缓存，之后每个请求复用同一份字节。

use std::collections::BTreeMap;

use serde::Serialize;

pub const AGENT_NAME: &str = "spark-apm";
pub const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

/// 服务描述，来自构造选项。
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ServiceInfo {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub environment: Option<String>,
}

#[derive(Serialize)]
struct Agent {
    name: &'static str,
    version: &'static str,
}

#[derive(Serialize)]
struct Language {
    name: &'static str,
}

#[derive(Serialize)]
struct Service<'a> {
    #[serde(flatten)]
    info: &'a ServiceInfo,
    agent: Agent,
    language: Language,
}

#[derive(Serialize)]
struct System {
    #[serde(skip_serializing_if = "Option::is_none")]
    hostname: Option<String>,
    architecture: &'static str,
    platform: &'static str,
}

#[derive(Serialize)]
struct Process {
    pid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    title: Option<String>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    argv: Vec<String>,
}

#[derive(Serialize)]
struct MetadataBody<'a> {
    system: System,
    process: Process,
    service: Service<'a>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    labels: &'a BTreeMap<String, String>,
}

#[derive(Serialize)]
struct MetadataLine<'a> {
    metadata: MetadataBody<'a>,
}

fn local_system() -> System {
    let hostname = std::env::var("HOSTNAME")
        .ok()
        .or_else(|| std::fs::read_to_string("/etc/hostname").ok())
        .map(|name| name.trim().to_owned())
        .filter(|name| !name.is_empty());
    System {
        hostname,
        architecture: std::env::consts::ARCH,
        platform: std::env::consts::OS,
    }
}

fn current_process() -> Process {
    let argv: Vec<String> = std::env::args().collect();
    let title = std::env::current_exe()
        .ok()
        .and_then(|path| path.file_name().map(|name| name.to_string_lossy().into_owned()));
    Process {
        pid: std::process::id(),
        title,
        argv,
    }
}

/// 编码元数据行（含结尾换行）。
pub(crate) fn encode_metadata(
    service: &ServiceInfo,
    labels: &BTreeMap<String, String>,
) -> Result<Vec<u8>, serde_json::Error> {
    let line = MetadataLine {
        metadata: MetadataBody {
            system: local_system(),
            process: current_process(),
            service: Service {
                info: service,
                agent: Agent {
                    name: AGENT_NAME,
                    version: AGENT_VERSION,
                },
                language: Language { name: "rust" },
            },
            labels,
        },
    };
    let mut out = serde_json::to_vec(&line)?;
    out.push(b'\n');
    Ok(out)
}
