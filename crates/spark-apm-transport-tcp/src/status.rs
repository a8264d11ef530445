//! 应答行解析与分类。

use spark_apm::TransportError;

use crate::error::StatusLineError;

const VERSION_MISMATCH_STATUS: u16 = 404;

/// 解析 `<code> <reason>`；原因短语可以为空。
pub(crate) fn parse_status_line(line: &str) -> Result<(u16, String), StatusLineError> {
    let line = line.trim_end_matches(['\r', '\n']);
    if line.is_empty() {
        return Err(StatusLineError::Missing);
    }
    let (code, reason) = line.split_once(' ').unwrap_or((line, ""));
    let status = code
        .parse::<u16>()
        .ok()
        .filter(|status| (100..=599).contains(status))
        .ok_or_else(|| StatusLineError::Malformed(line.to_owned()))?;
    Ok((status, reason.trim().to_owned()))
}

pub(crate) fn classify(status: u16, message: String) -> Result<(), TransportError> {
    match status {
        200..=299 => Ok(()),
        VERSION_MISMATCH_STATUS => Err(TransportError::VersionMismatch { status, message }),
        _ => Err(TransportError::Rejected { status, message }),
    }
}
