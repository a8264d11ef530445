//! 栈帧源码上下文。
//!
//! # 教案式说明
//! - **意图（Why）**：错误与慢 Span 的栈帧若附带前后几行源码，排障效率会显著提升；
//! - **逻辑（How）**：[`ContextSetter`] 由模型写入器在编码前逐帧调用，
//!   [`FileContextSetter`] 从本地文件系统读取源码并按文件缓存行列表；
//! - **契约（What）**：失败（文件缺失、行号越界）只意味着该帧不带上下文，不影响记录本身。

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::model::StackFrame;

/// 为栈帧填充 `pre_context`/`context_line`/`post_context`。
pub trait ContextSetter: Send + Sync + 'static {
    fn set_context(&self, frame: &mut StackFrame, pre: usize, post: usize) -> io::Result<()>;
}

/// 读取本地源码文件的上下文实现。
#[derive(Debug, Default)]
pub struct FileContextSetter {
    cache: Mutex<HashMap<String, Arc<Vec<String>>>>,
}

impl FileContextSetter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lines(&self, path: &str) -> io::Result<Arc<Vec<String>>> {
        if let Some(lines) = self.cache.lock().get(path) {
            return Ok(Arc::clone(lines));
        }
        let text = std::fs::read_to_string(path)?;
        let lines = Arc::new(text.lines().map(str::to_owned).collect::<Vec<_>>());
        self.cache.lock().insert(path.to_owned(), Arc::clone(&lines));
        Ok(lines)
    }
}

impl ContextSetter for FileContextSetter {
    fn set_context(&self, frame: &mut StackFrame, pre: usize, post: usize) -> io::Result<()> {
        if frame.line == 0 || frame.file.is_empty() {
            return Ok(());
        }
        let lines = self.lines(&frame.file)?;
        let index = frame.line as usize - 1;
        let Some(line) = lines.get(index) else {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("line {} is beyond the end of {}", frame.line, frame.file),
            ));
        };
        let start = index.saturating_sub(pre);
        let end = (index + 1 + post).min(lines.len());
        frame.pre_context = lines[start..index].to_vec();
        frame.context_line = Some(line.clone());
        frame.post_context = lines[index + 1..end].to_vec();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame_at(line: u32) -> StackFrame {
        StackFrame {
            file: concat!(env!("CARGO_MANIFEST_DIR"), "/src/stacktrace.rs").to_owned(),
            line,
            function: "frame_at".into(),
            ..StackFrame::default()
        }
    }

    #[test]
    fn context_lines_surround_the_frame() {
        let setter = FileContextSetter::new();
        let mut frame = frame_at(3);
        setter.set_context(&mut frame, 3, 3).expect("读取源码");
        assert_eq!(frame.pre_context.len(), 2, "首部附近只有两行前置上下文");
        assert_eq!(frame.post_context.len(), 3);
        assert_eq!(frame.context_line.as_deref(), Some("//! # 教案式说明"));
    }

    #[test]
    fn out_of_range_line_leaves_frame_untouched() {
        let setter = FileContextSetter::new();
        let mut frame = frame_at(u32::MAX);
        assert!(setter.set_context(&mut frame, 3, 3).is_err());
        assert!(frame.context_line.is_none());
    }
}
