//! 增量 SSE 解析器

use crate::event::SseEvent;

/// SSE 增量解析器：输入任意切分的 bytes chunk，按 SSE 规则产出 0..N 个事件。
///
/// 行以 `\n`、`\r` 或 `\r\n` 结束；`\r\n` 可能被切分在两个 chunk 之间。
#[derive(Debug, Default)]
pub struct SseParser {
    pending: Vec<u8>,
    // 上一个 chunk 以 \r 结尾，下一个字节若为 \n 需要丢弃
    skip_lf: bool,
    cur: SseEvent,
    data_lines: usize,
    has_fields: bool,
}

impl SseParser {
    pub fn new() -> Self {
        Self::default()
    }

    /// 喂入一个 bytes chunk，返回本次解析产生的所有事件。
    pub fn push(&mut self, chunk: &[u8]) -> Vec<SseEvent> {
        let mut out = Vec::new();
        let mut rest = chunk;

        if self.skip_lf && !rest.is_empty() {
            if rest[0] == b'\n' {
                rest = &rest[1..];
            }
            self.skip_lf = false;
        }

        while let Some(pos) = rest.iter().position(|&b| b == b'\n' || b == b'\r') {
            if self.pending.is_empty() {
                self.on_line(&rest[..pos], &mut out);
            } else {
                let mut line = std::mem::take(&mut self.pending);
                line.extend_from_slice(&rest[..pos]);
                self.on_line(&line, &mut out);
            }

            let is_cr = rest[pos] == b'\r';
            rest = &rest[pos + 1..];
            if is_cr {
                match rest.first() {
                    Some(b'\n') => rest = &rest[1..],
                    Some(_) => {}
                    None => self.skip_lf = true,
                }
            }
        }

        self.pending.extend_from_slice(rest);
        out
    }

    fn on_line(&mut self, line: &[u8], out: &mut Vec<SseEvent>) {
        if line.is_empty() {
            // 空行分派事件；没有任何字段时不产生事件
            if self.has_fields {
                out.push(std::mem::take(&mut self.cur));
                self.data_lines = 0;
                self.has_fields = false;
            }
            return;
        }

        if line[0] == b':' {
            return;
        }

        let (field, value) = match line.iter().position(|&b| b == b':') {
            Some(idx) => {
                let value = &line[idx + 1..];
                (&line[..idx], value.strip_prefix(b" ").unwrap_or(value))
            }
            None => (line, &[][..]),
        };
        let value = String::from_utf8_lossy(value);

        match field {
            b"data" => {
                if self.data_lines > 0 {
                    self.cur.data.push('\n');
                }
                self.cur.data.push_str(&value);
                self.data_lines += 1;
            }
            b"event" => self.cur.event = Some(value.into_owned()),
            b"id" => {
                if !value.contains('\0') {
                    self.cur.id = Some(value.into_owned());
                }
            }
            b"retry" => match value.trim().parse::<u64>() {
                Ok(ms) => self.cur.retry = Some(ms),
                Err(_) => return,
            },
            _ => return,
        }
        self.has_fields = true;
    }
}
