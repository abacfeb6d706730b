use std::pin::Pin;

use async_stream::try_stream;
use bytes::Bytes;
use futures_util::{Stream, StreamExt};

use crate::error::{ChatError, ChatResult};

/** \brief 统一的文本增量流。 */
pub type TextStream = Pin<Box<dyn Stream<Item = ChatResult<String>> + Send>>;

/**
 * \brief 单个 SSE 事件解析结果。
 */
#[derive(Debug, Clone, PartialEq)]
pub enum Delta {
    /** \brief 一段生成文本 */
    Text(String),
    /** \brief 与文本无关的事件（角色、用量等） */
    Skip,
    /** \brief 流已正常结束 */
    Done,
    /** \brief Provider 在流内报告错误 */
    Failed(String),
}

/**
 * \brief 增量 SSE 解码器：按空行切分事件，输出每个事件的 data 负载。
 */
#[derive(Debug, Default)]
pub struct SseDecoder {
    buf: Vec<u8>,
}

impl SseDecoder {
    /** \brief 追加字节，返回已完整的事件负载。 */
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        while let Some((pos, sep_len)) = find_event_boundary(&self.buf) {
            let block = self.buf.drain(..pos + sep_len).collect::<Vec<u8>>();
            if let Some(data) = extract_data(&block[..pos]) {
                out.push(data);
            }
        }
        out
    }

    /** \brief 流结束时处理残留的最后一个事件。 */
    pub fn finish(&mut self) -> Option<String> {
        let block = std::mem::take(&mut self.buf);
        extract_data(&block)
    }
}

fn find_event_boundary(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

fn extract_data(block: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(block);
    let mut lines = Vec::new();
    for line in text.lines() {
        let line = line.trim_end_matches('\r');
        if let Some(rest) = line.strip_prefix("data:") {
            lines.push(rest.strip_prefix(' ').unwrap_or(rest).to_string());
        }
    }
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/**
 * \brief 将 Provider 的 SSE 字节流转换为文本增量流。
 * \param extract 各 Provider 的事件解析函数
 */
pub fn text_deltas<S, E, F>(bytes: S, extract: F) -> TextStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: Into<ChatError> + Send + 'static,
    F: Fn(&str) -> Delta + Send + 'static,
{
    Box::pin(try_stream! {
        let mut decoder = SseDecoder::default();
        futures_util::pin_mut!(bytes);
        let mut done = false;
        while let Some(chunk) = bytes.next().await {
            let chunk = chunk.map_err(Into::<ChatError>::into)?;
            for data in decoder.push(&chunk) {
                let delta = extract(&data);
                match delta {
                    Delta::Text(text) => {
                        yield text;
                    }
                    Delta::Skip => {}
                    Delta::Done => {
                        done = true;
                        break;
                    }
                    Delta::Failed(message) => {
                        Err::<(), ChatError>(ChatError::Upstream { status: 500, message })?;
                    }
                }
            }
            if done {
                break;
            }
        }
        if !done {
            if let Some(data) = decoder.finish() {
                let delta = extract(&data);
                if let Delta::Text(text) = delta {
                    yield text;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::stream;

    #[test]
    fn test_decoder_handles_split_events() {
        let mut decoder = SseDecoder::default();
        assert!(decoder.push(b"data: {\"a\":").is_empty());
        let out = decoder.push(b"1}\n\nevent: ping\ndata: two\n\ndata: th");
        assert_eq!(out, vec!["{\"a\":1}".to_string(), "two".to_string()]);
        assert_eq!(decoder.finish(), Some("th".to_string()));
    }

    #[test]
    fn test_decoder_crlf_and_comments() {
        let mut decoder = SseDecoder::default();
        let out = decoder.push(b": keep-alive\r\n\r\ndata: x\r\n\r\n");
        assert_eq!(out, vec!["x".to_string()]);
    }

    fn plain(data: &str) -> Delta {
        match data {
            "[DONE]" => Delta::Done,
            "skip" => Delta::Skip,
            "boom" => Delta::Failed("boom".to_string()),
            other => Delta::Text(other.to_string()),
        }
    }

    fn chunks(parts: &[&str]) -> Vec<Result<Bytes, ChatError>> {
        parts
            .iter()
            .map(|p| Ok(Bytes::from(p.to_string())))
            .collect()
    }

    #[tokio::test]
    async fn test_text_deltas_stop_at_done() {
        let input = chunks(&["data: a\n\ndata: skip\n\n", "data: b\n\ndata: [DONE]\n\ndata: c\n\n"]);
        let out: Vec<_> = text_deltas(stream::iter(input), plain).collect().await;
        let texts: Vec<String> = out.into_iter().map(|r| r.expect("fragment")).collect();
        assert_eq!(texts, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_text_deltas_surface_in_stream_failure() {
        let input = chunks(&["data: a\n\ndata: boom\n\ndata: c\n\n"]);
        let out: Vec<_> = text_deltas(stream::iter(input), plain).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].as_ref().expect("first"), "a");
        assert!(matches!(out[1], Err(ChatError::Upstream { .. })));
    }
}
