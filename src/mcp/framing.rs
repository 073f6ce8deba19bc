//! Dual-framing codec for the byte-stream transport.
//!
//! A connection multiplexes two framings, detected per message: a line
//! beginning (case-insensitively) with `content-length:` opens a
//! header-delimited frame: remaining header lines are read until a blank
//! line, then exactly the declared number of payload bytes. Any other
//! non-empty line is parsed directly as one JSON document. Remote
//! processes may interleave free-form log output, so a non-JSON line is
//! skipped silently rather than failing the reader.

use serde_json::Value;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::core::constants::MAX_FRAME_BYTES;

/// Outbound messages default to header-delimited framing.
pub fn encode_frame(payload: &Value) -> Vec<u8> {
    let body = payload.to_string();
    let mut frame = format!("Content-Length: {}\r\n\r\n", body.len()).into_bytes();
    frame.extend_from_slice(body.as_bytes());
    frame
}

/// Reads the next JSON message off the stream, sniffing the framing per
/// message. Returns `None` at end of stream.
pub async fn read_message<R>(reader: &mut R) -> std::io::Result<Option<Value>>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let mut line = String::new();
        if reader.read_line(&mut line).await? == 0 {
            return Ok(None);
        }
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }

        if let Some(length) = content_length(trimmed) {
            // Drain the remaining header lines up to the blank separator.
            loop {
                let mut header = String::new();
                if reader.read_line(&mut header).await? == 0 {
                    return Ok(None);
                }
                if header.trim().is_empty() {
                    break;
                }
            }
            if length > MAX_FRAME_BYTES {
                discard_exact(reader, length).await?;
                continue;
            }
            let mut body = vec![0u8; length];
            reader.read_exact(&mut body).await?;
            match serde_json::from_slice(&body) {
                Ok(value) => return Ok(Some(value)),
                Err(_) => continue,
            }
        }

        match serde_json::from_str(trimmed) {
            Ok(value) => return Ok(Some(value)),
            Err(_) => continue,
        }
    }
}

fn content_length(line: &str) -> Option<usize> {
    let (name, value) = line.split_once(':')?;
    if !name.trim().eq_ignore_ascii_case("content-length") {
        return None;
    }
    value.trim().parse().ok()
}

/// Consumes an oversized payload so the stream stays in sync.
async fn discard_exact<R>(reader: &mut R, mut remaining: usize) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    let mut chunk = [0u8; 8192];
    while remaining > 0 {
        let take = remaining.min(chunk.len());
        reader.read_exact(&mut chunk[..take]).await?;
        remaining -= take;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::io::BufReader;

    async fn read_all(input: &[u8]) -> Vec<Value> {
        let mut reader = BufReader::new(input);
        let mut messages = Vec::new();
        while let Some(message) = read_message(&mut reader).await.expect("read") {
            messages.push(message);
        }
        messages
    }

    #[tokio::test]
    async fn header_delimited_empty_object_round_trips() {
        let frame = encode_frame(&json!({}));
        let messages = read_all(&frame).await;
        assert_eq!(messages, vec![json!({})]);
    }

    #[tokio::test]
    async fn bare_json_line_parses_directly() {
        let messages = read_all(b"{\"jsonrpc\":\"2.0\",\"id\":1,\"result\":{}}\n").await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].get("id"), Some(&json!(1)));
    }

    #[tokio::test]
    async fn non_json_lines_are_skipped_silently() {
        let mut input = Vec::new();
        input.extend_from_slice(b"starting up, please wait...\n");
        input.extend_from_slice(b"{\"id\":1,\"result\":\"first\"}\n");
        input.extend_from_slice(b"[warn] something harmless\n");
        input.extend_from_slice(&encode_frame(&json!({"id": 2, "result": "second"})));

        let messages = read_all(&input).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].get("result"), Some(&json!("first")));
        assert_eq!(messages[1].get("result"), Some(&json!("second")));
    }

    #[tokio::test]
    async fn header_name_is_case_insensitive_and_extra_headers_are_ignored() {
        let body = json!({"id": 3, "result": null}).to_string();
        let mut input = format!(
            "CONTENT-LENGTH: {}\r\nContent-Type: application/json\r\n\r\n",
            body.len()
        )
        .into_bytes();
        input.extend_from_slice(body.as_bytes());

        let messages = read_all(&input).await;
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].get("id"), Some(&json!(3)));
    }

    #[tokio::test]
    async fn both_framings_interleave_on_one_stream() {
        let mut input = Vec::new();
        input.extend_from_slice(&encode_frame(&json!({"id": 1})));
        input.extend_from_slice(b"\n{\"id\": 2}\n");
        input.extend_from_slice(&encode_frame(&json!({"id": 3})));

        let messages = read_all(&input).await;
        let ids: Vec<i64> = messages
            .iter()
            .filter_map(|message| message.get("id").and_then(Value::as_i64))
            .collect();
        assert_eq!(ids, vec![1, 2, 3]);
    }
}
