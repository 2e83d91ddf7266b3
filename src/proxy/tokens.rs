use serde_json::Value;

/// Hard cap on one `data:` line in the upstream event stream. Overflowing it
/// means the upstream is not speaking a line protocol; the tee turns it into
/// a stream error.
pub const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Raw-byte capture used for the end-of-stream fallback scan. Capture stops
/// past this cap and the fallback operates on the captured prefix.
const MAX_CAPTURE_BYTES: usize = 8 * 1024 * 1024;

pub struct LineOverflow;

/// Incremental token accounting over a `data: <json>` line stream.
///
/// A structured `total_tokens` (under `metadata.usage` or `usage`) overrides
/// everything seen before; otherwise per-chunk `prompt_eval_count` +
/// `eval_count` pairs accumulate. Lines that fail to parse fall back to a
/// tolerant byte scan of that line only.
#[derive(Default)]
pub struct TokenScanner {
    line: Vec<u8>,
    raw: Vec<u8>,
    final_tokens: Option<u64>,
    running: u64,
}

impl TokenScanner {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed one upstream chunk. Returns `Err` when a single line exceeds
    /// `MAX_LINE_BYTES`.
    pub fn push(&mut self, chunk: &[u8]) -> Result<(), LineOverflow> {
        if self.raw.len() < MAX_CAPTURE_BYTES {
            let room = MAX_CAPTURE_BYTES - self.raw.len();
            self.raw.extend_from_slice(&chunk[..chunk.len().min(room)]);
        }

        let mut rest = chunk;
        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.line.extend_from_slice(&rest[..pos]);
            if self.line.len() > MAX_LINE_BYTES {
                return Err(LineOverflow);
            }
            let line = std::mem::take(&mut self.line);
            self.scan_line(&line);
            self.line = line;
            self.line.clear();
            rest = &rest[pos + 1..];
        }
        self.line.extend_from_slice(rest);
        if self.line.len() > MAX_LINE_BYTES {
            return Err(LineOverflow);
        }
        Ok(())
    }

    /// Close out the stream: the structured override wins, then the running
    /// sum, then a whole-stream byte scan as the last resort.
    pub fn finish(&mut self) -> u64 {
        let tokens = self.final_tokens.unwrap_or(self.running);
        if tokens == 0 {
            scan_tokens(&self.raw)
        } else {
            tokens
        }
    }

    fn scan_line(&mut self, line: &[u8]) {
        let line = trim_ascii(line);
        let Some(payload) = line.strip_prefix(b"data: ") else {
            return;
        };
        let payload = trim_ascii(payload);

        match serde_json::from_slice::<Value>(payload) {
            Ok(value) => self.apply_json(&value),
            Err(_) => self.apply_scanned(payload),
        }
    }

    fn apply_json(&mut self, value: &Value) {
        if let Some(total) = value
            .pointer("/metadata/usage/total_tokens")
            .and_then(Value::as_u64)
        {
            self.final_tokens = Some(total);
        } else if let Some(total) = value.pointer("/usage/total_tokens").and_then(Value::as_u64) {
            self.final_tokens = Some(total);
        } else if let (Some(prompt), Some(eval)) = (
            value.get("prompt_eval_count").and_then(Value::as_u64),
            value.get("eval_count").and_then(Value::as_u64),
        ) {
            self.running += prompt + eval;
        }
    }

    fn apply_scanned(&mut self, payload: &[u8]) {
        if let Some(total) = scan_key(payload, b"\"total_tokens\":") {
            self.final_tokens = Some(total);
            return;
        }
        let prompt = scan_key(payload, b"\"prompt_eval_count\":");
        let eval = scan_key(payload, b"\"eval_count\":");
        if prompt.is_some() || eval.is_some() {
            self.running += prompt.unwrap_or(0) + eval.unwrap_or(0);
        }
    }
}

/// Token extraction for a buffered unary response: structured
/// `usage.total_tokens` preferred, byte scan otherwise.
pub fn extract_unary_tokens(body: &[u8]) -> u64 {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        if let Some(total) = value.pointer("/usage/total_tokens").and_then(Value::as_u64) {
            return total;
        }
        if let Some(total) = value
            .pointer("/metadata/usage/total_tokens")
            .and_then(Value::as_u64)
        {
            return total;
        }
    }
    scan_tokens(body)
}

/// Tolerant byte scan over an arbitrary buffer: a `total_tokens` value wins,
/// otherwise `prompt_eval_count` + `eval_count` are summed. Every failure
/// yields 0; this path never errors.
pub fn scan_tokens(buf: &[u8]) -> u64 {
    if let Some(total) = scan_key(buf, b"\"total_tokens\":") {
        return total;
    }
    scan_key(buf, b"\"prompt_eval_count\":").unwrap_or(0)
        + scan_key(buf, b"\"eval_count\":").unwrap_or(0)
}

/// Locate `key` in `buf`, skip whitespace after it, and read a digit run.
fn scan_key(buf: &[u8], key: &[u8]) -> Option<u64> {
    let start = buf.windows(key.len()).position(|w| w == key)? + key.len();
    let mut idx = start;
    while idx < buf.len() && (buf[idx] == b' ' || buf[idx] == b'\t') {
        idx += 1;
    }
    let digits_start = idx;
    while idx < buf.len() && buf[idx].is_ascii_digit() {
        idx += 1;
    }
    if idx == digits_start {
        return None;
    }
    std::str::from_utf8(&buf[digits_start..idx])
        .ok()?
        .parse()
        .ok()
}

fn trim_ascii(mut bytes: &[u8]) -> &[u8] {
    while let [first, rest @ ..] = bytes {
        if first.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    while let [rest @ .., last] = bytes {
        if last.is_ascii_whitespace() {
            bytes = rest;
        } else {
            break;
        }
    }
    bytes
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(scanner: &mut TokenScanner, text: &str) {
        assert!(scanner.push(text.as_bytes()).is_ok());
    }

    #[test]
    fn test_usage_total_overrides_running_sum() {
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"id\":\"x\"}\n");
        feed(&mut s, "data: {\"prompt_eval_count\":7,\"eval_count\":5}\n");
        feed(&mut s, "data: {\"usage\":{\"total_tokens\":99}}\n");
        assert_eq!(s.finish(), 99);
    }

    #[test]
    fn test_metadata_usage_overrides_pair_sum() {
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"prompt_eval_count\":10,\"eval_count\":20}\n");
        feed(
            &mut s,
            "data: {\"metadata\":{\"usage\":{\"total_tokens\":42}}}\n",
        );
        assert_eq!(s.finish(), 42);
    }

    #[test]
    fn test_pair_sum_accumulates() {
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"prompt_eval_count\":3,\"eval_count\":4}\n");
        feed(&mut s, "data: {\"prompt_eval_count\":1,\"eval_count\":2}\n");
        assert_eq!(s.finish(), 10);
    }

    #[test]
    fn test_explicit_zero_total_is_zero_after_raw_rescan() {
        // A structured zero stays zero: the raw fallback finds the same
        // `total_tokens` value.
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"usage\":{\"total_tokens\":0}}\n");
        assert_eq!(s.finish(), 0);
    }

    #[test]
    fn test_line_split_across_chunks() {
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"prompt_eval_");
        feed(&mut s, "count\":7,\"eval_count\":5}\nda");
        feed(&mut s, "ta: {\"usage\":{\"total_tokens\":99}}\n");
        assert_eq!(s.finish(), 99);
    }

    #[test]
    fn test_non_data_lines_ignored() {
        let mut s = TokenScanner::new();
        feed(&mut s, ": keep-alive\n");
        feed(&mut s, "event: message\n");
        feed(&mut s, "data: {\"prompt_eval_count\":2,\"eval_count\":3}\n");
        assert_eq!(s.finish(), 5);
    }

    #[test]
    fn test_malformed_json_falls_back_to_line_scan() {
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"prompt_eval_count\": 7, broken\n");
        feed(&mut s, "data: {\"eval_count\": 5, also broken\n");
        assert_eq!(s.finish(), 12);
    }

    #[test]
    fn test_unterminated_final_line_uses_raw_fallback() {
        // No trailing newline: the structured parser never sees the line,
        // but the end-of-stream scan over captured bytes recovers the count.
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"prompt_eval_count\":7,\"eval_count\":5}");
        assert_eq!(s.finish(), 12);
    }

    #[test]
    fn test_line_overflow_detected() {
        let mut s = TokenScanner::new();
        let big = vec![b'x'; MAX_LINE_BYTES + 1];
        assert!(s.push(&big).is_err());
    }

    #[test]
    fn test_crlf_lines() {
        let mut s = TokenScanner::new();
        feed(&mut s, "data: {\"usage\":{\"total_tokens\":17}}\r\n");
        assert_eq!(s.finish(), 17);
    }

    #[test]
    fn test_scan_key_whitespace_and_missing() {
        assert_eq!(scan_key(b"\"total_tokens\":  42}", b"\"total_tokens\":"), Some(42));
        assert_eq!(scan_key(b"\"total_tokens\": }", b"\"total_tokens\":"), None);
        assert_eq!(scan_key(b"nothing here", b"\"total_tokens\":"), None);
    }

    #[test]
    fn test_scan_tokens_prefers_total() {
        let buf = br#"{"prompt_eval_count":7,"eval_count":5,"usage":{"total_tokens":99}}"#;
        assert_eq!(scan_tokens(buf), 99);
    }

    #[test]
    fn test_scan_tokens_pair_sum() {
        let buf = br#"{"prompt_eval_count": 7, "eval_count": 5}"#;
        assert_eq!(scan_tokens(buf), 12);
    }

    #[test]
    fn test_scan_tokens_junk_is_zero() {
        assert_eq!(scan_tokens(b"\x00\xffnot json at all"), 0);
    }

    #[test]
    fn test_extract_unary_structured() {
        let body = br#"{"model":"m","usage":{"total_tokens":123}}"#;
        assert_eq!(extract_unary_tokens(body), 123);
    }

    #[test]
    fn test_extract_unary_pair_scan() {
        let body = br#"{"model":"m","prompt_eval_count":11,"eval_count":9}"#;
        assert_eq!(extract_unary_tokens(body), 20);
    }

    #[test]
    fn test_extract_unary_unrecognized_is_zero() {
        assert_eq!(extract_unary_tokens(br#"{"choices":[]}"#), 0);
        assert_eq!(extract_unary_tokens(b"plain text"), 0);
    }
}
