//! Incremental UTF-8 decoding of body chunks.

/// Decodes a byte stream chunk by chunk.
///
/// A multi-byte sequence split across chunks is held back until its remaining
/// bytes arrive. Invalid sequences become U+FFFD.
#[derive(Debug, Default)]
pub struct Utf8Decoder {
    pending: Vec<u8>,
}

impl Utf8Decoder {
    pub fn decode(&mut self, bytes: &[u8]) -> String {
        self.pending.extend_from_slice(bytes);

        let mut out = String::with_capacity(self.pending.len());
        let mut start = 0;
        while start < self.pending.len() {
            match std::str::from_utf8(&self.pending[start..]) {
                Ok(valid) => {
                    out.push_str(valid);
                    start = self.pending.len();
                }
                Err(e) => {
                    let valid_end = start + e.valid_up_to();
                    out.push_str(&String::from_utf8_lossy(&self.pending[start..valid_end]));
                    match e.error_len() {
                        Some(bad) => {
                            out.push(char::REPLACEMENT_CHARACTER);
                            start = valid_end + bad;
                        }
                        // incomplete sequence at the end, wait for more bytes
                        None => {
                            start = valid_end;
                            break;
                        }
                    }
                }
            }
        }

        self.pending.drain(..start);
        out
    }

    /// Flush whatever is still buffered. A truncated sequence becomes U+FFFD.
    pub fn finish(&mut self) -> String {
        let rest = String::from_utf8_lossy(&self.pending).into_owned();
        self.pending.clear();
        rest
    }

    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ascii_passthrough() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"hello"), "hello");
        assert!(!decoder.has_pending());
        assert_eq!(decoder.finish(), "");
    }

    #[test]
    fn test_split_multibyte_sequence() {
        let bytes = "naïve 日本 🦀".as_bytes();
        for split in 0..=bytes.len() {
            let mut decoder = Utf8Decoder::default();
            let mut out = decoder.decode(&bytes[..split]);
            out.push_str(&decoder.decode(&bytes[split..]));
            out.push_str(&decoder.finish());
            assert_eq!(out, "naïve 日本 🦀", "split at {split}");
        }
    }

    #[test]
    fn test_byte_at_a_time() {
        let mut decoder = Utf8Decoder::default();
        let mut out = String::new();
        for b in "é🦀".as_bytes() {
            out.push_str(&decoder.decode(std::slice::from_ref(b)));
        }
        assert_eq!(out, "é🦀");
    }

    #[test]
    fn test_invalid_bytes_replaced() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"a\xffb"), "a\u{FFFD}b");
    }

    #[test]
    fn test_truncated_sequence_flushed_on_finish() {
        let mut decoder = Utf8Decoder::default();
        assert_eq!(decoder.decode(b"ok\xe6\x97"), "ok");
        assert!(decoder.has_pending());
        assert_eq!(decoder.finish(), "\u{FFFD}");
        assert!(!decoder.has_pending());
    }
}
