use std::fmt::{Debug, Display};

use serde::{Deserialize, Serialize};

/// Captured tool output. Kept as text when it is valid UTF-8.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StringOrBytes {
    String(String),
    Bytes(Vec<u8>),
}

impl Debug for StringOrBytes {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => {
                if f.alternate() {
                    f.write_str(&textwrap::indent(s, "        "))?;
                } else {
                    f.write_str(s)?;
                }
            },
            Self::Bytes(b) => write!(f, "raw bytes: {b:?}")?,
        }

        Ok(())
    }
}

impl Display for StringOrBytes {
    #[inline]
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::String(s) => f.write_str(s),
            Self::Bytes(b) => write!(f, "{} bytes of non-UTF-8 output", b.len()),
        }
    }
}

impl From<Vec<u8>> for StringOrBytes {
    #[inline]
    fn from(bytes: Vec<u8>) -> Self {
        match simdutf8::basic::from_utf8(&bytes) {
            Ok(text) => Self::String(text.to_owned()),
            Err(_) => Self::Bytes(bytes),
        }
    }
}

impl From<String> for StringOrBytes {
    #[inline]
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn utf8_output_stays_text() {
        let out = StringOrBytes::from(b"line one\nline two\nline three".to_vec());
        assert!(matches!(out, StringOrBytes::String(_)));
        assert_eq!(out.to_string(), "line one\nline two\nline three");
    }

    #[test]
    fn invalid_utf8_is_kept_as_bytes() {
        let out = StringOrBytes::from(vec![0xff, 0xfe, 0x00]);
        assert!(matches!(out, StringOrBytes::Bytes(_)));
        assert_eq!(out.to_string(), "3 bytes of non-UTF-8 output");
    }
}
