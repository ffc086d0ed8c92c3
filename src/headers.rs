use http::header::{HeaderMap, HeaderValue, ValueIter, CONNECTION, CONTENT_LENGTH};

pub(crate) fn connection_close(headers: &HeaderMap) -> bool {
    for value in headers.get_all(CONNECTION) {
        if connection_has(value, "close") {
            return true;
        }
    }
    false
}

pub(crate) fn connection_has(value: &HeaderValue, needle: &str) -> bool {
    if let Ok(s) = value.to_str() {
        for val in s.split(',') {
            if val.trim().eq_ignore_ascii_case(needle) {
                return true;
            }
        }
    }
    false
}

/// Folds every `Content-Length` value. Multiple values are fine as long as
/// they all parse and agree; anything else is a framing hazard.
pub(crate) fn content_length_parse_all(headers: &HeaderMap) -> Result<Option<u64>, ()> {
    content_length_parse_all_values(headers.get_all(CONTENT_LENGTH).into_iter())
}

pub(crate) fn content_length_parse_all_values(
    values: ValueIter<'_, HeaderValue>,
) -> Result<Option<u64>, ()> {
    let mut parsed: Option<u64> = None;
    for line in values {
        let n = from_digits(line.as_bytes()).ok_or(())?;
        match parsed {
            Some(prev) if prev != n => return Err(()),
            _ => parsed = Some(n),
        }
    }
    Ok(parsed)
}

/// Strict decimal parse: no sign, no whitespace, no hex.
pub(crate) fn from_digits(bytes: &[u8]) -> Option<u64> {
    if bytes.is_empty() {
        return None;
    }
    let mut result = 0u64;
    for &b in bytes {
        match b {
            b'0'..=b'9' => {
                result = result.checked_mul(10)?;
                result = result.checked_add((b - b'0') as u64)?;
            }
            _ => return None,
        }
    }
    Some(result)
}

pub(crate) fn transfer_encoding_is_chunked(headers: &HeaderMap) -> bool {
    is_chunked(
        headers
            .get_all(http::header::TRANSFER_ENCODING)
            .into_iter(),
    )
}

pub(crate) fn is_chunked(mut encodings: ValueIter<'_, HeaderValue>) -> bool {
    // chunked must always be the last encoding
    if let Some(line) = encodings.next_back() {
        if let Ok(s) = line.to_str() {
            if let Some(encoding) = s.rsplit(',').next() {
                return encoding.trim().eq_ignore_ascii_case("chunked");
            }
        }
    }
    false
}

/// Header values may never carry a raw CR, LF or NUL; a value that does would
/// let a caller splice extra header lines into the wire image.
pub(crate) fn value_is_wire_safe(value: &HeaderValue) -> bool {
    !value
        .as_bytes()
        .iter()
        .any(|&b| b == b'\r' || b == b'\n' || b == b'\0')
}

/// RFC 9110 token grammar, used for header names and protocol tokens.
pub(crate) fn is_token(s: &[u8]) -> bool {
    !s.is_empty() && s.iter().all(|&b| is_token_char(b))
}

pub(crate) fn is_token_char(b: u8) -> bool {
    matches!(b,
        b'!' | b'#' | b'$' | b'%' | b'&' | b'\'' | b'*' | b'+' | b'-' | b'.' |
        b'^' | b'_' | b'`' | b'|' | b'~' |
        b'0'..=b'9' | b'a'..=b'z' | b'A'..=b'Z')
}

#[cfg(test)]
mod tests {
    use super::*;
    use http::header::HeaderName;

    fn map(pairs: &[(&str, &str)]) -> HeaderMap {
        let mut headers = HeaderMap::new();
        for (name, value) in pairs {
            headers.append(
                name.parse::<HeaderName>().unwrap(),
                HeaderValue::from_str(value).unwrap(),
            );
        }
        headers
    }

    #[test]
    fn content_length_agreeing_duplicates() {
        let headers = map(&[("content-length", "5"), ("content-length", "5")]);
        assert_eq!(content_length_parse_all(&headers), Ok(Some(5)));
    }

    #[test]
    fn content_length_conflicting_duplicates() {
        let headers = map(&[("content-length", "5"), ("content-length", "6")]);
        assert_eq!(content_length_parse_all(&headers), Err(()));
    }

    #[test]
    fn content_length_rejects_whitespace_and_sign() {
        assert_eq!(from_digits(b" 5"), None);
        assert_eq!(from_digits(b"+5"), None);
        assert_eq!(from_digits(b"5 "), None);
        assert_eq!(from_digits(b""), None);
        assert_eq!(from_digits(b"18446744073709551616"), None);
        assert_eq!(from_digits(b"42"), Some(42));
    }

    #[test]
    fn chunked_must_be_final_coding() {
        let headers = map(&[("transfer-encoding", "gzip, chunked")]);
        assert!(transfer_encoding_is_chunked(&headers));
        let headers = map(&[("transfer-encoding", "chunked, gzip")]);
        assert!(!transfer_encoding_is_chunked(&headers));
    }

    #[test]
    fn connection_close_tokens() {
        let headers = map(&[("connection", "keep-alive, Close")]);
        assert!(connection_close(&headers));
        let headers = map(&[("connection", "keep-alive")]);
        assert!(!connection_close(&headers));
    }

    #[test]
    fn token_grammar() {
        assert!(is_token(b"x-request-id"));
        assert!(!is_token(b""));
        assert!(!is_token(b"bad header"));
        assert!(!is_token(b"bad:header"));
    }
}
