//! Transfer-encoding, charset and RFC 2047 encoded-word decoding.
//!
//! Every decoder here is best effort: callers get an error they can fall
//! back from, or a lossy string, never a panic.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use encoding_rs::Encoding;
use lazy_static::lazy_static;
use regex::Regex;

/// Mail bodies are routinely missing padding or carry junk trailing bits.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

/// Labels the WHATWG registry does not know, or maps somewhere unhelpful.
static CHARSET_ALIASES: &[(&str, &Encoding)] = &[
    ("latin9", encoding_rs::ISO_8859_15),
    ("iso-8859-15", encoding_rs::ISO_8859_15),
    ("cp-1252", encoding_rs::WINDOWS_1252),
    ("cp1251", encoding_rs::WINDOWS_1251),
    ("cp-1251", encoding_rs::WINDOWS_1251),
    ("cp1250", encoding_rs::WINDOWS_1250),
    ("cp932", encoding_rs::SHIFT_JIS),
    ("ms932", encoding_rs::SHIFT_JIS),
    ("sjis", encoding_rs::SHIFT_JIS),
    ("cp936", encoding_rs::GBK),
    ("cp949", encoding_rs::EUC_KR),
    ("ks_c_5601-1987", encoding_rs::EUC_KR),
    ("utf-8-sig", encoding_rs::UTF_8),
];

/// Used when a charset label resolves to nothing. Windows-1252 maps every
/// byte to some character, so no input is ever dropped.
pub const DEFAULT_CHARSET: &Encoding = encoding_rs::WINDOWS_1252;

lazy_static! {
    static ref ENCODED_WORD: Regex =
        Regex::new(r"=\?([^?\s]+)\?([BbQq])\?([^?\s]*)\?=").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferEncoding {
    Identity,
    Base64,
    QuotedPrintable,
}

impl TransferEncoding {
    pub fn from_header(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
            Some("base64") => TransferEncoding::Base64,
            Some("quoted-printable") => TransferEncoding::QuotedPrintable,
            _ => TransferEncoding::Identity,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DecodeError {
    #[error("invalid base64: {0}")]
    Base64(#[from] base64::DecodeError),
    #[error("invalid quoted-printable: {0}")]
    QuotedPrintable(#[from] quoted_printable::QuotedPrintableError),
}

pub fn decode_transfer(raw: &[u8], encoding: TransferEncoding) -> Result<Vec<u8>, DecodeError> {
    match encoding {
        TransferEncoding::Identity => Ok(raw.to_vec()),
        TransferEncoding::Base64 => {
            let compact: Vec<u8> = raw
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            Ok(LENIENT_BASE64.decode(compact)?)
        }
        TransferEncoding::QuotedPrintable => {
            let decoded = quoted_printable::decode(raw, quoted_printable::ParseMode::Robust)?;
            // the decoder emits CRLF line breaks; keep the source's LF-only form
            if raw.contains(&b'\r') {
                Ok(decoded)
            } else {
                Ok(crlf_to_lf(&decoded))
            }
        }
    }
}

fn crlf_to_lf(bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(bytes.len());
    let mut iter = bytes.iter().peekable();
    while let Some(&b) = iter.next() {
        if b == b'\r' && iter.peek() == Some(&&b'\n') {
            continue;
        }
        out.push(b);
    }
    out
}

/// Decode a body fragment, keeping the raw bytes when the declared
/// transfer encoding does not hold.
pub fn decode_transfer_or_raw(raw: &[u8], encoding: TransferEncoding) -> Vec<u8> {
    match decode_transfer(raw, encoding) {
        Ok(decoded) => decoded,
        Err(e) => {
            log::debug!("Transfer decoding failed ({:?}), keeping raw bytes: {}", encoding, e);
            raw.to_vec()
        }
    }
}

/// Resolve a charset label; unknown labels get [`DEFAULT_CHARSET`].
pub fn lookup_charset(label: &str) -> &'static Encoding {
    let label = label.trim().trim_matches('"');
    // RFC 2231 language suffix, e.g. "utf-8*en"
    let label = label.split('*').next().unwrap_or(label).to_ascii_lowercase();

    if let Some((_, enc)) = CHARSET_ALIASES.iter().find(|(name, _)| *name == label) {
        return *enc;
    }
    Encoding::for_label(label.as_bytes()).unwrap_or_else(|| {
        log::debug!("Unknown charset '{}', using {}", label, DEFAULT_CHARSET.name());
        DEFAULT_CHARSET
    })
}

fn is_ascii_label(label: &str) -> bool {
    matches!(
        label.trim().trim_matches('"').to_ascii_lowercase().as_str(),
        "us-ascii" | "ascii" | "ansi_x3.4-1968" | "iso646-us"
    )
}

/// Turn bytes into text using the declared charset. Missing or ASCII
/// labels are read as UTF-8 when the bytes allow it, since mislabeled
/// UTF-8 is far more common than real 8-bit ASCII.
pub fn decode_charset(bytes: &[u8], charset: Option<&str>) -> String {
    match charset {
        Some(label) if !is_ascii_label(label) => {
            let (text, _) = lookup_charset(label).decode_without_bom_handling(bytes);
            text.into_owned()
        }
        _ => match std::str::from_utf8(bytes) {
            Ok(text) => text.to_string(),
            Err(_) => {
                let (text, _) = DEFAULT_CHARSET.decode_without_bom_handling(bytes);
                text.into_owned()
            }
        },
    }
}

/// Remove header folding (CRLF or LF followed by whitespace).
pub fn unfold(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    let mut chars = value.chars().peekable();
    while let Some(ch) = chars.next() {
        match ch {
            '\r' if chars.peek() == Some(&'\n') => {}
            '\n' => {}
            _ => out.push(ch),
        }
    }
    out
}

/// RFC 2047 "Q" encoding. Unlike body quoted-printable, `_` is a space and
/// trailing whitespace is significant, so the body decoder cannot be reused.
fn decode_q(text: &str) -> Vec<u8> {
    let bytes = text.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'_' => out.push(b' '),
            b'=' if i + 2 < bytes.len() => {
                let hex = std::str::from_utf8(&bytes[i + 1..i + 3])
                    .ok()
                    .and_then(|h| u8::from_str_radix(h, 16).ok());
                match hex {
                    Some(b) => {
                        out.push(b);
                        i += 2;
                    }
                    None => out.push(b'='),
                }
            }
            b => out.push(b),
        }
        i += 1;
    }
    out
}

fn decode_word_bytes(encoding: &str, text: &str) -> Result<Vec<u8>, DecodeError> {
    if encoding.eq_ignore_ascii_case("b") {
        Ok(LENIENT_BASE64.decode(text)?)
    } else {
        Ok(decode_q(text))
    }
}

/// Decode RFC 2047 encoded words inside a header value.
///
/// Whitespace between adjacent encoded words is dropped, and consecutive
/// words in the same charset are joined before charset decoding so that
/// multi-byte characters split across words survive. Words that fail to
/// decode are left as written.
pub fn decode_encoded_words(value: &str) -> String {
    let value = unfold(value);
    let mut out = String::with_capacity(value.len());
    let mut pending: Option<(String, Vec<u8>)> = None;
    let mut last_end = 0;

    fn flush(out: &mut String, pending: &mut Option<(String, Vec<u8>)>) {
        if let Some((charset, bytes)) = pending.take() {
            out.push_str(&decode_charset(&bytes, Some(&charset)));
        }
    }

    for caps in ENCODED_WORD.captures_iter(&value) {
        let Some(whole) = caps.get(0) else { continue };
        let gap = &value[last_end..whole.start()];
        let joins_previous = pending.is_some() && gap.chars().all(char::is_whitespace);

        let charset = caps[1].split('*').next().unwrap_or(&caps[1]).to_string();
        match decode_word_bytes(&caps[2], &caps[3]) {
            Ok(bytes) => {
                let same_charset = pending
                    .as_ref()
                    .map(|(c, _)| c.eq_ignore_ascii_case(&charset))
                    .unwrap_or(false);
                if joins_previous && same_charset {
                    if let Some((_, buf)) = pending.as_mut() {
                        buf.extend_from_slice(&bytes);
                    }
                } else {
                    flush(&mut out, &mut pending);
                    if !joins_previous {
                        out.push_str(gap);
                    }
                    pending = Some((charset, bytes));
                }
            }
            Err(e) => {
                log::debug!("Keeping undecodable encoded word '{}': {}", whole.as_str(), e);
                flush(&mut out, &mut pending);
                out.push_str(gap);
                out.push_str(whole.as_str());
            }
        }
        last_end = whole.end();
    }

    flush(&mut out, &mut pending);
    out.push_str(&value[last_end..]);
    out
}

/// Raw bytes per encoded word; 45 bytes of base64 stay under the 75 column
/// limit once wrapped in `=?UTF-8?B?...?=`.
const ENCODED_CHUNK: usize = 45;

/// Make `text` safe for a header value. ASCII passes through; anything else
/// becomes UTF-8 base64 encoded words joined by `fold` (a line break plus
/// whitespace).
pub fn encode_header_value(text: &str, fold: &str) -> String {
    if text.is_ascii() {
        return text.to_string();
    }

    let mut words = Vec::new();
    let mut start = 0;
    while start < text.len() {
        let mut end = (start + ENCODED_CHUNK).min(text.len());
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        words.push(format!(
            "=?UTF-8?B?{}?=",
            base64::engine::general_purpose::STANDARD.encode(&text[start..end])
        ));
        start = end;
    }
    words.join(fold)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transfer_encoding_from_header() {
        assert_eq!(TransferEncoding::from_header(Some(" BASE64 ")), TransferEncoding::Base64);
        assert_eq!(
            TransferEncoding::from_header(Some("Quoted-Printable")),
            TransferEncoding::QuotedPrintable
        );
        assert_eq!(TransferEncoding::from_header(Some("8bit")), TransferEncoding::Identity);
        assert_eq!(TransferEncoding::from_header(None), TransferEncoding::Identity);
    }

    #[test]
    fn test_base64_with_line_breaks_and_missing_padding() {
        let decoded = decode_transfer(b"SGVsbG8g\r\nd29ybGQ", TransferEncoding::Base64).unwrap();
        assert_eq!(decoded, b"Hello world");
    }

    #[test]
    fn test_invalid_base64_falls_back_to_raw() {
        let raw = b"this is !!! not base64";
        assert_eq!(decode_transfer_or_raw(raw, TransferEncoding::Base64), raw.to_vec());
    }

    #[test]
    fn test_quoted_printable_soft_breaks() {
        let decoded = decode_transfer(
            b"caf=C3=A9 au =\r\nlait",
            TransferEncoding::QuotedPrintable,
        )
        .unwrap();
        assert_eq!(String::from_utf8(decoded).unwrap(), "café au lait");
    }

    #[test]
    fn test_quoted_printable_keeps_lf_line_endings() {
        let decoded = decode_transfer(
            b"line=3Done\nline two\n",
            TransferEncoding::QuotedPrintable,
        )
        .unwrap();
        assert_eq!(decoded, b"line=one\nline two\n");

        let crlf = decode_transfer(b"a=3Db\r\nc\r\n", TransferEncoding::QuotedPrintable).unwrap();
        assert_eq!(crlf, b"a=b\r\nc\r\n");
    }

    #[test]
    fn test_charset_lookup_and_default() {
        assert_eq!(lookup_charset("ISO-8859-1").name(), "windows-1252");
        assert_eq!(lookup_charset("latin9").name(), "ISO-8859-15");
        assert_eq!(lookup_charset("utf-8*en").name(), "UTF-8");
        assert_eq!(lookup_charset("x-made-up").name(), DEFAULT_CHARSET.name());
    }

    #[test]
    fn test_decode_charset_latin1() {
        assert_eq!(decode_charset(&[0x63, 0x61, 0x66, 0xE9], Some("iso-8859-1")), "café");
    }

    #[test]
    fn test_unknown_charset_preserves_bytes() {
        let text = decode_charset(b"plain text", Some("x-unknown"));
        assert_eq!(text, "plain text");
    }

    #[test]
    fn test_ascii_label_with_utf8_bytes() {
        assert_eq!(decode_charset("naïve".as_bytes(), Some("us-ascii")), "naïve");
        assert_eq!(decode_charset("naïve".as_bytes(), None), "naïve");
    }

    #[test]
    fn test_decode_encoded_words() {
        assert_eq!(decode_encoded_words("=?UTF-8?B?SGVsbG8gV29ybGQ=?="), "Hello World");
        assert_eq!(
            decode_encoded_words("=?iso-8859-1?Q?Caf=E9_cr=E8me?= tonight"),
            "Café crème tonight"
        );
        assert_eq!(decode_encoded_words("Plain subject"), "Plain subject");
    }

    #[test]
    fn test_adjacent_words_join_split_characters() {
        // "é" (C3 A9) split across two words
        let value = "=?UTF-8?Q?caf=C3?=\r\n =?UTF-8?Q?=A9?=";
        assert_eq!(decode_encoded_words(value), "café");
    }

    #[test]
    fn test_text_between_words_is_kept() {
        assert_eq!(
            decode_encoded_words("Re: =?UTF-8?B?w6k=?= and =?UTF-8?B?w6g=?="),
            "Re: é and è"
        );
    }

    #[test]
    fn test_q_word_keeps_trailing_space() {
        assert_eq!(
            decode_encoded_words("=?UTF-8?Q?Hello_?= =?UTF-8?Q?World?="),
            "Hello World"
        );
    }

    #[test]
    fn test_unknown_charset_in_encoded_word() {
        assert_eq!(decode_encoded_words("=?x-klingon?Q?hello?="), "hello");
    }

    #[test]
    fn test_unfold() {
        assert_eq!(unfold("first\r\n second"), "first second");
        assert_eq!(unfold("first\n\tsecond"), "first\tsecond");
    }

    #[test]
    fn test_encode_header_value() {
        assert_eq!(encode_header_value("plain", "\r\n "), "plain");
        let encoded = encode_header_value("Grüße", "\r\n ");
        assert_eq!(encoded, "=?UTF-8?B?R3LDvMOfZQ==?=");
        assert_eq!(decode_encoded_words(&encoded), "Grüße");
    }

    #[test]
    fn test_encode_long_value_splits_on_char_boundary() {
        let text = "é".repeat(40);
        let encoded = encode_header_value(&text, "\r\n ");
        assert!(encoded.lines().count() > 1);
        assert!(encoded.lines().all(|l| l.trim().len() <= 75));
        assert_eq!(decode_encoded_words(&encoded), text);
    }
}
