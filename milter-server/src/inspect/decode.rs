use base64::{engine::general_purpose::STANDARD, Engine as _};
use encoding_rs::Encoding;

use super::InspectError;

/// Decodes an attachment filename that may contain RFC 2047 encoded words.
///
/// The input is split on single spaces. Words of the form
/// `=?charset?encoding?text?=` are decoded, everything else passes through.
/// The resulting words are joined without a separator.
pub fn decode_filename(raw: &str) -> Result<String, InspectError> {
    raw.split(' ').map(decode_word).collect()
}

fn decode_word(word: &str) -> Result<String, InspectError> {
    if !is_encoded_word(word) {
        return Ok(word.to_string());
    }

    // =?charset?encoding?text?=
    let inner = &word[2..word.len() - 2];
    let mut fields = inner.splitn(3, '?');
    let (Some(charset), Some(encoding), Some(text)) = (fields.next(), fields.next(), fields.next())
    else {
        return Err(malformed(word, "missing fields"));
    };

    // RFC 2231 language suffix, `utf-8*en`
    let charset = charset.split('*').next().unwrap_or(charset);
    if charset.is_empty() {
        return Err(malformed(word, "empty charset"));
    }

    let bytes = match encoding {
        "B" | "b" => STANDARD
            .decode(text)
            .map_err(|e| malformed(word, &e.to_string()))?,
        "Q" | "q" => decode_q(text).ok_or_else(|| malformed(word, "invalid escape"))?,
        other => return Err(malformed(word, &format!("unknown encoding {other:?}"))),
    };

    let encoding = Encoding::for_label_no_replacement(charset.as_bytes())
        .ok_or_else(|| InspectError::UnsupportedCharset(charset.to_string()))?;
    let (text, _) = encoding.decode_without_bom_handling(&bytes);
    Ok(text.into_owned())
}

fn is_encoded_word(word: &str) -> bool {
    word.len() >= 4
        && word.starts_with("=?")
        && word.ends_with("?=")
        && word.bytes().filter(|&b| b == b'?').count() == 4
}

/// Q encoding: `_` is a space, `=XX` a hex byte.
fn decode_q(text: &str) -> Option<Vec<u8>> {
    let mut out = Vec::with_capacity(text.len());
    let mut bytes = text.bytes();
    while let Some(b) = bytes.next() {
        match b {
            b'_' => out.push(b' '),
            b'=' => {
                let hi = hex_value(bytes.next()?)?;
                let lo = hex_value(bytes.next()?)?;
                out.push(hi << 4 | lo);
            }
            b => out.push(b),
        }
    }
    Some(out)
}

fn hex_value(b: u8) -> Option<u8> {
    match b {
        b'0'..=b'9' => Some(b - b'0'),
        b'a'..=b'f' => Some(b - b'a' + 10),
        b'A'..=b'F' => Some(b - b'A' + 10),
        _ => None,
    }
}

fn malformed(word: &str, reason: &str) -> InspectError {
    InspectError::EncodedWord {
        word: word.to_string(),
        reason: reason.to_string(),
    }
}
