use base64::{
    alphabet,
    engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig},
    Engine as _,
};
use mailparse::{
    parse_content_disposition, parse_content_type, parse_headers, MailHeader, MailHeaderMap,
    ParsedContentType,
};
use memchr::memmem;
use std::borrow::Cow;
use tracing::debug;

use super::decode::decode_filename;
use super::policy::extension_of;
use super::{DenyReason, Halt, InspectError, Walk};

/// Mail bodies are wrapped and padding is not always right.
const LENIENT_BASE64: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new()
        .with_decode_padding_mode(DecodePaddingMode::Indifferent)
        .with_decode_allow_trailing_bits(true),
);

impl Walk<'_> {
    /// Walks one message. Only multipart bodies can carry attachments; any
    /// other message is accepted as is.
    pub(super) fn message(&mut self, raw: &[u8], depth: usize) -> Result<(), Halt> {
        if depth > self.limits.max_message_depth {
            debug!(depth, "message nesting limit reached");
            return Err(DenyReason::NestingTooDeep { depth }.into());
        }

        let (headers, body_offset) =
            parse_headers(raw).map_err(|e| InspectError::MalformedMessage(e.to_string()))?;
        let Some(content_type) = content_type(&headers) else {
            return Ok(());
        };
        if !content_type.mimetype.starts_with("multipart/") {
            return Ok(());
        }
        let boundary = content_type.params.get("boundary").ok_or_else(|| {
            InspectError::MalformedMultipart("missing boundary parameter".to_string())
        })?;

        for part in Parts::new(&raw[body_offset..], boundary) {
            self.part(part?, depth)?;
        }
        Ok(())
    }

    fn part(&mut self, raw: &[u8], depth: usize) -> Result<(), Halt> {
        let (headers, body_offset) =
            parse_headers(raw).map_err(|e| InspectError::MalformedMessage(e.to_string()))?;
        let body = &raw[body_offset..];
        let content_type = content_type(&headers);
        let mimetype = content_type
            .as_ref()
            .map_or("text/plain", |ct| ct.mimetype.as_str());

        if mimetype.starts_with("message/") {
            let inner = transfer_decode(&headers, body)?;
            self.message(&inner, depth + 1)?;
        } else if mimetype.starts_with("multipart/") {
            self.message(raw, depth + 1)?;
        }

        let Some(raw_name) = filename(&headers, content_type.as_ref()) else {
            return Ok(());
        };
        let filename = decode_filename(&raw_name)?;
        let extension = extension_of(&filename);
        if !self.policy.is_allowed(&extension) {
            debug!(%filename, %extension, depth, "blacklisted attachment");
            return Err(DenyReason::Blacklisted {
                filename,
                extension,
            }
            .into());
        }

        if self.policy.is_container(&filename) {
            let payload = transfer_decode(&headers, body)?;
            self.archive(&filename, &payload, 1)?;
        }
        Ok(())
    }
}

/// Raw value of the first header with this name, with folded lines joined by
/// a single space.
fn raw_header(headers: &[MailHeader], name: &str) -> Option<String> {
    let header = headers.get_first_header(name)?;
    let value = String::from_utf8_lossy(header.get_value_raw());
    let unfolded = value
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    Some(unfolded)
}

fn content_type(headers: &[MailHeader]) -> Option<ParsedContentType> {
    raw_header(headers, "Content-Type").map(|value| {
        let mut parsed = parse_content_type(&value);
        parsed.mimetype.make_ascii_lowercase();
        parsed
    })
}

/// Content-Disposition `filename`, falling back to Content-Type `name`.
fn filename(headers: &[MailHeader], content_type: Option<&ParsedContentType>) -> Option<String> {
    raw_header(headers, "Content-Disposition")
        .and_then(|value| {
            parse_content_disposition(&value)
                .params
                .remove("filename")
        })
        .or_else(|| content_type.and_then(|ct| ct.params.get("name").cloned()))
        .filter(|name| !name.is_empty())
}

fn transfer_decode<'a>(headers: &[MailHeader], body: &'a [u8]) -> Result<Cow<'a, [u8]>, InspectError> {
    let encoding = headers
        .get_first_value("Content-Transfer-Encoding")
        .map(|value| value.trim().to_ascii_lowercase())
        .unwrap_or_default();

    match encoding.as_str() {
        "" | "7bit" | "8bit" | "binary" => Ok(Cow::Borrowed(body)),
        "base64" => {
            let compact: Vec<u8> = body
                .iter()
                .copied()
                .filter(|b| !b.is_ascii_whitespace())
                .collect();
            LENIENT_BASE64
                .decode(compact)
                .map(Cow::Owned)
                .map_err(|e| InspectError::TransferEncoding(format!("base64: {e}")))
        }
        "quoted-printable" => {
            quoted_printable::decode(body, quoted_printable::ParseMode::Robust)
                .map(Cow::Owned)
                .map_err(|e| InspectError::TransferEncoding(format!("quoted-printable: {e}")))
        }
        other => Err(InspectError::TransferEncoding(format!(
            "unknown transfer encoding {other:?}"
        ))),
    }
}

/// Body parts of a multipart body, in document order.
///
/// Yields an error when the opening delimiter is missing or the body ends
/// before the closing delimiter.
struct Parts<'a> {
    body: &'a [u8],
    delimiter: Vec<u8>,
    pos: usize,
    started: bool,
    done: bool,
}

struct Delimiter {
    /// Start of the delimiter line.
    start: usize,
    /// First byte after the delimiter line.
    end: usize,
    close: bool,
}

impl<'a> Parts<'a> {
    fn new(body: &'a [u8], boundary: &str) -> Self {
        Parts {
            body,
            delimiter: format!("--{boundary}").into_bytes(),
            pos: 0,
            started: false,
            done: false,
        }
    }

    /// Next delimiter line at or after `from`. The delimiter has to start a
    /// line and may be followed by whitespace padding.
    fn find_delimiter(&self, from: usize) -> Option<Delimiter> {
        let finder = memmem::Finder::new(&self.delimiter);
        let mut search = from;
        while let Some(found) = finder.find(&self.body[search..]) {
            let start = search + found;
            search = start + 1;
            if start > 0 && self.body[start - 1] != b'\n' {
                continue;
            }

            let rest = &self.body[start + self.delimiter.len()..];
            let close = rest.starts_with(b"--");
            if !close {
                let padding = rest
                    .iter()
                    .take_while(|&&b| b == b' ' || b == b'\t')
                    .count();
                if !matches!(rest.get(padding), None | Some(b'\r') | Some(b'\n')) {
                    continue;
                }
            }
            let end = match memchr::memchr(b'\n', rest) {
                Some(nl) => start + self.delimiter.len() + nl + 1,
                None => self.body.len(),
            };
            return Some(Delimiter { start, end, close });
        }
        None
    }

    fn fail(&mut self, message: &str) -> Option<Result<&'a [u8], InspectError>> {
        self.done = true;
        Some(Err(InspectError::MalformedMultipart(message.to_string())))
    }
}

impl<'a> Iterator for Parts<'a> {
    type Item = Result<&'a [u8], InspectError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        if !self.started {
            let Some(opening) = self.find_delimiter(0) else {
                return self.fail("missing opening boundary");
            };
            self.started = true;
            self.pos = opening.end;
            if opening.close {
                self.done = true;
                return None;
            }
        }

        let Some(next) = self.find_delimiter(self.pos) else {
            return self.fail("missing closing boundary");
        };

        // The line break before a delimiter belongs to the delimiter
        let mut end = next.start.max(self.pos);
        if end > self.pos && self.body[end - 1] == b'\n' {
            end -= 1;
            if end > self.pos && self.body[end - 1] == b'\r' {
                end -= 1;
            }
        }
        let part = &self.body[self.pos..end];

        self.pos = next.end;
        self.done = next.close;
        Some(Ok(part))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inspect::{Inspector, Verdict};

    fn parts(body: &str, boundary: &str) -> Vec<Result<String, String>> {
        Parts::new(body.as_bytes(), boundary)
            .map(|part| {
                part.map(|p| String::from_utf8_lossy(p).into_owned())
                    .map_err(|e| e.to_string())
            })
            .collect()
    }

    fn headers(raw: &str) -> Vec<MailHeader<'_>> {
        parse_headers(raw.as_bytes()).unwrap().0
    }

    #[test]
    fn test_split_parts() {
        let body = "preamble\r\n--b\r\nA: 1\r\n\r\none\r\n--b  \r\n\r\ntwo\r\n--b--\r\nepilogue";
        assert_eq!(
            parts(body, "b"),
            vec![Ok("A: 1\r\n\r\none".to_string()), Ok("\r\ntwo".to_string())]
        );

        // Bare LF line endings
        let body = "--b\nx\n--b\ny\n--b--\n";
        assert_eq!(
            parts(body, "b"),
            vec![Ok("x".to_string()), Ok("y".to_string())]
        );
    }

    #[test]
    fn test_delimiter_must_start_a_line() {
        let body = "--b\r\nsee --b inside\r\n--bx not a delimiter\r\n--b--";
        assert_eq!(
            parts(body, "b"),
            vec![Ok("see --b inside\r\n--bx not a delimiter".to_string())]
        );
    }

    #[test]
    fn test_missing_delimiters() {
        let result = parts("no delimiters here", "b");
        assert_eq!(result.len(), 1);
        assert!(result[0].as_ref().unwrap_err().contains("opening"));

        let result = parts("--b\r\nfirst\r\n--b\r\nsecond, never closed\r\n", "b");
        assert_eq!(result.len(), 2);
        assert_eq!(result[0], Ok("first".to_string()));
        assert!(result[1].as_ref().unwrap_err().contains("closing"));

        // Closed right away
        assert!(parts("--b--\r\n", "b").is_empty());
    }

    #[test]
    fn test_unterminated_multipart_is_an_error() {
        let msg = b"Content-Type: multipart/mixed; boundary=zz\r\n\r\n\
                    --zz\r\nContent-Type: text/plain\r\n\r\nhello\r\n";
        assert!(matches!(
            Inspector::default().inspect(msg),
            Err(InspectError::MalformedMultipart(_))
        ));

        let msg = b"Content-Type: multipart/mixed\r\n\r\n--zz\r\n\r\n--zz--\r\n";
        assert!(matches!(
            Inspector::default().inspect(msg),
            Err(InspectError::MalformedMultipart(_))
        ));
    }

    #[test]
    fn test_deny_before_missing_close() {
        let msg = b"Content-Type: multipart/mixed; boundary=zz\r\n\r\n\
                    --zz\r\nContent-Disposition: attachment; filename=a.exe\r\n\r\nMZ\r\n\
                    --zz\r\nContent-Type: text/plain\r\n\r\ntruncated";
        assert!(matches!(
            Inspector::default().inspect(msg).unwrap(),
            Verdict::Deny(DenyReason::Blacklisted { .. })
        ));
    }

    #[test]
    fn test_nested_multipart() {
        let msg = "Content-Type: multipart/mixed; boundary=outer\r\n\r\n\
                   --outer\r\n\
                   Content-Type: multipart/alternative; boundary=inner\r\n\r\n\
                   --inner\r\nContent-Type: text/plain\r\n\r\ntext\r\n\
                   --inner\r\nContent-Type: application/octet-stream; name=\"tool.chm\"\r\n\r\nx\r\n\
                   --inner--\r\n\
                   --outer--\r\n";
        assert!(matches!(
            Inspector::default().inspect(msg.as_bytes()).unwrap(),
            Verdict::Deny(DenyReason::Blacklisted { extension, .. }) if extension == ".chm"
        ));
    }

    #[test]
    fn test_filename_sources() {
        let h = headers("Content-Disposition: attachment;\r\n filename=\"report.pdf\"\r\n\r\n");
        assert_eq!(filename(&h, None), Some("report.pdf".to_string()));

        // Folded encoded words
        let h = headers(
            "Content-Disposition: attachment; filename=\"=?utf-8?Q?a?=\r\n =?utf-8?Q?b.exe?=\"\r\n\r\n",
        );
        let raw = filename(&h, None).unwrap();
        assert_eq!(decode_filename(&raw).unwrap(), "ab.exe");

        // RFC 2231 parameters
        let h = headers("Content-Disposition: attachment; filename*=utf-8''na%C3%AFve.txt\r\n\r\n");
        assert_eq!(filename(&h, None), Some("naïve.txt".to_string()));

        let h = headers("Content-Type: application/x-msdownload; name=\"setup.exe\"\r\n\r\n");
        let ct = content_type(&h);
        assert_eq!(filename(&h, ct.as_ref()), Some("setup.exe".to_string()));

        let h = headers("Content-Disposition: inline\r\n\r\n");
        assert_eq!(filename(&h, None), None);
    }

    #[test]
    fn test_transfer_decoding() {
        let h = headers("Content-Transfer-Encoding: BASE64\r\n\r\n");
        assert_eq!(
            transfer_decode(&h, b"aGVs\r\nbG8=\r\n").unwrap().as_ref(),
            b"hello"
        );
        // Missing padding
        assert_eq!(transfer_decode(&h, b"aGVsbG8").unwrap().as_ref(), b"hello");
        assert!(matches!(
            transfer_decode(&h, b"**not base64**"),
            Err(InspectError::TransferEncoding(_))
        ));

        let h = headers("Content-Transfer-Encoding: quoted-printable\r\n\r\n");
        assert_eq!(
            transfer_decode(&h, b"a=3Db=\r\nc").unwrap().as_ref(),
            b"a=bc"
        );

        let h = headers("Content-Transfer-Encoding: 7bit\r\n\r\n");
        assert!(matches!(
            transfer_decode(&h, b"raw"),
            Ok(Cow::Borrowed(b"raw"))
        ));

        let h = headers("Content-Transfer-Encoding: x-uuencode\r\n\r\n");
        assert!(matches!(
            transfer_decode(&h, b"begin 644 a"),
            Err(InspectError::TransferEncoding(_))
        ));
    }

    #[test]
    fn test_quoted_printable_archive() {
        let zip = crate::inspect::archive::zip::build_zip(&[("a.shs", b"")]);
        let qp = quoted_printable::encode(&zip);
        let mut msg = b"Content-Type: multipart/mixed; boundary=q\r\n\r\n--q\r\n\
                        Content-Type: application/zip; name=\"files.zip\"\r\n\
                        Content-Transfer-Encoding: quoted-printable\r\n\r\n"
            .to_vec();
        msg.extend(qp);
        msg.extend(b"\r\n--q--\r\n");
        assert!(matches!(
            Inspector::default().inspect(&msg).unwrap(),
            Verdict::Deny(DenyReason::Blacklisted { extension, .. }) if extension == ".shs"
        ));
    }

    #[test]
    fn test_message_depth_cap() {
        let mut msg = "Content-Type: text/plain\r\n\r\nhi".to_string();
        for level in 0..20 {
            msg = format!(
                "Content-Type: multipart/mixed; boundary=b{level}\r\n\r\n\
                 --b{level}\r\nContent-Type: message/rfc822\r\n\r\n{msg}\r\n--b{level}--\r\n"
            );
        }
        assert!(matches!(
            Inspector::default().inspect(msg.as_bytes()).unwrap(),
            Verdict::Deny(DenyReason::NestingTooDeep { .. })
        ));
    }
}
