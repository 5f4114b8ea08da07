use std::io::{self, Write};

pub const CRLF: &str = "\r\n";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Header {
    pub key: String,
    pub value: String,
}

/// In-memory record of one mail transaction, built incrementally as the
/// session progresses. Discarded and replaced wholesale on RSET, never
/// partially cleared.
#[derive(Debug, Clone)]
pub struct Mail {
    pub client: String,
    pub from: String,
    pub recipients: Vec<String>,
    pub headers: Vec<Header>,
    pub body: Vec<String>,
    pub header_bytes: u64,
    pub body_bytes: u64,
    pub from_bytes: u64,
    pub recipient_bytes: u64,
    pub timestamp: i64,
}

enum HeaderLine<'a> {
    New { key: &'a str, value: &'a str },
    Continuation(&'a str),
    Orphan,
}

/// A header line is either a fresh `key: value` pair, a continuation of
/// the previous header (single leading space, no colon), or an orphan
/// continuation with nothing to attach to.
fn classify_header_line(raw: &str, has_previous: bool) -> HeaderLine<'_> {
    if let Some((key, value)) = raw.split_once(':') {
        return HeaderLine::New { key, value };
    }
    match raw.strip_prefix(' ') {
        Some(rest) if has_previous => HeaderLine::Continuation(rest),
        _ => HeaderLine::Orphan,
    }
}

impl Mail {
    pub fn new(client: String) -> Self {
        Self {
            client,
            from: String::new(),
            recipients: Vec::new(),
            headers: Vec::new(),
            body: Vec::new(),
            header_bytes: 0,
            body_bytes: 0,
            from_bytes: 0,
            recipient_bytes: 0,
            timestamp: 0,
        }
    }

    pub fn set_from(&mut self, from: &str) {
        self.from_bytes = from.len() as u64;
        self.from = from.to_string();
    }

    /// Appends a recipient unless it is already present. Duplicates are
    /// accepted silently and cost no bytes.
    pub fn add_recipient(&mut self, recipient: &str) {
        if self.recipients.iter().any(|r| r == recipient) {
            return;
        }
        self.recipient_bytes += recipient.len() as u64;
        self.recipients.push(recipient.to_string());
    }

    /// Records one raw header line. Malformed input degrades to a recorded
    /// `invalid-header` entry rather than rejecting the transaction, since
    /// the sink must never drop data it already received. The byte counter
    /// grows by the raw line length whichever branch runs.
    pub fn append_header(&mut self, raw: &str) {
        match classify_header_line(raw, !self.headers.is_empty()) {
            HeaderLine::New { key, value } => {
                self.headers.push(Header {
                    key: key.to_string(),
                    value: value.to_string(),
                });
            }
            HeaderLine::Continuation(rest) => {
                // `headers` is non-empty per the classification above.
                if let Some(previous) = self.headers.last_mut() {
                    previous.value.push_str(CRLF);
                    previous.value.push(' ');
                    previous.value.push_str(rest);
                }
            }
            HeaderLine::Orphan => {
                self.headers.push(Header {
                    key: "invalid-header".to_string(),
                    value: raw.to_string(),
                });
            }
        }
        self.header_bytes += raw.len() as u64;
    }

    pub fn append_body(&mut self, line: &str) {
        self.body_bytes += line.len() as u64;
        self.body.push(line.to_string());
    }

    pub fn set_timestamp(&mut self, when: i64) {
        self.timestamp = when;
    }

    /// Serializes the message: provenance headers describing receipt
    /// metadata, then the client's headers, a blank separator, then the
    /// body, every line CRLF-terminated.
    pub fn write_to<W: Write>(&self, dest: &mut W) -> io::Result<()> {
        write!(dest, "X-SMTP-CLIENT-ADDRESS: {}{}", self.client, CRLF)?;
        write!(dest, "X-SMTP-RECEIVED-AT: {}{}", self.timestamp, CRLF)?;
        write!(
            dest,
            "X-SMTP-ESTIMATED-HEADER-SIZE: {}{}",
            self.header_bytes, CRLF
        )?;
        write!(
            dest,
            "X-SMTP-ESTIMATED-RCPT-SIZE: {}{}",
            self.recipient_bytes, CRLF
        )?;
        write!(
            dest,
            "X-SMTP-ESTIMATED-BODY-SIZE: {}{}",
            self.body_bytes, CRLF
        )?;
        write!(dest, "X-SMTP-ORIGINAL-MAIL-FROM: {}{}", self.from, CRLF)?;
        let total = self.recipients.len();
        for (idx, recipient) in self.recipients.iter().enumerate() {
            write!(
                dest,
                "X-SMTP-ORIGINAL-RCPT-TO-{}-of-{}: {}{}",
                idx + 1,
                total,
                recipient,
                CRLF
            )?;
        }
        for header in &self.headers {
            write!(dest, "{}:{}{}", header.key, header.value, CRLF)?;
        }
        dest.write_all(CRLF.as_bytes())?;
        for line in &self.body {
            write!(dest, "{}{}", line, CRLF)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_from_overwrites_and_recounts() {
        let mut mail = Mail::new("peer".to_string());
        mail.set_from("<long-sender@example.com>");
        mail.set_from("<a@b>");
        assert_eq!(mail.from, "<a@b>");
        assert_eq!(mail.from_bytes, 5);
    }

    #[test]
    fn add_recipient_is_idempotent() {
        let mut mail = Mail::new("peer".to_string());
        mail.add_recipient("<b@y>");
        mail.add_recipient("<b@y>");
        assert_eq!(mail.recipients.len(), 1);
        assert_eq!(mail.recipient_bytes, "<b@y>".len() as u64);
    }

    #[test]
    fn distinct_recipients_accumulate_bytes() {
        let mut mail = Mail::new("peer".to_string());
        mail.add_recipient("<b@y>");
        mail.add_recipient("<c@z>");
        assert_eq!(mail.recipients.len(), 2);
        assert_eq!(mail.recipient_bytes, 10);
    }

    #[test]
    fn header_continuation_joins_previous_entry() {
        let mut mail = Mail::new("peer".to_string());
        mail.append_header("X-Foo: bar");
        mail.append_header(" baz");
        assert_eq!(mail.headers.len(), 1);
        assert_eq!(mail.headers[0].key, "X-Foo");
        assert_eq!(mail.headers[0].value, " bar\r\n baz");
        assert_eq!(mail.header_bytes, ("X-Foo: bar".len() + " baz".len()) as u64);
    }

    #[test]
    fn orphan_continuation_is_wrapped() {
        let mut mail = Mail::new("peer".to_string());
        mail.append_header(" dangling");
        assert_eq!(mail.headers.len(), 1);
        assert_eq!(mail.headers[0].key, "invalid-header");
        assert_eq!(mail.headers[0].value, " dangling");
        assert_eq!(mail.header_bytes, " dangling".len() as u64);
    }

    #[test]
    fn colonless_line_without_space_is_wrapped() {
        let mut mail = Mail::new("peer".to_string());
        mail.append_header("Subject: hi");
        mail.append_header("garbage");
        assert_eq!(mail.headers.len(), 2);
        assert_eq!(mail.headers[1].key, "invalid-header");
        assert_eq!(mail.headers[1].value, "garbage");
    }

    #[test]
    fn body_bytes_track_appended_lengths() {
        let mut mail = Mail::new("peer".to_string());
        mail.append_body("hello");
        mail.append_body("");
        mail.append_body("world!");
        assert_eq!(mail.body.len(), 3);
        assert_eq!(mail.body_bytes, 11);
    }

    #[test]
    fn serialization_round_trip() {
        let mut mail = Mail::new("10.0.0.1:4242".to_string());
        mail.set_from("a@x");
        mail.add_recipient("b@y");
        mail.add_recipient("c@z");
        mail.append_header("Subject: hi");
        mail.append_body("line1");
        mail.set_timestamp(1_700_000_000);

        let mut out = Vec::new();
        mail.write_to(&mut out).unwrap();
        let text = String::from_utf8(out).unwrap();

        assert!(text.contains("X-SMTP-CLIENT-ADDRESS: 10.0.0.1:4242\r\n"));
        assert!(text.contains("X-SMTP-RECEIVED-AT: 1700000000\r\n"));
        assert!(text.contains("X-SMTP-ORIGINAL-MAIL-FROM: a@x\r\n"));
        assert!(text.contains("X-SMTP-ORIGINAL-RCPT-TO-1-of-2: b@y\r\n"));
        assert!(text.contains("X-SMTP-ORIGINAL-RCPT-TO-2-of-2: c@z\r\n"));
        assert!(text.contains("Subject: hi\r\n"));
        assert!(text.ends_with("\r\nline1\r\n"));

        // Exactly one blank separator between headers and body.
        let (head, body) = text.split_once("\r\n\r\n").unwrap();
        assert!(head.contains("Subject: hi"));
        assert_eq!(body, "line1\r\n");
    }
}
