use anyhow::Result;
use chrono::Local;
use tokio::io::{AsyncBufRead, AsyncWrite, AsyncWriteExt};

use crate::command::{parse_command, Command, Response};
use crate::connection::{read_line_bounded, MAX_LINE_BYTES};
use crate::logger::{safe_log_string, Logger};
use crate::mail::{Mail, CRLF};
use crate::Opt;

/// Per-section byte ceilings for one transaction. Exceeding any of them
/// is fatal to the connection, never to the process.
#[derive(Debug, Clone, Copy)]
pub struct Limits {
    pub max_recipient_bytes: u64,
    pub max_header_bytes: u64,
    pub max_body_bytes: u64,
}

impl Limits {
    pub fn from_opt(opt: &Opt) -> Self {
        Self {
            max_recipient_bytes: opt.max_recipient_size,
            max_header_bytes: opt.max_header_size,
            max_body_bytes: opt.max_body_size,
        }
    }
}

/// How one transaction ended, from the connection worker's point of view.
pub enum SessionOutcome {
    /// The client completed a transaction; the message is ready to be
    /// persisted and the connection may start another one.
    Accepted(Mail),
    /// QUIT, disconnect, or a fatal limit. The connection must close.
    Closed,
}

/// Responses can carry client-supplied text (the HELO greeting echoes its
/// argument), so the logged copy gets the same escaping as received lines.
fn log_reply_line(response: &Response) -> String {
    format!("Replied: {}", safe_log_string(&response.to_string()))
}

pub async fn reply<W>(writer: &mut W, logger: &Logger, response: &Response) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    logger.debug(&log_reply_line(response));
    writer.write_all(response.to_string().as_bytes()).await?;
    writer.write_all(CRLF.as_bytes()).await?;
    writer.flush().await?;
    Ok(())
}

/// MAIL and RCPT arguments arrive as `FROM:<a@b>` / `TO:<c@d>`; the part
/// before the first colon is routing noise. Addresses stay opaque beyond
/// whitespace trimming.
fn strip_route_prefix(argument: &str) -> &str {
    let argument = argument.trim();
    match argument.split_once(':') {
        Some((_, rest)) => rest.trim(),
        None => argument,
    }
}

/// The canned response table for command mode.
fn respond_to(command: &Command) -> Response {
    match command.verb.as_str() {
        "HELO" => Response::new(
            "250",
            &format!("Hello {}, this sink only collects mail", command.argument),
        ),
        "ELHO" => Response::new("502", "Extensions are not on the menu"),
        "MAIL" => Response::new("250", "Sender noted"),
        "RCPT" => Response::new("250", "Recipient noted"),
        "RSET" => Response::new("250", "Transaction discarded"),
        "VRFY" => Response::new("250", "Anyone you like"),
        "NOOP" => Response::new("250", "Nothing done"),
        "QUIT" => Response::new("221", "Closing connection, mail swallowed"),
        _ => Response::new("502", "Command not implemented"),
    }
}

/// Drives one transaction over an established connection: command mode
/// until DATA or QUIT, then header mode until the blank separator, then
/// body mode until the `.` sentinel. Ceilings are checked after every
/// appended unit so an oversized payload is cut off incrementally instead
/// of being buffered whole.
pub async fn run_session<R, W>(
    reader: &mut R,
    writer: &mut W,
    peer: &str,
    limits: &Limits,
    logger: &Logger,
) -> Result<SessionOutcome>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut mail = Mail::new(peer.to_string());

    // Command mode.
    loop {
        let line = match read_line_bounded(reader, MAX_LINE_BYTES).await? {
            Some(line) => line,
            None => return Ok(SessionOutcome::Closed),
        };
        logger.debug(&format!("Received {}", safe_log_string(&line)));

        if line.eq_ignore_ascii_case("DATA") {
            reply(
                writer,
                logger,
                &Response::new("354", "End data with <CR><LF>.<CR><LF>"),
            )
            .await?;
            break;
        }

        let command = parse_command(&line);
        if command.verb.is_empty() {
            reply(writer, logger, &Response::new("501", "Could not make sense of that")).await?;
            continue;
        }

        match command.verb.as_str() {
            "MAIL" => {
                let from = strip_route_prefix(&command.argument);
                mail.set_from(from);
                logger.debug(&format!("Sender set to {}", safe_log_string(from)));
            }
            "RCPT" => {
                let recipient = strip_route_prefix(&command.argument);
                mail.add_recipient(recipient);
                if mail.recipient_bytes > limits.max_recipient_bytes {
                    reply(
                        writer,
                        logger,
                        &Response::new("521", "Recipient list exceeds the configured limit"),
                    )
                    .await?;
                    return Ok(SessionOutcome::Closed);
                }
                logger.debug(&format!("Recipient added {}", safe_log_string(recipient)));
            }
            "RSET" => {
                mail = Mail::new(peer.to_string());
                logger.debug("Mail discarded");
            }
            "QUIT" => {
                logger.debug("Client requested disconnect");
                reply(writer, logger, &respond_to(&command)).await?;
                return Ok(SessionOutcome::Closed);
            }
            _ => {}
        }
        reply(writer, logger, &respond_to(&command)).await?;
    }

    // Header mode, then body mode once the blank separator arrives.
    let mut in_headers = true;
    loop {
        let line = match read_line_bounded(reader, MAX_LINE_BYTES).await? {
            Some(line) => line,
            None => return Ok(SessionOutcome::Closed),
        };
        if line == "." {
            logger.debug("Client ended mail transaction");
            mail.set_timestamp(Local::now().timestamp());
            reply(writer, logger, &Response::new("250", "Message swallowed")).await?;
            return Ok(SessionOutcome::Accepted(mail));
        }
        if in_headers {
            if line.is_empty() {
                in_headers = false;
                continue;
            }
            mail.append_header(&line);
            if mail.header_bytes > limits.max_header_bytes {
                reply(
                    writer,
                    logger,
                    &Response::new("521", "Header section exceeds the configured limit"),
                )
                .await?;
                return Ok(SessionOutcome::Closed);
            }
        } else {
            mail.append_body(&line);
            if mail.body_bytes > limits.max_body_bytes {
                reply(
                    writer,
                    logger,
                    &Response::new("521", "Message body exceeds the configured limit"),
                )
                .await?;
                return Ok(SessionOutcome::Closed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::BufReader;

    fn test_limits() -> Limits {
        Limits {
            max_recipient_bytes: 1024,
            max_header_bytes: 1024,
            max_body_bytes: 1024,
        }
    }

    fn quiet_logger() -> Logger {
        Logger::new(None, false).unwrap()
    }

    fn response_codes(output: &[u8]) -> Vec<String> {
        String::from_utf8_lossy(output)
            .lines()
            .map(|line| line.split(' ').next().unwrap_or("").to_string())
            .collect()
    }

    async fn drive(input: &str, limits: Limits) -> (Vec<u8>, SessionOutcome) {
        let data = input.as_bytes().to_vec();
        let mut reader = BufReader::new(&data[..]);
        let mut output = Vec::new();
        let outcome = run_session(
            &mut reader,
            &mut output,
            "127.0.0.1:9999",
            &limits,
            &quiet_logger(),
        )
        .await
        .unwrap();
        (output, outcome)
    }

    #[test]
    fn logged_replies_escape_client_supplied_text() {
        let command = parse_command("HELO \x1b[2J\x1b[Hevil");
        let logged = log_reply_line(&respond_to(&command));
        assert!(!logged.contains('\x1b'));
        assert!(logged.contains("\\x1b[2J\\x1b[Hevil"));
        // The wire response itself stays verbatim.
        assert!(respond_to(&command).to_string().contains('\x1b'));
    }

    #[test]
    fn route_prefix_is_stripped() {
        assert_eq!(strip_route_prefix(" FROM:<a@b> "), "<a@b>");
        assert_eq!(strip_route_prefix("TO: <c@d>"), "<c@d>");
        assert_eq!(strip_route_prefix("<bare@addr>"), "<bare@addr>");
    }

    #[tokio::test]
    async fn full_transaction_produces_expected_codes() {
        let input = "HELO x\r\nMAIL FROM:<a@b>\r\nRCPT TO:<c@d>\r\nDATA\r\n\
                     Subject: hi\r\n\r\nhello\r\n.\r\n";
        let (output, outcome) = drive(input, test_limits()).await;
        assert_eq!(response_codes(&output), ["250", "250", "250", "354", "250"]);
        match outcome {
            SessionOutcome::Accepted(mail) => {
                assert_eq!(mail.from, "<a@b>");
                assert_eq!(mail.recipients, vec!["<c@d>".to_string()]);
                assert_eq!(mail.headers.len(), 1);
                assert_eq!(mail.headers[0].key, "Subject");
                assert_eq!(mail.body, vec!["hello".to_string()]);
                assert!(mail.timestamp > 0);
            }
            SessionOutcome::Closed => panic!("transaction should have been accepted"),
        }
    }

    #[tokio::test]
    async fn bare_lf_lines_are_tolerated() {
        let input = "MAIL FROM:<a@b>\nRCPT TO:<c@d>\nDATA\n\nbody\n.\n";
        let (output, outcome) = drive(input, test_limits()).await;
        assert_eq!(response_codes(&output), ["250", "250", "354", "250"]);
        assert!(matches!(outcome, SessionOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn quit_answers_221_and_closes() {
        let (output, outcome) = drive("QUIT\r\n", test_limits()).await;
        assert_eq!(response_codes(&output), ["221"]);
        assert!(matches!(outcome, SessionOutcome::Closed));
    }

    #[tokio::test]
    async fn disconnect_mid_command_mode_closes() {
        let (output, outcome) = drive("HELO x\r\n", test_limits()).await;
        assert_eq!(response_codes(&output), ["250"]);
        assert!(matches!(outcome, SessionOutcome::Closed));
    }

    #[tokio::test]
    async fn unknown_verb_gets_502() {
        let (output, _) = drive("BOUNCE now\r\nQUIT\r\n", test_limits()).await;
        assert_eq!(response_codes(&output), ["502", "221"]);
    }

    #[tokio::test]
    async fn blank_line_gets_501() {
        let (output, _) = drive("\r\nQUIT\r\n", test_limits()).await;
        assert_eq!(response_codes(&output), ["501", "221"]);
    }

    #[tokio::test]
    async fn data_match_is_case_insensitive_whole_line() {
        let (output, _) = drive("data\r\n.\r\n", test_limits()).await;
        assert_eq!(response_codes(&output), ["354", "250"]);
    }

    #[tokio::test]
    async fn recipient_ceiling_is_fatal() {
        let limits = Limits {
            max_recipient_bytes: 8,
            ..test_limits()
        };
        let input = "RCPT TO:<b@y>\r\nRCPT TO:<cccc@zzzz>\r\nQUIT\r\n";
        let (output, outcome) = drive(input, limits).await;
        assert_eq!(response_codes(&output), ["250", "521"]);
        assert!(matches!(outcome, SessionOutcome::Closed));
    }

    #[tokio::test]
    async fn duplicate_recipient_costs_nothing() {
        let limits = Limits {
            max_recipient_bytes: 6,
            ..test_limits()
        };
        let input = "RCPT TO:<b@y>\r\nRCPT TO:<b@y>\r\nQUIT\r\n";
        let (output, _) = drive(input, limits).await;
        assert_eq!(response_codes(&output), ["250", "250", "221"]);
    }

    #[tokio::test]
    async fn header_ceiling_is_fatal_before_body_mode() {
        let limits = Limits {
            max_header_bytes: 16,
            ..test_limits()
        };
        let input = "DATA\r\nX-One: aaaaaaaa\r\nX-Two: bbbbbbbb\r\n\r\nbody\r\n.\r\n";
        let (output, outcome) = drive(input, limits).await;
        assert_eq!(response_codes(&output), ["354", "521"]);
        assert!(matches!(outcome, SessionOutcome::Closed));
    }

    #[tokio::test]
    async fn body_ceiling_is_fatal() {
        let limits = Limits {
            max_body_bytes: 4,
            ..test_limits()
        };
        let input = "DATA\r\n\r\nthis line is too long\r\n.\r\n";
        let (output, outcome) = drive(input, limits).await;
        assert_eq!(response_codes(&output), ["354", "521"]);
        assert!(matches!(outcome, SessionOutcome::Closed));
    }

    #[tokio::test]
    async fn sentinel_in_header_mode_completes_transaction() {
        let (output, outcome) = drive("DATA\r\n.\r\n", test_limits()).await;
        assert_eq!(response_codes(&output), ["354", "250"]);
        assert!(matches!(outcome, SessionOutcome::Accepted(_)));
    }

    #[tokio::test]
    async fn rset_discards_accumulated_state() {
        let input = "MAIL FROM:<old@x>\r\nRCPT TO:<old@y>\r\nRSET\r\n\
                     MAIL FROM:<new@x>\r\nRCPT TO:<new@y>\r\nDATA\r\n\r\nhi\r\n.\r\n";
        let (_, outcome) = drive(input, test_limits()).await;
        match outcome {
            SessionOutcome::Accepted(mail) => {
                assert_eq!(mail.from, "<new@x>");
                assert_eq!(mail.recipients, vec!["<new@y>".to_string()]);
            }
            SessionOutcome::Closed => panic!("expected accepted transaction"),
        }
    }
}
