use std::io;
use std::net::SocketAddr;

use anyhow::Result;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};

use crate::session::{run_session, SessionOutcome};
use crate::sink::MailSink;

/// Cap on one logical line. Bytes past the cap are dropped, not refused.
pub const MAX_LINE_BYTES: usize = 4096;

pub const BANNER: &str = "220 smtp-sink at your service, everything you send stays here\r\n";

/// Reads one logical line, reassembling across partial reads. Tolerates
/// bare LF and strips the terminator. Anything beyond `max` bytes on a
/// single line is silently discarded. Returns `None` once the peer is
/// gone and nothing more was buffered.
pub async fn read_line_bounded<R>(reader: &mut R, max: usize) -> io::Result<Option<String>>
where
    R: AsyncBufRead + Unpin,
{
    let mut line: Vec<u8> = Vec::new();
    loop {
        let (newline_at, available_len) = {
            let available = reader.fill_buf().await?;
            if available.is_empty() {
                if line.is_empty() {
                    return Ok(None);
                }
                return Ok(Some(finish_line(line)));
            }
            let newline_at = available.iter().position(|&b| b == b'\n');
            let upto = newline_at.unwrap_or(available.len());
            let room = max.saturating_sub(line.len());
            line.extend_from_slice(&available[..upto.min(room)]);
            (newline_at, available.len())
        };
        match newline_at {
            Some(pos) => {
                reader.consume(pos + 1);
                return Ok(Some(finish_line(line)));
            }
            None => reader.consume(available_len),
        }
    }
}

fn finish_line(mut line: Vec<u8>) -> String {
    if line.last() == Some(&b'\r') {
        line.pop();
    }
    String::from_utf8_lossy(&line).into_owned()
}

/// Owns one accepted connection: greets, then keeps running transactions
/// until the client disconnects, a fatal limit hits, QUIT arrives, or the
/// process-wide stop flag is raised. The caller holds the connection
/// guard; dropping the stream closes the socket on every exit path.
pub async fn handle_client<S>(stream: S, peer: SocketAddr, sink: &MailSink) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (reader, mut writer) = tokio::io::split(stream);
    let mut reader = BufReader::new(reader);

    writer.write_all(BANNER.as_bytes()).await?;
    writer.flush().await?;

    let peer = peer.to_string();
    while !sink.shutdown.is_stopping() {
        match run_session(&mut reader, &mut writer, &peer, &sink.limits, &sink.logger).await? {
            SessionOutcome::Accepted(mail) => {
                let (path, written) = sink.storage.save(&mail, &sink.logger).await;
                sink.logger
                    .log(&format!("Written {} bytes to {:?}", written, path));
            }
            SessionOutcome::Closed => break,
        }
    }
    Ok(())
}
