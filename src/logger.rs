use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use anyhow::{Context, Result};
use chrono::Local;

/// Converts control characters to escape sequences so client-supplied
/// bytes can never drive the terminal.
pub fn safe_log_string(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    for c in input.chars() {
        match c {
            '\0' => result.push_str("\\0"),
            '\x01'..='\x08' | '\x0b' | '\x0c' | '\x0e'..='\x1f' | '\x7f' => {
                result.push_str(&format!("\\x{:02x}", c as u32));
            }
            _ if c.is_ascii_graphic() || c.is_ascii_whitespace() => {
                result.push(c);
            }
            _ => {
                result.push_str(&format!("\\u{{{:x}}}", c as u32));
            }
        }
    }
    result
}

/// Timestamped logging to stdout, optionally mirrored to an append-mode
/// log file. Debug lines only appear in verbose mode.
#[derive(Clone)]
pub struct Logger {
    writer: Option<Arc<Mutex<BufWriter<File>>>>,
    verbose: bool,
}

impl Logger {
    pub fn new(log_file: Option<PathBuf>, verbose: bool) -> Result<Self> {
        let writer = match log_file {
            Some(path) => {
                if let Some(parent) = path.parent() {
                    if !parent.as_os_str().is_empty() && !parent.exists() {
                        std::fs::create_dir_all(parent).with_context(|| {
                            format!("failed to create log directory {:?}", parent)
                        })?;
                    }
                }
                let file = OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(&path)
                    .with_context(|| format!("failed to open log file {:?}", path))?;
                Some(Arc::new(Mutex::new(BufWriter::new(file))))
            }
            None => None,
        };
        Ok(Self { writer, verbose })
    }

    pub fn log(&self, message: &str) {
        let timestamp = Local::now().format("%Y-%m-%d %H:%M:%S%.3f");
        let line = format!("{} {}", timestamp, message);
        println!("{}", line);
        if let Some(writer) = &self.writer {
            if let Ok(mut writer) = writer.lock() {
                let _ = writeln!(writer, "{}", line);
                let _ = writer.flush();
            }
        }
    }

    pub fn debug(&self, message: &str) {
        if self.verbose {
            self.log(message);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_control_characters() {
        assert_eq!(safe_log_string("a\x1b[31mb"), "a\\x1b[31mb");
        assert_eq!(safe_log_string("nul\0here"), "nul\\0here");
    }

    #[test]
    fn keeps_printable_text() {
        assert_eq!(safe_log_string("MAIL FROM:<a@b>"), "MAIL FROM:<a@b>");
    }

    #[test]
    fn quiet_logger_needs_no_file() {
        let logger = Logger::new(None, false).unwrap();
        logger.debug("never printed");
    }
}
