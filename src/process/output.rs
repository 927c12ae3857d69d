use std::io::{ErrorKind, Read};
use std::thread::JoinHandle;

use tracing::debug;

use crate::utils::threads::spawn_named_thread;

/// Lines longer than this are split; the remainder continues on the next
/// forwarded line.
pub const MAX_LINE_BYTES: usize = 1024;

#[derive(Clone, Copy, Debug, PartialEq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

impl StreamKind {
    fn as_str(&self) -> &'static str {
        match self {
            StreamKind::Stdout => "stdout",
            StreamKind::Stderr => "stderr",
        }
    }
}

/// Forwards a child's output stream line by line as tracing events tagged
/// with the process name. Returns the forwarding thread handle; the thread
/// ends when the stream reaches EOF.
pub(crate) fn spawn_output_forwarder<R>(
    process_name: String,
    stream: StreamKind,
    reader: R,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    spawn_named_thread(format!("output-{}-{}", process_name, stream.as_str()), {
        move || {
            forward_lines(reader, |line| {
                debug!(process = %process_name, stream = stream.as_str(), "{}", line)
            });
        }
    })
}

/// Splits a byte stream into lines capped at [`MAX_LINE_BYTES`], trims
/// trailing whitespace, drops empty lines, and passes non-UTF-8 bytes through
/// lossily.
fn forward_lines<R, F>(mut reader: R, mut emit: F)
where
    R: Read,
    F: FnMut(String),
{
    let mut pending: Vec<u8> = Vec::with_capacity(MAX_LINE_BYTES);
    let mut buf = [0u8; 4096];
    loop {
        match reader.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &buf[..n] {
                    if byte == b'\n' {
                        flush_line(&mut pending, &mut emit);
                    } else {
                        pending.push(byte);
                        if pending.len() >= MAX_LINE_BYTES {
                            flush_line(&mut pending, &mut emit);
                        }
                    }
                }
            }
            Err(err) if err.kind() == ErrorKind::Interrupted => continue,
            // A broken pipe ends forwarding but not the runner; the child's
            // actual exit is observed separately.
            Err(_) => break,
        }
    }
    flush_line(&mut pending, &mut emit);
}

fn flush_line<F>(pending: &mut Vec<u8>, emit: &mut F)
where
    F: FnMut(String),
{
    let line = String::from_utf8_lossy(pending);
    let trimmed = line.trim_end();
    if !trimmed.is_empty() {
        emit(trimmed.to_string());
    }
    pending.clear();
}
