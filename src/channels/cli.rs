//! CLI listener: stdin lines as inbound events, for local testing.
//!
//! Each line is `<source_id> <text>`. A text starting with `photo:<file_id>`
//! (or any other media kind) attaches media and uses the rest as caption.

use std::sync::Arc;

use tokio::io::{AsyncBufRead, AsyncBufReadExt, BufReader, Stdin};
use tokio_stream::StreamExt;
use tokio_stream::wrappers::LinesStream;
use tracing::{debug, warn};

use crate::engine::ForwardingEngine;
use crate::pipeline::types::{InboundMessage, MediaKind};

pub struct CliListener<R> {
    lines: LinesStream<R>,
    next_message_id: i64,
}

impl CliListener<BufReader<Stdin>> {
    pub fn stdin() -> Self {
        Self::new(BufReader::new(tokio::io::stdin()))
    }
}

impl<R: AsyncBufRead + Unpin> CliListener<R> {
    pub fn new(reader: R) -> Self {
        Self {
            lines: LinesStream::new(reader.lines()),
            next_message_id: 1,
        }
    }

    /// Read until EOF, dispatching every parsable line. Returns how many
    /// events were dispatched.
    pub async fn run(mut self, engine: Arc<ForwardingEngine>) -> usize {
        let mut dispatched = 0;
        eprint!("> ");

        while let Some(line) = self.lines.next().await {
            let line = match line {
                Ok(line) => line,
                Err(e) => {
                    tracing::error!("Error reading stdin: {}", e);
                    break;
                }
            };
            let line = line.trim();
            if line.is_empty() {
                eprint!("> ");
                continue;
            }

            match parse_line(line, self.next_message_id) {
                Ok(message) => {
                    self.next_message_id += 1;
                    let report = engine.dispatch(message);
                    debug!(
                        matched = report.matched,
                        enqueued = report.enqueued,
                        dropped = report.dropped,
                        "Dispatched CLI event"
                    );
                    if report.matched == 0 {
                        eprintln!("(no task listens to that source)");
                    }
                    dispatched += 1;
                }
                Err(e) => {
                    warn!(line, "Unparsable CLI line: {e}");
                    eprintln!("usage: <source_id> [<media>:<file_id>] <text>");
                }
            }
            eprint!("> ");
        }

        dispatched
    }
}

/// Parse `<source_id> [<media>:<file_id>] <text>`.
pub fn parse_line(line: &str, message_id: i64) -> Result<InboundMessage, String> {
    let (source, rest) = line.split_once(' ').unwrap_or((line, ""));
    let source_id: i64 = source
        .parse()
        .map_err(|_| format!("'{source}' is not a chat id"))?;

    let rest = rest.trim();
    let (first, tail) = rest.split_once(' ').unwrap_or((rest, ""));
    if let Some((kind, file_id)) = first.split_once(':') {
        if let Some(kind) = media_kind(kind) {
            return Ok(InboundMessage::text(source_id, message_id, tail.trim())
                .with_media(kind, file_id));
        }
    }

    Ok(InboundMessage::text(source_id, message_id, rest))
}

fn media_kind(s: &str) -> Option<MediaKind> {
    let kind = match s {
        "photo" => MediaKind::Photo,
        "video" => MediaKind::Video,
        "document" => MediaKind::Document,
        "audio" => MediaKind::Audio,
        "voice" => MediaKind::Voice,
        "sticker" => MediaKind::Sticker,
        "animation" => MediaKind::Animation,
        _ => return None,
    };
    Some(kind)
}
