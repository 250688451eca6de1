//! Streaming bout response parser
//!
//! The bout endpoint answers with server-sent events, one JSON object per
//! `data:` line, terminated by `data: [DONE]`:
//!
//! ```text
//! data: {"type":"start"}
//! data: {"type":"data-turn","data":{"turn":0,"agentId":"socrates","agentName":"Socrates"}}
//! data: {"type":"text-delta","id":"t0","delta":"Well, "}
//! data: {"type":"text-end","id":"t0"}
//! data: {"type":"data-share-line","data":{"text":"Socrates met his match"}}
//! data: [DONE]
//! ```
//!
//! Lines that are not `data:` lines are ignored. An `error` event is recorded
//! on the result and parsing continues.

use std::time::{Duration, Instant};

use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};

use crate::traits::TransportError;

/// Longest line accepted before the stream is rejected
const MAX_LINE_BYTES: usize = 1024 * 1024;

/// Boxed error returned by event callbacks
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Decoded stream event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StreamEvent {
    /// Structural start marker (`start`, `text-start`)
    Start,
    /// A new turn begins
    TurnMetadata {
        /// Turn index as sent by the server
        turn: u32,
        /// Agent identifier
        agent_id: String,
        /// Agent display name
        agent_name: String,
    },
    /// Text appended to the current turn
    TextDelta {
        /// The appended text
        delta: String,
    },
    /// Structural end-of-text marker
    TextEnd,
    /// Share line for the finished bout
    ShareLine {
        /// Share line text
        text: String,
    },
    /// Server-reported error inside the stream
    Error {
        /// Error text
        message: String,
    },
    /// Terminal `[DONE]` marker
    Done,
}

/// One agent turn with its accumulated text
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Turn {
    /// Turn index
    pub index: u32,
    /// Agent identifier
    pub agent_id: String,
    /// Agent display name
    pub agent_name: String,
    /// Concatenated deltas
    pub text: String,
}

/// Everything learned from one streamed bout
#[derive(Debug, Clone, Default, Serialize)]
pub struct StreamResult {
    /// Turns in arrival order
    pub turns: Vec<Turn>,
    /// Number of text deltas
    pub delta_count: u64,
    /// Characters across all deltas
    pub char_count: u64,
    /// Share line, if the server sent one
    pub share_line: Option<String>,
    /// Last in-stream error text
    pub error: Option<String>,
    /// Time from request start to end of parsing
    pub duration: Duration,
    /// Time from request start to the first text delta
    pub ttfb: Option<Duration>,
    /// Whether the terminal `[DONE]` marker was seen
    pub completed: bool,
}

/// Stream parsing failures
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// A `data:` line did not hold valid JSON
    #[error("malformed stream event {line:?}: {source}")]
    Malformed {
        /// The offending payload
        line: String,
        /// Decoder error
        #[source]
        source: serde_json::Error,
    },

    /// The per-event callback asked to stop
    #[error("event callback aborted the stream: {0}")]
    Callback(#[source] BoxError),

    /// Reading the body failed
    #[error("stream read failed: {0}")]
    Read(#[from] TransportError),

    /// A single line grew past the size limit
    #[error("stream line exceeded {0} bytes")]
    Oversized(usize),
}

/// Parse failure carrying whatever was decoded before it
#[derive(Debug, thiserror::Error)]
#[error("{error}")]
pub struct StreamFailure {
    /// What went wrong
    #[source]
    pub error: StreamError,
    /// Result accumulated up to the failure
    pub partial: StreamResult,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
enum WireEvent {
    Start,
    TextStart,
    TextDelta {
        #[serde(default)]
        delta: String,
    },
    TextEnd,
    DataTurn {
        #[serde(default)]
        data: WireTurn,
    },
    DataShareLine {
        #[serde(default)]
        data: WireShareLine,
    },
    Error {
        #[serde(default, rename = "errorText")]
        error_text: String,
    },
    #[serde(other)]
    Other,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WireTurn {
    #[serde(default)]
    turn: u32,
    #[serde(default)]
    agent_id: String,
    #[serde(default)]
    agent_name: String,
}

#[derive(Debug, Default, Deserialize)]
struct WireShareLine {
    #[serde(default)]
    text: String,
}

/// Incremental line-oriented parser.
///
/// Feed it raw body chunks; it splits lines across chunk boundaries and
/// applies events to the accumulated [`StreamResult`] one at a time, handing
/// each to the caller before the next line is decoded.
#[derive(Debug)]
pub struct StreamParser {
    started: Instant,
    buffer: Vec<u8>,
    result: StreamResult,
}

impl StreamParser {
    /// Create a parser; TTFB and duration are measured from `started`
    pub fn new(started: Instant) -> Self {
        Self {
            started,
            buffer: Vec::new(),
            result: StreamResult::default(),
        }
    }

    /// Whether `[DONE]` has been seen
    pub fn is_done(&self) -> bool {
        self.result.completed
    }

    /// Result accumulated so far
    pub fn result(&self) -> &StreamResult {
        &self.result
    }

    /// Split `bytes` into complete lines, decode each one and pass the event
    /// to `on_event` before touching the next line.
    ///
    /// Stops at `[DONE]`; anything after it is discarded. On a decode or
    /// callback error nothing past the failing line has been applied.
    pub fn feed<F>(&mut self, bytes: &[u8], on_event: &mut F) -> Result<(), StreamError>
    where
        F: FnMut(&StreamEvent) -> Result<(), BoxError>,
    {
        self.buffer.extend_from_slice(bytes);

        while !self.result.completed {
            let Some(pos) = self.buffer.iter().position(|b| *b == b'\n') else {
                break;
            };
            let line: Vec<u8> = self.buffer.drain(..=pos).collect();
            self.apply(&line, on_event)?;
        }

        if self.result.completed {
            self.buffer.clear();
        }
        if self.buffer.len() > MAX_LINE_BYTES {
            return Err(StreamError::Oversized(MAX_LINE_BYTES));
        }
        Ok(())
    }

    fn apply<F>(&mut self, line: &[u8], on_event: &mut F) -> Result<(), StreamError>
    where
        F: FnMut(&StreamEvent) -> Result<(), BoxError>,
    {
        let line = String::from_utf8_lossy(line);
        if let Some(event) = self.parse_line(&line)? {
            on_event(&event).map_err(StreamError::Callback)?;
        }
        Ok(())
    }

    /// Decode one line and apply it. Returns `None` for ignored lines.
    pub fn parse_line(&mut self, line: &str) -> Result<Option<StreamEvent>, StreamError> {
        if self.result.completed {
            return Ok(None);
        }

        let line = line.trim_end_matches(['\r', '\n']);
        let Some(payload) = line
            .strip_prefix("data: ")
            .or_else(|| line.strip_prefix("data:"))
        else {
            return Ok(None);
        };
        let payload = payload.trim();
        if payload.is_empty() {
            return Ok(None);
        }

        if payload == "[DONE]" {
            self.result.completed = true;
            return Ok(Some(StreamEvent::Done));
        }

        let wire: WireEvent =
            serde_json::from_str(payload).map_err(|source| StreamError::Malformed {
                line: payload.to_string(),
                source,
            })?;

        let event = match wire {
            WireEvent::Start | WireEvent::TextStart => StreamEvent::Start,
            WireEvent::TextEnd => StreamEvent::TextEnd,
            WireEvent::DataTurn { data } => {
                self.result.turns.push(Turn {
                    index: data.turn,
                    agent_id: data.agent_id.clone(),
                    agent_name: data.agent_name.clone(),
                    text: String::new(),
                });
                StreamEvent::TurnMetadata {
                    turn: data.turn,
                    agent_id: data.agent_id,
                    agent_name: data.agent_name,
                }
            }
            WireEvent::TextDelta { delta } => {
                if self.result.ttfb.is_none() {
                    self.result.ttfb = Some(self.started.elapsed());
                }
                self.result.delta_count += 1;
                self.result.char_count += delta.chars().count() as u64;
                if self.result.turns.is_empty() {
                    self.result.turns.push(Turn::default());
                }
                if let Some(turn) = self.result.turns.last_mut() {
                    turn.text.push_str(&delta);
                }
                StreamEvent::TextDelta { delta }
            }
            WireEvent::DataShareLine { data } => {
                self.result.share_line = Some(data.text.clone());
                StreamEvent::ShareLine { text: data.text }
            }
            WireEvent::Error { error_text } => {
                self.result.error = Some(error_text.clone());
                StreamEvent::Error {
                    message: error_text,
                }
            }
            WireEvent::Other => return Ok(None),
        };

        Ok(Some(event))
    }

    /// Flush a trailing unterminated line and close out the result
    pub fn finish<F>(mut self, on_event: &mut F) -> Result<StreamResult, StreamFailure>
    where
        F: FnMut(&StreamEvent) -> Result<(), BoxError>,
    {
        if !self.buffer.is_empty() && !self.result.completed {
            let rest = std::mem::take(&mut self.buffer);
            if let Err(error) = self.apply(&rest, on_event) {
                return Err(self.fail(error));
            }
        }
        Ok(self.close())
    }

    fn close(mut self) -> StreamResult {
        self.result.duration = self.started.elapsed();
        self.result
    }

    fn fail(self, error: StreamError) -> StreamFailure {
        StreamFailure {
            error,
            partial: self.close(),
        }
    }
}

/// Parse a streamed body to completion
pub async fn parse_stream<S>(body: S, started: Instant) -> Result<StreamResult, StreamFailure>
where
    S: Stream<Item = Result<bytes::Bytes, TransportError>> + Unpin,
{
    parse_stream_with(body, started, |_| Ok(())).await
}

/// Parse a streamed body, invoking `on_event` after each decoded event.
///
/// A callback error stops parsing immediately and is returned wrapped in
/// [`StreamError::Callback`] together with the partial result.
pub async fn parse_stream_with<S, F>(
    mut body: S,
    started: Instant,
    mut on_event: F,
) -> Result<StreamResult, StreamFailure>
where
    S: Stream<Item = Result<bytes::Bytes, TransportError>> + Unpin,
    F: FnMut(&StreamEvent) -> Result<(), BoxError>,
{
    let mut parser = StreamParser::new(started);

    while let Some(chunk) = body.next().await {
        let chunk = match chunk {
            Ok(chunk) => chunk,
            Err(e) => return Err(parser.fail(StreamError::Read(e))),
        };

        if let Err(e) = parser.feed(&chunk, &mut on_event) {
            return Err(parser.fail(e));
        }
        if parser.is_done() {
            break;
        }
    }

    parser.finish(&mut on_event)
}
