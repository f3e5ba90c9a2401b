//! Streaming top-level XML element boundary detection.
//!
//! Feeds a growing reassembly buffer through a forgiving, depth-counting
//! tokenizer so a relay loop can tell "I have one complete top-level
//! stanza" from "I need more bytes from the socket" without ever holding a
//! full DOM. `<stream:stream>` is treated as a root that opens and is
//! never closed (its matching `</stream:stream>` only ever shows up alone,
//! signalling stream teardown) and is reported back to the caller so it
//! can be excluded from the `incoming`/`outgoing` event stream while still
//! being consumed from the buffer.

use quick_xml::errors::SyntaxError;
use quick_xml::events::Event;
use quick_xml::Reader;

#[derive(Debug, Clone, Copy, PartialEq)]
enum ParserState {
    Idle,
    InStanza,
}

fn bytes_to_string(bytes: &[u8]) -> String {
    match std::str::from_utf8(bytes) {
        Ok(s) => s.to_string(),
        Err(_) => String::from_utf8_lossy(bytes).into_owned(),
    }
}

/// A single top-level element pulled out of a byte buffer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExtractedStanza {
    pub xml: String,
    pub bytes_consumed: usize,
    /// True for `<stream:stream ...>` and `</stream:stream>` — these are
    /// stream framing, not stanzas, and must not be emitted as
    /// incoming/outgoing events.
    pub is_stream_frame: bool,
}

/// Extracts a single complete top-level element from the front of
/// `buffer`. Returns `None` if the buffer doesn't yet contain a complete
/// element — the caller should wait for more bytes and retry with the
/// same (now larger) buffer.
pub fn extract_stanza(buffer: &[u8]) -> Option<ExtractedStanza> {
    let trimmed_start = buffer
        .iter()
        .position(|&b| b != b' ' && b != b'\t' && b != b'\n' && b != b'\r');
    if let Some(start) = trimmed_start {
        if buffer[start..].starts_with(b"</stream:stream>") {
            let tag_end = start + b"</stream:stream>".len();
            return Some(ExtractedStanza {
                xml: "</stream:stream>".to_string(),
                bytes_consumed: tag_end,
                is_stream_frame: true,
            });
        }
    }

    let mut reader = Reader::from_reader(buffer);
    reader.config_mut().trim_text(false);
    reader.config_mut().check_end_names = false;

    let mut depth: u32 = 0;
    let mut state = ParserState::Idle;
    let mut stanza_start: usize = 0;

    loop {
        let pos = reader.buffer_position() as usize;

        match reader.read_event() {
            Ok(Event::Decl(_)) | Ok(Event::PI(_)) | Ok(Event::Comment(_)) | Ok(Event::DocType(_)) => {
                continue;
            }
            Ok(Event::Start(e)) => {
                let name = e.name();
                let is_stream_open = name.local_name().as_ref() == b"stream"
                    || name.as_ref() == b"stream:stream";

                if state == ParserState::Idle && is_stream_open {
                    let tag_end = reader.buffer_position() as usize;
                    return Some(ExtractedStanza {
                        xml: bytes_to_string(&buffer[0..tag_end]),
                        bytes_consumed: tag_end,
                        is_stream_frame: true,
                    });
                }

                depth += 1;
                if state == ParserState::Idle && depth == 1 {
                    state = ParserState::InStanza;
                    stanza_start = pos;
                }
            }
            Ok(Event::Empty(e)) => {
                let name = e.name();
                let is_stream_open = name.local_name().as_ref() == b"stream"
                    || name.as_ref() == b"stream:stream";

                if state == ParserState::Idle && is_stream_open {
                    let tag_end = reader.buffer_position() as usize;
                    return Some(ExtractedStanza {
                        xml: bytes_to_string(&buffer[0..tag_end]),
                        bytes_consumed: tag_end,
                        is_stream_frame: true,
                    });
                }

                if state == ParserState::Idle && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some(ExtractedStanza {
                        xml: bytes_to_string(&buffer[pos..tag_end]),
                        bytes_consumed: tag_end,
                        is_stream_frame: false,
                    });
                }
            }
            Ok(Event::Text(_)) | Ok(Event::CData(_)) => {}
            Ok(Event::End(e)) => {
                let name = e.name();
                let is_stream_close =
                    name.local_name().as_ref() == b"stream" || name.as_ref() == b"stream:stream";

                if is_stream_close && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some(ExtractedStanza {
                        xml: "</stream:stream>".to_string(),
                        bytes_consumed: tag_end,
                        is_stream_frame: true,
                    });
                }

                depth = depth.saturating_sub(1);
                if state == ParserState::InStanza && depth == 0 {
                    let tag_end = reader.buffer_position() as usize;
                    return Some(ExtractedStanza {
                        xml: bytes_to_string(&buffer[stanza_start..tag_end]),
                        bytes_consumed: tag_end,
                        is_stream_frame: false,
                    });
                }
            }
            Ok(Event::Eof) => return None,
            Err(quick_xml::Error::Syntax(SyntaxError::UnclosedTag)) => return None,
            Err(e) => {
                tracing::debug!(error = ?e, "stanza framing parse error, waiting for more data");
                return None;
            }
        }
    }
}

/// Repeatedly extracts complete elements from `buffer`, removing consumed
/// bytes as it goes. Returns the elements found in order; any trailing
/// partial element is left in `buffer` for the next read.
pub fn drain_stanzas(buffer: &mut Vec<u8>) -> Vec<ExtractedStanza> {
    let mut out = Vec::new();
    loop {
        match extract_stanza(buffer) {
            Some(stanza) => {
                buffer.drain(0..stanza.bytes_consumed);
                out.push(stanza);
            }
            None => break,
        }
    }
    out
}
