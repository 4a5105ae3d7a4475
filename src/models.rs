//! # Core Data Model
//!
//! Types that flow through one pipeline invocation: the raw chunk handed in by a
//! transport, the per-session transcription options, and the transcript that goes
//! back out. None of these outlive the request or socket frame that created them.

use serde::{Deserialize, Serialize};

/// Which ingestion transport a unit of work arrived on.
///
/// Used as the `transport` label on every metric so HTTP and WebSocket traffic
/// can be aggregated together or apart.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Http,
    Ws,
}

impl Transport {
    pub fn as_str(&self) -> &'static str {
        match self {
            Transport::Http => "http",
            Transport::Ws => "ws",
        }
    }
}

impl std::fmt::Display for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One blob of encoded audio as received from a client.
///
/// ## Ownership:
/// Owned by the request/frame handler and moved into the pipeline, which drops
/// it as soon as the transcoder has produced PCM.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    /// Encoded audio bytes (webm, ogg, wav, mp3, raw PCM, ...)
    pub data: Vec<u8>,

    /// Content-type declared by the client. Advisory only.
    pub mime_hint: Option<String>,

    /// File extension taken from the upload filename, without the dot
    pub extension: Option<String>,
}

impl AudioChunk {
    pub fn new(data: Vec<u8>, mime_hint: Option<String>) -> Self {
        Self {
            data,
            mime_hint,
            extension: None,
        }
    }

    pub fn with_extension(mut self, extension: Option<String>) -> Self {
        self.extension = extension;
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Transcription options fixed for the lifetime of a request or streaming session.
///
/// Built from query parameters on `/webhook/audio` or from the first text frame on
/// `/ws/transcribe`. Unset fields fall back to the process-wide defaults through
/// [`SessionConfig::or_defaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default)]
    pub language: Option<String>,

    #[serde(default)]
    pub initial_prompt: Option<String>,
}

impl SessionConfig {
    pub fn new(language: Option<String>, initial_prompt: Option<String>) -> Self {
        Self {
            language,
            initial_prompt,
        }
    }

    /// Fill unset fields from `defaults`.
    ///
    /// Blank strings count as unset, and a language of `auto` means "let the
    /// engine detect it".
    pub fn or_defaults(&self, defaults: &SessionConfig) -> SessionConfig {
        let language = non_blank(&self.language)
            .or_else(|| non_blank(&defaults.language))
            .filter(|lang| !lang.eq_ignore_ascii_case("auto"));
        let initial_prompt =
            non_blank(&self.initial_prompt).or_else(|| non_blank(&defaults.initial_prompt));

        SessionConfig {
            language,
            initial_prompt,
        }
    }
}

fn non_blank(value: &Option<String>) -> Option<String> {
    value
        .as_deref()
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .map(str::to_string)
}

/// A contiguous time-stamped span of recognized speech.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TranscriptSegment {
    /// Start offset into the chunk, in seconds
    pub start: f64,
    /// End offset into the chunk, in seconds (never before `start`)
    pub end: f64,
    pub text: String,
}

/// Final result of one pipeline invocation, serialized straight to the caller.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TranscriptResult {
    pub language: String,
    /// Duration of the decoded audio in seconds
    pub duration: f64,
    /// Segment texts joined with single spaces
    #[serde(rename = "transcript")]
    pub full_text: String,
    pub segments: Vec<TranscriptSegment>,
}

impl TranscriptResult {
    /// Assemble a result from raw engine segments.
    ///
    /// Segment text is trimmed, empty segments are dropped, segments are ordered
    /// by start time and any inverted span is collapsed to `end == start`.
    pub fn assemble(language: String, duration: f64, segments: Vec<TranscriptSegment>) -> Self {
        let mut segments: Vec<TranscriptSegment> = segments
            .into_iter()
            .filter_map(|seg| {
                let text = seg.text.trim().to_string();
                if text.is_empty() {
                    return None;
                }
                let start = seg.start.max(0.0);
                Some(TranscriptSegment {
                    start,
                    end: seg.end.max(start),
                    text,
                })
            })
            .collect();
        segments.sort_by(|a, b| a.start.total_cmp(&b.start));

        let full_text = segments
            .iter()
            .map(|seg| seg.text.as_str())
            .collect::<Vec<_>>()
            .join(" ");

        Self {
            language,
            duration,
            full_text,
            segments,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
        TranscriptSegment {
            start,
            end,
            text: text.to_string(),
        }
    }

    #[test]
    fn test_session_config_defaults() {
        let defaults = SessionConfig::new(Some("en".into()), Some("meeting notes".into()));

        let empty = SessionConfig::default().or_defaults(&defaults);
        assert_eq!(empty.language.as_deref(), Some("en"));
        assert_eq!(empty.initial_prompt.as_deref(), Some("meeting notes"));

        let explicit = SessionConfig::new(Some("de".into()), Some("  ".into())).or_defaults(&defaults);
        assert_eq!(explicit.language.as_deref(), Some("de"));
        assert_eq!(explicit.initial_prompt.as_deref(), Some("meeting notes"));
    }

    #[test]
    fn test_auto_language_means_detect() {
        let resolved = SessionConfig::new(Some("AUTO".into()), None).or_defaults(&SessionConfig::default());
        assert_eq!(resolved.language, None);
    }

    #[test]
    fn test_assemble_orders_and_joins() {
        let result = TranscriptResult::assemble(
            "en".into(),
            4.0,
            vec![seg(2.0, 3.5, " world "), seg(0.0, 1.0, "hello"), seg(3.5, 4.0, "   ")],
        );

        assert_eq!(result.full_text, "hello world");
        assert_eq!(result.segments.len(), 2);
        assert_eq!(result.segments[0].text, "hello");
        assert_eq!(result.segments[1].start, 2.0);
    }

    #[test]
    fn test_assemble_clamps_inverted_span() {
        let result = TranscriptResult::assemble("en".into(), 1.0, vec![seg(0.8, 0.2, "x")]);
        assert_eq!(result.segments[0].end, 0.8);
    }

    #[test]
    fn test_result_serializes_transcript_field() {
        let result = TranscriptResult::assemble("en".into(), 1.0, vec![seg(0.0, 1.0, "hi")]);
        let json = serde_json::to_value(&result).unwrap();
        assert_eq!(json["transcript"], "hi");
        assert_eq!(json["segments"][0]["end"], 1.0);
    }
}
