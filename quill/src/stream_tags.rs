// quill/src/stream_tags.rs
//!
//! Stream tag protocol: separates streamed prose from the terminal payload.
//!
//! The backend is instructed to finish every response with a single JSON
//! object wrapped in [`PAYLOAD_START`] / [`PAYLOAD_END`]. Everything before the
//! start tag is prose for the user. The split anchors on the *last* start tag
//! and the *last* end tag, so a tag mentioned earlier in the prose never cuts
//! the display text short once the real block has arrived.

/// Opening delimiter of the terminal payload.
pub const PAYLOAD_START: &str = "<FINAL_JSON>";

/// Closing delimiter of the terminal payload.
pub const PAYLOAD_END: &str = "</FINAL_JSON>";

/// Result of splitting cumulative stream text.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TagSplit<'a> {
    /// Prose before the payload, trailing whitespace removed.
    pub display_text: &'a str,
    /// Raw text between the delimiters, untrimmed.
    pub json_text: Option<&'a str>,
}

/// Split cumulative text into display prose and the delimited payload.
///
/// The pair is accepted only when the last end tag follows the last start
/// tag. Without a valid pair the whole text is display text.
pub fn split(full_text: &str) -> TagSplit<'_> {
    let start = full_text.rfind(PAYLOAD_START);
    let end = full_text.rfind(PAYLOAD_END);

    match (start, end) {
        (Some(start), Some(end)) if end > start => TagSplit {
            display_text: full_text[..start].trim_end(),
            json_text: Some(&full_text[start + PAYLOAD_START.len()..end]),
        },
        _ => TagSplit {
            display_text: full_text.trim_end(),
            json_text: None,
        },
    }
}

/// Display text for a stream that may still be arriving.
///
/// Same as [`split`], but additionally hides an opened block that has not
/// been closed yet and a start tag that is only partially typed at the end
/// of the text, so a preview never shows any part of the payload.
pub fn preview(full_text: &str) -> &str {
    let tagged = split(full_text);
    if tagged.json_text.is_some() {
        return tagged.display_text;
    }

    let mut visible = tagged.display_text;
    if let Some(open) = visible.rfind(PAYLOAD_START) {
        visible = &visible[..open];
    }
    strip_partial_start_tag(visible).trim_end()
}

fn strip_partial_start_tag(text: &str) -> &str {
    // Longest proper prefix of the start tag that the text ends with.
    for len in (1..PAYLOAD_START.len()).rev() {
        if text.ends_with(&PAYLOAD_START[..len]) {
            return &text[..text.len() - len];
        }
    }
    text
}

/// Instruction appended to prompts so the backend emits the tagged payload.
pub fn payload_instruction() -> String {
    format!(
        "After your explanation, output the structured result exactly once, as a single JSON \
         object wrapped in {PAYLOAD_START} and {PAYLOAD_END}, at the very end of your reply. \
         Do not write those tags anywhere else."
    )
}

/// Append [`payload_instruction`] to a prompt.
pub fn with_payload_instruction(prompt: &str) -> String {
    format!("{}\n\n{}", prompt.trim_end(), payload_instruction())
}
