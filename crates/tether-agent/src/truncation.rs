#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TruncationMode {
    /// Keep the start and the end, drop the middle.
    HeadTail,
    /// Keep the end only. Used for command output where the last lines carry the result.
    Tail,
}

/// Caps a tool result before it is added to the conversation.
pub fn truncate_tool_output(output: &str, max_chars: usize) -> String {
    truncate_chars(output, max_chars, TruncationMode::HeadTail)
}

/// Truncates on character boundaries, never inside a multi-byte character.
pub fn truncate_chars(output: &str, max_chars: usize, mode: TruncationMode) -> String {
    let total = output.chars().count();
    if total <= max_chars {
        return output.to_string();
    }
    let removed = total - max_chars;

    match mode {
        TruncationMode::HeadTail => {
            let head_end = byte_offset(output, max_chars / 2);
            let tail_start = byte_offset(output, total - (max_chars - max_chars / 2));
            format!(
                "{}\n\n[output truncated: {removed} characters omitted]\n\n{}",
                &output[..head_end],
                &output[tail_start..]
            )
        }
        TruncationMode::Tail => {
            let tail_start = byte_offset(output, removed);
            format!(
                "[output truncated: first {removed} characters omitted]\n{}",
                &output[tail_start..]
            )
        }
    }
}

fn byte_offset(input: &str, char_index: usize) -> usize {
    input
        .char_indices()
        .nth(char_index)
        .map_or(input.len(), |(offset, _)| offset)
}
