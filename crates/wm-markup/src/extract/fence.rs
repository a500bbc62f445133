//! Fenced code block tracking for code protection.

/// Classification of a line fed to [`FenceState`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum FenceLine {
    /// Ordinary line outside any fence.
    Outside,
    /// Opening fence marker.
    Open,
    /// Line inside a fenced block.
    Inside,
    /// Closing fence marker.
    Close,
}

/// Line-by-line fence state.
///
/// Fences use three or more backticks or tildes. A closing fence must use the
/// same character, be at least as long as the opening one and carry nothing
/// but whitespace after it.
#[derive(Debug, Default)]
pub(crate) struct FenceState {
    open: Option<(char, usize)>,
}

impl FenceState {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn in_fence(&self) -> bool {
        self.open.is_some()
    }

    /// Advance over `line` and classify it.
    pub(crate) fn feed(&mut self, line: &str) -> FenceLine {
        let trimmed = line.trim_start();
        match self.open {
            Some((ch, len)) => {
                if closes(trimmed, ch, len) {
                    self.open = None;
                    FenceLine::Close
                } else {
                    FenceLine::Inside
                }
            }
            None => match opening(trimmed) {
                Some(fence) => {
                    self.open = Some(fence);
                    FenceLine::Open
                }
                None => FenceLine::Outside,
            },
        }
    }
}

fn run_length(trimmed: &str, ch: char) -> usize {
    trimmed.chars().take_while(|&c| c == ch).count()
}

fn opening(trimmed: &str) -> Option<(char, usize)> {
    let first = trimmed.chars().next().filter(|c| matches!(c, '`' | '~'))?;
    let len = run_length(trimmed, first);
    (len >= 3).then_some((first, len))
}

fn closes(trimmed: &str, ch: char, min_len: usize) -> bool {
    let len = run_length(trimmed, ch);
    len > 0 && len >= min_len && trimmed[len..].trim().is_empty()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backtick_fence() {
        let mut state = FenceState::new();
        assert_eq!(state.feed("```rust"), FenceLine::Open);
        assert_eq!(state.feed("let x = [{$y}];"), FenceLine::Inside);
        assert_eq!(state.feed("```"), FenceLine::Close);
        assert!(!state.in_fence());
    }

    #[test]
    fn test_tilde_fence_not_closed_by_backticks() {
        let mut state = FenceState::new();
        assert_eq!(state.feed("~~~"), FenceLine::Open);
        assert_eq!(state.feed("```"), FenceLine::Inside);
        assert_eq!(state.feed("~~~~"), FenceLine::Close);
    }

    #[test]
    fn test_shorter_fence_does_not_close() {
        let mut state = FenceState::new();
        assert_eq!(state.feed("````"), FenceLine::Open);
        assert_eq!(state.feed("```"), FenceLine::Inside);
        assert!(state.in_fence());
    }

    #[test]
    fn test_closing_fence_with_info_is_content() {
        let mut state = FenceState::new();
        state.feed("```");
        assert_eq!(state.feed("```js"), FenceLine::Inside);
        assert_eq!(state.feed("  ```  "), FenceLine::Close);
    }

    #[test]
    fn test_two_backticks_not_fence() {
        let mut state = FenceState::new();
        assert_eq!(state.feed("``inline``"), FenceLine::Outside);
        assert_eq!(state.feed("plain"), FenceLine::Outside);
    }
}
