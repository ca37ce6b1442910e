// Pure helpers exposed to plugins

pub struct UtilsCapability;

impl UtilsCapability {
    pub fn new() -> Self {
        Self
    }

    /// Truncate to at most `max_chars` characters, on a char boundary,
    /// appending an ellipsis when anything was cut.
    pub fn truncate(&self, text: &str, max_chars: usize) -> String {
        if text.chars().count() <= max_chars {
            return text.to_string();
        }
        let mut out: String = text.chars().take(max_chars.saturating_sub(1)).collect();
        out.push('…');
        out
    }

    /// Collapse runs of whitespace to single spaces and trim
    pub fn normalize_whitespace(&self, text: &str) -> String {
        text.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    /// Clamp a 1-based page number
    pub fn clamp_page(&self, page: i64) -> u32 {
        page.max(1).min(u32::MAX as i64) as u32
    }
}

impl Default for UtilsCapability {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn truncate_respects_char_boundaries() {
        let utils = UtilsCapability::new();
        assert_eq!(utils.truncate("héllo wörld", 6), "héllo…");
        assert_eq!(utils.truncate("short", 10), "short");
    }

    #[test]
    fn whitespace_collapses() {
        let utils = UtilsCapability::new();
        assert_eq!(utils.normalize_whitespace("  a \n b\t c  "), "a b c");
    }

    #[test]
    fn pages_clamp_to_one() {
        let utils = UtilsCapability::new();
        assert_eq!(utils.clamp_page(-3), 1);
        assert_eq!(utils.clamp_page(7), 7);
    }
}
