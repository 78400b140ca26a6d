//! Wire framing for text instrument families.
//!
//! A raw command such as `"OUT 1"` is trimmed, its internal whitespace runs are replaced by
//! the family separator (or removed), and the family start/end tokens are wrapped around it:
//!
//! ```
//! use psu_bench::instrument::framing::frame;
//!
//! assert_eq!(frame("OUT 1", ":", "", ";"), b":OUT1;");
//! assert_eq!(frame("OUT 1", "", " ", ""), b"OUT 1");
//! ```

/// Character that marks a raw command as a query.
pub const QUERY_MARKER: char = '?';

/// How whitespace inside a command is put on the wire.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Separator {
    /// The family defines no separator: whitespace is dropped.
    Remove,
    /// Each whitespace run becomes this token.
    Replace(String),
}

/// Start/separator/end tokens of one device family.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Framing {
    /// Prepended to every frame
    pub start: String,
    /// Applied to internal whitespace
    pub separator: Separator,
    /// Appended to every frame
    pub end: String,
}

impl Framing {
    /// Build framing from table tokens. An empty `mid` means the family has no separator.
    pub fn new(start: &str, mid: &str, end: &str) -> Self {
        let separator = if mid.is_empty() {
            Separator::Remove
        } else {
            Separator::Replace(mid.to_string())
        };
        Self {
            start: start.to_string(),
            separator,
            end: end.to_string(),
        }
    }

    /// Frame `raw` for the wire.
    pub fn frame(&self, raw: &str) -> Vec<u8> {
        let words = raw.split_whitespace();
        let body = match &self.separator {
            Separator::Remove => words.collect::<String>(),
            Separator::Replace(token) => words.collect::<Vec<_>>().join(token),
        };
        format!("{}{}{}", self.start, body, self.end).into_bytes()
    }
}

/// Frame `raw` with the given tokens.
pub fn frame(raw: &str, start: &str, mid: &str, end: &str) -> Vec<u8> {
    Framing::new(start, mid, end).frame(raw)
}

/// Whether a command is sent as a write or as a query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    /// No response is read
    Write,
    /// One response is read after sending
    Query,
}

impl CommandKind {
    /// Classify a raw command by the presence of [`QUERY_MARKER`].
    pub fn classify(raw: &str) -> Self {
        if raw.contains(QUERY_MARKER) {
            CommandKind::Query
        } else {
            CommandKind::Write
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_separator_removes_whitespace() {
        assert_eq!(frame("OUT 1", ":", "", ";"), b":OUT1;".to_vec());
    }

    #[test]
    fn test_space_separator_is_identity() {
        assert_eq!(frame("OUT 1", "", " ", ""), b"OUT 1".to_vec());
    }

    #[test]
    fn test_whitespace_runs_collapse_to_one_token() {
        let framing = Framing::new("", "_", "\r");
        assert_eq!(framing.frame("  VOLT \t 12.5  "), b"VOLT_12.5\r".to_vec());
    }

    #[test]
    fn test_empty_mid_is_remove() {
        assert_eq!(Framing::new(":", "", ";").separator, Separator::Remove);
        assert_eq!(
            Framing::new("", " ", "").separator,
            Separator::Replace(" ".to_string())
        );
    }

    #[test]
    fn test_classify() {
        assert_eq!(CommandKind::classify("MDL?"), CommandKind::Query);
        assert_eq!(CommandKind::classify("VOL?"), CommandKind::Query);
        assert_eq!(CommandKind::classify("OUT 1"), CommandKind::Write);
    }
}
