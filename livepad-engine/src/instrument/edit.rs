//! Byte-offset edit list applied in a single print pass

/// Ordering of edits that share a start offset
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Rank {
    /// Insert that closes an earlier construct
    Close,
    /// Insert that opens a new construct
    Open,
    Replace,
}

#[derive(Debug, Clone)]
struct Edit {
    start: usize,
    end: usize,
    text: String,
    rank: Rank,
    seq: usize,
}

#[derive(Debug, Default)]
pub struct Edits {
    edits: Vec<Edit>,
}

impl Edits {
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&mut self, start: usize, end: usize, text: String, rank: Rank) {
        let seq = self.edits.len();
        self.edits.push(Edit {
            start,
            end,
            text,
            rank,
            seq,
        });
    }

    /// Insert text that opens a construct at `at`
    pub fn open(&mut self, at: usize, text: impl Into<String>) {
        self.push(at, at, text.into(), Rank::Open);
    }

    /// Insert text that closes a construct ending at `at`
    pub fn close(&mut self, at: usize, text: impl Into<String>) {
        self.push(at, at, text.into(), Rank::Close);
    }

    pub fn replace(&mut self, start: usize, end: usize, text: impl Into<String>) {
        self.push(start, end, text.into(), Rank::Replace);
    }

    /// Blank `start..end` while keeping its line breaks
    pub fn remove(&mut self, source: &str, start: usize, end: usize) {
        let newlines = source[start..end].matches('\n').count();
        self.replace(start, end, "\n".repeat(newlines));
    }

    /// Produce the edited text. An edit that overlaps an earlier accepted
    /// replacement is dropped.
    pub fn apply(mut self, source: &str) -> String {
        self.edits
            .sort_by(|a, b| (a.start, a.rank, a.seq).cmp(&(b.start, b.rank, b.seq)));

        let mut out = String::with_capacity(source.len() + self.edits.len() * 16);
        let mut cursor = 0;
        for edit in self.edits {
            if edit.start < cursor || edit.end < edit.start || edit.end > source.len() {
                tracing::trace!(start = edit.start, end = edit.end, "Dropping overlapping edit");
                continue;
            }
            out.push_str(&source[cursor..edit.start]);
            out.push_str(&edit.text);
            cursor = edit.end;
        }
        out.push_str(&source[cursor..]);
        out
    }
}
