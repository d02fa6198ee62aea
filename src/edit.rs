use std::io::Write;
use std::path::Path;
use thiserror::Error;

/// A single pending change against the original text.
///
/// Offsets always refer to the text the buffer was created with, never to the
/// partially edited result. An insert is a replace of an empty range.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Edit {
    /// Starting byte offset (inclusive)
    pub start: usize,
    /// Ending byte offset (exclusive)
    pub end: usize,
    /// Text that takes the place of [start, end)
    pub new_text: String,
}

#[derive(Error, Debug)]
pub enum EditError {
    /// Two recorded edits claim intersecting ranges. This is a fault in the
    /// code that produced the edits, not in the input.
    #[error("overlapping edits: [{first_start}, {first_end}) and [{second_start}, {second_end})")]
    Overlap {
        first_start: usize,
        first_end: usize,
        second_start: usize,
        second_end: usize,
    },

    #[error("Invalid byte range: [{byte_start}, {byte_end}) in text of length {text_len}")]
    InvalidByteRange {
        byte_start: usize,
        byte_end: usize,
        text_len: usize,
    },

    #[error("Invalid edit would create malformed UTF-8")]
    InvalidUtf8Edit,

    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Incremental edit buffer over an immutable original text.
///
/// Edits may be recorded in any order. They are applied in ascending
/// `(start, end)` order; inserts at the same offset keep their recording
/// order. Overlapping edits are rejected when the result is assembled.
#[derive(Debug, Clone)]
pub struct EditBuffer {
    old: String,
    edits: Vec<Edit>,
}

impl EditBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        Self {
            old: text.into(),
            edits: Vec::new(),
        }
    }

    pub fn original(&self) -> &str {
        &self.old
    }

    pub fn insert(&mut self, pos: usize, text: impl Into<String>) -> Result<(), EditError> {
        self.replace(pos, pos, text)
    }

    pub fn delete(&mut self, start: usize, end: usize) -> Result<(), EditError> {
        self.replace(start, end, String::new())
    }

    pub fn replace(
        &mut self,
        start: usize,
        end: usize,
        text: impl Into<String>,
    ) -> Result<(), EditError> {
        if start > end || end > self.old.len() {
            return Err(EditError::InvalidByteRange {
                byte_start: start,
                byte_end: end,
                text_len: self.old.len(),
            });
        }
        self.edits.push(Edit {
            start,
            end,
            new_text: text.into(),
        });
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    pub fn edits(&self) -> &[Edit] {
        &self.edits
    }

    /// Assemble the edited text.
    pub fn apply(&self) -> Result<String, EditError> {
        let mut order: Vec<&Edit> = self.edits.iter().collect();
        // sort_by is stable, so same-offset inserts keep recording order
        order.sort_by(|a, b| a.start.cmp(&b.start).then(a.end.cmp(&b.end)));

        let old = self.old.as_bytes();
        let mut out = Vec::with_capacity(old.len());
        let mut offset = 0;
        let mut prev: Option<&Edit> = None;
        for edit in order {
            if edit.start < offset {
                let first = prev.unwrap_or(edit);
                return Err(EditError::Overlap {
                    first_start: first.start,
                    first_end: first.end,
                    second_start: edit.start,
                    second_end: edit.end,
                });
            }
            out.extend_from_slice(&old[offset..edit.start]);
            out.extend_from_slice(edit.new_text.as_bytes());
            offset = edit.end;
            prev = Some(edit);
        }
        out.extend_from_slice(&old[offset..]);

        String::from_utf8(out).map_err(|_| EditError::InvalidUtf8Edit)
    }
}

/// Atomic file write: tempfile + fsync + rename.
///
/// Either the full write succeeds or nothing changes.
pub fn atomic_write(path: &Path, content: &[u8]) -> Result<(), EditError> {
    // Create tempfile in same directory to ensure same filesystem
    let parent = path.parent().ok_or_else(|| {
        EditError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            "Path has no parent directory",
        ))
    })?;
    std::fs::create_dir_all(parent)?;

    let mut temp = tempfile::NamedTempFile::new_in(parent)?;
    temp.write_all(content)?;
    temp.as_file().sync_all()?;
    temp.persist(path).map_err(|e| e.error)?;

    Ok(())
}
