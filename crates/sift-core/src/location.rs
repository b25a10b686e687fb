use std::fmt;
use std::rc::Rc;

/// A half-open byte range within a source file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Location {
    pub start: u32,
    pub end: u32,
}

impl Location {
    pub fn new(start: u32, end: u32) -> Self {
        Location { start, end }
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}..{}", self.start, self.end)
    }
}

/// A source file handle. The compiler treats this as opaque apart from
/// diagnostic rendering; parsers hand out `Rc<SourceFile>` clones so the
/// handle outlives whichever IR fragment mentions it last.
#[derive(Debug)]
pub struct SourceFile {
    pub name: String,
    pub contents: String,
}

impl SourceFile {
    pub fn new(name: impl Into<String>, contents: impl Into<String>) -> Rc<Self> {
        Rc::new(SourceFile {
            name: name.into(),
            contents: contents.into(),
        })
    }

    /// 1-based line number containing the byte offset.
    pub fn line_of(&self, offset: u32) -> usize {
        let end = (offset as usize).min(self.contents.len());
        let bytes = self.contents.as_bytes();
        bytes[..end].iter().filter(|&&b| b == b'\n').count() + 1
    }

    /// Render a located diagnostic: `name:line: message`, or the bare
    /// message when no location is known.
    pub fn locate(&self, loc: Option<Location>, message: &str) -> String {
        match loc {
            Some(loc) => format!("{}:{}: {}", self.name, self.line_of(loc.start), message),
            None => format!("{}: {}", self.name, message),
        }
    }
}
