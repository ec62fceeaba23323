use crate::value::{Leaf, Value};

/// A single step of a [`Path`]: a field name (for records), a key (for
/// mappings), or an item (for sets).
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Segment {
    /// A record field name.
    Field(String),
    /// A mapping key.
    Key(Leaf),
    /// A set member.
    Item(Value),
}

impl From<&str> for Segment {
    fn from(name: &str) -> Self {
        Segment::Field(name.to_string())
    }
}

impl From<Leaf> for Segment {
    fn from(key: Leaf) -> Self {
        Segment::Key(key)
    }
}

/// An owned, ordered sequence of [`Segment`]s identifying a subtree of
/// some root [`Value`].
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct PathBuf(Vec<Segment>);

impl PathBuf {
    /// The empty path -- identifies the root itself.
    pub fn root() -> Self {
        Self(Vec::new())
    }

    /// Appends a segment, returning `self` for chaining.
    pub fn push(mut self, segment: impl Into<Segment>) -> Self {
        self.0.push(segment.into());
        self
    }

    /// Returns a borrowed view of this path.
    pub fn as_path(&self) -> Path<'_> {
        Path(&self.0)
    }

    /// Extends the path in place with one more segment.
    pub fn push_mut(&mut self, segment: impl Into<Segment>) {
        self.0.push(segment.into());
    }
}

impl From<Vec<Segment>> for PathBuf {
    fn from(segments: Vec<Segment>) -> Self {
        Self(segments)
    }
}

impl std::fmt::Display for PathBuf {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        self.as_path().fmt(f)
    }
}

/// A borrowed path -- see [`PathBuf`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Path<'a>(&'a [Segment]);

impl<'a> Path<'a> {
    /// Wraps a slice of segments as a path.
    pub fn new(segments: &'a [Segment]) -> Self {
        Self(segments)
    }

    /// True for the root path.
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// The segments, in traversal order.
    pub fn segments(&self) -> &'a [Segment] {
        self.0
    }

    /// The first segment and the remaining path, if any.
    pub fn split_first(&self) -> Option<(&'a Segment, Path<'a>)> {
        self.0.split_first().map(|(s, rest)| (s, Path(rest)))
    }

    /// The path without its last segment, and the last segment, if
    /// any.
    pub fn split_last(&self) -> Option<(Path<'a>, &'a Segment)> {
        self.0.split_last().map(|(s, rest)| (Path(rest), s))
    }

    /// Returns an owned copy.
    pub fn to_owned(&self) -> PathBuf {
        PathBuf(self.0.to_vec())
    }

    /// Appends one more segment, returning an owned path.
    pub fn join(&self, segment: impl Into<Segment>) -> PathBuf {
        let mut v = self.0.to_vec();
        v.push(segment.into());
        PathBuf(v)
    }
}

impl<'a> std::fmt::Display for Path<'a> {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        for (i, segment) in self.0.iter().enumerate() {
            if i > 0 {
                write!(f, ".")?;
            }
            match segment {
                Segment::Field(name) => write!(f, "{}", name)?,
                Segment::Key(key) => write!(f, "{:?}", key)?,
                Segment::Item(item) => write!(f, "<{:?}>", item)?,
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_joins_segments_with_dots() {
        let path = PathBuf::root().push("applications").push("a").push("image");
        assert_eq!(path.to_string(), "applications.a.image");
    }

    #[test]
    fn split_first_and_last_roundtrip() {
        let path = PathBuf::root().push("a").push("b").push("c");
        let (first, rest) = path.as_path().split_first().unwrap();
        assert_eq!(first, &Segment::Field("a".into()));
        assert_eq!(rest.to_owned(), PathBuf::root().push("b").push("c"));
        let (parent, last) = path.as_path().split_last().unwrap();
        assert_eq!(last, &Segment::Field("c".into()));
        assert_eq!(parent.to_owned(), PathBuf::root().push("a").push("b"));
    }
}
