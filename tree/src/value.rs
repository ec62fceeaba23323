use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// A primitive, leaf-level value: the atoms out of which composite
/// tree values and, via [`Segment::Key`](crate::Segment), mapping keys
/// and set membership are built.
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Leaf {
    /// Absence of a value.
    Null,
    /// Boolean primitive.
    Bool(bool),
    /// Signed integer primitive.
    Int(i64),
    /// Utf8 string primitive.
    Str(String),
    /// Opaque byte string.
    Bytes(Vec<u8>),
}

impl Leaf {
    /// Returns the `bool`, if this is one.
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Leaf::Bool(b) => Some(*b),
            _ => None,
        }
    }

    /// Returns the `i64`, if this is one.
    pub fn as_int(&self) -> Option<i64> {
        match self {
            Leaf::Int(i) => Some(*i),
            _ => None,
        }
    }

    /// Returns the `&str`, if this is one.
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Leaf::Str(s) => Some(s.as_str()),
            _ => None,
        }
    }
}

impl From<&str> for Leaf {
    fn from(s: &str) -> Self {
        Leaf::Str(s.to_string())
    }
}

impl From<String> for Leaf {
    fn from(s: String) -> Self {
        Leaf::Str(s)
    }
}

impl From<i64> for Leaf {
    fn from(i: i64) -> Self {
        Leaf::Int(i)
    }
}

impl From<bool> for Leaf {
    fn from(b: bool) -> Self {
        Leaf::Bool(b)
    }
}

/// A validator attached to a [`Record`], checked once when an
/// [`Evolver`](crate::Evolver) commits -- never on intermediate,
/// partially-written states.
///
/// Implemented for any closure of matching signature, so most callers
/// never name the trait directly:
///
/// ```
/// use orchd_tree::{Invariant, Value};
/// use std::sync::Arc;
///
/// let inv: Arc<dyn Invariant> = Arc::new(|fields: &[(std::sync::Arc<str>, Value)]| {
///     Ok(())
/// });
/// ```
pub trait Invariant: Send + Sync {
    /// Checks the invariant against a record's fields after a commit.
    /// Returns a human-readable description of the violation on
    /// failure.
    fn check(&self, fields: &[(Arc<str>, Value)]) -> Result<(), String>;
}

impl<F> Invariant for F
where
    F: Fn(&[(Arc<str>, Value)]) -> Result<(), String> + Send + Sync,
{
    fn check(&self, fields: &[(Arc<str>, Value)]) -> Result<(), String> {
        self(fields)
    }
}

/// An ordered collection of named fields, optionally guarded by an
/// [`Invariant`] that may span multiple fields.
///
/// The invariant is metadata about *how* the record may evolve, not
/// data the record holds -- it plays no part in structural equality,
/// ordering, or the canonical encoding, so two records with identical
/// fields but differently-sourced invariants are indistinguishable.
#[derive(Clone)]
pub struct Record {
    fields: Vec<(Arc<str>, Value)>,
    invariant: Option<Arc<dyn Invariant>>,
}

impl Record {
    /// Creates a record with no invariant.
    pub fn new(fields: Vec<(Arc<str>, Value)>) -> Self {
        Self {
            fields,
            invariant: None,
        }
    }

    /// Creates a record guarded by `invariant`.
    pub fn with_invariant(fields: Vec<(Arc<str>, Value)>, invariant: Arc<dyn Invariant>) -> Self {
        Self {
            fields,
            invariant: Some(invariant),
        }
    }

    /// The fields, in declared order.
    pub fn fields(&self) -> &[(Arc<str>, Value)] {
        &self.fields
    }

    /// Looks up a field by name.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.fields.iter().find(|(n, _)| &**n == name).map(|(_, v)| v)
    }

    pub(crate) fn invariant(&self) -> Option<&Arc<dyn Invariant>> {
        self.invariant.as_ref()
    }
}

impl PartialEq for Record {
    fn eq(&self, other: &Self) -> bool {
        self.fields == other.fields
    }
}
impl Eq for Record {}

impl PartialOrd for Record {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}
impl Ord for Record {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.fields.cmp(&other.fields)
    }
}

impl std::fmt::Debug for Record {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let mut d = f.debug_map();
        for (name, value) in &self.fields {
            d.entry(name, value);
        }
        d.finish()
    }
}

/// An immutable, structurally-shared tree value.
///
/// One of: a record (ordered named fields), a mapping (key to tree
/// value), a set of tree values, a sequence, or a leaf primitive. All
/// variants support structural equality and a deterministic canonical
/// encoding (see [`crate::encode`]).
#[derive(Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Value {
    /// A leaf primitive.
    Leaf(Leaf),
    /// An ordered record of named fields.
    Record(Record),
    /// A key-to-value mapping, keyed by leaf.
    Mapping(BTreeMap<Leaf, Value>),
    /// A set of tree values.
    Set(BTreeSet<Value>),
    /// An ordered sequence of tree values.
    Sequence(Vec<Value>),
}

/// The shape of a [`Value`], ignoring its content -- used by the diff
/// engine to decide whether two values can be compared structurally
/// or must be replaced wholesale.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Kind {
    /// See [`Value::Leaf`].
    Leaf,
    /// See [`Value::Record`].
    Record,
    /// See [`Value::Mapping`].
    Mapping,
    /// See [`Value::Set`].
    Set,
    /// See [`Value::Sequence`].
    Sequence,
}

impl Value {
    /// Convenience constructor for a leaf.
    pub fn leaf(leaf: impl Into<Leaf>) -> Self {
        Value::Leaf(leaf.into())
    }

    /// Convenience constructor for a record.
    pub fn record(fields: Vec<(&str, Value)>) -> Self {
        Value::Record(Record::new(
            fields.into_iter().map(|(k, v)| (Arc::from(k), v)).collect(),
        ))
    }

    /// Convenience constructor for a mapping.
    pub fn mapping(entries: impl IntoIterator<Item = (Leaf, Value)>) -> Self {
        Value::Mapping(entries.into_iter().collect())
    }

    /// Convenience constructor for a set.
    pub fn set(items: impl IntoIterator<Item = Value>) -> Self {
        Value::Set(items.into_iter().collect())
    }

    /// Returns the discriminating [`Kind`] of this value.
    pub fn kind(&self) -> Kind {
        match self {
            Value::Leaf(_) => Kind::Leaf,
            Value::Record(_) => Kind::Record,
            Value::Mapping(_) => Kind::Mapping,
            Value::Set(_) => Kind::Set,
            Value::Sequence(_) => Kind::Sequence,
        }
    }

    /// Returns the record, if this is one.
    pub fn as_record(&self) -> Option<&Record> {
        match self {
            Value::Record(r) => Some(r),
            _ => None,
        }
    }

    /// Returns the mapping, if this is one.
    pub fn as_mapping(&self) -> Option<&BTreeMap<Leaf, Value>> {
        match self {
            Value::Mapping(m) => Some(m),
            _ => None,
        }
    }

    /// Returns the set, if this is one.
    pub fn as_set(&self) -> Option<&BTreeSet<Value>> {
        match self {
            Value::Set(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the leaf, if this is one.
    pub fn as_leaf(&self) -> Option<&Leaf> {
        match self {
            Value::Leaf(l) => Some(l),
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn record_equality_ignores_invariant() {
        let always_ok: Arc<dyn Invariant> = Arc::new(|_: &[(Arc<str>, Value)]| Ok(()));
        let always_err: Arc<dyn Invariant> =
            Arc::new(|_: &[(Arc<str>, Value)]| Err("nope".to_string()));
        let fields = vec![(Arc::from("a"), Value::leaf(1i64))];
        let a = Value::Record(Record::with_invariant(fields.clone(), always_ok));
        let b = Value::Record(Record::with_invariant(fields, always_err));
        assert_eq!(a, b);
    }

    #[test]
    fn set_orders_deterministically() {
        let a = Value::set([Value::leaf("z"), Value::leaf("a"), Value::leaf("m")]);
        if let Value::Set(s) = &a {
            let items: Vec<_> = s.iter().collect();
            assert_eq!(
                items,
                vec![&Value::leaf("a"), &Value::leaf("m"), &Value::leaf("z")]
            );
        } else {
            unreachable!()
        }
    }
}
