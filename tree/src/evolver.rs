//! The staged-mutation facility described in the module docs: an
//! [`Evolver`] buffers writes to a node and its descendants, and only
//! materializes a single new immutable [`Value`] -- running any
//! attached [`Invariant`](crate::Invariant) exactly once -- at
//! [`Evolver::commit`].

use crate::error::TreeError;
use crate::path::{Path, Segment};
use crate::value::{Leaf, Record, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

#[derive(Clone, Eq, Ord, PartialEq, PartialOrd)]
enum ChildKey {
    Field(Arc<str>),
    Key(Leaf),
    Item(Value),
}

impl From<&Segment> for ChildKey {
    fn from(segment: &Segment) -> Self {
        match segment {
            Segment::Field(name) => ChildKey::Field(Arc::from(name.as_str())),
            Segment::Key(key) => ChildKey::Key(key.clone()),
            Segment::Item(item) => ChildKey::Item(item.clone()),
        }
    }
}

/// A staged mutation on a record field or mapping key. Which one it
/// resolves to is decided by the kind of the committed base value, not
/// by how it was staged -- mirroring how the underlying record/mapping
/// evolver is chosen dynamically at commit time.
enum Write {
    Field(Arc<str>, Value),
    Key(Leaf, Value),
}

/// A staged removal: a record field name, a mapping key, or a set
/// item, all represented as a [`Value`]. Which one it resolves to is
/// decided by the committed base's kind, exactly like [`Write`].
struct Remove(Value);

/// A staged mutation on a node and its descendants. See the module
/// docs for the commit contract.
pub struct Evolver {
    original: Value,
    replacement: Option<Value>,
    writes: Vec<Write>,
    removes: Vec<Remove>,
    adds: Vec<Value>,
    children: BTreeMap<ChildKey, Evolver>,
}

impl Evolver {
    /// Creates an evolver rooted at `original`.
    pub fn new(original: Value) -> Self {
        Self {
            original,
            replacement: None,
            writes: Vec::new(),
            removes: Vec::new(),
            adds: Vec::new(),
            children: BTreeMap::new(),
        }
    }

    fn base(&self) -> &Value {
        self.replacement.as_ref().unwrap_or(&self.original)
    }

    /// Discards every staged write and descendant, replacing the node
    /// wholesale. Used for the root-replacement `SET` and for any
    /// `SET` against a primitive or a value of a different kind.
    pub fn replace(&mut self, value: Value) {
        self.replacement = Some(value);
        self.writes.clear();
        self.removes.clear();
        self.adds.clear();
        self.children.clear();
    }

    /// Stages a record field write.
    pub fn set_field(&mut self, name: &str, value: Value) {
        self.writes.push(Write::Field(Arc::from(name), value));
    }

    /// Stages a mapping insert-or-overwrite.
    pub fn insert_key(&mut self, key: Leaf, value: Value) {
        self.writes.push(Write::Key(key, value));
    }

    /// Stages a set insert.
    pub fn add_item(&mut self, item: Value) {
        self.adds.push(item);
    }

    /// Stages a removal: a record field name (as `Value::Leaf(Leaf::Str(_))`),
    /// a mapping key (as `Value::Leaf(_)`), or a set item. Which one it is
    /// gets decided by the committed base's kind, not by this call.
    pub fn remove(&mut self, item: Value) {
        self.removes.push(Remove(item));
    }

    /// Walks `path`, creating or reusing a child evolver per segment,
    /// then calls `f` on the evolver found at the end of the walk. A
    /// segment with no matching field, key, or item in the node's
    /// current (possibly already-replaced) value is a [`PathNotFound`](TreeError::PathNotFound)
    /// error.
    pub fn transform(
        &mut self,
        path: Path,
        f: impl FnOnce(&mut Evolver),
    ) -> Result<(), TreeError> {
        match path.split_first() {
            None => {
                f(self);
                Ok(())
            }
            Some((segment, rest)) => {
                let child = self.child_mut(path, segment)?;
                child.transform(rest, f)
            }
        }
    }

    fn child_mut(&mut self, full_path: Path, segment: &Segment) -> Result<&mut Evolver, TreeError> {
        let key = ChildKey::from(segment);
        if !self.children.contains_key(&key) {
            let child_original = child_value(self.base(), segment)
                .ok_or_else(|| TreeError::PathNotFound(full_path.to_owned()))?;
            self.children.insert(key.clone(), Evolver::new(child_original));
        }
        Ok(self.children.get_mut(&key).unwrap())
    }

    /// Materializes every descendant (post-order), then this node's
    /// own staged writes, then runs this node's invariant if any.
    /// A failing invariant aborts the whole commit.
    pub fn commit(self) -> Result<Value, TreeError> {
        let mut committed_children = Vec::with_capacity(self.children.len());
        for (key, child) in self.children {
            committed_children.push((key, child.commit()?));
        }
        let base = self.replacement.unwrap_or(self.original);
        match base {
            Value::Record(record) => {
                let invariant = record.invariant().cloned();
                let mut fields = record.fields().to_vec();
                for (key, value) in committed_children {
                    set_field_value(&mut fields, require_field(key)?, value);
                }
                for write in self.writes {
                    match write {
                        Write::Field(name, value) => set_field_value(&mut fields, name, value),
                        Write::Key(_, _) => return Err(type_mismatch("record", Value::Record(Record::new(fields)))),
                    }
                }
                for remove in self.removes {
                    match remove.0 {
                        Value::Leaf(Leaf::Str(name)) => {
                            fields.retain(|(n, _)| n.as_ref() != name.as_str())
                        }
                        _ => return Err(type_mismatch("record", Value::Record(Record::new(fields)))),
                    }
                }
                if !self.adds.is_empty() {
                    return Err(type_mismatch("record", Value::Record(Record::new(fields))));
                }
                let record = match invariant {
                    Some(inv) => {
                        inv.check(&fields).map_err(TreeError::InvariantViolation)?;
                        Record::with_invariant(fields, inv)
                    }
                    None => Record::new(fields),
                };
                Ok(Value::Record(record))
            }
            Value::Mapping(mut map) => {
                for (key, value) in committed_children {
                    map.insert(require_key(key)?, value);
                }
                for write in self.writes {
                    match write {
                        Write::Key(key, value) => {
                            map.insert(key, value);
                        }
                        Write::Field(_, _) => return Err(type_mismatch("mapping", Value::Mapping(map))),
                    }
                }
                for remove in self.removes {
                    match remove.0 {
                        Value::Leaf(key) => {
                            map.remove(&key);
                        }
                        _ => return Err(type_mismatch("mapping", Value::Mapping(map))),
                    }
                }
                if !self.adds.is_empty() {
                    return Err(type_mismatch("mapping", Value::Mapping(map)));
                }
                Ok(Value::Mapping(map))
            }
            Value::Set(mut set) => {
                for (key, value) in committed_children {
                    set.remove(&require_item(key)?);
                    set.insert(value);
                }
                if !self.writes.is_empty() {
                    return Err(type_mismatch("set", Value::Set(set)));
                }
                for item in self.adds {
                    set.insert(item);
                }
                for remove in self.removes {
                    set.remove(&remove.0);
                }
                Ok(Value::Set(set))
            }
            leaf @ (Value::Leaf(_) | Value::Sequence(_)) => {
                if !self.writes.is_empty() || !self.removes.is_empty() || !self.adds.is_empty() {
                    return Err(type_mismatch(
                        if matches!(leaf, Value::Leaf(_)) { "leaf" } else { "sequence" },
                        leaf,
                    ));
                }
                Ok(leaf)
            }
        }
    }
}

fn type_mismatch(expected: &'static str, found: Value) -> TreeError {
    TreeError::TypeMismatch {
        expected,
        found: found.kind(),
    }
}

fn require_field(key: ChildKey) -> Result<Arc<str>, TreeError> {
    match key {
        ChildKey::Field(name) => Ok(name),
        ChildKey::Key(_) => Err(TreeError::TypeMismatch {
            expected: "record field",
            found: crate::value::Kind::Mapping,
        }),
        ChildKey::Item(_) => Err(TreeError::TypeMismatch {
            expected: "record field",
            found: crate::value::Kind::Set,
        }),
    }
}

fn require_key(key: ChildKey) -> Result<Leaf, TreeError> {
    match key {
        ChildKey::Key(key) => Ok(key),
        ChildKey::Field(_) => Err(TreeError::TypeMismatch {
            expected: "mapping key",
            found: crate::value::Kind::Record,
        }),
        ChildKey::Item(_) => Err(TreeError::TypeMismatch {
            expected: "mapping key",
            found: crate::value::Kind::Set,
        }),
    }
}

fn require_item(key: ChildKey) -> Result<Value, TreeError> {
    match key {
        ChildKey::Item(item) => Ok(item),
        ChildKey::Field(_) => Err(TreeError::TypeMismatch {
            expected: "set item",
            found: crate::value::Kind::Record,
        }),
        ChildKey::Key(_) => Err(TreeError::TypeMismatch {
            expected: "set item",
            found: crate::value::Kind::Mapping,
        }),
    }
}

fn set_field_value(fields: &mut Vec<(Arc<str>, Value)>, name: Arc<str>, value: Value) {
    if let Some(entry) = fields.iter_mut().find(|(n, _)| *n == name) {
        entry.1 = value;
    } else {
        fields.push((name, value));
    }
}

fn child_value(base: &Value, segment: &Segment) -> Option<Value> {
    match (base, segment) {
        (Value::Record(record), Segment::Field(name)) => record.get(name).cloned(),
        (Value::Mapping(map), Segment::Key(key)) => map.get(key).cloned(),
        (Value::Set(set), Segment::Item(item)) => set.get(item).cloned(),
        _ => None,
    }
}

/// Pure `transform`: walks `path` through `tree` and replaces the
/// subtree found there with `f(old_subtree)`, returning a new tree
/// with the replacement applied. `tree` itself is untouched; the
/// result is built by cloning each ancestor record's field list on
/// the way back up through `commit`, not by sharing untouched
/// subtrees structurally.
pub fn transform(
    tree: &Value,
    path: Path,
    f: impl FnOnce(Value) -> Value,
) -> Result<Value, TreeError> {
    let mut evolver = Evolver::new(tree.clone());
    evolver.transform(path, |leaf| {
        let replaced = f(leaf.base().clone());
        leaf.replace(replaced);
    })?;
    evolver.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::PathBuf;

    #[test]
    fn transform_replaces_only_the_targeted_subtree() {
        let tree = Value::record(vec![
            ("a", Value::record(vec![("x", Value::leaf(1i64))])),
            ("b", Value::leaf(2i64)),
        ]);
        let path = PathBuf::root().push("a").push("x");
        let updated = transform(&tree, path.as_path(), |_| Value::leaf(99i64)).unwrap();
        assert_eq!(
            updated,
            Value::record(vec![
                ("a", Value::record(vec![("x", Value::leaf(99i64))])),
                ("b", Value::leaf(2i64)),
            ])
        );
    }

    #[test]
    fn transform_missing_segment_is_path_not_found() {
        let tree = Value::record(vec![("a", Value::leaf(1i64))]);
        let path = PathBuf::root().push("missing");
        let err = transform(&tree, path.as_path(), |v| v).unwrap_err();
        assert!(matches!(err, TreeError::PathNotFound(_)));
    }

    #[test]
    fn commit_runs_invariant_once_for_multi_field_write() {
        let invariant: Arc<dyn crate::value::Invariant> =
            Arc::new(|fields: &[(Arc<str>, Value)]| {
                let lo = fields.iter().find(|(n, _)| &**n == "lo").unwrap().1.clone();
                let hi = fields.iter().find(|(n, _)| &**n == "hi").unwrap().1.clone();
                if lo.as_leaf().and_then(Leaf::as_int) <= hi.as_leaf().and_then(Leaf::as_int) {
                    Ok(())
                } else {
                    Err("lo must not exceed hi".to_string())
                }
            });
        let record = Record::with_invariant(
            vec![
                (Arc::from("lo"), Value::leaf(1i64)),
                (Arc::from("hi"), Value::leaf(2i64)),
            ],
            invariant,
        );
        let mut evolver = Evolver::new(Value::Record(record));
        // Swap lo/hi in one commit: staging them one at a time would
        // trip the invariant on the intermediate state.
        evolver.set_field("lo", Value::leaf(5i64));
        evolver.set_field("hi", Value::leaf(9i64));
        let committed = evolver.commit().unwrap();
        assert_eq!(
            committed.as_record().unwrap().get("lo").unwrap(),
            &Value::leaf(5i64)
        );
    }

    #[test]
    fn commit_aborts_atomically_on_invariant_failure() {
        let invariant: Arc<dyn crate::value::Invariant> =
            Arc::new(|_: &[(Arc<str>, Value)]| Err("always fails".to_string()));
        let record = Record::with_invariant(vec![(Arc::from("a"), Value::leaf(1i64))], invariant);
        let mut evolver = Evolver::new(Value::Record(record));
        evolver.set_field("a", Value::leaf(2i64));
        assert!(matches!(
            evolver.commit(),
            Err(TreeError::InvariantViolation(_))
        ));
    }
}
