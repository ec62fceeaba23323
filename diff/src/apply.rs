use crate::ops::{Patch, PatchOp};
use orchd_tree::{Evolver, Segment, TreeError, Value};

/// Applies `patch` to `tree`, producing a new tree.
///
/// Builds a single [`Evolver`] rooted at `tree` and routes every
/// operation through it before committing once, so a multi-field
/// record invariant sees only the fully-patched state -- never an
/// operation-by-operation intermediate that the patch as a whole never
/// actually produces.
pub fn apply(tree: &Value, patch: &Patch) -> Result<Value, TreeError> {
    let mut evolver = Evolver::new(tree.clone());
    for op in patch.ops() {
        match op {
            PatchOp::Set { path, value } => match path.as_path().split_last() {
                None => evolver.replace(value.clone()),
                Some((parent, last)) => {
                    let value = value.clone();
                    match last {
                        Segment::Field(name) => {
                            let name = name.clone();
                            evolver.transform(parent, |e| e.set_field(&name, value))?;
                        }
                        Segment::Key(key) => {
                            let key = key.clone();
                            evolver.transform(parent, |e| e.insert_key(key, value))?;
                        }
                        Segment::Item(_) => {
                            evolver.transform(parent, |e| e.replace(value))?;
                        }
                    }
                }
            },
            PatchOp::Add { path, item } => {
                let item = item.clone();
                evolver.transform(path.as_path(), |e| e.add_item(item))?;
            }
            PatchOp::Remove { path, item } => {
                let item = item.clone();
                evolver.transform(path.as_path(), |e| e.remove(item))?;
            }
        }
    }
    evolver.commit()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diff::diff;
    use orchd_tree::Leaf;

    #[test]
    fn apply_empty_patch_is_identity() {
        let tree = Value::record(vec![("a", Value::leaf(1i64))]);
        assert_eq!(apply(&tree, &Patch::empty()).unwrap(), tree);
    }

    #[test]
    fn diff_then_apply_recovers_target() {
        let a = Value::record(vec![
            ("hosts", Value::set([Value::leaf("x")])),
            (
                "applications",
                Value::mapping([(Leaf::Str("a".into()), Value::leaf(1i64))]),
            ),
        ]);
        let b = Value::record(vec![
            ("hosts", Value::set([Value::leaf("y")])),
            (
                "applications",
                Value::mapping([(Leaf::Str("a".into()), Value::leaf(2i64))]),
            ),
        ]);
        let patch = diff(&a, &b);
        assert_eq!(apply(&a, &patch).unwrap(), b);
    }

    #[test]
    fn root_set_replaces_whole_tree() {
        let a = Value::leaf(1i64);
        let b = Value::leaf(2i64);
        let patch = Patch::from_ops(vec![PatchOp::Set {
            path: orchd_tree::PathBuf::root(),
            value: b.clone(),
        }]);
        assert_eq!(apply(&a, &patch).unwrap(), b);
    }
}
