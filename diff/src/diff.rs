use crate::ops::{Patch, PatchOp};
use orchd_tree::{Leaf, PathBuf, Value};
use std::sync::Arc;

/// Computes the patch that turns `a` into `b`.
///
/// Recurses into records (compared field-by-field), mappings
/// (compared key-by-key), and sets (compared by symmetric difference);
/// anything else -- primitives, or composites of differing kind -- is
/// replaced wholesale with a single `Set`. Equal inputs always produce
/// an empty patch, and the emission order is a deterministic function
/// of `a` and `b` alone (sorted key/field order), so equal inputs
/// produce bit-identical patches.
pub fn diff(a: &Value, b: &Value) -> Patch {
    let mut patch = Patch::empty();
    diff_into(&mut patch, PathBuf::root(), a, b);
    patch
}

fn diff_into(patch: &mut Patch, path: PathBuf, a: &Value, b: &Value) {
    if a == b {
        return;
    }
    match (a, b) {
        (Value::Record(ra), Value::Record(rb)) => {
            diff_fields(patch, &path, ra.fields(), rb.fields());
        }
        (Value::Mapping(ma), Value::Mapping(mb)) => {
            for (key, bv) in mb {
                match ma.get(key) {
                    Some(av) if av != bv => {
                        diff_into(patch, path.clone().push(key.clone()), av, bv);
                    }
                    Some(_) => {}
                    None => patch.push(PatchOp::Set {
                        path: path.clone().push(key.clone()),
                        value: bv.clone(),
                    }),
                }
            }
            for key in ma.keys() {
                if !mb.contains_key(key) {
                    patch.push(PatchOp::Remove {
                        path: path.clone(),
                        item: Value::Leaf(key.clone()),
                    });
                }
            }
        }
        (Value::Set(sa), Value::Set(sb)) => {
            for item in sa.difference(sb) {
                patch.push(PatchOp::Remove {
                    path: path.clone(),
                    item: item.clone(),
                });
            }
            for item in sb.difference(sa) {
                patch.push(PatchOp::Add {
                    path: path.clone(),
                    item: item.clone(),
                });
            }
        }
        _ => patch.push(PatchOp::Set {
            path,
            value: b.clone(),
        }),
    }
}

fn diff_fields(
    patch: &mut Patch,
    path: &PathBuf,
    a_fields: &[(Arc<str>, Value)],
    b_fields: &[(Arc<str>, Value)],
) {
    for (name, bv) in b_fields {
        match a_fields.iter().find(|(n, _)| n == name) {
            Some((_, av)) if av != bv => {
                diff_into(patch, path.clone().push(name.as_ref()), av, bv);
            }
            Some(_) => {}
            None => patch.push(PatchOp::Set {
                path: path.clone().push(name.as_ref()),
                value: bv.clone(),
            }),
        }
    }
    for (name, _) in a_fields {
        if !b_fields.iter().any(|(n, _)| n == name) {
            patch.push(PatchOp::Remove {
                path: path.clone(),
                item: Value::Leaf(Leaf::Str(name.to_string())),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply;

    #[test]
    fn equal_values_diff_to_empty_patch() {
        let v = Value::record(vec![("a", Value::leaf(1i64))]);
        assert!(diff(&v, &v).is_empty());
    }

    #[test]
    fn mismatched_kinds_replace_wholesale() {
        let a = Value::leaf(1i64);
        let b = Value::set([Value::leaf("x")]);
        let patch = diff(&a, &b);
        assert_eq!(patch.ops().len(), 1);
        assert!(matches!(&patch.ops()[0], PatchOp::Set { path, .. } if path.as_path().is_empty()));
    }

    #[test]
    fn set_diff_is_add_remove_pair() {
        let a = Value::record(vec![("hosts", Value::set([Value::leaf("x"), Value::leaf("y")]))]);
        let b = Value::record(vec![("hosts", Value::set([Value::leaf("y"), Value::leaf("z")]))]);
        let patch = diff(&a, &b);
        assert_eq!(apply(&a, &patch).unwrap(), b);
    }

    #[test]
    fn nested_record_diff_recurses_to_leaf_field() {
        let a = Value::record(vec![("app", Value::record(vec![("image", Value::leaf("a:1"))]))]);
        let b = Value::record(vec![("app", Value::record(vec![("image", Value::leaf("a:2"))]))]);
        let patch = diff(&a, &b);
        assert_eq!(patch.ops().len(), 1);
        assert_eq!(apply(&a, &patch).unwrap(), b);
    }

    #[test]
    fn mapping_add_and_remove_keys() {
        let a = Value::mapping([(Leaf::Str("a".into()), Value::leaf(1i64))]);
        let b = Value::mapping([(Leaf::Str("b".into()), Value::leaf(2i64))]);
        let patch = diff(&a, &b);
        assert_eq!(apply(&a, &patch).unwrap(), b);
    }
}
