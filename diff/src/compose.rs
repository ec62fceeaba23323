use crate::ops::Patch;

/// Composes a sequence of patches into one equivalent patch.
///
/// `apply(compose([p, q]), t) == apply(q, apply(p, t))` for any tree
/// `t` the individual applications succeed on: composition is plain
/// concatenation of operation sequences, since patch application
/// already processes operations strictly in order.
pub fn compose(patches: impl IntoIterator<Item = Patch>) -> Patch {
    let mut ops = Vec::new();
    for patch in patches {
        ops.extend(patch.into_ops());
    }
    Patch::from_ops(ops)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::apply::apply;
    use crate::diff::diff;
    use orchd_tree::Value;

    #[test]
    fn compose_matches_sequential_apply() {
        let a = Value::record(vec![("a", Value::leaf(1i64)), ("b", Value::leaf(1i64))]);
        let b = Value::record(vec![("a", Value::leaf(2i64)), ("b", Value::leaf(1i64))]);
        let c = Value::record(vec![("a", Value::leaf(2i64)), ("b", Value::leaf(3i64))]);

        let p = diff(&a, &b);
        let q = diff(&b, &c);
        let composed = compose([p.clone(), q.clone()]);

        let sequential = apply(&apply(&a, &p).unwrap(), &q).unwrap();
        let direct = apply(&a, &composed).unwrap();
        assert_eq!(sequential, c);
        assert_eq!(direct, c);
    }
}
