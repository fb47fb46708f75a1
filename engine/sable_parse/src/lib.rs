//! Canonical text form: `(keyword child ...)` trees.
//!
//! The text form is homoiconic with the node graph: every [`NodeKind`] has a
//! keyword, immediates have literal forms, labels are `#name` prefixes,
//! comments are `;` lines attached to the following node, and `||` before a
//! parenthesised node sets its concurrency hint.
//!
//! `unparse` is the inverse of `parse` up to whitespace; with
//! `sort_keys = true` assoc entries are emitted in natural key order, which
//! makes the output canonical.

mod lexer;
mod parser;
mod unparser;

pub use parser::{parse, parse_with_options, ParseError, ParseOptions};
pub use unparser::unparse;

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use sable_ir::{default_pool, NodeKind, NodeManager};

    fn manager() -> NodeManager {
        NodeManager::new(default_pool())
    }

    #[test]
    fn parse_immediates() {
        let mut m = manager();
        let root = parse("42.5", &mut m).expect("number");
        assert_eq!(m.get(root.id).number_value(), Some(42.5));

        let root = parse("true", &mut m).expect("bool");
        assert_eq!(m.get(root.id).bool_value(), Some(true));

        let root = parse("null", &mut m).expect("null");
        assert_eq!(m.get(root.id).kind(), NodeKind::Null);

        let root = parse(r#""hi\nthere""#, &mut m).expect("string");
        let sid = m.get(root.id).string_id().expect("payload");
        assert_eq!(m.pool().get(sid), "hi\nthere");

        let root = parse("counter", &mut m).expect("symbol");
        assert_eq!(m.get(root.id).kind(), NodeKind::Symbol);
    }

    #[test]
    fn parse_opcode_tree() {
        let mut m = manager();
        let root = parse("(+ 1 (* 2 3))", &mut m).expect("tree");
        let node = m.get(root.id);
        assert_eq!(node.kind(), NodeKind::Add);
        assert_eq!(node.children().len(), 2);
        let inner = m.get(node.children()[1]);
        assert_eq!(inner.kind(), NodeKind::Multiply);
    }

    #[test]
    fn parse_assoc_and_labels() {
        let mut m = manager();
        let root = parse(r#"(assoc x 1 y "two")"#, &mut m).expect("assoc");
        let node = m.get(root.id);
        assert_eq!(node.kind(), NodeKind::Assoc);
        let map = node.assoc().expect("assoc payload");
        assert_eq!(map.len(), 2);

        let root = parse("#anchor #other 7", &mut m).expect("labelled");
        let labels: Vec<String> = m
            .get(root.id)
            .labels()
            .iter()
            .map(|&l| m.pool().get(l))
            .collect();
        assert_eq!(labels, vec!["anchor", "other"]);
        assert!(!m.get(root.id).is_idempotent());
    }

    #[test]
    fn parse_concurrent_marker_and_comment() {
        let mut m = manager();
        let root = parse("; fan out\n||(parallel 1 2)", &mut m).expect("concurrent");
        let node = m.get(root.id);
        assert_eq!(node.kind(), NodeKind::Parallel);
        assert!(node.is_concurrent());
        assert_eq!(m.pool().get(node.comment()), " fan out");
    }

    #[test]
    fn round_trip_is_identity_on_idempotent_trees() {
        let mut m = manager();
        let sources = [
            "(list 1 2.5 \"three\" null true)",
            "(+ 1 (* 2 3))",
            "(assoc a 1 b (list infinity -infinity nan))",
            "(query_between \"x\" 3 7 true)",
        ];
        for source in sources {
            let root = parse(source, &mut m).expect("parse");
            let text = unparse(&m, root.id, false, false);
            let reparsed = parse(&text, &mut m).expect("reparse");
            assert!(
                m.deep_equal(root.id, reparsed.id),
                "round trip changed {source:?}: {text:?}"
            );
            // And the text itself is a fixed point.
            assert_eq!(unparse(&m, reparsed.id, false, false), text);
        }
    }

    #[test]
    fn sort_keys_makes_assoc_output_canonical() {
        let mut m = manager();
        let root = parse("(assoc b 2 a10 3 a2 1)", &mut m).expect("assoc");
        let text = unparse(&m, root.id, false, true);
        // Natural order: a2 before a10, then b.
        assert_eq!(text, "(assoc a2 1 a10 3 b 2)");
    }

    #[test]
    fn pretty_output_reparses_equal() {
        let mut m = manager();
        let root = parse("(if (> x 3) (list 1 2) null)", &mut m).expect("parse");
        let pretty = unparse(&m, root.id, true, true);
        let reparsed = parse(&pretty, &mut m).expect("reparse pretty");
        assert!(m.deep_equal(root.id, reparsed.id));
    }

    #[test]
    fn debug_sources_annotates_nodes() {
        let mut m = manager();
        let options = ParseOptions {
            debug_sources: true,
            ..ParseOptions::default()
        };
        let root = parse_with_options("(list\n  42)", &mut m, &options).expect("parse");
        let child = m.get(root.id).children()[0];
        let comment = m.pool().get(m.get(child).comment());
        assert_eq!(comment, "line 2, column 3");
    }

    #[test]
    fn errors_carry_location() {
        let mut m = manager();
        let err = parse("(list 1", &mut m).unwrap_err();
        assert!(matches!(err, ParseError::UnexpectedEnd { .. }));

        let err = parse("(no_such_thing 1)", &mut m).unwrap_err();
        assert!(matches!(err, ParseError::UnknownKeyword { .. }));
    }
}
