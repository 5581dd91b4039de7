//! Operational-transformation kernel: the two-operation edit algebra.
//!
//! Everything in here is pure — no I/O, no shared state. The relay and the
//! client both drive convergence through these four functions:
//!
//! ```text
//! apply(text, op)            → text'        (materialise one edit)
//! transform(a, b)            → a'           (rewrite a to run after b)
//! transform_against(a, [q])  → a'           (fold transform over a queue)
//! compose(a, b)              → Option<c>    (merge adjacent same-user edits)
//! ```
//!
//! Transform satisfies TP1: for concurrent `a, b` on base `s`,
//! `apply(apply(s, a), transform(b, a)) == apply(apply(s, b), transform(a, b))`.
//! Equal-position insert ties break on the lexicographic order of `user_id`,
//! which is identical on every participant.
//!
//! Positions count Unicode scalar values and are gap positions:
//! `position = k` means "between character k−1 and k", so `0` is the start
//! and `len` is the end of the document.
//!
//! Reference: Ellis & Gibbs — Concurrency Control in Groupware Systems (1989)

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use thiserror::Error;
use uuid::Uuid;

/// A minimal edit against a plain-text document.
///
/// The two variants share an identity envelope (`id`, `user_id`,
/// `timestamp`). The algebra only reads `user_id` (tie-break key) and the
/// positional fields; `id` and `timestamp` ride along for logging and wire
/// traceability.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Operation {
    /// Insert `text` at gap position `position`.
    Insert {
        id: String,
        user_id: String,
        timestamp: u64,
        position: usize,
        text: String,
    },
    /// Delete `length` characters starting at gap position `position`.
    ///
    /// `length == 0` is a valid degenerate form: transform may shrink an
    /// overlapped delete to nothing, and callers treat it as identity.
    Delete {
        id: String,
        user_id: String,
        timestamp: u64,
        position: usize,
        length: usize,
    },
}

/// Milliseconds since the Unix epoch.
pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

impl Operation {
    /// Build a fresh insert with a new id and the current wall-clock time.
    pub fn insert(user_id: impl Into<String>, position: usize, text: impl Into<String>) -> Self {
        Self::Insert {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp: now_millis(),
            position,
            text: text.into(),
        }
    }

    /// Build a fresh delete with a new id and the current wall-clock time.
    pub fn delete(user_id: impl Into<String>, position: usize, length: usize) -> Self {
        Self::Delete {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.into(),
            timestamp: now_millis(),
            position,
            length,
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Insert { id, .. } | Self::Delete { id, .. } => id,
        }
    }

    pub fn user_id(&self) -> &str {
        match self {
            Self::Insert { user_id, .. } | Self::Delete { user_id, .. } => user_id,
        }
    }

    pub fn position(&self) -> usize {
        match self {
            Self::Insert { position, .. } | Self::Delete { position, .. } => *position,
        }
    }

    /// Signed length change this operation causes when applied.
    pub fn len_delta(&self) -> i64 {
        match self {
            Self::Insert { text, .. } => text.chars().count() as i64,
            Self::Delete { length, .. } => -(*length as i64),
        }
    }

    /// True for edits that leave the document unchanged (zero-length delete,
    /// empty insert).
    pub fn is_noop(&self) -> bool {
        match self {
            Self::Insert { text, .. } => text.is_empty(),
            Self::Delete { length, .. } => *length == 0,
        }
    }
}

/// Algebra errors.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum OtError {
    /// Operation indices fall outside the document it was applied to.
    #[error("position {position} with span {span} out of range for document of length {len}")]
    OutOfRange {
        position: usize,
        span: usize,
        len: usize,
    },
}

/// Byte offset of gap position `gap` in `text`.
///
/// `gap` must be ≤ the character count; `gap == count` maps to `text.len()`.
fn byte_of_gap(text: &str, gap: usize) -> usize {
    text.char_indices()
        .nth(gap)
        .map(|(i, _)| i)
        .unwrap_or(text.len())
}

/// Apply one operation to a document, producing the new content.
///
/// Fails with [`OtError::OutOfRange`] when the operation's span does not fit
/// the document. A zero-length delete at a valid position is identity.
pub fn apply(text: &str, op: &Operation) -> Result<String, OtError> {
    let len = text.chars().count();
    match op {
        Operation::Insert { position, text: ins, .. } => {
            if *position > len {
                return Err(OtError::OutOfRange {
                    position: *position,
                    span: 0,
                    len,
                });
            }
            let at = byte_of_gap(text, *position);
            let mut out = String::with_capacity(text.len() + ins.len());
            out.push_str(&text[..at]);
            out.push_str(ins);
            out.push_str(&text[at..]);
            Ok(out)
        }
        Operation::Delete { position, length, .. } => {
            if position + length > len {
                return Err(OtError::OutOfRange {
                    position: *position,
                    span: *length,
                    len,
                });
            }
            let start = byte_of_gap(text, *position);
            let end = byte_of_gap(text, position + length);
            let mut out = String::with_capacity(text.len() - (end - start));
            out.push_str(&text[..start]);
            out.push_str(&text[end..]);
            Ok(out)
        }
    }
}

/// Character count of an insert's payload.
fn ins_len(text: &str) -> usize {
    text.chars().count()
}

/// Rewrite `a` so that applying it *after* concurrent `b` has the effect `a`
/// was created to have.
///
/// All four variant pairs are handled exhaustively; the insert/insert tie at
/// equal positions breaks on `user_id` order so every participant agrees.
pub fn transform(a: &Operation, b: &Operation) -> Operation {
    let mut out = a.clone();
    match (&mut out, b) {
        (
            Operation::Insert { position: a_pos, user_id: a_user, .. },
            Operation::Insert { position: b_pos, text: b_text, user_id: b_user, .. },
        ) => {
            if *b_pos < *a_pos || (*b_pos == *a_pos && b_user.as_str() < a_user.as_str()) {
                *a_pos += ins_len(b_text);
            }
        }
        (
            Operation::Insert { position: a_pos, .. },
            Operation::Delete { position: b_pos, length: b_len, .. },
        ) => {
            if b_pos + b_len <= *a_pos {
                *a_pos -= b_len;
            } else if *b_pos < *a_pos {
                // The insert pointed into the deleted range; it lands at the
                // deletion point.
                *a_pos = *b_pos;
            }
        }
        (
            Operation::Delete { position: a_pos, length: a_len, .. },
            Operation::Insert { position: b_pos, text: b_text, .. },
        ) => {
            if *b_pos <= *a_pos {
                *a_pos += ins_len(b_text);
            } else if *b_pos < *a_pos + *a_len {
                // Concurrent insert fell inside the claimed range; the delete
                // sweeps it up.
                *a_len += ins_len(b_text);
            }
        }
        (
            Operation::Delete { position: a_pos, length: a_len, .. },
            Operation::Delete { position: b_pos, length: b_len, .. },
        ) => {
            let a_end = *a_pos + *a_len;
            let b_end = b_pos + b_len;
            if b_end <= *a_pos {
                *a_pos -= b_len;
            } else if *b_pos >= a_end {
                // Disjoint, b after a: unchanged.
            } else {
                let overlap = b_end.min(a_end) - (*b_pos).max(*a_pos);
                *a_len = a_len.saturating_sub(overlap);
                if *b_pos <= *a_pos {
                    *a_pos = *b_pos;
                }
            }
        }
    }
    out
}

/// Fold [`transform`] over a queue of committed concurrent operations, oldest
/// first.
pub fn transform_against(op: &Operation, queue: &[Operation]) -> Operation {
    queue.iter().fold(op.clone(), |acc, q| transform(&acc, q))
}

/// Merge two adjacent edits by the same user into one, when possible.
///
/// Only two shapes compose: an insert continued exactly at its own end, and a
/// delete repeated at the same gap (the second delete's position refers to
/// the post-first-delete document). The composed operation keeps the first
/// operand's identity. This is an optimisation hint; correctness never
/// depends on it being invoked.
pub fn compose(a: &Operation, b: &Operation) -> Option<Operation> {
    match (a, b) {
        (
            Operation::Insert { id, user_id, timestamp, position, text },
            Operation::Insert { user_id: b_user, position: b_pos, text: b_text, .. },
        ) if user_id == b_user && *b_pos == position + ins_len(text) => Some(Operation::Insert {
            id: id.clone(),
            user_id: user_id.clone(),
            timestamp: *timestamp,
            position: *position,
            text: format!("{text}{b_text}"),
        }),
        (
            Operation::Delete { id, user_id, timestamp, position, length },
            Operation::Delete { user_id: b_user, position: b_pos, length: b_len, .. },
        ) if user_id == b_user && b_pos == position => Some(Operation::Delete {
            id: id.clone(),
            user_id: user_id.clone(),
            timestamp: *timestamp,
            position: *position,
            length: length + b_len,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ins(user: &str, pos: usize, text: &str) -> Operation {
        Operation::insert(user, pos, text)
    }

    fn del(user: &str, pos: usize, len: usize) -> Operation {
        Operation::delete(user, pos, len)
    }

    /// Apply both orders after mutual transform; both must converge.
    fn converge(base: &str, a: &Operation, b: &Operation) -> (String, String) {
        let left = apply(&apply(base, a).unwrap(), &transform(b, a)).unwrap();
        let right = apply(&apply(base, b).unwrap(), &transform(a, b)).unwrap();
        (left, right)
    }

    #[test]
    fn test_apply_insert_middle() {
        let op = ins("u", 2, "XY");
        assert_eq!(apply("abcd", &op).unwrap(), "abXYcd");
    }

    #[test]
    fn test_apply_insert_bounds() {
        assert_eq!(apply("", &ins("u", 0, "hi")).unwrap(), "hi");
        assert_eq!(apply("ab", &ins("u", 2, "!")).unwrap(), "ab!");
        assert_eq!(
            apply("ab", &ins("u", 3, "!")),
            Err(OtError::OutOfRange { position: 3, span: 0, len: 2 })
        );
    }

    #[test]
    fn test_apply_delete() {
        assert_eq!(apply("abcdef", &del("u", 1, 4)).unwrap(), "af");
        assert_eq!(apply("abc", &del("u", 0, 3)).unwrap(), "");
        assert_eq!(
            apply("abc", &del("u", 2, 2)),
            Err(OtError::OutOfRange { position: 2, span: 2, len: 3 })
        );
    }

    #[test]
    fn test_apply_zero_length_delete_is_identity() {
        let op = del("u", 1, 0);
        assert_eq!(apply("abc", &op).unwrap(), "abc");
        assert!(op.is_noop());
    }

    #[test]
    fn test_apply_multibyte_positions_count_chars() {
        // "héllo" — positions are character gaps, not byte offsets.
        assert_eq!(apply("héllo", &ins("u", 2, "X")).unwrap(), "héXllo");
        assert_eq!(apply("héllo", &del("u", 1, 1)).unwrap(), "hllo");
    }

    #[test]
    fn test_len_delta_matches_apply() {
        let base = "hello world";
        for op in [ins("u", 4, "abc"), del("u", 2, 5), del("u", 0, 0)] {
            let out = apply(base, &op).unwrap();
            let expected = base.chars().count() as i64 + op.len_delta();
            assert_eq!(out.chars().count() as i64, expected);
        }
    }

    #[test]
    fn test_transform_insert_insert_before() {
        let a = ins("A", 4, "X");
        let b = ins("B", 1, "yy");
        let t = transform(&a, &b);
        assert_eq!(t.position(), 6);
    }

    #[test]
    fn test_transform_insert_insert_after() {
        let a = ins("A", 1, "X");
        let b = ins("B", 4, "yy");
        assert_eq!(transform(&a, &b).position(), 1);
    }

    #[test]
    fn test_transform_insert_insert_tie_breaks_on_user_id() {
        let a = ins("A", 1, "X");
        let b = ins("B", 1, "Y");
        // "A" < "B": A stays, B shifts.
        assert_eq!(transform(&a, &b).position(), 1);
        assert_eq!(transform(&b, &a).position(), 2);
    }

    #[test]
    fn test_concurrent_inserts_same_position_converge() {
        // Spec scenario: base "ab", A inserts "X"@1, B inserts "Y"@1.
        let a = ins("A", 1, "X");
        let b = ins("B", 1, "Y");
        let (left, right) = converge("ab", &a, &b);
        assert_eq!(left, "aXYb");
        assert_eq!(right, "aXYb");
    }

    #[test]
    fn test_transform_insert_against_delete_before() {
        // Delete [0,2) ends exactly at the insert point: shift left.
        let a = ins("A", 2, "X");
        let b = del("B", 0, 2);
        assert_eq!(transform(&a, &b).position(), 0);
    }

    #[test]
    fn test_transform_insert_inside_delete_snaps() {
        let a = ins("A", 3, "X");
        let b = del("B", 1, 4);
        assert_eq!(transform(&a, &b).position(), 1);
    }

    #[test]
    fn test_insert_inside_delete_converges() {
        // Base "abcdef"; A deletes (1,4) → "af"; B inserts "X"@3.
        let a = del("A", 1, 4);
        let b = ins("B", 3, "X");
        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, "aXf");
        assert_eq!(right, "aXf");
    }

    #[test]
    fn test_transform_insert_at_delete_start_unchanged() {
        let a = ins("A", 2, "X");
        let b = del("B", 2, 3);
        assert_eq!(transform(&a, &b).position(), 2);
    }

    #[test]
    fn test_transform_delete_against_insert_before() {
        let a = del("A", 3, 2);
        let b = ins("B", 1, "yy");
        assert_eq!(transform(&a, &b).position(), 5);
    }

    #[test]
    fn test_transform_delete_swallows_inner_insert() {
        let a = del("A", 1, 3);
        let b = ins("B", 2, "yy");
        let t = transform(&a, &b);
        assert_eq!(t.position(), 1);
        assert_eq!(t.len_delta(), -5);
    }

    #[test]
    fn test_transform_delete_against_insert_after_unchanged() {
        let a = del("A", 1, 3);
        let b = ins("B", 4, "yy");
        let t = transform(&a, &b);
        assert_eq!(t.position(), 1);
        assert_eq!(t.len_delta(), -3);
    }

    #[test]
    fn test_transform_delete_delete_disjoint() {
        let a = del("A", 5, 2);
        let b = del("B", 1, 2);
        assert_eq!(transform(&a, &b).position(), 3);

        let a2 = del("A", 1, 2);
        let b2 = del("B", 5, 2);
        assert_eq!(transform(&a2, &b2), a2);
    }

    #[test]
    fn test_transform_delete_delete_overlap() {
        // Base "abcdefgh"; A deletes (2,3), B deletes (3,3).
        let a = del("A", 2, 3);
        let b = del("B", 3, 3);
        let ta = transform(&a, &b);
        let tb = transform(&b, &a);
        assert_eq!((ta.position(), ta.len_delta()), (2, -1));
        assert_eq!((tb.position(), tb.len_delta()), (2, -1));

        let (left, right) = converge("abcdefgh", &a, &b);
        assert_eq!(left, "abgh");
        assert_eq!(right, "abgh");
    }

    #[test]
    fn test_transform_delete_fully_swallowed_becomes_noop() {
        let a = del("A", 2, 2);
        let b = del("B", 1, 4);
        let t = transform(&a, &b);
        assert!(t.is_noop());
        assert_eq!(t.position(), 1);
        let (left, right) = converge("abcdef", &a, &b);
        assert_eq!(left, right);
    }

    #[test]
    fn test_transform_identical_deletes() {
        let a = del("A", 1, 3);
        let b = del("B", 1, 3);
        let (left, right) = converge("abcde", &a, &b);
        assert_eq!(left, "ae");
        assert_eq!(right, "ae");
    }

    #[test]
    fn test_transform_against_folds_in_order() {
        let op = ins("A", 5, "X");
        let queue = vec![ins("B", 0, "12"), del("C", 1, 2), ins("D", 9, "z")];
        let folded = queue.iter().fold(op.clone(), |acc, q| transform(&acc, q));
        assert_eq!(transform_against(&op, &queue), folded);
    }

    #[test]
    fn test_transform_against_empty_queue() {
        let op = ins("A", 5, "X");
        assert_eq!(transform_against(&op, &[]), op);
    }

    #[test]
    fn test_compose_adjacent_inserts() {
        let a = Operation::Insert {
            id: "op-1".into(),
            user_id: "u".into(),
            timestamp: 10,
            position: 0,
            text: "he".into(),
        };
        let b = ins("u", 2, "llo");
        let c = compose(&a, &b).unwrap();
        assert_eq!(c.id(), "op-1");
        match &c {
            Operation::Insert { position, text, .. } => {
                assert_eq!(*position, 0);
                assert_eq!(text, "hello");
            }
            _ => panic!("composed insert expected"),
        }
        // Applying the pair or the composition gives the same result.
        let stepped = apply(&apply("", &a).unwrap(), &b).unwrap();
        assert_eq!(apply("", &c).unwrap(), stepped);
        assert_eq!(stepped, "hello");
    }

    #[test]
    fn test_compose_same_gap_deletes() {
        let a = del("u", 2, 2);
        let b = del("u", 2, 3);
        let c = compose(&a, &b).unwrap();
        assert_eq!((c.position(), c.len_delta()), (2, -5));
        let base = "abcdefgh";
        let stepped = apply(&apply(base, &a).unwrap(), &b).unwrap();
        assert_eq!(apply(base, &c).unwrap(), stepped);
    }

    #[test]
    fn test_compose_rejects_gaps_and_users() {
        // Different users never compose.
        assert!(compose(&ins("u", 0, "ab"), &ins("v", 2, "c")).is_none());
        // Non-adjacent inserts don't compose.
        assert!(compose(&ins("u", 0, "ab"), &ins("u", 3, "c")).is_none());
        // Deletes at different gaps don't compose.
        assert!(compose(&del("u", 2, 1), &del("u", 3, 1)).is_none());
        // Mixed kinds never compose.
        assert!(compose(&ins("u", 0, "a"), &del("u", 0, 1)).is_none());
    }

    #[test]
    fn test_operation_wire_shape() {
        let op = Operation::Insert {
            id: "op-9".into(),
            user_id: "conn-1".into(),
            timestamp: 42,
            position: 3,
            text: "hi".into(),
        };
        let v = serde_json::to_value(&op).unwrap();
        assert_eq!(v["type"], "insert");
        assert_eq!(v["position"], 3);
        assert_eq!(v["text"], "hi");

        let del_json = serde_json::json!({
            "type": "delete",
            "id": "op-10",
            "user_id": "conn-2",
            "timestamp": 43,
            "position": 1,
            "length": 4,
        });
        let parsed: Operation = serde_json::from_value(del_json).unwrap();
        assert_eq!((parsed.position(), parsed.len_delta()), (1, -4));
    }
}
