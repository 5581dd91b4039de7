//! Change detector: turns editor snapshots into operations.
//!
//! Editors hand us `(old, new, caret_after)` pairs rather than structured
//! edits. Assuming a single-caret, single-contiguous edit, the length change
//! plus the caret position pin down exactly one insert or delete:
//!
//! ```text
//! grew by n     → Insert at caret − n, text = new[caret − n .. caret]
//! shrank by n   → Delete at caret, length n
//! same length   → no operation (replacement edits are not produced)
//! ```
//!
//! Multi-region edits (find-and-replace-all, multi-cursor) are outside this
//! contract and must be delivered one region at a time.

use crate::ot::Operation;

/// Character slice of `text` between gap positions `from` and `to`.
fn char_slice(text: &str, from: usize, to: usize) -> String {
    text.chars().skip(from).take(to.saturating_sub(from)).collect()
}

/// Derive the operation that turned `old` into `new`, given the caret
/// position after the edit.
///
/// Returns `None` when the texts are equal, or when they differ without a
/// length change (an in-place replacement, which this detector does not
/// represent).
pub fn detect_edit(
    old: &str,
    new: &str,
    caret_after: usize,
    user_id: &str,
) -> Option<Operation> {
    if old == new {
        return None;
    }

    let old_len = old.chars().count();
    let new_len = new.chars().count();

    if new_len > old_len {
        let inserted = new_len - old_len;
        let caret = caret_after.min(new_len);
        let position = caret.saturating_sub(inserted);
        let text = char_slice(new, position, caret);
        Some(Operation::insert(user_id, position, text))
    } else if new_len < old_len {
        let deleted = old_len - new_len;
        Some(Operation::delete(user_id, caret_after.min(new_len), deleted))
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ot::apply;

    #[test]
    fn test_no_change_yields_none() {
        assert!(detect_edit("abc", "abc", 3, "u").is_none());
        assert!(detect_edit("", "", 0, "u").is_none());
    }

    #[test]
    fn test_single_char_typed() {
        let op = detect_edit("helo", "hello", 4, "u").unwrap();
        match &op {
            Operation::Insert { position, text, .. } => {
                assert_eq!(*position, 3);
                assert_eq!(text, "l");
            }
            _ => panic!("insert expected"),
        }
        assert_eq!(apply("helo", &op).unwrap(), "hello");
    }

    #[test]
    fn test_paste_at_end() {
        let op = detect_edit("ab", "abXYZ", 5, "u").unwrap();
        match &op {
            Operation::Insert { position, text, .. } => {
                assert_eq!(*position, 2);
                assert_eq!(text, "XYZ");
            }
            _ => panic!("insert expected"),
        }
    }

    #[test]
    fn test_insert_at_start() {
        let op = detect_edit("world", "hello world", 6, "u").unwrap();
        assert_eq!(apply("world", &op).unwrap(), "hello world");
        assert_eq!(op.position(), 0);
    }

    #[test]
    fn test_backspace() {
        // Caret sits where the deleted character was.
        let op = detect_edit("hello", "helo", 3, "u").unwrap();
        match &op {
            Operation::Delete { position, length, .. } => {
                assert_eq!(*position, 3);
                assert_eq!(*length, 1);
            }
            _ => panic!("delete expected"),
        }
        assert_eq!(apply("hello", &op).unwrap(), "helo");
    }

    #[test]
    fn test_range_delete() {
        let op = detect_edit("abcdef", "af", 1, "u").unwrap();
        assert_eq!((op.position(), op.len_delta()), (1, -4));
        assert_eq!(apply("abcdef", &op).unwrap(), "af");
    }

    #[test]
    fn test_replacement_is_dropped() {
        // Same length, different content: out of contract, no operation.
        assert!(detect_edit("abc", "abd", 3, "u").is_none());
    }

    #[test]
    fn test_multibyte_edit() {
        let op = detect_edit("héllo", "héllos", 6, "u").unwrap();
        match &op {
            Operation::Insert { position, text, .. } => {
                assert_eq!(*position, 5);
                assert_eq!(text, "s");
            }
            _ => panic!("insert expected"),
        }
    }

    #[test]
    fn test_detected_ops_carry_identity() {
        let op = detect_edit("", "x", 1, "conn-42").unwrap();
        assert_eq!(op.user_id(), "conn-42");
        assert!(!op.id().is_empty());
    }
}
