//! Index-based list diffs.
//!
//! Lists are diffed element-wise without recursing into elements: a changed
//! element is replaced whole. Edits apply sequentially, so each index refers
//! to the list as left by the previous edit.

use crate::error::ApplyError;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Above this many cells the LCS table is skipped and the differing middle
/// is replaced wholesale.
const MAX_LCS_CELLS: usize = 1 << 20;

/// One sequential list edit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "o")]
pub enum ListEdit {
    #[serde(rename = "+")]
    Insert {
        #[serde(rename = "i")]
        index: usize,
        #[serde(rename = "v")]
        value: Value,
    },
    #[serde(rename = "-")]
    Delete {
        #[serde(rename = "i")]
        index: usize,
    },
    #[serde(rename = "r")]
    Replace {
        #[serde(rename = "i")]
        index: usize,
        #[serde(rename = "v")]
        value: Value,
    },
}

impl ListEdit {
    fn index(&self) -> usize {
        match self {
            ListEdit::Insert { index, .. }
            | ListEdit::Delete { index }
            | ListEdit::Replace { index, .. } => *index,
        }
    }

    fn with_index(&self, index: usize) -> ListEdit {
        match self {
            ListEdit::Insert { value, .. } => ListEdit::Insert {
                index,
                value: value.clone(),
            },
            ListEdit::Delete { .. } => ListEdit::Delete { index },
            ListEdit::Replace { value, .. } => ListEdit::Replace {
                index,
                value: value.clone(),
            },
        }
    }
}

/// A sequence of list edits.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListDiff {
    edits: Vec<ListEdit>,
}

impl ListDiff {
    pub fn new(edits: Vec<ListEdit>) -> Self {
        Self { edits }
    }

    pub fn edits(&self) -> &[ListEdit] {
        &self.edits
    }

    pub fn is_empty(&self) -> bool {
        self.edits.is_empty()
    }

    /// Apply the edits in order.
    pub fn apply(&self, list: &[Value]) -> Result<Vec<Value>, ApplyError> {
        let mut out = list.to_vec();
        for edit in &self.edits {
            match edit {
                ListEdit::Insert { index, value } => {
                    if *index > out.len() {
                        return Err(out_of_range(*index, out.len()));
                    }
                    out.insert(*index, value.clone());
                }
                ListEdit::Delete { index } => {
                    if *index >= out.len() {
                        return Err(out_of_range(*index, out.len()));
                    }
                    out.remove(*index);
                }
                ListEdit::Replace { index, value } => {
                    if *index >= out.len() {
                        return Err(out_of_range(*index, out.len()));
                    }
                    out[*index] = value.clone();
                }
            }
        }
        Ok(out)
    }
}

fn out_of_range(index: usize, len: usize) -> ApplyError {
    ApplyError::mismatch(format!("list index {index} out of range for length {len}"))
}

/// Compute the edits taking `from` to `to`.
pub fn diff(from: &[Value], to: &[Value]) -> ListDiff {
    let prefix = from.iter().zip(to).take_while(|(a, b)| a == b).count();
    let suffix = from[prefix..]
        .iter()
        .rev()
        .zip(to[prefix..].iter().rev())
        .take_while(|(a, b)| a == b)
        .count();
    let a = &from[prefix..from.len() - suffix];
    let b = &to[prefix..to.len() - suffix];

    let mut edits: Vec<ListEdit> = Vec::new();
    let mut pos = prefix;
    let push_insert = |edits: &mut Vec<ListEdit>, pos: &mut usize, value: &Value| {
        // a delete followed by an insert at the same slot is a replacement
        if let Some(ListEdit::Delete { index }) = edits.last() {
            if *index == *pos {
                let index = *index;
                edits.pop();
                edits.push(ListEdit::Replace {
                    index,
                    value: value.clone(),
                });
                *pos += 1;
                return;
            }
        }
        edits.push(ListEdit::Insert {
            index: *pos,
            value: value.clone(),
        });
        *pos += 1;
    };

    if a.len().saturating_mul(b.len()) > MAX_LCS_CELLS {
        for _ in a {
            edits.push(ListEdit::Delete { index: pos });
        }
        for value in b {
            push_insert(&mut edits, &mut pos, value);
        }
        return ListDiff { edits };
    }

    // lcs[i][j] = LCS length of a[i..] and b[j..]
    let mut lcs = vec![vec![0usize; b.len() + 1]; a.len() + 1];
    for i in (0..a.len()).rev() {
        for j in (0..b.len()).rev() {
            lcs[i][j] = if a[i] == b[j] {
                lcs[i + 1][j + 1] + 1
            } else {
                lcs[i + 1][j].max(lcs[i][j + 1])
            };
        }
    }

    let (mut i, mut j) = (0, 0);
    while i < a.len() || j < b.len() {
        if i < a.len() && j < b.len() && a[i] == b[j] {
            pos += 1;
            i += 1;
            j += 1;
        } else if i < a.len() && (j == b.len() || lcs[i + 1][j] >= lcs[i][j + 1]) {
            edits.push(ListEdit::Delete { index: pos });
            i += 1;
        } else {
            push_insert(&mut edits, &mut pos, &b[j]);
            j += 1;
        }
    }

    ListDiff { edits }
}

/// Rebase two concurrent list diffs over the same base.
///
/// Returns `(a', b')` with `a'` applying after `b` and `b'` after `a`.
/// `a_wins` says whether `a` lands later in server order: its inserts take
/// the contested slot and its replacements override.
pub fn transform(a: &ListDiff, b: &ListDiff, a_wins: bool) -> (ListDiff, ListDiff) {
    let mut b_cur = b.edits.clone();
    let mut a_out = Vec::with_capacity(a.edits.len());

    for x in &a.edits {
        let mut x_cur = Some(x.clone());
        let mut b_next = Vec::with_capacity(b_cur.len());
        for y in b_cur {
            match x_cur.take() {
                Some(xc) => {
                    let (x2, y2) = transform_edit(&xc, &y, a_wins);
                    x_cur = x2;
                    b_next.extend(y2);
                }
                None => b_next.push(y),
            }
        }
        b_cur = b_next;
        a_out.extend(x_cur);
    }

    (ListDiff { edits: a_out }, ListDiff { edits: b_cur })
}

/// Transform a single pair of edits: `(x after y, y after x)`.
fn transform_edit(
    x: &ListEdit,
    y: &ListEdit,
    x_wins: bool,
) -> (Option<ListEdit>, Option<ListEdit>) {
    use ListEdit::{Delete, Insert, Replace};

    let (ix, iy) = (x.index(), y.index());
    let shift = |e: &ListEdit, by: isize| Some(e.with_index((e.index() as isize + by) as usize));
    let keep = |e: &ListEdit| Some(e.clone());

    match (x, y) {
        (Insert { .. }, Insert { .. }) => {
            if ix < iy || (ix == iy && x_wins) {
                (keep(x), shift(y, 1))
            } else {
                (shift(x, 1), keep(y))
            }
        }
        (Insert { .. }, Delete { .. }) | (Insert { .. }, Replace { .. }) => {
            if ix <= iy {
                (keep(x), shift(y, 1))
            } else if matches!(y, Delete { .. }) {
                (shift(x, -1), keep(y))
            } else {
                (keep(x), keep(y))
            }
        }
        (Delete { .. }, Insert { .. }) | (Replace { .. }, Insert { .. }) => {
            if iy <= ix {
                (shift(x, 1), keep(y))
            } else if matches!(x, Delete { .. }) {
                (keep(x), shift(y, -1))
            } else {
                (keep(x), keep(y))
            }
        }
        (Delete { .. }, Delete { .. }) => {
            if ix < iy {
                (keep(x), shift(y, -1))
            } else if ix > iy {
                (shift(x, -1), keep(y))
            } else {
                (None, None)
            }
        }
        (Delete { .. }, Replace { value, .. }) => {
            if ix < iy {
                (keep(x), shift(y, -1))
            } else if ix > iy {
                (keep(x), keep(y))
            } else if x_wins {
                (keep(x), None)
            } else {
                (
                    None,
                    Some(Insert {
                        index: iy,
                        value: value.clone(),
                    }),
                )
            }
        }
        (Replace { value, .. }, Delete { .. }) => {
            if ix < iy {
                (keep(x), keep(y))
            } else if ix > iy {
                (shift(x, -1), keep(y))
            } else if x_wins {
                (
                    Some(Insert {
                        index: ix,
                        value: value.clone(),
                    }),
                    None,
                )
            } else {
                (None, keep(y))
            }
        }
        (Replace { .. }, Replace { .. }) => {
            if ix != iy {
                (keep(x), keep(y))
            } else if x_wins {
                (keep(x), None)
            } else {
                (None, keep(y))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn list(items: &[i64]) -> Vec<Value> {
        items.iter().map(|i| Value::from(*i)).collect()
    }

    fn converge(base: &[i64], a_to: &[i64], b_to: &[i64], a_wins: bool) -> Vec<Value> {
        let base = list(base);
        let a = diff(&base, &list(a_to));
        let b = diff(&base, &list(b_to));
        let (a_prime, b_prime) = transform(&a, &b, a_wins);

        let via_a = b_prime.apply(&a.apply(&base).unwrap()).unwrap();
        let via_b = a_prime.apply(&b.apply(&base).unwrap()).unwrap();
        assert_eq!(via_a, via_b);
        via_a
    }

    #[test]
    fn diff_roundtrip() {
        let cases: &[(&[i64], &[i64])] = &[
            (&[], &[1, 2]),
            (&[1, 2, 3], &[]),
            (&[1, 2, 3], &[1, 9, 3]),
            (&[1, 2, 3, 4], &[4, 3, 2, 1]),
            (&[1, 2, 3], &[0, 1, 2, 3, 4]),
        ];
        for (from, to) in cases {
            let d = diff(&list(from), &list(to));
            assert_eq!(d.apply(&list(from)).unwrap(), list(to), "{from:?} -> {to:?}");
        }
    }

    #[test]
    fn changed_element_becomes_replace() {
        let d = diff(&list(&[1, 2, 3]), &list(&[1, 9, 3]));
        assert_eq!(
            d.edits(),
            &[ListEdit::Replace {
                index: 1,
                value: Value::from(9)
            }]
        );
    }

    #[test]
    fn apply_out_of_range_is_context_mismatch() {
        let d = ListDiff::new(vec![ListEdit::Delete { index: 5 }]);
        assert!(matches!(
            d.apply(&list(&[1])),
            Err(ApplyError::PatchContextMismatch(_))
        ));
    }

    #[test]
    fn concurrent_inserts_keep_both() {
        assert_eq!(converge(&[1, 2], &[0, 1, 2], &[1, 2, 3], true), list(&[0, 1, 2, 3]));
        assert_eq!(converge(&[1, 2], &[1, 5, 2], &[1, 6, 2], true), list(&[1, 5, 6, 2]));
        assert_eq!(converge(&[1, 2], &[1, 5, 2], &[1, 6, 2], false), list(&[1, 6, 5, 2]));
    }

    #[test]
    fn concurrent_delete_and_insert() {
        assert_eq!(converge(&[1, 2, 3], &[1, 3], &[1, 2, 3, 4], false), list(&[1, 3, 4]));
        assert_eq!(converge(&[1, 2, 3], &[2, 3], &[2, 3], true), list(&[2, 3]));
    }

    #[test]
    fn concurrent_replace_same_slot_goes_to_winner() {
        assert_eq!(converge(&[1, 2, 3], &[1, 7, 3], &[1, 8, 3], true), list(&[1, 7, 3]));
        assert_eq!(converge(&[1, 2, 3], &[1, 7, 3], &[1, 8, 3], false), list(&[1, 8, 3]));
    }

    #[test]
    fn delete_versus_replace() {
        assert_eq!(converge(&[1, 2, 3], &[1, 3], &[1, 8, 3], true), list(&[1, 3]));
        assert_eq!(converge(&[1, 2, 3], &[1, 3], &[1, 8, 3], false), list(&[1, 8, 3]));
    }
}
