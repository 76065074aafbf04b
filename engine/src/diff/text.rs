//! Character-level text deltas.
//!
//! A [`TextDelta`] is a sequence of retain / insert / delete components over
//! the characters of a base string. On the wire it uses the diff-match-patch
//! delta encoding: tab separated `=n`, `-n` and `+text` tokens with the
//! inserted text percent-encoded.
//!
//! Lengths count Unicode scalar values.

use crate::error::ApplyError;
use std::fmt;

/// One component of a text delta.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TextEdit {
    Retain(usize),
    Insert(String),
    Delete(usize),
}

/// An edit script taking one string to another.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextDelta {
    edits: Vec<TextEdit>,
}

impl TextDelta {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn edits(&self) -> &[TextEdit] {
        &self.edits
    }

    /// Number of characters the delta expects in its base string.
    pub fn base_len(&self) -> usize {
        self.edits
            .iter()
            .map(|e| match e {
                TextEdit::Retain(n) | TextEdit::Delete(n) => *n,
                TextEdit::Insert(_) => 0,
            })
            .sum()
    }

    /// Number of characters in the result.
    pub fn target_len(&self) -> usize {
        self.edits
            .iter()
            .map(|e| match e {
                TextEdit::Retain(n) => *n,
                TextEdit::Insert(s) => s.chars().count(),
                TextEdit::Delete(_) => 0,
            })
            .sum()
    }

    /// True when applying the delta leaves its base untouched.
    pub fn is_noop(&self) -> bool {
        self.edits.iter().all(|e| matches!(e, TextEdit::Retain(_)))
    }

    pub fn retain(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        if let Some(TextEdit::Retain(last)) = self.edits.last_mut() {
            *last += n;
        } else {
            self.edits.push(TextEdit::Retain(n));
        }
        self
    }

    /// Append an insertion. Inserts are kept ahead of an adjacent delete so
    /// that equal deltas have equal representations.
    pub fn insert(&mut self, text: &str) -> &mut Self {
        if text.is_empty() {
            return self;
        }
        let len = self.edits.len();
        match self.edits.last_mut() {
            Some(TextEdit::Insert(last)) => last.push_str(text),
            Some(TextEdit::Delete(_)) => {
                if len >= 2 {
                    if let TextEdit::Insert(prev) = &mut self.edits[len - 2] {
                        prev.push_str(text);
                        return self;
                    }
                }
                self.edits.insert(len - 1, TextEdit::Insert(text.to_string()));
            }
            _ => self.edits.push(TextEdit::Insert(text.to_string())),
        }
        self
    }

    pub fn delete(&mut self, n: usize) -> &mut Self {
        if n == 0 {
            return self;
        }
        if let Some(TextEdit::Delete(last)) = self.edits.last_mut() {
            *last += n;
        } else {
            self.edits.push(TextEdit::Delete(n));
        }
        self
    }

    /// Apply the delta to `text`.
    pub fn apply(&self, text: &str) -> Result<String, ApplyError> {
        let chars: Vec<char> = text.chars().collect();
        if chars.len() != self.base_len() {
            return Err(ApplyError::mismatch(format!(
                "text delta expects {} characters, found {}",
                self.base_len(),
                chars.len()
            )));
        }

        let mut out = String::with_capacity(text.len());
        let mut pos = 0;
        for edit in &self.edits {
            match edit {
                TextEdit::Retain(n) => {
                    out.extend(&chars[pos..pos + n]);
                    pos += n;
                }
                TextEdit::Insert(s) => out.push_str(s),
                TextEdit::Delete(n) => pos += n,
            }
        }
        Ok(out)
    }

    /// Encode using the diff-match-patch delta format.
    pub fn to_delta_string(&self) -> String {
        self.edits
            .iter()
            .map(|e| match e {
                TextEdit::Retain(n) => format!("={n}"),
                TextEdit::Delete(n) => format!("-{n}"),
                TextEdit::Insert(s) => format!("+{}", encode_insert(s)),
            })
            .collect::<Vec<_>>()
            .join("\t")
    }

    /// Decode the diff-match-patch delta format.
    pub fn parse(delta: &str) -> Result<Self, String> {
        let mut out = TextDelta::new();
        if delta.is_empty() {
            return Ok(out);
        }
        for token in delta.split('\t') {
            let mut chars = token.chars();
            match chars.next() {
                Some('=') => {
                    out.retain(parse_len(chars.as_str())?);
                }
                Some('-') => {
                    out.delete(parse_len(chars.as_str())?);
                }
                Some('+') => {
                    let text = urlencoding::decode(chars.as_str())
                        .map_err(|e| format!("invalid insert text: {e}"))?;
                    out.insert(&text);
                }
                // dmp tolerates empty tokens
                None => {}
                Some(other) => return Err(format!("invalid delta operation '{other}'")),
            }
        }
        Ok(out)
    }
}

impl fmt::Display for TextDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_delta_string())
    }
}

fn parse_len(s: &str) -> Result<usize, String> {
    s.parse()
        .map_err(|_| format!("invalid delta length '{s}'"))
}

/// Percent-encode like `encodeURI`, leaving spaces readable the way
/// diff-match-patch does.
fn encode_insert(text: &str) -> String {
    const UNRESERVED: &[(&str, &str)] = &[
        ("%20", " "),
        ("%21", "!"),
        ("%23", "#"),
        ("%24", "$"),
        ("%26", "&"),
        ("%27", "'"),
        ("%28", "("),
        ("%29", ")"),
        ("%2A", "*"),
        ("%2B", "+"),
        ("%2C", ","),
        ("%2F", "/"),
        ("%3A", ":"),
        ("%3B", ";"),
        ("%3D", "="),
        ("%3F", "?"),
        ("%40", "@"),
    ];
    let mut encoded = urlencoding::encode(text).into_owned();
    for (escaped, plain) in UNRESERVED {
        encoded = encoded.replace(escaped, plain);
    }
    encoded
}

/// Diagonal steps a single [`diff`] may spend searching for a minimal
/// script. Past it the remaining region is replaced wholesale.
const MAX_SEARCH_STEPS: usize = 1 << 24;

/// Compute the character-level delta from `from` to `to`.
///
/// Runs in linear space. The script is minimal unless the search budget
/// runs out, in which case it is still correct but coarser.
pub fn diff(from: &str, to: &str) -> TextDelta {
    let a: Vec<char> = from.chars().collect();
    let b: Vec<char> = to.chars().collect();

    let mut steps = Vec::with_capacity(a.len().max(b.len()));
    let mut budget = MAX_SEARCH_STEPS;
    diff_chars(&a, &b, &mut budget, &mut steps);

    let mut delta = TextDelta::new();
    for step in steps {
        match step {
            Step::Equal => {
                delta.retain(1);
            }
            Step::Delete => {
                delta.delete(1);
            }
            Step::Insert(c) => {
                delta.insert(c.encode_utf8(&mut [0; 4]));
            }
        }
    }
    delta
}

#[derive(Debug, Clone, Copy)]
enum Step {
    Equal,
    Delete,
    Insert(char),
}

fn diff_chars(a: &[char], b: &[char], budget: &mut usize, out: &mut Vec<Step>) {
    let prefix = a.iter().zip(b).take_while(|(x, y)| x == y).count();
    let (a, b) = (&a[prefix..], &b[prefix..]);
    let suffix = a
        .iter()
        .rev()
        .zip(b.iter().rev())
        .take_while(|(x, y)| x == y)
        .count();
    let (a, b) = (&a[..a.len() - suffix], &b[..b.len() - suffix]);

    out.extend(std::iter::repeat(Step::Equal).take(prefix));
    match bisect(a, b, budget) {
        Some((x, y)) => {
            diff_chars(&a[..x], &b[..y], budget, out);
            diff_chars(&a[x..], &b[y..], budget, out);
        }
        None => {
            out.extend(std::iter::repeat(Step::Delete).take(a.len()));
            out.extend(b.iter().map(|&c| Step::Insert(c)));
        }
    }
    out.extend(std::iter::repeat(Step::Equal).take(suffix));
}

/// Find the middle snake of the shortest edit script (Myers 1986, section
/// 4b) and return the point splitting it into two halves.
///
/// `None` when either side is empty, when no useful split exists or when
/// the budget is spent.
fn bisect(a: &[char], b: &[char], budget: &mut usize) -> Option<(usize, usize)> {
    if a.is_empty() || b.is_empty() {
        return None;
    }
    let n = a.len() as isize;
    let m = b.len() as isize;
    let max_d = (n + m + 1) / 2;
    let offset = max_d;
    let len = 2 * max_d + 2;
    let mut forward = vec![-1isize; len as usize];
    let mut reverse = vec![-1isize; len as usize];
    forward[(offset + 1) as usize] = 0;
    reverse[(offset + 1) as usize] = 0;

    let delta = n - m;
    // with an odd delta the forward pass detects the overlap
    let front = delta % 2 != 0;
    let (mut k1_start, mut k1_end, mut k2_start, mut k2_end) = (0, 0, 0, 0);

    for d in 0..max_d {
        let mut k1 = -d + k1_start;
        while k1 <= d - k1_end {
            *budget = budget.checked_sub(1)?;
            let k1_offset = (offset + k1) as usize;
            let mut x1 = if k1 == -d || (k1 != d && forward[k1_offset - 1] < forward[k1_offset + 1]) {
                forward[k1_offset + 1]
            } else {
                forward[k1_offset - 1] + 1
            };
            let mut y1 = x1 - k1;
            while x1 < n && y1 < m && a[x1 as usize] == b[y1 as usize] {
                x1 += 1;
                y1 += 1;
            }
            forward[k1_offset] = x1;
            if x1 > n {
                k1_end += 2;
            } else if y1 > m {
                k1_start += 2;
            } else if front {
                let k2_offset = offset + delta - k1;
                if (0..len).contains(&k2_offset) && reverse[k2_offset as usize] != -1 {
                    let x2 = n - reverse[k2_offset as usize];
                    if x1 >= x2 {
                        return split(x1, y1, n, m);
                    }
                }
            }
            k1 += 2;
        }

        let mut k2 = -d + k2_start;
        while k2 <= d - k2_end {
            *budget = budget.checked_sub(1)?;
            let k2_offset = (offset + k2) as usize;
            let mut x2 = if k2 == -d || (k2 != d && reverse[k2_offset - 1] < reverse[k2_offset + 1]) {
                reverse[k2_offset + 1]
            } else {
                reverse[k2_offset - 1] + 1
            };
            let mut y2 = x2 - k2;
            while x2 < n && y2 < m && a[(n - x2 - 1) as usize] == b[(m - y2 - 1) as usize] {
                x2 += 1;
                y2 += 1;
            }
            reverse[k2_offset] = x2;
            if x2 > n {
                k2_end += 2;
            } else if y2 > m {
                k2_start += 2;
            } else if !front {
                let k1_offset = offset + delta - k2;
                if (0..len).contains(&k1_offset) && forward[k1_offset as usize] != -1 {
                    let x1 = forward[k1_offset as usize];
                    let y1 = offset + x1 - k1_offset;
                    if x1 >= n - x2 {
                        return split(x1, y1, n, m);
                    }
                }
            }
            k2 += 2;
        }
    }
    None
}

/// A split at either corner would recurse on the same input.
fn split(x: isize, y: isize, n: isize, m: isize) -> Option<(usize, usize)> {
    let inside = (0..=n).contains(&x) && (0..=m).contains(&y);
    let corner = (x == 0 && y == 0) || (x == n && y == m);
    (inside && !corner).then_some((x as usize, y as usize))
}

/// Rebase two concurrent deltas over the same base.
///
/// Returns `(a', b')` where `a'` applies after `b` and `b'` applies after
/// `a`, so that `b' ∘ a == a' ∘ b`. `a_wins` says whether `a` lands later in
/// server order: its insertions go first when both insert at the same spot,
/// and text the loser inserts strictly inside a span the winner deletes is
/// dropped.
pub fn transform(
    a: &TextDelta,
    b: &TextDelta,
    a_wins: bool,
) -> Result<(TextDelta, TextDelta), ApplyError> {
    if a.base_len() != b.base_len() {
        return Err(ApplyError::mismatch(format!(
            "concurrent text deltas disagree on base length ({} vs {})",
            a.base_len(),
            b.base_len()
        )));
    }

    let mut a_prime = TextDelta::new();
    let mut b_prime = TextDelta::new();
    let mut ia = a.edits.iter().cloned();
    let mut ib = b.edits.iter().cloned();
    let mut op1 = ia.next();
    let mut op2 = ib.next();
    // whether the base character left of the cursor was deleted by a / b
    let mut a_deleted = false;
    let mut b_deleted = false;

    loop {
        match (op1.take(), op2.take()) {
            (None, None) => break,
            (Some(TextEdit::Insert(s1)), Some(TextEdit::Insert(s2))) => {
                if a_wins {
                    a_prime.insert(&s1);
                    b_prime.retain(s1.chars().count());
                    op1 = ia.next();
                    op2 = Some(TextEdit::Insert(s2));
                } else {
                    a_prime.retain(s2.chars().count());
                    b_prime.insert(&s2);
                    op1 = Some(TextEdit::Insert(s1));
                    op2 = ib.next();
                }
            }
            (Some(TextEdit::Insert(s)), other) => {
                let inside_b_delete = b_deleted && matches!(other, Some(TextEdit::Delete(_)));
                if inside_b_delete && !a_wins {
                    // b already deleted the span around this insert
                    b_prime.delete(s.chars().count());
                } else {
                    a_prime.insert(&s);
                    b_prime.retain(s.chars().count());
                }
                op1 = ia.next();
                op2 = other;
            }
            (other, Some(TextEdit::Insert(s))) => {
                let inside_a_delete = a_deleted && matches!(other, Some(TextEdit::Delete(_)));
                if inside_a_delete && a_wins {
                    a_prime.delete(s.chars().count());
                } else {
                    a_prime.retain(s.chars().count());
                    b_prime.insert(&s);
                }
                op1 = other;
                op2 = ib.next();
            }
            (Some(e1), Some(e2)) => {
                let (n1, n2) = (consumed(&e1), consumed(&e2));
                let n = n1.min(n2);
                match (&e1, &e2) {
                    (TextEdit::Retain(_), TextEdit::Retain(_)) => {
                        a_prime.retain(n);
                        b_prime.retain(n);
                    }
                    (TextEdit::Delete(_), TextEdit::Retain(_)) => {
                        a_prime.delete(n);
                    }
                    (TextEdit::Retain(_), TextEdit::Delete(_)) => {
                        b_prime.delete(n);
                    }
                    // both deleted the same characters
                    _ => {}
                }
                a_deleted = matches!(e1, TextEdit::Delete(_));
                b_deleted = matches!(e2, TextEdit::Delete(_));
                op1 = shrink(e1, n).or_else(|| ia.next());
                op2 = shrink(e2, n).or_else(|| ib.next());
            }
            (Some(_), None) | (None, Some(_)) => {
                return Err(ApplyError::mismatch(
                    "concurrent text deltas ran out of components",
                ));
            }
        }
    }

    Ok((a_prime, b_prime))
}

fn consumed(edit: &TextEdit) -> usize {
    match edit {
        TextEdit::Retain(n) | TextEdit::Delete(n) => *n,
        TextEdit::Insert(_) => 0,
    }
}

/// Remove `n` base characters from the front of a retain/delete component.
fn shrink(edit: TextEdit, n: usize) -> Option<TextEdit> {
    match edit {
        TextEdit::Retain(m) if m > n => Some(TextEdit::Retain(m - n)),
        TextEdit::Delete(m) if m > n => Some(TextEdit::Delete(m - n)),
        _ => None,
    }
}
