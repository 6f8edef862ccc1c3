//! Byte escaping and content diffing for human-readable output.
//!
//! Remote command output and file contents can contain arbitrary
//! bytes. Before anything reaches the terminal it is decoded here:
//! valid UTF-8 is kept, everything else is replaced with backslash
//! escape sequences (`\n`, `\xff`, …).

/// Decodes the given data as UTF-8, replacing all non-decodable and
/// non-printable characters with backslash escape sequences.
///
/// ```
/// # use skiff_core::escape::decode_escape;
/// assert_eq!(decode_escape(b"ab\n\xff\x00"), "ab\\n\\xff\\0");
/// ```
#[must_use]
pub fn decode_escape(data: &[u8]) -> String {
    let mut out = String::with_capacity(data.len());
    let mut rest = data;
    loop {
        match std::str::from_utf8(rest) {
            Ok(s) => {
                push_escaped_str(&mut out, s);
                return out;
            }
            Err(e) => {
                let (valid, invalid) = rest.split_at(e.valid_up_to());
                // Unwrap is fine: valid_up_to guarantees this parses.
                push_escaped_str(&mut out, std::str::from_utf8(valid).unwrap_or(""));
                let skip = e.error_len().unwrap_or(invalid.len());
                for b in &invalid[..skip] {
                    out.push_str(&format!("\\x{b:02x}"));
                }
                rest = &invalid[skip..];
                if rest.is_empty() {
                    return out;
                }
            }
        }
    }
}

fn push_escaped_str(out: &mut String, s: &str) {
    for c in s.chars() {
        match c {
            '\0' => out.push_str("\\0"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c if !c.is_control() => out.push(c),
            c if (c as u32) <= 0xff => out.push_str(&format!("\\x{:02x}", c as u32)),
            c => out.push(c),
        }
    }
}

/// One diffing opcode over whole lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DiffOp {
    Equal,
    Delete,
    Insert,
}

/// Creates a unified diff (3 context lines) between the old and new
/// content of the given file, returned as printable lines without
/// terminating newlines. Non-printable bytes are escaped. The header
/// names the file and whether it was created, deleted or modified.
#[must_use]
pub fn unified_diff(filename: &str, old: Option<&[u8]>, new: Option<&[u8]>) -> Vec<String> {
    let old_lines: Vec<&[u8]> = old.map_or_else(Vec::new, |c| c.split(|b| *b == b'\n').collect());
    let new_lines: Vec<&[u8]> = new.map_or_else(Vec::new, |c| c.split(|b| *b == b'\n').collect());

    let action = match (old, new) {
        (None, _) => "created",
        (_, None) => "deleted",
        _ => "modified",
    };
    let title = format!("{action}: {filename}");
    let bar = "─".repeat(title.chars().count());
    let mut out = vec![bar.clone(), title, bar];

    out.extend(hunks(&old_lines, &new_lines));
    out
}

/// Produces the `@@`-style hunks for two line vectors.
fn hunks(old: &[&[u8]], new: &[&[u8]]) -> Vec<String> {
    const CONTEXT: usize = 3;
    let ops = diff_ops(old, new);

    // Indices of changed opcodes, grouped so that changes separated by
    // at most 2*CONTEXT equal lines share a hunk.
    let changed: Vec<usize> = ops
        .iter()
        .enumerate()
        .filter(|(_, op)| **op != DiffOp::Equal)
        .map(|(i, _)| i)
        .collect();
    if changed.is_empty() {
        return Vec::new();
    }

    let mut groups: Vec<(usize, usize)> = Vec::new();
    let mut start = changed[0];
    let mut end = changed[0];
    for &c in &changed[1..] {
        if c - end <= 2 * CONTEXT {
            end = c;
        } else {
            groups.push((start, end));
            start = c;
            end = c;
        }
    }
    groups.push((start, end));

    // Old/new line index reached before each opcode.
    let mut old_at = vec![0usize; ops.len() + 1];
    let mut new_at = vec![0usize; ops.len() + 1];
    for (i, op) in ops.iter().enumerate() {
        old_at[i + 1] = old_at[i] + usize::from(*op != DiffOp::Insert);
        new_at[i + 1] = new_at[i] + usize::from(*op != DiffOp::Delete);
    }

    let mut out = Vec::new();
    for (first, last) in groups {
        let lo = first.saturating_sub(CONTEXT);
        let hi = (last + CONTEXT + 1).min(ops.len());

        let old_start = old_at[lo];
        let new_start = new_at[lo];
        let old_count = old_at[hi] - old_start;
        let new_count = new_at[hi] - new_start;

        out.push(format!(
            "@@ -{},{} +{},{} @@",
            old_start + 1,
            old_count,
            new_start + 1,
            new_count
        ));
        for i in lo..hi {
            match ops[i] {
                DiffOp::Equal => out.push(format!(" {}", decode_escape(old[old_at[i]]))),
                DiffOp::Delete => out.push(format!("-{}", decode_escape(old[old_at[i]]))),
                DiffOp::Insert => out.push(format!("+{}", decode_escape(new[new_at[i]]))),
            }
        }
    }
    out
}

/// Computes a line-wise opcode stream via a longest-common-subsequence
/// table. Quadratic, which is fine for the config-sized files skiff
/// diffs.
fn diff_ops(old: &[&[u8]], new: &[&[u8]]) -> Vec<DiffOp> {
    let n = old.len();
    let m = new.len();
    let mut lcs = vec![0u32; (n + 1) * (m + 1)];
    let idx = |i: usize, j: usize| i * (m + 1) + j;

    for i in (0..n).rev() {
        for j in (0..m).rev() {
            lcs[idx(i, j)] = if old[i] == new[j] {
                lcs[idx(i + 1, j + 1)] + 1
            } else {
                lcs[idx(i + 1, j)].max(lcs[idx(i, j + 1)])
            };
        }
    }

    let mut ops = Vec::with_capacity(n + m);
    let (mut i, mut j) = (0usize, 0usize);
    while i < n && j < m {
        if old[i] == new[j] {
            ops.push(DiffOp::Equal);
            i += 1;
            j += 1;
        } else if lcs[idx(i + 1, j)] >= lcs[idx(i, j + 1)] {
            ops.push(DiffOp::Delete);
            i += 1;
        } else {
            ops.push(DiffOp::Insert);
            j += 1;
        }
    }
    ops.extend(std::iter::repeat(DiffOp::Delete).take(n - i));
    ops.extend(std::iter::repeat(DiffOp::Insert).take(m - j));
    ops
}
