//! # Glob Matching
//!
//! Redis-style glob matching for pattern subscriptions: `*` matches any
//! run of bytes, `?` one byte, `[abc]` / `[a-z]` / `[^a]` a class, and `\`
//! escapes the next byte.

/// Returns true when `text` matches `pattern`.
pub fn glob_match(pattern: &[u8], text: &[u8]) -> bool {
    let (mut p, mut t) = (0usize, 0usize);
    // Backtrack point for the most recent `*`: (pattern index after it, text index).
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            match pattern[p] {
                b'*' => {
                    // Collapse consecutive stars.
                    while p < pattern.len() && pattern[p] == b'*' {
                        p += 1;
                    }
                    if p == pattern.len() {
                        return true;
                    }
                    star = Some((p, t));
                    continue;
                }
                b'?' => {
                    p += 1;
                    t += 1;
                    continue;
                }
                b'[' => {
                    let (matched, next) = match_class(pattern, p, text[t]);
                    if matched {
                        p = next;
                        t += 1;
                        continue;
                    }
                }
                b'\\' if p + 1 < pattern.len() => {
                    if pattern[p + 1] == text[t] {
                        p += 2;
                        t += 1;
                        continue;
                    }
                }
                literal => {
                    if literal == text[t] {
                        p += 1;
                        t += 1;
                        continue;
                    }
                }
            }
        }

        // Mismatch: let the last star absorb one more byte, or fail.
        match star {
            Some((star_p, star_t)) => {
                p = star_p;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    while p < pattern.len() && pattern[p] == b'*' {
        p += 1;
    }
    p == pattern.len()
}

/// Matches `byte` against the class starting at `pattern[start] == b'['`.
///
/// Returns `(matched, index after the closing bracket)`; an unterminated
/// class consumes the rest of the pattern.
fn match_class(pattern: &[u8], start: usize, byte: u8) -> (bool, usize) {
    let mut idx = start + 1;
    let negate = idx < pattern.len() && pattern[idx] == b'^';
    if negate {
        idx += 1;
    }

    let mut matched = false;
    while idx < pattern.len() && pattern[idx] != b']' {
        if pattern[idx] == b'\\' && idx + 1 < pattern.len() {
            idx += 1;
            if pattern[idx] == byte {
                matched = true;
            }
            idx += 1;
        } else if idx + 2 < pattern.len() && pattern[idx + 1] == b'-' && pattern[idx + 2] != b']' {
            let (mut lo, mut hi) = (pattern[idx], pattern[idx + 2]);
            if lo > hi {
                std::mem::swap(&mut lo, &mut hi);
            }
            if byte >= lo && byte <= hi {
                matched = true;
            }
            idx += 3;
        } else {
            if pattern[idx] == byte {
                matched = true;
            }
            idx += 1;
        }
    }

    let next = if idx < pattern.len() { idx + 1 } else { idx };
    (matched != negate, next)
}
