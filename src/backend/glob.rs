//! Store-style glob matching.
//!
//! Supports `*`, `?`, character classes (`[abc]`, `[a-z]`, `[^x]`) and
//! backslash escapes. An unterminated `[` matches itself.

/// Whether `text` matches `pattern`.
pub fn glob_match(pattern: &str, text: &str) -> bool {
    let pattern: Vec<char> = pattern.chars().collect();
    let text: Vec<char> = text.chars().collect();

    let (mut p, mut t) = (0usize, 0usize);
    // Position of the last `*` and the text index it is currently absorbing up to.
    let mut star: Option<(usize, usize)> = None;

    while t < text.len() {
        if p < pattern.len() {
            if pattern[p] == '*' {
                star = Some((p, t));
                p += 1;
                continue;
            }
            if let Some(width) = single(&pattern[p..], text[t]) {
                p += width;
                t += 1;
                continue;
            }
        }
        match star {
            Some((star_p, star_t)) => {
                p = star_p + 1;
                t = star_t + 1;
                star = Some((star_p, star_t + 1));
            }
            None => return false,
        }
    }

    pattern[p..].iter().all(|&c| c == '*')
}

/// Pattern characters consumed if the token at the start of `pattern` matches `c`.
fn single(pattern: &[char], c: char) -> Option<usize> {
    match pattern[0] {
        '?' => Some(1),
        '[' => match class(pattern, c) {
            Some((true, width)) => Some(width),
            Some((false, _)) => None,
            None => (c == '[').then_some(1),
        },
        '\\' if pattern.len() > 1 => (pattern[1] == c).then_some(2),
        literal => (literal == c).then_some(1),
    }
}

/// Evaluate a `[...]` class. Returns `None` when the class is unterminated.
fn class(pattern: &[char], c: char) -> Option<(bool, usize)> {
    let mut i = 1;
    let negate = pattern.get(i) == Some(&'^');
    if negate {
        i += 1;
    }

    let mut hit = false;
    loop {
        let current = *pattern.get(i)?;
        match current {
            ']' => return Some((hit != negate, i + 1)),
            '\\' if i + 1 < pattern.len() => {
                hit |= pattern[i + 1] == c;
                i += 2;
            }
            lo if pattern.get(i + 1) == Some(&'-')
                && pattern.get(i + 2).is_some_and(|&hi| hi != ']') =>
            {
                let hi = pattern[i + 2];
                let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
                hit |= (lo..=hi).contains(&c);
                i += 3;
            }
            literal => {
                hit |= literal == c;
                i += 1;
            }
        }
    }
}
