//! Deterministic session names.

/// `{issue}-{stage}-{attempt}`, or `…-fix-{round}` for fresh fix sessions.
///
/// Characters tmux treats specially in target names (`.` and `:`) and
/// whitespace are replaced with `_`.
pub fn session_name(issue: &str, stage: &str, attempt: u32, fix_round: Option<u32>) -> String {
    let mut name = format!("{}-{}-{attempt}", sanitize(issue), sanitize(stage));
    if let Some(round) = fix_round {
        name.push_str(&format!("-fix-{round}"));
    }
    name
}

fn sanitize(part: &str) -> String {
    part.chars()
        .map(|c| match c {
            '.' | ':' => '_',
            c if c.is_whitespace() => '_',
            c => c,
        })
        .collect()
}
