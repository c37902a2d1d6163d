//! Failure Classifier: pattern-match captured subprocess output to decide
//! whether a failure is retriable (cache-corruption family) or fatal.
//! Pure predicates only — callers decide whether to act on them.

/// True when `output` contains a line starting with `fatal: Authentication
/// failed`. Authentication failures are retriable but must not evict the
/// mirror.
pub fn auth_error(output: &str) -> bool {
    output
        .lines()
        .any(|line| line.starts_with("fatal: Authentication failed"))
}

const RETRIABLE_PREFIXES: &[&str] = &[
    "fatal: missing blob object",
    "fatal: remote did not send all necessary objects",
    "fatal: did not receive expected object",
    "error: unable to read sha1 file of",
];

/// True when `output` matches one of the known cache-corruption
/// signatures, or is an authentication failure (also retriable, just
/// not evictable — see [`auth_error`]).
pub fn retriable(output: &str) -> bool {
    if auth_error(output) {
        return true;
    }

    let lines: Vec<&str> = output.lines().collect();
    for (i, line) in lines.iter().enumerate() {
        if RETRIABLE_PREFIXES.iter().any(|p| line.contains(p)) {
            return true;
        }
        if line.contains("fatal: packed object") && line.contains("is corrupt") {
            return true;
        }
        if line.starts_with("fatal: pack has") && line.contains("unresolved delta") {
            return true;
        }
        if line.starts_with("fatal: unable to read tree")
            && lines
                .get(i + 1)
                .is_some_and(|next| next.contains("warning: Clone succeeded, but checkout failed"))
        {
            return true;
        }
    }
    false
}
