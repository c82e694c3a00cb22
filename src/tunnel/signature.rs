//! Conflict signature in tunnel client output.
//!
//! frpc prints `start error: proxy [<name>] already exists` when another
//! client of the same server already holds the remote port. The wording
//! depends on the frpc version, so matching lives only here.

const CONFLICT_PREFIX: &str = "start error: proxy [";
const CONFLICT_SUFFIX: &str = "] already exists";

/// Does this output line report that our proxy already exists?
pub fn is_proxy_conflict(line: &str) -> bool {
    line.contains(CONFLICT_PREFIX) && line.contains(CONFLICT_SUFFIX)
}

/// The proxy name between the brackets of a conflict line
pub fn conflicting_proxy(line: &str) -> Option<&str> {
    let start = line.find(CONFLICT_PREFIX)? + CONFLICT_PREFIX.len();
    let len = line[start..].find(CONFLICT_SUFFIX)?;
    Some(&line[start..start + len])
}
