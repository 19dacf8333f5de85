//! Environment handed to spawned shells.

/// Variables that are never passed to a user shell.
pub const DEFAULT_RESTRICTED: &[&str] = &["AUDIT_UPLOAD_URL"];

/// Drop every `KEY=value` pair whose key is on the deny-list. Order is kept.
pub fn filter_env<I, S>(pairs: I, deny: &[String]) -> Vec<String>
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    pairs
        .into_iter()
        .map(Into::into)
        .filter(|pair| {
            let key = pair.split_once('=').map_or(pair.as_str(), |(k, _)| k);
            !deny.iter().any(|d| d == key)
        })
        .collect()
}

/// The current process environment as `KEY=value` pairs.
pub fn current_env() -> Vec<String> {
    std::env::vars_os()
        .map(|(k, v)| format!("{}={}", k.to_string_lossy(), v.to_string_lossy()))
        .collect()
}

/// Replace or append `key` in a list of `KEY=value` pairs.
pub fn set_var(pairs: &mut Vec<String>, key: &str, value: &str) {
    let entry = format!("{key}={value}");
    let prefix = format!("{key}=");
    match pairs.iter_mut().find(|p| p.starts_with(&prefix)) {
        Some(existing) => *existing = entry,
        None => pairs.push(entry),
    }
}
