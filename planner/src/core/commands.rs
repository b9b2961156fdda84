//! Allow-list matching for leaf setup commands.

/// Reason logged for a command outside the allow-list.
pub const NOT_WHITELISTED: &str = "Not whitelisted";

/// True if `command` equals an allow-list entry or extends one with
/// space-separated arguments (`"npm install"` allows `"npm install left-pad"`).
pub fn is_allowed(command: &str, allow: &[String]) -> bool {
    let command = command.trim();
    if command.is_empty() {
        return false;
    }
    allow.iter().any(|entry| {
        let entry = entry.trim();
        !entry.is_empty()
            && (command == entry
                || command
                    .strip_prefix(entry)
                    .is_some_and(|rest| rest.starts_with(' ')))
    })
}

/// Split a command line into program and arguments (no shell expansion).
pub fn split_command(command: &str) -> Option<(String, Vec<String>)> {
    let mut parts = command.split_whitespace().map(str::to_string);
    let program = parts.next()?;
    Some((program, parts.collect()))
}
