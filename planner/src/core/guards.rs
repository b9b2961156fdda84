//! Validation applied to every child an oracle proposes.

use crate::core::path::RESERVED_NAMES;
use crate::error::PlanError;

/// Reject names that cannot safely become a plan-tree directory.
pub fn validate_child_name(name: &str) -> Result<(), PlanError> {
    let invalid = |reason: &str| PlanError::InvalidName {
        name: name.to_string(),
        reason: reason.to_string(),
    };
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(invalid("name must not be empty"));
    }
    if trimmed != name {
        return Err(invalid("name must not have surrounding whitespace"));
    }
    if name == "." || name == ".." {
        return Err(invalid("name must not be a relative path"));
    }
    if name.contains(['/', '\\']) {
        return Err(invalid("name must not contain path separators"));
    }
    if RESERVED_NAMES.contains(&name) {
        return Err(invalid("name is reserved for plan artifacts"));
    }
    if name.chars().any(char::is_control) {
        return Err(invalid("name must not contain control characters"));
    }
    Ok(())
}

/// Reject a child whose name is identical to, contains, or is contained in
/// its parent's name. The synthetic root is exempt.
pub fn check_recursion(
    parent_name: &str,
    child_name: &str,
    parent_is_root: bool,
) -> Result<(), PlanError> {
    if parent_is_root {
        return Ok(());
    }
    let parent = normalize(parent_name);
    let child = normalize(child_name);
    if parent.is_empty() || child.is_empty() {
        return Ok(());
    }
    if parent == child || parent.contains(&child) || child.contains(&parent) {
        return Err(PlanError::RecursionGuard {
            parent: parent_name.to_string(),
            child: child_name.to_string(),
        });
    }
    Ok(())
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}
