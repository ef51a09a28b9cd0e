//! Branch-name helpers.

/// Prefix of every branch the bot owns.
pub const BRANCH_PREFIX: &str = "sweeper--";

/// Some hosts reject longer branch names.
pub const MAX_BRANCH_NAME_LEN: usize = 230;

/// Lowercase ASCII slug: alphanumerics kept, every other run collapsed to `-`.
pub fn slugify(input: &str) -> String {
    let mut out = String::with_capacity(input.len());
    let mut pending_dash = false;
    for c in input.chars() {
        if c.is_ascii_alphanumeric() {
            if pending_dash && !out.is_empty() {
                out.push('-');
            }
            pending_dash = false;
            out.push(c.to_ascii_lowercase());
        } else {
            pending_dash = true;
        }
    }
    out
}

/// Default task branch when a task has no branch-name template.
pub fn default_branch_name(task_name: &str) -> String {
    truncate_branch_name(format!("{BRANCH_PREFIX}{}", slugify(task_name)))
}

/// Cut a branch name to [`MAX_BRANCH_NAME_LEN`] bytes on a char boundary.
pub fn truncate_branch_name(mut name: String) -> String {
    if name.len() > MAX_BRANCH_NAME_LEN {
        let mut cut = MAX_BRANCH_NAME_LEN;
        while !name.is_char_boundary(cut) {
            cut -= 1;
        }
        name.truncate(cut);
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slugify_collapses_separators() {
        assert_eq!(slugify("Update  Go to 1.22!"), "update-go-to-1-22");
        assert_eq!(slugify("--already-slugged--"), "already-slugged");
    }

    #[test]
    fn default_branch_is_prefixed_and_bounded() {
        assert_eq!(default_branch_name("Hello World"), "sweeper--hello-world");
        let long = "x".repeat(400);
        assert_eq!(default_branch_name(&long).len(), MAX_BRANCH_NAME_LEN);
    }
}
