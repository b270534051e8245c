//! Sudo dispatch (§4.F step 4): rewrites `sudo` invocations to accept a
//! piped password non-interactively. The password is never logged.

use regex::Regex;

/// Matches a `sudo` token at a word boundary, so `sudo`, `sudo -n id` match
/// but `pseudo` or `/usr/bin/sudox` do not.
fn sudo_token_re() -> Regex {
    Regex::new(r"\bsudo\b").expect("static sudo regex is valid")
}

/// Returns `true` if `command` contains a `sudo` invocation.
pub fn contains_sudo(command: &str) -> bool {
    sudo_token_re().is_match(command)
}

/// Rewrite every `sudo` token to `sudo -S` and pipe the password in via
/// `echo`, suppressing the interactive prompt noise on stderr.
pub fn rewrite_with_password(command: &str, password: &str) -> String {
    let rewritten = sudo_token_re().replace_all(command, "sudo -S");
    format!("echo \"{password}\" | {rewritten} 2>/dev/null")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_sudo_at_word_boundary() {
        assert!(contains_sudo("sudo -n id"));
        assert!(contains_sudo("echo hi && sudo ls"));
    }

    #[test]
    fn does_not_match_substrings() {
        assert!(!contains_sudo("pseudo-random"));
        assert!(!contains_sudo("echo sudoku"));
    }

    #[test]
    fn rewrites_matching_the_spec_example() {
        let rewritten = rewrite_with_password("sudo -n id", "p");
        assert_eq!(rewritten, "echo \"p\" | sudo -S -n id 2>/dev/null");
    }

    #[test]
    fn rewrites_every_sudo_occurrence() {
        let rewritten = rewrite_with_password("sudo ls && sudo whoami", "p");
        assert_eq!(rewritten, "echo \"p\" | sudo -S ls && sudo -S whoami 2>/dev/null");
    }
}
