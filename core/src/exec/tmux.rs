//! Tmux safety dispatch and output enrichment (§4.F steps 5 and 7).
//!
//! The blocked-check and the send-keys output enrichment both need a
//! "before" pane snapshot, so callers capture it once, unconditionally,
//! ahead of the blocked check (§9) and pass it into whichever path runs.

use regex::Regex;

/// States (from `ps -o state=`) that mean the pane's foreground process is
/// uninterruptible or stopped and therefore can't usefully receive keys.
const BLOCKING_STATES: &[char] = &['D', 'T', 'W'];

fn interactive_command_re() -> Regex {
    Regex::new(r"^(vim|nano|less|more|top|htop|man)$").expect("static regex is valid")
}

fn prompt_line_re() -> Regex {
    Regex::new(r".*[$#>]\s*$").expect("static regex is valid")
}

/// The kind of tmux invocation a command line represents, for routing to
/// the right pre/post-execution handling.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TmuxKind {
    SendKeys { session: String },
    NewSession,
    KillSession,
    HasSession,
    CapturePane,
    Other,
}

/// Classify a command line as a tmux invocation, or `None` if it isn't one.
pub fn classify(command: &str) -> Option<TmuxKind> {
    let trimmed = command.trim();
    if !trimmed.starts_with("tmux ") && trimmed != "tmux" {
        return None;
    }
    if let Some(session) = parse_send_keys_target(trimmed) {
        return Some(TmuxKind::SendKeys { session });
    }
    if trimmed.contains("new-session") {
        return Some(TmuxKind::NewSession);
    }
    if trimmed.contains("kill-session") {
        return Some(TmuxKind::KillSession);
    }
    if trimmed.contains("has-session") {
        return Some(TmuxKind::HasSession);
    }
    if trimmed.contains("capture-pane") {
        return Some(TmuxKind::CapturePane);
    }
    Some(TmuxKind::Other)
}

/// Extract the target session from a `tmux send-keys -t <sess> … (Enter|C-m)`
/// invocation, or `None` if this isn't a send-keys command ending in a key press.
pub fn parse_send_keys_target(command: &str) -> Option<String> {
    if !command.contains("send-keys") {
        return None;
    }
    if !(command.contains(" Enter") || command.contains("C-m")) {
        return None;
    }
    let re = Regex::new(r"send-keys\s+-t\s+(\S+)").ok()?;
    re.captures(command).map(|c| c[1].to_string())
}

/// Parse a `tmux list-panes -F "#{pane_pid} #{pane_current_command}"` line.
pub fn parse_pane_line(line: &str) -> Option<(u32, String)> {
    let mut parts = line.trim().splitn(2, char::is_whitespace);
    let pid: u32 = parts.next()?.parse().ok()?;
    let command = parts.next().unwrap_or_default().trim().to_string();
    Some((pid, command))
}

/// Decide whether a tmux pane is blocked: an uninterruptible/stopped
/// process state, a known interactive full-screen program, or any child
/// process of the pane's foreground process.
pub fn is_blocked(state_letter: Option<char>, pane_command: &str, has_child: bool) -> bool {
    if let Some(state) = state_letter {
        if BLOCKING_STATES.contains(&state) {
            return true;
        }
    }
    if interactive_command_re().is_match(pane_command) {
        return true;
    }
    has_child
}

/// Build the structured abort message for a blocked `send-keys`.
pub fn build_blocked_message(session: &str, pane_command: &str, ps_line: &str, captured_tail: &str) -> String {
    format!(
        "tmux session '{session}' is blocked: pane is running '{pane_command}' ({ps_line}).\n\
         Last 10 captured lines:\n{captured_tail}\n\
         The send-keys was not sent. Pass `force: true` to send anyway."
    )
}

/// Compute the longest common prefix, line-wise, of two pane captures and
/// return the lines appended after it (the new output from the send).
pub fn new_lines(before: &str, after: &str) -> Vec<String> {
    let before_lines: Vec<&str> = before.lines().collect();
    let after_lines: Vec<&str> = after.lines().collect();

    let common = before_lines
        .iter()
        .zip(after_lines.iter())
        .take_while(|(b, a)| b == a)
        .count();

    after_lines[common..].iter().map(|s| s.to_string()).collect()
}

/// Bound the returned context by the two most recent prompt-like lines
/// (matching `^.*[\$#>]\s*$`) preceding the new output.
pub fn context_window(before: &str, appended: &[String]) -> Vec<String> {
    let before_lines: Vec<&str> = before.lines().collect();
    let prompt_positions: Vec<usize> = before_lines
        .iter()
        .enumerate()
        .filter(|(_, line)| prompt_line_re().is_match(line))
        .map(|(i, _)| i)
        .collect();

    let start = if prompt_positions.len() >= 2 {
        prompt_positions[prompt_positions.len() - 2]
    } else if let Some(&last) = prompt_positions.last() {
        last
    } else {
        0
    };

    let mut window: Vec<String> = before_lines[start..].iter().map(|s| s.to_string()).collect();
    window.extend(appended.iter().cloned());
    window
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_send_keys_target() {
        let target = parse_send_keys_target("tmux send-keys -t s 'ls' Enter");
        assert_eq!(target.as_deref(), Some("s"));
    }

    #[test]
    fn non_send_keys_command_has_no_target() {
        assert!(parse_send_keys_target("tmux list-panes -t s").is_none());
    }

    #[test]
    fn send_keys_without_key_press_is_not_matched() {
        assert!(parse_send_keys_target("tmux send-keys -t s ls").is_none());
    }

    #[test]
    fn classify_recognizes_send_keys() {
        let kind = classify("tmux send-keys -t s ls Enter").unwrap();
        assert_eq!(kind, TmuxKind::SendKeys { session: "s".into() });
    }

    #[test]
    fn classify_recognizes_other_subcommands() {
        assert_eq!(classify("tmux new-session -d -s foo").unwrap(), TmuxKind::NewSession);
        assert_eq!(classify("tmux kill-session -t foo").unwrap(), TmuxKind::KillSession);
        assert_eq!(classify("tmux has-session -t foo").unwrap(), TmuxKind::HasSession);
        assert_eq!(classify("tmux capture-pane -p -t foo").unwrap(), TmuxKind::CapturePane);
    }

    #[test]
    fn non_tmux_command_is_not_classified() {
        assert!(classify("ls -la").is_none());
    }

    #[test]
    fn blocked_on_uninterruptible_state() {
        assert!(is_blocked(Some('D'), "bash", false));
        assert!(is_blocked(Some('T'), "bash", false));
        assert!(is_blocked(Some('W'), "bash", false));
        assert!(!is_blocked(Some('S'), "bash", false));
    }

    #[test]
    fn blocked_on_interactive_program() {
        assert!(is_blocked(Some('R'), "vim", false));
        assert!(is_blocked(Some('S'), "less", false));
        assert!(!is_blocked(Some('S'), "vimdiff", false));
    }

    #[test]
    fn blocked_on_child_process() {
        assert!(is_blocked(Some('S'), "bash", true));
    }

    #[test]
    fn new_lines_only_returns_appended_content() {
        let before = "prompt$ \n";
        let after = "prompt$ \nhello\nworld\n";
        let appended = new_lines(before, after);
        assert_eq!(appended, vec!["hello".to_string(), "world".to_string()]);
    }

    #[test]
    fn context_window_bounded_by_two_prompts() {
        let before = "$ cmd1\nout1\n$ cmd2\nout2\n$ cmd3\n";
        let appended = vec!["new output".to_string()];
        let window = context_window(before, &appended);
        assert!(window.contains(&"$ cmd2".to_string()));
        assert!(window.contains(&"new output".to_string()));
        assert!(!window.contains(&"$ cmd1".to_string()));
    }
}
