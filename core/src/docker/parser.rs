//! Docker Command Parser (§4.D): classifies a single shell command line
//! as regular, a `docker exec` invocation, a pass-through `docker run`, or
//! a compound line of `&&`/`||`/`;`-joined segments.

/// A parsed `docker exec <container> <inner>` invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DockerExecSegment {
    pub original: String,
    pub container: String,
    pub workdir: Option<String>,
    pub user: Option<String>,
    pub env: Vec<(String, String)>,
    /// Unrecognized short flags collected verbatim (`-i`, `-t`, `-it`, `-d`, …).
    pub flags: Vec<String>,
    pub inner_command: String,
}

/// The classification of a single command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedCommand {
    /// No `docker exec`/`docker run` anywhere; passed through unchanged.
    Regular(String),
    /// A single `docker exec` segment.
    DockerExec(DockerExecSegment),
    /// A `docker run` invocation; the broker never rewrites these.
    DockerRun(String),
    /// `&&`/`||`/`;`-joined segments, each independently classified.
    Compound {
        original: String,
        segments: Vec<ParsedCommand>,
        needs_container_context: bool,
    },
}

impl ParsedCommand {
    pub fn original(&self) -> &str {
        match self {
            ParsedCommand::Regular(s) => s,
            ParsedCommand::DockerExec(s) => &s.original,
            ParsedCommand::DockerRun(s) => s,
            ParsedCommand::Compound { original, .. } => original,
        }
    }

    /// All `docker exec` segments, in order, including those nested inside
    /// a compound line.
    pub fn docker_exec_segments(&self) -> Vec<&DockerExecSegment> {
        match self {
            ParsedCommand::DockerExec(s) => vec![s],
            ParsedCommand::Compound { segments, .. } => {
                segments.iter().flat_map(ParsedCommand::docker_exec_segments).collect()
            }
            _ => vec![],
        }
    }

    /// All regular (non-docker) segments, in order.
    pub fn regular_segments(&self) -> Vec<&str> {
        match self {
            ParsedCommand::Regular(s) => vec![s.as_str()],
            ParsedCommand::Compound { segments, .. } => {
                segments.iter().flat_map(ParsedCommand::regular_segments).collect()
            }
            _ => vec![],
        }
    }
}

/// Parse a single command line intended for a remote POSIX shell.
pub fn parse(line: &str) -> ParsedCommand {
    let top_segments = split_compound(line);
    if top_segments.len() <= 1 {
        return parse_segment(line);
    }

    let segments: Vec<ParsedCommand> = top_segments.iter().map(|s| parse_segment(s)).collect();
    let has_docker_exec = segments.iter().any(|s| matches!(s, ParsedCommand::DockerExec(_)));
    let has_regular = segments.iter().any(|s| matches!(s, ParsedCommand::Regular(_)));

    ParsedCommand::Compound {
        original: line.to_string(),
        needs_container_context: has_docker_exec && has_regular,
        segments,
    }
}

fn parse_segment(segment: &str) -> ParsedCommand {
    let trimmed = segment.trim();
    let tokens = tokenize(trimmed);

    if tokens.first().map(String::as_str) == Some("docker") {
        match tokens.get(1).map(String::as_str) {
            Some("exec") => {
                if let Some(parsed) = parse_docker_exec(trimmed, &tokens) {
                    return ParsedCommand::DockerExec(parsed);
                }
            }
            Some("run") => return ParsedCommand::DockerRun(trimmed.to_string()),
            _ => {}
        }
    }
    ParsedCommand::Regular(trimmed.to_string())
}

/// Options that take exactly one following argument, shared across
/// `docker exec` and `docker run` invocations.
const VALUE_OPTIONS: &[&str] = &["-p", "-v", "--name"];

fn parse_docker_exec(original: &str, tokens: &[String]) -> Option<DockerExecSegment> {
    let mut workdir = None;
    let mut user = None;
    let mut env = Vec::new();
    let mut flags = Vec::new();

    let mut i = 2; // skip "docker" "exec"
    while i < tokens.len() {
        let tok = tokens[i].as_str();
        match tok {
            "-w" | "--workdir" => {
                workdir = tokens.get(i + 1).cloned();
                i += 2;
            }
            "-u" | "--user" => {
                user = tokens.get(i + 1).cloned();
                i += 2;
            }
            "-e" | "--env" => {
                if let Some(kv) = tokens.get(i + 1) {
                    if let Some((k, v)) = kv.split_once('=') {
                        env.push((k.to_string(), v.to_string()));
                    }
                }
                i += 2;
            }
            t if VALUE_OPTIONS.contains(&t) => {
                i += 2;
            }
            t if t.starts_with('-') => {
                flags.push(t.to_string());
                i += 1;
            }
            _ => break,
        }
    }

    let container = tokens.get(i)?.clone();
    let inner_command = tokens[i + 1..].join(" ");

    Some(DockerExecSegment {
        original: original.to_string(),
        container,
        workdir,
        user,
        env,
        flags,
        inner_command,
    })
}

/// Tokenize a shell-ish command line, honoring single/double quotes. Falls
/// back to plain whitespace splitting (quotes left in place) if a quote is
/// never closed, per the parser's documented edge-case policy.
fn tokenize(line: &str) -> Vec<String> {
    if !quotes_balanced(line) {
        return line.split_whitespace().map(str::to_string).collect();
    }

    let mut tokens = Vec::new();
    let mut current = String::new();
    let mut in_token = false;
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => current.push(c),
            None => match c {
                '\'' | '"' => {
                    quote = Some(c);
                    in_token = true;
                }
                c if c.is_whitespace() => {
                    if in_token {
                        tokens.push(std::mem::take(&mut current));
                        in_token = false;
                    }
                }
                _ => {
                    current.push(c);
                    in_token = true;
                }
            },
        }
    }
    if in_token {
        tokens.push(current);
    }
    tokens
}

fn quotes_balanced(line: &str) -> bool {
    let mut quote: Option<char> = None;
    for c in line.chars() {
        match quote {
            Some(q) if c == q => quote = None,
            Some(_) => {}
            None if c == '\'' || c == '"' => quote = Some(c),
            None => {}
        }
    }
    quote.is_none()
}

/// Split a line into segments on unquoted `&&`, `||`, or `;`.
fn split_compound(line: &str) -> Vec<String> {
    if !quotes_balanced(line) {
        return split_on_operators_naive(line);
    }

    let chars: Vec<char> = line.chars().collect();
    let mut segments = Vec::new();
    let mut start = 0;
    let mut i = 0;
    let mut quote: Option<char> = None;

    while i < chars.len() {
        let c = chars[i];
        match quote {
            Some(q) if c == q => {
                quote = None;
                i += 1;
            }
            Some(_) => i += 1,
            None => {
                if c == '\'' || c == '"' {
                    quote = Some(c);
                    i += 1;
                } else if c == ';' {
                    segments.push(chars[start..i].iter().collect::<String>());
                    i += 1;
                    start = i;
                } else if (c == '&' || c == '|') && chars.get(i + 1) == Some(&c) {
                    segments.push(chars[start..i].iter().collect::<String>());
                    i += 2;
                    start = i;
                } else {
                    i += 1;
                }
            }
        }
    }
    segments.push(chars[start..].iter().collect::<String>());
    segments.into_iter().map(|s| s.trim().to_string()).filter(|s| !s.is_empty()).collect()
}

fn split_on_operators_naive(line: &str) -> Vec<String> {
    line.split(|c| c == ';')
        .flat_map(|s| s.split("&&"))
        .flat_map(|s| s.split("||"))
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_command_passes_through() {
        let parsed = parse("ls -la /tmp");
        assert_eq!(parsed, ParsedCommand::Regular("ls -la /tmp".into()));
    }

    #[test]
    fn docker_run_is_untouched() {
        let parsed = parse("docker run -it ubuntu bash");
        assert_eq!(parsed, ParsedCommand::DockerRun("docker run -it ubuntu bash".into()));
    }

    #[test]
    fn docker_exec_parses_workdir_user_and_container() {
        let parsed = parse("docker exec -w /srv -u www-data web ls");
        match parsed {
            ParsedCommand::DockerExec(seg) => {
                assert_eq!(seg.container, "web");
                assert_eq!(seg.workdir.as_deref(), Some("/srv"));
                assert_eq!(seg.user.as_deref(), Some("www-data"));
                assert_eq!(seg.inner_command, "ls");
            }
            other => panic!("expected DockerExec, got {other:?}"),
        }
    }

    #[test]
    fn docker_exec_collects_env_and_unknown_flags() {
        let parsed = parse("docker exec -it -e FOO=bar web printenv FOO");
        match parsed {
            ParsedCommand::DockerExec(seg) => {
                assert_eq!(seg.flags, vec!["-it".to_string()]);
                assert_eq!(seg.env, vec![("FOO".to_string(), "bar".to_string())]);
                assert_eq!(seg.inner_command, "printenv FOO");
            }
            other => panic!("expected DockerExec, got {other:?}"),
        }
    }

    #[test]
    fn compound_marks_needs_container_context() {
        let parsed = parse("docker exec -w /app api pwd && ls");
        match parsed {
            ParsedCommand::Compound { needs_container_context, segments, .. } => {
                assert!(needs_container_context);
                assert_eq!(segments.len(), 2);
            }
            other => panic!("expected Compound, got {other:?}"),
        }
    }

    #[test]
    fn compound_of_two_docker_execs_does_not_need_context() {
        let parsed = parse("docker exec a ls && docker exec b ls");
        match parsed {
            ParsedCommand::Compound { needs_container_context, .. } => {
                assert!(!needs_container_context);
            }
            other => panic!("expected Compound, got {other:?}"),
        }
    }

    #[test]
    fn unclosed_quote_falls_back_to_whitespace_tokenization() {
        let parsed = parse("docker exec web echo 'unterminated");
        match parsed {
            ParsedCommand::DockerExec(seg) => {
                assert_eq!(seg.container, "web");
                assert!(seg.inner_command.contains("unterminated"));
            }
            other => panic!("expected DockerExec, got {other:?}"),
        }
    }

    #[test]
    fn semicolon_and_pipe_operators_split_compound() {
        let segments = split_compound("echo a; echo b || echo c");
        assert_eq!(segments, vec!["echo a", "echo b", "echo c"]);
    }

    #[test]
    fn value_options_consume_following_argument() {
        let parsed = parse("docker exec -p 8080 --name ignored web ls");
        match parsed {
            ParsedCommand::DockerExec(seg) => {
                assert_eq!(seg.container, "web");
                assert_eq!(seg.inner_command, "ls");
            }
            other => panic!("expected DockerExec, got {other:?}"),
        }
    }
}
