//! Parsing of inference output into submission artifacts.
//!
//! Backends produce free-form text with fenced code blocks. Three things are
//! pulled out of it: pip packages (from `pip install` lines in shell blocks),
//! apt packages (from `apt-get install` lines in shell blocks), and the
//! script body (first `python` block).

use regex::Regex;

/// Extracts packages and the script body from fenced markdown blocks.
pub struct SubmissionExtractor {
    shell_block: Regex,
    python_block: Regex,
}

impl Default for SubmissionExtractor {
    fn default() -> Self {
        Self::new()
    }
}

impl SubmissionExtractor {
    pub fn new() -> Self {
        SubmissionExtractor {
            // Untagged blocks count as shell, matching common model output.
            shell_block: Regex::new(r"(?si)```(?:bash|sh|shell)?\s*\n(.*?)\n```")
                .expect("shell block regex"),
            python_block: Regex::new(r"(?s)```python\s*\n(.*?)\n```").expect("python block regex"),
        }
    }

    /// Interpreter packages named by `pip install` commands across all shell
    /// blocks, deduplicated in first-seen order.
    pub fn extract_interpreter_packages(&self, response: &str) -> Vec<String> {
        let mut packages = Vec::new();
        for block in self.shell_blocks(response) {
            for line in block.lines() {
                if !line.contains("pip install") && !line.contains("pip3 install") {
                    continue;
                }
                // pip self-upgrades are bootstrap noise, not dependencies.
                if line.contains("--upgrade pip") {
                    continue;
                }
                push_unique(&mut packages, pip_packages_in_line(line));
            }
        }
        packages
    }

    /// OS packages named by `apt-get install` commands across all shell
    /// blocks, deduplicated in first-seen order.
    pub fn extract_os_packages(&self, response: &str) -> Vec<String> {
        let mut packages = Vec::new();
        for block in self.shell_blocks(response) {
            push_unique(&mut packages, os_packages_in_command(&block));
        }
        packages
    }

    /// The first `python` block, trimmed. `None` means the submission is
    /// invalid (no script was produced).
    pub fn extract_script(&self, response: &str) -> Option<String> {
        self.python_block
            .captures(response)
            .map(|c| c[1].trim().to_string())
            .filter(|s| !s.is_empty())
    }

    fn shell_blocks(&self, response: &str) -> Vec<String> {
        self.shell_block
            .captures_iter(response)
            .map(|c| c[1].to_string())
            .collect()
    }
}

/// Parse every `apt-get install` line of a shell command for its package
/// arguments. Also used to intercept the agent's sandbox commands.
pub fn os_packages_in_command(command: &str) -> Vec<String> {
    let mut packages = Vec::new();
    for line in command.lines() {
        if !(line.contains("apt-get") || line.contains("apt ")) || !line.contains("install") {
            continue;
        }
        push_unique(&mut packages, install_args(line, &["apt-get", "apt"]));
    }
    packages
}

fn pip_packages_in_line(line: &str) -> Vec<String> {
    install_args(line, &["pip", "pip3"])
        .into_iter()
        .filter(|pkg| pkg != "pip")
        .collect()
}

/// Tokenise a command line and collect the arguments of
/// `<manager> install ...`, dropping flags and stopping at shell operators.
fn install_args(line: &str, managers: &[&str]) -> Vec<String> {
    let Some(tokens) = shlex::split(line) else {
        return Vec::new();
    };

    let mut args = Vec::new();
    let mut iter = tokens.iter().peekable();
    while let Some(token) = iter.next() {
        let name = token.rsplit('/').next().unwrap_or(token);
        if !managers.contains(&name) {
            continue;
        }
        // Skip the manager's own flags before the subcommand.
        let mut subcommand = None;
        for candidate in iter.by_ref() {
            if candidate.starts_with('-') {
                continue;
            }
            subcommand = Some(candidate.as_str());
            break;
        }
        if subcommand != Some("install") {
            continue;
        }
        for arg in iter.by_ref() {
            if matches!(arg.as_str(), "&&" | "||" | ";" | "|") {
                break;
            }
            if arg.starts_with('-') {
                continue;
            }
            args.push(arg.clone());
        }
    }
    args
}

fn push_unique(into: &mut Vec<String>, items: Vec<String>) {
    for item in items {
        if !into.contains(&item) {
            into.push(item);
        }
    }
}

// ---------- Unit tests ----------

#[cfg(test)]
mod tests {
    use super::*;

    const RESPONSE: &str = r#"Here is my solution.

```bash
# System packages
sudo apt-get update && sudo apt-get install -y ffmpeg libsm6
```

```bash
pip install --upgrade pip
pip install pandas numpy
pip3 install requests pandas
```

```python
import pandas as pd
print("ANSWER=42")
```

```python
print("second block is ignored")
```
"#;

    #[test]
    fn extracts_pip_packages_in_first_seen_order() {
        let extractor = SubmissionExtractor::new();
        let packages = extractor.extract_interpreter_packages(RESPONSE);
        assert_eq!(packages, vec!["pandas", "numpy", "requests"]);
    }

    #[test]
    fn extracts_apt_packages_dropping_flags() {
        let extractor = SubmissionExtractor::new();
        let packages = extractor.extract_os_packages(RESPONSE);
        assert_eq!(packages, vec!["ffmpeg", "libsm6"]);
    }

    #[test]
    fn extracts_first_python_block_only() {
        let extractor = SubmissionExtractor::new();
        let script = extractor.extract_script(RESPONSE).expect("script");
        assert!(script.starts_with("import pandas"));
        assert!(script.contains("ANSWER=42"));
        assert!(!script.contains("second block"));
    }

    #[test]
    fn empty_response_yields_empty_artifacts() {
        let extractor = SubmissionExtractor::new();
        assert!(extractor.extract_interpreter_packages("").is_empty());
        assert!(extractor.extract_os_packages("").is_empty());
        assert!(extractor.extract_script("").is_none());
    }

    #[test]
    fn untagged_shell_blocks_are_scanned() {
        let text = "```\npip install rich\n```\n";
        let extractor = SubmissionExtractor::new();
        assert_eq!(extractor.extract_interpreter_packages(text), vec!["rich"]);
    }

    #[test]
    fn pip_upgrade_lines_are_ignored() {
        let text = "```bash\npip install --upgrade pip\n```\n";
        let extractor = SubmissionExtractor::new();
        assert!(extractor.extract_interpreter_packages(text).is_empty());
    }

    #[test]
    fn install_stops_at_shell_operators() {
        let text = "```bash\nsudo apt-get install -y sqlite3 && echo done\n```\n";
        let extractor = SubmissionExtractor::new();
        assert_eq!(extractor.extract_os_packages(text), vec!["sqlite3"]);
    }

    #[test]
    fn os_packages_in_command_sees_multiline_commands() {
        let command = "cd /tmp\nsudo apt-get update\nsudo apt-get install -y jq curl\n";
        assert_eq!(os_packages_in_command(command), vec!["jq", "curl"]);
    }

    #[test]
    fn render_then_extract_round_trips() {
        let script = "print('ANSWER=7')";
        let rendered = format!(
            "```bash\nsudo apt-get install -y {apt}\n```\n\n```bash\npip install {pip}\n```\n\n```python\n{script}\n```\n",
            apt = "ffmpeg",
            pip = "numpy pandas",
        );
        let extractor = SubmissionExtractor::new();
        assert_eq!(extractor.extract_script(&rendered).as_deref(), Some(script));
        assert_eq!(extractor.extract_os_packages(&rendered), vec!["ffmpeg"]);
        assert_eq!(
            extractor.extract_interpreter_packages(&rendered),
            vec!["numpy", "pandas"]
        );
    }
}
