use anyhow::Context as _;
use anyhow::Result;
use anyhow::bail;
use bstr::BString;
use bstr::ByteSlice as _;
use std::path::Path;
use std::process::Command;

/// Runs `git` inside `repo_dir`.
pub fn git_command(repo_dir: &Path) -> Command {
    let mut cmd = Command::new("git");
    cmd.current_dir(repo_dir);
    cmd
}

pub trait CommandExtension {
    /// Runs the command and checks the exit status, reporting stderr content
    /// in the error message on failure.
    fn checked_output(&mut self) -> Result<std::process::Output>;
}

impl CommandExtension for Command {
    fn checked_output(&mut self) -> Result<std::process::Output> {
        let output = self
            .output()
            .with_context(|| format!("Failed to run {:?}", self.get_program()))?;
        if !output.status.success() {
            let stderr = output.stderr.to_str_lossy();
            let stderr = stderr.trim_end();
            if stderr.is_empty() {
                bail!("{:?}: {}", self, output.status);
            } else if !stderr.contains('\n') {
                bail!("{:?}: {}: {stderr}", self, output.status);
            } else {
                bail!("{:?}: {}:\n{stderr}", self, output.status);
            }
        }
        Ok(output)
    }
}

/// Removes trailing LF or CRLF from a string.
///
/// # Examples
/// ```
/// use svn2git::util::trim_newline_suffix;
///
/// assert_eq!(trim_newline_suffix("foo"), "foo");
/// assert_eq!(trim_newline_suffix("foo\n"), "foo");
/// assert_eq!(trim_newline_suffix("foo\r\n"), "foo");
/// assert_eq!(trim_newline_suffix("foo\nbar\n"), "foo\nbar");
/// ```
pub fn trim_newline_suffix(line: &str) -> &str {
    let Some(line) = line.strip_suffix('\n') else {
        return line;
    };
    let Some(line) = line.strip_suffix('\r') else {
        return line;
    };
    line
}

/// Appends a final LF unless the message already ends with one.
pub fn ensure_trailing_newline(mut msg: BString) -> BString {
    if msg.last() != Some(&b'\n') {
        msg.push(b'\n');
    }
    msg
}

/// File names derived from a repository name, with `/` flattened so that
/// sub-grouped repository names stay single path components.
pub fn safe_file_name(name: &str) -> String {
    name.replace('/', "_")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_safe_file_name() {
        assert_eq!(safe_file_name("freebsd-base.git"), "freebsd-base.git");
        assert_eq!(safe_file_name("group/repo.git"), "group_repo.git");
    }

    #[test]
    fn test_ensure_trailing_newline() {
        assert_eq!(ensure_trailing_newline("x".into()), BString::from("x\n"));
        assert_eq!(ensure_trailing_newline("x\n".into()), BString::from("x\n"));
        assert_eq!(ensure_trailing_newline("".into()), BString::from("\n"));
    }

    #[test]
    fn test_checked_output_reports_stderr() {
        let err = Command::new("sh")
            .args(["-c", "echo oops >&2; exit 3"])
            .checked_output()
            .unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("oops"), "{msg}");
    }
}
