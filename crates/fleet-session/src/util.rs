use std::io;

use tokio::process::Command;

pub fn cmd_program(program: &str, args: &[String]) -> Command {
    let mut cmd = Command::new(program);
    cmd.args(args.iter().map(|s| s.as_str()));
    cmd
}

/// Send SIGTERM to the process group led by `pid`.
///
/// Returns `Ok(false)` when the group no longer exists, so terminating a
/// dead handle is a no-op. Non-positive ids are ignored.
#[cfg(unix)]
pub fn kill_group(pid: i32) -> io::Result<bool> {
    if pid <= 0 {
        return Ok(false);
    }
    let rc = unsafe { libc::killpg(pid, libc::SIGTERM) };
    if rc == 0 {
        return Ok(true);
    }
    let err = io::Error::last_os_error();
    if err.raw_os_error() == Some(libc::ESRCH) {
        Ok(false)
    } else {
        Err(err)
    }
}

#[cfg(not(unix))]
pub fn kill_group(pid: i32) -> io::Result<bool> {
    if pid <= 0 {
        return Ok(false);
    }
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "process groups are only supported on unix",
    ))
}

/// Escape `"`, `$` and `\` so `content` survives inside a double-quoted shell word.
pub fn shell_escape(content: &str) -> String {
    let mut out = String::with_capacity(content.len());
    for ch in content.chars() {
        if matches!(ch, '"' | '$' | '\\') {
            out.push('\\');
        }
        out.push(ch);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn escapes_quotes_dollars_and_backslashes() {
        assert_eq!(shell_escape(r#"a "b" $HOME \n"#), r#"a \"b\" \$HOME \\n"#);
        assert_eq!(shell_escape("plain: yaml"), "plain: yaml");
    }

    #[cfg(unix)]
    #[test]
    fn killing_missing_group_is_noop() {
        assert!(!kill_group(-1).unwrap());
        assert!(!kill_group(0).unwrap());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn kill_group_terminates_spawned_group() {
        let mut cmd = Command::new("sleep");
        cmd.arg("30").process_group(0);
        let mut child = cmd.spawn().expect("spawn sleep");
        let pid = child.id().expect("pid") as i32;

        assert!(kill_group(pid).unwrap());
        let status = child.wait().await.unwrap();
        assert!(!status.success());
    }
}
