//! Shell idioms used when a vendor lacks a native primitive.
//!
//! Paths and background commands are interpolated verbatim: a path or
//! command containing shell metacharacters (spaces, quotes, `;`) changes the
//! meaning of the generated script. Environment values and working
//! directories are quoted.

use std::borrow::Cow;

use super::error::SandboxError;
use super::types::{CommandResult, FileEntry, RunCommandOptions};

/// Detach `command` and print its pid.
pub fn background(command: &str) -> String {
    format!("nohup sh -c '{command}' > /dev/null 2>&1 & echo $!")
}

/// Apply per-command env overrides and working directory as a script prefix.
pub fn with_context(command: &str, options: &RunCommandOptions) -> String {
    let mut script = String::new();
    for (key, value) in &options.envs {
        script.push_str(&format!("export {key}={}; ", quote(value)));
    }
    if let Some(cwd) = &options.cwd {
        script.push_str(&format!("cd {} && ", quote(cwd)));
    }
    script.push_str(command);
    script
}

/// Full script for a provider that only offers "run this string in sh".
///
/// The env and cwd prefix stays outside the `nohup` wrapper so quoted values
/// never land inside its single quotes. With a cwd the wrapper is grouped so
/// `$!` is the detached shell and not a subshell running `cd`.
pub fn script_for(command: &str, options: &RunCommandOptions) -> String {
    if !options.background {
        return with_context(command, options);
    }
    let detached = background(command);
    if options.cwd.is_some() {
        with_context(&format!("{{ {detached}; }}"), options)
    } else {
        with_context(&detached, options)
    }
}

pub fn move_path(from: &str, to: &str) -> String {
    format!("mv {from} {to}")
}

pub fn make_dir(path: &str) -> String {
    format!("mkdir -p {path}")
}

pub fn remove_path(path: &str) -> String {
    format!("rm -rf {path}")
}

pub fn list_dir(path: &str) -> String {
    format!("ls -1Ap {path}")
}

pub fn read_file(path: &str) -> String {
    format!("cat {path}")
}

/// Parse `ls -1Ap` output: one name per line, directories end in `/`.
pub fn parse_listing(output: &str) -> Vec<FileEntry> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(dir) => FileEntry::directory(dir),
            None => FileEntry::file(line),
        })
        .collect()
}

/// Turn a non-zero exit of a synthesized operation into an error.
pub fn expect_success(result: CommandResult, what: &str) -> Result<String, SandboxError> {
    match result {
        CommandResult::Finished {
            exit_code: 0,
            output,
        } => Ok(output),
        CommandResult::Finished { exit_code, output } => Err(SandboxError::CommandFailed {
            code: Some(exit_code),
            stderr: format!("{what}: {}", output.trim()),
        }),
        CommandResult::Background { .. } => Err(SandboxError::Exec(format!(
            "{what}: expected a foreground result"
        ))),
    }
}

fn quote(value: &str) -> Cow<'_, str> {
    shell_escape::unix::escape(Cow::Borrowed(value))
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_wraps_with_nohup() {
        assert_eq!(
            background("sleep 30"),
            "nohup sh -c 'sleep 30' > /dev/null 2>&1 & echo $!"
        );
    }

    #[test]
    fn context_quotes_env_and_cwd() {
        let opts = RunCommandOptions::default()
            .with_cwd("/work dir")
            .with_env("GREETING", "hello world");
        assert_eq!(
            with_context("echo $GREETING", &opts),
            "export GREETING='hello world'; cd '/work dir' && echo $GREETING"
        );
    }

    #[test]
    fn context_without_options_is_identity() {
        assert_eq!(with_context("ls", &RunCommandOptions::default()), "ls");
    }

    #[test]
    fn script_for_background_keeps_context_outside_wrapper() {
        let opts = RunCommandOptions::background().with_cwd("/tmp");
        assert_eq!(
            script_for("sleep 5", &opts),
            "cd /tmp && { nohup sh -c 'sleep 5' > /dev/null 2>&1 & echo $!; }"
        );
        let opts = RunCommandOptions::background().with_env("GREETING", "hello world");
        assert_eq!(
            script_for("sleep 5", &opts),
            "export GREETING='hello world'; nohup sh -c 'sleep 5' > /dev/null 2>&1 & echo $!"
        );
    }

    #[tokio::test]
    async fn background_script_runs_under_real_sh() {
        let dir = tempfile::tempdir().unwrap();
        let cwd = dir.path().to_string_lossy().into_owned();
        let opts = RunCommandOptions::background()
            .with_cwd(cwd.as_str())
            .with_env("GREETING", "hello world");
        let script = script_for("echo \"$GREETING\" > marker", &opts);

        let out = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(&script)
            .output()
            .await
            .unwrap();
        assert!(out.status.success(), "{}", String::from_utf8_lossy(&out.stderr));
        let pid = String::from_utf8_lossy(&out.stdout);
        assert!(pid.trim().parse::<u32>().is_ok(), "{pid:?}");

        let marker = dir.path().join("marker");
        let mut content = String::new();
        for _ in 0..100 {
            content = std::fs::read_to_string(&marker).unwrap_or_default();
            if content.ends_with('\n') {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        }
        assert_eq!(content, "hello world\n");
    }

    #[test]
    fn paths_are_not_escaped() {
        assert_eq!(move_path("a b", "c"), "mv a b c");
        assert_eq!(make_dir("testdir"), "mkdir -p testdir");
    }

    #[test]
    fn listing_parses_directories() {
        let entries = parse_listing("testdir/\nnotes.txt\n\n.hidden\n");
        assert_eq!(
            entries,
            vec![
                FileEntry::directory("testdir"),
                FileEntry::file("notes.txt"),
                FileEntry::file(".hidden"),
            ]
        );
    }

    #[test]
    fn expect_success_maps_exit_codes() {
        assert_eq!(
            expect_success(CommandResult::finished(0, "ok", ""), "mv").unwrap(),
            "ok"
        );
        let err = expect_success(CommandResult::finished(1, "", "no such file\n"), "mv").unwrap_err();
        assert!(matches!(err, SandboxError::CommandFailed { code: Some(1), ref stderr } if stderr == "mv: no such file"));
    }
}
