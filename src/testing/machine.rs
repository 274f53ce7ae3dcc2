//! An in-memory machine: a path-keyed filesystem and a tiny shell that
//! understands the commands adapters and tests actually issue.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::providers::ExecOutput;
use crate::sandbox::error::SandboxError;
use crate::sandbox::types::FileEntry;

const HOME: &str = "/home/user";
const BACKGROUND_PREFIX: &str = "nohup sh -c '";
const BACKGROUND_SUFFIX: &str = "' > /dev/null 2>&1 & echo $!";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Node {
    File(String),
    Dir,
}

/// Result of one shell invocation. `sleep` is awaited by the caller after
/// releasing any lock on the machine.
#[derive(Debug)]
pub struct ShellRun {
    pub output: ExecOutput,
    pub sleep: Option<Duration>,
}

impl ShellRun {
    fn done(output: ExecOutput) -> Self {
        Self {
            output,
            sleep: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FakeMachine {
    nodes: BTreeMap<String, Node>,
    env: BTreeMap<String, String>,
    next_pid: u32,
}

impl Default for FakeMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeMachine {
    pub fn new() -> Self {
        let mut nodes = BTreeMap::new();
        for dir in ["/", "/home", HOME, "/tmp"] {
            nodes.insert(dir.to_string(), Node::Dir);
        }
        Self {
            nodes,
            env: BTreeMap::new(),
            next_pid: 1000,
        }
    }

    pub fn with_env(mut self, envs: &BTreeMap<String, String>) -> Self {
        self.env.extend(envs.iter().map(|(k, v)| (k.clone(), v.clone())));
        self
    }

    /// Replace the process environment, keeping the filesystem.
    pub fn replace_env(&mut self, envs: &BTreeMap<String, String>) {
        self.env = envs.clone();
    }

    // ── Filesystem ──────────────────────────────────────────────

    fn path(&self, path: &str) -> String {
        resolve(HOME, path)
    }

    pub fn read(&self, path: &str) -> Result<String, SandboxError> {
        match self.nodes.get(&self.path(path)) {
            Some(Node::File(content)) => Ok(content.clone()),
            Some(Node::Dir) => Err(SandboxError::Exec(format!("{path}: is a directory"))),
            None => Err(SandboxError::NotFound(path.to_string())),
        }
    }

    pub fn write(&mut self, path: &str, content: &str) -> Result<(), SandboxError> {
        let full = self.path(path);
        if let Some((parent, _)) = full.rsplit_once('/') {
            self.mkdir_abs(if parent.is_empty() { "/" } else { parent });
        }
        if self.nodes.get(&full) == Some(&Node::Dir) {
            return Err(SandboxError::Exec(format!("{path}: is a directory")));
        }
        self.nodes.insert(full, Node::File(content.to_string()));
        Ok(())
    }

    pub fn is_dir(&self, path: &str) -> Result<bool, SandboxError> {
        match self.nodes.get(&self.path(path)) {
            Some(node) => Ok(*node == Node::Dir),
            None => Err(SandboxError::NotFound(path.to_string())),
        }
    }

    pub fn exists(&self, path: &str) -> bool {
        self.nodes.contains_key(&self.path(path))
    }

    pub fn list(&self, path: &str) -> Result<Vec<FileEntry>, SandboxError> {
        let dir = self.path(path);
        match self.nodes.get(&dir) {
            Some(Node::Dir) => {}
            Some(Node::File(_)) => {
                return Err(SandboxError::Exec(format!("{path}: not a directory")));
            }
            None => return Err(SandboxError::NotFound(path.to_string())),
        }
        let prefix = if dir == "/" { "/".to_string() } else { format!("{dir}/") };
        Ok(self
            .nodes
            .iter()
            .filter_map(|(key, node)| {
                let rest = key.strip_prefix(&prefix)?;
                if rest.is_empty() || rest.contains('/') {
                    return None;
                }
                Some(match node {
                    Node::Dir => FileEntry::directory(rest),
                    Node::File(_) => FileEntry::file(rest),
                })
            })
            .collect())
    }

    pub fn mkdir_p(&mut self, path: &str) -> Result<(), SandboxError> {
        let full = self.path(path);
        if let Some(Node::File(_)) = self.nodes.get(&full) {
            return Err(SandboxError::Exec(format!("{path}: file exists")));
        }
        self.mkdir_abs(&full);
        Ok(())
    }

    fn mkdir_abs(&mut self, full: &str) {
        let mut current = String::new();
        self.nodes.insert("/".to_string(), Node::Dir);
        for part in full.split('/').filter(|p| !p.is_empty()) {
            current.push('/');
            current.push_str(part);
            self.nodes.entry(current.clone()).or_insert(Node::Dir);
        }
    }

    /// `mv` semantics: moving onto an existing directory moves inside it.
    pub fn rename(&mut self, from: &str, to: &str) -> Result<(), SandboxError> {
        let src = self.path(from);
        if !self.nodes.contains_key(&src) {
            return Err(SandboxError::NotFound(from.to_string()));
        }
        let mut dst = self.path(to);
        if self.nodes.get(&dst) == Some(&Node::Dir) {
            let name = src.rsplit('/').next().unwrap_or_default();
            dst = format!("{}/{name}", dst.trim_end_matches('/'));
        }
        let moved: Vec<(String, Node)> = self
            .nodes
            .iter()
            .filter(|(key, _)| *key == &src || key.starts_with(&format!("{src}/")))
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        for (key, _) in &moved {
            self.nodes.remove(key);
        }
        for (key, node) in moved {
            let new_key = format!("{dst}{}", &key[src.len()..]);
            self.nodes.insert(new_key, node);
        }
        Ok(())
    }

    pub fn remove(&mut self, path: &str) -> Result<(), SandboxError> {
        let full = self.path(path);
        if !self.nodes.contains_key(&full) {
            return Err(SandboxError::NotFound(path.to_string()));
        }
        let child_prefix = format!("{full}/");
        self.nodes
            .retain(|key, _| key != &full && !key.starts_with(&child_prefix));
        Ok(())
    }

    // ── Shell ───────────────────────────────────────────────────

    /// Run one shell line with the supported builtins.
    pub fn run(&mut self, line: &str, stdin: Option<&str>) -> ShellRun {
        let line = line.trim();
        let mut env = self.env.clone();
        let mut cwd = HOME.to_string();
        let mut rest = line;
        loop {
            if let Some(after) = rest.strip_prefix("export ") {
                let Some((assignment, tail)) = after.split_once("; ") else {
                    break;
                };
                if let Some((key, value)) = assignment.split_once('=') {
                    env.insert(key.to_string(), unquote(value));
                }
                rest = tail;
            } else if let Some(after) = rest.strip_prefix("cd ") {
                let Some((dir, tail)) = after.split_once(" && ") else {
                    break;
                };
                cwd = resolve(&cwd, &unquote(dir));
                rest = tail;
            } else {
                break;
            }
        }

        let grouped = rest
            .strip_prefix("{ ")
            .and_then(|r| r.strip_suffix("; }"))
            .unwrap_or(rest);
        if let Some(inner) = grouped
            .strip_prefix(BACKGROUND_PREFIX)
            .and_then(|r| r.strip_suffix(BACKGROUND_SUFFIX))
        {
            let pid = self.spawn(inner);
            return ShellRun::done(ExecOutput::new(0, format!("{pid}\n"), ""));
        }
        self.exec(rest, &cwd, &env, stdin)
    }

    /// Record a detached process and return its pid.
    pub fn spawn(&mut self, _command: &str) -> u32 {
        self.next_pid += 1;
        self.next_pid
    }

    fn exec(
        &mut self,
        command: &str,
        cwd: &str,
        env: &BTreeMap<String, String>,
        stdin: Option<&str>,
    ) -> ShellRun {
        let words: Vec<&str> = command.split_whitespace().collect();
        let at = |path: &str| resolve(cwd, path);
        let fail = |code: i32, msg: String| ShellRun::done(ExecOutput::new(code, "", msg));
        let ok = |stdout: String| ShellRun::done(ExecOutput::new(0, stdout, ""));

        match words.as_slice() {
            [] | ["true"] => ok(String::new()),
            ["exit", code] => ShellRun::done(ExecOutput::new(code.parse().unwrap_or(1), "", "")),
            ["sleep", secs] => ShellRun {
                output: ExecOutput::default(),
                sleep: Some(Duration::from_secs_f64(secs.parse().unwrap_or(0.0))),
            },
            ["echo", args @ ..] => {
                let text: Vec<String> = args.iter().map(|a| expand(&unquote(a), env)).collect();
                ok(format!("{}\n", text.join(" ")))
            }
            ["pwd"] => ok(format!("{cwd}\n")),
            ["cat", ">", path] => {
                let path = at(path);
                match self.write(&path, stdin.unwrap_or_default()) {
                    Ok(()) => ok(String::new()),
                    Err(e) => fail(1, format!("sh: {e}\n")),
                }
            }
            ["cat", path] => match self.read(&at(path)) {
                Ok(content) => ok(content),
                Err(_) => fail(1, format!("cat: {path}: No such file or directory\n")),
            },
            ["mkdir", "-p", path] => match self.mkdir_p(&at(path)) {
                Ok(()) => ok(String::new()),
                Err(e) => fail(1, format!("mkdir: {e}\n")),
            },
            ["mv", from, to] => match self.rename(&at(from), &at(to)) {
                Ok(()) => ok(String::new()),
                Err(_) => fail(1, format!("mv: cannot stat '{from}': No such file or directory\n")),
            },
            ["rm", "-rf", path] => {
                let _ = self.remove(&at(path));
                ok(String::new())
            }
            ["ls", "-1Ap", path] => match self.list(&at(path)) {
                Ok(entries) => ok(entries
                    .iter()
                    .map(|e| {
                        if e.is_dir() {
                            format!("{}/\n", e.name)
                        } else {
                            format!("{}\n", e.name)
                        }
                    })
                    .collect()),
                Err(_) => fail(2, format!("ls: cannot access '{path}': No such file or directory\n")),
            },
            [program, ..] => fail(127, format!("sh: {program}: not found\n")),
        }
    }
}

/// Normalize `path` against `cwd`, resolving `.` and `..`.
pub fn resolve(cwd: &str, path: &str) -> String {
    let joined = if path.starts_with('/') {
        path.to_string()
    } else {
        format!("{cwd}/{path}")
    };
    let mut parts: Vec<&str> = Vec::new();
    for part in joined.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

fn unquote(value: &str) -> String {
    let value = value.trim();
    for quote in ['\'', '"'] {
        if let Some(inner) = value.strip_prefix(quote).and_then(|v| v.strip_suffix(quote)) {
            return inner.to_string();
        }
    }
    value.to_string()
}

fn expand(word: &str, env: &BTreeMap<String, String>) -> String {
    match word.strip_prefix('$') {
        Some(name) => env.get(name).cloned().unwrap_or_default(),
        None => word.to_string(),
    }
}

// ── Tests ───────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_resolve_from_home() {
        assert_eq!(resolve(HOME, "a/../b"), "/home/user/b");
        assert_eq!(resolve(HOME, "/etc/./hosts"), "/etc/hosts");
    }

    #[test]
    fn shell_round_trip() {
        let mut m = FakeMachine::new();
        assert_eq!(m.run("mkdir -p testdir", None).output.exit_code, 0);
        m.write("testdir/a.txt", "hi").unwrap();
        let out = m.run("ls -1Ap testdir", None).output;
        assert_eq!(out.stdout, "a.txt\n");
        let out = m.run("ls -1Ap .", None).output;
        assert!(out.stdout.contains("testdir/\n"));
        assert_eq!(m.run("cat testdir/a.txt", None).output.stdout, "hi");
        assert_eq!(m.run("exit 3", None).output.exit_code, 3);
        assert_eq!(m.run("frobnicate", None).output.exit_code, 127);
    }

    #[test]
    fn context_prefix_applies_env_and_cwd() {
        let mut m = FakeMachine::new();
        m.write("/tmp/f", "x").unwrap();
        let out = m.run("export NAME='a b'; cd /tmp && echo $NAME", None).output;
        assert_eq!(out.stdout, "a b\n");
        assert_eq!(m.run("cd /tmp && cat f", None).output.stdout, "x");
    }

    #[test]
    fn background_returns_pid() {
        let mut m = FakeMachine::new();
        let out = m.run("nohup sh -c 'sleep 30' > /dev/null 2>&1 & echo $!", None);
        assert!(out.sleep.is_none());
        assert!(out.output.stdout.trim().parse::<u32>().unwrap() > 0);

        let out = m.run(
            "export A='x y'; cd /tmp && { nohup sh -c 'sleep 30' > /dev/null 2>&1 & echo $!; }",
            None,
        );
        assert!(out.output.stdout.trim().parse::<u32>().unwrap() > 0);
    }

    #[test]
    fn mv_into_directory() {
        let mut m = FakeMachine::new();
        m.write("a.txt", "1").unwrap();
        m.mkdir_p("d").unwrap();
        m.rename("a.txt", "d").unwrap();
        assert_eq!(m.read("d/a.txt").unwrap(), "1");
        assert!(!m.exists("a.txt"));
    }

    #[test]
    fn cat_writes_stdin() {
        let mut m = FakeMachine::new();
        assert_eq!(m.run("cat > notes.txt", Some("body")).output.exit_code, 0);
        assert_eq!(m.read("notes.txt").unwrap(), "body");
    }
}
