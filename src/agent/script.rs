//! Script invocation planning.
//!
//! Decides how a script task becomes a process: interpreter from the
//! declared script type, a shebang, or content heuristics; inline command
//! vs temp script file; optional user switching via su/sudo (or
//! Start-Process on Windows).

use std::path::PathBuf;

use opsfabric_core::error::{FabricError, Result};
use opsfabric_core::protocol::TaskSpec;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScriptKind {
    Shell,
    Bash,
    Python,
    PowerShell,
    Node,
    Go,
    Perl,
}

impl ScriptKind {
    pub fn normalize(raw: &str) -> Option<ScriptKind> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "shell" | "sh" => Some(ScriptKind::Shell),
            "bash" => Some(ScriptKind::Bash),
            "python" | "py" => Some(ScriptKind::Python),
            "powershell" | "pwsh" => Some(ScriptKind::PowerShell),
            "js" | "javascript" | "node" => Some(ScriptKind::Node),
            "go" | "golang" => Some(ScriptKind::Go),
            "perl" => Some(ScriptKind::Perl),
            _ => None,
        }
    }

    fn extension(&self) -> &'static str {
        match self {
            ScriptKind::Shell | ScriptKind::Bash => "sh",
            ScriptKind::Python => "py",
            ScriptKind::PowerShell => "ps1",
            ScriptKind::Node => "js",
            ScriptKind::Go => "go",
            ScriptKind::Perl => "pl",
        }
    }

    fn interpreter(&self, script_path: &str) -> (String, Vec<String>) {
        match self {
            ScriptKind::Shell => {
                if cfg!(windows) {
                    ("sh".into(), vec![script_path.into()])
                } else {
                    ("/bin/sh".into(), vec![script_path.into()])
                }
            }
            ScriptKind::Bash => {
                if cfg!(windows) {
                    ("bash".into(), vec![script_path.into()])
                } else {
                    ("/bin/bash".into(), vec![script_path.into()])
                }
            }
            ScriptKind::Python => {
                let python = if cfg!(windows) { "python" } else { "python3" };
                (python.into(), vec![script_path.into()])
            }
            ScriptKind::PowerShell => {
                if cfg!(windows) {
                    (
                        "powershell".into(),
                        vec![
                            "-ExecutionPolicy".into(),
                            "Bypass".into(),
                            "-File".into(),
                            script_path.into(),
                        ],
                    )
                } else {
                    ("pwsh".into(), vec!["-File".into(), script_path.into()])
                }
            }
            ScriptKind::Node => ("node".into(), vec![script_path.into()]),
            ScriptKind::Go => ("go".into(), vec!["run".into(), script_path.into()]),
            ScriptKind::Perl => ("perl".into(), vec![script_path.into()]),
        }
    }
}

/// Detects the script kind from a shebang line or content features.
pub fn detect_kind(content: &str) -> ScriptKind {
    let content = content.trim_start();

    if let Some(first_line) = content.lines().next() {
        if let Some(shebang) = first_line.strip_prefix("#!") {
            let shebang = shebang.to_ascii_lowercase();
            if shebang.contains("python") {
                return ScriptKind::Python;
            }
            if shebang.contains("perl") {
                return ScriptKind::Perl;
            }
            if shebang.contains("node") {
                return ScriptKind::Node;
            }
            if shebang.contains("pwsh") || shebang.contains("powershell") {
                return ScriptKind::PowerShell;
            }
            if shebang.contains("bash") {
                return ScriptKind::Bash;
            }
            if shebang.contains("sh") {
                return ScriptKind::Shell;
            }
        }
    }

    if content.contains("import ") || content.contains("def ") || content.contains("print(") {
        return ScriptKind::Python;
    }
    if content.contains('$') && content.contains("Get-") {
        return ScriptKind::PowerShell;
    }
    if content.contains("use strict") || content.contains("use warnings") {
        return ScriptKind::Perl;
    }
    if content.contains("console.log") || content.contains("require(") {
        return ScriptKind::Node;
    }
    if content.contains("package main") && content.contains("func main") {
        return ScriptKind::Go;
    }
    ScriptKind::Shell
}

/// A temp script file removed when the invocation is done.
#[derive(Debug)]
pub struct TempScript {
    pub path: PathBuf,
}

impl Drop for TempScript {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Fully planned process start.
#[derive(Debug)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    /// Kept alive for the duration of the run; dropping deletes the file.
    pub temp_script: Option<TempScript>,
}

/// Plans the process for a script task.
pub fn plan_invocation(task: &TaskSpec, temp_dir: &std::path::Path) -> Result<Invocation> {
    if task.command.is_empty() {
        if task.args.is_empty() {
            return Err(FabricError::invalid_param("task command is empty"));
        }
        let (program, args) = wrap_run_as(
            task.args[0].clone(),
            task.args[1..].to_vec(),
            &task.run_as,
        );
        return Ok(Invocation {
            program,
            args,
            temp_script: None,
        });
    }

    let declared = ScriptKind::normalize(&task.script_type);
    let is_one_liner = !task.command.contains('\n') && task.command.len() < 100;

    // Short shell one-liners run inline; anything else goes through a temp
    // script file so multi-line content and other interpreters work.
    if is_one_liner && matches!(declared, None | Some(ScriptKind::Shell) | Some(ScriptKind::Bash)) {
        let (program, args) = if cfg!(windows) {
            ("cmd".to_string(), vec!["/C".to_string(), task.command.clone()])
        } else {
            (
                "/bin/sh".to_string(),
                vec!["-c".to_string(), task.command.clone()],
            )
        };
        let (program, args) = wrap_run_as(program, args, &task.run_as);
        return Ok(Invocation {
            program,
            args,
            temp_script: None,
        });
    }

    let kind = declared.unwrap_or_else(|| detect_kind(&task.command));
    let script = write_temp_script(task, kind, temp_dir)?;
    let script_path = script.path.to_string_lossy().into_owned();
    let (program, args) = kind.interpreter(&script_path);
    let (program, args) = wrap_run_as(program, args, &task.run_as);

    Ok(Invocation {
        program,
        args,
        temp_script: Some(script),
    })
}

fn write_temp_script(
    task: &TaskSpec,
    kind: ScriptKind,
    temp_dir: &std::path::Path,
) -> Result<TempScript> {
    std::fs::create_dir_all(temp_dir).map_err(|e| FabricError::FileWrite {
        message: format!("create script dir: {e}"),
    })?;
    let path = temp_dir.join(format!(
        "script_{}_{}.{}",
        sanitize(&task.id),
        chrono::Utc::now().timestamp_millis(),
        kind.extension()
    ));
    std::fs::write(&path, &task.command).map_err(|e| FabricError::FileWrite {
        message: format!("write script file: {e}"),
    })?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let _ = std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755));
    }

    Ok(TempScript { path })
}

fn sanitize(id: &str) -> String {
    id.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '-' })
        .collect()
}

/// Wraps an invocation to run as another user. Root uses `su - user -c`,
/// non-root `sudo -u`; Windows goes through Start-Process.
fn wrap_run_as(program: String, args: Vec<String>, run_as: &str) -> (String, Vec<String>) {
    if run_as.is_empty() || current_user().as_deref() == Some(run_as) {
        return (program, args);
    }

    if cfg!(windows) {
        let arg_list = args
            .iter()
            .map(|a| format!("\"{}\"", a.replace('"', "`\"")))
            .collect::<Vec<_>>()
            .join(",");
        let ps = format!(
            "$cred = Get-Credential -UserName \"{run_as}\" -Message \"Enter password\"; \
             Start-Process -FilePath \"{program}\" -ArgumentList {arg_list} -Credential $cred -NoNewWindow -Wait"
        );
        return (
            "powershell".into(),
            vec![
                "-NoLogo".into(),
                "-NonInteractive".into(),
                "-ExecutionPolicy".into(),
                "Bypass".into(),
                "-Command".into(),
                ps,
            ],
        );
    }

    if is_root() {
        let mut cmdline = shell_quote(&program);
        for arg in &args {
            cmdline.push(' ');
            cmdline.push_str(&shell_quote(arg));
        }
        (
            "su".into(),
            vec!["-".into(), run_as.into(), "-c".into(), cmdline],
        )
    } else {
        let mut sudo_args = vec!["-u".to_string(), run_as.to_string(), program];
        sudo_args.extend(args);
        ("sudo".into(), sudo_args)
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', "'\"'\"'"))
}

fn current_user() -> Option<String> {
    std::env::var("USER").ok().filter(|u| !u.is_empty())
}

fn is_root() -> bool {
    #[cfg(unix)]
    {
        use std::os::unix::fs::MetadataExt;
        std::fs::metadata("/proc/self")
            .map(|m| m.uid() == 0)
            .unwrap_or_else(|_| current_user().as_deref() == Some("root"))
    }
    #[cfg(not(unix))]
    {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn script_task(command: &str, script_type: &str) -> TaskSpec {
        TaskSpec {
            id: "exec1_step1_1_x".into(),
            name: "t".into(),
            task_type: Default::default(),
            command: command.into(),
            script_type: script_type.into(),
            args: vec![],
            env: HashMap::new(),
            timeout_sec: 0,
            work_dir: String::new(),
            run_as: String::new(),
            file_transfer: None,
        }
    }

    #[test]
    fn test_normalize_aliases() {
        assert_eq!(ScriptKind::normalize("py"), Some(ScriptKind::Python));
        assert_eq!(ScriptKind::normalize("pwsh"), Some(ScriptKind::PowerShell));
        assert_eq!(ScriptKind::normalize("javascript"), Some(ScriptKind::Node));
        assert_eq!(ScriptKind::normalize("golang"), Some(ScriptKind::Go));
        assert_eq!(ScriptKind::normalize("unknown"), None);
    }

    #[test]
    fn test_detect_shebang_wins() {
        assert_eq!(detect_kind("#!/usr/bin/env python3\nprint(1)"), ScriptKind::Python);
        assert_eq!(detect_kind("#!/bin/bash\nls"), ScriptKind::Bash);
        assert_eq!(detect_kind("#!/usr/bin/perl\n"), ScriptKind::Perl);
    }

    #[test]
    fn test_detect_content_heuristics() {
        assert_eq!(detect_kind("import os\nos.getcwd()"), ScriptKind::Python);
        assert_eq!(detect_kind("console.log('x')"), ScriptKind::Node);
        assert_eq!(
            detect_kind("package main\nfunc main() {}"),
            ScriptKind::Go
        );
        assert_eq!(detect_kind("echo hello"), ScriptKind::Shell);
    }

    #[test]
    fn test_one_liner_runs_inline() {
        let dir = tempfile::tempdir().unwrap();
        let inv = plan_invocation(&script_task("echo hello", ""), dir.path()).unwrap();
        assert!(inv.temp_script.is_none());
        #[cfg(unix)]
        {
            assert_eq!(inv.program, "/bin/sh");
            assert_eq!(inv.args, vec!["-c", "echo hello"]);
        }
    }

    #[test]
    fn test_multiline_goes_through_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let inv = plan_invocation(
            &script_task("import sys\nprint(sys.argv)", "python"),
            dir.path(),
        )
        .unwrap();
        let script = inv.temp_script.as_ref().expect("temp script");
        assert!(script.path.exists());
        assert!(script.path.extension().unwrap().eq("py"));

        let path = script.path.clone();
        drop(inv);
        assert!(!path.exists(), "temp script removed on drop");
    }

    #[test]
    fn test_empty_task_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(plan_invocation(&script_task("", ""), dir.path()).is_err());
    }
}
