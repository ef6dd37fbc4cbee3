//! Language descriptors (C3, spec §4.3), grounded in the prior
//! implementation's `languages.go`.
//!
//! Modeled as a tagged enum rather than a trait object: evaluation code must
//! not branch on language identity, so every branch lives here, once, behind
//! a small set of methods.

use std::os::unix::fs::PermissionsExt;
use std::path::Path;

use serde::{Deserialize, Serialize};
use strum::{Display, EnumString};

/// Used when the host process has no `PATH` of its own (e.g. invoked from a
/// stripped-down init system), mirroring Go's `exec.LookPath` fallback.
const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// Resolves `name` to an absolute path by searching `$PATH` (falling back to
/// [`DEFAULT_PATH`]), the way `exec.LookPath` does. `execve` performs no
/// `PATH` search of its own, so every compiler/interpreter invocation must be
/// resolved to an absolute path before it reaches the sandbox — the
/// resulting path stays valid inside the chroot because `/usr`, `/bin` and
/// `/sbin` are all bind-mounted in (see `sandbox/child.rs`'s `BIND_RULES`).
/// Falls back to the bare name, unresolved, if no matching file is found;
/// the resulting `execve` failure is then reported through the normal
/// stage-exec error path instead of silently miscompiling.
fn resolve_path(name: &str) -> String {
    let path_var = std::env::var("PATH").unwrap_or_else(|_| DEFAULT_PATH.to_string());
    for dir in path_var.split(':') {
        let candidate = Path::new(dir).join(name);
        if let Ok(meta) = std::fs::metadata(&candidate) {
            if meta.is_file() && meta.permissions().mode() & 0o111 != 0 {
                return candidate.to_string_lossy().into_owned();
            }
        }
    }
    name.to_string()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, EnumString, Display)]
pub enum Language {
    #[strum(serialize = "cpp")]
    Cpp,
    #[strum(serialize = "c")]
    C,
    #[strum(serialize = "java")]
    Java,
    #[strum(serialize = "pascal")]
    Pascal,
    #[strum(serialize = "python2")]
    Python2,
    #[strum(serialize = "python3")]
    Python3,
    #[strum(serialize = "javascript")]
    JavaScript,
}

impl Language {
    pub fn name(&self) -> &'static str {
        match self {
            Language::Cpp => "C++11 (g++)",
            Language::C => "C (gcc)",
            Language::Java => "Java (JDK)",
            Language::Pascal => "Pascal (fpc)",
            Language::Python2 => "Python 2",
            Language::Python3 => "Python 3",
            Language::JavaScript => "JavaScript (Node.js)",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Language::Cpp => "text/x-c++src",
            Language::C => "text/x-csrc",
            Language::Java => "text/x-java",
            Language::Pascal => "text/x-pascal",
            Language::Python2 | Language::Python3 => "text/x-python",
            Language::JavaScript => "text/javascript",
        }
    }

    pub fn source_extension(&self) -> &'static str {
        match self {
            Language::Cpp => ".cpp",
            Language::C => ".c",
            Language::Java => ".java",
            Language::Pascal => ".pas",
            Language::Python2 | Language::Python3 => ".py",
            Language::JavaScript => ".js",
        }
    }

    /// `max_processes` is left unconstrained when this is true.
    pub fn requires_multithreading(&self) -> bool {
        matches!(self, Language::Java)
    }

    /// `false` means the runtime caps memory through its own flags; the
    /// sandbox must not additionally apply the address-space rlimit.
    pub fn use_memory_limit(&self) -> bool {
        !matches!(self, Language::Java | Language::JavaScript)
    }

    /// `None` means no compilation step.
    pub fn compile_cmd(&self, sources: &[String], exe: &str) -> Option<Vec<String>> {
        match self {
            Language::Cpp => {
                let mut cmd = vec![
                    resolve_path("g++"),
                    "-DEVAL".into(),
                    "-std=c++11".into(),
                    "-O2".into(),
                    "-lm".into(),
                    "-pipe".into(),
                    "-static".into(),
                    "-s".into(),
                    "-o".into(),
                    exe.into(),
                ];
                cmd.extend_from_slice(sources);
                Some(cmd)
            }
            Language::C => {
                let mut cmd = vec![
                    resolve_path("gcc"),
                    "-DEVAL".into(),
                    "-O2".into(),
                    "-lm".into(),
                    "-pipe".into(),
                    "-static".into(),
                    "-s".into(),
                    "-o".into(),
                    exe.into(),
                ];
                cmd.extend_from_slice(sources);
                Some(cmd)
            }
            Language::Java => {
                let mut cmd = vec![
                    resolve_path("javac"),
                    "-encoding".into(),
                    "UTF-8".into(),
                    "-sourcepath".into(),
                    ".".into(),
                    "-d".into(),
                    ".".into(),
                ];
                cmd.extend_from_slice(sources);
                Some(cmd)
            }
            Language::Pascal => {
                let mut cmd = vec![
                    resolve_path("fpc"),
                    "-dEVAL".into(),
                    "-XS".into(),
                    "-Xt".into(),
                    "-O2".into(),
                    format!("-o{exe}"),
                ];
                cmd.extend_from_slice(sources);
                Some(cmd)
            }
            Language::Python2 => {
                let mut cmd = vec![resolve_path("python2"), "-m".into(), "py_compile".into()];
                cmd.extend_from_slice(sources);
                Some(cmd)
            }
            Language::Python3 => Some(vec![
                resolve_path("python3"),
                "-c".into(),
                format!(
                    "import py_compile as m; m.compile(\"{}\", \"{exe}\", doraise=True)",
                    sources[0]
                ),
            ]),
            Language::JavaScript => None,
        }
    }

    /// No language in this set drops side files into the build directory
    /// today; kept as a hook so a future language can without touching
    /// callers.
    pub fn copy_extra_files(&self, _dir: &Path) -> std::io::Result<()> {
        Ok(())
    }

    pub fn evaluate_cmd(&self, exe: &str, args: &[String], memory_limit_kb: u64) -> Vec<String> {
        let mut cmd = match self {
            Language::Cpp | Language::C | Language::Pascal => vec![format!("./{exe}")],
            Language::Java => vec![
                resolve_path("java"),
                "-Dfile.encoding=UTF-8".into(),
                "-XX:+UseSerialGC".into(),
                "-Xss64m".into(),
                format!("-Xmx{memory_limit_kb}k"),
                exe.into(),
            ],
            Language::Python2 => vec![resolve_path("python2"), format!("{exe}.pyc")],
            Language::Python3 => vec![resolve_path("python3"), exe.into()],
            Language::JavaScript => vec![
                resolve_path("node"),
                format!("--max-old-space-size={}", memory_limit_kb >> 10),
                format!("--max-new-space-size={memory_limit_kb}"),
                format!("{exe}.js"),
            ],
        };
        cmd.extend_from_slice(args);
        cmd
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn js_has_no_compile_step() {
        assert!(Language::JavaScript.compile_cmd(&[], "a").is_none());
    }

    #[test]
    fn java_and_js_skip_address_space_limit() {
        assert!(!Language::Java.use_memory_limit());
        assert!(!Language::JavaScript.use_memory_limit());
        assert!(Language::Cpp.use_memory_limit());
    }

    #[test]
    fn only_java_requires_multithreading() {
        assert!(Language::Java.requires_multithreading());
        assert!(!Language::Cpp.requires_multithreading());
    }

    #[test]
    fn cpp_compile_cmd_includes_sources() {
        let cmd = Language::Cpp
            .compile_cmd(&["main.cpp".into()], "main")
            .unwrap();
        assert!(cmd.contains(&"main.cpp".to_string()));
        assert!(cmd.contains(&"-static".to_string()));
    }

    #[test]
    fn compile_cmd_resolves_compiler_to_an_absolute_path() {
        // execve does no PATH search, so argv[0] must already be absolute.
        let cmd = Language::C.compile_cmd(&["main.c".into()], "main").unwrap();
        assert!(Path::new(&cmd[0]).is_absolute() || cmd[0] == "gcc");
    }

    #[test]
    fn resolve_path_finds_sh_on_a_normal_host() {
        // /bin/sh or /usr/bin/sh exists on every Linux box this runs on.
        let resolved = resolve_path("sh");
        assert!(resolved.ends_with("/sh"), "expected an absolute path, got {resolved}");
    }
}
