//! Resolution of module `SRC[:DST]` rules into concrete source/destination paths.
//!
//! `SRC` may be a glob and is resolved relative to the modules directory.
//! `DST` is an absolute path inside the container root; it may be omitted
//! (mirror the source path), end in `/` (a directory), or reuse the single
//! `*` of `SRC` to rename each match.

use std::collections::BTreeMap;
use std::sync::LazyLock;

use camino::{Utf8Component, Utf8Path, Utf8PathBuf};
use regex::Regex;

use crate::{HookEnv, HookLog};

/// Matches `$NAME` and `${NAME}`.
static ENV_VAR: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\$(\w+|\{[^}]*\})").expect("valid regex"));

/// A rule which cannot be resolved.  These are logged and the rule is skipped.
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub(crate) enum RuleError {
    #[error("Destination in pattern must be an absolute path.\n\tdestination: {0}")]
    RelativeDestination(String),
    #[error(
        "Using glob '*' in destination requires exactly one glob '*' in source.\n\tsource: {src}\n\tdestination: {dest}"
    )]
    GlobMismatch { src: String, dest: String },
}

/// The literal text on either side of the single `*` in a source pattern.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct GlobCapture {
    prefix: String,
    suffix: String,
}

impl GlobCapture {
    /// Returns `None` unless `pattern` contains exactly one `*`.
    pub(crate) fn new(pattern: &str) -> Option<Self> {
        let (prefix, suffix) = pattern.split_once('*')?;
        if suffix.contains('*') {
            return None;
        }
        Some(Self {
            prefix: prefix.to_owned(),
            suffix: suffix.to_owned(),
        })
    }

    /// The part of `path` which the `*` matched.
    pub(crate) fn extract<'a>(&self, path: &'a str) -> &'a str {
        let s = path.strip_prefix(self.prefix.as_str()).unwrap_or(path);
        if self.suffix.is_empty() {
            s
        } else {
            s.strip_suffix(self.suffix.as_str()).unwrap_or(s)
        }
    }
}

/// How a destination path is computed for each matched source.
///
/// Chosen once per rule by [`Destination::select`] and then applied to
/// every source path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Destination {
    /// No destination given; the source path is mirrored under the root.
    Mirror,
    /// The destination reuses the source glob and ends in `/`; the source
    /// keeps its file name inside that directory.
    GlobDir { pattern: String, capture: GlobCapture },
    /// The destination reuses the source glob and names the target exactly.
    GlobExact { pattern: String, capture: GlobCapture },
    /// Several sources matched; the destination is a directory and each
    /// source keeps its path relative to the matches' common ancestor.
    MultiMatchDir { dir: String, common: Utf8PathBuf },
    /// A single source copied into the destination directory.
    SingleMatchDir { dir: String },
    /// The destination names the target exactly.
    Exact { path: String },
}

impl Destination {
    /// Pick the destination shape for a rule.  `capture` is present exactly
    /// when the destination contains a `*`.
    pub(crate) fn select(
        dest: &str,
        capture: Option<GlobCapture>,
        matches: &[Utf8PathBuf],
    ) -> Self {
        let is_dir = dest.ends_with('/');
        match capture {
            _ if dest.is_empty() => Destination::Mirror,
            Some(capture) if is_dir => Destination::GlobDir {
                pattern: dest.to_owned(),
                capture,
            },
            Some(capture) => Destination::GlobExact {
                pattern: dest.to_owned(),
                capture,
            },
            None if matches.len() > 1 => Destination::MultiMatchDir {
                dir: dest.to_owned(),
                common: common_path(matches),
            },
            None if is_dir => Destination::SingleMatchDir {
                dir: dest.to_owned(),
            },
            None => Destination::Exact {
                path: dest.to_owned(),
            },
        }
    }

    /// The destination for `src` inside `root`.
    pub(crate) fn apply(&self, root: &Utf8Path, src: &Utf8Path) -> Utf8PathBuf {
        let name = src.file_name().unwrap_or_default();
        let p = match self {
            Destination::Mirror => root.join(relative(src.as_str())),
            Destination::GlobDir { pattern, capture } => root
                .join(relative(&pattern.replace('*', capture.extract(src.as_str()))))
                .join(name),
            Destination::GlobExact { pattern, capture } => {
                root.join(relative(&pattern.replace('*', capture.extract(src.as_str()))))
            }
            Destination::MultiMatchDir { dir, common } => {
                let rel = src.strip_prefix(common).unwrap_or(Utf8Path::new(name));
                root.join(relative(dir)).join(rel)
            }
            Destination::SingleMatchDir { dir } => root.join(relative(dir)).join(name),
            Destination::Exact { path } => root.join(relative(path)),
        };
        normalize(&p)
    }
}

/// Resolve `rule` into a map of absolute source path to absolute destination
/// path under `root`.  Relative sources are taken relative to `module_dir`,
/// and `$VAR`/`~` are expanded from `env`.
///
/// Invalid rules are logged and produce an empty map.  The only I/O is
/// expanding the source glob.
pub fn resolve(
    rule: &str,
    root: &Utf8Path,
    module_dir: &Utf8Path,
    env: &HookEnv,
    log: &HookLog,
) -> BTreeMap<Utf8PathBuf, Utf8PathBuf> {
    match resolve_inner(rule, root, module_dir, env, log) {
        Ok(r) => r,
        Err(e) => {
            log.line(format_args!("Error: {e}"));
            BTreeMap::new()
        }
    }
}

fn resolve_inner(
    rule: &str,
    root: &Utf8Path,
    module_dir: &Utf8Path,
    env: &HookEnv,
    log: &HookLog,
) -> Result<BTreeMap<Utf8PathBuf, Utf8PathBuf>, RuleError> {
    let (src, dest) = rule.split_once(':').unwrap_or((rule, ""));
    let src = expand_user(&expand_vars(src, env), env);
    let dest = expand_user(&expand_vars(dest, env), env);

    let src = absolutize(&module_dir.join(src));

    if !dest.is_empty() && !dest.starts_with('/') {
        return Err(RuleError::RelativeDestination(dest));
    }
    let capture = if dest.contains('*') {
        let c = GlobCapture::new(src.as_str()).ok_or_else(|| RuleError::GlobMismatch {
            src: src.to_string(),
            dest: dest.clone(),
        })?;
        Some(c)
    } else {
        None
    };

    let matches = glob_paths(src.as_str(), log);
    let destination = Destination::select(&dest, capture, &matches);
    Ok(matches
        .into_iter()
        .map(|s| {
            let d = destination.apply(root, &s);
            (s, d)
        })
        .collect())
}

/// Expand a glob pattern.  Like the shell, `*` does not match a leading `.`.
fn glob_paths(pattern: &str, log: &HookLog) -> Vec<Utf8PathBuf> {
    let opts = glob::MatchOptions {
        case_sensitive: true,
        require_literal_separator: true,
        require_literal_leading_dot: true,
    };
    let paths = match glob::glob_with(pattern, opts) {
        Ok(p) => p,
        Err(e) => {
            log.line(format_args!("Invalid pattern {pattern}: {e}"));
            return Vec::new();
        }
    };
    let mut r = Vec::new();
    for p in paths {
        match p.map(Utf8PathBuf::from_path_buf) {
            Ok(Ok(p)) => r.push(p),
            Ok(Err(p)) => log.line(format_args!("Skipping non-UTF-8 path {}", p.display())),
            Err(e) => log.line(format_args!("Failed to expand {pattern}: {e}")),
        }
    }
    r.sort();
    r
}

/// Replace `$NAME` and `${NAME}` with values from `env`; unknown
/// variables are left untouched.
pub(crate) fn expand_vars(s: &str, env: &HookEnv) -> String {
    ENV_VAR
        .replace_all(s, |caps: &regex::Captures| {
            let name = &caps[1];
            let name = name
                .strip_prefix('{')
                .and_then(|n| n.strip_suffix('}'))
                .unwrap_or(name);
            env.get(name)
                .cloned()
                .unwrap_or_else(|| caps[0].to_owned())
        })
        .into_owned()
}

/// Replace a leading `~` with `$HOME`.
pub(crate) fn expand_user(s: &str, env: &HookEnv) -> String {
    let Some(rest) = s.strip_prefix('~') else {
        return s.to_owned();
    };
    if !(rest.is_empty() || rest.starts_with('/')) {
        return s.to_owned();
    }
    match env.get("HOME") {
        Some(home) => format!("{}{rest}", home.trim_end_matches('/')),
        None => s.to_owned(),
    }
}

/// Strip leading separators so the path can be joined under a root.
fn relative(p: &str) -> &str {
    p.trim_start_matches('/')
}

/// Make `p` absolute against the current directory and normalize it.
fn absolutize(p: &Utf8Path) -> Utf8PathBuf {
    if p.is_absolute() {
        return normalize(p);
    }
    let cwd = std::env::current_dir()
        .ok()
        .and_then(|c| Utf8PathBuf::from_path_buf(c).ok())
        .unwrap_or_else(|| Utf8PathBuf::from("/"));
    normalize(&cwd.join(p))
}

/// Lexically normalize a path: drop `.` components and fold `..`.
/// Symbolic links are not resolved.
pub(crate) fn normalize(p: &Utf8Path) -> Utf8PathBuf {
    let mut r = Utf8PathBuf::new();
    for c in p.components() {
        match c {
            Utf8Component::CurDir => {}
            Utf8Component::ParentDir => {
                let can_pop = matches!(r.components().next_back(), Some(Utf8Component::Normal(_)));
                if can_pop {
                    r.pop();
                } else if !r.has_root() {
                    r.push("..");
                }
            }
            o => r.push(o.as_str()),
        }
    }
    if r.as_str().is_empty() {
        r.push(".");
    }
    r
}

/// The longest common ancestor of `paths`, compared by component.
fn common_path(paths: &[Utf8PathBuf]) -> Utf8PathBuf {
    let Some((first, rest)) = paths.split_first() else {
        return Utf8PathBuf::new();
    };
    let mut common: Vec<Utf8Component> = first.components().collect();
    for p in rest {
        let n = common
            .iter()
            .zip(p.components())
            .take_while(|(a, b)| *a == b)
            .count();
        common.truncate(n);
    }
    common.iter().map(|c| c.as_str()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    struct Fixture {
        _td: tempfile::TempDir,
        base: Utf8PathBuf,
        root: Utf8PathBuf,
    }

    fn fixture(files: &[&str]) -> Fixture {
        let td = tempfile::tempdir().unwrap();
        let base = Utf8Path::from_path(td.path()).unwrap().to_owned();
        let root = base.join("root");
        fs::create_dir(&root).unwrap();
        for f in files {
            let p = base.join(f);
            fs::create_dir_all(p.parent().unwrap()).unwrap();
            fs::write(&p, f).unwrap();
        }
        Fixture {
            _td: td,
            base,
            root,
        }
    }

    fn run(fx: &Fixture, rule: &str) -> BTreeMap<Utf8PathBuf, Utf8PathBuf> {
        let mut env = HookEnv::new();
        env.insert("BASE".into(), fx.base.to_string());
        resolve(rule, &fx.root, &fx.base, &env, &HookLog::disabled())
    }

    fn expected(pairs: &[(Utf8PathBuf, Utf8PathBuf)]) -> BTreeMap<Utf8PathBuf, Utf8PathBuf> {
        pairs.iter().cloned().collect()
    }

    #[test]
    fn test_glob_capture() {
        let c = GlobCapture::new("/mods/*.conf").unwrap();
        assert_eq!(c.extract("/mods/a.conf"), "a");
        let c = GlobCapture::new("/mods/lib*").unwrap();
        assert_eq!(c.extract("/mods/libfoo.so"), "foo.so");
        assert!(GlobCapture::new("/mods/*/*.conf").is_none());
        assert!(GlobCapture::new("/mods/a.conf").is_none());
    }

    #[test]
    fn test_select() {
        let one = [Utf8PathBuf::from("/a/x")];
        let two = [Utf8PathBuf::from("/a/x"), Utf8PathBuf::from("/a/b/y")];
        assert_eq!(Destination::select("", None, &two), Destination::Mirror);
        let c = GlobCapture::new("/a/*").unwrap();
        assert!(matches!(
            Destination::select("/b/*/", Some(c.clone()), &one),
            Destination::GlobDir { .. }
        ));
        assert!(matches!(
            Destination::select("/b/*", Some(c), &two),
            Destination::GlobExact { .. }
        ));
        assert_eq!(
            Destination::select("/b", None, &two),
            Destination::MultiMatchDir {
                dir: "/b".into(),
                common: "/a".into()
            }
        );
        assert_eq!(
            Destination::select("/b/", None, &one),
            Destination::SingleMatchDir { dir: "/b/".into() }
        );
        assert_eq!(
            Destination::select("/b", None, &one),
            Destination::Exact { path: "/b".into() }
        );
    }

    #[test]
    fn test_apply() {
        let root = Utf8Path::new("/run/root");
        let src = Utf8Path::new("/mods/a.conf");
        let cases = [
            (Destination::Mirror, "/run/root/mods/a.conf"),
            (
                Destination::GlobDir {
                    pattern: "/etc/*/".into(),
                    capture: GlobCapture::new("/mods/*.conf").unwrap(),
                },
                "/run/root/etc/a/a.conf",
            ),
            (
                Destination::MultiMatchDir {
                    dir: "/opt".into(),
                    common: "/".into(),
                },
                "/run/root/opt/mods/a.conf",
            ),
            (
                Destination::SingleMatchDir { dir: "/etc/".into() },
                "/run/root/etc/a.conf",
            ),
            (
                Destination::Exact {
                    path: "/etc/./x/../b.conf".into(),
                },
                "/run/root/etc/b.conf",
            ),
        ];
        for (d, want) in cases {
            assert_eq!(d.apply(root, src), want, "{d:?}");
        }
    }

    #[test]
    fn test_glob_substitution() {
        let fx = fixture(&["mods/a.conf", "mods/b.conf", "mods/c.txt"]);
        let r = run(&fx, "$BASE/mods/*.conf:/etc/*.conf");
        similar_asserts::assert_eq!(
            r,
            expected(&[
                (fx.base.join("mods/a.conf"), fx.root.join("etc/a.conf")),
                (fx.base.join("mods/b.conf"), fx.root.join("etc/b.conf")),
            ])
        );
    }

    #[test]
    fn test_mirror_relative_source() {
        let fx = fixture(&["lib/libfoo.so"]);
        let r = run(&fx, "lib/libfoo.so");
        let src = fx.base.join("lib/libfoo.so");
        let want = fx.root.join(src.as_str().trim_start_matches('/'));
        similar_asserts::assert_eq!(r, expected(&[(src, want)]));
    }

    #[test]
    fn test_multi_match_directory() {
        let fx = fixture(&["share/a/one", "share/b/two"]);
        let r = run(&fx, "share/*/*:/opt/share");
        similar_asserts::assert_eq!(
            r,
            expected(&[
                (fx.base.join("share/a/one"), fx.root.join("opt/share/a/one")),
                (fx.base.join("share/b/two"), fx.root.join("opt/share/b/two")),
            ])
        );
    }

    #[test]
    fn test_single_match() {
        let fx = fixture(&["etc/motd"]);
        let r = run(&fx, "etc/motd:/etc/");
        similar_asserts::assert_eq!(
            r,
            expected(&[(fx.base.join("etc/motd"), fx.root.join("etc/motd"))])
        );
        let r = run(&fx, "etc/motd:/etc/issue");
        similar_asserts::assert_eq!(
            r,
            expected(&[(fx.base.join("etc/motd"), fx.root.join("etc/issue"))])
        );
    }

    #[test]
    fn test_glob_directory_destination() {
        let fx = fixture(&["mods/a.conf"]);
        let r = run(&fx, "mods/*.conf:/etc/*.d/");
        similar_asserts::assert_eq!(
            r,
            expected(&[(fx.base.join("mods/a.conf"), fx.root.join("etc/a.d/a.conf"))])
        );
    }

    #[test]
    fn test_invalid_rules() {
        let fx = fixture(&["mods/a.conf", "mods/b/c.conf"]);
        // Relative destination
        assert!(run(&fx, "mods/a.conf:etc/a.conf").is_empty());
        // Destination glob without exactly one source glob
        assert!(run(&fx, "mods/a.conf:/etc/*").is_empty());
        assert!(run(&fx, "mods/*/*.conf:/etc/*").is_empty());
        // No matches
        assert!(run(&fx, "mods/nothing:/etc/").is_empty());
    }

    #[test]
    fn test_invalid_rule_is_logged() {
        let fx = fixture(&[]);
        let logpath = fx.base.join("log");
        let log = HookLog::open(&logpath).unwrap();
        let r = resolve("/x:rel", &fx.root, &fx.base, &HookEnv::new(), &log);
        assert!(r.is_empty());
        drop(log);
        let logged = fs::read_to_string(&logpath).unwrap();
        assert!(logged.contains("must be an absolute path"), "{logged}");
    }

    #[test]
    fn test_expand() {
        let mut env = HookEnv::new();
        env.insert("HOME".into(), "/home/user/".into());
        env.insert("SITE".into(), "/opt/site".into());
        assert_eq!(expand_vars("$SITE/lib", &env), "/opt/site/lib");
        assert_eq!(expand_vars("${SITE}lib", &env), "/opt/sitelib");
        assert_eq!(expand_vars("$UNSET/lib", &env), "$UNSET/lib");
        assert_eq!(expand_user("~/x", &env), "/home/user/x");
        assert_eq!(expand_user("~", &env), "/home/user");
        assert_eq!(expand_user("~other/x", &env), "~other/x");
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize(Utf8Path::new("/a/./b/../c/")), "/a/c");
        assert_eq!(normalize(Utf8Path::new("/../a")), "/a");
        assert_eq!(normalize(Utf8Path::new("a/../../b")), "../b");
    }

    #[test]
    fn test_common_path() {
        let paths = [
            Utf8PathBuf::from("/usr/lib/a.so"),
            Utf8PathBuf::from("/usr/lib64/b.so"),
        ];
        assert_eq!(common_path(&paths), "/usr");
        assert_eq!(common_path(&paths[..1]), "/usr/lib/a.so");
    }
}
