//! Built-in command tables.
//!
//! Command rules are matched against one normalized pipeline segment and
//! are anchored at the program name. Danger rules are matched anywhere in
//! the raw and normalized command line. Tables are tried in order; the
//! first match wins.

use crate::tier::PermissionTier;
use regex::Regex;
use std::sync::OnceLock;

// ---------------------------------------------------------------------------
// Rule types
// ---------------------------------------------------------------------------

pub struct CommandRule {
    pub id: &'static str,
    pub tier: PermissionTier,
    pub pattern: &'static str,
    /// The rule does not apply when this also matches.
    pub unless: Option<&'static str>,
}

pub struct DangerRule {
    pub id: &'static str,
    pub pattern: &'static str,
    pub reason: &'static str,
}

pub struct Compiled<R: 'static> {
    pub rule: &'static R,
    re: Regex,
    unless: Option<Regex>,
}

impl<R> Compiled<R> {
    pub fn is_match(&self, text: &str) -> bool {
        self.re.is_match(text) && !self.unless.as_ref().is_some_and(|u| u.is_match(text))
    }
}

macro_rules! cmd {
    ($id:expr, $tier:ident, $pattern:expr) => {
        CommandRule {
            id: $id,
            tier: PermissionTier::$tier,
            pattern: $pattern,
            unless: None,
        }
    };
    ($id:expr, $tier:ident, $pattern:expr, unless: $unless:expr) => {
        CommandRule {
            id: $id,
            tier: PermissionTier::$tier,
            pattern: $pattern,
            unless: Some($unless),
        }
    };
}

macro_rules! danger {
    ($id:expr, $pattern:expr, $reason:expr) => {
        DangerRule {
            id: $id,
            pattern: $pattern,
            reason: $reason,
        }
    };
}

/// `git`, any global options (`-C <dir>`, `-c k=v`, `--git-dir <dir>`, ...),
/// then the given subcommand pattern.
macro_rules! git_sub {
    ($sub:literal) => {
        concat!(
            r"\bgit(\s+(-[cC]\s+\S+|--(git-dir|work-tree|namespace|exec-path)\s+\S+|-\S+))*\s+",
            $sub
        )
    };
}

// ---------------------------------------------------------------------------
// Tables
// ---------------------------------------------------------------------------

/// Always prompt, whatever the session tier.
pub static DANGER_RULES: &[DangerRule] = &[
    danger!("sudo", r"(^|[;&|(]\s*|\s)(sudo|doas)(\s|$)", "runs with elevated privileges"),
    danger!("su", r"(^|[;&|(]\s*)su(\s|$)", "switches user"),
    danger!(
        "rm-recursive-force",
        r"\brm\s+(-\S+\s+)*(-[a-zA-Z]*[rR][a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*[rR]|-[a-zA-Z]*[rR][a-zA-Z]*\s+(-\S+\s+)*-[a-zA-Z]*f|-[a-zA-Z]*f[a-zA-Z]*\s+(-\S+\s+)*-[a-zA-Z]*[rR]|-[a-zA-Z]*[rR][a-zA-Z]*\s+(-\S+\s+)*--force|--force\s+(-\S+\s+)*-[a-zA-Z]*[rR]|-[a-zA-Z]*f[a-zA-Z]*\s+(-\S+\s+)*--recursive|--recursive\s+(-\S+\s+)*(-[a-zA-Z]*f|--force)|--force\s+(-\S+\s+)*--recursive)",
        "recursively force-deletes files"
    ),
    danger!(
        "rm-root",
        r"\brm\s+(-\S+\s+)*(/|/\*|~|~/|~/\*|\$HOME|\$HOME/\*?)(\s|$)",
        "deletes the filesystem root or home directory"
    ),
    danger!("dd-device", r"\bdd\s+.*\bof=/dev/", "writes raw data to a device"),
    danger!("mkfs", r"\bmkfs(\.\w+)?(\s|$)", "formats a filesystem"),
    danger!("partition", r"(^|\s)(fdisk|parted|sfdisk|wipefs)(\s|$)", "edits disk partitions"),
    danger!("device-write", r">\s*/dev/(sd|nvme|hd|disk)", "overwrites a block device"),
    danger!("chmod-777", r"\bchmod\s+(-\S+\s+)*0?777\b", "makes files world-writable"),
    danger!(
        "chown-root",
        r"\bchown\s+(-\S+\s+)*-[a-zA-Z]*R.*\s/(\s|$)",
        "recursively changes ownership from the root"
    ),
    danger!(
        "fork-bomb",
        r":\s*\(\s*\)\s*\{\s*:\s*\|\s*:\s*&\s*\}\s*;\s*:",
        "fork bomb"
    ),
    danger!(
        "pipe-to-shell",
        r"\b(curl|wget)\b[^|]*\|\s*(sudo\s+)?(ba|z|da|k|fi)?sh\b",
        "executes a downloaded script"
    ),
    danger!(
        "git-force-push",
        git_sub!(r"push\b.*(\s--force(-with-lease)?\b|\s-[a-zA-Z]*f\b|\s\+\S+)"),
        "rewrites remote history"
    ),
    danger!(
        "git-reset-hard",
        git_sub!(r"reset\s+(.*\s)?--hard\b"),
        "discards uncommitted work"
    ),
    danger!(
        "git-clean-force",
        git_sub!(r"clean\s+(-\S+\s+)*(-[a-zA-Z]*f|--force)"),
        "deletes untracked files"
    ),
    danger!(
        "power",
        r"(^|[;&|]\s*|\s)(shutdown|reboot|halt|poweroff)(\s|$)",
        "stops the machine"
    ),
    danger!("kill-all", r"\bkill\s+(-\S+\s+)*-1(\s|$)", "signals every process"),
];

/// Segment rules. Read-only entries double as the always-allowed list.
pub static COMMAND_RULES: &[CommandRule] = &[
    // -- read-only ---------------------------------------------------------
    cmd!(
        "read-basic",
        Off,
        r"^(ls|ll|la|dir|pwd|cd|whoami|id|hostname|uname|uptime|date|cal|echo|printf|true|false|which|whereis|type|file|stat|du|df|free|tree|wc|head|tail|cat|tac|less|more|bat|grep|egrep|fgrep|rg|ag|ack|uniq|cut|tr|column|nl|fold|diff|cmp|comm|md5sum|sha1sum|sha256sum|basename|dirname|realpath|readlink|jq|yq|ps|pgrep|lsof|man|tldr|test|printenv)(\s|$)",
        unless: r"\s--pre(=|\s|$)"
    ),
    cmd!("read-env", Off, r"^env$"),
    cmd!("read-sort", Off, r"^sort(\s|$)", unless: r"\s(-o|--output)"),
    cmd!(
        "read-find",
        Off,
        r"^(find|fd)(\s|$)",
        unless: r"\s-(exec|execdir|ok|okdir|delete|fprint|fprintf|fls|x|X)(\s|$)"
    ),
    cmd!("read-sed", Off, r"^sed\s", unless: r"\s(-[a-zA-Z]*i|--in-place)"),
    cmd!(
        "read-git",
        Off,
        r"^git\s+(status|log|diff|show|blame|shortlog|describe|rev-parse|rev-list|ls-files|ls-tree|ls-remote|cat-file|grep|reflog|whatchanged|for-each-ref|count-objects)(\s|$)",
        unless: r"\s--output(=|\s|$)"
    ),
    cmd!("read-git-branch", Off, r"^git\s+branch(\s+(-a|-r|-v|-vv|--all|--list|--show-current|--merged|--no-merged))*$"),
    cmd!("read-git-tag", Off, r"^git\s+tag(\s+(-l|--list)(\s+\S+)?)?$"),
    cmd!("read-git-remote", Off, r"^git\s+remote(\s+(-v|show\s+\S+|get-url\s+\S+))?$"),
    cmd!("read-git-stash-list", Off, r"^git\s+stash\s+(list|show)(\s|$)"),
    cmd!("read-git-config", Off, r"^git\s+config\s+(--get|--get-all|-l|--list)(\s|$)"),
    cmd!(
        "read-version",
        Off,
        r"^[A-Za-z0-9_.+\-]+\s+(--version|-V|version|--help|-h|help)$"
    ),
    cmd!("read-cargo", Off, r"^cargo\s+(tree|metadata|search|locate-project|pkgid|verify-project)(\s|$)"),
    cmd!("read-node-pm", Off, r"^(npm|pnpm|yarn|bun)\s+(ls|list|view|info|outdated|why|explain|config\s+get|bin|root|prefix)(\s|$)"),
    cmd!("read-pip", Off, r"^(pip3?|uv\s+pip)\s+(list|show|freeze|check)(\s|$)"),
    cmd!("read-docker", Off, r"^docker\s+(ps|images|logs|inspect|version|info)(\s|$)"),
    // -- safe writes ---------------------------------------------------------
    cmd!("write-files", Low, r"^(mkdir|touch|cp|mv|ln|rmdir|tee|patch|install)(\s|$)"),
    cmd!("write-rm", Low, r"^rm\s", unless: r"\s(-[a-zA-Z]*[rR]|--recursive)"),
    cmd!("write-sed-in-place", Low, r"^sed\s"),
    cmd!("write-chmod-exec", Low, r"^chmod\s+[ugoa]*\+x\s"),
    cmd!("write-archive-extract", Low, r"^(unzip|tar\s+-?[a-zA-Z]*x[a-zA-Z]*|gunzip|gzip|zip)(\s|$)"),
    cmd!(
        "write-git-stage",
        Low,
        r"^git\s+(add|mv|rm|stash(\s+(push|save|pop|apply))?|restore\s+--staged|init)(\s|$)"
    ),
    cmd!("write-git-branch", Low, r"^git\s+(checkout\s+-b|switch\s+-c|branch)\s+\S+$"),
    // -- dev commands --------------------------------------------------------
    cmd!(
        "dev-node-pm",
        Medium,
        r"^(npm|pnpm|yarn|bun)\s+(install|i|ci|add|remove|rm|uninstall|update|upgrade|up|run|run-script|test|t|exec|x|start|build|dev|lint|format|audit|init|create|link|unlink|pack|prune|dedupe|rebuild)(\s|$)"
    ),
    cmd!(
        "dev-node-script",
        Medium,
        r"^(pnpm|yarn|bun)\s+[a-z][a-z0-9:_\-]*$",
        unless: r"\s(publish|unpublish|login|logout|adduser|token|owner|deprecate|dist-tag|access|config|set)$"
    ),
    cmd!(
        "dev-npx-tools",
        Medium,
        r"^(npx|bunx|pnpx|pnpm\s+dlx)\s+(tsc|jest|vitest|eslint|prettier|playwright|mocha|ts-node|tsx|biome|next|vite)(\s|$)"
    ),
    cmd!(
        "dev-cargo",
        Medium,
        r"^cargo\s+(build|b|check|c|test|t|run|r|fmt|clippy|doc|d|bench|clean|update|add|remove|rm|fetch|install|nextest|expand|fix|init|new|generate-lockfile)(\s|$)"
    ),
    cmd!("dev-go", Medium, r"^go\s+(build|test|run|vet|fmt|mod|get|generate|install|work|env|list|clean)(\s|$)"),
    cmd!(
        "dev-python",
        Medium,
        r"^(python3?|py)\s+(-m\s+(pytest|unittest|pip|venv|black|ruff|mypy|flake8|isort|http\.server)|[^\s-]\S*\.py)(\s|$)"
    ),
    cmd!(
        "dev-python-tools",
        Medium,
        r"^((pip3?|uv|poetry|pipenv|pdm|hatch)\s+(install|uninstall|sync|add|remove|run|lock|update|venv|pip|shell|build)|pytest|ruff|black|mypy|flake8|isort|tox|nox|pyright)(\s|$)"
    ),
    cmd!(
        "dev-build-tools",
        Medium,
        r"^(make|cmake|ninja|gradle|\./gradlew|mvn|\./mvnw|bazel|bazelisk|meson|just|task|turbo|nx)(\s|$)"
    ),
    cmd!(
        "dev-js-tools",
        Medium,
        r"^(tsc|eslint|prettier|jest|vitest|mocha|deno|node|ts-node|tsx|biome|vite|webpack|esbuild|rollup)(\s|$)"
    ),
    cmd!(
        "dev-toolchains",
        Medium,
        r"^(rustc|rustup|rustfmt|gcc|g\+\+|cc|clang|clang\+\+|javac|java|kotlinc|dotnet|swift|swiftc|xcodebuild|flutter|dart|ruby|bundle|rake|rails|rspec|php|composer|mix|elixir|erlc|zig|ghc|cabal|stack)(\s|$)"
    ),
    cmd!(
        "dev-git",
        Medium,
        r"^git\s+(commit|merge|rebase|pull|fetch|checkout|switch|restore|cherry-pick|revert|stash|tag|branch|reset|worktree|submodule|clone|am|apply|bisect|notes|gc|prune)(\s|$)"
    ),
    cmd!(
        "dev-docker",
        Medium,
        r"^docker(\s+compose|-compose)?\s+(build|up|down|run|exec|start|stop|restart|pull|logs|ps)(\s|$)"
    ),
];

/// Commands allowed after a pipe in the read-only pipeline grammar.
pub static SAFE_PIPE_TARGETS: &[&str] = &[
    "grep", "egrep", "fgrep", "rg", "head", "tail", "wc", "sort", "uniq", "cut", "tr", "less",
    "more", "cat", "jq", "column", "nl", "fold",
];

/// Prefixes that only select a tool version or scheduling and are stripped
/// before classification.
pub static BUILTIN_PREFIXES: &[&str] = &[
    r"^(rbenv|pyenv|goenv|nodenv|asdf)\s+exec\s+",
    r"^mise\s+(exec|x)\s+(\S+\s+)*?--\s+",
    r"^nvm\s+exec\s+\S+\s+",
    r"^fvm\s+",
    r"^(time|command)\s+(-p\s+|--\s+)?",
    r"^nice\s+((-n\s*)?-?\d+\s+)?",
];

// ---------------------------------------------------------------------------
// Compiled accessors
// ---------------------------------------------------------------------------

static DANGER: OnceLock<Vec<Compiled<DangerRule>>> = OnceLock::new();
static COMMANDS: OnceLock<Vec<Compiled<CommandRule>>> = OnceLock::new();
static PREFIXES: OnceLock<Vec<Regex>> = OnceLock::new();

pub fn danger_rules() -> &'static [Compiled<DangerRule>] {
    DANGER.get_or_init(|| {
        DANGER_RULES
            .iter()
            .map(|rule| Compiled {
                rule,
                re: Regex::new(rule.pattern).unwrap(),
                unless: None,
            })
            .collect()
    })
}

pub fn command_rules() -> &'static [Compiled<CommandRule>] {
    COMMANDS.get_or_init(|| {
        COMMAND_RULES
            .iter()
            .map(|rule| Compiled {
                rule,
                re: Regex::new(rule.pattern).unwrap(),
                unless: rule.unless.map(|u| Regex::new(u).unwrap()),
            })
            .collect()
    })
}

pub fn builtin_prefixes() -> &'static [Regex] {
    PREFIXES.get_or_init(|| {
        BUILTIN_PREFIXES
            .iter()
            .map(|p| Regex::new(p).unwrap())
            .collect()
    })
}

/// First danger rule matching `text`.
pub fn match_danger(text: &str) -> Option<&'static DangerRule> {
    danger_rules()
        .iter()
        .find(|c| c.is_match(text))
        .map(|c| c.rule)
}

/// First command rule matching a normalized segment.
pub fn match_command(segment: &str) -> Option<&'static CommandRule> {
    command_rules()
        .iter()
        .find(|c| c.is_match(segment))
        .map(|c| c.rule)
}

pub fn is_safe_pipe_target(segment: &str) -> bool {
    let program = segment.split_whitespace().next().unwrap_or("");
    SAFE_PIPE_TARGETS.contains(&program)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
