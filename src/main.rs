use chrono::{DateTime, SecondsFormat, Utc};
use clap::{Parser, Subcommand};
use dialoguer::theme::ColorfulTheme;
use dialoguer::Confirm;
use dirs::home_dir;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::collections::BTreeMap;
use std::env;
use std::fs;
use std::io;
use std::io::IsTerminal;
use std::io::Read;
#[cfg(unix)]
use std::os::unix::fs::symlink;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use thiserror::Error;

const DEFAULT_CONFIG_YAML: &str = include_str!("../config/default.yaml");
const SHIM_MARKER: &str = "# schoolcode managed shim v1";
const PROFILE_BLOCK_BEGIN: &str = "# >>> schoolcode managed >>>";
const PROFILE_BLOCK_END: &str = "# <<< schoolcode managed <<<";
const RESTORE_INCOMPLETE_FLAG: &str = ".RESTORE_INCOMPLETE";
const LOCK_FILE_NAME: &str = "install.lock";
const VERSION_MARKER_NAME: &str = "version";
const AUDIT_FILE_NAME: &str = "last-run.json";
const RULES_FILE_NAME: &str = "rules.yaml";
const SESSION_HOOK_NAME: &str = "session-start.sh";
const BLOCK_REASON: &str = "system-wide modification not permitted";
const ELEVATION_REASON: &str = "privilege elevation is not permitted for the restricted account";

#[derive(Parser, Debug)]
#[command(name = "schoolcode", version, about = "SchoolCode guest toolset CLI")]
struct Cli {
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[arg(long, global = true)]
    json: bool,
    #[arg(long, global = true)]
    quiet: bool,
    #[arg(long, global = true)]
    verbose: bool,
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
    Install {
        #[arg(long)]
        prefix: Option<PathBuf>,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        force: bool,
        #[arg(long, default_value_t = false)]
        no_backup: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
    Repair {
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    Status {
        #[arg(long, default_value_t = false)]
        strict: bool,
    },
    Update {
        #[arg(long, default_value_t = false)]
        check: bool,
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
    },
    Uninstall {
        #[arg(long, default_value_t = false)]
        yes: bool,
        #[arg(long, default_value_t = false)]
        dry_run: bool,
        #[arg(long, default_value_t = false)]
        remove_config: bool,
        #[arg(long, default_value_t = false)]
        force: bool,
    },
    Backup {
        #[command(subcommand)]
        command: BackupCommand,
    },
    Shim {
        #[command(subcommand)]
        command: ShimCommand,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommand {
    Init,
    Validate,
}

#[derive(Subcommand, Debug)]
enum BackupCommand {
    List,
    Prune,
    Restore {
        #[arg(long)]
        to: Option<String>,
        #[arg(long, default_value_t = false)]
        yes: bool,
    },
}

#[derive(Subcommand, Debug)]
enum ShimCommand {
    List,
    #[command(hide = true)]
    Exec {
        tool: String,
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        argv: Vec<String>,
    },
}

#[derive(Debug, Error)]
enum SchoolcodeError {
    #[error("config error: {0}")]
    Config(String),
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("prompt error: {0}")]
    Prompt(#[from] dialoguer::Error),
    #[error("yaml error: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("process error: {0}")]
    Process(String),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("blocked: {tool}: {reason}")]
    Rejected { tool: String, reason: String },
}

#[derive(Debug, Serialize)]
struct JsonResult<T: Serialize> {
    ok: bool,
    result: Option<T>,
    error: Option<String>,
}

#[derive(Debug, Clone)]
struct Context {
    config_path: PathBuf,
    json: bool,
    quiet: bool,
    verbose: bool,
    log_file: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();
    let ctx = build_context(&cli);
    let runner = HostRunner;
    let lookup = PathLookup;
    let identity_source = HostIdentitySource;

    let result = match cli.command {
        Commands::Config { command } => handle_config(&ctx, command),
        Commands::Install {
            prefix,
            dry_run,
            force,
            no_backup,
            yes,
        } => handle_install(
            &ctx,
            InstallOptions {
                prefix,
                dry_run,
                force,
                no_backup,
                assume_yes: yes,
            },
            &runner,
            &lookup,
        ),
        Commands::Repair { dry_run } => handle_repair(&ctx, dry_run, &runner, &lookup),
        Commands::Status { strict } => handle_status(&ctx, strict, &runner, &lookup),
        Commands::Update {
            check,
            yes,
            dry_run,
        } => handle_update(&ctx, check, yes, dry_run, &runner, &lookup),
        Commands::Uninstall {
            yes,
            dry_run,
            remove_config,
            force,
        } => handle_uninstall(&ctx, yes, dry_run, remove_config, force),
        Commands::Backup { command } => handle_backup(&ctx, command),
        Commands::Shim { command } => handle_shim(&ctx, command, &lookup, &identity_source),
    };

    if let Err(err) = result {
        if ctx.json {
            let payload = JsonResult::<serde_json::Value> {
                ok: false,
                result: None,
                error: Some(err.to_string()),
            };
            let _ = print_json(&payload);
        } else {
            eprintln!("{err}");
        }
        std::process::exit(1);
    }
}

fn build_context(cli: &Cli) -> Context {
    let config_path = cli
        .config
        .clone()
        .unwrap_or_else(|| default_config_dir().join("config.yaml"));
    Context {
        config_path,
        json: cli.json,
        quiet: cli.quiet,
        verbose: cli.verbose,
        log_file: cli.log_file.clone(),
    }
}

fn default_config_dir() -> PathBuf {
    if let Ok(path) = env::var("SCHOOLCODE_CONFIG_DIR") {
        return PathBuf::from(path);
    }
    let mut base = home_dir().unwrap_or_else(|| PathBuf::from("."));
    base.push(".config");
    base.push("schoolcode");
    base
}

fn ensure_parent(path: &Path) -> Result<(), SchoolcodeError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    Ok(())
}

fn expand_path(input: &str) -> String {
    if let Some(stripped) = input.strip_prefix("~/") {
        if let Some(home) = home_dir() {
            return home.join(stripped).to_string_lossy().to_string();
        }
    }
    input.to_string()
}

fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn output(ctx: &Context, payload: serde_json::Value) -> Result<(), SchoolcodeError> {
    if ctx.json {
        let wrapper = JsonResult {
            ok: true,
            result: Some(payload),
            error: None,
        };
        print_json(&wrapper)?;
    } else if !ctx.quiet {
        println!("{payload}");
    }
    Ok(())
}

fn print_json<T: Serialize>(payload: &T) -> Result<(), SchoolcodeError> {
    let text = serde_json::to_string_pretty(payload)?;
    println!("{text}");
    Ok(())
}

fn info(ctx: &Context, message: &str) {
    if !ctx.json && !ctx.quiet {
        println!("{message}");
    }
}

fn trace(ctx: &Context, message: &str) {
    if ctx.verbose && !ctx.json && !ctx.quiet {
        println!("{message}");
    }
}

fn resolve_log_path(ctx: &Context, cfg: &Config, layout: &PrefixLayout) -> PathBuf {
    if let Some(path) = &ctx.log_file {
        return path.clone();
    }
    let configured = cfg.paths.log_file.trim();
    if !configured.is_empty() {
        return PathBuf::from(expand_path(configured));
    }
    layout.state_dir.join("schoolcode.log")
}

// Best-effort append; the log sink must never take a command down with it.
fn log_event(path: &Path, line: &str) {
    if ensure_parent(path).is_err() {
        return;
    }
    let entry = format!("{} {}\n", now_rfc3339(), line);
    let _ = fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .and_then(|mut file| io::Write::write_all(&mut file, entry.as_bytes()));
}

fn confirm(prompt: &str, assume_yes: bool) -> Result<bool, SchoolcodeError> {
    if assume_yes {
        return Ok(true);
    }
    if !io::stdin().is_terminal() {
        return Ok(false);
    }
    let answer = Confirm::with_theme(&ColorfulTheme::default())
        .with_prompt(prompt)
        .default(false)
        .interact()?;
    Ok(answer)
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Config {
    version: u32,
    paths: Paths,
    policy: PolicyConfig,
    thresholds: Thresholds,
    network: NetworkConfig,
    acquisition: AcquisitionConfig,
    backups: BackupRetention,
    repair: RepairConfig,
    tools: BTreeMap<String, ToolSpec>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Paths {
    prefix: String,
    log_file: String,
    profile_files: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct PolicyConfig {
    restricted_user: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct Thresholds {
    disk_critical_mb: u64,
    disk_comfort_mb: u64,
    os_minimum: String,
    os_recommended: String,
    os_legacy_trust_baseline: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct NetworkConfig {
    endpoints: Vec<String>,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct AcquisitionConfig {
    attempts: u32,
    timeout_secs: u64,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct BackupRetention {
    max_count: usize,
    max_age_days: u32,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct RepairConfig {
    trust_command: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
#[serde(default, deny_unknown_fields)]
struct ToolSpec {
    kind: ToolKind,
    bin: String,
    candidates: Vec<String>,
    acquire_commands: Vec<String>,
    user_scope_flags: Vec<String>,
    rules: Vec<RuleSpec>,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum ToolKind {
    PackageManager,
    DepInstaller,
    Interpreter,
    Utility,
    Elevation,
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
struct RuleSpec {
    subcommand: Option<String>,
    action: RuleAction,
    applies_to: RuleScope,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum RuleAction {
    Allow,
    Block,
    RewriteUserScope,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
enum RuleScope {
    RestrictedOnly,
    All,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            version: 1,
            paths: Paths::default(),
            policy: PolicyConfig::default(),
            thresholds: Thresholds::default(),
            network: NetworkConfig::default(),
            acquisition: AcquisitionConfig::default(),
            backups: BackupRetention::default(),
            repair: RepairConfig::default(),
            tools: default_tools(),
        }
    }
}

impl Default for Paths {
    fn default() -> Self {
        Self {
            prefix: "~/.schoolcode".to_string(),
            log_file: String::new(),
            profile_files: Vec::new(),
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            restricted_user: "Guest".to_string(),
        }
    }
}

impl Default for Thresholds {
    fn default() -> Self {
        Self {
            disk_critical_mb: 1024,
            disk_comfort_mb: 5120,
            os_minimum: "12.0".to_string(),
            os_recommended: "13.0".to_string(),
            os_legacy_trust_baseline: "13.0".to_string(),
        }
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            timeout_secs: 10,
        }
    }
}

impl Default for AcquisitionConfig {
    fn default() -> Self {
        Self {
            attempts: 2,
            timeout_secs: 300,
        }
    }
}

impl Default for BackupRetention {
    fn default() -> Self {
        Self {
            max_count: 5,
            max_age_days: 30,
        }
    }
}

impl Default for RepairConfig {
    fn default() -> Self {
        Self {
            trust_command: Vec::new(),
        }
    }
}

impl Default for ToolSpec {
    fn default() -> Self {
        Self {
            kind: ToolKind::Utility,
            bin: String::new(),
            candidates: Vec::new(),
            acquire_commands: Vec::new(),
            user_scope_flags: Vec::new(),
            rules: Vec::new(),
        }
    }
}

impl Default for RuleSpec {
    fn default() -> Self {
        Self {
            subcommand: None,
            action: RuleAction::Allow,
            applies_to: RuleScope::All,
        }
    }
}

impl ToolSpec {
    fn bin_name<'a>(&'a self, tool: &'a str) -> &'a str {
        if self.bin.trim().is_empty() {
            tool
        } else {
            self.bin.trim()
        }
    }
}

fn rule(subcommand: Option<&str>, action: RuleAction, applies_to: RuleScope) -> RuleSpec {
    RuleSpec {
        subcommand: subcommand.map(|s| s.to_string()),
        action,
        applies_to,
    }
}

fn default_tools() -> BTreeMap<String, ToolSpec> {
    let mut tools = BTreeMap::new();
    tools.insert(
        "brew".to_string(),
        ToolSpec {
            kind: ToolKind::PackageManager,
            candidates: vec![
                "/opt/homebrew/bin/brew".to_string(),
                "/usr/local/bin/brew".to_string(),
            ],
            acquire_commands: vec![
                "/bin/bash -c \"$(curl -fsSL https://raw.githubusercontent.com/Homebrew/install/HEAD/install.sh)\"".to_string(),
            ],
            rules: vec![
                rule(Some("install"), RuleAction::Block, RuleScope::RestrictedOnly),
                rule(Some("uninstall"), RuleAction::Block, RuleScope::RestrictedOnly),
                rule(Some("upgrade"), RuleAction::Block, RuleScope::RestrictedOnly),
                rule(Some("tap"), RuleAction::Block, RuleScope::RestrictedOnly),
                rule(None, RuleAction::Allow, RuleScope::All),
            ],
            ..ToolSpec::default()
        },
    );
    tools.insert(
        "pip3".to_string(),
        ToolSpec {
            kind: ToolKind::DepInstaller,
            candidates: vec![
                "/opt/homebrew/bin/pip3".to_string(),
                "/usr/local/bin/pip3".to_string(),
                "/usr/bin/pip3".to_string(),
            ],
            acquire_commands: vec!["python3 -m ensurepip --user".to_string()],
            user_scope_flags: vec!["--user".to_string()],
            rules: vec![
                rule(
                    Some("install"),
                    RuleAction::RewriteUserScope,
                    RuleScope::RestrictedOnly,
                ),
                rule(None, RuleAction::Allow, RuleScope::All),
            ],
            ..ToolSpec::default()
        },
    );
    tools.insert(
        "python3".to_string(),
        ToolSpec {
            kind: ToolKind::Interpreter,
            candidates: vec![
                "/opt/homebrew/bin/python3".to_string(),
                "/usr/local/bin/python3".to_string(),
                "/usr/bin/python3".to_string(),
            ],
            rules: vec![rule(None, RuleAction::Allow, RuleScope::All)],
            ..ToolSpec::default()
        },
    );
    tools.insert(
        "git".to_string(),
        ToolSpec {
            kind: ToolKind::Utility,
            candidates: vec![
                "/opt/homebrew/bin/git".to_string(),
                "/usr/bin/git".to_string(),
            ],
            rules: vec![rule(None, RuleAction::Allow, RuleScope::All)],
            ..ToolSpec::default()
        },
    );
    tools.insert(
        "sudo".to_string(),
        ToolSpec {
            kind: ToolKind::Elevation,
            candidates: vec!["/usr/bin/sudo".to_string()],
            rules: vec![rule(None, RuleAction::Allow, RuleScope::All)],
            ..ToolSpec::default()
        },
    );
    tools
}

fn read_config_from_str(content: &str) -> Result<Config, SchoolcodeError> {
    let cfg: Config = serde_yaml::from_str(content)?;
    validate_config(&cfg)?;
    Ok(cfg)
}

fn read_config(path: &Path) -> Result<Config, SchoolcodeError> {
    if !path.exists() {
        return read_config_from_str(DEFAULT_CONFIG_YAML);
    }
    let content = fs::read_to_string(path)?;
    read_config_from_str(&content)
}

fn validate_config(cfg: &Config) -> Result<(), SchoolcodeError> {
    if cfg.version != 1 {
        return Err(SchoolcodeError::Config(format!(
            "unsupported config version {}; expected 1",
            cfg.version
        )));
    }
    if cfg.paths.prefix.trim().is_empty() {
        return Err(SchoolcodeError::Config(
            "paths.prefix must be non-empty".to_string(),
        ));
    }
    if cfg.policy.restricted_user.trim().is_empty() {
        return Err(SchoolcodeError::Config(
            "policy.restricted_user must be non-empty".to_string(),
        ));
    }
    if cfg.thresholds.disk_critical_mb > cfg.thresholds.disk_comfort_mb {
        return Err(SchoolcodeError::Config(
            "thresholds.disk_critical_mb must not exceed disk_comfort_mb".to_string(),
        ));
    }
    if cfg.acquisition.attempts == 0 {
        return Err(SchoolcodeError::Config(
            "acquisition.attempts must be greater than 0".to_string(),
        ));
    }
    if cfg.network.timeout_secs == 0 {
        return Err(SchoolcodeError::Config(
            "network.timeout_secs must be greater than 0".to_string(),
        ));
    }
    if cfg.tools.is_empty() {
        return Err(SchoolcodeError::Config(
            "config.tools must contain at least one tool".to_string(),
        ));
    }
    for (name, spec) in &cfg.tools {
        if spec.rules.is_empty() {
            return Err(SchoolcodeError::Config(format!(
                "tools.{name}.rules must contain at least one rule"
            )));
        }
        let needs_flags = spec
            .rules
            .iter()
            .any(|r| r.action == RuleAction::RewriteUserScope);
        if needs_flags && spec.user_scope_flags.is_empty() {
            return Err(SchoolcodeError::Config(format!(
                "tools.{name} has a rewrite_user_scope rule but no user_scope_flags"
            )));
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct PrefixLayout {
    root: PathBuf,
    bin_dir: PathBuf,
    shims_dir: PathBuf,
    policy_dir: PathBuf,
    hooks_dir: PathBuf,
    backups_dir: PathBuf,
    state_dir: PathBuf,
    rules_path: PathBuf,
    hook_path: PathBuf,
    version_path: PathBuf,
    lock_path: PathBuf,
    audit_path: PathBuf,
}

fn prefix_layout(root: &Path) -> PrefixLayout {
    let bin_dir = root.join("bin");
    let shims_dir = root.join("shims");
    let policy_dir = root.join("policy");
    let hooks_dir = root.join("hooks");
    let backups_dir = root.join("backups");
    let state_dir = root.join("state");
    PrefixLayout {
        root: root.to_path_buf(),
        rules_path: policy_dir.join(RULES_FILE_NAME),
        hook_path: hooks_dir.join(SESSION_HOOK_NAME),
        version_path: state_dir.join(VERSION_MARKER_NAME),
        lock_path: state_dir.join(LOCK_FILE_NAME),
        audit_path: state_dir.join(AUDIT_FILE_NAME),
        bin_dir,
        shims_dir,
        policy_dir,
        hooks_dir,
        backups_dir,
        state_dir,
    }
}

fn resolve_prefix(cfg: &Config, override_path: Option<&PathBuf>) -> PathBuf {
    if let Some(path) = override_path {
        return path.clone();
    }
    PathBuf::from(expand_path(&cfg.paths.prefix))
}

fn resolve_profile_files(cfg: &Config) -> Vec<PathBuf> {
    if !cfg.paths.profile_files.is_empty() {
        return cfg
            .paths
            .profile_files
            .iter()
            .map(|p| PathBuf::from(expand_path(p)))
            .collect();
    }
    let home = home_dir().unwrap_or_else(|| PathBuf::from("."));
    vec![home.join(".zprofile"), home.join(".bash_profile")]
}

#[derive(Debug, Clone)]
struct CommandOutput {
    status_code: i32,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
}

impl CommandOutput {
    fn success(&self) -> bool {
        self.status_code == 0
    }

    fn stdout_text(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }
}

trait CommandRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error>;
}

struct HostRunner;

impl CommandRunner for HostRunner {
    fn run(
        &self,
        program: &str,
        args: &[String],
        timeout: Option<Duration>,
    ) -> Result<CommandOutput, io::Error> {
        let mut cmd = Command::new(program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        let Some(limit) = timeout else {
            let output = cmd.output()?;
            let status_code =
                output
                    .status
                    .code()
                    .unwrap_or(if output.status.success() { 0 } else { 1 });
            return Ok(CommandOutput {
                status_code,
                stdout: output.stdout,
                stderr: output.stderr,
            });
        };
        let mut child = cmd.spawn()?;
        let deadline = Instant::now() + limit;
        loop {
            if child.try_wait()?.is_some() {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill();
                let _ = child.wait();
                return Ok(CommandOutput {
                    status_code: 124,
                    stdout: Vec::new(),
                    stderr: format!("timed out after {}s", limit.as_secs()).into_bytes(),
                });
            }
            std::thread::sleep(Duration::from_millis(50));
        }
        let mut stdout = Vec::new();
        let mut stderr = Vec::new();
        if let Some(mut pipe) = child.stdout.take() {
            let _ = pipe.read_to_end(&mut stdout);
        }
        if let Some(mut pipe) = child.stderr.take() {
            let _ = pipe.read_to_end(&mut stderr);
        }
        let status = child.wait()?;
        let status_code = status.code().unwrap_or(if status.success() { 0 } else { 1 });
        Ok(CommandOutput {
            status_code,
            stdout,
            stderr,
        })
    }
}

fn run_shell(
    runner: &dyn CommandRunner,
    command: &str,
    timeout: Option<Duration>,
) -> Result<CommandOutput, io::Error> {
    runner.run("/bin/sh", &["-c".to_string(), command.to_string()], timeout)
}

trait ExecLookup {
    fn which(&self, name: &str) -> Option<PathBuf>;
}

struct PathLookup;

impl ExecLookup for PathLookup {
    fn which(&self, name: &str) -> Option<PathBuf> {
        which::which(name).ok()
    }
}

#[derive(Debug, Clone, Serialize)]
struct Identity {
    effective_user: String,
    console_user: Option<String>,
    is_elevated: bool,
    restricted: bool,
}

trait IdentitySource {
    fn effective_user(&self) -> Option<String>;
    fn effective_uid(&self) -> Option<u32>;
    fn console_user(&self) -> Option<String>;
    fn env_user_hint(&self) -> Option<String>;
}

struct HostIdentitySource;

fn command_stdout_line(program: &str, args: &[&str]) -> Option<String> {
    let output = Command::new(program).args(args).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout).trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

impl IdentitySource for HostIdentitySource {
    fn effective_user(&self) -> Option<String> {
        command_stdout_line("id", &["-un"])
    }

    fn effective_uid(&self) -> Option<u32> {
        command_stdout_line("id", &["-u"]).and_then(|text| text.parse().ok())
    }

    // Owner of the console device: set by the login session, not by the
    // calling process's environment.
    fn console_user(&self) -> Option<String> {
        if env::consts::OS == "macos" {
            return command_stdout_line("stat", &["-f", "%Su", "/dev/console"]);
        }
        command_stdout_line("stat", &["-c", "%U", "/dev/console"])
    }

    fn env_user_hint(&self) -> Option<String> {
        env::var("USER").ok().filter(|value| !value.is_empty())
    }
}

// Conservative merge: the caller is treated as restricted if any signal says
// so. The env hint can only add restriction, never lift it, because the
// calling process fully controls its own environment.
fn resolve_identity(
    restricted_user: &str,
    source: &dyn IdentitySource,
) -> Result<Identity, SchoolcodeError> {
    let effective_user = source.effective_user().ok_or_else(|| {
        SchoolcodeError::Process("unable to resolve the effective user".to_string())
    })?;
    let console_user = source.console_user();
    let is_elevated = source.effective_uid() == Some(0);
    let restricted = effective_user == restricted_user
        || console_user.as_deref() == Some(restricted_user)
        || source.env_user_hint().as_deref() == Some(restricted_user);
    Ok(Identity {
        effective_user,
        console_user,
        is_elevated,
        restricted,
    })
}

fn write_atomic_text_file(
    path: &Path,
    content: &str,
    mode: Option<u32>,
) -> Result<(), SchoolcodeError> {
    ensure_parent(path)?;
    let parent = path.parent().unwrap_or_else(|| Path::new("."));
    let pid = std::process::id();
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis();
    let tmp_path = parent.join(format!(
        ".{}.tmp.{}.{}",
        path.file_name()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_else(|| "schoolcode".to_string()),
        pid,
        ts
    ));
    fs::write(&tmp_path, content)?;
    #[cfg(unix)]
    if let Some(mode) = mode {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&tmp_path, fs::Permissions::from_mode(mode))?;
    }
    fs::rename(&tmp_path, path)?;
    Ok(())
}

fn force_symlink(target: &Path, link_path: &Path) -> Result<(), SchoolcodeError> {
    ensure_parent(link_path)?;
    match fs::symlink_metadata(link_path) {
        Ok(meta) => {
            if meta.file_type().is_symlink() || meta.file_type().is_file() {
                fs::remove_file(link_path)?;
            } else {
                return Err(SchoolcodeError::Process(format!(
                    "refusing to replace directory with symlink: {}",
                    link_path.display()
                )));
            }
        }
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => return Err(SchoolcodeError::Io(err)),
    }
    #[cfg(unix)]
    {
        symlink(target, link_path)?;
        return Ok(());
    }
    #[allow(unreachable_code)]
    Err(SchoolcodeError::Config(
        "managed tool links are only supported on unix hosts".to_string(),
    ))
}

fn path_exists(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_path(path: &Path) -> Result<bool, SchoolcodeError> {
    let meta = match fs::symlink_metadata(path) {
        Ok(meta) => meta,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(SchoolcodeError::Io(err)),
    };
    let file_type = meta.file_type();
    if file_type.is_symlink() || file_type.is_file() {
        fs::remove_file(path)?;
    } else if file_type.is_dir() {
        fs::remove_dir_all(path)?;
    } else {
        fs::remove_file(path)?;
    }
    Ok(true)
}

fn prune_empty_dir(path: &Path) {
    let _ = fs::remove_dir(path);
}

#[cfg(unix)]
fn is_executable_file(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable_file(path: &Path) -> bool {
    fs::metadata(path).map(|meta| meta.is_file()).unwrap_or(false)
}

fn is_managed_shim(path: &Path) -> bool {
    fs::read_to_string(path)
        .map(|body| body.contains(SHIM_MARKER))
        .unwrap_or(false)
}

// Ordered-candidate resolution: explicit known install locations first, then
// a generic PATH lookup. Broken candidates and schoolcode's own shims are
// skipped so a stale managed link never shadows the real tool.
fn resolve_tool_executable(
    tool: &str,
    spec: &ToolSpec,
    shims_dir: &Path,
    lookup: &dyn ExecLookup,
) -> Option<PathBuf> {
    let usable = |path: &Path| -> bool {
        let resolved = fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf());
        if resolved.starts_with(shims_dir) {
            return false;
        }
        is_executable_file(&resolved) && !is_managed_shim(&resolved)
    };
    for candidate in &spec.candidates {
        let path = PathBuf::from(expand_path(candidate));
        if usable(&path) {
            return Some(path);
        }
    }
    let found = lookup.which(spec.bin_name(tool))?;
    if usable(&found) {
        Some(found)
    } else {
        None
    }
}

fn shim_script(exe: &Path, tool: &str) -> String {
    format!(
        "#!/usr/bin/env bash\n{marker}\nset -euo pipefail\nexec \"{exe}\" shim exec {tool} -- \"$@\"\n",
        marker = SHIM_MARKER,
        exe = exe.display(),
        tool = tool
    )
}

#[cfg(unix)]
fn write_shim(path: &Path, exe: &Path, tool: &str) -> Result<(), SchoolcodeError> {
    use std::os::unix::fs::PermissionsExt;
    ensure_parent(path)?;
    let body = shim_script(exe, tool);
    write_atomic_text_file(path, &body, Some(0o755))?;
    fs::set_permissions(path, fs::Permissions::from_mode(0o755))?;
    Ok(())
}

#[cfg(not(unix))]
fn write_shim(_path: &Path, _exe: &Path, _tool: &str) -> Result<(), SchoolcodeError> {
    Err(SchoolcodeError::Config(
        "shim generation is only supported on unix hosts".to_string(),
    ))
}

fn session_hook_script(layout: &PrefixLayout) -> String {
    format!(
        "#!/usr/bin/env bash\n{marker}\n# Invoked by the guest session bootstrap hook. Safe to run repeatedly.\nset -euo pipefail\nif [ ! -f \"{version}\" ]; then\n  exit 0\nfi\ncase \":$PATH:\" in\n  *\":{shims}:\"*) ;;\n  *) export PATH=\"{shims}:{bin}:$PATH\" ;;\nesac\n",
        marker = SHIM_MARKER,
        version = layout.version_path.display(),
        shims = layout.shims_dir.display(),
        bin = layout.bin_dir.display()
    )
}

#[derive(Debug, Deserialize, Serialize, Clone, PartialEq)]
struct PolicyRule {
    tool: String,
    #[serde(default)]
    subcommand: Option<String>,
    action: RuleAction,
    applies_to: RuleScope,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    scope_flags: Vec<String>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct PolicyRuleSet {
    version: u32,
    generated_at: String,
    elevation_tools: Vec<String>,
    rules: Vec<PolicyRule>,
}

// The rule set is regenerated wholesale from the tool inventory; it is never
// patched in place.
fn generate_rule_set(cfg: &Config) -> PolicyRuleSet {
    let mut rules = Vec::new();
    let mut elevation_tools = Vec::new();
    for (tool, spec) in &cfg.tools {
        if spec.kind == ToolKind::Elevation {
            elevation_tools.push(tool.clone());
        }
        for spec_rule in &spec.rules {
            rules.push(PolicyRule {
                tool: tool.clone(),
                subcommand: spec_rule.subcommand.clone(),
                action: spec_rule.action,
                applies_to: spec_rule.applies_to,
                scope_flags: if spec_rule.action == RuleAction::RewriteUserScope {
                    spec.user_scope_flags.clone()
                } else {
                    Vec::new()
                },
            });
        }
    }
    PolicyRuleSet {
        version: 1,
        generated_at: now_rfc3339(),
        elevation_tools,
        rules,
    }
}

fn read_rule_set(path: &Path) -> Result<PolicyRuleSet, SchoolcodeError> {
    if !path.exists() {
        return Err(SchoolcodeError::Process(format!(
            "policy rules not found at {}; run `schoolcode install` first",
            path.display()
        )));
    }
    let content = fs::read_to_string(path)?;
    Ok(serde_yaml::from_str(&content)?)
}

#[derive(Debug, Clone, PartialEq)]
enum Decision {
    Forward(Vec<String>),
    Reject(String),
}

impl Decision {
    fn label(&self) -> &'static str {
        match self {
            Decision::Forward(_) => "forward",
            Decision::Reject(_) => "reject",
        }
    }
}

fn leading_subcommand(args: &[String]) -> Option<&str> {
    args.iter()
        .map(String::as_str)
        .find(|arg| !arg.starts_with('-'))
}

fn rule_is_wildcard(rule: &PolicyRule) -> bool {
    match rule.subcommand.as_deref() {
        None | Some("*") => true,
        Some(_) => false,
    }
}

fn rule_applies(rule: &PolicyRule, identity: &Identity) -> bool {
    match rule.applies_to {
        RuleScope::All => true,
        RuleScope::RestrictedOnly => identity.restricted,
    }
}

fn inject_scope_flags(args: &[String], subcommand: Option<&str>, flags: &[String]) -> Vec<String> {
    let mut rewritten: Vec<String> = args.to_vec();
    let insert_at = match subcommand {
        Some(sub) => rewritten
            .iter()
            .position(|arg| arg == sub)
            .map(|idx| idx + 1)
            .unwrap_or(rewritten.len()),
        None => rewritten.len(),
    };
    let mut offset = 0;
    for flag in flags {
        if rewritten.iter().any(|arg| arg == flag) {
            continue;
        }
        rewritten.insert(insert_at + offset, flag.clone());
        offset += 1;
    }
    rewritten
}

// First-match precedence with exact subcommand beating the wildcard. Blanket
// elevation rejection is checked before the table: for the restricted
// identity, elevation itself is the capability being withheld.
fn mediate(
    rule_set: &PolicyRuleSet,
    tool: &str,
    args: &[String],
    identity: &Identity,
) -> Decision {
    if identity.restricted && rule_set.elevation_tools.iter().any(|name| name == tool) {
        return Decision::Reject(ELEVATION_REASON.to_string());
    }
    let subcommand = leading_subcommand(args);
    let applicable: Vec<&PolicyRule> = rule_set
        .rules
        .iter()
        .filter(|rule| rule.tool == tool && rule_applies(rule, identity))
        .collect();
    let matched = subcommand
        .and_then(|sub| {
            applicable
                .iter()
                .find(|rule| rule.subcommand.as_deref() == Some(sub))
                .copied()
        })
        .or_else(|| applicable.iter().find(|rule| rule_is_wildcard(rule)).copied());
    let Some(rule) = matched else {
        // No authoritative rule: forward untouched. Absence of a rule is an
        // inventory gap, not a policy decision.
        return Decision::Forward(args.to_vec());
    };
    match rule.action {
        RuleAction::Allow => Decision::Forward(args.to_vec()),
        RuleAction::Block => Decision::Reject(BLOCK_REASON.to_string()),
        RuleAction::RewriteUserScope => {
            Decision::Forward(inject_scope_flags(args, subcommand, &rule.scope_flags))
        }
    }
}

fn profile_block_body(layout: &PrefixLayout) -> String {
    format!(
        "{begin}\nexport PATH=\"{shims}:{bin}:$PATH\"\n{end}\n",
        begin = PROFILE_BLOCK_BEGIN,
        shims = layout.shims_dir.display(),
        bin = layout.bin_dir.display(),
        end = PROFILE_BLOCK_END
    )
}

// Strips every managed block (legacy duplicates included) and appends exactly
// one fresh block, preserving the surrounding file content byte-for-byte.
fn upsert_profile_block(existing: &str, block: &str) -> String {
    let mut kept: Vec<&str> = Vec::new();
    let mut in_block = false;
    for line in existing.lines() {
        if line.trim() == PROFILE_BLOCK_BEGIN {
            in_block = true;
            continue;
        }
        if line.trim() == PROFILE_BLOCK_END {
            in_block = false;
            continue;
        }
        if !in_block {
            kept.push(line);
        }
    }
    while kept.last().is_some_and(|line| line.trim().is_empty()) {
        kept.pop();
    }
    let mut result = kept.join("\n");
    if !result.is_empty() {
        result.push('\n');
        result.push('\n');
    }
    result.push_str(block);
    result
}

fn profile_block_is_current(path: &Path, block: &str) -> bool {
    let Ok(content) = fs::read_to_string(path) else {
        return false;
    };
    content.matches(PROFILE_BLOCK_BEGIN).count() == 1 && content.contains(block.trim_end())
}

fn write_profile_block(path: &Path, block: &str) -> Result<bool, SchoolcodeError> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => String::new(),
        Err(err) => return Err(SchoolcodeError::Io(err)),
    };
    let updated = upsert_profile_block(&existing, block);
    if updated == existing {
        return Ok(false);
    }
    write_atomic_text_file(path, &updated, None)?;
    Ok(true)
}

fn remove_profile_block(path: &Path) -> Result<bool, SchoolcodeError> {
    let existing = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(err) => return Err(SchoolcodeError::Io(err)),
    };
    if !existing.contains(PROFILE_BLOCK_BEGIN) {
        return Ok(false);
    }
    let mut kept: Vec<&str> = Vec::new();
    let mut in_block = false;
    for line in existing.lines() {
        if line.trim() == PROFILE_BLOCK_BEGIN {
            in_block = true;
            continue;
        }
        if line.trim() == PROFILE_BLOCK_END {
            in_block = false;
            continue;
        }
        if !in_block {
            kept.push(line);
        }
    }
    let mut updated = kept.join("\n");
    if !updated.is_empty() {
        updated.push('\n');
    }
    write_atomic_text_file(path, &updated, None)?;
    Ok(true)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
enum CheckStatus {
    Pass,
    Warn,
    Fail,
}

impl CheckStatus {
    fn as_str(self) -> &'static str {
        match self {
            CheckStatus::Pass => "pass",
            CheckStatus::Warn => "warn",
            CheckStatus::Fail => "fail",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct ProbeCheck {
    id: String,
    status: CheckStatus,
    message: String,
    remediation: String,
    details: serde_json::Value,
}

fn probe_check(
    id: &str,
    status: CheckStatus,
    message: impl Into<String>,
    remediation: impl Into<String>,
    details: serde_json::Value,
) -> ProbeCheck {
    ProbeCheck {
        id: id.to_string(),
        status,
        message: message.into(),
        remediation: remediation.into(),
        details,
    }
}

fn probe_verdict(checks: &[ProbeCheck]) -> CheckStatus {
    checks
        .iter()
        .map(|check| check.status)
        .max()
        .unwrap_or(CheckStatus::Pass)
}

fn parse_version_key(version: &str) -> Option<Vec<u64>> {
    let mut values = Vec::new();
    for part in version.trim().split('.') {
        values.push(part.parse::<u64>().ok()?);
    }
    if values.is_empty() {
        None
    } else {
        Some(values)
    }
}

fn version_below(version: &str, floor: &str) -> bool {
    match (parse_version_key(version), parse_version_key(floor)) {
        (Some(left), Some(right)) => left < right,
        _ => false,
    }
}

fn classify_os_version(version: &str, minimum: &str, recommended: &str) -> CheckStatus {
    if version_below(version, minimum) {
        CheckStatus::Fail
    } else if version_below(version, recommended) {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    }
}

fn host_os_version(runner: &dyn CommandRunner) -> Option<String> {
    if env::consts::OS != "macos" {
        return None;
    }
    let output = runner
        .run("sw_vers", &["-productVersion".to_string()], None)
        .ok()?;
    if !output.success() {
        return None;
    }
    let text = output.stdout_text().trim().to_string();
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

// Second line of `df -Pk`: filesystem, 1K-blocks, used, available, ...
fn parse_df_available_kb(df_output: &str) -> Option<u64> {
    let line = df_output.lines().nth(1)?;
    let fields: Vec<&str> = line.split_whitespace().collect();
    fields.get(3)?.parse::<u64>().ok()
}

fn classify_disk_space(available_mb: u64, critical_mb: u64, comfort_mb: u64) -> CheckStatus {
    if available_mb < critical_mb {
        CheckStatus::Fail
    } else if available_mb < comfort_mb {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    }
}

fn available_disk_mb(runner: &dyn CommandRunner, path: &Path) -> Option<u64> {
    let probe_path = if path.exists() {
        path.to_path_buf()
    } else {
        path.ancestors()
            .find(|candidate| candidate.exists())
            .map(Path::to_path_buf)?
    };
    let output = runner
        .run(
            "df",
            &["-Pk".to_string(), probe_path.to_string_lossy().to_string()],
            Some(Duration::from_secs(10)),
        )
        .ok()?;
    if !output.success() {
        return None;
    }
    parse_df_available_kb(&output.stdout_text()).map(|kb| kb / 1024)
}

fn trust_store_present() -> bool {
    if env::consts::OS == "macos" {
        return Path::new("/etc/ssl/cert.pem").exists();
    }
    fs::read_dir("/etc/ssl/certs")
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn endpoint_reachable(client: &reqwest::blocking::Client, url: &str) -> bool {
    client
        .head(url)
        .send()
        .map(|response| response.status().as_u16() < 500)
        .unwrap_or(false)
}

fn collect_probe_checks(
    cfg: &Config,
    layout: &PrefixLayout,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
    include_layout_checks: bool,
) -> Vec<ProbeCheck> {
    let mut checks = Vec::new();
    let os_version = host_os_version(runner);

    match os_version.as_deref() {
        Some(version) => {
            let status = classify_os_version(
                version,
                &cfg.thresholds.os_minimum,
                &cfg.thresholds.os_recommended,
            );
            checks.push(probe_check(
                "os_version_floor",
                status,
                match status {
                    CheckStatus::Pass => format!("OS version {version} meets the recommended floor"),
                    CheckStatus::Warn => format!(
                        "OS version {version} is below the recommended {}",
                        cfg.thresholds.os_recommended
                    ),
                    CheckStatus::Fail => format!(
                        "OS version {version} is below the minimum {}",
                        cfg.thresholds.os_minimum
                    ),
                },
                "Upgrade the host OS before provisioning the guest toolset.",
                json!({"version": version}),
            ));
        }
        None => checks.push(probe_check(
            "os_version_floor",
            CheckStatus::Pass,
            "OS version floor does not apply to this platform",
            "",
            json!({"platform": env::consts::OS}),
        )),
    }

    match available_disk_mb(runner, &layout.root) {
        Some(available_mb) => {
            let status = classify_disk_space(
                available_mb,
                cfg.thresholds.disk_critical_mb,
                cfg.thresholds.disk_comfort_mb,
            );
            checks.push(probe_check(
                "disk_space",
                status,
                match status {
                    CheckStatus::Pass => format!("{available_mb} MB free"),
                    CheckStatus::Warn => format!(
                        "{available_mb} MB free is below the comfort floor of {} MB",
                        cfg.thresholds.disk_comfort_mb
                    ),
                    CheckStatus::Fail => format!(
                        "{available_mb} MB free is below the critical floor of {} MB",
                        cfg.thresholds.disk_critical_mb
                    ),
                },
                "Free up disk space before installing.",
                json!({"available_mb": available_mb}),
            ));
        }
        None => checks.push(probe_check(
            "disk_space",
            CheckStatus::Warn,
            "unable to determine free disk space",
            "Check that `df` works on this host.",
            json!({}),
        )),
    }

    // Presence alone is not enough: a binary that cannot answer `--version`
    // is as useless to acquisition as a missing one.
    let live = |path: &Path| -> bool {
        runner
            .run(
                &path.to_string_lossy(),
                &["--version".to_string()],
                Some(Duration::from_secs(15)),
            )
            .map(|output| output.success())
            .unwrap_or(false)
    };
    let curl = lookup.which("curl");
    let curl_ok = curl.as_deref().map(|path| live(path)).unwrap_or(false);
    let git = lookup.which("git");
    let git_ok = git.as_deref().map(|path| live(path)).unwrap_or(false);
    let mut broken_managers: Vec<String> = Vec::new();
    let mut pending_managers: Vec<String> = Vec::new();
    for (tool, spec) in &cfg.tools {
        if spec.kind != ToolKind::PackageManager {
            continue;
        }
        match resolve_tool_executable(tool, spec, &layout.shims_dir, lookup) {
            Some(path) if live(&path) => {}
            Some(_) => broken_managers.push(tool.clone()),
            None => pending_managers.push(tool.clone()),
        }
    }
    let toolchain_status = if curl.is_none() {
        CheckStatus::Fail
    } else if !curl_ok
        || !git_ok
        || !broken_managers.is_empty()
        || !pending_managers.is_empty()
    {
        CheckStatus::Warn
    } else {
        CheckStatus::Pass
    };
    let toolchain_message = match toolchain_status {
        CheckStatus::Pass => {
            "minimal toolchain present and responding (curl, git, package manager)".to_string()
        }
        CheckStatus::Fail => "curl is missing; dependency acquisition cannot proceed".to_string(),
        CheckStatus::Warn => {
            let mut parts: Vec<String> = Vec::new();
            if !curl_ok {
                parts.push("curl is present but not responding".to_string());
            }
            if git.is_none() {
                parts.push("git is missing".to_string());
            } else if !git_ok {
                parts.push("git is present but not responding".to_string());
            }
            for tool in &broken_managers {
                parts.push(format!("{tool} is present but not responding"));
            }
            for tool in &pending_managers {
                parts.push(format!("{tool} is not installed yet"));
            }
            parts.join("; ")
        }
    };
    checks.push(probe_check(
        "toolchain",
        toolchain_status,
        toolchain_message,
        "Install the platform command line tools.",
        json!({
            "curl": curl_ok,
            "git": git_ok,
            "broken_managers": broken_managers,
            "pending_managers": pending_managers,
        }),
    ));

    let trust_ok = trust_store_present();
    let legacy_baseline = os_version
        .as_deref()
        .map(|version| version_below(version, &cfg.thresholds.os_legacy_trust_baseline))
        .unwrap_or(false);
    checks.push(probe_check(
        "trust_store",
        if trust_ok {
            CheckStatus::Pass
        } else {
            CheckStatus::Warn
        },
        if trust_ok {
            "system trust store looks healthy"
        } else {
            "system trust store is missing or empty"
        },
        "Run `schoolcode repair` to refresh certificates on legacy systems.",
        json!({"legacy_baseline": legacy_baseline}),
    ));

    if cfg.network.endpoints.is_empty() {
        checks.push(probe_check(
            "network_reachability",
            CheckStatus::Pass,
            "no distribution endpoints configured; check skipped",
            "",
            json!({"endpoints": []}),
        ));
    } else {
        let client = reqwest::blocking::Client::builder()
            .timeout(Duration::from_secs(cfg.network.timeout_secs))
            .build();
        let mut unreachable: Vec<String> = Vec::new();
        if let Ok(client) = client {
            for endpoint in &cfg.network.endpoints {
                if !endpoint_reachable(&client, endpoint) {
                    unreachable.push(endpoint.clone());
                }
            }
        } else {
            unreachable = cfg.network.endpoints.clone();
        }
        let status = if unreachable.is_empty() {
            CheckStatus::Pass
        } else if unreachable.len() == cfg.network.endpoints.len() {
            CheckStatus::Fail
        } else {
            CheckStatus::Warn
        };
        checks.push(probe_check(
            "network_reachability",
            status,
            if unreachable.is_empty() {
                "all distribution endpoints reachable".to_string()
            } else {
                format!("{} endpoint(s) unreachable", unreachable.len())
            },
            "Check network connectivity and proxy settings.",
            json!({"unreachable": unreachable}),
        ));
    }

    if include_layout_checks {
        let block = profile_block_body(layout);
        let profile_files = resolve_profile_files(cfg);
        let current = profile_files
            .iter()
            .all(|path| profile_block_is_current(path, &block));
        checks.push(probe_check(
            "path_ordering",
            if current {
                CheckStatus::Pass
            } else {
                CheckStatus::Warn
            },
            if current {
                "managed PATH block present with shims ahead of tools"
            } else {
                "managed PATH block is missing, duplicated, or stale"
            },
            "Run `schoolcode repair` to rewrite the managed PATH block.",
            json!({
                "profile_files": profile_files
                    .iter()
                    .map(|p| p.to_string_lossy().to_string())
                    .collect::<Vec<_>>()
            }),
        ));
    }

    checks
}

#[derive(Debug, Default, Serialize)]
struct RepairReport {
    applied: Vec<String>,
    skipped: Vec<String>,
    failures: Vec<String>,
}

// Every remediation checks for existing state first: a second run applies
// nothing beyond the first successful application.
fn run_repair(
    ctx: &Context,
    cfg: &Config,
    layout: &PrefixLayout,
    runner: &dyn CommandRunner,
    dry_run: bool,
) -> Result<RepairReport, SchoolcodeError> {
    let mut report = RepairReport::default();
    if !layout.version_path.exists() {
        report
            .skipped
            .push("managed tree is not installed; run `schoolcode install`".to_string());
        return Ok(report);
    }

    for dir in [
        &layout.bin_dir,
        &layout.shims_dir,
        &layout.policy_dir,
        &layout.hooks_dir,
        &layout.backups_dir,
        &layout.state_dir,
    ] {
        if dir.is_dir() {
            report.skipped.push(format!("dir present: {}", dir.display()));
        } else if dry_run {
            report.applied.push(format!("would create {}", dir.display()));
        } else {
            fs::create_dir_all(dir)?;
            report.applied.push(format!("created {}", dir.display()));
        }
    }

    let exe = env::current_exe()?;
    for (tool, _spec) in &cfg.tools {
        let shim_path = layout.shims_dir.join(tool);
        if shim_path.exists() && is_managed_shim(&shim_path) {
            report.skipped.push(format!("shim ok: {tool}"));
            continue;
        }
        if shim_path.exists() && !is_managed_shim(&shim_path) {
            report.failures.push(format!(
                "foreign binary at shim path {}; refusing to overwrite",
                shim_path.display()
            ));
            continue;
        }
        if dry_run {
            report.applied.push(format!("would rewrite shim for {tool}"));
        } else {
            write_shim(&shim_path, &exe, tool)?;
            report.applied.push(format!("rewrote shim for {tool}"));
        }
    }

    let block = profile_block_body(layout);
    for profile in resolve_profile_files(cfg) {
        if profile_block_is_current(&profile, &block) {
            report
                .skipped
                .push(format!("profile block current: {}", profile.display()));
        } else if dry_run {
            report
                .applied
                .push(format!("would rewrite profile block in {}", profile.display()));
        } else if write_profile_block(&profile, &block)? {
            report
                .applied
                .push(format!("rewrote profile block in {}", profile.display()));
        }
    }

    let hook_body = session_hook_script(layout);
    let hook_current = fs::read_to_string(&layout.hook_path)
        .map(|body| body == hook_body)
        .unwrap_or(false);
    if hook_current && is_executable_file(&layout.hook_path) {
        report.skipped.push("session hook current".to_string());
    } else if dry_run {
        report.applied.push("would rewrite session hook".to_string());
    } else {
        write_atomic_text_file(&layout.hook_path, &hook_body, Some(0o755))?;
        report.applied.push("rewrote session hook".to_string());
    }

    let os_version = host_os_version(runner);
    let legacy = os_version
        .as_deref()
        .map(|version| version_below(version, &cfg.thresholds.os_legacy_trust_baseline))
        .unwrap_or(false);
    if legacy && !cfg.repair.trust_command.is_empty() {
        let command = cfg.repair.trust_command.join(" ");
        if dry_run {
            report
                .applied
                .push("would refresh trust store (legacy baseline)".to_string());
        } else {
            let outcome = run_shell(
                runner,
                &command,
                Some(Duration::from_secs(cfg.acquisition.timeout_secs)),
            );
            match outcome {
                Ok(output) if output.success() => {
                    report.applied.push("refreshed trust store".to_string())
                }
                Ok(output) => report.failures.push(format!(
                    "trust store refresh exited with status {}",
                    output.status_code
                )),
                Err(err) => report
                    .failures
                    .push(format!("trust store refresh failed to start: {err}")),
            }
        }
    } else {
        report
            .skipped
            .push("trust store refresh not needed on this baseline".to_string());
    }

    trace(
        ctx,
        &format!(
            "repair: {} applied, {} skipped, {} failed",
            report.applied.len(),
            report.skipped.len(),
            report.failures.len()
        ),
    );
    Ok(report)
}

#[derive(Debug, Clone, Serialize)]
struct BackupRef {
    stamp: String,
    path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
struct BackupMeta {
    created_at: String,
    source_tree: String,
}

fn copy_tree(src: &Path, dst: &Path) -> Result<(), SchoolcodeError> {
    fs::create_dir_all(dst)?;
    for entry in fs::read_dir(src)? {
        let entry = entry?;
        let from = entry.path();
        let to = dst.join(entry.file_name());
        let meta = fs::symlink_metadata(&from)?;
        let file_type = meta.file_type();
        if file_type.is_symlink() {
            let target = fs::read_link(&from)?;
            #[cfg(unix)]
            symlink(&target, &to)?;
            #[cfg(not(unix))]
            return Err(SchoolcodeError::Config(
                "symlinked trees are only supported on unix hosts".to_string(),
            ));
        } else if file_type.is_dir() {
            copy_tree(&from, &to)?;
        } else {
            fs::copy(&from, &to)?;
        }
    }
    Ok(())
}

fn backup_stamp(backups_dir: &Path) -> String {
    let base = Utc::now().format("%Y%m%d-%H%M%S").to_string();
    let mut stamp = base.clone();
    let mut counter = 1;
    while backups_dir.join(&stamp).exists() {
        stamp = format!("{base}-{counter}");
        counter += 1;
    }
    stamp
}

// Stage into `<stamp>.partial`, then rename: callers either see a complete
// archive or none at all.
fn snapshot_tree(source: &Path, backups_dir: &Path) -> Result<BackupRef, SchoolcodeError> {
    fs::create_dir_all(backups_dir)?;
    let stamp = backup_stamp(backups_dir);
    let staging = backups_dir.join(format!("{stamp}.partial"));
    let archive = backups_dir.join(&stamp);
    let result = (|| -> Result<(), SchoolcodeError> {
        let tree_dst = staging.join("tree");
        fs::create_dir_all(&tree_dst)?;
        for entry in fs::read_dir(source)? {
            let entry = entry?;
            // Prior archives are not re-archived: the staging directory lives
            // under `backups/` and copying it into itself would never finish.
            if entry.file_name() == "backups" {
                continue;
            }
            let from = entry.path();
            let to = tree_dst.join(entry.file_name());
            let file_type = fs::symlink_metadata(&from)?.file_type();
            if file_type.is_symlink() {
                let target = fs::read_link(&from)?;
                #[cfg(unix)]
                symlink(&target, &to)?;
            } else if file_type.is_dir() {
                copy_tree(&from, &to)?;
            } else {
                fs::copy(&from, &to)?;
            }
        }
        // The run lock must not survive into an archive: restoring one would
        // wedge every later install with a stale "already running" error.
        let _ = fs::remove_file(tree_dst.join("state").join(LOCK_FILE_NAME));
        let meta = BackupMeta {
            created_at: now_rfc3339(),
            source_tree: source.to_string_lossy().to_string(),
        };
        write_atomic_text_file(
            &staging.join("meta.json"),
            &serde_json::to_string_pretty(&meta)?,
            None,
        )?;
        fs::rename(&staging, &archive)?;
        Ok(())
    })();
    if result.is_err() {
        let _ = fs::remove_dir_all(&staging);
    }
    result?;
    Ok(BackupRef {
        stamp,
        path: archive.to_string_lossy().to_string(),
    })
}

// Destructive by contract: the destination tree is removed before extraction.
// A failure partway leaves an explicit flag file instead of a silently
// plausible tree.
fn restore_tree(archive: &Path, dest: &Path) -> Result<(), SchoolcodeError> {
    let tree = archive.join("tree");
    if !tree.is_dir() {
        return Err(SchoolcodeError::Process(format!(
            "backup archive has no tree payload: {}",
            archive.display()
        )));
    }
    if dest.exists() {
        fs::remove_dir_all(dest)?;
    }
    if let Err(err) = copy_tree(&tree, dest) {
        let _ = fs::write(
            dest.join(RESTORE_INCOMPLETE_FLAG),
            "restore did not complete; tree contents are not trustworthy\n",
        );
        return Err(err);
    }
    Ok(())
}

// The archives live inside the tree being replaced, so the whole `backups/`
// directory is parked next to the root for the duration of the restore and
// moved back afterwards. Parking stays on the same filesystem; a rename into
// a temp dir could cross mount points.
fn restore_from_backup(layout: &PrefixLayout, stamp: &str) -> Result<(), SchoolcodeError> {
    let parking = layout
        .root
        .parent()
        .unwrap_or_else(|| Path::new("."))
        .join(format!(".schoolcode-restore-{}", std::process::id()));
    let _ = fs::remove_dir_all(&parking);
    fs::rename(&layout.backups_dir, &parking)?;
    let restored = restore_tree(&parking.join(stamp), &layout.root);
    let _ = fs::create_dir_all(&layout.root);
    let _ = remove_path(&layout.backups_dir);
    let parked_back = fs::rename(&parking, &layout.backups_dir);
    restored?;
    parked_back?;
    Ok(())
}

fn read_backup_meta(archive: &Path) -> Option<BackupMeta> {
    let content = fs::read_to_string(archive.join("meta.json")).ok()?;
    serde_json::from_str(&content).ok()
}

fn list_backups(backups_dir: &Path) -> Result<Vec<BackupRef>, SchoolcodeError> {
    if !backups_dir.exists() {
        return Ok(Vec::new());
    }
    let mut backups = Vec::new();
    for entry in fs::read_dir(backups_dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().to_string();
        if name.ends_with(".partial") {
            continue;
        }
        backups.push(BackupRef {
            stamp: name,
            path: entry.path().to_string_lossy().to_string(),
        });
    }
    backups.sort_by(|a, b| a.stamp.cmp(&b.stamp));
    Ok(backups)
}

fn prune_backups(
    backups_dir: &Path,
    retention: &BackupRetention,
    now: DateTime<Utc>,
) -> Result<Vec<String>, SchoolcodeError> {
    let backups = list_backups(backups_dir)?;
    let mut removed = Vec::new();
    let keep_from = backups.len().saturating_sub(retention.max_count);
    for (index, backup) in backups.iter().enumerate() {
        let too_many = index < keep_from;
        let too_old = read_backup_meta(Path::new(&backup.path))
            .and_then(|meta| DateTime::parse_from_rfc3339(&meta.created_at).ok())
            .map(|created| {
                now.signed_duration_since(created.with_timezone(&Utc))
                    > chrono::Duration::days(i64::from(retention.max_age_days))
            })
            .unwrap_or(false);
        if too_many || too_old {
            fs::remove_dir_all(&backup.path)?;
            removed.push(backup.stamp.clone());
        }
    }
    Ok(removed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
enum Phase {
    Init,
    Precheck,
    Backup,
    Acquire,
    Place,
    Wrap,
    Configure,
    Verify,
    Complete,
    Failed,
}

impl Phase {
    fn as_str(self) -> &'static str {
        match self {
            Phase::Init => "init",
            Phase::Precheck => "precheck",
            Phase::Backup => "backup",
            Phase::Acquire => "acquire",
            Phase::Place => "place",
            Phase::Wrap => "wrap",
            Phase::Configure => "configure",
            Phase::Verify => "verify",
            Phase::Complete => "complete",
            Phase::Failed => "failed",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
struct PhaseError {
    phase: &'static str,
    component: String,
    message: String,
    at: String,
}

#[derive(Debug, Serialize)]
struct InstallationState {
    phase: Phase,
    failed_phase: Option<&'static str>,
    dry_run: bool,
    force: bool,
    no_backup: bool,
    backup: Option<BackupRef>,
    restored_from_backup: bool,
    errors: Vec<PhaseError>,
    warnings: Vec<String>,
    planned: Vec<String>,
    started_at: String,
    finished_at: Option<String>,
}

impl InstallationState {
    fn new(opts: &InstallOptions) -> Self {
        Self {
            phase: Phase::Init,
            failed_phase: None,
            dry_run: opts.dry_run,
            force: opts.force,
            no_backup: opts.no_backup,
            backup: None,
            restored_from_backup: false,
            errors: Vec::new(),
            warnings: Vec::new(),
            planned: Vec::new(),
            started_at: now_rfc3339(),
            finished_at: None,
        }
    }

    fn record_error(&mut self, phase: Phase, component: &str, message: String) {
        self.errors.push(PhaseError {
            phase: phase.as_str(),
            component: component.to_string(),
            message,
            at: now_rfc3339(),
        });
    }
}

#[derive(Debug, Clone)]
struct InstallOptions {
    prefix: Option<PathBuf>,
    dry_run: bool,
    force: bool,
    no_backup: bool,
    assume_yes: bool,
}

struct PhaseFailure {
    component: String,
    message: String,
}

fn phase_failure(component: &str, message: impl Into<String>) -> PhaseFailure {
    PhaseFailure {
        component: component.to_string(),
        message: message.into(),
    }
}

// Held for the whole run; a second concurrent install fails fast instead of
// racing this one for the prefix.
struct InstallLock {
    path: PathBuf,
}

impl InstallLock {
    fn acquire(path: &Path) -> Result<Self, SchoolcodeError> {
        ensure_parent(path)?;
        match fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
        {
            Ok(mut file) => {
                let _ = io::Write::write_all(
                    &mut file,
                    format!("pid={} started={}\n", std::process::id(), now_rfc3339()).as_bytes(),
                );
                Ok(Self {
                    path: path.to_path_buf(),
                })
            }
            Err(err) if err.kind() == io::ErrorKind::AlreadyExists => {
                Err(SchoolcodeError::Process(format!(
                    "an installation run is already in progress (lock file {} exists)",
                    path.display()
                )))
            }
            Err(err) => Err(SchoolcodeError::Io(err)),
        }
    }
}

impl Drop for InstallLock {
    fn drop(&mut self) {
        let _ = fs::remove_file(&self.path);
    }
}

fn tree_has_entries(path: &Path) -> bool {
    fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn acquisition_required(kind: ToolKind) -> bool {
    matches!(
        kind,
        ToolKind::PackageManager | ToolKind::DepInstaller | ToolKind::Interpreter
    )
}

fn run_install(
    ctx: &Context,
    cfg: &Config,
    opts: &InstallOptions,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
) -> Result<InstallationState, SchoolcodeError> {
    let prefix = resolve_prefix(cfg, opts.prefix.as_ref());
    let layout = prefix_layout(&prefix);
    let log_path = resolve_log_path(ctx, cfg, &layout);
    let mut state = InstallationState::new(opts);
    let root_existed = layout.root.exists();

    let _lock = if opts.dry_run {
        None
    } else {
        Some(InstallLock::acquire(&layout.lock_path)?)
    };
    if !opts.dry_run {
        log_event(&log_path, &format!("install started (force={})", opts.force));
    }

    // Precheck
    state.phase = Phase::Precheck;
    trace(ctx, "phase: precheck");
    let checks = collect_probe_checks(cfg, &layout, runner, lookup, false);
    for check in checks.iter().filter(|check| check.status == CheckStatus::Warn) {
        state.warnings.push(format!("precheck:{}: {}", check.id, check.message));
    }
    if probe_verdict(&checks) == CheckStatus::Fail {
        let failing = checks
            .iter()
            .filter(|check| check.status == CheckStatus::Fail)
            .map(|check| format!("{}: {}", check.id, check.message))
            .collect::<Vec<_>>()
            .join("; ");
        // `force` suppresses prompts only; hard precondition failures always
        // abort.
        let failure = phase_failure("prober", failing);
        return finish_failed_run(ctx, cfg, &layout, &log_path, state, opts, failure, root_existed);
    }

    // Backup
    state.phase = Phase::Backup;
    trace(ctx, "phase: backup");
    if opts.dry_run {
        if root_existed && tree_has_entries(&layout.root) && !opts.no_backup {
            state
                .planned
                .push(format!("snapshot existing tree at {}", layout.root.display()));
        }
    } else if opts.no_backup {
        state
            .warnings
            .push("backup skipped (--no-backup); rollback will be unavailable".to_string());
    } else if root_existed && tree_has_entries(&layout.root) {
        match snapshot_tree(&layout.root, &layout.backups_dir) {
            Ok(backup) => {
                log_event(&log_path, &format!("backup created: {}", backup.stamp));
                state.backup = Some(backup);
            }
            Err(err) => {
                state.warnings.push(format!(
                    "backup failed ({err}); rollback will be unavailable for this run"
                ));
            }
        }
    }

    // Acquire
    state.phase = Phase::Acquire;
    trace(ctx, "phase: acquire");
    if let Err(failure) = acquire_dependencies(cfg, &layout, runner, lookup, opts, &mut state) {
        return finish_failed_run(ctx, cfg, &layout, &log_path, state, opts, failure, root_existed);
    }

    // Place
    state.phase = Phase::Place;
    trace(ctx, "phase: place");
    if let Err(failure) = place_tools(cfg, &layout, lookup, opts, &mut state) {
        return finish_failed_run(ctx, cfg, &layout, &log_path, state, opts, failure, root_existed);
    }

    // Wrap
    state.phase = Phase::Wrap;
    trace(ctx, "phase: wrap");
    if let Err(failure) = wrap_tools(cfg, &layout, opts, &mut state) {
        return finish_failed_run(ctx, cfg, &layout, &log_path, state, opts, failure, root_existed);
    }

    // Configure
    state.phase = Phase::Configure;
    trace(ctx, "phase: configure");
    if let Err(failure) = configure_environment(cfg, &layout, opts, &mut state) {
        return finish_failed_run(ctx, cfg, &layout, &log_path, state, opts, failure, root_existed);
    }

    // Verify
    state.phase = Phase::Verify;
    trace(ctx, "phase: verify");
    if let Err(failure) = verify_tools(cfg, &layout, runner, lookup, opts, &mut state) {
        return finish_failed_run(ctx, cfg, &layout, &log_path, state, opts, failure, root_existed);
    }

    state.phase = Phase::Complete;
    state.finished_at = Some(now_rfc3339());
    if !opts.dry_run {
        write_atomic_text_file(
            &layout.version_path,
            concat!(env!("CARGO_PKG_VERSION"), "\n"),
            None,
        )?;
        match prune_backups(&layout.backups_dir, &cfg.backups, Utc::now()) {
            Ok(removed) if !removed.is_empty() => {
                state
                    .warnings
                    .push(format!("pruned {} old backup(s)", removed.len()));
            }
            Ok(_) => {}
            Err(err) => state.warnings.push(format!("backup pruning failed: {err}")),
        }
        write_audit_record(&layout, &state)?;
        log_event(&log_path, "install complete");
    }
    Ok(state)
}

fn acquire_dependencies(
    cfg: &Config,
    layout: &PrefixLayout,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
    opts: &InstallOptions,
    state: &mut InstallationState,
) -> Result<(), PhaseFailure> {
    for (tool, spec) in &cfg.tools {
        if !acquisition_required(spec.kind) {
            continue;
        }
        if resolve_tool_executable(tool, spec, &layout.shims_dir, lookup).is_some() {
            continue;
        }
        if opts.dry_run {
            state.planned.push(format!("acquire {tool}"));
            continue;
        }
        if spec.acquire_commands.is_empty() {
            return Err(phase_failure(
                tool,
                format!("{tool} is missing and has no acquisition method configured"),
            ));
        }
        let timeout = Duration::from_secs(cfg.acquisition.timeout_secs);
        let mut acquired = false;
        'methods: for command in &spec.acquire_commands {
            for attempt in 1..=cfg.acquisition.attempts {
                match run_shell(runner, command, Some(timeout)) {
                    Ok(output) if output.success() => {}
                    Ok(output) => {
                        state.warnings.push(format!(
                            "acquire {tool}: attempt {attempt} exited with status {}",
                            output.status_code
                        ));
                    }
                    Err(err) => {
                        state
                            .warnings
                            .push(format!("acquire {tool}: attempt {attempt} failed to start: {err}"));
                    }
                }
                if resolve_tool_executable(tool, spec, &layout.shims_dir, lookup).is_some() {
                    acquired = true;
                    break 'methods;
                }
            }
        }
        if !acquired {
            return Err(phase_failure(
                tool,
                format!(
                    "{tool} could not be obtained after {} attempt(s) per method",
                    cfg.acquisition.attempts
                ),
            ));
        }
    }
    Ok(())
}

fn place_tools(
    cfg: &Config,
    layout: &PrefixLayout,
    lookup: &dyn ExecLookup,
    opts: &InstallOptions,
    state: &mut InstallationState,
) -> Result<(), PhaseFailure> {
    if opts.dry_run {
        state
            .planned
            .push(format!("create managed tree at {}", layout.root.display()));
        for (tool, spec) in &cfg.tools {
            if spec.kind != ToolKind::Elevation {
                state.planned.push(format!("link {tool} into bin/"));
            }
        }
        return Ok(());
    }
    for dir in [
        &layout.bin_dir,
        &layout.shims_dir,
        &layout.policy_dir,
        &layout.hooks_dir,
        &layout.backups_dir,
        &layout.state_dir,
    ] {
        fs::create_dir_all(dir)
            .map_err(|err| phase_failure("layout", format!("creating {}: {err}", dir.display())))?;
    }
    for (tool, spec) in &cfg.tools {
        if spec.kind == ToolKind::Elevation {
            continue;
        }
        match resolve_tool_executable(tool, spec, &layout.shims_dir, lookup) {
            Some(real) => {
                force_symlink(&real, &layout.bin_dir.join(tool))
                    .map_err(|err| phase_failure(tool, err.to_string()))?;
            }
            None if acquisition_required(spec.kind) => {
                return Err(phase_failure(
                    tool,
                    format!("{tool} disappeared between acquisition and placement"),
                ));
            }
            None => {
                state
                    .warnings
                    .push(format!("{tool} not found; managed link skipped"));
            }
        }
    }
    Ok(())
}

fn wrap_tools(
    cfg: &Config,
    layout: &PrefixLayout,
    opts: &InstallOptions,
    state: &mut InstallationState,
) -> Result<(), PhaseFailure> {
    if opts.dry_run {
        state
            .planned
            .push("generate policy rule set and shims".to_string());
        return Ok(());
    }
    let rule_set = generate_rule_set(cfg);
    let rules_yaml = serde_yaml::to_string(&rule_set)
        .map_err(|err| phase_failure("policy", err.to_string()))?;
    write_atomic_text_file(&layout.rules_path, &rules_yaml, None)
        .map_err(|err| phase_failure("policy", err.to_string()))?;
    let exe = env::current_exe().map_err(|err| phase_failure("shims", err.to_string()))?;
    for tool in cfg.tools.keys() {
        let shim_path = layout.shims_dir.join(tool);
        if shim_path.exists() && !is_managed_shim(&shim_path) {
            return Err(phase_failure(
                "shims",
                format!(
                    "shim generation would overwrite existing foreign binary: {}",
                    shim_path.display()
                ),
            ));
        }
        write_shim(&shim_path, &exe, tool).map_err(|err| phase_failure("shims", err.to_string()))?;
    }
    Ok(())
}

fn configure_environment(
    cfg: &Config,
    layout: &PrefixLayout,
    opts: &InstallOptions,
    state: &mut InstallationState,
) -> Result<(), PhaseFailure> {
    let block = profile_block_body(layout);
    if opts.dry_run {
        for profile in resolve_profile_files(cfg) {
            state
                .planned
                .push(format!("ensure PATH block in {}", profile.display()));
        }
        state.planned.push("write session hook".to_string());
        return Ok(());
    }
    for profile in resolve_profile_files(cfg) {
        write_profile_block(&profile, &block)
            .map_err(|err| phase_failure("profile", format!("{}: {err}", profile.display())))?;
    }
    write_atomic_text_file(&layout.hook_path, &session_hook_script(layout), Some(0o755))
        .map_err(|err| phase_failure("hook", err.to_string()))?;
    Ok(())
}

fn verify_tools(
    cfg: &Config,
    layout: &PrefixLayout,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
    opts: &InstallOptions,
    state: &mut InstallationState,
) -> Result<(), PhaseFailure> {
    if opts.dry_run {
        state
            .planned
            .push("verify managed tool liveness".to_string());
        return Ok(());
    }
    let mut missing: Vec<String> = Vec::new();
    for (tool, spec) in &cfg.tools {
        if spec.kind == ToolKind::Elevation {
            continue;
        }
        let Some(real) = resolve_tool_executable(tool, spec, &layout.shims_dir, lookup) else {
            missing.push(tool.clone());
            continue;
        };
        let probe = runner.run(
            &real.to_string_lossy(),
            &["--version".to_string()],
            Some(Duration::from_secs(15)),
        );
        match probe {
            Ok(output) if output.success() => {}
            Ok(output) => state.warnings.push(format!(
                "{tool} is present but its liveness probe exited with status {}",
                output.status_code
            )),
            Err(err) => state
                .warnings
                .push(format!("{tool} is present but failed to start: {err}")),
        }
    }
    if !missing.is_empty() {
        return Err(phase_failure(
            "verify",
            format!("missing tool(s): {}", missing.join(", ")),
        ));
    }
    Ok(())
}

fn write_audit_record(
    layout: &PrefixLayout,
    state: &InstallationState,
) -> Result<(), SchoolcodeError> {
    if !layout.state_dir.exists() {
        return Ok(());
    }
    write_atomic_text_file(
        &layout.audit_path,
        &serde_json::to_string_pretty(state)?,
        None,
    )
}

#[allow(clippy::too_many_arguments)]
fn finish_failed_run(
    ctx: &Context,
    _cfg: &Config,
    layout: &PrefixLayout,
    log_path: &Path,
    mut state: InstallationState,
    opts: &InstallOptions,
    failure: PhaseFailure,
    root_existed: bool,
) -> Result<InstallationState, SchoolcodeError> {
    let failed_phase = state.phase;
    state.record_error(failed_phase, &failure.component, failure.message.clone());
    state.failed_phase = Some(failed_phase.as_str());
    state.phase = Phase::Failed;
    state.finished_at = Some(now_rfc3339());
    if !opts.dry_run {
        log_event(
            log_path,
            &format!(
                "install failed during {}: {}: {}",
                failed_phase.as_str(),
                failure.component,
                failure.message
            ),
        );
    }

    if opts.dry_run {
        return Ok(state);
    }

    if let Some(backup) = state.backup.clone() {
        let restore_now = confirm(
            &format!(
                "Installation failed during {}. Restore the previous tree from backup {}?",
                failed_phase.as_str(),
                backup.stamp
            ),
            opts.force || opts.assume_yes,
        )?;
        if restore_now {
            restore_from_backup(layout, &backup.stamp)?;
            state.restored_from_backup = true;
            log_event(log_path, &format!("restored from backup {}", backup.stamp));
        } else {
            state
                .warnings
                .push("backup restore declined; partial tree left in place".to_string());
        }
    } else if !root_existed && layout.root.exists() {
        let remove_now = confirm(
            "Installation failed and no backup exists. Remove the partially built tree?",
            opts.force || opts.assume_yes,
        )?;
        if remove_now {
            fs::remove_dir_all(&layout.root)?;
            state
                .warnings
                .push("partially built tree removed".to_string());
        } else {
            state
                .warnings
                .push("partially built tree left in place".to_string());
        }
    }
    write_audit_record(layout, &state)?;
    Ok(state)
}

fn handle_config(ctx: &Context, command: ConfigCommand) -> Result<(), SchoolcodeError> {
    match command {
        ConfigCommand::Init => {
            let created = if ctx.config_path.exists() {
                false
            } else {
                read_config_from_str(DEFAULT_CONFIG_YAML)?;
                write_atomic_text_file(&ctx.config_path, DEFAULT_CONFIG_YAML, Some(0o644))?;
                true
            };
            output(
                ctx,
                json!({"path": ctx.config_path, "created": created}),
            )
        }
        ConfigCommand::Validate => {
            if !ctx.config_path.exists() {
                return Err(SchoolcodeError::Config(format!(
                    "config not found at {}; run `schoolcode config init`",
                    ctx.config_path.display()
                )));
            }
            let content = fs::read_to_string(&ctx.config_path)?;
            read_config_from_str(&content)?;
            output(ctx, json!({"path": ctx.config_path, "valid": true}))
        }
    }
}

fn handle_install(
    ctx: &Context,
    opts: InstallOptions,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
) -> Result<(), SchoolcodeError> {
    let cfg = read_config(&ctx.config_path)?;
    let state = run_install(ctx, &cfg, &opts, runner, lookup)?;
    let failed = state.phase == Phase::Failed;
    if ctx.json {
        let wrapper = JsonResult {
            ok: !failed,
            result: Some(serde_json::to_value(&state)?),
            error: state
                .errors
                .first()
                .map(|err| format!("{}: {}", err.component, err.message)),
        };
        print_json(&wrapper)?;
    } else if failed {
        let detail = state
            .errors
            .first()
            .map(|err| format!("{}: {}", err.component, err.message))
            .unwrap_or_else(|| "unknown failure".to_string());
        eprintln!(
            "install failed during {}: {}",
            state.failed_phase.unwrap_or("unknown"),
            detail
        );
        for warning in &state.warnings {
            eprintln!("warning: {warning}");
        }
    } else {
        if state.dry_run {
            info(ctx, "dry run; no changes made. planned actions:");
            for action in &state.planned {
                info(ctx, &format!("  - {action}"));
            }
        } else {
            info(ctx, "install complete");
        }
        for warning in &state.warnings {
            info(ctx, &format!("warning: {warning}"));
        }
    }
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_repair(
    ctx: &Context,
    dry_run: bool,
    runner: &dyn CommandRunner,
    _lookup: &dyn ExecLookup,
) -> Result<(), SchoolcodeError> {
    let cfg = read_config(&ctx.config_path)?;
    let prefix = resolve_prefix(&cfg, None);
    let layout = prefix_layout(&prefix);
    let report = run_repair(ctx, &cfg, &layout, runner, dry_run)?;
    if !dry_run && !report.applied.is_empty() {
        let log_path = resolve_log_path(ctx, &cfg, &layout);
        log_event(
            &log_path,
            &format!("repair applied {} action(s)", report.applied.len()),
        );
    }
    let failed = !report.failures.is_empty();
    output(
        ctx,
        json!({
            "dry_run": dry_run,
            "applied": report.applied,
            "skipped": report.skipped,
            "failures": report.failures,
        }),
    )?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
enum HealthStatus {
    Healthy,
    Degraded,
    Unhealthy,
}

impl HealthStatus {
    fn as_str(self) -> &'static str {
        match self {
            HealthStatus::Healthy => "healthy",
            HealthStatus::Degraded => "degraded",
            HealthStatus::Unhealthy => "unhealthy",
        }
    }

    fn from_check(status: CheckStatus) -> Self {
        match status {
            CheckStatus::Pass => HealthStatus::Healthy,
            CheckStatus::Warn => HealthStatus::Degraded,
            CheckStatus::Fail => HealthStatus::Unhealthy,
        }
    }
}

#[derive(Debug, Serialize)]
struct HealthReport {
    overall: HealthStatus,
    components: BTreeMap<String, HealthStatus>,
    issues: Vec<String>,
}

fn collect_health_report(
    cfg: &Config,
    layout: &PrefixLayout,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
) -> HealthReport {
    let mut components = BTreeMap::new();
    let mut issues = Vec::new();

    let checks = collect_probe_checks(cfg, layout, runner, lookup, true);
    for check in &checks {
        components.insert(
            format!("probe:{}", check.id),
            HealthStatus::from_check(check.status),
        );
        if check.status != CheckStatus::Pass {
            issues.push(format!("{} [{}]: {}", check.id, check.status.as_str(), check.message));
        }
    }

    let installed = layout.version_path.exists();
    components.insert(
        "installation".to_string(),
        if installed {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
    );
    if !installed {
        issues.push("managed tree is not installed".to_string());
    }

    let policy_ok = read_rule_set(&layout.rules_path).is_ok();
    components.insert(
        "policy".to_string(),
        if policy_ok {
            HealthStatus::Healthy
        } else {
            HealthStatus::Unhealthy
        },
    );
    if !policy_ok {
        issues.push("policy rule set is missing or unreadable".to_string());
    }

    for (tool, spec) in &cfg.tools {
        if spec.kind == ToolKind::Elevation {
            continue;
        }
        let status = match resolve_tool_executable(tool, spec, &layout.shims_dir, lookup) {
            None => {
                issues.push(format!("{tool} is missing"));
                HealthStatus::Unhealthy
            }
            Some(real) => {
                let probe = runner.run(
                    &real.to_string_lossy(),
                    &["--version".to_string()],
                    Some(Duration::from_secs(15)),
                );
                match probe {
                    Ok(output) if output.success() => HealthStatus::Healthy,
                    _ => {
                        issues.push(format!("{tool} is present but not functioning"));
                        HealthStatus::Degraded
                    }
                }
            }
        };
        components.insert(format!("tool:{tool}"), status);
    }

    let overall = components
        .values()
        .copied()
        .max()
        .unwrap_or(HealthStatus::Healthy);
    HealthReport {
        overall,
        components,
        issues,
    }
}

fn handle_status(
    ctx: &Context,
    strict: bool,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
) -> Result<(), SchoolcodeError> {
    let cfg = read_config(&ctx.config_path)?;
    let prefix = resolve_prefix(&cfg, None);
    let layout = prefix_layout(&prefix);
    let report = collect_health_report(&cfg, &layout, runner, lookup);
    let failing = report.overall == HealthStatus::Unhealthy
        || (strict && report.overall == HealthStatus::Degraded);
    if ctx.json {
        let wrapper = JsonResult {
            ok: !failing,
            result: Some(serde_json::to_value(&report)?),
            error: if failing {
                report.issues.first().cloned()
            } else {
                None
            },
        };
        print_json(&wrapper)?;
    } else {
        info(ctx, &format!("overall: {}", report.overall.as_str()));
        for (component, status) in &report.components {
            info(ctx, &format!("  [{}] {}", status.as_str(), component));
        }
        for issue in &report.issues {
            info(ctx, &format!("issue: {issue}"));
        }
    }
    if failing {
        std::process::exit(1);
    }
    Ok(())
}

fn read_version_marker(layout: &PrefixLayout) -> Option<String> {
    fs::read_to_string(&layout.version_path)
        .ok()
        .map(|text| text.trim().to_string())
        .filter(|text| !text.is_empty())
}

fn handle_update(
    ctx: &Context,
    check: bool,
    yes: bool,
    dry_run: bool,
    runner: &dyn CommandRunner,
    lookup: &dyn ExecLookup,
) -> Result<(), SchoolcodeError> {
    let cfg = read_config(&ctx.config_path)?;
    let prefix = resolve_prefix(&cfg, None);
    let layout = prefix_layout(&prefix);
    let installed_version = read_version_marker(&layout);
    let target_version = env!("CARGO_PKG_VERSION").to_string();
    let up_to_date = installed_version.as_deref() == Some(target_version.as_str());

    if check {
        return output(
            ctx,
            json!({
                "installed_version": installed_version,
                "target_version": target_version,
                "up_to_date": up_to_date,
            }),
        );
    }
    if installed_version.is_none() {
        return Err(SchoolcodeError::Process(
            "no managed installation found; run `schoolcode install` first".to_string(),
        ));
    }
    if up_to_date {
        return output(
            ctx,
            json!({
                "updated": false,
                "reason": "already_current",
                "installed_version": installed_version,
            }),
        );
    }
    if !dry_run && !yes {
        return Err(SchoolcodeError::Config(
            "update requires --yes (or use --dry-run to preview)".to_string(),
        ));
    }
    let opts = InstallOptions {
        prefix: None,
        dry_run,
        force: false,
        no_backup: false,
        assume_yes: yes,
    };
    let state = run_install(ctx, &cfg, &opts, runner, lookup)?;
    let failed = state.phase == Phase::Failed;
    output(
        ctx,
        json!({
            "updated": !failed && !dry_run,
            "dry_run": dry_run,
            "from_version": installed_version,
            "to_version": target_version,
            "state": serde_json::to_value(&state)?,
        }),
    )?;
    if failed {
        std::process::exit(1);
    }
    Ok(())
}

fn handle_uninstall(
    ctx: &Context,
    yes: bool,
    dry_run: bool,
    remove_config: bool,
    force: bool,
) -> Result<(), SchoolcodeError> {
    if !dry_run && !yes {
        return Err(SchoolcodeError::Config(
            "uninstall requires --yes (or use --dry-run to preview)".to_string(),
        ));
    }
    let cfg = read_config(&ctx.config_path)?;
    let prefix = resolve_prefix(&cfg, None);
    let layout = prefix_layout(&prefix);
    if layout.root.exists() && !layout.version_path.exists() && !force {
        return Err(SchoolcodeError::Process(format!(
            "refusing to remove {}: not a schoolcode-managed tree (use --force)",
            layout.root.display()
        )));
    }

    let mut planned: Vec<String> = Vec::new();
    let mut removed: Vec<String> = Vec::new();
    let mut missing: Vec<String> = Vec::new();

    let root_display = layout.root.to_string_lossy().to_string();
    if path_exists(&layout.root) {
        planned.push(root_display.clone());
        if !dry_run && remove_path(&layout.root)? {
            removed.push(root_display);
        }
    } else {
        missing.push(root_display);
    }

    for profile in resolve_profile_files(&cfg) {
        let display = format!("profile block in {}", profile.display());
        let has_block = fs::read_to_string(&profile)
            .map(|content| content.contains(PROFILE_BLOCK_BEGIN))
            .unwrap_or(false);
        if has_block {
            planned.push(display.clone());
            if !dry_run && remove_profile_block(&profile)? {
                removed.push(display);
            }
        } else {
            missing.push(display);
        }
    }

    if remove_config {
        let display = ctx.config_path.to_string_lossy().to_string();
        if path_exists(&ctx.config_path) {
            planned.push(display.clone());
            if !dry_run && remove_path(&ctx.config_path)? {
                removed.push(display);
            }
        } else {
            missing.push(display);
        }
        if !dry_run {
            if let Some(config_dir) = ctx.config_path.parent() {
                prune_empty_dir(config_dir);
            }
        }
    }

    output(
        ctx,
        json!({
            "dry_run": dry_run,
            "remove_config": remove_config,
            "planned": planned,
            "removed": removed,
            "missing": missing,
        }),
    )
}

fn handle_backup(ctx: &Context, command: BackupCommand) -> Result<(), SchoolcodeError> {
    let cfg = read_config(&ctx.config_path)?;
    let prefix = resolve_prefix(&cfg, None);
    let layout = prefix_layout(&prefix);
    match command {
        BackupCommand::List => {
            let mut rows = Vec::new();
            for backup in list_backups(&layout.backups_dir)? {
                let meta = read_backup_meta(Path::new(&backup.path));
                rows.push(json!({
                    "stamp": backup.stamp,
                    "path": backup.path,
                    "created_at": meta.as_ref().map(|m| m.created_at.clone()),
                    "source_tree": meta.as_ref().map(|m| m.source_tree.clone()),
                }));
            }
            output(ctx, json!({"backups": rows}))
        }
        BackupCommand::Prune => {
            let removed = prune_backups(&layout.backups_dir, &cfg.backups, Utc::now())?;
            output(ctx, json!({"removed": removed}))
        }
        BackupCommand::Restore { to, yes } => {
            let backups = list_backups(&layout.backups_dir)?;
            let Some(latest) = backups.last() else {
                return Err(SchoolcodeError::Process(
                    "no backups available to restore".to_string(),
                ));
            };
            let chosen = match to {
                Some(stamp) => backups
                    .iter()
                    .find(|backup| backup.stamp == stamp)
                    .cloned()
                    .ok_or_else(|| {
                        SchoolcodeError::Process(format!("backup not found: {stamp}"))
                    })?,
                None => latest.clone(),
            };
            let proceed = confirm(
                &format!(
                    "Replace {} with backup {}?",
                    layout.root.display(),
                    chosen.stamp
                ),
                yes,
            )?;
            if !proceed {
                return Err(SchoolcodeError::Process(
                    "restore declined".to_string(),
                ));
            }
            restore_from_backup(&layout, &chosen.stamp)?;
            let log_path = resolve_log_path(ctx, &cfg, &layout);
            log_event(&log_path, &format!("restored from backup {}", chosen.stamp));
            output(
                ctx,
                json!({"restored": true, "stamp": chosen.stamp, "dest": layout.root}),
            )
        }
    }
}

fn handle_shim(
    ctx: &Context,
    command: ShimCommand,
    lookup: &dyn ExecLookup,
    identity_source: &dyn IdentitySource,
) -> Result<(), SchoolcodeError> {
    let cfg = read_config(&ctx.config_path)?;
    let prefix = resolve_prefix(&cfg, None);
    let layout = prefix_layout(&prefix);
    match command {
        ShimCommand::List => {
            let mut rows = Vec::new();
            for tool in cfg.tools.keys() {
                let shim_path = layout.shims_dir.join(tool);
                rows.push(json!({
                    "tool": tool,
                    "path": shim_path,
                    "installed": shim_path.exists() && is_managed_shim(&shim_path),
                }));
            }
            output(ctx, json!({"shims": rows}))
        }
        ShimCommand::Exec { tool, argv } => {
            let mut passthrough = argv;
            if passthrough.first().map(|arg| arg == "--").unwrap_or(false) {
                passthrough.remove(0);
            }
            let spec = cfg.tools.get(&tool).ok_or_else(|| {
                SchoolcodeError::Process(format!("unknown managed tool: {tool}"))
            })?;
            let identity = resolve_identity(&cfg.policy.restricted_user, identity_source)?;
            let rule_set = read_rule_set(&layout.rules_path)?;
            let decision = mediate(&rule_set, &tool, &passthrough, &identity);
            let log_path = resolve_log_path(ctx, &cfg, &layout);
            // Tool, subcommand, identity class and decision only; argv may
            // carry credentials and must never reach the log.
            log_event(
                &log_path,
                &format!(
                    "mediate tool={} subcommand={} identity={} decision={}",
                    tool,
                    leading_subcommand(&passthrough).unwrap_or("-"),
                    if identity.restricted {
                        "restricted"
                    } else {
                        "standard"
                    },
                    decision.label()
                ),
            );
            match decision {
                Decision::Reject(reason) => Err(SchoolcodeError::Rejected { tool, reason }),
                Decision::Forward(args) => {
                    let real = resolve_tool_executable(&tool, spec, &layout.shims_dir, lookup)
                        .ok_or_else(|| {
                            SchoolcodeError::Process(format!(
                                "unable to locate the real executable for {tool}"
                            ))
                        })?;
                    let status = Command::new(&real).args(&args).status()?;
                    std::process::exit(status.code().unwrap_or(1));
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use tempfile::tempdir;

    struct MockRunner {
        calls: RefCell<Vec<(String, Vec<String>)>>,
        responses: RefCell<BTreeMap<String, CommandOutput>>,
    }

    impl MockRunner {
        fn new() -> Self {
            Self {
                calls: RefCell::new(Vec::new()),
                responses: RefCell::new(BTreeMap::new()),
            }
        }

        fn respond(self, program: &str, status_code: i32, stdout: &str) -> Self {
            self.responses.borrow_mut().insert(
                program.to_string(),
                CommandOutput {
                    status_code,
                    stdout: stdout.as_bytes().to_vec(),
                    stderr: Vec::new(),
                },
            );
            self
        }

        fn calls_to(&self, program: &str) -> usize {
            self.calls
                .borrow()
                .iter()
                .filter(|(name, _)| name == program)
                .count()
        }
    }

    impl CommandRunner for MockRunner {
        fn run(
            &self,
            program: &str,
            args: &[String],
            _timeout: Option<Duration>,
        ) -> Result<CommandOutput, io::Error> {
            self.calls
                .borrow_mut()
                .push((program.to_string(), args.to_vec()));
            Ok(self
                .responses
                .borrow()
                .get(program)
                .cloned()
                .unwrap_or(CommandOutput {
                    status_code: 0,
                    stdout: Vec::new(),
                    stderr: Vec::new(),
                }))
        }
    }

    struct MockLookup {
        map: BTreeMap<String, PathBuf>,
    }

    impl MockLookup {
        fn new() -> Self {
            Self {
                map: BTreeMap::new(),
            }
        }

        fn with(mut self, name: &str, path: impl Into<PathBuf>) -> Self {
            self.map.insert(name.to_string(), path.into());
            self
        }
    }

    impl ExecLookup for MockLookup {
        fn which(&self, name: &str) -> Option<PathBuf> {
            self.map.get(name).cloned()
        }
    }

    struct FakeIdentity {
        effective: Option<String>,
        uid: u32,
        console: Option<String>,
        hint: Option<String>,
    }

    impl IdentitySource for FakeIdentity {
        fn effective_user(&self) -> Option<String> {
            self.effective.clone()
        }

        fn effective_uid(&self) -> Option<u32> {
            Some(self.uid)
        }

        fn console_user(&self) -> Option<String> {
            self.console.clone()
        }

        fn env_user_hint(&self) -> Option<String> {
            self.hint.clone()
        }
    }

    fn test_ctx(dir: &Path) -> Context {
        Context {
            config_path: dir.join("config.yaml"),
            json: false,
            quiet: true,
            verbose: false,
            log_file: None,
        }
    }

    fn df_output(available_kb: u64) -> String {
        format!(
            "Filesystem 1024-blocks Used Available Capacity Mounted on\n/dev/disk1s1 999999999 1000 {available_kb} 1% /\n"
        )
    }

    fn passing_runner() -> MockRunner {
        MockRunner::new().respond("df", 0, &df_output(20_000_000))
    }

    fn write_exec(path: &Path) {
        write_atomic_text_file(path, "#!/bin/sh\nexit 0\n", Some(0o755)).unwrap();
    }

    fn restricted_identity() -> Identity {
        Identity {
            effective_user: "Guest".to_string(),
            console_user: None,
            is_elevated: false,
            restricted: true,
        }
    }

    fn standard_identity() -> Identity {
        Identity {
            effective_user: "teacher".to_string(),
            console_user: None,
            is_elevated: false,
            restricted: false,
        }
    }

    fn args(values: &[&str]) -> Vec<String> {
        values.iter().map(|s| s.to_string()).collect()
    }

    fn install_config(dir: &Path, tool: &str, tool_path: &Path) -> Config {
        let mut cfg = Config::default();
        cfg.paths.prefix = dir.join("prefix").to_string_lossy().to_string();
        cfg.paths.profile_files = vec![dir.join("profile").to_string_lossy().to_string()];
        cfg.tools = BTreeMap::new();
        cfg.tools.insert(
            tool.to_string(),
            ToolSpec {
                kind: ToolKind::Utility,
                candidates: vec![tool_path.to_string_lossy().to_string()],
                rules: vec![rule(None, RuleAction::Allow, RuleScope::All)],
                ..ToolSpec::default()
            },
        );
        cfg
    }

    fn install_opts() -> InstallOptions {
        InstallOptions {
            prefix: None,
            dry_run: false,
            force: false,
            no_backup: false,
            assume_yes: true,
        }
    }

    #[test]
    fn default_config_template_parses_and_validates() {
        let cfg = read_config_from_str(DEFAULT_CONFIG_YAML).unwrap();
        assert_eq!(cfg.version, 1);
        assert_eq!(cfg.policy.restricted_user, "Guest");
        assert_eq!(cfg.tools["brew"].rules.len(), 5);
        assert_eq!(cfg.tools["pip3"].user_scope_flags, vec!["--user"]);
        assert_eq!(cfg.tools["sudo"].kind, ToolKind::Elevation);
    }

    #[test]
    fn config_rejects_unknown_fields() {
        let result = read_config_from_str("version: 1\nbogus: true\n");
        assert!(result.is_err());
    }

    #[test]
    fn config_rejects_rewrite_rule_without_scope_flags() {
        let mut cfg = Config::default();
        cfg.tools.insert(
            "pipx".to_string(),
            ToolSpec {
                kind: ToolKind::DepInstaller,
                rules: vec![rule(
                    Some("install"),
                    RuleAction::RewriteUserScope,
                    RuleScope::RestrictedOnly,
                )],
                ..ToolSpec::default()
            },
        );
        assert!(validate_config(&cfg).is_err());
    }

    #[test]
    fn version_comparison_is_numeric_not_lexical() {
        assert!(version_below("9.9", "12.0"));
        assert!(!version_below("13.4.1", "12.0"));
        assert!(version_below("12.7", "13.0"));
        assert!(!version_below("13.0", "13.0"));
    }

    #[test]
    fn os_version_classification_uses_both_floors() {
        assert_eq!(classify_os_version("11.2", "12.0", "13.0"), CheckStatus::Fail);
        assert_eq!(classify_os_version("12.6", "12.0", "13.0"), CheckStatus::Warn);
        assert_eq!(classify_os_version("14.1", "12.0", "13.0"), CheckStatus::Pass);
    }

    #[test]
    fn df_parsing_reads_the_available_column() {
        assert_eq!(parse_df_available_kb(&df_output(1_048_576)), Some(1_048_576));
        assert_eq!(parse_df_available_kb("garbage"), None);
    }

    #[test]
    fn disk_classification_uses_both_floors() {
        assert_eq!(classify_disk_space(512, 1024, 5120), CheckStatus::Fail);
        assert_eq!(classify_disk_space(2048, 1024, 5120), CheckStatus::Warn);
        assert_eq!(classify_disk_space(8192, 1024, 5120), CheckStatus::Pass);
    }

    #[test]
    fn probe_verdict_is_the_worst_status() {
        let checks = vec![
            probe_check("a", CheckStatus::Pass, "", "", json!({})),
            probe_check("b", CheckStatus::Warn, "", "", json!({})),
        ];
        assert_eq!(probe_verdict(&checks), CheckStatus::Warn);
        assert_eq!(probe_verdict(&[]), CheckStatus::Pass);
    }

    #[test]
    fn leading_subcommand_skips_flags() {
        assert_eq!(
            leading_subcommand(&args(&["-v", "--quiet", "install", "wget"])),
            Some("install")
        );
        assert_eq!(leading_subcommand(&args(&["--version"])), None);
        assert_eq!(leading_subcommand(&[]), None);
    }

    #[test]
    fn rule_set_generation_collects_elevation_tools_and_scope_flags() {
        let rule_set = generate_rule_set(&Config::default());
        assert_eq!(rule_set.elevation_tools, vec!["sudo"]);
        let rewrite = rule_set
            .rules
            .iter()
            .find(|r| r.tool == "pip3" && r.action == RuleAction::RewriteUserScope)
            .unwrap();
        assert_eq!(rewrite.scope_flags, vec!["--user"]);
    }

    #[test]
    fn restricted_package_manager_install_is_blocked() {
        let rule_set = generate_rule_set(&Config::default());
        let decision = mediate(
            &rule_set,
            "brew",
            &args(&["install", "wget"]),
            &restricted_identity(),
        );
        assert_eq!(decision, Decision::Reject(BLOCK_REASON.to_string()));
    }

    #[test]
    fn standard_identity_is_not_subject_to_restricted_rules() {
        let rule_set = generate_rule_set(&Config::default());
        let invocation = args(&["install", "wget"]);
        let decision = mediate(&rule_set, "brew", &invocation, &standard_identity());
        assert_eq!(decision, Decision::Forward(invocation));
    }

    #[test]
    fn unmatched_subcommand_falls_through_to_the_wildcard() {
        let rule_set = generate_rule_set(&Config::default());
        let invocation = args(&["list"]);
        let decision = mediate(&rule_set, "brew", &invocation, &restricted_identity());
        assert_eq!(decision, Decision::Forward(invocation));
    }

    #[test]
    fn exact_rule_beats_wildcard_regardless_of_order() {
        let rule_set = PolicyRuleSet {
            version: 1,
            generated_at: now_rfc3339(),
            elevation_tools: Vec::new(),
            rules: vec![
                PolicyRule {
                    tool: "pkg".to_string(),
                    subcommand: None,
                    action: RuleAction::Allow,
                    applies_to: RuleScope::All,
                    scope_flags: Vec::new(),
                },
                PolicyRule {
                    tool: "pkg".to_string(),
                    subcommand: Some("install".to_string()),
                    action: RuleAction::Block,
                    applies_to: RuleScope::RestrictedOnly,
                    scope_flags: Vec::new(),
                },
            ],
        };
        let decision = mediate(
            &rule_set,
            "pkg",
            &args(&["install"]),
            &restricted_identity(),
        );
        assert_eq!(decision, Decision::Reject(BLOCK_REASON.to_string()));
    }

    #[test]
    fn mediation_is_deterministic() {
        let rule_set = generate_rule_set(&Config::default());
        let invocation = args(&["install", "requests"]);
        let first = mediate(&rule_set, "pip3", &invocation, &restricted_identity());
        let second = mediate(&rule_set, "pip3", &invocation, &restricted_identity());
        assert_eq!(first, second);
    }

    #[test]
    fn rewrite_injects_the_scope_flag_after_the_subcommand() {
        let rule_set = generate_rule_set(&Config::default());
        let decision = mediate(
            &rule_set,
            "pip3",
            &args(&["install", "requests"]),
            &restricted_identity(),
        );
        assert_eq!(
            decision,
            Decision::Forward(args(&["install", "--user", "requests"]))
        );
    }

    #[test]
    fn rewrite_does_not_duplicate_an_existing_scope_flag() {
        let rule_set = generate_rule_set(&Config::default());
        let invocation = args(&["install", "--user", "requests"]);
        let decision = mediate(&rule_set, "pip3", &invocation, &restricted_identity());
        assert_eq!(decision, Decision::Forward(invocation));
    }

    #[test]
    fn elevation_is_rejected_outright_for_the_restricted_identity() {
        let rule_set = generate_rule_set(&Config::default());
        for invocation in [args(&["ls", "/"]), args(&["-i"]), Vec::new()] {
            let decision = mediate(&rule_set, "sudo", &invocation, &restricted_identity());
            assert_eq!(decision, Decision::Reject(ELEVATION_REASON.to_string()));
        }
        let allowed = mediate(&rule_set, "sudo", &args(&["ls"]), &standard_identity());
        assert_eq!(allowed, Decision::Forward(args(&["ls"])));
    }

    #[test]
    fn identity_merge_is_conservative() {
        let by_effective = FakeIdentity {
            effective: Some("Guest".to_string()),
            uid: 501,
            console: Some("teacher".to_string()),
            hint: None,
        };
        assert!(resolve_identity("Guest", &by_effective).unwrap().restricted);

        let by_console = FakeIdentity {
            effective: Some("teacher".to_string()),
            uid: 501,
            console: Some("Guest".to_string()),
            hint: None,
        };
        assert!(resolve_identity("Guest", &by_console).unwrap().restricted);

        let by_hint = FakeIdentity {
            effective: Some("teacher".to_string()),
            uid: 501,
            console: None,
            hint: Some("Guest".to_string()),
        };
        assert!(resolve_identity("Guest", &by_hint).unwrap().restricted);

        let unrelated = FakeIdentity {
            effective: Some("teacher".to_string()),
            uid: 501,
            console: Some("teacher".to_string()),
            hint: Some("teacher".to_string()),
        };
        assert!(!resolve_identity("Guest", &unrelated).unwrap().restricted);
    }

    #[test]
    fn identity_resolution_fails_without_an_effective_user() {
        let source = FakeIdentity {
            effective: None,
            uid: 501,
            console: None,
            hint: None,
        };
        assert!(resolve_identity("Guest", &source).is_err());
    }

    #[test]
    fn resolver_prefers_candidates_over_generic_lookup() {
        let dir = tempdir().unwrap();
        let preferred = dir.path().join("preferred/tool");
        let fallback = dir.path().join("fallback/tool");
        write_exec(&preferred);
        write_exec(&fallback);
        let spec = ToolSpec {
            candidates: vec![preferred.to_string_lossy().to_string()],
            ..ToolSpec::default()
        };
        let lookup = MockLookup::new().with("tool", &fallback);
        let resolved =
            resolve_tool_executable("tool", &spec, &dir.path().join("shims"), &lookup).unwrap();
        assert_eq!(resolved, preferred);
    }

    #[test]
    fn resolver_skips_shim_marked_and_missing_candidates() {
        let dir = tempdir().unwrap();
        let stale = dir.path().join("stale/tool");
        write_atomic_text_file(&stale, &format!("#!/bin/sh\n{SHIM_MARKER}\n"), Some(0o755))
            .unwrap();
        let real = dir.path().join("real/tool");
        write_exec(&real);
        let spec = ToolSpec {
            candidates: vec![
                dir.path().join("missing/tool").to_string_lossy().to_string(),
                stale.to_string_lossy().to_string(),
            ],
            ..ToolSpec::default()
        };
        let lookup = MockLookup::new().with("tool", &real);
        let resolved =
            resolve_tool_executable("tool", &spec, &dir.path().join("shims"), &lookup).unwrap();
        assert_eq!(resolved, real);
    }

    #[test]
    fn resolver_never_returns_anything_under_the_shims_dir() {
        let dir = tempdir().unwrap();
        let shims = dir.path().join("shims");
        let inside = shims.join("tool");
        write_exec(&inside);
        let spec = ToolSpec {
            candidates: vec![inside.to_string_lossy().to_string()],
            ..ToolSpec::default()
        };
        let lookup = MockLookup::new().with("tool", &inside);
        assert!(resolve_tool_executable("tool", &spec, &shims, &lookup).is_none());
    }

    #[test]
    fn written_shims_carry_the_marker_and_are_executable() {
        let dir = tempdir().unwrap();
        let shim = dir.path().join("shims/brew");
        write_shim(&shim, Path::new("/usr/local/bin/schoolcode"), "brew").unwrap();
        assert!(is_managed_shim(&shim));
        assert!(is_executable_file(&shim));
        let body = fs::read_to_string(&shim).unwrap();
        assert!(body.contains("shim exec brew -- \"$@\""));
    }

    #[test]
    fn profile_block_upsert_is_idempotent_and_collapses_duplicates() {
        let block = format!("{PROFILE_BLOCK_BEGIN}\nexport PATH=\"/p/shims:$PATH\"\n{PROFILE_BLOCK_END}\n");
        let doubled = format!("# mine\n{block}\nstale\n{block}");
        let once = upsert_profile_block(&doubled, &block);
        assert_eq!(once.matches(PROFILE_BLOCK_BEGIN).count(), 1);
        assert!(once.contains("# mine"));
        assert!(once.contains("stale"));
        let twice = upsert_profile_block(&once, &block);
        assert_eq!(twice, once);
    }

    #[test]
    fn profile_block_removal_preserves_surrounding_content() {
        let dir = tempdir().unwrap();
        let profile = dir.path().join("profile");
        let block = format!("{PROFILE_BLOCK_BEGIN}\nexport PATH=x\n{PROFILE_BLOCK_END}\n");
        fs::write(&profile, format!("alias ll='ls -l'\n{block}")).unwrap();
        assert!(remove_profile_block(&profile).unwrap());
        let remaining = fs::read_to_string(&profile).unwrap();
        assert!(remaining.contains("alias ll"));
        assert!(!remaining.contains(PROFILE_BLOCK_BEGIN));
        assert!(!remove_profile_block(&profile).unwrap());
    }

    #[test]
    fn snapshot_excludes_prior_archives_and_the_run_lock() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("prefix");
        fs::create_dir_all(source.join("state")).unwrap();
        fs::create_dir_all(source.join("backups/old")).unwrap();
        fs::write(source.join("state").join(LOCK_FILE_NAME), "pid=1\n").unwrap();
        fs::write(source.join("keep.txt"), "payload\n").unwrap();

        let backups_dir = source.join("backups");
        let backup = snapshot_tree(&source, &backups_dir).unwrap();
        let archive = PathBuf::from(&backup.path);
        assert!(archive.join("tree/keep.txt").exists());
        assert!(!archive.join("tree/backups").exists());
        assert!(!archive.join("tree/state").join(LOCK_FILE_NAME).exists());
        assert!(read_backup_meta(&archive).is_some());
        assert!(!backups_dir.join(format!("{}.partial", backup.stamp)).exists());
    }

    #[test]
    fn restore_round_trips_the_snapshotted_tree() {
        let dir = tempdir().unwrap();
        let source = dir.path().join("prefix");
        fs::create_dir_all(source.join("state")).unwrap();
        fs::write(source.join("keep.txt"), "original\n").unwrap();
        let backups_dir = dir.path().join("backups");
        let backup = snapshot_tree(&source, &backups_dir).unwrap();

        fs::write(source.join("keep.txt"), "clobbered\n").unwrap();
        fs::write(source.join("stray.txt"), "stray\n").unwrap();
        restore_tree(Path::new(&backup.path), &source).unwrap();
        assert_eq!(fs::read_to_string(source.join("keep.txt")).unwrap(), "original\n");
        assert!(!source.join("stray.txt").exists());
        assert!(!source.join(RESTORE_INCOMPLETE_FLAG).exists());
    }

    #[test]
    fn restore_refuses_an_archive_without_a_tree_payload() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("20240101-000000");
        fs::create_dir_all(&archive).unwrap();
        assert!(restore_tree(&archive, &dir.path().join("dest")).is_err());
    }

    fn write_archive(backups_dir: &Path, stamp: &str, created_at: DateTime<Utc>) {
        let archive = backups_dir.join(stamp);
        fs::create_dir_all(archive.join("tree")).unwrap();
        let meta = BackupMeta {
            created_at: created_at.to_rfc3339_opts(SecondsFormat::Secs, true),
            source_tree: "/tmp/prefix".to_string(),
        };
        fs::write(
            archive.join("meta.json"),
            serde_json::to_string(&meta).unwrap(),
        )
        .unwrap();
    }

    #[test]
    fn pruning_enforces_the_archive_count() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        for stamp in ["20240101-000000", "20240102-000000", "20240103-000000"] {
            write_archive(dir.path(), stamp, now);
        }
        let retention = BackupRetention {
            max_count: 1,
            max_age_days: 3650,
        };
        let removed = prune_backups(dir.path(), &retention, now).unwrap();
        assert_eq!(removed, vec!["20240101-000000", "20240102-000000"]);
        assert!(dir.path().join("20240103-000000").exists());
    }

    #[test]
    fn pruning_enforces_the_archive_age() {
        let dir = tempdir().unwrap();
        let now = Utc::now();
        write_archive(dir.path(), "20200101-000000", now - chrono::Duration::days(40));
        write_archive(dir.path(), "20260101-000000", now);
        let retention = BackupRetention {
            max_count: 10,
            max_age_days: 30,
        };
        let removed = prune_backups(dir.path(), &retention, now).unwrap();
        assert_eq!(removed, vec!["20200101-000000"]);
        assert!(dir.path().join("20260101-000000").exists());
    }

    #[test]
    fn install_lock_is_exclusive_and_released_on_drop() {
        let dir = tempdir().unwrap();
        let lock_path = dir.path().join("state").join(LOCK_FILE_NAME);
        let lock = InstallLock::acquire(&lock_path).unwrap();
        assert!(InstallLock::acquire(&lock_path).is_err());
        drop(lock);
        assert!(InstallLock::acquire(&lock_path).is_ok());
    }

    #[test]
    fn dry_run_install_plans_without_touching_the_filesystem() {
        let dir = tempdir().unwrap();
        let mut cfg = Config::default();
        cfg.paths.prefix = dir.path().join("prefix").to_string_lossy().to_string();
        cfg.paths.profile_files = vec![dir.path().join("profile").to_string_lossy().to_string()];
        let runner = passing_runner();
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());
        let opts = InstallOptions {
            dry_run: true,
            ..install_opts()
        };

        let state = run_install(&ctx, &cfg, &opts, &runner, &lookup).unwrap();
        assert_eq!(state.phase, Phase::Complete);
        assert!(!state.planned.is_empty());
        assert!(!dir.path().join("prefix").exists());
        assert!(!dir.path().join("profile").exists());
    }

    #[test]
    fn force_does_not_bypass_a_hard_precheck_failure() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("tools/mytool");
        write_exec(&tool);
        let cfg = install_config(dir.path(), "mytool", &tool);
        let runner = MockRunner::new().respond("df", 0, &df_output(100 * 1024));
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());
        let opts = InstallOptions {
            force: true,
            ..install_opts()
        };

        let state = run_install(&ctx, &cfg, &opts, &runner, &lookup).unwrap();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.failed_phase, Some("precheck"));
        // The partial tree is removed once the failure is acknowledged.
        assert!(!dir.path().join("prefix").exists());
    }

    #[test]
    fn install_is_idempotent_across_runs() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("tools/mytool");
        write_exec(&tool);
        let cfg = install_config(dir.path(), "mytool", &tool);
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());
        let prefix = dir.path().join("prefix");

        for _ in 0..2 {
            let runner = passing_runner();
            let state = run_install(&ctx, &cfg, &install_opts(), &runner, &lookup).unwrap();
            assert_eq!(state.phase, Phase::Complete);
        }

        assert!(is_managed_shim(&prefix.join("shims/mytool")));
        assert!(path_exists(&prefix.join("bin/mytool")));
        assert_eq!(
            fs::read_to_string(prefix.join("state").join(VERSION_MARKER_NAME))
                .unwrap()
                .trim(),
            env!("CARGO_PKG_VERSION")
        );
        read_rule_set(&prefix.join("policy").join(RULES_FILE_NAME)).unwrap();
        let profile = fs::read_to_string(dir.path().join("profile")).unwrap();
        assert_eq!(profile.matches(PROFILE_BLOCK_BEGIN).count(), 1);
        assert!(!prefix.join("state").join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn failed_install_restores_the_previous_tree_from_backup() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("tools/atool");
        write_exec(&tool);
        let cfg = install_config(dir.path(), "atool", &tool);
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());
        let prefix = dir.path().join("prefix");

        let runner = passing_runner();
        let first = run_install(&ctx, &cfg, &install_opts(), &runner, &lookup).unwrap();
        assert_eq!(first.phase, Phase::Complete);

        // Second run adds a tool whose executable cannot be found, which
        // fails verification after shims were already written.
        let mut broken = cfg.clone();
        broken.tools.insert(
            "btool".to_string(),
            ToolSpec {
                kind: ToolKind::Utility,
                candidates: vec![dir
                    .path()
                    .join("tools/never-there")
                    .to_string_lossy()
                    .to_string()],
                rules: vec![rule(None, RuleAction::Allow, RuleScope::All)],
                ..ToolSpec::default()
            },
        );
        let runner = passing_runner();
        let second = run_install(&ctx, &broken, &install_opts(), &runner, &lookup).unwrap();
        assert_eq!(second.phase, Phase::Failed);
        assert_eq!(second.failed_phase, Some("verify"));
        assert!(second.restored_from_backup);

        assert!(is_managed_shim(&prefix.join("shims/atool")));
        assert!(!prefix.join("shims/btool").exists());
        assert!(prefix.join("state").join(VERSION_MARKER_NAME).exists());
        // The archive survives its own restore.
        let stamp = second.backup.as_ref().unwrap().stamp.clone();
        assert!(prefix.join("backups").join(stamp).exists());
    }

    #[test]
    fn acquisition_retries_are_bounded() {
        let dir = tempdir().unwrap();
        let mut cfg = install_config(dir.path(), "mytool", &dir.path().join("tools/mytool"));
        write_exec(&dir.path().join("tools/mytool"));
        cfg.acquisition.attempts = 2;
        cfg.tools.insert(
            "pm".to_string(),
            ToolSpec {
                kind: ToolKind::PackageManager,
                candidates: vec![dir.path().join("tools/absent").to_string_lossy().to_string()],
                acquire_commands: vec!["true".to_string()],
                rules: vec![rule(None, RuleAction::Allow, RuleScope::All)],
                ..ToolSpec::default()
            },
        );
        let runner = passing_runner();
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());

        let state = run_install(&ctx, &cfg, &install_opts(), &runner, &lookup).unwrap();
        assert_eq!(state.phase, Phase::Failed);
        assert_eq!(state.failed_phase, Some("acquire"));
        assert_eq!(runner.calls_to("/bin/sh"), 2);
    }

    #[test]
    fn repair_applies_nothing_on_a_healthy_tree() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("tools/mytool");
        write_exec(&tool);
        let cfg = install_config(dir.path(), "mytool", &tool);
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());
        let runner = passing_runner();
        run_install(&ctx, &cfg, &install_opts(), &runner, &lookup).unwrap();

        let layout = prefix_layout(&dir.path().join("prefix"));
        let first = run_repair(&ctx, &cfg, &layout, &runner, false).unwrap();
        assert!(first.failures.is_empty());
        let second = run_repair(&ctx, &cfg, &layout, &runner, false).unwrap();
        assert!(second.applied.is_empty());
    }

    #[test]
    fn repair_rewrites_a_deleted_shim_but_not_a_foreign_binary() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("tools/mytool");
        write_exec(&tool);
        let cfg = install_config(dir.path(), "mytool", &tool);
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());
        let runner = passing_runner();
        run_install(&ctx, &cfg, &install_opts(), &runner, &lookup).unwrap();

        let layout = prefix_layout(&dir.path().join("prefix"));
        let shim = layout.shims_dir.join("mytool");
        fs::remove_file(&shim).unwrap();
        let report = run_repair(&ctx, &cfg, &layout, &runner, false).unwrap();
        assert!(report.applied.iter().any(|a| a.contains("mytool")));
        assert!(is_managed_shim(&shim));

        fs::write(&shim, "not ours\n").unwrap();
        let report = run_repair(&ctx, &cfg, &layout, &runner, false).unwrap();
        assert!(report.failures.iter().any(|f| f.contains("refusing")));
        assert_eq!(fs::read_to_string(&shim).unwrap(), "not ours\n");
    }

    #[test]
    fn repair_skips_everything_when_not_installed() {
        let dir = tempdir().unwrap();
        let cfg = install_config(dir.path(), "mytool", &dir.path().join("tools/mytool"));
        let ctx = test_ctx(dir.path());
        let runner = passing_runner();
        let layout = prefix_layout(&dir.path().join("prefix"));
        let report = run_repair(&ctx, &cfg, &layout, &runner, false).unwrap();
        assert!(report.applied.is_empty());
        assert!(!report.skipped.is_empty());
    }

    fn find_check<'a>(checks: &'a [ProbeCheck], id: &str) -> &'a ProbeCheck {
        checks.iter().find(|check| check.id == id).unwrap()
    }

    #[test]
    fn toolchain_probe_requires_liveness_not_just_presence() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("tools/mytool");
        write_exec(&tool);
        let manager = dir.path().join("tools/pm");
        write_exec(&manager);
        let mut cfg = install_config(dir.path(), "mytool", &tool);
        cfg.tools.insert(
            "pm".to_string(),
            ToolSpec {
                kind: ToolKind::PackageManager,
                candidates: vec![manager.to_string_lossy().to_string()],
                rules: vec![rule(None, RuleAction::Allow, RuleScope::All)],
                ..ToolSpec::default()
            },
        );
        let layout = prefix_layout(&dir.path().join("prefix"));

        // The package manager exists but cannot answer `--version`.
        let runner = passing_runner().respond(&manager.to_string_lossy(), 1, "");
        let lookup = MockLookup::new()
            .with("curl", "/fake/curl")
            .with("git", "/fake/git");
        let checks = collect_probe_checks(&cfg, &layout, &runner, &lookup, false);
        let toolchain = find_check(&checks, "toolchain");
        assert_eq!(toolchain.status, CheckStatus::Warn);
        assert!(toolchain.message.contains("pm is present but not responding"));
        // The host OS version is resolved at most once per probe pass.
        assert!(runner.calls_to("sw_vers") <= 1);

        let no_curl = MockLookup::new().with("git", "/fake/git");
        let checks = collect_probe_checks(&cfg, &layout, &runner, &no_curl, false);
        assert_eq!(find_check(&checks, "toolchain").status, CheckStatus::Fail);

        let broken_git = passing_runner().respond("/fake/git", 1, "");
        let checks = collect_probe_checks(&cfg, &layout, &broken_git, &lookup, false);
        let toolchain = find_check(&checks, "toolchain");
        assert_eq!(toolchain.status, CheckStatus::Warn);
        assert!(toolchain.message.contains("git is present but not responding"));
    }

    #[cfg(unix)]
    #[test]
    fn failed_restore_leaves_an_explicit_incomplete_flag() {
        let dir = tempdir().unwrap();
        let archive = dir.path().join("20240101-000000");
        let tree = archive.join("tree");
        fs::create_dir_all(&tree).unwrap();
        fs::write(tree.join("good.txt"), "ok\n").unwrap();
        // A socket cannot be copied as a regular file, so extraction fails
        // partway through.
        let _blocker = std::os::unix::net::UnixListener::bind(tree.join("sock")).unwrap();

        let dest = dir.path().join("dest");
        assert!(restore_tree(&archive, &dest).is_err());
        assert!(dest.join(RESTORE_INCOMPLETE_FLAG).exists());
    }

    #[cfg(unix)]
    #[test]
    fn snapshot_failure_downgrades_recovery_instead_of_aborting() {
        let dir = tempdir().unwrap();
        let tool = dir.path().join("tools/mytool");
        write_exec(&tool);
        let cfg = install_config(dir.path(), "mytool", &tool);
        let lookup = MockLookup::new()
            .with("curl", "/usr/bin/curl")
            .with("git", "/usr/bin/git");
        let ctx = test_ctx(dir.path());
        let runner = passing_runner();
        run_install(&ctx, &cfg, &install_opts(), &runner, &lookup).unwrap();

        // An uncopyable entry in the tree makes the snapshot fail; the run
        // must continue with recovery downgraded, not abort.
        let prefix = dir.path().join("prefix");
        let _blocker =
            std::os::unix::net::UnixListener::bind(prefix.join("state/uncopyable")).unwrap();
        let runner = passing_runner();
        let state = run_install(&ctx, &cfg, &install_opts(), &runner, &lookup).unwrap();
        assert_eq!(state.phase, Phase::Complete);
        assert!(state.backup.is_none());
        assert!(state
            .warnings
            .iter()
            .any(|warning| warning.contains("rollback will be unavailable")));
        // The failed staging directory does not linger as a partial archive.
        assert!(list_backups(&prefix.join("backups")).unwrap().is_empty());
    }
}
