//! 意图识别：判断一次待执行 / 已执行的工具调用是否需要人工介入
//!
//! 纯函数，无状态无副作用；状态全部在 SuspendCoordinator 中。
//! - 执行前：交互式命令（ssh、mysql REPL…）、提权命令（sudo）、启动 GUI 应用
//! - 执行后：浏览器页面出现登录入口、API 返回鉴权失败

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

use crate::core::error::auth_status_code;
use crate::core::ToolInvocation;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntentKind {
    None,
    InteractiveCommand,
    ExternalApplication,
    SudoPassword,
    AuthenticationRequired,
    ApiAuthentication,
}

impl IntentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            IntentKind::None => "none",
            IntentKind::InteractiveCommand => "interactive_command",
            IntentKind::ExternalApplication => "external_application",
            IntentKind::SudoPassword => "sudo_password",
            IntentKind::AuthenticationRequired => "authentication_required",
            IntentKind::ApiAuthentication => "api_authentication",
        }
    }
}

/// 识别结果：类别 + 给用户看的提示 + 结构化细节（命中的命令/标记等）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Intent {
    pub kind: IntentKind,
    pub message: String,
    pub details: Value,
}

impl Intent {
    pub fn none() -> Self {
        Self {
            kind: IntentKind::None,
            message: String::new(),
            details: Value::Null,
        }
    }

    pub fn is_none(&self) -> bool {
        self.kind == IntentKind::None
    }
}

/// 识别输入：执行前只有调用本身，执行后还有结果文本
#[derive(Debug, Clone, Copy)]
pub enum DetectionInput<'a> {
    Pending(&'a ToolInvocation),
    Completed {
        call: &'a ToolInvocation,
        result: &'a str,
    },
}

const COMMAND_TOOLS: &[&str] = &[
    "run_command",
    "execute_command",
    "shell",
    "bash",
    "terminal",
    "run_shell",
];

const COMMAND_ARG_KEYS: &[&str] = &["command", "cmd", "script"];

const LAUNCH_APP_TOOLS: &[&str] = &["open_application", "launch_app", "open_app"];

const GUI_PROGRAMS: &[&str] = &[
    "code", "gimp", "firefox", "google-chrome", "chromium", "chrome", "safari", "libreoffice",
    "soffice", "vlc", "xcode", "idea", "pycharm", "gedit", "thunderbird", "slack", "zoom",
    "obsidian", "notepad", "notepad.exe", "mspaint", "calc.exe", "explorer", "explorer.exe",
];

/// 页面上出现即视为登录墙的标记
pub(crate) const LOGIN_MARKERS: &[&str] = &[
    "type=\"password\"",
    "type='password'",
    "input[type=password]",
    "please sign in",
    "please log in",
    "sign in to continue",
    "log in to continue",
    "login required",
    "sign-in required",
    "you must be logged in",
    "session expired",
    "请登录",
    "登录后",
    "扫码登录",
    "账号登录",
    "密码登录",
    "登录/注册",
    "/login",
    "/signin",
    "/sign-in",
    "accounts.google.com",
];

const API_AUTH_MARKERS: &[&str] = &[
    "unauthorized",
    "forbidden",
    "invalid api key",
    "invalid_api_key",
    "incorrect api key",
    "authentication failed",
    "missing credentials",
    "access denied",
    "invalid token",
    "token expired",
];

static SUDO_RE: OnceLock<Regex> = OnceLock::new();

/// 意图识别器
#[derive(Debug, Default, Clone, Copy)]
pub struct IntentDetector;

impl IntentDetector {
    pub fn new() -> Self {
        Self
    }

    pub fn detect(&self, thought: &str, input: DetectionInput<'_>) -> Intent {
        let intent = match input {
            DetectionInput::Pending(call) => detect_pending(call),
            DetectionInput::Completed { call, result } => detect_completed(call, result),
        };
        match intent {
            Some(mut intent) => {
                if let Value::Object(map) = &mut intent.details {
                    map.insert("thought".to_string(), json!(preview(thought, 200)));
                }
                intent
            }
            None => Intent::none(),
        }
    }
}

fn detect_pending(call: &ToolInvocation) -> Option<Intent> {
    let tool = call.tool_name.as_str();
    if LAUNCH_APP_TOOLS.contains(&tool) {
        let app = call
            .first_str_arg(&["app", "application", "name", "path"])
            .unwrap_or("application");
        return Some(Intent {
            kind: IntentKind::ExternalApplication,
            message: format!("需要在桌面上打开外部应用「{app}」，请手动操作完成后点击继续。"),
            details: json!({ "tool": tool, "application": app }),
        });
    }
    if !COMMAND_TOOLS.contains(&tool) {
        return None;
    }
    let command = call.first_str_arg(COMMAND_ARG_KEYS)?.trim();
    if command.is_empty() {
        return None;
    }

    // 优先级：提权 > GUI 应用 > 交互式命令
    if is_sudo(command) {
        return Some(Intent {
            kind: IntentKind::SudoPassword,
            message: format!("命令 `{command}` 需要管理员密码，请在终端中手动执行并输入密码，完成后点击继续。"),
            details: json!({ "tool": tool, "command": command }),
        });
    }
    for segment in command_segments(command) {
        if let Some(program) = external_application(segment) {
            return Some(Intent {
                kind: IntentKind::ExternalApplication,
                message: format!("命令 `{command}` 会启动图形界面程序 {program}，请手动操作完成后点击继续。"),
                details: json!({ "tool": tool, "command": command, "program": program }),
            });
        }
        if let Some(program) = interactive_program(segment) {
            return Some(Intent {
                kind: IntentKind::InteractiveCommand,
                message: format!("命令 `{command}` 需要交互式终端（{program}），请在终端中手动完成后点击继续。"),
                details: json!({ "tool": tool, "command": command, "program": program }),
            });
        }
    }
    None
}

fn detect_completed(call: &ToolInvocation, result: &str) -> Option<Intent> {
    let tool = call.tool_name.as_str();
    let lower = result.to_lowercase();

    if is_browser_tool(tool) {
        let marker = login_marker(&lower)?;
        let url = call.first_str_arg(&["url", "href"]).unwrap_or("");
        return Some(Intent {
            kind: IntentKind::AuthenticationRequired,
            message: "页面需要登录，请在浏览器中完成登录，检测到登录完成后将自动继续。".to_string(),
            details: json!({ "tool": tool, "marker": marker, "url": url }),
        });
    }

    let marker = API_AUTH_MARKERS
        .iter()
        .find(|m| lower.contains(*m))
        .map(|m| m.to_string())
        .or_else(|| auth_status_code(&lower).map(str::to_string))?;
    Some(Intent {
        kind: IntentKind::ApiAuthentication,
        message: format!("工具 {tool} 返回鉴权失败（{marker}），请检查 API Key 或登录凭据后点击继续。"),
        details: json!({ "tool": tool, "marker": marker }),
    })
}

pub(crate) fn is_browser_tool(tool: &str) -> bool {
    tool.starts_with("browser") || tool == "navigate" || tool == "page_goto"
}

/// 返回页面文本中第一个命中的登录标记（输入需已小写）
pub(crate) fn login_marker(lower_text: &str) -> Option<&'static str> {
    LOGIN_MARKERS.iter().copied().find(|m| lower_text.contains(m))
}

fn is_sudo(command: &str) -> bool {
    let re = SUDO_RE.get_or_init(|| {
        Regex::new(r"^(sudo|doas|pkexec)(\s|$)|^su(\s+-)?(\s+\w+)?$").unwrap()
    });
    command_segments(command)
        .into_iter()
        .any(|segment| re.is_match(segment) && !is_non_interactive_sudo(segment))
}

/// sudo -n 不会弹密码；只看本段命令自己的选项
fn is_non_interactive_sudo(segment: &str) -> bool {
    let mut tokens = segment.split_whitespace();
    tokens.next() == Some("sudo")
        && tokens
            .take_while(|t| t.starts_with('-'))
            .any(|t| t == "--non-interactive" || (!t.starts_with("--") && t.contains('n')))
}

/// 按 && / || / ; / | 拆成独立命令段
fn command_segments(command: &str) -> Vec<&str> {
    command
        .split(|c| c == ';' || c == '&' || c == '|')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

fn program_name(token: &str) -> &str {
    token.rsplit(['/', '\\']).next().unwrap_or(token)
}

fn external_application(segment: &str) -> Option<String> {
    let tokens: Vec<&str> = segment.split_whitespace().collect();
    let first = program_name(tokens.first()?);
    let rest = &tokens[1..];

    match first {
        "open" if rest.first() == Some(&"-a") || rest.iter().any(|t| t.ends_with(".app")) => {
            Some("open".to_string())
        }
        "xdg-open" | "gnome-open" | "kde-open" => Some(first.to_string()),
        "start" if !rest.is_empty() => Some("start".to_string()),
        "soffice" | "libreoffice"
            if rest.iter().any(|t| *t == "--headless" || *t == "--convert-to") =>
        {
            None
        }
        _ if GUI_PROGRAMS.contains(&first) => Some(first.to_string()),
        _ => None,
    }
}

fn interactive_program(segment: &str) -> Option<String> {
    let tokens: Vec<&str> = segment.split_whitespace().collect();
    let first = program_name(tokens.first()?);
    let rest = &tokens[1..];
    let has = |flag: &str| rest.iter().any(|t| *t == flag || t.starts_with(&format!("{flag}=")));
    let no_positional = rest.iter().all(|t| t.starts_with('-'));

    let interactive = match first {
        "ssh" => !rest.iter().any(|t| t.contains("BatchMode=yes")),
        "telnet" | "ftp" | "passwd" | "top" | "htop" | "vim" | "vi" | "nano" | "emacs" | "less"
        | "more" | "man" => true,
        "sftp" => !has("-b"),
        "mysql" => !has("-e") && !has("--execute"),
        "psql" => !has("-c") && !has("-f") && !has("--command"),
        "mongo" | "mongosh" => !has("--eval"),
        "redis-cli" => no_positional || rest.iter().all(|t| t.starts_with('-') || t.parse::<u16>().is_ok() || t.contains('.')),
        "sqlite3" => rest.iter().filter(|t| !t.starts_with('-')).count() <= 1,
        "python" | "python3" | "node" | "irb" | "ghci" | "lua" | "R" => {
            rest.is_empty() || rest == ["-i"]
        }
        "docker" | "podman" => {
            matches!(rest.first(), Some(&"exec") | Some(&"run"))
                && rest.iter().any(|t| *t == "-it" || *t == "-ti" || *t == "--interactive")
        }
        "git" => rest.first() == Some(&"rebase") && has("-i"),
        "npm" | "yarn" | "pnpm" => rest.first() == Some(&"init") && !has("-y") && !has("--yes"),
        _ => false,
    };
    interactive.then(|| first.to_string())
}

fn preview(text: &str, max_chars: usize) -> String {
    if text.chars().count() > max_chars {
        format!("{}...", text.chars().take(max_chars).collect::<String>())
    } else {
        text.to_string()
    }
}
