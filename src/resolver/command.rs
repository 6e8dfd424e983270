use super::{ResolvedStream, Resolver, ResolverError};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, warn};
use url::Url;

/// Resolver backed by an external program that prints the stream URL.
///
/// The program is invoked as `<program> <args...> [--cookies FILE]
/// [--proxy PROXY] <media_ref>` and its first non-empty stdout line is taken
/// as the stream URL. The child is killed if the call is dropped.
#[derive(Debug, Clone)]
pub struct CommandResolver {
    program: String,
    args: Vec<String>,
    cookies: Option<PathBuf>,
    proxy: Option<String>,
    label: String,
}

impl CommandResolver {
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        let program = program.into();
        Self {
            label: program.clone(),
            program,
            args,
            cookies: None,
            proxy: None,
        }
    }

    /// Pass a cookies file to the program
    pub fn with_cookies(mut self, path: impl Into<PathBuf>) -> Self {
        self.cookies = Some(path.into());
        self
    }

    /// Route the program through `proxy`
    pub fn with_proxy(mut self, proxy: impl Into<String>) -> Self {
        let proxy = proxy.into();
        self.label = format!("{} via {}", self.program, redact_proxy(&proxy));
        self.proxy = Some(proxy);
        self
    }

    fn command(&self, media_ref: &str) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        if let Some(cookies) = &self.cookies {
            cmd.arg("--cookies").arg(cookies);
        }
        if let Some(proxy) = &self.proxy {
            cmd.arg("--proxy").arg(proxy);
        }
        cmd.arg(media_ref)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        cmd
    }
}

#[async_trait]
impl Resolver for CommandResolver {
    async fn resolve(&self, media_ref: &str) -> Result<ResolvedStream, ResolverError> {
        debug!("Running {} for {}", self.label, media_ref);

        let output = self
            .command(media_ref)
            .output()
            .await
            .map_err(|source| ResolverError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let message = last_line(&String::from_utf8_lossy(&output.stderr))
                .unwrap_or("no diagnostic output")
                .to_string();
            warn!("{} failed for {}: {}", self.label, media_ref, message);
            return Err(ResolverError::Exit {
                status: output.status.to_string(),
                message,
            });
        }

        parse_stream_url(&String::from_utf8_lossy(&output.stdout)).map(ResolvedStream::direct)
    }

    fn name(&self) -> &str {
        &self.label
    }
}

/// Pick the stream URL out of resolver stdout.
pub fn parse_stream_url(stdout: &str) -> Result<String, ResolverError> {
    let line = stdout
        .lines()
        .map(str::trim)
        .find(|line| !line.is_empty())
        .ok_or(ResolverError::NoOutput)?;

    match Url::parse(line) {
        Ok(url) if matches!(url.scheme(), "http" | "https") && url.host().is_some() => {
            Ok(line.to_string())
        }
        _ => Err(ResolverError::InvalidOutput(truncate(line, 120))),
    }
}

/// Read a proxy list: one proxy per line, blanks and `#` comments skipped.
/// A missing file yields an empty list.
pub fn load_proxies(path: &Path) -> std::io::Result<Vec<String>> {
    match std::fs::read_to_string(path) {
        Ok(contents) => Ok(contents
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty() && !line.starts_with('#'))
            .map(str::to_string)
            .collect()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e),
    }
}

fn last_line(text: &str) -> Option<&str> {
    text.lines().map(str::trim).filter(|l| !l.is_empty()).next_back()
}

fn truncate(text: &str, max: usize) -> String {
    match text.char_indices().nth(max) {
        Some((idx, _)) => format!("{}...", &text[..idx]),
        None => text.to_string(),
    }
}

/// Strip credentials from a proxy URL before it reaches a log line
fn redact_proxy(proxy: &str) -> String {
    match Url::parse(proxy) {
        Ok(mut url) if !url.username().is_empty() || url.password().is_some() => {
            let _ = url.set_username("");
            let _ = url.set_password(None);
            url.to_string()
        }
        _ => proxy.to_string(),
    }
}
