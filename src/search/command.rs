use super::{SearchError, SearchProvider, SearchResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{debug, warn};

/// Search backed by an external program that prints one JSON object per hit.
///
/// Invoked as `<program> <args...> <prefix><limit>:<query>`, e.g.
/// `yt-dlp --flat-playlist --dump-json ytsearch5:lofi beats`.
#[derive(Debug, Clone)]
pub struct CommandSearchProvider {
    program: String,
    args: Vec<String>,
    prefix: String,
    timeout: Duration,
}

/// Fields read from each output line; anything else is ignored
#[derive(Debug, Deserialize)]
struct RawHit {
    id: String,
    title: Option<String>,
    url: Option<String>,
    webpage_url: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    duration: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: String,
}

impl CommandSearchProvider {
    pub fn new(
        program: impl Into<String>,
        args: Vec<String>,
        prefix: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            program: program.into(),
            args,
            prefix: prefix.into(),
            timeout,
        }
    }
}

#[async_trait]
impl SearchProvider for CommandSearchProvider {
    async fn search(&self, query: &str, limit: usize) -> Result<Vec<SearchResult>, SearchError> {
        let target = format!("{}{}:{}", self.prefix, limit.max(1), query);
        debug!("Running {} search for '{}'", self.program, query);

        let run = Command::new(&self.program)
            .args(&self.args)
            .arg(&target)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();

        let output = tokio::time::timeout(self.timeout, run)
            .await
            .map_err(|_| SearchError::Timeout(self.timeout.as_secs()))?
            .map_err(|source| SearchError::Spawn {
                program: self.program.clone(),
                source,
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let message = stderr
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .next_back()
                .unwrap_or("no diagnostic output")
                .to_string();
            return Err(SearchError::Exit {
                status: output.status.to_string(),
                message,
            });
        }

        let mut results = parse_hits(&String::from_utf8_lossy(&output.stdout))?;
        results.truncate(limit);
        Ok(results)
    }

    fn name(&self) -> &str {
        &self.program
    }
}

/// Parse JSON-lines search output, keeping rank order.
///
/// Lines that are not JSON objects are skipped with a warning; output where
/// nothing parses at all is an error.
pub fn parse_hits(stdout: &str) -> Result<Vec<SearchResult>, SearchError> {
    let mut results = Vec::new();
    let mut rejected = 0usize;

    for line in stdout.lines().map(str::trim).filter(|l| !l.is_empty()) {
        match serde_json::from_str::<RawHit>(line) {
            Ok(hit) => {
                if let Some(result) = hit.into_result() {
                    results.push(result);
                }
            }
            Err(e) => {
                warn!("Skipping unparseable search line: {}", e);
                rejected += 1;
            }
        }
    }

    if results.is_empty() && rejected > 0 {
        return Err(SearchError::Parse(format!(
            "{rejected} line(s) of output, none usable"
        )));
    }
    Ok(results)
}

impl RawHit {
    fn into_result(self) -> Option<SearchResult> {
        let url = self.webpage_url.or(self.url)?;
        let thumbnail = self
            .thumbnail
            .or_else(|| self.thumbnails.into_iter().next_back().map(|t| t.url));
        Some(SearchResult {
            title: self.title.unwrap_or_else(|| self.id.clone()),
            id: self.id,
            url,
            thumbnail,
            duration_secs: self.duration.map(|d| d.max(0.0).round() as u64),
        })
    }
}
