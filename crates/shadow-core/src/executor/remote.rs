use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use std::time::Duration;

use super::{
    CodeSnippet, CommandOptions, CommandResult, CommitRequest, CommitResult, DeleteResult,
    DirEntry, ExecError, ExecResult, Executor, FileReadResult, GrepOptions, GrepResult,
    ReadOptions, SearchReplaceResult, WriteResult,
};
use crate::types::TerminalEntry;

/// Extra slack on top of a command's own timeout so the sidecar, not the
/// HTTP client, is the one that times the command out.
const HTTP_SLACK_S: u64 = 15;

/// Forwards every workspace operation to the sidecar HTTP service running
/// inside the task's sandbox. Result shapes match `LocalExecutor` exactly:
/// both sides serialize the same structs.
pub struct RemoteExecutor {
    task_id: String,
    base_url: String,
    workspace_path: String,
    client: Client,
}

impl RemoteExecutor {
    pub fn new(
        task_id: impl Into<String>,
        base_url: impl Into<String>,
        workspace_path: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            base_url: base_url.into(),
            workspace_path: workspace_path.into(),
            client: Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        self.client
            .request(method, self.url(path))
            .timeout(Duration::from_secs(30))
    }

    async fn send<T: DeserializeOwned>(&self, req: RequestBuilder) -> ExecResult<T> {
        let resp = req.send().await.map_err(map_transport_error)?;
        let resp = check_status(resp).await?;
        resp.json::<T>()
            .await
            .map_err(|e| ExecError::Failed(format!("invalid sidecar response: {e}")))
    }

    /// Liveness probe against the sidecar's `/health` endpoint.
    pub async fn health(&self) -> ExecResult<()> {
        let resp = self
            .request(Method::GET, "/health")
            .timeout(Duration::from_secs(5))
            .send()
            .await
            .map_err(map_transport_error)?;
        check_status(resp).await?;
        Ok(())
    }
}

fn map_transport_error(e: reqwest::Error) -> ExecError {
    if e.is_timeout() {
        ExecError::Timeout(format!("sidecar request timed out: {e}"))
    } else if e.is_connect() {
        ExecError::Unhealthy(format!("sidecar unreachable: {e}"))
    } else {
        ExecError::Failed(format!("sidecar request failed: {e}"))
    }
}

/// Reconstruct a typed error from a non-2xx sidecar response. The sidecar
/// reports `{"error": {"kind": "...", "message": "..."}}`; the HTTP status is
/// the fallback when the body is not parseable.
async fn check_status(resp: Response) -> ExecResult<Response> {
    let status = resp.status();
    if status.is_success() {
        return Ok(resp);
    }
    let body: Value = resp.json().await.unwrap_or(Value::Null);
    let message = body["error"]["message"]
        .as_str()
        .unwrap_or("sidecar error")
        .to_string();
    let err = match body["error"]["kind"].as_str() {
        Some("NotFound") => ExecError::NotFound(message),
        Some("InvalidRange") => ExecError::InvalidRange(message),
        Some("Ambiguous") => ExecError::Ambiguous(message),
        Some("Timeout") => ExecError::Timeout(message),
        Some("Unhealthy") => ExecError::Unhealthy(message),
        Some("AuthFailed") => ExecError::AuthFailed(message),
        Some(_) | None => match status {
            StatusCode::NOT_FOUND => ExecError::NotFound(message),
            StatusCode::BAD_REQUEST => ExecError::InvalidRange(message),
            StatusCode::CONFLICT => ExecError::Ambiguous(message),
            StatusCode::REQUEST_TIMEOUT => ExecError::Timeout(message),
            StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => ExecError::AuthFailed(message),
            StatusCode::SERVICE_UNAVAILABLE => ExecError::Unhealthy(message),
            _ => ExecError::Failed(format!("sidecar returned {status}: {message}")),
        },
    };
    Err(err)
}

#[async_trait]
impl Executor for RemoteExecutor {
    async fn read_file(&self, path: &str, opts: ReadOptions) -> ExecResult<FileReadResult> {
        let mut req = self.request(Method::GET, "/files/read");
        let mut query: Vec<(&str, String)> = vec![("path", path.to_string())];
        if opts.entire {
            query.push(("entire", "true".into()));
        }
        if let Some(start) = opts.start {
            query.push(("start", start.to_string()));
        }
        if let Some(end) = opts.end {
            query.push(("end", end.to_string()));
        }
        req = req.query(&query);
        self.send(req).await
    }

    async fn write_file(
        &self,
        path: &str,
        content: &str,
        instructions: &str,
    ) -> ExecResult<WriteResult> {
        let req = self.request(Method::POST, "/files/write").json(&json!({
            "path": path,
            "content": content,
            "instructions": instructions,
        }));
        self.send(req).await
    }

    async fn search_replace(
        &self,
        path: &str,
        old: &str,
        new: &str,
    ) -> ExecResult<SearchReplaceResult> {
        let req = self
            .request(Method::POST, "/files/search-replace")
            .json(&json!({
                "path": path,
                "old_string": old,
                "new_string": new,
            }));
        self.send(req).await
    }

    async fn delete_file(&self, path: &str) -> ExecResult<DeleteResult> {
        let req = self
            .request(Method::DELETE, "/files")
            .query(&[("path", path)]);
        self.send(req).await
    }

    async fn list_directory(&self, path: &str) -> ExecResult<Vec<DirEntry>> {
        let req = self
            .request(Method::GET, "/files/list")
            .query(&[("path", path)]);
        self.send(req).await
    }

    async fn list_directory_recursive(&self, path: &str) -> ExecResult<Vec<DirEntry>> {
        let req = self
            .request(Method::GET, "/files/list")
            .query(&[("path", path), ("recursive", "true")]);
        self.send(req).await
    }

    async fn search_files(&self, query: &str) -> ExecResult<Vec<String>> {
        let req = self
            .request(Method::GET, "/files/search")
            .query(&[("q", query)]);
        self.send(req).await
    }

    async fn grep_search(&self, query: &str, opts: GrepOptions) -> ExecResult<GrepResult> {
        let mut params: Vec<(&str, String)> = vec![
            ("q", query.to_string()),
            ("case_sensitive", opts.case_sensitive.to_string()),
        ];
        if let Some(include) = &opts.include {
            params.push(("include", include.clone()));
        }
        if let Some(exclude) = &opts.exclude {
            params.push(("exclude", exclude.clone()));
        }
        let req = self.request(Method::GET, "/files/grep").query(&params);
        self.send(req).await
    }

    async fn codebase_search(&self, query: &str, dirs: &[String]) -> ExecResult<Vec<CodeSnippet>> {
        let req = self
            .request(Method::POST, "/files/codebase-search")
            .json(&json!({ "q": query, "dirs": dirs }));
        self.send(req).await
    }

    async fn execute_command(&self, cmd: &str, opts: CommandOptions) -> ExecResult<CommandResult> {
        let req = self
            .request(Method::POST, "/exec")
            .timeout(Duration::from_secs(opts.timeout_s + HTTP_SLACK_S))
            .json(&json!({
                "command": cmd,
                "timeout": opts.timeout_s,
                "background": opts.background,
                "networkAllowed": opts.network_allowed,
            }));
        self.send(req).await
    }

    async fn git_status(&self) -> ExecResult<String> {
        let body: Value = self.send(self.request(Method::GET, "/git/status")).await?;
        Ok(body["status"].as_str().unwrap_or_default().to_string())
    }

    async fn git_diff(&self, base: Option<&str>) -> ExecResult<String> {
        let mut req = self.request(Method::GET, "/git/diff");
        if let Some(base) = base {
            req = req.query(&[("base", base)]);
        }
        let body: Value = self.send(req).await?;
        Ok(body["diff"].as_str().unwrap_or_default().to_string())
    }

    async fn git_commit(&self, commit: &CommitRequest) -> ExecResult<CommitResult> {
        let req = self.request(Method::POST, "/git/commit").json(commit);
        self.send(req).await
    }

    async fn git_push(&self, branch: &str, set_upstream: bool) -> ExecResult<()> {
        let req = self.request(Method::POST, "/git/push").json(&json!({
            "branchName": branch,
            "setUpstream": set_upstream,
        }));
        let _: Value = self.send(req).await?;
        Ok(())
    }

    async fn terminal_history(&self, since_id: u64) -> ExecResult<Vec<TerminalEntry>> {
        let req = self
            .request(Method::GET, "/terminal/history")
            .query(&[("sinceId", since_id.to_string())]);
        self.send(req).await
    }

    async fn terminal_clear(&self) -> ExecResult<()> {
        let req = self.request(Method::POST, "/terminal/clear");
        let _: Value = self.send(req).await?;
        Ok(())
    }

    fn workspace_path(&self) -> &str {
        &self.workspace_path
    }

    fn is_remote(&self) -> bool {
        true
    }

    fn task_id(&self) -> &str {
        &self.task_id
    }
}
