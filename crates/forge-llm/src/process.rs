//! Edit model backed by an external process.
//!
//! The process receives one JSON-encoded `EditRequest` on stdin and answers
//! with one JSON partial per line on stdout. A line of the form
//! `{"error": "..."}` aborts the stream.

use std::{collections::VecDeque, path::PathBuf, process::Stdio};

use async_trait::async_trait;
use command_group::{AsyncCommandGroup, AsyncGroupChild};
use forge_core::{EditModel, EditPartial, EditRequest, PartialStream, StreamError};
use futures::StreamExt;
use serde::Deserialize;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncWriteExt, BufReader},
    process::{ChildStdin, ChildStdout, Command},
    sync::mpsc,
    task::JoinHandle,
};
use tokio_stream::wrappers::ReceiverStream;
use tracing::{debug, error, info, warn};

use crate::command::CommandBuilder;

const STDERR_TAIL_LINES: usize = 20;

/// One line of model output.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum ModelLine {
    Failure { error: String },
    Partial(EditPartial),
}

/// Streams edits from a spawned model process.
#[derive(Debug, Clone)]
pub struct CommandEditModel {
    builder: CommandBuilder,
    working_dir: Option<PathBuf>,
    env: Vec<(String, String)>,
    buffer: usize,
}

impl CommandEditModel {
    #[must_use]
    pub const fn new(builder: CommandBuilder) -> Self {
        Self {
            builder,
            working_dir: None,
            env: Vec::new(),
            buffer: 32,
        }
    }

    #[must_use]
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Capacity of the partial channel.
    #[must_use]
    pub fn buffer(mut self, capacity: usize) -> Self {
        self.buffer = capacity.max(1);
        self
    }
}

async fn write_request(mut stdin: ChildStdin, payload: Vec<u8>) {
    let result = async {
        stdin.write_all(&payload).await?;
        stdin.write_all(b"\n").await?;
        stdin.flush().await
    }
    .await;
    if let Err(e) = result {
        debug!(error = %e, "Model process closed stdin early");
    }
}

fn collect_stderr<R>(stderr: R) -> JoinHandle<String>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut tail = VecDeque::with_capacity(STDERR_TAIL_LINES);
        let mut lines = BufReader::new(stderr).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            debug!(target: "forge_llm::model", "{line}");
            if tail.len() == STDERR_TAIL_LINES {
                tail.pop_front();
            }
            tail.push_back(line);
        }
        Vec::from(tail).join("\n")
    })
}

async fn stop(child: &mut AsyncGroupChild) {
    if let Err(e) = child.kill().await {
        debug!(error = %e, "Model process already exited");
    }
}

async fn read_loop(
    mut child: AsyncGroupChild,
    stdout: ChildStdout,
    stderr: Option<JoinHandle<String>>,
    tx: mpsc::Sender<Result<EditPartial, StreamError>>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut partials = 0usize;

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                let line = line.trim();
                if line.is_empty() {
                    continue;
                }
                let item = match serde_json::from_str::<ModelLine>(line) {
                    Ok(ModelLine::Partial(partial)) => Ok(partial),
                    Ok(ModelLine::Failure { error }) => Err(StreamError::Interrupted(error)),
                    Err(e) => {
                        warn!(error = %e, "Skipping unparseable model output line");
                        continue;
                    }
                };
                let failed = item.is_err();
                partials += 1;
                if tx.send(item).await.is_err() {
                    debug!("Partial consumer dropped, stopping model process");
                    stop(&mut child).await;
                    return;
                }
                if failed {
                    stop(&mut child).await;
                    return;
                }
            }
            Ok(None) => break,
            Err(e) => {
                error!(error = %e, "Error reading model output");
                let _ = tx.send(Err(StreamError::Interrupted(e.to_string()))).await;
                stop(&mut child).await;
                return;
            }
        }
    }

    let status = child.wait().await;
    let stderr = match stderr {
        Some(handle) => handle.await.unwrap_or_default(),
        None => String::new(),
    };
    match status {
        Ok(status) if status.success() => {
            info!(partials, "Model stream finished");
        }
        Ok(status) => {
            warn!(%status, partials, "Model process failed");
            let reason = if stderr.is_empty() {
                format!("model process exited with {status}")
            } else {
                format!("model process exited with {status}: {stderr}")
            };
            let _ = tx.send(Err(StreamError::Interrupted(reason))).await;
        }
        Err(e) => {
            let _ = tx.send(Err(StreamError::Interrupted(e.to_string()))).await;
        }
    }
}

#[async_trait]
impl EditModel for CommandEditModel {
    async fn stream_edit(&self, request: EditRequest) -> Result<PartialStream, StreamError> {
        let parts = self
            .builder
            .build()
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;
        let (program, args) = parts
            .into_resolved()
            .await
            .map_err(|e| StreamError::Unavailable(e.to_string()))?;
        let payload =
            serde_json::to_vec(&request).map_err(|e| StreamError::Unavailable(e.to_string()))?;

        let mut command = Command::new(&program);
        command
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &self.working_dir {
            command.current_dir(dir);
        }
        for (key, value) in &self.env {
            command.env(key, value);
        }

        let mut child = command
            .group()
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| StreamError::Unavailable(format!("{}: {e}", program.display())))?;

        let (Some(stdin), Some(stdout)) = (child.inner().stdin.take(), child.inner().stdout.take())
        else {
            stop(&mut child).await;
            return Err(StreamError::Unavailable("model process pipes unavailable".into()));
        };
        let stderr = child.inner().stderr.take().map(collect_stderr);

        debug!(program = %program.display(), files = request.files.len(), "Started model process");
        tokio::spawn(write_request(stdin, payload));

        let (tx, rx) = mpsc::channel(self.buffer);
        tokio::spawn(read_loop(child, stdout, stderr, tx));
        Ok(ReceiverStream::new(rx).boxed())
    }
}

#[cfg(all(test, unix))]
mod tests {
    use forge_core::ProjectSnapshot;
    use futures::StreamExt;

    use super::*;

    fn request() -> EditRequest {
        EditRequest::new(Vec::new(), "add a header".into(), ProjectSnapshot::default())
    }

    fn script(body: &str) -> CommandEditModel {
        CommandEditModel::new(CommandBuilder::new("sh").params(["-c", body]))
    }

    #[tokio::test]
    async fn test_streams_json_lines() {
        let model = script(
            r#"cat > /dev/null
echo '{"plan":{"state":"Incomplete","value":"Add"}}'
echo 'not json'
echo '{"plan":{"state":"Complete","value":"Added a header"},"files":[{"path":"App.tsx","content":"<header/>"}]}'"#,
        );
        let items: Vec<_> = model.stream_edit(request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        let last = items[1].as_ref().unwrap();
        assert!(last.is_plan_complete());
        assert_eq!(last.files[0].path, "App.tsx");
    }

    #[tokio::test]
    async fn test_null_fields_do_not_drop_partials() {
        let model = script(
            r#"cat > /dev/null
echo '{"plan":{"state":"Incomplete","value":null},"files":null}'
echo '{"plan":{"state":"Complete","value":"Done"},"files":[{"path":"a.ts","content":null}]}'"#,
        );
        let items: Vec<_> = model.stream_edit(request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap().plan.value, "");
        let last = items[1].as_ref().unwrap();
        assert!(last.is_plan_complete());
        assert_eq!(last.files[0].content, "");
    }

    #[tokio::test]
    async fn test_request_is_sent_on_stdin() {
        let model = script(
            r#"read -r line
case "$line" in *'"feedback":"add a header"'*) echo '{"plan":{"state":"Complete","value":"ok"}}';; esac"#,
        );
        let items: Vec<_> = model.stream_edit(request()).await.unwrap().collect().await;
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].as_ref().unwrap().plan.value, "ok");
    }

    #[tokio::test]
    async fn test_nonzero_exit_is_interrupted() {
        let model = script("cat > /dev/null; echo boom >&2; exit 2");
        let items: Vec<_> = model.stream_edit(request()).await.unwrap().collect().await;
        match items.as_slice() {
            [Err(StreamError::Interrupted(reason))] => assert!(reason.contains("boom")),
            other => panic!("unexpected items: {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_error_line_aborts_stream() {
        let model = script(
            r#"cat > /dev/null
echo '{"error":"rate limited"}'
echo '{"plan":{"state":"Complete","value":"never"}}'"#,
        );
        let items: Vec<_> = model.stream_edit(request()).await.unwrap().collect().await;
        assert!(matches!(
            items.as_slice(),
            [Err(StreamError::Interrupted(reason))] if reason == "rate limited"
        ));
    }

    #[tokio::test]
    async fn test_missing_program_is_unavailable() {
        let model = CommandEditModel::new(CommandBuilder::new("forge-no-such-model-xyz"));
        assert!(matches!(
            model.stream_edit(request()).await,
            Err(StreamError::Unavailable(_))
        ));
    }
}
