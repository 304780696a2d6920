//! Scripted edit model for tests and offline runs.

use std::{
    collections::VecDeque,
    sync::{Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use async_trait::async_trait;
use forge_core::{EditModel, EditPartial, EditRequest, PartialStream, StreamError};
use futures::{StreamExt, stream};

/// One scripted stream item.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    Partial(EditPartial),
    Fail(String),
}

/// A scripted turn: either the stream items, or a failure to open the stream.
#[derive(Debug, Clone)]
pub enum Script {
    Stream(Vec<ScriptStep>),
    Unavailable(String),
}

impl Script {
    /// Stream that yields the given partials.
    #[must_use]
    pub fn partials(partials: impl IntoIterator<Item = EditPartial>) -> Self {
        Self::Stream(partials.into_iter().map(ScriptStep::Partial).collect())
    }

    /// Append a mid-stream failure.
    #[must_use]
    pub fn then_fail(self, reason: impl Into<String>) -> Self {
        match self {
            Self::Stream(mut steps) => {
                steps.push(ScriptStep::Fail(reason.into()));
                Self::Stream(steps)
            }
            unavailable @ Self::Unavailable(_) => unavailable,
        }
    }
}

#[derive(Debug, Default)]
struct ScriptState {
    scripts: VecDeque<Script>,
    requests: Vec<EditRequest>,
}

/// Replays queued scripts, one per `stream_edit` call.
///
/// With an empty queue every call fails as unavailable.
#[derive(Debug, Default)]
pub struct ScriptedEditModel {
    state: Mutex<ScriptState>,
    delay: Option<Duration>,
}

impl ScriptedEditModel {
    #[must_use]
    pub fn new(scripts: impl IntoIterator<Item = Script>) -> Self {
        Self {
            state: Mutex::new(ScriptState {
                scripts: scripts.into_iter().collect(),
                requests: Vec::new(),
            }),
            delay: None,
        }
    }

    /// Pause before every item.
    #[must_use]
    pub const fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    fn state(&self) -> MutexGuard<'_, ScriptState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queue another script.
    pub fn push(&self, script: Script) {
        self.state().scripts.push_back(script);
    }

    /// Requests received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<EditRequest> {
        self.state().requests.clone()
    }
}

#[async_trait]
impl EditModel for ScriptedEditModel {
    async fn stream_edit(&self, request: EditRequest) -> Result<PartialStream, StreamError> {
        let script = {
            let mut state = self.state();
            state.requests.push(request);
            state.scripts.pop_front()
        };

        let steps = match script {
            Some(Script::Stream(steps)) => steps,
            Some(Script::Unavailable(reason)) => return Err(StreamError::Unavailable(reason)),
            None => {
                return Err(StreamError::Unavailable(
                    "no edit model configured".to_string(),
                ));
            }
        };

        let delay = self.delay;
        let items = stream::iter(steps).then(move |step| async move {
            if let Some(delay) = delay {
                tokio::time::sleep(delay).await;
            }
            match step {
                ScriptStep::Partial(partial) => Ok(partial),
                ScriptStep::Fail(reason) => Err(StreamError::Interrupted(reason)),
            }
        });
        Ok(items.boxed())
    }
}
