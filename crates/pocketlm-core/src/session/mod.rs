//! Chat sessions over a loaded engine context.
//!
//! A session owns at most one live engine context, bound to one downloaded
//! artifact. Prompting is stateless: every turn re-renders the full history,
//! so correctness does not depend on whatever incremental-decoding the
//! engine applies internally.

pub mod prompt;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::config::EngineSettings;
use crate::error::{Error, Result};
use crate::session::prompt::StopFilter;

pub use prompt::{Role, Turn, SYSTEM_PREAMBLE, TURN_END, TURN_START};

/// Acquires engine contexts. The host provides the actual binding to its
/// inference runtime.
pub trait EngineLoader: Send + Sync {
    /// Bind a context to the weights at `artifact`. Fails on a malformed
    /// artifact, an unsupported format, or exhausted memory.
    fn load(&self, artifact: &Path, settings: &EngineSettings) -> Result<Arc<dyn EngineContext>>;
}

/// An opaque engine handle bound to one artifact.
pub trait EngineContext: Send + Sync {
    /// Produce a completion for `prompt`, invoking `on_token` for each text
    /// fragment as it becomes available, and returning the full raw output.
    fn generate(
        &self,
        prompt: &str,
        stops: &[String],
        max_new_tokens: usize,
        on_token: &mut dyn FnMut(&str),
    ) -> Result<String>;

    /// Release engine resources. Invoked exactly once, by the owning
    /// session's `close`.
    fn release(&self);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Uninitialized,
    Loading,
    Ready,
    Generating,
    Failed,
    Closed,
}

impl std::fmt::Display for SessionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            SessionState::Uninitialized => "uninitialized",
            SessionState::Loading => "loading",
            SessionState::Ready => "ready",
            SessionState::Generating => "generating",
            SessionState::Failed => "failed",
            SessionState::Closed => "closed",
        };
        write!(f, "{name}")
    }
}

/// A conversation bound to one downloaded model.
pub struct ChatSession {
    model_id: String,
    max_new_tokens: usize,
    state: Mutex<SessionState>,
    engine: Mutex<Option<Arc<dyn EngineContext>>>,
    history: Mutex<Vec<Turn>>,
}

impl std::fmt::Debug for ChatSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChatSession")
            .field("model_id", &self.model_id)
            .field("max_new_tokens", &self.max_new_tokens)
            .finish_non_exhaustive()
    }
}

impl ChatSession {
    pub(crate) fn new(model_id: String, max_new_tokens: usize) -> Self {
        Self {
            model_id,
            max_new_tokens,
            state: Mutex::new(SessionState::Uninitialized),
            engine: Mutex::new(None),
            history: Mutex::new(Vec::new()),
        }
    }

    pub fn model_id(&self) -> &str {
        &self.model_id
    }

    pub async fn state(&self) -> SessionState {
        *self.state.lock().await
    }

    /// Snapshot of the conversation so far.
    pub async fn history(&self) -> Vec<Turn> {
        self.history.lock().await.clone()
    }

    pub(crate) async fn is_live(&self) -> bool {
        matches!(
            *self.state.lock().await,
            SessionState::Loading | SessionState::Ready | SessionState::Generating
        )
    }

    /// Acquire the engine context for the bound artifact.
    pub(crate) async fn open(
        &self,
        loader: Arc<dyn EngineLoader>,
        artifact: PathBuf,
        settings: EngineSettings,
    ) -> Result<()> {
        {
            let mut state = self.state.lock().await;
            if *state != SessionState::Uninitialized {
                return Err(Error::InvalidState(format!(
                    "session for {} is already {}",
                    self.model_id, *state
                )));
            }
            *state = SessionState::Loading;
        }

        info!(model = %self.model_id, "loading engine context");
        let loaded = tokio::task::spawn_blocking(move || loader.load(&artifact, &settings))
            .await
            .map_err(|err| Error::EngineInit(format!("engine load task failed: {err}")))
            .and_then(|result| result);

        match loaded {
            Ok(engine) => {
                *self.engine.lock().await = Some(engine);
                *self.state.lock().await = SessionState::Ready;
                info!(model = %self.model_id, "session ready");
                Ok(())
            }
            Err(err) => {
                *self.state.lock().await = SessionState::Failed;
                warn!(model = %self.model_id, "engine init failed: {err}");
                Err(match err {
                    init @ Error::EngineInit(_) => init,
                    other => Error::EngineInit(other.to_string()),
                })
            }
        }
    }

    /// Send a user turn and stream the assistant's reply through
    /// `on_delta`. Resolves to the assistant's full (stop-truncated) text.
    pub async fn send<F>(&self, user_text: impl Into<String>, mut on_delta: F) -> Result<String>
    where
        F: FnMut(&str) + Send + 'static,
    {
        let user_text = user_text.into();
        {
            let mut state = self.state.lock().await;
            if *state != SessionState::Ready {
                return Err(Error::InvalidState(format!(
                    "cannot send while the session is {}",
                    *state
                )));
            }
            *state = SessionState::Generating;
        }

        let engine = match self.engine.lock().await.clone() {
            Some(engine) => engine,
            None => {
                *self.state.lock().await = SessionState::Failed;
                return Err(Error::InvalidState("session has no engine context".into()));
            }
        };

        let prompt = {
            let mut history = self.history.lock().await;
            history.push(Turn::user(user_text));
            prompt::render_prompt(&history)
        };
        let stops = prompt::stop_sequences();
        let max_new_tokens = self.max_new_tokens;
        debug!(model = %self.model_id, prompt_chars = prompt.len(), "generating");

        let generated = tokio::task::spawn_blocking(move || {
            let mut filter = StopFilter::new(stops.clone());
            let mut emit = |fragment: &str| {
                let safe = filter.push(fragment);
                if !safe.is_empty() {
                    on_delta(&safe);
                }
            };
            let raw = engine.generate(&prompt, &stops, max_new_tokens, &mut emit)?;
            let tail = filter.finish();
            if !tail.is_empty() {
                on_delta(&tail);
            }
            Ok::<(String, Vec<String>), Error>((raw, stops))
        })
        .await
        .map_err(|err| Error::Inference(format!("generation task failed: {err}")))
        .and_then(|result| result);

        match generated {
            Ok((raw, stops)) => {
                let text = prompt::truncate_at_stop(&raw, &stops).trim().to_string();
                let mut state = self.state.lock().await;
                if *state == SessionState::Generating {
                    self.history.lock().await.push(Turn::assistant(text.clone()));
                    *state = SessionState::Ready;
                }
                Ok(text)
            }
            Err(err) => {
                let mut state = self.state.lock().await;
                if *state == SessionState::Generating {
                    *state = SessionState::Failed;
                }
                warn!(model = %self.model_id, "generation failed: {err}");
                Err(match err {
                    inference @ Error::Inference(_) => inference,
                    other => Error::Inference(other.to_string()),
                })
            }
        }
    }

    /// Release the engine context. Valid from any state and idempotent;
    /// this is the sole release path for engine resources.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if *state == SessionState::Closed {
            return;
        }
        if let Some(engine) = self.engine.lock().await.take() {
            engine.release();
            debug!(model = %self.model_id, "engine context released");
        }
        *state = SessionState::Closed;
        info!(model = %self.model_id, "session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex as StdMutex;

    /// Engine double that replays a canned raw output in small fragments.
    struct CannedEngine {
        raw_output: String,
        releases: AtomicUsize,
        generations: AtomicUsize,
        last_prompt: StdMutex<String>,
    }

    impl CannedEngine {
        fn new(raw_output: &str) -> Arc<Self> {
            Arc::new(Self {
                raw_output: raw_output.to_string(),
                releases: AtomicUsize::new(0),
                generations: AtomicUsize::new(0),
                last_prompt: StdMutex::new(String::new()),
            })
        }
    }

    impl EngineContext for CannedEngine {
        fn generate(
            &self,
            prompt: &str,
            _stops: &[String],
            _max_new_tokens: usize,
            on_token: &mut dyn FnMut(&str),
        ) -> Result<String> {
            self.generations.fetch_add(1, Ordering::SeqCst);
            *self.last_prompt.lock().unwrap() = prompt.to_string();
            let chars: Vec<char> = self.raw_output.chars().collect();
            for piece in chars.chunks(3) {
                let fragment: String = piece.iter().collect();
                on_token(&fragment);
            }
            Ok(self.raw_output.clone())
        }

        fn release(&self) {
            self.releases.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct CannedLoader {
        engine: Arc<CannedEngine>,
        fail: bool,
    }

    impl EngineLoader for CannedLoader {
        fn load(
            &self,
            _artifact: &Path,
            _settings: &EngineSettings,
        ) -> Result<Arc<dyn EngineContext>> {
            if self.fail {
                return Err(Error::EngineInit("unsupported format".into()));
            }
            Ok(self.engine.clone())
        }
    }

    fn settings() -> EngineSettings {
        EngineSettings {
            context_size: 2048,
            gpu_layers: 99,
        }
    }

    async fn ready_session(engine: Arc<CannedEngine>) -> ChatSession {
        let session = ChatSession::new("m1".into(), 100);
        let loader = Arc::new(CannedLoader {
            engine,
            fail: false,
        });
        session
            .open(loader, PathBuf::from("/tmp/m1.gguf"), settings())
            .await
            .unwrap();
        session
    }

    #[tokio::test]
    async fn open_failure_is_terminal() {
        let session = ChatSession::new("m1".into(), 100);
        let loader = Arc::new(CannedLoader {
            engine: CannedEngine::new(""),
            fail: true,
        });
        let err = session
            .open(loader, PathBuf::from("/tmp/m1.gguf"), settings())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::EngineInit(_)));
        assert_eq!(session.state().await, SessionState::Failed);

        // A failed session rejects turns.
        let err = session.send("hi", |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::InvalidState(_)));
    }

    #[tokio::test]
    async fn send_renders_the_full_history_each_turn() {
        let engine = CannedEngine::new("hello");
        let session = ready_session(engine.clone()).await;

        session.send("hi", |_| {}).await.unwrap();
        let text = session.send("how are you", |_| {}).await.unwrap();
        assert_eq!(text, "hello");

        let prompt = engine.last_prompt.lock().unwrap().clone();
        assert_eq!(
            prompt,
            "<|im_start|>system\nYou are a helpful assistant.<|im_end|>\n\
             <|im_start|>user\nhi<|im_end|>\n\
             <|im_start|>assistant\nhello<|im_end|>\n\
             <|im_start|>user\nhow are you<|im_end|>\n\
             <|im_start|>assistant\n"
        );

        let history = session.history().await;
        assert_eq!(history.len(), 4);
        assert_eq!(history[3].role, Role::Assistant);
        assert_eq!(history[3].text, "hello");
    }

    #[tokio::test]
    async fn raw_output_past_a_marker_is_discarded() {
        let engine = CannedEngine::new("I'm fine.<|im_start|>user\nAnd you?");
        let session = ready_session(engine).await;

        let streamed = Arc::new(StdMutex::new(String::new()));
        let sink = streamed.clone();
        let text = session
            .send("how are you", move |delta| {
                sink.lock().unwrap().push_str(delta);
            })
            .await
            .unwrap();

        assert_eq!(text, "I'm fine.");
        assert_eq!(streamed.lock().unwrap().as_str(), "I'm fine.");
        assert_eq!(session.history().await[1].text, "I'm fine.");
    }

    #[tokio::test]
    async fn streamed_deltas_concatenate_to_the_reply() {
        let engine = CannedEngine::new("a long streamed answer");
        let session = ready_session(engine).await;

        let streamed = Arc::new(StdMutex::new(String::new()));
        let sink = streamed.clone();
        let text = session
            .send("go", move |delta| sink.lock().unwrap().push_str(delta))
            .await
            .unwrap();

        assert_eq!(streamed.lock().unwrap().as_str(), text);
    }

    #[tokio::test]
    async fn send_is_rejected_before_open_and_after_close() {
        let session = ChatSession::new("m1".into(), 100);
        assert!(matches!(
            session.send("hi", |_| {}).await,
            Err(Error::InvalidState(_))
        ));

        let session = ready_session(CannedEngine::new("hello")).await;
        session.close().await;
        assert!(matches!(
            session.send("hi", |_| {}).await,
            Err(Error::InvalidState(_))
        ));
        // The rejected turn never entered the history.
        assert!(session.history().await.is_empty());
    }

    #[tokio::test]
    async fn close_is_idempotent_and_releases_once() {
        let engine = CannedEngine::new("hello");
        let session = ready_session(engine.clone()).await;

        session.close().await;
        session.close().await;
        assert_eq!(session.state().await, SessionState::Closed);
        assert_eq!(engine.releases.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_from_failed_state_is_valid() {
        let session = ChatSession::new("m1".into(), 100);
        let loader = Arc::new(CannedLoader {
            engine: CannedEngine::new(""),
            fail: true,
        });
        let _ = session
            .open(loader, PathBuf::from("/tmp/m1.gguf"), settings())
            .await;
        session.close().await;
        assert_eq!(session.state().await, SessionState::Closed);
    }

    #[tokio::test]
    async fn engine_failure_mid_generation_is_terminal() {
        struct FailingEngine;
        impl EngineContext for FailingEngine {
            fn generate(
                &self,
                _prompt: &str,
                _stops: &[String],
                _max_new_tokens: usize,
                _on_token: &mut dyn FnMut(&str),
            ) -> Result<String> {
                Err(Error::Inference("out of memory".into()))
            }
            fn release(&self) {}
        }
        struct FailingLoader;
        impl EngineLoader for FailingLoader {
            fn load(
                &self,
                _artifact: &Path,
                _settings: &EngineSettings,
            ) -> Result<Arc<dyn EngineContext>> {
                Ok(Arc::new(FailingEngine))
            }
        }

        let session = ChatSession::new("m1".into(), 100);
        session
            .open(Arc::new(FailingLoader), PathBuf::from("/tmp/m1.gguf"), settings())
            .await
            .unwrap();

        let err = session.send("hi", |_| {}).await.unwrap_err();
        assert!(matches!(err, Error::Inference(_)));
        assert_eq!(session.state().await, SessionState::Failed);
        // The user turn stays; no assistant turn was recorded.
        let history = session.history().await;
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].role, Role::User);
    }
}
