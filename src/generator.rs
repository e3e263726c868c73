//! Response generation over a model provider.
//!
//! Wraps the raw [`Provider`] call with the conversation-level contract: a
//! non-empty turn sequence in, generated text out, bounded by an explicit
//! timeout. Keeps a bounded session cache keyed by `(model, system prompt)`
//! so repeated persona/task combinations reuse their prepared system turn.

use crate::providers::{ChatMessage, Provider};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Max distinct `(model, system prompt)` sessions retained.
const SESSION_CACHE_CAPACITY: usize = 16;

#[derive(Debug, thiserror::Error)]
pub enum GenerateError {
    #[error("conversation history is empty")]
    EmptyHistory,

    #[error("generation timed out after {0:?}")]
    Timeout(Duration),

    #[error("provider error: {0}")]
    Provider(#[source] anyhow::Error),
}

/// A prepared persona session: the system turn for one `(model, prompt)` pair.
struct PersonaSession {
    system: ChatMessage,
}

pub struct Generator {
    provider: Arc<dyn Provider>,
    model: String,
    temperature: f64,
    timeout: Duration,
    sessions: Mutex<HashMap<(String, String), (Arc<PersonaSession>, Instant)>>,
}

impl Generator {
    pub fn new(
        provider: Arc<dyn Provider>,
        model: impl Into<String>,
        temperature: f64,
        timeout: Duration,
    ) -> Self {
        Self {
            provider,
            model: model.into(),
            temperature,
            timeout,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn model(&self) -> &str {
        &self.model
    }

    /// Generate a response for `history` under `system_prompt`.
    ///
    /// Rejects an empty history before touching the backend; zero turns is a
    /// caller contract violation, not a backend condition. Expiry of the
    /// configured timeout is reported as a generation failure.
    pub async fn generate(
        &self,
        history: &[ChatMessage],
        system_prompt: &str,
    ) -> Result<String, GenerateError> {
        if history.is_empty() {
            return Err(GenerateError::EmptyHistory);
        }

        let session = self.session(system_prompt);

        let mut messages = Vec::with_capacity(history.len() + 1);
        messages.push(session.system.clone());
        messages.extend_from_slice(history);

        let call = self
            .provider
            .chat_with_history(&messages, &self.model, self.temperature);

        match tokio::time::timeout(self.timeout, call).await {
            Ok(Ok(text)) => Ok(text),
            Ok(Err(e)) => Err(GenerateError::Provider(e)),
            Err(_) => Err(GenerateError::Timeout(self.timeout)),
        }
    }

    /// Fetch or create the session for `(model, system_prompt)`. Bounded:
    /// past capacity the oldest entry is evicted.
    fn session(&self, system_prompt: &str) -> Arc<PersonaSession> {
        let key = (self.model.clone(), system_prompt.to_string());
        let mut sessions = self.sessions.lock();

        if let Some((session, _)) = sessions.get(&key) {
            return Arc::clone(session);
        }

        if sessions.len() >= SESSION_CACHE_CAPACITY {
            let evict_key = sessions
                .iter()
                .min_by_key(|(_, (_, created))| *created)
                .map(|(k, _)| k.clone());
            if let Some(evict_key) = evict_key {
                sessions.remove(&evict_key);
            }
        }

        let session = Arc::new(PersonaSession {
            system: ChatMessage::system(system_prompt),
        });
        sessions.insert(key, (Arc::clone(&session), Instant::now()));
        session
    }

    #[cfg(test)]
    fn cached_sessions(&self) -> usize {
        self.sessions.lock().len()
    }
}
