// fundline-agents/src/lm.rs
// ============================================================================
// Module: Scripted Language Model
// Description: Deterministic LM client for tests and local wiring.
// Purpose: Replay queued completions without a network dependency.
// Dependencies: fundline-core
// ============================================================================

//! ## Overview
//! The scripted model replays a queue of canned completions in order and
//! fails once the queue runs dry. It exists for tests and offline demos;
//! production deployments wire a real client behind the same
//! [`LanguageModel`] contract.

// ============================================================================
// SECTION: Imports
// ============================================================================

use std::collections::VecDeque;
use std::sync::Mutex;

use fundline_core::interfaces::LanguageModel;
use fundline_core::interfaces::LmError;
use fundline_core::interfaces::LmRequest;
use fundline_core::interfaces::LmResponse;

// ============================================================================
// SECTION: Scripted Model
// ============================================================================

/// Language model that replays queued completions in order.
#[derive(Debug, Default)]
pub struct ScriptedLanguageModel {
    /// Remaining completions, guarded for shared use.
    responses: Mutex<VecDeque<LmResponse>>,
}

impl ScriptedLanguageModel {
    /// Creates a scripted model from canned completions.
    #[must_use]
    pub fn new(responses: impl IntoIterator<Item = LmResponse>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    /// Queues one completion with a fixed token cost.
    pub fn push(&self, content: impl Into<String>, tokens_used: u64) {
        if let Ok(mut guard) = self.responses.lock() {
            guard.push_back(LmResponse {
                content: content.into(),
                tokens_used,
            });
        }
    }

    /// Remaining queued completions.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.responses.lock().map_or(0, |guard| guard.len())
    }
}

impl LanguageModel for ScriptedLanguageModel {
    fn complete(&self, _request: &LmRequest) -> Result<LmResponse, LmError> {
        self.responses
            .lock()
            .map_err(|_| LmError::Transport("scripted model mutex poisoned".to_string()))?
            .pop_front()
            .ok_or_else(|| LmError::MissingContent("scripted model queue empty".to_string()))
    }
}
