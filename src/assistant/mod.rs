//! Interactive ask path.
//!
//! Every question is recorded together with the reply it gets, in one
//! store transaction, so a storage failure leaves no trace behind:
//! 1. offline-first: a local knowledge match answers immediately
//! 2. online with a provider: the provider answers (source `online`)
//! 3. provider refused: a local fallback reply, nothing queued
//! 4. offline, no provider, or the call hit a connectivity failure: the
//!    question is queued and an interim local reply is recorded with it
//!
//! Queued questions are answered later by the reconciliation worker.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::sync::watch;

use crate::ai::{AiGateway, AnswerResult, LocalKnowledgeBase};
use crate::connectivity::ConnectivityState;
use crate::constants::{OFFLINE_FALLBACK_TEXT, PROVIDER_FALLBACK_TEXT};
use crate::models::{ChatTurn, NewTurn, QueuedQuery, TurnSource};
use crate::store::{Store, StoreResult};

/// What happened to one question.
#[derive(Debug, Clone, PartialEq)]
pub enum AskOutcome {
    /// Answered now, locally or online.
    Answered(ChatTurn),
    /// Queued for reconciliation; `interim` is the local reply shown meanwhile.
    Queued { query: QueuedQuery, interim: ChatTurn },
}

impl AskOutcome {
    /// The assistant turn to show the user right away.
    pub fn reply(&self) -> &ChatTurn {
        match self {
            AskOutcome::Answered(turn) => turn,
            AskOutcome::Queued { interim, .. } => interim,
        }
    }
}

pub struct Assistant {
    store: Arc<Store>,
    gateway: Option<Arc<dyn AiGateway>>,
    knowledge: Arc<LocalKnowledgeBase>,
    connectivity: watch::Receiver<ConnectivityState>,
    offline_first: bool,
    timeout: Duration,
}

impl Assistant {
    pub fn new(
        store: Arc<Store>,
        gateway: Option<Arc<dyn AiGateway>>,
        knowledge: Arc<LocalKnowledgeBase>,
        connectivity: watch::Receiver<ConnectivityState>,
        offline_first: bool,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            gateway,
            knowledge,
            connectivity,
            offline_first,
            timeout,
        }
    }

    pub fn is_online(&self) -> bool {
        self.connectivity.borrow().is_online
    }

    pub fn provider_name(&self) -> Option<&str> {
        self.gateway.as_deref().map(|g| g.name())
    }

    /// Answer or queue one question. A storage failure is returned to the
    /// caller with nothing written, so asking again is safe.
    pub async fn ask(&self, text: &str) -> StoreResult<AskOutcome> {
        let text = text.trim();
        let question = NewTurn {
            timestamp: Utc::now(),
            ..NewTurn::user(text)
        };

        if self.offline_first {
            if let Some(answer) = self.knowledge.search(text) {
                tracing::debug!("answered from local knowledge");
                return self.reply(&question, &answer, TurnSource::Local);
            }
        }

        let gateway = match &self.gateway {
            Some(gateway) if self.is_online() => gateway,
            _ => return self.queue(&question),
        };

        match gateway.answer(text, self.timeout).await {
            AnswerResult::Success(answer) => self.reply(&question, &answer, TurnSource::Online),
            AnswerResult::ProviderError(reason) => {
                tracing::warn!(%reason, "provider could not answer, replying locally");
                let fallback = self
                    .knowledge
                    .search(text)
                    .unwrap_or_else(|| PROVIDER_FALLBACK_TEXT.to_string());
                self.reply(&question, &fallback, TurnSource::Local)
            }
            AnswerResult::ConnectivityError => {
                tracing::info!("provider unreachable, queueing question");
                self.queue(&question)
            }
        }
    }

    fn reply(&self, question: &NewTurn, text: &str, source: TurnSource) -> StoreResult<AskOutcome> {
        let (_, turn) = self
            .store
            .append_exchange(question, &NewTurn::assistant(text, source))?;
        Ok(AskOutcome::Answered(turn))
    }

    fn queue(&self, question: &NewTurn) -> StoreResult<AskOutcome> {
        let interim = self
            .knowledge
            .search(&question.text)
            .unwrap_or_else(|| OFFLINE_FALLBACK_TEXT.to_string());
        let (query, interim) = self
            .store
            .enqueue_exchange(question, &NewTurn::assistant(&interim, TurnSource::Local))?;
        tracing::info!(id = query.id, "question queued for reconciliation");
        Ok(AskOutcome::Queued { query, interim })
    }
}
