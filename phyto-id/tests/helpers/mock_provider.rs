//! Scripted identification provider for orchestrator tests

use async_trait::async_trait;
use phyto_id::error::ProviderError;
use phyto_id::types::{Candidate, IdentificationProvider, IdentifyOptions, ProviderResult};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// What the provider does on each call
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Return these candidates
    Succeed(Vec<Candidate>),
    /// Fail with this error
    Fail(ProviderError),
}

/// Provider with call counters, an optional delay and a swappable behavior
#[derive(Debug, Clone)]
pub struct ScriptedProvider {
    name: &'static str,
    delay: Duration,
    pacing: Duration,
    diseases: bool,
    behavior: Arc<Mutex<Behavior>>,
    calls: Arc<AtomicUsize>,
    completed: Arc<AtomicUsize>,
    disease_requests: Arc<AtomicUsize>,
}

impl ScriptedProvider {
    /// Provider that always answers with one species
    pub fn species(name: &'static str, species: &str, confidence: f32) -> Self {
        Self::new(
            name,
            Behavior::Succeed(vec![Candidate::species(species, confidence)]),
        )
    }

    /// Provider that always fails with a network error
    pub fn failing(name: &'static str) -> Self {
        Self::new(
            name,
            Behavior::Fail(ProviderError::Network("connection refused".to_string())),
        )
    }

    pub fn new(name: &'static str, behavior: Behavior) -> Self {
        Self {
            name,
            delay: Duration::ZERO,
            pacing: Duration::ZERO,
            diseases: false,
            behavior: Arc::new(Mutex::new(behavior)),
            calls: Arc::new(AtomicUsize::new(0)),
            completed: Arc::new(AtomicUsize::new(0)),
            disease_requests: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Wait this long in `ready`, as if queued behind a local quota
    pub fn with_pacing(mut self, pacing: Duration) -> Self {
        self.pacing = pacing;
        self
    }

    /// Advertise disease support
    pub fn with_disease_support(mut self) -> Self {
        self.diseases = true;
        self
    }

    /// Change the behavior for subsequent calls
    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    /// Calls started
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    /// Calls that asked for disease candidates
    pub fn disease_requests(&self) -> usize {
        self.disease_requests.load(Ordering::SeqCst)
    }

    /// Calls that ran to the end (not aborted)
    pub fn completed(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl IdentificationProvider for ScriptedProvider {
    fn name(&self) -> &str {
        self.name
    }

    fn supports_diseases(&self) -> bool {
        self.diseases
    }

    async fn ready(&self) {
        if !self.pacing.is_zero() {
            tokio::time::sleep(self.pacing).await;
        }
    }

    async fn identify(
        &self,
        _image: &[u8],
        options: &IdentifyOptions,
    ) -> Result<ProviderResult, ProviderError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if options.include_diseases {
            self.disease_requests.fetch_add(1, Ordering::SeqCst);
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        let behavior = self.behavior.lock().unwrap().clone();
        self.completed.fetch_add(1, Ordering::SeqCst);

        match behavior {
            Behavior::Succeed(candidates) => Ok(ProviderResult::new(self.name, candidates)),
            Behavior::Fail(error) => Err(error),
        }
    }
}
