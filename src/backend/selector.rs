//! Backend selection with fall-through loading

use super::candidate::{BackendPlan, ComputeBackend};
use super::history::BackendHistory;
use crate::error::EngineError;
use crate::hardware::{BackendPolicy, HardwareProbe, HardwareProfile};
use crate::runtime::{Model, ModelLoader, ModelParams};
use std::path::Path;
use tracing::{info, warn};

/// Fixed priority used for embedding models, which skip the hardware heuristics
pub const EMBEDDING_ORDER: [ComputeBackend; 3] = [
    ComputeBackend::OpenCl,
    ComputeBackend::Vulkan,
    ComputeBackend::Cpu,
];

/// A model plus the backend it ended up on
#[derive(Debug)]
pub struct LoadedBackend {
    pub model: Box<dyn Model>,
    pub backend: ComputeBackend,
}

/// Picks the backend for each load and walks the fallback chain
#[derive(Debug)]
pub struct BackendSelector {
    probe: HardwareProbe,
    policy: BackendPolicy,
    history: BackendHistory,
}

impl BackendSelector {
    pub fn new(probe: HardwareProbe, policy: BackendPolicy, history: BackendHistory) -> Self {
        Self {
            probe,
            policy,
            history,
        }
    }

    pub fn probe(&self) -> &HardwareProbe {
        &self.probe
    }

    pub fn policy(&self) -> &BackendPolicy {
        &self.policy
    }

    pub fn history(&self) -> &BackendHistory {
        &self.history
    }

    pub fn history_mut(&mut self) -> &mut BackendHistory {
        &mut self.history
    }

    /// Plan for the current device, with previously failed backends pre-marked as tried
    pub fn plan(&self) -> (HardwareProfile, BackendPlan) {
        let profile = self.probe.classify();
        let mut plan = self.policy.plan(&profile);
        for failed in self.history.failed() {
            if plan.candidates.is_available(*failed) {
                info!(backend = %failed, "Skipping backend that failed before");
                plan.candidates.mark_tried(*failed);
            }
        }
        (profile, plan)
    }

    /// Load `path` on the best backend for this device, falling through on failure
    pub fn select_and_load(
        &mut self,
        loader: &dyn ModelLoader,
        path: &Path,
        use_mmap: bool,
    ) -> Result<LoadedBackend, EngineError> {
        let (_, plan) = self.plan();
        let history = &mut self.history;
        run_plan(loader, path, plan, use_mmap, Some(history))
    }

    /// Load `path` walking `order` as given. No denylist, no history.
    pub fn load_with_fixed_order(
        &self,
        loader: &dyn ModelLoader,
        path: &Path,
        order: &[ComputeBackend],
        use_mmap: bool,
    ) -> Result<LoadedBackend, EngineError> {
        run_plan(loader, path, BackendPlan::fixed(order), use_mmap, None)
    }
}

fn run_plan(
    loader: &dyn ModelLoader,
    path: &Path,
    mut plan: BackendPlan,
    use_mmap: bool,
    mut history: Option<&mut BackendHistory>,
) -> Result<LoadedBackend, EngineError> {
    let order = plan.order.clone();
    let result = plan.candidates.try_in_order(&order, |kind| {
        info!(backend = %kind, loader = loader.name(), "Attempting model load");
        if let Some(h) = history.as_deref_mut() {
            h.mark_attempting(kind);
        }

        let params = ModelParams::for_backend(kind, use_mmap);
        let outcome = loader.load_model(path, &params);

        match &outcome {
            Ok(_) => {
                info!(backend = %kind, "Model loaded");
                if let Some(h) = history.as_deref_mut() {
                    h.mark_succeeded(kind);
                }
            }
            Err(e) => {
                warn!(backend = %kind, "Model load failed: {}", e);
                if let Some(h) = history.as_deref_mut() {
                    h.mark_failed(kind);
                }
            }
        }
        outcome
    });

    match result {
        Ok((backend, model)) => Ok(LoadedBackend { model, backend }),
        Err(failures) => {
            let attempted: Vec<ComputeBackend> = failures.iter().map(|(k, _)| *k).collect();
            warn!(
                path = %path.display(),
                attempts = attempted.len(),
                "No backend could load the model"
            );
            Err(EngineError::ModelLoadExhausted {
                path: path.to_path_buf(),
                attempted,
            })
        }
    }
}
