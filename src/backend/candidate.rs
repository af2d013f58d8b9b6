//! Backend candidates and the try-in-order reduction

use crate::hardware::{DeviceRule, GpuVendor};
use crate::runtime::RuntimeError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Compute target a model is loaded against
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ComputeBackend {
    Cpu,
    /// Primary accelerator path
    Vulkan,
    /// Secondary accelerator path, the more stable one on most mobile drivers
    OpenCl,
}

impl ComputeBackend {
    pub fn is_accelerator(&self) -> bool {
        !matches!(self, ComputeBackend::Cpu)
    }
}

impl fmt::Display for ComputeBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ComputeBackend::Cpu => write!(f, "CPU"),
            ComputeBackend::Vulkan => write!(f, "Vulkan"),
            ComputeBackend::OpenCl => write!(f, "OpenCL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackendCandidate {
    pub kind: ComputeBackend,
    pub tried: bool,
}

/// Small set of distinct candidates, each attempted at most once
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateList {
    candidates: Vec<BackendCandidate>,
}

impl CandidateList {
    /// Build from `kinds`, dropping duplicates
    pub fn new(kinds: impl IntoIterator<Item = ComputeBackend>) -> Self {
        let mut candidates: Vec<BackendCandidate> = Vec::with_capacity(3);
        for kind in kinds {
            if !candidates.iter().any(|c| c.kind == kind) {
                candidates.push(BackendCandidate { kind, tried: false });
            }
        }
        Self { candidates }
    }

    pub fn contains(&self, kind: ComputeBackend) -> bool {
        self.candidates.iter().any(|c| c.kind == kind)
    }

    pub fn is_tried(&self, kind: ComputeBackend) -> bool {
        self.candidates.iter().any(|c| c.kind == kind && c.tried)
    }

    pub fn mark_tried(&mut self, kind: ComputeBackend) {
        if let Some(c) = self.candidates.iter_mut().find(|c| c.kind == kind) {
            c.tried = true;
        }
    }

    /// Attemptable: present and not yet tried
    pub fn is_available(&self, kind: ComputeBackend) -> bool {
        self.contains(kind) && !self.is_tried(kind)
    }

    pub fn len(&self) -> usize {
        self.candidates.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candidates.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &BackendCandidate> {
        self.candidates.iter()
    }

    /// Walk `order`, attempting each available candidate once until one succeeds.
    ///
    /// Every attempted candidate is marked tried before `attempt` runs, so a
    /// kind repeated in `order` is never attempted twice.
    pub fn try_in_order<T>(
        &mut self,
        order: &[ComputeBackend],
        mut attempt: impl FnMut(ComputeBackend) -> Result<T, RuntimeError>,
    ) -> Result<(ComputeBackend, T), Vec<(ComputeBackend, RuntimeError)>> {
        let mut failures = Vec::new();
        for &kind in order {
            if !self.is_available(kind) {
                continue;
            }
            self.mark_tried(kind);
            match attempt(kind) {
                Ok(value) => return Ok((kind, value)),
                Err(e) => failures.push((kind, e)),
            }
        }
        Err(failures)
    }
}

/// Why a plan looks the way it does
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlanReason {
    Denylisted(DeviceRule),
    VendorPreference(GpuVendor),
    FixedOrder,
}

/// Ordered attempts plus the candidate bookkeeping for one load
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendPlan {
    pub order: Vec<ComputeBackend>,
    pub candidates: CandidateList,
    pub reason: PlanReason,
}

impl BackendPlan {
    /// Plan that walks `order` as given, with no hardware heuristics
    pub fn fixed(order: &[ComputeBackend]) -> Self {
        Self {
            order: order.to_vec(),
            candidates: CandidateList::new(order.iter().copied()),
            reason: PlanReason::FixedOrder,
        }
    }

    /// First backend that will actually be attempted
    pub fn first_attempt(&self) -> Option<ComputeBackend> {
        self.order
            .iter()
            .copied()
            .find(|k| self.candidates.is_available(*k))
    }
}
