//! Output formatting for CLI reports
//!
//! Every report renders as pretty JSON or as human-readable text.

use anyhow::{Context, Result};
use serde::Serialize;

use crate::backend::{BackendPlan, ComputeBackend, PlanReason};
use crate::engine::Completion;
use crate::hardware::{DeviceTuning, HardwareProfile};

const RULE: &str = "\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}\u{2501}";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputFormat {
    /// Machine-readable
    Json,
    Human,
}

/// Everything `pocketllm probe` knows about the device
#[derive(Debug, Clone, Serialize)]
pub struct ProbeReport {
    pub profile: HardwareProfile,
    pub backend_order: Vec<ComputeBackend>,
    /// Why the order looks the way it does
    pub reason: String,
    pub batch_size: u32,
    pub context_size: u32,
    pub use_mmap: bool,
    pub opencl_library_present: bool,
    pub failed_backends: Vec<ComputeBackend>,
    pub last_success: Option<ComputeBackend>,
}

impl ProbeReport {
    pub fn new(
        profile: HardwareProfile,
        plan: &BackendPlan,
        tuning: DeviceTuning,
        opencl_library_present: bool,
        failed_backends: Vec<ComputeBackend>,
        last_success: Option<ComputeBackend>,
    ) -> Self {
        let reason = match &plan.reason {
            PlanReason::Denylisted(rule) => match &rule.note {
                Some(note) => format!("denylisted device ({note})"),
                None => format!("denylisted device ({})", rule.model),
            },
            PlanReason::VendorPreference(vendor) => format!("{vendor} vendor preference"),
            PlanReason::FixedOrder => "fixed order".to_string(),
        };

        let mut backend_order = Vec::with_capacity(plan.order.len());
        for backend in &plan.order {
            if !backend_order.contains(backend) {
                backend_order.push(*backend);
            }
        }

        Self {
            profile,
            backend_order,
            reason,
            batch_size: tuning.batch_size,
            context_size: tuning.context_size,
            use_mmap: tuning.use_mmap,
            opencl_library_present,
            failed_backends,
            last_success,
        }
    }
}

/// Closing line of a streamed completion
#[derive(Debug, Clone, Serialize)]
pub struct CompletionSummary {
    pub backend: Option<ComputeBackend>,
    pub finish_reason: String,
    pub prompt_tokens: usize,
    pub generated_tokens: usize,
    pub elapsed_ms: u128,
}

impl CompletionSummary {
    pub fn new(completion: &Completion, backend: Option<ComputeBackend>, elapsed_ms: u128) -> Self {
        Self {
            backend,
            finish_reason: completion.finish_reason.to_string(),
            prompt_tokens: completion.n_prompt_tokens,
            generated_tokens: completion.n_generated,
            elapsed_ms,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EmbeddingReport {
    pub text: String,
    pub dimensions: usize,
    pub vector: Vec<f32>,
}

pub struct OutputFormatter {
    format: OutputFormat,
}

impl OutputFormatter {
    pub fn new(format: OutputFormat) -> Self {
        Self { format }
    }

    pub fn format_probe(&self, report: &ProbeReport) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(report)
                .context("Failed to serialize probe report to JSON"),
            OutputFormat::Human => Ok(self.format_probe_human(report)),
        }
    }

    pub fn format_summary(&self, summary: &CompletionSummary) -> Result<String> {
        match self.format {
            OutputFormat::Json => serde_json::to_string_pretty(summary)
                .context("Failed to serialize completion summary to JSON"),
            OutputFormat::Human => {
                let backend = summary
                    .backend
                    .map(|b| b.to_string())
                    .unwrap_or_else(|| "none".to_string());
                Ok(format!(
                    "[{}] {} prompt + {} generated tokens on {} in {} ms",
                    summary.finish_reason,
                    summary.prompt_tokens,
                    summary.generated_tokens,
                    backend,
                    summary.elapsed_ms
                ))
            }
        }
    }

    /// Embeddings, plus the cosine similarity when exactly two are given
    pub fn format_embeddings(
        &self,
        reports: &[EmbeddingReport],
        similarity: Option<f32>,
    ) -> Result<String> {
        match self.format {
            OutputFormat::Json => {
                let output = serde_json::json!({
                    "embeddings": reports,
                    "cosine_similarity": similarity,
                });
                serde_json::to_string_pretty(&output)
                    .context("Failed to serialize embeddings to JSON")
            }
            OutputFormat::Human => {
                let mut output = String::new();
                for report in reports {
                    let preview: Vec<String> = report
                        .vector
                        .iter()
                        .take(4)
                        .map(|x| format!("{x:.4}"))
                        .collect();
                    output.push_str(&format!(
                        "{:?}\n  {} dims: [{}{}]\n",
                        report.text,
                        report.dimensions,
                        preview.join(", "),
                        if report.dimensions > 4 { ", ..." } else { "" }
                    ));
                }
                if let Some(sim) = similarity {
                    output.push_str(&format!("\nCosine similarity: {sim:.4}\n"));
                }
                Ok(output)
            }
        }
    }

    fn format_probe_human(&self, report: &ProbeReport) -> String {
        let mut output = String::new();

        output.push_str("Device Hardware\n");
        output.push_str(RULE);
        output.push_str("\n\n");

        let profile = &report.profile;
        output.push_str(&format!("GPU Vendor:   {}\n", profile.vendor));
        output.push_str(&format!("Model:        {}\n", or_unknown(&profile.model_id)));
        output.push_str(&format!("Device:       {}\n", or_unknown(&profile.device_id)));
        output.push_str(&format!("SoC:          {}\n", or_unknown(&profile.soc_id)));
        output.push_str(&format!("Hardware:     {}\n\n", or_unknown(&profile.hardware)));

        output.push_str("Backend Plan:\n");
        let order: Vec<String> = report.backend_order.iter().map(|b| b.to_string()).collect();
        output.push_str(&format!("\u{251C}\u{2500} Order:    {}\n", order.join(" \u{2192} ")));
        output.push_str(&format!("\u{251C}\u{2500} Reason:   {}\n", report.reason));
        let failed: Vec<String> = report.failed_backends.iter().map(|b| b.to_string()).collect();
        output.push_str(&format!(
            "\u{251C}\u{2500} Failed:   {}\n",
            if failed.is_empty() { "(none)".to_string() } else { failed.join(", ") }
        ));
        output.push_str(&format!(
            "\u{2514}\u{2500} OpenCL:   {}\n\n",
            if report.opencl_library_present { "library found" } else { "library not found" }
        ));

        output.push_str("Tuning:\n");
        output.push_str(&format!("\u{251C}\u{2500} Batch:    {}\n", report.batch_size));
        output.push_str(&format!("\u{251C}\u{2500} Context:  {}\n", report.context_size));
        output.push_str(&format!("\u{2514}\u{2500} Mmap:     {}\n", report.use_mmap));

        output
    }
}

fn or_unknown(value: &str) -> &str {
    if value.is_empty() {
        "(unknown)"
    } else {
        value
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::FinishReason;
    use crate::hardware::{BackendPolicy, GpuVendor};

    fn report() -> ProbeReport {
        let profile = HardwareProfile::from_identifiers("r0s", "SM-S901B", "s5e9925", "exynos2200");
        let plan = BackendPolicy::default().plan(&profile);
        ProbeReport::new(
            profile,
            &plan,
            DeviceTuning {
                batch_size: 256,
                context_size: 2048,
                use_mmap: true,
            },
            false,
            vec![],
            None,
        )
    }

    #[test]
    fn test_denylisted_probe_human() {
        let output = OutputFormatter::new(OutputFormat::Human).format_probe(&report()).unwrap();
        assert!(output.contains("Order:    CPU\n"));
        assert!(output.contains("Galaxy S22 (Exynos 2200)"));
        assert!(output.contains("Batch:    256"));
    }

    #[test]
    fn test_probe_json() {
        let output = OutputFormatter::new(OutputFormat::Json).format_probe(&report()).unwrap();
        let value: serde_json::Value = serde_json::from_str(&output).unwrap();
        assert_eq!(value["backend_order"], serde_json::json!(["CPU"]));
        assert_eq!(value["profile"]["model_id"], "SM-S901B");
    }

    #[test]
    fn test_vendor_reason() {
        let profile = HardwareProfile::from_identifiers("", "", "", "qcom");
        assert_eq!(profile.vendor, GpuVendor::Adreno);
        let plan = BackendPolicy::default().plan(&profile);
        let report = ProbeReport::new(
            profile,
            &plan,
            DeviceTuning {
                batch_size: 512,
                context_size: 4096,
                use_mmap: true,
            },
            true,
            vec![ComputeBackend::Vulkan],
            Some(ComputeBackend::OpenCl),
        );
        assert!(report.reason.contains("vendor preference"));
        assert_eq!(
            report.backend_order,
            vec![ComputeBackend::OpenCl, ComputeBackend::Vulkan, ComputeBackend::Cpu]
        );
    }

    #[test]
    fn test_summary_human() {
        let completion = Completion {
            text: "hi".to_string(),
            finish_reason: FinishReason::MaxTokens,
            n_prompt_tokens: 12,
            n_generated: 3,
        };
        let summary = CompletionSummary::new(&completion, Some(ComputeBackend::Cpu), 40);
        let output = OutputFormatter::new(OutputFormat::Human)
            .format_summary(&summary)
            .unwrap();
        assert!(output.contains("12 prompt + 3 generated tokens on CPU"));
    }

    #[test]
    fn test_embeddings_with_similarity() {
        let reports = vec![
            EmbeddingReport {
                text: "a".to_string(),
                dimensions: 2,
                vector: vec![0.6, 0.8],
            },
            EmbeddingReport {
                text: "b".to_string(),
                dimensions: 2,
                vector: vec![0.6, 0.8],
            },
        ];
        let output = OutputFormatter::new(OutputFormat::Human)
            .format_embeddings(&reports, Some(1.0))
            .unwrap();
        assert!(output.contains("Cosine similarity: 1.0000"));
        assert!(output.contains("2 dims: [0.6000, 0.8000]"));
    }
}
