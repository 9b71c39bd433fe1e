//! Patch, exploit and attack-graph generation.

use std::sync::Arc;

use crate::domain::VulnerabilityRecord;
use crate::inference::{
    parse_structured, BackendChain, ExploitResult, GraphResult, PatchResult, ResponseFormat,
    Result,
};
use crate::prompts;
use crate::skill::SkillStore;
use crate::trace::{TraceEntry, TraceLog};

const AGENT: &str = "PatcherAgent";

pub struct PatchGenerator {
    chain: BackendChain,
    skill: Arc<SkillStore>,
    trace: Arc<TraceLog>,
}

impl PatchGenerator {
    pub fn new(chain: BackendChain, skill: Arc<SkillStore>, trace: Arc<TraceLog>) -> Self {
        Self {
            chain,
            skill,
            trace,
        }
    }

    /// Request a reproduction test and fixed file content.
    ///
    /// The prompt is built from the skill document as it is at call time, so
    /// a skill upgrade affects every later call. `feedback` is the verifier
    /// output of the previous failed attempt.
    ///
    /// # Errors
    ///
    /// `BackendExhausted` when no backend answers, `MalformedResult` when the
    /// answer lacks either field.
    pub async fn generate_patch(
        &self,
        vulnerability: &VulnerabilityRecord,
        file_name: &str,
        content: &str,
        feedback: Option<&str>,
    ) -> Result<PatchResult> {
        let skill = self.skill.snapshot().await;
        let prompt =
            prompts::patch_prompt(&skill.content, vulnerability, file_name, content, feedback);
        let action = if feedback.is_some() {
            "create_patch_retry"
        } else {
            "create_patch"
        };
        self.request(&prompt, action, &format!("Patching {file_name}"))
            .await
    }

    pub async fn generate_exploit(
        &self,
        vulnerability: &VulnerabilityRecord,
        file_name: &str,
        content: &str,
    ) -> Result<ExploitResult> {
        let prompt = prompts::exploit_prompt(vulnerability, file_name, content);
        self.request(&prompt, "create_exploit", &format!("Exploiting {file_name}"))
            .await
    }

    pub async fn generate_attack_graph(
        &self,
        vulnerability: &VulnerabilityRecord,
        file_name: &str,
    ) -> Result<GraphResult> {
        let prompt = prompts::attack_graph_prompt(vulnerability, file_name);
        self.request(
            &prompt,
            "generate_attack_graph",
            &format!("Visualizing attack on {file_name}"),
        )
        .await
    }

    async fn request<T>(&self, prompt: &str, action: &str, summary: &str) -> Result<T>
    where
        T: crate::inference::parse::StructuredResult,
    {
        let response = self.chain.generate(prompt, ResponseFormat::Json).await?;
        self.trace.record(TraceEntry::new(
            AGENT,
            &response.backend,
            action,
            summary,
            &response.text,
        ));
        parse_structured(&response.text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::Severity;
    use crate::fakes::ScriptedBackend;
    use crate::inference::InferenceError;
    use std::time::Duration;

    fn vuln() -> VulnerabilityRecord {
        VulnerabilityRecord::new("db.py", 2, "SQL Injection", Severity::Critical, "concat")
    }

    fn generator(backend: Arc<ScriptedBackend>, skill: &str) -> PatchGenerator {
        PatchGenerator::new(
            BackendChain::single(backend, Duration::from_secs(5)),
            Arc::new(SkillStore::in_memory(skill)),
            Arc::new(TraceLog::disabled()),
        )
    }

    #[tokio::test]
    async fn patch_prompt_uses_live_skill_and_feedback() {
        let backend = Arc::new(ScriptedBackend::new(
            "m",
            [r#"{"reproduction_test_code": "t", "fixed_code": "f"}"#],
        ));
        let gen = generator(backend.clone(), "SKILL-V1");

        let patch = gen
            .generate_patch(&vuln(), "db.py", "code", Some("AssertionError: leaked"))
            .await
            .unwrap();
        assert_eq!(patch.fixed_code, "f");

        let prompt = &backend.prompts()[0];
        assert!(prompt.starts_with("SKILL-V1"));
        assert!(prompt.contains("AssertionError: leaked"));
    }

    #[tokio::test]
    async fn missing_field_is_malformed_not_exhausted() {
        let backend = Arc::new(ScriptedBackend::new("m", [r#"{"fixed_code": "f"}"#]));
        let err = generator(backend, "S")
            .generate_patch(&vuln(), "db.py", "code", None)
            .await
            .unwrap_err();
        assert!(err.is_malformed());
    }

    #[tokio::test]
    async fn backend_failure_is_exhaustion() {
        let backend = Arc::new(ScriptedBackend::failing("m", "503"));
        let err = generator(backend, "S")
            .generate_exploit(&vuln(), "db.py", "code")
            .await
            .unwrap_err();
        assert!(matches!(err, InferenceError::BackendExhausted { .. }));
    }

    #[tokio::test]
    async fn attack_graph_parses_visualization() {
        let backend = Arc::new(ScriptedBackend::new(
            "m",
            [r#"{"visualization_code": "graph TD; A-->B"}"#],
        ));
        let graph = generator(backend, "S")
            .generate_attack_graph(&vuln(), "db.py")
            .await
            .unwrap();
        assert!(graph.visualization_code.starts_with("graph TD"));
    }
}
