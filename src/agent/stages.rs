//! The stage agents
//!
//! `pre_test`, `analyse` and `synthesis` share [`AnalysisStageAgent`] and only
//! differ in instruction. The loop stages and `finalize` shape their output so
//! the state machine can read findings and drafts back out of artifacts.

use super::{StageAgent, TaskContext};
use crate::analysis::{validate_against_schema, AnalysisService};
use crate::error::ExecutionError;
use crate::model::{FactCheckOutput, Finding, StageInput, StageKind};
use async_trait::async_trait;
use serde_json::{json, Value};
use tracing::{debug, info};

/// Generic analysis stage: send the resolved context, keep the answer
pub struct AnalysisStageAgent {
    kind: StageKind,
    instruction: String,
}

impl AnalysisStageAgent {
    pub fn new(kind: StageKind, instruction: impl Into<String>) -> Self {
        Self {
            kind,
            instruction: instruction.into(),
        }
    }

    pub fn pre_test() -> Self {
        Self::new(
            StageKind::PreTest,
            "Screen the submitted documents and parameters before analysis",
        )
    }

    pub fn analyse() -> Self {
        Self::new(
            StageKind::Analyse,
            "Analyse the document against the configured framework",
        )
    }

    pub fn synthesis() -> Self {
        Self::new(
            StageKind::Synthesis,
            "Synthesise the upstream analyses into one draft",
        )
    }
}

#[async_trait]
impl StageAgent for AnalysisStageAgent {
    fn stage(&self) -> StageKind {
        self.kind
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        service: &dyn AnalysisService,
    ) -> Result<Value, ExecutionError> {
        let output = service.invoke(ctx.request(&self.instruction, None)).await?;

        // Keep the document id beside the result so identical answers for
        // different documents stay distinguishable downstream
        let document_id = match &ctx.input {
            StageInput::Document { document, .. } => Some(document.id.clone()),
            _ => None,
        };
        Ok(json!({
            "stage": ctx.stage().to_string(),
            "document_id": document_id,
            "result": output.content,
        }))
    }
}

/// Reads findings out of a fact-check artifact's content
pub fn findings_from_content(content: &Value) -> Result<Vec<Finding>, ExecutionError> {
    match content.get("findings") {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(findings) => serde_json::from_value(findings.clone()).map_err(|e| {
            ExecutionError::permanent(format!("fact-check artifact has malformed findings: {e}"))
        }),
    }
}

/// Checks a draft against its sources and reports structured findings
pub struct FactCheckAgent {
    instruction: String,
}

impl Default for FactCheckAgent {
    fn default() -> Self {
        Self {
            instruction: "Check the draft against its sources and list every finding".to_string(),
        }
    }
}

#[async_trait]
impl StageAgent for FactCheckAgent {
    fn stage(&self) -> StageKind {
        StageKind::FactCheck
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        service: &dyn AnalysisService,
    ) -> Result<Value, ExecutionError> {
        let StageInput::FactCheck {
            draft, iteration, ..
        } = &ctx.input
        else {
            return Err(ExecutionError::permanent(format!(
                "fact_check received '{}' input",
                ctx.input.name()
            )));
        };
        ctx.artifact(draft)?;

        let schema = FactCheckOutput::json_schema();
        let output = service
            .invoke(ctx.request(&self.instruction, Some(schema.clone())))
            .await?;
        validate_against_schema(&schema, &output.content)?;

        let reported: FactCheckOutput = serde_json::from_value(output.content).map_err(|e| {
            ExecutionError::permanent(format!("fact-check output does not decode: {e}"))
        })?;
        let findings = reported.into_findings(*iteration);
        info!(
            iteration,
            findings = findings.len(),
            draft = %draft.short(),
            "Fact check finished"
        );

        Ok(json!({
            "draft": draft,
            "iteration": iteration,
            "findings": findings,
        }))
    }
}

/// Revises a draft to resolve the findings of the previous fact check
pub struct RevisionAgent {
    instruction: String,
}

impl Default for RevisionAgent {
    fn default() -> Self {
        Self {
            instruction: "Revise the draft so that every listed finding is resolved".to_string(),
        }
    }
}

#[async_trait]
impl StageAgent for RevisionAgent {
    fn stage(&self) -> StageKind {
        StageKind::Revision
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        service: &dyn AnalysisService,
    ) -> Result<Value, ExecutionError> {
        let StageInput::Revision {
            draft,
            findings,
            iteration,
            ..
        } = &ctx.input
        else {
            return Err(ExecutionError::permanent(format!(
                "revision received '{}' input",
                ctx.input.name()
            )));
        };
        ctx.artifact(draft)?;
        debug!(iteration, findings = findings.len(), "Revising draft");

        let output = service.invoke(ctx.request(&self.instruction, None)).await?;
        Ok(json!({
            "revision_of": draft,
            "iteration": iteration,
            "resolved": findings.iter().map(|f| &f.finding_id).collect::<Vec<_>>(),
            "result": output.content,
        }))
    }
}

/// Assembles the run summary; never calls the analysis service
#[derive(Default)]
pub struct FinalizeAgent;

#[async_trait]
impl StageAgent for FinalizeAgent {
    fn stage(&self) -> StageKind {
        StageKind::Finalize
    }

    async fn execute(
        &self,
        ctx: &TaskContext,
        _service: &dyn AnalysisService,
    ) -> Result<Value, ExecutionError> {
        let StageInput::Finalize {
            artifacts,
            gaps,
            unresolved_findings,
        } = &ctx.input
        else {
            return Err(ExecutionError::permanent(format!(
                "finalize received '{}' input",
                ctx.input.name()
            )));
        };

        let status = if gaps.is_empty() && unresolved_findings.is_empty() {
            "complete"
        } else {
            "complete_with_warnings"
        };
        Ok(json!({
            "run_id": ctx.task.run_id,
            "status": status,
            "artifacts": artifacts,
            "gaps": gaps,
            "unresolved_findings": unresolved_findings,
        }))
    }
}
