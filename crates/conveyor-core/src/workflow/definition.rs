//! Workflow definition validation.
//!
//! Fail-fast checks run once before execution: step-id safety, the
//! leaf/subworkflow shape split, completion-check constraints, artifact
//! path containment, DAG integrity, and duration fields.

use conveyor_types::config::{is_contained_relative, is_safe_path_segment, MAX_YAML_BYTES};
use conveyor_types::workflow::{
    StepDefinition, WorkerKind, WorkflowDefinition, RESERVED_STEP_IDS,
};

use crate::util::duration::parse_duration;
use crate::workflow::dag::validate_dag;

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

/// Errors from workflow parsing and validation.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    #[error("workflow file too large: {size} bytes (max {max})")]
    TooLarge { size: usize, max: usize },

    #[error("workflow parse error: {0}")]
    Parse(String),

    #[error("workflow has no steps")]
    EmptyWorkflow,

    #[error("invalid step id '{0}': must be a safe path segment")]
    InvalidStepId(String),

    #[error("step id '{0}' is reserved")]
    ReservedStepId(String),

    #[error("step '{step_id}': {reason}")]
    InvalidStep { step_id: String, reason: String },

    #[error("step '{step_id}' depends on unknown step '{dep}'")]
    UnknownDependency { step_id: String, dep: String },

    #[error("cycle detected involving step '{0}'")]
    CycleDetected(String),

    #[error("step '{step_id}': unsafe path '{path}'")]
    UnsafePath { step_id: String, path: String },

    #[error("invalid duration in {field}: {reason}")]
    InvalidDuration { field: String, reason: String },

    #[error("workflow execution error: {0}")]
    ExecutionError(String),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse and validate a workflow document.
pub fn parse_workflow(text: &str) -> Result<WorkflowDefinition, WorkflowError> {
    if text.len() > MAX_YAML_BYTES {
        return Err(WorkflowError::TooLarge { size: text.len(), max: MAX_YAML_BYTES });
    }
    let definition: WorkflowDefinition =
        serde_yaml_ng::from_str(text).map_err(|e| WorkflowError::Parse(e.to_string()))?;
    validate_definition(&definition)?;
    Ok(definition)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a parsed definition. Cheap; runs before every execution.
pub fn validate_definition(definition: &WorkflowDefinition) -> Result<(), WorkflowError> {
    if definition.steps.is_empty() {
        return Err(WorkflowError::EmptyWorkflow);
    }

    parse_duration(&definition.timeout).map_err(|e| WorkflowError::InvalidDuration {
        field: "timeout".to_string(),
        reason: e.to_string(),
    })?;

    for (step_id, step) in &definition.steps {
        if !is_safe_path_segment(step_id) {
            return Err(WorkflowError::InvalidStepId(step_id.clone()));
        }
        if RESERVED_STEP_IDS.contains(&step_id.as_str()) {
            return Err(WorkflowError::ReservedStepId(step_id.clone()));
        }
        validate_step(step_id, step)?;
    }

    if let Some(transition) = &definition.branch_transition_step {
        if definition.step(transition).is_none() {
            return Err(WorkflowError::InvalidStep {
                step_id: transition.clone(),
                reason: "branch_transition_step references an unknown step".to_string(),
            });
        }
    }

    validate_dag(&definition.steps)?;
    Ok(())
}

fn validate_step(step_id: &str, step: &StepDefinition) -> Result<(), WorkflowError> {
    let invalid = |reason: &str| WorkflowError::InvalidStep {
        step_id: step_id.to_string(),
        reason: reason.to_string(),
    };

    // Leaf vs. subworkflow: exactly one shape.
    match (&step.worker, &step.workflow) {
        (Some(_), Some(_)) => {
            return Err(invalid("'worker' and 'workflow' are mutually exclusive"));
        }
        (None, None) => {
            return Err(invalid("one of 'worker' or 'workflow' is required"));
        }
        (Some(_), None) => {
            if step.instructions.as_deref().unwrap_or("").is_empty() {
                return Err(invalid("leaf steps require non-empty 'instructions'"));
            }
            if step.capabilities.is_empty() {
                return Err(invalid("leaf steps require at least one capability"));
            }
        }
        (None, Some(_)) => {
            // Worker-only surface is rejected on subworkflow steps.
            if step.instructions.is_some()
                || !step.capabilities.is_empty()
                || step.model.is_some()
                || step.max_steps.is_some()
                || step.max_command_time.is_some()
            {
                return Err(invalid("subworkflow steps must not carry worker fields"));
            }
        }
    }

    if let Some(check) = &step.completion_check {
        let iterations = step
            .max_iterations
            .ok_or_else(|| invalid("'max_iterations' is required with a completion_check"))?;
        if iterations < 2 {
            return Err(invalid("'max_iterations' must be >= 2"));
        }
        match check.worker {
            WorkerKind::Custom => {
                if check.command.as_deref().unwrap_or("").is_empty() {
                    return Err(invalid("custom completion checks require 'command'"));
                }
            }
            _ => {
                if check.decision_file.as_deref().unwrap_or("").is_empty() {
                    return Err(invalid("'decision_file' is required unless worker is custom"));
                }
            }
        }
    } else if step.max_iterations.is_some() {
        return Err(invalid("'max_iterations' requires a completion_check"));
    }

    for input in &step.inputs {
        for segment in [Some(input.from.as_str()), Some(input.artifact.as_str()), input.rename.as_deref()]
            .into_iter()
            .flatten()
        {
            if !segment.split('/').all(is_safe_path_segment) {
                return Err(WorkflowError::UnsafePath {
                    step_id: step_id.to_string(),
                    path: segment.to_string(),
                });
            }
        }
    }

    for output in step.outputs.iter().chain(step.exports.iter()) {
        if !is_safe_path_segment(&output.name) {
            return Err(WorkflowError::UnsafePath {
                step_id: step_id.to_string(),
                path: output.name.clone(),
            });
        }
        if !is_contained_relative(&output.path) {
            return Err(WorkflowError::UnsafePath {
                step_id: step_id.to_string(),
                path: output.path.display().to_string(),
            });
        }
    }

    for (field, value) in [
        ("timeout", &step.timeout),
        ("max_command_time", &step.max_command_time),
    ] {
        if let Some(text) = value {
            parse_duration(text).map_err(|e| WorkflowError::InvalidDuration {
                field: format!("{step_id}.{field}"),
                reason: e.to_string(),
            })?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal(steps: &str) -> String {
        format!("name: test\ntimeout: 10m\nsteps:\n{steps}")
    }

    #[test]
    fn test_valid_linear_workflow() {
        let yaml = minimal(
            r#"  a:
    worker: claude_code
    instructions: "do a"
    capabilities: [read]
  b:
    worker: claude_code
    instructions: "do b"
    capabilities: [read, edit]
    depends_on: [a]
"#,
        );
        assert!(parse_workflow(&yaml).is_ok());
    }

    #[test]
    fn test_empty_steps_rejected() {
        let err = parse_workflow("name: t\ntimeout: 1m\nsteps: {}\n").unwrap_err();
        assert!(matches!(err, WorkflowError::EmptyWorkflow));
    }

    #[test]
    fn test_reserved_step_id_rejected() {
        let yaml = minimal(
            r#"  _workflow:
    worker: custom
    instructions: "x"
    capabilities: [read]
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::ReservedStepId(_)));
    }

    #[test]
    fn test_unsafe_step_id_rejected() {
        let yaml = "name: t\ntimeout: 1m\nsteps:\n  \"a/b\":\n    worker: custom\n    instructions: x\n    capabilities: [read]\n";
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidStepId(_)));
    }

    #[test]
    fn test_worker_and_workflow_mutually_exclusive() {
        let yaml = minimal(
            r#"  a:
    worker: custom
    workflow: sub.yaml
    instructions: "x"
    capabilities: [read]
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("mutually exclusive"));
    }

    #[test]
    fn test_leaf_requires_capabilities() {
        let yaml = minimal(
            r#"  a:
    worker: claude_code
    instructions: "x"
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("capability"));
    }

    #[test]
    fn test_subworkflow_rejects_worker_fields() {
        let yaml = minimal(
            r#"  a:
    workflow: sub.yaml
    model: sonnet
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("worker fields"));
    }

    #[test]
    fn test_completion_check_requires_iterations() {
        let yaml = minimal(
            r#"  a:
    worker: claude_code
    instructions: "x"
    capabilities: [read]
    completion_check:
      worker: claude_code
      instructions: "done?"
      decision_file: decision.json
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("max_iterations"));

        let yaml = minimal(
            r#"  a:
    worker: claude_code
    instructions: "x"
    capabilities: [read]
    max_iterations: 1
    completion_check:
      worker: claude_code
      instructions: "done?"
      decision_file: decision.json
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains(">= 2"));
    }

    #[test]
    fn test_custom_check_requires_command() {
        let yaml = minimal(
            r#"  a:
    worker: claude_code
    instructions: "x"
    capabilities: [read]
    max_iterations: 3
    completion_check:
      worker: custom
      instructions: "unused"
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("command"));
    }

    #[test]
    fn test_non_custom_check_requires_decision_file() {
        let yaml = minimal(
            r#"  a:
    worker: claude_code
    instructions: "x"
    capabilities: [read]
    max_iterations: 3
    completion_check:
      worker: claude_code
      instructions: "done?"
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(err.to_string().contains("decision_file"));
    }

    #[test]
    fn test_unsafe_output_path_rejected() {
        let yaml = minimal(
            r#"  a:
    worker: custom
    instructions: "x"
    capabilities: [read]
    outputs:
      - name: report
        path: ../escape.txt
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnsafePath { .. }));
    }

    #[test]
    fn test_unknown_dependency_rejected() {
        let yaml = minimal(
            r#"  a:
    worker: custom
    instructions: "x"
    capabilities: [read]
    depends_on: [ghost]
"#,
        );
        let err = parse_workflow(&yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::UnknownDependency { .. }));
    }

    #[test]
    fn test_invalid_timeout_rejected() {
        let yaml = "name: t\ntimeout: soonish\nsteps:\n  a:\n    worker: custom\n    instructions: x\n    capabilities: [read]\n";
        let err = parse_workflow(yaml).unwrap_err();
        assert!(matches!(err, WorkflowError::InvalidDuration { .. }));
    }
}
