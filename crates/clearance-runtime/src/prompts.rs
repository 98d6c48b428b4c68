//! Prompt composition for evaluation and remediation calls.
//!
//! An evaluation prompt is built from:
//! 1. The base system prompt describing the stream grammar
//! 2. One block per policy, rendered from the policy's template
//! 3. The user's prompt and document context, carried inside each block

use clearance_core::request::NO_DOCUMENTS;
use clearance_core::{
    document_context, policy_marker, ComplianceResult, PolicyDefinition, RemediationRequest,
    ResolvedPolicySet, ScanRequest, RECOMMENDATIONS_KEY, REPHRASE_KEY, SUMMARY_KEY,
};
use serde_json::{json, Map, Value};

use crate::providers::ChatMessage;

/// Base system prompt for the multiplexed evaluation stream.
pub const EVALUATION_SYSTEM_PROMPT: &str = r#"
You are a compliance evaluator.

You evaluate one user input against several compliance policies at once and
answer in a single response. Each policy gets its own region.

## Output Format
Start every region with the policy marker on its own line, exactly as given
in the policy block, for example `<<<POLICY:content_safety>>>`.
Inside a region, use these headings in this order:

### Problem
### Why It Failed
### What To Fix
### Prompt Rephrase
### Compliance ID and Name
### Grade

`Problem` and `Grade` are mandatory. Write "None." for sections that do not
apply. The Grade section holds exactly these lines:

Severity: Safe | Low | Medium | High
Score: <1 - severity value>/1
Threshold: <the policy threshold>
Result: Passed | Failed

## Rules
1. Evaluate ONLY the policies you are given
2. Finish one region before starting the next
3. Never invent policy ids or markers
4. When unsure between two severities, choose the higher one
"#;

/// Template used by policies without their own.
pub const DEFAULT_POLICY_TEMPLATE: &str = r#"
{task}

Compliance category:
{compliance_description}

Passing threshold: {threshold}

User input:
"""
{user_input}
"""

Supporting documents:
{document_context}
"#;

/// System prompt for the remediation call.
pub const REMEDIATION_SYSTEM_PROMPT: &str = r#"
You are a compliance remediation assistant.

You receive the policies a user prompt failed, with the evaluator's findings,
and the original prompt. Answer with one JSON object and nothing else:

{
  "Aggregated Summary": "one paragraph covering every failure",
  "Recommendations": {
    "<policy id>": ["first recommendation", "second recommendation"]
  },
  "Rephrase Prompt": "the original prompt rewritten to pass every policy"
}

Give exactly two recommendations for every failed policy id and no others.
"#;

/// Compose the evaluation messages for one scan.
pub fn evaluation_messages(set: &ResolvedPolicySet, request: &ScanRequest) -> Vec<ChatMessage> {
    let context = document_context(&request.documents);
    let blocks: Vec<String> = set
        .policies
        .iter()
        .map(|policy| policy_block(policy, &set.task, &request.prompt, context.as_deref()))
        .collect();

    vec![
        ChatMessage::system(EVALUATION_SYSTEM_PROMPT.trim()),
        ChatMessage::user(blocks.join("\n\n")),
    ]
}

fn policy_block(
    policy: &PolicyDefinition,
    task: &str,
    user_input: &str,
    documents: Option<&str>,
) -> String {
    let template = policy.template.as_deref().unwrap_or(DEFAULT_POLICY_TEMPLATE);
    let filled = fill_template(template, task, policy, user_input, documents);
    format!(
        "{}\nPolicy: {} ({})\n{}",
        policy_marker(&policy.id),
        policy.name,
        policy.id,
        filled.trim()
    )
}

/// Replace the placeholders of an evaluation template.
pub fn fill_template(
    template: &str,
    task: &str,
    policy: &PolicyDefinition,
    user_input: &str,
    documents: Option<&str>,
) -> String {
    template
        .replace("{task}", task)
        .replace("{compliance_description}", &policy.description)
        .replace("{threshold}", &format!("{:.2}", policy.threshold))
        .replace("{user_input}", user_input.trim())
        .replace("{document_context}", documents.unwrap_or(NO_DOCUMENTS))
}

/// Compose the remediation messages.
///
/// Failed results are enriched with the registered description, threshold
/// and name, and rendered as pretty JSON keyed by policy id.
pub fn remediation_messages(
    request: &RemediationRequest,
    policies: &[PolicyDefinition],
) -> Vec<ChatMessage> {
    let mut failed = Map::new();
    for result in &request.failed_results {
        let definition = policies.iter().find(|p| p.id == result.policy_id);
        failed.insert(result.policy_id.clone(), enriched(result, definition));
    }

    // `to_string_pretty` on a `Value` cannot fail.
    let failed_json =
        serde_json::to_string_pretty(&Value::Object(failed)).unwrap_or_default();

    let user = format!(
        "Failed policies:\n{}\n\nMost critical: {} ({})\n\nOriginal prompt:\n\"\"\"\n{}\n\"\"\"\n\nRespond with the keys \"{}\", \"{}\" and \"{}\".",
        failed_json,
        request.critical_concern.policy_id,
        request.critical_concern.severity,
        request.original_prompt,
        SUMMARY_KEY,
        RECOMMENDATIONS_KEY,
        REPHRASE_KEY,
    );

    vec![
        ChatMessage::system(REMEDIATION_SYSTEM_PROMPT.trim()),
        ChatMessage::user(user),
    ]
}

fn enriched(result: &ComplianceResult, definition: Option<&PolicyDefinition>) -> Value {
    json!({
        "name": definition.map(|d| d.name.as_str()).unwrap_or(result.name.as_str()),
        "description": definition.map(|d| d.description.as_str()).unwrap_or_default(),
        "threshold": definition.map(|d| d.threshold).unwrap_or(result.threshold()),
        "severity": result.severity().to_string(),
        "grade": result.grade(),
        "verdict": result.verdict(),
        "problem": result.problem,
        "why_it_failed": result.rationale,
        "what_to_fix": result.fix,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use clearance_core::{
        AggregationEngine, Findings, PolicyRegistry, PolicySource, SeverityLevel, VerdictSubject,
    };

    const POLICIES: &str = r#"
policy_sets:
  - id: chat
    task: Review a chat message.
policies:
  - id: P1
    name: Content Safety
    description: No harmful content
    threshold: 0.8
  - id: P2
    name: Copyright
    description: No protected works
    threshold: 0.5
    template: "{task} | {compliance_description} | {threshold} | {user_input} | {document_context}"
"#;

    fn set() -> ResolvedPolicySet {
        PolicyRegistry::load(&PolicySource::Yaml(POLICIES.to_string()))
            .unwrap()
            .current()
            .resolve(None)
            .unwrap()
    }

    #[test]
    fn test_evaluation_prompt_has_marker_per_policy() {
        let messages = evaluation_messages(&set(), &ScanRequest::new("Write a poem"));
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[0].role, "system");

        let user = &messages[1].content;
        assert!(user.contains("<<<POLICY:P1>>>"));
        assert!(user.contains("<<<POLICY:P2>>>"));
        assert!(user.contains("Review a chat message."));
        assert!(user.contains("No documents provided"));
    }

    #[test]
    fn test_custom_template_placeholders() {
        let mut request = ScanRequest::new("  Write a poem  ");
        request.documents = vec!["doc one".into(), "doc two".into()];
        let messages = evaluation_messages(&set(), &request);

        assert!(messages[1].content.contains(
            "Review a chat message. | No protected works | 0.50 | Write a poem | doc one\n---\ndoc two"
        ));
    }

    #[test]
    fn test_remediation_prompt_enriches_failures() {
        let set = set();
        let failed = ComplianceResult::graded(
            &set.subject("P2"),
            SeverityLevel::Medium,
            Findings {
                problem: "Quotes lyrics".into(),
                ..Default::default()
            },
            vec![],
        );
        let engine = AggregationEngine::new();
        let outcome = engine.outcome(&[failed], &set);
        let request = engine.remediation_request(&outcome, "Sing me a song").unwrap();

        let messages = remediation_messages(&request, &set.policies);
        let user = &messages[1].content;
        assert!(user.contains("\"P2\": {"));
        assert!(user.contains("\"description\": \"No protected works\""));
        assert!(user.contains("\"threshold\": 0.5"));
        assert!(user.contains("Sing me a song"));
        assert!(user.contains("Most critical: P2"));
    }

    #[test]
    fn test_remediation_prompt_uses_registered_threshold() {
        let set = set();
        let claimed = VerdictSubject {
            threshold: 0.99,
            ..set.subject("P2")
        };
        let failed = ComplianceResult::graded(&claimed, SeverityLevel::Low, Findings::default(), vec![]);
        let engine = AggregationEngine::new();
        let request = RemediationRequest {
            critical_concern: engine.outcome(&[failed.clone()], &set).critical_concern.unwrap(),
            failed_results: vec![failed],
            original_prompt: "Quote the chorus".to_string(),
        };

        let user = &remediation_messages(&request, &set.policies)[1].content;
        assert!(user.contains("\"threshold\": 0.5"));
        assert!(!user.contains("0.99"));
    }
}
