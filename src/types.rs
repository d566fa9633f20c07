use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

// ============================================================================
// Generation Request
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct RunRequest {
    pub idea: String,
    pub improve: bool,
}

impl RunRequest {
    pub fn new(idea: impl Into<String>) -> Self {
        Self {
            idea: idea.into(),
            improve: false,
        }
    }

    /// "Build again, but better": reuse the idea of the most recent result
    /// instead of whatever is in the text box. Falls back to `idea` when
    /// there is no previous result to improve on.
    pub fn improve_from(idea: impl Into<String>, previous: Option<&AgentResult>) -> Self {
        match previous {
            Some(result) => Self {
                idea: result.idea.clone(),
                improve: true,
            },
            None => Self::new(idea),
        }
    }
}

// ============================================================================
// Stream Progress
// ============================================================================

/// One decoded unit of progress from the generation stream. The only
/// meaningful order is arrival order; after a merge only the most recent
/// update is observable.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProgressUpdate {
    pub step: String,
    pub message: String,
    pub percent: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
}

/// Step identifier of the terminal stream record.
pub const STEP_COMPLETE: &str = "complete";

impl ProgressUpdate {
    pub fn is_terminal(&self) -> bool {
        self.step == STEP_COMPLETE && self.data.is_some()
    }

    /// Intelligence snapshots ride along on any step as a side channel.
    pub fn intelligence(&self) -> Option<Intelligence> {
        self.data
            .as_ref()
            .and_then(|d| d.get("intelligence"))
            .and_then(|v| serde_json::from_value(v.clone()).ok())
    }
}

// ============================================================================
// Result Bundle
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct AgentResult {
    pub idea: String,
    #[serde(default)]
    pub plan: serde_json::Value,
    #[serde(default)]
    pub code_files: Vec<String>,
    /// Key order is the backend's emission order; the preview compositor's
    /// fallback rules depend on it, so this must stay an insertion-ordered map.
    #[serde(default)]
    pub all_code: IndexMap<String, String>,
    #[serde(default)]
    pub final_code: String,
    #[serde(default)]
    pub review: Review,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub xp_gained: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub intelligence: Option<Intelligence>,
    #[serde(default)]
    pub learned_from: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extras: Option<Extras>,
}

impl AgentResult {
    pub fn first_file(&self) -> Option<&str> {
        self.code_files.first().map(String::as_str)
    }

    pub fn file_content(&self, name: &str) -> Option<&str> {
        self.all_code.get(name).map(String::as_str)
    }

    /// Whether the bundle is a web artifact, i.e. a live preview makes sense.
    pub fn has_web_artifact(&self) -> bool {
        self.code_files.iter().any(|f| f.ends_with(".html"))
    }

    /// Replace one file's content with the fixer's output. The fixer reports a
    /// clean review; we trust that report rather than re-verifying locally.
    pub fn apply_fix(&mut self, file: &str, fixed_code: String) {
        self.all_code.insert(file.to_string(), fixed_code);
        self.review = Review {
            has_errors: false,
            errors: Vec::new(),
            summary: self.review.summary.take(),
            score: Some(10),
        };
    }

    pub fn project_name(&self) -> Option<String> {
        self.plan
            .get("project_name")
            .and_then(|v| v.as_str())
            .map(|s| s.to_string())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Extras {
    #[serde(default)]
    pub tests: String,
    #[serde(default)]
    pub cicd: String,
    #[serde(default)]
    pub dockerfile: String,
}

// ============================================================================
// Review & Diagnostics
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Review {
    #[serde(default)]
    pub has_errors: bool,
    #[serde(default)]
    pub errors: Vec<CodeError>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summary: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub score: Option<u8>,
}

/// A single line-addressed issue in generated code. `line` is 1-based in the
/// file it was reported against.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CodeError {
    pub line: u32,
    #[serde(default)]
    pub code_snippet: String,
    #[serde(default)]
    pub error_type: String,
    pub message: String,
    #[serde(default)]
    pub explanation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fix: Option<String>,
}

// ============================================================================
// Auxiliary Snapshots
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Intelligence {
    pub level: u32,
    pub xp: u32,
    pub stage_name: String,
    #[serde(default)]
    pub stage_emoji: String,
    #[serde(default)]
    pub stage_desc: String,
    #[serde(default)]
    pub total_projects: u32,
    #[serde(default)]
    pub total_files: u32,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_stage: Option<NextStage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NextStage {
    pub name: String,
    #[serde(default)]
    pub emoji: String,
    pub xp_needed: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Skill {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    pub unlocked: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillStage {
    pub name: String,
    pub level_min: u32,
    pub unlocked: bool,
    pub current: bool,
    #[serde(default)]
    pub skills: Vec<Skill>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SkillTree {
    #[serde(default)]
    pub stages: Vec<SkillStage>,
    #[serde(default)]
    pub current_stage: String,
    #[serde(default)]
    pub unlocked_count: u32,
    #[serde(default)]
    pub total_count: u32,
    #[serde(default)]
    pub progress_percent: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Template {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub icon: String,
    #[serde(default)]
    pub description: String,
    pub prompt: String,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProject {
    pub id: i64,
    pub idea: String,
    #[serde(default)]
    pub xp_gained: u32,
    #[serde(default)]
    pub languages: Vec<String>,
    #[serde(default)]
    pub file_count: u32,
    #[serde(default)]
    pub files: Vec<String>,
    #[serde(default)]
    pub quality_score: u32,
    #[serde(default)]
    pub timestamp: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServiceStatus {
    #[serde(default)]
    pub rate_limited: bool,
}

// ============================================================================
// Unary Endpoint Payloads
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExplainRequest {
    pub code: String,
    pub language: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExplainResponse {
    #[serde(default)]
    pub explanations: Vec<LineExplanation>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LineExplanation {
    pub line: u32,
    #[serde(default)]
    pub code: String,
    pub explanation: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixRequest {
    pub code: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixResponse {
    pub fixed_code: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployRequest {
    pub project_name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployResponse {
    pub url: String,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_result() -> AgentResult {
        let json = serde_json::json!({
            "idea": "a calculator",
            "plan": {"project_name": "calc"},
            "code_files": ["index.html", "main.js"],
            "all_code": {"index.html": "<html></html>", "main.js": "console.log(1)"},
            "final_code": "",
            "review": {
                "has_errors": true,
                "errors": [{"line": 1, "message": "missing doctype"}],
                "score": 6
            },
            "xp_gained": 25,
            "learned_from": false
        });
        serde_json::from_value(json).unwrap()
    }

    #[test]
    fn test_result_deserializes_with_order() {
        let result = sample_result();
        assert_eq!(result.first_file(), Some("index.html"));
        let keys: Vec<_> = result.all_code.keys().collect();
        assert_eq!(keys, vec!["index.html", "main.js"]);
        assert!(result.has_web_artifact());
        assert_eq!(result.project_name().as_deref(), Some("calc"));
    }

    #[test]
    fn test_apply_fix_clears_review() {
        let mut result = sample_result();
        assert!(result.review.has_errors);

        result.apply_fix("main.js", "console.log(2)".to_string());

        assert_eq!(result.file_content("main.js"), Some("console.log(2)"));
        assert!(!result.review.has_errors);
        assert!(result.review.errors.is_empty());
        assert_eq!(result.review.score, Some(10));
        // Untouched files keep their content.
        assert_eq!(result.file_content("index.html"), Some("<html></html>"));
    }

    #[test]
    fn test_improve_reuses_previous_idea() {
        let result = sample_result();
        let request = RunRequest::improve_from("typed text", Some(&result));
        assert_eq!(request.idea, "a calculator");
        assert!(request.improve);

        let request = RunRequest::improve_from("typed text", None);
        assert_eq!(request.idea, "typed text");
        assert!(!request.improve);
    }

    #[test]
    fn test_terminal_update_detection() {
        let update = ProgressUpdate {
            step: STEP_COMPLETE.to_string(),
            message: "Done".to_string(),
            percent: 100,
            data: Some(serde_json::json!({"idea": "x"})),
        };
        assert!(update.is_terminal());

        let update = ProgressUpdate {
            step: STEP_COMPLETE.to_string(),
            message: "Done".to_string(),
            percent: 100,
            data: None,
        };
        assert!(!update.is_terminal());
    }

    #[test]
    fn test_intelligence_side_channel() {
        let update = ProgressUpdate {
            step: "planning".to_string(),
            message: "Planning".to_string(),
            percent: 20,
            data: Some(serde_json::json!({
                "intelligence": {"level": 3, "xp": 120, "stage_name": "Child"}
            })),
        };
        let intel = update.intelligence().unwrap();
        assert_eq!(intel.level, 3);
        assert_eq!(intel.stage_name, "Child");
    }
}
