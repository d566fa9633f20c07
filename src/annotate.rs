use crate::types::{CodeError, LineExplanation};

// ============================================================================
// Annotated Source View
// ============================================================================

/// One display line of a generated file, with the diagnostic that landed on
/// it, if any.
#[derive(Debug, Clone, PartialEq)]
pub struct AnnotatedLine<'a> {
    /// 1-based, matching `CodeError::line` exactly.
    pub number: u32,
    pub text: &'a str,
    pub diagnostic: Option<&'a CodeError>,
}

/// Map per-line diagnostics onto file content. Lines match by exact 1-based
/// number; a diagnostic past the end of the file never matches. When several
/// diagnostics hit one line, the first in report order wins — deterministic,
/// no guessing which is worse.
pub fn annotate<'a>(content: &'a str, diagnostics: &'a [CodeError]) -> Vec<AnnotatedLine<'a>> {
    content
        .split('\n')
        .enumerate()
        .map(|(idx, text)| {
            let number = idx as u32 + 1;
            AnnotatedLine {
                number,
                text,
                diagnostic: diagnostics.iter().find(|d| d.line == number),
            }
        })
        .collect()
}

/// Same shape for the explain overlay: line-keyed explanations from the
/// `/explain` collaborator.
#[derive(Debug, Clone, PartialEq)]
pub struct ExplainedLine<'a> {
    pub number: u32,
    pub text: &'a str,
    pub explanation: Option<&'a LineExplanation>,
}

pub fn overlay_explanations<'a>(
    content: &'a str,
    explanations: &'a [LineExplanation],
) -> Vec<ExplainedLine<'a>> {
    content
        .split('\n')
        .enumerate()
        .map(|(idx, text)| {
            let number = idx as u32 + 1;
            ExplainedLine {
                number,
                text,
                explanation: explanations.iter().find(|e| e.line == number),
            }
        })
        .collect()
}

// ============================================================================
// Tests
// ============================================================================
