use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use indexmap::IndexMap;

// ============================================================================
// Preview Compositor
// ============================================================================

/// A single renderable document synthesized from a generated file set.
///
/// Derived, never persisted: recompute from the current `all_code` whenever it
/// changes. The encoded form is meant for an isolated rendering context that
/// may run scripts but gets no navigation, storage, or host access — generated
/// code is untrusted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreviewDocument {
    pub html: String,
}

impl PreviewDocument {
    /// Inline representation suitable for a sandboxed frame's `src`.
    pub fn data_url(&self) -> String {
        format!("data:text/html;base64,{}", BASE64.encode(self.html.as_bytes()))
    }
}

/// Assemble one self-contained document from a filename→content map whose
/// naming is not guaranteed. Pure and deterministic: an exact-name priority
/// list, then a fallback by extension in the map's key order, then empty.
///
/// Returns `None` when no HTML source exists at all; the caller simply omits
/// the preview panel.
pub fn compose(all_code: &IndexMap<String, String>) -> Option<PreviewDocument> {
    let html = pick(all_code, &["index.html"], ".html")?;
    let css = pick(all_code, &["styles.css", "style.css"], ".css").unwrap_or_default();
    let js = pick(all_code, &["main.js", "script.js"], ".js").unwrap_or_default();

    let style_block = format!("<style>{}</style>", css);
    let mut document = if html.contains("</head>") {
        html.replacen("</head>", &format!("{}</head>", style_block), 1)
    } else {
        // The "HTML" is a body fragment, not a full document; wrap it in a
        // minimal shell with the styles in a synthesized head.
        format!(
            "<!DOCTYPE html><html><head>{}</head><body>{}</body></html>",
            style_block, html
        )
    };

    // Without a closing body marker the script is not injected. Known
    // limitation carried over from the backend's contract.
    if document.contains("</body>") {
        document = document.replacen("</body>", &format!("<script>{}</script></body>", js), 1);
    }

    Some(PreviewDocument { html: document })
}

fn pick(all_code: &IndexMap<String, String>, exact: &[&str], extension: &str) -> Option<String> {
    for name in exact {
        if let Some(content) = all_code.get(*name) {
            return Some(content.clone());
        }
    }
    all_code
        .iter()
        .find(|(name, _)| name.ends_with(extension))
        .map(|(_, content)| content.clone())
}

// ============================================================================
// Tests
// ============================================================================
