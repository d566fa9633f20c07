use crate::client::ApiClient;
use crate::types::{Intelligence, MemoryProject, ServiceStatus, SkillTree, Template};

// ============================================================================
// Workspace View State
// ============================================================================

/// Auxiliary, presentation-facing snapshots surrounding the core session:
/// intelligence/skill gamification, template catalog, project memory, and the
/// backend's rate-limit flag. All of it is consumed opaquely; `rate_limited`
/// is the only field the caller acts on (a banner, nothing suppressed).
///
/// Every fetch tolerates collaborator failure independently by leaving the
/// corresponding field unset. A missing skill tree never blocks a run.
#[derive(Debug, Clone, Default)]
pub struct WorkspaceState {
    pub intelligence: Option<Intelligence>,
    pub skill_tree: Option<SkillTree>,
    pub templates: Vec<Template>,
    pub memory: Vec<MemoryProject>,
    pub rate_limited: bool,
    pub deploy_url: Option<String>,
}

impl WorkspaceState {
    /// Initial load of all five snapshots, each independently best-effort.
    pub async fn load(api: &ApiClient) -> Self {
        let rate_limited = api
            .status()
            .await
            .unwrap_or_else(|e| {
                log::debug!("status fetch failed: {}", e);
                ServiceStatus::default()
            })
            .rate_limited;

        Self {
            intelligence: api.intelligence().await.ok(),
            skill_tree: api.skills().await.ok(),
            templates: api.templates().await.unwrap_or_default(),
            memory: api.memory().await.unwrap_or_default(),
            rate_limited,
            deploy_url: None,
        }
    }

    /// Post-completion refresh: intelligence and skills only.
    pub async fn refresh(&mut self, api: &ApiClient) {
        if let Ok(intelligence) = api.intelligence().await {
            self.intelligence = Some(intelligence);
        }
        if let Ok(skill_tree) = api.skills().await {
            self.skill_tree = Some(skill_tree);
        }
    }

    /// Apply a snapshot that arrived on the stream's side channel.
    pub fn update_intelligence(&mut self, intelligence: Intelligence) {
        self.intelligence = Some(intelligence);
    }
}

// ============================================================================
// Tests
// ============================================================================
