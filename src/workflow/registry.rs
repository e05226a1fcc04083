/// Hot-reload trigger registry using ArcSwap
///
/// Keeps an in-memory index of enabled templates keyed by `(tenant, trigger)`.
/// Readers take a lock-free snapshot; every template change swaps in a new index,
/// so a dispatch in flight keeps the snapshot it started with.

use crate::workflow::{
    conditions,
    storage::WorkflowStorage,
    types::{TriggerType, WorkflowTemplate},
};
use anyhow::Result;
use arc_swap::ArcSwap;
use serde_json::{Map, Value};
use std::{collections::HashMap, sync::Arc};

type TriggerKey = (String, TriggerType);
type TriggerIndex = HashMap<TriggerKey, Vec<Arc<WorkflowTemplate>>>;

#[derive(Debug)]
pub struct TriggerRegistry {
    /// Key: (user_id, trigger), value: enabled templates subscribed to it
    index: ArcSwap<TriggerIndex>,
    storage: WorkflowStorage,
}

impl TriggerRegistry {
    pub fn new(storage: WorkflowStorage) -> Self {
        Self {
            index: ArcSwap::new(Arc::new(HashMap::new())),
            storage,
        }
    }

    /// Build the index from every enabled template in storage
    pub async fn init_from_storage(&self) -> Result<()> {
        let templates = self.storage.load_all_enabled().await?;
        let count = templates.len();

        let mut index = TriggerIndex::new();
        for template in templates {
            insert_into(&mut index, Arc::new(template));
        }
        self.index.store(Arc::new(index));

        tracing::info!("📚 Trigger registry initialized with {} templates", count);
        Ok(())
    }

    /// Re-read one template from storage and swap it into the index.
    /// Disabled or deleted templates drop out.
    pub async fn reload_template(&self, user_id: &str, template_id: &str) -> Result<()> {
        let fresh = self
            .storage
            .get_template(user_id, template_id)
            .await?
            .filter(|t| t.enabled)
            .map(Arc::new);

        self.index.rcu(|current| {
            let mut next = without(current, template_id);
            if let Some(template) = &fresh {
                insert_into(&mut next, template.clone());
            }
            next
        });

        match &fresh {
            Some(t) => tracing::info!("🔄 Hot-reloaded template {} ({} triggers)", t.id, t.trigger_types.len()),
            None => tracing::info!("🔄 Template {} is no longer active, removed from registry", template_id),
        }
        Ok(())
    }

    pub fn remove_template(&self, template_id: &str) {
        self.index.rcu(|current| without(current, template_id));
        tracing::info!("🗑️ Removed template {} from registry", template_id);
    }

    /// Enabled templates of `user_id` subscribed to `trigger` whose conditions accept `variables`
    pub fn matching(
        &self,
        user_id: &str,
        trigger: TriggerType,
        variables: &Map<String, Value>,
    ) -> Vec<Arc<WorkflowTemplate>> {
        let snapshot = self.index.load();
        let key = (user_id.to_string(), trigger);

        snapshot
            .get(&key)
            .map(|templates| {
                templates
                    .iter()
                    .filter(|t| conditions::matches(trigger, &t.trigger_config, variables))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Distinct templates currently indexed
    pub fn template_count(&self) -> usize {
        let snapshot = self.index.load();
        let mut ids: Vec<&str> = snapshot
            .values()
            .flat_map(|templates| templates.iter().map(|t| t.id.as_str()))
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }
}

fn insert_into(index: &mut TriggerIndex, template: Arc<WorkflowTemplate>) {
    if template.tasks.is_empty() {
        tracing::warn!("⚠️ Template {} has no tasks, not registering", template.id);
        return;
    }
    for trigger in &template.trigger_types {
        let bucket = index
            .entry((template.user_id.clone(), *trigger))
            .or_default();
        if !bucket.iter().any(|t| t.id == template.id) {
            bucket.push(template.clone());
        }
    }
}

fn without(current: &TriggerIndex, template_id: &str) -> TriggerIndex {
    current
        .iter()
        .filter_map(|(key, templates)| {
            let kept: Vec<_> = templates
                .iter()
                .filter(|t| t.id != template_id)
                .cloned()
                .collect();
            (!kept.is_empty()).then(|| (key.clone(), kept))
        })
        .collect()
}
