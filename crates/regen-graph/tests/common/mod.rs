#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::json;

use regen_core::model::payload::{Priority, Status, UserStoryPayload};
use regen_core::{EngineConfig, NodeKind, NodePayload, NodeRef, RegenResult};
use regen_graph::generation::{GenerationContext, GenerationOutput, Generator};
use regen_graph::{load_seed, MemoryStore, RegenerationPipeline, SeedDocument};

pub const FIXTURE: &str = include_str!("../fixtures/order_fulfillment.json");

pub fn node(kind: NodeKind, id: &str) -> NodeRef {
    NodeRef::new(kind, id)
}

pub fn ids(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

/// The order-fulfillment graph loaded into a fresh store.
pub async fn seeded(config: EngineConfig) -> (Arc<MemoryStore>, RegenerationPipeline) {
    let store = Arc::new(MemoryStore::new(config.id_policy));
    let pipeline = RegenerationPipeline::new(store.clone(), config);
    let document = SeedDocument::from_json(FIXTURE).unwrap();
    load_seed(pipeline.coordinator(), document).await.unwrap();
    (store, pipeline)
}

/// `US_001` with new story text.
pub fn edited_story(text: &str) -> NodePayload {
    NodePayload::UserStory(UserStoryPayload {
        id: "US_001".into(),
        title: "Place an order".into(),
        story_text: text.into(),
        priority: Priority::High,
        status: Status::Draft,
        as_is: None,
        to_be: None,
        keywords: ids(&["order", "checkout"]),
        epic_id: Some("EP_ORDERING".into()),
    })
}

type Script = dyn Fn(&GenerationContext) -> RegenResult<GenerationOutput> + Send + Sync;

/// Generator driven by a closure, recording every context it receives.
pub struct ScriptedGenerator {
    script: Box<Script>,
    pub seen: Mutex<Vec<GenerationContext>>,
}

impl ScriptedGenerator {
    pub fn new(
        script: impl Fn(&GenerationContext) -> RegenResult<GenerationOutput> + Send + Sync + 'static,
    ) -> Self {
        Self {
            script: Box::new(script),
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Re-emits every dirty node it is shown with a rewritten description.
    pub fn echo() -> Self {
        Self::new(echo)
    }

    pub fn contexts(&self) -> Vec<GenerationContext> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Generator for ScriptedGenerator {
    async fn generate(&self, context: &GenerationContext) -> RegenResult<GenerationOutput> {
        self.seen.lock().unwrap().push(context.clone());
        (self.script)(context)
    }
}

pub fn echo(context: &GenerationContext) -> RegenResult<GenerationOutput> {
    let mut entities: Vec<NodePayload> = Vec::new();
    for snapshot in &context.context.existing_snapshot {
        let text = |key: &str, fallback: &str| {
            snapshot
                .props
                .get(key)
                .and_then(|v| v.as_str())
                .unwrap_or(fallback)
                .to_string()
        };
        let mut value = json!({
            "label": snapshot.kind,
            "id": snapshot.id,
            "name": text("name", &snapshot.id),
            "field_type": text("field_type", "String"),
            "description": format!("regenerated for {}", context.root_id),
        });
        if let Some(parent) = &snapshot.parent {
            let key = match snapshot.kind {
                NodeKind::Aggregate => "context_id",
                NodeKind::Entity | NodeKind::ValueObject => "aggregate_id",
                _ => "parent",
            };
            value[key] = if key == "parent" { json!(parent) } else { json!(parent.id) };
        }
        entities.push(serde_json::from_value(value)?);
    }
    Ok(GenerationOutput {
        entities,
        ..GenerationOutput::default()
    })
}
