//! Assigns component IDs in a freshly rendered `AppConfiguration`. Component slots whose ID is
//! sourced from an instance property ("replaceable" slots, §4.5) are reconciled against the
//! registry and the old instance so that a stable ID survives re-renders; everything else keeps
//! whatever ID the catalog app rendered.

use std::collections::HashSet;

use serde_json::Value as JsonValue;

use crate::error::CoreError;
use crate::store::ComponentRegistry;
use crate::types::{App, ComponentDefinition, ConfigurationTarget, Language, Properties};

/// A component slot discovered to be driven by an instance property, found by rendering twice:
/// once with the instance's current properties, once with each string property swapped for a
/// unique sentinel, and diffing the two component lists positionally.
struct ReplaceableSlot {
    component_index: usize,
    property_key: String,
    default_id: String,
}

pub struct IdReconciler<'a> {
    registry: &'a dyn ComponentRegistry,
}

pub struct Reconciled {
    pub components: Vec<ComponentDefinition>,
    /// The instance's properties with each reconciled slot's chosen id written back, so the next
    /// render of this instance is stable (§4.5 step 3).
    pub properties: Properties,
}

impl<'a> IdReconciler<'a> {
    pub fn new(registry: &'a dyn ComponentRegistry) -> Self {
        Self { registry }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn reconcile(
        &self,
        app: &App,
        target: ConfigurationTarget,
        alias: Option<&str>,
        properties: &Properties,
        old_properties: Option<&Properties>,
        claimed: &mut HashSet<String>,
        language: &Language,
    ) -> Result<Reconciled, CoreError> {
        let baseline = app
            .render(target, alias, properties, language)
            .map_err(|message| render_failed(&app.app_id, message))?;

        let slots = self.find_replaceable_slots(app, target, alias, properties, language, &baseline)?;
        let replaceable_indices: HashSet<usize> =
            slots.iter().map(|slot| slot.component_index).collect();

        let mut components = baseline.components;
        let mut new_properties = properties.clone();

        for slot in &slots {
            let candidate = components[slot.component_index].clone();
            let chosen_id = self.choose_id(slot, &candidate, old_properties, claimed);
            claimed.insert(chosen_id.clone());
            components[slot.component_index].id = chosen_id.clone();
            new_properties.insert(slot.property_key.clone(), JsonValue::String(chosen_id));
        }

        for (index, component) in components.iter().enumerate() {
            if replaceable_indices.contains(&index) {
                continue;
            }
            if !claimed.insert(component.id.clone()) {
                return Err(CoreError::internal(format!(
                    "non-replaceable component id '{}' collides with another component in this transaction",
                    component.id
                )));
            }
            if self.registry.get_component(&component.id).is_some() {
                return Err(CoreError::internal(format!(
                    "non-replaceable component id '{}' collides with an existing registry component",
                    component.id
                )));
            }
        }

        Ok(Reconciled {
            components,
            properties: new_properties,
        })
    }

    fn find_replaceable_slots(
        &self,
        app: &App,
        target: ConfigurationTarget,
        alias: Option<&str>,
        properties: &Properties,
        language: &Language,
        baseline: &crate::types::AppConfiguration,
    ) -> Result<Vec<ReplaceableSlot>, CoreError> {
        let mut slots = Vec::new();
        for (key, value) in properties.iter() {
            let JsonValue::String(_) = value else {
                continue;
            };
            let sentinel = format!("__reconcile_probe_{key}__");
            let mut probe_properties = properties.clone();
            probe_properties.insert(key.clone(), JsonValue::String(sentinel.clone()));

            let probe = app
                .render(target, alias, &probe_properties, language)
                .map_err(|message| render_failed(&app.app_id, message))?;

            for (index, (base_component, probe_component)) in
                baseline.components.iter().zip(probe.components.iter()).enumerate()
            {
                if base_component.id != probe_component.id && probe_component.id.contains(&sentinel)
                {
                    slots.push(ReplaceableSlot {
                        component_index: index,
                        property_key: key.clone(),
                        default_id: base_component.id.clone(),
                    });
                }
            }
        }
        Ok(slots)
    }

    /// §4.5 step 2's cascading ID choice for one replaceable slot.
    fn choose_id(
        &self,
        slot: &ReplaceableSlot,
        candidate: &ComponentDefinition,
        old_properties: Option<&Properties>,
        claimed: &HashSet<String>,
    ) -> String {
        // Byte-equivalent existing component in the registry: reuse its id regardless of slot
        // bookkeeping (the registry is the ground truth for what's already deployed).
        if let Some(existing_id) = self.registry.get_component_by_config(candidate) {
            if !claimed.contains(&existing_id) {
                return existing_id;
            }
        }

        if let Some(old_id) = old_properties
            .and_then(|props| props.get(&slot.property_key))
            .and_then(|value| value.as_str())
        {
            let factory_mismatch = self
                .registry
                .get_component(old_id)
                .is_some_and(|existing| existing.factory_id != candidate.factory_id);
            if !claimed.contains(old_id) && !factory_mismatch {
                return old_id.to_string();
            }
        }

        if !claimed.contains(&slot.default_id) && self.registry.get_component(&slot.default_id).is_none()
        {
            return slot.default_id.clone();
        }

        let (base, start) = split_trailing_digits(&slot.default_id);
        self.registry.next_available_id(base, start, claimed)
    }
}

fn render_failed(app_id: &str, message: String) -> CoreError {
    CoreError::RenderFailed {
        instance_id: uuid::Uuid::nil(),
        message: format!("{app_id}: {message}"),
        source: None,
    }
}

/// Splits `id` into its alphabetic base and trailing numeric suffix (`"meter12" -> ("meter", 12)`,
/// `"meter" -> ("meter", 0)`), per §4.5 step 2's "stripping trailing digits from the base".
fn split_trailing_digits(id: &str) -> (&str, u32) {
    let split_at = id
        .rfind(|c: char| !c.is_ascii_digit())
        .map(|i| i + 1)
        .unwrap_or(0);
    let (base, digits) = id.split_at(split_at);
    (base, digits.parse().unwrap_or(0))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_trailing_digits() {
        assert_eq!(split_trailing_digits("meter12"), ("meter", 12));
        assert_eq!(split_trailing_digits("meter"), ("meter", 0));
        assert_eq!(split_trailing_digits("meter0"), ("meter", 0));
    }
}
