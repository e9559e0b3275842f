//! World snapshot progression. Snapshots are immutable: every mutation
//! produces a new `WorldState` indexed by tick, and rule effects reach the
//! world only through the path grammar below.

use contracts::{
    Character, ErrorCode, KernelError, NarratorConfig, StateChange, StateMode, WorldState,
    TICKS_PER_DAY,
};
use rand::Rng;
use serde_json::{json, Value};

use crate::seed::SeedManager;

const WEIGHT_IMPORTANCE: f64 = 0.45;
const WEIGHT_AVAILABILITY: f64 = 0.20;
const WEIGHT_RECENCY: f64 = 0.20;
const WEIGHT_NOISE: f64 = 0.15;

/// Applies merged rule effects to a snapshot, producing the next snapshot.
///
/// Recognized paths: `resources.<key>`, `phenology.<key>`, `flags.<key>`,
/// `characters.<id>.state_mode | location_id | narrative_importance |
/// last_active_tick | status_effects | attributes.<key>`.
pub fn apply_changes(world: &WorldState, changes: &[StateChange]) -> Result<WorldState, KernelError> {
    let mut next = world.clone();
    for change in changes {
        apply_one(&mut next, change)?;
    }
    Ok(next)
}

fn apply_one(world: &mut WorldState, change: &StateChange) -> Result<(), KernelError> {
    let path = change.path.as_str();
    let value = &change.after;
    if let Some(key) = path.strip_prefix("resources.") {
        world.resources.insert(key.to_string(), as_f64(path, value)?);
        return Ok(());
    }
    if let Some(key) = path.strip_prefix("phenology.") {
        world.phenology.insert(key.to_string(), as_f64(path, value)?);
        return Ok(());
    }
    if let Some(key) = path.strip_prefix("flags.") {
        let flag = value
            .as_bool()
            .ok_or_else(|| bad_effect(path, "expected bool"))?;
        world.flags.insert(key.to_string(), flag);
        return Ok(());
    }
    if let Some(rest) = path.strip_prefix("characters.") {
        return apply_character_change(world, path, rest, value);
    }
    Err(bad_effect(path, "unrecognized path"))
}

fn apply_character_change(
    world: &mut WorldState,
    path: &str,
    rest: &str,
    value: &Value,
) -> Result<(), KernelError> {
    let (character_id, field) = rest
        .split_once('.')
        .ok_or_else(|| bad_effect(path, "missing character field"))?;
    let character = world
        .characters
        .get_mut(character_id)
        .ok_or_else(|| bad_effect(path, "unknown character"))?;

    match field {
        "state_mode" => {
            character.state_mode = serde_json::from_value::<StateMode>(value.clone())
                .map_err(|err| bad_effect(path, &format!("invalid state mode: {err}")))?;
        }
        "location_id" => {
            character.location_id = value
                .as_str()
                .ok_or_else(|| bad_effect(path, "expected string"))?
                .to_string();
        }
        "narrative_importance" => {
            character.narrative_importance = as_f64(path, value)?.clamp(0.0, 1.0);
        }
        "last_active_tick" => {
            character.last_active_tick = value
                .as_u64()
                .ok_or_else(|| bad_effect(path, "expected unsigned integer"))?;
        }
        "status_effects" => {
            character.status_effects = serde_json::from_value::<Vec<String>>(value.clone())
                .map_err(|err| bad_effect(path, &format!("invalid status effects: {err}")))?;
        }
        other => {
            let key = other
                .strip_prefix("attributes.")
                .ok_or_else(|| bad_effect(path, "unrecognized character field"))?;
            character.attributes.insert(key.to_string(), value.clone());
        }
    }
    Ok(())
}

fn as_f64(path: &str, value: &Value) -> Result<f64, KernelError> {
    value
        .as_f64()
        .ok_or_else(|| bad_effect(path, "expected number"))
}

fn bad_effect(path: &str, detail: &str) -> KernelError {
    KernelError::new(
        ErrorCode::RuleError,
        format!("cannot apply effect at {path}: {detail}"),
    )
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpotlightPartition {
    pub active: Vec<String>,
    pub passive: Vec<String>,
    pub dormant: Vec<String>,
}

/// Deterministic per-tick spotlight: narrative importance, availability,
/// recency of activity, and a seeded noise term scored against the
/// configured thresholds. Character ids come out sorted because the world
/// map is ordered.
pub fn spotlight_partition(
    world: &WorldState,
    tick: u64,
    config: &NarratorConfig,
    seeds: &SeedManager,
) -> Result<SpotlightPartition, KernelError> {
    let mut partition = SpotlightPartition {
        active: Vec::new(),
        passive: Vec::new(),
        dormant: Vec::new(),
    };
    for (character_id, character) in &world.characters {
        let score = spotlight_score(character, tick, seeds)?;
        if score >= config.threshold_active {
            partition.active.push(character_id.clone());
        } else if score >= config.threshold_passive {
            partition.passive.push(character_id.clone());
        } else {
            partition.dormant.push(character_id.clone());
        }
    }
    Ok(partition)
}

fn spotlight_score(
    character: &Character,
    tick: u64,
    seeds: &SeedManager,
) -> Result<f64, KernelError> {
    let availability = if character
        .status_effects
        .iter()
        .any(|effect| effect == "incapacitated")
    {
        0.0
    } else {
        1.0
    };
    let idle_days =
        (tick.saturating_sub(character.last_active_tick) / TICKS_PER_DAY.max(1)) as f64;
    let recency = 1.0 / (1.0 + idle_days);
    let mut rng = seeds.rng(&format!("tick:{tick}:char:{}:spotlight", character.id))?;
    let noise: f64 = rng.gen_range(0.0..1.0);

    Ok(WEIGHT_IMPORTANCE * character.narrative_importance
        + WEIGHT_AVAILABILITY * availability
        + WEIGHT_RECENCY * recency
        + WEIGHT_NOISE * noise)
}

/// Rewrites state modes according to a partition, producing the snapshot the
/// tick actually executes against.
pub fn with_partition(world: &WorldState, partition: &SpotlightPartition) -> WorldState {
    let mut next = world.clone();
    for (ids, mode) in [
        (&partition.active, StateMode::Active),
        (&partition.passive, StateMode::Passive),
        (&partition.dormant, StateMode::Dormant),
    ] {
        for id in ids {
            if let Some(character) = next.characters.get_mut(id) {
                character.state_mode = mode;
            }
        }
    }
    next
}

/// Builds the facts a character is authorized to see: itself, co-located
/// characters, and the global tables. Construction is deterministic given
/// the snapshot.
pub fn visible_context(world: &WorldState, character_id: &str) -> Result<Value, KernelError> {
    let character = world
        .character(character_id)
        .ok_or_else(|| KernelError::invalid_argument(format!("unknown character: {character_id}")))?;

    let co_located: Vec<Value> = world
        .characters
        .values()
        .filter(|other| other.id != character.id && other.location_id == character.location_id)
        .map(|other| {
            json!({
                "id": other.id,
                "name": other.name,
                "status_effects": other.status_effects,
            })
        })
        .collect();

    Ok(json!({
        "tick": world.tick,
        "granularity": world.granularity,
        "you": {
            "id": character.id,
            "name": character.name,
            "location_id": character.location_id,
            "status_effects": character.status_effects,
            "attributes": character.attributes,
        },
        "co_located": co_located,
        "resources": world.resources,
        "phenology": world.phenology,
        "flags": world.flags,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use contracts::Granularity;
    use std::collections::BTreeMap;

    fn world_with(characters: Vec<Character>) -> WorldState {
        let map: BTreeMap<String, Character> = characters
            .into_iter()
            .map(|character| (character.id.clone(), character))
            .collect();
        WorldState::new(10, 2026, Granularity::Day, map).expect("world")
    }

    #[test]
    fn applies_resource_flag_and_character_paths() {
        let world = world_with(vec![Character::new("char:brena", "Brena", "loc:mill")]);
        let next = apply_changes(
            &world,
            &[
                StateChange::new("resources.grain", Value::Null, json!(12.5), "harvest"),
                StateChange::new("flags.festival", Value::Null, json!(true), "season"),
                StateChange::new(
                    "characters.char:brena.location_id",
                    json!("loc:mill"),
                    json!("loc:ford"),
                    "moved",
                ),
                StateChange::new(
                    "characters.char:brena.attributes.coin",
                    Value::Null,
                    json!(4),
                    "wage",
                ),
            ],
        )
        .expect("apply");

        assert_eq!(next.resources["grain"], 12.5);
        assert!(next.flags["festival"]);
        assert_eq!(next.characters["char:brena"].location_id, "loc:ford");
        assert_eq!(next.characters["char:brena"].attributes["coin"], json!(4));
        // The source snapshot is untouched.
        assert!(world.resources.is_empty());
    }

    #[test]
    fn unknown_path_is_a_rule_error() {
        let world = world_with(Vec::new());
        let err = apply_changes(
            &world,
            &[StateChange::new("weather.front", Value::Null, json!(1), "x")],
        )
        .unwrap_err();
        assert_eq!(err.code, ErrorCode::RuleError);
    }

    #[test]
    fn unknown_character_is_a_rule_error() {
        let world = world_with(Vec::new());
        let err = apply_changes(
            &world,
            &[StateChange::new(
                "characters.char:ghost.location_id",
                Value::Null,
                json!("loc:ford"),
                "x",
            )],
        )
        .unwrap_err();
        assert!(err.message.contains("unknown character"));
    }

    #[test]
    fn spotlight_partition_is_deterministic_and_threshold_driven() {
        let seeds = SeedManager::new(7);
        let config = NarratorConfig::default();
        let world = world_with(vec![
            Character::new("char:hero", "Hero", "loc:mill").with_importance(1.0),
            Character::new("char:bystander", "Bystander", "loc:mill").with_importance(0.0),
        ]);

        let first = spotlight_partition(&world, 10, &config, &seeds).expect("partition");
        let second = spotlight_partition(&world, 10, &config, &seeds).expect("partition");
        assert_eq!(first, second);
        assert!(first.active.contains(&"char:hero".to_string()));
    }

    #[test]
    fn incapacitated_characters_lose_availability() {
        let seeds = SeedManager::new(7);
        let mut hurt = Character::new("char:hurt", "Hurt", "loc:mill").with_importance(0.4);
        hurt.status_effects.push("incapacitated".to_string());
        let healthy = Character::new("char:whole", "Whole", "loc:mill").with_importance(0.4);

        let hurt_score = spotlight_score(&hurt, 10, &seeds).expect("score");
        let healthy_score = spotlight_score(&healthy, 10, &seeds).expect("score");
        assert!(healthy_score > hurt_score);
    }

    #[test]
    fn visible_context_scopes_to_location() {
        let world = world_with(vec![
            Character::new("char:ansel", "Ansel", "loc:mill"),
            Character::new("char:brena", "Brena", "loc:mill"),
            Character::new("char:cadoc", "Cadoc", "loc:keep"),
        ]);
        let context = visible_context(&world, "char:ansel").expect("context");
        let co_located = context["co_located"].as_array().expect("co_located");
        assert_eq!(co_located.len(), 1);
        assert_eq!(co_located[0]["id"], "char:brena");
    }

    #[test]
    fn visible_context_is_byte_stable() {
        let world = world_with(vec![
            Character::new("char:ansel", "Ansel", "loc:mill"),
            Character::new("char:brena", "Brena", "loc:mill"),
        ]);
        let first = visible_context(&world, "char:ansel").expect("context");
        let second = visible_context(&world, "char:ansel").expect("context");
        assert_eq!(first.to_string(), second.to_string());
    }
}
