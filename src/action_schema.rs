use std::fmt;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value};

use crate::coordinates::parse_target_index;
use crate::error::{EngineError, EngineResult};

/// Longest `delay` accepted from a reply or a stored history: one day.
pub const MAX_DELAY_SECONDS: f64 = 86_400.0;

/// Every kind of action the engine knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    Open,
    Click,
    Scroll,
    Input,
    Hotkey,
    PressEnter,
    Finish,
    Delay,
    Move,
}

impl ActionKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ActionKind::Open => "open",
            ActionKind::Click => "click",
            ActionKind::Scroll => "scroll",
            ActionKind::Input => "input",
            ActionKind::Hotkey => "hotkey",
            ActionKind::PressEnter => "press_enter",
            ActionKind::Finish => "finish",
            ActionKind::Delay => "delay",
            ActionKind::Move => "move",
        }
    }

    /// Accepts the canonical names plus the spellings older histories used.
    pub fn from_name(raw: &str) -> Option<Self> {
        let lower = raw.trim().to_lowercase();
        let kind = match lower.as_str() {
            "open" | "double_click" | "doubleclick" => ActionKind::Open,
            "click" => ActionKind::Click,
            "scroll" => ActionKind::Scroll,
            "input" | "type" => ActionKind::Input,
            "hotkey" | "hot_key" | "shortcut" => ActionKind::Hotkey,
            "press_enter" | "enter" => ActionKind::PressEnter,
            "finish" | "done" => ActionKind::Finish,
            "delay" | "wait" => ActionKind::Delay,
            "move" => ActionKind::Move,
            _ => return None,
        };
        Some(kind)
    }

    /// Kinds that act on a point of the screen when they reference an element.
    pub fn needs_location(self) -> bool {
        matches!(self, ActionKind::Click | ActionKind::Open | ActionKind::Input)
    }

    /// Kinds whose effect must be confirmed by a visible desktop change.
    pub fn needs_stabilization(self) -> bool {
        matches!(self, ActionKind::Click | ActionKind::Open | ActionKind::Scroll)
    }
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MouseButton {
    #[default]
    Left,
    Right,
    Middle,
}

impl MouseButton {
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "left" => Some(MouseButton::Left),
            "right" => Some(MouseButton::Right),
            "middle" => Some(MouseButton::Middle),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MouseButton::Left => "left",
            MouseButton::Right => "right",
            MouseButton::Middle => "middle",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ScrollDirection {
    #[default]
    Up,
    Down,
    Left,
    Right,
}

impl ScrollDirection {
    pub fn from_name(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "up" => Some(ScrollDirection::Up),
            "down" => Some(ScrollDirection::Down),
            "left" => Some(ScrollDirection::Left),
            "right" => Some(ScrollDirection::Right),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            ScrollDirection::Up => "up",
            ScrollDirection::Down => "down",
            ScrollDirection::Left => "left",
            ScrollDirection::Right => "right",
        }
    }
}

/// Optional parameters; which ones matter depends on the action kind.
#[derive(Debug, Clone, PartialEq, Default, Serialize)]
pub struct ParamSet {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text_content: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_sequence: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub button_type: Option<MouseButton>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub clicks: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub direction: Option<ScrollDirection>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub x: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub y: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub seconds: Option<f64>,
}

impl ParamSet {
    pub fn point(&self) -> Option<(f64, f64)> {
        match (self.x, self.y) {
            (Some(x), Some(y)) => Some((x, y)),
            _ => None,
        }
    }
}

/// One schema-conformant unit of input intent.
///
/// Only [`validate_action`] and the recorder build these, so every value in
/// circulation has passed the schema checks.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Action {
    pub action: ActionKind,
    pub id: i64,
    pub target: String,
    pub params: ParamSet,
}

impl Action {
    pub const NO_ELEMENT: i64 = -1;

    pub fn new(action: ActionKind, target: impl Into<String>, params: ParamSet) -> Self {
        Self {
            action,
            id: Self::NO_ELEMENT,
            target: target.into(),
            params,
        }
    }

    pub fn finish() -> Self {
        Self::new(ActionKind::Finish, "finish", ParamSet::default())
    }

    pub fn references_element(&self) -> bool {
        self.id >= 0
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

/// How missing kind-specific parameters are treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strictness {
    /// Responses from the instruction source: required params must be present.
    Strict,
    /// Persisted histories: missing params are filled with defaults.
    Lenient,
}

fn schema_err(msg: impl Into<String>) -> EngineError {
    EngineError::SchemaViolation(msg.into())
}

fn string_field(obj: &Map<String, Value>, key: &str) -> EngineResult<Option<String>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(Value::Number(n)) => Ok(Some(n.to_string())),
        Some(Value::Bool(b)) => Ok(Some(b.to_string())),
        Some(other) => Err(schema_err(format!("'{}' must be a string, got {}", key, other))),
    }
}

fn number_field(obj: &Map<String, Value>, key: &str) -> EngineResult<Option<f64>> {
    match obj.get(key) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_f64()
            .map(Some)
            .ok_or_else(|| schema_err(format!("'{}' is not a finite number", key))),
        Some(Value::String(s)) => s
            .trim()
            .parse::<f64>()
            .map(Some)
            .map_err(|_| schema_err(format!("'{}' must be a number, got '{}'", key, s))),
        Some(other) => Err(schema_err(format!("'{}' must be a number, got {}", key, other))),
    }
}

fn parse_key_sequence(value: &Value) -> EngineResult<Vec<String>> {
    match value {
        Value::Array(items) => items
            .iter()
            .map(|item| match item {
                Value::String(s) => Ok(s.trim().to_lowercase()),
                other => Err(schema_err(format!("key_sequence entries must be strings, got {}", other))),
            })
            .filter(|k| !matches!(k, Ok(s) if s.is_empty()))
            .collect(),
        // "ctrl+c" style shorthand
        Value::String(s) => Ok(s
            .split('+')
            .map(|part| part.trim().to_lowercase())
            .filter(|part| !part.is_empty())
            .collect()),
        other => Err(schema_err(format!("key_sequence must be a list, got {}", other))),
    }
}

fn parse_params(raw: Option<&Value>) -> EngineResult<ParamSet> {
    let obj = match raw {
        None | Some(Value::Null) => return Ok(ParamSet::default()),
        Some(Value::Object(obj)) => obj,
        Some(other) => return Err(schema_err(format!("'params' must be an object, got {}", other))),
    };

    let mut params = ParamSet {
        text_content: string_field(obj, "text_content")?,
        ..ParamSet::default()
    };

    if let Some(keys) = obj.get("key_sequence").filter(|v| !v.is_null()) {
        params.key_sequence = Some(parse_key_sequence(keys)?);
    }

    if let Some(name) = string_field(obj, "button_type")? {
        let button = MouseButton::from_name(&name)
            .ok_or_else(|| schema_err(format!("unknown button_type '{}'", name)))?;
        params.button_type = Some(button);
    }

    if let Some(clicks) = number_field(obj, "clicks")? {
        if clicks < 1.0 || clicks.fract() != 0.0 {
            return Err(schema_err(format!("clicks must be a positive integer, got {}", clicks)));
        }
        params.clicks = Some(clicks as u32);
    }

    if let Some(name) = string_field(obj, "direction")? {
        let direction = ScrollDirection::from_name(&name)
            .ok_or_else(|| schema_err(format!("unknown direction '{}'", name)))?;
        params.direction = Some(direction);
    }

    params.x = number_field(obj, "x")?;
    params.y = number_field(obj, "y")?;
    if params.x.is_some() != params.y.is_some() {
        return Err(schema_err("x and y must be given together"));
    }

    if let Some(seconds) = number_field(obj, "seconds")? {
        if seconds < 0.0 {
            return Err(schema_err(format!("seconds must not be negative, got {}", seconds)));
        }
        if seconds > MAX_DELAY_SECONDS {
            return Err(schema_err(format!(
                "seconds must be at most {}, got {}",
                MAX_DELAY_SECONDS, seconds
            )));
        }
        params.seconds = Some(seconds);
    }

    Ok(params)
}

fn apply_kind_rules(kind: ActionKind, params: &mut ParamSet, strictness: Strictness) -> EngineResult<()> {
    let lenient = strictness == Strictness::Lenient;
    match kind {
        ActionKind::Click => {
            params.button_type.get_or_insert(MouseButton::Left);
            params.clicks.get_or_insert(1);
        }
        ActionKind::Open => {
            params.button_type.get_or_insert(MouseButton::Left);
        }
        ActionKind::Input => {
            if params.text_content.is_none() {
                if !lenient {
                    return Err(schema_err("input requires 'text_content'"));
                }
                params.text_content = Some(String::new());
            }
        }
        ActionKind::Hotkey => {
            let has_keys = params.key_sequence.as_ref().map(|k| !k.is_empty()).unwrap_or(false);
            if !has_keys {
                if !lenient {
                    return Err(schema_err("hotkey requires a non-empty 'key_sequence'"));
                }
                params.key_sequence.get_or_insert_with(Vec::new);
            }
        }
        ActionKind::Scroll => {
            if params.direction.is_none() {
                if !lenient {
                    return Err(schema_err("scroll requires 'direction'"));
                }
                params.direction = Some(ScrollDirection::Up);
            }
        }
        ActionKind::Delay => {
            if params.seconds.is_none() {
                if !lenient {
                    return Err(schema_err("delay requires 'seconds'"));
                }
                params.seconds = Some(0.0);
            }
        }
        ActionKind::Move => {
            if params.point().is_none() {
                return Err(schema_err("move requires 'x' and 'y'"));
            }
        }
        ActionKind::PressEnter | ActionKind::Finish => {}
    }
    Ok(())
}

/// Checks a candidate object against the action contract and returns the
/// normalized action with defaults filled.
pub fn validate_action(candidate: &Value, strictness: Strictness) -> EngineResult<Action> {
    let mut candidate = candidate;
    // {"action": {...}} wrappers show up in some model outputs
    if candidate.get("action").map(Value::is_object).unwrap_or(false) {
        candidate = &candidate["action"];
    }

    let obj = candidate
        .as_object()
        .ok_or_else(|| schema_err("action must be a JSON object"))?;

    let kind_name = match obj.get("action") {
        Some(Value::String(s)) if !s.trim().is_empty() => s.clone(),
        Some(Value::String(_)) | None | Some(Value::Null) => return Err(schema_err("missing 'action' field")),
        Some(other) => return Err(schema_err(format!("'action' must be a string, got {}", other))),
    };
    let kind = ActionKind::from_name(&kind_name)
        .ok_or_else(|| schema_err(format!("unknown action '{}'", kind_name)))?;

    let raw_id = obj.get("id").filter(|v| !v.is_null()).ok_or_else(|| schema_err("missing 'id' field"))?;
    let id = parse_target_index(raw_id)?;

    let target = string_field(obj, "target")?.ok_or_else(|| schema_err("missing 'target' field"))?;

    let mut params = parse_params(obj.get("params"))?;
    apply_kind_rules(kind, &mut params, strictness)?;

    Ok(Action {
        action: kind,
        id,
        target,
        params,
    })
}

/// Pulls a JSON value out of free text: the whole text first, then the first
/// fenced code block.
pub fn robust_json_extract(text: &str) -> EngineResult<Value> {
    let trimmed = text.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Ok(value);
    }

    if let Some(block) = fenced_block(trimmed) {
        let cleaned = block.replace("```json", "").replace("```", "");
        if let Ok(value) = serde_json::from_str::<Value>(cleaned.trim()) {
            return Ok(value);
        }
    }

    Err(EngineError::NoValidJson(preview(trimmed)))
}

/// Extracts and validates the single action carried by an instruction-source reply.
pub fn parse_action_text(text: &str) -> EngineResult<Action> {
    let value = robust_json_extract(text)?;
    let candidate = match &value {
        Value::Array(items) => items
            .first()
            .ok_or_else(|| schema_err("empty action list"))?,
        other => other,
    };
    validate_action(candidate, Strictness::Strict)
}

/// Extracts the ordered step list of a workflow reply. Steps stay raw so each
/// one is validated when it runs.
pub fn parse_workflow_text(text: &str) -> EngineResult<Vec<Value>> {
    let value = robust_json_extract(text)?;
    let steps = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => {
            let list = ["actions", "workflow", "steps"]
                .iter()
                .find_map(|key| match obj.remove(*key) {
                    Some(Value::Array(items)) => Some(items),
                    _ => None,
                });
            match list {
                Some(items) => items,
                None => vec![Value::Object(obj)],
            }
        }
        other => return Err(schema_err(format!("workflow must be a list of actions, got {}", other))),
    };
    Ok(steps)
}

fn preview(text: &str) -> String {
    const MAX: usize = 120;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let cut: String = text.chars().take(MAX).collect();
        format!("{}...", cut)
    }
}

fn fenced_block(text: &str) -> Option<String> {
    static JSON_FENCE: OnceLock<Regex> = OnceLock::new();
    let pattern = JSON_FENCE.get_or_init(|| Regex::new(r"(?s)```(?:json|JSON)?(.*?)```").expect("static regex"));
    pattern
        .captures(text)
        .and_then(|caps| caps.get(1))
        .map(|m| m.as_str().trim().to_string())
}

/// Append-only record of the actions that took effect in one session.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ActionHistory {
    actions: Vec<Action>,
}

impl ActionHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, action: Action) {
        self.actions.push(action);
    }

    pub fn as_slice(&self) -> &[Action] {
        &self.actions
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn click_without_params_gets_defaults() {
        let action = validate_action(&json!({"id": 3, "action": "click", "target": "OK"}), Strictness::Strict).unwrap();
        assert_eq!(action.action, ActionKind::Click);
        assert_eq!(action.params.button_type, Some(MouseButton::Left));
        assert_eq!(action.params.clicks, Some(1));
    }

    #[test]
    fn missing_required_fields_violate_schema() {
        for candidate in [
            json!({"action": "click", "target": "x"}),
            json!({"id": 1, "target": "x"}),
            json!({"id": 1, "action": "click"}),
            json!({"id": 1, "action": "launch", "target": "x"}),
        ] {
            let err = validate_action(&candidate, Strictness::Strict).unwrap_err();
            assert!(matches!(err, EngineError::SchemaViolation(_)), "{:?}", candidate);
        }
    }

    #[test]
    fn kind_specific_params_are_required_in_strict_mode() {
        for candidate in [
            json!({"id": 1, "action": "input", "target": "box", "params": {}}),
            json!({"id": -1, "action": "hotkey", "target": "copy", "params": {}}),
            json!({"id": -1, "action": "scroll", "target": "page"}),
        ] {
            let err = validate_action(&candidate, Strictness::Strict).unwrap_err();
            assert!(matches!(err, EngineError::SchemaViolation(_)), "{:?}", candidate);
        }
    }

    #[test]
    fn lenient_mode_fills_kind_defaults() {
        let input = validate_action(&json!({"id": -1, "action": "input", "target": "t"}), Strictness::Lenient).unwrap();
        assert_eq!(input.params.text_content.as_deref(), Some(""));
        let hotkey = validate_action(&json!({"id": -1, "action": "hotkey", "target": "t"}), Strictness::Lenient).unwrap();
        assert_eq!(hotkey.params.key_sequence, Some(vec![]));
        let scroll = validate_action(&json!({"id": -1, "action": "scroll", "target": "t"}), Strictness::Lenient).unwrap();
        assert_eq!(scroll.params.direction, Some(ScrollDirection::Up));
    }

    #[test]
    fn non_numeric_id_is_an_invalid_target() {
        let err = validate_action(&json!({"id": "abc", "action": "click", "target": "x"}), Strictness::Strict).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTarget(_)));
        let ok = validate_action(&json!({"id": "4", "action": "click", "target": "x"}), Strictness::Strict).unwrap();
        assert_eq!(ok.id, 4);
    }

    #[test]
    fn hotkey_accepts_plus_shorthand() {
        let action = validate_action(
            &json!({"id": -1, "action": "hot_key", "target": "copy", "params": {"key_sequence": "Ctrl+C"}}),
            Strictness::Strict,
        )
        .unwrap();
        assert_eq!(action.action, ActionKind::Hotkey);
        assert_eq!(action.params.key_sequence, Some(vec!["ctrl".to_string(), "c".to_string()]));
    }

    #[test]
    fn oversized_delay_is_rejected_in_both_modes() {
        let huge = json!({"id": -1, "action": "delay", "target": "wait", "params": {"seconds": 1e20}});
        for strictness in [Strictness::Strict, Strictness::Lenient] {
            let err = validate_action(&huge, strictness).unwrap_err();
            assert!(matches!(err, EngineError::SchemaViolation(_)));
        }
        let day = json!({"id": -1, "action": "delay", "target": "wait", "params": {"seconds": 86400}});
        assert_eq!(validate_action(&day, Strictness::Strict).unwrap().params.seconds, Some(MAX_DELAY_SECONDS));
    }

    #[test]
    fn half_a_coordinate_is_rejected() {
        let err = validate_action(
            &json!({"id": -1, "action": "click", "target": "x", "params": {"x": 10}}),
            Strictness::Lenient,
        )
        .unwrap_err();
        assert!(matches!(err, EngineError::SchemaViolation(_)));
    }

    #[test]
    fn extracts_fenced_json() {
        let text = "prefix ```json {\"action\":\"finish\",\"id\":-1,\"target\":\"None\",\"params\":{}} ``` suffix";
        let value = robust_json_extract(text).unwrap();
        assert_eq!(value["action"], "finish");
        let action = parse_action_text(text).unwrap();
        assert_eq!(action.action, ActionKind::Finish);
        assert_eq!(action.target, "None");
    }

    #[test]
    fn extracts_plain_json_and_rejects_prose() {
        let value = robust_json_extract(r#"{"action":"press_enter","id":-1,"target":"form"}"#).unwrap();
        assert_eq!(value["action"], "press_enter");
        let err = robust_json_extract("I think you should click the button").unwrap_err();
        assert!(matches!(err, EngineError::NoValidJson(_)));
    }

    #[test]
    fn workflow_text_accepts_wrapped_lists() {
        let steps = parse_workflow_text(r#"{"actions": [{"action": "finish", "id": -1, "target": "done"}]}"#).unwrap();
        assert_eq!(steps.len(), 1);
        let steps = parse_workflow_text("```json\n[{\"a\":1},{\"b\":2}]\n```").unwrap();
        assert_eq!(steps.len(), 2);
    }

    #[test]
    fn serialized_form_omits_absent_params() {
        let action = validate_action(&json!({"id": 2, "action": "open", "target": "Chrome"}), Strictness::Strict).unwrap();
        let value = action.to_value();
        assert_eq!(value["params"], json!({"button_type": "left"}));
        assert_eq!(value["action"], "open");
    }
}
