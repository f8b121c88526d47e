use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::action_schema::{Action, ActionKind};
use crate::error::{EngineError, EngineResult};

/// A UI element reported by the vision service for one screenshot.
///
/// `bbox` is `[xmin, ymin, xmax, ymax]` in normalized `[0, 1]` coordinates and
/// `id` only means something within the snapshot that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DetectedElement {
    pub id: i64,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: String,
    pub bbox: [f64; 4],
}

impl DetectedElement {
    /// The element without its geometry, which is all the instruction source needs.
    pub fn summary(&self) -> Value {
        serde_json::json!({ "id": self.id, "type": self.kind, "content": self.content })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenSize {
    pub width: u32,
    pub height: u32,
}

impl ScreenSize {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

/// Reads an element reference: an integer, or a string holding one.
/// `-1` means "no element".
pub fn parse_target_index(raw: &Value) -> EngineResult<i64> {
    let index = match raw {
        Value::Number(n) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.fract() == 0.0).map(|f| f as i64)),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    }
    .ok_or_else(|| EngineError::InvalidTarget(format!("element index is not numeric: {}", raw)))?;

    if index < Action::NO_ELEMENT {
        return Err(EngineError::InvalidTarget(format!("element index out of range: {}", index)));
    }
    Ok(index)
}

/// Centre of a normalized bbox scaled to the screen, clamped to its bounds.
pub fn bbox_center(bbox: &[f64; 4], screen: ScreenSize) -> (f64, f64) {
    let [xmin, ymin, xmax, ymax] = *bbox;
    let width = screen.width as f64;
    let height = screen.height as f64;
    let x = ((xmin + xmax) / 2.0 * width).clamp(0.0, width);
    let y = ((ymin + ymax) / 2.0 * height).clamp(0.0, height);
    (x, y)
}

pub fn find_element(elements: &[DetectedElement], index: i64) -> EngineResult<&DetectedElement> {
    elements.iter().find(|e| e.id == index).ok_or_else(|| {
        EngineError::InvalidTarget(format!(
            "element index {} out of range ({} element(s) detected)",
            index,
            elements.len()
        ))
    })
}

/// Fills in the screen point an action should land on.
///
/// Literal `x`/`y` already on the action win, so resolving twice is a no-op.
pub fn resolve_action(
    action: &Action,
    elements: Option<&[DetectedElement]>,
    screen: ScreenSize,
) -> EngineResult<Action> {
    if action.params.point().is_some() || !action.references_element() {
        return Ok(action.clone());
    }

    let mut resolved = action.clone();
    match (action.action.needs_location(), elements) {
        (true, None) => {
            return Err(EngineError::InvalidTarget(format!(
                "{} on element {} needs a detection snapshot",
                action.action, action.id
            )))
        }
        (true, Some(elements)) => {
            let element = find_element(elements, action.id)?;
            let (x, y) = bbox_center(&element.bbox, screen);
            resolved.params.x = Some(x);
            resolved.params.y = Some(y);
        }
        // scroll may aim at an element, but does not have to
        (false, Some(elements)) if action.action == ActionKind::Scroll => {
            if let Ok(element) = find_element(elements, action.id) {
                let (x, y) = bbox_center(&element.bbox, screen);
                resolved.params.x = Some(x);
                resolved.params.y = Some(y);
            }
        }
        (false, _) => {}
    }
    Ok(resolved)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action_schema::{validate_action, Strictness};
    use serde_json::json;

    fn elements(n: usize) -> Vec<DetectedElement> {
        (0..n)
            .map(|i| DetectedElement {
                id: i as i64,
                kind: "icon".to_string(),
                content: format!("item {}", i),
                bbox: [0.1 * i as f64, 0.1, 0.1 * i as f64 + 0.1, 0.3],
            })
            .collect()
    }

    fn click(id: i64) -> Action {
        validate_action(&json!({"id": id, "action": "click", "target": "t"}), Strictness::Strict).unwrap()
    }

    #[test]
    fn resolves_bbox_midpoint() {
        let screen = ScreenSize::new(1000, 500);
        let resolved = resolve_action(&click(2), Some(&elements(3)), screen).unwrap();
        let (x, y) = resolved.params.point().unwrap();
        assert!((x - 250.0).abs() < 1e-9);
        assert!((y - 100.0).abs() < 1e-9);
    }

    #[test]
    fn out_of_range_index_is_invalid_target() {
        let err = resolve_action(&click(5), Some(&elements(3)), ScreenSize::new(100, 100)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTarget(_)));
    }

    #[test]
    fn missing_snapshot_is_invalid_target() {
        let err = resolve_action(&click(0), None, ScreenSize::new(100, 100)).unwrap_err();
        assert!(matches!(err, EngineError::InvalidTarget(_)));
    }

    #[test]
    fn literal_coordinates_are_kept() {
        let mut action = click(1);
        action.params.x = Some(12.5);
        action.params.y = Some(40.0);
        let once = resolve_action(&action, Some(&elements(3)), ScreenSize::new(800, 600)).unwrap();
        let twice = resolve_action(&once, None, ScreenSize::new(800, 600)).unwrap();
        assert_eq!(once.params.point(), Some((12.5, 40.0)));
        assert_eq!(twice, once);
    }

    #[test]
    fn no_element_actions_need_no_snapshot() {
        let hotkey = validate_action(
            &json!({"id": -1, "action": "hotkey", "target": "copy", "params": {"key_sequence": ["ctrl", "c"]}}),
            Strictness::Strict,
        )
        .unwrap();
        let resolved = resolve_action(&hotkey, None, ScreenSize::new(100, 100)).unwrap();
        assert_eq!(resolved, hotkey);
    }

    #[test]
    fn center_is_clamped_to_screen() {
        let (x, y) = bbox_center(&[0.9, 0.9, 1.4, 1.6], ScreenSize::new(100, 200));
        assert_eq!(x, 100.0);
        assert_eq!(y, 200.0);
    }

    #[test]
    fn index_parsing() {
        assert_eq!(parse_target_index(&json!(-1)).unwrap(), -1);
        assert_eq!(parse_target_index(&json!(" 7 ")).unwrap(), 7);
        assert!(parse_target_index(&json!(-3)).is_err());
        assert!(parse_target_index(&json!("seven")).is_err());
        assert!(parse_target_index(&json!(1.5)).is_err());
    }
}
