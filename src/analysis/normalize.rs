use serde_json::Value;

use super::{AnalysisItem, Macros, MealAnalysis};

const DEFAULT_ITEM_NAME: &str = "Item";
const DEFAULT_ITEM_UNIT: &str = "serving";
const DEFAULT_ITEM_QUANTITY: f64 = 1.0;

impl MealAnalysis {
    /// Coerce an engine response into a well-formed estimate.
    ///
    /// Every number ends up finite and non-negative (missing or malformed
    /// values become `0`), item quantities end up strictly positive, and
    /// item entries without a usable name or unit get `"Item"`/`"serving"`.
    pub fn from_raw(raw: &Value) -> Self {
        let macros = raw.get("macros");
        let field = |key: &str| macros.and_then(|m| m.get(key));

        let items = raw
            .get("items")
            .and_then(Value::as_array)
            .map(|items| items.iter().map(item_from_raw).collect())
            .unwrap_or_default();

        Self {
            calories: non_negative(raw.get("calories")),
            macros: Macros {
                protein: non_negative(field("protein")),
                carbs: non_negative(field("carbs")),
                fat: non_negative(field("fat")),
            },
            items,
        }
    }
}

fn item_from_raw(raw: &Value) -> AnalysisItem {
    let quantity = as_number(raw.get("quantity"))
        .filter(|q| *q > 0.0)
        .unwrap_or(DEFAULT_ITEM_QUANTITY);

    AnalysisItem {
        name: text_or(raw.get("name"), DEFAULT_ITEM_NAME),
        quantity,
        unit: text_or(raw.get("unit"), DEFAULT_ITEM_UNIT),
    }
}

fn non_negative(value: Option<&Value>) -> f64 {
    as_number(value).filter(|n| *n >= 0.0).unwrap_or(0.0)
}

/// Numeric reading of a JSON value; numeric strings count, anything that
/// does not produce a finite number is `None`.
fn as_number(value: Option<&Value>) -> Option<f64> {
    let n = match value? {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => s.trim().parse::<f64>().ok()?,
        Value::Bool(b) => f64::from(u8::from(*b)),
        _ => return None,
    };
    n.is_finite().then_some(n)
}

fn text_or(value: Option<&Value>, fallback: &str) -> String {
    let text = match value {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    };
    if text.is_empty() {
        fallback.to_string()
    } else {
        text
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn malformed_response_degrades_to_zero_estimate() {
        let raw = json!({
            "calories": "NaN",
            "macros": {},
            "items": [{ "quantity": "x" }]
        });

        let analysis = MealAnalysis::from_raw(&raw);
        assert_eq!(analysis.calories, 0.0);
        assert_eq!(analysis.macros, Macros::default());
        assert_eq!(
            analysis.items,
            vec![AnalysisItem {
                name: "Item".into(),
                quantity: 1.0,
                unit: "serving".into(),
            }]
        );
    }

    #[test]
    fn well_formed_response_is_kept() {
        let raw = json!({
            "calories": 610,
            "macros": { "protein": 26, "carbs": 55.5, "fat": 28 },
            "items": [{ "name": "Salmon fillet", "quantity": 1, "unit": "piece" }]
        });

        let analysis = MealAnalysis::from_raw(&raw);
        assert_eq!(analysis.calories, 610.0);
        assert_eq!(analysis.macros.carbs, 55.5);
        assert_eq!(analysis.items[0].name, "Salmon fillet");
        assert_eq!(analysis.items[0].unit, "piece");
    }

    #[test]
    fn numeric_strings_are_read_and_negatives_clamped() {
        let raw = json!({
            "calories": " 420 ",
            "macros": { "protein": -3, "carbs": "12.5", "fat": null },
            "items": [{ "name": "", "quantity": -2, "unit": "   " }]
        });

        let analysis = MealAnalysis::from_raw(&raw);
        assert_eq!(analysis.calories, 420.0);
        assert_eq!(analysis.macros.protein, 0.0);
        assert_eq!(analysis.macros.carbs, 12.5);
        assert_eq!(analysis.macros.fat, 0.0);
        assert_eq!(analysis.items[0].name, "Item");
        assert_eq!(analysis.items[0].quantity, 1.0);
        assert_eq!(analysis.items[0].unit, "serving");
    }

    #[test]
    fn non_array_items_and_non_object_payloads() {
        let analysis = MealAnalysis::from_raw(&json!({ "items": "soup" }));
        assert!(analysis.items.is_empty());

        let analysis = MealAnalysis::from_raw(&json!("not an object"));
        assert_eq!(analysis, MealAnalysis::default());

        let analysis = MealAnalysis::from_raw(&json!({ "items": [42, null] }));
        assert_eq!(analysis.items.len(), 2);
        assert!(analysis.items.iter().all(|i| i.name == "Item" && i.quantity == 1.0));
    }
}
