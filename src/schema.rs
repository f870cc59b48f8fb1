/// JSON Schema 2020-12 による LLM 出力の契約検証。
use once_cell::sync::Lazy;
use serde_json::{Value, json};

/// クラスタラベル応答のスキーマ。
pub(crate) static LABEL_RESPONSE_SCHEMA: Lazy<Value> = Lazy::new(|| {
    json!({
        "$schema": "https://json-schema.org/draft/2020-12/schema",
        "title": "Cluster label response",
        "type": "object",
        "properties": {
            "label": { "type": "string", "minLength": 1 },
            "keywords": {
                "type": "array",
                "items": { "type": "string", "minLength": 1 },
                "minItems": 1
            },
            "sentiment": { "type": "number" },
            "reasoning": { "type": "string" }
        },
        "required": ["label", "keywords", "sentiment"]
    })
});

#[derive(Debug)]
pub(crate) struct ValidationResult {
    pub(crate) valid: bool,
    pub(crate) errors: Vec<String>,
}

impl ValidationResult {
    fn valid() -> Self {
        Self {
            valid: true,
            errors: Vec::new(),
        }
    }

    fn invalid(errors: Vec<String>) -> Self {
        Self {
            valid: false,
            errors,
        }
    }
}

/// JSON Schemaでデータを検証する。
pub(crate) fn validate_json(schema_json: &Value, instance: &Value) -> ValidationResult {
    match jsonschema::draft202012::new(schema_json) {
        Ok(validator) => {
            let errors: Vec<String> = validator
                .iter_errors(instance)
                .map(|e| format!("{} at {}", e, e.instance_path))
                .collect();
            if errors.is_empty() {
                ValidationResult::valid()
            } else {
                ValidationResult::invalid(errors)
            }
        }
        Err(e) => ValidationResult::invalid(vec![format!("schema compilation error: {e}")]),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_complete_label() {
        let instance = json!({
            "label": "Fare increases",
            "keywords": ["fares", "bus"],
            "sentiment": -0.4,
            "reasoning": "Posts complain about prices."
        });

        let result = validate_json(&LABEL_RESPONSE_SCHEMA, &instance);

        assert!(result.valid, "{:?}", result.errors);
    }

    #[test]
    fn rejects_missing_keywords_and_wrong_types() {
        let instance = json!({ "label": "", "sentiment": "negative" });

        let result = validate_json(&LABEL_RESPONSE_SCHEMA, &instance);

        assert!(!result.valid);
        assert!(result.errors.len() >= 2);
    }
}
