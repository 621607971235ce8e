//! Report encoding: raw health report to a schema-ordered feature vector.
//!
//! Reports are open-world JSON objects. Every column starts at zero; numeric
//! fields are copied, the animal type becomes a one-hot column and each
//! symptom becomes a binary column after normalisation. Anything the schema
//! does not name is dropped without error.

use crate::config::EncoderConfig;
use crate::errors::{Result, VetreeError};
use crate::schema::FeatureSchema;
use serde_json::Value;

/// Dense feature vector in schema order. `NaN` marks an absent value.
pub type FeatureVector = Vec<f64>;

/// Lowercase, replace everything outside `[a-z0-9]` and whitespace with a
/// space, collapse whitespace runs and trim.
pub fn normalize_token(text: &str) -> String {
    let cleaned: String = text
        .to_lowercase()
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c.is_whitespace() {
                c
            } else {
                ' '
            }
        })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// Builds feature vectors according to an [`EncoderConfig`].
#[derive(Debug, Clone, Default)]
pub struct FeatureEncoder {
    config: EncoderConfig,
}

impl FeatureEncoder {
    pub fn new(config: EncoderConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &EncoderConfig {
        &self.config
    }

    /// Column name a free-text token maps to.
    pub fn token_column(&self, token: &str) -> String {
        normalize_token(token).replace(' ', &self.config.token_separator)
    }

    /// Encode `report` against `schema`. The result always has
    /// `schema.len()` entries.
    pub fn build(&self, report: &Value, schema: &FeatureSchema) -> Result<FeatureVector> {
        let fields = report
            .as_object()
            .ok_or_else(|| VetreeError::InvalidReport("report must be a JSON object".into()))?;

        let mut vector = vec![0.0; schema.len()];

        for field in &self.config.numeric_fields {
            let value = numeric_value(field, fields.get(field))?;
            if let Some(idx) = schema.index_of(field) {
                vector[idx] = value;
            }
        }

        match fields.get(&self.config.categorical_field) {
            None | Some(Value::Null) => {}
            Some(Value::String(category)) => {
                let column = format!("{}{}", self.config.categorical_prefix, category.to_lowercase());
                if let Some(idx) = schema.index_of(&column) {
                    vector[idx] = 1.0;
                }
            }
            Some(other) => {
                return Err(VetreeError::InvalidReport(format!(
                    "'{}' must be a string, got {other}",
                    self.config.categorical_field
                )))
            }
        }

        match fields.get(&self.config.multi_hot_field) {
            None | Some(Value::Null) => {}
            Some(Value::Array(tokens)) => {
                for token in tokens {
                    let token = token.as_str().ok_or_else(|| {
                        VetreeError::InvalidReport(format!(
                            "'{}' entries must be strings, got {token}",
                            self.config.multi_hot_field
                        ))
                    })?;
                    if let Some(idx) = schema.index_of(&self.token_column(token)) {
                        vector[idx] = 1.0;
                    }
                }
            }
            Some(other) => {
                return Err(VetreeError::InvalidReport(format!(
                    "'{}' must be a list of strings, got {other}",
                    self.config.multi_hot_field
                )))
            }
        }

        Ok(vector)
    }
}

/// Encode `report` with the default encoder configuration.
pub fn build_feature_vector(report: &Value, schema: &FeatureSchema) -> Result<FeatureVector> {
    FeatureEncoder::default().build(report, schema)
}

// Falsy values (null, false, 0, "") encode as zero.
fn numeric_value(field: &str, value: Option<&Value>) -> Result<f64> {
    match value {
        None | Some(Value::Null) => Ok(0.0),
        Some(Value::Bool(b)) => Ok(if *b { 1.0 } else { 0.0 }),
        Some(Value::Number(n)) => n
            .as_f64()
            .ok_or_else(|| VetreeError::InvalidReport(format!("'{field}' is not representable: {n}"))),
        Some(Value::String(s)) if s.trim().is_empty() => Ok(0.0),
        // "nan" and "inf" parse, but would bypass the threshold comparison.
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(v) if v.is_finite() => Ok(v),
            Ok(_) => Err(VetreeError::InvalidReport(format!(
                "'{field}' must be a finite number, got {s:?}"
            ))),
            Err(_) => Err(VetreeError::InvalidReport(format!(
                "'{field}' is not numeric: {s:?}"
            ))),
        },
        Some(other) => Err(VetreeError::InvalidReport(format!(
            "'{field}' must be a number, got {other}"
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> FeatureSchema {
        FeatureSchema::new(["age", "body_temperature", "animal_cow", "animal_goat", "fever", "cough"])
            .unwrap()
    }

    #[test]
    fn test_numeric_and_categorical() {
        let report = json!({"animal_type": "cow", "age": 5, "body_temperature": 38.5, "symptoms": []});
        let vector = build_feature_vector(&report, &schema()).unwrap();
        assert_eq!(vector, vec![5.0, 38.5, 1.0, 0.0, 0.0, 0.0]);
    }

    #[test]
    fn test_symptoms_are_normalised() {
        let report = json!({"symptoms": ["Fever!", "  cough "]});
        let vector = build_feature_vector(&report, &schema()).unwrap();
        assert_eq!(vector, vec![0.0, 0.0, 0.0, 0.0, 1.0, 1.0]);
    }

    #[test]
    fn test_normalize_token() {
        assert_eq!(normalize_token("Loss of  Appetite!!"), "loss of appetite");
        assert_eq!(normalize_token("  NASAL-discharge\t"), "nasal discharge");
        assert_eq!(normalize_token("***"), "");
        assert_eq!(normalize_token("Température"), "temp rature");
    }

    #[test]
    fn test_multi_word_symptom_uses_separator() {
        let schema = FeatureSchema::new(["loss_of_appetite", "nasal_discharge"]).unwrap();
        let report = json!({"symptoms": ["Loss of appetite", "nasal-discharge"]});
        let vector = build_feature_vector(&report, &schema).unwrap();
        assert_eq!(vector, vec![1.0, 1.0]);
    }

    #[test]
    fn test_unknown_vocabulary_ignored() {
        let report = json!({
            "animal_type": "Llama",
            "symptoms": ["hiccups"],
            "farm_id": "F-77",
        });
        let vector = build_feature_vector(&report, &schema()).unwrap();
        assert_eq!(vector, vec![0.0; 6]);
    }

    #[test]
    fn test_empty_and_null_fields_default_to_zero() {
        let vector = build_feature_vector(&json!({}), &schema()).unwrap();
        assert_eq!(vector, vec![0.0; 6]);

        let report = json!({"age": null, "body_temperature": "", "animal_type": null, "symptoms": null});
        let vector = build_feature_vector(&report, &schema()).unwrap();
        assert_eq!(vector, vec![0.0; 6]);
    }

    #[test]
    fn test_animal_type_is_case_insensitive() {
        let vector = build_feature_vector(&json!({"animal_type": "GOAT"}), &schema()).unwrap();
        assert_eq!(vector[3], 1.0);
    }

    #[test]
    fn test_numeric_strings_are_parsed() {
        let vector = build_feature_vector(&json!({"age": " 4 ", "body_temperature": "39.1"}), &schema())
            .unwrap();
        assert_eq!(&vector[..2], &[4.0, 39.1]);
    }

    #[test]
    fn test_invalid_field_types_rejected() {
        let cases = [
            json!({"age": "old"}),
            json!({"age": [1]}),
            json!({"animal_type": 3}),
            json!({"symptoms": "fever"}),
            json!({"symptoms": ["fever", 1]}),
            json!(["not", "an", "object"]),
        ];
        for report in cases {
            let err = build_feature_vector(&report, &schema()).unwrap_err();
            assert!(matches!(err, VetreeError::InvalidReport(_)), "{report}");
        }
    }

    #[test]
    fn test_non_finite_numeric_strings_rejected() {
        for text in ["nan", "NaN", "inf", "-infinity", " +Inf "] {
            let err = build_feature_vector(&json!({"age": text}), &schema()).unwrap_err();
            assert!(matches!(err, VetreeError::InvalidReport(_)), "{text}");
        }
        let vector = build_feature_vector(&json!({"age": "1e3"}), &schema()).unwrap();
        assert_eq!(vector[0], 1000.0);
    }

    #[test]
    fn test_numeric_field_absent_from_schema_is_skipped() {
        let schema = FeatureSchema::new(["fever"]).unwrap();
        let vector = build_feature_vector(&json!({"age": 9, "symptoms": ["fever"]}), &schema).unwrap();
        assert_eq!(vector, vec![1.0]);
    }

    #[test]
    fn test_custom_encoder_config() {
        let encoder = FeatureEncoder::new(EncoderConfig {
            numeric_fields: vec!["weight".into()],
            categorical_field: "species".into(),
            categorical_prefix: "species=".into(),
            multi_hot_field: "signs".into(),
            token_separator: "-".into(),
        });
        let schema = FeatureSchema::new(["weight", "species=sheep", "foot-rot"]).unwrap();
        let report = json!({"weight": 61.5, "species": "Sheep", "signs": ["Foot rot"]});
        assert_eq!(encoder.build(&report, &schema).unwrap(), vec![61.5, 1.0, 1.0]);
    }
}
