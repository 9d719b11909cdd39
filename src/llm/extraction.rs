//! Structured extraction of materials data from document text.
//!
//! The extraction stage calls a [`DocumentExtractor`]; the production
//! implementation prompts a chat model for a JSON object and parses it into
//! a [`RawExtraction`]. Field names stay exactly as the model produced them:
//! mapping them onto the canonical schema is the standardizer's job.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;

use crate::error::ExtractionError;
use crate::workflow::context::{Document, ExtractedValue};

use super::{GenerationRequest, LanguageModel, Message};

/// Maximum document characters sent to the model in one call.
const MAX_DOCUMENT_CHARS: usize = 24_000;

/// Raw extraction output for one document, before standardization.
#[derive(Debug, Clone, Default)]
pub struct RawExtraction {
    /// Paper DOI, when the model found one.
    pub doi: String,
    /// Material composition (e.g. "Li6PS5Cl").
    pub material_id: String,
    /// Extracted field name -> numeric value with unit.
    pub fields: BTreeMap<String, ExtractedValue>,
    /// Non-numeric experimental conditions.
    pub conditions: BTreeMap<String, String>,
    /// Model confidence in [0, 1].
    pub confidence: f64,
}

/// Extracts structured data from one document.
#[async_trait]
pub trait DocumentExtractor: Send + Sync {
    /// Extracts materials data from the document.
    ///
    /// `schema_hint` lists the canonical columns the pipeline maps onto; it
    /// is advisory only and implementations are free to produce other field
    /// names.
    async fn extract(
        &self,
        document: &Document,
        schema_hint: &[String],
    ) -> Result<RawExtraction, ExtractionError>;
}

const EXTRACTION_SYSTEM_PROMPT: &str = r#"You are an expert in analyzing solid electrolyte ionic conductivity research papers.

Extract the following information from the given paper text:
1. DOI (if available)
2. Material composition (chemical formula like Li6PS5Cl)
3. Ionic conductivity value and unit
4. Activation energy (eV)
5. Sintering temperature
6. Ball milling speed (rpm)
7. Any other relevant numeric parameters under additional_features
8. Experimental conditions (measurement temperature, atmosphere, ...) under conditions
9. Your confidence in the extraction, from 0.0 to 1.0

Respond ONLY with a valid JSON object of this shape:
{
    "doi": "10.xxxx/...",
    "material_id": "Li6PS5Cl",
    "ionic_conductivity": 3.6e-3,
    "ionic_conductivity_unit": "S/cm",
    "activation_energy": 0.30,
    "sintering_temp": 550,
    "sintering_temp_unit": "C",
    "ball_milling_rpm": 500,
    "additional_features": {"grain_size": 10, "relative_density": 95},
    "conditions": {"measurement_temp": "room temperature"},
    "confidence": 0.9
}

If a value is not found, use null."#;

/// JSON contract the model is prompted to produce.
#[derive(Debug, Deserialize)]
struct ExtractionPayload {
    #[serde(default)]
    doi: String,
    #[serde(default)]
    material_id: String,
    ionic_conductivity: Option<f64>,
    #[serde(default = "default_conductivity_unit")]
    ionic_conductivity_unit: String,
    activation_energy: Option<f64>,
    sintering_temp: Option<f64>,
    #[serde(default = "default_temperature_unit")]
    sintering_temp_unit: String,
    ball_milling_rpm: Option<f64>,
    #[serde(default)]
    additional_features: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    conditions: BTreeMap<String, String>,
    confidence: Option<f64>,
}

fn default_conductivity_unit() -> String {
    "S/cm".to_string()
}

fn default_temperature_unit() -> String {
    "C".to_string()
}

/// LLM-backed document extractor.
pub struct LlmExtractor {
    model: Arc<dyn LanguageModel>,
    model_name: String,
}

impl LlmExtractor {
    /// Creates an extractor calling `model_name` through `model`.
    pub fn new(model: Arc<dyn LanguageModel>, model_name: impl Into<String>) -> Self {
        Self {
            model,
            model_name: model_name.into(),
        }
    }

    fn user_prompt(document: &Document, schema_hint: &[String]) -> String {
        let mut text = document.text.as_str();
        if text.len() > MAX_DOCUMENT_CHARS {
            let mut cut = MAX_DOCUMENT_CHARS;
            while !text.is_char_boundary(cut) {
                cut -= 1;
            }
            text = &text[..cut];
        }

        format!(
            "Known database columns (for naming guidance): {}\n\nPaper text:\n{}\n\nExtract all solid electrolyte ionic conductivity data from the above paper.",
            schema_hint.join(", "),
            text
        )
    }
}

#[async_trait]
impl DocumentExtractor for LlmExtractor {
    async fn extract(
        &self,
        document: &Document,
        schema_hint: &[String],
    ) -> Result<RawExtraction, ExtractionError> {
        if document.text.trim().is_empty() {
            return Err(ExtractionError::EmptyDocument(document.id.clone()));
        }

        let request = GenerationRequest::new(
            self.model_name.clone(),
            vec![
                Message::system(EXTRACTION_SYSTEM_PROMPT),
                Message::user(Self::user_prompt(document, schema_hint)),
            ],
        )
        .with_temperature(0.1);

        let response = self.model.generate(request).await?;
        let content = response
            .first_content()
            .ok_or(ExtractionError::MissingJson)?;

        let mut extraction = parse_extraction(content)?;
        if extraction.doi.is_empty() {
            extraction.doi = document.id.clone();
        }
        Ok(extraction)
    }
}

/// Parses a model completion into a [`RawExtraction`].
///
/// Accepts either a bare JSON object or one wrapped in a fenced code block;
/// anything around the object is ignored.
pub fn parse_extraction(content: &str) -> Result<RawExtraction, ExtractionError> {
    let json = extract_json_object(content).ok_or(ExtractionError::MissingJson)?;
    let payload: ExtractionPayload =
        serde_json::from_str(json).map_err(|e| ExtractionError::Parse(e.to_string()))?;

    let mut fields = BTreeMap::new();
    if let Some(value) = payload.ionic_conductivity {
        fields.insert(
            "ionic_cond".to_string(),
            ExtractedValue::new(value, payload.ionic_conductivity_unit.clone()),
        );
    }
    if let Some(value) = payload.activation_energy {
        fields.insert("act_energy".to_string(), ExtractedValue::new(value, "eV"));
    }
    if let Some(value) = payload.sintering_temp {
        fields.insert(
            "sintering_temp".to_string(),
            ExtractedValue::new(value, payload.sintering_temp_unit.clone()),
        );
    }
    if let Some(value) = payload.ball_milling_rpm {
        fields.insert("milling_rpm".to_string(), ExtractedValue::new(value, "rpm"));
    }

    let mut conditions = payload.conditions;
    for (key, value) in payload.additional_features {
        match value {
            serde_json::Value::Number(n) => {
                if let Some(v) = n.as_f64() {
                    fields.insert(key, ExtractedValue::new(v, ""));
                }
            }
            serde_json::Value::String(s) => {
                conditions.insert(key, s);
            }
            serde_json::Value::Null => {}
            other => {
                conditions.insert(key, other.to_string());
            }
        }
    }

    Ok(RawExtraction {
        doi: payload.doi,
        material_id: payload.material_id,
        fields,
        conditions,
        confidence: payload.confidence.unwrap_or(1.0).clamp(0.0, 1.0),
    })
}

/// Locates the JSON object inside a completion, fenced or bare.
fn extract_json_object(content: &str) -> Option<&str> {
    // Fenced block first; models regularly wrap JSON in ```json ... ```.
    let fence = Regex::new(r"(?s)```(?:json)?\s*(\{.*\})\s*```").ok()?;
    if let Some(captures) = fence.captures(content) {
        return captures.get(1).map(|m| m.as_str());
    }

    let start = content.find('{')?;
    let end = content.rfind('}')?;
    if end > start {
        Some(&content[start..=end])
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_bare_json() {
        let content = r#"{"doi": "10.1/abc", "material_id": "Li6PS5Cl", "ionic_conductivity": 3.6e-3, "ionic_conductivity_unit": "S/cm", "activation_energy": 0.3, "confidence": 0.8}"#;
        let extraction = parse_extraction(content).unwrap();

        assert_eq!(extraction.doi, "10.1/abc");
        assert_eq!(extraction.material_id, "Li6PS5Cl");
        assert_eq!(extraction.fields.len(), 2);
        let cond = &extraction.fields["ionic_cond"];
        assert!((cond.value - 3.6e-3).abs() < 1e-12);
        assert_eq!(cond.unit, "S/cm");
        assert!((extraction.confidence - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_parse_fenced_json_with_prose() {
        let content = "Here is the extraction:\n```json\n{\"material_id\": \"LLZO\", \"sintering_temp\": 1100, \"sintering_temp_unit\": \"C\"}\n```\nLet me know if you need more.";
        let extraction = parse_extraction(content).unwrap();
        assert_eq!(extraction.material_id, "LLZO");
        assert!((extraction.fields["sintering_temp"].value - 1100.0).abs() < 1e-9);
    }

    #[test]
    fn test_parse_additional_features_split_by_type() {
        let content = r#"{"material_id": "LGPS", "additional_features": {"grain_size": 10.5, "atmosphere": "argon"}}"#;
        let extraction = parse_extraction(content).unwrap();
        assert!((extraction.fields["grain_size"].value - 10.5).abs() < 1e-9);
        assert_eq!(extraction.conditions["atmosphere"], "argon");
    }

    #[test]
    fn test_parse_null_values_are_omitted() {
        let content = r#"{"material_id": "LGPS", "ionic_conductivity": null, "activation_energy": 0.25}"#;
        let extraction = parse_extraction(content).unwrap();
        assert!(!extraction.fields.contains_key("ionic_cond"));
        assert!(extraction.fields.contains_key("act_energy"));
    }

    #[test]
    fn test_parse_rejects_non_json() {
        assert!(matches!(
            parse_extraction("no structured data here"),
            Err(ExtractionError::MissingJson)
        ));
    }

    #[test]
    fn test_parse_rejects_malformed_json() {
        assert!(matches!(
            parse_extraction(r#"{"material_id": }"#),
            Err(ExtractionError::Parse(_))
        ));
    }

    #[test]
    fn test_confidence_defaults_and_clamps() {
        let extraction = parse_extraction(r#"{"material_id": "X"}"#).unwrap();
        assert!((extraction.confidence - 1.0).abs() < 1e-12);

        let extraction = parse_extraction(r#"{"material_id": "X", "confidence": 7.0}"#).unwrap();
        assert!((extraction.confidence - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_user_prompt_truncates_long_documents() {
        let document = Document::new("long", "x".repeat(MAX_DOCUMENT_CHARS * 2));
        let prompt = LlmExtractor::user_prompt(&document, &[]);
        assert!(prompt.len() < MAX_DOCUMENT_CHARS + 256);
    }
}
