//! Prompt construction for extraction and schema detection.

use crate::models::Schema;

/// Build the extraction prompt for one schema.
///
/// The model is asked for a single JSON object with `fields` and
/// `confidence` keys so the response parses without postprocessing
/// beyond code-fence stripping.
pub fn extraction_prompt(schema: &Schema) -> String {
    let mut field_lines = String::new();
    for (name, spec) in &schema.fields {
        let required = if schema.required_fields.contains(name) {
            " (required)"
        } else {
            ""
        };
        field_lines.push_str(&format!(
            "- {name} ({}){required}: {}\n",
            spec.field_type.as_str(),
            spec.description
        ));
    }

    format!(
        r#"You are a document data extractor. Extract the following fields from this page of a "{}" document:

{field_lines}
Respond with a single JSON object of the form:
{{"fields": {{"<field>": <value>, ...}}, "confidence": {{"<field>": <0.0-1.0>, ...}}}}

Rules:
- Include only fields visible on this page; omit fields you cannot find.
- Dates must be ISO-8601 (YYYY-MM-DD).
- Numbers must be bare numbers without currency symbols or separators.
- Respond with JSON only, no commentary."#,
        schema.name
    )
}

/// Build the schema-detection prompt.
pub fn detection_prompt(known_schemas: &[String], hint: Option<&str>) -> String {
    let names = known_schemas.join(", ");
    let hint_line = hint
        .map(|h| format!("\nCaller hint: {h}\n"))
        .unwrap_or_default();

    format!(
        r#"You are a document classifier. Identify which schema best describes this page.

Known schemas: {names}
{hint_line}
Respond with a single JSON object of the form:
{{"schema_name": "<one of the known schemas>", "confidence": <0.0-1.0>, "suggested_fields": ["<field>", ...]}}

Respond with JSON only, no commentary."#
    )
}
