//! Prompt enrichment: turns a tool-bearing request into a plain chat
//! request whose system prompt teaches the upstream to emit tool calls as
//! XML after a per-request trigger signal.

use serde_json::Value;

use crate::trigger::TriggerDelimiter;
use crate::types::{MessagesRequest, ToolDef};

/// Instruction template prepended to the system prompt. `{tools_list}` and
/// `{trigger_signal}` are substituted per request.
const TOOL_INSTRUCTIONS: &str = r#"In this environment you have access to a set of tools you can use to answer the user's question.

{tools_list}

When you decide to call a tool, follow these rules exactly:
1. Choose the tool silently. Do not announce, describe, or explain which tool you are about to use.
2. Print {trigger_signal} on its own line, immediately followed by the invocation block:

{trigger_signal}
<invoke name="$TOOL_NAME">
<parameter name="$PARAM_NAME">$PARAM_VALUE</parameter>
</invoke>

3. Provide one <parameter> element per argument. Encode objects, arrays, numbers, and booleans as JSON strings.
4. Stop immediately after </invoke>. Do not write anything after it; the result will be returned to you in the next turn."#;

/// Enrich a request: returns the rewritten request plus the delimiter the
/// parser must watch for. Requests without tools pass through untouched.
pub fn enrich(request: &MessagesRequest) -> (MessagesRequest, Option<TriggerDelimiter>) {
    let tools = match request.tools.as_deref() {
        Some(tools) if !tools.is_empty() => tools,
        _ => return (request.clone(), None),
    };

    let delimiter = TriggerDelimiter::generate();
    let instructions = TOOL_INSTRUCTIONS
        .replace("{tools_list}", &render_tool_catalog(tools))
        .replace("{trigger_signal}", delimiter.tc_start());

    let system = match request.system_text() {
        Some(original) => format!("{instructions}\n\n{original}"),
        None => instructions,
    };

    let mut enriched = request.clone();
    enriched.system = Some(Value::String(system));
    // Upstream receives a plain chat request; the schemas live in the
    // system prompt now.
    enriched.tools = None;

    (enriched, Some(delimiter))
}

/// Render the XML tool catalog embedded in the instruction template.
pub fn render_tool_catalog(tools: &[ToolDef]) -> String {
    if tools.is_empty() {
        return "<function_list>None</function_list>".to_string();
    }

    let mut out = String::from("<function_list>\n");
    for (index, tool) in tools.iter().enumerate() {
        out.push_str(&format!("<tool id=\"{index}\">\n"));
        out.push_str(&format!("<name>{}</name>\n", tool.name));
        if let Some(description) = &tool.description {
            out.push_str(&format!(
                "<description>{}</description>\n",
                escape_xml(description)
            ));
        }

        let required = required_params(tool);
        out.push_str("<required>");
        for name in &required {
            out.push_str(&format!("<param>{name}</param>"));
        }
        out.push_str("</required>\n");

        out.push_str("<parameters>\n");
        if let Some(properties) = tool
            .input_schema
            .as_ref()
            .and_then(|s| s.get("properties"))
            .and_then(|p| p.as_object())
        {
            for (name, schema) in properties {
                render_parameter(&mut out, name, schema, required.contains(name));
            }
        }
        out.push_str("</parameters>\n");
        out.push_str("</tool>\n");
    }
    out.push_str("</function_list>");
    out
}

fn render_parameter(out: &mut String, name: &str, schema: &Value, required: bool) {
    out.push_str("<parameter>\n");
    out.push_str(&format!("<name>{name}</name>\n"));
    let param_type = schema
        .get("type")
        .and_then(|t| t.as_str())
        .unwrap_or("any");
    out.push_str(&format!("<type>{param_type}</type>\n"));
    out.push_str(&format!("<required>{required}</required>\n"));
    if let Some(description) = schema.get("description").and_then(|d| d.as_str()) {
        out.push_str(&format!(
            "<description>{}</description>\n",
            escape_xml(description)
        ));
    }
    if let Some(allowed) = schema.get("enum") {
        out.push_str(&format!("<enum>{allowed}</enum>\n"));
    }
    out.push_str("</parameter>\n");
}

fn required_params(tool: &ToolDef) -> Vec<String> {
    tool.input_schema
        .as_ref()
        .and_then(|s| s.get("required"))
        .and_then(|r| r.as_array())
        .map(|names| {
            names
                .iter()
                .filter_map(|n| n.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

fn escape_xml(text: &str) -> String {
    text.replace('<', "&lt;").replace('>', "&gt;")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn weather_tool() -> ToolDef {
        serde_json::from_value(json!({
            "name": "get_weather",
            "description": "Look up <current> weather",
            "input_schema": {
                "type": "object",
                "properties": {
                    "city": {"type": "string", "description": "City name"},
                    "unit": {"type": "string", "enum": ["c", "f"]}
                },
                "required": ["city"]
            }
        }))
        .unwrap()
    }

    fn request_with_tools(tools: Vec<ToolDef>) -> MessagesRequest {
        serde_json::from_value::<MessagesRequest>(json!({
            "model": "openai+gpt-4o",
            "system": "Be terse.",
            "messages": [{"role": "user", "content": "weather in SF?"}]
        }))
        .map(|mut r| {
            r.tools = Some(tools);
            r
        })
        .unwrap()
    }

    #[test]
    fn test_catalog_renders_tool() {
        let catalog = render_tool_catalog(&[weather_tool()]);
        assert!(catalog.starts_with("<function_list>"));
        assert!(catalog.contains("<tool id=\"0\">"));
        assert!(catalog.contains("<name>get_weather</name>"));
        assert!(catalog.contains("<required><param>city</param></required>"));
        assert!(catalog.contains("<type>string</type>"));
        assert!(catalog.contains("<enum>[\"c\",\"f\"]</enum>"));
    }

    #[test]
    fn test_catalog_escapes_description() {
        let catalog = render_tool_catalog(&[weather_tool()]);
        assert!(catalog.contains("Look up &lt;current&gt; weather"));
        assert!(!catalog.contains("Look up <current>"));
    }

    #[test]
    fn test_catalog_empty() {
        assert_eq!(render_tool_catalog(&[]), "<function_list>None</function_list>");
    }

    #[test]
    fn test_enrich_without_tools_is_passthrough() {
        let request = request_with_tools(Vec::new());
        let (enriched, delimiter) = enrich(&request);
        assert!(delimiter.is_none());
        assert_eq!(enriched.system_text(), request.system_text());
    }

    #[test]
    fn test_enrich_injects_trigger_and_keeps_system() {
        let request = request_with_tools(vec![weather_tool()]);
        let (enriched, delimiter) = enrich(&request);

        let delimiter = delimiter.unwrap();
        let system = enriched.system_text().unwrap();
        assert!(system.contains(delimiter.tc_start()));
        assert!(system.contains("<function_list>"));
        assert!(system.ends_with("Be terse."));
        assert!(enriched.tools.is_none());
        // No leftover placeholders.
        assert!(!system.contains("{trigger_signal}"));
        assert!(!system.contains("{tools_list}"));
    }
}
