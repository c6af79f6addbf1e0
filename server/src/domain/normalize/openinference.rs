//! OpenInference message and tool conversion
//!
//! Aggregated `llm.input_messages` / `llm.output_messages` lists are rewritten
//! into the canonical model message shape. Tool schemas from `llm.tools` and
//! `gen_ai.request.functions` become `{type: "function", function: {...}}`.

use serde_json::{Map, Value as JsonValue, json};

/// `{messages: [...]}` from an aggregated input message list
pub fn convert_input(list: JsonValue) -> JsonValue {
    json!({ "messages": convert_messages(list) })
}

/// `{choices: [{message: ...}, ...]}` from an aggregated output message list
pub fn convert_output(list: JsonValue) -> JsonValue {
    let choices: Vec<JsonValue> = convert_messages(list)
        .into_iter()
        .map(|message| json!({ "message": message }))
        .collect();
    json!({ "choices": choices })
}

fn convert_messages(list: JsonValue) -> Vec<JsonValue> {
    let JsonValue::Array(items) = list else {
        return Vec::new();
    };
    items.iter().map(convert_message).collect()
}

fn convert_message(item: &JsonValue) -> JsonValue {
    let message = item.get("message").unwrap_or(item);
    let mut out = Map::new();

    if let Some(role) = message.get("role").and_then(JsonValue::as_str) {
        out.insert("role".to_string(), JsonValue::String(role.to_string()));
    }
    if let Some(content) = message.get("content").and_then(JsonValue::as_str) {
        out.insert("content".to_string(), JsonValue::String(content.to_string()));
    }
    if let Some(JsonValue::Array(contents)) = message.get("contents") {
        let parts: Vec<JsonValue> = contents.iter().filter_map(convert_part).collect();
        if !parts.is_empty() {
            out.insert("parts".to_string(), JsonValue::Array(parts));
        }
    }
    if let Some(JsonValue::Array(calls)) = message.get("tool_calls") {
        let calls: Vec<JsonValue> = calls.iter().filter_map(convert_tool_call).collect();
        if !calls.is_empty() {
            out.insert("tool_calls".to_string(), JsonValue::Array(calls));
        }
    }
    JsonValue::Object(out)
}

fn convert_part(part: &JsonValue) -> Option<JsonValue> {
    let content = part.get("message_content").unwrap_or(part);
    match content.get("type").and_then(JsonValue::as_str)? {
        "text" => {
            let text = content.get("text").and_then(JsonValue::as_str).unwrap_or_default();
            Some(json!({ "type": "text", "text": text }))
        }
        "image" => {
            let url = content
                .pointer("/image/image/url")
                .or_else(|| content.pointer("/image/url"))
                .and_then(JsonValue::as_str)
                .unwrap_or_default();
            Some(json!({ "type": "image_url", "image_url": { "url": url } }))
        }
        other => {
            tracing::debug!(part_type = other, "Skipping unknown OpenInference content part");
            None
        }
    }
}

fn convert_tool_call(call: &JsonValue) -> Option<JsonValue> {
    let call = call.get("tool_call").unwrap_or(call);
    let function = call.get("function")?;
    let name = function.get("name").and_then(JsonValue::as_str).unwrap_or_default();
    let arguments = match function.get("arguments") {
        Some(JsonValue::String(s)) => s.clone(),
        Some(other) => other.to_string(),
        None => String::new(),
    };
    let mut out = json!({
        "type": "function",
        "function": { "name": name, "arguments": arguments },
    });
    if let (Some(id), JsonValue::Object(map)) =
        (call.get("id").and_then(JsonValue::as_str), &mut out)
    {
        map.insert("id".to_string(), JsonValue::String(id.to_string()));
    }
    Some(out)
}

/// Tools from aggregated `llm.tools`: each entry carries a `tool.json_schema` string
pub fn convert_openinference_tools(list: JsonValue) -> Vec<JsonValue> {
    let JsonValue::Array(items) = list else {
        return Vec::new();
    };
    items
        .iter()
        .filter_map(|item| {
            let schema = item
                .pointer("/tool/json_schema")
                .or_else(|| item.get("json_schema"))?;
            let parsed = match schema {
                JsonValue::String(s) => match serde_json::from_str::<JsonValue>(s) {
                    Ok(v) => v,
                    Err(e) => {
                        tracing::warn!(error = %e, "Skipping tool with unparseable json_schema");
                        return None;
                    }
                },
                other => other.clone(),
            };
            function_tool(parsed.get("function").unwrap_or(&parsed))
        })
        .collect()
}

/// Tools from aggregated `gen_ai.request.functions`
pub fn convert_gen_ai_functions(list: JsonValue) -> Vec<JsonValue> {
    let JsonValue::Array(items) = list else {
        return Vec::new();
    };
    items.iter().filter_map(function_tool).collect()
}

fn function_tool(def: &JsonValue) -> Option<JsonValue> {
    let name = def.get("name").and_then(JsonValue::as_str)?;
    let description = def
        .get("description")
        .and_then(JsonValue::as_str)
        .unwrap_or_default();
    let parameters = match def.get("parameters") {
        Some(JsonValue::String(s)) => {
            serde_json::from_str(s).unwrap_or_else(|_| JsonValue::String(s.clone()))
        }
        Some(other) => other.clone(),
        None => JsonValue::Null,
    };
    Some(json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": parameters,
        },
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_convert_input_parts_and_tool_calls() {
        let list = json!([
            {"message": {"role": "system", "content": "be nice"}},
            {"message": {"role": "user", "contents": [
                {"message_content": {"type": "text", "text": "what is this"}},
                {"message_content": {"type": "image", "image": {"image": {"url": "https://x/y.png"}}}},
                {"message_content": {"type": "audio"}}
            ]}},
            {"message": {"role": "assistant", "tool_calls": [
                {"tool_call": {"id": "c1", "function": {"name": "lookup", "arguments": "{\"q\":1}"}}}
            ]}}
        ]);
        let input = convert_input(list);
        assert_eq!(
            input,
            json!({"messages": [
                {"role": "system", "content": "be nice"},
                {"role": "user", "parts": [
                    {"type": "text", "text": "what is this"},
                    {"type": "image_url", "image_url": {"url": "https://x/y.png"}}
                ]},
                {"role": "assistant", "tool_calls": [
                    {"id": "c1", "type": "function", "function": {"name": "lookup", "arguments": "{\"q\":1}"}}
                ]}
            ]})
        );
    }

    #[test]
    fn test_convert_output_wraps_choices() {
        let output = convert_output(json!([{"message": {"role": "assistant", "content": "ok"}}]));
        assert_eq!(
            output,
            json!({"choices": [{"message": {"role": "assistant", "content": "ok"}}]})
        );
    }

    #[test]
    fn test_tools_skip_bad_schema() {
        let tools = convert_openinference_tools(json!([
            {"tool": {"json_schema": "{\"type\":\"function\",\"function\":{\"name\":\"a\",\"description\":\"d\",\"parameters\":{}}}"}},
            {"tool": {"json_schema": "{not json"}},
            {"tool": {"json_schema": "{\"name\":\"b\"}"}}
        ]));
        assert_eq!(tools.len(), 2);
        assert_eq!(tools[0]["function"]["name"], "a");
        assert_eq!(tools[0]["function"]["description"], "d");
        assert_eq!(tools[1]["function"]["name"], "b");
        assert_eq!(tools[1]["type"], "function");
    }

    #[test]
    fn test_gen_ai_functions_parse_parameters() {
        let tools = convert_gen_ai_functions(json!([
            {"name": "get_weather", "description": "w", "parameters": "{\"type\":\"object\"}"}
        ]));
        assert_eq!(
            tools,
            vec![json!({"type": "function", "function": {
                "name": "get_weather", "description": "w", "parameters": {"type": "object"}
            }})]
        );
    }
}
