//! Function-tool definitions advertised to the reasoning engine.

use serde_json::{Value, json};

fn function(name: &str, description: &str, properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": description,
            "parameters": {
                "type": "object",
                "properties": properties,
                "required": required,
            },
        },
    })
}

fn string_property(description: &str) -> Value {
    json!({ "type": "string", "description": description })
}

fn string_list_property(description: &str) -> Value {
    json!({ "type": "array", "items": { "type": "string" }, "description": description })
}

/// Tool definitions in the OpenAI function-calling shape, one per known tool.
pub fn tool_definitions() -> Vec<Value> {
    vec![
        function(
            "read_file",
            "Read a UTF-8 text file inside the project directory.",
            json!({ "path": string_property("Path relative to the project root.") }),
            &["path"],
        ),
        function(
            "write_file",
            "Create or overwrite a file inside the project directory. Parent directories are created.",
            json!({
                "path": string_property("Path relative to the project root."),
                "content": string_property("Full file contents."),
            }),
            &["path", "content"],
        ),
        function(
            "list_directory",
            "List the entries of a directory inside the project. Directories end with '/'.",
            json!({ "path": string_property("Directory relative to the project root. Defaults to '.'.") }),
            &[],
        ),
        function(
            "batch_read_files",
            "Read several files in one call.",
            json!({ "paths": string_list_property("Paths relative to the project root.") }),
            &["paths"],
        ),
        function(
            "batch_list_directories",
            "List several directories in one call.",
            json!({ "paths": string_list_property("Directories relative to the project root.") }),
            &["paths"],
        ),
        function(
            "run_command",
            "Run an allowlisted shell command from the project root and return its output.",
            json!({
                "command": string_property("Command line, e.g. 'npm install' or 'git status'."),
                "timeout_secs": { "type": "integer", "description": "Optional timeout in seconds." },
            }),
            &["command"],
        ),
        function(
            "manage_server",
            "Start, stop, restart or inspect a long-running dev server. Start is a no-op when the server is already running. Status reports the detected port.",
            json!({
                "action": { "type": "string", "enum": ["start", "stop", "restart", "status"] },
                "command": string_property("Command to launch the server (start/restart), e.g. 'npm run dev'."),
                "port": { "type": "integer", "description": "Port the server listens on, if known." },
                "slot": string_property("Logical server name. Defaults to 'default'."),
            }),
            &["action"],
        ),
        function(
            "browser_navigate",
            "Open a URL in the automation browser, launching it on first use.",
            json!({ "url": string_property("Absolute URL, e.g. http://localhost:5173.") }),
            &["url"],
        ),
        function(
            "browser_screenshot",
            "Capture a PNG screenshot of the current page.",
            json!({ "path": string_property("Optional file name under .autopilot/screenshots/.") }),
            &[],
        ),
        function(
            "browser_click",
            "Click the first element matching a CSS selector.",
            json!({ "selector": string_property("CSS selector.") }),
            &["selector"],
        ),
        function(
            "browser_fill",
            "Clear an input matching a CSS selector and type a value into it.",
            json!({
                "selector": string_property("CSS selector."),
                "value": string_property("Text to type."),
            }),
            &["selector", "value"],
        ),
        function(
            "browser_evaluate",
            "Run JavaScript in the page and return the JSON-encoded result.",
            json!({ "script": string_property("JavaScript expression or function body.") }),
            &["script"],
        ),
        function(
            "browser_close",
            "Close the automation browser.",
            json!({}),
            &[],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::KNOWN_TOOLS;

    /// Verifies the schema advertises every tool once and nothing else.
    #[test]
    fn schema_covers_exactly_the_known_tools() {
        let names: Vec<String> = tool_definitions()
            .iter()
            .map(|tool| tool["function"]["name"].as_str().unwrap_or_default().to_string())
            .collect();
        assert_eq!(names, KNOWN_TOOLS);
    }

    /// Verifies each required parameter is also a declared property.
    #[test]
    fn required_fields_are_declared_properties() {
        for tool in tool_definitions() {
            let parameters = &tool["function"]["parameters"];
            let properties = parameters["properties"].as_object().expect("properties");
            for required in parameters["required"].as_array().expect("required") {
                let key = required.as_str().expect("string");
                assert!(properties.contains_key(key), "{key} missing in {tool}");
            }
        }
    }
}
