//! Example module manager
//!
//! Serves two small tools and one prompt, and shows how module parameters flow
//! from configuration into a manager:
//!
//! - `echo` returns its `message` argument, with the `prefix` parameter
//!   prepended when one is configured.
//! - `hello` greets `name` (default "World") using the `greeting` parameter.
//! - `hello_prompt` is a prompt template asking the assistant to greet someone.

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde_json::{Map, Value, json};

use crate::core::config::{ModuleParameter, ModuleParams, ParamType};
use crate::core::error::{BoxError, ToolError};
use crate::core::module::{ModuleManager, ToolContext};
use crate::core::protocol::{
    Content, GetPromptResult, Prompt, PromptArgument, PromptMessage, Role, Tool,
};

const DEFAULT_GREETING: &str = "Hello";
const DEFAULT_NAME: &str = "World";

#[derive(Debug, Default)]
pub struct ExampleModule {
    prefix: String,
    greeting: String,
}

impl ExampleModule {
    pub fn new() -> Self {
        Self::default()
    }

    /// Module parameters this manager understands, for `ServerConfigBuilder`.
    pub fn parameters() -> Vec<(&'static str, ModuleParameter)> {
        vec![
            (
                "prefix",
                ModuleParameter::new(ParamType::Str, "Text prepended to echoed messages")
                    .with_default(""),
            ),
            (
                "greeting",
                ModuleParameter::new(ParamType::Str, "Greeting used by the hello tool")
                    .with_default(DEFAULT_GREETING),
            ),
        ]
    }

    fn echo(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let message = arguments
            .get("message")
            .and_then(Value::as_str)
            .ok_or_else(|| ToolError::invalid_arguments("Missing required parameter: message"))?;

        let result = if self.prefix.is_empty() {
            message.to_string()
        } else {
            format!("{}{message}", self.prefix)
        };
        Ok(json!({ "result": result }))
    }

    fn hello(&self, arguments: &Map<String, Value>) -> Result<Value, ToolError> {
        let name = match arguments.get("name") {
            None | Some(Value::Null) => DEFAULT_NAME,
            Some(Value::String(name)) => name.as_str(),
            Some(_) => return Err(ToolError::invalid_arguments("name must be a string")),
        };
        Ok(json!({ "message": format!("{}, {name}!", self.greeting) }))
    }
}

#[async_trait]
impl ModuleManager for ExampleModule {
    async fn initialize(&mut self, params: &ModuleParams) -> Result<(), BoxError> {
        self.prefix = params.get_str("prefix").unwrap_or_default().to_string();
        self.greeting = params
            .get_str("greeting")
            .filter(|g| !g.is_empty())
            .unwrap_or(DEFAULT_GREETING)
            .to_string();
        Ok(())
    }

    fn get_tools(&self) -> Vec<Tool> {
        vec![
            Tool::new(
                "echo",
                "Echo a message back to the client.",
                json!({
                    "type": "object",
                    "properties": {
                        "message": {
                            "type": "string",
                            "description": "The message to echo"
                        }
                    },
                    "required": ["message"]
                }),
            ),
            Tool::new(
                "hello",
                "Greet someone by name.",
                json!({
                    "type": "object",
                    "properties": {
                        "name": {
                            "type": "string",
                            "description": "Who to greet (default: World)"
                        }
                    }
                }),
            ),
        ]
    }

    async fn call_tool(
        &self,
        name: &str,
        arguments: Map<String, Value>,
        ctx: Option<&ToolContext>,
    ) -> Result<Value, ToolError> {
        if let Some(ctx) = ctx {
            ctx.debug(format!("calling {name}"));
        }
        match name {
            "echo" => self.echo(&arguments),
            "hello" => self.hello(&arguments),
            other => Err(ToolError::UnknownTool(other.to_string())),
        }
    }

    fn get_prompt_templates(&self) -> Vec<Prompt> {
        vec![Prompt {
            name: "hello_prompt".to_string(),
            description: Some("Ask the assistant to greet someone".to_string()),
            arguments: vec![PromptArgument {
                name: "name".to_string(),
                description: Some("Who to greet".to_string()),
                required: false,
            }],
        }]
    }

    fn get_prompt_content(
        &self,
        name: &str,
        arguments: &BTreeMap<String, String>,
    ) -> Result<GetPromptResult, ToolError> {
        if name != "hello_prompt" {
            return Err(ToolError::UnknownPrompt(name.to_string()));
        }
        let who = arguments
            .get("name")
            .map(String::as_str)
            .unwrap_or(DEFAULT_NAME);
        Ok(GetPromptResult {
            description: Some("Greeting prompt".to_string()),
            messages: vec![PromptMessage {
                role: Role::User,
                content: Content::text(format!(
                    "Please say \"{}\" to {who} in a friendly way.",
                    self.greeting
                )),
            }],
        })
    }
}
