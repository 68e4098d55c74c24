//! Ask the user a question and wait for the answer

use crate::tools::types::required_str;
use crate::tools::{Tool, ToolContext, ToolOutput};
use anyhow::Result;
use async_trait::async_trait;

pub struct QuestionTool;

#[async_trait]
impl Tool for QuestionTool {
    fn name(&self) -> &str {
        "question"
    }

    fn description(&self) -> &str {
        "Ask the user a question when a decision cannot be made alone. \
         Optionally offer a list of choices."
    }

    fn parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "type": "object",
            "properties": {
                "question": {"type": "string", "description": "The question to ask"},
                "options": {"type": "array", "items": {"type": "string"}}
            },
            "required": ["question"]
        })
    }

    async fn execute(&self, args: &serde_json::Value, ctx: &ToolContext) -> Result<ToolOutput> {
        let question = required_str(args, "question")?;
        let options: Vec<String> = args
            .get("options")
            .and_then(|v| v.as_array())
            .map(|a| {
                a.iter()
                    .filter_map(|v| v.as_str().map(str::to_string))
                    .collect()
            })
            .unwrap_or_default();

        let Some(handler) = &ctx.questions else {
            return Ok(ToolOutput::success(
                "No user is available to answer questions. Proceed with your best judgement.",
            ));
        };

        match handler.ask(question, &options).await {
            Some(answer) => Ok(ToolOutput::success(format!("User answered: {}", answer))
                .with_title(question.to_string())),
            None => Ok(ToolOutput::success(
                "The user did not answer. Proceed with your best judgement.",
            )),
        }
    }
}
