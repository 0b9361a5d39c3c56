//! ReAct output parser.

use serde_json::Value;
use thiserror::Error;

use crate::subsystems::tools::ToolInput;

const FINAL_ANSWER: &str = "Final Answer:";
const ACTION: &str = "Action:";
const ACTION_INPUT: &str = "Action Input:";

#[derive(Debug, Clone, PartialEq)]
pub enum AgentStep {
    /// Call `tool` with `input`. `log` is the raw model text.
    Action { tool: String, input: ToolInput, log: String },
    Finish { output: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Could not parse LLM output: {0}")]
pub struct ParseError(pub String);

fn rest_of_line(text: &str) -> &str {
    text.lines().next().unwrap_or_default().trim()
}

/// Parse one model reply.
///
/// `Final Answer:` wins over everything else, taking the text after its last
/// occurrence. Otherwise both `Action:` and `Action Input:` must be present.
/// An input that starts with `{` is read as one JSON object, which may span
/// several lines; anything else is the rest of its line.
pub fn parse(text: &str) -> Result<AgentStep, ParseError> {
    let text = text.trim();
    if let Some(idx) = text.rfind(FINAL_ANSWER) {
        return Ok(AgentStep::Finish { output: text[idx + FINAL_ANSWER.len()..].trim().to_string() });
    }

    let tool = text
        .find(ACTION)
        .map(|idx| rest_of_line(&text[idx + ACTION.len()..]))
        .filter(|name| !name.is_empty());
    let raw_input = text.find(ACTION_INPUT).map(|idx| text[idx + ACTION_INPUT.len()..].trim_start());
    let (Some(tool), Some(raw_input)) = (tool, raw_input) else {
        return Err(ParseError(text.to_string()));
    };

    let input = if raw_input.starts_with('{') {
        match serde_json::Deserializer::from_str(raw_input).into_iter::<Value>().next() {
            Some(Ok(Value::Object(map))) => ToolInput::Json(map),
            _ => ToolInput::Text(rest_of_line(raw_input).to_string()),
        }
    } else {
        ToolInput::Text(rest_of_line(raw_input).to_string())
    };

    Ok(AgentStep::Action { tool: tool.to_string(), input, log: text.to_string() })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn final_answer_uses_last_occurrence() {
        let step = parse("Thought: done\nFinal Answer: first\nFinal Answer:  BTC is $64k  ").unwrap();
        assert_eq!(step, AgentStep::Finish { output: "BTC is $64k".into() });
    }

    #[test]
    fn final_answer_beats_actions() {
        let step = parse("Action: TokenTool\nAction Input: BTC\nFinal Answer: nope").unwrap();
        assert!(matches!(step, AgentStep::Finish { .. }));
    }

    #[test]
    fn action_with_json_input() {
        let step = parse("Action: TokenTool\nAction Input: {\"command\": \"price\", \"symbol\": \"BTC\"}").unwrap();
        let AgentStep::Action { tool, input, .. } = step else { panic!("expected action") };
        assert_eq!(tool, "TokenTool");
        assert_eq!(input, ToolInput::from_value(json!({ "command": "price", "symbol": "BTC" })));
    }

    #[test]
    fn multi_line_json_input() {
        let text = "Action: WalletTool\nAction Input: {\n  \"address\": \"0xabc\",\n  \"limit\": 5\n}\nObservation:";
        let AgentStep::Action { input, .. } = parse(text).unwrap() else { panic!("expected action") };
        assert_eq!(input, ToolInput::from_value(json!({ "address": "0xabc", "limit": 5 })));
    }

    #[test]
    fn plain_and_broken_inputs_stay_text() {
        let AgentStep::Action { input, .. } = parse("Action: KnowledgeTool\nAction Input: what is gas?\nmore").unwrap() else {
            panic!("expected action")
        };
        assert_eq!(input, ToolInput::Text("what is gas?".into()));

        let AgentStep::Action { input, .. } = parse("Action: TokenTool\nAction Input: {broken").unwrap() else {
            panic!("expected action")
        };
        assert_eq!(input, ToolInput::Text("{broken".into()));
    }

    #[test]
    fn missing_parts_are_errors() {
        assert!(parse("I think the price is high").is_err());
        assert!(parse("Action: TokenTool").is_err());
        assert!(parse("Action Input: BTC").is_err());
        let err = parse("hello").unwrap_err();
        assert_eq!(err.to_string(), "Could not parse LLM output: hello");
    }
}
