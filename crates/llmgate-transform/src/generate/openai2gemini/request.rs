use llmgate_protocol::gemini::generate::{
    Content, GenerateContentRequest, GenerationConfig, InlineData, Part,
};
use llmgate_protocol::openai::chat_completions::request::{
    ChatCompletionRequest, StopConfiguration,
};
use llmgate_protocol::openai::chat_completions::types::{
    ChatMessage, UserContent, UserPart,
};

/// Convert a chat-completions request into a Gemini generateContent request.
///
/// System and developer messages collapse into `systemInstruction`; tool
/// turns are flattened into user text since the driver does not forward
/// function declarations.
pub fn transform_request(request: &ChatCompletionRequest) -> GenerateContentRequest {
    let body = &request.body;
    let mut system_texts = Vec::new();
    let mut contents = Vec::new();

    for message in &body.messages {
        match message {
            ChatMessage::System(system) | ChatMessage::Developer(system) => {
                let text = system.content.flatten();
                if !text.is_empty() {
                    system_texts.push(text);
                }
            }
            ChatMessage::User(user) => {
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: map_user_parts(&user.content),
                });
            }
            ChatMessage::Assistant(assistant) => {
                let text = assistant
                    .content
                    .as_ref()
                    .map(|content| content.flatten())
                    .unwrap_or_default();
                contents.push(Content {
                    role: Some("model".to_string()),
                    parts: vec![Part {
                        text: Some(text),
                        inline_data: None,
                    }],
                });
            }
            ChatMessage::Tool(tool) => {
                contents.push(Content {
                    role: Some("user".to_string()),
                    parts: vec![Part {
                        text: Some(format!(
                            "[tool_result:{}] {}",
                            tool.tool_call_id,
                            tool.content.flatten()
                        )),
                        inline_data: None,
                    }],
                });
            }
        }
    }

    let system_instruction = if system_texts.is_empty() {
        None
    } else {
        Some(Content {
            role: None,
            parts: vec![Part {
                text: Some(system_texts.join("\n")),
                inline_data: None,
            }],
        })
    };

    let stop_sequences = body.stop.as_ref().map(|stop| match stop {
        StopConfiguration::Single(value) => vec![value.clone()],
        StopConfiguration::Many(values) => values.clone(),
    });

    let generation_config = GenerationConfig {
        temperature: body.temperature,
        top_p: body.top_p,
        max_output_tokens: body.max_completion_tokens.or(body.max_tokens),
        stop_sequences,
    };

    GenerateContentRequest {
        contents,
        system_instruction,
        generation_config: Some(generation_config),
    }
}

fn map_user_parts(content: &UserContent) -> Vec<Part> {
    match content {
        UserContent::Text(text) => vec![Part {
            text: Some(text.clone()),
            inline_data: None,
        }],
        UserContent::Parts(parts) => parts
            .iter()
            .map(|part| match part {
                UserPart::Text { text } => Part {
                    text: Some(text.clone()),
                    inline_data: None,
                },
                UserPart::ImageUrl { image_url } => match parse_data_url(&image_url.url) {
                    Some((mime_type, data)) => Part {
                        text: None,
                        inline_data: Some(InlineData { mime_type, data }),
                    },
                    None => Part {
                        text: Some(image_url.url.clone()),
                        inline_data: None,
                    },
                },
            })
            .collect(),
    }
}

fn parse_data_url(url: &str) -> Option<(String, String)> {
    let rest = url.strip_prefix("data:")?;
    let (meta, data) = rest.split_once(',')?;
    let (mime, encoding) = meta.split_once(';')?;
    if encoding != "base64" {
        return None;
    }
    Some((mime.to_string(), data.to_string()))
}
