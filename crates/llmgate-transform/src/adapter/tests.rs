use super::*;
use llmgate_protocol::claude::messages::response::{
    ContentBlock, MessageObjectType, MessageResponse,
};
use llmgate_protocol::claude::messages::stream::{
    ContentBlockDelta, MessageDeltaBody, MessageStreamEvent, StreamUsage,
};
use llmgate_protocol::claude::messages::types::{MessageRole, MessageUsage, StopReason};
use llmgate_protocol::openai::chat_completions::request::{
    ChatCompletionRequest, ChatCompletionRequestBody, StopConfiguration,
};
use llmgate_protocol::openai::chat_completions::stream::{
    ChatCompletionChunk, ChatCompletionChunkObjectType, StreamChoice,
};
use llmgate_protocol::openai::chat_completions::types::{
    ChatMessage, FinishReason, FunctionObject, StreamDelta, SystemMessage, TextContent,
    ToolDefinition, UserContent, UserMessage,
};
use serde_json::json;

fn openai_request(stream: Option<bool>) -> ChatCompletionRequest {
    let mut body = ChatCompletionRequestBody::bare(
        "gpt-test",
        vec![
            ChatMessage::System(SystemMessage {
                content: TextContent::Text("be terse".to_string()),
                name: None,
            }),
            ChatMessage::User(UserMessage {
                content: UserContent::Text("hi".to_string()),
                name: None,
            }),
        ],
    );
    body.temperature = Some(0.4);
    body.top_p = Some(0.9);
    body.max_tokens = Some(256);
    body.stop = Some(StopConfiguration::Many(vec!["END".to_string()]));
    body.stream = stream;
    body.tools = Some(vec![ToolDefinition::Function {
        function: FunctionObject {
            name: "get_weather".to_string(),
            description: Some("weather lookup".to_string()),
            parameters: Some(json!({
                "type": "object",
                "properties": {"city": {"type": "string"}},
                "required": ["city"],
            })),
            strict: None,
        },
    }]);
    ChatCompletionRequest { body }
}

fn openai_chunk(content: Option<&str>, finish: Option<FinishReason>) -> ChatCompletionChunk {
    let mut delta = StreamDelta::empty();
    delta.content = content.map(str::to_string);
    ChatCompletionChunk {
        id: "chatcmpl-1".to_string(),
        object: ChatCompletionChunkObjectType::ChatCompletionChunk,
        created: 1_700_000_000,
        model: "gpt-test".to_string(),
        choices: vec![StreamChoice {
            index: 0,
            delta,
            finish_reason: finish,
        }],
        usage: None,
        system_fingerprint: None,
    }
}

#[test]
fn detect_style_basics() {
    assert_eq!(
        detect_request_style(&json!({"model": "m", "messages": []})),
        ApiStyle::OpenAI
    );
    assert_eq!(
        detect_request_style(&json!({"model": "m", "messages": [], "system": "x"})),
        ApiStyle::Claude
    );
    assert_eq!(
        detect_request_style(&json!({"model": "m", "max_tokens_to_sample": 10})),
        ApiStyle::Claude
    );
    assert_eq!(
        detect_request_style(&json!({"model": "m", "input": "hello"})),
        ApiStyle::Responses
    );
}

#[test]
fn openai_claude_round_trip_preserves_core_fields() {
    let original = openai_request(None);
    let claude = adapt_request(&ChatRequest::OpenAI(original.clone()), ApiStyle::Claude).unwrap();
    let ChatRequest::Claude(claude_req) = &claude else {
        panic!("expected claude request");
    };
    assert_eq!(claude_req.body.system.as_ref().unwrap().flatten(), "be terse");
    assert_eq!(claude_req.body.max_tokens, 256);

    let back = adapt_request(&claude, ApiStyle::OpenAI).unwrap();
    let ChatRequest::OpenAI(round) = back else {
        panic!("expected openai request");
    };
    assert_eq!(round.body.temperature, original.body.temperature);
    assert_eq!(round.body.top_p, original.body.top_p);
    assert_eq!(round.body.max_tokens, original.body.max_tokens);
    assert_eq!(
        round.body.stop,
        Some(StopConfiguration::Many(vec!["END".to_string()]))
    );

    // One system + one user turn survive.
    assert_eq!(round.body.messages.len(), original.body.messages.len());
    let tool_names: Vec<&str> = round
        .body
        .tools
        .as_ref()
        .unwrap()
        .iter()
        .map(|ToolDefinition::Function { function }| function.name.as_str())
        .collect();
    assert_eq!(tool_names, vec!["get_weather"]);
}

#[test]
fn claude_response_to_openai_maps_usage_and_stop_reason() {
    let message = MessageResponse {
        id: "msg_1".to_string(),
        r#type: MessageObjectType::Message,
        role: MessageRole::Assistant,
        model: "claude-test".to_string(),
        content: vec![ContentBlock::Text {
            text: "ok".to_string(),
        }],
        stop_reason: Some(StopReason::MaxTokens),
        stop_sequence: None,
        usage: MessageUsage {
            input_tokens: 11,
            output_tokens: 7,
        },
    };
    let out = adapt_response(&ChatResponse::Claude(message), ApiStyle::OpenAI, 0).unwrap();
    let ChatResponse::OpenAI(chat) = out else {
        panic!("expected openai response");
    };
    assert_eq!(chat.choices[0].finish_reason, FinishReason::Length);
    assert_eq!(chat.choices[0].message.content.as_deref(), Some("ok"));
    let usage = chat.usage.unwrap();
    assert_eq!(usage.prompt_tokens, 11);
    assert_eq!(usage.completion_tokens, 7);
    assert_eq!(usage.total_tokens, 18);
}

#[test]
fn openai_response_to_claude_shape() {
    let chat =llmgate_protocol::openai::chat_completions::response::ChatCompletionResponse {
        id: "chatcmpl-9".to_string(),
        object:
            llmgate_protocol::openai::chat_completions::response::ChatCompletionObjectType::ChatCompletion,
        created: 1,
        model: "gpt-test".to_string(),
        choices: vec![llmgate_protocol::openai::chat_completions::response::ChatChoice {
            index: 0,
            message: llmgate_protocol::openai::chat_completions::types::ResponseMessage {
                role: llmgate_protocol::openai::chat_completions::types::ResponseRole::Assistant,
                content: Some("ok".to_string()),
                refusal: None,
                tool_calls: None,
            },
            finish_reason: FinishReason::Stop,
            logprobs: None,
        }],
        usage: Some(llmgate_protocol::openai::chat_completions::types::Usage {
            prompt_tokens: 3,
            completion_tokens: 2,
            total_tokens: 5,
        }),
        system_fingerprint: None,
    };
    let out = adapt_response(&ChatResponse::OpenAI(chat), ApiStyle::Claude, 1).unwrap();
    let ChatResponse::Claude(message) = out else {
        panic!("expected claude response");
    };
    assert_eq!(message.stop_reason, Some(StopReason::EndTurn));
    assert_eq!(message.usage.input_tokens, 3);
    assert_eq!(message.usage.output_tokens, 2);
    assert!(matches!(
        message.content.as_slice(),
        [ContentBlock::Text { text }] if text == "ok"
    ));
}

#[test]
fn claude_stream_to_openai_accumulates_and_terminates_once() {
    let mut adapter =
        StreamAdapter::new(ApiStyle::Claude, ApiStyle::OpenAI, "s1", "claude-test", 0).unwrap();

    let mut chunks = Vec::new();
    let events = vec![
        MessageStreamEvent::MessageStart {
            message: MessageResponse {
                id: "msg_s1".to_string(),
                r#type: MessageObjectType::Message,
                role: MessageRole::Assistant,
                model: "claude-test".to_string(),
                content: Vec::new(),
                stop_reason: None,
                stop_sequence: None,
                usage: MessageUsage {
                    input_tokens: 5,
                    output_tokens: 0,
                },
            },
        },
        MessageStreamEvent::ContentBlockStart {
            index: 0,
            content_block: ContentBlock::Text {
                text: String::new(),
            },
        },
        MessageStreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentBlockDelta::TextDelta {
                text: "hel".to_string(),
            },
        },
        MessageStreamEvent::ContentBlockDelta {
            index: 0,
            delta: ContentBlockDelta::TextDelta {
                text: "lo".to_string(),
            },
        },
        MessageStreamEvent::ContentBlockStop { index: 0 },
        MessageStreamEvent::MessageDelta {
            delta: MessageDeltaBody {
                stop_reason: Some(StopReason::EndTurn),
                stop_sequence: None,
            },
            usage: Some(StreamUsage {
                input_tokens: Some(5),
                output_tokens: Some(2),
            }),
        },
        MessageStreamEvent::MessageStop,
    ];
    for event in events {
        chunks.extend(adapter.process(StreamEvent::Claude(event)).unwrap());
    }
    chunks.extend(adapter.finish());

    let mut text = String::new();
    let mut finish_count = 0;
    for chunk in &chunks {
        let StreamEvent::OpenAIChunk(chunk) = chunk else {
            panic!("unexpected event kind");
        };
        for choice in &chunk.choices {
            if let Some(content) = &choice.delta.content {
                text.push_str(content);
            }
            if choice.finish_reason.is_some() {
                finish_count += 1;
            }
        }
    }
    assert_eq!(text, "hello");
    assert_eq!(finish_count, 1);
    assert!(!adapter.errored());
}

#[test]
fn stream_error_suppresses_finalization() {
    let mut adapter =
        StreamAdapter::new(ApiStyle::OpenAI, ApiStyle::Claude, "s2", "gpt-test", 0).unwrap();

    let out = adapter
        .process(StreamEvent::OpenAIChunk(openai_chunk(Some("hi"), None)))
        .unwrap();
    assert!(
        out.iter().any(|event| matches!(
            event,
            StreamEvent::Claude(MessageStreamEvent::ContentBlockDelta { .. })
        ))
    );

    let failed = adapter.fail("connection reset");
    assert_eq!(failed.len(), 1);
    assert!(matches!(
        failed[0],
        StreamEvent::Claude(MessageStreamEvent::Error { .. })
    ));
    assert!(adapter.errored());

    // No message_delta/message_stop after the error frame.
    assert!(adapter.finish().is_empty());
    // Late upstream chunks are swallowed too.
    assert!(
        adapter
            .process(StreamEvent::OpenAIChunk(openai_chunk(Some("late"), None)))
            .unwrap()
            .is_empty()
    );
}

#[test]
fn openai_stream_to_claude_emits_ordered_frames() {
    let mut adapter =
        StreamAdapter::new(ApiStyle::OpenAI, ApiStyle::Claude, "s3", "gpt-test", 0).unwrap();
    let mut events = Vec::new();
    events.extend(
        adapter
            .process(StreamEvent::OpenAIChunk(openai_chunk(Some("hey"), None)))
            .unwrap(),
    );
    events.extend(
        adapter
            .process(StreamEvent::OpenAIChunk(openai_chunk(
                None,
                Some(FinishReason::Stop),
            )))
            .unwrap(),
    );
    events.extend(adapter.finish());

    let names: Vec<&str> = events
        .iter()
        .map(|event| match event {
            StreamEvent::Claude(event) => event.event_name(),
            _ => panic!("unexpected event kind"),
        })
        .collect();
    assert_eq!(
        names,
        vec![
            "message_start",
            "content_block_start",
            "content_block_delta",
            "content_block_stop",
            "message_delta",
            "message_stop",
        ]
    );
}

#[test]
fn chat_to_responses_wrapper_completes_with_output_text() {
    let mut adapter =
        StreamAdapter::new(ApiStyle::OpenAI, ApiStyle::Responses, "s4", "gpt-test", 0).unwrap();
    let mut events = Vec::new();
    events.extend(
        adapter
            .process(StreamEvent::OpenAIChunk(openai_chunk(Some("a"), None)))
            .unwrap(),
    );
    events.extend(
        adapter
            .process(StreamEvent::OpenAIChunk(openai_chunk(Some("b"), None)))
            .unwrap(),
    );
    events.extend(adapter.finish());

    use llmgate_protocol::openai::responses::stream::ResponseStreamEvent;
    assert!(matches!(
        events.first(),
        Some(StreamEvent::Responses(ResponseStreamEvent::Created { .. }))
    ));
    let Some(StreamEvent::Responses(ResponseStreamEvent::Completed { response, .. })) =
        events.last()
    else {
        panic!("expected completed event last");
    };
    assert_eq!(response.output_text.as_deref(), Some("ab"));
    // Exactly one terminal frame.
    let completed = events
        .iter()
        .filter(|event| {
            matches!(
                event,
                StreamEvent::Responses(ResponseStreamEvent::Completed { .. })
            )
        })
        .count();
    assert_eq!(completed, 1);
}

#[test]
fn responses_request_adapts_to_chat_messages() {
    use llmgate_protocol::openai::responses::request::{
        CreateResponseRequest, CreateResponseRequestBody, ResponseInput,
    };
    let request = CreateResponseRequest {
        body: CreateResponseRequestBody {
            model: "gpt-test".to_string(),
            input: Some(ResponseInput::Text("hello".to_string())),
            instructions: Some("be kind".to_string()),
            stream: None,
            temperature: None,
            top_p: None,
            max_output_tokens: Some(64),
            user: None,
        },
    };
    let out = adapt_request(&ChatRequest::Responses(request), ApiStyle::OpenAI).unwrap();
    let ChatRequest::OpenAI(chat) = out else {
        panic!("expected openai request");
    };
    assert_eq!(chat.body.max_completion_tokens, Some(64));
    assert!(matches!(
        &chat.body.messages[0],
        ChatMessage::System(system) if system.content.flatten() == "be kind"
    ));
    assert!(matches!(
        &chat.body.messages[1],
        ChatMessage::User(user) if matches!(&user.content, UserContent::Text(text) if text == "hello")
    ));
}
