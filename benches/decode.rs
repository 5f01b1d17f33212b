use criterion::{black_box, criterion_group, criterion_main, Criterion};

use polylogue::history::{normalize_history, preflight};
use polylogue::protocol::canonical::{Dialect, Message, ToolCall, ToolResult};
use polylogue::stream::{decode_all, decoder_for, RawEvent, SseParser};

fn chat_chunks(text_chunks: usize) -> Vec<RawEvent> {
    let mut raws = Vec::with_capacity(text_chunks + 6);
    raws.push(RawEvent::data(
        r#"{"id":"chatcmpl-b","choices":[{"index":0,"delta":{"role":"assistant","content":""}}]}"#,
    ));
    for i in 0..text_chunks {
        raws.push(RawEvent::data(format!(
            r#"{{"id":"chatcmpl-b","choices":[{{"index":0,"delta":{{"content":"token {i} "}}}}]}}"#
        )));
    }
    raws.push(RawEvent::data(
        r#"{"id":"chatcmpl-b","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"id":"call_1","function":{"name":"lookup","arguments":"{\"q\":"}}]}}]}"#,
    ));
    raws.push(RawEvent::data(
        r#"{"id":"chatcmpl-b","choices":[{"index":0,"delta":{"tool_calls":[{"index":0,"function":{"arguments":"\"x\"}"}}]}}]}"#,
    ));
    raws.push(RawEvent::data(
        r#"{"id":"chatcmpl-b","choices":[{"index":0,"delta":{},"finish_reason":"tool_calls"}]}"#,
    ));
    raws.push(RawEvent::data(
        r#"{"id":"chatcmpl-b","choices":[],"usage":{"prompt_tokens":100,"completion_tokens":40}}"#,
    ));
    raws.push(RawEvent::data("[DONE]"));
    raws
}

fn anthropic_sse(text_chunks: usize) -> String {
    let mut sse = String::from(
        "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"id\":\"msg_b\",\"usage\":{\"input_tokens\":100}}}\n\n\
         event: content_block_start\ndata: {\"type\":\"content_block_start\",\"index\":0,\"content_block\":{\"type\":\"text\",\"text\":\"\"}}\n\n",
    );
    for i in 0..text_chunks {
        sse.push_str(&format!(
            "event: content_block_delta\ndata: {{\"type\":\"content_block_delta\",\"index\":0,\"delta\":{{\"type\":\"text_delta\",\"text\":\"token {i} \"}}}}\n\n"
        ));
    }
    sse.push_str(
        "event: content_block_stop\ndata: {\"type\":\"content_block_stop\",\"index\":0}\n\n\
         event: message_delta\ndata: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":40}}\n\n\
         event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
    );
    sse
}

fn long_history(rounds: usize) -> Vec<Message> {
    let mut history = vec![Message::system("be brief")];
    for round in 0..rounds {
        let id = format!("call_{round}");
        history.push(Message::user(format!("question {round}")));
        history.push(
            Message::assistant(Vec::new())
                .with_tool_calls(vec![ToolCall::new(id.clone(), "lookup", serde_json::Map::new())]),
        );
        // every third round is left unanswered
        if round % 3 != 0 {
            history.push(Message::tool(vec![ToolResult::success(id, "answer")]));
        }
    }
    history
}

fn bench_decoders(c: &mut Criterion) {
    let chat = chat_chunks(256);
    c.bench_function("decode_chat_chunks_256", |b| {
        b.iter(|| {
            let mut decoder = decoder_for(Dialect::ChatChunks);
            black_box(decode_all(decoder.as_mut(), black_box(&chat)));
        });
    });

    let sse = anthropic_sse(256);
    c.bench_function("parse_and_decode_indexed_blocks_256", |b| {
        b.iter(|| {
            let raws = SseParser::new().feed(black_box(&sse));
            let mut decoder = decoder_for(Dialect::IndexedBlocks);
            black_box(decode_all(decoder.as_mut(), &raws));
        });
    });
}

fn bench_history(c: &mut Criterion) {
    let history = long_history(200);
    c.bench_function("normalize_history_200_rounds", |b| {
        b.iter(|| black_box(normalize_history(black_box(&history), Dialect::ChatChunks)));
    });

    let normalized = normalize_history(&history, Dialect::ChatChunks);
    c.bench_function("preflight_canonical_200_rounds", |b| {
        b.iter(|| black_box(preflight(black_box(normalized.as_slice())).is_ok()));
    });
}

criterion_group!(benches, bench_decoders, bench_history);
criterion_main!(benches);
