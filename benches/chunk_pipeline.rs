use criterion::{black_box, criterion_group, criterion_main, Criterion};

use llm_extproc::config::parse_config;
use llm_extproc::guardrail::GuardrailSet;
use llm_extproc::headers::HeaderSnapshot;
use llm_extproc::observability::token_counter::count_text_tokens;
use llm_extproc::provider::Provider;
use llm_extproc::stream::{
    parse_sse_chunks, CoordinatorSettings, SseChunkParser, StreamChunks, StreamCoordinator,
    StreamStep,
};

const OPENAI_SINGLE: &[u8] = include_bytes!("../tests/fixtures/openai_single.sse");
const OPENAI_MULTI: &[u8] = include_bytes!("../tests/fixtures/openai_multi.sse");

const POLICY: &str = r#"
policies:
  default:
    recognizers:
      - name: EMAIL_ADDRESS
        pattern: '[A-Za-z0-9._%+-]+@[A-Za-z0-9.-]+\.[A-Za-z]{2,}'
      - name: CAT
        pattern: Whiskers
"#;

fn build_guardrails() -> GuardrailSet {
    let config = parse_config(POLICY).expect("bench policy");
    let policy = config.policies.get("default").expect("default policy");
    GuardrailSet::from_policy(policy, reqwest::Client::new(), &config.server).expect("compile policy")
}

fn bench_sse_parse(c: &mut Criterion) {
    c.bench_function("sse_parse_openai_multi_whole", |b| {
        b.iter(|| black_box(parse_sse_chunks(Provider::OpenAi, black_box(OPENAI_MULTI), b"")));
    });

    c.bench_function("sse_parse_openai_multi_64b_pieces", |b| {
        b.iter(|| {
            let mut parser = SseChunkParser::new(Provider::OpenAi);
            let mut out = Vec::with_capacity(96);
            for piece in OPENAI_MULTI.chunks(64) {
                parser.feed_into(black_box(piece), &mut out);
            }
            black_box(out)
        });
    });
}

fn bench_alignment(c: &mut Criterion) {
    let (frames, _) = parse_sse_chunks(Provider::OpenAi, OPENAI_MULTI, b"");

    c.bench_function("align_and_collapse_openai_multi_58", |b| {
        b.iter(|| {
            let mut buffer = StreamChunks::new(Provider::OpenAi);
            for frame in frames.iter().take(58).cloned() {
                buffer.append_chunk(frame);
            }
            let contents = buffer.get_contents_with_chunk_indices();
            let n = buffer.align_contents_for_guardrail(&contents, 20);
            let prefix = buffer.prefix_contents(n);
            let rewritten: Vec<String> = prefix.iter().map(|c| c.text.to_uppercase()).collect();
            let to_pop = buffer.collapse_chunks_with_new_content(&prefix, &rewritten);
            black_box(buffer.pop_chunks(n.max(to_pop)))
        });
    });
}

fn bench_coordinator(c: &mut Criterion) {
    let runtime = tokio::runtime::Builder::new_current_thread()
        .build()
        .expect("bench runtime");
    let guardrails = build_guardrails();
    let headers = HeaderSnapshot::new();

    c.bench_function("coordinator_guarded_openai_single_256b_pieces", |b| {
        b.iter(|| {
            runtime.block_on(async {
                let mut coordinator =
                    StreamCoordinator::new(Provider::OpenAi, CoordinatorSettings::default());
                let mut emitted = 0;
                for piece in OPENAI_SINGLE.chunks(256) {
                    if let StreamStep::Emit(bytes) = coordinator
                        .on_chunk(piece, false, Some((&guardrails, &headers)))
                        .await
                    {
                        emitted += bytes.len();
                    }
                }
                if let StreamStep::Emit(bytes) = coordinator
                    .on_chunk(b"", true, Some((&guardrails, &headers)))
                    .await
                {
                    emitted += bytes.len();
                }
                black_box(emitted)
            })
        });
    });
}

fn bench_token_count(c: &mut Criterion) {
    let text = "Once upon a time, in a quiet village, there lived a curious cat named Whiskers. "
        .repeat(32);
    c.bench_function("count_text_tokens_2k_chars", |b| {
        b.iter(|| black_box(count_text_tokens(black_box(&text))));
    });
}

criterion_group!(
    benches,
    bench_sse_parse,
    bench_alignment,
    bench_coordinator,
    bench_token_count
);
criterion_main!(benches);
