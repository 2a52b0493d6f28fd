use llm_extproc::provider::{Provider, Tokens};
use llm_extproc::stream::{SseChunkParser, StreamChunk, StreamChunks};

const OPENAI_SINGLE: &[u8] = include_bytes!("fixtures/openai_single.sse");
const OPENAI_MULTI: &[u8] = include_bytes!("fixtures/openai_multi.sse");
const OPENAI_UTF8: &[u8] = include_bytes!("fixtures/openai_utf8.sse");

fn frames(fixture: &[u8]) -> Vec<StreamChunk> {
    let mut parser = SseChunkParser::new(Provider::OpenAi);
    let chunks = parser.feed(fixture);
    assert!(parser.leftover().is_empty());
    chunks
}

fn buffer_with(fixture: &[u8], n: usize) -> StreamChunks {
    let mut buffer = StreamChunks::new(Provider::OpenAi);
    for chunk in frames(fixture).into_iter().take(n) {
        buffer.append_chunk(chunk);
    }
    buffer
}

fn align(buffer: &mut StreamChunks, min_chars: usize) -> usize {
    let contents = buffer.get_contents_with_chunk_indices();
    buffer.align_contents_for_guardrail(&contents, min_chars)
}

fn slots(chunk: &StreamChunk) -> (String, String, String) {
    (
        chunk.content(0).to_string(),
        chunk.content(1).to_string(),
        chunk.content(2).to_string(),
    )
}

#[test]
fn test_fixture_frame_counts() {
    assert_eq!(frames(OPENAI_SINGLE).len(), 44);
    assert_eq!(frames(OPENAI_MULTI).len(), 87);
    assert_eq!(frames(OPENAI_UTF8).len(), 37);
    assert!(frames(OPENAI_MULTI).last().is_some_and(StreamChunk::is_done));
}

#[test]
fn test_single_choice_aligns_on_sentence_boundary() {
    let mut buffer = buffer_with(OPENAI_SINGLE, 26);
    assert_eq!(align(&mut buffer, 20), 25);

    let popped = buffer.pop_chunks(25);
    let text: String = popped.iter().map(|c| c.content(0)).collect();
    assert_eq!(
        text,
        "Once upon a time, in a quiet village, there lived a curious cat named Whiskers. \
         Every night she watched the stars.  \n"
    );
}

#[test]
fn test_multi_choice_waits_until_every_choice_is_ready() {
    let mut buffer = buffer_with(OPENAI_MULTI, 14);
    let before = buffer.len();
    assert_eq!(align(&mut buffer, 20), 0);
    assert_eq!(buffer.len(), before);
}

#[test]
fn test_multi_choice_splits_trailing_text_into_new_frames() {
    let mut buffer = buffer_with(OPENAI_MULTI, 58);
    assert_eq!(buffer.choice_count(), 3);
    assert_eq!(align(&mut buffer, 20), 55);
    assert_eq!(buffer.len(), 60);

    let expected = [
        (48, " new", "", ""),
        (49, "", "", ""),
        (50, "", "", ". "),
        (51, " things", "", ""),
        (52, "", "", ""),
        (53, "", "", ""),
        (54, ". ", "", ""),
        (55, "", "It can talk and learn new", ""),
        (56, "", "", "This"),
        (57, "", " things", ""),
        (58, "", "", " helps"),
        (59, "When", "", ""),
    ];
    for (idx, c0, c1, c2) in expected {
        let chunk = buffer.get(idx).unwrap();
        assert_eq!(
            slots(chunk),
            (c0.to_string(), c1.to_string(), c2.to_string()),
            "chunk {idx}"
        );
    }

    let prefix = buffer.prefix_contents(55);
    assert_eq!(
        prefix[0].text,
        "Okay! Imagine you have a big box full of toys. Every day you learn new things. "
    );
    assert_eq!(prefix[1].text, "Okay! Imagine you have a big, shiny toy robot. ");
    assert_eq!(
        prefix[2].text,
        "Okay! Imagine LLM is like a super smart robot. It reads lots of books. "
    );
    assert!(prefix.iter().all(|c| c.begin == 0 && c.end == 55));
}

#[test]
fn test_alignment_keeps_multibyte_characters_whole() {
    let mut buffer = buffer_with(OPENAI_UTF8, 33);
    assert_eq!(align(&mut buffer, 50), 32);

    buffer.pop_chunks(31);
    assert_eq!(buffer.get(0).unwrap().content(0), "!     ");
    assert_eq!(buffer.get(1).unwrap().content(0), "🖱");
}

#[test]
fn test_collapse_rewrites_each_choice_into_its_first_frame() {
    let mut buffer = buffer_with(OPENAI_MULTI, 30);
    let original = buffer.get_contents_with_chunk_indices();
    assert_eq!(original[0].text, "Okay! Imagine you have a big box full of");
    assert_eq!(original[1].text, "Okay! Imagine you have a big, shiny toy");
    assert_eq!(original[2].text, "Okay! Imagine LLM is like a super smart robot");

    let rewritten = vec![
        original[0].text.replace("you", "nobody"),
        original[1].text.replace("big", "small"),
        original[2].text.replace("LLM", "SLM"),
    ];
    let to_pop = buffer.collapse_chunks_with_new_content(&original, &rewritten);
    assert_eq!(to_pop, 6);
    assert_eq!(buffer.len(), 30);

    let popped: Vec<_> = buffer.pop_chunks(to_pop).iter().map(slots).collect();
    let expected = [
        ("", "", ""),
        ("Okay! Imagine nobody have a big box full of", "", ""),
        ("", "", ""),
        ("", "Okay! Imagine you have a small, shiny toy", ""),
        ("", "", ""),
        ("", "", "Okay! Imagine SLM is like a super smart robot"),
    ];
    let expected: Vec<_> = expected
        .iter()
        .map(|(a, b, c)| (a.to_string(), b.to_string(), c.to_string()))
        .collect();
    assert_eq!(popped, expected);

    let rest = buffer.get_contents_with_chunk_indices();
    assert!(rest.iter().all(|c| c.text.is_empty()));
}

#[test]
fn test_collapsed_frames_stay_valid_sse() {
    let mut buffer = buffer_with(OPENAI_MULTI, 30);
    let original = buffer.get_contents_with_chunk_indices();
    let rewritten: Vec<String> = original.iter().map(|c| c.text.to_uppercase()).collect();
    let to_pop = buffer.collapse_chunks_with_new_content(&original, &rewritten);

    let emitted: Vec<u8> = buffer
        .pop_chunks(to_pop)
        .into_iter()
        .flat_map(|c| c.into_raw_bytes().to_vec())
        .collect();
    let reparsed = frames(&emitted);
    assert_eq!(reparsed.len(), to_pop);
    let mut again = StreamChunks::new(Provider::OpenAi);
    for chunk in reparsed {
        again.append_chunk(chunk);
    }
    let texts: Vec<String> = again
        .get_contents_with_chunk_indices()
        .into_iter()
        .map(|c| c.text)
        .collect();
    assert_eq!(texts, rewritten);
}

#[test]
fn test_usage_sum_over_stream() {
    let buffer = buffer_with(OPENAI_SINGLE, usize::MAX);
    let usage = buffer.get_usage_from_chunks(|v| Provider::OpenAi.tokens(v), 0, buffer.len());
    assert_eq!((usage.prompt, usage.completion), (23, 408));
    assert_eq!(buffer.model().map(str::is_empty), Some(false));
}

#[test]
fn test_popping_everything_accumulates_usage() {
    let mut buffer = buffer_with(OPENAI_SINGLE, usize::MAX);
    assert_eq!(buffer.tokens(), Tokens::default());
    let total = buffer.len();
    assert_eq!(buffer.pop_all().len(), total);
    assert!(buffer.is_empty());
    assert_eq!(buffer.buffered_bytes(), 0);
    assert_eq!((buffer.tokens().prompt, buffer.tokens().completion), (23, 408));
}
