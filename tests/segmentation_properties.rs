//! Segmentation properties over randomized documents, plus the two
//! reference scenarios through the public API.

use chunkwise::segment::{normalize_whitespace, reconstruct, LlmTokenizer, DEFAULT_TOKENIZER_TASK};
use chunkwise::{MockClient, Segmenter, SuspicionPolicy};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

const WORDS: &[&str] = &[
    "widgets", "the", "results", "Dr.", "Smith", "e.g.", "measured", "3.14", "(2020)", "[12]",
    "U.S.", "\"quoted\"", "growth", "of", "J.", "Widgetry", "approx.", "Fig.", "data", "and",
];
const TERMINALS: &[&str] = &[".", ".", ".", "?", "!", "...", ". [3]"];

fn sentence(rng: &mut StdRng) -> String {
    let len = rng.gen_range(1..12);
    let mut words: Vec<&str> = (0..len)
        .map(|_| *WORDS.choose(rng).unwrap_or(&"word"))
        .collect();
    words[0] = ["Widgets", "This", "Results", "A", "Some"]
        .choose(rng)
        .copied()
        .unwrap_or("It");
    format!("{}{}", words.join(" "), TERMINALS.choose(rng).unwrap_or(&"."))
}

fn random_document(rng: &mut StdRng) -> String {
    let mut lines = Vec::new();
    for _ in 0..rng.gen_range(1..8) {
        match rng.gen_range(0..10) {
            0 => lines.push(format!("## Section {}", rng.gen_range(1..9))),
            1 => lines.push(format!(
                "[{}] Smith, J. ({}). {}",
                rng.gen_range(1..40),
                rng.gen_range(1990..2025),
                sentence(rng)
            )),
            2 => lines.push(String::new()),
            _ => {
                let count = rng.gen_range(1..6);
                let sentences: Vec<String> = (0..count).map(|_| sentence(rng)).collect();
                let separator = if rng.gen_bool(0.2) { "  " } else { " " };
                lines.push(sentences.join(separator));
            }
        }
    }
    if rng.gen_bool(0.3) {
        lines.push("References".to_string());
        for n in 1..rng.gen_range(2..5) {
            lines.push(format!("{}. Doe, A. ({}). Widget notes. Widget Press.", n, 2000 + n));
        }
    }
    lines.join("\n")
}

#[tokio::test]
async fn chunks_reconstruct_the_document() {
    let mut rng = StdRng::seed_from_u64(7);
    let segmenter = Segmenter::statistical();

    for round in 0..200 {
        let document = random_document(&mut rng);
        let segmentation = segmenter.segment(&document).await.unwrap();

        assert_eq!(
            normalize_whitespace(&reconstruct(&segmentation.chunks)),
            normalize_whitespace(&document),
            "round {}: {:?}",
            round,
            document
        );
        for chunk in &segmentation.chunks {
            assert!(!chunk.content.trim().is_empty());
            assert_eq!(chunk.content, chunk.content.trim());
        }
    }
}

#[tokio::test]
async fn chunk_indices_are_dense() {
    let mut rng = StdRng::seed_from_u64(11);
    let segmenter = Segmenter::statistical();

    for _ in 0..100 {
        let document = random_document(&mut rng);
        let chunks = segmenter.segment(&document).await.unwrap().chunks;

        for (position, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.chunk_index, position);
        }
        for pair in chunks.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            if a.paragraph_index == b.paragraph_index {
                assert_eq!(b.chunk_index_within_paragraph, a.chunk_index_within_paragraph + 1);
            } else {
                assert!(b.paragraph_index > a.paragraph_index);
                assert_eq!(b.chunk_index_within_paragraph, 0);
            }
        }
    }
}

#[test]
fn adding_a_short_fragment_never_lowers_the_score() {
    let mut rng = StdRng::seed_from_u64(3);
    let policy = SuspicionPolicy::default();
    let alphabet: Vec<char> = "abcdefghij.(,;".chars().collect();

    let random_fragment = |rng: &mut StdRng, min: usize, max: usize| -> String {
        let len = rng.gen_range(min..max);
        let mut s: String = (0..len)
            .map(|_| *alphabet.choose(rng).unwrap_or(&'a'))
            .collect();
        s.replace_range(0..1, "W");
        s
    };

    for _ in 0..500 {
        let count = rng.gen_range(1..6);
        let mut fragments: Vec<String> = (0..count)
            .map(|_| random_fragment(&mut rng, 1, 120))
            .collect();
        let before = policy.score(&fragments).score;

        let short = random_fragment(&mut rng, 1, policy.very_short_len);
        let at = rng.gen_range(0..=fragments.len());
        fragments.insert(at, short);
        let after = policy.score(&fragments).score;

        assert!(after >= before, "{:?}: {} -> {}", fragments, before, after);
    }
}

#[tokio::test]
async fn bibliography_line_is_repaired_by_the_tokenizer() {
    let line = "1. Smith, J. (2020). The Effects of Widgets. Journal of Widgetry.";
    let client = Arc::new(
        MockClient::available().with_handler(DEFAULT_TOKENIZER_TASK, |input| {
            let request: serde_json::Value =
                serde_json::from_str(input).map_err(|e| e.to_string())?;
            let paragraph = request["paragraph"].as_str().unwrap_or_default();
            Ok(serde_json::json!({ "sentences": [paragraph] }).to_string())
        }),
    );
    let segmenter = Segmenter::new(
        SuspicionPolicy::default(),
        Arc::new(LlmTokenizer::new(client.clone())),
    )
    .unwrap();

    let segmentation = segmenter.segment(line).await.unwrap();

    assert_eq!(segmentation.fallbacks.len(), 1);
    let record = &segmentation.fallbacks[0];
    assert_eq!(record.fast_fragments, 4);
    assert!(record.report.score >= 5);
    assert_eq!(client.calls(), 1);
    assert_eq!(segmentation.chunks.len(), 1);
    assert_eq!(segmentation.chunks[0].content, line);
}

#[tokio::test]
async fn plain_prose_never_calls_the_tokenizer() {
    let client = Arc::new(MockClient::available());
    let segmenter = Segmenter::new(
        SuspicionPolicy::default(),
        Arc::new(LlmTokenizer::new(client.clone())),
    )
    .unwrap();

    let segmentation = segmenter
        .segment("This is sentence one. This is sentence two.")
        .await
        .unwrap();

    assert!(segmentation.fallbacks.is_empty());
    assert_eq!(client.calls(), 0);
    let contents: Vec<&str> = segmentation.chunks.iter().map(|c| c.content.as_str()).collect();
    assert_eq!(contents, vec!["This is sentence one.", "This is sentence two."]);

    let fragments = segmenter.fast_split(&chunkwise::segment::split_paragraphs(
        "This is sentence one. This is sentence two.",
    )[0]);
    assert_eq!(segmenter.policy().score(&fragments).score, 0);
}
