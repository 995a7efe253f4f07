//! Integration tests for saefx
//!
//! The driver is exercised end to end with mock encoders over JSONL datasets
//! in temporary directories. Tests marked with #[ignore] require model
//! downloads; run them explicitly with: cargo test --ignored

use std::collections::BTreeSet;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use candle_core::{Device, Tensor};
use saefx::{
    run, ChunkWriter, DocumentId, Encoder, ExtractError, FeatureStore, MalformedPolicy,
    MultiLayerEncoder, PipelineConfig, ProbeConfig, ProbeTrainer, SingleLayerEncoder, Statistic,
    TranscriptDataset,
};
use serde_json::{json, Value};

const DIM: usize = 4;

fn write_jsonl(path: &Path, rows: &[Value]) {
    let mut file = std::fs::File::create(path).unwrap();
    for row in rows {
        writeln!(file, "{row}").unwrap();
    }
}

/// Documents `1..=n`; each text is the document number, so its activations
/// are constant rows holding that number.
fn numbered(n: usize) -> Vec<(String, String)> {
    (1..=n).map(|i| (i.to_string(), i.to_string())).collect()
}

fn dataset(dir: &Path, docs: &[(String, String)], metadata_ids: &[String]) -> TranscriptDataset {
    let components: Vec<Value> = docs
        .iter()
        .map(|(id, text)| json!({"transcript_id": id, "component_text": text}))
        .collect();
    let metadata: Vec<Value> = metadata_ids
        .iter()
        .enumerate()
        .map(|(i, id)| json!({"transcript_id": id, "label": i % 2}))
        .collect();
    let components_path = dir.join("components.jsonl");
    let metadata_path = dir.join("metadata.jsonl");
    write_jsonl(&components_path, &components);
    write_jsonl(&metadata_path, &metadata);
    TranscriptDataset::new(components_path, metadata_path)
}

fn ids_of(docs: &[(String, String)]) -> Vec<String> {
    docs.iter().map(|(id, _)| id.clone()).collect()
}

fn file_names(dir: &Path) -> BTreeSet<String> {
    std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect()
}

/// Every whitespace-separated word is one token whose activation row is the
/// word's numeric value (plus `offset`) in every column.
fn activations(text: &str, offset: f32) -> saefx::Result<Tensor> {
    let values: Vec<f32> = text
        .split_whitespace()
        .map(|w| w.parse::<f32>().unwrap_or(1.0) + offset)
        .collect();
    if values.is_empty() {
        return Err(ExtractError::malformed("no content tokens"));
    }
    let n = values.len();
    let rows: Vec<f32> = values
        .into_iter()
        .flat_map(|v| std::iter::repeat(v).take(DIM))
        .collect();
    Ok(Tensor::from_vec(rows, (n, DIM), &Device::Cpu)?)
}

struct MockHidden {
    calls: Arc<AtomicUsize>,
    /// Runs right before a malformed document is rejected.
    on_malformed: Option<Box<dyn FnMut()>>,
}

impl MockHidden {
    fn new() -> (Self, Arc<AtomicUsize>) {
        let calls = Arc::new(AtomicUsize::new(0));
        let encoder = Self {
            calls: Arc::clone(&calls),
            on_malformed: None,
        };
        (encoder, calls)
    }
}

impl SingleLayerEncoder for MockHidden {
    fn statistics(&self) -> &[Statistic] {
        &[Statistic::Cls, Statistic::Mean]
    }

    fn feature_dim(&self) -> Option<usize> {
        Some(DIM)
    }

    fn encode(&mut self, text: &str) -> saefx::Result<Tensor> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if text.trim().is_empty() {
            if let Some(hook) = self.on_malformed.as_mut() {
                hook();
            }
        }
        activations(text, 0.0)
    }
}

struct MockSae {
    layers: Vec<usize>,
    seen: Arc<Mutex<Vec<(usize, String)>>>,
}

impl MultiLayerEncoder for MockSae {
    fn statistics(&self) -> &[Statistic] {
        &[Statistic::Sum, Statistic::Mean, Statistic::Max, Statistic::Last]
    }

    fn layers(&self) -> &[usize] {
        &self.layers
    }

    fn feature_dim(&self, _layer: usize) -> Option<usize> {
        Some(DIM)
    }

    fn encode(&mut self, text: &str, layer: usize) -> saefx::Result<Tensor> {
        self.seen
            .lock()
            .unwrap()
            .push((layer, text.trim().to_string()));
        activations(text, layer as f32 * 1000.0)
    }
}

fn config(flush_every: usize) -> PipelineConfig {
    PipelineConfig {
        flush_every,
        ..PipelineConfig::default()
    }
}

#[test]
fn test_250_documents_three_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = numbered(250);
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let out = tmp.path().join("cls_gemma_2b");
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, calls) = MockHidden::new();
    let mut encoder = Encoder::SingleLayer(Box::new(mock));

    let summary = run(&mut encoder, &data, &config(100), &writer).unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 250);
    assert_eq!(summary.documents_processed, 250);
    let rows: Vec<usize> = summary.chunks.iter().map(|c| c.rows).collect();
    assert_eq!(rows, vec![100, 100, 50]);
    let expected: BTreeSet<String> = ["1_100", "101_200", "201_250"]
        .iter()
        .flat_map(|range| {
            [
                format!("cls_{range}.safetensors.zst"),
                format!("mean_{range}.safetensors.zst"),
                format!("meta_{range}.jsonl"),
            ]
        })
        .collect();
    assert_eq!(file_names(&out), expected);
}

#[test]
fn test_layers_get_distinct_suffixes() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = numbered(50);
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let out = tmp.path().join("sae_2b");
    let writer = ChunkWriter::create(&out).unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let mut encoder = Encoder::MultiLayer(Box::new(MockSae {
        layers: vec![5, 12, 20],
        seen: Arc::clone(&seen),
    }));

    let summary = run(&mut encoder, &data, &config(100), &writer).unwrap();

    assert_eq!(summary.chunks.len(), 3);
    let layers: Vec<Option<usize>> = summary.chunks.iter().map(|c| c.range.layer).collect();
    assert_eq!(layers, vec![Some(5), Some(12), Some(20)]);
    let names = file_names(&out);
    assert_eq!(names.len(), 3 * 5);
    for layer in [5, 12, 20] {
        assert!(names.contains(&format!("meta_layer{layer}_1_50.jsonl")));
        for stat in ["sum", "mean", "max", "last"] {
            assert!(names.contains(&format!("{stat}_layer{layer}_1_50.safetensors.zst")));
        }
    }

    // Layer-major: every document of layer 5 before any of layer 12.
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 150);
    assert!(seen[..50].iter().all(|(l, _)| *l == 5));
    assert_eq!(seen[50], (12, "1".to_string()));

    let store = FeatureStore::open(&out).unwrap();
    assert_eq!(store.layers(), vec![Some(5), Some(12), Some(20)]);
    let set = store.load(Statistic::Last, Some(12)).unwrap();
    assert_eq!(set.features[[0, 0]], 12_001.0);
}

#[test]
fn test_full_chunks_plus_partial() {
    for (n, t) in [(1, 1), (7, 3), (9, 3), (10, 4), (3, 10)] {
        let tmp = tempfile::tempdir().unwrap();
        let docs = numbered(n);
        let data = dataset(tmp.path(), &docs, &ids_of(&docs));
        let writer = ChunkWriter::create(tmp.path().join("out")).unwrap();
        let (mock, _) = MockHidden::new();
        let mut encoder = Encoder::SingleLayer(Box::new(mock));

        let summary = run(&mut encoder, &data, &config(t), &writer).unwrap();

        let expected = n / t + usize::from(n % t != 0);
        assert_eq!(summary.chunks.len(), expected, "n={n} t={t}");
        assert_eq!(summary.chunks.iter().map(|c| c.rows).sum::<usize>(), n);
        assert!(summary.chunks[..n / t].iter().all(|c| c.rows == t));
        let indices: Vec<usize> = summary.chunks.iter().map(|c| c.chunk_index).collect();
        assert_eq!(indices, (0..expected).collect::<Vec<_>>());
    }
}

#[test]
fn test_zero_token_document_halts() {
    let tmp = tempfile::tempdir().unwrap();
    let mut docs = numbered(5);
    docs[3].1 = "   ".to_string();
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let out = tmp.path().join("out");
    let writer = ChunkWriter::create(&out).unwrap();

    // Snapshot the directory at the moment the bad document is encoded.
    let snapshot: Arc<Mutex<Vec<(PathBuf, Vec<u8>)>>> = Arc::default();
    let (mut mock, _) = MockHidden::new();
    let (snap, dir) = (Arc::clone(&snapshot), out.clone());
    mock.on_malformed = Some(Box::new(move || {
        let mut files: Vec<(PathBuf, Vec<u8>)> = std::fs::read_dir(&dir)
            .unwrap()
            .map(|e| {
                let path = e.unwrap().path();
                let bytes = std::fs::read(&path).unwrap();
                (path, bytes)
            })
            .collect();
        files.sort();
        *snap.lock().unwrap() = files;
    }));
    let mut encoder = Encoder::SingleLayer(Box::new(mock));

    let err = run(&mut encoder, &data, &config(2), &writer).unwrap_err();

    match &err.source {
        ExtractError::MalformedInput { document, .. } => {
            assert_eq!(document.as_ref().unwrap().as_str(), "4");
        }
        other => panic!("unexpected error: {other}"),
    }
    let last = err.last_flushed.as_ref().unwrap();
    assert_eq!((last.first.as_str(), last.last.as_str()), ("1", "2"));

    // Document 3 was in flight and never reached disk.
    let expected: BTreeSet<String> = [
        "cls_1_2.safetensors.zst",
        "mean_1_2.safetensors.zst",
        "meta_1_2.jsonl",
    ]
    .iter()
    .map(ToString::to_string)
    .collect();
    assert_eq!(file_names(&out), expected);

    let before = snapshot.lock().unwrap();
    assert_eq!(before.len(), 3);
    for (path, bytes) in before.iter() {
        assert_eq!(&std::fs::read(path).unwrap(), bytes);
    }
}

#[test]
fn test_missing_metadata_fails_before_encoding() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = numbered(4);
    let metadata_ids: Vec<String> = ["1", "2", "4"].iter().map(ToString::to_string).collect();
    let data = dataset(tmp.path(), &docs, &metadata_ids);
    let out = tmp.path().join("out");
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, calls) = MockHidden::new();
    let mut encoder = Encoder::SingleLayer(Box::new(mock));

    let err = run(&mut encoder, &data, &config(2), &writer).unwrap_err();

    assert!(err.source.is_configuration(), "{}", err.source);
    assert!(err.source.to_string().contains('3'));
    assert!(err.last_flushed.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(file_names(&out).is_empty());
}

#[test]
fn test_unsafe_id_is_rejected() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = vec![("call_1".to_string(), "1".to_string())];
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let writer = ChunkWriter::create(tmp.path().join("out")).unwrap();
    let (mock, calls) = MockHidden::new();
    let mut encoder = Encoder::SingleLayer(Box::new(mock));

    let err = run(&mut encoder, &data, &config(2), &writer).unwrap_err();
    assert!(err.source.is_configuration());
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[test]
fn test_store_restores_flush_order() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = numbered(25);
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let out = tmp.path().join("out");
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, _) = MockHidden::new();
    let mut encoder = Encoder::SingleLayer(Box::new(mock));
    run(&mut encoder, &data, &config(10), &writer).unwrap();

    // "11_20" sorts before "1_10" by plain byte order.
    let store = FeatureStore::open(&out).unwrap();
    assert_eq!(store.statistics(None), vec![Statistic::Mean, Statistic::Cls]);
    let set = store.load(Statistic::Mean, None).unwrap();

    assert_eq!(set.n_rows(), 25);
    assert_eq!(set.n_features(), DIM);
    let expected: Vec<DocumentId> = (1..=25u64).map(DocumentId::from).collect();
    assert_eq!(set.ids, expected);
    for (row, id) in set.ids.iter().enumerate() {
        let value: f32 = id.as_str().parse().unwrap();
        assert_eq!(set.features[[row, 0]], value);
        assert_eq!(set.metadata[row]["transcript_id"], json!(id.as_str()));
    }
}

#[test]
fn test_resumed_run_keeps_document_order() {
    let tmp = tempfile::tempdir().unwrap();
    let out = tmp.path().join("out");
    let first_dir = tmp.path().join("first");
    let second_dir = tmp.path().join("second");
    std::fs::create_dir_all(&first_dir).unwrap();
    std::fs::create_dir_all(&second_dir).unwrap();

    let first_docs = numbered(20);
    let first = dataset(&first_dir, &first_docs, &ids_of(&first_docs));
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, _) = MockHidden::new();
    run(&mut Encoder::SingleLayer(Box::new(mock)), &first, &config(10), &writer).unwrap();

    // A second run appends the remaining documents; its first chunk index is 0 again.
    let second_docs: Vec<(String, String)> = numbered(25).split_off(20);
    let second = dataset(&second_dir, &second_docs, &ids_of(&second_docs));
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, _) = MockHidden::new();
    let summary =
        run(&mut Encoder::SingleLayer(Box::new(mock)), &second, &config(10), &writer).unwrap();
    assert_eq!(summary.chunks[0].chunk_index, 0);
    assert_eq!(summary.chunks[0].sequence, 2);

    let set = FeatureStore::open(&out)
        .unwrap()
        .load(Statistic::Mean, None)
        .unwrap();
    let expected: Vec<DocumentId> = (1..=25u64).map(DocumentId::from).collect();
    assert_eq!(set.ids, expected);
    assert_eq!(set.features[[24, 0]], 25.0);
}

#[test]
fn test_store_requires_metadata_partner() {
    let tmp = tempfile::tempdir().unwrap();
    let docs = numbered(6);
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let out = tmp.path().join("out");
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, _) = MockHidden::new();
    let mut encoder = Encoder::SingleLayer(Box::new(mock));
    run(&mut encoder, &data, &config(3), &writer).unwrap();

    std::fs::remove_file(out.join("meta_4_6.jsonl")).unwrap();
    let err = FeatureStore::open(&out)
        .unwrap()
        .load(Statistic::Cls, None)
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(err.to_string().contains("meta_4_6.jsonl"));
}

#[test]
fn test_skip_policy_continues_after_empty_document() {
    let tmp = tempfile::tempdir().unwrap();
    let mut docs = numbered(6);
    docs[1].1 = String::new();
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let out = tmp.path().join("out");
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, _) = MockHidden::new();
    let mut encoder = Encoder::SingleLayer(Box::new(mock));
    let config = PipelineConfig {
        flush_every: 3,
        malformed: MalformedPolicy::Skip,
    };

    let summary = run(&mut encoder, &data, &config, &writer).unwrap();

    assert_eq!(summary.skipped, vec![(None, DocumentId::from("2"))]);
    assert_eq!(summary.documents_processed, 5);
    assert!(out.join("meta_1_4.jsonl").exists());
    assert!(out.join("meta_5_6.jsonl").exists());
    let set = FeatureStore::open(&out)
        .unwrap()
        .load(Statistic::Cls, None)
        .unwrap();
    assert!(!set.ids.contains(&DocumentId::from("2")));
}

#[test]
fn test_probe_on_extracted_chunks() {
    let tmp = tempfile::tempdir().unwrap();
    // Odd positions carry label 1 and a large value.
    let docs: Vec<(String, String)> = (1..=40)
        .map(|i| {
            let value = if (i - 1) % 2 == 1 { 100 + i } else { i };
            (i.to_string(), value.to_string())
        })
        .collect();
    let data = dataset(tmp.path(), &docs, &ids_of(&docs));
    let out = tmp.path().join("out");
    let writer = ChunkWriter::create(&out).unwrap();
    let (mock, _) = MockHidden::new();
    let mut encoder = Encoder::SingleLayer(Box::new(mock));
    run(&mut encoder, &data, &config(16), &writer).unwrap();

    let set = FeatureStore::open(&out)
        .unwrap()
        .load(Statistic::Mean, None)
        .unwrap();
    let results = ProbeTrainer::new(ProbeConfig {
        statistic: Statistic::Mean,
        select_k: Some(2),
        ..ProbeConfig::default()
    })
    .train_and_evaluate(&set)
    .unwrap();

    assert_eq!(results.total, 8);
    assert_eq!(results.n_features, 2);
    assert!(results.accuracy > 0.8, "accuracy {}", results.accuracy);
}

/// Model-dependent test: hidden-state extraction
#[test]
#[ignore = "requires model download"]
fn test_hidden_state_encoder() {
    use saefx::{EncoderKind, EncoderOptions, ModelRegistry};

    let options = EncoderOptions {
        force_cpu: true,
        max_tokens: Some(64),
        ..EncoderOptions::default()
    };
    let mut encoder = Encoder::from_registry(
        &ModelRegistry::builtin(),
        "cls_gemma_2b",
        EncoderKind::HiddenState,
        &options,
    )
    .unwrap();
    let Encoder::SingleLayer(inner) = &mut encoder else {
        panic!("hidden-state encoders are single-layer");
    };
    let acts = inner.encode(" Good morning and welcome to the call.").unwrap();
    assert_eq!(acts.dim(1).unwrap(), 2304); // Gemma-2-2B hidden_size
    assert!(inner.encode("").unwrap_err().is_malformed_input());
}

/// Model-dependent test: SAE readout of a hooked layer
#[test]
#[ignore = "requires model and SAE download"]
fn test_sae_encoder() {
    use saefx::{EncoderKind, EncoderOptions, ModelRegistry, SaeReadout};

    let options = EncoderOptions {
        force_cpu: true,
        max_tokens: Some(64),
        readout: SaeReadout::Latents,
    };
    let mut encoder = Encoder::from_registry(
        &ModelRegistry::builtin(),
        "sae_2b",
        EncoderKind::Sae,
        &options,
    )
    .unwrap();
    assert_eq!(encoder.passes(), vec![Some(5), Some(12), Some(20)]);
    let Encoder::MultiLayer(inner) = &mut encoder else {
        panic!("SAE encoders are multi-layer");
    };
    let acts = inner.encode(" Revenue grew this quarter.", 12).unwrap();
    assert_eq!(acts.dim(1).unwrap(), 16_384);
    assert!(inner.encode(" text", 3).unwrap_err().is_configuration());
}
