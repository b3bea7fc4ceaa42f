//! End-to-end runs on a tiny random OPT checkpoint written to disk

use opt_sparsity::runtime::{
    print_report, run_module, run_module_dataset, DataSource, DatasetOptions,
};
use opt_sparsity::{
    Collector, CollectorConfig, CollectorState, DatasetSpec, ModuleCollector, OptCollector,
    OptConfig, OptModel, Plotter,
};
use safetensors::tensor::TensorView;
use safetensors::Dtype;
use std::fs;
use std::path::Path;

const VOCAB_SIZE: usize = 20;

/// Write config, weights and a byte-level BPE vocabulary for a tiny model
fn write_checkpoint(dir: &Path) -> OptConfig {
    let config = OptConfig::tiny(VOCAB_SIZE);
    let model = OptModel::random(&config, 2024);

    fs::write(
        dir.join("config.json"),
        serde_json::to_string_pretty(&config).unwrap(),
    )
    .unwrap();

    let tensors: Vec<(String, Vec<u8>, Vec<usize>)> = model
        .named_parameters()
        .into_iter()
        .map(|(name, t)| {
            let bytes = t.data.iter().flat_map(|v| v.to_le_bytes()).collect();
            (name, bytes, t.shape.clone())
        })
        .collect();
    let views: Vec<(&str, TensorView<'_>)> = tensors
        .iter()
        .map(|(name, bytes, shape)| {
            (
                name.as_str(),
                TensorView::new(Dtype::F32, shape.clone(), bytes).unwrap(),
            )
        })
        .collect();
    let bytes = safetensors::tensor::serialize(views, &None).unwrap();
    fs::write(dir.join("model.safetensors"), bytes).unwrap();

    fs::write(
        dir.join("vocab.json"),
        r#"{"</s>": 2, "h": 10, "i": 11, "hi": 12, "Ġ": 13, "Ġhi": 15, "Ċ": 16}"#,
    )
    .unwrap();
    fs::write(dir.join("merges.txt"), "#version: 0.2\nh i\nĠ hi\n").unwrap();

    config
}

fn collector_config(output_dir: &Path, plots: bool) -> CollectorConfig {
    CollectorConfig {
        output_dir: output_dir.to_path_buf(),
        plots,
        ..CollectorConfig::default()
    }
}

#[test]
fn example_run_counts_every_layer() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_checkpoint(dir.path());
    let plots = dir.path().join("plots");

    let mut collector = run_module(
        dir.path().to_str().unwrap(),
        OptCollector::new(collector_config(&plots, true)),
        "hi hi hi",
    )
    .unwrap();

    // BOS + three words
    let tokens = 4u64;
    let layers = config.num_hidden_layers as u64;
    assert_eq!(
        collector.fc_sparsity().total,
        layers * tokens * config.ffn_dim as u64
    );
    assert_eq!(
        collector.attn_sparsity().total,
        layers * tokens * config.hidden_size as u64
    );
    assert!(collector.fc_sparsity().above <= collector.fc_sparsity().total);

    for name in [
        "model.decoder.layers.0.activation_fn.hist.svg",
        "model.decoder.layers.0.activation_fn.grid.svg",
        "model.decoder.layers.1.self_attn.out_proj.grid.svg",
    ] {
        assert!(plots.join(name).is_file(), "missing plot {name}");
    }

    print_report(&mut collector).unwrap();
    assert_eq!(collector.state(), CollectorState::Finalized);
}

#[test]
fn dataset_run_accumulates_over_batches() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_checkpoint(dir.path());

    let split_dir = dir.path().join("data").join("wikitext").join("wikitext-2-raw-v1");
    fs::create_dir_all(&split_dir).unwrap();
    fs::write(split_dir.join("wiki.test.raw"), "hi hi hi hi hi hi hi hi hi").unwrap();

    let log = dir.path().join("log.csv");
    let options = DatasetOptions {
        source: DataSource::Dir(dir.path().join("data")),
        seq_len: 4,
        batch_size: 2,
        max_batches: None,
        log_csv: Some(log.clone()),
    };
    let collector = run_module_dataset(
        dir.path().to_str().unwrap(),
        OptCollector::new(collector_config(&dir.path().join("plots"), false)),
        &DatasetSpec::default(),
        &options,
    )
    .unwrap();

    // BOS + nine words = 10 tokens: windows of 4, 4 and a trailing 2
    let tokens = 10u64;
    assert_eq!(
        collector.fc_sparsity().total,
        config.num_hidden_layers as u64 * tokens * config.ffn_dim as u64
    );

    let csv = fs::read_to_string(&log).unwrap();
    let rows: Vec<&str> = csv.lines().skip(1).collect();
    assert_eq!(rows.len(), 2);
    assert!(rows[1].starts_with("2,"));
    assert_eq!(rows[1].split(',').nth(2), Some("10"));
    assert!(!dir.path().join("plots").exists());
}

#[test]
fn missing_dataset_split_is_reported() {
    let dir = tempfile::tempdir().unwrap();
    write_checkpoint(dir.path());
    let options = DatasetOptions {
        source: DataSource::Dir(dir.path().join("nowhere")),
        ..DatasetOptions::default()
    };
    let result = run_module_dataset(
        dir.path().to_str().unwrap(),
        OptCollector::new(collector_config(dir.path(), false)),
        &DatasetSpec::default(),
        &options,
    );
    assert!(matches!(result, Err(opt_sparsity::Error::Dataset(_))));
}

#[test]
fn base_collector_records_without_counting() {
    let model = OptModel::random(&OptConfig::tiny(VOCAB_SIZE), 1);
    let mut collector = ModuleCollector::new(Plotter::new("unused", false));
    collector.register_hook(&model).unwrap();
    model.forward(&[vec![2, 12, 15]], &mut collector).unwrap();

    assert_eq!(collector.records().len(), model.named_modules().len());
    assert!(collector.summary().is_none());
    assert!(collector.finish().unwrap().is_none());
}
