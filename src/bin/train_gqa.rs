//! Train the baseline GQA network from a JSON experiment configuration
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use candle_nn::VarMap;
use clap::Parser;

use gqa_trainer::data::{BatchSource, NpyQaDataset, NpyQaLoader, Vocab};
use gqa_trainer::models::loader::{build_model, seed_question_embeddings};
use gqa_trainer::training::{AccuracyValidator, Trainer, TrainingConfig};
use gqa_trainer::utils::{count_parameters, describe_parameters, init_logging};
use gqa_trainer::{ComputeContext, ExperimentConfig, ModelArgs};

/// Train a question answering model on GQA features
#[derive(Parser, Debug)]
#[command(name = "train_gqa", version, about)]
struct Args {
    /// Experiment configuration (JSON)
    #[arg(long, default_value = "configs/gqa.json")]
    cfg: PathBuf,

    /// Resume from the experiment checkpoint
    #[arg(long)]
    restore: bool,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let result = train(&args);
    if let Err(e) = &result {
        log::error!("training failed: {:#}", e);
    }
    result
}

fn train(args: &Args) -> anyhow::Result<()> {
    let mut config = ExperimentConfig::from_file(&args.cfg)
        .with_context(|| format!("loading {}", args.cfg.display()))?;
    config.train.restore |= args.restore;

    let layout = config.layout();
    layout.prepare(config.train.restore)?;
    init_logging(layout.log_file())?;

    log::info!("=== {} ===", config.exp_name);
    log::info!("Configuration: {:#?}", config);

    let ctx = ComputeContext::from_config(&config)?;

    // Data
    let vocab = Vocab::from_file(config.vocab_path())?;
    log::info!(
        "vocabulary: {} question tokens, {} answers",
        vocab.num_question_tokens(),
        vocab.num_answers()
    );

    let train_set = Arc::new(NpyQaDataset::from_directory(config.train_split_dir(), &vocab)?);
    let val_set = Arc::new(NpyQaDataset::from_directory(config.val_split_dir(), &vocab)?);
    log::info!("train examples: {}, val examples: {}", train_set.len(), val_set.len());

    if train_set.vision_dim() != config.train.vision_dim {
        anyhow::bail!(
            "object features have {} channels, config says vision_dim = {}",
            train_set.vision_dim(),
            config.train.vision_dim
        );
    }

    let mut train_loader = NpyQaLoader::new(
        train_set.clone(),
        config.train.batch_size,
        true,
        config.seed,
        config.num_workers,
        config.train.train_num,
    );
    let val_loader = NpyQaLoader::new(
        val_set,
        config.train.batch_size,
        false,
        config.seed,
        config.num_workers,
        config.val.val_num,
    );
    log::info!(
        "train batches: {}, val batches: {}",
        train_loader.num_batches(),
        val_loader.num_batches()
    );

    // Model
    let model_args = ModelArgs {
        img_size: config.train.vision_dim,
        spatial_dim: train_set.spatial_dim(),
        max_step: config.train.net_length,
        hidden_size: config.train.hidden_size,
    };
    let mut varmap = VarMap::new();
    let model = build_model(&model_args, &vocab, &varmap, &ctx)?;
    if config.train.glove {
        let path = config
            .glove_path()
            .context("train.glove is set but dataset.glove_npy is missing")?;
        seed_question_embeddings(&mut varmap, path, &ctx)?;
    }
    log::info!("Model arguments: {:?}", model_args);
    log::info!("Model parameters:\n{}", describe_parameters(&varmap)?);
    log::info!(
        "Parameters: {:.2}M",
        count_parameters(&varmap) as f64 / 1_000_000.0
    );

    // Training
    let mut trainer = Trainer::new(
        model,
        varmap,
        model_args,
        TrainingConfig::from_experiment(&config),
        ctx,
    )?;
    if config.train.restore {
        trainer.restore()?;
    }

    let mut validator = AccuracyValidator::new(val_loader);
    let best = trainer.run(&mut train_loader, Some(&mut validator))?;
    log::info!("best validation accuracy: {:.4}", best);

    Ok(())
}
