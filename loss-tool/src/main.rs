use anyhow::{ensure, format_err, Context, Result};
use clap::Parser;
use log::info;
use multibox_loss::{Config, GroundTruth, MultiBoxLoss, MultiBoxPrediction};
use prettytable::{cell, row, Table};
use std::path::{Path, PathBuf};
use tch::Tensor;

#[derive(Debug, Clone, Parser)]
enum Opts {
    /// Print the anchor assignment of each image.
    Match {
        /// configuration file
        #[clap(long)]
        config: PathBuf,
        /// JSON file of [cx, cy, w, h] priors
        #[clap(long)]
        priors: PathBuf,
        /// JSON file of per-image [xmin, ymin, xmax, ymax, label] lists
        #[clap(long)]
        ground_truth: PathBuf,
    },
    /// Evaluate the loss on saved predictions.
    Loss {
        /// configuration file
        #[clap(long)]
        config: PathBuf,
        /// JSON file of [cx, cy, w, h] priors
        #[clap(long)]
        priors: PathBuf,
        /// JSON file of per-image [xmin, ymin, xmax, ymax, label] lists
        #[clap(long)]
        ground_truth: PathBuf,
        /// file with "loc" and "conf" tensors saved by Tensor::save_multi
        #[clap(long)]
        predictions: PathBuf,
    },
}

fn main() -> Result<()> {
    pretty_env_logger::init();

    match Opts::parse() {
        Opts::Match {
            config,
            priors,
            ground_truth,
        } => {
            match_anchors(config, priors, ground_truth)?;
        }
        Opts::Loss {
            config,
            priors,
            ground_truth,
            predictions,
        } => {
            compute_loss(config, priors, ground_truth, predictions)?;
        }
    }

    Ok(())
}

fn match_anchors(
    config_file: impl AsRef<Path>,
    priors_file: impl AsRef<Path>,
    ground_truth_file: impl AsRef<Path>,
) -> Result<()> {
    let loss_fn = load_loss(config_file, priors_file)?;
    let ground_truths = load_ground_truths(ground_truth_file)?;
    let targets = loss_fn.match_targets(&ground_truths)?;

    let mut table = Table::new();
    table.add_row(row![
        "image", "objects", "positive", "negative", "ignored", "forced"
    ]);

    ground_truths
        .iter()
        .zip(targets.image_summaries())
        .enumerate()
        .for_each(|(index, (ground_truth, summary))| {
            table.add_row(row![
                index,
                ground_truth.num_objects(),
                summary.positive,
                summary.negative,
                summary.ignored,
                summary.forced,
            ]);
        });

    let total = targets.summary();
    table.add_row(row![
        "total",
        ground_truths
            .iter()
            .map(|ground_truth| ground_truth.num_objects())
            .sum::<i64>(),
        total.positive,
        total.negative,
        total.ignored,
        total.forced,
    ]);

    table.printstd();
    Ok(())
}

fn compute_loss(
    config_file: impl AsRef<Path>,
    priors_file: impl AsRef<Path>,
    ground_truth_file: impl AsRef<Path>,
    predictions_file: impl AsRef<Path>,
) -> Result<()> {
    let loss_fn = load_loss(config_file, priors_file)?;
    let ground_truths = load_ground_truths(ground_truth_file)?;

    let prediction = {
        let path = predictions_file.as_ref();
        let tensors = Tensor::load_multi(path)
            .with_context(|| format!("unable to load predictions from {}", path.display()))?;
        let take = |name: &str| -> Result<Tensor> {
            let (_, tensor) = tensors
                .iter()
                .find(|(key, _)| key == name)
                .ok_or_else(|| format_err!("the tensor '{}' is missing in {}", name, path.display()))?;
            Ok(tensor.to_device(*loss_fn.device()))
        };
        MultiBoxPrediction::new(take("loc")?, take("conf")?)?
    };
    info!(
        "loaded predictions of {} images with {} priors and {} classes",
        prediction.batch_size(),
        prediction.num_priors(),
        prediction.num_classes()
    );

    let output = tch::no_grad(|| loss_fn.forward(&prediction, &ground_truths))?;

    let mut table = Table::new();
    table.add_row(row!["loss", "value"]);
    table.add_row(row!["loc_loss", output.loc_loss.double_value(&[])]);
    table.add_row(row!["cls_loss", output.cls_loss.double_value(&[])]);
    table.printstd();

    Ok(())
}

fn load_loss(config_file: impl AsRef<Path>, priors_file: impl AsRef<Path>) -> Result<MultiBoxLoss> {
    let config = Config::open(config_file)?;

    let priors = {
        let path = priors_file.as_ref();
        let text = std::fs::read_to_string(path)?;
        let rows: Vec<[f32; 4]> = serde_json::from_str(&text)
            .with_context(|| format!("unable to parse priors file {}", path.display()))?;
        ensure!(!rows.is_empty(), "no priors found in {}", path.display());
        Tensor::of_slice(&rows.concat()).view([rows.len() as i64, 4])
    };

    let loss_fn = config.loss.multibox_loss_init(config.device).build(&priors)?;
    info!(
        "built loss with {} priors and {} classes",
        loss_fn.num_priors(),
        loss_fn.num_classes()
    );
    Ok(loss_fn)
}

fn load_ground_truths(path: impl AsRef<Path>) -> Result<Vec<GroundTruth>> {
    let path = path.as_ref();
    let text = std::fs::read_to_string(path)?;
    let images: Vec<Vec<[f32; 5]>> = serde_json::from_str(&text)
        .with_context(|| format!("unable to parse ground truth file {}", path.display()))?;

    images
        .iter()
        .enumerate()
        .map(|(index, rows)| {
            GroundTruth::from_rows(rows)
                .with_context(|| format!("invalid ground truth of image {}", index))
        })
        .collect()
}
