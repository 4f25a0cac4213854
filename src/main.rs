//! knn-engine CLI
//!
//! # Usage
//!
//! ```bash
//! # Build a segment graph from a JSON list of vectors
//! knn-engine build --input vectors.json --data-dir ./knn_data --index docs --segment s0
//!
//! # Same, partitioned with a freshly trained IVF model
//! knn-engine build --input vectors.json --data-dir ./knn_data --index docs --segment s0 --nlist 16
//!
//! # Warm the cache for an index and query it
//! knn-engine search --data-dir ./knn_data --index docs --query 0.1,0.2,0.3 -k 5
//!
//! # Train a byte scalar quantizer and write its state
//! knn-engine quantize --input vectors.json --output docs.sq8
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use clap::{Parser, Subcommand};
use serde::Serialize;
use tracing_subscriber::EnvFilter;

use knn_core::{ByteScalarQuantizer, Quantizer, SpaceType};
use knn_engine::config::{parse_capacity, total_memory_bytes};
use knn_engine::{
    CacheKey, DirectoryCatalog, EngineConfig, InMemoryTrainingData, KnnNode, ModelState,
    NodeStats, TrainingJob, TrainingMethod,
};
use knn_native::{ArenaLibrary, BuildParams, IndexMethod, NativeLibrary};

#[derive(Parser)]
#[command(name = "knn-engine")]
#[command(about = "Native k-NN graph cache, quantization and training")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build a segment graph from a JSON list of vectors
    ///
    /// Input format: JSON array of arrays [[0.1, ...], [0.2, ...]]; document
    /// ids are the array positions.
    Build {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(long, default_value = "knn_data")]
        data_dir: PathBuf,

        #[arg(long)]
        index: String,

        #[arg(long, default_value = "s0")]
        segment: String,

        /// l1, l2, linf, innerproduct or cosinesimil
        #[arg(long, default_value = "l2")]
        space: SpaceType,

        /// Train an IVF model with this many partitions and build with it
        #[arg(long)]
        nlist: Option<usize>,

        #[arg(long, default_value = "1")]
        nprobe: usize,
    },

    /// Warm the cache for an index and run one query against it
    Search {
        #[arg(long, default_value = "knn_data")]
        data_dir: PathBuf,

        #[arg(long)]
        index: String,

        /// Query vector (comma separated floats)
        #[arg(short, long, value_delimiter = ',', allow_hyphen_values = true, required = true)]
        query: Vec<f32>,

        #[arg(short = 'k', long, default_value = "10")]
        k: usize,

        /// Cache capacity, e.g. 512mb or 50% of physical memory
        #[arg(long)]
        capacity: Option<String>,
    },

    /// Train a byte scalar quantizer and write its serialized state
    Quantize {
        #[arg(short, long)]
        input: PathBuf,

        #[arg(short, long)]
        output: PathBuf,

        #[arg(long)]
        sample_size: Option<usize>,

        #[arg(long, default_value = "42")]
        seed: u64,
    },
}

#[derive(Serialize)]
struct SearchReport {
    hits: Vec<Hit>,
    took_ms: f64,
    stats: NodeStats,
}

#[derive(Serialize)]
struct Hit {
    id: u32,
    score: f32,
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Build {
            input,
            data_dir,
            index,
            segment,
            space,
            nlist,
            nprobe,
        } => {
            let vectors = read_vectors(&input)?;
            let dimension = vectors[0].len();
            let node = start_node(data_dir, None)?;

            let (method, template) = match nlist {
                Some(nlist) => {
                    let model_id = format!("{index}-{segment}-ivf");
                    let blob = train_ivf(&node, &model_id, space, nlist, nprobe, &vectors)?;
                    (IndexMethod::Ivf { nlist, nprobe }, Some(blob))
                }
                None => (IndexMethod::Flat, None),
            };

            let catalog =
                DirectoryCatalog::new(node.config().data_dir.clone(), Arc::clone(node.library()));
            let ids: Vec<u32> = (0..vectors.len() as u32).collect();
            let params = BuildParams {
                method,
                space,
                dimension,
            };
            let path = catalog.build_graph(
                &CacheKey::new(&index, &segment),
                &params,
                &ids,
                &vectors,
                template.as_deref(),
            )?;
            tracing::info!("Wrote graph to {:?}", path);
            println!("{}", path.display());
        }

        Commands::Search {
            data_dir,
            index,
            query,
            k,
            capacity,
        } => {
            let node = start_node(data_dir, capacity.as_deref())?;
            node.warmup(&[index.as_str()])?;

            let start = Instant::now();
            let hits = node.search(&index, &query, k, None)?;
            let took_ms = start.elapsed().as_secs_f64() * 1000.0;

            let report = SearchReport {
                hits: hits.into_iter().map(|(id, score)| Hit { id, score }).collect(),
                took_ms,
                stats: node.stats(),
            };
            println!("{}", serde_json::to_string_pretty(&report)?);
            node.shutdown();
        }

        Commands::Quantize {
            input,
            output,
            sample_size,
            seed,
        } => {
            let vectors = read_vectors(&input)?;
            let quantizer = ByteScalarQuantizer::new(
                sample_size.unwrap_or(knn_core::quantization::DEFAULT_SAMPLE_SIZE),
                seed,
            );
            let state = quantizer.train(&vectors)?;
            let bytes = state.to_bytes();
            std::fs::write(&output, &bytes)
                .with_context(|| format!("writing {}", output.display()))?;
            tracing::info!(
                "Trained sq8 state over {} vectors of dimension {}",
                vectors.len(),
                state.dimension()
            );
            println!("{}", output.display());
        }
    }

    Ok(())
}

fn start_node(data_dir: PathBuf, capacity: Option<&str>) -> anyhow::Result<KnnNode> {
    let mut config = EngineConfig {
        data_dir: data_dir.clone(),
        model_dir: Some(data_dir.join("models")),
        ..EngineConfig::from_env()?
    };
    if let Some(capacity) = capacity {
        config.cache_capacity_bytes = parse_capacity(capacity, total_memory_bytes())?;
    }
    let library: Arc<dyn NativeLibrary> = Arc::new(ArenaLibrary::new());
    Ok(KnnNode::initialize(config, library)?)
}

fn train_ivf(
    node: &KnnNode,
    model_id: &str,
    space: SpaceType,
    nlist: usize,
    nprobe: usize,
    vectors: &[Vec<f32>],
) -> anyhow::Result<Vec<u8>> {
    if node.get_model(model_id).is_some() {
        node.delete_model(model_id)?;
    }
    let dimension = vectors[0].len();
    let job = TrainingJob {
        model_id: model_id.to_string(),
        method: TrainingMethod::Ivf { nlist, nprobe },
        space_type: space,
        dimension,
        max_vectors: vectors.len(),
        description: "trained by knn-engine build".to_string(),
        data: Arc::new(InMemoryTrainingData::new(dimension, vectors.to_vec())?),
    };
    let outcome = node.train_model(job, None)?.wait()?;
    if outcome.state != ModelState::Created {
        anyhow::bail!(
            "training {} failed: {}",
            model_id,
            outcome.error.unwrap_or_default()
        );
    }
    Ok(node.registry().build_template(model_id)?)
}

fn read_vectors(path: &Path) -> anyhow::Result<Vec<Vec<f32>>> {
    let file =
        std::fs::File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let vectors: Vec<Vec<f32>> = serde_json::from_reader(std::io::BufReader::new(file))
        .with_context(|| format!("parsing {}", path.display()))?;

    let Some(first) = vectors.first() else {
        anyhow::bail!("No vectors found in input");
    };
    let dim = first.len();
    if dim == 0 {
        anyhow::bail!("Vectors must have at least one dimension");
    }
    for (i, v) in vectors.iter().enumerate() {
        if v.len() != dim {
            anyhow::bail!("Vector {} has dimension {}, expected {}", i, v.len(), dim);
        }
    }
    tracing::info!("Read {} vectors of dimension {}", vectors.len(), dim);
    Ok(vectors)
}
