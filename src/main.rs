//! OCTO-POLICY: readout-transformer diffusion policy
//!
//! CLI entry point: rolls the policy out on a synthetic point-reach task and
//! optionally evaluates the training loss on scripted demonstrations.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::Parser;
use ndarray::{arr2, s, stack, Array2, Array3, Array5, Axis};
use octo_policy::config::{ACTION, ACTION_IS_PAD, OBS_STATE};
use octo_policy::policy::FieldStats;
use octo_policy::{Batch, DatasetStats, DiffusionPolicy, PolicyConfig};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

/// Side length of the square workspace, in state units.
const WORKSPACE: f32 = 512.0;

/// Maximum distance the agent covers in one control step.
const MAX_SPEED: f32 = 24.0;

/// Radius of the rendered agent and goal blobs, in pixels.
const BLOB_RADIUS: f32 = 5.0;

/// OCTO-POLICY rollout CLI.
#[derive(Parser, Debug)]
#[command(
    name = "octo-policy",
    about = "Readout-transformer diffusion policy on a synthetic reach task",
    version
)]
struct Cli {
    /// Policy configuration (JSON). Defaults are used when omitted.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Dataset statistics (JSON). Estimated from the synthetic task when omitted.
    #[arg(short, long)]
    stats: Option<PathBuf>,

    /// Control steps per episode.
    #[arg(short = 'n', long, default_value_t = 24)]
    steps: usize,

    /// Number of episodes.
    #[arg(short, long, default_value_t = 1)]
    episodes: usize,

    /// Seed for the environment and, unless the config sets one, the policy.
    #[arg(long)]
    seed: Option<u64>,

    /// Also report the training loss on a batch of scripted demonstrations.
    #[arg(long, default_value_t = false)]
    loss: bool,

    /// Demonstrations per loss batch.
    #[arg(long, default_value_t = 4)]
    batch_size: usize,
}

/// A point agent that should reach a goal; observed as state + rendered image.
struct ReachEnv {
    agent: [f32; 2],
    goal: [f32; 2],
    image_key: String,
    image_shape: [usize; 3],
}

impl ReachEnv {
    fn new<R: Rng>(image_key: &str, image_shape: [usize; 3], rng: &mut R) -> Self {
        let mut env = Self {
            agent: [0.0; 2],
            goal: [0.0; 2],
            image_key: image_key.to_string(),
            image_shape,
        };
        env.reset(rng);
        env
    }

    fn reset<R: Rng>(&mut self, rng: &mut R) {
        self.agent = [rng.gen_range(0.0..WORKSPACE), rng.gen_range(0.0..WORKSPACE)];
        self.goal = [rng.gen_range(0.0..WORKSPACE), rng.gen_range(0.0..WORKSPACE)];
    }

    /// Move toward `target`, capped at `MAX_SPEED`. Returns the remaining distance.
    fn step(&mut self, target: [f32; 2]) -> f32 {
        self.agent = toward(self.agent, target);
        self.distance()
    }

    fn distance(&self) -> f32 {
        let dx = self.goal[0] - self.agent[0];
        let dy = self.goal[1] - self.agent[1];
        (dx * dx + dy * dy).sqrt()
    }

    /// Agent blob in channel 0, goal blob in channel 1, a vertical ramp in channel 2.
    fn render(&self) -> Array3<f32> {
        let [channels, height, width] = self.image_shape;
        let to_px = |p: [f32; 2]| [p[0] / WORKSPACE * width as f32, p[1] / WORKSPACE * height as f32];
        let agent = to_px(self.agent);
        let goal = to_px(self.goal);
        Array3::from_shape_fn((channels, height, width), |(c, y, x)| {
            let blob = |p: [f32; 2]| {
                let d2 = (x as f32 - p[0]).powi(2) + (y as f32 - p[1]).powi(2);
                if d2 <= BLOB_RADIUS * BLOB_RADIUS {
                    1.0
                } else {
                    0.0
                }
            };
            match c {
                0 => blob(agent),
                1 => blob(goal),
                _ => y as f32 / height.max(1) as f32,
            }
        })
    }

    fn observation(&self) -> Batch {
        Batch::new()
            .with(OBS_STATE, arr2(&[self.agent]))
            .with(self.image_key.as_str(), self.render().insert_axis(Axis(0)))
    }

    /// Straight-line expert trajectory of `horizon` waypoints.
    fn expert_trajectory(&self, horizon: usize) -> Array2<f32> {
        let mut agent = self.agent;
        let mut traj = Array2::zeros((horizon, 2));
        for mut row in traj.axis_iter_mut(Axis(0)) {
            agent = toward(agent, self.goal);
            row[0] = agent[0];
            row[1] = agent[1];
        }
        traj
    }
}

/// One capped move from `from` toward `target`, clamped to the workspace.
fn toward(from: [f32; 2], target: [f32; 2]) -> [f32; 2] {
    let dx = target[0] - from[0];
    let dy = target[1] - from[1];
    let dist = (dx * dx + dy * dy).sqrt();
    let scale = if dist > MAX_SPEED { MAX_SPEED / dist } else { 1.0 };
    [
        (from[0] + dx * scale).clamp(0.0, WORKSPACE),
        (from[1] + dy * scale).clamp(0.0, WORKSPACE),
    ]
}

/// Statistics of the synthetic task: workspace bounds for state and action,
/// per-channel moments of rendered frames for the image.
fn synthetic_stats(config: &PolicyConfig, image_shape: [usize; 3], rng: &mut StdRng) -> Result<DatasetStats> {
    let image_key = config.image_key()?;
    let frames: Vec<Array3<f32>> = (0..16)
        .map(|_| ReachEnv::new(image_key, image_shape, rng).render())
        .collect();
    let views: Vec<_> = frames.iter().map(|f| f.view()).collect();
    let stacked = stack(Axis(0), &views)?.into_dyn();

    let bounds = |dim: usize| FieldStats {
        min: vec![0.0; dim],
        max: vec![WORKSPACE; dim],
        mean: vec![WORKSPACE / 2.0; dim],
        std: vec![WORKSPACE / 12f32.sqrt(); dim],
    };
    let mut stats = DatasetStats::default();
    stats.insert(image_key, FieldStats::from_samples(&stacked, 1));
    stats.insert(OBS_STATE, bounds(config.state_dim()?));
    stats.insert(ACTION, bounds(config.action_dim()?));
    Ok(stats)
}

/// Demonstration batch: observation windows plus the expert's future waypoints.
fn demonstration_batch(
    config: &PolicyConfig,
    image_shape: [usize; 3],
    batch_size: usize,
    rng: &mut StdRng,
) -> Result<Batch> {
    let image_key = config.image_key()?;
    let [c, h, w] = image_shape;
    let n_obs = config.n_obs_steps;
    let mut state = Array3::zeros((batch_size, n_obs, 2));
    let mut image = Array5::zeros((batch_size, n_obs, c, h, w));
    let mut action = Array3::zeros((batch_size, config.horizon, 2));

    for b in 0..batch_size {
        let mut env = ReachEnv::new(image_key, image_shape, rng);
        // Trajectory starts at the oldest observation in the window.
        action
            .index_axis_mut(Axis(0), b)
            .assign(&env.expert_trajectory(config.horizon));
        for t in 0..n_obs {
            state[[b, t, 0]] = env.agent[0];
            state[[b, t, 1]] = env.agent[1];
            image.slice_mut(s![b, t, .., .., ..]).assign(&env.render());
            env.step(env.goal);
        }
    }

    Ok(Batch::new()
        .with(OBS_STATE, state)
        .with(image_key, image)
        .with(ACTION, action)
        .with_mask(ACTION_IS_PAD, Array2::from_elem((batch_size, config.horizon), false)))
}

fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let cli = Cli::parse();
    tracing::info!("OCTO-POLICY v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &cli.config {
        Some(path) => PolicyConfig::from_json_file(path)
            .with_context(|| format!("loading policy config from {}", path.display()))?,
        None => PolicyConfig::default(),
    };
    if config.seed.is_none() {
        config.seed = cli.seed;
    }
    config.validate().context("invalid policy config")?;

    let image_shape: [usize; 3] = config
        .image_shape()?
        .try_into()
        .context("image shape must be [channels, height, width]")?;
    if config.state_dim()? != 2 || config.action_dim()? != 2 {
        anyhow::bail!("the reach task needs 2-D state and action fields");
    }

    let mut env_rng = match cli.seed {
        Some(seed) => StdRng::seed_from_u64(seed.wrapping_add(1)),
        None => StdRng::from_entropy(),
    };
    let stats = match &cli.stats {
        Some(path) => DatasetStats::from_json_file(path)
            .with_context(|| format!("loading dataset stats from {}", path.display()))?,
        None => synthetic_stats(&config, image_shape, &mut env_rng)?,
    };

    tracing::info!(
        "Config: horizon={}, n_obs_steps={}, n_action_steps={}, scheduler={}, inference_steps={}",
        config.horizon,
        config.n_obs_steps,
        config.n_action_steps,
        config.noise_scheduler_type,
        config.num_inference_steps(),
    );

    let mut policy = DiffusionPolicy::new(config.clone(), &stats).context("building policy")?;
    tracing::info!("Parameters: {}", policy.param_count());

    let mut env = ReachEnv::new(config.image_key()?, image_shape, &mut env_rng);
    for episode in 0..cli.episodes {
        env.reset(&mut env_rng);
        policy.reset();
        let initial = env.distance();
        let mut distance = initial;
        for step in 0..cli.steps {
            let action = policy
                .select_action(&env.observation())
                .with_context(|| format!("episode {episode}, step {step}"))?;
            distance = env.step([action[[0, 0]], action[[0, 1]]]);
            tracing::debug!(episode, step, x = env.agent[0], y = env.agent[1], distance, "step");
        }
        tracing::info!(
            "Episode {}: distance to goal {:.1} -> {:.1} ({} steps)",
            episode,
            initial,
            distance,
            cli.steps,
        );
    }

    let counters = policy.stats();
    tracing::info!(
        "Model invocations: {} for {} actions",
        counters.model_invocations,
        counters.actions_served,
    );

    if cli.loss {
        let batch = demonstration_batch(&config, image_shape, cli.batch_size, &mut env_rng)?;
        policy.set_training(true);
        let loss = policy.forward(&batch).context("computing demonstration loss")?;
        policy.set_training(false);
        tracing::info!("Demonstration loss ({} samples): {:.4}", cli.batch_size, loss);
    }

    tracing::info!("Done.");
    Ok(())
}
