mod config;

use std::sync::Arc;

use anyhow::Result;
use elastic::{
    Context, ModelState, State, Tracked,
    collective::TcpGroup,
    memory::{MemFramework, MemModel, MemOptimizer, MemVariable},
};
use log::info;
use rand::Rng;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;

const BATCHES_PER_EPOCH: usize = 50;
const BATCH_SIZE: usize = 16;
const LEARNING_RATE: f32 = 0.05;
const MOMENTUM: f32 = 0.9;

/// Where the training loop resumes after a reset.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct Progress {
    epoch: usize,
    batch: usize,
}

/// A linear model `y = w * x + b` fitted with momentum SGD.
struct Line {
    weight: Arc<MemVariable>,
    bias: Arc<MemVariable>,
    velocity: Arc<MemVariable>,
}

impl Line {
    /// Creates the parameters at a random starting point, different on every rank.
    fn new(rng: &mut impl Rng) -> Self {
        Self {
            weight: MemVariable::from_vec("line/w", vec![rng.random_range(-1.0..1.0)]),
            bias: MemVariable::from_vec("line/b", vec![rng.random_range(-1.0..1.0)]),
            velocity: MemVariable::zeros("sgd/velocity", &[2]),
        }
    }

    /// The model view of the parameters, compiled with the velocity slot.
    fn model(&self) -> Arc<MemModel> {
        let model = MemModel::new("line", vec![self.weight.clone(), self.bias.clone()]);
        model.compile(MemOptimizer::new(vec![self.velocity.clone()]));
        model
    }

    /// Runs one step on a fresh batch of `y = 3x + 1` samples.
    ///
    /// # Returns
    /// The mean squared error before the step.
    fn step(&self, rng: &mut impl Rng) -> f32 {
        let w = self.weight.to_vec()[0];
        let b = self.bias.to_vec()[0];

        let (mut dw, mut db, mut loss) = (0.0, 0.0, 0.0);
        for _ in 0..BATCH_SIZE {
            let x: f32 = rng.random_range(-2.0..2.0);
            let err = w * x + b - (3.0 * x + 1.0);
            dw += 2.0 * err * x;
            db += 2.0 * err;
            loss += err * err;
        }

        let n = BATCH_SIZE as f32;
        self.velocity.update(|v| {
            v[0] = MOMENTUM * v[0] + dw / n;
            v[1] = MOMENTUM * v[1] + db / n;
        });

        let v = self.velocity.to_vec();
        self.weight.update(|w| w[0] -= LEARNING_RATE * v[0]);
        self.bias.update(|b| b[0] -= LEARNING_RATE * v[1]);

        loss / n
    }
}

fn train(
    state: &mut ModelState,
    line: &Line,
    progress: &Tracked<Progress>,
    config: &NodeConfig,
) -> elastic::Result<f32> {
    let mut rng = rand::rng();
    let mut loss = f32::NAN;

    while progress.read().epoch < config.epochs() {
        while progress.read().batch < BATCHES_PER_EPOCH {
            loss = line.step(&mut rng);

            let batch = {
                let mut progress = progress.write();
                progress.batch += 1;
                progress.batch
            };

            if batch % config.commit_every() == 0 {
                state.commit()?;
            }
        }

        let epoch = {
            let mut progress = progress.write();
            progress.epoch += 1;
            progress.batch = 0;
            progress.epoch
        };

        info!(rank = config.rank(), epoch = epoch; "epoch done, loss {loss:.5}");
        state.commit()?;
    }

    Ok(loss)
}

fn main() -> Result<()> {
    env_logger::init();

    let config = NodeConfig::from_env()?;
    let group = TcpGroup::connect(&config.group())?;
    let ctx = Context::new(Arc::new(group), MemFramework::eager());

    let line = Line::new(&mut rand::rng());
    let progress = Tracked::new(Progress::default());
    let mut state = ModelState::builder(ctx.clone(), line.model())
        .track(progress.attribute("progress"))
        .build()?;

    let loss = elastic::run_with(
        &config.run(),
        &mut state,
        |state| train(state, &line, &progress, &config),
        || {
            info!(rank = config.rank(); "re-forming group");
            let group = TcpGroup::connect(&config.group())?;
            ctx.replace_collective(Arc::new(group));
            Ok(())
        },
    )?;

    info!(
        rank = config.rank(),
        w = line.weight.to_vec()[0],
        b = line.bias.to_vec()[0];
        "training finished, loss {loss:.5}"
    );

    Ok(())
}
