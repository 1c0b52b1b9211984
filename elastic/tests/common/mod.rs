#![allow(dead_code)]

use std::{num::NonZeroUsize, sync::Arc, thread};

use elastic::{
    Collective, CollectiveRef, Context,
    collective::{LocalCollective, LocalGroup},
    framework::{FrameworkRef, Tensor},
    memory::{MemFramework, MemModel, MemOptimizer, MemVariable},
};
use ndarray::arr1;

/// Runs `f` on one thread per rank of a fresh in-process group and collects the
/// results, indexed by rank.
pub fn on_each_rank<T, F>(size: usize, f: F) -> Vec<T>
where
    T: Send,
    F: Fn(LocalCollective) -> T + Sync,
{
    let group = LocalGroup::new(NonZeroUsize::new(size).unwrap());

    thread::scope(|s| {
        let handles: Vec<_> = group
            .into_iter()
            .map(|collective| {
                let f = &f;
                s.spawn(move || f(collective))
            })
            .collect();

        handles.into_iter().map(|h| h.join().unwrap()).collect()
    })
}

pub fn context<C>(collective: C, framework: FrameworkRef) -> Arc<Context>
where
    C: Collective + 'static,
{
    Context::new(Arc::new(collective) as CollectiveRef, framework)
}

pub fn eager_context<C>(collective: C) -> Arc<Context>
where
    C: Collective + 'static,
{
    context(collective, MemFramework::eager())
}

/// A context for a group of one.
pub fn solo() -> Arc<Context> {
    let collective = LocalGroup::new(NonZeroUsize::MIN).remove(0);
    eager_context(collective)
}

pub fn tensor(values: &[f32]) -> Tensor {
    arr1(values).into_dyn()
}

/// A compiled two-parameter model with a single optimizer slot.
pub struct Net {
    pub model: Arc<MemModel>,
    pub weight: Arc<MemVariable>,
    pub bias: Arc<MemVariable>,
    pub optimizer: Arc<MemOptimizer>,
    pub moment: Arc<MemVariable>,
}

impl Net {
    pub fn new(weight: &[f32], bias: f32, moment: &[f32]) -> Self {
        let weight = MemVariable::from_vec("dense/kernel", weight.to_vec());
        let bias = MemVariable::from_vec("dense/bias", vec![bias]);
        let moment = MemVariable::from_vec("adam/m", moment.to_vec());

        let model = MemModel::new("net", vec![weight.clone(), bias.clone()]);
        let optimizer = MemOptimizer::new(vec![moment.clone()]);
        model.compile(optimizer.clone());

        Self {
            model,
            weight,
            bias,
            optimizer,
            moment,
        }
    }

    /// Pretends a training step changed every value.
    pub fn step(&self, delta: f32) {
        self.weight.update(|w| *w += delta);
        self.bias.update(|b| *b += delta);
        self.moment.update(|m| *m += delta);
    }
}
