//! An in-process framework whose variables are plain arrays behind locks.
//!
//! Graph mode is simulated: reads and writes through a session behave like their
//! eager counterparts, but deferred broadcasts only take effect once a session runs
//! them.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use ndarray::{Array1, ArrayD, IxDyn};
use parking_lot::RwLock;

use crate::{
    Result, StateErr,
    framework::{
        Backend, BroadcastOp, Framework, Model, Optimizer, OptimizerRef, Session, SessionRef,
        Tensor, Variable, VariableRef, check_shape,
    },
};

/// A variable holding its value in memory.
#[derive(Debug)]
pub struct MemVariable {
    name: String,
    shape: Vec<usize>,
    value: RwLock<Tensor>,
    loads: AtomicUsize,
}

impl MemVariable {
    pub fn new(name: impl Into<String>, value: Tensor) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            shape: value.shape().to_vec(),
            value: RwLock::new(value),
            loads: AtomicUsize::new(0),
        })
    }

    /// A one dimensional variable.
    pub fn from_vec(name: impl Into<String>, values: Vec<f32>) -> Arc<Self> {
        Self::new(name, Array1::from(values).into_dyn())
    }

    pub fn zeros(name: impl Into<String>, shape: &[usize]) -> Arc<Self> {
        Self::new(name, ArrayD::zeros(IxDyn(shape)))
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn value(&self) -> Tensor {
        self.value.read().clone()
    }

    /// The values in logical order.
    pub fn to_vec(&self) -> Vec<f32> {
        self.value.read().iter().copied().collect()
    }

    /// How many writes went through a session.
    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::Relaxed)
    }

    /// Mutates the value in place, as a training step would.
    pub fn update<F: FnOnce(&mut Tensor)>(&self, f: F) {
        f(&mut self.value.write());
    }

    fn write(&self, value: &Tensor) -> Result<()> {
        check_shape(&self.name, value, &self.shape)?;
        self.value.write().assign(value);
        Ok(())
    }
}

impl Variable for MemVariable {
    fn name(&self) -> &str {
        &self.name
    }

    fn numpy(&self) -> Result<Tensor> {
        Ok(self.value())
    }

    fn eval(&self, _session: &dyn Session) -> Result<Tensor> {
        Ok(self.value())
    }

    fn assign(&self, value: &Tensor) -> Result<()> {
        self.write(value)
    }

    fn load(&self, value: &Tensor, _session: &dyn Session) -> Result<()> {
        self.write(value)?;
        self.loads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

/// A session that executes ops on the calling thread and counts them.
#[derive(Debug, Default)]
pub struct MemSession {
    runs: AtomicUsize,
}

impl MemSession {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// How many ops ran in this session.
    pub fn runs(&self) -> usize {
        self.runs.load(Ordering::Relaxed)
    }
}

impl Session for MemSession {
    fn run(&self, op: BroadcastOp) -> Result<()> {
        self.runs.fetch_add(1, Ordering::Relaxed);
        op.execute(self)
    }
}

/// Reads every variable's value.
fn get_all(variables: &[Arc<MemVariable>]) -> Vec<Tensor> {
    variables.iter().map(|var| var.value()).collect()
}

/// Writes `weights` into `variables`, all or nothing.
fn set_all(what: &'static str, variables: &[Arc<MemVariable>], weights: &[Tensor]) -> Result<()> {
    if weights.len() != variables.len() {
        return Err(StateErr::LengthMismatch {
            what,
            got: weights.len(),
            expected: variables.len(),
        });
    }

    for (var, value) in variables.iter().zip(weights) {
        check_shape(&var.name, value, &var.shape)?;
    }

    for (var, value) in variables.iter().zip(weights) {
        var.write(value)?;
    }

    Ok(())
}

fn as_refs(variables: &[Arc<MemVariable>]) -> Vec<VariableRef> {
    variables
        .iter()
        .map(|var| Arc::clone(var) as VariableRef)
        .collect()
}

/// An optimizer whose state is a list of slot variables.
#[derive(Debug)]
pub struct MemOptimizer {
    slots: Vec<Arc<MemVariable>>,
}

impl MemOptimizer {
    pub fn new(slots: Vec<Arc<MemVariable>>) -> Arc<Self> {
        Arc::new(Self { slots })
    }

    pub fn slots(&self) -> &[Arc<MemVariable>] {
        &self.slots
    }
}

impl Optimizer for MemOptimizer {
    fn get_weights(&self) -> Result<Vec<Tensor>> {
        Ok(get_all(&self.slots))
    }

    fn set_weights(&self, weights: &[Tensor]) -> Result<()> {
        set_all("optimizer weights", &self.slots, weights)
    }

    fn variables(&self) -> Vec<VariableRef> {
        as_refs(&self.slots)
    }
}

/// A model made of named parameter tensors, built once their shapes are known.
pub struct MemModel {
    name: String,
    layers: RwLock<Vec<Arc<MemVariable>>>,
    optimizer: RwLock<Option<OptimizerRef>>,
}

impl MemModel {
    /// A model whose parameters exist already.
    pub fn new(name: impl Into<String>, layers: Vec<Arc<MemVariable>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            layers: RwLock::new(layers),
            optimizer: RwLock::new(None),
        })
    }

    /// A model whose parameter shapes are still undetermined.
    pub fn unbuilt(name: impl Into<String>) -> Arc<Self> {
        Self::new(name, Vec::new())
    }

    /// Creates zero-initialized parameters with the given shapes.
    ///
    /// # Returns
    /// The created parameters, in order.
    pub fn build(&self, shapes: &[&[usize]]) -> Vec<Arc<MemVariable>> {
        let layers: Vec<_> = shapes
            .iter()
            .enumerate()
            .map(|(i, shape)| MemVariable::zeros(format!("{}/param_{i}", self.name), shape))
            .collect();

        *self.layers.write() = layers.clone();
        layers
    }

    /// Attaches the optimizer used when none is given explicitly.
    pub fn compile(&self, optimizer: OptimizerRef) {
        *self.optimizer.write() = Some(optimizer);
    }

    pub fn layers(&self) -> Vec<Arc<MemVariable>> {
        self.layers.read().clone()
    }
}

impl Model for MemModel {
    fn built(&self) -> bool {
        !self.layers.read().is_empty()
    }

    fn get_weights(&self) -> Result<Vec<Tensor>> {
        if !self.built() {
            return Err(StateErr::ModelNotBuilt);
        }

        Ok(get_all(&self.layers.read()))
    }

    fn set_weights(&self, weights: &[Tensor]) -> Result<()> {
        set_all("model weights", &self.layers.read(), weights)
    }

    fn variables(&self) -> Vec<VariableRef> {
        as_refs(&self.layers.read())
    }

    fn optimizer(&self) -> Option<OptimizerRef> {
        self.optimizer.read().clone()
    }
}

/// A backend that hands out one fixed session.
pub struct MemBackend {
    session: SessionRef,
}

impl MemBackend {
    pub fn new(session: SessionRef) -> Arc<Self> {
        Arc::new(Self { session })
    }
}

impl Backend for MemBackend {
    fn session(&self) -> Result<SessionRef> {
        Ok(Arc::clone(&self.session))
    }
}

/// The process-wide framework facts plus its global variable collection.
pub struct MemFramework {
    eager: bool,
    supports_assign: bool,
    globals: RwLock<Vec<VariableRef>>,
    default_session: Option<SessionRef>,
}

impl MemFramework {
    /// Creates a new `MemFramework`.
    ///
    /// # Arguments
    /// * `eager` - Whether operations run immediately.
    /// * `supports_assign` - Whether variables support native assignment.
    /// * `default_session` - The session used when none is given explicitly.
    pub fn new(
        eager: bool,
        supports_assign: bool,
        default_session: Option<SessionRef>,
    ) -> Arc<Self> {
        Arc::new(Self {
            eager,
            supports_assign,
            globals: RwLock::new(Vec::new()),
            default_session,
        })
    }

    /// Eager execution with native assignment.
    pub fn eager() -> Arc<Self> {
        Self::new(true, true, None)
    }

    /// Deferred execution where writes go through `session` as well.
    pub fn graph(session: SessionRef) -> Arc<Self> {
        Self::new(false, false, Some(session))
    }

    /// Adds variables to the global collection.
    pub fn register<I>(&self, variables: I)
    where
        I: IntoIterator<Item = VariableRef>,
    {
        self.globals.write().extend(variables);
    }
}

impl Framework for MemFramework {
    fn executing_eagerly(&self) -> bool {
        self.eager
    }

    fn supports_assign(&self) -> bool {
        self.supports_assign
    }

    fn global_variables(&self) -> Vec<VariableRef> {
        self.globals.read().clone()
    }

    fn default_session(&self) -> Option<SessionRef> {
        self.default_session.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn set_weights_is_all_or_nothing() {
        let a = MemVariable::from_vec("a", vec![1.0, 2.0]);
        let b = MemVariable::from_vec("b", vec![3.0]);
        let model = MemModel::new("m", vec![a.clone(), b.clone()]);

        let bad = vec![
            ArrayD::from_elem(IxDyn(&[2]), 9.0),
            ArrayD::from_elem(IxDyn(&[4]), 9.0),
        ];

        assert!(matches!(
            model.set_weights(&bad),
            Err(StateErr::ShapeMismatch { .. })
        ));
        assert_eq!(a.to_vec(), vec![1.0, 2.0]);
        assert_eq!(b.to_vec(), vec![3.0]);
    }

    #[test]
    fn unbuilt_model_has_no_weights() {
        let model = MemModel::unbuilt("m");
        assert!(!model.built());
        assert!(matches!(model.get_weights(), Err(StateErr::ModelNotBuilt)));

        model.build(&[&[2, 3], &[3]]);
        assert!(model.built());
        assert_eq!(model.get_weights().unwrap()[0].shape(), &[2, 3]);
    }

    #[test]
    fn session_counts_runs() {
        let session = MemSession::new();
        session.run(BroadcastOp::completed()).unwrap();
        session.run(BroadcastOp::deferred(|_| Ok(()))).unwrap();
        assert_eq!(session.runs(), 2);
    }
}
