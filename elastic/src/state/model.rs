use std::sync::Arc;

use log::debug;

use super::{Attribute, ObjectState, State};
use crate::{
    Result, StateErr,
    collective::{Context, ROOT_RANK},
    framework::{BackendRef, ModelRef, OptimizerRef, Tensor},
};

/// State of a trainable model and its optimizer.
pub struct ModelState {
    model: ModelRef,
    optimizer: OptimizerRef,
    backend: Option<BackendRef>,
    saved_model: Vec<Tensor>,
    saved_optimizer: Vec<Tensor>,
    base: ObjectState,
}

impl ModelState {
    pub fn builder(ctx: Arc<Context>, model: ModelRef) -> ModelStateBuilder {
        ModelStateBuilder {
            ctx,
            model,
            optimizer: None,
            backend: None,
            attrs: Vec::new(),
        }
    }

    pub fn model(&self) -> &ModelRef {
        &self.model
    }

    pub fn optimizer(&self) -> &OptimizerRef {
        &self.optimizer
    }

    fn save_model(&mut self) -> Result<()> {
        let saved_model = self.model.get_weights()?;
        let saved_optimizer = self.optimizer.get_weights()?;

        self.saved_model = saved_model;
        self.saved_optimizer = saved_optimizer;
        Ok(())
    }

    fn load_model(&self) -> Result<()> {
        self.model.set_weights(&self.saved_model)?;
        self.optimizer.set_weights(&self.saved_optimizer)
    }

    fn broadcast_model(&self) -> Result<()> {
        let ctx = self.base.context();

        if ctx.executing_eagerly() {
            ctx.broadcast_variables(&self.model.variables(), ROOT_RANK)?
                .finish()?;
            ctx.broadcast_variables(&self.optimizer.variables(), ROOT_RANK)?
                .finish()?;
            return Ok(());
        }

        let backend = self.backend.as_ref().ok_or(StateErr::MissingBackend)?;
        let op = ctx.broadcast_global_variables(ROOT_RANK)?;
        backend.session()?.run(op)
    }
}

impl State for ModelState {
    fn save(&mut self) -> Result<()> {
        self.save_model()?;
        self.base.save_attrs()
    }

    fn restore(&mut self) -> Result<()> {
        self.load_model()?;
        self.base.restore_attrs()
    }

    fn sync(&mut self) -> Result<()> {
        debug!(rank = self.base.context().rank(); "syncing model state");

        self.broadcast_model()?;
        self.save_model()?;
        self.base.sync_attrs()
    }

    fn base(&self) -> &ObjectState {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObjectState {
        &mut self.base
    }
}

/// Collects what a `ModelState` wraps before validating and capturing it.
pub struct ModelStateBuilder {
    ctx: Arc<Context>,
    model: ModelRef,
    optimizer: Option<OptimizerRef>,
    backend: Option<BackendRef>,
    attrs: Vec<Attribute>,
}

impl ModelStateBuilder {
    /// Tracks `optimizer` instead of the one the model was compiled with.
    pub fn optimizer(mut self, optimizer: OptimizerRef) -> Self {
        self.optimizer = Some(optimizer);
        self
    }

    /// The backend whose session runs the broadcast in graph mode.
    pub fn backend(mut self, backend: BackendRef) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Additionally tracks a plain-data attribute.
    pub fn track(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Validates the model and captures the initial baseline.
    ///
    /// # Errors
    /// `StateErr::ModelNotBuilt` if the model's shapes are not fixed yet,
    /// `StateErr::MissingOptimizer` if no optimizer is known.
    pub fn build(self) -> Result<ModelState> {
        let Self {
            ctx,
            model,
            optimizer,
            backend,
            attrs,
        } = self;

        if !model.built() {
            return Err(StateErr::ModelNotBuilt);
        }

        let optimizer = optimizer
            .or_else(|| model.optimizer())
            .ok_or(StateErr::MissingOptimizer)?;

        let saved_model = model.get_weights()?;
        let saved_optimizer = optimizer.get_weights()?;

        Ok(ModelState {
            model,
            optimizer,
            backend,
            saved_model,
            saved_optimizer,
            base: ObjectState::new(ctx, attrs)?,
        })
    }
}
