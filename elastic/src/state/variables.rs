use std::sync::Arc;

use log::debug;

use super::{Attribute, ObjectState, State};
use crate::{
    Result, StateErr,
    collective::{Context, ROOT_RANK},
    framework::{SessionRef, Tensor, VariableRef},
};

/// How variable values are read, fixed when the state is built.
enum Read {
    /// Direct materialization while executing eagerly.
    Numpy,
    Eval(SessionRef),
}

/// How variable values are written back, fixed when the state is built.
enum Write {
    /// Native in-place assignment.
    Assign,
    Load(SessionRef),
}

impl Read {
    fn value(&self, var: &VariableRef) -> Result<Tensor> {
        match self {
            Read::Numpy => var.numpy(),
            Read::Eval(session) => var.eval(session.as_ref()),
        }
    }
}

impl Write {
    fn apply(&self, var: &VariableRef, value: &Tensor) -> Result<()> {
        match self {
            Write::Assign => var.assign(value),
            Write::Load(session) => var.load(value, session.as_ref()),
        }
    }
}

/// State of an explicit, or the global, set of raw variables.
pub struct VariableState {
    variables: Vec<VariableRef>,
    session: Option<SessionRef>,
    read: Read,
    write: Write,
    values: Vec<Tensor>,
    base: ObjectState,
}

impl VariableState {
    pub fn builder(ctx: Arc<Context>) -> VariableStateBuilder {
        VariableStateBuilder {
            ctx,
            variables: None,
            session: None,
            attrs: Vec::new(),
        }
    }

    pub fn variables(&self) -> &[VariableRef] {
        &self.variables
    }

    fn save_variables(&mut self) -> Result<()> {
        self.values = capture(&self.read, &self.variables)?;
        Ok(())
    }

    fn load_variables(&self) -> Result<()> {
        for (var, value) in self.variables.iter().zip(&self.values) {
            self.write.apply(var, value)?;
        }

        Ok(())
    }
}

fn capture(read: &Read, variables: &[VariableRef]) -> Result<Vec<Tensor>> {
    variables.iter().map(|var| read.value(var)).collect()
}

impl State for VariableState {
    fn save(&mut self) -> Result<()> {
        self.save_variables()?;
        self.base.save_attrs()
    }

    fn restore(&mut self) -> Result<()> {
        self.load_variables()?;
        self.base.restore_attrs()
    }

    fn sync(&mut self) -> Result<()> {
        let ctx = self.base.context();
        debug!(rank = ctx.rank(), variables = self.variables.len(); "syncing variables");

        let op = ctx.broadcast_variables(&self.variables, ROOT_RANK)?;
        match &self.session {
            Some(session) => session.run(op)?,
            None => op.finish()?,
        }

        self.save_variables()?;
        self.base.sync_attrs()
    }

    fn base(&self) -> &ObjectState {
        &self.base
    }

    fn base_mut(&mut self) -> &mut ObjectState {
        &mut self.base
    }
}

/// Collects what a `VariableState` wraps before capturing it.
pub struct VariableStateBuilder {
    ctx: Arc<Context>,
    variables: Option<Vec<VariableRef>>,
    session: Option<SessionRef>,
    attrs: Vec<Attribute>,
}

impl VariableStateBuilder {
    /// Tracks exactly `variables` instead of the global variable collection.
    pub fn variables(mut self, variables: Vec<VariableRef>) -> Self {
        self.variables = Some(variables);
        self
    }

    /// Runs graph-mode reads, writes and broadcasts in `session` instead of the
    /// framework's default one.
    pub fn session(mut self, session: SessionRef) -> Self {
        self.session = Some(session);
        self
    }

    /// Additionally tracks a plain-data attribute.
    pub fn track(mut self, attr: Attribute) -> Self {
        self.attrs.push(attr);
        self
    }

    /// Picks the read and write strategies and captures the initial baseline.
    ///
    /// Without explicit variables the global collection is captured as it is now;
    /// variables created later are not tracked.
    ///
    /// # Errors
    /// `StateErr::MissingSession` if the framework needs a session for reads or
    /// writes and none is known.
    pub fn build(self) -> Result<VariableState> {
        let Self {
            ctx,
            variables,
            session,
            attrs,
        } = self;

        let framework = ctx.framework();
        let variables = variables.unwrap_or_else(|| framework.global_variables());
        let session = session.or_else(|| framework.default_session());

        let require_session = || session.clone().ok_or(StateErr::MissingSession);

        let read = if framework.executing_eagerly() {
            Read::Numpy
        } else {
            Read::Eval(require_session()?)
        };

        let write = if framework.executing_eagerly() && framework.supports_assign() {
            Write::Assign
        } else {
            Write::Load(require_session()?)
        };

        let values = capture(&read, &variables)?;

        Ok(VariableState {
            variables,
            session,
            read,
            write,
            values,
            base: ObjectState::new(ctx, attrs)?,
        })
    }
}
