mod common;

use std::num::NonZeroUsize;

use common::{context, eager_context, on_each_rank, solo};
use elastic::{
    BroadcastOp, Collective, State, StateErr, Tracked, VariableState,
    collective::LocalGroup,
    framework::{SessionRef, VariableRef},
    memory::{MemFramework, MemSession, MemVariable},
};
use ndarray::arr2;

#[test]
fn explicit_variables_sync_from_root() {
    let results = on_each_rank(3, |collective| {
        let rank = collective.rank() as f32;
        let a = MemVariable::from_vec("a", vec![rank, rank]);
        let b = MemVariable::from_vec("b", vec![rank * 10.0]);

        let mut state = VariableState::builder(eager_context(collective))
            .variables(vec![a.clone() as VariableRef, b.clone() as VariableRef])
            .build()
            .unwrap();
        state.sync().unwrap();

        (a.to_vec(), b.to_vec())
    });

    for result in results {
        assert_eq!(result, (vec![0.0, 0.0], vec![0.0]));
    }
}

#[test]
fn global_collection_is_captured_at_build_time() {
    let framework = MemFramework::eager();
    let early = MemVariable::from_vec("early", vec![1.0]);
    framework.register([early.clone() as VariableRef]);

    let ctx = context(
        LocalGroup::new(NonZeroUsize::MIN).remove(0),
        framework.clone(),
    );
    let mut state = VariableState::builder(ctx).build().unwrap();

    let late = MemVariable::from_vec("late", vec![2.0]);
    framework.register([late.clone() as VariableRef]);

    early.update(|v| v.fill(8.0));
    late.update(|v| v.fill(8.0));
    state.restore().unwrap();

    assert_eq!(state.variables().len(), 1);
    assert_eq!(early.to_vec(), vec![1.0]);
    assert_eq!(late.to_vec(), vec![8.0]);
}

#[test]
fn restore_after_failed_step() {
    let var = MemVariable::new("w", arr2(&[[1.0], [2.0], [3.0]]).into_dyn());
    let epoch = Tracked::new(7_u32);

    let mut state = VariableState::builder(solo())
        .variables(vec![var.clone() as VariableRef])
        .track(epoch.attribute("epoch"))
        .build()
        .unwrap();

    var.update(|v| *v *= 2.0);
    epoch.set(8);
    state.restore().unwrap();

    assert_eq!(var.to_vec(), vec![1.0, 2.0, 3.0]);
    assert_eq!(var.shape(), &[3, 1]);
    assert_eq!(epoch.get(), 7);
}

#[test]
fn graph_mode_runs_in_default_session() {
    let results = on_each_rank(2, |collective| {
        let rank = collective.rank() as f32;
        let session = MemSession::new();
        let framework = MemFramework::graph(session.clone());
        let var = MemVariable::from_vec("v", vec![rank + 5.0]);
        framework.register([var.clone() as VariableRef]);

        let mut state = VariableState::builder(context(collective, framework))
            .build()
            .unwrap();
        state.sync().unwrap();
        let runs = session.runs();

        var.update(|v| v.fill(0.0));
        state.restore().unwrap();

        (runs, var.to_vec())
    });

    for (runs, value) in results {
        assert_eq!(runs, 1);
        assert_eq!(value, vec![5.0]);
    }
}

#[test]
fn explicit_session_overrides_default() {
    let default = MemSession::new();
    let explicit = MemSession::new();
    let framework = MemFramework::graph(default.clone());
    let var = MemVariable::from_vec("v", vec![1.0]);

    let ctx = context(
        LocalGroup::new(NonZeroUsize::MIN).remove(0),
        framework,
    );
    let mut state = VariableState::builder(ctx)
        .variables(vec![var as VariableRef])
        .session(explicit.clone())
        .build()
        .unwrap();
    state.sync().unwrap();

    assert_eq!(explicit.runs(), 1);
    assert_eq!(default.runs(), 0);
}

#[test]
fn deferred_op_needs_a_session() {
    let op = BroadcastOp::deferred(|_| Ok(()));
    assert!(op.is_deferred());
    assert!(matches!(op.finish(), Err(StateErr::MissingSession)));

    assert!(BroadcastOp::completed().finish().is_ok());
}

#[test]
fn mismatched_shapes_across_ranks_fail() {
    let results = on_each_rank(2, |collective| {
        let len = collective.rank() + 1;
        let var = MemVariable::from_vec("v", vec![1.0; len]);

        let mut state = VariableState::builder(eager_context(collective))
            .variables(vec![var as VariableRef])
            .build()
            .unwrap();
        state.sync()
    });

    assert!(results[0].is_ok());
    assert!(matches!(
        results[1],
        Err(StateErr::ShapeMismatch { .. })
    ));
}

#[test]
fn assignment_is_used_only_while_eager() {
    let assign_capable = |eager| {
        let session = MemSession::new();
        let var = MemVariable::from_vec("v", vec![1.0]);
        let framework = MemFramework::new(eager, true, Some(session as SessionRef));
        let ctx = context(LocalGroup::new(NonZeroUsize::MIN).remove(0), framework);

        let mut state = VariableState::builder(ctx)
            .variables(vec![var.clone() as VariableRef])
            .build()
            .unwrap();

        var.update(|v| v.fill(4.0));
        state.restore().unwrap();

        assert_eq!(var.to_vec(), vec![1.0]);
        var.loads()
    };

    assert_eq!(assign_capable(true), 0);
    assert_eq!(assign_capable(false), 1);
}
